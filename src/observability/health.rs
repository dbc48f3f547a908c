//! Health check HTTP server
//!
//! Endpoints for operators and orchestrators: overall health, metrics,
//! readiness (receivers running) and liveness.

use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Seconds without a processed item before the runtime counts as stale
const ITEM_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server
pub struct HealthServer {
    runtime_id: String,
    port: u16,
    receivers_running: Arc<AtomicBool>,
    last_item_processed: Arc<AtomicU64>,
    additional_checks: Arc<RwLock<HashMap<String, HealthCheck>>>,
}

impl HealthServer {
    pub fn new(runtime_id: String, port: u16) -> Self {
        Self {
            runtime_id,
            port,
            receivers_running: Arc::new(AtomicBool::new(false)),
            last_item_processed: Arc::new(AtomicU64::new(0)),
            additional_checks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn set_receivers_running(&self, running: bool) {
        self.receivers_running.store(running, Ordering::Relaxed);
    }

    pub fn set_last_item_processed(&self, timestamp: u64) {
        self.last_item_processed.store(timestamp, Ordering::Relaxed);
    }

    pub async fn add_health_check(&self, name: String, check: HealthCheck) {
        self.additional_checks.write().await.insert(name, check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// All routes, without binding a socket
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self;

        // GET /health
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.get_health_status().await;
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = ready_server.receivers_running.load(Ordering::Relaxed);
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        // GET /live
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET /
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints = HashMap::from([
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Item, polling and HTTP counters"),
                ("/ready", "Readiness probe, true once receivers run"),
                ("/live", "Liveness probe"),
            ]);
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until `cancel` fires
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), warp::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        tracing::info!(port = self.port, "Starting health server");

        let (_, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(addr, async move { cancel.cancelled().await })?;
        server.await;
        tracing::info!("Health server stopped");
        Ok(())
    }

    async fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();

        let mut checks = HashMap::new();
        checks.insert("receivers".to_string(), self.check_receivers());
        checks.insert("item_processing".to_string(), self.check_item_processing());
        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            runtime_id: self.runtime_id.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_receivers(&self) -> HealthCheck {
        if self.receivers_running.load(Ordering::Relaxed) {
            HealthCheck::new("healthy", "Receivers running")
        } else {
            HealthCheck::new("unhealthy", "Receivers not running")
        }
    }

    fn check_item_processing(&self) -> HealthCheck {
        let now = current_timestamp();
        let last_item = self.last_item_processed.load(Ordering::Relaxed);

        if last_item == 0 {
            HealthCheck::new("healthy", "No items processed yet")
        } else if now.saturating_sub(last_item) > ITEM_STALENESS_THRESHOLD_SECONDS {
            HealthCheck::new(
                "stale",
                format!("No item activity for {} seconds", now - last_item),
            )
        } else {
            HealthCheck::new("healthy", "Recent item activity")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn new<S: Into<String>, M: Into<String>>(status: S, message: M) -> Self {
        Self {
            status: status.into(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    runtime_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: HashMap<&'static str, &'static str>,
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
