//! HTTP receiver
//!
//! Connections come from a bounded `AcceptLoop` and are served by hyper;
//! every request goes through a `ResponseRouter`. POSTs to the submit path
//! become `ReceivedItem`s for the item handler.

pub mod accept;
pub mod router;

pub use accept::{AcceptLoop, ConnectionAcceptor, ConnectionHandler, DEFAULT_DRAIN_TIMEOUT};
pub use router::{HandlerResponse, RequestContext, RequestHandler, ResponseRouter};

use super::{parse_setting, ItemHandler, ReceivedItem, Receiver, ReceiverTask};
use crate::error::{ReceiverError, StepFault};
use crate::observability::metrics::metrics;
use crate::receiver_span;
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

/// Header carrying the sender's message id
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// Answers GET on the submit path so partners can check reachability
pub struct PingHandler {
    path: String,
}

impl PingHandler {
    pub fn new<P: Into<String>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RequestHandler for PingHandler {
    fn name(&self) -> &str {
        "ping"
    }

    fn can_handle(&self, request: &RequestContext) -> bool {
        request.path == self.path
    }

    async fn handle(&self, _request: &RequestContext) -> Result<HandlerResponse, StepFault> {
        Ok(HandlerResponse::text(StatusCode::OK, "ok"))
    }
}

/// Turns POSTed bodies into received items
pub struct SubmitMessageHandler {
    source: String,
    path: String,
    items: Arc<dyn ItemHandler<ReceivedItem>>,
}

impl SubmitMessageHandler {
    pub fn new<S: Into<String>, P: Into<String>>(
        source: S,
        path: P,
        items: Arc<dyn ItemHandler<ReceivedItem>>,
    ) -> Self {
        Self {
            source: source.into(),
            path: path.into(),
            items,
        }
    }
}

#[async_trait]
impl RequestHandler for SubmitMessageHandler {
    fn name(&self) -> &str {
        "submit_message"
    }

    fn can_handle(&self, request: &RequestContext) -> bool {
        under_path(&request.path, &self.path)
    }

    async fn handle(&self, request: &RequestContext) -> Result<HandlerResponse, StepFault> {
        if request.body.is_empty() {
            return Ok(HandlerResponse::text(StatusCode::BAD_REQUEST, "empty body"));
        }

        let mut item = ReceivedItem::new(self.source.clone(), request.body.clone())
            .with_property("peer", request.peer.clone());
        if let Some(id) = request.header(MESSAGE_ID_HEADER) {
            item = item.with_message_id(id.trim());
        }
        if let Some(content_type) = request.header(CONTENT_TYPE.as_str()) {
            item = item.with_property("content_type", content_type);
        }
        let reference = item.message_id.clone().unwrap_or_default();

        self.items.handle_item(item).await?;
        Ok(HandlerResponse::text(StatusCode::ACCEPTED, reference))
    }
}

/// `path` is `base` itself or lies below it on a segment boundary
fn under_path(path: &str, base: &str) -> bool {
    match path.strip_prefix(base) {
        Some(rest) => rest.is_empty() || base.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// Serves one TCP connection with hyper
///
/// Once `shutdown` fires, the connection finishes its current request and
/// closes instead of waiting for the next keep-alive request. Connections
/// that never finish are aborted by the accept loop's drain timeout.
struct HyperConnectionHandler {
    router: Arc<ResponseRouter>,
    shutdown: CancellationToken,
}

#[async_trait]
impl ConnectionHandler<TcpStream> for HyperConnectionHandler {
    async fn handle_connection(&self, connection: TcpStream, peer: String) {
        let router = self.router.clone();
        let service = service_fn(move |request: Request<Body>| {
            let router = router.clone();
            let peer = peer.clone();
            async move { Ok::<_, Infallible>(respond(&router, request, peer).await) }
        });

        let conn = Http::new()
            .http1_only(true)
            .serve_connection(connection, service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "Connection closed with error");
        }
    }
}

async fn respond(router: &ResponseRouter, request: Request<Body>, peer: String) -> Response<Body> {
    metrics().http_request();
    let (parts, body) = request.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Failed to read request body");
            return into_response(HandlerResponse::empty(StatusCode::BAD_REQUEST));
        }
    };

    let context = RequestContext {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
        peer,
    };
    into_response(router.route(&context).await)
}

fn into_response(handled: HandlerResponse) -> Response<Body> {
    let mut response = Response::new(Body::from(handled.body));
    *response.status_mut() = handled.status;
    if let Some(content_type) = handled.content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

/// `Receiver` accepting messages over HTTP
pub struct HttpReceiver {
    name: String,
    bind_address: String,
    max_concurrent_accepts: usize,
    submit_path: String,
    shutdown_grace: Duration,
    extra_get_handlers: Vec<Arc<dyn RequestHandler>>,
    extra_post_handlers: Vec<Arc<dyn RequestHandler>>,
    local_addr: Option<SocketAddr>,
    task: ReceiverTask,
}

impl HttpReceiver {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            bind_address: "127.0.0.1:8090".to_string(),
            max_concurrent_accepts: 16,
            submit_path: "/messages".to_string(),
            shutdown_grace: DEFAULT_DRAIN_TIMEOUT,
            extra_get_handlers: Vec::new(),
            extra_post_handlers: Vec::new(),
            local_addr: None,
            task: ReceiverTask::default(),
        }
    }

    /// Append a GET handler after the built-in ones
    pub fn with_get_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.extra_get_handlers.push(handler);
        self
    }

    /// Append a POST handler after the built-in ones
    pub fn with_post_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.extra_post_handlers.push(handler);
        self
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn max_concurrent_accepts(&self) -> usize {
        self.max_concurrent_accepts
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn submit_path(&self) -> &str {
        &self.submit_path
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    fn build_router(&self, items: Arc<dyn ItemHandler<ReceivedItem>>) -> ResponseRouter {
        let mut router = ResponseRouter::new()
            .with_get_handler(Arc::new(PingHandler::new(self.submit_path.clone())))
            .with_post_handler(Arc::new(SubmitMessageHandler::new(
                self.name.clone(),
                self.submit_path.clone(),
                items,
            )));
        for handler in &self.extra_get_handlers {
            router = router.with_get_handler(handler.clone());
        }
        for handler in &self.extra_post_handlers {
            router = router.with_post_handler(handler.clone());
        }
        router
    }
}

#[async_trait]
impl Receiver for HttpReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    /// All settings are validated before any of them is applied
    fn configure(&mut self, settings: &HashMap<String, String>) -> Result<(), ReceiverError> {
        let bind_address = match settings.get("bind_address") {
            Some(address) => {
                address
                    .parse::<SocketAddr>()
                    .map_err(|e| ReceiverError::invalid_setting("bind_address", e.to_string()))?;
                address.clone()
            }
            None => self.bind_address.clone(),
        };

        let max = parse_setting(settings, "max_concurrent_accepts", self.max_concurrent_accepts)?;
        if max == 0 {
            return Err(ReceiverError::invalid_setting(
                "max_concurrent_accepts",
                "must be at least 1",
            ));
        }

        let submit_path = match settings.get("submit_path") {
            Some(path) if !path.starts_with('/') => {
                return Err(ReceiverError::invalid_setting(
                    "submit_path",
                    "must start with '/'",
                ));
            }
            Some(path) => path.clone(),
            None => self.submit_path.clone(),
        };

        let grace_ms = parse_setting(
            settings,
            "shutdown_grace_ms",
            self.shutdown_grace.as_millis() as u64,
        )?;

        self.bind_address = bind_address;
        self.max_concurrent_accepts = max;
        self.submit_path = submit_path;
        self.shutdown_grace = Duration::from_millis(grace_ms);
        Ok(())
    }

    async fn start_receiving(
        &mut self,
        handler: Arc<dyn ItemHandler<ReceivedItem>>,
        cancel: CancellationToken,
    ) -> Result<(), ReceiverError> {
        if self.task.is_running() {
            return Err(ReceiverError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_address).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let router = Arc::new(self.build_router(handler));
        let accept_loop =
            AcceptLoop::new(self.max_concurrent_accepts).with_drain_timeout(self.shutdown_grace);
        let span = receiver_span!(receiver = %self.name, kind = "http", address = %local_addr);

        self.task.start(&self.name, &cancel, move |token| {
            let connections = Arc::new(HyperConnectionHandler {
                router,
                shutdown: token.clone(),
            });
            async move {
                if let Err(e) = accept_loop.run(listener, connections, token).await {
                    error!(error = %e, "Accept loop failed");
                }
            }
            .instrument(span)
        })
    }

    async fn stop_receiving(&mut self) -> Result<(), ReceiverError> {
        self.task.stop(&self.name).await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.task.is_running()
    }
}
