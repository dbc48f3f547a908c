//! Chain-of-responsibility request routing
//!
//! Handlers are kept per method in registration order; the first handler
//! whose `can_handle` accepts the request produces the response.

use crate::error::StepFault;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use tracing::{debug, error};

/// Everything a handler may look at
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer: String,
}

impl RequestContext {
    pub fn new<P: Into<String>>(method: Method, path: P) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer: String::new(),
        }
    }

    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Status, body and content type produced by a handler
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<&'static str>,
}

impl HandlerResponse {
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            body: Bytes::new(),
            content_type: None,
        }
    }

    pub fn text<B: Into<Bytes>>(status: StatusCode, body: B) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: Some("text/plain; charset=utf-8"),
        }
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, request: &RequestContext) -> bool;

    async fn handle(&self, request: &RequestContext) -> Result<HandlerResponse, StepFault>;
}

/// Ordered GET and POST handler chains
#[derive(Default, Clone)]
pub struct ResponseRouter {
    get_handlers: Vec<Arc<dyn RequestHandler>>,
    post_handlers: Vec<Arc<dyn RequestHandler>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_get_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.get_handlers.push(handler);
        self
    }

    pub fn with_post_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.post_handlers.push(handler);
        self
    }

    /// Produce the response for `request`
    ///
    /// Unmatched GET is 406, unmatched POST is 202, other methods are 405,
    /// and a handler error is 500.
    pub async fn route(&self, request: &RequestContext) -> HandlerResponse {
        let (chain, unmatched) = match request.method {
            Method::GET => (&self.get_handlers, StatusCode::NOT_ACCEPTABLE),
            Method::POST => (&self.post_handlers, StatusCode::ACCEPTED),
            _ => {
                debug!(method = %request.method, path = %request.path, "Method not allowed");
                return HandlerResponse::empty(StatusCode::METHOD_NOT_ALLOWED);
            }
        };

        let Some(handler) = chain.iter().find(|h| h.can_handle(request)) else {
            debug!(method = %request.method, path = %request.path, "No handler matched");
            return HandlerResponse::empty(unmatched);
        };

        debug!(handler = %handler.name(), path = %request.path, "Routing request");
        match handler.handle(request).await {
            Ok(response) => response,
            Err(fault) => {
                error!(handler = %handler.name(), fault = %fault, "Request handler failed");
                HandlerResponse::text(StatusCode::INTERNAL_SERVER_ERROR, fault.sanitized_message())
            }
        }
    }
}
