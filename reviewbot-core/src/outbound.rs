//! Shared HTTP client plumbing for calls to GitHub and the completion service.
//!
//! Every outbound request carries an `X-Correlation-ID` header so a single
//! webhook delivery can be followed across the calls it triggers. The header
//! is taken from the request if the caller set one, otherwise from the
//! request extensions, otherwise a fresh UUID is used.

use anyhow::{Context, Result};
use http::Extensions;
use reqwest::{Client, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for correlation ID propagation.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Correlation ID carried in request extensions.
#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Logs each outbound request with its correlation ID, status and latency.
pub struct RequestTracingMiddleware {
    service: &'static str,
}

impl RequestTracingMiddleware {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Middleware for RequestTracingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let correlation_id = match req.headers().get(CORRELATION_ID_HEADER) {
            Some(value) => value
                .to_str()
                .map(str::to_string)
                .unwrap_or_else(|_| Uuid::new_v4().to_string()),
            None => extensions
                .get::<CorrelationId>()
                .map(|id| id.0.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = correlation_id.parse() {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let method = req.method().clone();
        let path = extract_path(req.url().as_str());
        let started = Instant::now();

        let response = next.run(req, extensions).await;

        match &response {
            Ok(resp) => debug!(
                service = self.service,
                correlation_id = %correlation_id,
                status = resp.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "{} {}",
                method,
                path
            ),
            Err(e) => warn!(
                service = self.service,
                correlation_id = %correlation_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "{} {} failed: {}",
                method,
                path,
                e
            ),
        }

        response
    }
}

/// Build an HTTP client with the tracing middleware installed.
pub fn create_http_client(service: &'static str) -> Result<ClientWithMiddleware> {
    let client = Client::builder()
        .user_agent(concat!("reviewbot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")?;

    Ok(ClientBuilder::new(client)
        .with(RequestTracingMiddleware::new(service))
        .build())
}

fn extract_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}
