//! HTTP server wiring: shared state, middleware stack and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{HeaderValue, Response};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, info, warn};

use crate::api::routes;
use crate::auth::ApiKeyStore;
use crate::caster::StreamManager;
use crate::error::{Error, Result};

/// Path excluded from request tracing; polled by orchestrators.
const HEALTH_PATH: &str = "/healthcheck";

/// Listener and middleware settings.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// CORS origins; empty or `*` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Request body limit in bytes. Uploads are buffered whole.
    pub body_limit: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: Vec::new(),
            body_limit: 1024 * 1024 * 1024,
        }
    }
}

impl ApiServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid API listen address: {e}")))
    }

    fn allows_any_origin(&self) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*")
    }

    fn cors_layer(&self) -> CorsLayer {
        let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
        if self.allows_any_origin() {
            return cors.allow_origin(Any);
        }

        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|origin| {
                HeaderValue::from_str(origin)
                    .inspect_err(|e| warn!(%origin, error = %e, "Ignoring invalid CORS origin"))
                    .ok()
            })
            .collect();
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub manager: Arc<StreamManager>,
    pub api_keys: Arc<ApiKeyStore>,
}

impl AppState {
    pub fn new(manager: Arc<StreamManager>, api_keys: Arc<ApiKeyStore>) -> Self {
        Self {
            start_time: Instant::now(),
            manager,
            api_keys,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// HTTP front of the stream manager.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Token that stops [`ApiServer::run`] when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Routes plus body limit, CORS and request tracing.
    pub fn build_router(&self) -> Router {
        let trace = TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                if req.uri().path() == HEALTH_PATH {
                    return Span::none();
                }
                tracing::info_span!("request", method = %req.method(), uri = %req.uri())
            })
            .on_request(())
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                if !span.is_disabled() {
                    info!(status = res.status().as_u16(), latency_ms = latency.as_millis() as u64, "Request finished");
                }
            });

        routes::create_router(self.state.clone())
            .layer(DefaultBodyLimit::max(self.config.body_limit))
            .layer(self.config.cors_layer())
            .layer(trace)
    }

    /// Serve until the cancel token fires, letting in-flight requests finish.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "API server listening");

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("API server draining connections");
            })
            .await?;

        Ok(())
    }
}
