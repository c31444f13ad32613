//! HTTP server wiring: shared state, middleware and graceful shutdown.

use axum::Router;
use axum::extract::Request;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, info, info_span};

use crate::api::routes;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::services::ServiceContainer;

/// Listen address and middleware switches.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            enable_cors: true,
        }
    }
}

impl ApiServerConfig {
    /// Read `API_BIND_ADDRESS` and `API_PORT`, keeping defaults for anything
    /// missing or malformed.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(address) = lookup("API_BIND_ADDRESS").filter(|a| !a.trim().is_empty()) {
            config.bind_address = address.trim().to_string();
        }
        if let Some(port) = lookup("API_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => config.port = port,
                Err(e) => tracing::warn!(value = %port, error = %e, "Ignoring invalid API_PORT"),
            }
        }
        config
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid API listen address: {}", e)))
    }
}

/// State handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ServiceContainer>,
    /// Present when the process installed a reloadable log filter.
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    pub fn new(services: Arc<ServiceContainer>) -> Self {
        Self {
            services,
            logging_config: None,
        }
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }
}

/// Probe and socket traffic is too chatty to trace per request.
fn is_quiet_path(path: &str) -> bool {
    path.starts_with("/health") || path == "/api/ws"
}

fn request_span(req: &Request) -> Span {
    if is_quiet_path(req.uri().path()) {
        return Span::none();
    }
    info_span!("request", method = %req.method(), path = %req.uri().path())
}

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

    /// Cancelling the token stops accepting connections and drains open ones.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());
        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_response(|res: &Response, latency: Duration, span: &Span| {
                    if !span.is_disabled() {
                        info!(
                            parent: span,
                            status = res.status().as_u16(),
                            latency_ms = latency.as_millis() as u64,
                            "Request finished"
                        );
                    }
                }),
        )
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()?).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("API server draining connections");
            })
            .await
            .map_err(|e| Error::ApiError(format!("server error: {}", e)))
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
