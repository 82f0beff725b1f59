//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with local endpoints and the downstream fallback
//! - Wire up middleware (tracing, request ID, body limit, admission)
//! - Forward admitted requests to the upstream API
//! - Serve until the shutdown signal fires, then drain the gate

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        header,
        uri::{Authority, PathAndQuery, Scheme},
        StatusCode, Uri,
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin::setup_admin_router;
use crate::admission::{admission_middleware, AdmissionController, GateError};
use crate::config::{validate_config, GateConfig, ValidationError};
use crate::http::handlers;
use crate::http::response::error_response;
use crate::lifecycle::drain_gate;
use crate::observability::metrics;

/// Error type for server construction.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("invalid configuration: {errors:?}")]
    InvalidConfig { errors: Vec<ValidationError> },

    #[error("invalid upstream address {0:?}")]
    InvalidUpstream(String),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AdmissionController>,
    pub client: Client<HttpConnector, Body>,
    /// `None` when forwarding is disabled.
    pub upstream: Option<Authority>,
    pub upstream_timeout: Duration,
}

/// HTTP server fronting a downstream with the admission gate.
pub struct HttpServer {
    router: Router,
    config: GateConfig,
    gate: Arc<AdmissionController>,
}

impl HttpServer {
    /// Server whose downstream forwards to `config.upstream`.
    pub fn new(config: GateConfig) -> Result<Self, ServerError> {
        Self::build(config, None)
    }

    /// Server whose downstream is `downstream` instead of the upstream
    /// forwarder.
    pub fn with_downstream(config: GateConfig, downstream: Router) -> Result<Self, ServerError> {
        Self::build(config, Some(downstream))
    }

    fn build(config: GateConfig, downstream: Option<Router>) -> Result<Self, ServerError> {
        // route registration panics on overlapping paths
        validate_config(&config).map_err(|errors| ServerError::InvalidConfig { errors })?;
        let gate = Arc::new(AdmissionController::from_config(&config.admission)?);

        let upstream = if config.upstream.enabled {
            let authority = Authority::from_str(&config.upstream.address)
                .map_err(|_| ServerError::InvalidUpstream(config.upstream.address.clone()))?;
            Some(authority)
        } else {
            None
        };

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let state = AppState {
            gate: gate.clone(),
            client,
            upstream,
            upstream_timeout: Duration::from_secs(config.timeouts.upstream_secs),
        };

        let router = Self::build_router(&config, state, downstream);
        Ok(Self {
            router,
            config,
            gate,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &GateConfig, state: AppState, downstream: Option<Router>) -> Router {
        let admission = &config.admission;
        let results_route = format!("{}{{request_id}}", admission.results_prefix);

        let router = Router::new()
            .route(&admission.health_path, get(handlers::health))
            .route(&admission.diagnostic_path, get(handlers::network_info))
            .route(&results_route, get(handlers::deferred_result))
            .merge(setup_admin_router(&admission.admin_prefix));

        let router = match downstream {
            Some(downstream) => router.fallback_service(downstream),
            None => router.fallback(forward_handler),
        };

        router
            .layer(middleware::from_fn_with_state(
                state.gate.clone(),
                admission_middleware,
            ))
            .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Run the server, accepting connections on the given listener until
    /// `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            max_concurrent = self.gate.capacity(),
            "HTTP server starting"
        );

        if let Some(results) = self.gate.results() {
            tokio::spawn(Arc::clone(results).run_sweeper(shutdown.resubscribe()));
        }

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped accepting connections");
        let grace = Duration::from_secs(self.config.timeouts.shutdown_grace_secs);
        drain_gate(&self.gate, grace).await;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Shared admission controller.
    pub fn gate(&self) -> &Arc<AdmissionController> {
        &self.gate
    }

    /// The fully layered router, for in-process testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }
}

/// Downstream handler: forward the request to the upstream API.
async fn forward_handler(State(state): State<AppState>, request: Request) -> Response {
    let start_time = Instant::now();
    let method = request.method().to_string();

    let Some(authority) = state.upstream.clone() else {
        metrics::record_request(&method, 404, start_time);
        return error_response(StatusCode::NOT_FOUND, "Route not found");
    };

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let (mut parts, body) = request.into_parts();

    let mut uri_parts = parts.uri.clone().into_parts();
    uri_parts.scheme = Some(Scheme::HTTP);
    uri_parts.authority = Some(authority);
    if uri_parts.path_and_query.is_none() {
        uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    parts.uri = match Uri::from_parts(uri_parts) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Could not build upstream URI");
            metrics::record_request(&method, 400, start_time);
            return error_response(StatusCode::BAD_REQUEST, "Invalid request URI");
        }
    };
    // hyper derives Host from the upstream URI
    parts.headers.remove(header::HOST);

    tracing::debug!(request_id = %request_id, uri = %parts.uri, "Forwarding request");

    let upstream_request = Request::from_parts(parts, body);
    match tokio::time::timeout(state.upstream_timeout, state.client.request(upstream_request)).await {
        Ok(Ok(response)) => {
            metrics::record_request(&method, response.status().as_u16(), start_time);
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body)).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!(request_id = %request_id, error = %e, "Upstream error");
            metrics::record_request(&method, 502, start_time);
            error_response(StatusCode::BAD_GATEWAY, "Upstream request failed")
        }
        Err(_) => {
            tracing::warn!(request_id = %request_id, timeout = ?state.upstream_timeout, "Upstream timed out");
            metrics::record_request(&method, 504, start_time);
            error_response(StatusCode::GATEWAY_TIMEOUT, "Upstream timed out")
        }
    }
}
