//! Server crate provides HTTP server functionality.
//!
//! This module exposes the loyalty API to authenticated users: order uploads,
//! order listing, balance, withdrawals. It also serves `/health` and the
//! Prometheus `/metrics` endpoint.
//!
//! Authentication happens upstream; the gateway forwards the user id in a
//! configurable header and requests without it are answered with `401`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    Extension, Json, Router,
    extract::{MatchedPath, Request, State, rejection::JsonRejection},
    http::{HeaderName, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use model::{Points, UserId};
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use serde::Deserialize;
use service::{Listing, LoyaltyService, ServiceError, UploadOutcome, WithdrawOutcome};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server represents the HTTP front of the loyalty service.
pub struct Server {
    address: String,
    state: AppState,
}

/// Metrics collects and exposes HTTP server metrics.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )?;
        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of errors"),
            &["source", "endpoint"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
        })
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, endpoint, status.as_str()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }

    fn record_error(&self, source: &str, endpoint: &str) {
        self.errors_total.with_label_values(&[source, endpoint]).inc();
    }
}

/// Application state shared between request handlers
#[derive(Clone)]
struct AppState {
    service: Arc<dyn LoyaltyService>,
    auth_header: HeaderName,
    metrics: Arc<Metrics>,
}

/// Body of `POST /api/user/balance/withdraw`.
#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    order: String,
    sum: Points,
}

impl Server {
    /// Creates a new Server instance.
    ///
    /// # Arguments
    ///
    /// * `address` - The `host:port` the server will listen on
    /// * `auth_header` - Name of the header carrying the authenticated user id
    /// * `service` - The loyalty service handling the requests
    pub fn new(
        address: impl Into<String>,
        auth_header: &str,
        service: Arc<dyn LoyaltyService>,
    ) -> Result<Self> {
        let auth_header = HeaderName::try_from(auth_header)
            .with_context(|| format!("Invalid auth header name: {auth_header}"))?;
        let metrics = Metrics::new().context("Failed to create metrics registry")?;
        let address = address.into();
        info!("Initializing HTTP server on {}", address);

        Ok(Self {
            address,
            state: AppState {
                service,
                auth_header,
                metrics: Arc::new(metrics),
            },
        })
    }

    /// Serves requests until `shutdown` is cancelled, then drains open
    /// connections.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.address))?;

        info!("HTTP server listening on {}", self.address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    /// Builds the application router.
    pub fn router(&self) -> Router {
        let state = self.state.clone();

        let user_api = Router::new()
            .route(
                "/api/user/orders",
                post(Self::handle_upload_order).get(Self::handle_list_orders),
            )
            .route("/api/user/balance", get(Self::handle_balance))
            .route("/api/user/balance/withdraw", post(Self::handle_withdraw))
            .route("/api/user/withdrawals", get(Self::handle_list_withdrawals))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                Self::auth_middleware,
            ));

        Router::new()
            .merge(user_api)
            .route("/health", get(Self::handle_health))
            .route("/metrics", get(Self::handle_metrics))
            .layer(middleware::from_fn_with_state(
                state.metrics.clone(),
                Self::metrics_middleware,
            ))
            .with_state(state)
    }

    /// Middleware for collecting metrics on HTTP requests
    async fn metrics_middleware(
        State(metrics): State<Arc<Metrics>>,
        req: Request,
        next: Next,
    ) -> Response {
        let method = req.method().to_string();
        // route templates keep the label set bounded
        let endpoint = req
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());

        let start = Instant::now();
        let response = next.run(req).await;
        let status = response.status().as_u16();

        metrics.record_request(&method, &endpoint, status, start.elapsed());
        if status >= 500 {
            metrics.record_error("http", &endpoint);
        }
        response
    }

    /// Resolves the caller from the gateway header or answers `401`.
    async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
        let user = req
            .headers()
            .get(&state.auth_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(UserId::new);

        match user {
            Some(user) => {
                req.extensions_mut().insert(user);
                next.run(req).await
            }
            None => {
                debug!("Request without user identity rejected");
                (StatusCode::UNAUTHORIZED, "user not authenticated").into_response()
            }
        }
    }

    async fn handle_upload_order(
        State(state): State<AppState>,
        Extension(user): Extension<UserId>,
        body: String,
    ) -> Response {
        let number = body.trim();
        if number.is_empty() {
            warn!("Order number is missing in request");
            return (StatusCode::BAD_REQUEST, "order number is required").into_response();
        }

        match state.service.upload_order(&user, number).await {
            Ok(UploadOutcome::Accepted) => StatusCode::ACCEPTED.into_response(),
            Ok(UploadOutcome::AlreadyUploaded) => StatusCode::OK.into_response(),
            Ok(UploadOutcome::Conflict) => (
                StatusCode::CONFLICT,
                "order number already uploaded by another user",
            )
                .into_response(),
            Ok(UploadOutcome::InvalidFormat) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid order number").into_response()
            }
            Err(e) => internal_error(&state, "upload_order", &e),
        }
    }

    async fn handle_list_orders(
        State(state): State<AppState>,
        Extension(user): Extension<UserId>,
    ) -> Response {
        match state.service.list_orders(&user).await {
            Ok(Listing::Found(orders)) => (StatusCode::OK, Json(orders)).into_response(),
            Ok(Listing::Empty) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => internal_error(&state, "list_orders", &e),
        }
    }

    async fn handle_balance(
        State(state): State<AppState>,
        Extension(user): Extension<UserId>,
    ) -> Response {
        match state.service.balance(&user).await {
            Ok(balance) => (StatusCode::OK, Json(balance)).into_response(),
            Err(e) => internal_error(&state, "balance", &e),
        }
    }

    async fn handle_withdraw(
        State(state): State<AppState>,
        Extension(user): Extension<UserId>,
        payload: Result<Json<WithdrawRequest>, JsonRejection>,
    ) -> Response {
        let Json(request) = match payload {
            Ok(payload) => payload,
            Err(rejection) => {
                warn!("Malformed withdraw request: {}", rejection.body_text());
                return (StatusCode::BAD_REQUEST, "malformed withdraw request").into_response();
            }
        };

        match state
            .service
            .withdraw(&user, request.order.trim(), request.sum)
            .await
        {
            Ok(WithdrawOutcome::Accepted(_)) => StatusCode::OK.into_response(),
            Ok(WithdrawOutcome::InsufficientFunds) => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient funds").into_response()
            }
            Ok(WithdrawOutcome::InvalidOrderNumber) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid order number").into_response()
            }
            Ok(WithdrawOutcome::InvalidSum) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "sum must be positive").into_response()
            }
            Err(e) => internal_error(&state, "withdraw", &e),
        }
    }

    async fn handle_list_withdrawals(
        State(state): State<AppState>,
        Extension(user): Extension<UserId>,
    ) -> Response {
        match state.service.list_withdrawals(&user).await {
            Ok(Listing::Found(withdrawals)) => (StatusCode::OK, Json(withdrawals)).into_response(),
            Ok(Listing::Empty) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => internal_error(&state, "list_withdrawals", &e),
        }
    }

    async fn handle_health() -> &'static str {
        debug!("Health check requested");
        "OK"
    }

    async fn handle_metrics(State(state): State<AppState>) -> Response {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
        }

        match String::from_utf8(buffer) {
            Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
            Err(e) => {
                error!("Failed to convert metrics to UTF-8: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
            }
        }
    }
}

fn internal_error(state: &AppState, operation: &str, err: &ServiceError) -> Response {
    error!(operation, "Request failed: {err}");
    state.metrics.record_error("service", operation);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_metrics_registry() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("GET", "/health", 200, Duration::from_millis(3));
        metrics.record_error("http", "/health");

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains(r#"http_requests_total{endpoint="/health",method="GET",status="200"} 1"#));
        assert!(text.contains(r#"errors_total{endpoint="/health",source="http"} 1"#));
    }
}
