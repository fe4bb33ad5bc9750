use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use certrelay_delivery::{DeliveryError, DeliveryOrchestrator, DeliveryRequest};
use certrelay_session::SessionReader;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

mod types;

use types::RelayApiError;

pub const HEALTH_ENDPOINT: &str = "/";
pub const STATUS_ENDPOINT: &str = "/status";
pub const SEND_CERTIFICATE_ENDPOINT: &str = "/send-certificate";

pub const HEALTH_READY_TEXT: &str = "✅ WhatsApp Certificate Bot Running";
pub const HEALTH_CONNECTING_TEXT: &str = "⏳ WhatsApp connecting...";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `RelayGatewayServerConfig` used across Certrelay components.
pub struct RelayGatewayServerConfig {
    pub bind_host: String,
    pub port: u16,
}

/// Shared state of the relay HTTP handlers.
pub struct RelayGatewayState {
    session: SessionReader,
    orchestrator: DeliveryOrchestrator,
}

impl RelayGatewayState {
    pub fn new(session: SessionReader, orchestrator: DeliveryOrchestrator) -> Self {
        Self {
            session,
            orchestrator,
        }
    }
}

/// Binds the listener described by `config`.
pub async fn bind_relay_gateway_listener(config: &RelayGatewayServerConfig) -> Result<TcpListener> {
    let host = config
        .bind_host
        .trim()
        .parse::<IpAddr>()
        .with_context(|| format!("invalid --bind-host '{}'", config.bind_host))?;
    let bind_addr = SocketAddr::new(host, config.port);
    TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind certificate relay server on {bind_addr}"))
}

/// Serves the relay endpoints until `shutdown` resolves, then drains in-flight requests.
pub async fn serve_relay_gateway<F>(
    listener: TcpListener,
    state: Arc<RelayGatewayState>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound relay server address")?;
    info!(addr = %local_addr, "certificate relay server listening");
    let app = build_relay_gateway_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("certificate relay server exited unexpectedly")
}

pub async fn run_relay_gateway_server<F>(
    config: RelayGatewayServerConfig,
    state: Arc<RelayGatewayState>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = bind_relay_gateway_listener(&config).await?;
    serve_relay_gateway(listener, state, shutdown).await
}

pub fn build_relay_gateway_router(state: Arc<RelayGatewayState>) -> Router {
    Router::new()
        .route(HEALTH_ENDPOINT, get(handle_health))
        .route(STATUS_ENDPOINT, get(handle_status))
        .route(SEND_CERTIFICATE_ENDPOINT, post(handle_send_certificate))
        .with_state(state)
}

async fn handle_health(State(state): State<Arc<RelayGatewayState>>) -> &'static str {
    if state.session.is_ready() {
        HEALTH_READY_TEXT
    } else {
        HEALTH_CONNECTING_TEXT
    }
}

async fn handle_status(State(state): State<Arc<RelayGatewayState>>) -> Response {
    let snapshot = state.session.status_snapshot();
    (
        StatusCode::OK,
        Json(json!({
            "whatsappReady": snapshot.ready,
            "socketExists": snapshot.handle_present,
            "session": snapshot,
        })),
    )
        .into_response()
}

async fn handle_send_certificate(
    State(state): State<Arc<RelayGatewayState>>,
    payload: Result<Json<DeliveryRequest>, JsonRejection>,
) -> Response {
    if let Err(error) = state.orchestrator.ensure_ready() {
        info!(reason = %error, "rejecting certificate request");
        return RelayApiError::from(error).into_response();
    }

    let request = match payload {
        Ok(Json(request)) => request,
        // Bodies sent without a JSON content type read as empty.
        Err(JsonRejection::MissingJsonContentType(_)) => DeliveryRequest::default(),
        Err(rejection) => return RelayApiError::invalid_json(rejection.body_text()).into_response(),
    };
    info!(
        phone = request.phone.as_deref().unwrap_or_default(),
        name = request.name.as_deref().unwrap_or_default(),
        pdf_url = request.pdf_url.as_deref().unwrap_or_default(),
        "certificate request received"
    );

    match state.orchestrator.deliver(&request).await {
        Ok(receipt) => {
            info!(
                address = %receipt.address,
                message_id = receipt.message_id.as_deref().unwrap_or("unknown"),
                "certificate sent successfully"
            );
            (StatusCode::OK, Json(json!({ "success": true }))).into_response()
        }
        Err(error) => {
            if matches!(error, DeliveryError::BadRequest) {
                info!("rejecting certificate request with missing phone or pdfUrl");
            }
            RelayApiError::from(error).into_response()
        }
    }
}
