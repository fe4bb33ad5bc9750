use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use certrelay_delivery::DeliveryError;
use serde_json::json;

#[derive(Debug)]
/// Error response of the relay endpoints.
///
/// Precondition failures answer with plain text; delivery failures answer
/// with `{ "error", "stack" }` JSON.
pub(super) struct RelayApiError {
    pub(super) status: StatusCode,
    pub(super) message: String,
    pub(super) stack: Option<String>,
}

impl RelayApiError {
    pub(super) fn text(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            stack: None,
        }
    }

    pub(super) fn invalid_json(detail: impl AsRef<str>) -> Self {
        Self::text(
            StatusCode::BAD_REQUEST,
            format!("Invalid JSON body: {}", detail.as_ref()),
        )
    }
}

impl From<DeliveryError> for RelayApiError {
    fn from(error: DeliveryError) -> Self {
        let status = match error {
            DeliveryError::BadRequest => StatusCode::BAD_REQUEST,
            DeliveryError::NotInitialized
            | DeliveryError::NotReady
            | DeliveryError::Failure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
            stack: error.stack(),
        }
    }
}

impl IntoResponse for RelayApiError {
    fn into_response(self) -> Response {
        match self.stack {
            Some(stack) => (
                self.status,
                Json(json!({
                    "error": self.message,
                    "stack": stack,
                })),
            )
                .into_response(),
            None => (self.status, self.message).into_response(),
        }
    }
}
