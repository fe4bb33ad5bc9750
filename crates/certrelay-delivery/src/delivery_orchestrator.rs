//! Paced delivery of one certificate document.
//!
//! Every delivery runs the same fixed sequence against the shared connection
//! handle: random pre-delay, `composing` presence, typing pause, document
//! send, `paused` presence. Each step is awaited before the next starts and
//! exactly one send is attempted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use certrelay_session::{
    PresenceState, RecipientAddress, SessionReader, SharedMessagingHandle,
};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::delivery_request::{
    build_certificate_document, normalize_recipient_address, DeliveryRequest,
};

/// Source of the shared connection handle and its readiness flag.
pub trait ConnectionSource: Send + Sync {
    fn current_handle(&self) -> Option<SharedMessagingHandle>;

    fn is_ready(&self) -> bool;
}

impl ConnectionSource for SessionReader {
    fn current_handle(&self) -> Option<SharedMessagingHandle> {
        SessionReader::current_handle(self)
    }

    fn is_ready(&self) -> bool {
        SessionReader::is_ready(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Pacing steps that talk to the network.
pub enum DeliveryStep {
    PresenceComposing,
    SendDocument,
    PresencePaused,
}

impl DeliveryStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PresenceComposing => "presence_composing",
            Self::SendDocument => "send_document",
            Self::PresencePaused => "presence_paused",
        }
    }
}

impl fmt::Display for DeliveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `DeliveryError` values.
pub enum DeliveryError {
    #[error("Socket not ready")]
    NotInitialized,
    #[error("WhatsApp not connected")]
    NotReady,
    #[error("Missing phone or pdfUrl")]
    BadRequest,
    #[error("{message}")]
    Failure {
        step: DeliveryStep,
        message: String,
        chain: Vec<String>,
    },
}

impl DeliveryError {
    fn failure(step: DeliveryStep, source: anyhow::Error) -> Self {
        Self::Failure {
            step,
            message: source.to_string(),
            chain: source.chain().map(ToString::to_string).collect(),
        }
    }

    /// Full error chain, one cause per line. Only delivery failures carry one.
    pub fn stack(&self) -> Option<String> {
        match self {
            Self::Failure { chain, .. } => Some(chain.join("\n")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Public struct `DeliveryPacingConfig` used across Certrelay components.
pub struct DeliveryPacingConfig {
    pub pre_delay_min: Duration,
    pub pre_delay_max: Duration,
    pub typing_pause: Duration,
}

impl DeliveryPacingConfig {
    pub fn disabled() -> Self {
        Self {
            pre_delay_min: Duration::ZERO,
            pre_delay_max: Duration::ZERO,
            typing_pause: Duration::ZERO,
        }
    }

    /// Uniform draw from `[pre_delay_min, pre_delay_max]`; zero when the maximum is zero.
    pub fn sample_pre_delay(&self) -> Duration {
        if self.pre_delay_max.is_zero() {
            return Duration::ZERO;
        }
        let min_ms = self.pre_delay_min.as_millis() as u64;
        let max_ms = self.pre_delay_max.as_millis() as u64;
        if min_ms >= max_ms {
            return self.pre_delay_max;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}

impl Default for DeliveryPacingConfig {
    fn default() -> Self {
        Self {
            pre_delay_min: Duration::from_millis(1_000),
            pre_delay_max: Duration::from_millis(3_000),
            typing_pause: Duration::from_millis(2_500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Outcome of a successful delivery.
pub struct DeliveryReceipt {
    pub address: RecipientAddress,
    pub message_id: Option<String>,
    pub pre_delay_ms: u64,
}

#[derive(Clone)]
/// Runs paced deliveries over the current session connection.
pub struct DeliveryOrchestrator {
    session: Arc<dyn ConnectionSource>,
    pacing: DeliveryPacingConfig,
}

impl DeliveryOrchestrator {
    pub fn new(session: Arc<dyn ConnectionSource>, pacing: DeliveryPacingConfig) -> Self {
        Self { session, pacing }
    }

    pub fn pacing(&self) -> DeliveryPacingConfig {
        self.pacing
    }

    /// Connection preconditions, checked in order: handle present, then readiness.
    pub fn ensure_ready(&self) -> Result<SharedMessagingHandle, DeliveryError> {
        let Some(handle) = self.session.current_handle() else {
            return Err(DeliveryError::NotInitialized);
        };
        if !self.session.is_ready() {
            return Err(DeliveryError::NotReady);
        }
        Ok(handle)
    }

    pub async fn deliver(
        &self,
        request: &DeliveryRequest,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let handle = self.ensure_ready()?;
        let Some((phone, pdf_url)) = request.required_fields() else {
            return Err(DeliveryError::BadRequest);
        };

        let address = normalize_recipient_address(phone);
        let document = build_certificate_document(request.display_name(), pdf_url);
        info!(address = %address, pdf_url, "delivering certificate");

        let pre_delay = self.pacing.sample_pre_delay();
        if !pre_delay.is_zero() {
            debug!(pre_delay_ms = pre_delay.as_millis() as u64, "pre-send delay");
            tokio::time::sleep(pre_delay).await;
        }

        debug!(address = %address, "sending composing presence");
        handle
            .send_presence_update(PresenceState::Composing, &address)
            .await
            .map_err(|source| report_failure(DeliveryStep::PresenceComposing, &address, source))?;

        if !self.pacing.typing_pause.is_zero() {
            tokio::time::sleep(self.pacing.typing_pause).await;
        }

        debug!(address = %address, file_name = %document.file_name, "sending document");
        let receipt = handle
            .send_message(&address, &document)
            .await
            .map_err(|source| report_failure(DeliveryStep::SendDocument, &address, source))?;
        info!(
            address = %address,
            message_id = receipt.message_id.as_deref().unwrap_or("unknown"),
            "certificate document sent"
        );

        handle
            .send_presence_update(PresenceState::Paused, &address)
            .await
            .map_err(|source| report_failure(DeliveryStep::PresencePaused, &address, source))?;

        Ok(DeliveryReceipt {
            address,
            message_id: receipt.message_id,
            pre_delay_ms: pre_delay.as_millis() as u64,
        })
    }
}

fn report_failure(
    step: DeliveryStep,
    address: &RecipientAddress,
    source: anyhow::Error,
) -> DeliveryError {
    error!(
        step = step.as_str(),
        address = %address,
        error = %format!("{source:#}"),
        "certificate delivery failed"
    );
    DeliveryError::failure(step, source)
}
