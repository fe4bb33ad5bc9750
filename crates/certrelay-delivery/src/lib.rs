//! Certificate delivery over an established messaging session.

pub mod delivery_orchestrator;
pub mod delivery_request;

pub use delivery_orchestrator::{
    ConnectionSource, DeliveryError, DeliveryOrchestrator, DeliveryPacingConfig, DeliveryReceipt,
    DeliveryStep,
};
pub use delivery_request::{
    build_certificate_document, normalize_recipient_address, DeliveryRequest,
    DEFAULT_DOCUMENT_NAME, PDF_MIME_TYPE,
};
