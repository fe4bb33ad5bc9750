//! Messaging session lifecycle for the certificate relay.
//!
//! Owns the connection to the messaging network: connect/reconnect state
//! machine, pairing, credential persistence, and the bridge-backed client.

pub mod bridge_client;
pub mod credential_store;
pub mod messaging_client;
pub mod qr_renderer;
pub mod session_manager;
pub mod version_resolver;

pub use bridge_client::{
    parse_bridge_event_frame, BridgeConnector, BridgeConnectorConfig, BridgeEventParseError,
};
pub use credential_store::{CredentialStore, FileCredentialStore};
pub use messaging_client::{
    AuthState, ClientIdentity, ConnectionConfig, ConnectionEvent, DisconnectCause,
    DocumentMessage, MessageReceipt, MessagingConnector, MessagingHandle, OpenedConnection,
    PresenceState, ProtocolVersion, RecipientAddress, SharedMessagingHandle, USER_ADDRESS_SUFFIX,
};
pub use qr_renderer::{render_qr_to_string, QrRenderer, TerminalQrRenderer};
pub use session_manager::{
    ConnectOutcome, ReconnectPolicy, SessionDriverHandle, SessionManager, SessionManagerConfig,
    SessionReader, SessionState, SessionStatusSnapshot, SessionTransition,
};
pub use version_resolver::{
    parse_protocol_version, FixedVersionResolver, HttpVersionResolver, ResolvedVersion,
    VersionResolver, DEFAULT_VERSION_URL, FALLBACK_PROTOCOL_VERSION,
};
