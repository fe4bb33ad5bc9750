//! Contract between the session manager and a multi-device messaging client.
//!
//! The transport, encryption, and multi-device sync live behind
//! [`MessagingConnector`]. A connector opens one connection per connect
//! sequence and hands back a [`MessagingHandle`] for outbound calls plus an
//! event channel carrying credential and connection-state changes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Address suffix for individual (non-group) recipients on the network.
pub const USER_ADDRESS_SUFFIX: &str = "@s.whatsapp.net";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Fixed client identity announced when a connection is opened.
pub struct ClientIdentity {
    pub name: String,
    pub browser: String,
    pub release: String,
}

impl ClientIdentity {
    pub fn new(
        name: impl Into<String>,
        browser: impl Into<String>,
        release: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            browser: browser.into(),
            release: release.into(),
        }
    }

    pub fn as_triple(&self) -> [&str; 3] {
        [
            self.name.as_str(),
            self.browser.as_str(),
            self.release.as_str(),
        ]
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self::new("CertificateBot", "Chrome", "1.0")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Protocol version tag negotiated with the network (`major.minor.patch`).
pub struct ProtocolVersion(pub [u32; 3]);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch] = self.0;
        write!(f, "{major}.{minor}.{patch}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Opaque authentication state owned by the messaging client.
///
/// `creds` holds the device credentials; `keys` holds the signal key material
/// indexed by key id. In a credentials update `keys` only lists changed ids,
/// with `null` marking a removed key. The session manager never interprets
/// either beyond the `registered` flag used for logging.
pub struct AuthState {
    #[serde(default)]
    pub creds: Option<Value>,
    #[serde(default)]
    pub keys: BTreeMap<String, Value>,
}

impl AuthState {
    pub fn is_empty(&self) -> bool {
        self.creds.is_none() && self.keys.is_empty()
    }

    pub fn is_registered(&self) -> bool {
        self.creds
            .as_ref()
            .and_then(|creds| creds.get("registered"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Everything a connector needs to open one connection.
pub struct ConnectionConfig {
    pub auth: AuthState,
    pub version: ProtocolVersion,
    pub client_identity: ClientIdentity,
}

#[derive(Debug, Clone, PartialEq)]
/// Events emitted by an open connection.
pub enum ConnectionEvent {
    CredentialsUpdated(AuthState),
    PairingChallenge(String),
    Connecting,
    Open,
    Closed(DisconnectCause),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// Why a connection closed. Only [`DisconnectCause::LoggedOut`] is terminal.
pub enum DisconnectCause {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    MultiDeviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    ServiceUnavailable,
    RestartRequired,
    ConnectFailed {
        detail: String,
    },
    Other {
        status_code: Option<u16>,
        detail: String,
    },
}

impl DisconnectCause {
    /// Maps a network disconnect status code onto a cause.
    pub fn from_status_code(status_code: Option<u16>, detail: impl Into<String>) -> Self {
        match status_code {
            Some(401) => Self::LoggedOut,
            Some(403) => Self::Forbidden,
            Some(408) => Self::ConnectionLost,
            Some(411) => Self::MultiDeviceMismatch,
            Some(428) => Self::ConnectionClosed,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(503) => Self::ServiceUnavailable,
            Some(515) => Self::RestartRequired,
            _ => Self::Other {
                status_code,
                detail: detail.into(),
            },
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::LoggedOut => Some(401),
            Self::Forbidden => Some(403),
            Self::ConnectionLost => Some(408),
            Self::MultiDeviceMismatch => Some(411),
            Self::ConnectionClosed => Some(428),
            Self::ConnectionReplaced => Some(440),
            Self::BadSession => Some(500),
            Self::ServiceUnavailable => Some(503),
            Self::RestartRequired => Some(515),
            Self::ConnectFailed { .. } => None,
            Self::Other { status_code, .. } => *status_code,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::Forbidden => "forbidden",
            Self::ConnectionLost => "connection_lost",
            Self::MultiDeviceMismatch => "multi_device_mismatch",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionReplaced => "connection_replaced",
            Self::BadSession => "bad_session",
            Self::ServiceUnavailable => "service_unavailable",
            Self::RestartRequired => "restart_required",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::Other { .. } => "other",
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed { detail } => write!(f, "connect_failed: {detail}"),
            Self::Other {
                status_code: Some(code),
                detail,
            } => write!(f, "other (status {code}): {detail}"),
            Self::Other {
                status_code: None,
                detail,
            } => write!(f, "other: {detail}"),
            cause => f.write_str(cause.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Presence signals used to simulate typing activity.
pub enum PresenceState {
    Composing,
    Paused,
}

impl PresenceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Composing => "composing",
            Self::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Protocol-level recipient address (`<digits>@s.whatsapp.net`).
pub struct RecipientAddress(String);

impl RecipientAddress {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for RecipientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Document message whose payload the messaging layer fetches from `url`.
pub struct DocumentMessage {
    pub url: String,
    pub mime_type: String,
    pub file_name: String,
    pub caption: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
/// Acknowledgement returned by the messaging layer for a sent message.
pub struct MessageReceipt {
    pub message_id: Option<String>,
    pub raw: Value,
}

/// Outbound calls available on an open connection.
#[async_trait]
pub trait MessagingHandle: Send + Sync {
    async fn send_presence_update(
        &self,
        presence: PresenceState,
        address: &RecipientAddress,
    ) -> Result<()>;

    async fn send_message(
        &self,
        address: &RecipientAddress,
        document: &DocumentMessage,
    ) -> Result<MessageReceipt>;
}

pub type SharedMessagingHandle = Arc<dyn MessagingHandle>;

/// A freshly opened connection: its handle plus its event subscription.
pub struct OpenedConnection {
    pub handle: SharedMessagingHandle,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Opens connections to the messaging network.
#[async_trait]
pub trait MessagingConnector: Send + Sync {
    async fn open(&self, config: ConnectionConfig) -> Result<OpenedConnection>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unit_disconnect_status_codes_map_to_causes_and_back() {
        for code in [401_u16, 403, 408, 411, 428, 440, 500, 503, 515] {
            let cause = DisconnectCause::from_status_code(Some(code), "");
            assert_eq!(cause.status_code(), Some(code));
        }
        let unknown = DisconnectCause::from_status_code(Some(499), "odd close");
        assert_eq!(
            unknown,
            DisconnectCause::Other {
                status_code: Some(499),
                detail: "odd close".to_string(),
            }
        );
    }

    #[test]
    fn unit_only_logged_out_is_terminal() {
        assert!(DisconnectCause::LoggedOut.is_terminal());
        assert!(!DisconnectCause::ConnectionReplaced.is_terminal());
        assert!(!DisconnectCause::RestartRequired.is_terminal());
        assert!(!DisconnectCause::ConnectFailed {
            detail: "dns".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn unit_disconnect_cause_serializes_with_kind_tag() {
        let value = serde_json::to_value(DisconnectCause::ConnectFailed {
            detail: "bridge unreachable".to_string(),
        })
        .expect("serialize");
        assert_eq!(
            value,
            json!({"kind": "connect_failed", "detail": "bridge unreachable"})
        );
        let value = serde_json::to_value(DisconnectCause::LoggedOut).expect("serialize");
        assert_eq!(value, json!({"kind": "logged_out"}));
    }

    #[test]
    fn unit_auth_state_reports_registration_flag() {
        let mut state = AuthState::default();
        assert!(state.is_empty());
        assert!(!state.is_registered());
        state.creds = Some(json!({"registered": true, "me": {"id": "1555"}}));
        assert!(!state.is_empty());
        assert!(state.is_registered());
    }

    #[test]
    fn unit_protocol_version_displays_dotted() {
        assert_eq!(
            ProtocolVersion([2, 3000, 1_015_901_307]).to_string(),
            "2.3000.1015901307"
        );
    }
}
