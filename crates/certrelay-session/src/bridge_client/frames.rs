//! Decoding of bridge websocket event frames.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::messaging_client::{AuthState, ConnectionEvent, DisconnectCause};

pub(crate) const CREDS_UPDATE_FRAME: &str = "creds.update";
pub(crate) const CONNECTION_UPDATE_FRAME: &str = "connection.update";

#[derive(Debug, Error)]
/// Enumerates supported `BridgeEventParseError` values.
pub enum BridgeEventParseError {
    #[error("invalid bridge event json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("bridge event '{frame_type}' is missing field '{field}'")]
    MissingField {
        frame_type: String,
        field: &'static str,
    },
    #[error("bridge reported unknown connection state '{0}'")]
    UnknownConnectionState(String),
}

#[derive(Debug, Deserialize)]
struct RawBridgeFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    creds: Option<Value>,
    #[serde(default)]
    keys: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    qr: Option<String>,
    #[serde(default, rename = "lastDisconnect")]
    last_disconnect: Option<RawLastDisconnect>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLastDisconnect {
    #[serde(default, rename = "statusCode")]
    status_code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes one text frame into zero or more connection events.
///
/// Unknown frame types decode to no events. A `connection.update` carrying
/// both a QR challenge and a state yields the challenge first.
pub fn parse_bridge_event_frame(raw: &str) -> Result<Vec<ConnectionEvent>, BridgeEventParseError> {
    let frame = serde_json::from_str::<RawBridgeFrame>(raw)?;
    match frame.frame_type.as_str() {
        CREDS_UPDATE_FRAME => {
            let creds = frame.creds.ok_or(BridgeEventParseError::MissingField {
                frame_type: frame.frame_type.clone(),
                field: "creds",
            })?;
            Ok(vec![ConnectionEvent::CredentialsUpdated(AuthState {
                creds: Some(creds),
                keys: frame.keys.unwrap_or_default(),
            })])
        }
        CONNECTION_UPDATE_FRAME => {
            let mut events = Vec::new();
            if let Some(challenge) = frame.qr.filter(|qr| !qr.trim().is_empty()) {
                events.push(ConnectionEvent::PairingChallenge(challenge));
            }
            match frame.connection.as_deref() {
                None => {}
                Some("connecting") => events.push(ConnectionEvent::Connecting),
                Some("open") => events.push(ConnectionEvent::Open),
                Some("close") => {
                    let last = frame.last_disconnect.unwrap_or_default();
                    events.push(ConnectionEvent::Closed(DisconnectCause::from_status_code(
                        last.status_code,
                        last.message.unwrap_or_default(),
                    )));
                }
                Some(other) => {
                    return Err(BridgeEventParseError::UnknownConnectionState(
                        other.to_string(),
                    ))
                }
            }
            Ok(events)
        }
        _ => Ok(Vec::new()),
    }
}
