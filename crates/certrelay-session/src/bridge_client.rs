//! Messaging client backed by an external multi-device bridge process.
//!
//! The bridge owns the encrypted transport. This client opens a bridge
//! session over REST, streams its events over a websocket, and forwards
//! presence updates and document messages back over REST.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::messaging_client::{
    ConnectionConfig, ConnectionEvent, DisconnectCause, DocumentMessage, MessageReceipt,
    MessagingConnector, MessagingHandle, OpenedConnection, PresenceState, RecipientAddress,
};

mod frames;


pub use frames::{parse_bridge_event_frame, BridgeEventParseError};

const ERROR_BODY_MAX_CHARS: usize = 800;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `BridgeConnectorConfig` used across Certrelay components.
pub struct BridgeConnectorConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct OpenSessionResponse {
    session_id: String,
    events_url: String,
}

#[derive(Clone)]
struct BridgeHttp {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl BridgeHttp {
    fn new(config: &BridgeConnectorConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("certrelay-bridge-client"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create bridge http client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            auth_token: config
                .auth_token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
        })
    }

    /// Single attempt; an empty success body decodes as JSON `null`.
    async fn post_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        payload: &Value,
    ) -> Result<T> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("bridge {operation} request failed"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read bridge {operation} response"))?;
        if !status.is_success() {
            bail!(
                "bridge {operation} failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, ERROR_BODY_MAX_CHARS)
            );
        }
        let body = if body.trim().is_empty() {
            "null"
        } else {
            body.as_str()
        };
        serde_json::from_str::<T>(body)
            .with_context(|| format!("failed to decode bridge {operation} response"))
    }
}

/// Opens bridge sessions; one per connect sequence.
pub struct BridgeConnector {
    http: BridgeHttp,
    events_connect_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(config: BridgeConnectorConfig) -> Result<Self> {
        Ok(Self {
            http: BridgeHttp::new(&config)?,
            events_connect_timeout: Duration::from_millis(config.request_timeout_ms.max(1)),
        })
    }

    async fn connect_events(
        &self,
        events_url: &str,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let mut request = events_url
            .into_client_request()
            .with_context(|| format!("invalid bridge events url {events_url}"))?;
        if let Some(token) = &self.http.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("bridge token is not a valid header value")?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (stream, _response) =
            tokio::time::timeout(self.events_connect_timeout, connect_async(request))
                .await
                .map_err(|_| {
                    anyhow!(
                        "timed out after {} ms connecting bridge event stream {events_url}",
                        self.events_connect_timeout.as_millis()
                    )
                })?
                .with_context(|| format!("failed to connect bridge event stream {events_url}"))?;
        Ok(stream)
    }
}

#[async_trait]
impl MessagingConnector for BridgeConnector {
    async fn open(&self, config: ConnectionConfig) -> Result<OpenedConnection> {
        let payload = json!({
            "auth": config.auth,
            "version": config.version.0,
            "browser": config.client_identity.as_triple(),
        });
        let opened: OpenSessionResponse = self
            .http
            .post_json("open session", "/sessions", &payload)
            .await?;
        let session_id = validate_session_id(&opened.session_id)?;
        let events_url = resolve_events_url(&self.http.base_url, &opened.events_url)?;
        let stream = self.connect_events(&events_url).await?;
        info!(session_id, events_url = %events_url, "bridge session opened");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_bridge_events(stream, tx));
        Ok(OpenedConnection {
            handle: Arc::new(BridgeHandle {
                http: self.http.clone(),
                session_id: session_id.to_string(),
            }),
            events: rx,
        })
    }
}

struct BridgeHandle {
    http: BridgeHttp,
    session_id: String,
}

#[async_trait]
impl MessagingHandle for BridgeHandle {
    async fn send_presence_update(
        &self,
        presence: PresenceState,
        address: &RecipientAddress,
    ) -> Result<()> {
        let payload = json!({
            "jid": address.as_str(),
            "presence": presence.as_str(),
        });
        self.http
            .post_json::<Value>(
                "presence update",
                &format!("/sessions/{}/presence", self.session_id),
                &payload,
            )
            .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        address: &RecipientAddress,
        document: &DocumentMessage,
    ) -> Result<MessageReceipt> {
        let payload = json!({
            "jid": address.as_str(),
            "document": { "url": document.url },
            "mimetype": document.mime_type,
            "fileName": document.file_name,
            "caption": document.caption,
        });
        let raw = self
            .http
            .post_json::<Value>(
                "send message",
                &format!("/sessions/{}/messages", self.session_id),
                &payload,
            )
            .await?;
        let message_id = raw
            .pointer("/key/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(MessageReceipt { message_id, raw })
    }
}

/// Forwards decoded frames until the socket ends or the receiver goes away.
///
/// A stream that ends before any close event was forwarded is reported as
/// [`DisconnectCause::ConnectionLost`] (no close frame) or
/// [`DisconnectCause::ConnectionClosed`] (close frame without a prior
/// `connection.update`).
pub(crate) async fn pump_bridge_events<S>(
    mut source: S,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let mut close_forwarded = false;
    let mut close_frame_seen = false;
    loop {
        let maybe_message = tokio::select! {
            _ = events.closed() => {
                debug!("bridge event receiver dropped; closing event stream");
                return;
            }
            maybe_message = source.next() => maybe_message,
        };
        let Some(message_result) = maybe_message else {
            break;
        };
        let message = match message_result {
            Ok(message) => message,
            Err(error) => {
                warn!(error = %error, "bridge event stream failed");
                break;
            }
        };
        let raw = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!("ignoring non utf-8 bridge event frame");
                    continue;
                }
            },
            WsMessage::Close(_) => {
                close_frame_seen = true;
                continue;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };
        match parse_bridge_event_frame(&raw) {
            Ok(parsed) => {
                for event in parsed {
                    close_forwarded |= matches!(event, ConnectionEvent::Closed(_));
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Err(error) => warn!(error = %error, "ignoring malformed bridge event frame"),
        }
    }

    if !close_forwarded {
        let cause = if close_frame_seen {
            DisconnectCause::ConnectionClosed
        } else {
            DisconnectCause::ConnectionLost
        };
        let _ = events.send(ConnectionEvent::Closed(cause));
    }
}

fn validate_session_id(session_id: &str) -> Result<&str> {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        bail!("bridge open session response has an empty session_id");
    }
    if !session_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        bail!("bridge session_id '{session_id}' contains unsupported characters");
    }
    Ok(session_id)
}

/// Maps the bridge-provided events URL onto a websocket URL.
///
/// Relative paths resolve against the bridge base URL; `http(s)` schemes
/// become `ws(s)`.
pub(crate) fn resolve_events_url(base_url: &str, events_url: &str) -> Result<String> {
    let events_url = events_url.trim();
    if events_url.starts_with("ws://") || events_url.starts_with("wss://") {
        return Ok(events_url.to_string());
    }
    if let Some(url) = to_websocket_scheme(events_url) {
        return Ok(url);
    }
    if events_url.starts_with('/') {
        let base = to_websocket_scheme(base_url.trim())
            .ok_or_else(|| anyhow!("bridge base url '{base_url}' is not an http(s) url"))?;
        return Ok(format!("{}{}", base.trim_end_matches('/'), events_url));
    }
    bail!("unsupported bridge events url '{events_url}'")
}

fn to_websocket_scheme(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    url.strip_prefix("http://").map(|rest| format!("ws://{rest}"))
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}
