use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use certrelay_delivery::{DeliveryOrchestrator, DeliveryPacingConfig};
use certrelay_gateway::{
    serve_relay_gateway, RelayGatewayState, HEALTH_CONNECTING_TEXT, HEALTH_READY_TEXT,
};
use certrelay_session::{
    ConnectionConfig, ConnectionEvent, DisconnectCause, DocumentMessage, FileCredentialStore,
    FixedVersionResolver, MessageReceipt, MessagingConnector, MessagingHandle, OpenedConnection,
    PresenceState, ProtocolVersion, QrRenderer, ReconnectPolicy, RecipientAddress, SessionManager,
    SessionManagerConfig, SessionReader, SessionState,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

type CallLog = Arc<Mutex<Vec<String>>>;

struct LoggingHandle {
    connection: usize,
    calls: CallLog,
    reject_sends: bool,
}

#[async_trait]
impl MessagingHandle for LoggingHandle {
    async fn send_presence_update(
        &self,
        presence: PresenceState,
        address: &RecipientAddress,
    ) -> Result<()> {
        self.calls.lock().expect("calls lock").push(format!(
            "conn{}:presence:{}:{}",
            self.connection,
            presence.as_str(),
            address
        ));
        Ok(())
    }

    async fn send_message(
        &self,
        address: &RecipientAddress,
        document: &DocumentMessage,
    ) -> Result<MessageReceipt> {
        self.calls.lock().expect("calls lock").push(format!(
            "conn{}:document:{}:{}:{}",
            self.connection, address, document.file_name, document.url
        ));
        if self.reject_sends {
            bail!("media download failed");
        }
        Ok(MessageReceipt {
            message_id: Some(format!("msg-{}", self.connection)),
            raw: Value::Null,
        })
    }
}

#[derive(Default)]
struct ScriptedNetwork {
    calls: CallLog,
    senders: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
    configs: Mutex<Vec<ConnectionConfig>>,
    reject_sends: bool,
}

impl ScriptedNetwork {
    fn connection_count(&self) -> usize {
        self.senders.lock().expect("senders lock").len()
    }

    fn emit(&self, connection: usize, event: ConnectionEvent) {
        let sender = self.senders.lock().expect("senders lock")[connection].clone();
        sender.send(event).expect("event channel open");
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl MessagingConnector for ScriptedNetwork {
    async fn open(&self, config: ConnectionConfig) -> Result<OpenedConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut senders = self.senders.lock().expect("senders lock");
        let handle = LoggingHandle {
            connection: senders.len(),
            calls: Arc::clone(&self.calls),
            reject_sends: self.reject_sends,
        };
        senders.push(tx);
        self.configs.lock().expect("configs lock").push(config);
        Ok(OpenedConnection {
            handle: Arc::new(handle),
            events: rx,
        })
    }
}

#[derive(Default)]
struct CapturedQr(Mutex<Vec<String>>);

impl QrRenderer for CapturedQr {
    fn render(&self, challenge: &str) {
        self.0.lock().expect("qr lock").push(challenge.to_string());
    }
}

struct RunningRelay {
    addr: SocketAddr,
    reader: SessionReader,
    server_shutdown: Option<oneshot::Sender<()>>,
    server_task: tokio::task::JoinHandle<Result<()>>,
}

impl RunningRelay {
    async fn stop_server(mut self) {
        if let Some(tx) = self.server_shutdown.take() {
            let _ = tx.send(());
        }
        self.server_task
            .await
            .expect("server task join")
            .expect("server exits cleanly");
    }
}

async fn start_relay(
    network: Arc<ScriptedNetwork>,
    qr: Arc<CapturedQr>,
    auth_dir: &std::path::Path,
) -> (RunningRelay, certrelay_session::SessionDriverHandle) {
    let manager = SessionManager::new(
        SessionManagerConfig {
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(20)),
            stabilize_delay: Duration::ZERO,
            ..SessionManagerConfig::default()
        },
        network,
        Arc::new(FileCredentialStore::new(auth_dir)),
        Arc::new(FixedVersionResolver::new(ProtocolVersion([2, 3000, 7]))),
        qr,
    );
    let driver = manager.start();
    let reader = driver.reader();
    let orchestrator =
        DeliveryOrchestrator::new(Arc::new(reader.clone()), DeliveryPacingConfig::disabled());
    let state = Arc::new(RelayGatewayState::new(reader.clone(), orchestrator));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral listener");
    let addr = listener.local_addr().expect("listener addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(serve_relay_gateway(listener, state, async move {
        let _ = shutdown_rx.await;
    }));

    (
        RunningRelay {
            addr,
            reader,
            server_shutdown: Some(shutdown_tx),
            server_task,
        },
        driver,
    )
}

async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {description}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn health(addr: SocketAddr) -> String {
    reqwest::get(format!("http://{addr}/"))
        .await
        .expect("health request")
        .text()
        .await
        .expect("health body")
}

async fn status(addr: SocketAddr) -> Value {
    reqwest::get(format!("http://{addr}/status"))
        .await
        .expect("status request")
        .json()
        .await
        .expect("status json")
}

async fn send_certificate(addr: SocketAddr, body: Value) -> (u16, String) {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/send-certificate"))
        .json(&body)
        .send()
        .await
        .expect("send-certificate request");
    let status = response.status().as_u16();
    (status, response.text().await.expect("response body"))
}

#[tokio::test]
async fn integration_relay_pairs_delivers_reconnects_and_halts_on_logout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let network = Arc::new(ScriptedNetwork::default());
    let qr = Arc::new(CapturedQr::default());
    let (relay, mut driver) = start_relay(Arc::clone(&network), Arc::clone(&qr), temp.path()).await;
    let addr = relay.addr;

    wait_until("first connection", || network.connection_count() == 1).await;
    assert_eq!(
        network.configs.lock().expect("configs lock")[0].version,
        ProtocolVersion([2, 3000, 7])
    );
    assert_eq!(health(addr).await, HEALTH_CONNECTING_TEXT);

    let (code, body) = send_certificate(
        addr,
        json!({"phone": "+55 11 9999-8888", "pdfUrl": "https://cdn.test/a.pdf"}),
    )
    .await;
    assert_eq!(code, 500);
    assert_eq!(body, "WhatsApp not connected");

    network.emit(0, ConnectionEvent::PairingChallenge("2@pair-me".to_string()));
    let reader = relay.reader.clone();
    wait_until("pairing state", || {
        reader.state() == SessionState::PairingRequired
    })
    .await;
    assert_eq!(qr.0.lock().expect("qr lock").as_slice(), ["2@pair-me"]);

    network.emit(0, ConnectionEvent::Open);
    wait_until("ready after open", || reader.is_ready()).await;
    assert_eq!(health(addr).await, HEALTH_READY_TEXT);

    let (code, body) = send_certificate(
        addr,
        json!({
            "phone": "+55 11 9999-8888",
            "name": "Ada Lovelace",
            "pdfUrl": "https://cdn.test/a.pdf"
        }),
    )
    .await;
    assert_eq!(code, 200, "body: {body}");
    assert_eq!(
        serde_json::from_str::<Value>(&body).expect("json body"),
        json!({"success": true})
    );
    assert_eq!(
        network.calls(),
        vec![
            "conn0:presence:composing:5511999998888@s.whatsapp.net".to_string(),
            "conn0:document:5511999998888@s.whatsapp.net:Ada Lovelace.pdf:https://cdn.test/a.pdf"
                .to_string(),
            "conn0:presence:paused:5511999998888@s.whatsapp.net".to_string(),
        ]
    );

    network.emit(0, ConnectionEvent::Closed(DisconnectCause::ConnectionLost));
    wait_until("reconnect", || network.connection_count() == 2).await;
    let snapshot = status(addr).await;
    assert_eq!(snapshot["whatsappReady"], json!(false));
    assert_eq!(snapshot["socketExists"], json!(true));

    network.emit(1, ConnectionEvent::Open);
    wait_until("ready after reconnect", || reader.is_ready()).await;
    let (code, _) = send_certificate(
        addr,
        json!({"phone": "123", "pdfUrl": "https://cdn.test/b.pdf"}),
    )
    .await;
    assert_eq!(code, 200);
    assert!(network
        .calls()
        .iter()
        .any(|call| call == "conn1:document:123@s.whatsapp.net:certificate.pdf:https://cdn.test/b.pdf"));

    network.emit(1, ConnectionEvent::Closed(DisconnectCause::LoggedOut));
    wait_until("driver halt", || !driver.is_running()).await;
    let snapshot = status(addr).await;
    assert_eq!(snapshot["whatsappReady"], json!(false));
    assert_eq!(snapshot["session"]["state"], json!("logged_out"));
    assert_eq!(network.connection_count(), 2);

    driver.shutdown().await;
    relay.stop_server().await;
}

#[tokio::test]
async fn integration_send_failure_reports_error_and_stack_without_disconnecting() {
    let temp = tempfile::tempdir().expect("tempdir");
    let network = Arc::new(ScriptedNetwork {
        reject_sends: true,
        ..ScriptedNetwork::default()
    });
    let (relay, mut driver) = start_relay(
        Arc::clone(&network),
        Arc::new(CapturedQr::default()),
        temp.path(),
    )
    .await;
    let addr = relay.addr;

    wait_until("first connection", || network.connection_count() == 1).await;
    network.emit(0, ConnectionEvent::Open);
    let reader = relay.reader.clone();
    wait_until("ready", || reader.is_ready()).await;

    let (code, body) = send_certificate(
        addr,
        json!({"phone": "987", "pdfUrl": "https://cdn.test/missing.pdf"}),
    )
    .await;
    assert_eq!(code, 500);
    let payload: Value = serde_json::from_str(&body).expect("json error body");
    assert_eq!(payload["error"], json!("media download failed"));
    assert!(payload["stack"]
        .as_str()
        .expect("stack string")
        .contains("media download failed"));
    assert_eq!(network.calls().len(), 2);
    assert!(reader.is_ready());

    let (code, body) = send_certificate(addr, json!({"name": "No Phone"})).await;
    assert_eq!(code, 400);
    assert_eq!(body, "Missing phone or pdfUrl");

    driver.shutdown().await;
    relay.stop_server().await;
}

#[tokio::test]
async fn integration_credentials_persist_across_driver_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = Arc::new(ScriptedNetwork::default());
    let (relay, mut driver) = start_relay(
        Arc::clone(&first),
        Arc::new(CapturedQr::default()),
        temp.path(),
    )
    .await;
    wait_until("first connection", || first.connection_count() == 1).await;
    first.emit(
        0,
        ConnectionEvent::CredentialsUpdated(certrelay_session::AuthState {
            creds: Some(json!({"me": {"id": "5511@s.whatsapp.net"}, "registered": false})),
            keys: [
                ("pre-key:1".to_string(), json!({"public": "AAA"})),
                ("session/5511.0".to_string(), json!({"chain": 1})),
            ]
            .into_iter()
            .collect(),
        }),
    );
    first.emit(
        0,
        ConnectionEvent::CredentialsUpdated(certrelay_session::AuthState {
            creds: Some(json!({"me": {"id": "5511@s.whatsapp.net"}, "registered": true})),
            ..Default::default()
        }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    driver.shutdown().await;
    relay.stop_server().await;

    let second = Arc::new(ScriptedNetwork::default());
    let (relay, mut driver) = start_relay(
        Arc::clone(&second),
        Arc::new(CapturedQr::default()),
        temp.path(),
    )
    .await;
    wait_until("second connection", || second.connection_count() == 1).await;
    let restored = second.configs.lock().expect("configs lock")[0].auth.clone();
    assert_eq!(
        restored.creds,
        Some(json!({"me": {"id": "5511@s.whatsapp.net"}, "registered": true}))
    );
    assert_eq!(
        restored.keys.keys().cloned().collect::<Vec<_>>(),
        vec!["pre-key:1".to_string(), "session/5511.0".to_string()]
    );

    driver.shutdown().await;
    relay.stop_server().await;
}
