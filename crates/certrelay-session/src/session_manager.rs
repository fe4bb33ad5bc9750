//! Connection lifecycle of the messaging session.
//!
//! One driver task owns the state machine: connect, consume the connection's
//! event channel, then either halt (logged out) or run [`schedule_reconnect`]
//! and connect again. Readers observe the machine through [`SessionReader`].
//!
//! [`schedule_reconnect`]: SessionManager::schedule_reconnect

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use certrelay_core::current_unix_timestamp_ms;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::credential_store::{CredentialStore, CredentialWriter};
use crate::messaging_client::{
    AuthState, ClientIdentity, ConnectionConfig, ConnectionEvent, DisconnectCause,
    MessagingConnector, SharedMessagingHandle,
};
use crate::qr_renderer::QrRenderer;
use crate::version_resolver::VersionResolver;


const MAX_BACKOFF_EXPONENT: u32 = 6;
const BACKOFF_JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SessionState` values.
pub enum SessionState {
    Disconnected,
    Connecting,
    PairingRequired,
    Connected,
    LoggedOut,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::PairingRequired => "pairing_required",
            Self::Connected => "connected",
            Self::LoggedOut => "logged_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Delay applied before each reconnect.
///
/// With no `max_delay` every reconnect waits `base_delay`. With a cap the
/// delay doubles per consecutive failed attempt, gains up to 20% jitter, and
/// never exceeds the cap.
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
}

impl ReconnectPolicy {
    pub fn fixed(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: None,
        }
    }

    pub fn capped(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: Some(max_delay.max(base_delay)),
        }
    }

    /// `attempt` counts consecutive reconnects since the last successful open, from 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(max_delay) = self.max_delay else {
            return self.base_delay;
        };
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let scaled = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(max_delay);
        let jitter = scaled.mul_f64(rand::thread_rng().gen_range(0.0..=BACKOFF_JITTER_RATIO));
        scaled.saturating_add(jitter).min(max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `SessionManagerConfig` used across Certrelay components.
pub struct SessionManagerConfig {
    pub client_identity: ClientIdentity,
    pub reconnect: ReconnectPolicy,
    /// Hold after the connection opens before readiness is declared.
    pub stabilize_delay: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            client_identity: ClientIdentity::default(),
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(5_000)),
            stabilize_delay: Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Default)]
struct SessionStats {
    connect_attempts: u64,
    reconnects_scheduled: u64,
    consecutive_reconnects: u32,
    last_disconnect_cause: Option<DisconnectCause>,
    connected_since_unix_ms: Option<u64>,
    last_pairing_challenge_unix_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Point-in-time view of the session, served by the status endpoint.
pub struct SessionStatusSnapshot {
    pub state: SessionState,
    pub ready: bool,
    pub handle_present: bool,
    pub connect_attempts: u64,
    pub reconnects_scheduled: u64,
    pub last_disconnect_cause: Option<DisconnectCause>,
    pub connected_since_unix_ms: Option<u64>,
    pub last_pairing_challenge_unix_ms: Option<u64>,
}

struct SessionShared {
    handle: RwLock<Option<SharedMessagingHandle>>,
    ready: AtomicBool,
    connecting: AtomicBool,
    state_tx: watch::Sender<SessionState>,
    stats: Mutex<SessionStats>,
}

impl SessionShared {
    fn new() -> Self {
        let (state_tx, _state_rx) = watch::channel(SessionState::Disconnected);
        Self {
            handle: RwLock::new(None),
            ready: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            state_tx,
            stats: Mutex::new(SessionStats::default()),
        }
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "session state changed");
        }
    }

    fn replace_handle(&self, handle: SharedMessagingHandle) {
        let mut guard = match self.handle.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(handle);
    }

    fn current_handle(&self) -> Option<SharedMessagingHandle> {
        let guard = match self.handle.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    fn stats(&self) -> MutexGuard<'_, SessionStats> {
        lock_or_recover(&self.stats)
    }

    fn snapshot(&self) -> SessionStatusSnapshot {
        let handle_present = self.current_handle().is_some();
        let stats = self.stats();
        SessionStatusSnapshot {
            state: self.state(),
            ready: self.ready.load(Ordering::SeqCst),
            handle_present,
            connect_attempts: stats.connect_attempts,
            reconnects_scheduled: stats.reconnects_scheduled,
            last_disconnect_cause: stats.last_disconnect_cause.clone(),
            connected_since_unix_ms: stats.connected_since_unix_ms,
            last_pairing_challenge_unix_ms: stats.last_pairing_challenge_unix_ms,
        }
    }
}

#[derive(Clone)]
/// Read-only view of the session handed to request handlers.
pub struct SessionReader {
    shared: Arc<SessionShared>,
}

impl SessionReader {
    /// Current connection handle, kept after a close until the next connect replaces it.
    pub fn current_handle(&self) -> Option<SharedMessagingHandle> {
        self.shared.current_handle()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn status_snapshot(&self) -> SessionStatusSnapshot {
        self.shared.snapshot()
    }
}

/// Result of one [`SessionManager::connect`] call.
pub enum ConnectOutcome {
    /// A new connection was opened; its events arrive on the receiver.
    Started(mpsc::UnboundedReceiver<ConnectionEvent>),
    AlreadyConnecting,
    LoggedOut,
    Failed(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What the driver does after handling one connection event.
pub enum SessionTransition {
    Continue,
    Reconnect(DisconnectCause),
    Halt,
}

/// Owns the messaging connection and its reconnect policy.
pub struct SessionManager {
    config: SessionManagerConfig,
    connector: Arc<dyn MessagingConnector>,
    credential_store: Arc<dyn CredentialStore>,
    version_resolver: Arc<dyn VersionResolver>,
    qr_renderer: Arc<dyn QrRenderer>,
    shared: Arc<SessionShared>,
    credential_writer: Mutex<Option<CredentialWriter>>,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        connector: Arc<dyn MessagingConnector>,
        credential_store: Arc<dyn CredentialStore>,
        version_resolver: Arc<dyn VersionResolver>,
        qr_renderer: Arc<dyn QrRenderer>,
    ) -> Self {
        Self {
            config,
            connector,
            credential_store,
            version_resolver,
            qr_renderer,
            shared: Arc::new(SessionShared::new()),
            credential_writer: Mutex::new(None),
        }
    }

    pub fn reader(&self) -> SessionReader {
        SessionReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Opens a new connection unless one is already being opened.
    ///
    /// A concurrent second call returns [`ConnectOutcome::AlreadyConnecting`]
    /// without side effects. After a logged-out close every call is refused.
    pub async fn connect(&self) -> ConnectOutcome {
        if self.shared.state() == SessionState::LoggedOut {
            return ConnectOutcome::LoggedOut;
        }
        if self.shared.connecting.swap(true, Ordering::SeqCst) {
            debug!("connect requested while a connect sequence is running");
            return ConnectOutcome::AlreadyConnecting;
        }

        self.shared.set_state(SessionState::Connecting);
        let attempt = {
            let mut stats = self.shared.stats();
            stats.connect_attempts = stats.connect_attempts.saturating_add(1);
            stats.connect_attempts
        };
        info!(attempt, "connecting messaging session");

        match self.open_connection().await {
            Ok(events) => ConnectOutcome::Started(events),
            Err(error) => {
                self.shared.connecting.store(false, Ordering::SeqCst);
                ConnectOutcome::Failed(error)
            }
        }
    }

    async fn open_connection(&self) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>> {
        let auth: AuthState = self.credential_store.load().await.with_context(|| {
            format!(
                "failed to load credentials from {}",
                self.credential_store.location()
            )
        })?;
        let resolved = self.version_resolver.latest_version().await;
        if let Some(resolve_error) = resolved.error.as_deref() {
            warn!(
                fallback_version = %resolved.version,
                error = resolve_error,
                "latest protocol version unavailable; using fallback"
            );
        }
        info!(
            version = %resolved.version,
            is_latest = resolved.is_latest,
            registered = auth.is_registered(),
            "opening messaging connection"
        );

        let opened = self
            .connector
            .open(ConnectionConfig {
                auth,
                version: resolved.version,
                client_identity: self.config.client_identity.clone(),
            })
            .await
            .context("failed to open messaging connection")?;
        self.shared.replace_handle(opened.handle);
        Ok(opened.events)
    }

    /// Applies one connection event to the session state.
    pub async fn handle_event(&self, event: ConnectionEvent) -> SessionTransition {
        match event {
            ConnectionEvent::CredentialsUpdated(state) => {
                self.persist_credentials(state);
                SessionTransition::Continue
            }
            ConnectionEvent::PairingChallenge(challenge) => {
                self.shared.set_state(SessionState::PairingRequired);
                self.shared.stats().last_pairing_challenge_unix_ms =
                    Some(current_unix_timestamp_ms());
                info!("pairing required; scan the QR code to link this device");
                self.qr_renderer.render(&challenge);
                SessionTransition::Continue
            }
            ConnectionEvent::Connecting => {
                self.shared.set_state(SessionState::Connecting);
                SessionTransition::Continue
            }
            ConnectionEvent::Open => {
                self.shared.connecting.store(false, Ordering::SeqCst);
                if !self.config.stabilize_delay.is_zero() {
                    debug!(
                        stabilize_delay_ms = self.config.stabilize_delay.as_millis() as u64,
                        "connection open; waiting before declaring readiness"
                    );
                    tokio::time::sleep(self.config.stabilize_delay).await;
                }
                self.shared.ready.store(true, Ordering::SeqCst);
                self.shared.set_state(SessionState::Connected);
                {
                    let mut stats = self.shared.stats();
                    stats.consecutive_reconnects = 0;
                    stats.connected_since_unix_ms = Some(current_unix_timestamp_ms());
                }
                info!("messaging session connected");
                SessionTransition::Continue
            }
            ConnectionEvent::Closed(cause) => self.on_closed(cause),
        }
    }

    fn on_closed(&self, cause: DisconnectCause) -> SessionTransition {
        self.shared.ready.store(false, Ordering::SeqCst);
        self.shared.connecting.store(false, Ordering::SeqCst);
        {
            let mut stats = self.shared.stats();
            stats.last_disconnect_cause = Some(cause.clone());
            stats.connected_since_unix_ms = None;
        }

        if cause.is_terminal() {
            self.shared.set_state(SessionState::LoggedOut);
            error!(
                credential_dir = %self.credential_store.location(),
                "messaging session logged out; delete the credential directory and restart to pair again"
            );
            return SessionTransition::Halt;
        }

        self.shared.set_state(SessionState::Disconnected);
        warn!(
            cause = %cause,
            status_code = cause.status_code(),
            "messaging connection closed"
        );
        SessionTransition::Reconnect(cause)
    }

    fn persist_credentials(&self, state: AuthState) {
        let mut writer = lock_or_recover(&self.credential_writer);
        writer
            .get_or_insert_with(|| CredentialWriter::spawn(Arc::clone(&self.credential_store)))
            .submit(state);
    }

    /// Waits out the reconnect delay. Returns false when shutdown arrived first.
    async fn schedule_reconnect(
        &self,
        cause: &DisconnectCause,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> bool {
        let attempt = {
            let mut stats = self.shared.stats();
            stats.reconnects_scheduled = stats.reconnects_scheduled.saturating_add(1);
            stats.consecutive_reconnects = stats.consecutive_reconnects.saturating_add(1);
            stats.consecutive_reconnects
        };
        let delay = self.config.reconnect.delay_for_attempt(attempt);
        info!(
            cause = %cause,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        tokio::select! {
            _ = shutdown => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn drive_connection(
        &self,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionTransition {
        loop {
            let event = tokio::select! {
                _ = &mut *shutdown => return SessionTransition::Halt,
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => event,
                    None => {
                        debug!("connection event channel closed");
                        ConnectionEvent::Closed(DisconnectCause::ConnectionLost)
                    }
                },
            };
            let transition = tokio::select! {
                _ = &mut *shutdown => return SessionTransition::Halt,
                transition = self.handle_event(event) => transition,
            };
            if transition != SessionTransition::Continue {
                return transition;
            }
        }
    }

    async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => {
                    debug!("shutdown requested during connect sequence");
                    self.shared.connecting.store(false, Ordering::SeqCst);
                    break;
                }
                outcome = self.connect() => outcome,
            };
            let transition = match outcome {
                ConnectOutcome::Started(events) => {
                    self.drive_connection(events, &mut shutdown).await
                }
                ConnectOutcome::AlreadyConnecting => {
                    SessionTransition::Reconnect(DisconnectCause::Other {
                        status_code: None,
                        detail: "connect sequence already running".to_string(),
                    })
                }
                ConnectOutcome::LoggedOut => SessionTransition::Halt,
                ConnectOutcome::Failed(error) => {
                    warn!(error = %format!("{error:#}"), "connect sequence failed");
                    self.on_closed(DisconnectCause::ConnectFailed {
                        detail: format!("{error:#}"),
                    })
                }
            };

            match transition {
                SessionTransition::Reconnect(cause) => {
                    if !self.schedule_reconnect(&cause, &mut shutdown).await {
                        break;
                    }
                }
                SessionTransition::Halt => break,
                SessionTransition::Continue => {}
            }
        }

        self.shared.ready.store(false, Ordering::SeqCst);
        let writer = lock_or_recover(&self.credential_writer).take();
        if let Some(writer) = writer {
            writer.finish().await;
        }
        debug!(state = self.shared.state().as_str(), "session driver stopped");
    }

    /// Spawns the driver task and returns its handle.
    pub fn start(self) -> SessionDriverHandle {
        let reader = self.reader();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        SessionDriverHandle {
            reader,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Running session driver.
pub struct SessionDriverHandle {
    reader: SessionReader,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionDriverHandle {
    pub fn reader(&self) -> SessionReader {
        self.reader.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
