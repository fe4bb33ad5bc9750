use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use certrelay_delivery::{DeliveryOrchestrator, DeliveryPacingConfig};
use certrelay_gateway::{run_relay_gateway_server, RelayGatewayServerConfig, RelayGatewayState};
use certrelay_session::{
    parse_protocol_version, BridgeConnector, BridgeConnectorConfig, ClientIdentity,
    FileCredentialStore, FixedVersionResolver, HttpVersionResolver, ReconnectPolicy,
    SessionManager, SessionManagerConfig, TerminalQrRenderer, VersionResolver,
};
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::cli_args::Cli;
use crate::validation::validate_cli;

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

pub fn session_config(cli: &Cli) -> SessionManagerConfig {
    let base_delay = Duration::from_millis(cli.reconnect_delay_ms);
    let reconnect = if cli.reconnect_max_delay_ms == 0 {
        ReconnectPolicy::fixed(base_delay)
    } else {
        ReconnectPolicy::capped(base_delay, Duration::from_millis(cli.reconnect_max_delay_ms))
    };
    SessionManagerConfig {
        client_identity: ClientIdentity::new(
            cli.client_name.trim(),
            cli.client_browser.trim(),
            cli.client_release.trim(),
        ),
        reconnect,
        stabilize_delay: Duration::from_millis(cli.stabilize_delay_ms),
    }
}

pub fn pacing_config(cli: &Cli) -> DeliveryPacingConfig {
    DeliveryPacingConfig {
        pre_delay_min: Duration::from_millis(cli.pre_delay_min_ms),
        pre_delay_max: Duration::from_millis(cli.pre_delay_max_ms),
        typing_pause: Duration::from_millis(cli.typing_pause_ms),
    }
}

fn bridge_config(cli: &Cli) -> BridgeConnectorConfig {
    BridgeConnectorConfig {
        base_url: cli.bridge_url.trim().to_string(),
        auth_token: cli
            .bridge_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string),
        request_timeout_ms: cli.bridge_timeout_ms,
    }
}

fn version_resolver(cli: &Cli) -> Result<Arc<dyn VersionResolver>> {
    match cli.protocol_version.as_deref() {
        Some(raw) => {
            let version = parse_protocol_version(raw).context("invalid --protocol-version")?;
            info!(version = %version, "using pinned protocol version");
            Ok(Arc::new(FixedVersionResolver::new(version)))
        }
        None => Ok(Arc::new(HttpVersionResolver::new(
            cli.version_url.trim(),
            cli.bridge_timeout_ms,
        )?)),
    }
}

/// Removes persisted credentials when `--reset-credentials` is set.
pub fn reset_credentials_if_requested(cli: &Cli, store: &FileCredentialStore) -> Result<bool> {
    if !cli.reset_credentials {
        return Ok(false);
    }
    let removed = store.clear()?;
    if removed {
        warn!(
            credential_dir = %store.dir().display(),
            "removed persisted credentials; a new QR pairing is required"
        );
    } else {
        info!(
            credential_dir = %store.dir().display(),
            "no persisted credentials to reset"
        );
    }
    Ok(removed)
}

/// Wires the session driver, the delivery orchestrator, and the HTTP server,
/// then runs until Ctrl-C.
pub async fn run_relay(cli: Cli) -> Result<()> {
    validate_cli(&cli)?;

    let store = FileCredentialStore::new(cli.auth_dir.clone());
    reset_credentials_if_requested(&cli, &store)?;

    let connector = BridgeConnector::new(bridge_config(&cli))?;
    let manager = SessionManager::new(
        session_config(&cli),
        Arc::new(connector),
        Arc::new(store),
        version_resolver(&cli)?,
        Arc::new(TerminalQrRenderer),
    );
    let mut driver = manager.start();
    let reader = driver.reader();

    let orchestrator = DeliveryOrchestrator::new(Arc::new(reader.clone()), pacing_config(&cli));
    let state = Arc::new(RelayGatewayState::new(reader, orchestrator));
    let server_config = RelayGatewayServerConfig {
        bind_host: cli.bind_host.clone(),
        port: cli.port,
    };

    let served = run_relay_gateway_server(server_config, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await;

    driver.shutdown().await;
    served
}
