use std::path::PathBuf;

use certrelay_session::DEFAULT_VERSION_URL;
use clap::{ArgAction, Parser};

fn parse_port(value: &str) -> Result<u16, String> {
    let parsed = value
        .parse::<u16>()
        .map_err(|error| format!("failed to parse port: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "certrelay",
    about = "Relays certificate PDFs to phone numbers over a linked messaging session",
    version
)]
/// Public struct `Cli` used across Certrelay components.
pub struct Cli {
    #[arg(
        long,
        env = "PORT",
        default_value_t = 3000,
        value_parser = parse_port,
        help = "HTTP listener port"
    )]
    pub port: u16,

    #[arg(
        long = "bind-host",
        env = "CERTRELAY_BIND_HOST",
        default_value = "0.0.0.0",
        help = "HTTP listener IP address"
    )]
    pub bind_host: String,

    #[arg(
        long = "auth-dir",
        env = "CERTRELAY_AUTH_DIR",
        default_value = "./auth",
        help = "Directory holding the persisted session credentials"
    )]
    pub auth_dir: PathBuf,

    #[arg(
        long = "reset-credentials",
        env = "CERTRELAY_RESET_CREDENTIALS",
        action = ArgAction::SetTrue,
        help = "Delete persisted credentials before connecting (forces a new QR pairing)"
    )]
    pub reset_credentials: bool,

    #[arg(
        long = "bridge-url",
        env = "CERTRELAY_BRIDGE_URL",
        default_value = "http://127.0.0.1:8085",
        help = "Base URL of the multi-device messaging bridge"
    )]
    pub bridge_url: String,

    #[arg(
        long = "bridge-token",
        env = "CERTRELAY_BRIDGE_TOKEN",
        hide_env_values = true,
        help = "Bearer token sent to the messaging bridge"
    )]
    pub bridge_token: Option<String>,

    #[arg(
        long = "bridge-timeout-ms",
        env = "CERTRELAY_BRIDGE_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Per-request HTTP timeout toward the bridge and the version source"
    )]
    pub bridge_timeout_ms: u64,

    #[arg(
        long = "version-url",
        env = "CERTRELAY_VERSION_URL",
        default_value = DEFAULT_VERSION_URL,
        help = "JSON document publishing the latest protocol version"
    )]
    pub version_url: String,

    #[arg(
        long = "protocol-version",
        env = "CERTRELAY_PROTOCOL_VERSION",
        help = "Pin the protocol version (major.minor.patch) instead of fetching it"
    )]
    pub protocol_version: Option<String>,

    #[arg(
        long = "client-name",
        env = "CERTRELAY_CLIENT_NAME",
        default_value = "CertificateBot",
        help = "Client name announced to the network"
    )]
    pub client_name: String,

    #[arg(
        long = "client-browser",
        env = "CERTRELAY_CLIENT_BROWSER",
        default_value = "Chrome",
        help = "Client browser announced to the network"
    )]
    pub client_browser: String,

    #[arg(
        long = "client-release",
        env = "CERTRELAY_CLIENT_RELEASE",
        default_value = "1.0",
        help = "Client release announced to the network"
    )]
    pub client_release: String,

    #[arg(
        long = "reconnect-delay-ms",
        env = "CERTRELAY_RECONNECT_DELAY_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Delay before reconnecting after a non-terminal close"
    )]
    pub reconnect_delay_ms: u64,

    #[arg(
        long = "reconnect-max-delay-ms",
        env = "CERTRELAY_RECONNECT_MAX_DELAY_MS",
        default_value_t = 0,
        help = "When greater than 0, back off exponentially with jitter up to this delay"
    )]
    pub reconnect_max_delay_ms: u64,

    #[arg(
        long = "stabilize-delay-ms",
        env = "CERTRELAY_STABILIZE_DELAY_MS",
        default_value_t = 2_000,
        help = "Hold after the connection opens before accepting deliveries"
    )]
    pub stabilize_delay_ms: u64,

    #[arg(
        long = "pre-delay-min-ms",
        env = "CERTRELAY_PRE_DELAY_MIN_MS",
        default_value_t = 1_000,
        help = "Lower bound of the random delay before each delivery"
    )]
    pub pre_delay_min_ms: u64,

    #[arg(
        long = "pre-delay-max-ms",
        env = "CERTRELAY_PRE_DELAY_MAX_MS",
        default_value_t = 3_000,
        help = "Upper bound of the random delay before each delivery (0 disables it)"
    )]
    pub pre_delay_max_ms: u64,

    #[arg(
        long = "typing-pause-ms",
        env = "CERTRELAY_TYPING_PAUSE_MS",
        default_value_t = 2_500,
        help = "Pause between the composing presence and the document send"
    )]
    pub typing_pause_ms: u64,
}
