use anyhow::{bail, Context, Result};
use certrelay_session::parse_protocol_version;
use reqwest::Url;

use crate::cli_args::Cli;

/// Checks flag combinations clap cannot express.
pub fn validate_cli(cli: &Cli) -> Result<()> {
    if cli.port == 0 {
        bail!("--port must be greater than 0");
    }
    if cli.pre_delay_min_ms > cli.pre_delay_max_ms {
        bail!(
            "--pre-delay-min-ms ({}) must not exceed --pre-delay-max-ms ({})",
            cli.pre_delay_min_ms,
            cli.pre_delay_max_ms
        );
    }
    if cli.reconnect_delay_ms == 0 {
        bail!("--reconnect-delay-ms must be greater than 0");
    }
    if cli.reconnect_max_delay_ms != 0 && cli.reconnect_max_delay_ms < cli.reconnect_delay_ms {
        bail!(
            "--reconnect-max-delay-ms must be 0 or at least --reconnect-delay-ms ({})",
            cli.reconnect_delay_ms
        );
    }
    validate_http_url("--bridge-url", &cli.bridge_url)?;
    validate_http_url("--version-url", &cli.version_url)?;
    for (flag, value) in [
        ("--client-name", &cli.client_name),
        ("--client-browser", &cli.client_browser),
        ("--client-release", &cli.client_release),
    ] {
        if value.trim().is_empty() {
            bail!("{flag} cannot be empty");
        }
    }
    if let Some(raw) = cli.protocol_version.as_deref() {
        parse_protocol_version(raw).context("invalid --protocol-version")?;
    }
    Ok(())
}

fn validate_http_url(flag: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw.trim()).with_context(|| format!("{flag} '{raw}' is not a valid url"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{flag} must use http or https, got '{}'", url.scheme());
    }
    Ok(())
}
