//! Terminal display of pairing challenges.

use anyhow::{Context, Result};
use qrcode::render::unicode;
use qrcode::QrCode;
use tracing::{info, warn};

/// Shows a pairing challenge to the human operator.
pub trait QrRenderer: Send + Sync {
    fn render(&self, challenge: &str);
}

#[derive(Debug, Clone, Default)]
/// Prints the challenge as a compact unicode QR code on stdout.
pub struct TerminalQrRenderer;

impl QrRenderer for TerminalQrRenderer {
    fn render(&self, challenge: &str) {
        match render_qr_to_string(challenge) {
            Ok(rendered) => {
                println!("\nscan this QR code with the messaging app to pair:\n");
                println!("{rendered}");
            }
            Err(error) => {
                warn!(
                    error = %format!("{error:#}"),
                    "failed to render pairing QR code"
                );
                info!(challenge, "pairing challenge (raw)");
            }
        }
    }
}

/// Renders `challenge` as dense half-block unicode, light-on-dark.
pub fn render_qr_to_string(challenge: &str) -> Result<String> {
    let code = QrCode::new(challenge.as_bytes())
        .context("failed to encode pairing challenge as QR code")?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}
