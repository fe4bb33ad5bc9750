//! Protocol version resolution, queried once per connect sequence.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::messaging_client::ProtocolVersion;

/// Published JSON document listing the latest web-client protocol version.
pub const DEFAULT_VERSION_URL: &str =
    "https://raw.githubusercontent.com/WhiskeySockets/Baileys/master/src/Defaults/baileys-version.json";

/// Used whenever the published version cannot be fetched.
pub const FALLBACK_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion([2, 3000, 1_015_901_307]);

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of a version lookup.
pub struct ResolvedVersion {
    pub version: ProtocolVersion,
    pub is_latest: bool,
    pub error: Option<String>,
}

/// Resolves the protocol version to announce when opening a connection.
///
/// Implementations never fail the connect sequence: a lookup failure yields a
/// fallback version with `is_latest = false`.
#[async_trait]
pub trait VersionResolver: Send + Sync {
    async fn latest_version(&self) -> ResolvedVersion;
}

#[derive(Debug, Clone)]
/// Always reports the same version; used when the operator pins one.
pub struct FixedVersionResolver {
    version: ProtocolVersion,
}

impl FixedVersionResolver {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }
}

#[async_trait]
impl VersionResolver for FixedVersionResolver {
    async fn latest_version(&self) -> ResolvedVersion {
        ResolvedVersion {
            version: self.version,
            is_latest: true,
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublishedVersionDocument {
    version: Vec<u32>,
}

#[derive(Debug, Clone)]
/// Fetches the published version document over HTTP.
pub struct HttpVersionResolver {
    http: reqwest::Client,
    url: String,
    fallback: ProtocolVersion,
}

impl HttpVersionResolver {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .user_agent("certrelay-version-resolver")
            .build()
            .context("failed to create version resolver http client")?;
        Ok(Self {
            http,
            url: url.into(),
            fallback: FALLBACK_PROTOCOL_VERSION,
        })
    }

    pub fn with_fallback(mut self, fallback: ProtocolVersion) -> Self {
        self.fallback = fallback;
        self
    }

    async fn fetch(&self) -> Result<ProtocolVersion> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("failed to fetch protocol version from {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!(
                "protocol version source {} returned status {}",
                self.url,
                status.as_u16()
            );
        }
        let document = response
            .json::<PublishedVersionDocument>()
            .await
            .context("failed to decode protocol version document")?;
        parse_version_triple(&document.version)
    }
}

#[async_trait]
impl VersionResolver for HttpVersionResolver {
    async fn latest_version(&self) -> ResolvedVersion {
        match self.fetch().await {
            Ok(version) => ResolvedVersion {
                version,
                is_latest: true,
                error: None,
            },
            Err(error) => ResolvedVersion {
                version: self.fallback,
                is_latest: false,
                error: Some(format!("{error:#}")),
            },
        }
    }
}

/// Parses `major.minor.patch` (as typed on a command line).
pub fn parse_protocol_version(raw: &str) -> Result<ProtocolVersion> {
    let parts = raw
        .trim()
        .split('.')
        .map(|part| {
            part.parse::<u32>()
                .with_context(|| format!("invalid protocol version component '{part}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    parse_version_triple(&parts)
}

fn parse_version_triple(parts: &[u32]) -> Result<ProtocolVersion> {
    match parts {
        [major, minor, patch] => Ok(ProtocolVersion([*major, *minor, *patch])),
        _ => Err(anyhow!(
            "protocol version must have exactly 3 components, found {}",
            parts.len()
        )),
    }
}
