//! Network retrieval of model blobs.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use url::Url;

use crate::logging::redact_sensitive_text;
use crate::model_cache::sha256_hex;
use crate::model_registry::ModelDescriptor;

pub trait ModelFetcher: Send + Sync {
    /// Download the full blob for `descriptor`. Blocking.
    fn fetch(&self, descriptor: &ModelDescriptor) -> Result<Vec<u8>>;
}

/// Plain HTTP(S) GET with connect/request timeouts. No retries.
#[derive(Debug, Clone)]
pub struct HttpModelFetcher {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for HttpModelFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), Duration::from_secs(30 * 60))
    }
}

impl HttpModelFetcher {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl ModelFetcher for HttpModelFetcher {
    fn fetch(&self, descriptor: &ModelDescriptor) -> Result<Vec<u8>> {
        let key = &descriptor.key;
        let url = parse_source_url(&descriptor.source_url)
            .with_context(|| format!("Invalid source URL for model {key}"))?;
        let shown_url = redact_sensitive_text(url.as_str());

        info!(model = %key, url = %shown_url, "Downloading model");

        // The blocking client owns its own runtime; build it on the calling
        // (blocking) thread, never inside an async context.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .context("Failed to build HTTP client for model download")?;

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("Failed to start download for model {key}"))?;

        if !response.status().is_success() {
            bail!(
                "Download request for model {key} returned HTTP {}",
                response.status().as_u16()
            );
        }

        let mut bytes = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        response
            .copy_to(&mut bytes)
            .with_context(|| format!("Failed while downloading model {key} from {shown_url}"))?;

        if bytes.is_empty() {
            bail!("Download for model {key} returned an empty body");
        }

        verify_digest(descriptor, &bytes)?;

        info!(model = %key, bytes = bytes.len(), "Download complete");
        Ok(bytes)
    }
}

fn parse_source_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).context("URL does not parse")?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("unsupported URL scheme '{other}'"),
    }
}

pub(crate) fn verify_digest(descriptor: &ModelDescriptor, bytes: &[u8]) -> Result<()> {
    match &descriptor.sha256 {
        Some(expected) => {
            let actual = sha256_hex(bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                bail!(
                    "SHA256 mismatch for {}: expected {expected}, got {actual}",
                    descriptor.key
                );
            }
            info!(model = %descriptor.key, "Hash verified OK");
        }
        None => warn!(model = %descriptor.key, "No SHA256 hash configured, skipping verification"),
    }
    Ok(())
}
