//! Filesystem content source

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::PathBuf;

use super::{ContentSource, Locator};

/// Reads inline content, `data:` URLs, `file://` URLs and plain paths.
///
/// Relative paths are resolved against `root` when one is set.
#[derive(Debug, Clone, Default)]
pub struct LocalSource {
    root: Option<PathBuf>,
}

impl LocalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn path_for(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

/// Decode a `data:[<mediatype>][;base64],<payload>` URL
fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let rest = url.strip_prefix("data:").context("Not a data URL")?;
    let (header, payload) = rest.split_once(',').context("Malformed data URL")?;
    if header.ends_with(";base64") {
        STANDARD
            .decode(payload.trim())
            .context("Invalid base64 payload in data URL")
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

#[async_trait]
impl ContentSource for LocalSource {
    async fn fetch(&self, locator: &Locator) -> Result<Vec<u8>> {
        let url = match locator {
            Locator::Inline(bytes) => return Ok(bytes.clone()),
            Locator::Url(url) => url,
        };

        if url.starts_with("data:") {
            return decode_data_url(url);
        }

        let path = match url.strip_prefix("file://") {
            Some(path) => PathBuf::from(path),
            None if url.contains("://") => anyhow::bail!("Unsupported locator: {}", url),
            None => self.path_for(url),
        };

        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}
