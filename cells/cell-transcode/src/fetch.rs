//! Resolving a transcode source to bytes.
//!
//! Locators may be `http(s)://` URLs, `file://` URLs, bare filesystem paths,
//! or `data:` URIs carrying base64.

use std::path::Path;

use cell_transcode_proto::Source;
use tracing::debug;
use url::Url;

use crate::codec;
use crate::config::WorkerConfig;
use crate::error::TranscodeError;

/// Turns sources into bytes. One per worker; cheap to share.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl Fetcher {
    pub fn new(config: &WorkerConfig) -> Result<Self, TranscodeError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| TranscodeError::Fetch(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_bytes: config.max_fetch_bytes,
        })
    }

    /// Bytes of a source: inline bytes as-is, locators fetched.
    pub async fn resolve(&self, source: Source) -> Result<Vec<u8>, TranscodeError> {
        match source {
            Source::Binary(binary) => Ok(binary.into_bytes()),
            Source::Locator(locator) => self.fetch(&locator).await,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(len = locator.len()))]
    pub async fn fetch(&self, locator: &str) -> Result<Vec<u8>, TranscodeError> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(TranscodeError::Fetch("empty locator".to_string()));
        }

        if locator.starts_with("data:") {
            return codec::decode_base64(locator);
        }

        match Url::parse(locator) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => self.fetch_http(url).await,
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| TranscodeError::Fetch(format!("not a local file URL: {url}")))?;
                self.read_file(&path).await
            }
            // Single-letter schemes are Windows drive letters, i.e. paths
            Ok(url) if url.scheme().len() > 1 => Err(TranscodeError::Fetch(format!(
                "unsupported locator scheme `{}`",
                url.scheme()
            ))),
            _ => self.read_file(Path::new(locator)).await,
        }
    }

    async fn fetch_http(&self, url: Url) -> Result<Vec<u8>, TranscodeError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TranscodeError::Fetch(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranscodeError::Fetch(format!("{url}: server responded {status}")));
        }

        if let Some(len) = response.content_length()
            && len > self.max_bytes
        {
            return Err(self.too_large(url.as_str(), len));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TranscodeError::Fetch(format!("{url}: {e}")))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(self.too_large(url.as_str(), (body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(%url, len = body.len(), "fetched remote source");
        Ok(body)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, TranscodeError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| TranscodeError::Fetch(format!("{}: {e}", path.display())))?;
        if !metadata.is_file() {
            return Err(TranscodeError::Fetch(format!(
                "{}: not a regular file",
                path.display()
            )));
        }
        if metadata.len() > self.max_bytes {
            return Err(self.too_large(&path.display().to_string(), metadata.len()));
        }

        tokio::fs::read(path)
            .await
            .map_err(|e| TranscodeError::Fetch(format!("{}: {e}", path.display())))
    }

    fn too_large(&self, what: &str, len: u64) -> TranscodeError {
        TranscodeError::Fetch(format!(
            "{what}: {len} bytes exceeds the {} byte fetch limit",
            self.max_bytes
        ))
    }
}
