//! Manifest fetching over http(s) and the local filesystem

use crate::error::{PluginError, PluginResult};
use crate::signature::SIGNATURE_HEADER;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client as HttpClient, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default request timeout in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default manifest size cap
pub const DEFAULT_MAX_MANIFEST_BYTES: usize = 64 * 1024;

/// Extension of the detached signature next to a `file://` manifest
const SIGNATURE_EXTENSION: &str = "sig";

/// Raw manifest as served
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedManifest {
    pub bytes: Vec<u8>,
    pub etag: Option<String>,
    /// Base64 detached signature, when the publisher provided one
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fresh(FetchedManifest),
    /// The server confirmed the cached copy with the given etag is current
    NotModified,
}

/// Retrieves manifest bytes for a URL
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// `etag` is the validator of a cached copy, if any
    async fn fetch(&self, url: &Url, etag: Option<&str>) -> PluginResult<FetchOutcome>;
}

/// Fetcher backed by reqwest and tokio::fs
#[derive(Debug, Clone)]
pub struct DefaultFetcher {
    http_client: HttpClient,
    max_bytes: usize,
}

impl DefaultFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> PluginResult<Self> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .user_agent(concat!("itemdeck-plugins/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http_client,
            max_bytes,
        })
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn too_large(&self, url: &Url) -> PluginError {
        PluginError::Fetch(format!(
            "Manifest at {} exceeds the {} byte limit",
            url, self.max_bytes
        ))
    }

    async fn fetch_http(&self, url: &Url, etag: Option<&str>) -> PluginResult<FetchOutcome> {
        let mut request = self.http_client.get(url.clone());
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => return Ok(FetchOutcome::NotModified),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(PluginError::NotFound(url.to_string()));
            }
            status if !status.is_success() => {
                return Err(PluginError::Fetch(format!("{} returned HTTP {}", url, status)));
            }
            _ => {}
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(self.too_large(url));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG.as_str());
        let signature = header(SIGNATURE_HEADER);

        let mut bytes = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(self.too_large(url));
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchOutcome::Fresh(FetchedManifest {
            bytes,
            etag,
            signature,
        }))
    }

    async fn fetch_file(&self, url: &Url) -> PluginResult<FetchOutcome> {
        let path = url
            .to_file_path()
            .map_err(|_| PluginError::Fetch(format!("{} is not a local file path", url)))?;

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PluginError::NotFound(url.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if metadata.len() > self.max_bytes as u64 {
            return Err(self.too_large(url));
        }

        let bytes = tokio::fs::read(&path).await?;
        let signature = read_sidecar_signature(&path).await?;

        Ok(FetchOutcome::Fresh(FetchedManifest {
            bytes,
            etag: None,
            signature,
        }))
    }
}

async fn read_sidecar_signature(manifest: &std::path::Path) -> PluginResult<Option<String>> {
    let mut sidecar: PathBuf = manifest.to_path_buf();
    let extension = match manifest.extension() {
        Some(ext) => format!("{}.{}", ext.to_string_lossy(), SIGNATURE_EXTENSION),
        None => SIGNATURE_EXTENSION.to_string(),
    };
    sidecar.set_extension(extension);

    match tokio::fs::read_to_string(&sidecar).await {
        Ok(signature) => Ok(Some(signature.trim().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ManifestFetcher for DefaultFetcher {
    async fn fetch(&self, url: &Url, etag: Option<&str>) -> PluginResult<FetchOutcome> {
        tracing::debug!(url = %url, "Fetching manifest");
        match url.scheme() {
            "http" | "https" => self.fetch_http(url, etag).await,
            "file" => self.fetch_file(url).await,
            other => Err(PluginError::Fetch(format!(
                "Unsupported manifest URL scheme '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(max_bytes: usize) -> DefaultFetcher {
        DefaultFetcher::new(Duration::from_secs(5), max_bytes).unwrap()
    }

    #[tokio::test]
    async fn test_file_fetch_with_sidecar_signature() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("plugin.json");
        tokio::fs::write(&manifest, br#"{"id":"org.example.local"}"#).await.unwrap();
        tokio::fs::write(dir.path().join("plugin.json.sig"), "c2ln\n").await.unwrap();

        let url = Url::from_file_path(&manifest).unwrap();
        let FetchOutcome::Fresh(fetched) = fetcher(1024).fetch(&url, None).await.unwrap() else {
            panic!("expected fresh manifest");
        };
        assert_eq!(fetched.bytes, br#"{"id":"org.example.local"}"#);
        assert_eq!(fetched.signature.as_deref(), Some("c2ln"));
        assert!(fetched.etag.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("absent.json")).unwrap();

        let err = fetcher(1024).fetch(&url, None).await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_oversized_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("big.json");
        tokio::fs::write(&manifest, vec![b' '; 2048]).await.unwrap();

        let url = Url::from_file_path(&manifest).unwrap();
        let err = fetcher(1024).fetch(&url, None).await.unwrap_err();
        assert!(matches!(err, PluginError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let url = Url::parse("ftp://example.org/plugin.json").unwrap();
        let err = fetcher(1024).fetch(&url, None).await.unwrap_err();
        assert!(matches!(err, PluginError::Fetch(_)));
    }
}
