// Identity document fetchers

use super::{IdUrl, IdentityError, MAX_IDENTITY_SIZE};
use crate::dht::PeerDirectory;
use async_trait::async_trait;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Source of raw identity documents.
#[async_trait]
pub trait IdentityFetcher: Send + Sync {
    async fn fetch(&self, url: &IdUrl) -> Result<Vec<u8>, IdentityError>;
}

/// Plain HTTP GET of the idurl, run on the blocking pool.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}

fn http_get(url: &str, timeout: Duration) -> anyhow::Result<Vec<u8>> {
    let response = ureq::get(url).timeout(timeout).call()?;
    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_IDENTITY_SIZE as u64 + 1)
        .read_to_end(&mut body)?;
    if body.len() > MAX_IDENTITY_SIZE {
        anyhow::bail!("document larger than {} bytes", MAX_IDENTITY_SIZE);
    }
    Ok(body)
}

#[async_trait]
impl IdentityFetcher for HttpFetcher {
    async fn fetch(&self, url: &IdUrl) -> Result<Vec<u8>, IdentityError> {
        let target = url.as_str().to_string();
        let timeout = self.timeout;
        let result = tokio::task::spawn_blocking(move || http_get(&target, timeout))
            .await
            .map_err(|e| IdentityError::FetchFailed {
                idurl: url.clone(),
                reason: e.to_string(),
            })?;
        result.map_err(|e| IdentityError::FetchFailed {
            idurl: url.clone(),
            reason: e.to_string(),
        })
    }
}

/// Reads published documents from a [`PeerDirectory`].
#[derive(Clone)]
pub struct DirectoryFetcher {
    directory: Arc<dyn PeerDirectory>,
}

impl DirectoryFetcher {
    pub fn new(directory: Arc<dyn PeerDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl IdentityFetcher for DirectoryFetcher {
    async fn fetch(&self, url: &IdUrl) -> Result<Vec<u8>, IdentityError> {
        self.directory
            .lookup(url)
            .await
            .ok_or_else(|| IdentityError::FetchFailed {
                idurl: url.clone(),
                reason: "not published".to_string(),
            })
    }
}
