//! # Blob Store
//!
//! Object storage addressed by key. The conversion pipeline downloads uploads
//! from it and writes converted files back; the recordings endpoint hands out
//! time-limited signed read URLs.
//!
//! `FsBlobStore` keeps objects under a root directory. Signed URLs carry an
//! expiry and an HMAC-SHA256 over `key:expiry`, so whatever serves the files
//! can check them without a database lookup.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the contents of a local file under `key`. Returns the stored size.
    async fn put_file(&self, key: &str, source: &Path) -> Result<u64>;

    /// Read `range` bytes of the object.
    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>>;

    /// Copy the whole object to a local file.
    async fn download_to(&self, key: &str, destination: &Path) -> Result<u64>;

    /// URL granting read access to `key` until `ttl` from now.
    fn signed_read_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
    signing_secret: Vec<u8>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str, signing_secret: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_secret: signing_secret.as_bytes().to_vec(),
        }
    }

    /// Map a key onto the root, refusing anything that could escape it.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob key: {:?}", key);
        }
        Ok(self.root.join(relative))
    }

    fn signature(&self, key: &str, expires: i64) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_secret)
            .map_err(|e| anyhow!("invalid signing secret: {}", e))?;
        mac.update(format!("{}:{}", key, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a signature produced by `signed_read_url`.
    #[cfg(test)]
    pub fn verify_signature(&self, key: &str, expires: i64, signature: &str, now: chrono::DateTime<Utc>) -> bool {
        if now.timestamp() > expires {
            return false;
        }
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.signing_secret) else {
            return false;
        };
        mac.update(format!("{}:{}", key, expires).as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put_file(&self, key: &str, source: &Path) -> Result<u64> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let copied = tokio::fs::copy(source, &target)
            .await
            .with_context(|| format!("failed to store blob {}", key))?;
        Ok(copied)
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>> {
        if range.end < range.start {
            bail!("invalid range {:?}", range);
        }
        let path = self.path_for(key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("blob not found: {}", key))?;
        let len = file.metadata().await?.len();
        let start = range.start.min(len);
        let end = range.end.min(len);
        file.seek(std::io::SeekFrom::Start(start)).await?;

        let mut buf = Vec::with_capacity((end - start) as usize);
        file.take(end - start).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn download_to(&self, key: &str, destination: &Path) -> Result<u64> {
        let path = self.path_for(key)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let copied = tokio::fs::copy(&path, destination)
            .await
            .with_context(|| format!("failed to fetch blob {}", key))?;
        Ok(copied)
    }

    fn signed_read_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.path_for(key)?;
        let ttl = chrono::Duration::from_std(ttl)?;
        let expires = (Utc::now() + ttl).timestamp();
        let signature = self.signature(key, expires)?;
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.public_base_url, key, expires, signature
        ))
    }
}
