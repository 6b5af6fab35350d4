use crate::models::ImageMeta;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger backend unavailable: {0}")]
    Backend(String),
    #[error("corrupt ledger entry: {0}")]
    Corrupt(String),
}

/// An uploaded image keyed by the hash of its source bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAsset {
    pub hash: String,
    pub meta: ImageMeta,
    pub usage_count: u64,
    pub first_seen: DateTime<Utc>,
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait]
pub trait AssetLedger: Send + Sync {
    /// Returns the known asset for `hash` with its usage counter incremented.
    async fn claim(&self, hash: &str) -> Result<Option<ImageAsset>, LedgerError>;

    async fn record(&self, hash: &str, meta: &ImageMeta) -> Result<(), LedgerError>;

    /// Drops one reference to the asset stored at `remote_id` and returns how
    /// many are left; the entry goes away at zero. `None` when the ledger does
    /// not know the asset.
    async fn release(&self, remote_id: &str) -> Result<Option<u64>, LedgerError>;
}

#[derive(Default)]
pub struct MemoryLedger {
    assets: Mutex<HashMap<String, ImageAsset>>,
}

impl MemoryLedger {
    #[cfg(test)]
    pub async fn peek(&self, hash: &str) -> Option<ImageAsset> {
        self.assets.lock().await.get(hash).cloned()
    }
}

#[async_trait]
impl AssetLedger for MemoryLedger {
    async fn claim(&self, hash: &str) -> Result<Option<ImageAsset>, LedgerError> {
        let mut guard = self.assets.lock().await;
        Ok(guard.get_mut(hash).map(|asset| {
            asset.usage_count += 1;
            asset.clone()
        }))
    }

    async fn record(&self, hash: &str, meta: &ImageMeta) -> Result<(), LedgerError> {
        let mut guard = self.assets.lock().await;
        guard.insert(
            hash.to_string(),
            ImageAsset {
                hash: hash.to_string(),
                meta: meta.clone(),
                usage_count: 1,
                first_seen: Utc::now(),
            },
        );
        Ok(())
    }

    async fn release(&self, remote_id: &str) -> Result<Option<u64>, LedgerError> {
        let mut guard = self.assets.lock().await;
        let Some((hash, asset)) = guard
            .iter_mut()
            .find(|(_, asset)| asset.meta.remote_id == remote_id)
        else {
            return Ok(None);
        };
        asset.usage_count = asset.usage_count.saturating_sub(1);
        let remaining = asset.usage_count;
        if remaining == 0 {
            let hash = hash.clone();
            guard.remove(&hash);
        }
        Ok(Some(remaining))
    }
}

const ASSET_PREFIX: &str = "catalog:asset:";
const REMOTE_PREFIX: &str = "catalog:asset-remote:";

/// Ledger shared between service instances through Redis.
pub struct RedisLedger {
    client: redis::Client,
}

impl RedisLedger {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LedgerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| LedgerError::Backend(err.to_string()))
    }
}

#[async_trait]
impl AssetLedger for RedisLedger {
    async fn claim(&self, hash: &str) -> Result<Option<ImageAsset>, LedgerError> {
        let mut conn = self.connection().await?;
        let key = format!("{ASSET_PREFIX}{hash}");
        let raw: Option<String> = conn
            .get(&key)
            .await
            .map_err(|err| LedgerError::Backend(err.to_string()))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut asset: ImageAsset =
            serde_json::from_str(&raw).map_err(|err| LedgerError::Corrupt(err.to_string()))?;
        asset.usage_count += 1;
        let json =
            serde_json::to_string(&asset).map_err(|err| LedgerError::Corrupt(err.to_string()))?;
        let _: () = conn
            .set(&key, json)
            .await
            .map_err(|err| LedgerError::Backend(err.to_string()))?;
        Ok(Some(asset))
    }

    async fn record(&self, hash: &str, meta: &ImageMeta) -> Result<(), LedgerError> {
        let mut conn = self.connection().await?;
        let asset = ImageAsset {
            hash: hash.to_string(),
            meta: meta.clone(),
            usage_count: 1,
            first_seen: Utc::now(),
        };
        let json =
            serde_json::to_string(&asset).map_err(|err| LedgerError::Corrupt(err.to_string()))?;
        let _: () = conn
            .set(format!("{ASSET_PREFIX}{hash}"), json)
            .await
            .map_err(|err| LedgerError::Backend(err.to_string()))?;
        let _: () = conn
            .set(format!("{REMOTE_PREFIX}{}", meta.remote_id), hash)
            .await
            .map_err(|err| LedgerError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn release(&self, remote_id: &str) -> Result<Option<u64>, LedgerError> {
        let mut conn = self.connection().await?;
        let remote_key = format!("{REMOTE_PREFIX}{remote_id}");
        let hash: Option<String> = conn
            .get(&remote_key)
            .await
            .map_err(|err| LedgerError::Backend(err.to_string()))?;
        let Some(hash) = hash else {
            return Ok(None);
        };
        let asset_key = format!("{ASSET_PREFIX}{hash}");
        let raw: Option<String> = conn
            .get(&asset_key)
            .await
            .map_err(|err| LedgerError::Backend(err.to_string()))?;
        let mut asset: ImageAsset = match raw {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|err| LedgerError::Corrupt(err.to_string()))?
            }
            None => {
                let _: () = conn
                    .del(&remote_key)
                    .await
                    .map_err(|err| LedgerError::Backend(err.to_string()))?;
                return Ok(None);
            }
        };
        asset.usage_count = asset.usage_count.saturating_sub(1);
        if asset.usage_count == 0 {
            let _: () = conn
                .del(vec![asset_key, remote_key])
                .await
                .map_err(|err| LedgerError::Backend(err.to_string()))?;
        } else {
            let json = serde_json::to_string(&asset)
                .map_err(|err| LedgerError::Corrupt(err.to_string()))?;
            let _: () = conn
                .set(&asset_key, json)
                .await
                .map_err(|err| LedgerError::Backend(err.to_string()))?;
        }
        Ok(Some(asset.usage_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(remote_id: &str) -> ImageMeta {
        ImageMeta {
            url: format!("https://cdn.test/{remote_id}"),
            remote_id: remote_id.to_string(),
            signature: None,
            width: None,
            height: None,
            format: Some("png".into()),
            bytes: 42,
        }
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn memory_ledger_counts_reuse() {
        let ledger = MemoryLedger::default();
        assert!(ledger.claim("h1").await.unwrap().is_none());
        ledger.record("h1", &meta("catalog/a")).await.unwrap();
        let first = ledger.claim("h1").await.unwrap().expect("known");
        let second = ledger.claim("h1").await.unwrap().expect("known");
        assert_eq!(first.usage_count, 2);
        assert_eq!(second.usage_count, 3);
        assert_eq!(ledger.release("catalog/a").await.unwrap(), Some(2));
        assert_eq!(ledger.release("catalog/a").await.unwrap(), Some(1));
        assert!(ledger.peek("h1").await.is_some());
        assert_eq!(ledger.release("catalog/a").await.unwrap(), Some(0));
        assert!(ledger.claim("h1").await.unwrap().is_none());
        assert_eq!(ledger.release("catalog/a").await.unwrap(), None);
    }
}
