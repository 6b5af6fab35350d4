use crate::config::StorageConfig;
use crate::http::build_client;
use crate::ledger::{AssetLedger, content_hash};
use crate::models::{Category, ImageMeta};
use async_trait::async_trait;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::Deserialize;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, warn};
use urlencoding::encode;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("cannot read local image: {0}")]
    Io(#[from] io::Error),
    #[error("upload request failed: {0}")]
    Request(String),
    #[error("invalid upload response: {0}")]
    InvalidResponse(String),
}

/// Where an image belongs in remote storage.
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub category: Category,
    pub slug: String,
    /// 0 for the primary image, 1..=3 for additional ones.
    pub position: usize,
    /// Content hash prefix; set when the object must never be rewritten.
    pub fingerprint: Option<String>,
}

const FINGERPRINT_LEN: usize = 12;

impl UploadContext {
    pub fn new(category: Category, name: &str, position: usize) -> Self {
        Self {
            category,
            slug: product_slug(name),
            position,
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, hash: &str) -> Self {
        self.fingerprint = Some(hash.get(..FINGERPRINT_LEN).unwrap_or(hash).to_string());
        self
    }

    /// Stable across runs so re-imports overwrite instead of piling up copies.
    /// With a fingerprint, each distinct content gets its own object.
    pub fn public_id(&self) -> String {
        let mut id = format!("catalog/{}/{}", self.category.slug(), self.slug);
        if let Some(fingerprint) = &self.fingerprint {
            id.push('-');
            id.push_str(fingerprint);
        }
        if self.position > 0 {
            id.push_str(&format!("_{}", self.position));
        }
        id
    }
}

/// What `AssetStore::delete` did to the remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Deleted,
    /// Other products still show it.
    Retained { remaining: u64 },
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn upload(&self, local: &Path, context: &UploadContext) -> Result<ImageMeta, UploadError>;

    /// Drops one product's reference to `remote_id`.
    async fn delete(&self, remote_id: &str) -> Result<Release, UploadError>;

    /// Releases the images a product no longer shows. Ids still listed in
    /// `current` were rewritten in place and stay.
    async fn release_replaced(&self, previous: &[ImageMeta], current: &[ImageMeta]) {
        for meta in previous {
            if current.iter().any(|kept| kept.remote_id == meta.remote_id) {
                continue;
            }
            if let Err(err) = self.delete(&meta.remote_id).await {
                warn!(target = "catalog.assets", remote_id = %meta.remote_id, error = %err, "stale_image_delete_failed");
            }
        }
    }
}

/// Builds the store described by `config`: the remote object store when an
/// endpoint is configured, a local media mirror otherwise, wrapped in the
/// content-hash ledger when dedup is enabled.
pub fn store_from_config(
    config: &StorageConfig,
    ledger: Option<Arc<dyn AssetLedger>>,
) -> Arc<dyn AssetStore> {
    let base: Arc<dyn AssetStore> = match &config.remote_url {
        Some(url) => Arc::new(HttpAssetStore::new(url, config)),
        None => Arc::new(LocalAssetStore::new(
            config.media_dir.clone(),
            config.media_base_url.clone(),
        )),
    };
    match ledger {
        Some(ledger) if config.dedup => Arc::new(DedupAssetStore::new(base, ledger)),
        _ => base,
    }
}

pub struct HttpAssetStore {
    base_url: String,
    key: Option<String>,
    secret: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct RemoteAsset {
    #[serde(default)]
    secure_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    public_id: String,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    bytes: Option<u64>,
}

impl HttpAssetStore {
    pub fn new(base_url: &str, config: &StorageConfig) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            key: config.remote_key.clone(),
            secret: config.remote_secret.clone(),
            http: build_client(config),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.key {
            Some(key) => request.basic_auth(key, self.secret.as_deref()),
            None => request,
        }
    }
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    async fn upload(&self, local: &Path, context: &UploadContext) -> Result<ImageMeta, UploadError> {
        let bytes = tokio::fs::read(local).await?;
        let size = bytes.len() as u64;
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image")
            .to_string();
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(local))
            .map_err(|err| UploadError::Request(err.to_string()))?;
        let form = Form::new()
            .text("public_id", context.public_id())
            .text("overwrite", "true")
            .part("file", part);

        let response = self
            .authorize(self.http.post(format!("{}/upload", self.base_url)))
            .multipart(form)
            .send()
            .await
            .map_err(|err| UploadError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(UploadError::Request(format!("HTTP {}", response.status())));
        }
        let asset: RemoteAsset = response
            .json()
            .await
            .map_err(|err| UploadError::InvalidResponse(err.to_string()))?;
        let url = asset
            .secure_url
            .or(asset.url)
            .ok_or_else(|| UploadError::InvalidResponse("missing url".into()))?;
        Ok(ImageMeta {
            url,
            remote_id: asset.public_id,
            signature: asset.signature,
            width: asset.width,
            height: asset.height,
            format: asset.format.or_else(|| extension_of(local)),
            bytes: asset.bytes.unwrap_or(size),
        })
    }

    async fn delete(&self, remote_id: &str) -> Result<Release, UploadError> {
        let response = self
            .authorize(
                self.http
                    .delete(format!("{}/assets/{}", self.base_url, encode(remote_id))),
            )
            .send()
            .await
            .map_err(|err| UploadError::Request(err.to_string()))?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(Release::Deleted)
        } else {
            Err(UploadError::Request(format!("HTTP {}", response.status())))
        }
    }
}

/// Mirrors images into a local media directory served under `base_url`.
pub struct LocalAssetStore {
    root: PathBuf,
    base_url: String,
}

impl LocalAssetStore {
    pub fn new(root: PathBuf, base_url: String) -> Self {
        Self {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AssetStore for LocalAssetStore {
    async fn upload(&self, local: &Path, context: &UploadContext) -> Result<ImageMeta, UploadError> {
        let format = extension_of(local);
        let remote_id = match &format {
            Some(ext) => format!("{}.{ext}", context.public_id()),
            None => context.public_id(),
        };
        let target = self.root.join(&remote_id);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(local, &target).await?;
        debug!(target = "catalog.assets", remote_id = %remote_id, bytes, "asset_mirrored");
        Ok(ImageMeta {
            url: format!("{}/{remote_id}", self.base_url),
            remote_id,
            signature: None,
            width: None,
            height: None,
            format,
            bytes,
        })
    }

    async fn delete(&self, remote_id: &str) -> Result<Release, UploadError> {
        if remote_id.split('/').any(|part| part == "..") {
            return Err(UploadError::Request(format!("refusing path {remote_id}")));
        }
        match tokio::fs::remove_file(self.root.join(remote_id)).await {
            Ok(()) => Ok(Release::Deleted),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Release::Deleted),
            Err(err) => Err(err.into()),
        }
    }
}

/// Uploads each distinct image content once; later matches reuse the recorded
/// asset and bump its usage counter. Objects are named after their content, so
/// a shared object is never rewritten, and it is removed only when its last
/// reference is released.
pub struct DedupAssetStore {
    inner: Arc<dyn AssetStore>,
    ledger: Arc<dyn AssetLedger>,
}

impl DedupAssetStore {
    pub fn new(inner: Arc<dyn AssetStore>, ledger: Arc<dyn AssetLedger>) -> Self {
        Self { inner, ledger }
    }
}

#[async_trait]
impl AssetStore for DedupAssetStore {
    async fn upload(&self, local: &Path, context: &UploadContext) -> Result<ImageMeta, UploadError> {
        let bytes = tokio::fs::read(local).await?;
        let hash = content_hash(&bytes);
        match self.ledger.claim(&hash).await {
            Ok(Some(asset)) => {
                debug!(target = "catalog.assets", hash = %hash, usage = asset.usage_count, "asset_reused");
                return Ok(asset.meta);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target = "catalog.assets", hash = %hash, error = %err, "ledger_lookup_failed");
            }
        }
        let context = context.clone().with_fingerprint(&hash);
        let meta = self.inner.upload(local, &context).await?;
        if let Err(err) = self.ledger.record(&hash, &meta).await {
            warn!(target = "catalog.assets", hash = %hash, error = %err, "ledger_record_failed");
        }
        Ok(meta)
    }

    async fn delete(&self, remote_id: &str) -> Result<Release, UploadError> {
        // without the count it is unknown who else shows the object
        let remaining = self
            .ledger
            .release(remote_id)
            .await
            .map_err(|err| UploadError::Request(format!("asset ledger unavailable: {err}")))?;
        match remaining {
            Some(remaining) if remaining > 0 => {
                debug!(target = "catalog.assets", remote_id = %remote_id, remaining, "asset_retained");
                Ok(Release::Retained { remaining })
            }
            _ => self.inner.delete(remote_id).await,
        }
    }

    async fn release_replaced(&self, previous: &[ImageMeta], current: &[ImageMeta]) {
        // every previous image held a reference, including ones reused by `current`
        for meta in previous {
            let remaining = match self.ledger.release(&meta.remote_id).await {
                Ok(remaining) => remaining,
                Err(err) => {
                    warn!(target = "catalog.assets", remote_id = %meta.remote_id, error = %err, "ledger_release_failed");
                    continue;
                }
            };
            let in_use = current.iter().any(|kept| kept.remote_id == meta.remote_id);
            if in_use || remaining.is_some_and(|left| left > 0) {
                continue;
            }
            if let Err(err) = self.inner.delete(&meta.remote_id).await {
                warn!(target = "catalog.assets", remote_id = %meta.remote_id, error = %err, "stale_image_delete_failed");
            }
        }
    }
}

/// `slugify(name)`, plus a short hash of `name` when the slug alone would
/// also fit another name (`RB 3025` and `RB-3025`). Names differing only in
/// case share a slug; the catalog refuses such pairs.
fn product_slug(name: &str) -> String {
    let slug = slugify(name);
    if slug == name.trim().to_ascii_lowercase() {
        slug
    } else {
        let hash = content_hash(name.trim().as_bytes());
        format!("{slug}-{}", hash.get(..8).unwrap_or(hash.as_str()))
    }
}

/// Lowercase ASCII slug: runs of anything but letters and digits become `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn mime_for(path: &Path) -> &'static str {
    match extension_of(path).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}
