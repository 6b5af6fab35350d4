use crate::models::{BatchSummary, CatalogProduct, ImageMeta, ProductFilter};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("sku `{0}` already exists")]
    DuplicateSku(String),
    #[error("product {0} not found")]
    NotFound(Uuid),
    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),
    #[error("catalog storage failed: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkuMatch {
    Exact,
    CaseInsensitive,
}

/// Narrow document-store interface used by the import pipeline.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_by_sku(
        &self,
        sku: &str,
        matching: SkuMatch,
    ) -> Result<Option<CatalogProduct>, CatalogError>;

    /// Fails with `DuplicateSku` when the SKU exists under any casing.
    async fn insert(&self, product: CatalogProduct) -> Result<(), CatalogError>;

    async fn replace_images(
        &self,
        id: Uuid,
        images: Vec<String>,
        image_meta: Vec<ImageMeta>,
    ) -> Result<(), CatalogError>;

    /// Removes and returns every product the filter matches.
    async fn delete_matching(
        &self,
        filter: &ProductFilter,
    ) -> Result<Vec<CatalogProduct>, CatalogError>;

    async fn aggregate_batches(&self) -> Result<Vec<BatchSummary>, CatalogError> {
        Err(CatalogError::Unsupported("aggregate_batches"))
    }

    async fn batch_counts(&self) -> Result<Vec<(Uuid, u64)>, CatalogError>;

    /// Persists buffered writes, if the store buffers any.
    async fn flush(&self) -> Result<(), CatalogError> {
        Ok(())
    }
}

#[derive(Default)]
struct CatalogState {
    products: HashMap<Uuid, CatalogProduct>,
    by_sku: HashMap<String, Uuid>,
}

impl CatalogState {
    fn insert(&mut self, product: CatalogProduct) -> Result<(), CatalogError> {
        let key = product.sku.to_lowercase();
        if self.by_sku.contains_key(&key) {
            return Err(CatalogError::DuplicateSku(product.sku));
        }
        self.by_sku.insert(key, product.id);
        self.products.insert(product.id, product);
        Ok(())
    }
}

/// In-process catalog, optionally snapshotted to a JSON file on flush.
#[derive(Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
    snapshot: Option<PathBuf>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path` if it exists; later flushes write back to it.
    pub async fn open(path: PathBuf) -> Result<Self, CatalogError> {
        let mut state = CatalogState::default();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let products: Vec<CatalogProduct> = serde_json::from_slice(&bytes)
                    .map_err(|err| CatalogError::Storage(err.to_string()))?;
                for product in products {
                    if let Err(err) = state.insert(product) {
                        warn!(target = "catalog.store", error = %err, "snapshot_entry_skipped");
                    }
                }
                info!(target = "catalog.store", path = %path.display(), products = state.products.len(), "catalog_snapshot_loaded");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(CatalogError::Storage(err.to_string())),
        }
        Ok(Self {
            state: RwLock::new(state),
            snapshot: Some(path),
        })
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.products.len()
    }

    pub async fn all(&self) -> Vec<CatalogProduct> {
        let guard = self.state.read().await;
        let mut products: Vec<_> = guard.products.values().cloned().collect();
        products.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.sku.cmp(&b.sku)));
        products
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalog {
    async fn find_by_sku(
        &self,
        sku: &str,
        matching: SkuMatch,
    ) -> Result<Option<CatalogProduct>, CatalogError> {
        let guard = self.state.read().await;
        let found = guard
            .by_sku
            .get(&sku.to_lowercase())
            .and_then(|id| guard.products.get(id))
            .filter(|product| matching == SkuMatch::CaseInsensitive || product.sku == sku)
            .cloned();
        Ok(found)
    }

    async fn insert(&self, product: CatalogProduct) -> Result<(), CatalogError> {
        self.state.write().await.insert(product)
    }

    async fn replace_images(
        &self,
        id: Uuid,
        images: Vec<String>,
        image_meta: Vec<ImageMeta>,
    ) -> Result<(), CatalogError> {
        let mut guard = self.state.write().await;
        let product = guard.products.get_mut(&id).ok_or(CatalogError::NotFound(id))?;
        product.images = images;
        product.image_meta = image_meta;
        product.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_matching(
        &self,
        filter: &ProductFilter,
    ) -> Result<Vec<CatalogProduct>, CatalogError> {
        let mut guard = self.state.write().await;
        let ids: Vec<Uuid> = guard
            .products
            .values()
            .filter(|product| filter.matches(product))
            .map(|product| product.id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(product) = guard.products.remove(&id) {
                guard.by_sku.remove(&product.sku.to_lowercase());
                removed.push(product);
            }
        }
        Ok(removed)
    }

    async fn aggregate_batches(&self) -> Result<Vec<BatchSummary>, CatalogError> {
        let guard = self.state.read().await;
        let mut batches: HashMap<Uuid, (BatchSummary, BTreeSet<String>)> = HashMap::new();
        for product in guard.products.values() {
            let Some(batch_id) = product.batch_id else {
                continue;
            };
            let (summary, brands) = batches.entry(batch_id).or_insert_with(|| {
                (
                    BatchSummary {
                        batch_id,
                        count: 0,
                        category: Some(product.category),
                        source_file: product.source_file.clone(),
                        created_at: Some(product.created_at),
                        brands: Vec::new(),
                    },
                    BTreeSet::new(),
                )
            });
            summary.count += 1;
            if summary.created_at.is_none_or(|t| product.created_at < t) {
                summary.created_at = Some(product.created_at);
            }
            if let Some(brand) = &product.brand {
                brands.insert(brand.clone());
            }
        }
        let mut summaries: Vec<BatchSummary> = batches
            .into_values()
            .map(|(mut summary, brands)| {
                summary.brands = brands.into_iter().collect();
                summary
            })
            .collect();
        // newest first
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn batch_counts(&self) -> Result<Vec<(Uuid, u64)>, CatalogError> {
        let guard = self.state.read().await;
        let mut counts: HashMap<Uuid, u64> = HashMap::new();
        for batch_id in guard.products.values().filter_map(|p| p.batch_id) {
            *counts.entry(batch_id).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort();
        Ok(counts)
    }

    async fn flush(&self) -> Result<(), CatalogError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let products = self.all().await;
        let json =
            serde_json::to_vec_pretty(&products).map_err(|err| CatalogError::Storage(err.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| CatalogError::Storage(err.to_string()))?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|err| CatalogError::Storage(err.to_string()))?;
        tokio::fs::rename(&staging, path)
            .await
            .map_err(|err| CatalogError::Storage(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Category, FrameFeatures, Prescription};

    pub(crate) fn product(sku: &str, batch: Option<Uuid>, brand: &str) -> CatalogProduct {
        let now = Utc::now();
        CatalogProduct {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            name: sku.to_string(),
            description: None,
            price: 10.0,
            stock: 1,
            category: Category::Eyeglasses,
            brand: Some(brand.to_string()),
            color: None,
            color_text: None,
            material: None,
            shape: None,
            gender: None,
            features: FrameFeatures::default(),
            prescription: Prescription::for_category(Category::Eyeglasses),
            images: vec!["/images/no_image.png".into()],
            image_meta: vec![],
            size: None,
            batch_id: batch,
            source_file: Some("frames.xlsx".into()),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn sku_lookup_respects_match_mode() {
        let store = InMemoryCatalog::new();
        store.insert(product("RB3025", None, "Ray-Ban")).await.unwrap();
        assert!(
            store
                .find_by_sku("RB3025", SkuMatch::Exact)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .find_by_sku("rb3025", SkuMatch::Exact)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .find_by_sku("rb3025", SkuMatch::CaseInsensitive)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn insert_rejects_case_variant_duplicates() {
        let store = InMemoryCatalog::new();
        store.insert(product("AB-1", None, "Acme")).await.unwrap();
        let err = store
            .insert(product("ab-1", None, "Acme"))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, CatalogError::DuplicateSku(_)));
    }

    #[tokio::test]
    async fn batches_aggregate_count_and_brands() {
        let store = InMemoryCatalog::new();
        let batch = Uuid::new_v4();
        store.insert(product("A", Some(batch), "Oakley")).await.unwrap();
        store.insert(product("B", Some(batch), "Acme")).await.unwrap();
        store.insert(product("C", Some(batch), "Acme")).await.unwrap();
        store.insert(product("D", None, "Acme")).await.unwrap();
        let summaries = store.aggregate_batches().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].count, 3);
        assert_eq!(summaries[0].brands, vec!["Acme", "Oakley"]);
        assert_eq!(store.batch_counts().await.unwrap(), vec![(batch, 3)]);
    }

    #[tokio::test]
    async fn delete_matching_frees_sku() {
        let store = InMemoryCatalog::new();
        let batch = Uuid::new_v4();
        store.insert(product("A", Some(batch), "Acme")).await.unwrap();
        store.insert(product("B", None, "Acme")).await.unwrap();
        let removed = store
            .delete_matching(&ProductFilter::for_batch(batch))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len().await, 1);
        store.insert(product("a", None, "Acme")).await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let store = InMemoryCatalog::open(path.clone()).await.unwrap();
        store.insert(product("A", None, "Acme")).await.unwrap();
        store.flush().await.unwrap();
        let reopened = InMemoryCatalog::open(path).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(
            reopened
                .find_by_sku("A", SkuMatch::Exact)
                .await
                .unwrap()
                .is_some()
        );
    }
}
