use crate::catalog::{CatalogError, CatalogStore};
use crate::models::{BatchListing, BatchSummary, CatalogProduct, DeletionSummary, ProductFilter};
use crate::uploader::{AssetStore, Release};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("at least one of category, batchId, createdAfter or createdBefore is required")]
    EmptyFilter,
    #[error("no products found for batch {0}")]
    BatchNotFound(Uuid),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Bulk deletion and batch reporting over imported products.
#[derive(Clone)]
pub struct CatalogMaintenance {
    catalog: Arc<dyn CatalogStore>,
    assets: Arc<dyn AssetStore>,
}

impl CatalogMaintenance {
    pub fn new(catalog: Arc<dyn CatalogStore>, assets: Arc<dyn AssetStore>) -> Self {
        Self { catalog, assets }
    }

    /// Refuses an empty filter rather than wiping the catalog.
    pub async fn delete_imported(
        &self,
        filter: &ProductFilter,
    ) -> Result<DeletionSummary, MaintenanceError> {
        if filter.is_empty() {
            return Err(MaintenanceError::EmptyFilter);
        }
        let removed = self.catalog.delete_matching(filter).await?;
        Ok(self.finish_deletion(removed).await)
    }

    pub async fn delete_batch(&self, batch_id: Uuid) -> Result<DeletionSummary, MaintenanceError> {
        let removed = self
            .catalog
            .delete_matching(&ProductFilter::for_batch(batch_id))
            .await?;
        if removed.is_empty() {
            return Err(MaintenanceError::BatchNotFound(batch_id));
        }
        Ok(self.finish_deletion(removed).await)
    }

    /// Falls back to bare per-batch counts when the store cannot aggregate.
    pub async fn list_batches(&self) -> Result<BatchListing, MaintenanceError> {
        match self.catalog.aggregate_batches().await {
            Ok(batches) => Ok(BatchListing {
                batches,
                simplified: false,
            }),
            Err(err) => {
                warn!(target = "catalog.maintenance", error = %err, "batch_aggregation_unavailable");
                let batches = self
                    .catalog
                    .batch_counts()
                    .await?
                    .into_iter()
                    .map(|(batch_id, count)| BatchSummary {
                        batch_id,
                        count,
                        category: None,
                        source_file: None,
                        created_at: None,
                        brands: Vec::new(),
                    })
                    .collect();
                Ok(BatchListing {
                    batches,
                    simplified: true,
                })
            }
        }
    }

    // Remote image removal is best-effort; the products are already gone.
    // Each removed reference is released once, so objects that products outside
    // the deletion still show are kept.
    async fn finish_deletion(&self, removed: Vec<CatalogProduct>) -> DeletionSummary {
        let mut references: BTreeMap<&str, usize> = BTreeMap::new();
        for meta in removed.iter().flat_map(|product| product.image_meta.iter()) {
            *references.entry(meta.remote_id.as_str()).or_default() += 1;
        }
        let mut images_deleted = 0;
        for (remote_id, count) in references {
            for _ in 0..count {
                match self.assets.delete(remote_id).await {
                    Ok(Release::Deleted) => {
                        images_deleted += 1;
                        break;
                    }
                    Ok(Release::Retained { remaining }) => {
                        debug!(target = "catalog.maintenance", remote_id = %remote_id, remaining, "image_still_shared");
                    }
                    Err(err) => {
                        warn!(target = "catalog.maintenance", remote_id = %remote_id, error = %err, "image_delete_failed");
                        break;
                    }
                }
            }
        }
        if let Err(err) = self.catalog.flush().await {
            warn!(target = "catalog.maintenance", error = %err, "catalog_flush_failed");
        }
        let summary = DeletionSummary {
            products_deleted: removed.len() as u64,
            images_deleted,
        };
        info!(
            target = "catalog.maintenance",
            products = summary.products_deleted,
            images = summary.images_deleted,
            "products_deleted"
        );
        summary
    }
}
