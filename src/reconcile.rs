use crate::catalog::{CatalogError, CatalogStore, SkuMatch};
use crate::matcher::{ImageIndex, ImageMatch};
use crate::models::{Category, CatalogProduct, FrameFeatures, ImageMeta, ImportMode, Prescription};
use crate::sizes::parse_size;
use crate::spreadsheet::{Cell, RowRecord};
use crate::uploader::{AssetStore, UploadContext};
use chrono::Utc;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod columns {
    pub const MODEL_NO: &str = "Model No.";
    pub const BRAND: &str = "Brand";
    pub const PRODUCT: &str = "Product";
    pub const COLOR: &str = "Color";
    pub const COLOR_TEXT: &str = "Color Text";
    pub const MATERIAL: &str = "Material";
    pub const SHAPE: &str = "Shape";
    pub const GENDER: &str = "Gender";
    pub const SIZE: &str = "Size";
    pub const PRICE: &str = "Price";
    pub const STOCK: &str = "Stock";
    pub const DESCRIPTION: &str = "Description";
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("row {line} of `{sheet}` has no `Model No.`")]
    MissingModel { sheet: String, line: usize },
    #[error("{model}: {source}")]
    Catalog {
        model: String,
        #[source]
        source: CatalogError,
    },
}

/// Per-run facts every row needs.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub category: Category,
    pub mode: ImportMode,
    pub batch_id: Uuid,
    pub source_file: &'a str,
    pub images: Option<&'a ImageIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowDisposition {
    Imported,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct RowReport {
    pub sku: String,
    pub disposition: RowDisposition,
    /// Recoverable problems worth surfacing in the job log.
    pub notes: Vec<String>,
}

pub struct Reconciler {
    catalog: Arc<dyn CatalogStore>,
    assets: Arc<dyn AssetStore>,
    placeholder: String,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        assets: Arc<dyn AssetStore>,
        placeholder: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            assets,
            placeholder: placeholder.into(),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    /// Decides new / duplicate for one row and writes the catalog accordingly.
    pub async fn process_row(
        &self,
        row: &RowRecord,
        ctx: &RowContext<'_>,
    ) -> Result<RowReport, ReconcileError> {
        let model = row
            .text(columns::MODEL_NO)
            .ok_or_else(|| ReconcileError::MissingModel {
                sheet: row.sheet.clone(),
                line: row.line,
            })?;
        let catalog_err = |source| ReconcileError::Catalog {
            model: model.clone(),
            source,
        };

        let (sku, matching) = match ctx.mode {
            ImportMode::Standard => (model.clone(), SkuMatch::Exact),
            ImportMode::Smart => (
                composite_sku(
                    &model,
                    row.text(columns::COLOR)
                        .or_else(|| row.text(columns::COLOR_TEXT))
                        .as_deref(),
                    row.text(columns::SIZE).as_deref(),
                ),
                SkuMatch::CaseInsensitive,
            ),
        };
        let mut notes = Vec::new();
        let found = ctx
            .images
            .map(|index| index.find_images(&model))
            .unwrap_or(ImageMatch::NotFound);
        debug!(target = "catalog.reconcile", model = %model, images = found.paths().len(), "images_resolved");

        if let Some(existing) = self
            .catalog
            .find_by_sku(&sku, matching)
            .await
            .map_err(catalog_err)?
        {
            if let ImageMatch::Found(paths) = &found {
                let (urls, meta) = self
                    .upload_all(paths, ctx.category, &sku, &mut notes)
                    .await;
                if urls.is_empty() {
                    notes.push(format!("{sku}: duplicate kept, image upload failed"));
                } else {
                    let count = urls.len();
                    if let Err(err) = self
                        .catalog
                        .replace_images(existing.id, urls, meta.clone())
                        .await
                    {
                        self.assets.release_replaced(&meta, &existing.image_meta).await;
                        return Err(catalog_err(err));
                    }
                    self.assets
                        .release_replaced(&existing.image_meta, &meta)
                        .await;
                    notes.push(format!("{sku}: duplicate, refreshed {count} image(s)"));
                }
            } else {
                debug!(target = "catalog.reconcile", sku = %sku, "duplicate_without_images");
            }
            return Ok(RowReport {
                sku,
                disposition: RowDisposition::Skipped,
                notes,
            });
        }

        // an exact miss can still collide by case; refuse before touching storage
        if matches!(matching, SkuMatch::Exact)
            && let Some(taken) = self
                .catalog
                .find_by_sku(&sku, SkuMatch::CaseInsensitive)
                .await
                .map_err(catalog_err)?
        {
            return Err(catalog_err(CatalogError::DuplicateSku(taken.sku)));
        }

        let (mut images, image_meta) = match &found {
            ImageMatch::Found(paths) => {
                self.upload_all(paths, ctx.category, &sku, &mut notes)
                    .await
            }
            ImageMatch::NotFound => (Vec::new(), Vec::new()),
        };
        if images.is_empty() {
            images.push(self.placeholder.clone());
        }

        let uploaded = image_meta.clone();
        let product = build_product(row, ctx, &model, sku.clone(), images, image_meta, &mut notes);
        if let Err(err) = self.catalog.insert(product).await {
            self.assets.release_replaced(&uploaded, &[]).await;
            return Err(catalog_err(err));
        }
        Ok(RowReport {
            sku,
            disposition: RowDisposition::Imported,
            notes,
        })
    }

    // Sequential on purpose: upload order follows slot order.
    async fn upload_all(
        &self,
        paths: &[PathBuf],
        category: Category,
        name: &str,
        notes: &mut Vec<String>,
    ) -> (Vec<String>, Vec<ImageMeta>) {
        let mut urls = Vec::with_capacity(paths.len());
        let mut metas = Vec::with_capacity(paths.len());
        for (position, path) in paths.iter().enumerate() {
            let context = UploadContext::new(category, name, position);
            match self.assets.upload(path, &context).await {
                Ok(meta) => {
                    urls.push(meta.url.clone());
                    metas.push(meta);
                }
                Err(err) => {
                    let file = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    warn!(target = "catalog.reconcile", file = %file, error = %err, "image_upload_failed");
                    notes.push(format!("{name}: upload of {file} failed: {err}"));
                }
            }
        }
        (urls, metas)
    }
}

fn build_product(
    row: &RowRecord,
    ctx: &RowContext<'_>,
    model: &str,
    sku: String,
    images: Vec<String>,
    image_meta: Vec<ImageMeta>,
    notes: &mut Vec<String>,
) -> CatalogProduct {
    let brand = row.text(columns::BRAND);
    let name = row
        .text(columns::PRODUCT)
        .or_else(|| brand.as_ref().map(|b| format!("{b} {model}")))
        .unwrap_or_else(|| model.to_string());
    let price = match row.get(columns::PRICE).and_then(parse_price) {
        Some(price) => price,
        None => {
            notes.push(format!("{sku}: missing or unreadable price, stored as 0"));
            0.0
        }
    };
    let stock = row.get(columns::STOCK).and_then(parse_stock).unwrap_or(0);
    let material = row.text(columns::MATERIAL);
    let lightweight = material
        .as_deref()
        .is_some_and(|m| m.to_lowercase().contains("titanium"));
    let now = Utc::now();

    CatalogProduct {
        id: Uuid::new_v4(),
        sku,
        name,
        description: row.text(columns::DESCRIPTION),
        price,
        stock,
        category: ctx.category,
        brand,
        color: row.text(columns::COLOR),
        color_text: row.text(columns::COLOR_TEXT),
        material,
        shape: row.text(columns::SHAPE),
        gender: row.text(columns::GENDER),
        features: FrameFeatures {
            lightweight,
            polarized: ctx.category == Category::Sunglasses,
        },
        prescription: Prescription::for_category(ctx.category),
        images,
        image_meta,
        size: row
            .text(columns::SIZE)
            .map(|raw| parse_size(ctx.category, &raw)),
        batch_id: Some(ctx.batch_id),
        source_file: Some(ctx.source_file.to_string()),
        created_at: now,
        updated_at: now,
    }
}

/// `MODEL-COLOR-SIZE`, uppercased, every run of non-alphanumerics collapsed to `-`.
pub fn composite_sku(model: &str, color: Option<&str>, size: Option<&str>) -> String {
    [Some(model), color, size]
        .into_iter()
        .flatten()
        .map(normalize_sku_part)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn normalize_sku_part(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Accepts numbers and text like `$1,299.00`, `129,90 €` or `1.299,00`.
/// Negative amounts are unreadable.
pub fn parse_price(cell: &Cell) -> Option<f64> {
    let value = match cell {
        Cell::Number(value) => *value,
        Cell::Bool(_) => return None,
        Cell::Text(text) => {
            let signed = text
                .chars()
                .take_while(|ch| !ch.is_ascii_digit())
                .any(|ch| matches!(ch, '-' | '\u{2212}'));
            if signed {
                return None;
            }
            let cleaned: String = text
                .chars()
                .filter(|ch| ch.is_ascii_digit() || matches!(ch, '.' | ','))
                .collect();
            let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
                (Some(dot), Some(comma)) if comma > dot => {
                    cleaned.replace('.', "").replace(',', ".")
                }
                (Some(_), Some(_)) => cleaned.replace(',', ""),
                (None, Some(comma)) if cleaned.len() - comma - 1 == 3 => {
                    cleaned.replace(',', "")
                }
                (None, Some(_)) => cleaned.replace(',', "."),
                _ => cleaned,
            };
            normalized.parse::<f64>().ok()?
        }
    };
    (value.is_finite() && value >= 0.0).then_some(value)
}

pub fn parse_stock(cell: &Cell) -> Option<i64> {
    match cell {
        Cell::Number(value) if value.is_finite() => Some(value.trunc() as i64),
        Cell::Text(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::sizes::SizeSpec;
    use crate::uploader::UploadError;
    use async_trait::async_trait;
    use std::path::Path;

    struct FakeAssets {
        fail: bool,
    }

    #[async_trait]
    impl AssetStore for FakeAssets {
        async fn upload(
            &self,
            _local: &Path,
            context: &UploadContext,
        ) -> Result<ImageMeta, UploadError> {
            if self.fail {
                return Err(UploadError::Request("HTTP 503".into()));
            }
            Ok(ImageMeta {
                url: format!("https://cdn.test/{}", context.public_id()),
                remote_id: context.public_id(),
                signature: None,
                width: Some(800),
                height: Some(600),
                format: Some("jpg".into()),
                bytes: 3,
            })
        }

        async fn delete(&self, _remote_id: &str) -> Result<crate::uploader::Release, UploadError> {
            Ok(crate::uploader::Release::Deleted)
        }
    }

    fn reconciler(fail_uploads: bool) -> (Reconciler, Arc<InMemoryCatalog>) {
        let catalog = Arc::new(InMemoryCatalog::new());
        let reconciler = Reconciler::new(
            catalog.clone(),
            Arc::new(FakeAssets { fail: fail_uploads }),
            "/images/no_image.png",
        );
        (reconciler, catalog)
    }

    fn row(model: &str) -> RowRecord {
        RowRecord::new("Sheet1", 2)
            .with(columns::MODEL_NO, Cell::Text(model.into()))
            .with(columns::BRAND, Cell::Text("Lindberg".into()))
            .with(columns::MATERIAL, Cell::Text("Beta Titanium".into()))
            .with(columns::SIZE, Cell::Text("52-18-140".into()))
            .with(columns::PRICE, Cell::Text("$1,299.00".into()))
            .with(columns::STOCK, Cell::Number(4.0))
    }

    fn ctx<'a>(category: Category, mode: ImportMode, images: Option<&'a ImageIndex>) -> RowContext<'a> {
        RowContext {
            category,
            mode,
            batch_id: Uuid::nil(),
            source_file: "frames.xlsx",
            images,
        }
    }

    #[tokio::test]
    async fn new_row_without_images_uses_placeholder_and_defaults() {
        let (reconciler, catalog) = reconciler(false);
        let report = reconciler
            .process_row(&row("LB9704"), &ctx(Category::Eyeglasses, ImportMode::Standard, None))
            .await
            .expect("imported");
        assert_eq!(report.disposition, RowDisposition::Imported);
        let product = catalog
            .find_by_sku("LB9704", SkuMatch::Exact)
            .await
            .unwrap()
            .expect("stored");
        assert_eq!(product.images, vec!["/images/no_image.png"]);
        assert_eq!(product.name, "Lindberg LB9704");
        assert_eq!(product.price, 1299.0);
        assert_eq!(product.stock, 4);
        assert!(product.features.lightweight);
        assert!(!product.features.polarized);
        assert!(product.prescription.required);
        assert_eq!(product.batch_id, Some(Uuid::nil()));
        assert_eq!(product.source_file.as_deref(), Some("frames.xlsx"));
        assert_eq!(
            product.size,
            Some(SizeSpec::Frame {
                lens_width: 52,
                bridge_width: 18,
                temple_length: 140
            })
        );
    }

    #[tokio::test]
    async fn missing_model_is_an_error() {
        let (reconciler, _) = reconciler(false);
        let row = RowRecord::new("Sheet1", 3).with(columns::BRAND, Cell::Text("Acme".into()));
        let err = reconciler
            .process_row(&row, &ctx(Category::Eyeglasses, ImportMode::Standard, None))
            .await
            .expect_err("no model");
        assert!(matches!(err, ReconcileError::MissingModel { line: 3, .. }));
    }

    #[tokio::test]
    async fn duplicate_refreshes_images_only_when_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("LB9704.jpg"), b"img").unwrap();
        let index = ImageIndex::scan(dir.path());
        let (reconciler, catalog) = reconciler(false);
        let context = ctx(Category::Sunglasses, ImportMode::Standard, None);
        reconciler.process_row(&row("LB9704"), &context).await.unwrap();

        // no images: untouched
        let report = reconciler.process_row(&row("LB9704"), &context).await.unwrap();
        assert_eq!(report.disposition, RowDisposition::Skipped);
        let stored = catalog.find_by_sku("LB9704", SkuMatch::Exact).await.unwrap().unwrap();
        assert_eq!(stored.images, vec!["/images/no_image.png"]);

        let with_images = ctx(Category::Sunglasses, ImportMode::Standard, Some(&index));
        let report = reconciler
            .process_row(&row("LB9704"), &with_images)
            .await
            .unwrap();
        assert_eq!(report.disposition, RowDisposition::Skipped);
        let stored = catalog.find_by_sku("LB9704", SkuMatch::Exact).await.unwrap().unwrap();
        assert_eq!(stored.images, vec!["https://cdn.test/catalog/sunglasses/lb9704"]);
        assert_eq!(stored.image_meta.len(), 1);
        assert_eq!(catalog.len().await, 1);
    }

    #[tokio::test]
    async fn failed_upload_falls_back_to_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("LB1.png"), b"img").unwrap();
        let index = ImageIndex::scan(dir.path());
        let (reconciler, catalog) = reconciler(true);
        let report = reconciler
            .process_row(
                &row("LB1"),
                &ctx(Category::Eyeglasses, ImportMode::Standard, Some(&index)),
            )
            .await
            .unwrap();
        assert_eq!(report.disposition, RowDisposition::Imported);
        assert!(report.notes.iter().any(|n| n.contains("upload of LB1.png failed")));
        let stored = catalog.find_by_sku("LB1", SkuMatch::Exact).await.unwrap().unwrap();
        assert_eq!(stored.images, vec!["/images/no_image.png"]);
    }

    #[tokio::test]
    async fn smart_mode_distinguishes_variants_case_insensitively() {
        let (reconciler, catalog) = reconciler(false);
        let context = ctx(Category::Eyeglasses, ImportMode::Smart, None);
        let gold = row("rb 3025").with(columns::COLOR, Cell::Text("Gold".into()));
        let black = row("rb 3025").with(columns::COLOR, Cell::Text("Black".into()));
        let gold_upper = row("RB 3025").with(columns::COLOR, Cell::Text("GOLD".into()));

        let first = reconciler.process_row(&gold, &context).await.unwrap();
        assert_eq!(first.sku, "RB-3025-GOLD-52-18-140");
        let second = reconciler.process_row(&black, &context).await.unwrap();
        assert_eq!(second.disposition, RowDisposition::Imported);
        let third = reconciler.process_row(&gold_upper, &context).await.unwrap();
        assert_eq!(third.disposition, RowDisposition::Skipped);
        assert_eq!(catalog.len().await, 2);
    }

    #[tokio::test]
    async fn standard_mode_case_collision_is_an_error() {
        let (reconciler, _) = reconciler(false);
        let context = ctx(Category::Eyeglasses, ImportMode::Standard, None);
        reconciler.process_row(&row("AB1"), &context).await.unwrap();
        let err = reconciler
            .process_row(&row("ab1"), &context)
            .await
            .expect_err("collision");
        assert!(matches!(
            err,
            ReconcileError::Catalog {
                source: CatalogError::DuplicateSku(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn case_collision_leaves_existing_images_untouched() {
        use crate::uploader::LocalAssetStore;

        let media = tempfile::tempdir().unwrap();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join("AB1.jpg"), b"original").unwrap();
        std::fs::write(second.path().join("ab1.jpg"), b"intruder").unwrap();
        let catalog = Arc::new(InMemoryCatalog::new());
        let reconciler = Reconciler::new(
            catalog.clone(),
            Arc::new(LocalAssetStore::new(media.path().to_path_buf(), "/media".into())),
            "/images/no_image.png",
        );

        let original = ImageIndex::scan(first.path());
        reconciler
            .process_row(
                &row("AB1"),
                &ctx(Category::Eyeglasses, ImportMode::Standard, Some(&original)),
            )
            .await
            .unwrap();
        let stored = catalog.find_by_sku("AB1", SkuMatch::Exact).await.unwrap().unwrap();
        let object = media.path().join(&stored.image_meta[0].remote_id);

        let intruder = ImageIndex::scan(second.path());
        let err = reconciler
            .process_row(
                &row("ab1"),
                &ctx(Category::Eyeglasses, ImportMode::Standard, Some(&intruder)),
            )
            .await
            .expect_err("collision");
        assert!(matches!(
            err,
            ReconcileError::Catalog {
                source: CatalogError::DuplicateSku(ref taken),
                ..
            } if taken == "AB1"
        ));
        assert_eq!(std::fs::read(&object).unwrap(), b"original");
        assert_eq!(catalog.len().await, 1);
    }

    #[test]
    fn price_formats() {
        assert_eq!(parse_price(&Cell::Text("129.90".into())), Some(129.9));
        assert_eq!(parse_price(&Cell::Text("129,90 €".into())), Some(129.9));
        assert_eq!(parse_price(&Cell::Text("1.299,00".into())), Some(1299.0));
        assert_eq!(parse_price(&Cell::Text("1,299".into())), Some(1299.0));
        assert_eq!(parse_price(&Cell::Number(45.5)), Some(45.5));
        assert_eq!(parse_price(&Cell::Text("n/a".into())), None);
        assert_eq!(parse_price(&Cell::Text("-5".into())), None);
        assert_eq!(parse_price(&Cell::Text("$ -12.50".into())), None);
        assert_eq!(parse_price(&Cell::Number(-5.0)), None);
    }

    #[test]
    fn composite_sku_skips_missing_parts() {
        assert_eq!(composite_sku("ab 12", None, Some("M")), "AB-12-M");
        assert_eq!(composite_sku("X/1", Some(" "), None), "X-1");
    }
}
