use crate::sizes::SizeSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

/// Closed set of catalog categories an import run may target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Category {
    Eyeglasses,
    Sunglasses,
    #[serde(rename = "Contact Lenses")]
    ContactLenses,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::Eyeglasses,
        Category::Sunglasses,
        Category::ContactLenses,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Category::Eyeglasses => "Eyeglasses",
            Category::Sunglasses => "Sunglasses",
            Category::ContactLenses => "Contact Lenses",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            Category::Eyeglasses => "eyeglasses",
            Category::Sunglasses => "sunglasses",
            Category::ContactLenses => "contact-lenses",
        }
    }

    /// Accepts the canonical labels ignoring case, spaces, `-` and `_`.
    pub fn parse(input: &str) -> Option<Self> {
        let folded = fold(input);
        Self::ALL
            .into_iter()
            .find(|category| fold(category.label()) == folded)
    }

    /// Guesses the category from an uploaded file name such as
    /// `sunglasses_spring.xlsx` or `Contact-Lens-Stock.csv`.
    pub fn infer_from_file_name(name: &str) -> Option<Self> {
        let folded = fold(name);
        if folded.contains("contactlens") || folded.contains("contacts") {
            Some(Category::ContactLenses)
        } else if folded.contains("sunglass") {
            Some(Category::Sunglasses)
        } else if folded.contains("eyeglass") || folded.contains("optical") {
            Some(Category::Eyeglasses)
        } else {
            None
        }
    }

    pub fn is_eyewear(&self) -> bool {
        matches!(self, Category::Eyeglasses | Category::Sunglasses)
    }
}

fn fold(input: &str) -> String {
    input
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

/// Duplicate-detection policy for one import run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// SKU is the raw `Model No.`, matched exactly.
    #[default]
    Standard,
    /// SKU is `MODEL-COLOR-SIZE`, matched case-insensitively.
    Smart,
}

impl ImportMode {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "" | "standard" => Some(ImportMode::Standard),
            "smart" => Some(ImportMode::Smart),
            _ => None,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageMeta {
    pub url: String,
    pub remote_id: String,
    pub signature: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Prescription {
    pub applicable: bool,
    pub required: bool,
    pub kind: String,
}

impl Prescription {
    pub fn for_category(category: Category) -> Self {
        let (applicable, required, kind) = match category {
            Category::Eyeglasses => (true, true, "single-vision"),
            Category::Sunglasses => (true, false, "non-prescription"),
            Category::ContactLenses => (true, true, "contact"),
        };
        Self {
            applicable,
            required,
            kind: kind.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FrameFeatures {
    pub lightweight: bool,
    pub polarized: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProduct {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub stock: i64,
    pub category: Category,
    pub brand: Option<String>,
    pub color: Option<String>,
    pub color_text: Option<String>,
    pub material: Option<String>,
    pub shape: Option<String>,
    pub gender: Option<String>,
    pub features: FrameFeatures,
    pub prescription: Prescription,
    pub images: Vec<String>,
    #[serde(default)]
    pub image_meta: Vec<ImageMeta>,
    pub size: Option<SizeSpec>,
    pub batch_id: Option<Uuid>,
    pub source_file: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductFilter {
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl ProductFilter {
    pub fn for_batch(batch_id: Uuid) -> Self {
        Self {
            batch_id: Some(batch_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.batch_id.is_none()
            && self.created_after.is_none()
            && self.created_before.is_none()
    }

    /// All present fields must match. An empty filter matches nothing.
    pub fn matches(&self, product: &CatalogProduct) -> bool {
        if self.is_empty() {
            return false;
        }
        self.category.is_none_or(|c| c == product.category)
            && self.batch_id.is_none_or(|b| product.batch_id == Some(b))
            && self.created_after.is_none_or(|t| product.created_at >= t)
            && self.created_before.is_none_or(|t| product.created_at <= t)
    }
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletionSummary {
    pub products_deleted: u64,
    pub images_deleted: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub brands: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchListing {
    pub batches: Vec<BatchSummary>,
    pub simplified: bool,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parse_tolerates_spacing_and_case() {
        assert_eq!(Category::parse("contact lenses"), Some(Category::ContactLenses));
        assert_eq!(Category::parse("Contact_Lenses"), Some(Category::ContactLenses));
        assert_eq!(Category::parse(" SUNGLASSES "), Some(Category::Sunglasses));
        assert_eq!(Category::parse("Goggles"), None);
    }

    #[test]
    fn category_inferred_from_file_name() {
        assert_eq!(
            Category::infer_from_file_name("2024_Sunglasses_stock.xlsx"),
            Some(Category::Sunglasses)
        );
        assert_eq!(
            Category::infer_from_file_name("contact-lens-list.csv"),
            Some(Category::ContactLenses)
        );
        assert_eq!(
            Category::infer_from_file_name("eyeglasses.xlsx"),
            Some(Category::Eyeglasses)
        );
        assert_eq!(Category::infer_from_file_name("inventory.xlsx"), None);
    }

    #[test]
    fn category_serializes_with_display_label() {
        let json = serde_json::to_string(&Category::ContactLenses).unwrap();
        assert_eq!(json, "\"Contact Lenses\"");
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = ProductFilter::default();
        assert!(filter.is_empty());
        let product = CatalogProduct {
            id: Uuid::new_v4(),
            sku: "A1".into(),
            name: "A1".into(),
            description: None,
            price: 0.0,
            stock: 0,
            category: Category::Eyeglasses,
            brand: None,
            color: None,
            color_text: None,
            material: None,
            shape: None,
            gender: None,
            features: FrameFeatures::default(),
            prescription: Prescription::for_category(Category::Eyeglasses),
            images: vec![],
            image_meta: vec![],
            size: None,
            batch_id: None,
            source_file: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!filter.matches(&product));
        let filter = ProductFilter {
            category: Some(Category::Eyeglasses),
            ..ProductFilter::default()
        };
        assert!(filter.matches(&product));
    }
}
