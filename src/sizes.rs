use crate::models::Category;
use serde::{Deserialize, Serialize};

/// Structured size descriptor derived from the `Size` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SizeSpec {
    Frame {
        lens_width: u32,
        bridge_width: u32,
        temple_length: u32,
    },
    Contact {
        base_curve: f64,
        diameter: f64,
    },
    Label {
        label: String,
    },
}

impl SizeSpec {
    pub fn label(raw: &str) -> Self {
        SizeSpec::Label {
            label: raw.trim().to_string(),
        }
    }
}

/// Parses a size string with the grammar of `category`. Input that does not fit
/// the grammar is kept verbatim as a label; this never fails.
pub fn parse_size(category: Category, raw: &str) -> SizeSpec {
    let trimmed = raw.trim();
    let parsed = if category.is_eyewear() {
        parse_frame(trimmed)
    } else {
        parse_contact(trimmed)
    };
    parsed.unwrap_or_else(|| SizeSpec::label(trimmed))
}

// lensWidth-bridgeWidth-templeLength; `□` is accepted as the lens/bridge separator
fn parse_frame(value: &str) -> Option<SizeSpec> {
    let parts: Vec<&str> = value.split(['-', '□']).map(str::trim).collect();
    let [lens, bridge, temple] = parts.as_slice() else {
        return None;
    };
    let lens_width = positive_int(lens)?;
    let bridge_width = positive_int(bridge)?;
    let temple_length = positive_int(temple)?;
    Some(SizeSpec::Frame {
        lens_width,
        bridge_width,
        temple_length,
    })
}

// baseCurve/diameter
fn parse_contact(value: &str) -> Option<SizeSpec> {
    let (base_curve, diameter) = value.split_once('/')?;
    let base_curve = positive_decimal(base_curve)?;
    let diameter = positive_decimal(diameter)?;
    Some(SizeSpec::Contact {
        base_curve,
        diameter,
    })
}

fn positive_int(value: &str) -> Option<u32> {
    value.parse::<u32>().ok().filter(|v| *v > 0)
}

fn positive_decimal(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eyewear_size_parses_three_parts() {
        assert_eq!(
            parse_size(Category::Eyeglasses, "52-18-140"),
            SizeSpec::Frame {
                lens_width: 52,
                bridge_width: 18,
                temple_length: 140
            }
        );
        assert_eq!(
            parse_size(Category::Sunglasses, " 55□17-145 "),
            SizeSpec::Frame {
                lens_width: 55,
                bridge_width: 17,
                temple_length: 145
            }
        );
    }

    #[test]
    fn contact_size_parses_curve_and_diameter() {
        assert_eq!(
            parse_size(Category::ContactLenses, "8.6/14.2"),
            SizeSpec::Contact {
                base_curve: 8.6,
                diameter: 14.2
            }
        );
    }

    #[test]
    fn malformed_sizes_degrade_to_label() {
        assert_eq!(
            parse_size(Category::Eyeglasses, "52-18"),
            SizeSpec::label("52-18")
        );
        assert_eq!(
            parse_size(Category::Eyeglasses, "M"),
            SizeSpec::label("M")
        );
        assert_eq!(
            parse_size(Category::ContactLenses, "8.6-14.2"),
            SizeSpec::label("8.6-14.2")
        );
        assert_eq!(
            parse_size(Category::ContactLenses, "abc/14.2"),
            SizeSpec::label("abc/14.2")
        );
        // grammars are per category
        assert_eq!(
            parse_size(Category::ContactLenses, "52-18-140"),
            SizeSpec::label("52-18-140")
        );
    }

    #[test]
    fn frame_size_serializes_camel_case() {
        let value = serde_json::to_value(parse_size(Category::Eyeglasses, "52-18-140")).unwrap();
        assert_eq!(value["kind"], "frame");
        assert_eq!(value["lensWidth"], 52);
        assert_eq!(value["bridgeWidth"], 18);
        assert_eq!(value["templeLength"], 140);
    }
}
