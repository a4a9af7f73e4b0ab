use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Technique of last resort when neither the placement nor the catalog
/// product names one.
pub const DEFAULT_TECHNIQUE: &str = "dtg";

/// Key identifying one `(product, placement)` pair. Doubles as the job id,
/// the UI row key and the generated-image cache key.
pub fn placement_key(product_id: &str, position: &str) -> String {
    format!("{product_id}_{position}")
}

/// Print-area geometry and technique chosen for one placement.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementSelection {
    pub position: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub technique: Option<String>,
}

impl PlacementSelection {
    /// Placement override → catalog default → generic fallback. Never empty.
    pub fn resolved_technique(&self, catalog: Option<&CatalogProduct>) -> String {
        self.technique
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                catalog
                    .and_then(|p| p.default_technique.as_deref())
                    .filter(|t| !t.trim().is_empty())
            })
            .unwrap_or(DEFAULT_TECHNIQUE)
            .to_string()
    }
}

/// Catalog metadata the client supplies when selecting a product. The
/// catalog browsing UI itself lives outside this service.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub default_technique: Option<String>,
    #[serde(default)]
    pub print_areas: Vec<PrintArea>,
    #[serde(default)]
    pub variants: Vec<CatalogVariant>,
}

impl CatalogProduct {
    pub fn first_variant(&self) -> Option<&CatalogVariant> {
        self.variants.iter().find(|v| v.available).or_else(|| self.variants.first())
    }

    /// The catalog's exact reported print-area pixels for a position, when
    /// it has them. Preferred over a recomputed approximation.
    pub fn print_area(&self, position: &str) -> Option<&PrintArea> {
        self.print_areas.iter().find(|area| area.position == position)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintArea {
    pub position: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub dpi: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogVariant {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

/// Marketing copy generated once per product and shared across all of its
/// placements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub key_features: Vec<String>,
    #[serde(default)]
    pub materials: Vec<String>,
}

/// The user's creative brief, shared by every job in a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationBrief {
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub colors: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedListing {
    pub product_id: String,
    pub listing_id: String,
    #[serde(default)]
    pub listing_url: Option<String>,
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

    fn catalog(default_technique: Option<&str>) -> CatalogProduct {
        CatalogProduct {
            id: "tee-01".into(),
            name: "Classic Tee".into(),
            default_technique: default_technique.map(|t| t.to_string()),
            print_areas: vec![],
            variants: vec![
                CatalogVariant {
                    id: 11,
                    name: Some("S / Black".into()),
                    available: false,
                },
                CatalogVariant {
                    id: 12,
                    name: Some("M / Black".into()),
                    available: true,
                },
            ],
        }
    }

    #[test]
    fn technique_prefers_placement_override() {
        let placement = PlacementSelection {
            position: "front".into(),
            width: 3000,
            height: 3000,
            technique: Some("embroidery".into()),
        };
        assert_eq!(
            placement.resolved_technique(Some(&catalog(Some("dtf")))),
            "embroidery"
        );
    }

    #[test]
    fn technique_falls_back_to_catalog_then_generic() {
        let placement = PlacementSelection {
            position: "front".into(),
            width: 3000,
            height: 3000,
            technique: None,
        };
        assert_eq!(
            placement.resolved_technique(Some(&catalog(Some("dtf")))),
            "dtf"
        );
        assert_eq!(placement.resolved_technique(Some(&catalog(None))), "dtg");
        assert_eq!(placement.resolved_technique(None), "dtg");
    }

    #[test]
    fn blank_technique_is_treated_as_absent() {
        let placement = PlacementSelection {
            position: "back".into(),
            width: 1000,
            height: 1000,
            technique: Some("  ".into()),
        };
        assert_eq!(placement.resolved_technique(None), "dtg");
    }

    #[test]
    fn first_variant_skips_unavailable() {
        let product = catalog(None);
        assert_eq!(product.first_variant().map(|v| v.id), Some(12));
    }
}
