//! Session state and the step state machine.
//!
//! The workflow owns one [`SessionState`] per session id. Navigation is
//! guarded: a transition with unmet preconditions reports the violation and
//! leaves the state untouched. The snapshot types flatten set/map fields to
//! vectors for storage and reconstitute them on load; a corrupted snapshot
//! falls back to a fresh session rather than failing initialization.

use crate::models::{
    CatalogProduct, CreatedListing, GeneratedContent, PlacementSelection,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Workflow steps. Step 1 (catalog browsing) lives outside this service,
/// so the machine starts at product selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Products,
    Placements,
    Generation,
    Publish,
}

impl Step {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            2 => Some(Self::Products),
            3 => Some(Self::Placements),
            4 => Some(Self::Generation),
            5 => Some(Self::Publish),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Products => 2,
            Self::Placements => 3,
            Self::Generation => 4,
            Self::Publish => 5,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NavigationError {
    #[error("select at least one product before choosing placements")]
    NoProductsSelected,
    #[error("products missing placements: {}", missing.join(", "))]
    MissingPlacements { missing: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub current_step: u8,
    pub completed_steps: BTreeSet<u8>,
    pub selected_products: BTreeSet<String>,
    pub product_designs: BTreeMap<String, Vec<PlacementSelection>>,
    pub product_content: BTreeMap<String, GeneratedContent>,
    /// Keyed `"{product_id}_{position}"`, the job id.
    pub generated_images: BTreeMap<String, String>,
    pub catalog_products: BTreeMap<String, CatalogProduct>,
    pub pending_product_ids: Vec<String>,
    pub created_listings: Vec<CreatedListing>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            current_step: Step::Products.number(),
            completed_steps: BTreeSet::new(),
            selected_products: BTreeSet::new(),
            product_designs: BTreeMap::new(),
            product_content: BTreeMap::new(),
            generated_images: BTreeMap::new(),
            catalog_products: BTreeMap::new(),
            pending_product_ids: Vec::new(),
            created_listings: Vec::new(),
        }
    }
}

impl SessionState {
    /// Move the workflow to step `n`.
    ///
    /// Returns `Ok(None)` (a no-op, state untouched) for `n` outside the
    /// valid range, `Ok(Some(step))` after a successful transition so the
    /// caller can persist a snapshot and run the step's idempotent
    /// initializer, and a [`NavigationError`] when a forward guard fails.
    pub fn navigate_to_step(&mut self, n: u8) -> Result<Option<Step>, NavigationError> {
        let Some(target) = Step::from_number(n) else {
            return Ok(None);
        };

        match target {
            Step::Placements => {
                if self.selected_products.is_empty() {
                    return Err(NavigationError::NoProductsSelected);
                }
            }
            Step::Generation => {
                let missing: Vec<String> = self
                    .selected_products
                    .iter()
                    .filter(|id| {
                        self.product_designs
                            .get(*id)
                            .is_none_or(|placements| placements.is_empty())
                    })
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(NavigationError::MissingPlacements { missing });
                }
            }
            Step::Products | Step::Publish => {}
        }

        if self.current_step != target.number() {
            self.completed_steps.insert(self.current_step);
        }
        self.current_step = target.number();
        Ok(Some(target))
    }

    pub fn to_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            current_step: self.current_step,
            completed_steps: self.completed_steps.iter().copied().collect(),
            selected_products: self.selected_products.iter().cloned().collect(),
            product_designs: self
                .product_designs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            product_content: self
                .product_content
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            generated_images: self
                .generated_images
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            catalog_products: self
                .catalog_products
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            pending_product_ids: self.pending_product_ids.clone(),
            created_listings: self.created_listings.clone(),
            saved_at: Some(Utc::now()),
        }
    }

    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            current_step: if Step::from_number(snapshot.current_step).is_some() {
                snapshot.current_step
            } else {
                Step::Products.number()
            },
            completed_steps: snapshot.completed_steps.into_iter().collect(),
            selected_products: snapshot.selected_products.into_iter().collect(),
            product_designs: snapshot.product_designs.into_iter().collect(),
            product_content: snapshot.product_content.into_iter().collect(),
            generated_images: snapshot.generated_images.into_iter().collect(),
            catalog_products: snapshot.catalog_products.into_iter().collect(),
            pending_product_ids: snapshot.pending_product_ids,
            created_listings: snapshot.created_listings,
        }
    }

    /// Decode a stored snapshot. Absence or corruption yields a fresh
    /// session, never an error.
    pub fn restore(raw: Option<&str>) -> Self {
        raw.and_then(|value| serde_json::from_str::<SessionSnapshot>(value).ok())
            .map(Self::from_snapshot)
            .unwrap_or_default()
    }
}

/// Wire form of [`SessionState`]: sets and maps flattened to vectors and
/// pair-vectors so the snapshot is plain JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub current_step: u8,
    #[serde(default)]
    pub completed_steps: Vec<u8>,
    #[serde(default)]
    pub selected_products: Vec<String>,
    #[serde(default)]
    pub product_designs: Vec<(String, Vec<PlacementSelection>)>,
    #[serde(default)]
    pub product_content: Vec<(String, GeneratedContent)>,
    #[serde(default)]
    pub generated_images: Vec<(String, String)>,
    #[serde(default)]
    pub catalog_products: Vec<(String, CatalogProduct)>,
    #[serde(default)]
    pub pending_product_ids: Vec<String>,
    #[serde(default)]
    pub created_listings: Vec<CreatedListing>,
    /// Stamped on save; ignored on restore.
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}
