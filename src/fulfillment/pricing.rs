//! Pricing orchestration: one batch call prices every candidate and hands
//! back either ready mockups or pending markers for the shared poller.

use crate::config::FULFILLMENT_ROOT;
use crate::fetch::{FetchError, Fetcher};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid pricing response: {0}")]
    InvalidResponse(String),
    #[error("pricing rejected: {0}")]
    Rejected(String),
}

/// Print-area geometry forwarded to pricing. Callers prefer the catalog's
/// exact reported pixels over a recomputed approximation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementGeometry {
    pub position: String,
    pub width: u32,
    pub height: u32,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingCandidate {
    /// Card key, `"{catalog_product_id}_{position}"`. Echoed back as
    /// `product_id` in the response.
    pub product_id: String,
    pub catalog_product_id: String,
    pub catalog_variant_id: Option<u64>,
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub placement: PlacementGeometry,
    pub technique: String,
    pub tags: Vec<String>,
    pub materials: Vec<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct PricingRequest {
    pub products: Vec<PricingCandidate>,
    pub selling_region: String,
    pub store_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductPricing {
    pub retail_price: f64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricedProduct {
    pub product_id: String,
    #[serde(default)]
    pub catalog_variant_id: Option<u64>,
    #[serde(default)]
    pub pricing: Option<ProductPricing>,
    #[serde(default)]
    pub mockups: Vec<String>,
    #[serde(default)]
    pub mockup_pending: bool,
    #[serde(default)]
    pub mockup_task_id: Option<String>,
    #[serde(default)]
    pub rate_limited: bool,
}

#[derive(Debug, Deserialize)]
struct PricingResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    products: Vec<PricedProduct>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
pub trait PricingService: Send + Sync {
    async fn submit_batch(&self, request: &PricingRequest)
    -> Result<Vec<PricedProduct>, PricingError>;
}

pub struct PricingClient {
    http: Client,
    fetcher: Fetcher,
}

impl PricingClient {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            http: build_client(),
            fetcher,
        }
    }
}

#[async_trait]
impl PricingService for PricingClient {
    async fn submit_batch(
        &self,
        request: &PricingRequest,
    ) -> Result<Vec<PricedProduct>, PricingError> {
        let url = format!("{}/pricing", *FULFILLMENT_ROOT);
        let response = self
            .fetcher
            .execute("pricing", self.http.post(url).json(request))
            .await?;
        let payload: PricingResponse = response
            .json()
            .await
            .map_err(|err| PricingError::InvalidResponse(err.to_string()))?;
        if !payload.success {
            return Err(PricingError::Rejected(
                payload.error.unwrap_or_else(|| "no error detail".into()),
            ));
        }
        Ok(payload.products)
    }
}
