//! Fulfillment store publish: pushes one finished card into the user's
//! connected store.

use crate::config::FULFILLMENT_ROOT;
use crate::fetch::{FetchError, Fetcher};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid store response: {0}")]
    InvalidResponse(String),
    #[error("store publish rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementFile {
    pub placement: String,
    pub image_url: String,
    pub width: u32,
    pub height: u32,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct StorePublishRequest {
    pub title: String,
    pub description: String,
    pub catalog_product_id: String,
    pub catalog_variant_id: Option<u64>,
    pub placement_files: Vec<PlacementFile>,
    pub technique: String,
    pub store_id: String,
    pub retail_price: f64,
}

#[derive(Debug, Deserialize)]
struct StorePublishResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
pub trait StorePublisher: Send + Sync {
    /// Publish one card; returns the store's product id.
    async fn publish(&self, request: &StorePublishRequest) -> Result<String, StoreError>;
}

pub struct StoreClient {
    http: Client,
    fetcher: Fetcher,
}

impl StoreClient {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            http: build_client(),
            fetcher,
        }
    }
}

#[async_trait]
impl StorePublisher for StoreClient {
    async fn publish(&self, request: &StorePublishRequest) -> Result<String, StoreError> {
        let url = format!("{}/store/products", *FULFILLMENT_ROOT);
        let response = self
            .fetcher
            .execute("store", self.http.post(url).json(request))
            .await?;
        let payload: StorePublishResponse = response
            .json()
            .await
            .map_err(|err| StoreError::InvalidResponse(err.to_string()))?;
        if !payload.success {
            return Err(StoreError::Rejected(
                payload.error.unwrap_or_else(|| "no error detail".into()),
            ));
        }
        payload
            .product_id
            .ok_or_else(|| StoreError::InvalidResponse("missing product_id".into()))
    }
}
