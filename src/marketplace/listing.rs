use crate::config::MARKETPLACE_ROOT;
use crate::fetch::{FetchError, Fetcher};
use crate::http::build_client;
use crate::marketplace::auth::{MarketplaceCredential, is_credential_expiry};
use crate::models::CreatedListing;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid marketplace response: {0}")]
    InvalidResponse(String),
    #[error("listing rejected: {0}")]
    Rejected(String),
    #[error("marketplace credential expired: {0}")]
    CredentialExpired(String),
    #[error("shop `{0}` not found")]
    UnknownShop(String),
}

impl MarketplaceError {
    /// Promote expiry-shaped rejections so callers can trigger a
    /// reauthorize prompt.
    pub(crate) fn from_rejection(message: String) -> Self {
        if is_credential_expiry(&message) {
            Self::CredentialExpired(message)
        } else {
            Self::Rejected(message)
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct MarketplaceListingRequest {
    pub title: String,
    pub description: String,
    pub price: f64,
    pub images: Vec<String>,
    pub shop_id: u64,
    pub tags: Vec<String>,
    pub materials: Vec<String>,
    pub shipping_profile: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    listing_id: Option<String>,
    #[serde(default)]
    listing_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
pub trait MarketplaceListings: Send + Sync {
    /// Listings require a numeric shop id; names are resolved separately.
    async fn resolve_shop_id(&self, shop_name: &str) -> Result<u64, MarketplaceError>;

    async fn create_listing(
        &self,
        product_id: &str,
        request: &MarketplaceListingRequest,
    ) -> Result<CreatedListing, MarketplaceError>;
}

pub struct ListingClient {
    http: Client,
    fetcher: Fetcher,
    credential: MarketplaceCredential,
}

impl ListingClient {
    pub fn new(fetcher: Fetcher, credential: MarketplaceCredential) -> Self {
        Self {
            http: build_client(),
            fetcher,
            credential,
        }
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("x-api-key", &self.credential.api_key)
            .bearer_auth(&self.credential.access_token)
    }
}

#[async_trait]
impl MarketplaceListings for ListingClient {
    async fn resolve_shop_id(&self, shop_name: &str) -> Result<u64, MarketplaceError> {
        crate::marketplace::shops::resolve_shop_id(
            &self.http,
            &self.fetcher,
            &self.credential,
            shop_name,
        )
        .await
    }

    async fn create_listing(
        &self,
        product_id: &str,
        request: &MarketplaceListingRequest,
    ) -> Result<CreatedListing, MarketplaceError> {
        let url = format!("{}/shops/{}/listings", *MARKETPLACE_ROOT, request.shop_id);
        let response = self
            .fetcher
            .execute("marketplace", self.authed(self.http.post(url)).json(request))
            .await
            .map_err(|err| match err {
                FetchError::Status { status, ref body } if status == 401 => {
                    MarketplaceError::from_rejection(body.clone())
                }
                other => MarketplaceError::Fetch(other),
            })?;
        let payload: ListingResponse = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        if !payload.success {
            return Err(MarketplaceError::from_rejection(
                payload.error.unwrap_or_else(|| "no error detail".into()),
            ));
        }
        let listing_id = payload
            .listing_id
            .ok_or_else(|| MarketplaceError::InvalidResponse("missing listing_id".into()))?;
        Ok(CreatedListing {
            product_id: product_id.to_string(),
            listing_id,
            listing_url: payload.listing_url,
        })
    }
}
