//! Content generation collaborator: one call per product produces the
//! marketing copy shared by all of that product's placements.

use crate::config::GENAI_ROOT;
use crate::fetch::{FetchError, Fetcher};
use crate::http::build_client;
use crate::models::GeneratedContent;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid content response: {0}")]
    InvalidResponse(String),
    #[error("content generation rejected: {0}")]
    Rejected(String),
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    pub prompt: String,
    pub style: Option<String>,
    pub colors: Option<String>,
    pub audience: Option<String>,
    pub content_type: &'static str,
    pub product_id: String,
    pub product_info: Value,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent, ContentError>;
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    key_features: Vec<String>,
    #[serde(default)]
    materials: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct ContentClient {
    http: Client,
    fetcher: Fetcher,
}

impl ContentClient {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            http: build_client(),
            fetcher,
        }
    }
}

#[async_trait]
impl ContentGenerator for ContentClient {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent, ContentError> {
        let url = format!("{}/generate", *GENAI_ROOT);
        let response = self
            .fetcher
            .execute("content", self.http.post(url).json(request))
            .await?;
        let payload: ContentResponse = response
            .json()
            .await
            .map_err(|err| ContentError::InvalidResponse(err.to_string()))?;
        if !payload.success {
            return Err(ContentError::Rejected(
                payload.error.unwrap_or_else(|| "no error detail".into()),
            ));
        }
        let title = payload
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ContentError::InvalidResponse("missing title".into()))?;
        Ok(GeneratedContent {
            title,
            description: payload.description.unwrap_or_default(),
            tags: payload.tags,
            key_features: payload.key_features,
            materials: payload.materials,
        })
    }
}
