//! Mockup render task status, queried by the shared poller.

use crate::config::FULFILLMENT_ROOT;
use crate::fetch::{FetchError, Fetcher};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use urlencoding::encode;

#[derive(Debug, Error)]
pub enum MockupError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid task status response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MockupTaskStatus {
    pub status: String,
    #[serde(default)]
    pub catalog_variant_mockups: Vec<VariantMockups>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantMockups {
    #[serde(default)]
    pub mockups: Vec<MockupFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MockupFile {
    pub mockup_url: String,
    #[serde(default)]
    pub placement: Option<String>,
    #[serde(default)]
    pub style_id: Option<u64>,
}

impl MockupTaskStatus {
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed")
    }

    /// Terminal failure states, matched case-insensitively.
    pub fn is_failed(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "failed" | "cancelled" | "error"
        )
    }

    /// Every mockup URL across the nested per-variant/per-style lists.
    pub fn all_urls(&self) -> Vec<String> {
        self.catalog_variant_mockups
            .iter()
            .flat_map(|variant| variant.mockups.iter())
            .map(|file| file.mockup_url.clone())
            .collect()
    }
}

#[async_trait]
pub trait MockupTaskService: Send + Sync {
    async fn task_status(&self, task_id: &str) -> Result<MockupTaskStatus, MockupError>;
}

pub struct MockupClient {
    http: Client,
    fetcher: Fetcher,
}

impl MockupClient {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            http: build_client(),
            fetcher,
        }
    }
}

#[async_trait]
impl MockupTaskService for MockupClient {
    async fn task_status(&self, task_id: &str) -> Result<MockupTaskStatus, MockupError> {
        let url = format!("{}/mockup-tasks/{}", *FULFILLMENT_ROOT, encode(task_id));
        let response = self.fetcher.execute("mockups", self.http.get(url)).await?;
        response
            .json()
            .await
            .map_err(|err| MockupError::InvalidResponse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_every_nested_mockup_url() {
        let status: MockupTaskStatus = serde_json::from_value(serde_json::json!({
            "status": "completed",
            "catalog_variant_mockups": [
                {"mockups": [
                    {"mockup_url": "https://m.example/1.png", "placement": "front", "style_id": 1},
                    {"mockup_url": "https://m.example/2.png", "placement": "back", "style_id": 1},
                ]},
                {"mockups": [
                    {"mockup_url": "https://m.example/3.png", "placement": "front", "style_id": 2},
                ]},
            ],
        }))
        .expect("decode");
        assert!(status.is_completed());
        assert_eq!(
            status.all_urls(),
            vec![
                "https://m.example/1.png",
                "https://m.example/2.png",
                "https://m.example/3.png",
            ]
        );
    }

    #[test]
    fn terminal_failure_states() {
        for s in ["failed", "CANCELLED", "error"] {
            let status = MockupTaskStatus {
                status: s.into(),
                catalog_variant_mockups: vec![],
            };
            assert!(status.is_failed());
            assert!(!status.is_completed());
        }
        let pending = MockupTaskStatus {
            status: "pending".into(),
            catalog_variant_mockups: vec![],
        };
        assert!(!pending.is_failed());
        assert!(!pending.is_completed());
    }
}
