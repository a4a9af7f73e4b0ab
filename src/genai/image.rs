//! Artwork generation: size derivation plus the request/poll protocol.
//!
//! Print areas arrive at catalog DPI (3000px+ per side), far beyond what
//! the image backend accepts without timing out, so each job generates at
//! a bounded size and keeps the print size for upscale metadata. A submit
//! either returns URLs synchronously or a `{pending, request_id, model}`
//! marker that is polled a bounded number of times.

use crate::config::{self, GENAI_ROOT};
use crate::fetch::{FetchError, Fetcher};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

/// Lower bound on either generated side. Clamping here intentionally
/// breaks exact aspect preservation for extreme ratios.
pub const MIN_SIDE: u32 = 512;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid image response: {0}")]
    InvalidResponse(String),
    #[error("image generation rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Square,
    Landscape,
    Portrait,
}

pub fn classify(width: u32, height: u32) -> Orientation {
    if width == height {
        Orientation::Square
    } else if width > height {
        Orientation::Landscape
    } else {
        Orientation::Portrait
    }
}

/// Bounded generation size for a print area: the larger side lands on
/// `min(max_side, hard_cap)` preserving aspect, then both sides are clamped
/// to [`MIN_SIDE`].
pub fn generation_size(width: u32, height: u32, max_side: u32, hard_cap: u32) -> (u32, u32) {
    let bound = max_side.min(hard_cap).max(1);
    let (w, h) = match classify(width.max(1), height.max(1)) {
        Orientation::Square => (bound, bound),
        Orientation::Landscape => {
            let scaled = (height.max(1) as u64 * bound as u64 / width.max(1) as u64) as u32;
            (bound, scaled)
        }
        Orientation::Portrait => {
            let scaled = (width.max(1) as u64 * bound as u64 / height.max(1) as u64) as u32;
            (scaled, bound)
        }
    };
    (w.max(MIN_SIDE), h.max(MIN_SIDE))
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub prompt: String,
    pub style: Option<String>,
    pub colors: Option<String>,
    pub audience: Option<String>,
    /// `"WxH"`, already bounded by [`generation_size`].
    pub size: String,
    pub num_images: u32,
}

#[derive(Debug, Clone)]
pub enum ImageSubmit {
    Ready(Vec<String>),
    Pending { request_id: String, model: String },
}

#[derive(Debug, Clone)]
pub enum ImagePoll {
    Ready(Vec<String>),
    Pending,
    Failed(String),
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn submit(&self, request: &ImageRequest) -> Result<ImageSubmit, ImageError>;

    /// Poll one pending request. Routing must match the provider that
    /// issued the job, hence the `model` passthrough.
    async fn poll(&self, request_id: &str, model: &str) -> Result<ImagePoll, ImageError>;
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub max_attempts: u32,
    /// First poll fires sooner than the rest; typical jobs finish within a
    /// few seconds.
    pub first_delay: Duration,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: config::image_poll_max_attempts(),
            first_delay: config::image_poll_first_delay(),
            interval: config::image_poll_interval(),
        }
    }
}

/// Submit a generation request and, if the backend answers with a pending
/// marker, poll to completion.
///
/// `Ok(Some(url))` on success, `Ok(None)` on explicit failure or poll
/// exhaustion. Poll transport errors are tolerated until the final two
/// attempts.
pub async fn resolve_image(
    generator: &dyn ImageGenerator,
    request: &ImageRequest,
    settings: &PollSettings,
) -> Result<Option<String>, ImageError> {
    let (request_id, model) = match generator.submit(request).await? {
        ImageSubmit::Ready(urls) => return Ok(urls.into_iter().next()),
        ImageSubmit::Pending { request_id, model } => (request_id, model),
    };

    for attempt in 1..=settings.max_attempts {
        let wait = if attempt == 1 {
            settings.first_delay
        } else {
            settings.interval
        };
        sleep(wait).await;

        match generator.poll(&request_id, &model).await {
            Ok(ImagePoll::Ready(urls)) => return Ok(urls.into_iter().next()),
            Ok(ImagePoll::Pending) => {}
            Ok(ImagePoll::Failed(reason)) => {
                warn!(
                    target = "podforge.genai",
                    request_id, model, reason, "image generation failed"
                );
                return Ok(None);
            }
            Err(err) => {
                if attempt + 2 > settings.max_attempts {
                    return Err(err);
                }
                warn!(
                    target = "podforge.genai",
                    request_id, attempt, error = %err, "poll error, will retry"
                );
            }
        }
    }

    warn!(
        target = "podforge.genai",
        request_id, model, "image generation timed out"
    );
    Ok(None)
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    images: Vec<ImageEntry>,
    #[serde(default)]
    pending: bool,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollRequest<'a> {
    status_only: bool,
    request_id: &'a str,
    model: &'a str,
}

pub struct ImageClient {
    http: Client,
    fetcher: Fetcher,
}

impl ImageClient {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            http: build_client(),
            fetcher,
        }
    }

    async fn parse(response: reqwest::Response) -> Result<ImageResponse, ImageError> {
        response
            .json()
            .await
            .map_err(|err| ImageError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl ImageGenerator for ImageClient {
    async fn submit(&self, request: &ImageRequest) -> Result<ImageSubmit, ImageError> {
        let url = format!("{}/images", *GENAI_ROOT);
        let response = self
            .fetcher
            .execute("images", self.http.post(url).json(request))
            .await?;
        let payload = Self::parse(response).await?;
        if !payload.success {
            return Err(ImageError::Rejected(
                payload.error.unwrap_or_else(|| "no error detail".into()),
            ));
        }
        if payload.pending {
            let request_id = payload
                .request_id
                .ok_or_else(|| ImageError::InvalidResponse("pending without request_id".into()))?;
            let model = payload
                .model
                .ok_or_else(|| ImageError::InvalidResponse("pending without model".into()))?;
            return Ok(ImageSubmit::Pending { request_id, model });
        }
        Ok(ImageSubmit::Ready(
            payload.images.into_iter().map(|entry| entry.url).collect(),
        ))
    }

    async fn poll(&self, request_id: &str, model: &str) -> Result<ImagePoll, ImageError> {
        let url = format!("{}/images", *GENAI_ROOT);
        let body = PollRequest {
            status_only: true,
            request_id,
            model,
        };
        let response = self
            .fetcher
            .execute("images", self.http.post(url).json(&body))
            .await?;
        let payload = Self::parse(response).await?;
        if payload.pending {
            return Ok(ImagePoll::Pending);
        }
        if !payload.success {
            return Ok(ImagePoll::Failed(
                payload.error.unwrap_or_else(|| "no error detail".into()),
            ));
        }
        Ok(ImagePoll::Ready(
            payload.images.into_iter().map(|entry| entry.url).collect(),
        ))
    }
}
