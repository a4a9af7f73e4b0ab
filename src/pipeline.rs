//! Per-job generation orchestration.
//!
//! One "generate all" pass runs jobs strictly sequentially: a job's content
//! and image stages fully resolve before the next job starts. A failed job
//! marks only its own row; siblings proceed.

use crate::config;
use crate::fetch::Fetcher;
use crate::genai::{
    ContentClient, ContentGenerator, ContentRequest, ImageClient, ImageGenerator, ImageRequest,
    PollSettings, generation_size, resolve_image,
};
use crate::jobs::{JobStatus, build_jobs};
use crate::models::GenerationBrief;
use crate::session::SessionState;
use crate::snapshot::SnapshotStore;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    /// Unmet precondition with no safe partial progress (missing store
    /// selection, missing credential).
    Fatal,
    CredentialExpired,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn fatal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Fatal,
        }
    }

    pub fn credential_expired(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::CredentialExpired,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub product_id: String,
    pub position: String,
    pub elapsed_ms: u128,
    #[serde(flatten)]
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub jobs: Vec<JobReport>,
    pub generated: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
}

pub struct GenerationPipeline {
    content: Arc<dyn ContentGenerator>,
    images: Arc<dyn ImageGenerator>,
    poll: PollSettings,
    max_side: u32,
    hard_cap: u32,
}

impl GenerationPipeline {
    pub fn new(
        content: Arc<dyn ContentGenerator>,
        images: Arc<dyn ImageGenerator>,
        poll: PollSettings,
        max_side: u32,
        hard_cap: u32,
    ) -> Self {
        Self {
            content,
            images,
            poll,
            max_side,
            hard_cap,
        }
    }

    pub fn from_env(fetcher: &Fetcher) -> Self {
        Self::new(
            Arc::new(ContentClient::new(fetcher.clone())),
            Arc::new(ImageClient::new(fetcher.clone())),
            PollSettings::default(),
            config::generation_max_side(),
            config::generation_hard_cap(),
        )
    }

    /// Run content + image generation for every job the session's designs
    /// expand to. Persists a snapshot after each state mutation.
    pub async fn run_batch(
        &self,
        session_id: &str,
        state: &mut SessionState,
        brief: &GenerationBrief,
        store: &SnapshotStore,
    ) -> BatchReport {
        let started = Instant::now();
        let jobs = build_jobs(&state.product_designs);
        let mut reports = Vec::with_capacity(jobs.len());

        for job in jobs {
            let job_started = Instant::now();

            // Completed generations are cache hits, never re-billed.
            if let Some(existing) = state.generated_images.get(&job.job_id) {
                reports.push(JobReport {
                    job_id: job.job_id.clone(),
                    product_id: job.product_id.clone(),
                    position: job.placement.position.clone(),
                    elapsed_ms: 0,
                    status: JobStatus::Done {
                        image_url: existing.clone(),
                    },
                });
                continue;
            }

            let status = self.run_job(session_id, state, brief, &job).await;
            store.save(session_id, &state.to_snapshot()).await;

            let elapsed_ms = job_started.elapsed().as_millis();
            crate::metrics::job_elapsed(&job.job_id, elapsed_ms);
            reports.push(JobReport {
                job_id: job.job_id.clone(),
                product_id: job.product_id.clone(),
                position: job.placement.position.clone(),
                elapsed_ms,
                status,
            });
        }

        let generated = reports
            .iter()
            .filter(|r| matches!(r.status, JobStatus::Done { .. }))
            .count();
        let failed = reports.len() - generated;
        info!(
            target = "podforge.pipeline",
            session_id,
            jobs = reports.len(),
            generated,
            failed,
            "generation batch finished"
        );
        BatchReport {
            jobs: reports,
            generated,
            failed,
            elapsed_ms: started.elapsed().as_millis(),
        }
    }

    async fn run_job(
        &self,
        session_id: &str,
        state: &mut SessionState,
        brief: &GenerationBrief,
        job: &crate::jobs::GenerationJob,
    ) -> JobStatus {
        let product_id = job.product_id.as_str();
        // Content is generated once per product and shared across its
        // placements.
        if !state.product_content.contains_key(product_id) {
            let product_info = state
                .catalog_products
                .get(product_id)
                .and_then(|p| serde_json::to_value(p).ok())
                .unwrap_or(serde_json::Value::Null);
            let request = ContentRequest {
                prompt: brief.prompt.clone(),
                style: brief.style.clone(),
                colors: brief.colors.clone(),
                audience: brief.audience.clone(),
                content_type: "product-content",
                product_id: product_id.to_string(),
                product_info,
            };
            match self.content.generate(&request).await {
                Ok(content) => {
                    state.product_content.insert(product_id.to_string(), content);
                }
                Err(err) => {
                    warn!(
                        target = "podforge.pipeline",
                        session_id,
                        job_id = %job.job_id,
                        error = %err,
                        "content stage failed"
                    );
                    return JobStatus::Failed {
                        error: format!("content: {err}"),
                    };
                }
            }
        }

        let (width, height) = generation_size(
            job.placement.width,
            job.placement.height,
            self.max_side,
            self.hard_cap,
        );
        let request = ImageRequest {
            prompt: brief.prompt.clone(),
            style: brief.style.clone(),
            colors: brief.colors.clone(),
            audience: brief.audience.clone(),
            size: format!("{width}x{height}"),
            num_images: 1,
        };

        match resolve_image(self.images.as_ref(), &request, &self.poll).await {
            Ok(Some(url)) => {
                state.generated_images.insert(job.job_id.clone(), url.clone());
                JobStatus::Done { image_url: url }
            }
            Ok(None) => JobStatus::Failed {
                error: "image generation failed or timed out".into(),
            },
            Err(err) => {
                warn!(
                    target = "podforge.pipeline",
                    session_id,
                    job_id = %job.job_id,
                    error = %err,
                    "image stage failed"
                );
                JobStatus::Failed {
                    error: format!("image: {err}"),
                }
            }
        }
    }
}

/// Owns the live sessions and runs pipeline passes against them.
#[derive(Clone)]
pub struct Workflow {
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
    store: SnapshotStore,
    pipeline: Arc<GenerationPipeline>,
}

impl Workflow {
    pub fn new(store: SnapshotStore, pipeline: GenerationPipeline) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            store,
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub async fn create_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let state = SessionState::default();
        self.store.save(&id, &state.to_snapshot()).await;
        self.sessions.lock().await.insert(id.clone(), state);
        id
    }

    /// Fetch a session, falling back to its stored snapshot after a
    /// restart. Unknown ids are `None`.
    pub async fn get(&self, session_id: &str) -> Option<SessionState> {
        if let Some(state) = self.sessions.lock().await.get(session_id) {
            return Some(state.clone());
        }
        let snapshot = self.store.load(session_id).await?;
        let state = SessionState::from_snapshot(snapshot);
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), state.clone());
        Some(state)
    }

    pub async fn replace(&self, session_id: &str, state: SessionState) {
        self.store.save(session_id, &state.to_snapshot()).await;
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), state);
    }

    /// Mutate a session and persist the snapshot afterwards.
    pub async fn update<F>(&self, session_id: &str, mutate: F) -> Result<SessionState, PipelineError>
    where
        F: FnOnce(&mut SessionState) -> Result<(), PipelineError>,
    {
        let mut state = self
            .get(session_id)
            .await
            .ok_or_else(|| PipelineError::invalid_input("session", "unknown_session"))?;
        mutate(&mut state)?;
        self.replace(session_id, state.clone()).await;
        Ok(state)
    }

    pub async fn run_generation(
        &self,
        session_id: &str,
        brief: &GenerationBrief,
    ) -> Result<BatchReport, PipelineError> {
        if brief.prompt.trim().is_empty() {
            return Err(PipelineError::invalid_input("generate", "empty_prompt"));
        }
        let mut state = self
            .get(session_id)
            .await
            .ok_or_else(|| PipelineError::invalid_input("generate", "unknown_session"))?;
        let report = self
            .pipeline
            .run_batch(session_id, &mut state, brief, &self.store)
            .await;
        self.replace(session_id, state).await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genai::{ContentError, ImageError, ImagePoll, ImageSubmit};
    use crate::models::{GeneratedContent, PlacementSelection};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockContent {
        calls: AtomicU32,
        fail_products: Vec<String>,
    }

    impl MockContent {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_products: vec![],
            }
        }

        fn failing_for(product_id: &str) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_products: vec![product_id.to_string()],
            }
        }
    }

    #[async_trait]
    impl ContentGenerator for MockContent {
        async fn generate(
            &self,
            request: &ContentRequest,
        ) -> Result<GeneratedContent, ContentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_products.contains(&request.product_id) {
                return Err(ContentError::Rejected("no copy for you".into()));
            }
            Ok(GeneratedContent {
                title: format!("{} art", request.product_id),
                description: "generated".into(),
                tags: vec!["art".into()],
                key_features: vec![],
                materials: vec![],
            })
        }
    }

    struct MockImages {
        submits: AtomicU32,
    }

    #[async_trait]
    impl ImageGenerator for MockImages {
        async fn submit(&self, request: &ImageRequest) -> Result<ImageSubmit, ImageError> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(ImageSubmit::Ready(vec![format!(
                "https://img.example/{}-{n}.png",
                request.size
            )]))
        }

        async fn poll(&self, _request_id: &str, _model: &str) -> Result<ImagePoll, ImageError> {
            Ok(ImagePoll::Pending)
        }
    }

    fn placement(position: &str, width: u32, height: u32) -> PlacementSelection {
        PlacementSelection {
            position: position.into(),
            width,
            height,
            technique: None,
        }
    }

    fn pipeline(content: MockContent, images: MockImages) -> GenerationPipeline {
        GenerationPipeline::new(
            Arc::new(content),
            Arc::new(images),
            PollSettings {
                max_attempts: 3,
                first_delay: std::time::Duration::from_millis(1),
                interval: std::time::Duration::from_millis(1),
            },
            2048,
            4096,
        )
    }

    fn state_with_designs() -> SessionState {
        let mut state = SessionState::default();
        state.selected_products.insert("tee-1".into());
        state.selected_products.insert("mug-2".into());
        state.product_designs.insert(
            "tee-1".into(),
            vec![placement("front", 3000, 3000), placement("back", 4000, 2000)],
        );
        state
            .product_designs
            .insert("mug-2".into(), vec![placement("wrap", 2000, 1000)]);
        state
    }

    #[tokio::test]
    async fn content_is_generated_once_per_product() {
        let pipeline = pipeline(
            MockContent::new(),
            MockImages {
                submits: AtomicU32::new(0),
            },
        );
        let mut state = state_with_designs();
        let store = SnapshotStore::in_memory();
        let brief = GenerationBrief {
            prompt: "prompt".into(),
            ..Default::default()
        };

        let report = pipeline.run_batch("s-1", &mut state, &brief, &store).await;
        assert_eq!(report.generated, 3);
        assert_eq!(report.failed, 0);
        // two products, three placements: exactly two content calls
        assert_eq!(state.product_content.len(), 2);
        assert_eq!(state.generated_images.len(), 3);
        assert!(state.generated_images.contains_key("tee-1_front"));
        assert!(state.generated_images.contains_key("tee-1_back"));
        assert!(state.generated_images.contains_key("mug-2_wrap"));
    }

    #[tokio::test]
    async fn content_failure_is_isolated_to_that_products_jobs() {
        let pipeline = pipeline(
            MockContent::failing_for("mug-2"),
            MockImages {
                submits: AtomicU32::new(0),
            },
        );
        let mut state = state_with_designs();
        let store = SnapshotStore::in_memory();
        let brief = GenerationBrief {
            prompt: "prompt".into(),
            ..Default::default()
        };

        let report = pipeline.run_batch("s-1", &mut state, &brief, &store).await;
        assert_eq!(report.generated, 2);
        assert_eq!(report.failed, 1);
        let failed: Vec<&str> = report
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Failed { .. }))
            .map(|j| j.job_id.as_str())
            .collect();
        assert_eq!(failed, vec!["mug-2_wrap"]);
    }

    #[tokio::test]
    async fn completed_generations_are_not_resubmitted() {
        let images = MockImages {
            submits: AtomicU32::new(0),
        };
        let pipeline = pipeline(MockContent::new(), images);
        let mut state = state_with_designs();
        state
            .generated_images
            .insert("tee-1_front".into(), "https://img.example/kept.png".into());
        let store = SnapshotStore::in_memory();
        let brief = GenerationBrief {
            prompt: "prompt".into(),
            ..Default::default()
        };

        let report = pipeline.run_batch("s-1", &mut state, &brief, &store).await;
        assert_eq!(report.generated, 3);
        assert_eq!(
            state.generated_images.get("tee-1_front").map(String::as_str),
            Some("https://img.example/kept.png")
        );
    }

    #[tokio::test]
    async fn snapshot_is_persisted_during_the_batch() {
        let pipeline = pipeline(
            MockContent::new(),
            MockImages {
                submits: AtomicU32::new(0),
            },
        );
        let mut state = state_with_designs();
        let store = SnapshotStore::in_memory();
        let brief = GenerationBrief {
            prompt: "prompt".into(),
            ..Default::default()
        };

        pipeline.run_batch("s-1", &mut state, &brief, &store).await;
        let stored = store.load("s-1").await.expect("snapshot");
        let restored = SessionState::from_snapshot(stored);
        assert_eq!(restored.generated_images.len(), 3);
    }

    #[tokio::test]
    async fn workflow_rejects_empty_prompts_and_unknown_sessions() {
        let workflow = Workflow::new(
            SnapshotStore::in_memory(),
            pipeline(
                MockContent::new(),
                MockImages {
                    submits: AtomicU32::new(0),
                },
            ),
        );
        let empty = GenerationBrief::default();
        let err = workflow
            .run_generation("nope", &empty)
            .await
            .expect_err("empty prompt");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);

        let brief = GenerationBrief {
            prompt: "prompt".into(),
            ..Default::default()
        };
        let err = workflow
            .run_generation("nope", &brief)
            .await
            .expect_err("unknown session");
        assert_eq!(err.detail(), "unknown_session");
    }
}
