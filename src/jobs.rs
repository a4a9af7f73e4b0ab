//! Job identity and the generation batch queue.
//!
//! One job per `(product, placement)` pair. The job id
//! `"{product_id}_{position}"` doubles as the UI row key and the
//! generated-image cache key, so rebuilding jobs from the same selections
//! never duplicates rows or re-bills completed generations.

use crate::models::{GenerationBrief, PlacementSelection, placement_key};
use crate::pipeline::{BatchReport, Workflow};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct GenerationJob {
    pub job_id: String,
    pub product_id: String,
    pub placement: PlacementSelection,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Generating,
    Done { image_url: String },
    Failed { error: String },
}

/// Expand the design selections into generation jobs, deterministically
/// ordered and de-duplicated on job id.
pub fn build_jobs(designs: &BTreeMap<String, Vec<PlacementSelection>>) -> Vec<GenerationJob> {
    let mut seen = HashSet::new();
    let mut jobs = Vec::new();
    for (product_id, placements) in designs {
        for placement in placements {
            let job_id = placement_key(product_id, &placement.position);
            if !seen.insert(job_id.clone()) {
                continue;
            }
            jobs.push(GenerationJob {
                job_id,
                product_id: product_id.clone(),
                placement: placement.clone(),
                status: JobStatus::Pending,
            });
        }
    }
    jobs
}

#[derive(Clone)]
pub struct BatchQueue {
    tx: mpsc::Sender<BatchJob>,
    statuses: Arc<Mutex<HashMap<Uuid, BatchState>>>,
}

struct BatchJob {
    id: Uuid,
    session_id: String,
    brief: GenerationBrief,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    Running,
    Completed {
        report: BatchReport,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct BatchInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: BatchState,
}

impl BatchQueue {
    /// Spawn the worker. Batches run one at a time; within a batch, jobs
    /// are strictly sequential as well.
    pub fn spawn(workflow: Workflow) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<BatchJob>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.insert(batch.id, BatchState::Running);
                }

                let result = workflow.run_generation(&batch.session_id, &batch.brief).await;
                let mut guard = statuses_bg.lock().await;
                match result {
                    Ok(report) => {
                        guard.insert(batch.id, BatchState::Completed { report });
                    }
                    Err(err) => {
                        guard.insert(
                            batch.id,
                            BatchState::Failed {
                                error: err.detail().to_string(),
                                stage: Some(err.stage().to_string()),
                            },
                        );
                    }
                }
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_generation(
        &self,
        session_id: String,
        brief: GenerationBrief,
    ) -> Result<Uuid, String> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, BatchState::Queued);
        }
        let job = BatchJob {
            id,
            session_id,
            brief,
        };
        self.tx
            .send(job)
            .await
            .map_err(|_| "worker not available".to_string())?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<BatchInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| BatchInfo {
            id: id.to_string(),
            state,
        })
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
