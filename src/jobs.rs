use crate::models::ApiError;
use crate::pipeline::IngestPipeline;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::warn;
use uuid::Uuid;

/// Background ingestion queue. The worker loop spawns each dequeued job as
/// its own task, so a slow sweep never blocks webhook-triggered
/// ingestions behind it.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

struct Job {
    id: Uuid,
    task: JobTask,
}

#[derive(Clone, Debug)]
pub enum JobTask {
    Ingest {
        product_ref: String,
        tags: Vec<String>,
    },
    Sweep,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: serde_json::Value },
    Failed { error: String },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(pipeline: IngestPipeline) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let pipeline = pipeline.clone();
                let statuses = statuses_bg.clone();
                tokio::spawn(async move {
                    {
                        let mut guard = statuses.lock().await;
                        guard.insert(job.id, JobState::Running);
                    }
                    let state = run_job(&pipeline, &job.task).await;
                    let mut guard = statuses.lock().await;
                    guard.insert(job.id, state);
                });
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_ingest(
        &self,
        product_ref: String,
        tags: Vec<String>,
    ) -> Result<Uuid, ApiError> {
        self.enqueue(JobTask::Ingest { product_ref, tags }).await
    }

    pub async fn enqueue_sweep(&self) -> Result<Uuid, ApiError> {
        self.enqueue(JobTask::Sweep).await
    }

    async fn enqueue(&self, task: JobTask) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, JobState::Queued);
        }
        self.tx.send(Job { id, task }).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

async fn run_job(pipeline: &IngestPipeline, task: &JobTask) -> JobState {
    match task {
        JobTask::Ingest { product_ref, tags } => match pipeline.ingest(product_ref, tags).await {
            Ok(outcome) => JobState::Completed {
                result: serde_json::to_value(&outcome).unwrap_or_default(),
            },
            Err(err) => {
                warn!(
                    target = "argus.jobs",
                    product_ref,
                    error = %err,
                    "ingest_job_failed"
                );
                JobState::Failed {
                    error: err.to_string(),
                }
            }
        },
        JobTask::Sweep => match pipeline.ingest_all().await {
            Ok(summary) => JobState::Completed {
                result: serde_json::to_value(&summary).unwrap_or_default(),
            },
            Err(err) => {
                warn!(target = "argus.jobs", error = %err, "sweep_job_failed");
                JobState::Failed {
                    error: err.to_string(),
                }
            }
        },
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
