use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::lifecycle::cancel_orphan;
use super::models::{MediaType, NewGenerationTask, Platform, TaskPayload, TaskStatus};
use super::store::StoreError;
use crate::config;
use crate::context::AppContext;
use crate::credits::LedgerError;
use crate::pricing::{find_model, price, ModelSpec};
use crate::providers::{ProviderAdapter, ProviderError, ProviderSubmission, SettlementMode};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("model `{0}` not found")]
    ModelNotFound(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },
    #[error("at most {limit} video generations may run at once")]
    RateLimitExceeded { limit: i64 },
    #[error("{0} is not configured")]
    ProviderUnavailable(Platform),
    #[error("provider submission failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("task store error: {0}")]
    Store(#[from] StoreError),
    #[error("credit ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Per-user admission limits applied before any provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionLimits {
    pub max_concurrent_videos: i64,
    pub max_batch: u32,
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            max_concurrent_videos: 3,
            max_batch: 4,
        }
    }
}

impl SubmissionLimits {
    pub fn from_env() -> Self {
        Self {
            max_concurrent_videos: *config::MAX_CONCURRENT_VIDEO_TASKS,
            max_batch: *config::MAX_BATCH_SIZE,
        }
    }
}

/// Body of a generation request. Model parameters sit at the top level beside `tool` and
/// `model`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub tool: String,
    pub model: String,
    /// Number of identical jobs to start. Defaults to one.
    #[serde(default)]
    pub num_images: Option<u32>,
    #[serde(flatten)]
    pub params: TaskPayload,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubmitResponse {
    /// First task of the batch.
    pub task_id: Uuid,
    pub task_ids: Vec<Uuid>,
    /// Price of a single job.
    pub cost: i64,
}

/// key: submission-service -> price, check, submit, persist
#[derive(Clone)]
pub struct SubmissionService {
    ctx: AppContext,
}

impl SubmissionService {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Validates and prices a request, checks the user's balance against the batch total plus
    /// the quoted cost of their in-flight tasks, then submits each job to the provider and
    /// persists it. A failed admission check returns before any provider call or row write.
    ///
    /// Jobs in a batch are independent. The call succeeds with whichever jobs were accepted
    /// and fails with the first error only when none were.
    pub async fn submit(
        &self,
        user_id: Uuid,
        request: GenerationRequest,
    ) -> Result<SubmitResponse, SubmitError> {
        let GenerationRequest {
            tool,
            model,
            num_images,
            params,
        } = request;
        let tool = tool.trim().to_string();
        if tool.is_empty() {
            return Err(SubmitError::InvalidParams("tool is required".into()));
        }
        let limits = self.ctx.limits;
        let count = num_images.unwrap_or(1);
        if count == 0 || count > limits.max_batch {
            return Err(SubmitError::InvalidParams(format!(
                "num_images must be between 1 and {}",
                limits.max_batch
            )));
        }
        let spec = find_model(model.trim()).ok_or(SubmitError::ModelNotFound(model))?;
        spec.validate(&params).map_err(SubmitError::InvalidParams)?;
        let adapter = self
            .ctx
            .providers
            .get(spec.platform)
            .ok_or(SubmitError::ProviderUnavailable(spec.platform))?;

        let cost = price(
            spec.platform,
            spec.id,
            params.resolution.as_deref(),
            params.duration,
        )
        .map_err(|err| SubmitError::InvalidParams(err.to_string()))?;

        if spec.media_type == MediaType::Video {
            let running = self
                .ctx
                .store
                .count_in_flight(user_id, MediaType::Video)
                .await?;
            if running + i64::from(count) > limits.max_concurrent_videos {
                info!(%user_id, model = spec.id, running, "submission rejected: video limit");
                return Err(SubmitError::RateLimitExceeded {
                    limit: limits.max_concurrent_videos,
                });
            }
        }

        let outstanding = self.ctx.store.outstanding_cost(user_id).await?;
        let required = cost * i64::from(count) + outstanding;
        if !self.ctx.ledger.reserve_check(user_id, required).await? {
            let available = self.ctx.ledger.balance(user_id).await?;
            info!(
                %user_id,
                model = spec.id,
                required,
                available,
                "submission rejected: insufficient credits"
            );
            return Err(SubmitError::InsufficientCredits {
                required,
                available,
            });
        }

        let job = Job {
            user_id,
            spec,
            adapter: adapter.as_ref(),
            payload: &params,
            tool: &tool,
            cost,
        };
        let results = join_all((0..count).map(|_| self.submit_one(&job))).await;
        let mut task_ids = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(task_id) => task_ids.push(task_id),
                Err(err) => failures.push(err),
            }
        }
        let Some(&task_id) = task_ids.first() else {
            return Err(failures.into_iter().next().unwrap_or_else(|| {
                SubmitError::InvalidParams("num_images must be at least 1".into())
            }));
        };
        for err in &failures {
            warn!(?err, %user_id, model = spec.id, "batch job failed");
        }
        Ok(SubmitResponse {
            task_id,
            task_ids,
            cost,
        })
    }

    async fn submit_one(&self, job: &Job<'_>) -> Result<Uuid, SubmitError> {
        let Job {
            user_id,
            spec,
            adapter,
            payload,
            tool,
            cost,
        } = *job;
        let callback_url = self.ctx.callback_url(spec.platform);
        let submitted = adapter
            .submit(ProviderSubmission {
                model: spec,
                payload,
                callback_url: callback_url.as_deref(),
            })
            .await
            .map_err(|err| {
                warn!(?err, %user_id, model = spec.id, "provider rejected submission");
                err
            })?;

        let reservation = (adapter.settlement_mode() == SettlementMode::Reservation).then(|| {
            (
                cost,
                json!({
                    "model": spec.id,
                    "resolution": payload.resolution,
                    "duration": payload.duration,
                }),
            )
        });
        let task = NewGenerationTask {
            user_id,
            platform: spec.platform,
            model: spec.id.to_string(),
            external_task_id: submitted.external_task_id.clone(),
            status: if submitted.confirmed {
                TaskStatus::Processing
            } else {
                TaskStatus::Pending
            },
            payload: payload.clone(),
            quoted_cost: cost,
            media_type: spec.media_type,
            tool: tool.to_string(),
        };

        match self.ctx.store.create_task(task, reservation).await {
            Ok(created) => {
                info!(
                    task_id = %created.id,
                    %user_id,
                    platform = %spec.platform,
                    model = spec.id,
                    external_task_id = %created.external_task_id,
                    cost,
                    "generation submitted"
                );
                Ok(created.id)
            }
            Err(err) => {
                error!(
                    ?err,
                    %user_id,
                    external_task_id = %submitted.external_task_id,
                    "failed to persist submitted task; cancelling provider job"
                );
                cancel_orphan(adapter, &submitted.external_task_id).await;
                Err(err.into())
            }
        }
    }
}

/// One accepted job of a batch, shared by every submission in it.
#[derive(Clone, Copy)]
struct Job<'a> {
    user_id: Uuid,
    spec: &'static ModelSpec,
    adapter: &'a dyn ProviderAdapter,
    payload: &'a TaskPayload,
    tool: &'a str,
    cost: i64,
}
