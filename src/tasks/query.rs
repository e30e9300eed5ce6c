use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::{GenerationTask, MediaType, Platform, TaskFilter, TaskStatus};
use super::store::StoreError;
use crate::context::AppContext;
use crate::reconciler::{ReconcileHandle, ReconcileJob};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StatusFilter {
    One(TaskStatus),
    Many(Vec<TaskStatus>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub task_ids: Vec<Uuid>,
    #[serde(default)]
    pub status: Option<StatusFilter>,
    /// Ignored when `task_ids` is given.
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default, rename = "type")]
    pub media_type: MediaType,
}

impl TaskQuery {
    fn filter(self) -> TaskFilter {
        let statuses = match self.status {
            Some(StatusFilter::One(status)) => vec![status],
            Some(StatusFilter::Many(statuses)) => statuses,
            None => Vec::new(),
        };
        let tool = if self.task_ids.is_empty() {
            self.tool.filter(|tool| !tool.trim().is_empty())
        } else {
            None
        };
        TaskFilter {
            task_ids: self.task_ids,
            statuses,
            tool,
            media_type: self.media_type,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskView {
    pub id: Uuid,
    pub status: TaskStatus,
    pub tool: String,
    pub model: String,
    pub prompt: Option<String>,
    pub output: Option<String>,
    pub progress: Option<i32>,
    pub quoted_cost: i64,
    pub cost: Option<i64>,
    pub failure: Option<String>,
    pub failure_code: Option<String>,
    pub generation_id: Option<Uuid>,
    pub meta_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<GenerationTask> for TaskView {
    fn from(task: GenerationTask) -> Self {
        Self {
            id: task.id,
            status: task.status,
            tool: task.tool,
            model: task.model,
            prompt: task.payload.prompt,
            output: task.output,
            progress: task.progress,
            quoted_cost: task.quoted_cost,
            cost: task.cost,
            failure: task.failure,
            failure_code: task.failure_code,
            generation_id: None,
            meta_data: task.payload.meta_data,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// key: query-service -> read path that schedules reconciliation without waiting on it
#[derive(Clone)]
pub struct QueryService {
    ctx: AppContext,
    reconciler: ReconcileHandle,
}

impl QueryService {
    pub fn new(ctx: AppContext, reconciler: ReconcileHandle) -> Self {
        Self { ctx, reconciler }
    }

    /// Returns the user's tasks as stored. For platforms with in-flight rows this also offers
    /// poll and timeout jobs to the reconciler; their effects show up on a later query.
    pub async fn query(
        &self,
        user_id: Uuid,
        query: TaskQuery,
    ) -> Result<Vec<TaskView>, StoreError> {
        let filter = query.filter();
        let tasks = self.ctx.store.list_tasks(user_id, &filter).await?;

        let in_flight: HashSet<Platform> = tasks
            .iter()
            .filter(|task| !task.status.is_terminal())
            .map(|task| task.platform)
            .collect();
        self.schedule_reconcile(user_id, in_flight);

        let outputs: Vec<String> = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Succeeded)
            .filter_map(|task| task.output.clone())
            .collect();
        let generation_ids = match self
            .ctx
            .store
            .generation_ids(user_id, filter.media_type, &outputs)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                warn!(?err, %user_id, "generation id lookup failed; returning tasks without ids");
                Default::default()
            }
        };

        Ok(tasks
            .into_iter()
            .map(|task| {
                let generation_id = task
                    .output
                    .as_ref()
                    .and_then(|url| generation_ids.get(url).copied());
                TaskView {
                    generation_id,
                    ..TaskView::from(task)
                }
            })
            .collect())
    }

    fn schedule_reconcile(&self, user_id: Uuid, platforms: HashSet<Platform>) {
        for platform in platforms {
            let Some(adapter) = self.ctx.providers.get(platform) else {
                continue;
            };
            let mut jobs = Vec::with_capacity(2);
            if adapter.capabilities().poll {
                jobs.push(ReconcileJob::PollInFlight { user_id, platform });
            }
            if adapter.timeout_threshold().is_some() {
                jobs.push(ReconcileJob::SweepTimeouts {
                    user_id: Some(user_id),
                    platform,
                });
            }
            for job in jobs {
                if let Err(err) = self.reconciler.dispatch(job) {
                    debug!(?err, %user_id, %platform, "reconcile job not scheduled");
                }
            }
        }
    }
}
