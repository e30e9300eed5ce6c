use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use super::models::{
    GenerationRecord, GenerationTask, InFlightFilter, MediaType, NewGenerationTask, Platform,
    RerouteUpdate, ReservationMapping, ReservationOutcome, TaskFilter, TaskPayload, TaskStatus,
    TerminalUpdate,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("task {external_task_id} already recorded for {platform}")]
    DuplicateExternalId {
        platform: Platform,
        external_task_id: String,
    },
    #[error("unreadable row: {0}")]
    Corrupt(String),
}

/// key: task-store -> durable task rows and reservation mappings
///
/// Every terminal transition goes through [`TaskStore::complete_task`], which only touches rows
/// still in a non-terminal status and reports whether it did. Callers perform side effects only
/// when it returns the updated row.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a task and, when given, its reservation mapping in one transaction.
    async fn create_task(
        &self,
        task: NewGenerationTask,
        reservation: Option<(i64, Value)>,
    ) -> Result<GenerationTask, StoreError>;

    async fn find_task(
        &self,
        platform: Platform,
        external_task_id: &str,
    ) -> Result<Option<GenerationTask>, StoreError>;

    /// Conditional terminal write. Returns the updated row when this call won the transition.
    async fn complete_task(
        &self,
        platform: Platform,
        external_task_id: &str,
        update: TerminalUpdate,
    ) -> Result<Option<GenerationTask>, StoreError>;

    /// Marks a non-terminal task as processing and records progress when known.
    async fn record_progress(
        &self,
        platform: Platform,
        external_task_id: &str,
        progress: Option<u8>,
    ) -> Result<bool, StoreError>;

    /// Points a non-terminal task at a fallback provider job. Returns false when the task
    /// reached a terminal status first, or when another caller already rerouted it.
    async fn reroute_task(&self, task_id: Uuid, update: RerouteUpdate) -> Result<bool, StoreError>;

    async fn flag_settlement_warning(&self, task_id: Uuid, warning: &str) -> Result<(), StoreError>;

    async fn list_tasks(
        &self,
        user_id: Uuid,
        filter: &TaskFilter,
    ) -> Result<Vec<GenerationTask>, StoreError>;

    /// Non-terminal tasks matching the filter, oldest first.
    async fn list_in_flight(
        &self,
        filter: &InFlightFilter,
    ) -> Result<Vec<GenerationTask>, StoreError>;

    /// Sum of quoted costs across the user's non-terminal tasks.
    async fn outstanding_cost(&self, user_id: Uuid) -> Result<i64, StoreError>;

    /// Number of the user's non-terminal tasks producing the given media type.
    async fn count_in_flight(
        &self,
        user_id: Uuid,
        media_type: MediaType,
    ) -> Result<i64, StoreError>;

    async fn reservation(
        &self,
        external_task_id: &str,
    ) -> Result<Option<ReservationMapping>, StoreError>;

    async fn close_reservation(
        &self,
        external_task_id: &str,
        outcome: ReservationOutcome,
        output_locator: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn record_generation(
        &self,
        task: &GenerationTask,
    ) -> Result<GenerationRecord, StoreError>;

    /// Maps output urls to the generation rows recorded for them.
    async fn generation_ids(
        &self,
        user_id: Uuid,
        media_type: MediaType,
        urls: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError>;
}

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const TASK_COLUMNS: &str = r#"
    id, user_id, platform, model, external_task_id, previous_external_task_id, status,
    payload, output, quoted_cost, cost, media_type, tool, progress, failure, failure_code,
    settlement_warning, created_at, submitted_at, updated_at
"#;

fn task_from_row(row: &PgRow) -> Result<GenerationTask, StoreError> {
    let platform: String = row.try_get("platform")?;
    let status: String = row.try_get("status")?;
    let media_type: String = row.try_get("media_type")?;
    let Json(payload): Json<TaskPayload> = row.try_get("payload")?;
    Ok(GenerationTask {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        platform: Platform::parse(&platform)
            .ok_or_else(|| StoreError::Corrupt(format!("platform `{platform}`")))?,
        model: row.try_get("model")?,
        external_task_id: row.try_get("external_task_id")?,
        previous_external_task_id: row.try_get("previous_external_task_id")?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("status `{status}`")))?,
        payload,
        output: row.try_get("output")?,
        quoted_cost: row.try_get("quoted_cost")?,
        cost: row.try_get("cost")?,
        media_type: MediaType::parse(&media_type)
            .ok_or_else(|| StoreError::Corrupt(format!("media type `{media_type}`")))?,
        tool: row.try_get("tool")?,
        progress: row.try_get("progress")?,
        failure: row.try_get("failure")?,
        failure_code: row.try_get("failure_code")?,
        settlement_warning: row.try_get("settlement_warning")?,
        created_at: row.try_get("created_at")?,
        submitted_at: row.try_get("submitted_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn reservation_from_row(row: &PgRow) -> Result<ReservationMapping, StoreError> {
    let outcome: Option<String> = row.try_get("outcome")?;
    Ok(ReservationMapping {
        external_task_id: row.try_get("external_task_id")?,
        task_id: row.try_get("task_id")?,
        user_id: row.try_get("user_id")?,
        reserved_credits: row.try_get("reserved_credits")?,
        output_locator: row.try_get("output_locator")?,
        metadata: row.try_get("metadata")?,
        outcome: outcome.as_deref().and_then(ReservationOutcome::parse),
        created_at: row.try_get("created_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn is_duplicate_external_id(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if db.constraint() == Some("generation_tasks_platform_external_task_id_key")
    )
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create_task(
        &self,
        task: NewGenerationTask,
        reservation: Option<(i64, Value)>,
    ) -> Result<GenerationTask, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO generation_tasks
                (id, user_id, platform, model, external_task_id, status, payload, quoted_cost,
                 media_type, tool)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(task.user_id)
        .bind(task.platform.as_str())
        .bind(&task.model)
        .bind(&task.external_task_id)
        .bind(task.status.as_str())
        .bind(Json(&task.payload))
        .bind(task.quoted_cost)
        .bind(task.media_type.as_str())
        .bind(&task.tool)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_duplicate_external_id(&err) {
                StoreError::DuplicateExternalId {
                    platform: task.platform,
                    external_task_id: task.external_task_id.clone(),
                }
            } else {
                StoreError::Db(err)
            }
        })?;
        let created = task_from_row(&row)?;

        if let Some((reserved_credits, metadata)) = reservation {
            sqlx::query(
                r#"
                INSERT INTO reservation_mappings
                    (external_task_id, task_id, user_id, reserved_credits, metadata)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&created.external_task_id)
            .bind(created.id)
            .bind(created.user_id)
            .bind(reserved_credits)
            .bind(metadata)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn find_task(
        &self,
        platform: Platform,
        external_task_id: &str,
    ) -> Result<Option<GenerationTask>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM generation_tasks
            WHERE platform = $1 AND external_task_id = $2
            "#
        ))
        .bind(platform.as_str())
        .bind(external_task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn complete_task(
        &self,
        platform: Platform,
        external_task_id: &str,
        update: TerminalUpdate,
    ) -> Result<Option<GenerationTask>, StoreError> {
        let row = match update {
            TerminalUpdate::Succeeded { output } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE generation_tasks
                    SET status = 'SUCCEEDED',
                        output = $3,
                        cost = quoted_cost,
                        progress = 100,
                        updated_at = NOW()
                    WHERE platform = $1
                      AND external_task_id = $2
                      AND status IN ('PENDING', 'PROCESSING')
                    RETURNING {TASK_COLUMNS}
                    "#
                ))
                .bind(platform.as_str())
                .bind(external_task_id)
                .bind(output)
                .fetch_optional(&self.pool)
                .await?
            }
            TerminalUpdate::Failed {
                failure,
                failure_code,
            } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE generation_tasks
                    SET status = 'FAILED',
                        failure = $3,
                        failure_code = $4,
                        cost = 0,
                        updated_at = NOW()
                    WHERE platform = $1
                      AND external_task_id = $2
                      AND status IN ('PENDING', 'PROCESSING')
                    RETURNING {TASK_COLUMNS}
                    "#
                ))
                .bind(platform.as_str())
                .bind(external_task_id)
                .bind(failure)
                .bind(failure_code)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(task_from_row).transpose()
    }

    async fn record_progress(
        &self,
        platform: Platform,
        external_task_id: &str,
        progress: Option<u8>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_tasks
            SET status = 'PROCESSING',
                progress = COALESCE($3, progress),
                updated_at = NOW()
            WHERE platform = $1
              AND external_task_id = $2
              AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(platform.as_str())
        .bind(external_task_id)
        .bind(progress.map(i32::from))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reroute_task(&self, task_id: Uuid, update: RerouteUpdate) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_tasks
            SET previous_external_task_id = external_task_id,
                external_task_id = $2,
                platform = $3,
                model = $4,
                payload = $5,
                status = 'PENDING',
                progress = NULL,
                submitted_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND external_task_id = $6
              AND previous_external_task_id IS NULL
              AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(task_id)
        .bind(&update.external_task_id)
        .bind(update.platform.as_str())
        .bind(&update.model)
        .bind(Json(&update.payload))
        .bind(&update.expected_external_task_id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_duplicate_external_id(&err) {
                StoreError::DuplicateExternalId {
                    platform: update.platform,
                    external_task_id: update.external_task_id.clone(),
                }
            } else {
                StoreError::Db(err)
            }
        })?;
        Ok(result.rows_affected() == 1)
    }

    async fn flag_settlement_warning(
        &self,
        task_id: Uuid,
        warning: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE generation_tasks SET settlement_warning = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(task_id)
        .bind(warning)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_tasks(
        &self,
        user_id: Uuid,
        filter: &TaskFilter,
    ) -> Result<Vec<GenerationTask>, StoreError> {
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM generation_tasks
            WHERE user_id = $1
              AND media_type = $2
              AND (cardinality($3::uuid[]) = 0 OR id = ANY($3))
              AND (cardinality($4::text[]) = 0 OR status = ANY($4))
              AND ($5::text IS NULL OR tool = $5)
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .bind(filter.media_type.as_str())
        .bind(&filter.task_ids)
        .bind(&statuses)
        .bind(filter.tool.as_deref())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn list_in_flight(
        &self,
        filter: &InFlightFilter,
    ) -> Result<Vec<GenerationTask>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM generation_tasks
            WHERE platform = $1
              AND status IN ('PENDING', 'PROCESSING')
              AND ($2::uuid IS NULL OR user_id = $2)
              AND ($3::timestamptz IS NULL OR submitted_at < $3)
            ORDER BY submitted_at ASC
            LIMIT $4
            "#
        ))
        .bind(filter.platform.as_str())
        .bind(filter.user_id)
        .bind(filter.submitted_before)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn outstanding_cost(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quoted_cost), 0)::BIGINT
            FROM generation_tasks
            WHERE user_id = $1 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn count_in_flight(
        &self,
        user_id: Uuid,
        media_type: MediaType,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM generation_tasks
            WHERE user_id = $1 AND media_type = $2 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(user_id)
        .bind(media_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn reservation(
        &self,
        external_task_id: &str,
    ) -> Result<Option<ReservationMapping>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT external_task_id, task_id, user_id, reserved_credits, output_locator, metadata,
                   outcome, created_at, settled_at
            FROM reservation_mappings
            WHERE external_task_id = $1
            "#,
        )
        .bind(external_task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn close_reservation(
        &self,
        external_task_id: &str,
        outcome: ReservationOutcome,
        output_locator: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE reservation_mappings
            SET outcome = $2,
                output_locator = COALESCE($3, output_locator),
                settled_at = NOW()
            WHERE external_task_id = $1 AND outcome IS NULL
            "#,
        )
        .bind(external_task_id)
        .bind(outcome.as_str())
        .bind(output_locator)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_generation(
        &self,
        task: &GenerationTask,
    ) -> Result<GenerationRecord, StoreError> {
        let url = task
            .output
            .clone()
            .ok_or_else(|| StoreError::Corrupt(format!("task {} has no output", task.id)))?;
        let record = GenerationRecord {
            id: Uuid::new_v4(),
            user_id: task.user_id,
            task_id: task.id,
            media_type: task.media_type,
            url,
            tool: task.tool.clone(),
            model: task.model.clone(),
            prompt: task.payload.prompt.clone(),
            meta_data: task.payload.meta_data.clone(),
            created_at: Utc::now(),
        };
        let statement = match record.media_type {
            MediaType::Image => {
                r#"
                INSERT INTO image_generations
                    (id, user_id, task_id, url_path, tool, model, prompt, meta_data, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#
            }
            MediaType::Video => {
                r#"
                INSERT INTO video_generations
                    (id, user_id, task_id, video_url, tool, model, prompt, meta_data, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#
            }
        };
        sqlx::query(statement)
            .bind(record.id)
            .bind(record.user_id)
            .bind(record.task_id)
            .bind(&record.url)
            .bind(&record.tool)
            .bind(&record.model)
            .bind(record.prompt.as_deref())
            .bind(record.meta_data.clone())
            .bind(record.created_at)
            .execute(&self.pool)
            .await?;
        Ok(record)
    }

    async fn generation_ids(
        &self,
        user_id: Uuid,
        media_type: MediaType,
        urls: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        if urls.is_empty() {
            return Ok(HashMap::new());
        }
        let statement = match media_type {
            MediaType::Image => {
                r#"
                SELECT id, url_path AS url
                FROM image_generations
                WHERE user_id = $1 AND url_path = ANY($2)
                "#
            }
            MediaType::Video => {
                r#"
                SELECT id, video_url AS url
                FROM video_generations
                WHERE user_id = $1 AND video_url = ANY($2)
                "#
            }
        };
        let rows = sqlx::query(statement)
            .bind(user_id)
            .bind(urls)
            .fetch_all(&self.pool)
            .await?;
        let mut ids = HashMap::with_capacity(rows.len());
        for row in rows {
            let url: String = row.try_get("url")?;
            let id: Uuid = row.try_get("id")?;
            ids.insert(url, id);
        }
        Ok(ids)
    }
}
