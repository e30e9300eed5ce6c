//! In-process store and ledger used by tests and local runs without Postgres. Conditional
//! writes hold the state lock for the whole check-and-set, matching the row-level guarantees of
//! the Postgres implementations.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::credits::{CreditLedger, LedgerError};
use crate::tasks::models::{
    GenerationRecord, GenerationTask, InFlightFilter, MediaType, NewGenerationTask, Platform,
    RerouteUpdate, ReservationMapping, ReservationOutcome, TaskFilter, TaskStatus, TerminalUpdate,
};
use crate::tasks::store::{StoreError, TaskStore};

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<Uuid, GenerationTask>,
    reservations: HashMap<String, ReservationMapping>,
    generations: Vec<GenerationRecord>,
    unreadable: HashSet<String>,
}

impl MemoryState {
    fn find_mut(
        &mut self,
        platform: Platform,
        external_task_id: &str,
    ) -> Option<&mut GenerationTask> {
        self.tasks
            .values_mut()
            .find(|task| task.platform == platform && task.external_task_id == external_task_id)
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn task(&self, task_id: Uuid) -> Option<GenerationTask> {
        self.lock().tasks.get(&task_id).cloned()
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn generations(&self) -> Vec<GenerationRecord> {
        self.lock().generations.clone()
    }

    /// Moves a task's creation and submission time, for exercising age-based sweeps.
    pub fn backdate(&self, task_id: Uuid, at: DateTime<Utc>) {
        if let Some(task) = self.lock().tasks.get_mut(&task_id) {
            task.created_at = at;
            task.submitted_at = at;
        }
    }

    /// Makes lookups of the given provider job fail as if the database were unreachable.
    pub fn fail_lookups_for(&self, external_task_id: &str) {
        self.lock().unreadable.insert(external_task_id.to_string());
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(
        &self,
        task: NewGenerationTask,
        reservation: Option<(i64, Value)>,
    ) -> Result<GenerationTask, StoreError> {
        let mut state = self.lock();
        if state.find_mut(task.platform, &task.external_task_id).is_some() {
            return Err(StoreError::DuplicateExternalId {
                platform: task.platform,
                external_task_id: task.external_task_id,
            });
        }
        let now = Utc::now();
        let created = GenerationTask {
            id: Uuid::new_v4(),
            user_id: task.user_id,
            platform: task.platform,
            model: task.model,
            external_task_id: task.external_task_id,
            previous_external_task_id: None,
            status: task.status,
            payload: task.payload,
            output: None,
            quoted_cost: task.quoted_cost,
            cost: None,
            media_type: task.media_type,
            tool: task.tool,
            progress: None,
            failure: None,
            failure_code: None,
            settlement_warning: None,
            created_at: now,
            submitted_at: now,
            updated_at: now,
        };
        if let Some((reserved_credits, metadata)) = reservation {
            state.reservations.insert(
                created.external_task_id.clone(),
                ReservationMapping {
                    external_task_id: created.external_task_id.clone(),
                    task_id: created.id,
                    user_id: created.user_id,
                    reserved_credits,
                    output_locator: None,
                    metadata,
                    outcome: None,
                    created_at: now,
                    settled_at: None,
                },
            );
        }
        state.tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_task(
        &self,
        platform: Platform,
        external_task_id: &str,
    ) -> Result<Option<GenerationTask>, StoreError> {
        let mut state = self.lock();
        if state.unreadable.contains(external_task_id) {
            return Err(StoreError::Db(sqlx::Error::PoolTimedOut));
        }
        Ok(state
            .find_mut(platform, external_task_id)
            .map(|task| task.clone()))
    }

    async fn complete_task(
        &self,
        platform: Platform,
        external_task_id: &str,
        update: TerminalUpdate,
    ) -> Result<Option<GenerationTask>, StoreError> {
        let mut state = self.lock();
        let Some(task) = state.find_mut(platform, external_task_id) else {
            return Ok(None);
        };
        if task.status.is_terminal() {
            return Ok(None);
        }
        match update {
            TerminalUpdate::Succeeded { output } => {
                task.status = TaskStatus::Succeeded;
                task.output = Some(output);
                task.cost = Some(task.quoted_cost);
                task.progress = Some(100);
            }
            TerminalUpdate::Failed {
                failure,
                failure_code,
            } => {
                task.status = TaskStatus::Failed;
                task.failure = failure;
                task.failure_code = failure_code;
                task.cost = Some(0);
            }
        }
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn record_progress(
        &self,
        platform: Platform,
        external_task_id: &str,
        progress: Option<u8>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.find_mut(platform, external_task_id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TaskStatus::Processing;
                if let Some(progress) = progress {
                    task.progress = Some(i32::from(progress));
                }
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reroute_task(&self, task_id: Uuid, update: RerouteUpdate) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state
            .find_mut(update.platform, &update.external_task_id)
            .is_some()
        {
            return Err(StoreError::DuplicateExternalId {
                platform: update.platform,
                external_task_id: update.external_task_id,
            });
        }
        match state.tasks.get_mut(&task_id) {
            Some(task)
                if !task.status.is_terminal()
                    && task.previous_external_task_id.is_none()
                    && task.external_task_id == update.expected_external_task_id =>
            {
                task.previous_external_task_id = Some(std::mem::replace(
                    &mut task.external_task_id,
                    update.external_task_id,
                ));
                task.platform = update.platform;
                task.model = update.model;
                task.payload = update.payload;
                task.status = TaskStatus::Pending;
                task.progress = None;
                let now = Utc::now();
                task.submitted_at = now;
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn flag_settlement_warning(
        &self,
        task_id: Uuid,
        warning: &str,
    ) -> Result<(), StoreError> {
        if let Some(task) = self.lock().tasks.get_mut(&task_id) {
            task.settlement_warning = Some(warning.to_string());
        }
        Ok(())
    }

    async fn list_tasks(
        &self,
        user_id: Uuid,
        filter: &TaskFilter,
    ) -> Result<Vec<GenerationTask>, StoreError> {
        let mut tasks: Vec<GenerationTask> = self
            .lock()
            .tasks
            .values()
            .filter(|task| task.user_id == user_id && filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn list_in_flight(
        &self,
        filter: &InFlightFilter,
    ) -> Result<Vec<GenerationTask>, StoreError> {
        let mut tasks: Vec<GenerationTask> = self
            .lock()
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        tasks.truncate(usize::try_from(filter.limit).unwrap_or(0));
        Ok(tasks)
    }

    async fn outstanding_cost(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|task| task.user_id == user_id && !task.status.is_terminal())
            .map(|task| task.quoted_cost)
            .sum())
    }

    async fn count_in_flight(
        &self,
        user_id: Uuid,
        media_type: MediaType,
    ) -> Result<i64, StoreError> {
        let count = self
            .lock()
            .tasks
            .values()
            .filter(|task| {
                task.user_id == user_id
                    && task.media_type == media_type
                    && !task.status.is_terminal()
            })
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn reservation(
        &self,
        external_task_id: &str,
    ) -> Result<Option<ReservationMapping>, StoreError> {
        Ok(self.lock().reservations.get(external_task_id).cloned())
    }

    async fn close_reservation(
        &self,
        external_task_id: &str,
        outcome: ReservationOutcome,
        output_locator: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(reservation) = self.lock().reservations.get_mut(external_task_id) {
            if reservation.outcome.is_none() {
                reservation.outcome = Some(outcome);
                if let Some(locator) = output_locator {
                    reservation.output_locator = Some(locator.to_string());
                }
                reservation.settled_at = Some(Utc::now());
            }
        }
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
        self.lock().generations.push(record.clone());
        Ok(record)
    }

    async fn generation_ids(
        &self,
        user_id: Uuid,
        media_type: MediaType,
        urls: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        Ok(self
            .lock()
            .generations
            .iter()
            .filter(|record| {
                record.user_id == user_id
                    && record.media_type == media_type
                    && urls.contains(&record.url)
            })
            .map(|record| (record.url.clone(), record.id))
            .collect())
    }
}

/// Ledger backed by a concurrent map. Each commit holds the user's entry for its
/// compare-and-decrement.
#[derive(Default)]
pub struct InMemoryCreditLedger {
    balances: DashMap<Uuid, i64>,
    commits: AtomicUsize,
    releases: AtomicUsize,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(user_id: Uuid, balance: i64) -> Self {
        let ledger = Self::default();
        ledger.set_balance(user_id, balance);
        ledger
    }

    pub fn set_balance(&self, user_id: Uuid, balance: i64) {
        self.balances.insert(user_id, balance);
    }

    /// Number of commits that moved credits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn balance(&self, user_id: Uuid) -> Result<i64, LedgerError> {
        Ok(self.balances.get(&user_id).map(|entry| *entry).unwrap_or(0))
    }

    async fn commit(&self, user_id: Uuid, amount: i64) -> Result<bool, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount(amount));
        }
        if amount == 0 {
            return Ok(true);
        }
        let Some(mut balance) = self.balances.get_mut(&user_id) else {
            return Ok(false);
        };
        if *balance < amount {
            return Ok(false);
        }
        *balance -= amount;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn release(&self, _task_id: Uuid) -> Result<bool, LedgerError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::models::TaskPayload;

    fn new_task(user_id: Uuid, external_task_id: &str) -> NewGenerationTask {
        NewGenerationTask {
            user_id,
            platform: Platform::Ark,
            model: "seedance-pro".into(),
            external_task_id: external_task_id.into(),
            status: TaskStatus::Pending,
            payload: TaskPayload::default(),
            quoted_cost: 200,
            media_type: MediaType::Video,
            tool: "image-to-video".into(),
        }
    }

    #[tokio::test]
    async fn terminal_write_happens_once() {
        let store = InMemoryTaskStore::new();
        let user_id = Uuid::new_v4();
        store.create_task(new_task(user_id, "ext-1"), None).await.unwrap();

        let first = store
            .complete_task(
                Platform::Ark,
                "ext-1",
                TerminalUpdate::Succeeded {
                    output: "https://cdn.example/v.mp4".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(first.as_ref().map(|t| t.cost), Some(Some(200)));

        let second = store
            .complete_task(
                Platform::Ark,
                "ext-1",
                TerminalUpdate::Failed {
                    failure: Some("late".into()),
                    failure_code: None,
                },
            )
            .await
            .unwrap();
        assert!(second.is_none());
        assert!(!store
            .record_progress(Platform::Ark, "ext-1", Some(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn duplicate_external_id_is_rejected() {
        let store = InMemoryTaskStore::new();
        let user_id = Uuid::new_v4();
        store.create_task(new_task(user_id, "ext-1"), None).await.unwrap();
        let err = store
            .create_task(new_task(user_id, "ext-1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateExternalId { .. }));
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn reroute_applies_once_per_task() {
        let store = InMemoryTaskStore::new();
        let task = store
            .create_task(new_task(Uuid::new_v4(), "ext-1"), None)
            .await
            .unwrap();
        let update = |external_task_id: &str| RerouteUpdate {
            expected_external_task_id: "ext-1".into(),
            platform: Platform::Luma,
            model: "ray-flash-modify".into(),
            external_task_id: external_task_id.into(),
            payload: TaskPayload {
                duration: Some(5),
                ..TaskPayload::default()
            },
        };

        assert!(store.reroute_task(task.id, update("luma-1")).await.unwrap());
        assert!(!store.reroute_task(task.id, update("luma-2")).await.unwrap());

        let stored = store.task(task.id).unwrap();
        assert_eq!(stored.external_task_id, "luma-1");
        assert_eq!(stored.previous_external_task_id.as_deref(), Some("ext-1"));
        assert_eq!(stored.payload.duration, Some(5));
        assert!(stored.submitted_at >= task.submitted_at);
    }

    #[tokio::test]
    async fn commit_never_overdraws() {
        let user_id = Uuid::new_v4();
        let ledger = InMemoryCreditLedger::with_balance(user_id, 500);
        assert!(ledger.commit(user_id, 300).await.unwrap());
        assert!(!ledger.commit(user_id, 300).await.unwrap());
        assert_eq!(ledger.balance(user_id).await.unwrap(), 200);
        assert_eq!(ledger.commit_count(), 1);
        assert!(!ledger.commit(Uuid::new_v4(), 1).await.unwrap());
    }
}
