use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::models::{GenerationTask, Platform, RerouteUpdate, ReservationOutcome, TerminalUpdate};
use super::store::StoreError;
use crate::context::AppContext;
use crate::pricing::{find_model, price};
use crate::providers::{
    NormalizedStatus, ProviderSubmission, ProviderUpdate, SettlementMode, TIMEOUT_FAILURE_CODE,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Committed { amount: i64 },
    /// Task stays succeeded; the charge needs manual follow-up.
    Flagged { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    UnknownTask,
    /// The task was already terminal, or another delivery won the transition.
    Discarded,
    Progressed,
    Succeeded {
        task_id: Uuid,
        settlement: SettlementOutcome,
    },
    Failed {
        task_id: Uuid,
    },
    Rerouted {
        task_id: Uuid,
        external_task_id: String,
    },
}

impl ApplyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::UnknownTask => "unknown_task",
            ApplyOutcome::Discarded => "discarded",
            ApplyOutcome::Progressed => "progressed",
            ApplyOutcome::Succeeded { .. } => "succeeded",
            ApplyOutcome::Failed { .. } => "failed",
            ApplyOutcome::Rerouted { .. } => "rerouted",
        }
    }
}

/// key: task-lifecycle -> shared status application for webhooks, polls and sweeps
///
/// Side effects (credit commit, result fan-out, reservation close) run only after this call
/// won the conditional terminal write, so duplicate deliveries are no-ops.
#[derive(Clone)]
pub struct TaskLifecycle {
    ctx: AppContext,
}

impl TaskLifecycle {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn apply(
        &self,
        platform: Platform,
        update: ProviderUpdate,
    ) -> Result<ApplyOutcome, StoreError> {
        let ProviderUpdate {
            external_task_id,
            status,
        } = update;
        let Some(task) = self.ctx.store.find_task(platform, &external_task_id).await? else {
            warn!(%platform, %external_task_id, "status update for unknown task");
            return Ok(ApplyOutcome::UnknownTask);
        };
        if task.status.is_terminal() {
            debug!(
                %platform,
                %external_task_id,
                status = task.status.as_str(),
                "ignoring update for terminal task"
            );
            return Ok(ApplyOutcome::Discarded);
        }

        match status {
            NormalizedStatus::Processing { progress } => {
                let applied = self
                    .ctx
                    .store
                    .record_progress(platform, &external_task_id, progress)
                    .await?;
                Ok(if applied {
                    ApplyOutcome::Progressed
                } else {
                    ApplyOutcome::Discarded
                })
            }
            NormalizedStatus::Succeeded { output_url } => {
                self.succeed(platform, &external_task_id, output_url).await
            }
            NormalizedStatus::Failed { reason, code } => self.fail(task, reason, code).await,
        }
    }

    async fn succeed(
        &self,
        platform: Platform,
        external_task_id: &str,
        output_url: String,
    ) -> Result<ApplyOutcome, StoreError> {
        let Some(task) = self
            .ctx
            .store
            .complete_task(
                platform,
                external_task_id,
                TerminalUpdate::Succeeded { output: output_url },
            )
            .await?
        else {
            debug!(%platform, external_task_id, "success already recorded by another delivery");
            return Ok(ApplyOutcome::Discarded);
        };

        let settlement = self.settle(&task).await;
        if let Err(err) = self.ctx.store.record_generation(&task).await {
            error!(?err, task_id = %task.id, "failed to record generation result");
        }
        info!(
            task_id = %task.id,
            user_id = %task.user_id,
            %platform,
            model = %task.model,
            ?settlement,
            "generation succeeded"
        );
        Ok(ApplyOutcome::Succeeded {
            task_id: task.id,
            settlement,
        })
    }

    async fn settle(&self, task: &GenerationTask) -> SettlementOutcome {
        let reservation = match self.ctx.store.reservation(&task.external_task_id).await {
            Ok(reservation) => reservation,
            Err(err) => return self.flag(task, format!("reservation lookup failed: {err}")).await,
        };
        let amount = reservation
            .as_ref()
            .map_or(task.quoted_cost, |reservation| reservation.reserved_credits);

        let outcome = match self.ctx.ledger.reserve_check(task.user_id, amount).await {
            Ok(true) => match self.ctx.ledger.commit(task.user_id, amount).await {
                Ok(true) => SettlementOutcome::Committed { amount },
                Ok(false) => {
                    self.flag(task, format!("balance fell below {amount} before commit"))
                        .await
                }
                Err(err) => self.flag(task, format!("credit commit failed: {err}")).await,
            },
            Ok(false) => {
                self.flag(task, format!("insufficient credits to settle {amount}"))
                    .await
            }
            Err(err) => self.flag(task, format!("balance check failed: {err}")).await,
        };

        if reservation.is_some() && matches!(outcome, SettlementOutcome::Committed { .. }) {
            if let Err(err) = self
                .ctx
                .store
                .close_reservation(
                    &task.external_task_id,
                    ReservationOutcome::Committed,
                    task.output.as_deref(),
                )
                .await
            {
                error!(?err, task_id = %task.id, "failed to close committed reservation");
            }
        }
        outcome
    }

    async fn flag(&self, task: &GenerationTask, reason: String) -> SettlementOutcome {
        warn!(
            task_id = %task.id,
            user_id = %task.user_id,
            %reason,
            "settlement failed; task left succeeded"
        );
        if let Err(err) = self
            .ctx
            .store
            .flag_settlement_warning(task.id, &reason)
            .await
        {
            error!(?err, task_id = %task.id, "failed to record settlement warning");
        }
        SettlementOutcome::Flagged { reason }
    }

    async fn fail(
        &self,
        task: GenerationTask,
        reason: String,
        code: Option<String>,
    ) -> Result<ApplyOutcome, StoreError> {
        let timed_out = code.as_deref() == Some(TIMEOUT_FAILURE_CODE);
        if !timed_out && task.previous_external_task_id.is_none() {
            if let Some(outcome) = self.try_fallback(&task, &reason, code.as_deref()).await? {
                return Ok(outcome);
            }
        }

        let Some(failed) = self
            .ctx
            .store
            .complete_task(
                task.platform,
                &task.external_task_id,
                TerminalUpdate::Failed {
                    failure: Some(reason.clone()),
                    failure_code: code.clone(),
                },
            )
            .await?
        else {
            debug!(task_id = %task.id, "failure already recorded by another delivery");
            return Ok(ApplyOutcome::Discarded);
        };

        self.release(&failed).await;
        info!(
            task_id = %failed.id,
            platform = %failed.platform,
            %reason,
            code = code.as_deref().unwrap_or_default(),
            "generation failed"
        );
        Ok(ApplyOutcome::Failed { task_id: failed.id })
    }

    async fn release(&self, task: &GenerationTask) {
        match self.ctx.store.reservation(&task.external_task_id).await {
            Ok(Some(_)) => {
                if let Err(err) = self.ctx.ledger.release(task.id).await {
                    warn!(?err, task_id = %task.id, "credit release failed");
                }
                if let Err(err) = self
                    .ctx
                    .store
                    .close_reservation(&task.external_task_id, ReservationOutcome::Released, None)
                    .await
                {
                    error!(?err, task_id = %task.id, "failed to close released reservation");
                }
            }
            Ok(None) => {}
            Err(err) => error!(?err, task_id = %task.id, "reservation lookup failed on release"),
        }
    }

    /// Resubmits a failed job to its model's fallback. Returns `None` when no reroute happened
    /// and the failure should be recorded.
    async fn try_fallback(
        &self,
        task: &GenerationTask,
        reason: &str,
        failure_code: Option<&str>,
    ) -> Result<Option<ApplyOutcome>, StoreError> {
        let Some(rule) = find_model(&task.model).and_then(|spec| spec.fallback) else {
            return Ok(None);
        };
        if !rule.when.matches(failure_code) {
            debug!(task_id = %task.id, ?failure_code, "failure does not trigger fallback");
            return Ok(None);
        }
        let Some(fallback) = find_model(rule.model) else {
            return Ok(None);
        };
        let Some(adapter) = self.ctx.providers.get(fallback.platform) else {
            warn!(task_id = %task.id, fallback = fallback.id, "fallback provider not configured");
            return Ok(None);
        };
        if adapter.settlement_mode() == SettlementMode::Reservation {
            warn!(
                task_id = %task.id,
                fallback = fallback.id,
                "fallback to reservation provider unsupported"
            );
            return Ok(None);
        }

        let payload = rule.overrides.apply(&task.payload);
        if let Err(missing) = fallback.validate(&payload) {
            info!(
                task_id = %task.id,
                fallback = fallback.id,
                %missing,
                "payload unusable by fallback"
            );
            return Ok(None);
        }
        if let Err(err) = price(
            fallback.platform,
            fallback.id,
            payload.resolution.as_deref(),
            payload.duration,
        ) {
            info!(task_id = %task.id, fallback = fallback.id, %err, "payload unusable by fallback");
            return Ok(None);
        }

        let callback_url = self.ctx.callback_url(fallback.platform);
        let submitted = match adapter
            .submit(ProviderSubmission {
                model: fallback,
                payload: &payload,
                callback_url: callback_url.as_deref(),
            })
            .await
        {
            Ok(submitted) => submitted,
            Err(err) => {
                warn!(
                    ?err,
                    task_id = %task.id,
                    fallback = fallback.id,
                    "fallback submission failed"
                );
                return Ok(None);
            }
        };

        let rerouted = self
            .ctx
            .store
            .reroute_task(
                task.id,
                RerouteUpdate {
                    expected_external_task_id: task.external_task_id.clone(),
                    platform: fallback.platform,
                    model: fallback.id.to_string(),
                    external_task_id: submitted.external_task_id.clone(),
                    payload,
                },
            )
            .await;
        match rerouted {
            Ok(true) => {
                info!(
                    task_id = %task.id,
                    from = %task.model,
                    to = fallback.id,
                    reason,
                    external_task_id = %submitted.external_task_id,
                    "generation rerouted to fallback model"
                );
                Ok(Some(ApplyOutcome::Rerouted {
                    task_id: task.id,
                    external_task_id: submitted.external_task_id,
                }))
            }
            Ok(false) => {
                debug!(task_id = %task.id, "task finished or rerouted by another delivery");
                cancel_orphan(adapter.as_ref(), &submitted.external_task_id).await;
                Ok(Some(ApplyOutcome::Discarded))
            }
            Err(err) => {
                error!(?err, task_id = %task.id, fallback = fallback.id, "failed to reroute task");
                cancel_orphan(adapter.as_ref(), &submitted.external_task_id).await;
                Ok(None)
            }
        }
    }
}

/// Best-effort cancel of a provider job no task row points at.
pub(crate) async fn cancel_orphan(
    adapter: &dyn crate::providers::ProviderAdapter,
    external_task_id: &str,
) {
    if let Err(err) = adapter.cancel(external_task_id).await {
        warn!(
            ?err,
            platform = %adapter.platform(),
            external_task_id,
            "could not cancel orphaned provider job"
        );
    }
}
