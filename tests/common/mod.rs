#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use generation_backend::context::AppContext;
use generation_backend::memory::{InMemoryCreditLedger, InMemoryTaskStore};
use generation_backend::providers::{
    NormalizedStatus, ProviderAdapter, ProviderCapabilities, ProviderError, ProviderRegistry,
    ProviderSubmission, ProviderUpdate, SettlementMode, SubmitOutcome,
};
use generation_backend::tasks::models::{Platform, TaskPayload};
use serde_json::Value;

/// Adapter that records calls and answers polls from a script.
pub struct ScriptedProvider {
    platform: Platform,
    capabilities: ProviderCapabilities,
    settlement: SettlementMode,
    threshold: Option<chrono::Duration>,
    poll_delay: Option<Duration>,
    submit_delay: Option<Duration>,
    submits: AtomicUsize,
    cancels: AtomicUsize,
    polls: AtomicUsize,
    poll_answers: Mutex<HashMap<String, NormalizedStatus>>,
    submitted: Mutex<Vec<TaskPayload>>,
}

impl ScriptedProvider {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            capabilities: ProviderCapabilities {
                webhook: true,
                poll: true,
            },
            settlement: SettlementMode::OnCompletion,
            threshold: None,
            poll_delay: None,
            submit_delay: None,
            submits: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            poll_answers: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn reservation(mut self) -> Self {
        self.settlement = SettlementMode::Reservation;
        self
    }

    pub fn poll_only(mut self) -> Self {
        self.capabilities.webhook = false;
        self
    }

    pub fn timeout_after(mut self, threshold: chrono::Duration) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn slow_polls(mut self, delay: Duration) -> Self {
        self.poll_delay = Some(delay);
        self
    }

    pub fn slow_submits(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    pub fn answer_poll(&self, external_task_id: &str, status: NormalizedStatus) {
        self.poll_answers
            .lock()
            .unwrap()
            .insert(external_task_id.to_string(), status);
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Payloads received by `submit`, in call order.
    pub fn submitted_payloads(&self) -> Vec<TaskPayload> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    fn settlement_mode(&self) -> SettlementMode {
        self.settlement
    }

    fn timeout_threshold(&self) -> Option<chrono::Duration> {
        self.threshold
    }

    async fn submit(
        &self,
        request: ProviderSubmission<'_>,
    ) -> Result<SubmitOutcome, ProviderError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        self.submitted.lock().unwrap().push(request.payload.clone());
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(SubmitOutcome {
            external_task_id: format!("{}-{n}", self.platform),
            confirmed: false,
        })
    }

    async fn poll_status(
        &self,
        external_task_id: &str,
    ) -> Result<NormalizedStatus, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.poll_delay {
            tokio::time::sleep(delay).await;
        }
        let answer = self.poll_answers.lock().unwrap().get(external_task_id).cloned();
        Ok(answer.unwrap_or(NormalizedStatus::Processing { progress: None }))
    }

    fn parse_webhook(&self, payload: &Value) -> Result<ProviderUpdate, ProviderError> {
        let external_task_id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Malformed("missing id".into()))?
            .to_string();
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("processing") => NormalizedStatus::Processing { progress: None },
            Some("succeeded") => NormalizedStatus::Succeeded {
                output_url: payload["output"].as_str().unwrap_or_default().to_string(),
            },
            Some("failed") => NormalizedStatus::Failed {
                reason: payload["error"].as_str().unwrap_or("failed").to_string(),
                code: payload["code"].as_str().map(str::to_string),
            },
            _ => return Err(ProviderError::Malformed("unknown status".into())),
        };
        Ok(ProviderUpdate {
            external_task_id,
            status,
        })
    }

    async fn cancel(&self, _external_task_id: &str) -> Result<(), ProviderError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub ctx: AppContext,
    pub store: Arc<InMemoryTaskStore>,
    pub ledger: Arc<InMemoryCreditLedger>,
}

pub fn harness(providers: Vec<Arc<ScriptedProvider>>) -> Harness {
    let store = Arc::new(InMemoryTaskStore::new());
    let ledger = Arc::new(InMemoryCreditLedger::new());
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider);
    }
    let ctx = AppContext::new(
        store.clone(),
        ledger.clone(),
        registry,
        Some("https://api.example".into()),
    );
    Harness { ctx, store, ledger }
}

pub fn succeeded(external_task_id: &str, output_url: &str) -> ProviderUpdate {
    ProviderUpdate {
        external_task_id: external_task_id.into(),
        status: NormalizedStatus::Succeeded {
            output_url: output_url.into(),
        },
    }
}

pub fn failed(external_task_id: &str, reason: &str) -> ProviderUpdate {
    ProviderUpdate {
        external_task_id: external_task_id.into(),
        status: NormalizedStatus::failed(reason, None),
    }
}

pub fn failed_with_code(external_task_id: &str, reason: &str, code: &str) -> ProviderUpdate {
    ProviderUpdate {
        external_task_id: external_task_id.into(),
        status: NormalizedStatus::failed(reason, Some(code)),
    }
}

pub fn talking_head_payload(duration: u32) -> TaskPayload {
    TaskPayload {
        image: Some("https://cdn.example/face.png".into()),
        audio: Some("https://cdn.example/voice.mp3".into()),
        resolution: Some("540p".into()),
        duration: Some(duration),
        ..TaskPayload::default()
    }
}
