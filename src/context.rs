use std::sync::Arc;

use crate::credits::CreditLedger;
use crate::providers::ProviderRegistry;
use crate::tasks::models::Platform;
use crate::tasks::store::TaskStore;
use crate::tasks::submission::SubmissionLimits;

/// Shared dependencies handed to handlers and background workers.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn TaskStore>,
    pub ledger: Arc<dyn CreditLedger>,
    pub providers: ProviderRegistry,
    /// Public base url providers call back into. `None` leaves completion to polling.
    pub webhook_base_url: Option<String>,
    pub limits: SubmissionLimits,
}

impl AppContext {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<dyn CreditLedger>,
        providers: ProviderRegistry,
        webhook_base_url: Option<String>,
    ) -> Self {
        Self {
            store,
            ledger,
            providers,
            webhook_base_url,
            limits: SubmissionLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SubmissionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Callback url for a platform, when that platform delivers webhooks.
    pub fn callback_url(&self, platform: Platform) -> Option<String> {
        let adapter = self.providers.get(platform)?;
        if !adapter.capabilities().webhook {
            return None;
        }
        self.webhook_base_url
            .as_deref()
            .map(|base| format!("{base}/api/generation/webhook/{}", platform.as_str()))
    }
}
