use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::ark::ArkAdapter;
use super::hedra::HedraAdapter;
use super::kie::KieAdapter;
use super::luma::LumaAdapter;
use super::replicate::ReplicateAdapter;
use super::runway::RunwayAdapter;
use super::{ProviderAdapter, ProviderError};
use crate::config::{self, ProviderCredentials};
use crate::tasks::models::Platform;

/// key: provider-registry -> platform to adapter lookup
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Platform, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> impl Iterator<Item = Platform> + '_ {
        self.adapters.keys().copied()
    }

    /// Builds adapters for every provider whose credentials are configured.
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        let configured: [(Platform, &Option<ProviderCredentials>); 6] = [
            (Platform::Replicate, &*config::REPLICATE),
            (Platform::Ark, &*config::ARK),
            (Platform::Runway, &*config::RUNWAY),
            (Platform::Luma, &*config::LUMA),
            (Platform::Kie, &*config::KIE),
            (Platform::Hedra, &*config::HEDRA),
        ];
        for (platform, credentials) in configured {
            let Some(credentials) = credentials else {
                warn!(%platform, "provider credentials not configured; platform disabled");
                continue;
            };
            let adapter: Arc<dyn ProviderAdapter> = match platform {
                Platform::Replicate => {
                    if credentials.webhook_secret.is_none() {
                        warn!(
                            "REPLICATE_WEBHOOK_SECRET unset; replicate webhooks will be rejected"
                        );
                    }
                    Arc::new(ReplicateAdapter::new(credentials, timeout)?)
                }
                Platform::Ark => Arc::new(ArkAdapter::new(credentials, timeout)?),
                Platform::Runway => Arc::new(RunwayAdapter::new(credentials, timeout)?),
                Platform::Luma => Arc::new(LumaAdapter::new(credentials, timeout)?),
                Platform::Kie => Arc::new(KieAdapter::new(credentials, timeout)?),
                Platform::Hedra => Arc::new(HedraAdapter::new(credentials, timeout)?),
            };
            info!(%platform, base_url = %credentials.base_url, "provider enabled");
            registry.register(adapter);
        }
        Ok(registry)
    }
}
