use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use parley_core::tools::ToolDefinition;

use crate::config::ToolProviderConfig;
use crate::error::ToolProviderError;

/// Capabilities exposed by one started provider.
#[derive(Clone, Debug)]
pub struct ProviderCapabilities {
    pub provider: String,
    pub tools: Vec<ToolDefinition>,
}

/// Starts and stops a batch of tool providers.
#[async_trait]
pub trait ToolProviderBackend: Send + Sync {
    async fn start(
        &self,
        providers: &[ToolProviderConfig],
    ) -> Result<Vec<ProviderCapabilities>, ToolProviderError>;

    async fn stop(&self) -> Result<(), ToolProviderError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    Failed,
    Stopped,
}

/// Owns the provider batch for the lifetime of the process.
///
/// Failures never escape: a batch that fails to start leaves the agent with
/// its baseline capabilities only, and stop errors are logged.
pub struct ToolLifecycleManager {
    backend: Arc<dyn ToolProviderBackend>,
    state: Mutex<LifecycleState>,
}

impl ToolLifecycleManager {
    pub fn new(backend: Arc<dyn ToolProviderBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(LifecycleState::Idle),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Start the batch and return its capabilities in provider-registration
    /// order. Returns an empty list when there is nothing to start, when the
    /// batch fails, or when start was already attempted.
    pub async fn start(&self, providers: &[ToolProviderConfig]) -> Vec<ToolDefinition> {
        if self.state() != LifecycleState::Idle {
            warn!(state = ?self.state(), "tool provider batch already started");
            return Vec::new();
        }
        if providers.is_empty() {
            info!("no tool providers configured");
            return Vec::new();
        }

        match self.backend.start(providers).await {
            Ok(mut started) => {
                started.sort_by_key(|caps| {
                    providers
                        .iter()
                        .position(|p| p.name == caps.provider)
                        .unwrap_or(usize::MAX)
                });
                let tools: Vec<ToolDefinition> =
                    started.into_iter().flat_map(|caps| caps.tools).collect();
                *self.state.lock() = LifecycleState::Running;
                info!(
                    providers = providers.len(),
                    tools = tools.len(),
                    "tool providers started"
                );
                tools
            }
            Err(e) => {
                *self.state.lock() = LifecycleState::Failed;
                error!(error = %e, "failed to start tool providers, continuing without them");
                Vec::new()
            }
        }
    }

    /// Stop the batch if it started. Errors are logged, never returned.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Running {
                return;
            }
            *state = LifecycleState::Stopped;
        }

        match self.backend.stop().await {
            Ok(()) => info!("tool providers stopped"),
            Err(e) => error!(error = %e, "error stopping tool providers"),
        }
    }
}
