//! Staged startup and shutdown.
//!
//! Startup runs store → blob store health gate → tool providers → agent
//! binding → ready, each stage gating the next. The store and the blob gate
//! are hard requirements, tool providers are best effort, and an invalid
//! capability binding is fatal. Shutdown refuses new requests, drains title
//! runs for a bounded time and stops the tool providers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use parley_core::agent::AgentEngine;
use parley_core::tools::{default_baseline, CapabilityListBuilder, ToolDefinition};
use parley_store::{BlobHealth, BlobStore, ConversationRepo, Database, FsBlobStore};
use parley_tools::{ToolLifecycleManager, ToolProviderBackend, ToolProviderRegistry};

use crate::binding::AgentBinding;
use crate::error::StartupError;
use crate::groups::ConnectionGroups;
use crate::orchestrator::{ConversationOrchestrator, OrchestratorState};

/// Everything the sequencer needs besides its collaborators.
#[derive(Clone, Debug)]
pub struct SystemConfig {
    /// SQLite file; `None` keeps conversations in memory.
    pub database_path: Option<PathBuf>,
    pub blob_root: PathBuf,
    /// Capabilities the agent has regardless of tool providers.
    pub baseline: Vec<ToolDefinition>,
    pub send_timeout: Duration,
    pub title_drain_timeout: Duration,
}

impl SystemConfig {
    pub fn new(blob_root: impl Into<PathBuf>) -> Self {
        Self {
            database_path: None,
            blob_root: blob_root.into(),
            baseline: default_baseline(),
            send_timeout: Duration::from_secs(5),
            title_drain_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Sequencer {
    config: SystemConfig,
    engine: Arc<dyn AgentEngine>,
    tool_backend: Arc<dyn ToolProviderBackend>,
    providers: ToolProviderRegistry,
    blob_store: Option<Arc<dyn BlobStore>>,
}

impl Sequencer {
    pub fn new(
        config: SystemConfig,
        engine: Arc<dyn AgentEngine>,
        tool_backend: Arc<dyn ToolProviderBackend>,
        providers: ToolProviderRegistry,
    ) -> Self {
        Self {
            config,
            engine,
            tool_backend,
            providers,
            blob_store: None,
        }
    }

    /// Use `blobs` instead of a filesystem store at `config.blob_root`.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(blobs);
        self
    }

    pub async fn start(self) -> Result<RunningSystem, StartupError> {
        let database = match &self.config.database_path {
            Some(path) => Database::open(path),
            None => Database::in_memory(),
        }
        .map_err(StartupError::Store)?;
        info!(path = %database.path().display(), "conversation store ready");

        let blobs: Arc<dyn BlobStore> = match &self.blob_store {
            Some(blobs) => Arc::clone(blobs),
            None => {
                let fs = FsBlobStore::create(&self.config.blob_root)
                    .map_err(|e| StartupError::BlobStore(e.to_string()))?;
                info!(root = %fs.root().display(), "blob root ready");
                Arc::new(fs)
            }
        };
        let health = blobs.check_health().await;
        if !health.healthy {
            error!(errors = ?health.errors, "blob store unhealthy");
            return Err(StartupError::BlobStore(health.errors.join("; ")));
        }
        info!(
            files = health.file_count,
            bytes = health.total_size,
            "blob store healthy"
        );

        let tools = ToolLifecycleManager::new(Arc::clone(&self.tool_backend));
        let provided = tools.start(self.providers.providers()).await;

        let mut builder = CapabilityListBuilder::with_baseline(self.config.baseline.clone());
        builder.extend(provided);
        let capabilities = builder.finish();

        let binding = match AgentBinding::new(Arc::clone(&self.engine), capabilities) {
            Ok(binding) => binding,
            Err(e) => {
                error!(error = %e, "capability list rejected");
                tools.stop().await;
                return Err(e.into());
            }
        };

        let groups = Arc::new(ConnectionGroups::new(self.config.send_timeout));
        let orchestrator = Arc::new(ConversationOrchestrator::new(
            Arc::new(ConversationRepo::new(database.clone())),
            Arc::clone(&blobs),
            Arc::clone(&groups),
        ));
        orchestrator.bind(binding);

        info!(
            engine = self.engine.name(),
            capabilities = orchestrator.capability_count(),
            "system ready"
        );

        Ok(RunningSystem {
            orchestrator,
            groups,
            database,
            blobs,
            tools,
            title_drain_timeout: self.config.title_drain_timeout,
        })
    }
}

/// Snapshot reported by the health endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct SystemHealth {
    pub status: &'static str,
    pub ready: bool,
    pub store: bool,
    pub blob_store: BlobHealth,
    pub capabilities: usize,
    pub groups: usize,
    pub subscribers: usize,
    pub title_tasks: usize,
}

pub struct RunningSystem {
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub groups: Arc<ConnectionGroups>,
    pub database: Database,
    pub blobs: Arc<dyn BlobStore>,
    tools: ToolLifecycleManager,
    title_drain_timeout: Duration,
}

impl RunningSystem {
    pub async fn health(&self) -> SystemHealth {
        let store = match self.database.ping() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store ping failed");
                false
            }
        };
        let blob_store = self.blobs.check_health().await;
        let ready = self.orchestrator.state() == OrchestratorState::Ready;
        let healthy = ready && store && blob_store.healthy;

        SystemHealth {
            status: if healthy { "healthy" } else { "degraded" },
            ready,
            store,
            blob_store,
            capabilities: self.orchestrator.capability_count(),
            groups: self.groups.group_count(),
            subscribers: self.groups.total_subscribers(),
            title_tasks: self.orchestrator.titles().in_flight(),
        }
    }

    pub async fn shutdown(&self) {
        info!("shutting down");
        self.orchestrator.begin_shutdown();
        if !self
            .orchestrator
            .titles()
            .drain(self.title_drain_timeout)
            .await
        {
            warn!(
                in_flight = self.orchestrator.titles().in_flight(),
                "title runs still in flight at shutdown"
            );
        }
        self.tools.stop().await;
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parley_agent::MockAgentEngine;
    use parley_tools::{ProviderCapabilities, ToolProviderConfig, ToolProviderError};

    use parley_core::ids::ConversationId;
    use parley_store::{StoreError, StoredBlob};

    use crate::error::BindingError;

    /// Providers named `broken-*` fail to launch; the rest expose one tool.
    #[derive(Default)]
    struct FakeBackend {
        fail_batch: bool,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl ToolProviderBackend for FakeBackend {
        async fn start(
            &self,
            providers: &[ToolProviderConfig],
        ) -> Result<Vec<ProviderCapabilities>, ToolProviderError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_batch {
                return Err(ToolProviderError::Config("batch failed".into()));
            }
            Ok(providers
                .iter()
                .filter(|p| !p.name.starts_with("broken-"))
                .map(|p| ProviderCapabilities {
                    provider: p.name.clone(),
                    tools: vec![ToolDefinition::new(
                        format!("{}-query", p.name),
                        "query",
                        serde_json::json!({"type": "object"}),
                    )],
                })
                .collect())
        }

        async fn stop(&self) -> Result<(), ToolProviderError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn provider(name: &str) -> ToolProviderConfig {
        ToolProviderConfig {
            name: name.into(),
            enabled: true,
            command: "true".into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    fn registry(names: &[&str]) -> ToolProviderRegistry {
        let params: std::collections::HashMap<String, String> = Default::default();
        ToolProviderRegistry::from_configs(names.iter().map(|n| provider(n)).collect(), &params)
    }

    fn engine() -> Arc<dyn AgentEngine> {
        Arc::new(MockAgentEngine::new(Vec::new()))
    }

    #[tokio::test]
    async fn starts_with_provider_capabilities_after_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let system = Sequencer::new(
            SystemConfig::new(dir.path().join("blobs")),
            engine(),
            backend.clone(),
            registry(&["search", "notes"]),
        )
        .start()
        .await
        .unwrap();

        assert_eq!(system.orchestrator.state(), OrchestratorState::Ready);
        assert_eq!(system.orchestrator.capability_count(), 4);

        let health = system.health().await;
        assert_eq!(health.status, "healthy");
        assert!(health.blob_store.healthy);

        system.shutdown().await;
        assert_eq!(system.orchestrator.state(), OrchestratorState::ShuttingDown);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_provider_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let system = Sequencer::new(
            SystemConfig::new(dir.path()),
            engine(),
            Arc::new(FakeBackend::default()),
            registry(&["broken-slack", "search"]),
        )
        .start()
        .await
        .unwrap();

        assert_eq!(system.orchestrator.state(), OrchestratorState::Ready);
        assert_eq!(system.orchestrator.capability_count(), 3);
    }

    #[tokio::test]
    async fn failing_batch_degrades_to_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend {
            fail_batch: true,
            ..Default::default()
        });
        let system = Sequencer::new(
            SystemConfig::new(dir.path()),
            engine(),
            backend.clone(),
            registry(&["search"]),
        )
        .start()
        .await
        .unwrap();

        assert_eq!(system.orchestrator.capability_count(), 2);
        system.shutdown().await;
        assert_eq!(backend.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blob_root_on_a_file_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let occupied = dir.path().join("occupied");
        std::fs::write(&occupied, b"not a directory").unwrap();
        let backend = Arc::new(FakeBackend::default());

        let result = Sequencer::new(
            SystemConfig::new(&occupied),
            engine(),
            backend.clone(),
            registry(&["search"]),
        )
        .start()
        .await;

        assert!(matches!(result, Err(StartupError::BlobStore(_))));
        assert_eq!(backend.stops.load(Ordering::SeqCst), 0);
    }

    /// Accepts nothing and always reports itself unhealthy.
    struct UnhealthyBlobs;

    #[async_trait]
    impl BlobStore for UnhealthyBlobs {
        async fn put(
            &self,
            _conversation_id: &ConversationId,
            _filename: &str,
            _bytes: &[u8],
        ) -> Result<StoredBlob, StoreError> {
            Err(StoreError::Io("read-only".into()))
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
            Err(StoreError::NotFound(path.to_string()))
        }

        async fn delete(&self, _path: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn check_health(&self) -> BlobHealth {
            BlobHealth {
                healthy: false,
                errors: vec!["bucket unreachable".into()],
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn unhealthy_blob_store_aborts_before_tools_start() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());

        let result = Sequencer::new(
            SystemConfig::new(dir.path()),
            engine(),
            backend.clone(),
            registry(&["search"]),
        )
        .with_blob_store(Arc::new(UnhealthyBlobs))
        .start()
        .await;

        match result {
            Err(StartupError::BlobStore(message)) => assert!(message.contains("bucket unreachable")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("startup should fail"),
        }
        assert_eq!(backend.starts.load(Ordering::SeqCst), 0);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_capabilities_abort_startup() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        // "web" provider exposes "web-query"; baseline already uses that name.
        let mut config = SystemConfig::new(dir.path());
        config.baseline.push(ToolDefinition::new(
            "web-query",
            "",
            serde_json::json!({"type": "object"}),
        ));

        let result = Sequencer::new(config, engine(), backend.clone(), registry(&["web"]))
            .start()
            .await;

        assert!(matches!(
            result,
            Err(StartupError::Binding(BindingError::DuplicateName(_)))
        ));
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn database_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SystemConfig::new(dir.path().join("blobs"));
        config.database_path = Some(dir.path().join("data").join("parley.db"));

        let system = Sequencer::new(
            config,
            engine(),
            Arc::new(FakeBackend::default()),
            ToolProviderRegistry::default(),
        )
        .start()
        .await
        .unwrap();

        assert!(dir.path().join("data").join("parley.db").exists());
        assert!(system.health().await.store);
    }
}
