use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::Tool;
use rmcp::service::{RoleClient, RunningService, ServiceExt};
use rmcp::transport::child_process::TokioChildProcess;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info};

use parley_core::tools::ToolDefinition;

use crate::config::ToolProviderConfig;
use crate::error::ToolProviderError;
use crate::lifecycle::{ProviderCapabilities, ToolProviderBackend};

const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

struct ActiveProvider {
    name: String,
    service: RunningService<RoleClient, ()>,
}

/// Runs each provider as a child process speaking MCP over stdio.
///
/// A provider that fails to launch or list its tools is logged and left out;
/// the rest of the batch still starts.
pub struct McpBackend {
    active: Mutex<Vec<ActiveProvider>>,
    launch_timeout: Duration,
}

impl Default for McpBackend {
    fn default() -> Self {
        Self::new(DEFAULT_LAUNCH_TIMEOUT)
    }
}

impl McpBackend {
    pub fn new(launch_timeout: Duration) -> Self {
        Self {
            active: Mutex::new(Vec::new()),
            launch_timeout,
        }
    }

    async fn connect(
        &self,
        config: &ToolProviderConfig,
    ) -> Result<(RunningService<RoleClient, ()>, Vec<ToolDefinition>), ToolProviderError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let launch_err = |message: String| ToolProviderError::Launch {
            provider: config.name.clone(),
            message,
        };

        let transport = TokioChildProcess::new(cmd).map_err(|e| launch_err(e.to_string()))?;
        let service = ()
            .serve(transport)
            .await
            .map_err(|e| launch_err(e.to_string()))?;

        let listed = service
            .list_tools(Default::default())
            .await
            .map_err(|e| ToolProviderError::Discovery {
                provider: config.name.clone(),
                message: e.to_string(),
            })?;

        let tools = listed
            .tools
            .iter()
            .map(|tool| to_definition(&config.name, tool))
            .collect::<Result<Vec<_>, _>>()?;

        Ok((service, tools))
    }
}

#[async_trait]
impl ToolProviderBackend for McpBackend {
    async fn start(
        &self,
        providers: &[ToolProviderConfig],
    ) -> Result<Vec<ProviderCapabilities>, ToolProviderError> {
        let mut started = Vec::with_capacity(providers.len());

        for config in providers {
            info!(provider = %config.name, command = %config.command, "launching tool provider");
            let result = match tokio::time::timeout(self.launch_timeout, self.connect(config)).await
            {
                Ok(result) => result,
                Err(_) => Err(ToolProviderError::Timeout {
                    provider: config.name.clone(),
                    secs: self.launch_timeout.as_secs(),
                }),
            };

            match result {
                Ok((service, tools)) => {
                    info!(provider = %config.name, tools = tools.len(), "tool provider connected");
                    self.active.lock().await.push(ActiveProvider {
                        name: config.name.clone(),
                        service,
                    });
                    started.push(ProviderCapabilities {
                        provider: config.name.clone(),
                        tools,
                    });
                }
                Err(e) => {
                    error!(provider = %config.name, error = %e, "tool provider unavailable");
                }
            }
        }

        Ok(started)
    }

    async fn stop(&self) -> Result<(), ToolProviderError> {
        let active: Vec<ActiveProvider> = std::mem::take(&mut *self.active.lock().await);
        let mut failed = Vec::new();

        for provider in active {
            match provider.service.cancel().await {
                Ok(reason) => {
                    info!(provider = %provider.name, reason = ?reason, "tool provider stopped");
                }
                Err(e) => {
                    error!(provider = %provider.name, error = %e, "tool provider did not stop cleanly");
                    failed.push(provider.name);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ToolProviderError::Shutdown(failed.join(", ")))
        }
    }
}

/// Reads the serialized MCP tool; `description` and `inputSchema` may be absent.
fn to_definition(provider: &str, tool: &Tool) -> Result<ToolDefinition, ToolProviderError> {
    let value = serde_json::to_value(tool).map_err(|e| ToolProviderError::Discovery {
        provider: provider.to_string(),
        message: e.to_string(),
    })?;
    definition_from_wire(provider, &value)
}

fn definition_from_wire(
    provider: &str,
    value: &serde_json::Value,
) -> Result<ToolDefinition, ToolProviderError> {
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolProviderError::Discovery {
            provider: provider.to_string(),
            message: "tool without a name".into(),
        })?;
    let description = value
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let schema = value
        .get("inputSchema")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({"type": "object"}));

    Ok(ToolDefinition::new(name, description, schema))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn wire_tool_maps_to_definition() {
        let wire = serde_json::json!({
            "name": "search",
            "description": "Search the web",
            "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
        });
        let def = definition_from_wire("brave", &wire).unwrap();
        assert_eq!(def.name, "search");
        assert_eq!(def.description, "Search the web");
        assert_eq!(def.parameters_schema["properties"]["q"]["type"], "string");
    }

    #[test]
    fn missing_description_and_schema_get_defaults() {
        let def = definition_from_wire("p", &serde_json::json!({"name": "ping"})).unwrap();
        assert_eq!(def.description, "");
        assert_eq!(def.parameters_schema["type"], "object");
    }

    #[test]
    fn nameless_tool_is_rejected() {
        let result = definition_from_wire("p", &serde_json::json!({"description": "x"}));
        assert!(matches!(result, Err(ToolProviderError::Discovery { .. })));
    }

    #[tokio::test]
    async fn unlaunchable_provider_is_skipped() {
        let backend = McpBackend::new(Duration::from_secs(5));
        let config = ToolProviderConfig {
            name: "ghost".into(),
            enabled: true,
            command: "/nonexistent/parley-test-binary".into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        };

        let started = backend.start(&[config]).await.unwrap();
        assert!(started.is_empty());
        backend.stop().await.unwrap();
    }
}
