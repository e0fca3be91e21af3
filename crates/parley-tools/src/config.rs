use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::ToolProviderError;

/// One external tool provider as declared in the providers file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolProviderConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Values of the form `${VAR}` are resolved from a [`ParamSource`].
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersFile {
    #[serde(default, alias = "mcp_servers")]
    tool_providers: Vec<ToolProviderConfig>,
}

/// Process-wide parameter namespace used to resolve placeholders.
pub trait ParamSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Resolves placeholders from the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl ParamSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ParamSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Why a provider entry was left out of the effective set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Duplicate,
    UnresolvedParam(String),
}

/// Effective, validated set of tool providers in declaration order.
#[derive(Clone, Debug, Default)]
pub struct ToolProviderRegistry {
    providers: Vec<ToolProviderConfig>,
}

impl ToolProviderRegistry {
    /// Load providers from a YAML file. A missing or unreadable file yields an
    /// empty registry; the failure is logged, never returned.
    pub fn load(path: &Path, params: &dyn ParamSource) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "tool provider config not found");
                return Self::default();
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read tool provider config");
                return Self::default();
            }
        };

        match Self::from_yaml_str(&content, params) {
            Ok(registry) => registry,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to parse tool provider config");
                Self::default()
            }
        }
    }

    pub fn from_yaml_str(yaml: &str, params: &dyn ParamSource) -> Result<Self, ToolProviderError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: ProvidersFile =
            serde_yml::from_str(yaml).map_err(|e| ToolProviderError::Config(e.to_string()))?;
        Ok(Self::from_configs(file.tool_providers, params))
    }

    /// Filter and resolve declared providers. Exclusion is per provider.
    pub fn from_configs(configs: Vec<ToolProviderConfig>, params: &dyn ParamSource) -> Self {
        let mut seen = HashSet::new();
        let mut providers = Vec::new();

        for config in configs {
            match resolve_provider(config, params, &seen) {
                Ok(resolved) => {
                    info!(provider = %resolved.name, "tool provider configuration loaded");
                    seen.insert(resolved.name.clone());
                    providers.push(resolved);
                }
                Err((name, SkipReason::Disabled)) => {
                    info!(provider = %name, "tool provider disabled in config");
                }
                Err((name, SkipReason::Duplicate)) => {
                    warn!(provider = %name, "duplicate tool provider name, keeping the first");
                }
                Err((name, SkipReason::UnresolvedParam(var))) => {
                    warn!(
                        provider = %name,
                        param = %var,
                        "skipping tool provider: parameter not set or has default value"
                    );
                }
            }
        }

        Self { providers }
    }

    pub fn providers(&self) -> &[ToolProviderConfig] {
        &self.providers
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn resolve_provider(
    mut config: ToolProviderConfig,
    params: &dyn ParamSource,
    seen: &HashSet<String>,
) -> Result<ToolProviderConfig, (String, SkipReason)> {
    if !config.enabled {
        return Err((config.name, SkipReason::Disabled));
    }
    if seen.contains(&config.name) {
        return Err((config.name, SkipReason::Duplicate));
    }

    for value in config.env.values_mut() {
        let Some(var) = placeholder_name(value).map(str::to_string) else {
            continue;
        };
        match params.get(&var) {
            Some(resolved) if !is_unset_sentinel(&var, &resolved) => *value = resolved,
            _ => return Err((config.name, SkipReason::UnresolvedParam(var))),
        }
    }
    Ok(config)
}

/// `${VAR}` → `Some("VAR")`.
pub fn placeholder_name(value: &str) -> Option<&str> {
    value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| !name.is_empty())
}

/// Empty values and the `your_<var>` template default count as unset.
pub fn is_unset_sentinel(var: &str, value: &str) -> bool {
    value.is_empty() || value == format!("your_{}", var.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const TWO_PROVIDERS: &str = r#"
tool_providers:
  - name: brave-search
    command: npx
    args: ["-y", "@modelcontextprotocol/server-brave-search"]
    env:
      BRAVE_API_KEY: ${BRAVE_API_KEY}
  - name: filesystem
    command: npx
    args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
"#;

    #[test]
    fn missing_required_param_excludes_only_that_provider() {
        let registry = ToolProviderRegistry::from_yaml_str(TWO_PROVIDERS, &params(&[])).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["filesystem"]);
    }

    #[test]
    fn resolved_param_is_substituted() {
        let registry = ToolProviderRegistry::from_yaml_str(
            TWO_PROVIDERS,
            &params(&[("BRAVE_API_KEY", "sk-live")]),
        )
        .unwrap();
        assert_eq!(registry.names(), vec!["brave-search", "filesystem"]);
        assert_eq!(registry.providers()[0].env["BRAVE_API_KEY"], "sk-live");
    }

    #[test]
    fn template_default_counts_as_unset() {
        let registry = ToolProviderRegistry::from_yaml_str(
            TWO_PROVIDERS,
            &params(&[("BRAVE_API_KEY", "your_brave_api_key")]),
        )
        .unwrap();
        assert_eq!(registry.names(), vec!["filesystem"]);
    }

    #[test]
    fn disabled_provider_is_excluded() {
        let yaml = r#"
tool_providers:
  - name: slack
    enabled: false
    command: slack-mcp
"#;
        let registry = ToolProviderRegistry::from_yaml_str(yaml, &params(&[])).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_names_keep_first() {
        let yaml = r#"
tool_providers:
  - name: search
    command: first
  - name: search
    command: second
"#;
        let registry = ToolProviderRegistry::from_yaml_str(yaml, &params(&[])).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.providers()[0].command, "first");
    }

    #[test]
    fn literal_env_values_pass_through() {
        let yaml = r#"
tool_providers:
  - name: notion
    command: notion-mcp
    env:
      NOTION_VERSION: "2022-06-28"
"#;
        let registry = ToolProviderRegistry::from_yaml_str(yaml, &params(&[])).unwrap();
        assert_eq!(registry.providers()[0].env["NOTION_VERSION"], "2022-06-28");
    }

    #[test]
    fn mcp_servers_key_is_accepted() {
        let yaml = r#"
mcp_servers:
  - name: filesystem
    command: npx
    args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
"#;
        let registry = ToolProviderRegistry::from_yaml_str(yaml, &params(&[])).unwrap();
        assert_eq!(registry.names(), vec!["filesystem"]);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let result = ToolProviderRegistry::from_yaml_str("tool_providers: [", &params(&[]));
        assert!(matches!(result, Err(ToolProviderError::Config(_))));
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolProviderRegistry::load(&dir.path().join("absent.yaml"), &ProcessEnv);
        assert!(registry.is_empty());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.yaml");
        std::fs::write(&path, TWO_PROVIDERS).unwrap();
        let registry = ToolProviderRegistry::load(&path, &params(&[("BRAVE_API_KEY", "k")]));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn placeholder_parsing() {
        assert_eq!(placeholder_name("${TOKEN}"), Some("TOKEN"));
        assert_eq!(placeholder_name("TOKEN"), None);
        assert_eq!(placeholder_name("${}"), None);
        assert!(is_unset_sentinel("SLACK_TOKEN", "your_slack_token"));
        assert!(is_unset_sentinel("SLACK_TOKEN", ""));
        assert!(!is_unset_sentinel("SLACK_TOKEN", "xoxb-1"));
    }
}
