use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use parley_core::agent::AgentEngine;
use parley_core::tools::CapabilityList;

use crate::error::BindingError;

static CAPABILITY_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").ok());

fn valid_name(name: &str) -> bool {
    CAPABILITY_NAME
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

/// The agent engine together with the frozen capability list it may use.
#[derive(Clone)]
pub struct AgentBinding {
    engine: Arc<dyn AgentEngine>,
    capabilities: CapabilityList,
}

impl std::fmt::Debug for AgentBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBinding")
            .field("engine", &self.engine.name())
            .field("capabilities", &self.capabilities.names())
            .finish()
    }
}

impl AgentBinding {
    /// Rejects capability lists with malformed or repeated names.
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        capabilities: CapabilityList,
    ) -> Result<Self, BindingError> {
        let mut seen = HashSet::new();
        for name in capabilities.names() {
            if !valid_name(name) {
                return Err(BindingError::InvalidName(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(BindingError::DuplicateName(name.to_string()));
            }
        }
        Ok(Self {
            engine,
            capabilities,
        })
    }

    pub fn engine(&self) -> &Arc<dyn AgentEngine> {
        &self.engine
    }

    pub fn capabilities(&self) -> &CapabilityList {
        &self.capabilities
    }
}
