//! External tool providers: which ones to run, and their start/stop lifecycle.
//!
//! `ToolProviderRegistry` reads the provider list and drops anything
//! disabled or missing a required parameter. `ToolLifecycleManager` starts the
//! surviving providers as one batch through a `ToolProviderBackend` and
//! reports their capabilities; `McpBackend` is the production backend.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mcp;

pub use config::{ParamSource, ProcessEnv, ToolProviderConfig, ToolProviderRegistry};
pub use error::ToolProviderError;
pub use lifecycle::{ProviderCapabilities, ToolLifecycleManager, ToolProviderBackend};
pub use mcp::McpBackend;
