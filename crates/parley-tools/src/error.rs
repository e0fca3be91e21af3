#[derive(Debug, thiserror::Error)]
pub enum ToolProviderError {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to launch provider '{provider}': {message}")]
    Launch { provider: String, message: String },

    #[error("failed to discover tools for provider '{provider}': {message}")]
    Discovery { provider: String, message: String },

    #[error("provider '{provider}' did not start within {secs}s")]
    Timeout { provider: String, secs: u64 },

    #[error("shutdown error: {0}")]
    Shutdown(String),
}
