/// Errors surfaced by an agent engine. The engine is opaque, so these only
/// classify where the failure happened.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent transport error: {0}")]
    Transport(String),
    #[error("agent rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid agent response: {0}")]
    InvalidResponse(String),
    #[error("agent error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Rejected { .. } => "rejected",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Internal(_) => "internal",
        }
    }
}
