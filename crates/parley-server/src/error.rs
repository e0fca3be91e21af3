use std::time::Duration;

use parley_core::errors::AgentError;
use parley_core::ids::ConversationId;
use parley_store::StoreError;

/// Failure to hand one frame to one subscriber.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscriber connection closed")]
    Closed,

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// The capability list cannot be bound to the agent engine.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("invalid capability name: {0:?}")]
    InvalidName(String),

    #[error("duplicate capability name: {0}")]
    DuplicateName(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator not ready")]
    NotReady,

    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Fatal errors that stop the system before it accepts traffic.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("conversation store unavailable: {0}")]
    Store(#[source] StoreError),

    #[error("blob store unavailable: {0}")]
    BlobStore(String),

    #[error("invalid capability binding: {0}")]
    Binding(#[from] BindingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_conversation() {
        let err = OrchestratorError::NotFound(ConversationId::from_raw("conv_9"));
        assert_eq!(err.to_string(), "conversation not found: conv_9");
    }

    #[test]
    fn agent_error_converts() {
        let err: OrchestratorError = AgentError::Transport("refused".into()).into();
        assert!(matches!(err, OrchestratorError::Agent(_)));
    }
}
