use async_trait::async_trait;

use crate::conversation::{Conversation, Message};
use crate::errors::AgentError;
use crate::tools::CapabilityList;

/// Result of running the agent over a conversation.
#[derive(Clone, Debug)]
pub struct ProcessOutcome {
    /// The conversation including everything the agent appended.
    pub conversation: Conversation,
    /// Only the messages produced by this run, in order.
    pub new_messages: Vec<Message>,
}

/// The reasoning/tool-execution engine. Opaque to this crate family.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn process_conversation(
        &self,
        conversation: &Conversation,
        capabilities: &CapabilityList,
    ) -> Result<ProcessOutcome, AgentError>;

    async fn generate_title(&self, conversation: &Conversation) -> Result<String, AgentError>;
}
