use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use parley_core::agent::{AgentEngine, ProcessOutcome};
use parley_core::conversation::{Conversation, Message};
use parley_core::errors::AgentError;
use parley_core::tools::CapabilityList;

/// Pre-programmed engine answers for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// For `process_conversation`, one assistant message with this text.
    /// For `generate_title`, the title.
    Text(String),
    Error(AgentError),
    /// Wait a duration, then answer with the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Agent engine answering from two scripted queues, one per operation.
pub struct MockAgentEngine {
    replies: Vec<MockReply>,
    titles: Vec<MockReply>,
    process_calls: AtomicUsize,
    title_calls: AtomicUsize,
}

impl MockAgentEngine {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            titles: Vec::new(),
            process_calls: AtomicUsize::new(0),
            title_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_titles(mut self, titles: Vec<MockReply>) -> Self {
        self.titles = titles;
        self
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    pub fn title_calls(&self) -> usize {
        self.title_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentEngine for MockAgentEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn process_conversation(
        &self,
        conversation: &Conversation,
        _capabilities: &CapabilityList,
    ) -> Result<ProcessOutcome, AgentError> {
        let idx = self.process_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.get(idx).ok_or_else(|| {
            AgentError::Internal(format!("MockAgentEngine: no reply configured for call {idx}"))
        })?;

        let text = resolve(reply).await?;
        let mut updated = conversation.clone();
        updated.add_message(Message::assistant(text));
        updated.touch();
        let new_messages = updated.messages.last().cloned().into_iter().collect();

        Ok(ProcessOutcome {
            conversation: updated,
            new_messages,
        })
    }

    async fn generate_title(&self, _conversation: &Conversation) -> Result<String, AgentError> {
        let idx = self.title_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.titles.get(idx).ok_or_else(|| {
            AgentError::Internal(format!("MockAgentEngine: no title configured for call {idx}"))
        })?;
        resolve(reply).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve(reply: &MockReply) -> Result<String, AgentError> {
    let mut current = reply;
    loop {
        match current {
            MockReply::Text(text) => return Ok(text.clone()),
            MockReply::Error(e) => return Err(e.clone()),
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}
