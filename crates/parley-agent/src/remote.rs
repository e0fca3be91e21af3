use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use parley_core::agent::{AgentEngine, ProcessOutcome};
use parley_core::conversation::{Conversation, Message};
use parley_core::errors::AgentError;
use parley_core::tools::CapabilityList;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Agent engine reached over HTTP.
///
/// `POST {base}/process` with `{conversation, tools}` answers
/// `{conversation, new_messages}`; `POST {base}/title` with `{conversation}`
/// answers `{title}`.
pub struct RemoteAgentEngine {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    conversation: &'a Conversation,
    tools: &'a CapabilityList,
}

#[derive(Deserialize)]
struct ProcessResponse {
    conversation: Conversation,
    #[serde(default)]
    new_messages: Vec<Message>,
}

#[derive(Serialize)]
struct TitleRequest<'a> {
    conversation: &'a Conversation,
}

#[derive(Deserialize)]
struct TitleResponse {
    title: String,
}

impl RemoteAgentEngine {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AgentError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl AgentEngine for RemoteAgentEngine {
    fn name(&self) -> &str {
        "remote"
    }

    #[instrument(skip_all, fields(conversation_id = %conversation.id))]
    async fn process_conversation(
        &self,
        conversation: &Conversation,
        capabilities: &CapabilityList,
    ) -> Result<ProcessOutcome, AgentError> {
        let response: ProcessResponse = self
            .post_json(
                "/process",
                &ProcessRequest {
                    conversation,
                    tools: capabilities,
                },
            )
            .await?;

        if response.conversation.id != conversation.id {
            return Err(AgentError::InvalidResponse(format!(
                "expected conversation {}, got {}",
                conversation.id, response.conversation.id
            )));
        }

        debug!(new_messages = response.new_messages.len(), "agent processed conversation");
        Ok(ProcessOutcome {
            conversation: response.conversation,
            new_messages: response.new_messages,
        })
    }

    #[instrument(skip_all, fields(conversation_id = %conversation.id))]
    async fn generate_title(&self, conversation: &Conversation) -> Result<String, AgentError> {
        let response: TitleResponse = self
            .post_json("/title", &TitleRequest { conversation })
            .await?;

        let title = response.title.trim();
        if title.is_empty() {
            return Err(AgentError::InvalidResponse("empty title".into()));
        }
        Ok(title.to_string())
    }
}
