//! Conversation lifecycle entry points used by the request layer.
//!
//! The orchestrator starts `Uninitialized`, becomes `Ready` once the
//! sequencer binds an agent engine with its capability list, and moves to
//! `ShuttingDown` on the shutdown signal. Every entry point outside `Ready`
//! fails with [`OrchestratorError::NotReady`].

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use parley_core::conversation::{Attachment, Conversation, Message, Role};
use parley_core::errors::AgentError;
use parley_core::events::ConversationEvent;
use parley_core::ids::ConversationId;
use parley_store::{valid_attribute_key, BlobStore, ConversationStore};

use crate::binding::AgentBinding;
use crate::error::OrchestratorError;
use crate::groups::ConnectionGroups;
use crate::title::TitleWorkflow;

pub const DEFAULT_LIST_LIMIT: u32 = 30;
pub const MAX_LIST_LIMIT: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestratorState {
    Uninitialized,
    Ready,
    ShuttingDown,
}

enum Phase {
    Uninitialized,
    Ready(AgentBinding),
    ShuttingDown,
}

impl Phase {
    fn state(&self) -> OrchestratorState {
        match self {
            Phase::Uninitialized => OrchestratorState::Uninitialized,
            Phase::Ready(_) => OrchestratorState::Ready,
            Phase::ShuttingDown => OrchestratorState::ShuttingDown,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewConversation {
    pub title: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub attributes: Option<Map<String, Value>>,
}

/// Attachment as uploaded: raw bytes arrive base64-encoded.
#[derive(Clone, Debug, Deserialize)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub content: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentUpload>,
}

pub struct ConversationOrchestrator {
    store: Arc<dyn ConversationStore>,
    blobs: Arc<dyn BlobStore>,
    groups: Arc<ConnectionGroups>,
    titles: TitleWorkflow,
    phase: RwLock<Phase>,
}

impl ConversationOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        blobs: Arc<dyn BlobStore>,
        groups: Arc<ConnectionGroups>,
    ) -> Self {
        let titles = TitleWorkflow::new(Arc::clone(&store), Arc::clone(&groups));
        Self {
            store,
            blobs,
            groups,
            titles,
            phase: RwLock::new(Phase::Uninitialized),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.phase.read().state()
    }

    /// Uninitialized → Ready. Ignored in any other state.
    pub fn bind(&self, binding: AgentBinding) -> bool {
        let mut phase = self.phase.write();
        if !matches!(*phase, Phase::Uninitialized) {
            warn!(state = ?phase.state(), "orchestrator already bound");
            return false;
        }
        info!(capabilities = binding.capabilities().len(), "orchestrator ready");
        *phase = Phase::Ready(binding);
        true
    }

    /// Enter `ShuttingDown`; new requests are refused from here on.
    pub fn begin_shutdown(&self) {
        *self.phase.write() = Phase::ShuttingDown;
    }

    fn binding(&self) -> Result<AgentBinding, OrchestratorError> {
        match &*self.phase.read() {
            Phase::Ready(binding) => Ok(binding.clone()),
            _ => Err(OrchestratorError::NotReady),
        }
    }

    pub fn titles(&self) -> &TitleWorkflow {
        &self.titles
    }

    pub fn groups(&self) -> &Arc<ConnectionGroups> {
        &self.groups
    }

    pub fn capability_count(&self) -> usize {
        match &*self.phase.read() {
            Phase::Ready(binding) => binding.capabilities().len(),
            _ => 0,
        }
    }

    pub async fn create(&self, request: NewConversation) -> Result<Conversation, OrchestratorError> {
        self.binding()?;
        let mut conversation = Conversation::new(request.title, request.attributes);
        if let Some(prompt) = request.system_prompt.filter(|p| !p.trim().is_empty()) {
            conversation.ensure_system_prompt(prompt);
        }
        self.store.save(&conversation).await?;
        info!(conversation_id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    pub async fn get(&self, id: &ConversationId) -> Result<Conversation, OrchestratorError> {
        self.binding()?;
        self.load(id).await
    }

    pub async fn list(&self, limit: u32, offset: u32) -> Result<Vec<Conversation>, OrchestratorError> {
        self.binding()?;
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }
        Ok(self.store.list(limit, offset).await?)
    }

    /// Conversations whose attributes contain every pair of `filter`.
    pub async fn find_by_attributes(
        &self,
        filter: Map<String, Value>,
    ) -> Result<Vec<Conversation>, OrchestratorError> {
        self.binding()?;
        if filter.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "at least one attribute is required".into(),
            ));
        }
        check_filter_keys(&filter)?;
        Ok(self.store.find_by_attributes(&filter).await?)
    }

    /// Conversations that came from the named source, optionally narrowed
    /// by source properties such as a channel.
    pub async fn find_by_source(
        &self,
        name: &str,
        properties: Map<String, Value>,
    ) -> Result<Vec<Conversation>, OrchestratorError> {
        self.binding()?;
        if name.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "source name must not be empty".into(),
            ));
        }
        check_filter_keys(&properties)?;
        Ok(self.store.find_by_source(name, &properties).await?)
    }

    #[instrument(skip(self, update), fields(conversation_id = %id))]
    pub async fn update(
        &self,
        id: &ConversationId,
        update: ConversationUpdate,
    ) -> Result<Conversation, OrchestratorError> {
        self.binding()?;
        let mut conversation = self.load(id).await?;
        if let Some(title) = update.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(OrchestratorError::InvalidRequest("title must not be empty".into()));
            }
            conversation.title = title.to_string();
            conversation.touch();
        }
        if let Some(attributes) = update.attributes {
            conversation.merge_attributes(attributes);
        }
        self.store.save(&conversation).await?;
        // Stored row wins for a generated title when the request did not set one.
        self.load(id).await
    }

    /// Delete the conversation and, best effort, its attachment blobs.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub async fn delete(&self, id: &ConversationId) -> Result<(), OrchestratorError> {
        self.binding()?;
        let conversation = self.load(id).await?;
        if !self.store.delete(id).await? {
            return Err(OrchestratorError::NotFound(id.clone()));
        }

        for message in &conversation.messages {
            self.discard_blobs(&message.attachments).await;
        }
        info!("conversation deleted");
        Ok(())
    }

    /// Append a message and optionally run the agent.
    ///
    /// Without `process` the message is saved and broadcast at once. With
    /// `process` it is held in memory until the agent succeeds; an agent
    /// failure leaves the stored conversation untouched, broadcasts nothing
    /// and removes any attachment blobs written for the message.
    #[instrument(skip(self, message), fields(conversation_id = %id, role = %message.role))]
    pub async fn append_message(
        &self,
        id: &ConversationId,
        message: NewMessage,
        process: bool,
    ) -> Result<Conversation, OrchestratorError> {
        let binding = self.binding()?;
        let mut conversation = self.load(id).await?;

        let uploads = decode_uploads(&message.attachments)?;
        let mut attachments = Vec::with_capacity(uploads.len());
        for (upload, bytes) in message.attachments.iter().zip(uploads) {
            match self.blobs.put(id, &upload.filename, &bytes).await {
                Ok(stored) => attachments.push(Attachment {
                    filename: upload.filename.clone(),
                    mime_type: upload.mime_type.clone(),
                    storage_path: Some(stored.path),
                    size: Some(stored.size),
                }),
                Err(e) => {
                    self.discard_blobs(&attachments).await;
                    return Err(e.into());
                }
            }
        }

        conversation.add_message(
            Message::new(message.role, message.content).with_attachments(attachments.clone()),
        );
        let appended = conversation.messages.last().cloned();

        if process {
            let result = self.process(&binding, conversation, appended).await;
            if result.is_err() {
                self.discard_blobs(&attachments).await;
            }
            return result;
        }

        if let Err(e) = self.store.save(&conversation).await {
            self.discard_blobs(&attachments).await;
            return Err(e.into());
        }
        if let Some(appended) = appended {
            self.groups
                .broadcast(&ConversationEvent::new_message(id.clone(), appended))
                .await;
        }
        self.maybe_schedule_title(&binding, &conversation);
        Ok(conversation)
    }

    pub async fn process_existing(&self, id: &ConversationId) -> Result<Conversation, OrchestratorError> {
        let binding = self.binding()?;
        let conversation = self.load(id).await?;
        self.process(&binding, conversation, None).await
    }

    /// Run the agent over `conversation`. `pending` is a message not yet
    /// stored; it is persisted and broadcast only if the agent succeeds.
    #[instrument(skip_all, fields(conversation_id = %conversation.id))]
    async fn process(
        &self,
        binding: &AgentBinding,
        conversation: Conversation,
        pending: Option<Message>,
    ) -> Result<Conversation, OrchestratorError> {
        let outcome = binding
            .engine()
            .process_conversation(&conversation, binding.capabilities())
            .await?;
        if outcome.conversation.id != conversation.id {
            return Err(AgentError::InvalidResponse(
                "agent returned a different conversation".into(),
            )
            .into());
        }

        self.store.save(&outcome.conversation).await?;
        debug!(new_messages = outcome.new_messages.len(), "conversation processed");

        for message in pending.into_iter().chain(outcome.new_messages) {
            self.groups
                .broadcast(&ConversationEvent::new_message(conversation.id.clone(), message))
                .await;
        }

        let processed = self.load(&conversation.id).await?;
        self.maybe_schedule_title(binding, &processed);
        Ok(processed)
    }

    async fn discard_blobs(&self, attachments: &[Attachment]) {
        for path in attachments.iter().filter_map(|a| a.storage_path.as_deref()) {
            if let Err(e) = self.blobs.delete(path).await {
                warn!(path = %path, error = %e, "failed to delete attachment blob");
            }
        }
    }

    /// Entry condition for the title workflow; the workflow re-checks it.
    fn maybe_schedule_title(&self, binding: &AgentBinding, conversation: &Conversation) {
        if conversation.needs_title() {
            self.titles
                .schedule(Arc::clone(binding.engine()), conversation.id.clone());
        }
    }

    async fn load(&self, id: &ConversationId) -> Result<Conversation, OrchestratorError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))
    }
}

fn check_filter_keys(filter: &Map<String, Value>) -> Result<(), OrchestratorError> {
    match filter.keys().find(|key| !valid_attribute_key(key)) {
        Some(key) => Err(OrchestratorError::InvalidRequest(format!(
            "invalid attribute key: {key:?}"
        ))),
        None => Ok(()),
    }
}

fn decode_uploads(uploads: &[AttachmentUpload]) -> Result<Vec<Vec<u8>>, OrchestratorError> {
    uploads
        .iter()
        .map(|upload| {
            if upload.filename.trim().is_empty() {
                return Err(OrchestratorError::InvalidRequest(
                    "attachment filename must not be empty".into(),
                ));
            }
            BASE64.decode(upload.content.as_bytes()).map_err(|e| {
                OrchestratorError::InvalidRequest(format!(
                    "attachment {} is not valid base64: {e}",
                    upload.filename
                ))
            })
        })
        .collect()
}
