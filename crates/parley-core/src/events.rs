use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, Message};
use crate::ids::ConversationId;

/// Events pushed to every client watching a conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConversationEvent {
    #[serde(rename = "new_message")]
    NewMessage {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
        message: Message,
    },

    /// Authoritative signal for a generated title; the synchronous response
    /// that triggered generation may still carry the default title.
    #[serde(rename = "title_update")]
    TitleUpdate {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
        conversation: Box<Conversation>,
    },
}

impl ConversationEvent {
    pub fn new_message(conversation_id: ConversationId, message: Message) -> Self {
        Self::NewMessage {
            conversation_id,
            message,
        }
    }

    pub fn title_update(conversation: Conversation) -> Self {
        Self::TitleUpdate {
            conversation_id: conversation.id.clone(),
            conversation: Box::new(conversation),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::NewMessage {
                conversation_id, ..
            }
            | Self::TitleUpdate {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::TitleUpdate { .. } => "title_update",
        }
    }

    /// Text frame sent over the wire.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
