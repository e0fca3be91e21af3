use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ConversationId, MessageId};

/// Title every conversation starts with until one is generated or set.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Attribute key recording that title generation has completed.
pub const TITLE_GENERATED_ATTR: &str = "title_generated";

/// Attribute holding the originating system, e.g.
/// `{"name": "slack", "channel": "C042"}`.
pub const SOURCE_ATTR: &str = "source";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// Token usage, tracked per message and accumulated per conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl UsageMetrics {
    pub fn accumulate(&mut self, other: &UsageMetrics) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// File attached to a message. Content lives in the blob store; only the
/// reference is kept on the message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
    pub timestamp: String,
    #[serde(default)]
    pub metrics: UsageMetrics,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            attachments: Vec::new(),
            sequence: None,
            timestamp: Utc::now().to_rfc3339(),
            metrics: UsageMetrics::default(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// A persisted thread of messages plus metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub metrics: UsageMetrics,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub fn new(title: Option<String>, attributes: Map<String, Value>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: ConversationId::new(),
            title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            messages: Vec::new(),
            attributes,
            metrics: UsageMetrics::default(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Append a message, assigning the next sequence number.
    pub fn add_message(&mut self, mut message: Message) {
        message.sequence = Some(self.messages.len() as u32 + 1);
        self.metrics.accumulate(&message.metrics);
        self.messages.push(message);
        self.touch();
    }

    /// Insert a system message at the head of the thread unless one exists.
    pub fn ensure_system_prompt(&mut self, prompt: impl Into<String>) {
        if self.messages.iter().any(|m| m.role == Role::System) {
            return;
        }
        self.messages.insert(0, Message::system(prompt));
        for (idx, message) in self.messages.iter_mut().enumerate() {
            message.sequence = Some(idx as u32 + 1);
        }
        self.touch();
    }

    /// Shallow-merge attribute keys into the bag; keys not named are kept.
    pub fn merge_attributes(&mut self, attributes: Map<String, Value>) {
        for (key, value) in attributes {
            self.attributes.insert(key, value);
        }
        self.touch();
    }

    pub fn has_assistant_reply(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::Assistant)
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_TITLE
    }

    pub fn title_generated(&self) -> bool {
        self.attributes
            .get(TITLE_GENERATED_ATTR)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether title generation should be scheduled for this conversation.
    pub fn needs_title(&self) -> bool {
        self.has_default_title() && !self.title_generated() && self.has_assistant_reply()
    }

    /// Record a generated title and set the completion flag.
    #[cfg(test)]
    pub(crate) fn apply_generated_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.attributes
            .insert(TITLE_GENERATED_ATTR.to_string(), Value::Bool(true));
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().to_rfc3339();
    }
}
