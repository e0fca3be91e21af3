use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::instrument;

use parley_core::conversation::{Conversation, Message, Role, DEFAULT_TITLE, SOURCE_ATTR};
use parley_core::ids::{ConversationId, MessageId};

use crate::database::Database;
use crate::error::StoreError;

/// Record store for conversations, as seen by the orchestrator and the title
/// workflow.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError>;

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<Conversation>, StoreError>;

    async fn delete(&self, id: &ConversationId) -> Result<bool, StoreError>;

    /// Conversations whose attributes hold every key/value pair of `filter`,
    /// most recently updated first.
    async fn find_by_attributes(
        &self,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// Conversations whose `source` attribute has the given `name` and every
    /// property of `properties`.
    async fn find_by_source(
        &self,
        name: &str,
        properties: &Map<String, Value>,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// Set the title and the `title_generated` flag in one conditional
    /// update. Returns `false` if the flag was already set or the title is no
    /// longer the default.
    async fn record_generated_title(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<bool, StoreError>;
}

/// SQLite-backed conversation repository.
#[derive(Clone)]
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get_sync(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.db.with_conn(|conn| load_conversation(conn, id.as_str()))
    }

    /// Upsert the conversation row and replace its messages atomically.
    ///
    /// A stale snapshot never clears a generated title: if the stored row
    /// already has `title_generated` and the incoming one does not, the stored
    /// title and flag win.
    #[instrument(skip(self, conversation), fields(conversation_id = %conversation.id))]
    pub fn save_sync(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let attributes = serde_json::to_string(&conversation.attributes)?;
        let metrics = serde_json::to_string(&conversation.metrics)?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, title, attributes, metrics, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     title = CASE
                         WHEN COALESCE(json_extract(conversations.attributes, '$.title_generated'), 0) = 1
                          AND COALESCE(json_extract(excluded.attributes, '$.title_generated'), 0) != 1
                         THEN conversations.title
                         ELSE excluded.title
                     END,
                     attributes = CASE
                         WHEN COALESCE(json_extract(conversations.attributes, '$.title_generated'), 0) = 1
                         THEN json_set(excluded.attributes, '$.title_generated', json('true'))
                         ELSE excluded.attributes
                     END,
                     metrics = excluded.metrics,
                     updated_at = excluded.updated_at",
                params![
                    conversation.id.as_str(),
                    conversation.title,
                    attributes,
                    metrics,
                    conversation.created_at,
                    conversation.updated_at,
                ],
            )?;

            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                [conversation.id.as_str()],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (id, conversation_id, sequence, role, content, attachments, metrics, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for (idx, message) in conversation.messages.iter().enumerate() {
                    let sequence = message.sequence.unwrap_or(idx as u32 + 1);
                    stmt.execute(params![
                        message.id.as_str(),
                        conversation.id.as_str(),
                        sequence,
                        message.role.to_string(),
                        message.content,
                        serde_json::to_string(&message.attachments)?,
                        serde_json::to_string(&message.metrics)?,
                        message.timestamp,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// List conversations, most recently updated first.
    #[instrument(skip(self))]
    pub fn list_sync(&self, limit: u32, offset: u32) -> Result<Vec<Conversation>, StoreError> {
        self.db.with_conn(|conn| {
            let ids: Vec<String> = conn
                .prepare(
                    "SELECT id FROM conversations ORDER BY updated_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                )?
                .query_map(params![limit, offset], |row| row.get(0))?
                .collect::<Result<_, _>>()?;

            load_all(conn, ids)
        })
    }

    pub fn find_by_attributes_sync(
        &self,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let clauses = filter
            .iter()
            .map(|(key, value)| Ok((attribute_path(&[key.as_str()])?, value)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.find_matching(&clauses)
    }

    pub fn find_by_source_sync(
        &self,
        name: &str,
        properties: &Map<String, Value>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let name = Value::String(name.to_string());
        let mut clauses = vec![(attribute_path(&[SOURCE_ATTR, "name"])?, &name)];
        for (key, value) in properties {
            clauses.push((attribute_path(&[SOURCE_ATTR, key.as_str()])?, value));
        }
        self.find_matching(&clauses)
    }

    /// Each clause compares one JSON path of `attributes` with a JSON value.
    /// `IS` makes a `null` filter match both null and absent keys.
    fn find_matching(&self, clauses: &[(String, &Value)]) -> Result<Vec<Conversation>, StoreError> {
        let mut sql = String::from("SELECT id FROM conversations");
        let mut args = Vec::with_capacity(clauses.len() * 2);
        for (idx, (path, value)) in clauses.iter().enumerate() {
            sql.push_str(if idx == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!(
                "json_extract(attributes, ?{}) IS json_extract(?{}, '$')",
                args.len() + 1,
                args.len() + 2
            ));
            args.push(path.clone());
            args.push(serde_json::to_string(value)?);
        }
        sql.push_str(" ORDER BY updated_at DESC, id DESC");

        self.db.with_conn(|conn| {
            let ids: Vec<String> = conn
                .prepare(&sql)?
                .query_map(params_from_iter(args.iter()), |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            load_all(conn, ids)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn delete_sync(&self, id: &ConversationId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM conversations WHERE id = ?1", [id.as_str()])?;
            Ok(removed > 0)
        })
    }

    #[instrument(skip(self, title), fields(conversation_id = %id))]
    pub fn record_generated_title_sync(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversations
                 SET title = ?1,
                     attributes = json_set(attributes, '$.title_generated', json('true')),
                     updated_at = ?2
                 WHERE id = ?3
                   AND title = ?4
                   AND COALESCE(json_extract(attributes, '$.title_generated'), 0) != 1",
                params![title, now, id.as_str(), DEFAULT_TITLE],
            )?;
            Ok(changed > 0)
        })
    }
}

#[async_trait]
impl ConversationStore for ConversationRepo {
    async fn get(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.get_sync(id)
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.save_sync(conversation)
    }

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<Conversation>, StoreError> {
        self.list_sync(limit, offset)
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, StoreError> {
        self.delete_sync(id)
    }

    async fn find_by_attributes(
        &self,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.find_by_attributes_sync(filter)
    }

    async fn find_by_source(
        &self,
        name: &str,
        properties: &Map<String, Value>,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.find_by_source_sync(name, properties)
    }

    async fn record_generated_title(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<bool, StoreError> {
        self.record_generated_title_sync(id, title)
    }
}

/// Whether `key` can be used as an attribute filter key.
pub fn valid_attribute_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(['"', '\\'])
}

fn attribute_path(keys: &[&str]) -> Result<String, StoreError> {
    let mut path = String::from("$");
    for key in keys {
        if !valid_attribute_key(key) {
            return Err(StoreError::InvalidPath(format!("attribute key {key:?}")));
        }
        path.push_str(&format!(".\"{key}\""));
    }
    Ok(path)
}

fn load_all(conn: &Connection, ids: Vec<String>) -> Result<Vec<Conversation>, StoreError> {
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(conversation) = load_conversation(conn, &id)? {
            results.push(conversation);
        }
    }
    Ok(results)
}

fn load_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, title, attributes, metrics, created_at, updated_at
             FROM conversations WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((id, title, attributes, metrics, created_at, updated_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, role, content, attachments, metrics, sequence, timestamp
         FROM messages WHERE conversation_id = ?1 ORDER BY sequence ASC",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next()? {
        messages.push(row_to_message(row)?);
    }

    Ok(Some(Conversation {
        id: ConversationId::from_raw(id),
        title,
        messages,
        attributes: serde_json::from_str(&attributes)?,
        metrics: serde_json::from_str(&metrics)?,
        created_at,
        updated_at,
    }))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let role: String = row.get(1)?;
    let attachments: String = row.get(3)?;
    let metrics: String = row.get(4)?;
    Ok(Message {
        id: MessageId::from_raw(row.get::<_, String>(0)?),
        role: role.parse::<Role>().map_err(StoreError::Serialization)?,
        content: row.get(2)?,
        attachments: serde_json::from_str(&attachments)?,
        metrics: serde_json::from_str(&metrics)?,
        sequence: Some(row.get(5)?),
        timestamp: row.get(6)?,
    })
}
