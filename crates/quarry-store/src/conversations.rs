use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use quarry_core::ids::ConversationId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Title given to conversations until one is derived from the first message.
pub const DEFAULT_TITLE: &str = "New conversation";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new conversation.
    #[instrument(skip(self))]
    pub fn create(&self, title: Option<&str>) -> Result<ConversationRow, StoreError> {
        let id = ConversationId::new();
        let title = title.unwrap_or(DEFAULT_TITLE).to_string();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), title, now, now],
            )?;

            Ok(ConversationRow {
                id,
                title,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a conversation by ID.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }

    /// List all conversations, most recently updated first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at, updated_at FROM conversations
                 ORDER BY updated_at DESC",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })
    }

    /// Update a conversation's title.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![title, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Bump a conversation's updated_at.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn touch(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    Ok(ConversationRow {
        id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, "conversations", "id")?),
        title: row_helpers::get(row, 1, "conversations", "title")?,
        created_at: row_helpers::get(row, 2, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 3, "conversations", "updated_at")?,
    })
}
