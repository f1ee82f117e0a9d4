use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use quarry_core::ids::{ConversationId, MessageId};
use quarry_core::messages::Role;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message and bump the conversation's updated_at.
    #[instrument(skip(self, content), fields(conversation_id = %conversation_id, role = %role))]
    pub fn append(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: &str,
    ) -> Result<MessageRow, StoreError> {
        let id = MessageId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    conversation_id.as_str(),
                    role.to_string(),
                    content,
                    now,
                ],
            )?;
            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, conversation_id.as_str()],
            )?;

            Ok(MessageRow {
                id,
                conversation_id: conversation_id.clone(),
                role,
                content: content.to_string(),
                created_at: now,
            })
        })
    }

    /// List a conversation's messages in insertion order.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn list(&self, conversation_id: &ConversationId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, created_at FROM messages
                 WHERE conversation_id = ?1 ORDER BY created_at, id",
            )?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let role_str: String = row_helpers::get(row, 2, "messages", "role")?;

    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row, 1, "messages", "conversation_id",
        )?),
        role: row_helpers::parse_enum(&role_str, "messages", "role")?,
        content: row_helpers::get(row, 3, "messages", "content")?,
        created_at: row_helpers::get(row, 4, "messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationRepo;

    fn setup() -> (Database, ConversationId) {
        let db = Database::in_memory().unwrap();
        let conv = ConversationRepo::new(db.clone()).create(None).unwrap();
        (db, conv.id)
    }

    #[test]
    fn append_and_list() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);
        repo.append(&conv_id, Role::User, "how many trips?").unwrap();
        repo.append(&conv_id, Role::Assistant, "There were 42 trips.").unwrap();

        let messages = repo.list(&conv_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "how many trips?");
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[test]
    fn append_touches_conversation() {
        let (db, conv_id) = setup();
        let conversations = ConversationRepo::new(db.clone());
        let before = conversations.get(&conv_id).unwrap().updated_at;

        std::thread::sleep(std::time::Duration::from_millis(5));
        MessageRepo::new(db).append(&conv_id, Role::User, "hi").unwrap();

        let after = conversations.get(&conv_id).unwrap().updated_at;
        assert!(after > before, "updated_at not bumped: {before} -> {after}");
    }

    #[test]
    fn list_empty_conversation() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);
        assert!(repo.list(&conv_id).unwrap().is_empty());
    }

    #[test]
    fn corrupt_role_returns_error() {
        let (db, conv_id) = setup();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, content, created_at)
                 VALUES ('msg_bad', ?1, 'oracle', 'x', '2026-01-01T00:00:00Z')",
                [conv_id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let result = MessageRepo::new(db).list(&conv_id);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
