use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use quarry_core::events::ArtifactPayload;
use quarry_core::ids::{ArtifactId, ConversationId, MessageId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A persisted execution result. The engine state blob is write-only: it is
/// stored alongside the artifact but never surfaces on read paths.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub id: ArtifactId,
    pub conversation_id: ConversationId,
    pub message_id: Option<MessageId>,
    pub code: String,
    pub result_json: Option<String>,
    pub result_type: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

impl ArtifactRow {
    /// Event-model view of this artifact.
    pub fn to_payload(&self) -> ArtifactPayload {
        ArtifactPayload {
            id: self.id.clone(),
            code: self.code.clone(),
            result_json: self.result_json.clone(),
            result_type: self.result_type.clone(),
            error: self.error.clone(),
        }
    }
}

/// Fields for a new artifact.
pub struct NewArtifact<'a> {
    pub conversation_id: &'a ConversationId,
    pub message_id: Option<&'a MessageId>,
    pub code: &'a str,
    pub engine_state: Option<&'a [u8]>,
    pub result_json: Option<&'a str>,
    pub result_type: Option<&'a str>,
    pub error: Option<&'a str>,
}

pub struct ArtifactRepo {
    db: Database,
}

impl ArtifactRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist an execution result. Rows are immutable once written.
    #[instrument(skip(self, artifact), fields(conversation_id = %artifact.conversation_id))]
    pub fn save(&self, artifact: NewArtifact<'_>) -> Result<ArtifactRow, StoreError> {
        let id = ArtifactId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO artifacts (id, conversation_id, message_id, code, engine_state,
                                        result_json, result_type, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    artifact.conversation_id.as_str(),
                    artifact.message_id.map(|m| m.as_str()),
                    artifact.code,
                    artifact.engine_state,
                    artifact.result_json,
                    artifact.result_type,
                    artifact.error,
                    now,
                ],
            )?;

            Ok(ArtifactRow {
                id,
                conversation_id: artifact.conversation_id.clone(),
                message_id: artifact.message_id.cloned(),
                code: artifact.code.to_string(),
                result_json: artifact.result_json.map(str::to_string),
                result_type: artifact.result_type.map(str::to_string),
                error: artifact.error.map(str::to_string),
                created_at: now,
            })
        })
    }

    /// Get an artifact by ID.
    #[instrument(skip(self), fields(artifact_id = %id))]
    pub fn get(&self, id: &ArtifactId) -> Result<ArtifactRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, message_id, code, result_json, result_type, error, created_at
                 FROM artifacts WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_artifact(row),
                None => Err(StoreError::NotFound(format!("artifact {id}"))),
            }
        })
    }

    /// List a conversation's artifacts in creation order.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn list(&self, conversation_id: &ConversationId) -> Result<Vec<ArtifactRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, message_id, code, result_json, result_type, error, created_at
                 FROM artifacts WHERE conversation_id = ?1 ORDER BY created_at, id",
            )?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_artifact(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> Result<ArtifactRow, StoreError> {
    Ok(ArtifactRow {
        id: ArtifactId::from_raw(row_helpers::get::<String>(row, 0, "artifacts", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row, 1, "artifacts", "conversation_id",
        )?),
        message_id: row_helpers::get_opt::<String>(row, 2, "artifacts", "message_id")?
            .map(MessageId::from_raw),
        code: row_helpers::get(row, 3, "artifacts", "code")?,
        result_json: row_helpers::get_opt(row, 4, "artifacts", "result_json")?,
        result_type: row_helpers::get_opt(row, 5, "artifacts", "result_type")?,
        error: row_helpers::get_opt(row, 6, "artifacts", "error")?,
        created_at: row_helpers::get(row, 7, "artifacts", "created_at")?,
    })
}
