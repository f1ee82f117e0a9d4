pub mod artifacts;
pub mod conversations;
pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;

pub use artifacts::{ArtifactRepo, ArtifactRow, NewArtifact};
pub use conversations::{ConversationRepo, ConversationRow, DEFAULT_TITLE};
pub use database::Database;
pub use error::StoreError;
pub use messages::{MessageRepo, MessageRow};
