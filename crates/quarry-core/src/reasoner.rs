use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{ReasonerMessage, Role};
use crate::tools::AnalysisTools;

/// A prior exchange handed to the capability for context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

/// One run's input: the new user message plus conversation history.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReasonerRequest {
    pub user_message: String,
    pub history: Vec<HistoryMessage>,
}

impl ReasonerRequest {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self { user_message: user_message.into(), history: Vec::new() }
    }

    pub fn with_history(mut self, history: Vec<HistoryMessage>) -> Self {
        self.history = history;
        self
    }
}

/// Bounds enforced by the capability per run.
#[derive(Clone, Copy, Debug)]
pub struct ReasonerLimits {
    pub max_turns: u32,
}

#[derive(Clone, Debug, Error)]
pub enum ReasonerError {
    /// The capability could not be started at all.
    #[error("reasoner unavailable: {0}")]
    Unavailable(String),

    /// The message stream faulted mid-run.
    #[error("reasoner interrupted: {0}")]
    Interrupted(String),

    #[error("{0}")]
    Internal(String),
}

pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<ReasonerMessage, ReasonerError>> + Send>>;

/// The opaque agent capability. Implementations drive their own tool calls
/// against the provided toolbox while the returned stream is consumed; the
/// orchestrator only observes the structured messages.
#[async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        request: ReasonerRequest,
        tools: Arc<dyn AnalysisTools>,
        limits: &ReasonerLimits,
    ) -> Result<MessageStream, ReasonerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let req = ReasonerRequest::new("how many trips?").with_history(vec![HistoryMessage {
            role: Role::User,
            content: "hello".into(),
        }]);
        assert_eq!(req.user_message, "how many trips?");
        assert_eq!(req.history.len(), 1);
    }

    #[test]
    fn error_display() {
        let e = ReasonerError::Unavailable("connection refused".into());
        assert_eq!(e.to_string(), "reasoner unavailable: connection refused");
    }
}
