use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tool name the agent capability uses to run a code unit in the sandbox.
pub const TOOL_EXECUTE_CODE: &str = "execute_code";
/// Tool name the agent capability uses to load a stored result by UID.
pub const TOOL_LOAD_RESULT: &str = "load_result";

/// Textual reply returned to the agent capability from a tool call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolReply {
    pub text: String,
    pub is_error: bool,
}

impl ToolReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_error: false }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_error: true }
    }
}

/// Capabilities exposed to the agent loop. The capability invokes these
/// itself while reasoning; replies are short summaries, never raw data
/// dumps (the agent loads previews explicitly via `load_result`).
#[async_trait]
pub trait AnalysisTools: Send + Sync {
    async fn execute_code(&self, code: &str) -> ToolReply;
    async fn load_result(&self, uid: &str) -> ToolReply;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_constructors() {
        let ok = ToolReply::ok("Result UID: art_1");
        assert!(!ok.is_error);
        assert_eq!(ok.text, "Result UID: art_1");

        let err = ToolReply::error("Error: boom");
        assert!(err.is_error);
    }
}
