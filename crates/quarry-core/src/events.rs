use serde::{Deserialize, Serialize};

use crate::ids::ArtifactId;

/// Kind of work a timing span covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Llm,
    Tool,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One interval of a run's timeline, measured in milliseconds from run start.
/// Spans are appended chronologically; each starts where the previous ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSpan {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SpanKind,
    pub start_ms: u64,
    pub duration_ms: u64,
}

impl TimingSpan {
    pub fn end_ms(&self) -> u64 {
        self.start_ms + self.duration_ms
    }
}

/// Duration and outcome of a single sandbox tool call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTiming {
    pub name: String,
    pub duration_ms: u64,
    pub has_error: bool,
}

/// Timing summary for one completed run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTiming {
    pub total_ms: u64,
    pub turns: u32,
    pub tool_calls: u32,
    pub spans: Vec<TimingSpan>,
    pub tool_details: Vec<ToolTiming>,
}

/// The event-model view of a persisted artifact (no state blob, no timestamps).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub id: ArtifactId,
    pub code: String,
    pub result_json: Option<String>,
    pub result_type: Option<String>,
    pub error: Option<String>,
}

/// Terminal payload of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneSummary {
    pub artifacts: Vec<ArtifactId>,
    pub timing: RunTiming,
}

/// Events emitted on the chat stream, in order.
///
/// Ordering contract: `status`/`text`/`code`/`error` events form the live
/// portion of the stream; every `artifact` event follows the live portion,
/// and exactly one `done` event terminates the stream. Consumers may rely
/// on `done` being last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    #[serde(rename = "status")]
    Status { message: String },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "code")]
    Code { code: String },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "artifact")]
    Artifact { artifact: ArtifactPayload },

    #[serde(rename = "done")]
    Done { summary: DoneSummary },
}

impl ChatEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status { message: message.into() }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn code(code: impl Into<String>) -> Self {
        Self::Code { code: code.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Text { .. } => "text",
            Self::Code { .. } => "code",
            Self::Error { .. } => "error",
            Self::Artifact { .. } => "artifact",
            Self::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}
