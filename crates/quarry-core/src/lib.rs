pub mod events;
pub mod ids;
pub mod messages;
pub mod reasoner;
pub mod tools;

pub use events::{ArtifactPayload, ChatEvent, DoneSummary, RunTiming, SpanKind, TimingSpan, ToolTiming};
pub use ids::{ArtifactId, ConversationId, MessageId};
pub use messages::{AssistantBlock, ReasonerMessage, Role};
pub use reasoner::{
    HistoryMessage, MessageStream, Reasoner, ReasonerError, ReasonerLimits, ReasonerRequest,
};
pub use tools::{AnalysisTools, ToolReply, TOOL_EXECUTE_CODE, TOOL_LOAD_RESULT};
