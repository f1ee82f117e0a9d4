use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use quarry_core::events::{SpanKind, TimingSpan, ToolTiming};
use quarry_core::ids::ConversationId;
use quarry_store::ArtifactRow;
use quarry_telemetry::Timeline;

/// Items the worker pushes onto the run queue, in emission order.
/// The consumer stops at `Sentinel`; a closed channel without one means
/// the worker died early.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerItem {
    Text(String),
    Code(String),
    Status(String),
    Error(String),
    Sentinel,
}

/// Mutable state scoped to a single streaming run. Created inside
/// `stream` and shared between the worker task and the toolbox; the
/// finalizer drains it after the sentinel.
pub struct RunState {
    conversation_id: ConversationId,
    timeline: Mutex<Timeline>,
    artifacts: Mutex<Vec<ArtifactRow>>,
    tool_timings: Mutex<Vec<ToolTiming>>,
    turns: AtomicU32,
    tool_calls: AtomicU32,
}

impl RunState {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            timeline: Mutex::new(Timeline::start()),
            artifacts: Mutex::new(Vec::new()),
            tool_timings: Mutex::new(Vec::new()),
            turns: AtomicU32::new(0),
            tool_calls: AtomicU32::new(0),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Increment the turn counter, returning the new 1-based turn number.
    pub fn begin_turn(&self) -> u32 {
        self.turns.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Close the interval since the last boundary as a named span.
    pub fn mark_span(&self, name: impl Into<String>, kind: SpanKind) {
        self.timeline.lock().mark(name, kind);
    }

    pub fn record_tool_call(&self) {
        self.tool_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_artifact(&self, artifact: ArtifactRow) {
        self.artifacts.lock().push(artifact);
    }

    pub fn record_tool_timing(&self, timing: ToolTiming) {
        self.tool_timings.lock().push(timing);
    }

    pub fn turns(&self) -> u32 {
        self.turns.load(Ordering::SeqCst)
    }

    pub fn tool_calls(&self) -> u32 {
        self.tool_calls.load(Ordering::SeqCst)
    }

    /// Drain the pending artifacts in creation order.
    pub fn take_artifacts(&self) -> Vec<ArtifactRow> {
        std::mem::take(&mut *self.artifacts.lock())
    }

    pub fn take_tool_timings(&self) -> Vec<ToolTiming> {
        std::mem::take(&mut *self.tool_timings.lock())
    }

    /// Close the run timeline, returning its spans and the run total.
    pub fn finish_timeline(&self) -> (Vec<TimingSpan>, u64) {
        let timeline = std::mem::replace(&mut *self.timeline.lock(), Timeline::start());
        timeline.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ids::ArtifactId;

    fn artifact(code: &str) -> ArtifactRow {
        ArtifactRow {
            id: ArtifactId::new(),
            conversation_id: ConversationId::from_raw("conv_test"),
            message_id: None,
            code: code.into(),
            result_json: Some("42".into()),
            result_type: Some("scalar".into()),
            error: None,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn turn_numbers_are_one_based() {
        let state = RunState::new(ConversationId::from_raw("conv_test"));
        assert_eq!(state.begin_turn(), 1);
        assert_eq!(state.begin_turn(), 2);
        assert_eq!(state.turns(), 2);
    }

    #[test]
    fn artifacts_drain_in_order() {
        let state = RunState::new(ConversationId::from_raw("conv_test"));
        let first = artifact("count('trips')");
        let second = artifact("tables()");
        state.record_artifact(first.clone());
        state.record_artifact(second.clone());

        let drained = state.take_artifacts();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, first.id);
        assert_eq!(drained[1].id, second.id);
        assert!(state.take_artifacts().is_empty());
    }

    #[test]
    fn tool_counters_and_timings() {
        let state = RunState::new(ConversationId::from_raw("conv_test"));
        state.record_tool_call();
        state.record_tool_call();
        state.record_tool_timing(ToolTiming {
            name: "execute_code".into(),
            duration_ms: 12,
            has_error: false,
        });

        assert_eq!(state.tool_calls(), 2);
        let timings = state.take_tool_timings();
        assert_eq!(timings.len(), 1);
        assert_eq!(timings[0].name, "execute_code");
    }

    #[test]
    fn finish_timeline_totals_span_boundaries() {
        let state = RunState::new(ConversationId::from_raw("conv_test"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        state.mark_span("LLM Turn 1", SpanKind::Llm);
        state.mark_span("Tool Execution", SpanKind::Tool);

        let (spans, total_ms) = state.finish_timeline();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start_ms, 0);
        assert_eq!(spans[1].end_ms(), total_ms);
    }
}
