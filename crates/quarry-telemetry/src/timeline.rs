use std::time::Instant;

use quarry_core::events::{SpanKind, TimingSpan};

/// Records how one run's wall-clock time was spent.
///
/// Each `mark` closes the interval since the previous boundary into a
/// span, so the recorded spans always tile the timeline with no gaps and
/// no overlap. All arithmetic happens on millisecond offsets from the run
/// origin, which keeps `finish()` totals exact: the last span ends at
/// `total_ms`.
pub struct Timeline {
    origin: Instant,
    last_offset_ms: u64,
    spans: Vec<TimingSpan>,
}

impl Timeline {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            last_offset_ms: 0,
            spans: Vec::new(),
        }
    }

    fn offset_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Close the interval since the previous boundary as a named span.
    pub fn mark(&mut self, name: impl Into<String>, kind: SpanKind) {
        let now = self.offset_ms();
        self.spans.push(TimingSpan {
            name: name.into(),
            kind,
            start_ms: self.last_offset_ms,
            duration_ms: now - self.last_offset_ms,
        });
        self.last_offset_ms = now;
    }

    pub fn spans(&self) -> &[TimingSpan] {
        &self.spans
    }

    /// Consume the timeline, returning the spans and the run total.
    /// The total is the last boundary offset, or elapsed time when no
    /// spans were recorded.
    pub fn finish(self) -> (Vec<TimingSpan>, u64) {
        let total_ms = if self.spans.is_empty() {
            self.offset_ms()
        } else {
            self.last_offset_ms
        };
        (self.spans, total_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn spans_partition_the_timeline() {
        let mut timeline = Timeline::start();
        std::thread::sleep(Duration::from_millis(15));
        timeline.mark("LLM Turn 1", SpanKind::Llm);
        std::thread::sleep(Duration::from_millis(10));
        timeline.mark("Tool Execution", SpanKind::Tool);
        std::thread::sleep(Duration::from_millis(5));
        timeline.mark("LLM Turn 2", SpanKind::Llm);

        let (spans, total_ms) = timeline.finish();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].start_ms, 0);
        for w in spans.windows(2) {
            assert_eq!(w[0].end_ms(), w[1].start_ms, "gap between {:?} and {:?}", w[0], w[1]);
        }
        assert_eq!(spans[2].end_ms(), total_ms);
    }

    #[test]
    fn kinds_and_names_recorded() {
        let mut timeline = Timeline::start();
        timeline.mark("LLM Turn 1", SpanKind::Llm);
        timeline.mark("Tool Execution", SpanKind::Tool);

        assert_eq!(timeline.spans()[0].name, "LLM Turn 1");
        assert_eq!(timeline.spans()[0].kind, SpanKind::Llm);
        assert_eq!(timeline.spans()[1].kind, SpanKind::Tool);
    }

    #[test]
    fn empty_timeline_totals_elapsed() {
        let timeline = Timeline::start();
        std::thread::sleep(Duration::from_millis(5));
        let (spans, total_ms) = timeline.finish();
        assert!(spans.is_empty());
        assert!(total_ms >= 5, "got: {total_ms}");
    }
}
