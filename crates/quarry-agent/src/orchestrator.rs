use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, instrument, warn};

use quarry_core::events::{ChatEvent, DoneSummary, RunTiming, SpanKind};
use quarry_core::ids::{ArtifactId, ConversationId};
use quarry_core::messages::{AssistantBlock, ReasonerMessage, Role};
use quarry_core::reasoner::{HistoryMessage, Reasoner, ReasonerLimits, ReasonerRequest};
use quarry_core::tools::{AnalysisTools, TOOL_EXECUTE_CODE, TOOL_LOAD_RESULT};
use quarry_sandbox::{CodeExecutor, OutputType};
use quarry_store::{
    ArtifactRepo, ConversationRepo, Database, MessageRepo, StoreError, DEFAULT_TITLE,
};

use crate::state::{RunState, WorkerItem};
use crate::tools::SandboxToolbox;

/// Turn ceiling for one reasoning run.
pub const DEFAULT_MAX_TURNS: u32 = 25;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub max_turns: u32,
    /// Worker-to-consumer queue depth.
    pub queue_capacity: usize,
    /// Outbound event buffer depth.
    pub stream_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_turns: DEFAULT_MAX_TURNS, queue_capacity: 64, stream_capacity: 64 }
    }
}

/// Outcome of re-running a stored artifact's code unit. Nothing new is
/// persisted.
#[derive(Clone, Debug, Serialize)]
pub struct ReplayOutcome {
    pub artifact_id: ArtifactId,
    pub code: String,
    pub result_json: Option<String>,
    pub result_type: OutputType,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("artifact not found: {0}")]
    NotFound(ArtifactId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("replay task failed")]
    TaskFailed,
}

/// Runs conversational exchanges: one `stream` call drives one user
/// message through the agent capability and yields the live event
/// sequence, then finalizes persistence and timing.
pub struct ChatOrchestrator {
    reasoner: Arc<dyn Reasoner>,
    executor: Arc<CodeExecutor>,
    db: Database,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    pub fn new(reasoner: Arc<dyn Reasoner>, executor: Arc<CodeExecutor>, db: Database) -> Self {
        Self { reasoner, executor, db, config: OrchestratorConfig::default() }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Stream one exchange. Events arrive in protocol order: an immediate
    /// status, the live portion, pending artifacts, then exactly one
    /// `done`. Not restartable; each call is an independent run.
    pub fn stream(
        &self,
        conversation_id: ConversationId,
        user_message: String,
    ) -> ReceiverStream<ChatEvent> {
        let (tx, rx) = mpsc::channel(self.config.stream_capacity);
        let run = StreamRun {
            reasoner: self.reasoner.clone(),
            executor: self.executor.clone(),
            db: self.db.clone(),
            config: self.config.clone(),
            events: tx,
        };
        tokio::spawn(run.run(conversation_id, user_message));
        ReceiverStream::new(rx)
    }

    /// Re-run a stored artifact's code unit against current data.
    #[instrument(skip(self), fields(artifact_id = %artifact_id))]
    pub async fn replay(&self, artifact_id: &ArtifactId) -> Result<ReplayOutcome, ReplayError> {
        let artifacts = ArtifactRepo::new(self.db.clone());
        let row = artifacts.get(artifact_id).map_err(|e| match e {
            StoreError::NotFound(_) => ReplayError::NotFound(artifact_id.clone()),
            other => ReplayError::Store(other),
        })?;

        let executor = self.executor.clone();
        let code = row.code.clone();
        let outcome = tokio::task::spawn_blocking(move || executor.run(&code))
            .await
            .map_err(|e| {
                error!(error = %e, "replay task failed");
                ReplayError::TaskFailed
            })?;

        Ok(ReplayOutcome {
            artifact_id: row.id,
            code: row.code,
            result_json: outcome.output_json,
            result_type: outcome.output_type,
            error: outcome.error,
        })
    }
}

/// Owned per-run half of the orchestrator; lives inside the spawned task.
struct StreamRun {
    reasoner: Arc<dyn Reasoner>,
    executor: Arc<CodeExecutor>,
    db: Database,
    config: OrchestratorConfig,
    events: mpsc::Sender<ChatEvent>,
}

impl StreamRun {
    async fn emit(&self, event: ChatEvent) {
        if self.events.send(event).await.is_err() {
            warn!("stream consumer gone; event dropped");
        }
    }

    /// Terminal failure before the worker started: surface the error and
    /// still close the stream with a `done`.
    async fn abort(&self, message: String) {
        error!(error = %message, "stream aborted before agent start");
        self.emit(ChatEvent::error(message)).await;
        self.emit(ChatEvent::Done {
            summary: DoneSummary { artifacts: Vec::new(), timing: RunTiming::default() },
        })
        .await;
    }

    #[instrument(skip(self, user_message), fields(conversation_id = %conversation_id))]
    async fn run(self, conversation_id: ConversationId, user_message: String) {
        // 1. First byte before any agent work.
        self.emit(ChatEvent::status("Starting analysis...")).await;

        let conversations = ConversationRepo::new(self.db.clone());
        let messages = MessageRepo::new(self.db.clone());

        // 2. Context load. History is read before the new message is
        // appended, so it never contains the message being answered.
        if let Err(e) = conversations.get(&conversation_id) {
            return self.abort(format!("failed to load conversation: {e}")).await;
        }
        let history: Vec<HistoryMessage> = match messages.list(&conversation_id) {
            Ok(rows) => rows
                .into_iter()
                .map(|row| HistoryMessage { role: row.role, content: row.content })
                .collect(),
            Err(e) => return self.abort(format!("failed to load history: {e}")).await,
        };
        if let Err(e) = messages.append(&conversation_id, Role::User, &user_message) {
            return self.abort(format!("failed to persist message: {e}")).await;
        }

        // 3. Per-run state, shared with the worker and the toolbox.
        let state = Arc::new(RunState::new(conversation_id.clone()));
        let (queue_tx, mut queue_rx) = mpsc::channel(self.config.queue_capacity);
        let toolbox: Arc<dyn AnalysisTools> = Arc::new(SandboxToolbox::new(
            self.executor.clone(),
            ArtifactRepo::new(self.db.clone()),
            state.clone(),
            queue_tx.clone(),
        ));

        let request = ReasonerRequest::new(user_message.clone()).with_history(history);
        let limits = ReasonerLimits { max_turns: self.config.max_turns };
        let worker = tokio::spawn(worker_loop(
            self.reasoner.clone(),
            request,
            toolbox,
            limits,
            state.clone(),
            queue_tx,
        ));

        // 4. Consumer loop: re-emit worker items until the sentinel,
        // accumulating text as the assistant's reply.
        let mut reply = String::new();
        loop {
            match queue_rx.recv().await {
                Some(WorkerItem::Sentinel) => break,
                Some(WorkerItem::Text(text)) => {
                    reply.push_str(&text);
                    self.emit(ChatEvent::text(text)).await;
                }
                Some(WorkerItem::Code(code)) => self.emit(ChatEvent::code(code)).await,
                Some(WorkerItem::Status(message)) => self.emit(ChatEvent::status(message)).await,
                Some(WorkerItem::Error(message)) => self.emit(ChatEvent::error(message)).await,
                None => {
                    warn!("run queue closed without sentinel");
                    break;
                }
            }
        }
        if let Err(e) = worker.await {
            error!(error = %e, "worker task failed");
        }

        // 5. Finalize persistence. Faults here are surfaced but nothing
        // already written is rolled back.
        if !reply.trim().is_empty() {
            if let Err(e) = messages.append(&conversation_id, Role::Assistant, &reply) {
                error!(error = %e, "failed to persist assistant reply");
                self.emit(ChatEvent::error(format!("failed to persist reply: {e}"))).await;
            }
        }
        match conversations.get(&conversation_id) {
            Ok(conversation) if conversation.title == DEFAULT_TITLE => {
                if let Err(e) =
                    conversations.update_title(&conversation_id, &derive_title(&user_message))
                {
                    error!(error = %e, "failed to update conversation title");
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to re-read conversation"),
        }

        // 6. Pending artifacts in creation order, then exactly one done.
        let pending = state.take_artifacts();
        for row in &pending {
            self.emit(ChatEvent::Artifact { artifact: row.to_payload() }).await;
        }

        let (spans, total_ms) = state.finish_timeline();
        let summary = DoneSummary {
            artifacts: pending.into_iter().map(|row| row.id).collect(),
            timing: RunTiming {
                total_ms,
                turns: state.turns(),
                tool_calls: state.tool_calls(),
                spans,
                tool_details: state.take_tool_timings(),
            },
        };
        debug!(total_ms, turns = summary.timing.turns, "run complete");
        self.emit(ChatEvent::Done { summary }).await;
    }
}

/// Background unit: drives the reasoner stream, translating observed
/// messages into queue items. Always pushes the sentinel, even when the
/// capability faults.
async fn worker_loop(
    reasoner: Arc<dyn Reasoner>,
    request: ReasonerRequest,
    tools: Arc<dyn AnalysisTools>,
    limits: ReasonerLimits,
    state: Arc<RunState>,
    queue: mpsc::Sender<WorkerItem>,
) {
    if let Err(message) = drive_reasoner(reasoner, request, tools, limits, &state, &queue).await {
        push(&queue, WorkerItem::Error(message)).await;
    }
    push(&queue, WorkerItem::Sentinel).await;
}

async fn drive_reasoner(
    reasoner: Arc<dyn Reasoner>,
    request: ReasonerRequest,
    tools: Arc<dyn AnalysisTools>,
    limits: ReasonerLimits,
    state: &RunState,
    queue: &mpsc::Sender<WorkerItem>,
) -> Result<(), String> {
    let mut stream = reasoner
        .run(request, tools, &limits)
        .await
        .map_err(|e| e.to_string())?;
    push(queue, WorkerItem::Status("Agent is thinking...".into())).await;

    while let Some(message) = stream.next().await {
        match message.map_err(|e| e.to_string())? {
            ReasonerMessage::Assistant { blocks } => {
                let turn = state.begin_turn();
                state.mark_span(format!("LLM Turn {turn}"), SpanKind::Llm);
                for block in blocks {
                    match block {
                        AssistantBlock::Text { text } => {
                            if !text.trim().is_empty() {
                                push(queue, WorkerItem::Text(text)).await;
                            }
                        }
                        AssistantBlock::ToolUse { name, input } => {
                            state.record_tool_call();
                            if name == TOOL_EXECUTE_CODE {
                                let code = input
                                    .get("code")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string();
                                push(queue, WorkerItem::Code(code)).await;
                            } else if name == TOOL_LOAD_RESULT {
                                push(queue, WorkerItem::Status("Loading result data...".into()))
                                    .await;
                            }
                        }
                    }
                }
            }
            ReasonerMessage::ToolResults => {
                state.mark_span("Tool Execution", SpanKind::Tool);
                push(queue, WorkerItem::Status("Analyzing results...".into())).await;
            }
        }
    }
    Ok(())
}

async fn push(queue: &mpsc::Sender<WorkerItem>, item: WorkerItem) {
    if queue.send(item).await.is_err() {
        warn!("run queue closed; worker item dropped");
    }
}

/// First user message, character-capped for the sidebar.
fn derive_title(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() >= 80 {
        let head: String = trimmed.chars().take(77).collect();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}
