use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, instrument, warn};

use quarry_core::events::ToolTiming;
use quarry_core::ids::ArtifactId;
use quarry_core::tools::{AnalysisTools, ToolReply, TOOL_EXECUTE_CODE};
use quarry_sandbox::{CodeExecutor, ExecutionOutcome, OutputType};
use quarry_store::{ArtifactRepo, ArtifactRow, NewArtifact, StoreError};

use crate::state::{RunState, WorkerItem};

/// Row cap for `load_result` table previews.
pub const MAX_LOAD_ROWS: usize = 100;

/// Tool surface handed to the agent capability for one run. Executions go
/// through the blocking pool; every execution is persisted as an artifact
/// whether it succeeded or not. Replies are short summaries, never the
/// full payload.
pub struct SandboxToolbox {
    executor: Arc<CodeExecutor>,
    artifacts: ArtifactRepo,
    state: Arc<RunState>,
    queue: mpsc::Sender<WorkerItem>,
}

impl SandboxToolbox {
    pub fn new(
        executor: Arc<CodeExecutor>,
        artifacts: ArtifactRepo,
        state: Arc<RunState>,
        queue: mpsc::Sender<WorkerItem>,
    ) -> Self {
        Self { executor, artifacts, state, queue }
    }

    async fn push(&self, item: WorkerItem) {
        if self.queue.send(item).await.is_err() {
            warn!("run queue closed; progress item dropped");
        }
    }
}

#[async_trait]
impl AnalysisTools for SandboxToolbox {
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    async fn execute_code(&self, code: &str) -> ToolReply {
        self.push(WorkerItem::Status("Running code in sandbox...".into())).await;

        let started = Instant::now();
        let executor = self.executor.clone();
        let unit = code.to_string();
        let outcome = match tokio::task::spawn_blocking(move || executor.run(&unit)).await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(error = %join_err, "execution task failed");
                self.state.record_tool_timing(ToolTiming {
                    name: TOOL_EXECUTE_CODE.into(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    has_error: true,
                });
                return ToolReply::error("Error: execution task failed");
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.state.record_tool_timing(ToolTiming {
            name: TOOL_EXECUTE_CODE.into(),
            duration_ms,
            has_error: outcome.error.is_some(),
        });

        let saved = self.artifacts.save(NewArtifact {
            conversation_id: self.state.conversation_id(),
            message_id: None,
            code,
            engine_state: outcome.engine_state.as_deref(),
            result_json: outcome.output_json.as_deref(),
            result_type: Some(outcome.output_type.as_str()),
            error: outcome.error.as_deref(),
        });
        let row = match saved {
            Ok(row) => row,
            Err(e) => {
                error!(error = %e, "failed to persist artifact");
                return ToolReply::error(format!("Error: failed to store result: {e}"));
            }
        };
        self.state.record_artifact(row.clone());

        if let Some(err) = &outcome.error {
            self.push(WorkerItem::Status("Code failed, agent may retry...".into())).await;
            return ToolReply::error(format!("Error: {err}"));
        }

        ToolReply::ok(execution_summary(&row.id, &outcome))
    }

    #[instrument(skip(self), fields(uid = %uid))]
    async fn load_result(&self, uid: &str) -> ToolReply {
        let artifact = match self.artifacts.get(&ArtifactId::from_raw(uid)) {
            Ok(row) => row,
            Err(StoreError::NotFound(_)) => {
                return ToolReply::error(format!("Error: No result found for UID {uid}"));
            }
            Err(e) => {
                error!(error = %e, "artifact lookup failed");
                return ToolReply::error(format!("Error: failed to load result: {e}"));
            }
        };

        if let Some(err) = &artifact.error {
            return ToolReply::error(format!("Error in result: {err}"));
        }

        ToolReply::ok(render_result(&artifact))
    }
}

/// Summary reply for a successful execution. Carries the artifact's UID
/// and declared shape so the agent can cite or load it later.
fn execution_summary(uid: &ArtifactId, outcome: &ExecutionOutcome) -> String {
    let json = outcome.output_json.as_deref().unwrap_or("null");
    match outcome.output_type {
        OutputType::Table => {
            let rows = outcome.output.as_ref().and_then(Value::as_array);
            let row_count = rows.map_or(0, |r| r.len());
            let columns = rows
                .and_then(|r| r.first())
                .and_then(Value::as_object)
                .map(|obj| obj.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            format!("Result UID: {uid}\nType: table\nRows: {row_count}\nColumns: {columns}")
        }
        OutputType::Scalar => {
            format!("Result UID: {uid}\nType: scalar (displayed as a metric)\nValue: {json}")
        }
        OutputType::Dict => {
            let keys = outcome
                .output
                .as_ref()
                .and_then(Value::as_object)
                .map(|obj| obj.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            format!("Result UID: {uid}\nType: dict (displayed as key-value pairs)\nKeys: {keys}")
        }
        OutputType::Other => {
            let data: String = json.chars().take(200).collect();
            format!("Result UID: {uid}\nType: {}\nData: {data}", outcome.output_type)
        }
        OutputType::None => format!("Result UID: {uid}\nType: none\nValue: None"),
    }
}

/// Full-text rendering of a stored result for the agent's context window.
fn render_result(artifact: &ArtifactRow) -> String {
    let json = match artifact.result_json.as_deref() {
        Some(s) if !s.is_empty() => s,
        _ => return "Result: None".into(),
    };
    let data: Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(_) => return json.to_string(),
    };

    if let Value::Array(rows) = &data {
        if rows.first().is_some_and(Value::is_object) {
            return render_table(rows);
        }
    }
    serde_json::to_string_pretty(&data).unwrap_or_else(|_| json.to_string())
}

fn render_table(rows: &[Value]) -> String {
    let columns: Vec<String> = rows
        .first()
        .and_then(Value::as_object)
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();

    let shown = rows.len().min(MAX_LOAD_ROWS);
    let header = columns.join(" | ");
    let separator = vec!["---"; columns.len()].join(" | ");
    let body: Vec<String> = rows[..shown]
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|col| cell_text(row.get(col)))
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .collect();

    let mut text = format!("{header}\n{separator}\n{}", body.join("\n"));
    if rows.len() > MAX_LOAD_ROWS {
        text.push_str(&format!("\n\n(Showing {shown} of {} rows)", rows.len()));
    }
    text
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::Null) => "None".into(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
