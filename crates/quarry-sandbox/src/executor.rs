//! The execution bridge: drives one untrusted code unit through the
//! engine's pause/resume protocol, routing each pause through the
//! function router, classifying the final output, and enforcing the
//! wall-clock budget.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::engine::{CallOutcome, EngineFactory, EngineStep, ResourceLimits};
use crate::router::{FunctionRouter, EXTERNAL_FUNCTIONS};

/// Wall-clock bound for one run, compile through completion.
pub const DEFAULT_EXECUTION_BUDGET: Duration = Duration::from_secs(30);

/// Display-oriented shape of a run's final value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    None,
    Table,
    Dict,
    Scalar,
    Other,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Table => "table",
            Self::Dict => "dict",
            Self::Scalar => "scalar",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "table" => Ok(Self::Table),
            "dict" => Ok(Self::Dict),
            "scalar" => Ok(Self::Scalar),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown output type: {other}")),
        }
    }
}

/// Terminal result of one code unit run.
///
/// `output_json` is populated exactly when `output` is; `error` and
/// `output` never coexist. `engine_state` is the engine's opaque
/// resumable-state capture, stored verbatim and never introspected.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub output: Option<Value>,
    pub output_json: Option<String>,
    pub output_type: OutputType,
    pub error: Option<String>,
    pub code: String,
    #[serde(skip)]
    pub engine_state: Option<Vec<u8>>,
}

impl ExecutionOutcome {
    fn failed(code: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            code: code.to_string(),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Compiles and runs code units against one engine factory and router.
pub struct CodeExecutor {
    factory: Arc<dyn EngineFactory>,
    router: Arc<FunctionRouter>,
    budget: Duration,
}

impl CodeExecutor {
    pub fn new(factory: Arc<dyn EngineFactory>, router: Arc<FunctionRouter>) -> Self {
        Self { factory, router, budget: DEFAULT_EXECUTION_BUDGET }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn router(&self) -> &FunctionRouter {
        &self.router
    }

    /// Runs one code unit to completion. Blocking; callers on an async
    /// runtime offload this to a blocking thread.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub fn run(&self, code: &str) -> ExecutionOutcome {
        let started = Instant::now();

        let mut engine = match self.factory.compile(code, &EXTERNAL_FUNCTIONS) {
            Ok(engine) => engine,
            Err(diag) => {
                return ExecutionOutcome::failed(code, format!("Syntax error: {diag}"));
            }
        };

        let limits = ResourceLimits { max_duration: self.budget };
        let mut step = engine.start(&limits);

        loop {
            if started.elapsed() > self.budget {
                warn!(budget_secs = self.budget.as_secs(), "execution budget exceeded");
                return ExecutionOutcome::failed(
                    code,
                    format!(
                        "Runtime error: execution exceeded {}s budget",
                        self.budget.as_secs()
                    ),
                );
            }

            match step {
                Ok(EngineStep::Paused(request)) => {
                    let outcome = match self.router.dispatch(&request) {
                        Ok(value) => CallOutcome::Return(value),
                        // The fault is injected at the call site; the
                        // engine's own termination logic decides the run.
                        Err(err) => CallOutcome::Raise(err.to_string()),
                    };
                    step = engine.resume(outcome);
                }
                Ok(EngineStep::AsyncPaused) => {
                    error!("engine yielded an async pause for a sync code unit");
                    return ExecutionOutcome::failed(
                        code,
                        "Unexpected async pause in sync execution",
                    );
                }
                Ok(EngineStep::Complete(output)) => {
                    let state = engine.dump();
                    debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "execution complete"
                    );
                    return completed(code, output, state);
                }
                Err(fault) => {
                    return ExecutionOutcome::failed(code, format!("Runtime error: {fault}"));
                }
            }
        }
    }
}

fn completed(code: &str, output: Option<Value>, engine_state: Vec<u8>) -> ExecutionOutcome {
    // A null final value carries no output.
    let output = output.filter(|value| !value.is_null());
    let (output_type, output_json) = classify(output.as_ref());
    ExecutionOutcome {
        output,
        output_json,
        output_type,
        error: None,
        code: code.to_string(),
        engine_state: Some(engine_state),
    }
}

fn classify(output: Option<&Value>) -> (OutputType, Option<String>) {
    let Some(value) = output else {
        return (OutputType::None, None);
    };
    let output_type = match value {
        Value::Array(items) if !items.is_empty() && items[0].is_object() => OutputType::Table,
        Value::Object(_) => OutputType::Dict,
        Value::Number(_) | Value::String(_) | Value::Bool(_) => OutputType::Scalar,
        _ => OutputType::Other,
    };
    let json = serde_json::to_string(value)
        .unwrap_or_else(|_| Value::String(value.to_string()).to_string());
    (output_type, Some(json))
}
