use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Bounds passed to the engine for one run.
#[derive(Clone, Copy, Debug)]
pub struct ResourceLimits {
    pub max_duration: Duration,
}

/// A suspended external function call: the code unit is paused until the
/// host resumes it with a return value or a raised error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PauseRequest {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl PauseRequest {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }
}

/// Where the engine stopped after a step.
#[derive(Debug)]
pub enum EngineStep {
    /// Suspended at an external function call.
    Paused(PauseRequest),
    /// Suspended at an await point. Never expected for the synchronous
    /// code units this system runs.
    AsyncPaused,
    /// Ran to completion with an optional final value.
    Complete(Option<Value>),
}

/// Value or error injected into the paused call site on resume.
#[derive(Clone, Debug)]
pub enum CallOutcome {
    Return(Value),
    Raise(String),
}

/// Runtime fault surfaced by the engine. Terminal for the run.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct EngineFault {
    pub message: String,
}

impl EngineFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Parse-time diagnostic. The code unit never started.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// An interruptible engine holding one compiled code unit. The host drives
/// it step by step: `start`, then `resume` for every pause, until a
/// `Complete` step or a fault.
pub trait CodeEngine: Send + std::fmt::Debug {
    fn start(&mut self, limits: &ResourceLimits) -> Result<EngineStep, EngineFault>;

    fn resume(&mut self, outcome: CallOutcome) -> Result<EngineStep, EngineFault>;

    /// Opaque serialized engine state, captured for later replay.
    fn dump(&self) -> Vec<u8>;
}

/// Compiles source text into a ready-to-start engine.
pub trait EngineFactory: Send + Sync {
    fn compile(
        &self,
        code: &str,
        external_functions: &[&str],
    ) -> Result<Box<dyn CodeEngine>, CompileError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pause_request_builder() {
        let request = PauseRequest::new("fetch")
            .with_arg(json!("trips"))
            .with_kwarg("limit", json!(10));
        assert_eq!(request.function, "fetch");
        assert_eq!(request.args, vec![json!("trips")]);
        assert_eq!(request.kwargs.get("limit"), Some(&json!(10)));
    }

    #[test]
    fn pause_request_serde_defaults() {
        let request: PauseRequest = serde_json::from_str(r#"{"function": "tables"}"#).unwrap();
        assert_eq!(request.function, "tables");
        assert!(request.args.is_empty());
        assert!(request.kwargs.is_empty());
    }

    #[test]
    fn fault_display() {
        let fault = EngineFault::new("division by zero");
        assert_eq!(fault.to_string(), "division by zero");
        let diag = CompileError::new("unexpected token at line 2");
        assert_eq!(diag.to_string(), "unexpected token at line 2");
    }
}
