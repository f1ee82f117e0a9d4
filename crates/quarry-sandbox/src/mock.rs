//! Scripted engines for tests. Each compiled program replays a fixed
//! sequence of pauses, then finishes with a scripted result.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::engine::{
    CallOutcome, CodeEngine, CompileError, EngineFault, EngineFactory, EngineStep, PauseRequest,
    ResourceLimits,
};

/// One scripted suspension before the program finishes.
#[derive(Clone, Debug)]
pub enum ScriptedStep {
    /// Pause at an external function call.
    Call(PauseRequest),
    /// Burn wall-clock time, then pause. Used to trip execution budgets.
    SlowCall { request: PauseRequest, busy: Duration },
    /// Pause at an await point.
    AsyncPause,
}

/// How the program ends once its steps are exhausted.
#[derive(Clone, Debug)]
pub enum FinishWith {
    /// Complete with this value.
    Value(Option<Value>),
    /// Complete with whatever the last resumed call returned.
    LastCallResult,
    /// Fail with a runtime fault.
    Fault(String),
}

#[derive(Clone, Debug)]
pub struct ScriptedProgram {
    pub steps: Vec<ScriptedStep>,
    pub finish: FinishWith,
}

impl ScriptedProgram {
    /// A program that makes no calls and completes with `value`.
    pub fn completing(value: Value) -> Self {
        Self { steps: Vec::new(), finish: FinishWith::Value(Some(value)) }
    }

    /// A program that makes no calls and produces no value.
    pub fn empty() -> Self {
        Self { steps: Vec::new(), finish: FinishWith::Value(None) }
    }

    /// A program that makes one call and completes with its result.
    pub fn calling(request: PauseRequest) -> Self {
        Self { steps: vec![ScriptedStep::Call(request)], finish: FinishWith::LastCallResult }
    }

    /// A program that immediately faults.
    pub fn faulting(message: impl Into<String>) -> Self {
        Self { steps: Vec::new(), finish: FinishWith::Fault(message.into()) }
    }

    pub fn then_call(mut self, request: PauseRequest) -> Self {
        self.steps.push(ScriptedStep::Call(request));
        self
    }

    pub fn then_step(mut self, step: ScriptedStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn finishing(mut self, finish: FinishWith) -> Self {
        self.finish = finish;
        self
    }
}

/// Outcome of one scripted compile.
#[derive(Clone, Debug)]
pub enum ScriptedCompile {
    Program(ScriptedProgram),
    SyntaxError(String),
}

/// Factory that hands out scripted engines in order. Compiling past the
/// end of the script is an error.
pub struct ScriptedEngineFactory {
    script: Mutex<VecDeque<ScriptedCompile>>,
    compile_count: AtomicUsize,
}

impl ScriptedEngineFactory {
    pub fn new(script: Vec<ScriptedCompile>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            compile_count: AtomicUsize::new(0),
        }
    }

    pub fn with_program(program: ScriptedProgram) -> Self {
        Self::new(vec![ScriptedCompile::Program(program)])
    }

    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::SeqCst)
    }
}

impl EngineFactory for ScriptedEngineFactory {
    fn compile(
        &self,
        code: &str,
        _external_functions: &[&str],
    ) -> Result<Box<dyn CodeEngine>, CompileError> {
        self.compile_count.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match next {
            Some(ScriptedCompile::Program(program)) => {
                Ok(Box::new(ScriptedEngine::new(code, program)))
            }
            Some(ScriptedCompile::SyntaxError(message)) => Err(CompileError::new(message)),
            None => Err(CompileError::new("no scripted program for this compile")),
        }
    }
}

#[derive(Debug)]
struct ScriptedEngine {
    code: String,
    steps: Vec<ScriptedStep>,
    cursor: usize,
    finish: FinishWith,
    results: Vec<Value>,
}

impl ScriptedEngine {
    fn new(code: &str, program: ScriptedProgram) -> Self {
        Self {
            code: code.to_string(),
            steps: program.steps,
            cursor: 0,
            finish: program.finish,
            results: Vec::new(),
        }
    }

    fn advance(&mut self) -> Result<EngineStep, EngineFault> {
        if let Some(step) = self.steps.get(self.cursor).cloned() {
            self.cursor += 1;
            return Ok(match step {
                ScriptedStep::Call(request) => EngineStep::Paused(request),
                ScriptedStep::SlowCall { request, busy } => {
                    std::thread::sleep(busy);
                    EngineStep::Paused(request)
                }
                ScriptedStep::AsyncPause => EngineStep::AsyncPaused,
            });
        }
        match &self.finish {
            FinishWith::Value(value) => Ok(EngineStep::Complete(value.clone())),
            FinishWith::LastCallResult => Ok(EngineStep::Complete(self.results.last().cloned())),
            FinishWith::Fault(message) => Err(EngineFault::new(message.clone())),
        }
    }
}

impl CodeEngine for ScriptedEngine {
    fn start(&mut self, _limits: &ResourceLimits) -> Result<EngineStep, EngineFault> {
        self.advance()
    }

    fn resume(&mut self, outcome: CallOutcome) -> Result<EngineStep, EngineFault> {
        match outcome {
            CallOutcome::Return(value) => {
                self.results.push(value);
                self.advance()
            }
            CallOutcome::Raise(message) => Err(EngineFault::new(message)),
        }
    }

    fn dump(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "code": self.code,
            "results": self.results,
        }))
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LIMITS: ResourceLimits = ResourceLimits { max_duration: Duration::from_secs(30) };

    #[test]
    fn completes_without_calls() {
        let factory = ScriptedEngineFactory::with_program(ScriptedProgram::completing(json!(7)));
        let mut engine = factory.compile("7", &[]).unwrap();
        match engine.start(&LIMITS).unwrap() {
            EngineStep::Complete(Some(value)) => assert_eq!(value, json!(7)),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn pauses_then_finishes_with_call_result() {
        let factory = ScriptedEngineFactory::with_program(ScriptedProgram::calling(
            PauseRequest::new("tables"),
        ));
        let mut engine = factory.compile("tables()", &["tables"]).unwrap();
        match engine.start(&LIMITS).unwrap() {
            EngineStep::Paused(request) => assert_eq!(request.function, "tables"),
            other => panic!("unexpected step: {other:?}"),
        }
        match engine.resume(CallOutcome::Return(json!(["trips"]))).unwrap() {
            EngineStep::Complete(Some(value)) => assert_eq!(value, json!(["trips"])),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn raise_becomes_fault() {
        let factory = ScriptedEngineFactory::with_program(ScriptedProgram::calling(
            PauseRequest::new("fetch"),
        ));
        let mut engine = factory.compile("fetch()", &["fetch"]).unwrap();
        engine.start(&LIMITS).unwrap();
        let fault = engine
            .resume(CallOutcome::Raise("Unknown table: nope".into()))
            .unwrap_err();
        assert_eq!(fault.to_string(), "Unknown table: nope");
    }

    #[test]
    fn scripted_syntax_error_and_exhaustion() {
        let factory = ScriptedEngineFactory::new(vec![ScriptedCompile::SyntaxError(
            "unexpected indent".into(),
        )]);
        let err = factory.compile("  x", &[]).unwrap_err();
        assert_eq!(err.to_string(), "unexpected indent");
        let err = factory.compile("x", &[]).unwrap_err();
        assert_eq!(err.to_string(), "no scripted program for this compile");
        assert_eq!(factory.compile_count(), 2);
    }
}
