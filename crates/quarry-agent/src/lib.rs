pub mod mock;
pub mod orchestrator;
pub mod state;
pub mod tools;

pub use orchestrator::{
    ChatOrchestrator, OrchestratorConfig, ReplayError, ReplayOutcome, DEFAULT_MAX_TURNS,
};
pub use state::{RunState, WorkerItem};
pub use tools::{SandboxToolbox, MAX_LOAD_ROWS};
