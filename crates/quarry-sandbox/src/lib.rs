pub mod engine;
pub mod executor;
pub mod mock;
pub mod router;
pub mod tables;

pub use engine::{
    CallOutcome, CodeEngine, CompileError, EngineFactory, EngineFault, EngineStep, PauseRequest,
    ResourceLimits,
};
pub use executor::{CodeExecutor, ExecutionOutcome, OutputType, DEFAULT_EXECUTION_BUDGET};
pub use router::{FunctionRouter, RouterError, EXTERNAL_FUNCTIONS};
pub use tables::{ColumnInfo, SqliteTableStore, TableRow, TableStore, TableStoreError};
