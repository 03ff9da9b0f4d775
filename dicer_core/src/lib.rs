pub mod classify;
pub mod compiler;
pub mod config;
pub mod constraint;
pub mod executor;
pub mod helpers;
pub mod item;
pub mod manager;
pub mod parser;
pub mod provider;
pub mod symbol;
pub mod trace;
pub mod value;

pub use classify::{Classification, Classifier, Outcome, Tally};
pub use compiler::{CompileError, compile};
pub use config::DicerConfig;
pub use constraint::{Constraint, ConstraintError};
pub use executor::{
    CommandExecutor, CommandExecutorConfig, ExecutionStatus, Executor, InProcessExecutor,
    RunResult,
};
pub use helpers::{HelperError, HelperRegistry};
pub use item::{FieldItem, Item, ItemError};
pub use manager::{ConstraintManager, ManagerError, Precondition, Status, Statuses};
pub use provider::{DirectoryProvider, OracleRecord, Provider, ProviderError};
pub use symbol::{Domain, GenerateError, SymbolType};
pub use trace::{Solver, Trace, Verdict};
pub use value::{FieldPath, Value};
