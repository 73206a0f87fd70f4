//! Step execution
//!
//! The engine module provides the `ExecutionEngine`, which consumes step
//! messages, runs their handlers and records every state transition.

mod executor;
mod observer;
mod record;

pub use executor::{
    EngineConfig, EngineError, ExecutionEngine, COMPLETED_SUFFIX, DEAD_LETTER_SUFFIX,
    STEP_EXECUTION_FAILED,
};
pub use observer::{ExecutionObserver, TransitionEvent};
pub use record::{ExecutionStatus, ExecutionStore, InMemoryExecutionStore, WorkflowExecutionRecord};
