//! Workflow declaration
//!
//! A workflow is a chain of steps, each bound to a message topic with its
//! own handler, timeout, retry policy and callbacks.

mod handler;
mod registry;
mod step;

pub use handler::{
    callback_fn, handler_fn, CallbackContext, CallbackKind, HandlerError, StepCallback,
    StepHandler, StepOutcome,
};
pub use registry::{ValidationError, WorkflowRegistry, WorkflowRegistryBuilder};
pub use step::{StepBuilder, StepDefaults, StepDefinition};
