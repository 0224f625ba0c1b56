//! Workflow engine core: step dispatch, the per-instance state machine,
//! cancellation, and completion delivery.
//!
//! - `step` -- step handler trait, boxed wrapper, and the handler registry
//! - `executor` -- runs one step (inline or on its own task)
//! - `checkpoint` -- journal-backed checkpoints for the driver loop
//! - `machine` -- drives one instance from its current boundary to a terminal status
//! - `cancel` -- records cancellation intent
//! - `completion` -- completion handlers and the at-most-once dispatcher
//! - `lease` -- cross-process driver leases
//! - `manager` -- public facade that owns driver tasks

pub mod cancel;
pub mod checkpoint;
pub mod completion;
pub mod error;
pub mod executor;
pub mod lease;
pub mod machine;
pub mod manager;
pub mod step;

pub use completion::{
    BoxCompletionHandler, CallbackError, CompletionHandler, CompletionRegistry, completion_fn,
};
pub use error::EngineError;
pub use lease::LeaseSettings;
pub use manager::WorkflowManager;
pub use step::{BoxStepHandler, StepError, StepHandler, StepInput, StepRegistry, step_fn};
