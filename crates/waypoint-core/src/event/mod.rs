//! Event bus for workflow lifecycle notifications.
//!
//! `EventBus` fans `WorkflowEvent`s out to every subscriber;
//! `WorkflowSubscription` narrows the stream to one instance.

pub mod bus;

pub use bus::{EventBus, WorkflowSubscription};
