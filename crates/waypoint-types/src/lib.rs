//! Shared domain types for Waypoint.
//!
//! This crate contains the workflow definition and instance model, the
//! engine configuration, lifecycle events, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
