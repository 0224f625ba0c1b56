//! Repository trait definitions (ports) and the in-memory journal.
//!
//! The infrastructure layer (waypoint-infra) implements these traits with
//! SQLite. The core crate never depends on any specific storage technology.

pub mod memory;
pub mod workflow;
