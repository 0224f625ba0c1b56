//! Business logic and journal trait definitions for Waypoint.
//!
//! This crate defines the "ports" (journal traits) that the infrastructure
//! layer implements, plus the workflow state machine that drives instances
//! through their steps. It depends only on `waypoint-types` -- never on
//! `waypoint-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
