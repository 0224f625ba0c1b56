//! Infrastructure layer for Waypoint.
//!
//! Contains implementations of the journal trait defined in `waypoint-core`
//! (SQLite with a split reader/writer WAL pool), plus the config loader and
//! data-directory resolution.

pub mod config;
pub mod filesystem;
pub mod sqlite;
