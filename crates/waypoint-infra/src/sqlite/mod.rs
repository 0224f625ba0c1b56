//! SQLite storage layer.
//!
//! Journal implementation backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod journal;
pub mod pool;

pub use journal::SqliteWorkflowJournal;
pub use pool::DatabasePool;
