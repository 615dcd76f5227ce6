//! Persistence layer — libSQL-backed storage for client profiles, the
//! message log and reminders.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
