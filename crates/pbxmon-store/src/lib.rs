//! Persistence layer for device alert state, configuration and emitted
//! events.
//!
//! The default implementation ([`sqlite::SqliteStore`]) keeps everything in
//! one SQLite database with WAL mode; [`memory`] provides map-backed
//! collaborators for tests and embedded use. Both implement the collaborator
//! traits from `pbxmon-alert`.

pub mod error;
pub mod memory;
pub mod sqlite;
