//! Database layer for Satchel

mod connection;
mod meta_repository;
mod migrations;
mod snapshot_repository;
mod submission_repository;

pub use connection::Database;
pub use meta_repository::{LibSqlMetaRepository, MetaRepository};
pub use snapshot_repository::{LibSqlSnapshotRepository, SnapshotRepository};
pub use submission_repository::{LibSqlSubmissionRepository, SubmissionRepository};
