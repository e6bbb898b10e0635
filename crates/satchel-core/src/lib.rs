//! satchel-core - Core library for Satchel
//!
//! Offline-first form capture: a durable local queue of not-yet-delivered
//! submissions, a cache of form definitions for offline rendering, and the
//! sync engine that delivers queued submissions to the remote form server
//! once connectivity returns.

pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod sync;

pub use error::{Error, Result};
pub use models::{
    FormSnapshot, LocalId, NewSubmission, SubmissionRecord, SubmissionStatus, Visibility,
};
