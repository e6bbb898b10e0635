//! Data models for Satchel

mod snapshot;
mod submission;

pub use snapshot::FormSnapshot;
pub use submission::{LocalId, NewSubmission, SubmissionRecord, SubmissionStatus, Visibility};
