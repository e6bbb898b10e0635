//! Cached form definition model

use serde::{Deserialize, Serialize};

/// Last known server-side definition of a form.
///
/// One snapshot per form, overwritten on each successful online fetch. Used
/// only so the UI can render a form while offline; conflict detection for
/// queued submissions always compares against a live server fetch, never
/// against this cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSnapshot {
    /// Form identifier
    pub form_id: String,
    /// Owning project
    pub project_id: String,
    /// Server-assigned version of this definition
    pub version: String,
    /// Serialized form definition, opaque to the engine
    pub payload: Vec<u8>,
    /// Fetch timestamp (Unix ms)
    pub updated_at: i64,
}

impl FormSnapshot {
    /// Create a snapshot stamped with the current time
    #[must_use]
    pub fn new(
        form_id: impl Into<String>,
        project_id: impl Into<String>,
        version: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            form_id: form_id.into(),
            project_id: project_id.into(),
            version: version.into(),
            payload,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_snapshot_is_timestamped() {
        let snapshot = FormSnapshot::new("form-1", "proj-1", "2.1", b"{}".to_vec());
        assert_eq!(snapshot.form_id, "form-1");
        assert_eq!(snapshot.version, "2.1");
        assert!(snapshot.updated_at > 0);
    }
}
