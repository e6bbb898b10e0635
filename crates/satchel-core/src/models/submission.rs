//! Submission queue models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Locally assigned submission identifier.
///
/// Monotonically increasing and never reused; the only stable handle for a
/// submission before the server acknowledges delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(i64);

impl LocalId {
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which remote submission endpoint a record is delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Anonymous submission path
    Public,
    /// Authenticated submission path
    Private,
}

impl Visibility {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

impl FromStr for Visibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            other => Err(Error::InvalidInput(format!("unknown visibility: {other}"))),
        }
    }
}

/// Lifecycle status of a queued submission.
///
/// `Synced` is terminal; a record reaches it at most once and is then
/// eligible for pruning. `VersionConflict` requires an explicit user
/// decision via the conflict resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Queued locally, awaiting the next sync run
    Pending,
    /// Claimed by an in-flight sync run
    Syncing,
    /// Acknowledged by the server
    Synced,
    /// Delivery attempt failed (network or server error)
    Failed,
    /// Captured form version no longer matches the server's
    VersionConflict,
}

impl SubmissionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::VersionConflict => "version_conflict",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            "version_conflict" => Ok(Self::VersionConflict),
            other => Err(Error::InvalidInput(format!(
                "unknown submission status: {other}"
            ))),
        }
    }
}

/// A locally captured form submission awaiting delivery.
///
/// `form_id` and `form_version` are immutable after capture; the version is
/// the basis for conflict detection. The payload is an opaque blob the sync
/// engine never inspects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    /// Store-assigned local identifier
    pub local_id: LocalId,
    /// Capture-time key passed to the server so redelivery can be deduplicated
    pub idempotency_key: Uuid,
    /// Target form definition
    pub form_id: String,
    /// Form version observed at capture time
    pub form_version: String,
    /// Serialized answers, opaque to the engine
    pub payload: Vec<u8>,
    /// Selects the remote submission endpoint and auth mode
    pub visibility: Visibility,
    /// Current lifecycle status
    pub status: SubmissionStatus,
    /// Last failure description, cleared on successful transitions
    pub error: Option<String>,
    /// Capture timestamp (Unix ms)
    pub created_at: i64,
}

/// Capture-time fields for a new submission; the store assigns the rest.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub form_id: String,
    pub form_version: String,
    pub payload: Vec<u8>,
    pub visibility: Visibility,
}

impl NewSubmission {
    #[must_use]
    pub fn new(
        form_id: impl Into<String>,
        form_version: impl Into<String>,
        payload: Vec<u8>,
        visibility: Visibility,
    ) -> Self {
        Self {
            form_id: form_id.into(),
            form_version: form_version.into(),
            payload,
            visibility,
        }
    }
}
