//! Sync engine, connectivity observation, and conflict resolution.

mod connectivity;
mod engine;
mod resolver;
mod status;

pub use connectivity::{
    ConnectivityObserver, ConnectivityProbe, HttpConnectivityProbe, ObserverEvent, ObserverHandle,
};
pub use engine::{SyncEngine, SyncOptions, SyncReport, LAST_SYNCED_AT_KEY};
pub use resolver::ConflictResolver;
pub use status::SyncStatus;
