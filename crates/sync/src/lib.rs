pub mod backoff;
pub use backoff::GeometricBackoff;

pub mod scoring;
pub use scoring::{ErrorScoreService, ErrorScorer};

pub mod tracker;
pub use tracker::{SyncStateTracker, TrackerHandle, TrackerMsg};

pub mod peer;
pub use peer::PeerConnection;

pub mod manager;
pub use manager::{ConnectionEvent, ConnectionManager};
