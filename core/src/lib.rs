/// Ripple - unseen-message and conversation-selection sync for direct messaging
///
/// Keeps per-peer unread counters consistent across bulk roster fetches,
/// live message notifications and conversation selection.

pub mod error;
pub mod config;
pub mod types;
pub mod roster_store;
pub mod selection;
pub mod reconciler;
pub mod presence;
pub mod collab;
pub mod retry;
pub mod roster_cache;
pub mod engine;
pub mod http;
pub mod cli_app;

pub use error::{Result, SyncError};
pub use config::Config;
pub use engine::{SyncEngine, SyncHandle};
pub use presence::{PresenceRow, PresenceSnapshot};
pub use types::{LiveEvent, LoadStatus, PeerId, SeenMark, Seq, SnapshotPeer, SyncNotice};
