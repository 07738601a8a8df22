/// Collaborator contracts consumed by the sync engine
///
/// The engine never talks to the network directly: roster fetches, live
/// message notifications and "seen" acknowledgements all go through these
/// traits. `http::HttpCollaborator` implements all three.
use crate::error::Result;
use crate::types::{LiveEvent, SeenMark, SnapshotPeer};
use futures_util::stream::BoxStream;
use std::future::Future;

/// Stream of live message notifications. Ends when the subscription drops.
pub type LiveEventStream = BoxStream<'static, Result<LiveEvent>>;

/// Source of roster snapshots (HTTP GET semantics)
pub trait RosterSource: Send + Sync + 'static {
    /// Fetch the full roster with server-computed unseen counts, in display order
    fn fetch_roster(&self) -> impl Future<Output = Result<Vec<SnapshotPeer>>> + Send;
}

/// Source of real-time inbound message notifications
pub trait LiveEventSource: Send + Sync + 'static {
    /// Establish a subscription
    fn subscribe(&self) -> impl Future<Output = Result<LiveEventStream>> + Send;
}

/// Consumer of "seen" marks; owns message history
pub trait HistorySink: Send + Sync + 'static {
    fn mark_seen(&self, mark: SeenMark) -> impl Future<Output = Result<()>> + Send;
}
