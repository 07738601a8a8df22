/// Shared types for the roster sync layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a conversation partner
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordering token for roster mutations.
///
/// Issued when a fetch is initiated, when a live event is received and when
/// a counter is cleared. Later mutations always carry a larger value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(pub u64);

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A known conversation partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    /// `None` until a snapshot names a peer first seen through a live event
    pub display_name: Option<String>,
}

/// One roster row as reported by a fetch or by the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPeer {
    pub id: PeerId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub unseen: u32,
}

impl SnapshotPeer {
    pub fn new(id: impl Into<PeerId>, display_name: impl Into<String>, unseen: u32) -> Self {
        Self {
            id: id.into(),
            display_name: Some(display_name.into()),
            unseen,
        }
    }
}

/// Roster as seen by one fetch, in fetch order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterSnapshot {
    /// Sequence number assigned when the fetch was initiated.
    /// `None` for sources without ordering metadata (e.g. the on-disk cache).
    pub seq: Option<Seq>,
    pub peers: Vec<SnapshotPeer>,
}

impl RosterSnapshot {
    pub fn sequenced(seq: Seq, peers: Vec<SnapshotPeer>) -> Self {
        Self {
            seq: Some(seq),
            peers,
        }
    }

    pub fn unsequenced(peers: Vec<SnapshotPeer>) -> Self {
        Self { seq: None, peers }
    }
}

/// Inbound message notification from the live event source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub peer_id: PeerId,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Request for the history collaborator: messages from `peer_id` up to
/// `through` are seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenMark {
    pub peer_id: PeerId,
    pub through: DateTime<Utc>,
}

/// Roster load state, owned by the fetch-issuing path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LoadStatus {
    NotStarted,
    Loading,
    Loaded,
    Failed(String),
}

impl LoadStatus {
    pub fn label(&self) -> &str {
        match self {
            LoadStatus::NotStarted => "Not loaded",
            LoadStatus::Loading => "Loading...",
            LoadStatus::Loaded => "Loaded",
            LoadStatus::Failed(_) => "Failed",
        }
    }
}

/// Change notifications published by the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncNotice {
    /// A peer's unseen counter changed
    UnseenChanged { peer_id: PeerId, unseen: u32 },
    /// A peer was observed for the first time
    PeerAdded { peer_id: PeerId },
    /// The active conversation changed
    SelectionChanged { peer_id: Option<PeerId> },
    /// Roster load status changed
    LoadStatusChanged { status: LoadStatus },
    /// A roster fetch failed; the roster was left untouched
    RosterLoadFailed { reason: String },
}
