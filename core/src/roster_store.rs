/// Roster storage: known peers and their unseen-message counters
use crate::types::{Peer, PeerId, RosterSnapshot, Seq, SnapshotPeer};
use std::collections::HashMap;
use tracing::debug;

/// Roster row: a peer plus its counter and ordering metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub peer: Peer,
    pub unseen: u32,
    /// Sequence number of the newest mutation applied to this peer
    pub last_applied: Option<Seq>,
    /// Created from a live event, waiting for a snapshot to supply a name
    pub needs_backfill: bool,
}

impl RosterEntry {
    fn placeholder(id: PeerId) -> Self {
        Self {
            peer: Peer {
                id,
                display_name: None,
            },
            unseen: 0,
            last_applied: None,
            needs_backfill: true,
        }
    }

    fn from_snapshot(row: &SnapshotPeer, seq: Option<Seq>) -> Self {
        Self {
            peer: Peer {
                id: row.id.clone(),
                display_name: row.display_name.clone(),
            },
            unseen: row.unseen,
            last_applied: seq,
            needs_backfill: row.display_name.is_none(),
        }
    }

    fn is_older_than(&self, seq: Seq) -> bool {
        self.last_applied.map_or(true, |last| seq > last)
    }

    fn record(&mut self, seq: Seq) {
        if self.is_older_than(seq) {
            self.last_applied = Some(seq);
        }
    }
}

/// Outcome of merging one snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Peers seen for the first time
    pub inserted: Vec<PeerId>,
    /// Existing peers whose counter changed, with the new value
    pub changed: Vec<(PeerId, u32)>,
    /// Placeholder peers that received a display name
    pub backfilled: Vec<PeerId>,
    /// Rows ignored because newer mutations were already applied
    pub stale: usize,
}

/// Result of a live increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    pub unseen: u32,
    /// The peer was unknown and has been created as a placeholder
    pub created: bool,
}

/// Owner of the peer set and the unseen counters.
///
/// Peers are kept in first-observed order and never removed.
#[derive(Debug, Clone, Default)]
pub struct RosterStore {
    entries: HashMap<PeerId, RosterEntry>,
    order: Vec<PeerId>,
}

impl RosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a roster snapshot.
    ///
    /// Counters of known peers are only overwritten when the snapshot was issued
    /// after the last mutation applied to that peer. Snapshots without a
    /// sequence number can raise a counter but never lower it.
    pub fn upsert_peers(&mut self, snapshot: &RosterSnapshot) -> MergeReport {
        let mut report = MergeReport::default();

        for row in &snapshot.peers {
            let Some(entry) = self.entries.get_mut(&row.id) else {
                self.order.push(row.id.clone());
                self.entries
                    .insert(row.id.clone(), RosterEntry::from_snapshot(row, snapshot.seq));
                report.inserted.push(row.id.clone());
                continue;
            };

            if entry.needs_backfill {
                if let Some(name) = &row.display_name {
                    entry.peer.display_name = Some(name.clone());
                    entry.needs_backfill = false;
                    report.backfilled.push(row.id.clone());
                }
            }

            match snapshot.seq {
                Some(seq) if entry.is_older_than(seq) => {
                    if row.display_name.is_some() {
                        entry.peer.display_name = row.display_name.clone();
                    }
                    if entry.unseen != row.unseen {
                        entry.unseen = row.unseen;
                        report.changed.push((row.id.clone(), row.unseen));
                    }
                    entry.last_applied = Some(seq);
                }
                Some(seq) => {
                    debug!(
                        "Skipping stale roster row for {} ({} <= {:?})",
                        row.id, seq, entry.last_applied
                    );
                    report.stale += 1;
                }
                None => {
                    if row.unseen > entry.unseen {
                        entry.unseen = row.unseen;
                        report.changed.push((row.id.clone(), row.unseen));
                    }
                }
            }
        }

        report
    }

    /// Count one more unseen message from `peer_id`, creating a placeholder
    /// peer if it has never been observed.
    pub fn increment_unseen(&mut self, peer_id: &PeerId, seq: Seq) -> Increment {
        let created = !self.entries.contains_key(peer_id);
        if created {
            self.order.push(peer_id.clone());
        }
        let entry = self
            .entries
            .entry(peer_id.clone())
            .or_insert_with(|| RosterEntry::placeholder(peer_id.clone()));
        entry.unseen = entry.unseen.saturating_add(1);
        entry.record(seq);
        Increment {
            unseen: entry.unseen,
            created,
        }
    }

    /// Reset the counter to zero. Returns whether the counter was non-zero.
    /// Unknown peers are ignored.
    pub fn clear_unseen(&mut self, peer_id: &PeerId, seq: Seq) -> bool {
        match self.entries.get_mut(peer_id) {
            Some(entry) => {
                let had_unseen = entry.unseen > 0;
                entry.unseen = 0;
                entry.record(seq);
                had_unseen
            }
            None => false,
        }
    }

    /// Unseen count for a peer, `None` if the peer is unknown
    pub fn counter(&self, peer_id: &PeerId) -> Option<u32> {
        self.entries.get(peer_id).map(|e| e.unseen)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.entries.contains_key(peer_id)
    }

    pub fn entry(&self, peer_id: &PeerId) -> Option<&RosterEntry> {
        self.entries.get(peer_id)
    }

    /// All peers in first-observed order
    pub fn list_peers(&self) -> Vec<&RosterEntry> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .collect()
    }

    /// Placeholder peers still waiting for a display name
    pub fn pending_backfill(&self) -> Vec<PeerId> {
        self.list_peers()
            .into_iter()
            .filter(|e| e.needs_backfill)
            .map(|e| e.peer.id.clone())
            .collect()
    }

    /// Current roster as rows without ordering metadata
    pub fn to_rows(&self) -> Vec<SnapshotPeer> {
        self.list_peers()
            .into_iter()
            .map(|e| SnapshotPeer {
                id: e.peer.id.clone(),
                display_name: e.peer.display_name.clone(),
                unseen: e.unseen,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
