/// Read-only roster view handed to the presentation layer
use crate::roster_store::RosterStore;
use crate::selection::SelectionController;
use crate::types::{LoadStatus, PeerId};
use serde::Serialize;

/// One sidebar row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRow {
    pub peer_id: PeerId,
    pub display_name: Option<String>,
    pub unseen: u32,
    pub is_selected: bool,
}

impl PresenceRow {
    /// Name to show, falling back to the peer id for placeholders
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| self.peer_id.as_str())
    }

    /// Badge text, only when there is something unseen
    pub fn badge(&self) -> Option<String> {
        (self.unseen > 0).then(|| self.unseen.to_string())
    }
}

/// Immutable picture of roster, selection and load status after one applied command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshot {
    pub rows: Vec<PresenceRow>,
    pub active: Option<PeerId>,
    pub status: LoadStatus,
}

impl Default for PresenceSnapshot {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            active: None,
            status: LoadStatus::NotStarted,
        }
    }
}

impl PresenceSnapshot {
    pub fn capture(
        store: &RosterStore,
        selection: &SelectionController,
        status: &LoadStatus,
    ) -> Self {
        let rows = store
            .list_peers()
            .into_iter()
            .map(|entry| PresenceRow {
                peer_id: entry.peer.id.clone(),
                display_name: entry.peer.display_name.clone(),
                unseen: entry.unseen,
                is_selected: selection.is_active(&entry.peer.id),
            })
            .collect();

        Self {
            rows,
            active: selection.active().cloned(),
            status: status.clone(),
        }
    }

    pub fn row(&self, peer_id: &PeerId) -> Option<&PresenceRow> {
        self.rows.iter().find(|r| &r.peer_id == peer_id)
    }

    pub fn counter(&self, peer_id: &PeerId) -> Option<u32> {
        self.row(peer_id).map(|r| r.unseen)
    }

    pub fn total_unseen(&self) -> u64 {
        self.rows.iter().map(|r| u64::from(r.unseen)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::SeqClock;
    use crate::types::{RosterSnapshot, Seq, SnapshotPeer};
    use chrono::Utc;

    #[test]
    fn test_capture_marks_selection_and_badges() {
        let mut clock = SeqClock::new();
        let mut store = RosterStore::new();
        let mut selection = SelectionController::new();
        store.upsert_peers(&RosterSnapshot::sequenced(
            clock.next(),
            vec![
                SnapshotPeer::new("a", "Alice", 0),
                SnapshotPeer::new("b", "Bob", 3),
            ],
        ));
        store.increment_unseen(&PeerId::from("z"), Seq(50));
        selection
            .select(&PeerId::from("a"), &mut store, &mut clock, Utc::now())
            .unwrap();

        let view = PresenceSnapshot::capture(&store, &selection, &LoadStatus::Loaded);

        assert_eq!(view.active, Some(PeerId::from("a")));
        let alice = view.row(&PeerId::from("a")).unwrap();
        assert!(alice.is_selected);
        assert_eq!(alice.badge(), None);

        let bob = view.row(&PeerId::from("b")).unwrap();
        assert_eq!(bob.badge().as_deref(), Some("3"));
        assert_eq!(bob.label(), "Bob");

        let placeholder = view.row(&PeerId::from("z")).unwrap();
        assert_eq!(placeholder.label(), "z");
        assert_eq!(view.total_unseen(), 4);
    }
}
