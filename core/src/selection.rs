/// Active conversation tracking
use crate::error::{Result, SyncError};
use crate::reconciler::SeqClock;
use crate::roster_store::RosterStore;
use crate::types::{PeerId, SeenMark};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Which conversation is open
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    NoSelection,
    SelectedPeer(PeerId),
}

/// What a `select` call changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// The peer was already active
    Unchanged,
    Selected {
        previous: Option<PeerId>,
        /// The peer had unseen messages that were cleared
        cleared: bool,
        /// To be forwarded to the history collaborator
        seen: SeenMark,
    },
}

/// Holds the active peer. The peer id is always a key of the roster store;
/// no roster data is copied here.
#[derive(Debug, Clone, Default)]
pub struct SelectionController {
    state: Selection,
}

impl SelectionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &Selection {
        &self.state
    }

    pub fn active(&self) -> Option<&PeerId> {
        match &self.state {
            Selection::SelectedPeer(id) => Some(id),
            Selection::NoSelection => None,
        }
    }

    pub fn is_active(&self, peer_id: &PeerId) -> bool {
        self.active() == Some(peer_id)
    }

    /// Open the conversation with `peer_id`, clear its counter and produce
    /// the seen mark for everything received up to `now`.
    ///
    /// Re-selecting the active peer changes nothing.
    pub fn select(
        &mut self,
        peer_id: &PeerId,
        store: &mut RosterStore,
        clock: &mut SeqClock,
        now: DateTime<Utc>,
    ) -> Result<SelectOutcome> {
        if self.is_active(peer_id) {
            debug!("Peer {} already selected", peer_id);
            return Ok(SelectOutcome::Unchanged);
        }
        if !store.contains(peer_id) {
            return Err(SyncError::UnknownPeer(peer_id.to_string()));
        }

        let previous = self.active().cloned();
        self.state = Selection::SelectedPeer(peer_id.clone());
        let cleared = store.clear_unseen(peer_id, clock.next());

        Ok(SelectOutcome::Selected {
            previous,
            cleared,
            seen: SeenMark {
                peer_id: peer_id.clone(),
                through: now,
            },
        })
    }

    /// Close the active conversation. Counters are not touched.
    /// Returns the peer that was active.
    pub fn deselect(&mut self) -> Option<PeerId> {
        match std::mem::take(&mut self.state) {
            Selection::SelectedPeer(id) => Some(id),
            Selection::NoSelection => None,
        }
    }
}
