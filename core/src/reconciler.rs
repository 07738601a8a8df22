/// Event reconciliation: folds roster fetches and live message events into the roster store
use crate::roster_store::{Increment, MergeReport, RosterStore};
use crate::selection::SelectionController;
use crate::types::{LiveEvent, LoadStatus, RosterSnapshot, SeenMark, Seq, SnapshotPeer};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Monotonic source of sequence numbers. The first issued value is `Seq(1)`.
#[derive(Debug, Clone, Default)]
pub struct SeqClock {
    last: u64,
}

impl SeqClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next sequence number
    pub fn next(&mut self) -> Seq {
        self.last += 1;
        Seq(self.last)
    }

    /// Last issued sequence number (`Seq(0)` before the first issue)
    pub fn peek(&self) -> Seq {
        Seq(self.last)
    }
}

/// Handle for one roster fetch, stamped when the request is initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    seq: Seq,
}

impl FetchTicket {
    pub fn seq(&self) -> Seq {
        self.seq
    }
}

/// How a live event was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveOutcome {
    /// Counted as unseen
    Counted { seq: Seq, increment: Increment },
    /// The conversation is open; the message is seen immediately
    Seen(SeenMark),
}

/// How a fetch completion was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Merged {
        report: MergeReport,
        /// A fetch issued later had already been applied
        superseded: bool,
        /// The snapshot reported unseen messages for the open conversation;
        /// they were cleared again and must be marked seen
        reseen: Option<SeenMark>,
    },
    Failed {
        reason: String,
    },
}

/// Sole entry point translating external inputs into roster mutations.
///
/// Keeps no roster data itself, only the sequence clock and the bookkeeping
/// of fetches in flight.
#[derive(Debug, Clone)]
pub struct EventReconciler {
    clock: SeqClock,
    status: LoadStatus,
    in_flight: BTreeSet<Seq>,
    newest_loaded: Option<Seq>,
}

impl Default for EventReconciler {
    fn default() -> Self {
        Self {
            clock: SeqClock::new(),
            status: LoadStatus::NotStarted,
            in_flight: BTreeSet::new(),
            newest_loaded: None,
        }
    }
}

impl EventReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock_mut(&mut self) -> &mut SeqClock {
        &mut self.clock
    }

    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    pub fn fetch_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Stamp a new fetch. Must be called before the request is sent.
    pub fn begin_fetch(&mut self) -> FetchTicket {
        let seq = self.clock.next();
        self.in_flight.insert(seq);
        self.status = LoadStatus::Loading;
        debug!("Roster fetch {} initiated", seq);
        FetchTicket { seq }
    }

    /// Apply the result of a fetch started with `begin_fetch`.
    ///
    /// Failures leave the store untouched. Stale successes are still merged;
    /// the per-peer tie-break in the store makes them inert. The open
    /// conversation never keeps a counter: whatever the snapshot says for it
    /// is cleared and reported as seen through `now`.
    pub fn complete_fetch(
        &mut self,
        ticket: FetchTicket,
        result: crate::Result<Vec<SnapshotPeer>>,
        selection: &SelectionController,
        store: &mut RosterStore,
        now: DateTime<Utc>,
    ) -> FetchOutcome {
        self.in_flight.remove(&ticket.seq);
        let superseded = self.newest_loaded.is_some_and(|newest| newest > ticket.seq);

        match result {
            Ok(rows) => {
                let mut report = store.upsert_peers(&RosterSnapshot::sequenced(ticket.seq, rows));
                let reseen = self.reclear_active(selection, store, &mut report, now);
                if !superseded {
                    self.newest_loaded = Some(ticket.seq);
                }
                self.status = LoadStatus::Loaded;
                info!(
                    "Roster fetch {} merged: {} new, {} changed, {} stale",
                    ticket.seq,
                    report.inserted.len(),
                    report.changed.len(),
                    report.stale
                );
                FetchOutcome::Merged {
                    report,
                    superseded,
                    reseen,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Roster fetch {} failed: {}", ticket.seq, reason);
                let newer_pending = self.in_flight.iter().any(|s| *s > ticket.seq);
                if !superseded {
                    self.status = if newer_pending {
                        LoadStatus::Loading
                    } else {
                        LoadStatus::Failed(reason.clone())
                    };
                }
                FetchOutcome::Failed { reason }
            }
        }
    }

    fn reclear_active(
        &mut self,
        selection: &SelectionController,
        store: &mut RosterStore,
        report: &mut MergeReport,
        now: DateTime<Utc>,
    ) -> Option<SeenMark> {
        let active = selection.active()?;
        if store.counter(active).unwrap_or(0) == 0 {
            return None;
        }

        let seq = self.clock.next();
        store.clear_unseen(active, seq);
        report.changed.retain(|(peer_id, _)| peer_id != active);
        debug!("Snapshot counted unseen messages for open conversation {}, cleared at {}", active, seq);
        Some(SeenMark {
            peer_id: active.clone(),
            through: now,
        })
    }

    /// Merge rows from a source without ordering metadata (the roster cache).
    pub fn apply_unsequenced(
        &mut self,
        rows: Vec<SnapshotPeer>,
        store: &mut RosterStore,
    ) -> MergeReport {
        store.upsert_peers(&RosterSnapshot::unsequenced(rows))
    }

    /// Apply one live message notification, in receipt order.
    pub fn on_live_event(
        &mut self,
        event: &LiveEvent,
        selection: &SelectionController,
        store: &mut RosterStore,
    ) -> LiveOutcome {
        if selection.is_active(&event.peer_id) {
            debug!(
                "Message {} from active peer {} marked seen",
                event.message_id, event.peer_id
            );
            return LiveOutcome::Seen(SeenMark {
                peer_id: event.peer_id.clone(),
                through: event.timestamp,
            });
        }

        let seq = self.clock.next();
        let increment = store.increment_unseen(&event.peer_id, seq);
        if increment.created {
            info!("Unknown peer {} observed, awaiting backfill", event.peer_id);
        }
        debug!(
            "Message {} from {} counted at {} (unseen={})",
            event.message_id, event.peer_id, seq, increment.unseen
        );
        LiveOutcome::Counted { seq, increment }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::types::PeerId;

    fn live(peer: &str, message_id: &str) -> LiveEvent {
        LiveEvent {
            peer_id: PeerId::from(peer),
            message_id: message_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Complete a fetch with no conversation open
    fn complete(
        reconciler: &mut EventReconciler,
        ticket: FetchTicket,
        result: crate::Result<Vec<SnapshotPeer>>,
        store: &mut RosterStore,
    ) -> FetchOutcome {
        reconciler.complete_fetch(ticket, result, &SelectionController::new(), store, Utc::now())
    }

    #[test]
    fn test_seq_clock_is_monotonic() {
        let mut clock = SeqClock::new();
        assert_eq!(clock.peek(), Seq(0));
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
        assert_eq!(a, Seq(1));
        assert_eq!(clock.peek(), b);
    }

    #[test]
    fn test_status_transitions() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        assert_eq!(reconciler.status(), &LoadStatus::NotStarted);

        let ticket = reconciler.begin_fetch();
        assert_eq!(reconciler.status(), &LoadStatus::Loading);
        assert!(reconciler.fetch_in_flight());

        complete(&mut reconciler, ticket, Ok(vec![SnapshotPeer::new("a", "Alice", 0)]), &mut store);
        assert_eq!(reconciler.status(), &LoadStatus::Loaded);
        assert!(!reconciler.fetch_in_flight());
    }

    #[test]
    fn test_failed_fetch_leaves_store_untouched() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        store.increment_unseen(&PeerId::from("a"), reconciler.clock_mut().next());

        let ticket = reconciler.begin_fetch();
        let outcome = complete(
            &mut reconciler,
            ticket,
            Err(SyncError::Transport("connection refused".to_string())),
            &mut store,
        );

        assert!(matches!(outcome, FetchOutcome::Failed { .. }));
        assert!(matches!(reconciler.status(), LoadStatus::Failed(_)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.counter(&PeerId::from("a")), Some(1));
    }

    #[test]
    fn test_failure_of_older_fetch_does_not_mask_newer_load() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        let first = reconciler.begin_fetch();
        let second = reconciler.begin_fetch();

        complete(&mut reconciler, second, Ok(vec![]), &mut store);
        let outcome = complete(
            &mut reconciler,
            first,
            Err(SyncError::Transport("timed out".to_string())),
            &mut store,
        );

        assert!(matches!(outcome, FetchOutcome::Failed { .. }));
        assert_eq!(reconciler.status(), &LoadStatus::Loaded);
    }

    #[test]
    fn test_failure_while_newer_fetch_pending_stays_loading() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        let first = reconciler.begin_fetch();
        let _second = reconciler.begin_fetch();

        complete(
            &mut reconciler,
            first,
            Err(SyncError::Transport("reset".to_string())),
            &mut store,
        );
        assert_eq!(reconciler.status(), &LoadStatus::Loading);
    }

    #[test]
    fn test_out_of_order_fetch_responses() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        let older = reconciler.begin_fetch();
        let newer = reconciler.begin_fetch();

        complete(&mut reconciler, newer, Ok(vec![SnapshotPeer::new("a", "Alice", 2)]), &mut store);
        let outcome =
            complete(&mut reconciler, older, Ok(vec![SnapshotPeer::new("a", "Alice", 7)]), &mut store);

        match outcome {
            FetchOutcome::Merged {
                report, superseded, ..
            } => {
                assert!(superseded);
                assert_eq!(report.stale, 1);
            }
            FetchOutcome::Failed { .. } => panic!("stale fetch should merge inertly"),
        }
        assert_eq!(store.counter(&PeerId::from("a")), Some(2));
    }

    #[test]
    fn test_refresh_keeps_open_conversation_cleared() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        let mut selection = SelectionController::new();
        let first = reconciler.begin_fetch();
        complete(&mut reconciler, first, Ok(vec![SnapshotPeer::new("a", "Alice", 2)]), &mut store);
        selection
            .select(&PeerId::from("a"), &mut store, reconciler.clock_mut(), Utc::now())
            .unwrap();

        // Issued after the clear, answered before the server saw the seen mark
        let refresh = reconciler.begin_fetch();
        let now = Utc::now();
        let outcome = reconciler.complete_fetch(
            refresh,
            Ok(vec![
                SnapshotPeer::new("a", "Alice", 2),
                SnapshotPeer::new("b", "Bob", 1),
            ]),
            &selection,
            &mut store,
            now,
        );

        assert_eq!(store.counter(&PeerId::from("a")), Some(0));
        assert_eq!(store.counter(&PeerId::from("b")), Some(1));
        match outcome {
            FetchOutcome::Merged { report, reseen, .. } => {
                assert_eq!(
                    reseen,
                    Some(SeenMark {
                        peer_id: PeerId::from("a"),
                        through: now,
                    })
                );
                assert!(report.changed.iter().all(|(id, _)| id != &PeerId::from("a")));
            }
            FetchOutcome::Failed { .. } => panic!("fetch succeeded"),
        }
    }

    #[test]
    fn test_refresh_with_open_conversation_already_seen() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        let mut selection = SelectionController::new();
        let first = reconciler.begin_fetch();
        complete(&mut reconciler, first, Ok(vec![SnapshotPeer::new("a", "Alice", 2)]), &mut store);
        selection
            .select(&PeerId::from("a"), &mut store, reconciler.clock_mut(), Utc::now())
            .unwrap();

        let refresh = reconciler.begin_fetch();
        let outcome = reconciler.complete_fetch(
            refresh,
            Ok(vec![SnapshotPeer::new("a", "Alice", 0)]),
            &selection,
            &mut store,
            Utc::now(),
        );

        assert!(matches!(outcome, FetchOutcome::Merged { reseen: None, .. }));
        assert_eq!(store.counter(&PeerId::from("a")), Some(0));
    }

    #[test]
    fn test_live_event_for_active_peer_is_seen() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        let mut selection = SelectionController::new();
        let ticket = reconciler.begin_fetch();
        complete(&mut reconciler, ticket, Ok(vec![SnapshotPeer::new("a", "Alice", 1)]), &mut store);
        selection
            .select(&PeerId::from("a"), &mut store, reconciler.clock_mut(), Utc::now())
            .unwrap();

        let event = live("a", "m-1");
        let outcome = reconciler.on_live_event(&event, &selection, &mut store);

        assert_eq!(
            outcome,
            LiveOutcome::Seen(SeenMark {
                peer_id: PeerId::from("a"),
                through: event.timestamp,
            })
        );
        assert_eq!(store.counter(&PeerId::from("a")), Some(0));
    }

    #[test]
    fn test_live_event_for_unknown_peer_creates_placeholder() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        let selection = SelectionController::new();

        let outcome = reconciler.on_live_event(&live("z", "m-9"), &selection, &mut store);

        match outcome {
            LiveOutcome::Counted { increment, .. } => {
                assert!(increment.created);
                assert_eq!(increment.unseen, 1);
            }
            LiveOutcome::Seen(_) => panic!("no conversation is open"),
        }
        assert_eq!(store.entry(&PeerId::from("z")).unwrap().peer.display_name, None);
    }

    #[test]
    fn test_unsequenced_rows_never_lower_counts() {
        let mut reconciler = EventReconciler::new();
        let mut store = RosterStore::new();
        let selection = SelectionController::new();
        reconciler.on_live_event(&live("a", "m-1"), &selection, &mut store);
        reconciler.on_live_event(&live("a", "m-2"), &selection, &mut store);

        reconciler.apply_unsequenced(vec![SnapshotPeer::new("a", "Alice", 0)], &mut store);
        assert_eq!(store.counter(&PeerId::from("a")), Some(2));
    }
}
