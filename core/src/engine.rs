/// Sync engine: the single writer over roster, selection and reconciliation state
///
/// Every mutation is a `Command` read from one mpsc queue by one task.
/// Network work (fetches, live subscription, seen marks) runs in separate
/// tasks that only ever send commands back, so store updates never race.
use crate::collab::{HistorySink, LiveEventSource, RosterSource};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::presence::{PresenceRow, PresenceSnapshot};
use crate::reconciler::{EventReconciler, FetchOutcome, FetchTicket, LiveOutcome};
use crate::retry::RetryPolicy;
use crate::roster_cache::RosterCache;
use crate::roster_store::{MergeReport, RosterStore};
use crate::selection::{SelectOutcome, SelectionController};
use crate::types::{LiveEvent, LoadStatus, PeerId, SeenMark, SnapshotPeer, SyncNotice};
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

const NOTICE_CAPACITY: usize = 256;

enum Command {
    Refresh,
    Retry {
        attempt: u32,
    },
    FetchCompleted {
        ticket: FetchTicket,
        attempt: u32,
        result: Result<Vec<SnapshotPeer>>,
    },
    Live(LiveEvent),
    Select {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<SelectOutcome>>,
    },
    Deselect {
        reply: oneshot::Sender<Option<PeerId>>,
    },
    Shutdown,
}

/// Owner of all roster state. Constructed and driven by `SyncEngine::spawn`.
pub struct SyncEngine<S, E, H> {
    session_id: Uuid,
    config: Config,
    store: RosterStore,
    selection: SelectionController,
    reconciler: EventReconciler,
    retry: RetryPolicy,
    cache: Option<RosterCache>,
    source: Arc<S>,
    events: Arc<E>,
    history: Arc<H>,
    commands: mpsc::WeakSender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    view_tx: watch::Sender<PresenceSnapshot>,
    notices_tx: broadcast::Sender<SyncNotice>,
}

impl<S, E, H> SyncEngine<S, E, H>
where
    S: RosterSource,
    E: LiveEventSource,
    H: HistorySink,
{
    /// Start the engine on the current tokio runtime.
    ///
    /// The cached roster (if any) is applied first, then the initial fetch is
    /// issued, then the live subscription is started.
    pub fn spawn(config: Config, source: S, events: E, history: H) -> Result<SyncHandle> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(config.queue_capacity);
        let (view_tx, view_rx) = watch::channel(PresenceSnapshot::default());
        let (notices_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        let mut engine = Self {
            session_id: Uuid::new_v4(),
            retry: RetryPolicy::from_config(&config),
            cache: config.data_dir.as_deref().map(RosterCache::new),
            config,
            store: RosterStore::new(),
            selection: SelectionController::new(),
            reconciler: EventReconciler::new(),
            source: Arc::new(source),
            events: Arc::new(events),
            history: Arc::new(history),
            commands: commands_tx.downgrade(),
            commands_rx,
            view_tx,
            notices_tx: notices_tx.clone(),
        };

        info!("Starting sync engine {}", engine.session_id);
        engine.seed_from_cache();
        engine.start_fetch(0);
        engine.publish();

        let pump = tokio::spawn(pump_live_events(
            Arc::clone(&engine.events),
            commands_tx.downgrade(),
            engine.retry,
        ));
        tokio::spawn(engine.run(pump));

        Ok(SyncHandle {
            commands: commands_tx,
            view: view_rx,
            notices: notices_tx,
        })
    }

    async fn run(mut self, pump: JoinHandle<()>) {
        info!(
            "Sync engine {} running against {}",
            self.session_id, self.config.server_addr
        );

        while let Some(command) = self.commands_rx.recv().await {
            if !self.apply(command) {
                break;
            }
            self.publish();
        }

        pump.abort();
        info!("Sync engine {} stopped", self.session_id);
    }

    /// Apply one command. Returns `false` when the engine should stop.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Refresh => self.start_fetch(0),
            Command::Retry { attempt } => {
                // Another fetch may have succeeded while we were waiting
                if matches!(self.reconciler.status(), LoadStatus::Failed(_)) {
                    self.start_fetch(attempt);
                } else {
                    debug!("Dropping retry {}: roster no longer failed", attempt);
                }
            }
            Command::FetchCompleted {
                ticket,
                attempt,
                result,
            } => self.on_fetch_completed(ticket, attempt, result),
            Command::Live(event) => self.on_live_event(event),
            Command::Select { peer_id, reply } => {
                let result = self.on_select(&peer_id);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Deselect { reply } => {
                let previous = self.selection.deselect();
                if previous.is_some() {
                    self.notify(SyncNotice::SelectionChanged { peer_id: None });
                }
                self.publish();
                let _ = reply.send(previous);
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn seed_from_cache(&mut self) {
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.load() {
            Ok(rows) if rows.is_empty() => {}
            Ok(rows) => {
                let report = self.reconciler.apply_unsequenced(rows, &mut self.store);
                info!("Seeded {} peers from roster cache", report.inserted.len());
            }
            Err(e) => warn!("Ignoring roster cache at {:?}: {}", cache.path(), e),
        }
    }

    fn save_cache(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save(&self.store.to_rows()) {
                warn!("Failed to write roster cache: {}", e);
            }
        }
    }

    fn start_fetch(&mut self, attempt: u32) {
        let before = self.reconciler.status().clone();
        let ticket = self.reconciler.begin_fetch();
        self.notify_status(&before);
        debug!("Fetching roster ({} attempt {})", ticket.seq(), attempt + 1);

        let source = Arc::clone(&self.source);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = source.fetch_roster().await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx
                    .send(Command::FetchCompleted {
                        ticket,
                        attempt,
                        result,
                    })
                    .await;
            }
        });
    }

    fn on_fetch_completed(
        &mut self,
        ticket: FetchTicket,
        attempt: u32,
        result: Result<Vec<SnapshotPeer>>,
    ) {
        let before = self.reconciler.status().clone();
        let transient = result.as_ref().err().is_some_and(|e| e.is_transient());

        match self.reconciler.complete_fetch(
            ticket,
            result,
            &self.selection,
            &mut self.store,
            Utc::now(),
        ) {
            FetchOutcome::Merged {
                report,
                superseded,
                reseen,
            } => {
                self.notify_merge(&report);
                if let Some(mark) = reseen {
                    self.dispatch_seen(mark);
                }
                if superseded {
                    debug!("Fetch {} was superseded by a newer roster", ticket.seq());
                } else {
                    self.save_cache();
                }
            }
            FetchOutcome::Failed { reason } => {
                self.notify(SyncNotice::RosterLoadFailed { reason });
                let failed = matches!(self.reconciler.status(), LoadStatus::Failed(_));
                if transient && failed && self.retry.allows_retry_after(attempt) {
                    self.schedule_retry(attempt + 1);
                }
            }
        }

        self.notify_status(&before);
    }

    fn schedule_retry(&self, attempt: u32) {
        let delay = self.retry.delay_for_attempt(attempt - 1, None);
        info!("Retrying roster fetch in {:?} (attempt {})", delay, attempt + 1);

        let commands = self.commands.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Retry { attempt }).await;
            }
        });
    }

    fn on_live_event(&mut self, event: LiveEvent) {
        match self
            .reconciler
            .on_live_event(&event, &self.selection, &mut self.store)
        {
            LiveOutcome::Counted { increment, .. } => {
                if increment.created {
                    self.notify(SyncNotice::PeerAdded {
                        peer_id: event.peer_id.clone(),
                    });
                    if self.config.backfill_unknown_peers && !self.reconciler.fetch_in_flight() {
                        self.start_fetch(0);
                    }
                }
                self.notify(SyncNotice::UnseenChanged {
                    peer_id: event.peer_id,
                    unseen: increment.unseen,
                });
            }
            LiveOutcome::Seen(mark) => self.dispatch_seen(mark),
        }
    }

    fn on_select(&mut self, peer_id: &PeerId) -> Result<SelectOutcome> {
        let outcome = self.selection.select(
            peer_id,
            &mut self.store,
            self.reconciler.clock_mut(),
            Utc::now(),
        )?;

        if let SelectOutcome::Selected { cleared, seen, .. } = &outcome {
            info!("Conversation with {} opened", peer_id);
            self.notify(SyncNotice::SelectionChanged {
                peer_id: Some(peer_id.clone()),
            });
            if *cleared {
                self.notify(SyncNotice::UnseenChanged {
                    peer_id: peer_id.clone(),
                    unseen: 0,
                });
            }
            self.dispatch_seen(seen.clone());
        }
        Ok(outcome)
    }

    /// Forward a seen mark to the history collaborator. The local counter is
    /// already cleared; failures are logged and not reverted.
    fn dispatch_seen(&self, mark: SeenMark) {
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            let peer_id = mark.peer_id.clone();
            match history.mark_seen(mark).await {
                Ok(()) => debug!("History acknowledged seen mark for {}", peer_id),
                Err(e) => warn!("Failed to mark messages from {} as seen: {}", peer_id, e),
            }
        });
    }

    fn notify_merge(&self, report: &MergeReport) {
        for peer_id in &report.inserted {
            self.notify(SyncNotice::PeerAdded {
                peer_id: peer_id.clone(),
            });
        }
        for (peer_id, unseen) in &report.changed {
            self.notify(SyncNotice::UnseenChanged {
                peer_id: peer_id.clone(),
                unseen: *unseen,
            });
        }
    }

    fn notify_status(&self, before: &LoadStatus) {
        let status = self.reconciler.status();
        if status != before {
            self.notify(SyncNotice::LoadStatusChanged {
                status: status.clone(),
            });
        }
    }

    fn notify(&self, notice: SyncNotice) {
        // No subscribers is fine
        let _ = self.notices_tx.send(notice);
    }

    fn publish(&self) {
        let next =
            PresenceSnapshot::capture(&self.store, &self.selection, self.reconciler.status());
        self.view_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Forward live events into the command queue in receipt order, re-subscribing
/// with backoff when the stream ends. A subscription established after a
/// failed attempt or a dropped stream triggers a roster refresh to pick up
/// messages delivered while disconnected.
async fn pump_live_events<E: LiveEventSource>(
    events: Arc<E>,
    commands: mpsc::WeakSender<Command>,
    retry: RetryPolicy,
) {
    let mut attempt: u32 = 0;
    let mut missed_events = false;

    loop {
        match events.subscribe().await {
            Ok(mut stream) => {
                info!("Live event subscription established");
                attempt = 0;
                if missed_events {
                    let Some(tx) = commands.upgrade() else {
                        return;
                    };
                    if tx.send(Command::Refresh).await.is_err() {
                        return;
                    }
                }

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            let Some(tx) = commands.upgrade() else {
                                return;
                            };
                            if tx.send(Command::Live(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Live event stream error: {}", e);
                            break;
                        }
                    }
                }
                info!("Live event stream ended");
            }
            Err(e) => warn!("Live event subscription failed: {}", e),
        }
        missed_events = true;

        if commands.upgrade().is_none() {
            return;
        }
        sleep(retry.delay_for_attempt(attempt, None)).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Cloneable front door to a running engine.
///
/// Reads come from the last published `PresenceSnapshot`; the only writes
/// are selection changes and refresh requests.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<PresenceSnapshot>,
    notices: broadcast::Sender<SyncNotice>,
}

impl SyncHandle {
    /// Open the conversation with `peer_id` and clear its unseen counter
    pub async fn select(&self, peer_id: impl Into<PeerId>) -> Result<SelectOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Select {
            peer_id: peer_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::EngineClosed)?
    }

    /// Close the active conversation, returning the peer that was open
    pub async fn deselect(&self) -> Result<Option<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Deselect { reply }).await?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    /// Issue a new roster fetch
    pub async fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh).await
    }

    /// Stop the engine and its live subscription
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.view.borrow().clone()
    }

    pub fn list_peers(&self) -> Vec<PresenceRow> {
        self.view.borrow().rows.clone()
    }

    pub fn counter(&self, peer_id: &PeerId) -> Option<u32> {
        self.view.borrow().counter(peer_id)
    }

    pub fn active_peer(&self) -> Option<PeerId> {
        self.view.borrow().active.clone()
    }

    pub fn load_status(&self) -> LoadStatus {
        self.view.borrow().status.clone()
    }

    /// Receiver notified after every command that changed the view
    pub fn watch(&self) -> watch::Receiver<PresenceSnapshot> {
        self.view.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineClosed)
    }
}
