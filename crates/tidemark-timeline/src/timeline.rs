//! Timeline façade and pagination state machine.
//!
//! One dedicated task per timeline instance serializes every chunk-tree
//! mutation, persistence merge, and pagination-state transition. The
//! presentation layer talks to the task through a command channel and
//! receives immutable snapshots on a bounded signal channel; no shared
//! mutable object crosses that boundary.
//!
//! Pagination state is a per-direction `Idle(has_more)` / `Paginating`
//! machine: `paginate` refuses when not started, already paginating, or
//! exhausted; a completed load stores `has_more = (outcome != ReachedEnd)`
//! and always schedules a snapshot publish.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use tidemark_core::{PagePersistor, SendState, StoreChange, StoredEvent, TimelineStore};
use tidemark_proto::{Direction, RoomEventFilter};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::{
    api::PaginationApi,
    chunk_tree::{ChunkContext, LoadMoreOutcome},
    decrypt::{DecryptionQueue, EventDecryptor, SessionKeyBank},
    echo::UiEchoReconciler,
    error::TimelineError,
    item::TimelineItem,
    strategy::{LoadStrategy, TimelineMode},
};

/// Coalescing window for snapshot publication.
const SNAPSHOT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Capacity of the signal channel to the presentation layer.
const SIGNAL_CHANNEL_CAPACITY: usize = 32;

/// Source of unique timeline ids.
static TIMELINE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Per-direction pagination state. Replaced whole, never field-mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationState {
    /// Whether more history may exist in this direction.
    pub has_more_to_load: bool,
    /// Whether a load is currently running in this direction.
    pub is_paginating: bool,
    /// Count requested by the running load, zero when idle.
    pub requested_count: u32,
}

impl Default for PaginationState {
    fn default() -> Self {
        Self { has_more_to_load: true, is_paginating: false, requested_count: 0 }
    }
}

/// Signals delivered to the presentation layer.
#[derive(Debug, Clone)]
pub enum TimelineSignal {
    /// A fresh immutable snapshot of the timeline window.
    Updated(Vec<TimelineItem>),
    /// Ids of events that just arrived at the live edge.
    NewEvents(Vec<String>),
    /// A failure that changes what the user should see.
    Failure(TimelineError),
}

/// Construction-time timeline configuration.
#[derive(Debug, Clone)]
pub struct TimelineSettings {
    /// Events loaded backward when the timeline opens.
    pub initial_size: usize,
    /// Overlay current room-member profiles onto snapshot items.
    pub use_live_sender_info: bool,
    /// Predicate deciding which events snapshots expose.
    pub filters: RoomEventFilter,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self { initial_size: 30, use_live_sender_info: false, filters: RoomEventFilter::default() }
    }
}

/// The forward/backward pagination-state pair.
///
/// The only state mutated from multiple call sites; every mutation is a
/// whole-value replace under the mutex, so readers always observe a
/// consistent state.
#[derive(Debug, Default)]
struct StatePair {
    forward: Mutex<PaginationState>,
    backward: Mutex<PaginationState>,
}

impl StatePair {
    fn slot(&self, direction: Direction) -> &Mutex<PaginationState> {
        match direction {
            Direction::Forwards => &self.forward,
            Direction::Backwards => &self.backward,
        }
    }

    #[allow(clippy::expect_used)]
    fn get(&self, direction: Direction) -> PaginationState {
        *self.slot(direction).lock().expect("pagination state poisoned")
    }

    #[allow(clippy::expect_used)]
    fn update(
        &self,
        direction: Direction,
        f: impl FnOnce(PaginationState) -> PaginationState,
    ) -> PaginationState {
        let mut slot = self.slot(direction).lock().expect("pagination state poisoned");
        let next = f(*slot);
        *slot = next;
        next
    }

    fn reset(&self, forward_has_more: bool) {
        self.update(Direction::Forwards, |_| PaginationState {
            has_more_to_load: forward_has_more,
            ..PaginationState::default()
        });
        self.update(Direction::Backwards, |_| PaginationState::default());
    }
}

enum Command {
    Start,
    Paginate { direction: Direction, count: usize },
    RestartWith { event_id: Option<String> },
    LocalEcho { event: StoredEvent },
    SendStateUpdate { event_id: String, state: SendState },
    Dispose,
}

/// Handle to one timeline instance.
///
/// Created with [`Timeline::new`] (requires a tokio runtime); all work
/// happens on the timeline's own task. Dropping the handle without
/// [`Timeline::dispose`] leaves the task running until its channels close.
pub struct Timeline<S: TimelineStore> {
    timeline_id: String,
    commands: mpsc::UnboundedSender<Command>,
    disposed: watch::Sender<bool>,
    states: Arc<StatePair>,
    latest_snapshot: Arc<Mutex<Vec<TimelineItem>>>,
    _store: std::marker::PhantomData<S>,
}

impl<S: TimelineStore> Timeline<S> {
    /// Create a timeline and the signal channel its snapshots arrive on.
    pub fn new(
        store: S,
        paginator: Arc<dyn PaginationApi>,
        decryptor: Arc<dyn EventDecryptor>,
        key_bank: Arc<dyn SessionKeyBank>,
        room_id: impl Into<String>,
        mode: TimelineMode,
        settings: TimelineSettings,
    ) -> (Self, mpsc::Receiver<TimelineSignal>) {
        let room_id = room_id.into();
        let timeline_id =
            format!("timeline-{}", TIMELINE_SEQ.fetch_add(1, Ordering::Relaxed));

        let queue = DecryptionQueue::new(store.clone(), decryptor, key_bank);
        let echoes = Arc::new(UiEchoReconciler::new());
        let persistor = Arc::new(PagePersistor::new(store.clone()));
        let ctx = ChunkContext {
            room_id: room_id.clone(),
            timeline_id: timeline_id.clone(),
            store: store.clone(),
            persistor,
            paginator,
            decryptor: queue.clone(),
            echoes: Arc::clone(&echoes),
            filters: settings.filters.clone(),
            use_live_sender_info: settings.use_live_sender_info,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let (disposed_tx, disposed_rx) = watch::channel(false);
        let states = Arc::new(StatePair::default());
        let latest_snapshot = Arc::new(Mutex::new(Vec::new()));

        let context_limit = settings.initial_size as u32;
        let task = TimelineTask {
            room_id,
            settings,
            store_changes: store.subscribe(),
            strategy: LoadStrategy::new(ctx.clone(), mode, context_limit),
            ctx,
            queue,
            echoes,
            states: Arc::clone(&states),
            commands: command_rx,
            signals: signal_tx,
            disposed: disposed_rx,
            latest_snapshot: Arc::clone(&latest_snapshot),
            started: false,
        };
        tokio::spawn(task.run());

        let timeline = Self {
            timeline_id,
            commands: command_tx,
            disposed: disposed_tx,
            states,
            latest_snapshot,
            _store: std::marker::PhantomData,
        };
        (timeline, signal_rx)
    }

    /// Unique id of this timeline instance (the decryption replay scope).
    pub fn timeline_id(&self) -> &str {
        &self.timeline_id
    }

    /// Start the timeline: anchor the mode and load the initial window.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Request `count` more events in `direction`.
    pub fn paginate(&self, direction: Direction, count: usize) {
        let _ = self.commands.send(Command::Paginate { direction, count });
    }

    /// Re-anchor on an event (`Some`) or back on the live edge (`None`).
    pub fn restart_with_event(&self, event_id: Option<String>) {
        let _ = self.commands.send(Command::RestartWith { event_id });
    }

    /// Register a freshly created local echo (optimistic send).
    pub fn on_local_echo_created(&self, event: StoredEvent) {
        let _ = self.commands.send(Command::LocalEcho { event });
    }

    /// Record a send-state transition for a local echo.
    pub fn on_send_state_updated(&self, event_id: impl Into<String>, state: SendState) {
        let _ = self
            .commands
            .send(Command::SendStateUpdate { event_id: event_id.into(), state });
    }

    /// Current pagination state for a direction.
    pub fn pagination_state(&self, direction: Direction) -> PaginationState {
        self.states.get(direction)
    }

    /// Whether the timeline is anchored at the live edge.
    pub fn is_live(&self) -> bool {
        !self.states.get(Direction::Forwards).has_more_to_load
    }

    /// Index of an event in the latest published snapshot.
    #[allow(clippy::expect_used)]
    pub fn get_built_event_index(&self, event_id: &str) -> Option<usize> {
        self.latest_snapshot
            .lock()
            .expect("snapshot cache poisoned")
            .iter()
            .position(|item| item.event_id == event_id)
    }

    /// An event from the latest published snapshot.
    #[allow(clippy::expect_used)]
    pub fn get_built_event(&self, event_id: &str) -> Option<TimelineItem> {
        self.latest_snapshot
            .lock()
            .expect("snapshot cache poisoned")
            .iter()
            .find(|item| item.event_id == event_id)
            .cloned()
    }

    /// Stop the timeline: cancel in-flight work, close the chunk tree,
    /// and tear down the decryption queue.
    pub fn dispose(&self) {
        let _ = self.disposed.send(true);
        let _ = self.commands.send(Command::Dispose);
    }
}

struct TimelineTask<S: TimelineStore> {
    room_id: String,
    settings: TimelineSettings,
    ctx: ChunkContext<S>,
    strategy: LoadStrategy<S>,
    queue: DecryptionQueue<S>,
    echoes: Arc<UiEchoReconciler>,
    states: Arc<StatePair>,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::Sender<TimelineSignal>,
    store_changes: broadcast::Receiver<StoreChange>,
    disposed: watch::Receiver<bool>,
    latest_snapshot: Arc<Mutex<Vec<TimelineItem>>>,
    started: bool,
}

impl<S: TimelineStore> TimelineTask<S> {
    async fn run(mut self) {
        let debounce = tokio::time::sleep(SNAPSHOT_DEBOUNCE);
        tokio::pin!(debounce);
        let mut dirty = false;
        let mut disposed = self.disposed.clone();

        loop {
            tokio::select! {
                biased;
                _ = disposed.changed() => break,
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if matches!(command, Command::Dispose) {
                        break;
                    }
                    match self.handle_command(command).await {
                        Ok(true) => {
                            dirty = true;
                            debounce.as_mut().reset(Instant::now() + SNAPSHOT_DEBOUNCE);
                        },
                        Ok(false) => {},
                        Err(Disposed) => break,
                    }
                },
                change = self.store_changes.recv() => {
                    if self.handle_store_change(change) {
                        dirty = true;
                        debounce.as_mut().reset(Instant::now() + SNAPSHOT_DEBOUNCE);
                    }
                },
                () = &mut debounce, if dirty => {
                    dirty = false;
                    self.publish_snapshot().await;
                },
            }
        }

        self.strategy.stop();
        self.queue.destroy();
    }

    fn handle_store_change(
        &mut self,
        change: Result<StoreChange, broadcast::error::RecvError>,
    ) -> bool {
        let change = match change {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "store change feed lagged");
                return self.started;
            },
            Err(broadcast::error::RecvError::Closed) => return false,
        };
        if !self.started {
            return false;
        }

        let changed = self.strategy.handle_store_change(&change);
        match &change {
            StoreChange::EventsInserted { room_id, event_ids, .. }
                if changed && *room_id == self.room_id =>
            {
                let _ = self.signals.try_send(TimelineSignal::NewEvents(event_ids.clone()));
                true
            },
            StoreChange::SendingEventsChanged { room_id } if *room_id == self.room_id => true,
            _ => changed,
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<bool, Disposed> {
        match command {
            Command::Start => {
                if self.started {
                    return Ok(false);
                }
                self.queue.start();
                self.open().await?;
                self.started = true;
                self.paginate(Direction::Backwards, self.settings.initial_size).await?;
                Ok(true)
            },
            Command::Paginate { direction, count } => {
                if !self.started {
                    let _ = self.signals.try_send(TimelineSignal::Failure(
                        TimelineError::NotStarted,
                    ));
                    return Ok(false);
                }
                self.paginate(direction, count).await?;
                Ok(true)
            },
            Command::RestartWith { event_id } => {
                if !self.started {
                    let _ = self.signals.try_send(TimelineSignal::Failure(
                        TimelineError::NotStarted,
                    ));
                    return Ok(false);
                }
                self.strategy.stop();
                let mode = match event_id {
                    Some(event_id) => TimelineMode::Permalink { event_id },
                    None => TimelineMode::Live,
                };
                self.strategy = LoadStrategy::new(
                    self.ctx.clone(),
                    mode,
                    self.settings.initial_size as u32,
                );
                self.open().await?;
                self.paginate(Direction::Backwards, self.settings.initial_size).await?;
                Ok(true)
            },
            Command::LocalEcho { event } => {
                let rebuild_target = self.echoes.on_local_echo_created(event.clone());
                if let Err(error) = self.ctx.store.add_sending_event(event) {
                    tracing::warn!(%error, "failed to persist sending event");
                }
                if let Some(target) = rebuild_target {
                    self.strategy.refresh_event(&target);
                }
                Ok(true)
            },
            Command::SendStateUpdate { event_id, state } => {
                let changed = self.echoes.on_send_state_updated(&event_id, state);
                if let Err(error) = self.ctx.store.set_send_state(&self.room_id, &event_id, state)
                {
                    tracing::debug!(%error, "send state not persisted");
                }
                Ok(changed)
            },
            Command::Dispose => Ok(false),
        }
    }

    /// Anchor the current strategy, falling back to live mode when a
    /// permalink proves unresolvable.
    async fn open(&mut self) -> Result<(), Disposed> {
        let forward_has_more =
            matches!(self.strategy.mode(), TimelineMode::Permalink { .. });
        match self.cancellable_start().await? {
            Ok(()) => {
                self.states.reset(forward_has_more);
                Ok(())
            },
            Err(error) => {
                let fall_back = matches!(error, TimelineError::PermalinkUnresolved { .. });
                let _ = self.signals.try_send(TimelineSignal::Failure(error));
                if fall_back {
                    self.strategy = LoadStrategy::new(
                        self.ctx.clone(),
                        TimelineMode::Live,
                        self.settings.initial_size as u32,
                    );
                    if let Err(error) = self.cancellable_start().await? {
                        let _ = self.signals.try_send(TimelineSignal::Failure(error));
                    }
                    self.states.reset(false);
                }
                Ok(())
            },
        }
    }

    async fn cancellable_start(&mut self) -> Result<Result<(), TimelineError>, Disposed> {
        let mut disposed = self.disposed.clone();
        tokio::select! {
            biased;
            _ = disposed.changed() => Err(Disposed),
            outcome = self.strategy.start() => Ok(outcome),
        }
    }

    /// One guarded pagination pass in `direction`.
    async fn paginate(&mut self, direction: Direction, count: usize) -> Result<(), Disposed> {
        let state = self.states.get(direction);
        if !state.has_more_to_load {
            tracing::debug!(?direction, "nothing more to load");
            return Ok(());
        }
        if state.is_paginating {
            tracing::debug!(?direction, "already paginating");
            return Ok(());
        }
        self.states.update(direction, |state| PaginationState {
            is_paginating: true,
            requested_count: count as u32,
            ..state
        });

        let mut disposed = self.disposed.clone();
        let outcome = tokio::select! {
            biased;
            _ = disposed.changed() => {
                // Leave is_paginating reset so a restarted timeline retries.
                self.states.update(direction, |state| PaginationState {
                    is_paginating: false,
                    requested_count: 0,
                    ..state
                });
                return Err(Disposed);
            },
            outcome = self.strategy.load_more(count, direction) => outcome,
        };

        self.states.update(direction, |state| PaginationState {
            has_more_to_load: state.has_more_to_load
                && outcome != LoadMoreOutcome::ReachedEnd,
            is_paginating: false,
            requested_count: 0,
        });
        if outcome == LoadMoreOutcome::Failure {
            let _ = self.signals.try_send(TimelineSignal::Failure(TimelineError::Network(
                format!("pagination {direction:?} failed"),
            )));
        }
        Ok(())
    }

    /// Build and publish one coalesced snapshot: reconciled pending sends
    /// first, then the built window.
    async fn publish_snapshot(&mut self) {
        let mut snapshot = Vec::new();
        for pending in self.echoes.pending_sends() {
            let mut item = TimelineItem::from_stored(&pending);
            self.echoes.update_sent_state(&mut item);
            self.echoes.decorate_with_reaction_echo(&mut item);
            snapshot.push(item);
        }
        snapshot.extend(self.strategy.build_window());

        #[allow(clippy::expect_used)]
        {
            *self.latest_snapshot.lock().expect("snapshot cache poisoned") = snapshot.clone();
        }
        if self.signals.send(TimelineSignal::Updated(snapshot)).await.is_err() {
            tracing::debug!("snapshot receiver dropped");
        }
    }
}

/// Marker: the timeline was disposed while an operation was in flight.
struct Disposed;
