//! Per-group batch assembler
//!
//! Each group is served by one [`UnitService`] task that owns all batching
//! state. Producers, timers, and delivery calls talk to it through a
//! [`ChannelUnit`] handle, so a unit's state transitions never interleave:
//!
//! ```text
//!   enqueue / flush / suspend ──┐
//!   batch timer ────────────────┼──> UnitCommand ──> UnitService ──> LogStore
//!   delivery completion ────────┘                         │
//!                                                         └──> Sender (spawned call)
//! ```
//!
//! Flush triggers are evaluated after every persisted log: reaching
//! `batch_size_limit` flushes immediately, otherwise a `batch_time_interval`
//! timer is started if none runs. At most `pending_batch_count_max` batches
//! are in flight at once; further flushes wait for a completion.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ChannelUnitConfiguration;
use crate::db::LogStore;
use crate::error::{Error, Result};
use crate::sender::{Outcome, Sender};
use crate::types::{Log, LogContainer};

use super::listener::ListenerRegistry;

/// Why a unit is suspended.
///
/// A unit stays suspended while any reason is active, so lifting one reason
/// does not override the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SuspendReason {
    /// Suspended by the host or by a fatal delivery error
    Requested,
    /// The shared sender is paused
    Transport,
}

/// Resolves to whether an enqueued log was accepted (persisted).
///
/// Resolves after the persistence attempt, not after delivery. Dropping it
/// does not cancel the enqueue.
#[must_use = "a Completion does nothing unless awaited; drop it for fire-and-forget"]
pub struct Completion(oneshot::Receiver<bool>);

impl Completion {
    /// An already-resolved completion.
    pub fn ready(accepted: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(accepted);
        Self(rx)
    }
}

impl Future for Completion {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        // A unit that stopped before replying did not persist the log
        Pin::new(&mut self.0).poll(cx).map(|r| r.unwrap_or(false))
    }
}

/// Point-in-time view of a unit's state.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitState {
    pub group_id: String,
    pub enabled: bool,
    pub suspend_reasons: BTreeSet<SuspendReason>,
    pub pending_log_count: usize,
    pub active_batch_ids: BTreeSet<String>,
    pub timer_running: bool,
}

impl UnitState {
    pub fn is_suspended(&self) -> bool {
        !self.suspend_reasons.is_empty()
    }
}

#[derive(Debug)]
enum UnitCommand {
    Enqueue {
        log: Log,
        reply: oneshot::Sender<bool>,
    },
    Flush,
    TimerFired {
        generation: u64,
    },
    SendCompleted {
        batch_id: String,
        outcome: Outcome,
    },
    SetEnabled(bool),
    Suspend(SuspendReason),
    Resume(SuspendReason),
    State(oneshot::Sender<UnitState>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running channel unit.
///
/// Cloneable; every clone talks to the same unit task.
#[derive(Clone, Debug)]
pub struct ChannelUnit {
    group_id: Arc<str>,
    tx: mpsc::UnboundedSender<UnitCommand>,
}

impl ChannelUnit {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Submit a log. See [`Completion`].
    pub fn enqueue(&self, log: Log) -> Completion {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(UnitCommand::Enqueue { log, reply }).is_err() {
            tracing::debug!(group_id = %self.group_id, "Enqueue on stopped unit");
        }
        Completion(rx)
    }

    /// Claim and send pending logs now, gate permitting.
    pub fn flush(&self) -> Result<()> {
        self.send(UnitCommand::Flush)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.send(UnitCommand::SetEnabled(enabled))
    }

    /// Stop creating batches and abandon pending retries.
    pub fn suspend(&self) -> Result<()> {
        self.suspend_for(SuspendReason::Requested)
    }

    pub fn resume(&self) -> Result<()> {
        self.resume_for(SuspendReason::Requested)
    }

    pub(crate) fn suspend_for(&self, reason: SuspendReason) -> Result<()> {
        self.send(UnitCommand::Suspend(reason))
    }

    pub(crate) fn resume_for(&self, reason: SuspendReason) -> Result<()> {
        self.send(UnitCommand::Resume(reason))
    }

    /// Snapshot of the unit's state after all previously sent commands.
    pub async fn state(&self) -> Result<UnitState> {
        let (reply, rx) = oneshot::channel();
        self.send(UnitCommand::State(reply))?;
        rx.await
            .map_err(|_| Error::ChannelClosed(self.group_id.to_string()))
    }

    /// Stop the unit. Timers and retries are cancelled; requests already on
    /// the wire finish but their outcome is ignored.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(UnitCommand::Shutdown(reply))?;
        rx.await
            .map_err(|_| Error::ChannelClosed(self.group_id.to_string()))
    }

    fn send(&self, command: UnitCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::ChannelClosed(self.group_id.to_string()))
    }
}

struct ActiveBatch {
    container: Arc<LogContainer>,
    cancel: CancellationToken,
}

struct BatchTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Task owning one group's batching state.
pub struct UnitService {
    config: ChannelUnitConfiguration,
    store: Arc<LogStore>,
    sender: Arc<Sender>,
    listeners: ListenerRegistry,
    rx: mpsc::UnboundedReceiver<UnitCommand>,
    // Weak so the channel closes once every handle is dropped
    self_tx: mpsc::WeakUnboundedSender<UnitCommand>,
    shutdown: CancellationToken,

    enabled: bool,
    suspend_reasons: BTreeSet<SuspendReason>,
    pending_log_count: usize,
    active: HashMap<String, ActiveBatch>,
    timer: Option<BatchTimer>,
    timer_generation: u64,
}

impl UnitService {
    /// Create a service and its handle. The service does nothing until
    /// [`run`](Self::run) is spawned.
    pub fn new(
        config: ChannelUnitConfiguration,
        store: Arc<LogStore>,
        sender: Arc<Sender>,
        listeners: ListenerRegistry,
        shutdown: CancellationToken,
    ) -> (Self, ChannelUnit) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ChannelUnit {
            group_id: Arc::from(config.group_id.as_str()),
            tx: tx.clone(),
        };

        let service = Self {
            config,
            store,
            sender,
            listeners,
            rx,
            self_tx: tx.downgrade(),
            shutdown,
            enabled: true,
            suspend_reasons: BTreeSet::new(),
            pending_log_count: 0,
            active: HashMap::new(),
            timer: None,
            timer_generation: 0,
        };

        (service, handle)
    }

    /// Start disabled or suspended, inheriting the group's current state.
    pub(crate) fn with_initial_state(
        mut self,
        enabled: bool,
        reasons: impl IntoIterator<Item = SuspendReason>,
    ) -> Self {
        self.enabled = enabled;
        self.suspend_reasons.extend(reasons);
        self
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        tracing::debug!(group_id = %self.config.group_id, "Channel unit started");
        self.recover();

        loop {
            let command = tokio::select! {
                command = self.rx.recv() => command,
                _ = self.shutdown.cancelled() => None,
            };

            let Some(command) = command else {
                self.stop();
                break;
            };
            if !self.handle(command) {
                break;
            }
        }

        tracing::debug!(group_id = %self.config.group_id, "Channel unit stopped");
    }

    /// Apply one command. Returns `false` once the unit should stop.
    fn handle(&mut self, command: UnitCommand) -> bool {
        match command {
            UnitCommand::Enqueue { log, reply } => {
                let accepted = self.enqueue(log);
                let _ = reply.send(accepted);
            }
            UnitCommand::Flush => self.flush(),
            UnitCommand::TimerFired { generation } => self.timer_fired(generation),
            UnitCommand::SendCompleted { batch_id, outcome } => {
                self.send_completed(&batch_id, outcome)
            }
            UnitCommand::SetEnabled(enabled) => self.set_enabled(enabled),
            UnitCommand::Suspend(reason) => self.suspend(reason),
            UnitCommand::Resume(reason) => self.resume(reason),
            UnitCommand::State(reply) => {
                let _ = reply.send(self.snapshot());
            }
            UnitCommand::Shutdown(reply) => {
                self.stop();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn group_id(&self) -> &str {
        &self.config.group_id
    }

    fn is_suspended(&self) -> bool {
        !self.suspend_reasons.is_empty()
    }

    // ============================================
    // Startup recovery
    // ============================================

    /// Pick up logs left by a previous process.
    ///
    /// A batch timer that was running when the process stopped resumes with
    /// its remaining time rather than a full interval.
    fn recover(&mut self) {
        self.refresh_pending();

        if !self.enabled || !self.config.priority.sends() || self.pending_log_count == 0 {
            self.clear_persisted_timer();
            return;
        }

        if self.pending_log_count >= self.config.batch_size_limit {
            self.flush();
            return;
        }

        let interval = self.config.batch_time_interval();
        match self.store.timer_start(self.group_id()) {
            Ok(Some(started_at)) => {
                let elapsed = (Utc::now() - started_at).to_std().unwrap_or(Duration::ZERO);
                let remaining = interval.saturating_sub(elapsed);
                tracing::debug!(
                    group_id = %self.group_id(),
                    pending = self.pending_log_count,
                    remaining_ms = remaining.as_millis() as u64,
                    "Resuming batch timer"
                );
                self.spawn_timer(remaining);
            }
            Ok(None) => self.start_timer(),
            Err(e) => {
                tracing::warn!(group_id = %self.group_id(), error = %e, "Failed to read batch timer");
                self.start_timer();
            }
        }
    }

    // ============================================
    // Enqueue and flush triggers
    // ============================================

    fn enqueue(&mut self, mut log: Log) -> bool {
        if !self.enabled {
            tracing::debug!(group_id = %self.group_id(), "Unit disabled, dropping log");
            return false;
        }

        if !self.listeners.before_persist(&self.config.group_id, &mut log) {
            tracing::debug!(group_id = %self.group_id(), log_type = %log.log_type, "Log filtered");
            self.listeners.on_filtered(&self.config.group_id, &log);
            return false;
        }

        match self.store.put(&self.config.group_id, &log) {
            Ok(record_id) => {
                tracing::trace!(group_id = %self.group_id(), record_id, "Log persisted");
                self.listeners.after_persist(&self.config.group_id, &log, true);
                self.refresh_pending();
                self.evaluate_triggers();
                true
            }
            Err(e) => {
                tracing::warn!(group_id = %self.group_id(), error = %e, "Failed to persist log, dropping");
                self.listeners.after_persist(&self.config.group_id, &log, false);
                false
            }
        }
    }

    fn evaluate_triggers(&mut self) {
        if !self.enabled || !self.config.priority.sends() {
            return;
        }

        if self.pending_log_count == 0 {
            self.cancel_timer();
        } else if self.pending_log_count >= self.config.batch_size_limit {
            self.flush();
        } else if self.timer.is_none() {
            self.start_timer();
        }
    }

    /// Claim batches until the in-flight gate is full or nothing is pending.
    fn flush(&mut self) {
        if !self.enabled || !self.config.priority.sends() {
            return;
        }
        if self.is_suspended() {
            tracing::debug!(group_id = %self.group_id(), "Unit suspended, not claiming");
            return;
        }

        self.cancel_timer();

        while self.active.len() < self.config.pending_batch_count_max {
            match self
                .store
                .claim_batch(&self.config.group_id, self.config.batch_size_limit)
            {
                Ok(Some(container)) => self.dispatch(container),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(group_id = %self.group_id(), error = %e, "Failed to claim batch");
                    break;
                }
            }
        }

        if self.active.len() >= self.config.pending_batch_count_max {
            tracing::debug!(
                group_id = %self.group_id(),
                active = self.active.len(),
                "In-flight limit reached, deferring flush"
            );
        }

        self.refresh_pending();
    }

    fn dispatch(&mut self, container: LogContainer) {
        let container = Arc::new(container);
        let cancel = self.shutdown.child_token();
        let budget = self
            .config
            .priority
            .retry_budget(self.sender.retry_policy().max_retries);

        tracing::debug!(
            group_id = %self.group_id(),
            batch_id = %container.batch_id,
            logs = container.len(),
            "Dispatching batch"
        );
        self.listeners.before_send(&container);

        self.active.insert(
            container.batch_id.clone(),
            ActiveBatch {
                container: Arc::clone(&container),
                cancel: cancel.clone(),
            },
        );

        let sender = Arc::clone(&self.sender);
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let outcome = sender.send(&container, budget, &cancel).await;
            // Re-dispatch onto the unit's task; a stopped unit ignores the outcome
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(UnitCommand::SendCompleted {
                    batch_id: container.batch_id.clone(),
                    outcome,
                });
            }
        });
    }

    fn send_completed(&mut self, batch_id: &str, outcome: Outcome) {
        let Some(active) = self.active.remove(batch_id) else {
            self.settle_abandoned(batch_id, outcome);
            return;
        };
        let container = active.container;

        match outcome {
            Outcome::Success => {
                self.delete_batch(batch_id);
                self.listeners.on_send_succeeded(&container);
            }
            Outcome::Failed(error) => {
                tracing::warn!(
                    group_id = %self.group_id(),
                    batch_id,
                    logs = container.len(),
                    error = %error,
                    "Discarding batch after delivery failure"
                );
                self.delete_batch(batch_id);
                self.listeners.on_send_failed(&container, &error);
            }
            Outcome::Cancelled => self.release_batch(batch_id),
        }

        self.refresh_pending();
        self.evaluate_triggers();
    }

    /// Outcome of a batch the unit stopped tracking when it was disabled.
    /// Settles the store without notifying listeners, then re-evaluates
    /// triggers for whatever returned to pending.
    fn settle_abandoned(&mut self, batch_id: &str, outcome: Outcome) {
        tracing::debug!(group_id = %self.group_id(), batch_id, ?outcome, "Outcome for abandoned batch");
        match outcome {
            Outcome::Success | Outcome::Failed(_) => self.delete_batch(batch_id),
            Outcome::Cancelled => self.release_batch(batch_id),
        }
        // Released logs may belong to a unit that was re-enabled meanwhile
        self.refresh_pending();
        self.evaluate_triggers();
    }

    fn delete_batch(&self, batch_id: &str) {
        if let Err(e) = self.store.delete(batch_id) {
            tracing::error!(group_id = %self.group_id(), batch_id, error = %e, "Failed to delete batch");
        }
    }

    fn release_batch(&self, batch_id: &str) {
        match self.store.release_batch(batch_id) {
            Ok(released) => {
                tracing::debug!(group_id = %self.group_id(), batch_id, released, "Batch returned to pending")
            }
            Err(e) => {
                tracing::error!(group_id = %self.group_id(), batch_id, error = %e, "Failed to release batch")
            }
        }
    }

    fn refresh_pending(&mut self) {
        match self.store.count_pending(&self.config.group_id) {
            Ok(count) => self.pending_log_count = count,
            Err(e) => {
                tracing::warn!(group_id = %self.group_id(), error = %e, "Failed to count pending logs")
            }
        }
    }

    // ============================================
    // Batch timer
    // ============================================

    fn start_timer(&mut self) {
        if let Err(e) = self.store.set_timer_start(&self.config.group_id, Utc::now()) {
            tracing::warn!(group_id = %self.group_id(), error = %e, "Failed to persist batch timer");
        }
        self.spawn_timer(self.config.batch_time_interval());
    }

    fn spawn_timer(&mut self, delay: Duration) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }

        self.timer_generation += 1;
        let generation = self.timer_generation;
        let self_tx = self.self_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(UnitCommand::TimerFired { generation });
            }
        });

        self.timer = Some(BatchTimer { generation, handle });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
            self.clear_persisted_timer();
        }
    }

    fn clear_persisted_timer(&self) {
        if let Err(e) = self.store.clear_timer_start(&self.config.group_id) {
            tracing::warn!(group_id = %self.group_id(), error = %e, "Failed to clear batch timer");
        }
    }

    fn timer_fired(&mut self, generation: u64) {
        // Ignore a fire that raced with a cancel or restart
        match &self.timer {
            Some(timer) if timer.generation == generation => {}
            _ => return,
        }
        self.timer = None;
        self.clear_persisted_timer();

        tracing::debug!(group_id = %self.group_id(), pending = self.pending_log_count, "Batch timer fired");
        self.flush();
    }

    // ============================================
    // Lifecycle
    // ============================================

    fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;

        if enabled {
            tracing::info!(group_id = %self.group_id(), "Channel unit enabled");
            self.listeners
                .on_enabled_changed(&self.config.group_id, true, false);
            self.refresh_pending();
            self.evaluate_triggers();
            return;
        }

        self.cancel_timer();
        self.clear_persisted_timer();

        // Calls not yet on the wire resolve Cancelled and are released when
        // their outcome arrives; requests on the wire are left to finish.
        for (_, active) in self.active.drain() {
            active.cancel.cancel();
        }

        let data_deleted = if self.config.priority.discards_on_disable() {
            match self.store.delete_group(&self.config.group_id) {
                Ok(deleted) => {
                    tracing::info!(group_id = %self.group_id(), deleted, "Discarded stored logs on disable");
                    true
                }
                Err(e) => {
                    tracing::error!(group_id = %self.group_id(), error = %e, "Failed to discard stored logs");
                    false
                }
            }
        } else {
            false
        };

        self.refresh_pending();
        tracing::info!(group_id = %self.group_id(), data_deleted, "Channel unit disabled");
        self.listeners
            .on_enabled_changed(&self.config.group_id, false, data_deleted);
    }

    fn suspend(&mut self, reason: SuspendReason) {
        let was_suspended = self.is_suspended();
        if !self.suspend_reasons.insert(reason) || was_suspended {
            return;
        }

        tracing::info!(group_id = %self.group_id(), ?reason, "Channel unit suspended");
        self.cancel_timer();
        for active in self.active.values() {
            active.cancel.cancel();
        }
        self.listeners.on_suspended(&self.config.group_id);
    }

    fn resume(&mut self, reason: SuspendReason) {
        if !self.suspend_reasons.remove(&reason) || self.is_suspended() {
            return;
        }

        tracing::info!(group_id = %self.group_id(), ?reason, "Channel unit resumed");
        self.listeners.on_resumed(&self.config.group_id);
        self.refresh_pending();
        self.flush();
    }

    fn stop(&mut self) {
        // The persisted timer start is kept so a restart resumes the interval
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
        for (_, active) in self.active.drain() {
            active.cancel.cancel();
        }
    }

    fn snapshot(&self) -> UnitState {
        UnitState {
            group_id: self.config.group_id.clone(),
            enabled: self.enabled,
            suspend_reasons: self.suspend_reasons.clone(),
            pending_log_count: self.pending_log_count,
            active_batch_ids: self.active.keys().cloned().collect(),
            timer_running: self.timer.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestionConfig;
    use crate::sender::{IngestionRequest, IngestionResponse, Transport};
    use crate::types::Priority;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use uuid::Uuid;

    /// Holds every request until released, then answers with `status`.
    struct GatedTransport {
        status: Mutex<u16>,
        gate: Notify,
        open: Mutex<bool>,
        requests: AtomicUsize,
    }

    impl GatedTransport {
        fn new(status: u16, open: bool) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(status),
                gate: Notify::new(),
                open: Mutex::new(open),
                requests: AtomicUsize::new(0),
            })
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.gate.notify_waiters();
        }
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn post(
            &self,
            _request: IngestionRequest,
        ) -> std::result::Result<IngestionResponse, String> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            loop {
                let notified = self.gate.notified();
                if *self.open.lock().unwrap() {
                    break;
                }
                notified.await;
            }
            Ok(IngestionResponse {
                status: *self.status.lock().unwrap(),
                body: String::new(),
            })
        }
    }

    fn spawn_unit(
        config: ChannelUnitConfiguration,
        store: Arc<LogStore>,
        transport: Arc<GatedTransport>,
    ) -> ChannelUnit {
        let sender = Arc::new(Sender::new(
            transport,
            &IngestionConfig::default(),
            Uuid::new_v4(),
        ));
        let (service, handle) = UnitService::new(
            config,
            store,
            sender,
            ListenerRegistry::new(),
            CancellationToken::new(),
        );
        tokio::spawn(service.run());
        handle
    }

    /// Let spawned delivery calls finish, then read the unit's state.
    async fn settle(unit: &ChannelUnit) -> UnitState {
        tokio::time::sleep(Duration::from_millis(50)).await;
        unit.state().await.unwrap()
    }

    #[tokio::test]
    async fn test_completion_resolves_false_when_dropped() {
        let (tx, rx) = oneshot::channel::<bool>();
        drop(tx);
        assert!(!Completion(rx).await);
        assert!(Completion::ready(true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_claims_before_completion() {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let transport = GatedTransport::new(200, false);
        let unit = spawn_unit(
            ChannelUnitConfiguration::new("g1").with_batch_size_limit(2),
            Arc::clone(&store),
            transport.clone(),
        );

        assert!(unit.enqueue(Log::new("a")).await);
        assert_eq!(store.count_claimed("g1").unwrap(), 0);
        assert!(unit.enqueue(Log::new("b")).await);
        // The batch was claimed before the second enqueue resolved
        assert_eq!(store.count_claimed("g1").unwrap(), 2);

        transport.release();
        let state = settle(&unit).await;
        assert!(state.active_batch_ids.is_empty());
        assert_eq!(store.count_all("g1").unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_partial_batch() {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let transport = GatedTransport::new(200, true);
        let unit = spawn_unit(
            ChannelUnitConfiguration::new("g1")
                .with_batch_size_limit(10)
                .with_batch_time_interval_secs(5),
            Arc::clone(&store),
            transport.clone(),
        );

        assert!(unit.enqueue(Log::new("a")).await);
        let state = unit.state().await.unwrap();
        assert!(state.timer_running);
        assert!(store.timer_start("g1").unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(transport.requests.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let state = settle(&unit).await;
        assert_eq!(transport.requests.load(Ordering::SeqCst), 1);
        assert!(!state.timer_running);
        assert!(store.timer_start("g1").unwrap().is_none());
        assert_eq!(store.count_all("g1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disabled_unit_rejects_logs() {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let unit = spawn_unit(
            ChannelUnitConfiguration::new("g1"),
            Arc::clone(&store),
            GatedTransport::new(200, true),
        );

        unit.set_enabled(false).unwrap();
        assert!(!unit.enqueue(Log::new("a")).await);
        assert_eq!(store.count_all("g1").unwrap(), 0);
        assert!(!unit.state().await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_disable_discards_default_priority_logs() {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let unit = spawn_unit(
            ChannelUnitConfiguration::new("g1"),
            Arc::clone(&store),
            GatedTransport::new(200, true),
        );
        assert!(unit.enqueue(Log::new("a")).await);

        unit.set_enabled(false).unwrap();
        let state = unit.state().await.unwrap();
        assert_eq!(state.pending_log_count, 0);
        assert!(!state.timer_running);
        assert_eq!(store.count_all("g1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disable_keeps_high_priority_logs() {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let unit = spawn_unit(
            ChannelUnitConfiguration::new("g1").with_priority(Priority::High),
            Arc::clone(&store),
            GatedTransport::new(200, true),
        );
        assert!(unit.enqueue(Log::new("a")).await);

        unit.set_enabled(false).unwrap();
        assert_eq!(unit.state().await.unwrap().pending_log_count, 1);
        assert_eq!(store.count_pending("g1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backup_priority_never_claims() {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let transport = GatedTransport::new(200, true);
        let unit = spawn_unit(
            ChannelUnitConfiguration::new("g1")
                .with_priority(Priority::Backup)
                .with_batch_size_limit(1),
            Arc::clone(&store),
            transport.clone(),
        );

        assert!(unit.enqueue(Log::new("a")).await);
        unit.flush().unwrap();
        let state = settle(&unit).await;

        assert_eq!(state.pending_log_count, 1);
        assert!(!state.timer_running);
        assert_eq!(transport.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_suspend_is_idempotent_and_blocks_flush() {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let transport = GatedTransport::new(200, true);
        let unit = spawn_unit(
            ChannelUnitConfiguration::new("g1").with_batch_size_limit(1),
            Arc::clone(&store),
            transport.clone(),
        );

        unit.suspend().unwrap();
        unit.suspend().unwrap();
        assert!(unit.enqueue(Log::new("a")).await);
        unit.flush().unwrap();

        let state = settle(&unit).await;
        assert!(state.is_suspended());
        assert_eq!(store.count_claimed("g1").unwrap(), 0);
        assert_eq!(transport.requests.load(Ordering::SeqCst), 0);

        unit.resume().unwrap();
        let state = settle(&unit).await;
        assert!(!state.is_suspended());
        assert_eq!(transport.requests.load(Ordering::SeqCst), 1);
        assert_eq!(store.count_all("g1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_suspend_reasons_are_independent() {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let unit = spawn_unit(
            ChannelUnitConfiguration::new("g1"),
            store,
            GatedTransport::new(200, true),
        );

        unit.suspend().unwrap();
        unit.suspend_for(SuspendReason::Transport).unwrap();
        unit.resume_for(SuspendReason::Transport).unwrap();
        assert!(unit.state().await.unwrap().is_suspended());

        unit.resume().unwrap();
        assert!(!unit.state().await.unwrap().is_suspended());
    }

    #[tokio::test]
    async fn test_shutdown_stops_unit() {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let unit = spawn_unit(
            ChannelUnitConfiguration::new("g1"),
            store,
            GatedTransport::new(200, true),
        );

        unit.shutdown().await.unwrap();
        assert!(!unit.enqueue(Log::new("a")).await);
        assert!(matches!(unit.state().await, Err(Error::ChannelClosed(_))));
    }
}
