//! Composition root for channel units
//!
//! A [`ChannelGroup`] owns the shared [`LogStore`] and [`Sender`], creates one
//! [`ChannelUnit`] per configured group, and broadcasts lifecycle changes to
//! all of them. It holds no batching state of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::config::{ChannelUnitConfiguration, Config};
use crate::db::LogStore;
use crate::error::{Error, Result};
use crate::sender::{HttpTransport, Sender, SenderEvent, TokenProvider};
use crate::types::Log;

use super::listener::{ChannelListener, ListenerRegistry};
use super::unit::{ChannelUnit, Completion, SuspendReason, UnitService, UnitState};

/// State shared with the sender event task
struct Shared {
    units: RwLock<HashMap<String, ChannelUnit>>,
    enabled: AtomicBool,
    suspended: AtomicBool,
}

impl Shared {
    fn units(&self) -> Vec<ChannelUnit> {
        self.units
            .read()
            .map(|u| u.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Send a command to every unit, logging units that already stopped.
    fn broadcast(&self, command: impl Fn(&ChannelUnit) -> Result<()>) {
        for unit in self.units() {
            if let Err(e) = command(&unit) {
                tracing::debug!(group_id = %unit.group_id(), error = %e, "Unit did not accept command");
            }
        }
    }
}

/// Owner of the shared store, sender, and every channel unit.
pub struct ChannelGroup {
    store: Arc<LogStore>,
    sender: Arc<Sender>,
    listeners: ListenerRegistry,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl ChannelGroup {
    /// Create a group around an existing store and sender.
    ///
    /// Must be called within a tokio runtime: the group spawns a task that
    /// turns sender pause, resume, and fatal error signals into unit
    /// suspensions.
    pub fn new(store: Arc<LogStore>, sender: Arc<Sender>) -> Self {
        let shared = Arc::new(Shared {
            units: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(true),
            suspended: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(forward_sender_events(
            Arc::clone(&sender),
            Arc::clone(&shared),
            shutdown.clone(),
        ));

        Self {
            store,
            sender,
            listeners: ListenerRegistry::new(),
            shared,
            shutdown,
        }
    }

    /// Build the full pipeline from configuration: open the queue database,
    /// create an HTTP sender, and add a unit per configured group.
    pub fn from_config(config: &Config, tokens: Option<Arc<dyn TokenProvider>>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(LogStore::open(
            &config.queue_path(),
            config.storage.default_capacity,
        )?);
        let install_id = store.install_id()?;

        let transport = Arc::new(HttpTransport::new(config.ingestion.timeout())?);
        let mut sender = Sender::new(transport, &config.ingestion, install_id);
        if let Some(tokens) = tokens {
            sender = sender.with_token_provider(tokens);
        }

        let group = Self::new(store, Arc::new(sender));
        for unit_config in &config.groups {
            group.add_unit(unit_config.clone())?;
        }

        tracing::info!(
            groups = config.groups.len(),
            install_id = %install_id,
            "Channel group started"
        );
        Ok(group)
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    /// Create and start a unit sharing this group's store and sender.
    ///
    /// The unit inherits the group's enabled and suspended state.
    pub fn add_unit(&self, config: ChannelUnitConfiguration) -> Result<ChannelUnit> {
        config.validate()?;

        let mut units = self
            .shared
            .units
            .write()
            .map_err(|_| Error::ChannelClosed(config.group_id.clone()))?;
        if units.contains_key(&config.group_id) {
            return Err(Error::DuplicateGroup(config.group_id));
        }

        self.store
            .set_capacity(&config.group_id, config.storage_capacity);

        let mut reasons = Vec::new();
        if self.shared.suspended.load(Ordering::SeqCst) {
            reasons.push(SuspendReason::Requested);
        }
        if self.sender.is_paused() {
            reasons.push(SuspendReason::Transport);
        }

        let group_id = config.group_id.clone();
        tracing::info!(
            group_id = %group_id,
            priority = config.priority.as_str(),
            batch_size_limit = config.batch_size_limit,
            pending_batch_count_max = config.pending_batch_count_max,
            "Adding channel unit"
        );

        let (service, unit) = UnitService::new(
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.sender),
            self.listeners.clone(),
            self.shutdown.child_token(),
        );
        let service =
            service.with_initial_state(self.shared.enabled.load(Ordering::SeqCst), reasons);
        tokio::spawn(service.run());

        units.insert(group_id, unit.clone());
        Ok(unit)
    }

    pub fn unit(&self, group_id: &str) -> Option<ChannelUnit> {
        self.shared
            .units
            .read()
            .ok()
            .and_then(|u| u.get(group_id).cloned())
    }

    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .units
            .read()
            .map(|u| u.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Route a log to its group's unit.
    ///
    /// A log for an unknown group is rejected.
    pub fn enqueue(&self, log: Log, group_id: &str) -> Completion {
        match self.unit(group_id) {
            Some(unit) => unit.enqueue(log),
            None => {
                tracing::warn!(group_id, "Enqueue for unknown group, dropping log");
                Completion::ready(false)
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "Setting channel group enabled state");
        self.shared.broadcast(|u| u.set_enabled(enabled));
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Suspend every unit until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::SeqCst);
        self.shared.broadcast(|u| u.suspend());
    }

    /// Lift a host suspension or a fatal error suspension on every unit.
    pub fn resume(&self) {
        self.shared.suspended.store(false, Ordering::SeqCst);
        self.shared.broadcast(|u| u.resume());
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::SeqCst)
    }

    pub fn set_log_url(&self, log_url: &str) {
        self.sender.set_log_url(log_url);
    }

    /// Observe events from every unit, including units added later.
    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ChannelListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Ask every unit to flush pending logs now.
    pub fn flush_all(&self) {
        self.shared.broadcast(|u| u.flush());
    }

    /// Snapshot every unit, ordered by group id.
    pub async fn states(&self) -> Vec<UnitState> {
        let mut states = Vec::new();
        for unit in self.shared.units() {
            match unit.state().await {
                Ok(state) => states.push(state),
                Err(e) => tracing::debug!(error = %e, "Skipping stopped unit"),
            }
        }
        states.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        states
    }

    /// Stop every unit and the sender event task.
    ///
    /// Flush and retry timers are cancelled. Requests already on the wire
    /// finish but their outcome is ignored; their logs are returned to
    /// pending the next time the store is opened.
    pub async fn shutdown(&self) {
        for unit in self.shared.units() {
            if let Err(e) = unit.shutdown().await {
                tracing::debug!(group_id = %unit.group_id(), error = %e, "Unit already stopped");
            }
        }
        self.shutdown.cancel();
        if let Ok(mut units) = self.shared.units.write() {
            units.clear();
        }
        tracing::info!("Channel group shut down");
    }
}

impl Drop for ChannelGroup {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Translate sender signals into unit suspensions until shutdown.
async fn forward_sender_events(
    sender: Arc<Sender>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut events = sender.subscribe();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(SenderEvent::Paused) => {
                shared.broadcast(|u| u.suspend_for(SuspendReason::Transport));
            }
            Ok(SenderEvent::Resumed) => {
                shared.broadcast(|u| u.resume_for(SuspendReason::Transport));
            }
            Ok(SenderEvent::FatalError { group_id, status }) => {
                tracing::warn!(group_id = %group_id, status, "Fatal delivery error, suspending all units");
                shared.suspended.store(true, Ordering::SeqCst);
                shared.broadcast(|u| u.suspend());
            }
            Err(RecvError::Lagged(skipped)) => {
                // Pause state may have been missed; resync from the sender
                tracing::warn!(skipped, "Sender events lagged");
                if sender.is_paused() {
                    shared.broadcast(|u| u.suspend_for(SuspendReason::Transport));
                } else {
                    shared.broadcast(|u| u.resume_for(SuspendReason::Transport));
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestionConfig;
    use crate::sender::{IngestionRequest, IngestionResponse, Transport};
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    struct AlwaysOk;

    #[async_trait]
    impl Transport for AlwaysOk {
        async fn post(
            &self,
            _request: IngestionRequest,
        ) -> std::result::Result<IngestionResponse, String> {
            Ok(IngestionResponse {
                status: 200,
                body: String::new(),
            })
        }
    }

    fn group() -> ChannelGroup {
        let store = Arc::new(LogStore::open_in_memory(100).unwrap());
        let sender = Arc::new(Sender::new(
            Arc::new(AlwaysOk),
            &IngestionConfig::default(),
            Uuid::new_v4(),
        ));
        ChannelGroup::new(store, sender)
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_units_rejected() {
        let group = group();
        group.add_unit(ChannelUnitConfiguration::new("g1")).unwrap();

        assert!(matches!(
            group.add_unit(ChannelUnitConfiguration::new("g1")),
            Err(Error::DuplicateGroup(_))
        ));
        assert!(matches!(
            group.add_unit(ChannelUnitConfiguration::new("g2").with_batch_size_limit(0)),
            Err(Error::Config(_))
        ));
        assert_eq!(group.group_ids(), vec!["g1"]);
    }

    #[tokio::test]
    async fn test_unknown_group_rejects_log() {
        let group = group();
        assert!(!group.enqueue(Log::new("event"), "missing").await);
    }

    #[tokio::test]
    async fn test_storage_capacity_applied_per_unit() {
        let group = group();
        group
            .add_unit(
                ChannelUnitConfiguration::new("g1")
                    .with_batch_size_limit(2)
                    .with_storage_capacity(5),
            )
            .unwrap();
        assert_eq!(group.store().capacity("g1"), 5);
        assert_eq!(group.store().capacity("other"), 100);
    }

    #[tokio::test]
    async fn test_new_units_inherit_group_state() {
        let group = group();
        group.set_enabled(false);
        group.suspend();
        let unit = group.add_unit(ChannelUnitConfiguration::new("late")).unwrap();

        let state = unit.state().await.unwrap();
        assert!(!state.enabled);
        assert!(state.is_suspended());

        group.set_enabled(true);
        group.resume();
        let state = unit.state().await.unwrap();
        assert!(state.enabled);
        assert!(!state.is_suspended());
    }

    #[tokio::test]
    async fn test_sender_pause_suspends_units() {
        let group = group();
        let unit = group.add_unit(ChannelUnitConfiguration::new("g1")).unwrap();

        group.sender().pause();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = unit.state().await.unwrap();
        assert!(state.suspend_reasons.contains(&SuspendReason::Transport));

        // A host resume does not lift a transport suspension
        group.resume();
        assert!(unit.state().await.unwrap().is_suspended());

        group.sender().resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!unit.state().await.unwrap().is_suspended());
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_units() {
        let group = group();
        let a = group.add_unit(ChannelUnitConfiguration::new("a")).unwrap();
        let b = group.add_unit(ChannelUnitConfiguration::new("b")).unwrap();
        assert_eq!(group.states().await.len(), 2);

        group.shutdown().await;
        assert!(a.state().await.is_err());
        assert!(b.state().await.is_err());
        assert!(group.group_ids().is_empty());
    }
}
