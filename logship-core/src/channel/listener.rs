//! Outcome notifications for collaborators outside the channel

use std::sync::{Arc, RwLock};

use crate::sender::DeliveryError;
use crate::types::{Log, LogContainer};

/// Observer of log and batch lifecycle events.
///
/// Every method has a no-op default so implementors override only what they
/// need. Callbacks run on the owning unit's task and must not block.
#[allow(unused_variables)]
pub trait ChannelListener: Send + Sync {
    /// Called before a log is persisted. The log may be tagged in place;
    /// returning `false` filters it out.
    fn before_persist(&self, group_id: &str, log: &mut Log) -> bool {
        true
    }

    /// Called after the persistence attempt.
    fn after_persist(&self, group_id: &str, log: &Log, success: bool) {}

    /// A listener vetoed the log in [`before_persist`](Self::before_persist).
    fn on_filtered(&self, group_id: &str, log: &Log) {}

    /// A batch is about to be handed to the sender.
    fn before_send(&self, batch: &LogContainer) {}

    fn on_send_succeeded(&self, batch: &LogContainer) {}

    /// The batch was discarded after a non-recoverable failure.
    fn on_send_failed(&self, batch: &LogContainer, error: &DeliveryError) {}

    fn on_log_succeeded(&self, group_id: &str, log: &Log) {}

    fn on_log_failed(&self, group_id: &str, log: &Log, error: &DeliveryError) {}

    fn on_suspended(&self, group_id: &str) {}

    fn on_resumed(&self, group_id: &str) {}

    /// `data_deleted` is true when disabling discarded the group's stored logs.
    fn on_enabled_changed(&self, group_id: &str, enabled: bool, data_deleted: bool) {}
}

/// Listener list shared by a channel group and all of its units.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<Vec<Arc<dyn ChannelListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ChannelListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Remove a previously added listener. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn ChannelListener>) -> bool {
        match self.listeners.write() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|l| !Arc::ptr_eq(l, listener));
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current list, so callbacks run without holding the lock.
    fn snapshot(&self) -> Vec<Arc<dyn ChannelListener>> {
        self.listeners
            .read()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// Run the veto hooks in registration order. The first veto wins.
    pub(crate) fn before_persist(&self, group_id: &str, log: &mut Log) -> bool {
        self.snapshot()
            .iter()
            .all(|l| l.before_persist(group_id, log))
    }

    pub(crate) fn after_persist(&self, group_id: &str, log: &Log, success: bool) {
        for l in self.snapshot() {
            l.after_persist(group_id, log, success);
        }
    }

    pub(crate) fn on_filtered(&self, group_id: &str, log: &Log) {
        for l in self.snapshot() {
            l.on_filtered(group_id, log);
        }
    }

    pub(crate) fn before_send(&self, batch: &LogContainer) {
        for l in self.snapshot() {
            l.before_send(batch);
        }
    }

    pub(crate) fn on_send_succeeded(&self, batch: &LogContainer) {
        let listeners = self.snapshot();
        for l in &listeners {
            l.on_send_succeeded(batch);
        }
        for log in &batch.logs {
            for l in &listeners {
                l.on_log_succeeded(&batch.group_id, log);
            }
        }
    }

    pub(crate) fn on_send_failed(&self, batch: &LogContainer, error: &DeliveryError) {
        let listeners = self.snapshot();
        for l in &listeners {
            l.on_send_failed(batch, error);
        }
        for log in &batch.logs {
            for l in &listeners {
                l.on_log_failed(&batch.group_id, log, error);
            }
        }
    }

    pub(crate) fn on_suspended(&self, group_id: &str) {
        for l in self.snapshot() {
            l.on_suspended(group_id);
        }
    }

    pub(crate) fn on_resumed(&self, group_id: &str) {
        for l in self.snapshot() {
            l.on_resumed(group_id);
        }
    }

    pub(crate) fn on_enabled_changed(&self, group_id: &str, enabled: bool, data_deleted: bool) {
        for l in self.snapshot() {
            l.on_enabled_changed(group_id, enabled, data_deleted);
        }
    }
}
