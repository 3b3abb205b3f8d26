//! Shared helpers for logship-core integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use logship_core::config::IngestionConfig;
use logship_core::sender::{IngestionRequest, IngestionResponse, Transport};
use logship_core::{
    ChannelGroup, ChannelListener, DeliveryError, Log, LogContainer, LogStore, Sender,
};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// A request as seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub at: Instant,
    pub url: String,
    pub install_id: Option<String>,
    pub log_types: Vec<String>,
}

#[derive(Deserialize)]
struct Body {
    logs: Vec<Log>,
}

type Responder = Box<dyn Fn(&RecordedRequest) -> Result<u16, String> + Send + Sync>;

/// In-process transport answering each request through a closure.
///
/// While held, requests wait (on the wire, from the sender's point of view)
/// until [`release`](Self::release) is called.
pub struct ScriptedTransport {
    responder: Mutex<Responder>,
    requests: Mutex<Vec<RecordedRequest>>,
    held: AtomicBool,
    gate: Notify,
}

impl ScriptedTransport {
    pub fn new(responder: impl Fn(&RecordedRequest) -> Result<u16, String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Mutex::new(Box::new(responder)),
            requests: Mutex::new(Vec::new()),
            held: AtomicBool::new(false),
            gate: Notify::new(),
        })
    }

    /// Transport that acknowledges every request.
    pub fn ok() -> Arc<Self> {
        Self::new(|_| Ok(200))
    }

    pub fn respond_with(
        &self,
        responder: impl Fn(&RecordedRequest) -> Result<u16, String> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap() = Box::new(responder);
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose batch contained a log of the given type
    pub fn requests_with(&self, log_type: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.log_types.iter().any(|t| t == log_type))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, request: IngestionRequest) -> Result<IngestionResponse, String> {
        let body: Body = serde_json::from_slice(&request.body).map_err(|e| e.to_string())?;
        let recorded = RecordedRequest {
            at: Instant::now(),
            url: request.url.clone(),
            install_id: request.headers.get("Install-ID").cloned(),
            log_types: body.logs.iter().map(|l| l.log_type.clone()).collect(),
        };
        self.requests.lock().unwrap().push(recorded.clone());

        loop {
            let released = self.gate.notified();
            if !self.held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }

        let status = (self.responder.lock().unwrap())(&recorded)?;
        Ok(IngestionResponse {
            status,
            body: String::new(),
        })
    }
}

/// Ingestion settings used by every test: the default retry table.
pub fn ingestion_config() -> IngestionConfig {
    IngestionConfig {
        log_url: "https://ingest.test".to_string(),
        api_path: "/logs".to_string(),
        retry_intervals_secs: vec![10, 30, 60, 120],
        max_retries: 4,
        ..Default::default()
    }
}

/// Channel group over the given store and transport.
pub fn group_with(store: Arc<LogStore>, transport: Arc<ScriptedTransport>) -> ChannelGroup {
    logship_core::logging::init_test();
    let install_id = store.install_id().unwrap_or_else(|_| Uuid::new_v4());
    let sender = Arc::new(Sender::new(transport, &ingestion_config(), install_id));
    ChannelGroup::new(store, sender)
}

/// Channel group over a fresh in-memory store.
pub fn memory_group(transport: Arc<ScriptedTransport>) -> ChannelGroup {
    group_with(Arc::new(LogStore::open_in_memory(300).unwrap()), transport)
}

/// Give spawned tasks time to run. Under a paused clock this auto-advances.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Records every callback as a short string.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
    deny_type: Option<String>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Listener that filters out logs of one type
    pub fn denying(log_type: &str) -> Arc<Self> {
        Arc::new(Self {
            deny_type: Some(log_type.to_string()),
            ..Default::default()
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ChannelListener for RecordingListener {
    fn before_persist(&self, group_id: &str, log: &mut Log) -> bool {
        self.push(format!("before_persist:{}:{}", group_id, log.log_type));
        self.deny_type.as_deref() != Some(log.log_type.as_str())
    }

    fn after_persist(&self, group_id: &str, log: &Log, success: bool) {
        self.push(format!("after_persist:{}:{}:{}", group_id, log.log_type, success));
    }

    fn on_filtered(&self, group_id: &str, log: &Log) {
        self.push(format!("filtered:{}:{}", group_id, log.log_type));
    }

    fn before_send(&self, batch: &LogContainer) {
        self.push(format!("before_send:{}:{}", batch.group_id, batch.len()));
    }

    fn on_send_succeeded(&self, batch: &LogContainer) {
        self.push(format!("send_succeeded:{}:{}", batch.group_id, batch.len()));
    }

    fn on_send_failed(&self, batch: &LogContainer, error: &DeliveryError) {
        let kind = if error.is_fatal() { "fatal" } else { "error" };
        self.push(format!("send_failed:{}:{}:{}", batch.group_id, batch.len(), kind));
    }

    fn on_log_succeeded(&self, group_id: &str, log: &Log) {
        self.push(format!("log_succeeded:{}:{}", group_id, log.log_type));
    }

    fn on_log_failed(&self, group_id: &str, log: &Log, _error: &DeliveryError) {
        self.push(format!("log_failed:{}:{}", group_id, log.log_type));
    }

    fn on_suspended(&self, group_id: &str) {
        self.push(format!("suspended:{}", group_id));
    }

    fn on_resumed(&self, group_id: &str) {
        self.push(format!("resumed:{}", group_id));
    }

    fn on_enabled_changed(&self, group_id: &str, enabled: bool, data_deleted: bool) {
        self.push(format!("enabled:{}:{}:{}", group_id, enabled, data_deleted));
    }
}
