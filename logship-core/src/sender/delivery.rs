//! Delivery calls and the retry state machine

use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::logging::redact;
use crate::ordered_map::OrderedMap;
use crate::types::LogContainer;

use super::auth::TokenProvider;
use super::transport::{IngestionRequest, Transport};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Why a delivery call failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    /// Transient HTTP status (408, 429, most 5xx)
    #[error("retryable HTTP status {0}")]
    RetryableStatus(u16),

    /// Status that will not succeed on retry
    #[error("non-recoverable HTTP status {0}")]
    NonRecoverableStatus(u16),

    /// Authorization rejected; every unit sharing the sender is suspended
    #[error("authorization rejected with HTTP status {0}")]
    FatalAuth(u16),

    /// No response received
    #[error("transport error: {0}")]
    Transport(String),

    /// Retry budget spent on transient failures
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<DeliveryError>,
    },

    /// The batch could not be encoded
    #[error("failed to serialize batch: {0}")]
    Serialization(String),
}

impl DeliveryError {
    /// Whether this error stops the whole group rather than just the batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeliveryError::FatalAuth(_))
    }
}

/// Terminal result of one delivery call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The service acknowledged the batch
    Success,
    /// The batch will never be delivered
    Failed(DeliveryError),
    /// The call was abandoned before a terminal response
    Cancelled,
}

/// Response classes driving the retry state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Retryable,
    NonRecoverable,
    Fatal,
}

/// Classify an HTTP status code.
pub fn classify(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 | 403 => StatusClass::Fatal,
        408 | 429 => StatusClass::Retryable,
        // Not implemented / HTTP version not supported will not change on retry
        501 | 505 => StatusClass::NonRecoverable,
        500..=599 => StatusClass::Retryable,
        _ => StatusClass::NonRecoverable,
    }
}

/// Signals published by the sender.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderEvent {
    /// No new requests will be issued until resumed
    Paused,
    Resumed,
    /// A batch was rejected for authorization reasons
    FatalError { group_id: String, status: u16 },
}

/// Escalating backoff table.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub intervals: Vec<Duration>,
    pub max_retries: usize,
}

impl RetryPolicy {
    pub fn new(intervals: Vec<Duration>, max_retries: usize) -> Self {
        Self {
            intervals,
            max_retries,
        }
    }

    pub fn from_config(config: &IngestionConfig) -> Self {
        Self::new(config.retry_intervals(), config.max_retries)
    }

    /// Delay before the `n`th retry (1-based). The last interval repeats.
    pub fn delay(&self, n: usize) -> Duration {
        if self.intervals.is_empty() {
            return Duration::ZERO;
        }
        let index = n.saturating_sub(1).min(self.intervals.len() - 1);
        self.intervals[index]
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    log_url: String,
    api_path: String,
}

impl Endpoint {
    fn url(&self) -> String {
        format!("{}{}", self.log_url.trim_end_matches('/'), self.api_path)
    }
}

/// Shared delivery engine for every channel unit of a group.
pub struct Sender {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    endpoint: RwLock<Endpoint>,
    install_id: Uuid,
    app_secret: Option<String>,
    tokens: Option<Arc<dyn TokenProvider>>,
    paused: watch::Sender<bool>,
    events: broadcast::Sender<SenderEvent>,
}

impl Sender {
    pub fn new(transport: Arc<dyn Transport>, config: &IngestionConfig, install_id: Uuid) -> Self {
        let (paused, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            transport,
            policy: RetryPolicy::from_config(config),
            endpoint: RwLock::new(Endpoint {
                log_url: config.log_url.clone(),
                api_path: config.api_path.clone(),
            }),
            install_id,
            app_secret: config.app_secret.clone(),
            tokens: None,
            paused,
            events,
        }
    }

    /// Attach a bearer token source.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(provider);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn install_id(&self) -> Uuid {
        self.install_id
    }

    /// Receive pause, resume and fatal error signals.
    pub fn subscribe(&self) -> broadcast::Receiver<SenderEvent> {
        self.events.subscribe()
    }

    /// Stop issuing new requests. Requests already on the wire complete.
    pub fn pause(&self) {
        let changed = self.paused.send_if_modified(|paused| !std::mem::replace(paused, true));
        if changed {
            tracing::info!("Sender paused");
            let _ = self.events.send(SenderEvent::Paused);
        }
    }

    pub fn resume(&self) {
        let changed = self.paused.send_if_modified(|paused| std::mem::replace(paused, false));
        if changed {
            tracing::info!("Sender resumed");
            let _ = self.events.send(SenderEvent::Resumed);
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Point subsequent requests at a different ingestion host.
    pub fn set_log_url(&self, log_url: impl Into<String>) {
        let log_url = log_url.into();
        if let Ok(mut endpoint) = self.endpoint.write() {
            tracing::info!(from = %endpoint.log_url, to = %log_url, "Log URL changed");
            endpoint.log_url = log_url;
        }
    }

    /// Full URL requests are posted to.
    pub fn url(&self) -> String {
        match self.endpoint.read() {
            Ok(endpoint) => endpoint.url(),
            Err(poisoned) => poisoned.into_inner().url(),
        }
    }

    /// Deliver one batch.
    ///
    /// Issues at most one request at a time for the container and retries
    /// transient failures up to `retry_budget` times. Cancellation is honored
    /// before each attempt and during retry waits; a request already on the
    /// wire is allowed to finish, but its retryable failure then resolves as
    /// [`Outcome::Cancelled`].
    pub async fn send(
        &self,
        container: &LogContainer,
        retry_budget: usize,
        cancel: &CancellationToken,
    ) -> Outcome {
        let body = match container.to_payload() {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(
                    group_id = %container.group_id,
                    batch_id = %container.batch_id,
                    error = %e,
                    "Failed to serialize batch"
                );
                return Outcome::Failed(DeliveryError::Serialization(e.to_string()));
            }
        };

        let mut retry_count = 0usize;

        loop {
            if !self.wait_until_resumed(cancel).await || cancel.is_cancelled() {
                tracing::debug!(batch_id = %container.batch_id, retry_count, "Delivery cancelled");
                return Outcome::Cancelled;
            }

            let request = self.build_request(container, body.clone());
            tracing::debug!(
                group_id = %container.group_id,
                batch_id = %container.batch_id,
                url = %request.url,
                logs = container.len(),
                retry_count,
                "Sending batch"
            );

            let failure = match self.transport.post(request).await {
                Ok(response) => match classify(response.status) {
                    StatusClass::Success => {
                        tracing::debug!(
                            batch_id = %container.batch_id,
                            status = response.status,
                            "Batch delivered"
                        );
                        return Outcome::Success;
                    }
                    StatusClass::Retryable => DeliveryError::RetryableStatus(response.status),
                    StatusClass::NonRecoverable => {
                        tracing::warn!(
                            group_id = %container.group_id,
                            batch_id = %container.batch_id,
                            status = response.status,
                            body = %response.body,
                            "Batch rejected"
                        );
                        return Outcome::Failed(DeliveryError::NonRecoverableStatus(
                            response.status,
                        ));
                    }
                    StatusClass::Fatal => {
                        tracing::error!(
                            group_id = %container.group_id,
                            batch_id = %container.batch_id,
                            status = response.status,
                            "Authorization rejected, suspending group"
                        );
                        let _ = self.events.send(SenderEvent::FatalError {
                            group_id: container.group_id.clone(),
                            status: response.status,
                        });
                        return Outcome::Failed(DeliveryError::FatalAuth(response.status));
                    }
                },
                Err(message) => DeliveryError::Transport(message),
            };

            retry_count += 1;
            if retry_count > retry_budget {
                tracing::warn!(
                    group_id = %container.group_id,
                    batch_id = %container.batch_id,
                    attempts = retry_count,
                    error = %failure,
                    "Retries exhausted, giving up on batch"
                );
                return Outcome::Failed(DeliveryError::RetriesExhausted {
                    attempts: retry_count,
                    last: Box::new(failure),
                });
            }

            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            let delay = self.policy.delay(retry_count);
            tracing::warn!(
                group_id = %container.group_id,
                batch_id = %container.batch_id,
                retry_count,
                delay_secs = delay.as_secs_f64(),
                error = %failure,
                "Transient delivery failure, scheduling retry"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(batch_id = %container.batch_id, "Retry cancelled");
                    return Outcome::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Wait while paused. Returns `false` if cancelled first.
    async fn wait_until_resumed(&self, cancel: &CancellationToken) -> bool {
        let mut paused = self.paused.subscribe();
        loop {
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn build_request(&self, container: &LogContainer, body: Vec<u8>) -> IngestionRequest {
        let mut headers = OrderedMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("Install-ID".to_string(), self.install_id.to_string());

        if let Some(secret) = &self.app_secret {
            headers.insert("App-Secret".to_string(), secret.clone());
        }

        if let Some(token) = self.tokens.as_ref().and_then(|p| p.token()) {
            tracing::trace!(
                batch_id = %container.batch_id,
                token = %redact(&token),
                "Attaching bearer token"
            );
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }

        IngestionRequest {
            url: self.url(),
            headers,
            body,
        }
    }
}
