//! Delivery of batches to the ingestion service
//!
//! The [`Sender`] turns a claimed [`LogContainer`](crate::types::LogContainer)
//! into one logical delivery attempt: it posts the batch, classifies the
//! response, and retries transient failures on a fixed escalating backoff
//! table until it succeeds, gives up, or is cancelled.
//!
//! ## Architecture
//!
//! - [`Transport`] is the HTTP seam. [`HttpTransport`] is the production
//!   implementation; tests substitute scripted transports.
//! - [`TokenProvider`] supplies an optional bearer token. [`TokenCache`] is
//!   the default, settable implementation.
//! - The sender can be paused externally (connectivity loss, missing token).
//!   Pausing and fatal authorization failures are published as
//!   [`SenderEvent`]s so the channel group can suspend its units.
//!
//! ## Configuration
//!
//! ```toml
//! [ingestion]
//! log_url = "https://in.logship.dev"
//! retry_intervals_secs = [10, 30, 60, 120]
//! max_retries = 4
//! ```

mod auth;
mod delivery;
mod transport;

pub use auth::{TokenCache, TokenProvider};
pub use delivery::{
    classify, DeliveryError, Outcome, RetryPolicy, Sender, SenderEvent, StatusClass,
};
pub use transport::{HttpTransport, IngestionRequest, IngestionResponse, Transport};
