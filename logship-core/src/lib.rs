//! # logship-core
//!
//! Core library for logship - a durable telemetry channel.
//!
//! This library provides:
//! - A SQLite-backed, capacity-bounded log queue keyed by group
//! - Per-group batch assembly with size and timer flush triggers
//! - HTTP delivery with an escalating retry table
//! - Suspend/resume and enable/disable fan-out with listener callbacks
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Data flows producer → [`ChannelGroup`] → [`ChannelUnit`] → [`LogStore`]
//! → batch claimed → [`Sender`] → ingestion service. A successful or
//! non-recoverable delivery deletes the batch; an abandoned one returns its
//! logs to pending.
//!
//! ## Example
//!
//! ```rust,no_run
//! use logship_core::{ChannelGroup, Config, Log};
//!
//! # async fn run() -> logship_core::Result<()> {
//! let config = Config::load()?;
//! let group = ChannelGroup::from_config(&config, None)?;
//!
//! let accepted = group
//!     .enqueue(Log::new("event").with_property("name", "launch"), "analytics")
//!     .await;
//! assert!(accepted);
//!
//! group.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use channel::{
    ChannelGroup, ChannelListener, ChannelUnit, Completion, SuspendReason, UnitState,
};
pub use config::{ChannelUnitConfiguration, Config};
pub use db::{GroupStats, LogStore};
pub use error::{Error, Result};
pub use ordered_map::OrderedMap;
pub use sender::{DeliveryError, Outcome, Sender, SenderEvent, TokenCache, TokenProvider};
pub use types::*;

// Public modules
pub mod channel;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod ordered_map;
pub mod sender;
pub mod types;
