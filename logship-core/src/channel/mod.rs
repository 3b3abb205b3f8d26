//! Batching and lifecycle fan-out
//!
//! - [`ChannelGroup`]: composition root owning the store, the sender, and
//!   one unit per group
//! - [`ChannelUnit`]: per-group batch assembler running on its own task
//! - [`ChannelListener`]: outcome notifications for external collaborators

mod group;
mod listener;
mod unit;

pub use group::ChannelGroup;
pub use listener::{ChannelListener, ListenerRegistry};
pub use unit::{ChannelUnit, Completion, SuspendReason, UnitService, UnitState};
