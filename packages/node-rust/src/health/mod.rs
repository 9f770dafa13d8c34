//! Liveness signalling between nodes and reactions to lost dependencies.
//!
//! Workers run a [`Heart`] that publishes [`courier_core::Heartbeat`]s on a
//! topic; a [`HeartbeatMonitor`] on the other side records them. When a
//! processor reports a [`crate::error::ComponentUnavailableError`], the
//! [`UnavailableHandler`] picks the configured reaction.

pub mod actions;
pub mod heart;
pub mod monitor;

pub use actions::{
    CompositeAction, DrainAction, TerminateAction, UnavailableAction, UnavailableHandler,
};
pub use heart::{Heart, HeartbeatReport, HeartbeatSource, NodeHeartbeatSource};
pub use monitor::{HeartbeatDao, HeartbeatMonitor, InMemoryHeartbeatDao};
