//! Distbuild Controller
//!
//! The per-host daemon that multiplexes concurrent booster sessions: it
//! owns the three-class local slot pool, the remote worker registry, the
//! work-handle table with heartbeat reaping and the remain-time shutdown
//! timer, and serves the loopback HTTP surface the boosters talk to.

pub mod dispatch;
pub mod error;
pub mod http;
pub mod local;
pub mod remote;
pub mod slots;
pub mod work;
pub mod workers;

pub use dispatch::Dispatcher;
pub use error::ControllerError;
pub use http::{create_router, ControllerState};
pub use slots::{SlotGuard, SlotPool};
pub use work::{WorkEntry, WorkManager};
pub use workers::{WorkerEndpoint, WorkerRegistry};

/// Fixed loopback port when dynamic ports are disabled.
pub const CONTROLLER_PORT: u16 = 30117;
