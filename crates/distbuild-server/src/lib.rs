//! Distbuild Server
//!
//! The central scheduler: accepts apply requests keyed by (project, scene),
//! launches a worker service for each accepted task through the resource
//! operator, reports queue rank and endpoints, and reaps tasks whose
//! booster stopped heartbeating. Release is idempotent.

pub mod error;
pub mod http;
pub mod tasks;

pub use error::ServerError;
pub use http::{create_router, ServerState};
pub use tasks::{ServerConfig, Task, TaskManager};
