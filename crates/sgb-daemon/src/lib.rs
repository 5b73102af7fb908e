//! Daemon wiring: inbound routing, periodic sync, and the collaborator
//! surface (start/stop/health/list_groups) consumed by the dashboard.

pub mod handlers;
pub mod router;

pub use router::{Daemon, GroupSummary, Health};
