//! Gateway control loop.
//!
//! Store and IP events become [`queue::Task`]s on a rate-limited queue. A
//! single worker drains it through [`reconcile::GatewayController`], which
//! decides between a dynamic upstream push and a full validated reload.
//! [`gateway::run`] wires every component together and owns startup and
//! shutdown ordering.

pub mod gateway;
pub mod http;
pub mod lifecycle;
pub mod queue;
pub mod reconcile;

#[cfg(test)]
mod testutil;

pub use gateway::{GatewayOptions, check_ports_free, run};
pub use http::{HttpState, router};
pub use lifecycle::{GatewayState, Lifecycle};
pub use queue::{Task, TaskQueue, TaskReason};
pub use reconcile::{GatewayController, LocalIps, Outcome};
