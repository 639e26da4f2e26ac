//! External L4 port allocation.
//!
//! Each L4-exposed `(service, container port)` pair gets one port from a
//! bounded range. Allocations are durable and stable across restarts.

pub mod allocator;
pub mod store;

pub use allocator::{PortAllocator, next_candidate};
pub use store::{PortAllocation, PortAllocationStore, StatePortStore};
