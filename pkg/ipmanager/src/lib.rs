//! Host IP membership.
//!
//! [`IpManager`] enumerates the host's addresses, publishes each one under a
//! TTL-bound lease in the coordination store and broadcasts [`IpEvent`]s so
//! the controller can recompute gateway policy.

pub mod manager;
pub mod source;

pub use manager::{IpEvent, IpLease, IpManager, IpManagerConfig, IpRecord, ip_key};
pub use source::{HostIpSource, InterfaceIpSource, StaticIpSource};
