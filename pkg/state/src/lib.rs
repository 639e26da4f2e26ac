//! Coordination store for the gateway.
//!
//! [`client::StateStore`] is a plain key-value store backed by SlateDB;
//! [`lease::LeaseStore`] layers TTL-bound leases on top of it so that keys
//! published by a gateway disappear when the gateway stops renewing them.

pub mod client;
pub mod lease;

pub use client::StateStore;
pub use lease::{CoordinationStore, LeaseStore};
