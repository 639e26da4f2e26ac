//! Gateway store.
//!
//! Caches the watched cluster objects and derives the gateway's virtual
//! services, pools and certificates from them on demand. Mutations are
//! announced on a bounded broadcast ring consumed by the controller.

pub mod derive;
pub mod events;
pub mod model;
pub mod store;
pub mod tls;
pub mod watcher;

#[cfg(test)]
mod fixtures;

pub use derive::DeriveOptions;
pub use events::{StoreAction, StoreEvent};
pub use model::{
    Condition, ConditionKind, Location, Node, Pool, Protocol, Snapshot, SslCert, VirtualService,
};
pub use store::Store;
pub use watcher::{ClusterWatcher, WatcherConfig};
