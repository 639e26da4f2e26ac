pub mod config;
pub mod endpoint;
pub mod error;
pub mod ingress;
pub mod lease;
pub mod secret;
pub mod service;
pub mod watch;

/// Cache key of a namespaced object: `<namespace>/<name>`.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}
