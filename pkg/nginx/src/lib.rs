//! Proxy configuration materializer.
//!
//! Renders a [`pkg_store::Snapshot`] into an nginx configuration tree,
//! stages and validates it, promotes it into the live directory and reloads
//! the supervised proxy. Endpoint-only changes skip all of that and go out
//! through the dynamic backend channel instead.

pub mod confdir;
pub mod dynamic;
pub mod helpers;
pub mod monitor;
pub mod render;
pub mod runtime;

pub use confdir::ConfigDir;
pub use dynamic::{DynamicPusher, UpstreamSync, backends_json};
pub use helpers::{build_lua_header_router, build_next_upstream, is_valid_byte_size};
pub use monitor::MonitorServer;
pub use render::{RenderOptions, RenderedConfig, Renderer};
pub use runtime::{NginxConfig, NginxRuntime, ProxyRuntime};
