//! Network-related constants.

/// Default plain HTTP listen port of the proxy.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS listen port of the proxy.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Port of the proxy's local stream configuration socket (TCP/UDP backends).
pub const DEFAULT_STREAM_PORT: u16 = 18081;

/// Port of the proxy's local status server (`/healthz`, `/config/backends`).
pub const DEFAULT_STATUS_PORT: u16 = 18080;

/// Port the controller serves `/healthz`, `/metrics` and `/v1/ports` on.
pub const DEFAULT_HEALTH_PORT: u16 = 10254;

/// Port of the local monitor socket fed by the proxy's log phase.
pub const DEFAULT_MONITOR_PORT: u16 = 18082;

/// Default cluster API server address.
pub const DEFAULT_API_ADDR: &str = "http://127.0.0.1:6443";

/// Path on the status port that accepts the dynamic HTTP backend table.
pub const BACKENDS_PATH: &str = "/config/backends";

/// Path on the status port answered by the proxy when it is alive.
pub const PROXY_HEALTH_PATH: &str = "/healthz";

/// Interfaces that never carry gateway IPs unless overridden.
pub const DEFAULT_IGNORED_INTERFACES: &[&str] = &["docker0", "cni0", "flannel.1", "tunl0"];

/// Wildcard host of L4 listeners that bind every address.
pub const ANY_HOST: &str = "0.0.0.0";

/// Lower bound of the external L4 port range.
pub const DEFAULT_MIN_LB_PORT: u16 = 20001;

/// Upper bound of the external L4 port range.
pub const DEFAULT_MAX_LB_PORT: u16 = 35000;

/// Per-call timeout for HTTP, process and coordination-store calls, in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
