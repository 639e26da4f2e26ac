//! Ingress annotation keys.

/// Prefix shared by every recognized annotation.
pub const ANNOTATION_PREFIX: &str = "nginx.ingress.kubernetes.io";

pub const HEADER: &str = "header";
pub const COOKIE: &str = "cookie";
pub const WEIGHT: &str = "weight";
pub const REWRITE: &str = "rewrite";
pub const REWRITE_TARGET: &str = "rewrite-target";
pub const APP_ROOT: &str = "app-root";
pub const L4_ENABLE: &str = "l4-enable";
pub const L4_HOST: &str = "l4-host";
pub const L4_PORT: &str = "l4-port";
pub const UPSTREAM_HASH_BY: &str = "upstream-hash-by";
pub const LB_TYPE: &str = "lb-type";
pub const PROXY: &str = "proxy";
pub const PROXY_CONNECT_TIMEOUT: &str = "proxy-connect-timeout";
pub const PROXY_SEND_TIMEOUT: &str = "proxy-send-timeout";
pub const PROXY_READ_TIMEOUT: &str = "proxy-read-timeout";
pub const PROXY_BODY_SIZE: &str = "proxy-body-size";
pub const PROXY_BUFFER_SIZE: &str = "proxy-buffer-size";
pub const PROXY_BUFFERS_NUMBER: &str = "proxy-buffers-number";
pub const PROXY_BUFFERING: &str = "proxy-buffering";
pub const PROXY_REQUEST_BUFFERING: &str = "proxy-request-buffering";
pub const PROXY_NEXT_UPSTREAM: &str = "proxy-next-upstream";
pub const PROXY_NEXT_UPSTREAM_TRIES: &str = "proxy-next-upstream-tries";
pub const PROXY_NEXT_UPSTREAM_TIMEOUT: &str = "proxy-next-upstream-timeout";
pub const UPSTREAM_MAX_FAILS: &str = "upstream-max-fails";
pub const UPSTREAM_FAIL_TIMEOUT: &str = "upstream-fail-timeout";

/// Full annotation key for a short name.
pub fn key(name: &str) -> String {
    format!("{}/{}", ANNOTATION_PREFIX, name)
}
