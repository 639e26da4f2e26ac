//! Filesystem path constants.

/// Default config file path for the gateway.
pub const DEFAULT_GATEWAY_CONFIG: &str = "/etc/kato/gateway.yaml";

/// Default data directory of the coordination store.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/kato/gateway";

/// Default proxy binary.
pub const DEFAULT_NGINX_BINARY: &str = "/usr/sbin/nginx";

/// Directory the rendered proxy configuration is written to.
pub const DEFAULT_CONF_DIR: &str = "/run/kato/nginx";

/// Name of the main proxy configuration file inside the config directory.
pub const MAIN_CONF_FILE: &str = "nginx.conf";

/// Rendered HTTP server blocks, relative to the config directory.
pub const HTTP_CONF_FILE: &str = "conf.d/http.conf";

/// Rendered stream server blocks, relative to the config directory.
pub const STREAM_CONF_FILE: &str = "conf.d/stream.conf";

/// Directory holding combined certificate + key PEM files.
pub const CERTS_DIR: &str = "certs";

/// Staging directory (inside the config directory) used for validation.
pub const STAGING_DIR: &str = ".staging";
