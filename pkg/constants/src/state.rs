//! Coordination store / lease constants.

/// Prefix under which each gateway host IP is published.
pub const GATEWAY_IP_PREFIX: &str = "/kato/gateway/ips/";

/// Prefix of persisted external port allocations, indexed by port.
pub const PORT_BY_PORT_PREFIX: &str = "/kato/gateway/ports/by-port/";

/// Prefix of persisted external port allocations, indexed by service.
pub const PORT_BY_SERVICE_PREFIX: &str = "/kato/gateway/ports/by-service/";

/// Prefix of lease records.
pub const LEASE_PREFIX: &str = "/registry/leases/";

/// How long an IP lease is valid, in seconds.
pub const IP_LEASE_TTL_SECS: u64 = 10;

/// The lease is renewed every `TTL / IP_RENEW_INTERVAL_DIVISOR` seconds.
pub const IP_RENEW_INTERVAL_DIVISOR: u64 = 2;

/// Interval of the host IP poll loop, in seconds.
pub const IP_POLL_INTERVAL_SECS: u64 = 2;

/// Capacity of the store → controller event ring.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Attempts made by the port allocator before giving up on conflicts.
pub const PORT_ALLOCATION_ATTEMPTS: usize = 3;

/// Proxy restarts tolerated inside `PROXY_RESTART_WINDOW_SECS`.
pub const PROXY_MAX_RESTARTS: usize = 5;

/// Window for counting proxy restarts, in seconds.
pub const PROXY_RESTART_WINDOW_SECS: u64 = 60;
