use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A TTL-bound claim in the coordination store.
/// Stored at `/registry/leases/<lease-id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique lease identifier
    pub id: String,
    /// The gateway instance holding this lease
    pub holder_id: String,
    /// When the lease was first granted
    pub acquired_at: DateTime<Utc>,
    /// When the lease was last renewed
    pub renew_at: DateTime<Utc>,
    /// Lease time-to-live in seconds
    pub ttl_seconds: u64,
    /// Keys attached to this lease; deleted when it is revoked or expires.
    #[serde(default)]
    pub keys: Vec<String>,
}

impl Lease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.renew_at + chrono::Duration::seconds(self.ttl_seconds as i64)
    }

    /// Check if this lease has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}
