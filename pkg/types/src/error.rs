//! Gateway error kinds.
//!
//! Components return `anyhow::Result` and wrap a [`GatewayError`] wherever the
//! caller needs to tell failure kinds apart; the controller downcasts with
//! [`kind_of`] to decide between retrying, counting and exiting.

use thiserror::Error;

/// Failure classes the controller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Coordination store unavailable, proxy admin endpoint refused, missing secret.
    TransientUpstream,
    /// Invalid annotation, invalid byte size, conflicting L4 port.
    Validation,
    /// No free L4 port, no free lease slot.
    ResourceExhaustion,
    /// The proxy refused the generated configuration.
    ConfigGeneration,
    /// Port collision on start, store auth rejected, proxy unrecoverable.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TransientUpstream => "transient_upstream",
            ErrorKind::Validation => "validation",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::ConfigGeneration => "config_generation",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no free port in range [{min}, {max}]")]
    PortExhausted { min: u16, max: u16 },

    #[error("lease {0} not found or expired")]
    LeaseExpired(String),

    #[error("proxy rejected generated configuration: {0}")]
    ConfigRejected(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Transient(_) | GatewayError::LeaseExpired(_) => {
                ErrorKind::TransientUpstream
            }
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::PortExhausted { .. } => ErrorKind::ResourceExhaustion,
            GatewayError::ConfigRejected(_) => ErrorKind::ConfigGeneration,
            GatewayError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Classify an error chain. Errors that carry no [`GatewayError`] are transient.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    err.chain()
        .find_map(|e| e.downcast_ref::<GatewayError>())
        .map(GatewayError::kind)
        .unwrap_or(ErrorKind::TransientUpstream)
}
