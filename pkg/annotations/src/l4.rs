use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use pkg_constants::annotations::{L4_ENABLE, L4_HOST, L4_PORT};
use pkg_constants::network::ANY_HOST;
use pkg_types::ingress::Ingress;

use crate::{Annotation, AnnotationError, annotation_value};

/// TCP/UDP exposure of an ingress's default backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4Config {
    pub host: String,
    pub port: u16,
}

pub(crate) fn parse(ingress: &Ingress) -> Result<Annotation, AnnotationError> {
    let enabled = annotation_value(ingress, L4_ENABLE).ok_or(AnnotationError::Missing)?;
    match enabled.trim().to_ascii_lowercase().as_str() {
        "true" => {}
        "false" => return Err(AnnotationError::Missing),
        other => {
            return Err(AnnotationError::Invalid(format!(
                "l4-enable must be true or false, got {:?}",
                other
            )));
        }
    }

    let host = match annotation_value(ingress, L4_HOST).map(str::trim) {
        Some(h) if !h.is_empty() => {
            h.parse::<IpAddr>()
                .map_err(|_| AnnotationError::Invalid(format!("l4-host {:?} is not an IP address", h)))?;
            h.to_string()
        }
        _ => ANY_HOST.to_string(),
    };

    let raw_port = annotation_value(ingress, L4_PORT)
        .map(str::trim)
        .ok_or_else(|| AnnotationError::Invalid("l4-enable=true without l4-port".to_string()))?;
    let port = match raw_port.parse::<i64>() {
        Ok(p) if p > 0 && p <= 65535 => p as u16,
        _ => {
            return Err(AnnotationError::Invalid(format!(
                "l4-port {:?} outside (0, 65535]",
                raw_port
            )));
        }
    };

    Ok(Annotation::L4(L4Config { host, port }))
}
