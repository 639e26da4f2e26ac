use serde::{Deserialize, Serialize};

use pkg_constants::annotations::{LB_TYPE, UPSTREAM_HASH_BY, WEIGHT};
use pkg_types::ingress::Ingress;
use tracing::debug;

use crate::{Annotation, AnnotationError, annotation_value};

/// Load-balancing discipline of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    ConsistentHash,
    CookieSticky,
}

impl LoadBalancing {
    /// Unknown names fall back to round robin.
    pub fn from_annotation(value: &str) -> Self {
        match value.trim() {
            "ConsistentHash" | "consistent_hash" | "consistent-hash" => LoadBalancing::ConsistentHash,
            "CookieSessionAffinity" | "cookie_session_affinity" | "sticky" => {
                LoadBalancing::CookieSticky
            }
            _ => LoadBalancing::RoundRobin,
        }
    }

    /// Name understood by the proxy's lua balancer.
    pub fn balancer_name(&self) -> &'static str {
        match self {
            LoadBalancing::RoundRobin => "round_robin",
            LoadBalancing::ConsistentHash => "chash",
            LoadBalancing::CookieSticky => "sticky",
        }
    }
}

pub(crate) fn weight(ingress: &Ingress) -> Result<Annotation, AnnotationError> {
    let raw = annotation_value(ingress, WEIGHT).ok_or(AnnotationError::Missing)?;
    let weight = raw.trim().parse::<u32>().unwrap_or_else(|_| {
        debug!(ingress = %ingress.key(), "Unparsable weight {:?}, using 1", raw);
        1
    });
    Ok(Annotation::Weight(weight))
}

pub(crate) fn lb_type(ingress: &Ingress) -> Result<Annotation, AnnotationError> {
    let raw = annotation_value(ingress, LB_TYPE).ok_or(AnnotationError::Missing)?;
    Ok(Annotation::LbType(LoadBalancing::from_annotation(raw)))
}

pub(crate) fn upstream_hash_by(ingress: &Ingress) -> Result<Annotation, AnnotationError> {
    match annotation_value(ingress, UPSTREAM_HASH_BY).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(Annotation::UpstreamHashBy(v.to_string())),
        _ => Err(AnnotationError::Missing),
    }
}
