use std::collections::BTreeMap;

use pkg_types::ingress::Ingress;

use crate::{Annotation, AnnotationError, annotation_value};
use pkg_constants::annotations::{COOKIE, HEADER};

/// Parse `k1=v1;k2=v2`. Whitespace is stripped, pairs split on the first `=`,
/// and entries with an empty key or value are discarded.
pub fn parse_kv(raw: &str) -> BTreeMap<String, String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    compact
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn parse_condition(ingress: &Ingress, name: &str) -> Result<BTreeMap<String, String>, AnnotationError> {
    let raw = annotation_value(ingress, name).ok_or(AnnotationError::Missing)?;
    let map = parse_kv(raw);
    if map.is_empty() {
        return Err(AnnotationError::Missing);
    }
    Ok(map)
}

pub(crate) fn header(ingress: &Ingress) -> Result<Annotation, AnnotationError> {
    parse_condition(ingress, HEADER).map(Annotation::Header)
}

pub(crate) fn cookie(ingress: &Ingress) -> Result<Annotation, AnnotationError> {
    parse_condition(ingress, COOKIE).map(Annotation::Cookie)
}
