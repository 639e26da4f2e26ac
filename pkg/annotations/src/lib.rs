//! Ingress annotation pipeline.
//!
//! [`extract`] runs a fixed registry of parsers over an ingress and merges
//! their outputs into one [`IngressAnnotations`]. Every parser has the same
//! signature and reports one of: a value, not present, location denied, or
//! invalid.

pub mod balance;
pub mod kv;
pub mod l4;
pub mod proxy;
pub mod rewrite;
pub mod size;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use pkg_constants::annotations as keys;
use pkg_types::ingress::Ingress;

pub use balance::LoadBalancing;
pub use kv::parse_kv;
pub use l4::L4Config;
pub use proxy::ProxyConfig;
pub use rewrite::{RewriteConfig, RewriteRule};

/// Outcome of a parser that produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotationError {
    #[error("annotation not present")]
    Missing,
    #[error("location denied: {0}")]
    LocationDenied(String),
    #[error("invalid annotation: {0}")]
    Invalid(String),
}

/// One parsed annotation.
#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    Header(BTreeMap<String, String>),
    Cookie(BTreeMap<String, String>),
    Weight(u32),
    Rewrite(RewriteConfig),
    L4(L4Config),
    UpstreamHashBy(String),
    LbType(LoadBalancing),
    Proxy(ProxyConfig),
}

pub type Parser = fn(&Ingress) -> Result<Annotation, AnnotationError>;

/// Parser registry, keyed by annotation name.
pub const PARSERS: &[(&str, Parser)] = &[
    (keys::HEADER, kv::header),
    (keys::COOKIE, kv::cookie),
    (keys::WEIGHT, balance::weight),
    (keys::REWRITE, rewrite::parse),
    (keys::L4_ENABLE, l4::parse),
    (keys::UPSTREAM_HASH_BY, balance::upstream_hash_by),
    (keys::LB_TYPE, balance::lb_type),
    (keys::PROXY, proxy::parse),
];

/// Typed view of an ingress's annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressAnnotations {
    pub header: Option<BTreeMap<String, String>>,
    pub cookie: Option<BTreeMap<String, String>>,
    pub weight: u32,
    pub rewrite: Option<RewriteConfig>,
    pub l4: Option<L4Config>,
    pub upstream_hash_by: Option<String>,
    pub lb_type: LoadBalancing,
    pub proxy: ProxyConfig,
    /// First location-denied reason; the ingress's locations are not rendered.
    pub denied: Option<String>,
}

impl Default for IngressAnnotations {
    fn default() -> Self {
        Self {
            header: None,
            cookie: None,
            weight: 1,
            rewrite: None,
            l4: None,
            upstream_hash_by: None,
            lb_type: LoadBalancing::RoundRobin,
            proxy: ProxyConfig::default(),
            denied: None,
        }
    }
}

impl IngressAnnotations {
    fn merge(&mut self, annotation: Annotation) {
        match annotation {
            Annotation::Header(m) => self.header = Some(m),
            Annotation::Cookie(m) => self.cookie = Some(m),
            Annotation::Weight(w) => self.weight = w,
            Annotation::Rewrite(r) => self.rewrite = Some(r),
            Annotation::L4(l) => self.l4 = Some(l),
            Annotation::UpstreamHashBy(h) => self.upstream_hash_by = Some(h),
            Annotation::LbType(t) => self.lb_type = t,
            Annotation::Proxy(p) => self.proxy = p,
        }
    }
}

/// Value of `nginx.ingress.kubernetes.io/<name>`.
pub(crate) fn annotation_value<'a>(ingress: &'a Ingress, name: &str) -> Option<&'a str> {
    ingress.annotation(&keys::key(name))
}

/// Run every registered parser over `ingress`.
pub fn extract(ingress: &Ingress) -> IngressAnnotations {
    let mut out = IngressAnnotations::default();
    for (name, parser) in PARSERS {
        match parser(ingress) {
            Ok(annotation) => out.merge(annotation),
            Err(AnnotationError::Missing) => {}
            Err(AnnotationError::LocationDenied(reason)) => {
                if out.denied.is_none() {
                    out.denied = Some(reason);
                } else {
                    warn!(ingress = %ingress.key(), annotation = *name, "Additional location denial dropped: {}", reason);
                }
            }
            Err(AnnotationError::Invalid(reason)) => {
                warn!(ingress = %ingress.key(), annotation = *name, "Dropping invalid annotation: {}", reason);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_types::ingress::IngressSpec;

    fn ingress(annotations: &[(&str, &str)]) -> Ingress {
        Ingress {
            id: "ing-1".to_string(),
            name: "web".to_string(),
            namespace: "default".to_string(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (keys::key(k), v.to_string()))
                .collect(),
            spec: IngressSpec::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn no_annotations_yield_defaults() {
        let parsed = extract(&ingress(&[]));
        assert_eq!(parsed, IngressAnnotations::default());
        assert_eq!(parsed.weight, 1);
    }

    #[test]
    fn foreign_prefix_is_ignored() {
        let mut ing = ingress(&[]);
        ing.annotations.insert("other.io/weight".to_string(), "7".to_string());
        assert_eq!(extract(&ing).weight, 1);
    }

    #[test]
    fn header_and_cookie_conditions() {
        let parsed = extract(&ingress(&[("header", "x-canary=always"), ("cookie", "version=beta")]));
        assert_eq!(parsed.header.unwrap()["x-canary"], "always");
        assert_eq!(parsed.cookie.unwrap()["version"], "beta");

        let parsed = extract(&ingress(&[("cookie", ";=;")]));
        assert!(parsed.cookie.is_none());
    }

    #[test]
    fn weight_falls_back_to_one() {
        assert_eq!(extract(&ingress(&[("weight", "5")])).weight, 5);
        assert_eq!(extract(&ingress(&[("weight", "heavy")])).weight, 1);
        assert_eq!(extract(&ingress(&[("weight", "-3")])).weight, 1);
    }

    #[test]
    fn l4_port_must_be_in_range() {
        let parsed = extract(&ingress(&[("l4-enable", "true"), ("l4-port", "32145")]));
        assert_eq!(
            parsed.l4,
            Some(L4Config {
                host: "0.0.0.0".to_string(),
                port: 32145
            })
        );

        for port in ["0", "65536", "-1", "abc"] {
            let parsed = extract(&ingress(&[("l4-enable", "true"), ("l4-port", port)]));
            assert!(parsed.l4.is_none(), "port {port} accepted");
        }
        let parsed = extract(&ingress(&[("l4-enable", "true")]));
        assert!(parsed.l4.is_none());
        let parsed = extract(&ingress(&[("l4-enable", "false"), ("l4-port", "80")]));
        assert!(parsed.l4.is_none());
    }

    #[test]
    fn l4_host_is_validated() {
        let parsed = extract(&ingress(&[
            ("l4-enable", "true"),
            ("l4-host", "10.0.0.5"),
            ("l4-port", "65535"),
        ]));
        assert_eq!(parsed.l4.unwrap().host, "10.0.0.5");

        let parsed = extract(&ingress(&[
            ("l4-enable", "true"),
            ("l4-host", "not-an-ip"),
            ("l4-port", "8000"),
        ]));
        assert!(parsed.l4.is_none());
    }

    #[test]
    fn rewrite_rules_and_denial() {
        let parsed = extract(&ingress(&[
            ("rewrite", r#"[{"regex":"^/api/(.*)$","replacement":"/$1","flag":"break"}]"#),
            ("app-root", "/app"),
        ]));
        let rewrite = parsed.rewrite.unwrap();
        assert_eq!(rewrite.rules.len(), 1);
        assert_eq!(rewrite.rules[0].flag.as_deref(), Some("break"));
        assert_eq!(rewrite.app_root.as_deref(), Some("/app"));
        assert!(parsed.denied.is_none());

        let parsed = extract(&ingress(&[("rewrite-target", "/x; return 200")]));
        assert!(parsed.rewrite.is_none());
        assert!(parsed.denied.unwrap().contains("rewrite-target"));
    }

    #[test]
    fn rewrite_values_that_break_the_directive_are_denied() {
        for rules in [
            r#"[{"regex":"^/x","replacement":"/a b"}]"#,
            r#"[{"regex":"^/x","replacement":"/a\"b"}]"#,
            r#"[{"regex":"^/x","replacement":"/a'b"}]"#,
            r#"[{"regex":"^/x","replacement":"/a\\b"}]"#,
            r#"[{"regex":"^/\"x","replacement":"/a"}]"#,
        ] {
            let parsed = extract(&ingress(&[("rewrite", rules)]));
            assert!(parsed.rewrite.is_none(), "{rules}");
            assert!(parsed.denied.is_some(), "{rules}");
        }

        let parsed = extract(&ingress(&[("rewrite-target", "/new path")]));
        assert!(parsed.denied.unwrap().contains("rewrite-target"));
        let parsed = extract(&ingress(&[("app-root", "/app\tx")]));
        assert!(parsed.denied.unwrap().contains("app-root"));
    }

    #[test]
    fn empty_rewrite_replacement_is_dropped() {
        let parsed = extract(&ingress(&[("rewrite", r#"[{"regex":"^/x","replacement":""}]"#)]));
        assert!(parsed.rewrite.is_none());
        assert!(parsed.denied.is_none());
    }

    #[test]
    fn rewrite_regex_may_use_quantifiers() {
        let parsed = extract(&ingress(&[(
            "rewrite",
            r#"[{"regex":"^/v[0-9]{2}/(.*)$","replacement":"/$1"}]"#,
        )]));
        assert!(parsed.denied.is_none());
        assert_eq!(parsed.rewrite.unwrap().rules[0].regex, "^/v[0-9]{2}/(.*)$");
    }

    #[test]
    fn malformed_rewrite_is_dropped() {
        let parsed = extract(&ingress(&[("rewrite", "not json")]));
        assert!(parsed.rewrite.is_none());
        assert!(parsed.denied.is_none());

        let parsed = extract(&ingress(&[("rewrite", r#"[{"regex":"/","replacement":"/","flag":"jump"}]"#)]));
        assert!(parsed.rewrite.is_none());
    }

    #[test]
    fn proxy_tuning_keeps_defaults_for_bad_values() {
        let parsed = extract(&ingress(&[
            ("proxy-connect-timeout", "10"),
            ("proxy-body-size", "8g"),
            ("proxy-buffer-size", "8g"),
            ("proxy-buffering", "on"),
            ("proxy-next-upstream", "error   timeout http_502"),
            ("upstream-max-fails", "3"),
        ]));
        let proxy = parsed.proxy;
        assert_eq!(proxy.connect_timeout, 10);
        assert_eq!(proxy.body_size, "8g");
        assert_eq!(proxy.buffer_size, "4k");
        assert!(proxy.buffering);
        assert_eq!(proxy.next_upstream, "error timeout http_502");
        assert_eq!(proxy.max_fails, Some(3));
        assert_eq!(proxy.fail_timeout, None);
    }

    #[test]
    fn hash_by_and_lb_type() {
        let parsed = extract(&ingress(&[
            ("upstream-hash-by", "$request_uri"),
            ("lb-type", "ConsistentHash"),
        ]));
        assert_eq!(parsed.upstream_hash_by.as_deref(), Some("$request_uri"));
        assert_eq!(parsed.lb_type, LoadBalancing::ConsistentHash);

        let parsed = extract(&ingress(&[("upstream-hash-by", "  ")]));
        assert!(parsed.upstream_hash_by.is_none());
    }
}
