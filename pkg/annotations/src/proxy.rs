use serde::{Deserialize, Serialize};
use tracing::warn;

use pkg_constants::annotations::{
    PROXY_BODY_SIZE, PROXY_BUFFER_SIZE, PROXY_BUFFERING, PROXY_BUFFERS_NUMBER,
    PROXY_CONNECT_TIMEOUT, PROXY_NEXT_UPSTREAM, PROXY_NEXT_UPSTREAM_TIMEOUT,
    PROXY_NEXT_UPSTREAM_TRIES, PROXY_READ_TIMEOUT, PROXY_REQUEST_BUFFERING, PROXY_SEND_TIMEOUT,
    UPSTREAM_FAIL_TIMEOUT, UPSTREAM_MAX_FAILS,
};
use pkg_types::ingress::Ingress;

use crate::size::{is_valid_offset, is_valid_size};
use crate::{Annotation, AnnotationError, annotation_value};

const KEYS: &[&str] = &[
    PROXY_CONNECT_TIMEOUT,
    PROXY_SEND_TIMEOUT,
    PROXY_READ_TIMEOUT,
    PROXY_BODY_SIZE,
    PROXY_BUFFER_SIZE,
    PROXY_BUFFERS_NUMBER,
    PROXY_BUFFERING,
    PROXY_REQUEST_BUFFERING,
    PROXY_NEXT_UPSTREAM,
    PROXY_NEXT_UPSTREAM_TRIES,
    PROXY_NEXT_UPSTREAM_TIMEOUT,
    UPSTREAM_MAX_FAILS,
    UPSTREAM_FAIL_TIMEOUT,
];

/// Per-location proxy tuning. Timeouts are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub connect_timeout: u32,
    pub send_timeout: u32,
    pub read_timeout: u32,
    pub body_size: String,
    pub buffer_size: String,
    pub buffers_number: u32,
    pub buffering: bool,
    pub request_buffering: bool,
    pub next_upstream: String,
    pub next_upstream_tries: u32,
    pub next_upstream_timeout: u32,
    /// Applied to every node of the pool the location routes to.
    pub max_fails: Option<u32>,
    pub fail_timeout: Option<u32>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 5,
            send_timeout: 60,
            read_timeout: 60,
            body_size: "1m".to_string(),
            buffer_size: "4k".to_string(),
            buffers_number: 4,
            buffering: false,
            request_buffering: true,
            next_upstream: "error timeout".to_string(),
            next_upstream_tries: 3,
            next_upstream_timeout: 0,
            max_fails: None,
            fail_timeout: None,
        }
    }
}

fn on_off(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" => Some(true),
        "off" | "false" => Some(false),
        _ => None,
    }
}

/// Parse every `proxy-*` / `upstream-*` tuning key. A bad value keeps the
/// default for that field and is logged; it never invalidates the rest.
pub(crate) fn parse(ingress: &Ingress) -> Result<Annotation, AnnotationError> {
    if KEYS.iter().all(|k| annotation_value(ingress, k).is_none()) {
        return Err(AnnotationError::Missing);
    }

    let ingress_key = ingress.key();
    let drop_value = |key: &str, value: &str| {
        warn!(ingress = %ingress_key, annotation = key, "Dropping invalid value {:?}", value);
    };
    let number = |key: &str| -> Option<u32> {
        let raw = annotation_value(ingress, key)?;
        match raw.trim().parse::<u32>() {
            Ok(n) => Some(n),
            Err(_) => {
                drop_value(key, raw);
                None
            }
        }
    };
    let size = |key: &str, valid: fn(&str) -> bool| -> Option<String> {
        let raw = annotation_value(ingress, key)?.trim();
        if valid(raw) {
            Some(raw.to_string())
        } else {
            drop_value(key, raw);
            None
        }
    };
    let flag = |key: &str| -> Option<bool> {
        let raw = annotation_value(ingress, key)?;
        let parsed = on_off(raw);
        if parsed.is_none() {
            drop_value(key, raw);
        }
        parsed
    };

    let mut config = ProxyConfig::default();
    if let Some(v) = number(PROXY_CONNECT_TIMEOUT) {
        config.connect_timeout = v;
    }
    if let Some(v) = number(PROXY_SEND_TIMEOUT) {
        config.send_timeout = v;
    }
    if let Some(v) = number(PROXY_READ_TIMEOUT) {
        config.read_timeout = v;
    }
    if let Some(v) = size(PROXY_BODY_SIZE, is_valid_offset) {
        config.body_size = v;
    }
    if let Some(v) = size(PROXY_BUFFER_SIZE, is_valid_size) {
        config.buffer_size = v;
    }
    if let Some(v) = number(PROXY_BUFFERS_NUMBER) {
        config.buffers_number = v;
    }
    if let Some(v) = flag(PROXY_BUFFERING) {
        config.buffering = v;
    }
    if let Some(v) = flag(PROXY_REQUEST_BUFFERING) {
        config.request_buffering = v;
    }
    if let Some(raw) = annotation_value(ingress, PROXY_NEXT_UPSTREAM) {
        let spec = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if spec.is_empty() || spec.contains([';', '{', '}']) {
            drop_value(PROXY_NEXT_UPSTREAM, raw);
        } else {
            config.next_upstream = spec;
        }
    }
    if let Some(v) = number(PROXY_NEXT_UPSTREAM_TRIES) {
        config.next_upstream_tries = v;
    }
    if let Some(v) = number(PROXY_NEXT_UPSTREAM_TIMEOUT) {
        config.next_upstream_timeout = v;
    }
    config.max_fails = number(UPSTREAM_MAX_FAILS);
    config.fail_timeout = number(UPSTREAM_FAIL_TIMEOUT);

    Ok(Annotation::Proxy(config))
}
