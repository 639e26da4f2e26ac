//! Functions the templates rely on for the parts of a server block that are
//! computed rather than substituted.

use std::fmt::Write;

use tracing::warn;

use pkg_store::{ConditionKind, Location};

pub use pkg_annotations::size::{is_valid_offset, is_valid_size};

const NON_IDEMPOTENT: &str = "non_idempotent";

/// Quote a string as a lua literal.
fn lua_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Routing prelude of a location: selects the upstream by header match,
/// then cookie match, then the default pool. Without a default, unmatched
/// requests get a 404.
pub fn build_lua_header_router(location: &Location) -> String {
    let mut out = String::from("rewrite_by_lua_block {\n");

    let headers: Vec<_> = location
        .name_condition
        .iter()
        .filter(|(_, c)| c.kind == ConditionKind::Header && !c.values.is_empty())
        .collect();
    let cookies: Vec<_> = location
        .name_condition
        .iter()
        .filter(|(_, c)| c.kind == ConditionKind::Cookie && !c.values.is_empty())
        .collect();

    if !headers.is_empty() {
        out.push_str("    local headers = ngx.req.get_headers()\n");
    }
    for (pool, cond) in headers {
        let test = cond
            .values
            .iter()
            .map(|(k, v)| format!("headers[{}] == {}", lua_quote(&k.to_lowercase()), lua_quote(v)))
            .collect::<Vec<_>>()
            .join(" and ");
        let _ = write!(
            out,
            "    if {} then\n        ngx.var.proxy_upstream_name = {}\n        return\n    end\n",
            test,
            lua_quote(pool)
        );
    }
    for (pool, cond) in cookies {
        let test = cond
            .values
            .iter()
            .map(|(k, v)| format!("ngx.var[{}] == {}", lua_quote(&format!("cookie_{}", k)), lua_quote(v)))
            .collect::<Vec<_>>()
            .join(" and ");
        let _ = write!(
            out,
            "    if {} then\n        ngx.var.proxy_upstream_name = {}\n        return\n    end\n",
            test,
            lua_quote(pool)
        );
    }

    match location.default_pool() {
        Some(pool) => {
            let _ = writeln!(out, "    ngx.var.proxy_upstream_name = {}", lua_quote(pool));
        }
        None => out.push_str("    return ngx.exit(ngx.HTTP_NOT_FOUND)\n"),
    }
    out.push('}');
    out
}

/// Normalize a `proxy_next_upstream` list. `non_idempotent` ends up last,
/// and only when requested by the flag or by the list itself.
pub fn build_next_upstream(spec: &str, retry_non_idempotent: bool) -> String {
    let mut retry = retry_non_idempotent;
    let mut parts: Vec<&str> = Vec::new();
    for part in spec.split_whitespace() {
        if part == NON_IDEMPOTENT {
            retry = true;
        } else {
            parts.push(part);
        }
    }
    if retry {
        parts.push(NON_IDEMPOTENT);
    }
    parts.join(" ")
}

/// `size` grammar, or the `offset` grammar (which adds `g`) when
/// `allow_giga` is set.
pub fn is_valid_byte_size(value: &str, allow_giga: bool) -> bool {
    if allow_giga {
        is_valid_offset(value)
    } else {
        is_valid_size(value)
    }
}

/// Keep a byte-size directive value only if it matches its grammar.
pub fn checked_size(field: &str, value: &str, allow_giga: bool) -> Option<String> {
    if is_valid_byte_size(value, allow_giga) {
        Some(value.to_string())
    } else {
        warn!("Dropping invalid {} value {:?}", field, value);
        None
    }
}
