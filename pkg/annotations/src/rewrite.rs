use serde::{Deserialize, Serialize};

use pkg_constants::annotations::{APP_ROOT, REWRITE, REWRITE_TARGET};
use pkg_types::ingress::Ingress;

use crate::{Annotation, AnnotationError, annotation_value};

const FLAGS: &[&str] = &["last", "break", "redirect", "permanent"];

/// One `rewrite <regex> <replacement> [flag]` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub regex: String,
    pub replacement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteConfig {
    pub rules: Vec<RewriteRule>,
    /// Replacement for the whole location path.
    pub target: Option<String>,
    /// Redirect target for requests to `/`.
    pub app_root: Option<String>,
}

// Values are inlined unquoted into the rendered location block.
fn check_inline(field: &str, value: &str) -> Result<(), AnnotationError> {
    if value.contains([';', '{', '}', '"', '\'', '\\']) || value.contains(char::is_whitespace) {
        return Err(AnnotationError::LocationDenied(format!(
            "{} {:?} contains a forbidden character",
            field, value
        )));
    }
    Ok(())
}

pub(crate) fn parse(ingress: &Ingress) -> Result<Annotation, AnnotationError> {
    let raw_rules = annotation_value(ingress, REWRITE);
    let target = annotation_value(ingress, REWRITE_TARGET).map(str::trim);
    let app_root = annotation_value(ingress, APP_ROOT).map(str::trim);
    if raw_rules.is_none() && target.is_none() && app_root.is_none() {
        return Err(AnnotationError::Missing);
    }

    let rules: Vec<RewriteRule> = match raw_rules {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
            .map_err(|e| AnnotationError::Invalid(format!("rewrite is not a JSON rule list: {}", e)))?,
        _ => Vec::new(),
    };

    for rule in &rules {
        if rule.regex.is_empty() {
            return Err(AnnotationError::Invalid("rewrite rule with empty regex".to_string()));
        }
        // Quantifier braces are legal in the quoted regex.
        if rule.regex.contains([';', '"']) {
            return Err(AnnotationError::LocationDenied(format!(
                "regex {:?} contains a forbidden character",
                rule.regex
            )));
        }
        if rule.replacement.is_empty() {
            return Err(AnnotationError::Invalid("rewrite rule with empty replacement".to_string()));
        }
        check_inline("replacement", &rule.replacement)?;
        if let Some(flag) = &rule.flag {
            if !FLAGS.contains(&flag.as_str()) {
                return Err(AnnotationError::Invalid(format!("unknown rewrite flag {:?}", flag)));
            }
        }
    }
    if let Some(target) = target {
        check_inline("rewrite-target", target)?;
    }
    if let Some(app_root) = app_root {
        check_inline("app-root", app_root)?;
        if !app_root.starts_with('/') {
            return Err(AnnotationError::Invalid(format!(
                "app-root {:?} must be an absolute path",
                app_root
            )));
        }
    }

    Ok(Annotation::Rewrite(RewriteConfig {
        rules,
        target: target.filter(|t| !t.is_empty()).map(str::to_string),
        app_root: app_root.filter(|t| !t.is_empty()).map(str::to_string),
    }))
}
