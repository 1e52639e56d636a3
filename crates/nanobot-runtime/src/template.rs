//! URI template compilation and matching.
//!
//! Supports level-1 `{var}` substitutions. An interior variable matches a
//! single path segment; a variable that terminates the template matches the
//! rest of the URI, so `file:///{path}` recognizes nested paths. Operators
//! from higher RFC 6570 levels are rejected.

use regex::Regex;

use crate::error::{Result, RuntimeError};

const OPERATORS: &[char] = &['+', '#', '.', '/', ';', '?', '&', '='];

/// Compile a URI template to an anchored regex source with one named group
/// per variable.
pub fn compile(template: &str) -> Result<String> {
    let mut pattern = String::from("^");
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let (literal, tail) = rest.split_at(open);
        pattern.push_str(&regex::escape(literal));

        let close = tail
            .find('}')
            .ok_or_else(|| RuntimeError::InvalidTemplate(format!("unterminated variable in {template:?}")))?;
        let var = &tail[1..close];

        if var.is_empty() {
            return Err(RuntimeError::InvalidTemplate(format!(
                "empty variable in {template:?}"
            )));
        }
        if var.starts_with(OPERATORS) {
            return Err(RuntimeError::InvalidTemplate(format!(
                "unsupported operator {:?} in {template:?}",
                &var[..1]
            )));
        }
        if !var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RuntimeError::InvalidTemplate(format!(
                "invalid variable name {var:?} in {template:?}"
            )));
        }

        rest = &tail[close + 1..];
        if rest.is_empty() {
            pattern.push_str(&format!("(?P<{var}>.+)"));
        } else {
            pattern.push_str(&format!("(?P<{var}>[^/]+)"));
        }
    }

    pattern.push_str(&regex::escape(rest));
    pattern.push('$');

    // Compile once here so malformed names surface as InvalidTemplate.
    Regex::new(&pattern).map_err(|e| RuntimeError::InvalidTemplate(e.to_string()))?;
    Ok(pattern)
}

/// Test a compiled pattern against a URI.
pub fn matches(pattern: &str, uri: &str) -> bool {
    Regex::new(pattern).map(|re| re.is_match(uri)).unwrap_or(false)
}

/// Extract named variables from a URI matching the pattern.
pub fn extract(pattern: &str, uri: &str) -> Option<Vec<(String, String)>> {
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(uri)?;
    let vars = re
        .capture_names()
        .flatten()
        .filter_map(|name| {
            caps.name(name)
                .map(|m| (name.to_string(), m.as_str().to_string()))
        })
        .collect();
    Some(vars)
}
