//! `{{path}}` interpolation: a typed, type-preserving single-template fast
//! path, and a Jinja-style strict-undefined text-rendering fallback for
//! embedded/filtered templates. See SPEC_FULL.md §4.2 and §9 "Open
//! questions — resolved" (this crate implements the typed-path-then-template
//! semantics exclusively; the source's alternate plain-regex variant is not
//! carried forward).

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::{EngineError, Result};

fn exact_template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\{\{\s*(.+?)\s*\}\}$").unwrap())
}

fn any_template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").unwrap())
}

/// Dot-path navigation through a JSON value. Numeric segments index
/// sequences; anything else is a map-key lookup. Returns `None` if any
/// segment is missing, mirroring the original's tolerant `_deep_get`.
pub fn deep_get<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(arr) => {
                let idx: usize = segment.parse().ok()?;
                arr.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn deep_get_checked(data: &Value, path: &str) -> Result<Value> {
    deep_get(data, path)
        .cloned()
        .ok_or_else(|| EngineError::MissingPath(path.to_string()))
}

/// Resolves every `{{...}}` occurrence in `value` against `scope`, recursing
/// through maps and sequences. Scalars other than strings pass through
/// unchanged.
pub fn resolve_templates(value: &Value, scope: &Value) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_templates(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_templates(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, scope: &Value) -> Result<Value> {
    let trimmed = s.trim();
    if let Some(caps) = exact_template_re().captures(trimmed) {
        // Only a true single-template match when the whole trimmed string is
        // consumed by the pattern (no trailing text) — `Regex::captures`
        // above already anchors start/end, but we still need the path to
        // avoid '|' (filters) and '{%' (statements), which route to the
        // text-rendering path instead.
        let path = caps.get(1).unwrap().as_str();
        if !path.contains('|') && !path.contains("{%") {
            return deep_get_checked(scope, path);
        }
    }

    if any_template_re().is_match(s) {
        return render_text(s, scope).map(Value::String);
    }

    Ok(Value::String(s.to_string()))
}

fn render_text(template: &str, scope: &Value) -> Result<String> {
    let mut env = minijinja::Environment::new();
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
    env.add_template("__inline__", template)
        .map_err(|e| EngineError::Template(e.to_string()))?;
    let tmpl = env
        .get_template("__inline__")
        .map_err(|e| EngineError::Template(e.to_string()))?;
    tmpl.render(scope_to_minijinja(scope))
        .map_err(|e| EngineError::Template(e.to_string()))
}

fn scope_to_minijinja(scope: &Value) -> minijinja::Value {
    minijinja::Value::from_serialize(scope)
}

/// Collects the set of root identifiers referenced by any `{{...}}`
/// occurrence anywhere in `value`, stripping any `|filter` suffix. Used by
/// the validator to check template references resolve to ancestors.
pub fn extract_template_refs(value: &Value) -> HashSet<String> {
    let mut out = HashSet::new();
    collect_refs(value, &mut out);
    out
}

fn collect_refs(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            for caps in any_template_re().captures_iter(s) {
                let inner = caps.get(1).unwrap().as_str();
                let without_filter = inner.split('|').next().unwrap_or(inner).trim();
                let root = without_filter.split('.').next().unwrap_or(without_filter).trim();
                if !root.is_empty() {
                    out.insert(root.to_string());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_template_preserves_type() {
        let scope = json!({"a": {"count": 3}});
        let resolved = resolve_templates(&json!("{{a.count}}"), &scope).unwrap();
        assert_eq!(resolved, json!(3));
    }

    #[test]
    fn exact_template_preserves_list_and_map() {
        let scope = json!({"a": {"items": [1, 2, 3]}});
        let resolved = resolve_templates(&json!("{{a.items}}"), &scope).unwrap();
        assert_eq!(resolved, json!([1, 2, 3]));
    }

    #[test]
    fn literal_non_template_map_is_unchanged() {
        let scope = json!({});
        let literal = json!({"x": 1, "y": [1, "two", false]});
        assert_eq!(resolve_templates(&literal, &scope).unwrap(), literal);
    }

    #[test]
    fn numeric_segment_indexes_sequence() {
        let scope = json!({"items": ["zero", "one", "two"]});
        assert_eq!(deep_get(&scope, "items.1"), Some(&json!("one")));
    }

    #[test]
    fn embedded_template_renders_as_string() {
        let scope = json!({"name": "world"});
        let resolved = resolve_templates(&json!("hello {{name}}!"), &scope).unwrap();
        assert_eq!(resolved, json!("hello world!"));
    }

    #[test]
    fn filter_suffix_routes_to_text_rendering() {
        let scope = json!({"name": "world"});
        let resolved = resolve_templates(&json!("{{name|upper}}"), &scope).unwrap();
        assert_eq!(resolved, json!("WORLD"));
    }

    #[test]
    fn strict_undefined_fails_on_missing_name() {
        let scope = json!({});
        let err = resolve_templates(&json!("hello {{missing}}"), &scope).unwrap_err();
        assert!(matches!(err, EngineError::Template(_)));
    }

    #[test]
    fn missing_exact_path_is_reference_error() {
        let scope = json!({"a": 1});
        let err = resolve_templates(&json!("{{b.c}}"), &scope).unwrap_err();
        assert!(matches!(err, EngineError::MissingPath(_)));
    }

    #[test]
    fn recurses_through_nested_maps_and_lists() {
        let scope = json!({"a": 5});
        let config = json!({"list": ["{{a}}", "plain"], "nested": {"v": "{{a}}"}});
        let resolved = resolve_templates(&config, &scope).unwrap();
        assert_eq!(resolved, json!({"list": [5, "plain"], "nested": {"v": 5}}));
    }

    #[test]
    fn extract_refs_single_root() {
        let config = json!({"url": "{{input.endpoint}}"});
        assert_eq!(extract_template_refs(&config), HashSet::from(["input".to_string()]));
    }

    #[test]
    fn extract_refs_strips_filter_suffix() {
        let config = json!("{{step_a.result|upper}}");
        assert_eq!(extract_template_refs(&config), HashSet::from(["step_a".to_string()]));
    }

    #[test]
    fn extract_refs_multiple_occurrences() {
        let config = json!({"a": "{{x.y}}", "b": ["{{z}}", "no template here"]});
        assert_eq!(
            extract_template_refs(&config),
            HashSet::from(["x".to_string(), "z".to_string()])
        );
    }
}
