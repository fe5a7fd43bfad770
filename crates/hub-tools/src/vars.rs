// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `$NAME` substitution in tool-call arguments.
//!
//! Performed by the step loop before each tool execution when the `vars`
//! plugin is active:
//!
//! - a string argument exactly equal to `$NAME` is replaced by the value of
//!   variable `NAME`, preserving its type;
//! - `$NAME` tokens embedded in a longer string are interpolated, coercing
//!   non-string values to text;
//! - unknown variables pass through unchanged.
//!
//! Only names matching `[A-Z][A-Z0-9_]*` are recognized.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn var_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$([A-Z][A-Z0-9_]*)").expect("static pattern"))
}

/// Recursively substitute variables throughout an argument value.
pub fn substitute_args(args: Value, vars: &BTreeMap<String, Value>) -> Value {
    match args {
        Value::String(s) => substitute_string(s, vars),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute_args(v, vars))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute_args(v, vars)))
                .collect(),
        ),
        other => other,
    }
}

fn substitute_string(s: String, vars: &BTreeMap<String, Value>) -> Value {
    // Whole-value reference: the variable's type is preserved.
    if let Some(name) = s.strip_prefix('$') {
        if is_var_name(name) {
            if let Some(v) = vars.get(name) {
                return v.clone();
            }
            return Value::String(s);
        }
    }

    // Embedded references interpolate with text coercion.
    let replaced = var_token().replace_all(&s, |caps: &regex::Captures| {
        let name = &caps[1];
        match vars.get(name) {
            Some(v) => coerce_to_string(v),
            None => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

fn is_var_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some('A'..='Z'))
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn coerce_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".into(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> BTreeMap<String, Value> {
        let mut m = BTreeMap::new();
        m.insert("NAME".to_string(), json!("Ada"));
        m.insert("SCORE".to_string(), json!(99));
        m.insert("ACTIVE".to_string(), json!(true));
        m
    }

    #[test]
    fn embedded_tokens_interpolate_with_coercion() {
        let out = substitute_args(json!({"message": "Hello $NAME, score=$SCORE"}), &vars());
        assert_eq!(out, json!({"message": "Hello Ada, score=99"}));
    }

    #[test]
    fn whole_value_reference_preserves_type() {
        let out = substitute_args(json!({"a": "$SCORE", "b": 1}), &vars());
        assert_eq!(out, json!({"a": 99, "b": 1}));
    }

    #[test]
    fn whole_value_bool_preserved() {
        let out = substitute_args(json!({"flag": "$ACTIVE"}), &vars());
        assert_eq!(out, json!({"flag": true}));
    }

    #[test]
    fn unknown_variables_pass_through() {
        let out = substitute_args(json!({"a": "$UNKNOWN", "b": "hi $MISSING!"}), &vars());
        assert_eq!(out, json!({"a": "$UNKNOWN", "b": "hi $MISSING!"}));
    }

    #[test]
    fn lowercase_names_are_not_recognized() {
        let out = substitute_args(json!({"a": "$name"}), &vars());
        assert_eq!(out, json!({"a": "$name"}));
    }

    #[test]
    fn substitution_recurses_into_arrays_and_objects() {
        let out = substitute_args(
            json!({"list": ["$NAME", {"deep": "$SCORE"}]}),
            &vars(),
        );
        assert_eq!(out, json!({"list": ["Ada", {"deep": 99}]}));
    }

    #[test]
    fn non_string_values_untouched() {
        let out = substitute_args(json!({"n": 7, "b": false, "z": null}), &vars());
        assert_eq!(out, json!({"n": 7, "b": false, "z": null}));
    }

    #[test]
    fn dollar_without_name_is_literal() {
        let out = substitute_args(json!({"p": "costs $5"}), &vars());
        assert_eq!(out, json!({"p": "costs $5"}));
    }
}
