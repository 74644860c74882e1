//! `{$path$}` placeholder substitution
//!
//! Used for request steps, step payloads and emitter messages. The context
//! is a JSON object whose top-level keys are namespaces (`session`, `bot`,
//! `message`, `subscriber`, `channel`).
//!
//! Rules:
//! - A string that is exactly one placeholder takes the JSON value it points at
//! - Inside longer text, strings are inserted as-is, `null` and missing values
//!   as the empty string, other values JSON-encoded
//! - `{$path|fallback$}` uses `fallback` when the path is missing

use crate::variables::get_path;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::OnceLock;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\$([a-zA-Z0-9_.|\- ]+)\$\}").expect("Invalid placeholder"))
}

fn lookup<'a>(expr: &'a str, context: &'a Value) -> Result<&'a Value, &'a str> {
    let (path, fallback) = match expr.split_once('|') {
        Some((path, fallback)) => (path.trim(), fallback),
        None => (expr.trim(), ""),
    };
    get_path(context, path).ok_or(fallback)
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render a template into text
pub fn render_text(template: &str, context: &Value) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| match lookup(&caps[1], context) {
            Ok(value) => as_text(value),
            Err(fallback) => fallback.to_string(),
        })
        .into_owned()
}

/// Render a template string, keeping the JSON type of whole-string placeholders
pub fn render_str(template: &str, context: &Value) -> Value {
    if let Some(caps) = placeholder().captures(template) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(template.len()) {
            return match lookup(&caps[1], context) {
                Ok(value) => value.clone(),
                Err(fallback) => Value::String(fallback.to_string()),
            };
        }
    }
    Value::String(render_text(template, context))
}

/// Render every string (and object key) inside a JSON value
pub fn render_value(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => render_str(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, context)).collect()),
        Value::Object(map) => {
            let rendered: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (render_text(k, context), render_value(v, context)))
                .collect();
            Value::Object(rendered)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "session": {"name": "Ana", "age": 31, "tags": ["vip"], "empty": null},
            "bot": {"title": "Helper"}
        })
    }

    #[test]
    fn test_render_text() {
        let out = render_text("Hi {$session.name$}, I am {$bot.title$}", &ctx());
        assert_eq!(out, "Hi Ana, I am Helper");
    }

    #[test]
    fn test_missing_and_null_render_empty() {
        assert_eq!(render_text("[{$session.nope$}]", &ctx()), "[]");
        assert_eq!(render_text("[{$session.empty$}]", &ctx()), "[]");
    }

    #[test]
    fn test_fallback() {
        assert_eq!(render_text("{$session.nick|friend$}", &ctx()), "friend");
        assert_eq!(render_text("{$session.name|friend$}", &ctx()), "Ana");
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        assert_eq!(render_str("{$session.age$}", &ctx()), json!(31));
        assert_eq!(render_str("{$session.tags$}", &ctx()), json!(["vip"]));
        assert_eq!(render_str("age={$session.age$}", &ctx()), json!("age=31"));
        assert_eq!(render_text("tags={$session.tags$}", &ctx()), r#"tags=["vip"]"#);
    }

    #[test]
    fn test_render_value_recurses_into_keys() {
        let body = json!({"{$session.name$}": {"age": "{$session.age$}"}, "n": 1});
        assert_eq!(
            render_value(&body, &ctx()),
            json!({"Ana": {"age": 31}, "n": 1})
        );
    }

    #[test]
    fn test_text_without_placeholders_is_untouched() {
        let raw = "price is {$ not a placeholder";
        assert_eq!(render_text(raw, &ctx()), raw);
    }
}
