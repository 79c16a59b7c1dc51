//! Tool-call validation: existence, argument repair, and loop detection.
//!
//! Everything here runs *before* a tool is executed. A call that fails a
//! check never reaches the registry; the executor turns the failure into a
//! `ToolResult` the model can read and react to.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use stepwise_config::LoopDetectionConfig;
use stepwise_core::provider::ToolDefinition;

/// The tools offered to the model for one run: registry tools plus the
/// built-in control tools the handlers provide.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    definitions: Vec<ToolDefinition>,
    schemas: HashMap<String, Value>,
}

impl ToolCatalog {
    /// Build a catalog. Later definitions replace earlier ones with the same name.
    pub fn new(definitions: impl IntoIterator<Item = ToolDefinition>) -> Self {
        let mut catalog = Self::default();
        for def in definitions {
            if catalog.schemas.insert(def.name.clone(), def.parameters.clone()).is_some() {
                catalog.definitions.retain(|d| d.name != def.name);
            }
            catalog.definitions.push(def);
        }
        catalog
    }

    /// Definitions in the order they are sent to the provider.
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn schema(&self, name: &str) -> Option<&Value> {
        self.schemas.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.definitions.iter().map(|d| d.name.as_str()).collect()
    }
}

/// Check that a tool is part of the run's catalog, returning its schema.
pub fn check_exists<'a>(catalog: &'a ToolCatalog, name: &str) -> Result<&'a Value, String> {
    catalog.schema(name).ok_or_else(|| {
        format!(
            "Tool '{name}' does not exist. Available tools: {}",
            catalog.names().join(", ")
        )
    })
}

/// Parse model-generated argument text, coerce it into `schema`, then
/// validate the result against the full schema.
///
/// Accepts near-valid text: code fences, leading prose, single quotes,
/// unquoted keys, Python literals, trailing commas, unclosed brackets, and
/// double-encoded JSON strings. Returns a JSON object or a description of
/// why the arguments could not be used.
pub fn repair_arguments(raw: &str, schema: &Value) -> Result<Value, String> {
    let parsed = parse_lenient(raw)?;

    let parsed = match parsed {
        Value::String(inner) => parse_lenient(&inner)?,
        other => other,
    };

    let arguments = match parsed {
        Value::Object(map) => coerce_to_schema(map, schema)?,
        Value::Null => coerce_to_schema(Map::new(), schema)?,
        other => {
            return Err(format!(
                "arguments must be a JSON object, got {}",
                json_type_name(&other)
            ));
        }
    };

    let arguments = Value::Object(arguments);
    validate_against_schema(schema, &arguments)?;
    Ok(arguments)
}

/// Check `arguments` against every constraint in `schema` (enums, lengths,
/// nested objects, array items). Tools without a schema object accept anything.
pub fn validate_against_schema(schema: &Value, arguments: &Value) -> Result<(), String> {
    if !schema.is_object() {
        return Ok(());
    }

    let validator =
        jsonschema::Validator::new(schema).map_err(|e| format!("tool schema is invalid: {e}"))?;
    if validator.is_valid(arguments) {
        return Ok(());
    }

    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| match e.instance_path.to_string() {
            path if path.is_empty() => e.to_string(),
            path => format!("{path}: {e}"),
        })
        .collect();
    Err(format!(
        "arguments do not match the tool schema: {}",
        errors.join("; ")
    ))
}

fn parse_lenient(raw: &str) -> Result<Value, String> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    let candidate = normalize_json_like(strip_wrapping(text));
    serde_json::from_str::<Value>(&candidate)
        .map_err(|e| format!("could not parse arguments as JSON: {e}"))
}

/// Remove markdown code fences and any prose before the first bracket.
fn strip_wrapping(text: &str) -> &str {
    let mut text = text;
    if let Some(rest) = text.strip_prefix("```") {
        text = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
        text = text.trim_end();
        text = text.strip_suffix("```").unwrap_or(text).trim();
    }
    if !text.starts_with(['{', '[', '"', '\'']) {
        if let Some(pos) = text.find('{') {
            text = &text[pos..];
        }
    }
    text
}

/// Rewrite JSON-like text into strict JSON, closing whatever was left open.
fn normalize_json_like(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                i = read_string(&chars, i, &mut out);
                continue;
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                strip_trailing_comma(&mut out);
                if closers.last() == Some(&c) {
                    closers.pop();
                }
                out.push(c);
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                let is_key = j < chars.len() && chars[j] == ':' && closers.last() == Some(&'}');
                if is_key {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    match word.as_str() {
                        "True" => out.push_str("true"),
                        "False" => out.push_str("false"),
                        "None" | "Null" | "NULL" => out.push_str("null"),
                        _ => out.push_str(&word),
                    }
                }
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }

    strip_trailing_comma(&mut out);
    while let Some(closer) = closers.pop() {
        out.push(closer);
    }
    out
}

/// Copy a quoted literal starting at `start` as a double-quoted JSON string.
/// Returns the index just past the closing quote (or the end of input).
fn read_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    out.push('"');
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '\\' => {
                if let Some(&next) = chars.get(i + 1) {
                    if next == '\'' {
                        out.push('\'');
                    } else {
                        out.push('\\');
                        out.push(next);
                    }
                }
                i += 2;
                continue;
            }
            c if c == quote => {
                out.push('"');
                return i + 1;
            }
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
        i += 1;
    }
    out.push('"');
    chars.len()
}

fn strip_trailing_comma(out: &mut String) {
    let trimmed = out.trim_end().len();
    if out[..trimmed].ends_with(',') {
        out.truncate(trimmed - 1);
    }
}

fn coerce_to_schema(mut args: Map<String, Value>, schema: &Value) -> Result<Map<String, Value>, String> {
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, prop) in properties {
            let Some(current) = args.remove(key) else {
                continue;
            };
            if current.is_null() {
                continue;
            }
            let coerced = coerce_value(current, prop)
                .map_err(|reason| format!("argument '{key}' {reason}"))?;
            args.insert(key.clone(), coerced);
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if args.get(name).is_none_or(Value::is_null) {
                return Err(format!("missing required argument '{name}'"));
            }
        }
    }

    Ok(args)
}

fn coerce_value(value: Value, prop: &Value) -> Result<Value, String> {
    let types: Vec<&str> = match prop.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => return Ok(value),
    };

    if value.is_null() && types.contains(&"null") {
        return Ok(value);
    }

    let mut last_err = String::new();
    for ty in types.iter().filter(|t| **t != "null") {
        match coerce_to_type(&value, ty) {
            Ok(v) => return Ok(v),
            Err(e) => last_err = e,
        }
    }
    if last_err.is_empty() {
        Ok(value)
    } else {
        Err(last_err)
    }
}

fn coerce_to_type(value: &Value, ty: &str) -> Result<Value, String> {
    let mismatch = || format!("must be of type {ty}, got {}", json_type_name(value));
    match (ty, value) {
        ("string", Value::String(_)) => Ok(value.clone()),
        ("string", Value::Number(n)) => Ok(Value::String(n.to_string())),
        ("string", Value::Bool(b)) => Ok(Value::String(b.to_string())),

        ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        ("integer", Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Value::from(f as i64)),
            _ => Err(mismatch()),
        },
        ("integer", Value::String(s)) => s.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch()),

        ("number", Value::Number(_)) => Ok(value.clone()),
        ("number", Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(mismatch),

        ("boolean", Value::Bool(_)) => Ok(value.clone()),
        ("boolean", Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(mismatch()),
        },
        ("boolean", Value::Number(n)) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(mismatch()),
        },

        ("array", Value::Array(_)) => Ok(value.clone()),
        ("array", Value::String(s)) if s.trim_start().starts_with('[') => {
            serde_json::from_str::<Value>(s).map_err(|_| mismatch())
        }
        ("array", Value::Null) => Err(mismatch()),
        ("array", scalar) => Ok(Value::Array(vec![scalar.clone()])),

        ("object", Value::Object(_)) => Ok(value.clone()),
        ("object", Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(v @ Value::Object(_)) => Ok(v),
            _ => Err(mismatch()),
        },

        ("null", Value::Null) => Ok(Value::Null),
        (_, _) if !matches!(ty, "string" | "integer" | "number" | "boolean" | "array" | "object" | "null") => {
            Ok(value.clone())
        }
        _ => Err(mismatch()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Stable fingerprint of a call: tool name plus key-order-independent arguments.
pub fn call_signature(name: &str, arguments: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(arguments, &mut canonical);
    let digest = Sha256::digest(format!("{name}\u{0}{canonical}").as_bytes());
    format!("{digest:x}")
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => out.push_str(&Value::String(s.trim().to_string()).to_string()),
        other => out.push_str(&other.to_string()),
    }
}

/// Outcome of recording a call in the loop window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    /// First sighting within the window.
    Fresh,
    /// Seen before, still within the allowed repeats.
    Repeated { prior: usize },
    /// Seen more than the allowed repeats; must not be executed.
    Loop { prior: usize },
}

/// Sliding window of recent call signatures, owned by one run.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    window: VecDeque<String>,
    capacity: usize,
    max_repeats: usize,
}

impl LoopDetector {
    pub fn new(config: &LoopDetectionConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window.max(1)),
            capacity: config.window.max(1),
            max_repeats: config.max_repeats,
        }
    }

    /// Record a call and report whether it is looping.
    ///
    /// Flagged calls are recorded too, so a model that keeps insisting stays
    /// flagged until it changes its arguments.
    pub fn check(&mut self, name: &str, arguments: &Value) -> LoopVerdict {
        let signature = call_signature(name, arguments);
        let prior = self.window.iter().filter(|s| **s == signature).count();

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(signature);

        match prior {
            0 => LoopVerdict::Fresh,
            n if n > self.max_repeats => LoopVerdict::Loop { prior: n },
            n => LoopVerdict::Repeated { prior: n },
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
