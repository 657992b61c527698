//! JSON-Schema subset used by widget property, event and data-type schemas.
//!
//! Supported keywords: `type`, `properties`, `required`, `additionalProperties`,
//! `items`, `enum`, `const`, `minimum`, `maximum`, `minLength`, `maxLength`,
//! `minItems`, `maxItems` and `$ref` into the catalog's `dataTypes`
//! (`#/dataTypes/<name>`). Unknown keywords are ignored.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

const DATA_TYPES_REF_PREFIX: &str = "#/dataTypes/";
const MAX_REF_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaPathElem {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaIssueKind {
    TypeMismatch { expected: String, found: &'static str },
    MissingRequired(String),
    UnexpectedProperty(String),
    NotInEnum,
    ConstMismatch,
    OutOfRange(String),
    UnresolvedRef(String),
    RefDepthExceeded,
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaIssue {
    pub path: Vec<SchemaPathElem>,
    pub kind: SchemaIssueKind,
}

impl SchemaIssue {
    fn at(path: &[SchemaPathElem], kind: SchemaIssueKind) -> Self {
        Self {
            path: path.to_vec(),
            kind,
        }
    }
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", format_path(&self.path))?;
        match &self.kind {
            SchemaIssueKind::TypeMismatch { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            SchemaIssueKind::MissingRequired(key) => write!(f, "missing required property '{key}'"),
            SchemaIssueKind::UnexpectedProperty(key) => write!(f, "unexpected property '{key}'"),
            SchemaIssueKind::NotInEnum => write!(f, "value is not one of the allowed values"),
            SchemaIssueKind::ConstMismatch => {
                write!(f, "value does not equal the required constant")
            }
            SchemaIssueKind::OutOfRange(detail) => write!(f, "{detail}"),
            SchemaIssueKind::UnresolvedRef(r) => write!(f, "unresolved $ref '{r}'"),
            SchemaIssueKind::RefDepthExceeded => write!(f, "$ref nesting too deep"),
            SchemaIssueKind::Rejected => write!(f, "schema rejects every value"),
        }
    }
}

fn format_path(path: &[SchemaPathElem]) -> String {
    let mut s = String::from("$");
    for p in path {
        match p {
            SchemaPathElem::Field(name) => {
                s.push('.');
                s.push_str(name);
            }
            SchemaPathElem::Index(i) => {
                s.push('[');
                s.push_str(&i.to_string());
                s.push(']');
            }
        }
    }
    s
}

/// Checks values against schemas whose `$ref`s point into `defs`.
#[derive(Debug, Clone, Copy)]
pub struct SchemaChecker<'a> {
    defs: &'a BTreeMap<String, Value>,
}

impl<'a> SchemaChecker<'a> {
    pub fn new(defs: &'a BTreeMap<String, Value>) -> Self {
        Self { defs }
    }

    pub fn check(&self, value: &Value, schema: &Value) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        self.check_at(value, schema, &mut Vec::new(), 0, &mut issues);
        issues
    }

    /// Check a node's static properties, treating `bound` keys as present for
    /// `required`.
    pub fn check_properties(
        &self,
        properties: &Map<String, Value>,
        bound: &[&str],
        schema: &Value,
    ) -> Vec<SchemaIssue> {
        let mut issues = self.check(&Value::Object(properties.clone()), schema);
        issues.retain(|issue| match &issue.kind {
            SchemaIssueKind::MissingRequired(key) => {
                !(issue.path.is_empty() && bound.contains(&key.as_str()))
            }
            _ => true,
        });
        issues
    }

    /// Whether an object schema declares `name` under `properties`.
    pub fn declares_property(&self, schema: &Value, name: &str) -> bool {
        let Some(schema) = self.deref(schema, 0) else {
            return false;
        };
        schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|props| props.contains_key(name))
    }

    fn deref<'s>(&'s self, schema: &'s Value, depth: usize) -> Option<&'s Value> {
        if depth > MAX_REF_DEPTH {
            return None;
        }
        match schema.get("$ref").and_then(Value::as_str) {
            Some(r) => {
                let target = self.defs.get(r.strip_prefix(DATA_TYPES_REF_PREFIX)?)?;
                self.deref(target, depth + 1)
            }
            None => Some(schema),
        }
    }

    fn check_at(
        &self,
        value: &Value,
        schema: &Value,
        path: &mut Vec<SchemaPathElem>,
        depth: usize,
        out: &mut Vec<SchemaIssue>,
    ) {
        let schema = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                out.push(SchemaIssue::at(path, SchemaIssueKind::Rejected));
                return;
            }
            Value::Object(schema) => schema,
            _ => return,
        };

        if let Some(r) = schema.get("$ref").and_then(Value::as_str) {
            if depth >= MAX_REF_DEPTH {
                out.push(SchemaIssue::at(path, SchemaIssueKind::RefDepthExceeded));
                return;
            }
            match r
                .strip_prefix(DATA_TYPES_REF_PREFIX)
                .and_then(|name| self.defs.get(name))
            {
                Some(target) => self.check_at(value, target, path, depth + 1, out),
                None => out.push(SchemaIssue::at(
                    path,
                    SchemaIssueKind::UnresolvedRef(r.to_string()),
                )),
            }
            return;
        }

        if let Some(expected) = schema.get("type") {
            if !type_allows(expected, value) {
                out.push(SchemaIssue::at(
                    path,
                    SchemaIssueKind::TypeMismatch {
                        expected: expected_label(expected),
                        found: type_name(value),
                    },
                ));
                return;
            }
        }

        if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                out.push(SchemaIssue::at(path, SchemaIssueKind::NotInEnum));
            }
        }
        if let Some(constant) = schema.get("const") {
            if constant != value {
                out.push(SchemaIssue::at(path, SchemaIssueKind::ConstMismatch));
            }
        }

        match value {
            Value::Number(n) => check_number(n.as_f64().unwrap_or(f64::NAN), schema, path, out),
            Value::String(s) => {
                let len = s.chars().count() as u64;
                check_len(len, schema, "minLength", "maxLength", "length", path, out);
            }
            Value::Array(items) => {
                check_len(
                    items.len() as u64,
                    schema,
                    "minItems",
                    "maxItems",
                    "item count",
                    path,
                    out,
                );
                if let Some(item_schema) = schema.get("items").filter(|s| !s.is_array()) {
                    for (i, item) in items.iter().enumerate() {
                        path.push(SchemaPathElem::Index(i));
                        self.check_at(item, item_schema, path, depth, out);
                        path.pop();
                    }
                }
            }
            Value::Object(map) => self.check_object(map, schema, path, depth, out),
            _ => {}
        }
    }

    fn check_object(
        &self,
        map: &Map<String, Value>,
        schema: &Map<String, Value>,
        path: &mut Vec<SchemaPathElem>,
        depth: usize,
        out: &mut Vec<SchemaIssue>,
    ) {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(key) {
                    out.push(SchemaIssue::at(
                        path,
                        SchemaIssueKind::MissingRequired(key.to_string()),
                    ));
                }
            }
        }

        let declared = schema.get("properties").and_then(Value::as_object);
        let additional = schema.get("additionalProperties");

        for (key, child) in map {
            let child_schema = declared.and_then(|props| props.get(key));
            path.push(SchemaPathElem::Field(key.clone()));
            match (child_schema, additional) {
                (Some(child_schema), _) => self.check_at(child, child_schema, path, depth, out),
                (None, Some(Value::Bool(false))) => {
                    path.pop();
                    out.push(SchemaIssue::at(
                        path,
                        SchemaIssueKind::UnexpectedProperty(key.clone()),
                    ));
                    continue;
                }
                (None, Some(extra @ Value::Object(_))) => {
                    self.check_at(child, extra, path, depth, out)
                }
                (None, _) => {}
            }
            path.pop();
        }
    }
}

fn check_number(
    n: f64,
    schema: &Map<String, Value>,
    path: &[SchemaPathElem],
    out: &mut Vec<SchemaIssue>,
) {
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            out.push(SchemaIssue::at(
                path,
                SchemaIssueKind::OutOfRange(format!("{n} is less than minimum {min}")),
            ));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            out.push(SchemaIssue::at(
                path,
                SchemaIssueKind::OutOfRange(format!("{n} is greater than maximum {max}")),
            ));
        }
    }
}

fn check_len(
    len: u64,
    schema: &Map<String, Value>,
    min_key: &str,
    max_key: &str,
    what: &str,
    path: &[SchemaPathElem],
    out: &mut Vec<SchemaIssue>,
) {
    if let Some(min) = schema.get(min_key).and_then(Value::as_u64) {
        if len < min {
            out.push(SchemaIssue::at(
                path,
                SchemaIssueKind::OutOfRange(format!("{what} {len} is less than {min_key} {min}")),
            ));
        }
    }
    if let Some(max) = schema.get(max_key).and_then(Value::as_u64) {
        if len > max {
            out.push(SchemaIssue::at(
                path,
                SchemaIssueKind::OutOfRange(format!(
                    "{what} {len} is greater than {max_key} {max}"
                )),
            ));
        }
    }
}

fn type_allows(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => type_matches(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| type_matches(name, value)),
        _ => true,
    }
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn expected_label(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
