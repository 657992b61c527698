//! Binding evaluation and item-template expansion.
//!
//! Evaluation never fails: an unresolvable path or a transformation that cannot
//! apply yields a stable default and a [`BindingIssue`] the caller may surface.

use crate::path::{self, ResolveError, StatePath};
use crate::schema::{Binding, LayoutNode, Transform};
use serde_json::{Map, Value};

/// Binding on a list-builder node that supplies the list to expand.
pub const LIST_DATA_PROPERTY: &str = "data";

/// Joins the parts of a synthetic item instance id.
pub const INSTANCE_SEPARATOR: &str = "__";

const PLACEHOLDER: &str = "{}";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindingIssue {
    #[error("binding path did not resolve: {0}")]
    Unresolved(ResolveError),
    #[error("condition at '{path}' expected a boolean, found {found}")]
    NonBooleanCondition { path: String, found: &'static str },
    #[error("map at '{path}' has no entry for '{key}' and no fallback")]
    Unmapped { path: String, key: String },
    #[error("list builder data at '{path}' is not a list")]
    NotAList { path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingOutcome {
    pub value: Value,
    pub issue: Option<BindingIssue>,
}

impl BindingOutcome {
    fn ok(value: Value) -> Self {
        Self { value, issue: None }
    }

    fn degraded(value: Value, issue: BindingIssue) -> Self {
        Self {
            value,
            issue: Some(issue),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.issue.is_some()
    }
}

pub fn evaluate(binding: &Binding, state: &Value, item: Option<&Value>) -> BindingOutcome {
    let resolved = StatePath::parse(&binding.path)
        .and_then(|p| path::resolve_scoped(state, item, &p).cloned());

    match resolved {
        Ok(value) => apply_transform(binding, value),
        Err(err) => {
            tracing::debug!(path = %binding.path, error = %err, "binding path unresolved");
            BindingOutcome::degraded(default_for(binding), BindingIssue::Unresolved(err))
        }
    }
}

fn apply_transform(binding: &Binding, value: Value) -> BindingOutcome {
    match &binding.transform {
        None => BindingOutcome::ok(value),
        Some(Transform::Format(template)) => {
            BindingOutcome::ok(Value::String(format_template(template, &display(&value))))
        }
        Some(Transform::Condition {
            if_value,
            else_value,
        }) => match value {
            Value::Bool(true) => BindingOutcome::ok(if_value.clone()),
            Value::Bool(false) => BindingOutcome::ok(else_value.clone()),
            other => BindingOutcome::degraded(
                else_value.clone(),
                BindingIssue::NonBooleanCondition {
                    path: binding.path.clone(),
                    found: crate::json_schema::type_name(&other),
                },
            ),
        },
        Some(Transform::Map { mapping, fallback }) => {
            let key = path::key_string(&value);
            match (mapping.get(&key), fallback) {
                (Some(mapped), _) => BindingOutcome::ok(mapped.clone()),
                (None, Some(fallback)) => BindingOutcome::ok(fallback.clone()),
                (None, None) => BindingOutcome::degraded(
                    Value::Null,
                    BindingIssue::Unmapped {
                        path: binding.path.clone(),
                        key,
                    },
                ),
            }
        }
    }
}

/// Value used when the path itself does not resolve.
fn default_for(binding: &Binding) -> Value {
    match &binding.transform {
        None => Value::Null,
        Some(Transform::Format(template)) => Value::String(format_template(template, "")),
        Some(Transform::Condition { else_value, .. }) => else_value.clone(),
        Some(Transform::Map { fallback, .. }) => fallback.clone().unwrap_or(Value::Null),
    }
}

fn format_template(template: &str, value: &str) -> String {
    template.replacen(PLACEHOLDER, value, 1)
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Concrete property values for one node: static properties overlaid with
/// evaluated bindings. Issues are reported per property.
pub fn resolve_properties(
    node: &LayoutNode,
    state: &Value,
    item: Option<&Value>,
) -> (Map<String, Value>, Vec<(String, BindingIssue)>) {
    let mut properties = node.properties.clone();
    let mut issues = Vec::new();

    for (property, binding) in &node.bindings {
        let outcome = evaluate(binding, state, item);
        if let Some(issue) = outcome.issue {
            issues.push((property.clone(), issue));
        }
        properties.insert(property.clone(), outcome.value);
    }

    (properties, issues)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemInstance<'a> {
    pub id: String,
    pub template: &'a LayoutNode,
    pub item: &'a Value,
}

pub fn instance_id(parent_id: &str, template_id: &str, index: usize) -> String {
    format!("{parent_id}{INSTANCE_SEPARATOR}{template_id}{INSTANCE_SEPARATOR}{index}")
}

/// Split a synthetic instance id into `(parent_id, template_id, index)`.
/// Authored node ids cannot contain the separator, so the last two parts are
/// unambiguous even when the parent is itself an instance.
pub fn parse_instance_id(id: &str) -> Option<(&str, &str, usize)> {
    let mut parts = id.rsplitn(3, INSTANCE_SEPARATOR);
    let index = parts.next()?.parse().ok()?;
    let template_id = parts.next()?;
    let parent_id = parts.next()?;
    Some((parent_id, template_id, index))
}

/// Expand a list builder's item template once per element of its `data` list.
/// Nodes without a template expand to nothing.
pub fn expand_items<'a>(
    node: &'a LayoutNode,
    state: &'a Value,
    item: Option<&'a Value>,
) -> Result<Vec<ItemInstance<'a>>, BindingIssue> {
    let Some(template) = node.item_template.as_deref() else {
        return Ok(Vec::new());
    };
    let Some(binding) = node.bindings.get(LIST_DATA_PROPERTY) else {
        return Ok(Vec::new());
    };

    let list = StatePath::parse(&binding.path)
        .and_then(|p| path::resolve_scoped(state, item, &p))
        .map_err(BindingIssue::Unresolved)?;
    let Value::Array(elements) = list else {
        return Err(BindingIssue::NotAList {
            path: binding.path.clone(),
        });
    };

    Ok(elements
        .iter()
        .enumerate()
        .map(|(index, element)| ItemInstance {
            id: instance_id(&node.id, &template.id, index),
            template,
            item: element,
        })
        .collect())
}
