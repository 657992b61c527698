//! Catalog validation of layouts, state and events.
//!
//! Validation is pure and collects every issue instead of stopping at the first.

use crate::binding;
use crate::json_schema::{SchemaChecker, SchemaIssue};
use crate::schema::{DynamicUiPacket, EventPayload, Layout, LayoutNode, WidgetCatalog};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationIssue {
    #[error("node '{node_id}': invalid node id")]
    InvalidNodeId { node_id: String },
    #[error("node '{node_id}': unknown widget type '{widget_type}'")]
    UnknownWidgetType {
        node_id: String,
        widget_type: String,
    },
    #[error("node '{node_id}': invalid property {issue}")]
    InvalidProperty { node_id: String, issue: SchemaIssue },
    #[error("node '{node_id}': binding targets undeclared property '{property}'")]
    UnknownBindingTarget { node_id: String, property: String },
    #[error("layout root '{root}' is not a node")]
    MissingRoot { root: String },
    #[error("node '{node_id}': references missing child '{child_id}'")]
    MissingChildNode { node_id: String, child_id: String },
    #[error("state '{key}': invalid shape {issue}")]
    InvalidStateShape { key: String, issue: SchemaIssue },
    #[error("event source '{node_id}' is not a node")]
    UnknownSourceNode { node_id: String },
    #[error("node '{node_id}': widget does not declare event '{event_name}'")]
    UnknownEvent { node_id: String, event_name: String },
    #[error("node '{node_id}': event '{event_name}' arguments {issue}")]
    InvalidEventArguments {
        node_id: String,
        event_name: String,
        issue: SchemaIssue,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrors {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationErrors {
    fn into_result(issues: Vec<ValidationIssue>) -> Result<(), Self> {
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Self { issues })
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Full check used before the initial render: catalog conformance, reference
/// integrity and state shape.
pub fn validate(
    layout: &Layout,
    state: &Value,
    catalog: &WidgetCatalog,
) -> Result<(), ValidationErrors> {
    let mut issues = Vec::new();
    collect_node_issues(layout, catalog, &mut issues);
    collect_reference_issues(layout, &mut issues);
    collect_state_issues(state, catalog, &mut issues);
    ValidationErrors::into_result(issues)
}

pub fn validate_packet(
    packet: &DynamicUiPacket,
    catalog: &WidgetCatalog,
) -> Result<(), ValidationErrors> {
    validate(&packet.layout, &packet.state, catalog)
}

/// Catalog conformance only. Dangling child references are left to the
/// renderer, which reports them as missing children.
pub fn validate_nodes(layout: &Layout, catalog: &WidgetCatalog) -> Result<(), ValidationErrors> {
    let mut issues = Vec::new();
    collect_node_issues(layout, catalog, &mut issues);
    ValidationErrors::into_result(issues)
}

pub fn validate_state(state: &Value, catalog: &WidgetCatalog) -> Result<(), ValidationErrors> {
    let mut issues = Vec::new();
    collect_state_issues(state, catalog, &mut issues);
    ValidationErrors::into_result(issues)
}

pub fn validate_event(
    event: &EventPayload,
    layout: &Layout,
    catalog: &WidgetCatalog,
) -> Result<(), ValidationErrors> {
    let node_id = &event.source_node_id;
    let Some(node) = event_source(layout, node_id) else {
        return Err(ValidationErrors {
            issues: vec![ValidationIssue::UnknownSourceNode {
                node_id: node_id.clone(),
            }],
        });
    };
    let Some(widget) = catalog.widget(&node.widget_type) else {
        return Err(ValidationErrors {
            issues: vec![ValidationIssue::UnknownWidgetType {
                node_id: node_id.clone(),
                widget_type: node.widget_type.clone(),
            }],
        });
    };
    let Some(schema) = widget.events.get(&event.event_name) else {
        return Err(ValidationErrors {
            issues: vec![ValidationIssue::UnknownEvent {
                node_id: node_id.clone(),
                event_name: event.event_name.clone(),
            }],
        });
    };

    let arguments = event
        .arguments
        .clone()
        .map(Value::Object)
        .unwrap_or_else(|| Value::Object(Default::default()));
    let issues = SchemaChecker::new(&catalog.data_types)
        .check(&arguments, schema)
        .into_iter()
        .map(|issue| ValidationIssue::InvalidEventArguments {
            node_id: node_id.clone(),
            event_name: event.event_name.clone(),
            issue,
        })
        .collect();
    ValidationErrors::into_result(issues)
}

/// Event sources may be layout nodes or synthetic item-template instances.
fn event_source<'a>(layout: &'a Layout, id: &str) -> Option<&'a LayoutNode> {
    if let Some(node) = layout.node(id) {
        return Some(node);
    }
    let (parent_id, template_id, _) = binding::parse_instance_id(id)?;
    layout
        .node(parent_id)?
        .item_template
        .as_deref()
        .filter(|template| template.id == template_id)
}

/// ASCII alphanumerics, `_` and `-`. `__` is reserved as the separator of
/// synthetic item instance ids.
pub fn is_valid_node_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains(binding::INSTANCE_SEPARATOR)
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn collect_node_issues(
    layout: &Layout,
    catalog: &WidgetCatalog,
    issues: &mut Vec<ValidationIssue>,
) {
    let checker = SchemaChecker::new(&catalog.data_types);
    for node in layout.nodes() {
        check_node(node, catalog, &checker, issues);
        if let Some(template) = node.item_template.as_deref() {
            check_node(template, catalog, &checker, issues);
        }
    }
}

fn check_node(
    node: &LayoutNode,
    catalog: &WidgetCatalog,
    checker: &SchemaChecker<'_>,
    issues: &mut Vec<ValidationIssue>,
) {
    if !is_valid_node_id(&node.id) {
        issues.push(ValidationIssue::InvalidNodeId {
            node_id: node.id.clone(),
        });
    }

    let Some(widget) = catalog.widget(&node.widget_type) else {
        issues.push(ValidationIssue::UnknownWidgetType {
            node_id: node.id.clone(),
            widget_type: node.widget_type.clone(),
        });
        return;
    };

    let bound: Vec<&str> = node.bindings.keys().map(String::as_str).collect();
    for issue in checker.check_properties(&node.properties, &bound, &widget.properties) {
        issues.push(ValidationIssue::InvalidProperty {
            node_id: node.id.clone(),
            issue,
        });
    }

    for property in node.bindings.keys() {
        if !checker.declares_property(&widget.properties, property) {
            issues.push(ValidationIssue::UnknownBindingTarget {
                node_id: node.id.clone(),
                property: property.clone(),
            });
        }
    }
}

fn collect_reference_issues(layout: &Layout, issues: &mut Vec<ValidationIssue>) {
    if !layout.contains(layout.root()) {
        issues.push(ValidationIssue::MissingRoot {
            root: layout.root().to_string(),
        });
    }

    for node in layout.nodes() {
        let template_refs = node
            .item_template
            .as_deref()
            .map(LayoutNode::child_refs)
            .unwrap_or_default();
        for child_id in node.child_refs().into_iter().chain(template_refs) {
            if !layout.contains(child_id) {
                issues.push(ValidationIssue::MissingChildNode {
                    node_id: node.id.clone(),
                    child_id: child_id.to_string(),
                });
            }
        }
    }
}

fn collect_state_issues(state: &Value, catalog: &WidgetCatalog, issues: &mut Vec<ValidationIssue>) {
    if catalog.data_types.is_empty() {
        return;
    }
    let checker = SchemaChecker::new(&catalog.data_types);
    walk_state(state, &mut Vec::new(), catalog, &checker, issues);
}

/// Every object entry whose key names a declared data type is checked against
/// that type's schema, at any depth.
fn walk_state<'v>(
    value: &'v Value,
    trail: &mut Vec<&'v str>,
    catalog: &WidgetCatalog,
    checker: &SchemaChecker<'_>,
    issues: &mut Vec<ValidationIssue>,
) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                trail.push(key.as_str());
                if let Some(schema) = catalog.data_types.get(key) {
                    for issue in checker.check(child, schema) {
                        issues.push(ValidationIssue::InvalidStateShape {
                            key: trail.join("."),
                            issue,
                        });
                    }
                }
                walk_state(child, trail, catalog, checker, issues);
                trail.pop();
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_state(item, trail, catalog, checker, issues);
            }
        }
        _ => {}
    }
}
