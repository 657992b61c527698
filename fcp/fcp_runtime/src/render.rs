//! Widget registry and snapshot rendering.
//!
//! The registry maps a widget type name to a pure builder function. Rendering
//! walks the layout from its root, resolving bindings and expanding item
//! templates; faults in one subtree become fallback output for that subtree.

use crate::binding::{self, BindingIssue};
use crate::schema::{LayoutNode, WidgetCatalog};
use crate::update::Snapshot;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedNode {
    pub id: String,
    pub widget_type: String,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderFault {
    #[error("node '{parent_id}' references missing child '{child_id}'")]
    MissingChildNode { parent_id: String, child_id: String },
    #[error("layout root '{0}' is missing")]
    MissingRoot(String),
    #[error("node '{node_id}' has unregistered widget type '{widget_type}'")]
    UnknownWidgetType {
        node_id: String,
        widget_type: String,
    },
    #[error("node '{0}' is its own ancestor")]
    Cycle(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DegradedBinding {
    pub node_id: String,
    pub property: String,
    pub issue: BindingIssue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderReport {
    pub faults: Vec<RenderFault>,
    pub degraded: Vec<DegradedBinding>,
}

impl RenderReport {
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty() && self.degraded.is_empty()
    }
}

pub type BuildFn<T> = fn(&ResolvedNode, Vec<T>) -> T;
pub type FallbackFn<T> = fn(&RenderFault) -> T;

pub struct WidgetRegistry<T> {
    builders: HashMap<String, BuildFn<T>>,
    fallback: FallbackFn<T>,
}

impl<T> WidgetRegistry<T> {
    pub fn new(fallback: FallbackFn<T>) -> Self {
        Self {
            builders: HashMap::new(),
            fallback,
        }
    }

    pub fn register(&mut self, widget_type: impl Into<String>, build: BuildFn<T>) -> &mut Self {
        self.builders.insert(widget_type.into(), build);
        self
    }

    pub fn contains(&self, widget_type: &str) -> bool {
        self.builders.contains_key(widget_type)
    }

    pub fn render(&self, snapshot: &Snapshot) -> (T, RenderReport) {
        let mut walk = Walk {
            registry: self,
            snapshot,
            visiting: HashSet::new(),
            report: RenderReport::default(),
        };
        let root = snapshot.layout.root();
        let out = match snapshot.layout.node(root) {
            Some(node) => walk.node(&node.id, node, None),
            None => walk.fault(RenderFault::MissingRoot(root.to_string())),
        };
        (out, walk.report)
    }
}

struct Walk<'a, T> {
    registry: &'a WidgetRegistry<T>,
    snapshot: &'a Snapshot,
    visiting: HashSet<String>,
    report: RenderReport,
}

impl<'a, T> Walk<'a, T> {
    fn fault(&mut self, fault: RenderFault) -> T {
        tracing::warn!(%fault, "rendering fallback");
        let out = (self.registry.fallback)(&fault);
        self.report.faults.push(fault);
        out
    }

    fn node(&mut self, id: &str, node: &'a LayoutNode, item: Option<&'a Value>) -> T {
        let Some(build) = self.registry.builders.get(&node.widget_type).copied() else {
            return self.fault(RenderFault::UnknownWidgetType {
                node_id: id.to_string(),
                widget_type: node.widget_type.clone(),
            });
        };
        if !self.visiting.insert(id.to_string()) {
            return self.fault(RenderFault::Cycle(id.to_string()));
        }

        let snapshot = self.snapshot;
        let state = &snapshot.state;
        let (properties, issues) = binding::resolve_properties(node, state, item);
        for (property, issue) in issues {
            tracing::warn!(node = id, %property, %issue, "degraded binding");
            self.report.degraded.push(DegradedBinding {
                node_id: id.to_string(),
                property,
                issue,
            });
        }

        let mut children = Vec::new();
        for child_id in node.child_refs() {
            children.push(match snapshot.layout.node(child_id) {
                Some(child) => self.node(child_id, child, item),
                None => self.fault(RenderFault::MissingChildNode {
                    parent_id: id.to_string(),
                    child_id: child_id.to_string(),
                }),
            });
        }

        match binding::expand_items(node, state, item) {
            Ok(instances) => {
                for instance in instances {
                    children.push(self.node(&instance.id, instance.template, Some(instance.item)));
                }
            }
            Err(issue) => self.report.degraded.push(DegradedBinding {
                node_id: id.to_string(),
                property: binding::LIST_DATA_PROPERTY.to_string(),
                issue,
            }),
        }

        self.visiting.remove(id);
        build(
            &ResolvedNode {
                id: id.to_string(),
                widget_type: node.widget_type.clone(),
                properties,
            },
            children,
        )
    }
}

/// Registry producing a resolved JSON tree for every widget the catalog declares.
pub fn json_registry(catalog: &WidgetCatalog) -> WidgetRegistry<Value> {
    let mut registry = WidgetRegistry::new(json_fallback as FallbackFn<Value>);
    for widget_type in catalog.items.keys() {
        registry.register(widget_type.clone(), json_node);
    }
    registry
}

fn json_node(node: &ResolvedNode, children: Vec<Value>) -> Value {
    let mut out = json!({
        "id": node.id,
        "type": node.widget_type,
        "properties": node.properties,
    });
    if !children.is_empty() {
        out["children"] = Value::Array(children);
    }
    out
}

fn json_fallback(fault: &RenderFault) -> Value {
    json!({ "type": "Error", "message": fault.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Binding, Layout};

    fn catalog() -> WidgetCatalog {
        serde_json::from_value(json!({
            "catalogVersion": "1.0.0",
            "items": {
                "Column": {"properties": {"type": "object"}},
                "Text": {"properties": {
                    "type": "object",
                    "properties": {"data": {"type": "string"}}
                }},
                "ListView": {"properties": {"type": "object"}}
            }
        }))
        .expect("catalog")
    }

    fn count_nodes(_: &ResolvedNode, children: Vec<usize>) -> usize {
        1 + children.into_iter().sum::<usize>()
    }

    #[test]
    fn renders_resolved_tree() {
        let layout = Layout::new(
            "n1",
            vec![
                LayoutNode::new("n1", "Text")
                    .with_binding("data", Binding::format("user.name", "Hi, {}!")),
            ],
        )
        .expect("layout");
        let snap = Snapshot::new(layout, json!({"user": {"name": "Ada"}}));

        let (tree, report) = json_registry(&catalog()).render(&snap);
        assert!(report.is_clean());
        assert_eq!(tree["properties"]["data"], "Hi, Ada!");
    }

    #[test]
    fn expands_item_templates_with_item_context() {
        let layout = Layout::new(
            "list",
            vec![
                LayoutNode::new("list", "ListView")
                    .with_binding("data", Binding::path("products"))
                    .with_item_template(
                        LayoutNode::new("row", "Text")
                            .with_binding("data", Binding::format("item.sku", "#{}")),
                    ),
            ],
        )
        .expect("layout");
        let snap = Snapshot::new(layout, json!({"products": [{"sku": "a"}, {"sku": "b"}]}));

        let (tree, report) = json_registry(&catalog()).render(&snap);
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(tree["children"][1]["id"], "list__row__1");
        assert_eq!(tree["children"][1]["properties"]["data"], "#b");
    }

    #[test]
    fn missing_child_becomes_fallback_not_abort() {
        let layout = Layout::new(
            "col",
            vec![
                LayoutNode::new("col", "Column").with_property("children", json!(["a", "gone"])),
                LayoutNode::new("a", "Text").with_property("data", json!("ok")),
            ],
        )
        .expect("layout");
        let snap = Snapshot::new(layout, json!({}));

        let (tree, report) = json_registry(&catalog()).render(&snap);
        assert_eq!(tree["children"][0]["properties"]["data"], "ok");
        assert_eq!(tree["children"][1]["type"], "Error");
        assert_eq!(
            report.faults,
            vec![RenderFault::MissingChildNode {
                parent_id: "col".into(),
                child_id: "gone".into()
            }]
        );
    }

    #[test]
    fn unknown_types_and_cycles_fall_back() {
        let layout = Layout::new(
            "a",
            vec![
                LayoutNode::new("a", "Column").with_property("children", json!(["b", "c"])),
                LayoutNode::new("b", "Column").with_property("child", json!("a")),
                LayoutNode::new("c", "Slider"),
            ],
        )
        .expect("layout");
        let snap = Snapshot::new(layout, json!({}));

        let mut registry = WidgetRegistry::new(|_: &RenderFault| 0usize);
        registry.register("Column", count_nodes);
        let (count, report) = registry.render(&snap);
        assert_eq!(count, 2);
        assert!(report.faults.contains(&RenderFault::Cycle("a".into())));
        assert!(report.faults.iter().any(|f| matches!(f, RenderFault::UnknownWidgetType { .. })));
    }

    #[test]
    fn degraded_bindings_are_reported() {
        let layout = Layout::new(
            "t",
            vec![LayoutNode::new("t", "Text").with_binding("data", Binding::path("missing.value"))],
        )
        .expect("layout");
        let snap = Snapshot::new(layout, json!({}));
        let (tree, report) = json_registry(&catalog()).render(&snap);
        assert_eq!(tree["properties"]["data"], Value::Null);
        assert_eq!(report.degraded.len(), 1);
        assert_eq!(report.degraded[0].property, "data");
    }

    #[test]
    fn missing_root_renders_fallback() {
        let snap = Snapshot::new(Layout::new("nope", vec![]).expect("layout"), json!({}));
        let (tree, report) = json_registry(&catalog()).render(&snap);
        assert_eq!(tree["type"], "Error");
        assert_eq!(report.faults, vec![RenderFault::MissingRoot("nope".into())]);
    }
}
