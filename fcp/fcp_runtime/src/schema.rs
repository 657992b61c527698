//! Wire data model: catalog, layout, bindings and the protocol payloads.
//!
//! Field names follow the published JSON schemas (camelCase). Layout storage is
//! an arena: nodes keep their wire order in a `Vec` and an id index gives O(1)
//! lookup, so parent/child links are plain id strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub const FORMAT_VERSION: &str = "1.0.0";
pub const UNKNOWN_CATALOG: &str = "UnknownCatalog";

/// Property names that hold child node references.
pub const CHILD_PROPERTY: &str = "child";
pub const CHILDREN_PROPERTY: &str = "children";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetCatalog {
    pub catalog_version: String,
    #[serde(default)]
    pub data_types: BTreeMap<String, Value>,
    #[serde(default)]
    pub items: BTreeMap<String, WidgetDefinition>,
}

impl WidgetCatalog {
    pub fn new(catalog_version: impl Into<String>) -> Self {
        Self {
            catalog_version: catalog_version.into(),
            data_types: BTreeMap::new(),
            items: BTreeMap::new(),
        }
    }

    pub fn widget(&self, widget_type: &str) -> Option<&WidgetDefinition> {
        self.items.get(widget_type)
    }

    /// Merge `catalogAdditions` into this catalog. Later definitions win.
    pub fn extend(&mut self, additions: &CatalogAdditions) {
        for (name, schema) in &additions.data_types {
            self.data_types.insert(name.clone(), schema.clone());
        }
        for (name, def) in &additions.items {
            self.items.insert(name.clone(), def.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetDefinition {
    #[serde(default = "empty_object_schema")]
    pub properties: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub events: BTreeMap<String, Value>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogAdditions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data_types: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<String, WidgetDefinition>,
}

impl CatalogAdditions {
    pub fn is_empty(&self) -> bool {
        self.data_types.is_empty() && self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogReference {
    pub name: String,
    pub version: String,
}

impl CatalogReference {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Registry key, `name@version`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl fmt::Display for CatalogReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutNode {
    pub id: String,
    #[serde(rename = "type")]
    pub widget_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bindings: BTreeMap<String, Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_template: Option<Box<LayoutNode>>,
}

impl LayoutNode {
    pub fn new(id: impl Into<String>, widget_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            widget_type: widget_type.into(),
            properties: Map::new(),
            bindings: BTreeMap::new(),
            item_template: None,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_binding(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(name.into(), binding);
        self
    }

    pub fn with_item_template(mut self, template: LayoutNode) -> Self {
        self.item_template = Some(Box::new(template));
        self
    }

    /// Ids referenced through the `child` and `children` properties, in order.
    pub fn child_refs(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(Value::String(id)) = self.properties.get(CHILD_PROPERTY) {
            out.push(id.as_str());
        }
        if let Some(Value::Array(ids)) = self.properties.get(CHILDREN_PROPERTY) {
            out.extend(ids.iter().filter_map(Value::as_str));
        }
        out
    }

    pub fn references(&self, id: &str) -> bool {
        self.child_refs().contains(&id)
            || self
                .item_template
                .as_deref()
                .is_some_and(|template| template.references(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),
    #[error("unknown node id '{0}'")]
    UnknownNodeId(String),
}

/// Flat, id-addressed UI structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLayout", into = "RawLayout")]
pub struct Layout {
    root: String,
    nodes: Vec<LayoutNode>,
    index: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct RawLayout {
    root: String,
    nodes: Vec<LayoutNode>,
}

impl TryFrom<RawLayout> for Layout {
    type Error = LayoutError;

    fn try_from(raw: RawLayout) -> Result<Self, Self::Error> {
        Layout::new(raw.root, raw.nodes)
    }
}

impl From<Layout> for RawLayout {
    fn from(layout: Layout) -> Self {
        Self {
            root: layout.root,
            nodes: layout.nodes,
        }
    }
}

impl Layout {
    pub fn new(root: impl Into<String>, nodes: Vec<LayoutNode>) -> Result<Self, LayoutError> {
        let mut layout = Self {
            root: root.into(),
            nodes: Vec::with_capacity(nodes.len()),
            index: HashMap::with_capacity(nodes.len()),
        };
        for node in nodes {
            layout.insert(node)?;
        }
        Ok(layout)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn node(&self, id: &str) -> Option<&LayoutNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &LayoutNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, node: LayoutNode) -> Result<(), LayoutError> {
        if self.index.contains_key(&node.id) {
            return Err(LayoutError::DuplicateNodeId(node.id));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn replace(&mut self, node: LayoutNode) -> Result<LayoutNode, LayoutError> {
        let Some(&slot) = self.index.get(&node.id) else {
            return Err(LayoutError::UnknownNodeId(node.id));
        };
        Ok(std::mem::replace(&mut self.nodes[slot], node))
    }

    pub fn remove(&mut self, id: &str) -> Result<LayoutNode, LayoutError> {
        let slot = self
            .index
            .remove(id)
            .ok_or_else(|| LayoutError::UnknownNodeId(id.to_string()))?;
        let removed = self.nodes.remove(slot);
        for position in self.index.values_mut() {
            if *position > slot {
                *position -= 1;
            }
        }
        Ok(removed)
    }

    /// Ids of nodes whose child references (or item template) point at `id`.
    pub fn referrers<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.nodes
            .iter()
            .filter(move |node| node.references(id))
            .map(|node| node.id.as_str())
    }
}

/// Declarative link from a node property to a state path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBinding", into = "RawBinding")]
pub struct Binding {
    pub path: String,
    pub transform: Option<Transform>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Format(String),
    Condition {
        if_value: Value,
        else_value: Value,
    },
    Map {
        mapping: Map<String, Value>,
        fallback: Option<Value>,
    },
}

impl Binding {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            transform: None,
        }
    }

    pub fn format(path: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            transform: Some(Transform::Format(template.into())),
        }
    }

    pub fn condition(path: impl Into<String>, if_value: Value, else_value: Value) -> Self {
        Self {
            path: path.into(),
            transform: Some(Transform::Condition {
                if_value,
                else_value,
            }),
        }
    }

    pub fn map(
        path: impl Into<String>,
        mapping: Map<String, Value>,
        fallback: Option<Value>,
    ) -> Self {
        Self {
            path: path.into(),
            transform: Some(Transform::Map { mapping, fallback }),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawBinding {
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<RawCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    map: Option<RawMap>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCondition {
    #[serde(default)]
    if_value: Value,
    #[serde(default)]
    else_value: Value,
}

#[derive(Serialize, Deserialize)]
struct RawMap {
    mapping: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fallback: Option<Value>,
}

impl TryFrom<RawBinding> for Binding {
    type Error = String;

    fn try_from(raw: RawBinding) -> Result<Self, Self::Error> {
        let transform = match (raw.format, raw.condition, raw.map) {
            (None, None, None) => None,
            (Some(template), None, None) => Some(Transform::Format(template)),
            (None, Some(c), None) => Some(Transform::Condition {
                if_value: c.if_value,
                else_value: c.else_value,
            }),
            (None, None, Some(m)) => Some(Transform::Map {
                mapping: m.mapping,
                fallback: m.fallback,
            }),
            _ => {
                return Err(format!(
                    "binding for '{}' declares more than one transformation",
                    raw.path
                ));
            }
        };
        Ok(Self {
            path: raw.path,
            transform,
        })
    }
}

impl From<Binding> for RawBinding {
    fn from(binding: Binding) -> Self {
        let mut raw = RawBinding {
            path: binding.path,
            format: None,
            condition: None,
            map: None,
        };
        match binding.transform {
            None => {}
            Some(Transform::Format(template)) => raw.format = Some(template),
            Some(Transform::Condition {
                if_value,
                else_value,
            }) => {
                raw.condition = Some(RawCondition {
                    if_value,
                    else_value,
                })
            }
            Some(Transform::Map { mapping, fallback }) => {
                raw.map = Some(RawMap { mapping, fallback })
            }
        }
        raw
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicUiPacket {
    pub format_version: String,
    pub layout: Layout,
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl DynamicUiPacket {
    pub fn new(layout: Layout, state: Value) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            layout,
            state,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_reference: Option<CatalogReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_additions: Option<CatalogAdditions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_catalog: Option<WidgetCatalog>,
    pub source_node_id: String,
    pub event_name: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

impl EventPayload {
    pub fn new(
        source_node_id: impl Into<String>,
        event_name: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            catalog_reference: None,
            catalog_additions: None,
            full_catalog: None,
            source_node_id: source_node_id.into(),
            event_name: event_name.into(),
            timestamp: timestamp.into(),
            arguments: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub operations: Vec<StateOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Replace,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum StateOp {
    Patch {
        #[serde(rename = "patchOp", alias = "op2")]
        kind: PatchKind,
        path: String,
        /// Required by `replace` and `add`. An explicit `null` is a value.
        #[serde(
            default,
            deserialize_with = "present_value",
            skip_serializing_if = "Option::is_none"
        )]
        value: Option<Value>,
    },
    ListAppend {
        path: String,
        items: Vec<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ListRemove {
        path: String,
        item_key: String,
        keys: Vec<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ListUpdate {
        path: String,
        item_key: String,
        items: Vec<Value>,
    },
}

/// Keeps `"value": null` distinct from an absent `value`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl StateOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Patch { .. } => "patch",
            Self::ListAppend { .. } => "listAppend",
            Self::ListRemove { .. } => "listRemove",
            Self::ListUpdate { .. } => "listUpdate",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Patch { path, .. }
            | Self::ListAppend { path, .. }
            | Self::ListRemove { path, .. }
            | Self::ListUpdate { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutUpdate {
    pub operations: Vec<LayoutOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LayoutOp {
    Add {
        nodes: Vec<LayoutNode>,
    },
    #[serde(rename_all = "camelCase")]
    Remove {
        node_ids: Vec<String>,
    },
    Replace {
        nodes: Vec<LayoutNode>,
    },
}

impl LayoutOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Replace { .. } => "replace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownCatalogError {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_reference: Option<CatalogReference>,
}

impl UnknownCatalogError {
    pub fn new(requested_reference: Option<CatalogReference>) -> Self {
        let message = match &requested_reference {
            Some(reference) => format!(
                "catalog '{reference}' is not known to this server; resend with fullCatalog"
            ),
            None => "no catalog reference supplied; resend with fullCatalog".to_string(),
        };
        Self {
            error: UNKNOWN_CATALOG.to_string(),
            message,
            requested_reference,
        }
    }
}
