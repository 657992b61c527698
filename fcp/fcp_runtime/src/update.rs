//! Snapshot mutation by `StateUpdate` and `LayoutUpdate` batches.
//!
//! A batch applies to a working copy, operation by operation, each resolved
//! against the result of the previous one. The copy is validated against the
//! catalog and committed only if every step succeeds; on failure the snapshot
//! is untouched.

use crate::path::{self, ResolveError, SetMode, StatePath};
use crate::schema::{
    DynamicUiPacket, Layout, LayoutError, LayoutOp, LayoutUpdate, PatchKind, StateOp, StateUpdate,
    WidgetCatalog,
};
use crate::validate::{self, ValidationErrors};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OpError {
    #[error("path not found ({0})")]
    PathNotFound(ResolveError),
    #[error("'{path}' is not a list")]
    NotAList { path: String },
    #[error(transparent)]
    Resolve(ResolveError),
    #[error("patch {kind:?} needs a value")]
    MissingValue { kind: PatchKind },
    #[error("item {position} has no '{item_key}' property")]
    MissingItemKey { position: usize, item_key: String },
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

impl From<ResolveError> for OpError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::PathNotFound { .. } | ResolveError::KeyNotFound { .. } => {
                Self::PathNotFound(err)
            }
            ResolveError::NotAList { path } => Self::NotAList { path },
            other => Self::Resolve(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpdateError {
    #[error("operation {index} ({op}) failed: {source}")]
    Operation {
        index: usize,
        op: &'static str,
        source: OpError,
    },
    #[error("update would leave an invalid snapshot: {0}")]
    Invalid(ValidationErrors),
}

impl UpdateError {
    /// Index of the failing operation, when a single operation failed.
    pub fn op_index(&self) -> Option<usize> {
        match self {
            Self::Operation { index, .. } => Some(*index),
            Self::Invalid(_) => None,
        }
    }
}

/// A `listUpdate` item that matched no existing element. It is reported, not
/// appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnappliedItem {
    pub op_index: usize,
    pub path: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    pub changed_paths: Vec<String>,
    pub changed_nodes: BTreeSet<String>,
    pub unapplied: Vec<UnappliedItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutDelta {
    pub changed_nodes: BTreeSet<String>,
}

/// The client's current layout and state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub layout: Layout,
    pub state: Value,
}

impl Snapshot {
    pub fn new(layout: Layout, state: Value) -> Self {
        Self { layout, state }
    }

    /// Build the session's first snapshot, rejecting packets the catalog does not accept.
    pub fn from_packet(
        packet: DynamicUiPacket,
        catalog: &WidgetCatalog,
    ) -> Result<Self, ValidationErrors> {
        validate::validate_packet(&packet, catalog)?;
        Ok(Self::new(packet.layout, packet.state))
    }

    pub fn to_packet(&self) -> DynamicUiPacket {
        DynamicUiPacket::new(self.layout.clone(), self.state.clone())
    }

    #[tracing::instrument(skip_all, fields(ops = update.operations.len()))]
    pub fn apply_state_update(
        &mut self,
        update: &StateUpdate,
        catalog: &WidgetCatalog,
    ) -> Result<StateDelta, UpdateError> {
        let mut next = self.state.clone();
        let mut delta = StateDelta::default();
        let mut changed = Vec::with_capacity(update.operations.len());

        for (index, op) in update.operations.iter().enumerate() {
            let target = apply_state_op(&mut next, index, op, &mut delta).map_err(|source| {
                UpdateError::Operation {
                    index,
                    op: op.name(),
                    source,
                }
            })?;
            delta.changed_paths.push(target.as_str().to_string());
            changed.push(target);
        }

        validate::validate_state(&next, catalog).map_err(UpdateError::Invalid)?;

        delta.changed_nodes = affected_nodes(&self.layout, &changed);
        self.state = next;
        tracing::debug!(
            paths = delta.changed_paths.len(),
            nodes = delta.changed_nodes.len(),
            unapplied = delta.unapplied.len(),
            "state update applied"
        );
        Ok(delta)
    }

    #[tracing::instrument(skip_all, fields(ops = update.operations.len()))]
    pub fn apply_layout_update(
        &mut self,
        update: &LayoutUpdate,
        catalog: &WidgetCatalog,
    ) -> Result<LayoutDelta, UpdateError> {
        let mut next = self.layout.clone();
        let mut touched = BTreeSet::new();

        for (index, op) in update.operations.iter().enumerate() {
            apply_layout_op(&mut next, op, &mut touched).map_err(|source| UpdateError::Operation {
                index,
                op: op.name(),
                source,
            })?;
        }

        validate::validate_nodes(&next, catalog).map_err(UpdateError::Invalid)?;

        let mut changed_nodes = touched.clone();
        for id in &touched {
            changed_nodes.extend(next.referrers(id).map(str::to_string));
        }
        self.layout = next;
        tracing::debug!(nodes = changed_nodes.len(), "layout update applied");
        Ok(LayoutDelta { changed_nodes })
    }
}

fn apply_state_op(
    state: &mut Value,
    index: usize,
    op: &StateOp,
    delta: &mut StateDelta,
) -> Result<StatePath, OpError> {
    let target = StatePath::parse(op.path())?;

    match op {
        StateOp::Patch { kind, value, .. } => {
            let mode = match kind {
                PatchKind::Replace => SetMode::Replace,
                PatchKind::Add => SetMode::Add,
                PatchKind::Remove => {
                    path::remove(state, &target)?;
                    return Ok(target);
                }
            };
            let value = value.clone().ok_or(OpError::MissingValue { kind: *kind })?;
            path::set(state, &target, value, mode)?;
        }
        StateOp::ListAppend { items, .. } => {
            path::list_mut(state, &target)?.extend(items.iter().cloned());
        }
        StateOp::ListRemove { item_key, keys, .. } => {
            let doomed: HashSet<String> = keys.iter().map(path::key_string).collect();
            path::list_mut(state, &target)?.retain(|element| {
                element
                    .get(item_key)
                    .is_none_or(|field| !doomed.contains(&path::key_string(field)))
            });
        }
        StateOp::ListUpdate { item_key, items, .. } => {
            let list = path::list_mut(state, &target)?;
            for (position, item) in items.iter().enumerate() {
                let key = item
                    .get(item_key)
                    .map(path::key_string)
                    .ok_or_else(|| OpError::MissingItemKey {
                        position,
                        item_key: item_key.clone(),
                    })?;

                let mut matching = list
                    .iter()
                    .enumerate()
                    .filter(|(_, element)| path::key_matches(element, item_key, &key))
                    .map(|(i, _)| i);
                match (matching.next(), matching.next()) {
                    (Some(slot), None) => list[slot] = item.clone(),
                    (None, _) => {
                        tracing::warn!(
                            path = %target,
                            key = %key,
                            "listUpdate item matched no element"
                        );
                        delta.unapplied.push(UnappliedItem {
                            op_index: index,
                            path: target.as_str().to_string(),
                            key,
                        });
                    }
                    (Some(_), Some(_)) => {
                        return Err(OpError::Resolve(ResolveError::AmbiguousListKey {
                            path: target.as_str().to_string(),
                            key: item_key.clone(),
                            value: key,
                        }));
                    }
                }
            }
        }
    }

    Ok(target)
}

fn apply_layout_op(
    layout: &mut Layout,
    op: &LayoutOp,
    touched: &mut BTreeSet<String>,
) -> Result<(), OpError> {
    match op {
        LayoutOp::Add { nodes } => {
            for node in nodes {
                layout.insert(node.clone())?;
                touched.insert(node.id.clone());
            }
        }
        LayoutOp::Remove { node_ids } => {
            for id in node_ids {
                layout.remove(id)?;
                touched.insert(id.clone());
            }
        }
        LayoutOp::Replace { nodes } => {
            for node in nodes {
                layout.replace(node.clone())?;
                touched.insert(node.id.clone());
            }
        }
    }
    Ok(())
}

/// Nodes with a binding whose path overlaps a changed path. Item-relative
/// template bindings are covered by the owning builder's `data` binding.
fn affected_nodes(layout: &Layout, changed: &[StatePath]) -> BTreeSet<String> {
    let reads_changed = |raw: &str| {
        StatePath::parse(raw).is_ok_and(|bound| {
            !bound.is_item_relative() && changed.iter().any(|c| c.overlaps(&bound))
        })
    };

    layout
        .nodes()
        .filter(|node| {
            node.bindings.values().any(|b| reads_changed(&b.path))
                || node
                    .item_template
                    .as_deref()
                    .is_some_and(|t| t.bindings.values().any(|b| reads_changed(&b.path)))
        })
        .map(|node| node.id.clone())
        .collect()
}
