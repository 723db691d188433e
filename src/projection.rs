//! Turning a nested field selection into the flat projection a backend fetch
//! needs.
//!
//! A [`Selection`] is the tree a query engine hands over for one entity: its
//! children are the fields the query asked for, each possibly with its own
//! children. An [`EntityShape`] says which of those fields the backing store
//! actually holds for that entity. [`extract`] walks exactly one level of the
//! tree: relationship fields contribute their own name (the parent record
//! holds the related id), but their children belong to the related entity's
//! own loader and are never flattened into the parent's projection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::SelectionError;
use crate::fields::FieldSet;

/// One node of a field-selection tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Only applies when the parent resolves to this entity type (a fragment
    /// on one member of a union or interface).
    #[serde(default, rename = "on", skip_serializing_if = "Option::is_none")]
    pub type_condition: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selections: Vec<Selection>,
}

impl Selection {
    pub fn field(name: impl Into<String>) -> Self {
        Selection {
            name: name.into(),
            alias: None,
            type_condition: None,
            selections: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn on(mut self, type_name: impl Into<String>) -> Self {
        self.type_condition = Some(type_name.into());
        self
    }

    pub fn with_selections(mut self, selections: impl IntoIterator<Item = Selection>) -> Self {
        self.selections.extend(selections);
        self
    }

    /// The name this node appears under in a response: its alias if it has
    /// one, its field name otherwise.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Find a direct child by response key.
    pub fn child(&self, response_key: &str) -> Option<&Selection> {
        self.selections
            .iter()
            .find(|child| child.response_key() == response_key)
    }

    fn is_meta(&self) -> bool {
        self.name.starts_with("__")
    }
}

/// How an entity stores one of its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Scalar,

    /// An embedded document. It is projected as a whole, so it must be
    /// selected with children, but those children aren't fields of the
    /// entity.
    Object,

    /// The id of a record of another entity type, which is loaded separately.
    Relation(String),
}

/// The addressable fields of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityShape {
    pub name: String,
    pub fields: BTreeMap<String, FieldKind>,
}

impl EntityShape {
    pub fn new(name: impl Into<String>) -> Self {
        EntityShape {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn scalar(self, field: impl Into<String>) -> Self {
        self.with_field(field, FieldKind::Scalar)
    }

    pub fn object(self, field: impl Into<String>) -> Self {
        self.with_field(field, FieldKind::Object)
    }

    pub fn relation(self, field: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_field(field, FieldKind::Relation(target.into()))
    }

    pub fn with_field(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(field.into(), kind);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldKind> {
        self.fields.get(name)
    }

    /// The entity type a relation field points at.
    pub fn relation_target(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(FieldKind::Relation(target)) => Some(target),
            _ => None,
        }
    }
}

/// Compute the projection needed to answer `selection` for an entity of
/// `shape`.
///
/// The children of `selection` are matched against the shape's declared
/// fields. Meta fields (`__typename`), fragments on other types and fields
/// the shape doesn't declare (computed fields) are skipped. A tree that would
/// produce an empty projection is an error, never an empty set.
pub fn extract(selection: &Selection, shape: &EntityShape) -> Result<FieldSet, SelectionError> {
    extract_fields(selection, shape, selection.response_key().to_owned())
}

/// Descend through `path` (by response key) before extracting. This is how a
/// wrapper such as a connection's `nodes` list reaches the entity selection.
pub fn extract_at(
    selection: &Selection,
    path: &[&str],
    shape: &EntityShape,
) -> Result<FieldSet, SelectionError> {
    let mut location = selection.response_key().to_owned();
    let mut node = selection;

    for segment in path {
        node = node.child(segment).ok_or_else(|| {
            SelectionError::malformed(&location, format!("no selection for {}", segment))
        })?;
        location = format!("{}.{}", location, segment);
    }

    extract_fields(node, shape, location)
}

fn extract_fields(
    selection: &Selection,
    shape: &EntityShape,
    location: String,
) -> Result<FieldSet, SelectionError> {
    if selection.name.is_empty() {
        return Err(SelectionError::malformed(location, "empty field name"));
    }
    if selection.selections.is_empty() {
        return Err(SelectionError::malformed(
            location,
            format!("{} must be selected with sub-fields", shape.name),
        ));
    }

    let mut fields = Vec::with_capacity(selection.selections.len());

    for child in &selection.selections {
        if child.name.is_empty() {
            return Err(SelectionError::malformed(
                format!("{}.{}", location, child.response_key()),
                "empty field name",
            ));
        }

        let applies = child
            .type_condition
            .as_ref()
            .map_or(true, |type_name| *type_name == shape.name);
        if !applies || child.is_meta() {
            continue;
        }

        let has_children = !child.selections.is_empty();
        match (shape.field(&child.name), has_children) {
            (None, _) => {
                trace!(entity = %shape.name, field = %child.name, "skipping undeclared field");
            }
            (Some(FieldKind::Scalar), true) => {
                return Err(SelectionError::malformed(
                    format!("{}.{}", location, child.response_key()),
                    "scalar field can't have sub-fields",
                ));
            }
            (Some(FieldKind::Object), false) | (Some(FieldKind::Relation(_)), false) => {
                return Err(SelectionError::malformed(
                    format!("{}.{}", location, child.response_key()),
                    "must be selected with sub-fields",
                ));
            }
            (Some(_), _) => fields.push(child.name.as_str()),
        }
    }

    if fields.is_empty() {
        return Err(SelectionError::malformed(
            location,
            format!("selects no stored fields of {}", shape.name),
        ));
    }

    Ok(fields.into_iter().collect())
}

/// Every entity shape known to the process, keyed by entity name. Built once
/// at startup, usually from [`Config`](crate::Config).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<EntityShape>", into = "Vec<EntityShape>")]
pub struct ShapeRegistry {
    shapes: BTreeMap<String, EntityShape>,
}

impl ShapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shape, replacing any shape with the same name.
    pub fn insert(&mut self, shape: EntityShape) {
        self.shapes.insert(shape.name.clone(), shape);
    }

    pub fn with_shape(mut self, shape: EntityShape) -> Self {
        self.insert(shape);
        self
    }

    pub fn get(&self, entity: &str) -> Option<&EntityShape> {
        self.shapes.get(entity)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityShape> {
        self.shapes.values()
    }

    fn shape(&self, entity: &str) -> Result<&EntityShape, SelectionError> {
        self.get(entity).ok_or_else(|| SelectionError::UnknownEntity {
            name: entity.to_owned(),
        })
    }

    /// [`extract`] against the shape registered for `entity`.
    pub fn extract(&self, entity: &str, selection: &Selection) -> Result<FieldSet, SelectionError> {
        extract(selection, self.shape(entity)?)
    }

    /// [`extract_at`] against the shape registered for `entity`.
    pub fn extract_at(
        &self,
        entity: &str,
        selection: &Selection,
        path: &[&str],
    ) -> Result<FieldSet, SelectionError> {
        extract_at(selection, path, self.shape(entity)?)
    }

    /// Check that every relation points at a registered entity.
    pub fn validate(&self) -> Result<(), SelectionError> {
        self.shapes
            .values()
            .flat_map(|shape| shape.fields.values())
            .filter_map(|kind| match kind {
                FieldKind::Relation(target) => Some(target),
                _ => None,
            })
            .try_for_each(|target| self.shape(target).map(drop))
    }
}

impl From<Vec<EntityShape>> for ShapeRegistry {
    fn from(shapes: Vec<EntityShape>) -> Self {
        shapes
            .into_iter()
            .fold(ShapeRegistry::new(), ShapeRegistry::with_shape)
    }
}

impl From<ShapeRegistry> for Vec<EntityShape> {
    fn from(registry: ShapeRegistry) -> Self {
        registry.shapes.into_values().collect()
    }
}
