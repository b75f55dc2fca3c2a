//! Schema metadata.
//!
//! Schemas describe the fields and relations of a record type. They are
//! plain data, built once and shared behind `Arc`; the engine only reads
//! them.

use crate::{error::Result, Changeset, Error, FieldType, Params, Record, Value};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Builds a child changeset from a base record and raw params.
#[derive(Clone)]
pub struct ChangesetFn(Arc<dyn Fn(Record, &Params) -> Result<Changeset> + Send + Sync>);

impl ChangesetFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Record, &Params) -> Result<Changeset> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, data: Record, params: &Params) -> Result<Changeset> {
        (self.0)(data, params)
    }
}

impl fmt::Debug for ChangesetFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChangesetFn(..)")
    }
}

/// Produces default field values for a related record built from its owner.
#[derive(Clone)]
pub struct DefaultsFn(Arc<dyn Fn(&Record) -> Vec<(String, Value)> + Send + Sync>);

impl DefaultsFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Record) -> Vec<(String, Value)> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for DefaultsFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DefaultsFn(..)")
    }
}

/// Definition of a field in a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Value of the field on a freshly built record
    pub default: Value,
    /// Whether this field is part of the primary key
    pub primary_key: bool,
}

impl FieldDef {
    /// Create a regular field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            default: Value::Null,
            primary_key: false,
        }
    }

    /// Create a primary key field.
    pub fn primary_key(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            primary_key: true,
            ..Self::new(name, field_type)
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }
}

/// How many related records a relation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cardinality::One => write!(f, "one"),
            Cardinality::Many => write!(f, "many"),
        }
    }
}

/// Kind of relation between an owner schema and a related schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
    ManyToMany,
    EmbedsOne,
    EmbedsMany,
}

impl RelationKind {
    pub fn cardinality(&self) -> Cardinality {
        match self {
            RelationKind::HasOne | RelationKind::BelongsTo | RelationKind::EmbedsOne => {
                Cardinality::One
            }
            RelationKind::HasMany | RelationKind::ManyToMany | RelationKind::EmbedsMany => {
                Cardinality::Many
            }
        }
    }

    pub fn is_embed(&self) -> bool {
        matches!(self, RelationKind::EmbedsOne | RelationKind::EmbedsMany)
    }

    /// Whether `policy` is meaningful for this kind of relation.
    pub fn supports(&self, policy: OnReplace) -> bool {
        match policy {
            OnReplace::Raise | OnReplace::MarkAsInvalid | OnReplace::Delete => true,
            OnReplace::Nilify => matches!(self, RelationKind::HasOne | RelationKind::HasMany),
            OnReplace::Update => matches!(
                self,
                RelationKind::HasOne | RelationKind::BelongsTo | RelationKind::EmbedsOne
            ),
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationKind::HasOne => write!(f, "has_one"),
            RelationKind::HasMany => write!(f, "has_many"),
            RelationKind::BelongsTo => write!(f, "belongs_to"),
            RelationKind::ManyToMany => write!(f, "many_to_many"),
            RelationKind::EmbedsOne => write!(f, "embeds_one"),
            RelationKind::EmbedsMany => write!(f, "embeds_many"),
        }
    }
}

/// What happens to an existing related record that has no counterpart in
/// the incoming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnReplace {
    /// Replacing is a programmer error
    #[default]
    Raise,
    /// Reject the whole incoming value with an "is invalid" error
    MarkAsInvalid,
    /// Emit a delete for the existing record
    Delete,
    /// Emit a replace for the existing record; the owner key is cleared on persist
    Nilify,
    /// Cast the incoming item onto the existing record (single relations only)
    Update,
}

impl fmt::Display for OnReplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnReplace::Raise => write!(f, "raise"),
            OnReplace::MarkAsInvalid => write!(f, "mark_as_invalid"),
            OnReplace::Delete => write!(f, "delete"),
            OnReplace::Nilify => write!(f, "nilify"),
            OnReplace::Update => write!(f, "update"),
        }
    }
}

/// A relation descriptor.
#[derive(Debug, Clone)]
pub struct Relation {
    /// Field on the owner that holds the related records
    pub field: String,
    pub kind: RelationKind,
    pub related: Arc<Schema>,
    /// Key on the owner side
    pub owner_key: String,
    /// Key on the related side
    pub related_key: String,
    pub on_replace: OnReplace,
    pub defaults: Option<DefaultsFn>,
    /// Builds child changesets from raw params
    pub changeset: Option<ChangesetFn>,
}

impl Relation {
    fn new(field: impl Into<String>, kind: RelationKind, related: Arc<Schema>) -> Self {
        Self {
            field: field.into(),
            kind,
            related,
            owner_key: String::new(),
            related_key: String::new(),
            on_replace: OnReplace::default(),
            defaults: None,
            changeset: None,
        }
    }

    pub fn has_one(field: impl Into<String>, related: Arc<Schema>) -> Self {
        Self::new(field, RelationKind::HasOne, related)
    }

    pub fn has_many(field: impl Into<String>, related: Arc<Schema>) -> Self {
        Self::new(field, RelationKind::HasMany, related)
    }

    pub fn belongs_to(field: impl Into<String>, related: Arc<Schema>) -> Self {
        Self::new(field, RelationKind::BelongsTo, related)
    }

    pub fn many_to_many(field: impl Into<String>, related: Arc<Schema>) -> Self {
        Self::new(field, RelationKind::ManyToMany, related)
    }

    pub fn embeds_one(field: impl Into<String>, related: Arc<Schema>) -> Self {
        Self::new(field, RelationKind::EmbedsOne, related)
    }

    pub fn embeds_many(field: impl Into<String>, related: Arc<Schema>) -> Self {
        Self::new(field, RelationKind::EmbedsMany, related)
    }

    /// Override the owner and related keys.
    pub fn keys(mut self, owner_key: impl Into<String>, related_key: impl Into<String>) -> Self {
        self.owner_key = owner_key.into();
        self.related_key = related_key.into();
        self
    }

    /// Set the on_replace policy, rejecting combinations the relation kind
    /// cannot honor.
    pub fn on_replace(mut self, policy: OnReplace) -> Result<Self> {
        if !self.kind.supports(policy) {
            return Err(Error::UnsupportedOnReplace {
                field: self.field,
                kind: self.kind,
                policy,
            });
        }
        self.on_replace = policy;
        Ok(self)
    }

    pub fn with_defaults(mut self, defaults: DefaultsFn) -> Self {
        self.defaults = Some(defaults);
        self
    }

    pub fn with_changeset(mut self, changeset: ChangesetFn) -> Self {
        self.changeset = Some(changeset);
        self
    }

    pub fn cardinality(&self) -> Cardinality {
        self.kind.cardinality()
    }

    pub fn is_embed(&self) -> bool {
        self.kind.is_embed()
    }

    /// Build a fresh related record for `owner`.
    ///
    /// Defaults come from the related schema, then the defaults generator,
    /// then the owner key for `has_one`/`has_many`.
    pub fn build(&self, owner: &Record) -> Record {
        let mut record = Record::new(&self.related);

        if let Some(defaults) = &self.defaults {
            for (field, value) in (defaults.0)(owner) {
                if self.related.field(&field).is_some() {
                    record.put(field, value);
                }
            }
        }

        if matches!(self.kind, RelationKind::HasOne | RelationKind::HasMany)
            && self.related.field(&self.related_key).is_some()
        {
            if let Some(key) = owner.get(&self.owner_key) {
                record.put(self.related_key.clone(), key.clone());
            }
        }

        record
    }

    /// The builder used for incoming params, falling back to the related
    /// schema's own builder and finally to casting every non-key field.
    pub(crate) fn changeset_fn(&self) -> ChangesetFn {
        if let Some(changeset) = self.changeset.as_ref().or(self.related.changeset.as_ref()) {
            return changeset.clone();
        }

        let permitted: Vec<String> = self
            .related
            .fields
            .iter()
            .filter(|field| !field.primary_key)
            .map(|field| field.name.clone())
            .collect();

        ChangesetFn::new(move |data, params| {
            Changeset::cast(data, params.clone(), permitted.as_slice())
        })
    }
}

/// Schema for a record type.
#[derive(Debug, Clone)]
pub struct Schema {
    /// Record type name
    pub name: String,
    /// Storage source (table); `None` for embedded schemas
    pub source: Option<String>,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Relation descriptors
    pub relations: Vec<Relation>,
    /// Default builder used when this schema is cast as a relation
    pub changeset: Option<ChangesetFn>,
}

impl Schema {
    /// Create a schema stored in a source named after the type.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: Some(format!("{}s", snake_case(&name))),
            name,
            fields: Vec::new(),
            relations: Vec::new(),
            changeset: None,
        }
    }

    /// Create an embedded schema, which has no storage source.
    pub fn embedded(name: impl Into<String>) -> Self {
        Self {
            source: None,
            ..Self::new(name)
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Builder-style method to add a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Builder-style method to add a relation.
    ///
    /// Keys left empty are derived from the schema and field names.
    pub fn with_relation(mut self, mut relation: Relation) -> Self {
        if relation.owner_key.is_empty() && relation.related_key.is_empty() {
            match relation.kind {
                RelationKind::HasOne | RelationKind::HasMany => {
                    relation.owner_key = "id".into();
                    relation.related_key = format!("{}_id", snake_case(&self.name));
                }
                RelationKind::BelongsTo => {
                    relation.owner_key = format!("{}_id", relation.field);
                    relation.related_key = "id".into();
                }
                RelationKind::ManyToMany => {
                    relation.owner_key = "id".into();
                    relation.related_key = "id".into();
                }
                RelationKind::EmbedsOne | RelationKind::EmbedsMany => {}
            }
        }
        self.relations.push(relation);
        self
    }

    pub fn with_changeset(mut self, changeset: ChangesetFn) -> Self {
        self.changeset = Some(changeset);
        self
    }

    /// Get a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Get a relation descriptor by field name.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|relation| relation.field == name)
    }

    /// Primary key fields, in declaration order.
    pub fn primary_key(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|field| field.primary_key)
    }

    /// Name used to derive default constraint names.
    pub fn source_name(&self) -> String {
        self.source
            .clone()
            .unwrap_or_else(|| snake_case(&self.name))
    }
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
