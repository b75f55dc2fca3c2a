//! Typed records.
//!
//! A [`Record`] is an instance of a [`Schema`]: one value per declared
//! field plus one slot per relation.

use crate::{error::Result, Error, Schema, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle state of a record relative to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Built in memory, never persisted
    #[default]
    Built,
    /// Read from storage
    Loaded,
    /// Removed from storage
    Deleted,
}

/// Contents of a relation slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// The related records were never fetched.
    NotLoaded,
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

impl Related {
    pub fn is_loaded(&self) -> bool {
        !matches!(self, Related::NotLoaded)
    }

    /// Loaded records; `NotLoaded` yields nothing.
    pub fn records(&self) -> Vec<&Record> {
        match self {
            Related::NotLoaded | Related::One(None) => Vec::new(),
            Related::One(Some(record)) => vec![record.as_ref()],
            Related::Many(records) => records.iter().collect(),
        }
    }

    /// `true` when no related record is present.
    pub fn is_blank(&self) -> bool {
        match self {
            Related::NotLoaded | Related::One(None) => true,
            Related::One(Some(_)) => false,
            Related::Many(records) => records.is_empty(),
        }
    }
}

impl From<Record> for Related {
    fn from(record: Record) -> Self {
        Related::One(Some(Box::new(record)))
    }
}

impl From<Vec<Record>> for Related {
    fn from(records: Vec<Record>) -> Self {
        Related::Many(records)
    }
}

/// An instance of a schema.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    /// Storage state
    pub state: State,
    values: IndexMap<String, Value>,
    relations: IndexMap<String, Related>,
}

impl Record {
    /// Build a record holding every field's default.
    ///
    /// Association slots start out not loaded; embed slots start empty.
    pub fn new(schema: &Arc<Schema>) -> Self {
        let values = schema
            .fields
            .iter()
            .map(|field| (field.name.clone(), field.default.clone()))
            .collect();

        let relations = schema
            .relations
            .iter()
            .map(|relation| {
                let slot = match (relation.is_embed(), relation.cardinality()) {
                    (false, _) => Related::NotLoaded,
                    (true, crate::Cardinality::One) => Related::One(None),
                    (true, crate::Cardinality::Many) => Related::Many(Vec::new()),
                };
                (relation.field.clone(), slot)
            })
            .collect();

        Self {
            schema: Arc::clone(schema),
            state: State::Built,
            values,
            relations,
        }
    }

    /// Mark the record as read from storage.
    pub fn loaded(mut self) -> Self {
        self.state = State::Loaded;
        self
    }

    /// Builder-style field assignment.
    ///
    /// # Panics
    ///
    /// Panics if `field` is not declared on the schema. Use
    /// [`Record::try_set`] for names that are not known statically.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        assert!(
            self.schema.field(field).is_some(),
            "unknown field `{field}` for schema `{}`",
            self.schema.name
        );
        self.values.insert(field.to_string(), value.into());
        self
    }

    /// Builder-style relation assignment.
    ///
    /// # Panics
    ///
    /// Panics if `field` is not a relation of the schema.
    pub fn with_related(mut self, field: &str, related: impl Into<Related>) -> Self {
        assert!(
            self.schema.relation(field).is_some(),
            "unknown relation `{field}` for schema `{}`",
            self.schema.name
        );
        self.relations.insert(field.to_string(), related.into());
        self
    }

    /// Assign a field value, checking that the field exists.
    pub fn try_set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        if self.schema.field(field).is_none() {
            return Err(Error::UnknownField {
                schema: self.schema.name.clone(),
                field: field.to_string(),
            });
        }
        self.values.insert(field.to_string(), value.into());
        Ok(())
    }

    pub(crate) fn put(&mut self, field: String, value: Value) {
        self.values.insert(field, value);
    }

    pub(crate) fn put_related(&mut self, field: String, related: Related) {
        self.relations.insert(field, related);
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Get a relation slot.
    pub fn related(&self, field: &str) -> Option<&Related> {
        self.relations.get(field)
    }

    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    /// Primary key values in declaration order, or `None` if any part is
    /// `nil`.
    pub fn primary_key(&self) -> Option<Vec<&Value>> {
        self.schema
            .primary_key()
            .map(|field| self.values.get(&field.name).filter(|value| !value.is_null()))
            .collect()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name == other.schema.name
            && self.state == other.state
            && self.values == other.values
            && self.relations == other.relations
    }
}
