//! The changeset: a tracked delta between a record and new input.
//!
//! A [`Changeset`] is built by [`Changeset::cast`] (from raw params) or
//! [`Changeset::change`] (from typed values), refined by validators and
//! relation casting, and finally consumed by the persistence boundary in
//! [`crate::repo`]. Bad input never aborts the pipeline; it accumulates as
//! [`FieldError`]s. Misuse of the API returns an [`Error`].

use crate::{
    config::CastOptions, error::Result, Cardinality, Constraint, Error, FieldDef, IntoParams,
    Params, Record, Related, Schema, Validation, ValidationKind, Value,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{trace, warn};

/// What the persistence layer should do with a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
    /// The record leaves the relation without being deleted
    Replace,
    /// Dropped from the relation; nothing is persisted
    Ignore,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Insert => write!(f, "insert"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
            Action::Replace => write!(f, "replace"),
            Action::Ignore => write!(f, "ignore"),
        }
    }
}

/// A pending change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// New value for a scalar field
    Value(Value),
    /// Child changesets for a relation.
    ///
    /// Single relations hold at most two children: the replaced record
    /// first, then the new one.
    Relation(Vec<Changeset>),
}

impl Change {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Change::Value(value) => Some(value),
            Change::Relation(_) => None,
        }
    }

    pub fn as_relation(&self) -> Option<&[Changeset]> {
        match self {
            Change::Relation(children) => Some(children),
            Change::Value(_) => None,
        }
    }
}

/// A user-facing error attached to a field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub field: String,
    /// Message template; `%{key}` placeholders refer to `opts`
    pub message: String,
    /// Which validation produced the error, if any
    pub validation: Option<ValidationKind>,
    pub opts: IndexMap<String, Value>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            validation: None,
            opts: IndexMap::new(),
        }
    }

    pub fn with_validation(mut self, validation: ValidationKind) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_opt(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.opts.insert(key.into(), value.into());
        self
    }
}

/// Where [`Changeset::fetch_field`] found a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Changes,
    Data,
}

/// Result of executing a changeset: the resulting record, or the changeset
/// carrying the errors that prevented it.
pub type Outcome = std::result::Result<Record, Changeset>;

/// A tracked delta plus validation state.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub(crate) data: Record,
    pub(crate) params: Option<Params>,
    pub(crate) changes: IndexMap<String, Change>,
    pub(crate) errors: Vec<FieldError>,
    pub(crate) validations: Vec<(String, Validation)>,
    pub(crate) required: Vec<String>,
    pub(crate) constraints: Vec<Constraint>,
    pub(crate) filters: IndexMap<String, Value>,
    pub(crate) action: Option<Action>,
    /// Set when no params were supplied at all
    pub(crate) invalid_input: bool,
}

impl Changeset {
    /// Wrap `data` in a changeset with no changes.
    pub fn change(data: Record) -> Self {
        Self {
            data,
            params: None,
            changes: IndexMap::new(),
            errors: Vec::new(),
            validations: Vec::new(),
            required: Vec::new(),
            constraints: Vec::new(),
            filters: IndexMap::new(),
            action: None,
            invalid_input: false,
        }
    }

    /// Wrap `data` with typed changes.
    ///
    /// Each value must already satisfy its field type.
    pub fn change_with<S, V, I>(data: Record, changes: I) -> Result<Self>
    where
        S: AsRef<str>,
        V: Into<Value>,
        I: IntoIterator<Item = (S, V)>,
    {
        changes
            .into_iter()
            .try_fold(Changeset::change(data), |changeset, (field, value)| {
                changeset.put_change(field.as_ref(), value)
            })
    }

    /// Cast `params` onto `data` for the `permitted` fields with default
    /// options.
    pub fn cast<S: AsRef<str>>(
        data: Record,
        params: impl IntoParams,
        permitted: &[S],
    ) -> Result<Self> {
        Self::cast_with(data, params, permitted, &CastOptions::default())
    }

    /// Cast `params` onto `data` for the `permitted` fields.
    ///
    /// Every permitted name must be a scalar field of the schema. Missing
    /// params leave the field untouched. When `params` is `None` the
    /// changeset has no changes and is invalid.
    pub fn cast_with<S: AsRef<str>>(
        data: Record,
        params: impl IntoParams,
        permitted: &[S],
        opts: &CastOptions,
    ) -> Result<Self> {
        Changeset::change(data).cast_params(params, permitted, opts)
    }

    /// Cast more params onto an existing changeset.
    ///
    /// Values are still compared against the data, so casting a field back
    /// to its original value drops the pending change.
    pub fn cast_params<S: AsRef<str>>(
        mut self,
        params: impl IntoParams,
        permitted: &[S],
        opts: &CastOptions,
    ) -> Result<Self> {
        let params = params.into_params()?;
        let schema = Arc::clone(self.data.schema());

        let fields = permitted
            .iter()
            .map(|field| scalar_field(&schema, field.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let Some(params) = params else {
            self.invalid_input = true;
            return Ok(self);
        };

        for field in fields {
            self.cast_field(field, &params, opts);
        }
        self.params = Some(match self.params.take() {
            Some(current) => current.merge(params),
            None => params,
        });

        Ok(self)
    }

    fn cast_field(&mut self, def: &FieldDef, params: &Params, opts: &CastOptions) {
        let Some(raw) = params.get(&def.name) else {
            return;
        };

        let mut raw = Value::from(raw);
        if opts.empty_values.is_empty(&raw) {
            raw = Value::Null;
        }

        match def.field_type.cast(&raw) {
            Ok(value) => {
                let current = self.data.get(&def.name).unwrap_or(&Value::Null);
                if opts.force_changes || !def.field_type.equal(current, &value) {
                    trace!(field = %def.name, value = %value, "cast change");
                    self.changes.insert(def.name.clone(), Change::Value(value));
                } else {
                    self.changes.shift_remove(&def.name);
                }
            }
            Err(err) => {
                trace!(field = %def.name, ty = %def.field_type, "cast rejected");
                let message = err
                    .message
                    .or_else(|| opts.message.clone())
                    .unwrap_or_else(|| "is invalid".to_string());

                let mut error = FieldError::new(&def.name, message)
                    .with_validation(ValidationKind::Cast)
                    .with_opt("type", def.field_type.to_string());
                for (key, value) in err.opts {
                    error = error.with_opt(key, value);
                }
                self.errors.push(error);
            }
        }
    }

    // Accessors

    pub fn data(&self) -> &Record {
        &self.data
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.data.schema()
    }

    pub fn params(&self) -> Option<&Params> {
        self.params.as_ref()
    }

    pub fn changes(&self) -> &IndexMap<String, Change> {
        &self.changes
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Errors attached to `field`, in the order they were added.
    pub fn errors_on(&self, field: &str) -> Vec<&FieldError> {
        self.errors.iter().filter(|e| e.field == field).collect()
    }

    pub fn validations(&self) -> &[(String, Validation)] {
        &self.validations
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn filters(&self) -> &IndexMap<String, Value> {
        &self.filters
    }

    pub fn action(&self) -> Option<Action> {
        self.action
    }

    /// `true` when input was supplied, no errors were added, and every
    /// relation child is valid.
    pub fn is_valid(&self) -> bool {
        !self.invalid_input
            && self.errors.is_empty()
            && self.changes.values().all(|change| match change {
                Change::Relation(children) => children.iter().all(Changeset::is_valid),
                Change::Value(_) => true,
            })
    }

    /// Pending scalar change for `field`.
    pub fn get_change(&self, field: &str) -> Option<&Value> {
        self.changes.get(field).and_then(Change::as_value)
    }

    /// Pending change of any kind for `field`.
    pub fn fetch_change(&self, field: &str) -> Option<&Change> {
        self.changes.get(field)
    }

    /// Child changesets queued for relation `field`.
    pub fn relation_changes(&self, field: &str) -> Option<&[Changeset]> {
        self.changes.get(field).and_then(Change::as_relation)
    }

    pub fn changed(&self, field: &str) -> bool {
        self.changes.contains_key(field)
    }

    /// Current value of a scalar field: the pending change, else the data.
    pub fn get_field(&self, field: &str) -> Option<&Value> {
        self.fetch_field(field).map(|(_, value)| value)
    }

    pub fn fetch_field(&self, field: &str) -> Option<(FieldSource, &Value)> {
        match self.get_change(field) {
            Some(value) => Some((FieldSource::Changes, value)),
            None => self.data.get(field).map(|value| (FieldSource::Data, value)),
        }
    }

    pub(crate) fn has_error(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    // Changes

    /// Record a change, unless `value` equals the current data.
    pub fn put_change(mut self, field: &str, value: impl Into<Value>) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        let def = scalar_field(&schema, field)?;
        let value = checked_value(def, value.into())?;

        let current = self.data.get(field).unwrap_or(&Value::Null);
        if def.field_type.equal(current, &value) {
            self.changes.shift_remove(field);
        } else {
            self.changes.insert(def.name.clone(), Change::Value(value));
        }
        Ok(self)
    }

    /// Record a change even if `value` equals the current data.
    pub fn force_change(mut self, field: &str, value: impl Into<Value>) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        let def = scalar_field(&schema, field)?;
        let value = checked_value(def, value.into())?;

        self.changes.insert(def.name.clone(), Change::Value(value));
        Ok(self)
    }

    pub fn delete_change(mut self, field: &str) -> Self {
        self.changes.shift_remove(field);
        self
    }

    /// Replace a pending scalar change with `f(change)`. No-op without one.
    pub fn update_change<F>(self, field: &str, f: F) -> Result<Self>
    where
        F: FnOnce(Value) -> Value,
    {
        match self.get_change(field).cloned() {
            Some(value) => self.put_change(field, f(value)),
            None => Ok(self),
        }
    }

    /// Add a user-facing error.
    pub fn add_error(mut self, error: FieldError) -> Self {
        self.errors.push(error);
        self
    }

    // Actions

    /// Assign the action. Changing an already assigned action is fatal.
    pub fn put_action(mut self, action: Action) -> Result<Self> {
        match self.action {
            Some(current) if current != action => {
                warn!(current = %current, requested = %action, "action conflict");
                Err(Error::ActionConflict {
                    current,
                    requested: action,
                })
            }
            _ => {
                self.action = Some(action);
                Ok(self)
            }
        }
    }

    /// Combine two changesets built from the same data.
    ///
    /// Changes from `other` win on collision.
    pub fn merge(mut self, other: Changeset) -> Result<Self> {
        if self.data != other.data {
            return Err(Error::DataMismatch);
        }

        let action = match (self.action, other.action) {
            (Some(current), Some(requested)) if current != requested => {
                return Err(Error::ActionConflict { current, requested });
            }
            (current, requested) => current.or(requested),
        };

        self.params = match (self.params.take(), other.params) {
            (Some(left), Some(right)) => Some(left.merge(right)),
            (left, right) => left.or(right),
        };
        self.changes.extend(other.changes);
        self.errors.extend(other.errors);
        self.validations.extend(other.validations);
        for field in other.required {
            if !self.required.contains(&field) {
                self.required.push(field);
            }
        }
        for constraint in other.constraints {
            if !self.constraints.contains(&constraint) {
                self.constraints.push(constraint);
            }
        }
        self.filters.extend(other.filters);
        self.invalid_input |= other.invalid_input;
        self.action = action;

        Ok(self)
    }

    // Projection

    /// Apply every change to the data, ignoring validity.
    ///
    /// Relation children marked for delete, replace or ignore leave the
    /// relation.
    pub fn apply_changes(&self) -> Record {
        let mut record = self.data.clone();
        let schema = Arc::clone(self.data.schema());

        for (field, change) in &self.changes {
            match change {
                Change::Value(value) => record.put(field.clone(), value.clone()),
                Change::Relation(children) => {
                    let kept = children
                        .iter()
                        .filter(|child| child.stays_in_relation())
                        .map(Changeset::apply_changes);

                    let related = match schema.relation(field).map(|r| r.cardinality()) {
                        Some(Cardinality::One) => Related::One(kept.last().map(Box::new)),
                        _ => Related::Many(kept.collect()),
                    };
                    record.put_related(field.clone(), related);
                }
            }
        }

        record
    }

    /// Assign `action`, then apply the changes if the changeset is valid.
    pub fn apply_action(self, action: Action) -> Result<Outcome> {
        let changeset = self.put_action(action)?;
        if changeset.is_valid() {
            Ok(Ok(changeset.apply_changes()))
        } else {
            Ok(Err(changeset))
        }
    }

    pub(crate) fn stays_in_relation(&self) -> bool {
        !matches!(
            self.action,
            Some(Action::Delete | Action::Replace | Action::Ignore)
        )
    }

    /// Whether `field` holds no usable value.
    ///
    /// Scalars are blank when `nil` or an empty string (or whitespace only,
    /// with `trim`). Relations are blank when nothing remains in them.
    pub(crate) fn is_missing(&self, field: &str, trim: bool) -> bool {
        if self.data.schema().relation(field).is_some() {
            return match self.changes.get(field) {
                Some(Change::Relation(children)) => {
                    !children.iter().any(Changeset::stays_in_relation)
                }
                _ => self.data.related(field).map_or(true, Related::is_blank),
            };
        }

        match self.get_field(field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty() || (trim && s.trim().is_empty()),
            Some(_) => false,
        }
    }
}

/// Look up a scalar field, rejecting relations and unknown names.
pub(crate) fn scalar_field<'a>(schema: &'a Schema, field: &str) -> Result<&'a FieldDef> {
    if let Some(def) = schema.field(field) {
        return Ok(def);
    }

    if schema.relation(field).is_some() {
        Err(Error::CastRelation {
            schema: schema.name.clone(),
            field: field.to_string(),
        })
    } else {
        Err(Error::UnknownField {
            schema: schema.name.clone(),
            field: field.to_string(),
        })
    }
}

fn checked_value(def: &FieldDef, value: Value) -> Result<Value> {
    if def.field_type.is_a(&value) {
        Ok(value)
    } else {
        Err(Error::TypeMismatch {
            field: def.name.clone(),
            expected: def.field_type.to_string(),
            got: value.kind_name().to_string(),
        })
    }
}
