//! Relation reconciliation.
//!
//! The [`Reconciler`] matches the related records an owner already has
//! against incoming items and decides, per item, whether it is inserted,
//! updated, deleted or replaced. It is the engine behind
//! [`Changeset::cast_assoc`], [`Changeset::cast_embed`],
//! [`Changeset::put_assoc`] and [`Changeset::put_embed`].
//!
//! Matching is by primary key. Keys of incoming params are cast through the
//! key's field type first, so `"1"` matches an integer key `1`. Items with
//! no resolvable key are always new.
//!
//! Output order is deterministic: existing records left without a
//! counterpart come first in their original order, followed by the
//! incoming items in input order.

use crate::{
    error::Result, Action, Cardinality, Change, Changeset, ChangesetFn, Error, FieldDef,
    FieldError, FieldType, OnReplace, Params, Record, Related, Relation, Schema, State,
    ValidationKind, Value,
};
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::{debug, warn};

/// An incoming related item.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Raw params, cast through the relation's changeset builder
    Params(Params),
    /// A typed record, diffed against its match
    Record(Record),
    /// A ready-made changeset, used as given
    Changeset(Changeset),
}

impl From<Params> for Incoming {
    fn from(params: Params) -> Self {
        Incoming::Params(params)
    }
}

impl From<Record> for Incoming {
    fn from(record: Record) -> Self {
        Incoming::Record(record)
    }
}

impl From<Changeset> for Incoming {
    fn from(changeset: Changeset) -> Self {
        Incoming::Changeset(changeset)
    }
}

/// Incoming value for a whole relation.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    One(Option<Incoming>),
    Many(Vec<Incoming>),
}

impl Input {
    fn from_related(related: Related) -> Option<Self> {
        match related {
            Related::NotLoaded => None,
            Related::One(record) => Some(Input::One(record.map(|r| Incoming::Record(*r)))),
            Related::Many(records) => Some(Input::Many(
                records.into_iter().map(Incoming::Record).collect(),
            )),
        }
    }
}

/// Outcome of reconciling a relation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Child changesets to persist
    Changed(Vec<Changeset>),
    /// Nothing would change
    Unchanged,
    /// The incoming value was rejected by the `mark_as_invalid` policy
    Invalid,
}

/// Reconciles one relation of one owner.
pub struct Reconciler<'a> {
    relation: &'a Relation,
    owner: &'a Record,
    builder: ChangesetFn,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler using the relation's default changeset builder.
    pub fn new(relation: &'a Relation, owner: &'a Record) -> Self {
        Self {
            relation,
            owner,
            builder: relation.changeset_fn(),
        }
    }

    /// Build child changesets from params with `builder` instead.
    pub fn with_builder(mut self, builder: ChangesetFn) -> Self {
        self.builder = builder;
        self
    }

    /// Reconcile the owner's current related records against `input`.
    pub fn reconcile(self, input: Input) -> Result<Reconciled> {
        let field = self.relation.field.as_str();
        let existing = self.existing()?;

        let incoming: Vec<Incoming> = match (self.relation.cardinality(), input) {
            (Cardinality::One, Input::One(item)) => item.into_iter().collect(),
            (Cardinality::Many, Input::Many(items)) => items,
            (expected, _) => {
                return Err(Error::CardinalityMismatch {
                    field: field.to_string(),
                    expected,
                })
            }
        };

        let pk: Vec<&FieldDef> = self.relation.related.primary_key().collect();
        let mut matched = vec![false; existing.len()];
        let mut seen: Vec<Vec<Value>> = Vec::new();
        let mut children = Vec::with_capacity(incoming.len());

        for item in incoming {
            let key = incoming_key(&item, &pk);
            let duplicate = key
                .as_ref()
                .is_some_and(|key| seen.iter().any(|other| same_key(&pk, key, other)));

            let mut target = match (&key, duplicate) {
                (Some(key), false) => existing
                    .iter()
                    .enumerate()
                    .position(|(i, record)| !matched[i] && record_has_key(record, &pk, key)),
                _ => None,
            };

            // A single relation under `update` casts onto whatever is there.
            if target.is_none()
                && self.relation.on_replace == OnReplace::Update
                && self.relation.cardinality() == Cardinality::One
                && !existing.is_empty()
                && !matched[0]
            {
                target = Some(0);
            }

            let child = match target {
                Some(index) => {
                    matched[index] = true;
                    self.build_matched(existing[index], item)?
                }
                None => self.build_unmatched(item)?,
            };
            let Some(mut child) = child else {
                continue;
            };

            if duplicate {
                for def in &pk {
                    child.errors.push(FieldError::new(&def.name, "has already been taken"));
                }
            }
            if let Some(key) = key {
                seen.push(key);
            }

            debug!(relation = %field, action = ?child.action, "reconciled related item");
            children.push(child);
        }

        let mut output = Vec::with_capacity(existing.len() + children.len());
        for (index, record) in existing.iter().enumerate() {
            if matched[index] {
                continue;
            }

            let action = match self.relation.on_replace {
                OnReplace::Raise => {
                    warn!(relation = %field, "related record replaced under raise policy");
                    return Err(Error::ReplaceForbidden {
                        schema: self.owner.schema().name.clone(),
                        field: field.to_string(),
                    });
                }
                OnReplace::MarkAsInvalid => {
                    debug!(relation = %field, "replacement rejected as invalid");
                    return Ok(Reconciled::Invalid);
                }
                OnReplace::Delete => Action::Delete,
                OnReplace::Nilify | OnReplace::Update => Action::Replace,
            };

            let mut child = Changeset::change((*record).clone());
            child.action = Some(action);
            debug!(relation = %field, action = %action, "replaced related record");
            output.push(child);
        }

        let replaced = !output.is_empty();
        output.extend(children);

        if !replaced && output.iter().all(is_noop_update) {
            debug!(relation = %field, "relation unchanged");
            return Ok(Reconciled::Unchanged);
        }

        Ok(Reconciled::Changed(output))
    }

    fn existing(&self) -> Result<Vec<&'a Record>> {
        match self.owner.related(&self.relation.field) {
            Some(related) if related.is_loaded() => Ok(related.records()),
            _ if self.owner.state == State::Built => Ok(Vec::new()),
            _ => {
                warn!(relation = %self.relation.field, "relation is not loaded");
                Err(Error::AssociationNotLoaded {
                    schema: self.owner.schema().name.clone(),
                    field: self.relation.field.clone(),
                })
            }
        }
    }

    fn build_matched(&self, current: &Record, item: Incoming) -> Result<Option<Changeset>> {
        let child = match item {
            Incoming::Params(params) => self.builder.call(current.clone(), &params)?,
            Incoming::Record(record) => {
                self.check_schema(record.schema())?;
                diff(current, record)?
            }
            Incoming::Changeset(changeset) => {
                self.check_schema(changeset.schema())?;
                changeset
            }
        };

        self.check_action(
            child,
            Action::Update,
            &[Action::Update, Action::Delete],
            "that was already matched",
        )
    }

    fn build_unmatched(&self, item: Incoming) -> Result<Option<Changeset>> {
        let from_params = matches!(item, Incoming::Params(_));
        let child = match item {
            Incoming::Params(params) => {
                self.builder.call(self.relation.build(self.owner), &params)?
            }
            Incoming::Record(record) => {
                self.check_schema(record.schema())?;
                Changeset::change(record)
            }
            Incoming::Changeset(changeset) => {
                self.check_schema(changeset.schema())?;
                changeset
            }
        };

        let default = match child.data.state {
            State::Loaded => Action::Update,
            _ => Action::Insert,
        };
        let child = self.check_action(child, default, &[Action::Insert], "that was not matched")?;

        // Params that cast to nothing insert nothing.
        Ok(child.filter(|child| !(from_params && is_noop_insert(child))))
    }

    /// Assign `default` unless the builder chose an action, then make sure
    /// the action is one the reconciler would have picked. Ignored children
    /// are dropped.
    fn check_action(
        &self,
        mut child: Changeset,
        default: Action,
        allowed: &[Action],
        reason: &'static str,
    ) -> Result<Option<Changeset>> {
        let action = *child.action.get_or_insert(default);

        if action == Action::Ignore {
            debug!(relation = %self.relation.field, "ignored related item");
            return Ok(None);
        }
        if !allowed.contains(&action) {
            warn!(relation = %self.relation.field, action = %action, "action not allowed");
            return Err(Error::ActionNotAllowed {
                field: self.relation.field.clone(),
                action,
                reason,
            });
        }
        Ok(Some(child))
    }

    fn check_schema(&self, schema: &Schema) -> Result<()> {
        if schema.name == self.relation.related.name {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.relation.field.clone(),
                expected: self.relation.related.name.clone(),
                got: schema.name.clone(),
            })
        }
    }
}

fn is_noop_update(child: &Changeset) -> bool {
    child.action == Some(Action::Update) && child.changes.is_empty() && child.is_valid()
}

fn is_noop_insert(child: &Changeset) -> bool {
    child.action == Some(Action::Insert) && child.changes.is_empty() && child.is_valid()
}

fn incoming_key(item: &Incoming, pk: &[&FieldDef]) -> Option<Vec<Value>> {
    if pk.is_empty() {
        return None;
    }

    pk.iter()
        .map(|def| {
            let value = match item {
                Incoming::Params(params) => def
                    .field_type
                    .cast(&Value::from(params.get(&def.name)?))
                    .ok()?,
                Incoming::Record(record) => record.get(&def.name)?.clone(),
                Incoming::Changeset(changeset) => changeset.get_field(&def.name)?.clone(),
            };
            (!value.is_null()).then_some(value)
        })
        .collect()
}

fn record_has_key(record: &Record, pk: &[&FieldDef], key: &[Value]) -> bool {
    pk.iter().zip(key).all(|(def, value)| {
        record
            .get(&def.name)
            .is_some_and(|current| !current.is_null() && def.field_type.equal(current, value))
    })
}

fn same_key(pk: &[&FieldDef], a: &[Value], b: &[Value]) -> bool {
    pk.iter()
        .zip(a.iter().zip(b))
        .all(|(def, (a, b))| def.field_type.equal(a, b))
}

/// Changeset turning `current` into `record`, field by field.
fn diff(current: &Record, record: Record) -> Result<Changeset> {
    let schema = Arc::clone(record.schema());
    let mut child = Changeset::change(current.clone());

    for def in &schema.fields {
        if let Some(value) = record.get(&def.name) {
            child = child.put_change(&def.name, value.clone())?;
        }
    }

    for nested in &schema.relations {
        let Some(related) = record.related(&nested.field) else {
            continue;
        };
        if current.related(&nested.field) == Some(related) {
            continue;
        }
        if let Some(input) = Input::from_related(related.clone()) {
            child = child.put_relation(&nested.field, input)?;
        }
    }

    Ok(child)
}

/// Options for [`Changeset::cast_assoc_with`] and
/// [`Changeset::cast_embed_with`].
#[derive(Debug, Clone, Default)]
pub struct AssocOptions {
    /// The relation must end up non-empty
    pub required: bool,
    pub required_message: Option<String>,
    /// Replaces "is invalid" when the params have the wrong shape
    pub invalid_message: Option<String>,
    /// Builds child changesets instead of the relation's default builder
    pub with: Option<ChangesetFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Assoc,
    Embed,
}

impl Family {
    fn describe(self) -> &'static str {
        match self {
            Family::Assoc => "an association",
            Family::Embed => "an embed",
        }
    }

    fn validation(self) -> ValidationKind {
        match self {
            Family::Assoc => ValidationKind::Assoc,
            Family::Embed => ValidationKind::Embed,
        }
    }

    fn of(relation: &Relation) -> Self {
        if relation.is_embed() {
            Family::Embed
        } else {
            Family::Assoc
        }
    }
}

impl Changeset {
    /// Cast the `field` param of an association through the reconciler.
    pub fn cast_assoc(self, field: &str) -> Result<Self> {
        self.cast_relation(Family::Assoc, field, &AssocOptions::default())
    }

    pub fn cast_assoc_with(self, field: &str, opts: &AssocOptions) -> Result<Self> {
        self.cast_relation(Family::Assoc, field, opts)
    }

    /// Cast the `field` param of an embed through the reconciler.
    pub fn cast_embed(self, field: &str) -> Result<Self> {
        self.cast_relation(Family::Embed, field, &AssocOptions::default())
    }

    pub fn cast_embed_with(self, field: &str, opts: &AssocOptions) -> Result<Self> {
        self.cast_relation(Family::Embed, field, opts)
    }

    /// Replace an association with programmatic input.
    pub fn put_assoc(self, field: &str, input: Input) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        relation_for(&schema, field, Family::Assoc)?;
        self.put_relation(field, input)
    }

    /// Replace an embed with programmatic input.
    pub fn put_embed(self, field: &str, input: Input) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        relation_for(&schema, field, Family::Embed)?;
        self.put_relation(field, input)
    }

    pub(crate) fn put_relation(mut self, field: &str, input: Input) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        let relation = schema.relation(field).ok_or_else(|| Error::NotARelation {
            schema: schema.name.clone(),
            field: field.to_string(),
            family: "a relation",
        })?;

        let outcome = Reconciler::new(relation, &self.data).reconcile(input)?;
        self.put_reconciled(relation, outcome, None);
        Ok(self)
    }

    fn cast_relation(mut self, family: Family, field: &str, opts: &AssocOptions) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        let relation = relation_for(&schema, field, family)?;

        let raw = self.params.as_ref().and_then(|params| params.get(field)).cloned();
        if let Some(raw) = raw {
            match relation_input(relation, raw) {
                Some(input) => {
                    let mut reconciler = Reconciler::new(relation, &self.data);
                    if let Some(builder) = &opts.with {
                        reconciler = reconciler.with_builder(builder.clone());
                    }
                    let outcome = reconciler.reconcile(input)?;
                    self.put_reconciled(relation, outcome, opts.invalid_message.as_deref());
                }
                None => self.push_invalid(relation, opts.invalid_message.as_deref()),
            }
        }

        if opts.required {
            if !self.required.iter().any(|f| f == field) {
                self.required.push(field.to_string());
            }
            if !self.has_error(field) && self.is_missing(field, true) {
                let message = opts.required_message.as_deref().unwrap_or("can't be blank");
                self.errors.push(
                    FieldError::new(field, message).with_validation(ValidationKind::Required),
                );
            }
        }

        Ok(self)
    }

    fn put_reconciled(&mut self, relation: &Relation, outcome: Reconciled, message: Option<&str>) {
        match outcome {
            Reconciled::Changed(children) => {
                self.changes
                    .insert(relation.field.clone(), Change::Relation(children));
            }
            Reconciled::Unchanged => {
                self.changes.shift_remove(&relation.field);
            }
            Reconciled::Invalid => self.push_invalid(relation, message),
        }
    }

    fn push_invalid(&mut self, relation: &Relation, message: Option<&str>) {
        let type_name = match relation.cardinality() {
            Cardinality::One => FieldType::Map,
            Cardinality::Many => FieldType::array(FieldType::Map),
        };
        self.errors.push(
            FieldError::new(&relation.field, message.unwrap_or("is invalid"))
                .with_validation(Family::of(relation).validation())
                .with_opt("type", type_name.to_string()),
        );
    }
}

fn relation_for<'s>(schema: &'s Schema, field: &str, family: Family) -> Result<&'s Relation> {
    match schema.relation(field) {
        Some(relation) if Family::of(relation) == family => Ok(relation),
        _ => Err(Error::NotARelation {
            schema: schema.name.clone(),
            field: field.to_string(),
            family: family.describe(),
        }),
    }
}

/// Shape raw relation params into reconciler input, or `None` if the shape
/// does not fit the relation's cardinality.
///
/// Many-params may be an array of objects or an object keyed by integer
/// strings, taken in numeric key order.
fn relation_input(relation: &Relation, raw: Json) -> Option<Input> {
    match (relation.cardinality(), raw) {
        (Cardinality::One, Json::Null) => Some(Input::One(None)),
        (Cardinality::One, raw @ Json::Object(_)) => {
            Some(Input::One(Some(item_params(raw)?)))
        }
        (Cardinality::Many, Json::Array(items)) => items
            .into_iter()
            .map(item_params)
            .collect::<Option<Vec<_>>>()
            .map(Input::Many),
        (Cardinality::Many, Json::Object(map)) => {
            let mut entries = map
                .into_iter()
                .map(|(key, value)| key.parse::<i64>().ok().map(|index| (index, value)))
                .collect::<Option<Vec<_>>>()?;
            entries.sort_by_key(|(index, _)| *index);
            entries
                .into_iter()
                .map(|(_, value)| item_params(value))
                .collect::<Option<Vec<_>>>()
                .map(Input::Many)
        }
        _ => None,
    }
}

fn item_params(raw: Json) -> Option<Incoming> {
    match raw {
        Json::Object(_) => Params::try_from(raw).ok().map(Incoming::Params),
        _ => None,
    }
}
