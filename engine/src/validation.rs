//! Validators.
//!
//! Validators inspect pending changes and append [`FieldError`]s. Apart
//! from [`Changeset::validate_required`], [`Changeset::validate_confirmation`]
//! and [`Changeset::validate_acceptance`], a validator only looks at a
//! field when it has a non-`nil` pending change. Every validator except the
//! required check records a [`Validation`] descriptor, whatever the outcome.

use crate::{
    changeset::scalar_field, config::RequiredOptions, error::Result, Changeset, Error,
    FieldError, FieldType, Value,
};
use indexmap::IndexMap;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt, sync::Arc};

/// Tag identifying the check that produced a field error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Cast,
    Required,
    Format,
    Inclusion,
    Exclusion,
    Subset,
    Length,
    Number,
    Confirmation,
    Acceptance,
    Change,
    UnsafeUnique,
    Assoc,
    Embed,
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationKind::Cast => "cast",
            ValidationKind::Required => "required",
            ValidationKind::Format => "format",
            ValidationKind::Inclusion => "inclusion",
            ValidationKind::Exclusion => "exclusion",
            ValidationKind::Subset => "subset",
            ValidationKind::Length => "length",
            ValidationKind::Number => "number",
            ValidationKind::Confirmation => "confirmation",
            ValidationKind::Acceptance => "acceptance",
            ValidationKind::Change => "change",
            ValidationKind::UnsafeUnique => "unsafe_unique",
            ValidationKind::Assoc => "assoc",
            ValidationKind::Embed => "embed",
        };
        f.write_str(name)
    }
}

/// Descriptor of a validation run on a field.
#[derive(Debug, Clone)]
pub enum Validation {
    Format(Regex),
    Inclusion(Vec<Value>),
    Exclusion(Vec<Value>),
    Subset(Vec<Value>),
    Length(LengthRule),
    Number(NumberRule),
    Confirmation,
    Acceptance,
    Change,
    UnsafeUnique(Vec<String>),
}

impl Validation {
    pub fn kind(&self) -> ValidationKind {
        match self {
            Validation::Format(_) => ValidationKind::Format,
            Validation::Inclusion(_) => ValidationKind::Inclusion,
            Validation::Exclusion(_) => ValidationKind::Exclusion,
            Validation::Subset(_) => ValidationKind::Subset,
            Validation::Length(_) => ValidationKind::Length,
            Validation::Number(_) => ValidationKind::Number,
            Validation::Confirmation => ValidationKind::Confirmation,
            Validation::Acceptance => ValidationKind::Acceptance,
            Validation::Change => ValidationKind::Change,
            Validation::UnsafeUnique(_) => ValidationKind::UnsafeUnique,
        }
    }
}

impl PartialEq for Validation {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Validation::Format(a), Validation::Format(b)) => a.as_str() == b.as_str(),
            (Validation::Inclusion(a), Validation::Inclusion(b))
            | (Validation::Exclusion(a), Validation::Exclusion(b))
            | (Validation::Subset(a), Validation::Subset(b)) => a == b,
            (Validation::Length(a), Validation::Length(b)) => a == b,
            (Validation::Number(a), Validation::Number(b)) => a == b,
            (Validation::UnsafeUnique(a), Validation::UnsafeUnique(b)) => a == b,
            (a, b) => a.kind() == b.kind(),
        }
    }
}

/// How string length is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Count {
    #[default]
    Codepoints,
    Bytes,
}

/// Options for [`Changeset::validate_length`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LengthRule {
    pub is: Option<usize>,
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub count: Count,
    pub message: Option<String>,
}

impl LengthRule {
    pub fn is(len: usize) -> Self {
        Self {
            is: Some(len),
            ..Self::default()
        }
    }

    pub fn min(mut self, min: usize) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    pub fn count(mut self, count: Count) -> Self {
        self.count = count;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Options for [`Changeset::validate_number`].
///
/// Bounds are checked in declaration order; the first failure wins.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NumberRule {
    pub less_than: Option<Value>,
    pub greater_than: Option<Value>,
    pub less_than_or_equal_to: Option<Value>,
    pub greater_than_or_equal_to: Option<Value>,
    pub equal_to: Option<Value>,
    pub not_equal_to: Option<Value>,
    pub message: Option<String>,
}

impl NumberRule {
    pub fn less_than(mut self, bound: impl Into<Value>) -> Self {
        self.less_than = Some(bound.into());
        self
    }

    pub fn greater_than(mut self, bound: impl Into<Value>) -> Self {
        self.greater_than = Some(bound.into());
        self
    }

    pub fn less_than_or_equal_to(mut self, bound: impl Into<Value>) -> Self {
        self.less_than_or_equal_to = Some(bound.into());
        self
    }

    pub fn greater_than_or_equal_to(mut self, bound: impl Into<Value>) -> Self {
        self.greater_than_or_equal_to = Some(bound.into());
        self
    }

    pub fn equal_to(mut self, bound: impl Into<Value>) -> Self {
        self.equal_to = Some(bound.into());
        self
    }

    pub fn not_equal_to(mut self, bound: impl Into<Value>) -> Self {
        self.not_equal_to = Some(bound.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn bounds(&self) -> [(&'static str, &'static str, Option<&Value>); 6] {
        [
            ("less_than", "must be less than %{number}", self.less_than.as_ref()),
            ("greater_than", "must be greater than %{number}", self.greater_than.as_ref()),
            (
                "less_than_or_equal_to",
                "must be less than or equal to %{number}",
                self.less_than_or_equal_to.as_ref(),
            ),
            (
                "greater_than_or_equal_to",
                "must be greater than or equal to %{number}",
                self.greater_than_or_equal_to.as_ref(),
            ),
            ("equal_to", "must be equal to %{number}", self.equal_to.as_ref()),
            ("not_equal_to", "must be not equal to %{number}", self.not_equal_to.as_ref()),
        ]
    }
}

/// Options for [`Changeset::validate_confirmation`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfirmationOptions {
    /// Missing confirmation params are an error
    pub required: bool,
    pub message: Option<String>,
}

/// Lookup handed to a [`UniquenessQuery`].
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueQuery {
    /// Storage source to search
    pub source: String,
    /// Field values that must all match
    pub filters: IndexMap<String, Value>,
    /// Primary key of the record being changed, when it is already stored
    pub exclude: Option<IndexMap<String, Value>>,
}

/// Answers whether a record matching a [`UniqueQuery`] already exists.
pub trait UniquenessQuery {
    fn exists(&self, query: &UniqueQuery) -> bool;
}

impl<F> UniquenessQuery for F
where
    F: Fn(&UniqueQuery) -> bool,
{
    fn exists(&self, query: &UniqueQuery) -> bool {
        self(query)
    }
}

impl Changeset {
    /// Require every field in `fields` to hold a non-blank value.
    pub fn validate_required<S: AsRef<str>>(self, fields: &[S]) -> Result<Self> {
        self.validate_required_with(fields, &RequiredOptions::default())
    }

    /// Require every field in `fields` to hold a non-blank value.
    ///
    /// Fields that already carry an error are not flagged again, so the
    /// outcome does not depend on call order.
    pub fn validate_required_with<S: AsRef<str>>(
        mut self,
        fields: &[S],
        opts: &RequiredOptions,
    ) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        let message = opts.message.as_deref().unwrap_or("can't be blank");

        let mut blank: Vec<String> = Vec::new();
        for field in fields {
            let field = field.as_ref();
            if schema.field(field).is_none() && schema.relation(field).is_none() {
                return Err(Error::UnknownField {
                    schema: schema.name.clone(),
                    field: field.to_string(),
                });
            }

            if !self.required.iter().any(|f| f == field) {
                self.required.push(field.to_string());
            }
            if !self.has_error(field)
                && !blank.iter().any(|f| f == field)
                && self.is_missing(field, opts.trim)
            {
                blank.push(field.to_string());
            }
        }

        for field in blank {
            self.errors.push(
                FieldError::new(field, message).with_validation(ValidationKind::Required),
            );
        }
        Ok(self)
    }

    /// Run `validator` over the pending change of `field`, if any.
    ///
    /// The closure receives the field name and the new value and returns
    /// the errors to add.
    pub fn validate_change<F>(self, field: &str, validator: F) -> Self
    where
        F: FnOnce(&str, &Value) -> Vec<FieldError>,
    {
        self.validate_with(field, Validation::Change, validator)
    }

    fn validate_with<F>(mut self, field: &str, validation: Validation, validator: F) -> Self
    where
        F: FnOnce(&str, &Value) -> Vec<FieldError>,
    {
        self.validations.push((field.to_string(), validation));

        let errors = match self.get_change(field) {
            Some(value) if !value.is_null() => validator(field, value),
            _ => Vec::new(),
        };
        self.errors.extend(errors);
        self
    }

    /// String changes must match `format`.
    pub fn validate_format(self, field: &str, format: Regex) -> Self {
        let validation = Validation::Format(format.clone());
        self.validate_with(field, validation, |field, value| match value {
            Value::String(s) if !format.is_match(s) => vec![FieldError::new(
                field,
                "has invalid format",
            )
            .with_validation(ValidationKind::Format)],
            _ => Vec::new(),
        })
    }

    /// The change must be one of `allowed`.
    pub fn validate_inclusion(self, field: &str, allowed: Vec<Value>) -> Self {
        let validation = Validation::Inclusion(allowed.clone());
        self.validate_with(field, validation, |field, value| {
            if allowed.contains(value) {
                Vec::new()
            } else {
                vec![FieldError::new(field, "is invalid")
                    .with_validation(ValidationKind::Inclusion)
                    .with_opt("enum", allowed)]
            }
        })
    }

    /// The change must not be one of `reserved`.
    pub fn validate_exclusion(self, field: &str, reserved: Vec<Value>) -> Self {
        let validation = Validation::Exclusion(reserved.clone());
        self.validate_with(field, validation, |field, value| {
            if reserved.contains(value) {
                vec![FieldError::new(field, "is reserved")
                    .with_validation(ValidationKind::Exclusion)
                    .with_opt("enum", reserved)]
            } else {
                Vec::new()
            }
        })
    }

    /// Every element of an array change must be one of `allowed`.
    pub fn validate_subset(self, field: &str, allowed: Vec<Value>) -> Self {
        let validation = Validation::Subset(allowed.clone());
        self.validate_with(field, validation, |field, value| {
            let items = value.as_array().unwrap_or_default();
            if items.iter().all(|item| allowed.contains(item)) {
                Vec::new()
            } else {
                vec![FieldError::new(field, "has an invalid entry")
                    .with_validation(ValidationKind::Subset)
                    .with_opt("enum", allowed)]
            }
        })
    }

    /// Check the length of a string, binary, array or map change.
    pub fn validate_length(self, field: &str, rule: LengthRule) -> Self {
        let validation = Validation::Length(rule.clone());
        self.validate_with(field, validation, |field, value| {
            length_error(field, value, &rule).into_iter().collect()
        })
    }

    /// Compare a numeric change against the bounds in `rule`.
    ///
    /// Non-numeric values are a type mismatch.
    pub fn validate_number(self, field: &str, rule: NumberRule) -> Result<Self> {
        if let Some(value) = self.get_change(field).filter(|v| !v.is_null()) {
            let unordered = rule
                .bounds()
                .into_iter()
                .filter_map(|(_, _, bound)| bound)
                .chain(std::iter::once(value))
                .find(|v| compare_numbers(v, v).is_none());

            if let Some(bad) = unordered {
                return Err(Error::TypeMismatch {
                    field: field.to_string(),
                    expected: "number".to_string(),
                    got: bad.kind_name().to_string(),
                });
            }
        }

        let validation = Validation::Number(rule.clone());
        Ok(self.validate_with(field, validation, |field, value| {
            number_error(field, value, &rule).into_iter().collect()
        }))
    }

    /// Compare the raw `field` param against `"<field>_confirmation"`.
    ///
    /// Errors land on the confirmation field.
    pub fn validate_confirmation(mut self, field: &str, opts: &ConfirmationOptions) -> Self {
        let confirmation = format!("{field}_confirmation");
        self.validations
            .push((field.to_string(), Validation::Confirmation));

        let Some(params) = &self.params else {
            return self;
        };
        let Some(value) = params.get(field) else {
            return self;
        };

        let error = match params.get(&confirmation) {
            Some(confirmed) if confirmed == value => None,
            Some(_) => Some(
                FieldError::new(
                    &confirmation,
                    opts.message
                        .as_deref()
                        .unwrap_or("does not match confirmation"),
                )
                .with_validation(ValidationKind::Confirmation),
            ),
            None if opts.required => Some(
                FieldError::new(&confirmation, "can't be blank")
                    .with_validation(ValidationKind::Required),
            ),
            None => None,
        };

        self.errors.extend(error);
        self
    }

    /// The raw `field` param must cast to `true`.
    pub fn validate_acceptance(mut self, field: &str) -> Self {
        self.validations
            .push((field.to_string(), Validation::Acceptance));

        let Some(params) = &self.params else {
            return self;
        };
        let raw = params.get(field).map(Value::from).unwrap_or_default();

        if FieldType::Boolean.cast(&raw) != Ok(Value::Bool(true)) {
            self.errors.push(
                FieldError::new(field, "must be accepted")
                    .with_validation(ValidationKind::Acceptance),
            );
        }
        self
    }

    /// Ask `query` whether another record already holds the values of
    /// `fields`.
    ///
    /// This is a best-effort check; only a unique constraint can guarantee
    /// uniqueness. It is skipped when any of the fields has an error, none
    /// of them changed, or any of them is `nil`. The error goes on the first
    /// field.
    pub fn unsafe_validate_unique<S, Q>(mut self, fields: &[S], query: &Q) -> Result<Self>
    where
        S: AsRef<str>,
        Q: UniquenessQuery + ?Sized,
    {
        let schema = Arc::clone(self.data.schema());
        let names = fields
            .iter()
            .map(|field| scalar_field(&schema, field.as_ref()).map(|def| def.name.clone()))
            .collect::<Result<Vec<_>>>()?;
        let Some(first) = names.first().cloned() else {
            return Ok(self);
        };

        self.validations
            .push((first.clone(), Validation::UnsafeUnique(names.clone())));

        let skip = names.iter().any(|name| self.has_error(name))
            || !names.iter().any(|name| self.changed(name));
        if skip {
            return Ok(self);
        }

        let mut filters = IndexMap::new();
        for name in &names {
            match self.get_field(name) {
                Some(value) if !value.is_null() => {
                    filters.insert(name.clone(), value.clone());
                }
                _ => return Ok(self),
            }
        }

        let exclude = match self.data.state {
            crate::State::Loaded => {
                let key: IndexMap<String, Value> = schema
                    .primary_key()
                    .filter_map(|def| {
                        self.data
                            .get(&def.name)
                            .map(|value| (def.name.clone(), value.clone()))
                    })
                    .collect();
                (!key.is_empty()).then_some(key)
            }
            _ => None,
        };

        let unique = UniqueQuery {
            source: schema.source_name(),
            filters,
            exclude,
        };

        if query.exists(&unique) {
            let fields = names.iter().map(|name| Value::from(name.as_str())).collect::<Vec<_>>();
            self.errors.push(
                FieldError::new(first, "has already been taken")
                    .with_validation(ValidationKind::UnsafeUnique)
                    .with_opt("fields", fields),
            );
        }
        Ok(self)
    }
}

fn length_error(field: &str, value: &Value, rule: &LengthRule) -> Option<FieldError> {
    let (kind, len, unit) = match value {
        Value::String(s) => match rule.count {
            Count::Codepoints => ("string", s.chars().count(), "character(s)"),
            Count::Bytes => ("binary", s.len(), "byte(s)"),
        },
        Value::Binary(b) => ("binary", b.len(), "byte(s)"),
        Value::Array(items) => ("list", items.len(), "item(s)"),
        Value::Map(map) => ("map", map.len(), "item(s)"),
        _ => return None,
    };

    let verb = if unit == "item(s)" { "should have" } else { "should be" };

    let (bound, count) = if let Some(is) = rule.is.filter(|is| len != *is) {
        ("is", is)
    } else if let Some(min) = rule.min.filter(|min| len < *min) {
        ("min", min)
    } else if let Some(max) = rule.max.filter(|max| len > *max) {
        ("max", max)
    } else {
        return None;
    };

    let message = rule.message.clone().unwrap_or_else(|| match bound {
        "is" => format!("{verb} %{{count}} {unit}"),
        "min" => format!("{verb} at least %{{count}} {unit}"),
        _ => format!("{verb} at most %{{count}} {unit}"),
    });

    Some(
        FieldError::new(field, message)
            .with_validation(ValidationKind::Length)
            .with_opt("kind", bound)
            .with_opt("count", count as i64)
            .with_opt("type", kind),
    )
}

fn number_error(field: &str, value: &Value, rule: &NumberRule) -> Option<FieldError> {
    for (kind, message, bound) in rule.bounds() {
        let Some(bound) = bound else {
            continue;
        };
        let Some(ordering) = compare_numbers(value, bound) else {
            continue;
        };

        let ok = match kind {
            "less_than" => ordering == Ordering::Less,
            "greater_than" => ordering == Ordering::Greater,
            "less_than_or_equal_to" => ordering != Ordering::Greater,
            "greater_than_or_equal_to" => ordering != Ordering::Less,
            "equal_to" => ordering == Ordering::Equal,
            _ => ordering != Ordering::Equal,
        };

        if !ok {
            let message = rule.message.clone().unwrap_or_else(|| message.to_string());
            return Some(
                FieldError::new(field, message)
                    .with_validation(ValidationKind::Number)
                    .with_opt("kind", kind)
                    .with_opt("number", bound.clone()),
            );
        }
    }
    None
}

/// Order two numeric values. Mixed integer/float/decimal comparisons go
/// through `Decimal` when either side is a decimal.
fn compare_numbers(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
            Some(to_decimal(a)?.cmp(&to_decimal(b)?))
        }
        _ => to_f64(a)?.partial_cmp(&to_f64(b)?),
    }
}

fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Integer(v) => Some(Decimal::from(*v)),
        Value::Float(v) => Decimal::try_from(*v).ok(),
        Value::Decimal(d) => Some(*d),
        _ => None,
    }
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(v) => Some(*v as f64),
        Value::Float(v) => Some(*v),
        _ => None,
    }
}
