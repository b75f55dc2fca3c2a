//! Storage constraints and the constraint mapper.
//!
//! A changeset declares which storage constraints it knows how to report.
//! When the repository signals a [`Violation`], [`Changeset::apply_violation`]
//! turns it into a field error, or fails if nothing was declared for it.

use crate::{
    error::Result, Changeset, Error, FieldError, RelationKind, Schema, Value,
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::warn;

/// Kind of storage constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    Exclusion,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::Unique => write!(f, "unique"),
            ConstraintKind::ForeignKey => write!(f, "foreign_key"),
            ConstraintKind::Check => write!(f, "check"),
            ConstraintKind::Exclusion => write!(f, "exclusion"),
        }
    }
}

/// How a declared constraint name is compared with a reported one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Exact,
    Prefix,
    Suffix,
}

impl MatchMode {
    pub fn matches(&self, declared: &str, reported: &str) -> bool {
        match self {
            MatchMode::Exact => declared == reported,
            MatchMode::Prefix => reported.starts_with(declared),
            MatchMode::Suffix => reported.ends_with(declared),
        }
    }
}

/// A constraint declared on a changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Constraint {
    pub kind: ConstraintKind,
    /// Field the error is reported on
    pub field: String,
    /// Storage name of the constraint
    pub name: String,
    pub match_mode: MatchMode,
    pub message: String,
    /// Tag stored in the error's `constraint` option
    pub error_type: &'static str,
}

/// A constraint violation reported by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ConstraintKind,
    /// Storage name of the violated constraint
    pub constraint: String,
}

impl Violation {
    pub fn new(kind: ConstraintKind, constraint: impl Into<String>) -> Self {
        Self {
            kind,
            constraint: constraint.into(),
        }
    }
}

/// Optional overrides for a constraint declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintOptions {
    pub name: Option<String>,
    pub match_mode: MatchMode,
    pub message: Option<String>,
}

impl ConstraintOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn match_mode(mut self, match_mode: MatchMode) -> Self {
        self.match_mode = match_mode;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl Changeset {
    /// Report unique violations of `<source>_<field>_index` on `field`.
    pub fn unique_constraint(self, field: &str) -> Self {
        self.unique_constraint_with(field, ConstraintOptions::default())
    }

    pub fn unique_constraint_with(self, field: &str, opts: ConstraintOptions) -> Self {
        let name = format!("{}_{field}_index", self.source());
        self.declare(ConstraintKind::Unique, field, name, opts, "has already been taken", "unique")
    }

    /// Report foreign key violations of `<source>_<field>_fkey` on `field`.
    pub fn foreign_key_constraint(self, field: &str) -> Self {
        self.foreign_key_constraint_with(field, ConstraintOptions::default())
    }

    pub fn foreign_key_constraint_with(self, field: &str, opts: ConstraintOptions) -> Self {
        let name = format!("{}_{field}_fkey", self.source());
        self.declare(ConstraintKind::ForeignKey, field, name, opts, "does not exist", "foreign")
    }

    /// Report a missing parent of a `belongs_to` association on the
    /// association field.
    pub fn assoc_constraint(self, field: &str) -> Result<Self> {
        self.assoc_constraint_with(field, ConstraintOptions::default())
    }

    pub fn assoc_constraint_with(self, field: &str, opts: ConstraintOptions) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        let relation = match schema.relation(field) {
            Some(relation) if relation.kind == RelationKind::BelongsTo => relation,
            _ => return Err(not_a(&schema, field, "a belongs_to association")),
        };

        let name = format!("{}_{}_fkey", self.source(), relation.owner_key);
        Ok(self.declare(
            ConstraintKind::ForeignKey,
            field,
            name,
            opts,
            "does not exist",
            "assoc",
        ))
    }

    /// Report deletes blocked by records still pointing at this one through
    /// a `has_one` or `has_many` association.
    pub fn no_assoc_constraint(self, field: &str) -> Result<Self> {
        self.no_assoc_constraint_with(field, ConstraintOptions::default())
    }

    pub fn no_assoc_constraint_with(self, field: &str, opts: ConstraintOptions) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        let (relation, message) = match schema.relation(field) {
            Some(relation) if relation.kind == RelationKind::HasOne => {
                (relation, "is still associated with this entry")
            }
            Some(relation) if relation.kind == RelationKind::HasMany => {
                (relation, "are still associated with this entry")
            }
            _ => return Err(not_a(&schema, field, "a has_one or has_many association")),
        };

        let name = format!(
            "{}_{}_fkey",
            relation.related.source_name(),
            relation.related_key
        );
        Ok(self.declare(
            ConstraintKind::ForeignKey,
            field,
            name,
            opts,
            message,
            "no_assoc",
        ))
    }

    /// Report check violations on `field`. Check constraints have no
    /// conventional name, so `opts.name` is required.
    pub fn check_constraint(self, field: &str, opts: ConstraintOptions) -> Result<Self> {
        if opts.name.is_none() {
            return Err(Error::MissingConstraintName {
                field: field.to_string(),
                kind: ConstraintKind::Check,
            });
        }
        Ok(self.declare(
            ConstraintKind::Check,
            field,
            String::new(),
            opts,
            "is invalid",
            "check",
        ))
    }

    /// Report exclusion violations of `<source>_<field>_exclusion` on `field`.
    pub fn exclusion_constraint(self, field: &str) -> Self {
        self.exclusion_constraint_with(field, ConstraintOptions::default())
    }

    pub fn exclusion_constraint_with(self, field: &str, opts: ConstraintOptions) -> Self {
        let name = format!("{}_{field}_exclusion", self.source());
        self.declare(
            ConstraintKind::Exclusion,
            field,
            name,
            opts,
            "violates an exclusion constraint",
            "exclusion",
        )
    }

    fn source(&self) -> String {
        self.data.schema().source_name()
    }

    fn declare(
        mut self,
        kind: ConstraintKind,
        field: &str,
        default_name: String,
        opts: ConstraintOptions,
        default_message: &str,
        error_type: &'static str,
    ) -> Self {
        self.constraints.push(Constraint {
            kind,
            field: field.to_string(),
            name: opts.name.unwrap_or(default_name),
            match_mode: opts.match_mode,
            message: opts.message.unwrap_or_else(|| default_message.to_string()),
            error_type,
        });
        self
    }

    /// Turn a storage violation into a field error.
    ///
    /// Fails with [`Error::UnhandledConstraint`] when no declared
    /// constraint matches.
    pub fn apply_violation(mut self, violation: &Violation) -> Result<Self> {
        let found = self.constraints.iter().find(|constraint| {
            constraint.kind == violation.kind
                && constraint
                    .match_mode
                    .matches(&constraint.name, &violation.constraint)
        });

        let Some(constraint) = found else {
            warn!(
                kind = %violation.kind,
                constraint = %violation.constraint,
                "unhandled constraint violation"
            );
            return Err(Error::UnhandledConstraint {
                kind: violation.kind,
                constraint: violation.constraint.clone(),
            });
        };

        let error = FieldError::new(&constraint.field, &constraint.message)
            .with_opt("constraint", constraint.error_type)
            .with_opt("constraint_name", Value::from(constraint.name.as_str()));
        self.errors.push(error);
        Ok(self)
    }

    pub fn apply_violations(self, violations: &[Violation]) -> Result<Self> {
        violations
            .iter()
            .try_fold(self, |changeset, violation| changeset.apply_violation(violation))
    }
}

fn not_a(schema: &Schema, field: &str, family: &'static str) -> Error {
    Error::NotARelation {
        schema: schema.name.clone(),
        field: field.to_string(),
        family,
    }
}
