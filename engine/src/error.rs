//! Error types for the changeset engine.
//!
//! Only programmer and contract errors live here. Bad user input never
//! produces an [`Error`]; it is accumulated as [`FieldError`]s on the
//! changeset instead.
//!
//! [`FieldError`]: crate::FieldError

use crate::{Action, Cardinality, ConstraintKind, OnReplace, RelationKind};
use thiserror::Error;

/// All fatal errors raised by the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema misuse
    #[error("unknown field `{field}` for schema `{schema}`")]
    UnknownField { schema: String, field: String },

    #[error("`{field}` is a relation of `{schema}`; change it through the relation functions")]
    CastRelation { schema: String, field: String },

    #[error("`{field}` is not {family} of `{schema}`")]
    NotARelation {
        schema: String,
        field: String,
        family: &'static str,
    },

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Params
    #[error("params mix string and symbol keys (`{text}` and `{symbol}`)")]
    MixedKeys { text: String, symbol: String },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    // Relations
    #[error("relation `{field}` of `{schema}` is not loaded")]
    AssociationNotLoaded { schema: String, field: String },

    #[error(
        "attempted to replace related records in `{field}` of `{schema}`, \
         but its on_replace policy is `raise`"
    )]
    ReplaceForbidden { schema: String, field: String },

    #[error("on_replace `{policy}` is not supported by {kind} relation `{field}`")]
    UnsupportedOnReplace {
        field: String,
        kind: RelationKind,
        policy: OnReplace,
    },

    #[error("`{field}` is a `{expected}` relation; input has the wrong cardinality")]
    CardinalityMismatch {
        field: String,
        expected: Cardinality,
    },

    #[error("cannot {action} related `{field}` {reason}")]
    ActionNotAllowed {
        field: String,
        action: Action,
        reason: &'static str,
    },

    // Actions
    #[error("action conflict: changeset is already `{current}`, cannot become `{requested}`")]
    ActionConflict { current: Action, requested: Action },

    #[error("cannot merge changesets built from different data")]
    DataMismatch,

    // Constraints
    #[error(
        "{kind} constraint `{constraint}` was violated, but the changeset \
         does not declare a matching constraint"
    )]
    UnhandledConstraint {
        kind: ConstraintKind,
        constraint: String,
    },

    #[error("{kind} constraint on `{field}` requires an explicit name")]
    MissingConstraintName { field: String, kind: ConstraintKind },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownField {
            schema: "Post".into(),
            field: "titel".into(),
        };
        assert_eq!(err.to_string(), "unknown field `titel` for schema `Post`");

        let err = Error::ActionConflict {
            current: Action::Insert,
            requested: Action::Update,
        };
        assert_eq!(
            err.to_string(),
            "action conflict: changeset is already `insert`, cannot become `update`"
        );

        let err = Error::ActionNotAllowed {
            field: "comments".into(),
            action: Action::Update,
            reason: "that was not matched",
        };
        assert_eq!(
            err.to_string(),
            "cannot update related `comments` that was not matched"
        );

        let err = Error::TypeMismatch {
            field: "visits".into(),
            expected: "integer".into(),
            got: "string".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'visits': expected integer, got string"
        );
    }

    #[test]
    fn policy_errors_name_the_policy() {
        let err = Error::UnsupportedOnReplace {
            field: "tags".into(),
            kind: RelationKind::ManyToMany,
            policy: OnReplace::Nilify,
        };
        assert_eq!(
            err.to_string(),
            "on_replace `nilify` is not supported by many_to_many relation `tags`"
        );
    }
}
