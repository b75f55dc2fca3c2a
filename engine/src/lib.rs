//! # Changeset Engine
//!
//! A deterministic engine for casting, validating and tracking changes to
//! typed records.
//!
//! The engine takes an existing record plus untrusted input, casts the
//! input field by field against a declared schema, runs validators, and
//! produces a [`Changeset`]: the delta a persistence layer later executes.
//! For relations it reconciles the related records already present against
//! the incoming ones and decides per item whether to insert, update, delete
//! or replace.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never talks to storage; see [`repo::Repository`]
//! - **Deterministic**: the same inputs always produce the same changeset,
//!   including the order of errors and relation children
//! - **Two error channels**: bad input becomes [`FieldError`]s on the
//!   changeset, API misuse returns an [`Error`]
//!
//! ## Core Concepts
//!
//! ### Schemas and records
//!
//! A [`Schema`] lists [`FieldDef`]s and [`Relation`]s. A [`Record`] holds one
//! [`Value`] per field and one [`Related`] slot per relation.
//!
//! ### Casting
//!
//! [`FieldType::cast`] turns raw values into typed ones or rejects them.
//! [`Changeset::cast`] applies it to every permitted field of the params.
//!
//! ### Validation
//!
//! Validators such as [`Changeset::validate_required`] and
//! [`Changeset::validate_length`] append errors and record a
//! [`Validation`] descriptor.
//!
//! ### Relations
//!
//! [`Changeset::cast_assoc`] and friends run the [`Reconciler`], which
//! applies the relation's [`OnReplace`] policy to existing records that
//! have no counterpart in the input.
//!
//! ### Constraints
//!
//! Declared constraints let [`Changeset::apply_violation`] turn a storage
//! violation into a field error.
//!
//! ## Quick Start
//!
//! ```rust
//! use changeset_engine::{
//!     Changeset, ErrorTree, FieldDef, FieldType, LengthRule, Record, Schema,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! // 1. Define a schema
//! let schema = Arc::new(
//!     Schema::new("Post")
//!         .with_field(FieldDef::primary_key("id", FieldType::Id))
//!         .with_field(FieldDef::new("title", FieldType::String)),
//! );
//!
//! // 2. Cast and validate input
//! let changeset = Changeset::cast(Record::new(&schema), json!({"title": "wo"}), &["title"])?
//!     .validate_required(&["title"])?
//!     .validate_length("title", LengthRule::default().min(3));
//!
//! // 3. Render errors
//! assert!(!changeset.is_valid());
//! let errors = changeset.traverse_errors(|error| error.interpolated());
//! assert_eq!(
//!     errors["title"],
//!     ErrorTree::Messages(vec!["should be at least 3 character(s)".into()])
//! );
//! # Ok::<(), changeset_engine::Error>(())
//! ```

pub mod changeset;
pub mod config;
pub mod constraint;
pub mod error;
pub mod params;
pub mod reconcile;
pub mod record;
pub mod render;
pub mod repo;
pub mod schema;
pub mod ty;
pub mod validation;
pub mod value;

// Re-export main types at crate root
pub use changeset::{Action, Change, Changeset, FieldError, FieldSource, Outcome};
pub use config::{CastOptions, Config, ConfigError, EmptyValues, RequiredOptions};
pub use constraint::{Constraint, ConstraintKind, ConstraintOptions, MatchMode, Violation};
pub use error::Error;
pub use params::{IntoParams, ParamKey, Params};
pub use reconcile::{AssocOptions, Incoming, Input, Reconciled, Reconciler};
pub use record::{Record, Related, State};
pub use render::ErrorTree;
pub use repo::Repository;
pub use schema::{
    Cardinality, ChangesetFn, DefaultsFn, FieldDef, OnReplace, Relation, RelationKind, Schema,
};
pub use ty::{CastError, CustomType, FieldType};
pub use validation::{
    ConfirmationOptions, Count, LengthRule, NumberRule, UniqueQuery, UniquenessQuery, Validation,
    ValidationKind,
};
pub use value::Value;
