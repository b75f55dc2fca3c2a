//! Persistence boundary.
//!
//! The engine never talks to storage. A [`Repository`] executes a valid
//! changeset and either returns the stored record or reports a constraint
//! [`Violation`]. The drivers here assign the action, skip storage for
//! invalid or empty changesets and route violations through the constraint
//! mapper.

use crate::{
    changeset::{scalar_field, Outcome},
    error::Result,
    Action, Change, Changeset, Error, Record, Value, Violation,
};
use std::sync::Arc;
use tracing::debug;

/// Executes changesets against storage.
pub trait Repository {
    /// Persist `changeset` according to its action.
    fn execute(&mut self, changeset: &Changeset) -> std::result::Result<Record, Violation>;
}

/// Insert the changeset's data with its changes applied.
pub fn insert<R: Repository + ?Sized>(repo: &mut R, changeset: Changeset) -> Result<Outcome> {
    run(repo, changeset, Action::Insert)
}

/// Update the changeset's data. Without changes, the data is returned
/// and storage is not touched.
pub fn update<R: Repository + ?Sized>(repo: &mut R, changeset: Changeset) -> Result<Outcome> {
    run(repo, changeset, Action::Update)
}

/// Delete the changeset's data.
pub fn delete<R: Repository + ?Sized>(repo: &mut R, changeset: Changeset) -> Result<Outcome> {
    run(repo, changeset, Action::Delete)
}

fn run<R: Repository + ?Sized>(repo: &mut R, changeset: Changeset, action: Action) -> Result<Outcome> {
    let changeset = changeset.put_action(action)?;

    if !changeset.is_valid() {
        debug!(action = %action, errors = changeset.errors.len(), "skipping invalid changeset");
        return Ok(Err(changeset));
    }

    if action == Action::Update && changeset.changes.is_empty() {
        debug!("skipping update without changes");
        return Ok(Ok(changeset.data.clone()));
    }

    match repo.execute(&changeset) {
        Ok(record) => Ok(Ok(record)),
        Err(violation) => {
            debug!(
                kind = %violation.kind,
                constraint = %violation.constraint,
                "storage reported a violation"
            );
            changeset.apply_violation(&violation).map(Err)
        }
    }
}

impl Changeset {
    /// Guard the next update with the current value of `field`.
    ///
    /// The current value becomes a filter and the field is changed to the
    /// value plus one. A `nil` counter starts at one.
    pub fn optimistic_lock(mut self, field: &str) -> Result<Self> {
        let schema = Arc::clone(self.data.schema());
        let def = scalar_field(&schema, field)?;

        let current = self.data.get(field).cloned().unwrap_or_default();
        let next = match &current {
            Value::Null if def.field_type.is_integer() => 1,
            Value::Integer(v) if def.field_type.is_integer() => v.saturating_add(1),
            other => {
                return Err(Error::TypeMismatch {
                    field: field.to_string(),
                    expected: "integer".to_string(),
                    got: other.kind_name().to_string(),
                })
            }
        };

        self.filters.insert(def.name.clone(), current);
        self.changes
            .insert(def.name.clone(), Change::Value(Value::Integer(next)));
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConstraintKind, FieldDef, FieldType, Schema};
    use serde_json::json;

    #[derive(Default)]
    struct MemoryRepo {
        executed: Vec<(Option<Action>, Vec<String>)>,
        violation: Option<Violation>,
    }

    impl Repository for MemoryRepo {
        fn execute(&mut self, changeset: &Changeset) -> std::result::Result<Record, Violation> {
            self.executed.push((
                changeset.action(),
                changeset.changes().keys().cloned().collect(),
            ));
            match self.violation.take() {
                Some(violation) => Err(violation),
                None => Ok(changeset.apply_changes().loaded()),
            }
        }
    }

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new("Post")
                .with_field(FieldDef::primary_key("id", FieldType::Id))
                .with_field(FieldDef::new("slug", FieldType::String))
                .with_field(FieldDef::new("lock_version", FieldType::Integer).with_default(1)),
        )
    }

    #[test]
    fn insert_executes_valid_changesets() {
        let mut repo = MemoryRepo::default();
        let changeset =
            Changeset::cast(Record::new(&schema()), json!({"slug": "hello"}), &["slug"]).unwrap();

        let record = insert(&mut repo, changeset).unwrap().unwrap();
        assert_eq!(record.get("slug"), Some(&Value::from("hello")));
        assert_eq!(repo.executed, vec![(Some(Action::Insert), vec!["slug".to_string()])]);
    }

    #[test]
    fn invalid_changesets_skip_storage() {
        let mut repo = MemoryRepo::default();
        let changeset = Changeset::cast(Record::new(&schema()), json!({}), &["slug"])
            .unwrap()
            .validate_required(&["slug"])
            .unwrap();

        let failed = insert(&mut repo, changeset).unwrap().unwrap_err();
        assert_eq!(failed.action(), Some(Action::Insert));
        assert!(repo.executed.is_empty());
    }

    #[test]
    fn empty_update_returns_data() {
        let mut repo = MemoryRepo::default();
        let record = Record::new(&schema()).with("id", 1).loaded();

        let updated = update(&mut repo, Changeset::change(record.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(updated, record);
        assert!(repo.executed.is_empty());
    }

    #[test]
    fn violations_are_mapped() {
        let mut repo = MemoryRepo {
            violation: Some(Violation::new(ConstraintKind::Unique, "posts_slug_index")),
            ..MemoryRepo::default()
        };
        let changeset = Changeset::cast(Record::new(&schema()), json!({"slug": "taken"}), &["slug"])
            .unwrap()
            .unique_constraint("slug");

        let failed = insert(&mut repo, changeset).unwrap().unwrap_err();
        assert_eq!(failed.errors()[0].message, "has already been taken");
    }

    #[test]
    fn unhandled_violation_is_fatal() {
        let mut repo = MemoryRepo {
            violation: Some(Violation::new(ConstraintKind::ForeignKey, "posts_author_fkey")),
            ..MemoryRepo::default()
        };
        let changeset =
            Changeset::cast(Record::new(&schema()), json!({"slug": "x"}), &["slug"]).unwrap();

        assert!(matches!(
            insert(&mut repo, changeset),
            Err(Error::UnhandledConstraint { .. })
        ));
    }

    #[test]
    fn action_conflicts_are_fatal() {
        let mut repo = MemoryRepo::default();
        let changeset = Changeset::change(Record::new(&schema()))
            .put_action(Action::Insert)
            .unwrap();

        assert!(matches!(
            delete(&mut repo, changeset),
            Err(Error::ActionConflict { .. })
        ));
    }

    #[test]
    fn optimistic_lock_increments() {
        let record = Record::new(&schema()).with("id", 1).loaded();
        let changeset = Changeset::change(record).optimistic_lock("lock_version").unwrap();

        assert_eq!(changeset.filters()["lock_version"], 1);
        assert_eq!(changeset.get_change("lock_version"), Some(&Value::Integer(2)));

        let err = Changeset::change(Record::new(&schema()))
            .optimistic_lock("slug")
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }
}
