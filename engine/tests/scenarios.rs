//! End-to-end scenarios for changeset-engine
//!
//! These tests drive the public API the way an application would: cast
//! params, validate, reconcile relations and render errors.

use changeset_engine::{
    Action, AssocOptions, ChangesetFn, Changeset, Config, ErrorTree, FieldDef, FieldError,
    FieldType, Incoming, Input, LengthRule, OnReplace, Record, Related, Relation, Schema, Value,
};
use serde_json::json;
use std::sync::{Arc, Once};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "changeset_engine=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

fn comment_schema() -> Arc<Schema> {
    let builder = ChangesetFn::new(|data, params| {
        Changeset::cast(data, params.clone(), &["title"])?.validate_required(&["title"])
    });
    Arc::new(
        Schema::new("Comment")
            .with_field(FieldDef::primary_key("id", FieldType::Id))
            .with_field(FieldDef::new("title", FieldType::String))
            .with_field(FieldDef::new("post_id", FieldType::Id))
            .with_changeset(builder),
    )
}

fn address_schema() -> Arc<Schema> {
    let builder = ChangesetFn::new(|data, params| {
        Changeset::cast(data, params.clone(), &["street", "city"])?
            .validate_required(&["city"])
    });
    Arc::new(
        Schema::embedded("Address")
            .with_field(FieldDef::new("street", FieldType::String))
            .with_field(FieldDef::new("city", FieldType::String))
            .with_changeset(builder),
    )
}

fn post_schema(policy: OnReplace) -> Arc<Schema> {
    Arc::new(
        Schema::new("Post")
            .with_field(FieldDef::primary_key("id", FieldType::Id))
            .with_field(FieldDef::new("title", FieldType::String))
            .with_field(FieldDef::new("visits", FieldType::Integer).with_default(0))
            .with_relation(
                Relation::has_many("comments", comment_schema())
                    .on_replace(policy)
                    .unwrap(),
            )
            .with_relation(Relation::embeds_one("address", address_schema())),
    )
}

fn comment(id: i64, title: &str) -> Record {
    Record::new(&comment_schema())
        .with("id", id)
        .with("title", title)
        .with("post_id", 1)
        .loaded()
}

fn loaded_post(policy: OnReplace, comments: Vec<Record>) -> Record {
    Record::new(&post_schema(policy))
        .with("id", 1)
        .with("title", "hello")
        .loaded()
        .with_related("comments", comments)
}

fn actions(children: &[Changeset]) -> Vec<Option<Action>> {
    children.iter().map(Changeset::action).collect()
}

// ============================================================================
// Cast and Required
// ============================================================================

#[test]
fn nil_title_is_blank() {
    init_tracing();
    let post = Record::new(&post_schema(OnReplace::Raise));

    let changeset = Changeset::cast(post, json!({"title": null}), &["title"])
        .unwrap()
        .validate_required(&["title"])
        .unwrap();

    assert!(!changeset.is_valid());
    assert!(changeset.changes().is_empty());
    assert_eq!(changeset.errors().len(), 1);
    assert_eq!(changeset.errors()[0].field, "title");
    assert_eq!(changeset.errors()[0].message, "can't be blank");
}

#[test]
fn change_without_changes_is_identity() {
    let post = loaded_post(OnReplace::Raise, vec![comment(1, "a")]);
    let changeset = Changeset::change(post.clone());

    assert!(changeset.is_valid());
    assert_eq!(changeset.apply_changes(), post);
}

#[test]
fn required_field_order_does_not_matter() {
    let post = Record::new(&post_schema(OnReplace::Raise)).with("visits", Value::Null);
    let params = json!({"title": " "});

    let forward = Changeset::cast(post.clone(), params.clone(), &["title", "visits"])
        .unwrap()
        .validate_required(&["title", "visits"])
        .unwrap();
    let backward = Changeset::cast(post, params, &["title", "visits"])
        .unwrap()
        .validate_required(&["visits", "title"])
        .unwrap();

    let mut a: Vec<_> = forward.errors().iter().map(|e| e.field.clone()).collect();
    let mut b: Vec<_> = backward.errors().iter().map(|e| e.field.clone()).collect();
    a.sort();
    b.sort();
    assert_eq!(a, vec!["title", "visits"]);
    assert_eq!(a, b);
}

// ============================================================================
// Length
// ============================================================================

#[test]
fn length_bounds() {
    let rule = LengthRule::default().min(3).max(7);
    let post = || Record::new(&post_schema(OnReplace::Raise));

    let ok = Changeset::cast(post(), json!({"title": "world"}), &["title"])
        .unwrap()
        .validate_length("title", rule.clone());
    assert!(ok.is_valid());

    let short = Changeset::cast(post(), json!({"title": "wo"}), &["title"])
        .unwrap()
        .validate_length("title", rule);
    assert!(!short.is_valid());

    let error = &short.errors()[0];
    assert_eq!(error.opts["kind"], "min");
    assert_eq!(error.opts["count"], 3);
    assert_eq!(error.interpolated(), "should be at least 3 character(s)");
}

// ============================================================================
// Has-Many Reconciliation
// ============================================================================

#[test]
fn delete_on_replace_scenario() {
    init_tracing();
    let post = loaded_post(OnReplace::Delete, vec![comment(1, "a"), comment(2, "b")]);
    let params = json!({
        "comments": [
            {"title": "new"},
            {"id": 2, "title": null},
        ]
    });

    let changeset = Changeset::cast(post, params, &["title"])
        .unwrap()
        .cast_assoc("comments")
        .unwrap();

    let children = changeset.relation_changes("comments").unwrap();
    assert_eq!(
        actions(children),
        vec![Some(Action::Delete), Some(Action::Insert), Some(Action::Update)]
    );
    assert_eq!(children[0].data().get("id"), Some(&Value::Integer(1)));
    assert_eq!(children[1].get_change("title"), Some(&Value::from("new")));
    assert_eq!(children[1].data().get("post_id"), Some(&Value::Integer(1)));
    assert_eq!(children[2].data().get("id"), Some(&Value::Integer(2)));
    assert_eq!(children[2].errors()[0].message, "can't be blank");
    assert!(!changeset.is_valid());

    let errors = changeset.traverse_errors(FieldError::interpolated);
    assert_eq!(
        serde_json::to_value(&errors).unwrap(),
        json!({"comments": [{}, {}, {"title": ["can't be blank"]}]})
    );
}

#[test]
fn unchanged_relation_leaves_no_change() {
    let post = loaded_post(OnReplace::Raise, vec![comment(1, "a")]);
    let changeset = Changeset::cast(post, json!({"comments": [{"id": 1, "title": "a"}]}), &["title"])
        .unwrap()
        .cast_assoc("comments")
        .unwrap();

    assert!(changeset.is_valid());
    assert!(!changeset.changed("comments"));
}

#[test]
fn every_policy_handles_a_dropped_record() {
    for policy in [
        OnReplace::Raise,
        OnReplace::MarkAsInvalid,
        OnReplace::Nilify,
        OnReplace::Delete,
    ] {
        let post = loaded_post(policy, vec![comment(1, "a")]);
        let result = Changeset::cast(post, json!({"comments": []}), &["title"])
            .unwrap()
            .cast_assoc("comments");

        match policy {
            OnReplace::Raise => assert!(result.is_err()),
            OnReplace::MarkAsInvalid => {
                let changeset = result.unwrap();
                assert_eq!(changeset.errors()[0].field, "comments");
                assert_eq!(changeset.errors()[0].message, "is invalid");
                assert!(!changeset.changed("comments"));
            }
            OnReplace::Nilify => {
                let changeset = result.unwrap();
                let children = changeset.relation_changes("comments").unwrap();
                assert_eq!(actions(children), vec![Some(Action::Replace)]);
            }
            OnReplace::Delete => {
                let changeset = result.unwrap();
                let children = changeset.relation_changes("comments").unwrap();
                assert_eq!(actions(children), vec![Some(Action::Delete)]);
                assert_eq!(changeset.apply_changes().related("comments"), Some(&Related::Many(vec![])));
            }
            OnReplace::Update => unreachable!(),
        }
    }
}

#[test]
fn update_policy_is_rejected_for_has_many() {
    assert!(Relation::has_many("comments", comment_schema())
        .on_replace(OnReplace::Update)
        .is_err());
}

#[test]
fn required_assoc_with_nothing_left() {
    let post = loaded_post(OnReplace::Delete, vec![comment(1, "a")]);
    let opts = AssocOptions {
        required: true,
        ..AssocOptions::default()
    };

    let changeset = Changeset::cast(post, json!({"comments": []}), &["title"])
        .unwrap()
        .cast_assoc_with("comments", &opts)
        .unwrap();

    assert_eq!(changeset.required(), &["comments"]);
    assert_eq!(changeset.errors()[0].message, "can't be blank");
}

#[test]
fn put_assoc_with_records() {
    let post = loaded_post(OnReplace::Delete, vec![comment(1, "a"), comment(2, "b")]);
    let input = Input::Many(vec![
        Incoming::Record(comment(2, "b2")),
        Incoming::Record(Record::new(&comment_schema()).with("title", "c")),
    ]);

    let changeset = Changeset::change(post).put_assoc("comments", input).unwrap();
    let children = changeset.relation_changes("comments").unwrap();

    assert_eq!(
        actions(children),
        vec![Some(Action::Delete), Some(Action::Update), Some(Action::Insert)]
    );
    assert_eq!(children[1].get_change("title"), Some(&Value::from("b2")));

    let applied = changeset.apply_changes();
    let titles: Vec<_> = applied
        .related("comments")
        .unwrap()
        .records()
        .into_iter()
        .map(|record| record.get("title").cloned())
        .collect();
    assert_eq!(titles, vec![Some(Value::from("b2")), Some(Value::from("c"))]);
}

#[test]
fn empty_items_insert_nothing() {
    let lax = AssocOptions {
        with: Some(ChangesetFn::new(|data, params| {
            Changeset::cast(data, params.clone(), &["title"])
        })),
        ..AssocOptions::default()
    };
    let post = loaded_post(OnReplace::Raise, vec![comment(1, "a")]);

    let changeset = Changeset::cast(post, json!({"comments": [{"id": 1}, {}]}), &["title"])
        .unwrap()
        .cast_assoc_with("comments", &lax)
        .unwrap();

    assert!(changeset.is_valid());
    assert!(!changeset.changed("comments"));
}

// ============================================================================
// Single Relations
// ============================================================================

fn profile_schema() -> Arc<Schema> {
    let builder = ChangesetFn::new(|data, params| {
        Changeset::cast(data, params.clone(), &["bio"])?.validate_required(&["bio"])
    });
    Arc::new(
        Schema::new("Profile")
            .with_field(FieldDef::primary_key("id", FieldType::Id))
            .with_field(FieldDef::new("bio", FieldType::String))
            .with_field(FieldDef::new("user_id", FieldType::Id))
            .with_changeset(builder),
    )
}

fn user_with_profile(policy: OnReplace) -> Record {
    let schema = Arc::new(
        Schema::new("User")
            .with_field(FieldDef::primary_key("id", FieldType::Id))
            .with_relation(
                Relation::has_one("profile", profile_schema())
                    .on_replace(policy)
                    .unwrap(),
            ),
    );
    let profile = Record::new(&profile_schema())
        .with("id", 7)
        .with("bio", "old")
        .with("user_id", 1)
        .loaded();

    Record::new(&schema)
        .with("id", 1)
        .loaded()
        .with_related("profile", profile)
}

fn cast_profile(policy: OnReplace, params: serde_json::Value) -> Changeset {
    Changeset::cast(user_with_profile(policy), params, &[] as &[&str])
        .unwrap()
        .cast_assoc("profile")
        .unwrap()
}

#[test]
fn update_policy_casts_onto_the_existing_record() {
    init_tracing();
    let changeset = cast_profile(OnReplace::Update, json!({"profile": {"bio": "new"}}));

    let children = changeset.relation_changes("profile").unwrap();
    assert_eq!(actions(children), vec![Some(Action::Update)]);
    assert_eq!(children[0].data().get("id"), Some(&Value::Integer(7)));
    assert_eq!(children[0].get_change("bio"), Some(&Value::from("new")));
    assert!(changeset.is_valid());
}

#[test]
fn single_relation_replacement() {
    for (policy, dropped) in [
        (OnReplace::Delete, Action::Delete),
        (OnReplace::Nilify, Action::Replace),
    ] {
        let changeset = cast_profile(policy, json!({"profile": {"bio": "new"}}));
        let children = changeset.relation_changes("profile").unwrap();
        assert_eq!(actions(children), vec![Some(dropped), Some(Action::Insert)]);
        assert_eq!(children[0].data().get("id"), Some(&Value::Integer(7)));
        assert_eq!(children[1].get_change("bio"), Some(&Value::from("new")));

        let changeset = cast_profile(policy, json!({"profile": null}));
        let children = changeset.relation_changes("profile").unwrap();
        assert_eq!(actions(children), vec![Some(dropped)]);
        assert_eq!(children[0].data().get("id"), Some(&Value::Integer(7)));
    }
}

// ============================================================================
// Nested Relations
// ============================================================================

fn threaded_post_schema() -> Arc<Schema> {
    let vote = Schema::new("Vote")
        .with_field(FieldDef::primary_key("id", FieldType::Id))
        .with_field(FieldDef::new("score", FieldType::Integer))
        .with_field(FieldDef::new("comment_id", FieldType::Id))
        .with_changeset(ChangesetFn::new(|data, params| {
            Changeset::cast(data, params.clone(), &["score"])?.validate_required(&["score"])
        }));
    let comment = Schema::new("Comment")
        .with_field(FieldDef::primary_key("id", FieldType::Id))
        .with_field(FieldDef::new("title", FieldType::String))
        .with_field(FieldDef::new("post_id", FieldType::Id))
        .with_relation(Relation::has_many("votes", Arc::new(vote)))
        .with_changeset(ChangesetFn::new(|data, params| {
            Changeset::cast(data, params.clone(), &["title"])?.cast_assoc("votes")
        }));

    Arc::new(
        Schema::new("Post")
            .with_field(FieldDef::primary_key("id", FieldType::Id))
            .with_relation(Relation::has_many("comments", Arc::new(comment))),
    )
}

#[test]
fn invalid_grandchild_invalidates_the_root() {
    let params = json!({
        "comments": [
            {"title": "a", "votes": [{"score": 1}, {"score": null}]},
        ]
    });

    let changeset = Changeset::cast(Record::new(&threaded_post_schema()), params, &[] as &[&str])
        .unwrap()
        .cast_assoc("comments")
        .unwrap();
    assert!(!changeset.is_valid());

    let comments = changeset.relation_changes("comments").unwrap();
    assert!(comments[0].errors().is_empty());
    assert!(!comments[0].is_valid());

    let votes = comments[0].relation_changes("votes").unwrap();
    assert_eq!(actions(votes), vec![Some(Action::Insert), Some(Action::Insert)]);
    assert!(votes[0].is_valid());
    assert!(!votes[1].is_valid());

    let errors = changeset.traverse_errors(FieldError::interpolated);
    assert_eq!(
        serde_json::to_value(&errors).unwrap(),
        json!({"comments": [{"votes": [{}, {"score": ["can't be blank"]}]}]})
    );
}

// ============================================================================
// Embeds
// ============================================================================

#[test]
fn embed_errors_render_as_a_map() {
    let post = Record::new(&post_schema(OnReplace::Raise));
    let changeset = Changeset::cast(post, json!({"address": {"street": "Main St"}}), &["title"])
        .unwrap()
        .cast_embed("address")
        .unwrap();

    let children = changeset.relation_changes("address").unwrap();
    assert_eq!(actions(children), vec![Some(Action::Insert)]);
    assert!(!changeset.is_valid());

    let errors = changeset.traverse_errors(FieldError::interpolated);
    let ErrorTree::One(nested) = &errors["address"] else {
        panic!("expected nested errors, got {:?}", errors["address"]);
    };
    assert_eq!(nested["city"], ErrorTree::Messages(vec!["can't be blank".into()]));
}

#[test]
fn empty_embed_inserts_nothing() {
    let lax = AssocOptions {
        with: Some(ChangesetFn::new(|data, params| {
            Changeset::cast(data, params.clone(), &["street", "city"])
        })),
        ..AssocOptions::default()
    };
    let post = Record::new(&post_schema(OnReplace::Raise));

    let changeset = Changeset::cast(post, json!({"address": {}}), &["title"])
        .unwrap()
        .cast_embed_with("address", &lax)
        .unwrap();

    assert!(changeset.is_valid());
    assert!(!changeset.changed("address"));
}

#[test]
fn casting_an_assoc_as_an_embed_is_fatal() {
    let post = Record::new(&post_schema(OnReplace::Raise));
    let changeset = Changeset::cast(post, json!({"comments": []}), &["title"]).unwrap();

    assert!(changeset.clone().cast_embed("comments").is_err());
    assert!(changeset.cast_assoc("address").is_err());
}

#[test]
fn wrong_shape_is_invalid() {
    let post = Record::new(&post_schema(OnReplace::Raise));
    let changeset = Changeset::cast(post, json!({"comments": "lots"}), &["title"])
        .unwrap()
        .cast_assoc("comments")
        .unwrap();

    let error = &changeset.errors()[0];
    assert_eq!(error.message, "is invalid");
    assert_eq!(error.opts["type"], "array<map>");
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn config_from_env_overrides_defaults() {
    std::env::set_var("CHANGESET_EMPTY_VALUES", "none");
    std::env::set_var("CHANGESET_FORCE_CHANGES", "true");
    let config = Config::from_env();
    std::env::remove_var("CHANGESET_EMPTY_VALUES");
    std::env::remove_var("CHANGESET_FORCE_CHANGES");

    let config = config.unwrap();
    assert!(config.force_changes);
    assert!(config.trim_required);

    let post = Record::new(&post_schema(OnReplace::Raise)).with("title", "");
    let changeset = Changeset::cast_with(
        post,
        json!({"title": ""}),
        &["title"],
        &(&config).into(),
    )
    .unwrap();
    assert_eq!(changeset.get_change("title"), Some(&Value::from("")));
}
