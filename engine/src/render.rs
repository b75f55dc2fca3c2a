//! Rendering errors for display.

use crate::{Cardinality, Change, Changeset, FieldError};
use indexmap::IndexMap;
use serde::Serialize;

/// Rendered errors of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorTree {
    /// Messages attached to the field itself
    Messages(Vec<String>),
    /// Errors of a single related record
    One(IndexMap<String, ErrorTree>),
    /// Errors of each related record, in relation order
    Many(Vec<IndexMap<String, ErrorTree>>),
}

impl FieldError {
    /// The message with every `%{key}` replaced by the matching option.
    ///
    /// Unknown keys are left as they are.
    pub fn interpolated(&self) -> String {
        let mut out = String::with_capacity(self.message.len());
        let mut rest = self.message.as_str();

        while let Some(start) = rest.find("%{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    match self.opts.get(key) {
                        Some(value) => out.push_str(&value.to_string()),
                        None => {
                            out.push_str("%{");
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl Changeset {
    /// Render every error through `format`, recursing into relations.
    ///
    /// Fields without errors anywhere are left out. When a relation field
    /// has errors of its own, they take the place of its children's errors.
    pub fn traverse_errors<F>(&self, mut format: F) -> IndexMap<String, ErrorTree>
    where
        F: FnMut(&FieldError) -> String,
    {
        self.traverse(&mut format)
    }

    fn traverse(&self, format: &mut dyn FnMut(&FieldError) -> String) -> IndexMap<String, ErrorTree> {
        let mut tree: IndexMap<String, ErrorTree> = IndexMap::new();

        for error in &self.errors {
            let message = format(error);
            match tree.get_mut(&error.field) {
                Some(ErrorTree::Messages(messages)) => messages.push(message),
                _ => {
                    tree.insert(error.field.clone(), ErrorTree::Messages(vec![message]));
                }
            }
        }

        for (field, change) in &self.changes {
            let Change::Relation(children) = change else {
                continue;
            };
            if tree.contains_key(field) {
                continue;
            }

            let cardinality = self
                .data
                .schema()
                .relation(field)
                .map(|relation| relation.cardinality());

            let nested = match cardinality {
                Some(Cardinality::One) => children
                    .last()
                    .map(|child| child.traverse(format))
                    .filter(|errors| !errors.is_empty())
                    .map(ErrorTree::One),
                _ => {
                    let all: Vec<_> = children.iter().map(|child| child.traverse(format)).collect();
                    all.iter()
                        .any(|errors| !errors.is_empty())
                        .then_some(ErrorTree::Many(all))
                }
            };

            if let Some(nested) = nested {
                tree.insert(field.clone(), nested);
            }
        }

        tree
    }
}
