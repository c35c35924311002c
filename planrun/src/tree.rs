//! In-memory view of a metadata tree.
//!
//! The tree is produced by an external provider and consumed here as a flat
//! sequence of **fully merged** nodes; inheritance and merging semantics are
//! never reimplemented. Each node records which keys were declared directly
//! on the leaf (`defined`) and where it came from (`sources`), which is all
//! the entity layer needs for validation.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::filter::{evaluate_condition, EvalError};
use crate::errors::SpecificationError;

/// One fully merged metadata node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawNode {
    /// Path-like unique identifier within the tree.
    pub name: String,
    /// Merged key/value data.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Keys declared directly on this node, not inherited.
    #[serde(default)]
    pub defined: BTreeSet<String>,
    /// Origin file paths, relative to the tree root.
    #[serde(default)]
    pub sources: Vec<PathBuf>,
}

impl RawNode {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|value| !value.is_null())
    }

    /// Whether the key was declared on this very node rather than inherited.
    pub fn defined_in_leaf(&self, key: &str) -> bool {
        self.defined.contains(key)
    }
}

/// The parsed metadata tree document (`metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeDocument {
    pub nodes: Vec<RawNode>,
}

/// Metadata tree handle: root directory plus merged nodes in tree order.
#[derive(Debug, Clone)]
pub struct Tree {
    root: PathBuf,
    nodes: Vec<RawNode>,
}

impl Tree {
    pub fn new(root: PathBuf, nodes: Vec<RawNode>) -> Tree {
        Tree { root, nodes }
    }

    /// Metadata root directory.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn nodes(&self) -> &[RawNode] {
        &self.nodes
    }

    /// Select nodes containing all given keys, matching any of the name
    /// regexes (all nodes when no names given) and originating from any of
    /// the given sources (when given). Underlying tree order is preserved.
    pub fn prune(
        &self,
        keys: &[&str],
        names: &[String],
        sources: &[PathBuf],
    ) -> Result<Vec<&RawNode>, SpecificationError> {
        let name_regexes = compile_names(names)?;
        let selected = self
            .nodes
            .iter()
            .filter(|node| keys.iter().all(|key| node.get(key).is_some()))
            .filter(|node| {
                name_regexes.is_empty()
                    || name_regexes.iter().any(|regex| regex.is_match(&node.name))
            })
            .filter(|node| {
                sources.is_empty() || node.sources.iter().any(|source| sources.contains(source))
            })
            .collect();
        Ok(selected)
    }

    /// Apply each node's adjust rules for the given context.
    ///
    /// A rule is a mapping with an optional `when` condition (always applies
    /// when absent), an optional `continue` flag (default true, false stops
    /// rule processing for that node) and an informational `because` key;
    /// every other key overrides the node's data. A `when` condition that
    /// cannot be evaluated (unknown context dimension) does not apply.
    pub fn adjust(&mut self, context: &BTreeMap<String, String>) {
        let context_data: Map<String, Value> = context
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();

        for node in &mut self.nodes {
            let rules = match node.data.get("adjust") {
                None | Some(Value::Null) => continue,
                Some(Value::Array(rules)) => rules.clone(),
                Some(single) => vec![single.clone()],
            };
            for rule in rules {
                let Value::Object(rule) = rule else { continue };
                let applies = match rule.get("when").and_then(Value::as_str) {
                    Some(when) => match evaluate_condition(when, &context_data) {
                        Ok(matched) => matched,
                        Err(EvalError::MissingAttribute(dimension)) => {
                            debug!(node = %node.name, %dimension, "unknown context dimension");
                            false
                        }
                        Err(EvalError::Syntax(expression)) => {
                            debug!(node = %node.name, %expression, "invalid adjust condition");
                            false
                        }
                    },
                    None => true,
                };
                if applies {
                    for (key, value) in &rule {
                        if matches!(key.as_str(), "when" | "because" | "continue") {
                            continue;
                        }
                        node.data.insert(key.clone(), value.clone());
                    }
                    let keep_going = rule
                        .get("continue")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    if !keep_going {
                        break;
                    }
                }
            }
        }
    }
}

fn compile_names(names: &[String]) -> Result<Vec<Regex>, SpecificationError> {
    names
        .iter()
        .map(|name| {
            Regex::new(name).map_err(|error| {
                SpecificationError::new(format!("Invalid name pattern '{name}': {error}."))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(name: &str, data: Value) -> RawNode {
        RawNode {
            name: name.to_string(),
            data: data.as_object().expect("object").clone(),
            defined: BTreeSet::new(),
            sources: Vec::new(),
        }
    }

    fn sample_tree() -> Tree {
        Tree::new(
            PathBuf::from("/tmp/tree"),
            vec![
                node("/tests/one", json!({"test": "true"})),
                node("/tests/two", json!({"test": "false"})),
                node("/plans/smoke", json!({"execute": {"how": "shell"}})),
            ],
        )
    }

    #[test]
    fn prune_by_key_and_name() {
        let tree = sample_tree();
        let tests = tree.prune(&["test"], &[], &[]).expect("prune");
        assert_eq!(tests.len(), 2);

        let one = tree
            .prune(&["test"], &["one".to_string()], &[])
            .expect("prune");
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name, "/tests/one");

        let plans = tree.prune(&["execute"], &[], &[]).expect("prune");
        assert_eq!(plans.len(), 1);
    }

    #[test]
    fn prune_rejects_invalid_patterns() {
        let tree = sample_tree();
        let err = tree.prune(&[], &["[".to_string()], &[]).unwrap_err();
        assert!(err.to_string().contains("Invalid name pattern"));
    }

    #[test]
    fn adjust_applies_matching_rules() {
        let mut tree = Tree::new(
            PathBuf::from("/tmp/tree"),
            vec![node(
                "/tests/one",
                json!({
                    "test": "true",
                    "adjust": [{"when": "distro == fedora", "enabled": false}],
                }),
            )],
        );
        let context = BTreeMap::from([("distro".to_string(), "fedora".to_string())]);
        tree.adjust(&context);
        assert_eq!(tree.nodes()[0].get("enabled"), Some(&json!(false)));
    }

    #[test]
    fn adjust_skips_unknown_dimensions_and_mismatches() {
        let mut tree = Tree::new(
            PathBuf::from("/tmp/tree"),
            vec![node(
                "/tests/one",
                json!({
                    "test": "true",
                    "adjust": {"when": "arch == aarch64", "enabled": false},
                }),
            )],
        );
        tree.adjust(&BTreeMap::new());
        assert_eq!(tree.nodes()[0].get("enabled"), None);

        let context = BTreeMap::from([("arch".to_string(), "x86_64".to_string())]);
        tree.adjust(&context);
        assert_eq!(tree.nodes()[0].get("enabled"), None);
    }

    #[test]
    fn adjust_continue_false_stops_processing() {
        let mut tree = Tree::new(
            PathBuf::from("/tmp/tree"),
            vec![node(
                "/tests/one",
                json!({
                    "test": "true",
                    "adjust": [
                        {"tier": "1", "continue": false},
                        {"tier": "2"},
                    ],
                }),
            )],
        );
        tree.adjust(&BTreeMap::new());
        assert_eq!(tree.nodes()[0].get("tier"), Some(&json!("1")));
    }
}
