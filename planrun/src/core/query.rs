//! Tree query engine: select typed entities by name, key, filter,
//! condition, link needle and exclude, with deterministic ordering.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::entity::{Plan, Story, Test};
use crate::core::filter::{evaluate_condition, filter_vars, matches_filter};
use crate::core::link::{LinkNeedle, Links};
use crate::tree::Tree;

/// Selection inputs, an explicit configuration object handed down from the
/// CLI boundary (no hidden global option state).
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Name patterns, searched (not anchored) in the full entity name.
    pub names: Vec<String>,
    /// Filter expressions, all must match.
    pub filters: Vec<String>,
    /// Condition expressions, all must match.
    pub conditions: Vec<String>,
    /// Link needles, at least one must match when any are given.
    pub links: Vec<LinkNeedle>,
    /// Name patterns removing matching entities.
    pub excludes: Vec<String>,
}

impl Selection {
    pub fn with_names(names: Vec<String>) -> Selection {
        Selection {
            names,
            ..Selection::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
            && self.filters.is_empty()
            && self.conditions.is_empty()
            && self.links.is_empty()
            && self.excludes.is_empty()
    }
}

/// Search available tests.
///
/// In the default unique mode each matching node yields one test. The
/// non-unique mode is allowed only with explicit names: each requested
/// pattern is iterated independently (pattern order preserved, sorted by
/// `order` within each pattern group), so the same underlying metadata may
/// be instantiated multiple times. Every instantiation is an independent
/// value.
pub fn tests(tree: &Tree, selection: &Selection, unique: bool) -> Result<Vec<Test>> {
    let gathered = if !unique && !selection.names.is_empty() {
        let mut gathered = Vec::new();
        for name in &selection.names {
            let nodes = tree.prune(&["test"], std::slice::from_ref(name), &[])?;
            let mut group = nodes
                .into_iter()
                .map(|node| Test::from_node(node, tree.root()))
                .collect::<Result<Vec<_>, _>>()
                .context("build tests from tree nodes")?;
            group.sort_by_key(|test| test.core.order);
            gathered.extend(group);
        }
        gathered
    } else {
        let nodes = tree.prune(&["test"], &selection.names, &[])?;
        let mut gathered = nodes
            .into_iter()
            .map(|node| Test::from_node(node, tree.root()))
            .collect::<Result<Vec<_>, _>>()
            .context("build tests from tree nodes")?;
        gathered.sort_by_key(|test| test.core.order);
        gathered
    };

    Ok(prune_entities(gathered, selection, |test| {
        (test.export_dict(), &test.core.link)
    }))
}

/// Search available plans.
pub fn plans(tree: &Tree, selection: &Selection) -> Result<Vec<Plan>> {
    let nodes = tree.prune(&["execute"], &selection.names, &[])?;
    let mut gathered = nodes
        .into_iter()
        .map(Plan::from_node)
        .collect::<Result<Vec<_>, _>>()
        .context("build plans from tree nodes")?;
    gathered.sort_by_key(|plan| plan.core.order);
    Ok(prune_entities(gathered, selection, |plan| {
        (plan.export_dict(), &plan.core.link)
    }))
}

/// Search available stories.
pub fn stories(tree: &Tree, selection: &Selection) -> Result<Vec<Story>> {
    let nodes = tree.prune(&["story"], &selection.names, &[])?;
    let mut gathered = nodes
        .into_iter()
        .map(Story::from_node)
        .collect::<Result<Vec<_>, _>>()
        .context("build stories from tree nodes")?;
    gathered.sort_by_key(|story| story.core.order);
    Ok(prune_entities(gathered, selection, |story| {
        (story.export_dict(), &story.core.link)
    }))
}

/// Plans matched by name from a persisted run, in tree order.
pub fn plans_by_exact_names(tree: &Tree, names: &[String]) -> Result<Vec<Plan>> {
    let nodes = tree.prune(&["execute"], &[], &[])?;
    let mut plans = Vec::new();
    for node in nodes {
        if names.iter().any(|name| name == &node.name) {
            plans.push(Plan::from_node(node).context("build plan from tree node")?);
        }
    }
    Ok(plans)
}

/// Apply filters, conditions, link needles and excludes.
///
/// A failing or unresolvable filter/condition makes the entity
/// non-matching rather than raising, so one malformed expression cannot
/// crash a whole-tree query.
fn prune_entities<T>(
    entities: Vec<T>,
    selection: &Selection,
    describe: impl Fn(&T) -> (Map<String, Value>, &Links),
) -> Vec<T> {
    let exclude_regexes: Vec<Regex> = selection
        .excludes
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(error) => {
                debug!(%pattern, %error, "invalid exclude pattern, ignoring");
                None
            }
        })
        .collect();

    entities
        .into_iter()
        .filter(|entity| {
            let (data, links) = describe(entity);
            let name = data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            // Conditions: unresolvable means non-matching.
            for condition in &selection.conditions {
                match evaluate_condition(condition, &data) {
                    Ok(true) => {}
                    Ok(false) | Err(_) => return false,
                }
            }

            // Filters, with lower-cased bool variants available.
            let vars = filter_vars(&data);
            for filter in &selection.filters {
                match matches_filter(filter, &vars) {
                    Ok(true) => {}
                    Ok(false) | Err(_) => return false,
                }
            }

            // Links are in OR relation.
            if !selection.links.is_empty()
                && !selection.links.iter().any(|needle| links.has_link(needle))
            {
                return false;
            }

            // Excludes remove anything they match.
            if exclude_regexes.iter().any(|regex| regex.is_match(&name)) {
                return false;
            }

            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::RawNode;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn node(name: &str, data: Value) -> RawNode {
        let data = data.as_object().expect("object").clone();
        let defined: BTreeSet<String> = data.keys().cloned().collect();
        RawNode {
            name: name.to_string(),
            data,
            defined,
            sources: Vec::new(),
        }
    }

    fn sample_tree() -> Tree {
        Tree::new(
            PathBuf::from("/tmp/tree"),
            vec![
                node(
                    "/tests/slow",
                    json!({"test": "sleep 1", "order": 70, "tag": ["slow"]}),
                ),
                node(
                    "/tests/fast",
                    json!({"test": "true", "order": 20, "tag": ["fast"]}),
                ),
                node(
                    "/tests/disabled",
                    json!({"test": "true", "enabled": false, "order": 10}),
                ),
                node(
                    "/tests/linked",
                    json!({
                        "test": "true",
                        "link": [{"verifies": "/stories/query"}],
                    }),
                ),
                node("/plans/smoke", json!({"execute": {"how": "shell"}})),
                node(
                    "/stories/query",
                    json!({"story": "Selecting tests just works."}),
                ),
            ],
        )
    }

    #[test]
    fn tests_sorted_by_order_ascending() {
        let found = tests(&sample_tree(), &Selection::default(), true).expect("query");
        let names: Vec<&str> = found.iter().map(|test| test.core.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["/tests/disabled", "/tests/fast", "/tests/linked", "/tests/slow"]
        );
    }

    #[test]
    fn enabled_filter_prunes_both_ways() {
        let tree = sample_tree();
        let enabled = tests(
            &tree,
            &Selection {
                filters: vec!["enabled:true".to_string()],
                ..Selection::default()
            },
            true,
        )
        .expect("query");
        assert!(enabled
            .iter()
            .all(|test| test.core.name != "/tests/disabled"));

        let disabled = tests(
            &tree,
            &Selection {
                filters: vec!["enabled:false".to_string()],
                ..Selection::default()
            },
            true,
        )
        .expect("query");
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].core.name, "/tests/disabled");
    }

    #[test]
    fn name_selection_uses_regex_search() {
        let found = tests(
            &sample_tree(),
            &Selection::with_names(vec!["fast|slow".to_string()]),
            true,
        )
        .expect("query");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn non_unique_selection_repeats_tests_independently() {
        let found = tests(
            &sample_tree(),
            &Selection::with_names(vec![
                "^/tests/fast$".to_string(),
                "^/tests/slow$".to_string(),
                "^/tests/fast$".to_string(),
            ]),
            false,
        )
        .expect("query");
        let names: Vec<&str> = found.iter().map(|test| test.core.name.as_str()).collect();
        assert_eq!(names, vec!["/tests/fast", "/tests/slow", "/tests/fast"]);
        // Duplicates are independent values.
        assert_eq!(found[0], found[2]);
    }

    #[test]
    fn link_needles_are_or_combined() {
        let found = tests(
            &sample_tree(),
            &Selection {
                links: vec![
                    LinkNeedle::from_raw("verifies:/stories/query").expect("needle"),
                    LinkNeedle::from_raw("documents:nothing").expect("needle"),
                ],
                ..Selection::default()
            },
            true,
        )
        .expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].core.name, "/tests/linked");
    }

    #[test]
    fn excludes_remove_matching_names() {
        let found = tests(
            &sample_tree(),
            &Selection {
                excludes: vec!["slow".to_string()],
                ..Selection::default()
            },
            true,
        )
        .expect("query");
        assert!(found.iter().all(|test| test.core.name != "/tests/slow"));
    }

    #[test]
    fn unresolvable_condition_is_non_matching() {
        let found = tests(
            &sample_tree(),
            &Selection {
                conditions: vec!["component == kernel".to_string()],
                ..Selection::default()
            },
            true,
        )
        .expect("query");
        assert!(found.is_empty());
    }

    #[test]
    fn condition_on_order() {
        let found = tests(
            &sample_tree(),
            &Selection {
                conditions: vec!["order < 50".to_string()],
                ..Selection::default()
            },
            true,
        )
        .expect("query");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn plans_and_stories_are_found() {
        let tree = sample_tree();
        assert_eq!(plans(&tree, &Selection::default()).expect("plans").len(), 1);
        assert_eq!(
            stories(&tree, &Selection::default()).expect("stories").len(),
            1
        );
    }

    #[test]
    fn plans_by_exact_names_preserves_tree_order() {
        let tree = sample_tree();
        let found =
            plans_by_exact_names(&tree, &["/plans/smoke".to_string()]).expect("plans");
        assert_eq!(found.len(), 1);
        let none = plans_by_exact_names(&tree, &["/plans/missing".to_string()]).expect("plans");
        assert!(none.is_empty());
    }
}
