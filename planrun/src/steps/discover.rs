//! Discover step: gather tests relevant for execution.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::entity::{Test, DEFAULT_TEST_DURATION_L2};
use crate::core::link::LinkNeedle;
use crate::core::query::{self, Selection};
use crate::errors::SpecificationError;
use crate::io::run_log::RunLog;
use crate::io::state::{read_json_opt, write_json};
use crate::steps::{how_matches, PhaseCommon, StepCommon, StepName};
use crate::tree::Tree;

/// Context handed to discover phases.
pub struct DiscoverContext<'a> {
    pub tree: &'a Tree,
    pub plan: &'a str,
    pub log: &'a RunLog,
}

/// A configured discover method instance.
trait DiscoverPhase {
    fn common(&self) -> &PhaseCommon;
    fn is_standalone(&self) -> bool {
        false
    }
    fn go(&self, context: &DiscoverContext<'_>) -> Result<Vec<Test>>;
}

/// Discover tests by querying the plan's own metadata tree.
struct TreeDiscover {
    common: PhaseCommon,
    selection: Selection,
    /// Name patterns iterated independently, allowing repeated inclusion.
    repeats: Vec<String>,
}

impl TreeDiscover {
    fn from_raw(common: PhaseCommon, raw: &Map<String, Value>) -> Result<TreeDiscover> {
        let list = |key: &str| -> Result<Vec<String>, SpecificationError> {
            match raw.get(key) {
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(Value::String(text)) => Ok(vec![text.clone()]),
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| {
                            SpecificationError::new(format!(
                                "Discover '{key}' entries should be strings, got '{item}'."
                            ))
                        })
                    })
                    .collect(),
                Some(other) => Err(SpecificationError::new(format!(
                    "Discover '{key}' should be a string or a list, got '{other}'."
                ))),
            }
        };

        let links = list("links")?
            .iter()
            .map(|needle| LinkNeedle::from_raw(needle))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TreeDiscover {
            common,
            selection: Selection {
                names: list("names")?,
                filters: list("filters")?,
                conditions: list("conditions")?,
                links,
                excludes: list("excludes")?,
            },
            repeats: list("tests")?,
        })
    }
}

impl DiscoverPhase for TreeDiscover {
    fn common(&self) -> &PhaseCommon {
        &self.common
    }

    fn go(&self, context: &DiscoverContext<'_>) -> Result<Vec<Test>> {
        // Explicitly requested test names iterate one-by-one so the same
        // test may appear multiple times within a plan.
        if !self.repeats.is_empty() {
            let selection = Selection {
                names: self.repeats.clone(),
                ..self.selection.clone()
            };
            return query::tests(context.tree, &selection, false);
        }
        let mut selection = self.selection.clone();
        selection
            .conditions
            .push("manual == false".to_string());
        query::tests(context.tree, &selection, true)
    }
}

/// Use a provided list of shell script tests defined inline in the plan.
struct ShellDiscover {
    common: PhaseCommon,
    tests: Vec<Map<String, Value>>,
    plan: String,
}

impl ShellDiscover {
    fn from_raw(
        common: PhaseCommon,
        raw: &Map<String, Value>,
        plan: &str,
    ) -> Result<ShellDiscover, SpecificationError> {
        let tests = match raw.get("tests") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(mapping) => Ok(mapping.clone()),
                    other => Err(SpecificationError::new(format!(
                        "Discover test entry in '{plan}' should be a mapping, got '{other}'."
                    ))),
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(SpecificationError::new(format!(
                    "Discover 'tests' in '{plan}' should be a list, got '{other}'."
                )));
            }
        };
        Ok(ShellDiscover {
            common,
            tests,
            plan: plan.to_string(),
        })
    }
}

impl DiscoverPhase for ShellDiscover {
    fn common(&self) -> &PhaseCommon {
        &self.common
    }

    fn go(&self, _context: &DiscoverContext<'_>) -> Result<Vec<Test>> {
        let mut tests = Vec::new();
        for raw in &self.tests {
            let mut data = raw.clone();
            let name = match data.remove("name") {
                Some(Value::String(name)) if !name.is_empty() => name,
                _ => {
                    return Err(SpecificationError::new(format!(
                        "Missing test name in '{}'.",
                        self.plan
                    ))
                    .into());
                }
            };
            if data.get("test").and_then(Value::as_str).is_none() {
                return Err(SpecificationError::new(format!(
                    "Missing test script in '{}'.",
                    self.plan
                ))
                .into());
            }
            // Scripts defined directly in a plan default to the L2 duration.
            data.entry("duration".to_string())
                .or_insert_with(|| Value::String(DEFAULT_TEST_DURATION_L2.to_string()));
            tests.push(Test::from_mapping(&name, data)?);
        }
        Ok(tests)
    }
}

fn make_phase(
    raw: &Map<String, Value>,
    plan: &str,
) -> Result<Box<dyn DiscoverPhase>> {
    let common = PhaseCommon::from_raw(raw)?;
    if how_matches(&common.how, "tree") {
        return Ok(Box::new(TreeDiscover::from_raw(common, raw)?));
    }
    if how_matches(&common.how, "shell") {
        return Ok(Box::new(ShellDiscover::from_raw(common, raw, plan)?));
    }
    Err(SpecificationError::new(format!(
        "Unsupported discover method '{}' in the '{plan}' plan.",
        common.how
    ))
    .into())
}

/// Discover step: runs its phases and persists the gathered tests.
pub struct DiscoverStep {
    pub common: StepCommon,
    phases: Vec<Box<dyn DiscoverPhase>>,
    tests: Vec<Test>,
}

impl DiscoverStep {
    pub fn new(
        plan: &str,
        plan_workdir: &Path,
        data: Option<&Value>,
        enabled: bool,
    ) -> Result<DiscoverStep> {
        Ok(DiscoverStep {
            common: StepCommon::new(StepName::Discover, plan, plan_workdir, data, "tree", enabled)?,
            phases: Vec::new(),
            tests: Vec::new(),
        })
    }

    fn tests_path(&self) -> std::path::PathBuf {
        self.common.workdir.join("tests.json")
    }

    /// Reconstruct phases from persisted or raw data.
    pub fn wake(&mut self, force: bool) -> Result<()> {
        self.common.wake(force)?;
        self.phases = self
            .common
            .raw_data
            .iter()
            .map(|raw| make_phase(raw, &self.common.plan))
            .collect::<Result<Vec<_>>>()?;
        self.phases.sort_by_key(|phase| phase.common().order);

        // Restore previously discovered tests when the step is done.
        if self.common.is_done() {
            if let Some(stored) = read_json_opt::<Vec<Map<String, Value>>>(&self.tests_path())? {
                self.tests = load_tests(stored)?;
            }
        }
        self.common.commit_wake()
    }

    pub fn standalone_phases(&self) -> usize {
        self.phases
            .iter()
            .filter(|phase| phase.is_standalone())
            .count()
    }

    /// Discover tests; a no-op when already done.
    pub fn go(&mut self, context: &DiscoverContext<'_>) -> Result<()> {
        if !self.common.enabled {
            return Ok(());
        }
        if self.common.is_done() {
            context
                .log
                .line(&format!("    discover: done ({})", summary(&self.tests)))?;
            return Ok(());
        }
        context.log.line("    discover")?;
        for phase in &self.phases {
            debug!(phase = %phase.common().name, "running discover phase");
            let found = phase
                .go(context)
                .with_context(|| format!("discover phase '{}'", phase.common().name))?;
            self.tests.extend(found);
        }
        write_json(
            &self.tests_path(),
            &self
                .tests
                .iter()
                .map(Test::export_dict)
                .collect::<Vec<_>>(),
        )?;
        context
            .log
            .line(&format!("        {}", summary(&self.tests)))?;
        self.common.set_status(crate::steps::StepStatus::Done);
        self.common.save()
    }

    /// Tests gathered by the discover phases.
    pub fn tests(&self) -> &[Test] {
        &self.tests
    }
}

fn summary(tests: &[Test]) -> String {
    match tests.len() {
        1 => "1 test selected".to_string(),
        count => format!("{count} tests selected"),
    }
}

fn load_tests(stored: Vec<Map<String, Value>>) -> Result<Vec<Test>> {
    stored
        .into_iter()
        .map(|mut data| {
            let name = data
                .remove("name")
                .and_then(|value| value.as_str().map(str::to_string))
                .context("stored test is missing a name")?;
            Ok(Test::from_mapping(&name, data)?)
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

    fn tree() -> Tree {
        let node = |name: &str, data: Value| {
            let data = data.as_object().expect("object").clone();
            let defined: BTreeSet<String> = data.keys().cloned().collect();
            RawNode {
                name: name.to_string(),
                data,
                defined,
                sources: Vec::new(),
            }
        };
        Tree::new(
            PathBuf::from("/tmp/tree"),
            vec![
                node("/tests/first", json!({"test": "true", "order": 20})),
                node("/tests/second", json!({"test": "true", "order": 10})),
                node("/tests/manual", json!({"test": "true", "manual": true})),
            ],
        )
    }

    fn context<'a>(tree: &'a Tree, log: &'a RunLog) -> DiscoverContext<'a> {
        DiscoverContext {
            tree,
            plan: "/plans/smoke",
            log,
        }
    }

    #[test]
    fn tree_discover_selects_and_sorts_tests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = tree();
        let log = RunLog::new(temp.path());
        let mut step = DiscoverStep::new(
            "/plans/smoke",
            temp.path(),
            Some(&json!({"how": "tree"})),
            true,
        )
        .expect("step");
        step.wake(false).expect("wake");
        step.go(&context(&tree, &log)).expect("go");

        let names: Vec<&str> = step
            .tests()
            .iter()
            .map(|test| test.core.name.as_str())
            .collect();
        // Manual tests are filtered out, the rest sorted by order.
        assert_eq!(names, vec!["/tests/second", "/tests/first"]);
        assert!(temp.path().join("discover/tests.json").is_file());
    }

    #[test]
    fn tree_discover_repeated_tests_create_independent_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = tree();
        let log = RunLog::new(temp.path());
        let mut step = DiscoverStep::new(
            "/plans/smoke",
            temp.path(),
            Some(&json!({
                "how": "tree",
                "tests": ["^/tests/first$", "^/tests/first$"],
            })),
            true,
        )
        .expect("step");
        step.wake(false).expect("wake");
        step.go(&context(&tree, &log)).expect("go");
        assert_eq!(step.tests().len(), 2);
        assert_eq!(step.tests()[0], step.tests()[1]);
    }

    #[test]
    fn shell_discover_builds_tests_from_inline_data() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = tree();
        let log = RunLog::new(temp.path());
        let mut step = DiscoverStep::new(
            "/plans/smoke",
            temp.path(),
            Some(&json!({
                "how": "shell",
                "tests": [
                    {"name": "/inline/one", "test": "true"},
                    {"name": "/inline/two", "test": "false", "duration": "1m"},
                ],
            })),
            true,
        )
        .expect("step");
        step.wake(false).expect("wake");
        step.go(&context(&tree, &log)).expect("go");

        assert_eq!(step.tests().len(), 2);
        assert_eq!(step.tests()[0].duration, DEFAULT_TEST_DURATION_L2);
        assert_eq!(step.tests()[1].duration, "1m");
    }

    #[test]
    fn shell_discover_requires_name_and_script() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = tree();
        let log = RunLog::new(temp.path());
        let mut step = DiscoverStep::new(
            "/plans/smoke",
            temp.path(),
            Some(&json!({"how": "shell", "tests": [{"test": "true"}]})),
            true,
        )
        .expect("step");
        step.wake(false).expect("wake");
        let err = step.go(&context(&tree, &log)).unwrap_err();
        assert!(err.to_string().contains("discover phase"));
    }

    #[test]
    fn unknown_method_is_a_specification_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut step = DiscoverStep::new(
            "/plans/smoke",
            temp.path(),
            Some(&json!({"how": "teleport"})),
            true,
        )
        .expect("step");
        let err = step.wake(false).unwrap_err();
        assert!(crate::errors::is_specification_error(&err));
    }

    #[test]
    fn wake_restores_discovered_tests_when_done() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = tree();
        let log = RunLog::new(temp.path());
        let mut step = DiscoverStep::new(
            "/plans/smoke",
            temp.path(),
            Some(&json!({"how": "tree"})),
            true,
        )
        .expect("step");
        step.wake(false).expect("wake");
        step.go(&context(&tree, &log)).expect("go");
        let expected: Vec<String> = step
            .tests()
            .iter()
            .map(|test| test.core.name.clone())
            .collect();

        let mut resumed = DiscoverStep::new(
            "/plans/smoke",
            temp.path(),
            Some(&json!({"how": "tree"})),
            true,
        )
        .expect("step");
        resumed.wake(false).expect("wake");
        assert!(resumed.common.is_done());
        let restored: Vec<String> = resumed
            .tests()
            .iter()
            .map(|test| test.core.name.clone())
            .collect();
        assert_eq!(restored, expected);

        // A second go must not discover anything twice.
        resumed.go(&context(&tree, &log)).expect("go");
        assert_eq!(resumed.tests().len(), expected.len());
    }
}
