//! End-to-end lifecycle: a run over a real metadata tree on disk,
//! executed with the local guest, resumed, and judged by its exit code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::json;

use planrun::core::query::Selection;
use planrun::exit_codes;
use planrun::io::config::UserConfig;
use planrun::run::{Run, RunOptions, RunState};
use planrun::steps::{StepName, StepRange};
use planrun::test_support::{node, write_tree};

fn sample_tree(root: &Path) {
    write_tree(
        root,
        vec![
            node("/tests/good", json!({"test": "true", "order": 10})),
            node("/tests/bad", json!({"test": "false", "order": 20})),
            node(
                "/tests/known-issue",
                json!({"test": "false", "result": "xfail", "order": 30}),
            ),
            node(
                "/plans/smoke",
                json!({
                    "summary": "Smoke test everything",
                    "discover": {"how": "tree", "names": ["^/tests/"]},
                    "provision": {"how": "local"},
                    "execute": {"how": "shell"},
                    "report": {"how": "display"},
                    "finish": {"how": "shell", "script": "touch cleaned-up"},
                }),
            ),
        ],
    );
}

struct Fixture {
    options: RunOptions,
    config: UserConfig,
    config_path: PathBuf,
}

fn fixture(base: &Path) -> Fixture {
    sample_tree(&base.join("tree"));
    Fixture {
        options: RunOptions {
            id: Some(base.join("workdir")),
            root: Some(base.join("tree")),
            ..RunOptions::default()
        },
        config: UserConfig {
            workdir_root: base.join("runs"),
            ..UserConfig::default()
        },
        config_path: base.join("config.toml"),
    }
}

fn execute(fixture: &Fixture) -> (i32, PathBuf) {
    let mut run = Run::new(
        fixture.options.clone(),
        fixture.config.clone(),
        fixture.config_path.clone(),
    )
    .expect("create run");
    let code = run.go().expect("run");
    (code, run.workdir().to_path_buf())
}

#[test]
fn full_run_reports_failure_exit_code_and_artifacts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(temp.path());

    let (code, workdir) = execute(&fixture);
    // good passes, bad fails, known-issue turns into a pass via xfail.
    assert_eq!(code, exit_codes::FAIL);

    let plan_dir = workdir.join("plans/smoke");
    // Every stage persisted its state.
    for step in ["discover", "provision", "prepare", "execute", "report", "finish"] {
        assert!(
            plan_dir.join(step).join("step.json").is_file(),
            "missing step state for {step}"
        );
    }
    // Results and logs landed in the workdir.
    let results: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(
            &std::fs::read_to_string(plan_dir.join("execute/results.json")).expect("read"),
        )
        .expect("parse");
    assert_eq!(results.len(), 3);
    assert_eq!(results["/tests/good"]["result"], json!("pass"));
    assert_eq!(results["/tests/bad"]["result"], json!("fail"));
    assert_eq!(results["/tests/known-issue"]["result"], json!("pass"));
    assert!(
        results["/tests/known-issue"]["note"]
            .as_str()
            .expect("note")
            .contains("original result: fail")
    );
    assert!(plan_dir.join("execute/data/tests/good/output.txt").is_file());

    // The finish script ran inside the worktree.
    assert!(plan_dir.join("tree/cleaned-up").exists());

    // The run log is a product artifact.
    let log = std::fs::read_to_string(workdir.join("log.txt")).expect("read log");
    assert!(log.contains("/plans/smoke"));
    assert!(log.contains("total:"));
}

#[test]
fn resumed_run_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(temp.path());

    let (first, workdir) = execute(&fixture);
    let results_path = workdir.join("plans/smoke/execute/results.json");
    let before = std::fs::read_to_string(&results_path).expect("read");

    // Reload the run from disk: steps are already done, nothing reruns,
    // the exit code is computed from the restored results.
    let (second, _) = execute(&fixture);
    assert_eq!(first, second);
    let after = std::fs::read_to_string(&results_path).expect("read");
    assert_eq!(before, after);
}

#[test]
fn partial_run_then_rest_of_the_pipeline() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut fixture = fixture(temp.path());

    // First invocation: discover only.
    fixture.options.range = StepRange {
        until: Some(StepName::Discover),
        ..StepRange::default()
    };
    let (code, workdir) = execute(&fixture);
    assert_eq!(code, exit_codes::OK);
    assert!(workdir.join("plans/smoke/discover/tests.json").is_file());
    assert!(!workdir.join("plans/smoke/execute/results.json").exists());

    // Second invocation: everything from provision on, reusing the
    // discovered tests from the workdir.
    fixture.options.range = StepRange {
        since: Some(StepName::Provision),
        ..StepRange::default()
    };
    let (code, workdir) = execute(&fixture);
    assert_eq!(code, exit_codes::FAIL);
    let state: RunState = serde_json::from_str(
        &std::fs::read_to_string(workdir.join("run.json")).expect("read"),
    )
    .expect("parse");
    assert!(!state.steps.contains(&StepName::Discover));
    assert!(state.steps.contains(&StepName::Finish));
}

#[test]
fn plan_selection_by_name_and_persisted_restore() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tree_root = temp.path().join("tree");
    // Two plans, one of which would fail the whole run if selected.
    write_tree(
        &tree_root,
        vec![
            node("/tests/good", json!({"test": "true"})),
            node(
                "/plans/smoke",
                json!({
                    "discover": {"how": "tree", "names": ["^/tests/good$"]},
                    "execute": {"how": "shell"},
                }),
            ),
            node(
                "/plans/broken",
                json!({"execute": {"how": "antigravity"}}),
            ),
        ],
    );

    let fixture = Fixture {
        options: RunOptions {
            id: Some(temp.path().join("workdir")),
            root: Some(tree_root),
            plans: Selection::with_names(vec!["^/plans/smoke$".to_string()]),
            ..RunOptions::default()
        },
        config: UserConfig {
            workdir_root: temp.path().join("runs"),
            ..UserConfig::default()
        },
        config_path: temp.path().join("config.toml"),
    };
    let (code, workdir) = execute(&fixture);
    assert_eq!(code, exit_codes::OK);

    // Resume without naming plans: the persisted selection sticks and the
    // broken plan is still never touched.
    let resume = Fixture {
        options: RunOptions {
            id: Some(workdir.clone()),
            root: fixture.options.root.clone(),
            ..RunOptions::default()
        },
        config: fixture.config.clone(),
        config_path: fixture.config_path.clone(),
    };
    let (code, _) = execute(&resume);
    assert_eq!(code, exit_codes::OK);
    let state: RunState = serde_json::from_str(
        &std::fs::read_to_string(workdir.join("run.json")).expect("read"),
    )
    .expect("parse");
    assert_eq!(state.plans, vec!["/plans/smoke".to_string()]);
}

#[test]
fn run_environment_takes_precedence_over_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tree_root = temp.path().join("tree");
    write_tree(
        &tree_root,
        vec![
            node("/tests/env", json!({"test": "test \"$STAGE\" = from-cli"})),
            node(
                "/plans/env",
                json!({
                    "discover": {"how": "tree"},
                    "execute": {"how": "shell"},
                    "environment": {"STAGE": "from-plan"},
                }),
            ),
        ],
    );

    let fixture = Fixture {
        options: RunOptions {
            id: Some(temp.path().join("workdir")),
            root: Some(tree_root),
            environment: vec!["STAGE=from-cli".to_string()],
            ..RunOptions::default()
        },
        config: UserConfig {
            workdir_root: temp.path().join("runs"),
            ..UserConfig::default()
        },
        config_path: temp.path().join("config.toml"),
    };
    let (code, _) = execute(&fixture);
    assert_eq!(code, exit_codes::OK);
}
