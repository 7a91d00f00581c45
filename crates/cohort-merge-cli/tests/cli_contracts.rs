use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;

fn cm_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cm"))
}

fn cm_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(cm_binary_path());
    command.arg("--db").arg(db_path).env("RUST_LOG", "warn");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run cm command {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn write_file(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            panic!("failed to create {}: {err}", parent.display());
        }
    }
    if let Err(err) = std::fs::write(path, body) {
        panic!("failed to write {}: {err}", path.display());
    }
}

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("tempdir: {err}"),
        };
        let input = dir.path().join("input");
        write_file(
            &input.join("patients.csv"),
            "Id,FIRST,LAST,BIRTHDATE,GENDER,RACE\np1,Ana,Silva,1980-01-02,F,white\np2,Ben,Okafor,1975-05-06,M,black\n",
        );
        write_file(
            &input.join("medications.csv"),
            "START,PATIENT,DESCRIPTION,TOTALCOST\n2019-01-01,p1,Aspirin,12.5\n2019-03-01,p2,Lisinopril,8.25\n,,Orphan,1.0\n",
        );
        write_file(
            &dir.path().join("quick.json"),
            r#"{"queries": [{"name": "record_count", "sql": "SELECT COUNT(*) FROM {table}", "expect_rows": true}]}"#,
        );
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn db(&self) -> PathBuf {
        self.path("tables.sqlite3")
    }

    fn run(&self, extra: &[&str]) -> Output {
        let input = self.path("input");
        let output = self.path("output");
        let mut args = vec![
            "run",
            "--input",
            input.to_str().unwrap_or_default(),
            "--output",
            output.to_str().unwrap_or_default(),
        ];
        args.extend_from_slice(extra);
        cm_output(&self.db(), &args)
    }
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(cm_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run cm --help: {err}"),
    };
    assert_success(&output);
    let help = String::from_utf8_lossy(&output.stdout);
    for command in ["run", "segregate", "harness", "tables", "datasets"] {
        assert!(help.contains(command), "help is missing {command}:\n{help}");
    }
}

#[test]
fn run_json_reports_summary_and_writes_artifacts() {
    let workspace = Workspace::new();
    let quick = workspace.path("quick.json");
    let report = workspace.path("run.json");
    let publish = workspace.path("bucket");
    let output = workspace.run(&[
        "--config",
        quick.to_str().unwrap_or_default(),
        "--report",
        report.to_str().unwrap_or_default(),
        "--publish-dir",
        publish.to_str().unwrap_or_default(),
        "--json",
    ]);
    assert_success(&output);

    let summary = stdout_json(&output);
    assert_eq!(summary["contract_version"], "pipeline_run.v1");
    assert_eq!(summary["patients_materialized"], 2);
    assert_eq!(summary["error_counts"]["partition_error"], 1);
    assert_eq!(summary["harness"]["verdict"]["tier"], "excellent");
    assert!(summary["run_id"].as_str().is_some_and(|id| id.len() == 26));

    assert!(report.exists());
    assert!(workspace
        .path("output/patients/p1/merged_patient_data.csv")
        .exists());
    assert!(publish.join("patient_p2/merged_patient_data.csv").exists());

    let conn = match Connection::open(workspace.db()) {
        Ok(value) => value,
        Err(err) => panic!("open db: {err}"),
    };
    let catalogued: i64 = match conn.query_row("SELECT COUNT(*) FROM patient_tables", [], |row| {
        row.get(0)
    }) {
        Ok(value) => value,
        Err(err) => panic!("count catalog: {err}"),
    };
    assert_eq!(catalogued, 2);
}

#[test]
fn tables_list_returns_catalog_entries() {
    let workspace = Workspace::new();
    assert_success(&workspace.run(&["--json"]));

    let output = cm_output(&workspace.db(), &["tables", "list"]);
    assert_success(&output);
    let tables = stdout_json(&output);
    let Some(entries) = tables.as_array() else {
        panic!("expected an array: {tables}");
    };
    let ids: Vec<&str> = entries
        .iter()
        .filter_map(|entry| entry["patient_id"].as_str())
        .collect();
    assert_eq!(ids, vec!["p1", "p2"]);
    assert_eq!(entries[0]["table_name"], "patient_7031");
}

#[test]
fn harness_exit_code_follows_verdict_tier() {
    let workspace = Workspace::new();
    assert_success(&workspace.run(&["--json"]));

    let quick = workspace.path("quick.json");
    let passing = cm_output(
        &workspace.db(),
        &["harness", "run", "--config", quick.to_str().unwrap_or_default(), "--json"],
    );
    assert_success(&passing);
    assert_eq!(stdout_json(&passing)["verdict"]["tier"], "excellent");

    let failing = cm_output(&workspace.db(), &["harness", "run", "--json"]);
    assert!(!failing.status.success());
    let report = stdout_json(&failing);
    assert_eq!(report["verdict"]["tier"], "needs_work");
    assert_eq!(report["per_patient"].as_array().map(Vec::len), Some(2));
}

#[test]
fn segregate_reports_partition_statistics() {
    let workspace = Workspace::new();
    let input = workspace.path("input");
    let output = cm_output(
        &workspace.db(),
        &["segregate", "--input", input.to_str().unwrap_or_default()],
    );
    assert_success(&output);
    let report = stdout_json(&output);
    assert_eq!(report["patients"], 2);
    assert_eq!(report["dropped_rows"], 1);
    assert_eq!(report["partition"]["medications"]["total_rows"], 3);
}

#[test]
fn datasets_list_and_rollback_round_trip() {
    let workspace = Workspace::new();
    assert_success(&workspace.run(&["--json"]));
    write_file(
        &workspace.path("input/medications.csv"),
        "START,PATIENT,DESCRIPTION,TOTALCOST\n2019-01-01,p1,Aspirin,12.5\n2019-02-01,p1,Metformin,40.0\n2019-03-01,p2,Lisinopril,8.25\n",
    );
    assert_success(&workspace.run(&["--json"]));

    let output_dir = workspace.path("output");
    let out = output_dir.to_str().unwrap_or_default();
    let listed = cm_output(
        &workspace.db(),
        &["datasets", "list", "--output", out, "--patient-id", "p1"],
    );
    assert_success(&listed);
    let versions = stdout_json(&listed);
    assert_eq!(versions.as_array().map(Vec::len), Some(2));

    let rolled = cm_output(
        &workspace.db(),
        &[
            "datasets", "rollback", "--output", out, "--patient-id", "p1", "--version", "1",
        ],
    );
    assert_success(&rolled);
    let entry = stdout_json(&rolled);
    assert_eq!(entry["dataset_version"], 1);
    assert_eq!(entry["row_count"], 1);
}

#[test]
fn datasets_commands_honor_the_config_flag() {
    let workspace = Workspace::new();
    assert_success(&workspace.run(&["--json"]));
    let published = workspace.path("output/patients/p1/merged_patient_data.csv");
    let before = std::fs::read(&published).unwrap_or_default();

    let invalid = workspace.path("invalid.json");
    write_file(&invalid, r#"{"retain_versions": 0}"#);
    let output_dir = workspace.path("output");
    let out = output_dir.to_str().unwrap_or_default();
    let rejected = cm_output(
        &workspace.db(),
        &[
            "datasets",
            "rollback",
            "--output",
            out,
            "--patient-id",
            "p1",
            "--version",
            "1",
            "--config",
            invalid.to_str().unwrap_or_default(),
        ],
    );
    assert!(!rejected.status.success());
    assert!(String::from_utf8_lossy(&rejected.stderr).contains("retain_versions"));
    assert_eq!(std::fs::read(&published).unwrap_or_default(), before);

    let quick = workspace.path("quick.json");
    let listed = cm_output(
        &workspace.db(),
        &[
            "datasets",
            "list",
            "--output",
            out,
            "--patient-id",
            "p1",
            "--config",
            quick.to_str().unwrap_or_default(),
        ],
    );
    assert_success(&listed);
    assert_eq!(stdout_json(&listed).as_array().map(Vec::len), Some(1));
}

#[test]
fn invalid_patient_id_is_rejected() {
    let workspace = Workspace::new();
    let output_dir = workspace.path("output");
    let output = cm_output(
        &workspace.db(),
        &[
            "datasets",
            "list",
            "--output",
            output_dir.to_str().unwrap_or_default(),
            "--patient-id",
            "../etc",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("patient-id"));
}
