#![allow(clippy::float_cmp, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn soil_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_soil") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/soil");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "soil-twin-cli", "--bin", "soil"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build soil binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_path(prefix: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.{extension}", Ulid::new()))
}

fn soil_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(soil_binary_path());
    command.env_remove("SOIL_TWIN_RULESET");
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run soil command {:?}: {err}", args),
    }
}

fn soil_ok(db_path: &Path, args: &[&str]) -> Value {
    let output = soil_output(db_path, args);
    assert!(
        output.status.success(),
        "command {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
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

fn write_file(path: &Path, body: &str) {
    if let Err(err) = std::fs::write(path, body) {
        panic!("failed to write fixture {}: {err}", path.display());
    }
}

fn seed_baselines(db_path: &Path) {
    let file = temp_path("soil-baselines", "jsonl");
    write_file(
        &file,
        concat!(
            r#"{"uid":"farmer","location":"Karnal,IN","nitrogen":240,"phosphorus":20,"potassium":200,"organic_carbon":0.6,"ph":7.2,"moisture":30}"#,
            "\n",
            r#"{"uid":"farmer2","location":"Hisar,IN","nitrogen":300,"phosphorus":25,"potassium":150,"organic_carbon":0.4,"ph":8.0,"moisture":20}"#,
            "\n",
            "not json\n",
        ),
    );

    let report = soil_ok(
        db_path,
        &["baseline", "import", "--file", file.to_string_lossy().as_ref()],
    );
    assert_eq!(report["inserted"], 2);
    assert_eq!(report["skipped_existing"], 0);
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(soil_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "baseline", "event", "events", "history", "replay", "state", "projector", "ruleset",
    ] {
        assert!(
            stdout.contains(required),
            "missing subcommand `{required}` in help:\n{stdout}"
        );
    }
}

#[test]
fn logged_event_reports_projected_state_and_replay_publishes_it() {
    let db_path = temp_path("soil-contract-flow", "sqlite3");
    seed_baselines(&db_path);

    let logged = soil_ok(
        &db_path,
        &[
            "event",
            "log",
            "--user",
            "farmer",
            "--type",
            "rain",
            "--timestamp",
            "2026-02-07T12:00:00Z",
            "--payload-json",
            r#"{"amount_mm": 25}"#,
        ],
    );
    assert_eq!(logged["event"]["provenance"]["kind"], "manual");
    assert_eq!(logged["projected_state"]["nitrogen"], 220.0);
    assert_eq!(logged["projected_state"]["moisture"], 40.0);
    assert_eq!(logged["projected_state"]["status"]["moisture"], "sufficient");

    let lagging = soil_output(&db_path, &["projector", "check", "--json"]);
    assert!(!lagging.status.success());
    let lagging_json = stdout_json(&lagging);
    assert_eq!(lagging_json["contract_version"], "projector_check.v1");
    assert_eq!(lagging_json["healthy"], false);

    let replay = soil_ok(&db_path, &["replay"]);
    assert_eq!(replay["generation"], 1);
    assert_eq!(replay["projected_entities"], 2);
    assert_eq!(replay["processed_events"], 1);

    let check = soil_ok(&db_path, &["projector", "check", "--json"]);
    assert_eq!(check["healthy"], true);
    assert_eq!(check["status"]["contract_version"], "projector_status.v1");
    assert_eq!(check["status"]["lag_events"], 0);

    let view = soil_ok(&db_path, &["state", "show", "--user", "farmer"]);
    assert_eq!(view["flavor"], "authoritative");
    assert_eq!(view["generation"], 1);
    assert_eq!(view["state"]["nitrogen"], 220.0);

    let untouched = soil_ok(&db_path, &["state", "show", "--user", "farmer2"]);
    assert_eq!(untouched["state"]["nitrogen"], 300.0);
}

#[test]
fn stream_import_is_idempotent_and_credits_default_user() {
    let db_path = temp_path("soil-contract-import", "sqlite3");
    seed_baselines(&db_path);

    let stream = temp_path("live_weather", "jsonl");
    write_file(
        &stream,
        concat!(
            r#"{"timestamp":"2026-02-07T10:00:00","rain_mm":4.0,"note":"drizzle"}"#,
            "\n",
            r#"{"timestamp":"2026-02-07T11:00:00","rain_mm":6.0,"note":"shower"}"#,
            "\n",
            r#"{"rain_mm":1.0}"#,
            "\n",
        ),
    );
    let stream_arg = stream.to_string_lossy().to_string();
    let args = [
        "event",
        "import",
        "--file",
        stream_arg.as_str(),
        "--layout",
        "live-weather",
        "--source-kind",
        "live",
        "--source-id",
        "weather",
        "--default-user",
        "farmer",
    ];

    let first = soil_ok(&db_path, &args);
    assert_eq!(first["appended"], 2);
    assert_eq!(first["source"]["kind"], "live");

    let second = soil_ok(&db_path, &args);
    assert_eq!(second["appended"], 0);
    assert_eq!(second["skipped_already_stored"], 2);

    let listed = soil_ok(&db_path, &["events", "list", "--user", "farmer"]);
    let Some(listed) = listed.as_array() else {
        panic!("events list must be an array");
    };
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["event"]["kind"]["event_type"], "rain");
    assert_eq!(listed[0]["event"]["kind"]["payload"]["amount_mm"], 4.0);

    let history = soil_ok(&db_path, &["history", "--user", "farmer", "--limit", "1"]);
    assert_eq!(history[0]["event"]["kind"]["payload"]["amount_mm"], 6.0);

    let replay = soil_ok(&db_path, &["replay"]);
    assert_eq!(replay["processed_events"], 2);
    let view = soil_ok(&db_path, &["state", "show", "--user", "farmer"]);
    assert_eq!(view["state"]["nitrogen"], 232.0);
}

#[test]
fn unknown_entities_and_bad_events_fail_cleanly() {
    let db_path = temp_path("soil-contract-errors", "sqlite3");
    seed_baselines(&db_path);

    let missing = soil_output(&db_path, &["state", "show", "--user", "nobody"]);
    assert!(!missing.status.success());
    assert!(String::from_utf8_lossy(&missing.stderr).contains("nobody"));

    let no_time = soil_output(
        &db_path,
        &[
            "event",
            "log",
            "--user",
            "farmer",
            "--type",
            "rain",
            "--timestamp",
            "yesterday",
        ],
    );
    assert!(!no_time.status.success());

    let malformed = soil_ok(
        &db_path,
        &[
            "event",
            "log",
            "--user",
            "farmer",
            "--type",
            "fertilizer",
            "--timestamp",
            "2026-02-07T12:00:00Z",
            "--payload-json",
            r#"{"kind": "urea"}"#,
        ],
    );
    assert_eq!(malformed["event"]["event"]["kind"]["event_type"], "malformed");
    assert_eq!(malformed["projected_state"]["nitrogen"], 240.0);
}

#[test]
fn ruleset_override_file_is_stored_and_used_by_replay() {
    let db_path = temp_path("soil-contract-ruleset", "sqlite3");
    seed_baselines(&db_path);

    let current = soil_ok(&db_path, &["ruleset", "show"]);
    assert_eq!(current["ruleset_version"], 1);

    let mut wetter = current.clone();
    wetter["ruleset_version"] = Value::from(2);
    wetter["rain_moisture_per_mm"] = Value::from(1.0);
    let ruleset_path = temp_path("soil-ruleset", "json");
    write_file(&ruleset_path, &wetter.to_string());

    let ruleset_arg = ruleset_path.to_string_lossy().to_string();
    let shown = soil_ok(
        &db_path,
        &["--ruleset", ruleset_arg.as_str(), "ruleset", "show"],
    );
    assert_eq!(shown["ruleset_version"], 2);

    soil_ok(
        &db_path,
        &[
            "event",
            "log",
            "--user",
            "farmer",
            "--type",
            "rain",
            "--timestamp",
            "2026-02-07T12:00:00Z",
            "--payload-json",
            r#"{"amount_mm": 10}"#,
        ],
    );
    let replay = soil_ok(&db_path, &["replay"]);
    assert_eq!(replay["ruleset_version"], 2);

    let view = soil_ok(&db_path, &["state", "show", "--user", "farmer"]);
    assert_eq!(view["state"]["moisture"], 40.0);
}

#[test]
fn event_log_rows_are_append_only() {
    let db_path = temp_path("soil-contract-append-only", "sqlite3");
    seed_baselines(&db_path);
    soil_ok(
        &db_path,
        &[
            "event",
            "log",
            "--user",
            "farmer",
            "--type",
            "irrigation",
            "--payload-json",
            r#"{"water_liters": 10000}"#,
        ],
    );

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    let update = conn.execute("UPDATE soil_events SET user_id = 'mutated'", []);
    assert!(update.is_err());
    let delete = conn.execute("DELETE FROM soil_baselines", []);
    assert!(delete.is_err());
}
