use std::fs;
use std::path::Path;

use chrono::DateTime;
use serde::Deserialize;
use walcast_core::{decode_event, TableRegistration, TableRegistry};

#[derive(Debug, Deserialize)]
struct Fixture {
    name: String,
    description: String,
    tables: Vec<TableDef>,
    buffers: Vec<serde_json::Value>,
    expected: Vec<ExpectedOutcome>,
}

#[derive(Debug, Deserialize)]
struct TableDef {
    name: String,
    replica_identity: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpectedOutcome {
    Skipped { skipped: bool },
    Event {
        event: serde_json::Value,
        timestamp: String,
    },
}

fn build_registry(tables: &[TableDef]) -> TableRegistry<walcast_core::FieldMap> {
    TableRegistry::new(tables.iter().map(|t| {
        TableRegistration::raw(
            t.name.parse().unwrap(),
            t.replica_identity.parse().unwrap(),
        )
    }))
    .unwrap()
}

/// Strings are sent as raw bytes so fixtures can carry corrupt buffers.
fn buffer_bytes(buffer: &serde_json::Value) -> Vec<u8> {
    match buffer {
        serde_json::Value::String(raw) => raw.as_bytes().to_vec(),
        other => serde_json::to_vec(other).unwrap(),
    }
}

fn load_and_run_fixture(path: &Path) {
    let content = fs::read_to_string(path).expect("Failed to read fixture file");
    let fixture: Fixture = serde_json::from_str(&content).expect("Failed to parse fixture");

    println!("Running fixture: {} - {}", fixture.name, fixture.description);

    assert_eq!(
        fixture.buffers.len(),
        fixture.expected.len(),
        "Fixture {} must list one outcome per buffer",
        fixture.name
    );

    let registry = build_registry(&fixture.tables);

    for (i, (buffer, expected)) in fixture.buffers.iter().zip(&fixture.expected).enumerate() {
        let result = decode_event(&buffer_bytes(buffer)).and_then(|e| registry.map_event(e));

        match expected {
            ExpectedOutcome::Skipped { skipped } => {
                assert!(*skipped, "Buffer {}: 'skipped' must be true", i);
                assert!(result.is_err(), "Buffer {}: expected a skip, got {:?}", i, result);
            }
            ExpectedOutcome::Event { event, timestamp } => {
                let actual = result.unwrap_or_else(|e| panic!("Buffer {}: {}", i, e));

                let expected_ts = DateTime::parse_from_rfc3339(timestamp).unwrap();
                assert_eq!(actual.meta_data().timestamp, expected_ts, "Buffer {} timestamp", i);

                let mut actual_json = serde_json::to_value(&actual).unwrap();
                actual_json
                    .as_object_mut()
                    .expect("events serialize as objects")
                    .remove("meta_data");
                assert_eq!(&actual_json, event, "Buffer {} event mismatch", i);
            }
        }
    }

    println!("  PASSED");
}

#[test]
fn test_all_fixtures() {
    let fixtures_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");

    let mut fixture_count = 0;

    for entry in fs::read_dir(&fixtures_dir).expect("Failed to read fixtures directory") {
        let entry = entry.expect("Failed to read directory entry");
        let path = entry.path();

        if path.extension().map_or(false, |ext| ext == "json") {
            load_and_run_fixture(&path);
            fixture_count += 1;
        }
    }

    assert!(
        fixture_count > 0,
        "No fixture files found in {:?}",
        fixtures_dir
    );
    println!("Ran {} fixture(s) successfully", fixture_count);
}

#[test]
fn test_all_actions_fixture() {
    let fixtures_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    load_and_run_fixture(&fixtures_dir.join("all_actions.json"));
}

#[test]
fn test_skipped_buffers_fixture() {
    let fixtures_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    load_and_run_fixture(&fixtures_dir.join("skipped_buffers.json"));
}
