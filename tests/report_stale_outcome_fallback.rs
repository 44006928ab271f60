
use serde_json::json;
use test_support::{add_structured_question, request_ok, setup_module, spawn_sidecar, temp_dir};

// Coverage records reference LOs by their caller-assigned label, which can go
// stale when the module's outcomes are edited. The report must degrade to
// placeholders, never fail.
#[test]
fn reports_survive_removed_outcomes_with_unknown_placeholders() {
    let workspace = temp_dir("examlens-stale-lo");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let module_id = setup_module(
        &mut stdin,
        &mut reader,
        &workspace,
        "CS701",
        json!([
            { "loRef": "LO1", "description": "understand loops", "bloomLevel": "Understand" },
        ]),
    );
    add_structured_question(&mut stdin, &mut reader, "q1", &module_id, "understand loops");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "run",
        "coverage.run",
        json!({ "moduleId": module_id, "tag": "audit" }),
    );

    // Drop every outcome from the module; the audit records stay behind.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "strip",
        "module.update",
        json!({ "moduleId": module_id, "outcomes": [] }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "report",
        "coverage.report",
        json!({ "moduleId": module_id, "tag": "audit" }),
    );
    let results = report
        .get("report")
        .and_then(|r| r.get("results"))
        .and_then(|v| v.as_array())
        .cloned()
        .expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get("loRef").and_then(|v| v.as_str()), Some("LO1"));
    assert_eq!(
        results[0].get("description").and_then(|v| v.as_str()),
        Some("Unknown")
    );
    assert_eq!(
        results[0].get("bloomLevel").and_then(|v| v.as_str()),
        Some("Unknown")
    );
    // The computed numbers themselves are untouched.
    assert_eq!(
        results[0].get("coveragePercent").and_then(|v| v.as_i64()),
        Some(100)
    );

    // Orphaned records group under "Unknown" in the rollup.
    let rollup = request_ok(
        &mut stdin,
        &mut reader,
        "bloom",
        "coverage.bloomLevels",
        json!({ "moduleId": module_id, "tag": "audit" }),
    );
    let levels = rollup.get("levels").and_then(|v| v.as_array()).cloned().unwrap();
    assert_eq!(levels.len(), 1);
    assert_eq!(levels[0].get("level").and_then(|v| v.as_str()), Some("Unknown"));

    // With no outcomes left, a fresh run is a quiet no-op and leaves the
    // stale-but-readable records in place.
    let rerun = request_ok(
        &mut stdin,
        &mut reader,
        "rerun",
        "coverage.run",
        json!({ "moduleId": module_id, "tag": "audit" }),
    );
    assert_eq!(rerun.get("analyzed").and_then(|v| v.as_bool()), Some(false));
}
