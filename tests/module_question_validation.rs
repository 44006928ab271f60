
use serde_json::json;
use test_support::{request_err, request_ok, setup_module, spawn_sidecar, temp_dir};

#[test]
fn module_codes_are_upper_cased_and_unique() {
    let workspace = temp_dir("examlens-module-codes");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let module_id = setup_module(&mut stdin, &mut reader, &workspace, "cs101", json!([]));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "module.get",
        json!({ "moduleId": module_id }),
    );
    assert_eq!(fetched.get("code").and_then(|v| v.as_str()), Some("CS101"));

    // Same code in a different case collides.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "dup",
        "module.create",
        json!({ "code": "Cs101", "name": "dup" }),
    );
    assert_eq!(code, "conflict");
}

#[test]
fn module_outcome_payloads_are_validated() {
    let workspace = temp_dir("examlens-module-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let bad_bloom = request_err(
        &mut stdin,
        &mut reader,
        "bad-bloom",
        "module.create",
        json!({
            "code": "CS401",
            "name": "m",
            "outcomes": [
                { "loRef": "LO1", "description": "d", "bloomLevel": "Synthesize" },
            ],
        }),
    );
    assert_eq!(bad_bloom, "bad_params");

    let dup_ref = request_err(
        &mut stdin,
        &mut reader,
        "dup-ref",
        "module.create",
        json!({
            "code": "CS401",
            "name": "m",
            "outcomes": [
                { "loRef": "LO1", "description": "a", "bloomLevel": "Apply" },
                { "loRef": "LO1", "description": "b", "bloomLevel": "Apply" },
            ],
        }),
    );
    assert_eq!(dup_ref, "bad_params");
}

#[test]
fn question_payloads_are_validated_before_persistence() {
    let workspace = temp_dir("examlens-question-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let module_id = setup_module(
        &mut stdin,
        &mut reader,
        &workspace,
        "CS501",
        json!([
            { "loRef": "LO1", "description": "understand loops", "bloomLevel": "Understand" },
        ]),
    );

    // One usable option is not an MCQ ("" is discarded, so only "yes" remains).
    let too_few = request_err(
        &mut stdin,
        &mut reader,
        "few-options",
        "question.add",
        json!({
            "moduleId": module_id,
            "text": "pick",
            "questionType": "mcq",
            "options": ["yes", "  "],
            "correctAnswer": "yes",
        }),
    );
    assert_eq!(too_few, "bad_params");

    let wrong_answer = request_err(
        &mut stdin,
        &mut reader,
        "wrong-answer",
        "question.add",
        json!({
            "moduleId": module_id,
            "text": "pick",
            "questionType": "mcq",
            "options": ["yes", "no"],
            "correctAnswer": "maybe",
        }),
    );
    assert_eq!(wrong_answer, "bad_params");

    let no_marks = request_err(
        &mut stdin,
        &mut reader,
        "no-marks",
        "question.add",
        json!({
            "moduleId": module_id,
            "text": "essay",
            "questionType": "structured",
        }),
    );
    assert_eq!(no_marks, "bad_params");

    let bad_type = request_err(
        &mut stdin,
        &mut reader,
        "bad-type",
        "question.add",
        json!({
            "moduleId": module_id,
            "text": "essay",
            "questionType": "oral",
            "marks": 5,
        }),
    );
    assert_eq!(bad_type, "bad_params");

    let missing_module = request_err(
        &mut stdin,
        &mut reader,
        "missing-module",
        "question.add",
        json!({
            "moduleId": "no-such-module",
            "text": "essay",
            "questionType": "structured",
            "marks": 5,
        }),
    );
    assert_eq!(missing_module, "not_found");

    // Nothing slipped through.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "question.list",
        json!({ "moduleId": module_id }),
    );
    assert_eq!(
        listed.get("questions").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // A valid MCQ round-trips with its options intact.
    let added = request_ok(
        &mut stdin,
        &mut reader,
        "good-mcq",
        "question.add",
        json!({
            "moduleId": module_id,
            "text": "which construct repeats a block",
            "questionType": "mcq",
            "options": ["a loop", "a constant", "a comment"],
            "correctAnswer": "a loop",
        }),
    );
    assert!(added.get("questionId").and_then(|v| v.as_str()).is_some());
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list-2",
        "question.list",
        json!({ "moduleId": module_id }),
    );
    let questions = listed.get("questions").and_then(|v| v.as_array()).cloned().unwrap();
    assert_eq!(questions.len(), 1);
    assert_eq!(
        questions[0].get("options").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(3)
    );
    assert_eq!(
        questions[0].get("source").and_then(|v| v.as_str()),
        Some("manual")
    );
}
