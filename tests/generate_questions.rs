
use serde_json::json;
use test_support::{request_err, request_ok, setup_module, spawn_sidecar, temp_dir};

#[test]
fn generated_questions_are_well_formed_and_persisted_as_ai() {
    let workspace = temp_dir("examlens-generate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let module_id = setup_module(
        &mut stdin,
        &mut reader,
        &workspace,
        "CS601",
        json!([
            { "loRef": "LO1", "description": "build a sorting algorithm", "bloomLevel": "Create" },
        ]),
    );

    let generated = request_ok(
        &mut stdin,
        &mut reader,
        "gen",
        "questions.generate",
        json!({ "moduleId": module_id, "loRef": "LO1", "mcqCount": 2, "structuredCount": 1 }),
    );
    let questions = generated
        .get("questions")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("generated questions");
    assert_eq!(questions.len(), 3);

    let mcqs: Vec<_> = questions
        .iter()
        .filter(|q| q.get("questionType").and_then(|v| v.as_str()) == Some("mcq"))
        .collect();
    assert_eq!(mcqs.len(), 2);
    for mcq in &mcqs {
        let options = mcq.get("options").and_then(|v| v.as_array()).expect("options");
        assert_eq!(options.len(), 4);
        let correct = mcq
            .get("correctAnswer")
            .and_then(|v| v.as_str())
            .expect("correctAnswer");
        assert!(options.iter().any(|o| o.as_str() == Some(correct)));
    }

    let structured: Vec<_> = questions
        .iter()
        .filter(|q| q.get("questionType").and_then(|v| v.as_str()) == Some("structured"))
        .collect();
    assert_eq!(structured.len(), 1);
    assert!(structured[0].get("marks").and_then(|v| v.as_f64()).unwrap_or(0.0) > 0.0);
    assert!(structured[0]
        .get("sampleAnswer")
        .and_then(|v| v.as_str())
        .is_some());

    // The drafts landed in the question bank with AI provenance.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "question.list",
        json!({ "moduleId": module_id }),
    );
    let stored = listed.get("questions").and_then(|v| v.as_array()).cloned().unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored
        .iter()
        .all(|q| q.get("source").and_then(|v| v.as_str()) == Some("ai")));
}

#[test]
fn generation_rejects_unknown_outcomes_and_empty_requests() {
    let workspace = temp_dir("examlens-generate-errors");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let module_id = setup_module(
        &mut stdin,
        &mut reader,
        &workspace,
        "CS602",
        json!([
            { "loRef": "LO1", "description": "understand loops", "bloomLevel": "Understand" },
        ]),
    );

    let missing = request_err(
        &mut stdin,
        &mut reader,
        "missing-lo",
        "questions.generate",
        json!({ "moduleId": module_id, "loRef": "LO9", "mcqCount": 1 }),
    );
    assert_eq!(missing, "not_found");

    let empty = request_err(
        &mut stdin,
        &mut reader,
        "empty-counts",
        "questions.generate",
        json!({ "moduleId": module_id, "loRef": "LO1" }),
    );
    assert_eq!(empty, "bad_params");
}
