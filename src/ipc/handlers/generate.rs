use crate::coverage::BloomLevel;
use crate::engine;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::oracle::repair_mcq;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const MAX_GENERATED_PER_KIND: u64 = 20;

fn handle_questions_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };
    let lo_ref = match req.params.get("loRef").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing loRef", None),
    };

    let mcq_count = req
        .params
        .get("mcqCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let structured_count = req
        .params
        .get("structuredCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    if mcq_count == 0 && structured_count == 0 {
        return err(
            &req.id,
            "bad_params",
            "request at least one of mcqCount, structuredCount",
            None,
        );
    }
    if mcq_count > MAX_GENERATED_PER_KIND || structured_count > MAX_GENERATED_PER_KIND {
        return err(
            &req.id,
            "bad_params",
            format!("counts are capped at {} per kind", MAX_GENERATED_PER_KIND),
            None,
        );
    }

    let lo: Option<(String, String)> = match conn
        .query_row(
            "SELECT description, bloom FROM learning_outcomes
             WHERE module_id = ? AND lo_ref = ?",
            params![module_id, lo_ref],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((description, bloom_raw)) = lo else {
        return err(&req.id, "not_found", "learning outcome not found", None);
    };
    let bloom = BloomLevel::parse(&bloom_raw).unwrap_or(BloomLevel::Understand);

    // Explicit user request: a generator failure is surfaced, unlike the
    // swallowed background-analysis errors.
    let bundle = match state.generator.generate(
        &description,
        bloom,
        mcq_count as usize,
        structured_count as usize,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "generation_failed", e.to_string(), None),
    };

    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut created = Vec::new();
    for raw in bundle.mcqs {
        // Malformed generator output is padded into shape, never rejected.
        let mcq = repair_mcq(raw);
        let question_id = Uuid::new_v4().to_string();
        let options_json =
            serde_json::to_string(&mcq.options).unwrap_or_else(|_| "[]".to_string());
        if let Err(e) = tx.execute(
            "INSERT INTO questions(
                id, module_id, text, qtype, source, options, correct_answer, created_at
             ) VALUES(?, ?, ?, 'mcq', 'ai', ?, ?, ?)",
            params![
                question_id,
                module_id,
                mcq.text,
                options_json,
                mcq.correct_answer,
                created_at,
            ],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        created.push(json!({
            "questionId": question_id,
            "questionType": "mcq",
            "text": mcq.text,
            "options": mcq.options,
            "correctAnswer": mcq.correct_answer
        }));
    }
    for item in bundle.structured {
        let question_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO questions(
                id, module_id, text, qtype, source, marks, sample_answer, created_at
             ) VALUES(?, ?, ?, 'structured', 'ai', ?, ?, ?)",
            params![
                question_id,
                module_id,
                item.text,
                item.marks,
                item.sample_answer,
                created_at,
            ],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        created.push(json!({
            "questionId": question_id,
            "questionType": "structured",
            "text": item.text,
            "marks": item.marks,
            "sampleAnswer": item.sample_answer
        }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    if let Some(workspace) = state.workspace.clone() {
        engine::spawn_background_analysis(workspace, state.oracle.clone(), module_id.clone());
    }

    ok(&req.id, json!({ "questions": created }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "questions.generate" => Some(handle_questions_generate(state, req)),
        _ => None,
    }
}
