use crate::engine;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn parse_options(req: &Request) -> Result<Vec<String>, serde_json::Value> {
    let Some(raw) = req.params.get("options").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "mcq questions need options", None));
    };
    let mut out = Vec::new();
    for v in raw {
        let Some(opt) = v.as_str() else {
            return Err(err(
                &req.id,
                "bad_params",
                "options must contain only strings",
                None,
            ));
        };
        let trimmed = opt.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    if out.len() < 2 {
        return Err(err(
            &req.id,
            "bad_params",
            "mcq questions need at least 2 non-empty options",
            None,
        ));
    }
    Ok(out)
}

fn handle_question_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };
    let module_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM modules WHERE id = ?", [&module_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if module_exists.is_none() {
        return err(&req.id, "not_found", "module not found", None);
    }

    let text = match req.params.get("text").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing text", None),
    };
    if text.is_empty() {
        return err(&req.id, "bad_params", "text must not be empty", None);
    }

    let qtype = req
        .params
        .get("questionType")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let source = match req
        .params
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or("manual")
    {
        "manual" => "manual",
        "uploaded" => "uploaded",
        other => {
            return err(
                &req.id,
                "bad_params",
                "source must be manual or uploaded",
                Some(json!({ "source": other })),
            )
        }
    };

    let mut options_json: Option<String> = None;
    let mut correct_answer: Option<String> = None;
    let mut marks: Option<f64> = None;
    let mut sample_answer: Option<String> = None;

    match qtype.as_str() {
        "mcq" => {
            let options = match parse_options(req) {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            let answer = match req.params.get("correctAnswer").and_then(|v| v.as_str()) {
                Some(v) => v.trim().to_string(),
                None => return err(&req.id, "bad_params", "mcq questions need correctAnswer", None),
            };
            if !options.iter().any(|o| o == &answer) {
                return err(
                    &req.id,
                    "bad_params",
                    "correctAnswer must be one of the options",
                    Some(json!({ "correctAnswer": answer })),
                );
            }
            options_json =
                Some(serde_json::to_string(&options).unwrap_or_else(|_| "[]".to_string()));
            correct_answer = Some(answer);
        }
        "structured" => {
            let value = match req.params.get("marks").and_then(|v| v.as_f64()) {
                Some(v) => v,
                None => {
                    return err(&req.id, "bad_params", "structured questions need marks", None)
                }
            };
            if value <= 0.0 {
                return err(&req.id, "bad_params", "marks must be greater than 0", None);
            }
            marks = Some(value);
            sample_answer = req
                .params
                .get("sampleAnswer")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
        }
        other => {
            return err(
                &req.id,
                "bad_params",
                "questionType must be mcq or structured",
                Some(json!({ "questionType": other })),
            )
        }
    }

    let question_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    if let Err(e) = conn.execute(
        "INSERT INTO questions(
            id, module_id, text, qtype, source, options, correct_answer,
            marks, sample_answer, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            question_id,
            module_id,
            text,
            qtype,
            source,
            options_json,
            correct_answer,
            marks,
            sample_answer,
            created_at,
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        );
    }

    // Refresh the default scope without blocking the caller. Any background
    // failure is logged, never surfaced here.
    if let Some(workspace) = state.workspace.clone() {
        engine::spawn_background_analysis(workspace, state.oracle.clone(), module_id.clone());
    }

    ok(&req.id, json!({ "questionId": question_id }))
}

fn question_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let text: String = row.get(1)?;
    let qtype: String = row.get(2)?;
    let source: String = row.get(3)?;
    let options_json: Option<String> = row.get(4)?;
    let correct_answer: Option<String> = row.get(5)?;
    let marks: Option<f64> = row.get(6)?;
    let sample_answer: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;

    let options: Option<Vec<String>> =
        options_json.and_then(|raw| serde_json::from_str(&raw).ok());
    Ok(json!({
        "id": id,
        "text": text,
        "questionType": qtype,
        "source": source,
        "options": options,
        "correctAnswer": correct_answer,
        "marks": marks,
        "sampleAnswer": sample_answer,
        "createdAt": created_at
    }))
}

fn handle_question_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, text, qtype, source, options, correct_answer, marks, sample_answer, created_at
         FROM questions WHERE module_id = ? ORDER BY created_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&module_id], question_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(questions) => ok(&req.id, json!({ "questions": questions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_question_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let question_id = match req.params.get("questionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing questionId", None),
    };

    let deleted = match conn.execute("DELETE FROM questions WHERE id = ?", [&question_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "question not found", None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "question.add" => Some(handle_question_add(state, req)),
        "question.list" => Some(handle_question_list(state, req)),
        "question.delete" => Some(handle_question_delete(state, req)),
        _ => None,
    }
}
