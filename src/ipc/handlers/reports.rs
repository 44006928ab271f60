use crate::coverage::{self, StoredRecord};
use crate::engine;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

fn parse_tag(req: &Request) -> Option<String> {
    req.params
        .get("tag")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn module_exists(conn: &Connection, module_id: &str) -> rusqlite::Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM modules WHERE id = ?", [module_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

fn load_scope_records(
    conn: &Connection,
    module_id: &str,
    tag: Option<&str>,
) -> rusqlite::Result<Vec<StoredRecord>> {
    let mut stmt = conn.prepare(
        "SELECT rowid, lo_ref, percentage, status, matches, question_count,
                analyzed_question_ids, created_at
         FROM coverage_records
         WHERE module_id = ? AND analysis_tag IS ?",
    )?;
    stmt.query_map(params![module_id, tag], |row| {
        let matches_json: String = row.get(4)?;
        let analyzed_json: Option<String> = row.get(6)?;
        Ok(StoredRecord {
            rowid: row.get(0)?,
            lo_ref: row.get(1)?,
            percentage: row.get(2)?,
            status: row.get(3)?,
            matches: serde_json::from_str(&matches_json).unwrap_or_default(),
            question_count: row.get(5)?,
            analyzed_question_ids: analyzed_json
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            created_at: row.get(7)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

/// lo_ref -> (description, stored bloom) for the module's current LO list.
fn load_outcome_map(
    conn: &Connection,
    module_id: &str,
) -> rusqlite::Result<HashMap<String, (String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT lo_ref, description, bloom FROM learning_outcomes WHERE module_id = ?",
    )?;
    let rows = stmt
        .query_map([module_id], |r| {
            Ok((r.get::<_, String>(0)?, (r.get::<_, String>(1)?, r.get::<_, String>(2)?)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

fn load_question_texts(
    conn: &Connection,
    module_id: &str,
) -> rusqlite::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT id, text FROM questions WHERE module_id = ?")?;
    let rows = stmt
        .query_map([module_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

fn build_report(
    conn: &Connection,
    module_id: &str,
    tag: Option<&str>,
) -> rusqlite::Result<serde_json::Value> {
    let records = coverage::dedup_latest(load_scope_records(conn, module_id, tag)?);
    let outcome_map = load_outcome_map(conn, module_id)?;
    let question_texts = load_question_texts(conn, module_id)?;

    let mut results = Vec::with_capacity(records.len());
    for rec in &records {
        // A record can outlive its LO (edited/removed since the run); the
        // report degrades to placeholders instead of failing.
        let (description, bloom_label) = match outcome_map.get(&rec.lo_ref) {
            Some((desc, bloom)) => (
                desc.clone(),
                coverage::BloomLevel::display_label(bloom),
            ),
            None => ("Unknown".to_string(), "Unknown".to_string()),
        };
        let matched = rec
            .matches
            .iter()
            .map(|m| {
                json!({
                    "questionId": m.question_id,
                    "questionText": question_texts.get(&m.question_id),
                    "score": m.score
                })
            })
            .collect::<Vec<_>>();
        results.push(json!({
            "loRef": rec.lo_ref,
            "description": description,
            "bloomLevel": bloom_label,
            "coveragePercent": rec.percentage,
            "status": rec.status,
            "statusLabel": coverage::CoverageStatus::from_stored(&rec.status)
                .map(|s| s.label())
                .unwrap_or("Not Covered"),
            "matchedQuestions": matched,
            "questionCount": rec.question_count,
            "analyzedAt": rec.created_at
        }));
    }

    // Scope metadata comes from the newest surviving record.
    let latest = records
        .iter()
        .max_by(|a, b| {
            (a.created_at.as_str(), a.rowid).cmp(&(b.created_at.as_str(), b.rowid))
        });
    let analyzed_questions = latest
        .and_then(|rec| rec.analyzed_question_ids.as_ref())
        .map(|ids| {
            ids.iter()
                .map(|id| json!({ "id": id, "text": question_texts.get(id) }))
                .collect::<Vec<_>>()
        });

    Ok(json!({
        "tag": tag,
        "results": results,
        "analyzedQuestions": analyzed_questions,
        "questionCount": latest.map(|r| r.question_count).unwrap_or(0),
        "generatedAt": latest.map(|r| r.created_at.clone())
    }))
}

fn handle_coverage_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };
    match module_exists(conn, &module_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "module not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let question_ids: Option<Vec<String>> = match req.params.get("questionIds") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Array(items)) => {
            let mut ids = Vec::with_capacity(items.len());
            for v in items {
                let Some(id) = v.as_str() else {
                    return err(
                        &req.id,
                        "bad_params",
                        "questionIds must contain only strings",
                        None,
                    );
                };
                ids.push(id.to_string());
            }
            Some(ids)
        }
        Some(_) => {
            return err(&req.id, "bad_params", "questionIds must be an array", None)
        }
    };
    let tag = parse_tag(req);

    let outcome = match engine::run_analysis(
        conn,
        state.oracle.as_ref(),
        &module_id,
        question_ids.as_deref(),
        tag.as_deref(),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "analysis_failed", e.to_string(), None),
    };

    if !outcome.analyzed {
        return ok(
            &req.id,
            json!({
                "analyzed": false,
                "message": "nothing to analyze: module needs outcomes and questions"
            }),
        );
    }

    match build_report(conn, &module_id, tag.as_deref()) {
        Ok(report) => ok(
            &req.id,
            json!({
                "analyzed": true,
                "loCount": outcome.lo_count,
                "questionCount": outcome.question_count,
                "report": report
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_coverage_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };
    match module_exists(conn, &module_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "module not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let tag = parse_tag(req);
    match build_report(conn, &module_id, tag.as_deref()) {
        Ok(report) => ok(&req.id, json!({ "report": report })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_coverage_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };
    match module_exists(conn, &module_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "module not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let tag = parse_tag(req);
    let records = match load_scope_records(conn, &module_id, tag.as_deref()) {
        Ok(v) => coverage::dedup_latest(v),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let stats = coverage::aggregate_stats(&records);
    match serde_json::to_value(&stats) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_coverage_tags(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT DISTINCT analysis_tag FROM coverage_records
         WHERE module_id = ? AND analysis_tag IS NOT NULL
         ORDER BY analysis_tag",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&module_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(tags) => ok(&req.id, json!({ "tags": tags })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_coverage_bloom_levels(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };
    match module_exists(conn, &module_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "module not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let tag = parse_tag(req);
    let records = match load_scope_records(conn, &module_id, tag.as_deref()) {
        Ok(v) => coverage::dedup_latest(v),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let levels_by_ref = match load_outcome_map(conn, &module_id) {
        Ok(map) => map
            .into_iter()
            .map(|(lo_ref, (_desc, bloom))| (lo_ref, bloom))
            .collect::<HashMap<_, _>>(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rollup = coverage::bloom_rollup(&records, &levels_by_ref);
    match serde_json::to_value(&rollup) {
        Ok(v) => ok(&req.id, json!({ "levels": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "coverage.run" => Some(handle_coverage_run(state, req)),
        "coverage.report" => Some(handle_coverage_report(state, req)),
        "coverage.stats" => Some(handle_coverage_stats(state, req)),
        "coverage.tags" => Some(handle_coverage_tags(state, req)),
        "coverage.bloomLevels" => Some(handle_coverage_bloom_levels(state, req)),
        _ => None,
    }
}
