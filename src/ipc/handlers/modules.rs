use crate::coverage::BloomLevel;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

struct OutcomeInput {
    lo_ref: String,
    description: String,
    bloom: BloomLevel,
}

struct TopicInput {
    name: String,
    subtopics: Vec<String>,
}

fn parse_outcomes(req: &Request) -> Result<Vec<OutcomeInput>, serde_json::Value> {
    let Some(raw) = req.params.get("outcomes") else {
        return Ok(Vec::new());
    };
    let Some(items) = raw.as_array() else {
        return Err(err(&req.id, "bad_params", "outcomes must be an array", None));
    };
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for item in items {
        let lo_ref = item
            .get("loRef")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if lo_ref.is_empty() {
            return Err(err(
                &req.id,
                "bad_params",
                "each outcome needs a non-empty loRef",
                None,
            ));
        }
        if !seen.insert(lo_ref.clone()) {
            return Err(err(
                &req.id,
                "bad_params",
                "outcome loRef values must be unique within the module",
                Some(json!({ "loRef": lo_ref })),
            ));
        }
        let description = item
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if description.is_empty() {
            return Err(err(
                &req.id,
                "bad_params",
                "each outcome needs a non-empty description",
                Some(json!({ "loRef": lo_ref })),
            ));
        }
        let bloom_raw = item
            .get("bloomLevel")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let Some(bloom) = BloomLevel::parse(bloom_raw) else {
            return Err(err(
                &req.id,
                "bad_params",
                "bloomLevel must be one of: Remember, Understand, Apply, Analyze, Evaluate, Create",
                Some(json!({ "loRef": lo_ref, "bloomLevel": bloom_raw })),
            ));
        };
        out.push(OutcomeInput {
            lo_ref,
            description,
            bloom,
        });
    }
    Ok(out)
}

fn parse_topics(req: &Request) -> Result<Vec<TopicInput>, serde_json::Value> {
    let Some(raw) = req.params.get("topics") else {
        return Ok(Vec::new());
    };
    let Some(items) = raw.as_array() else {
        return Err(err(&req.id, "bad_params", "topics must be an array", None));
    };
    let mut out = Vec::new();
    for item in items {
        let name = item
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if name.is_empty() {
            return Err(err(
                &req.id,
                "bad_params",
                "each topic needs a non-empty name",
                None,
            ));
        }
        let mut subtopics = Vec::new();
        if let Some(subs) = item.get("subtopics").and_then(|v| v.as_array()) {
            for s in subs {
                let Some(label) = s.as_str() else {
                    return Err(err(
                        &req.id,
                        "bad_params",
                        "subtopics must contain only strings",
                        Some(json!({ "topic": name })),
                    ));
                };
                subtopics.push(label.trim().to_string());
            }
        }
        out.push(TopicInput { name, subtopics });
    }
    Ok(out)
}

fn insert_topics_and_outcomes(
    conn: &Connection,
    module_id: &str,
    topics: &[TopicInput],
    outcomes: &[OutcomeInput],
) -> rusqlite::Result<()> {
    for (i, topic) in topics.iter().enumerate() {
        conn.execute(
            "INSERT INTO module_topics(id, module_id, name, subtopics, sort_order)
             VALUES(?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                module_id,
                topic.name,
                serde_json::to_string(&topic.subtopics).unwrap_or_else(|_| "[]".to_string()),
                i as i64,
            ],
        )?;
    }
    for (i, lo) in outcomes.iter().enumerate() {
        conn.execute(
            "INSERT INTO learning_outcomes(module_id, lo_ref, description, bloom, sort_order)
             VALUES(?, ?, ?, ?, ?)",
            params![module_id, lo.lo_ref, lo.description, lo.bloom.as_str(), i as i64],
        )?;
    }
    Ok(())
}

fn handle_module_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let code = match req.params.get("code").and_then(|v| v.as_str()) {
        // Module codes are case-normalized so "cs101" and "CS101" collide.
        Some(v) => v.trim().to_ascii_uppercase(),
        None => return err(&req.id, "bad_params", "missing code", None),
    };
    if code.is_empty() {
        return err(&req.id, "bad_params", "code must not be empty", None);
    }
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let outcomes = match parse_outcomes(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let topics = match parse_topics(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let existing: Option<String> = match conn
        .query_row("SELECT id FROM modules WHERE code = ?", [&code], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing.is_some() {
        return err(
            &req.id,
            "conflict",
            "a module with this code already exists",
            Some(json!({ "code": code })),
        );
    }

    let module_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO modules(id, code, name) VALUES(?, ?, ?)",
        params![module_id, code, name],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = insert_topics_and_outcomes(&tx, &module_id, &topics, &outcomes) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "moduleId": module_id, "code": code, "name": name }))
}

fn handle_module_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM modules WHERE id = ?", [&module_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "module not found", None);
    }

    let new_code = match req.params.get("code").and_then(|v| v.as_str()) {
        Some(v) => {
            let code = v.trim().to_ascii_uppercase();
            if code.is_empty() {
                return err(&req.id, "bad_params", "code must not be empty", None);
            }
            let clash: Option<String> = match conn
                .query_row(
                    "SELECT id FROM modules WHERE code = ? AND id != ?",
                    params![code, module_id],
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if clash.is_some() {
                return err(
                    &req.id,
                    "conflict",
                    "a module with this code already exists",
                    Some(json!({ "code": code })),
                );
            }
            Some(code)
        }
        None => None,
    };
    let new_name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => {
            let name = v.trim().to_string();
            if name.is_empty() {
                return err(&req.id, "bad_params", "name must not be empty", None);
            }
            Some(name)
        }
        None => None,
    };

    // Topics and outcomes are replace-wholesale: absence means "leave alone".
    let replace_outcomes = req.params.get("outcomes").is_some();
    let outcomes = match parse_outcomes(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let replace_topics = req.params.get("topics").is_some();
    let topics = match parse_topics(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Some(code) = &new_code {
        if let Err(e) = tx.execute(
            "UPDATE modules SET code = ? WHERE id = ?",
            params![code, module_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(name) = &new_name {
        if let Err(e) = tx.execute(
            "UPDATE modules SET name = ? WHERE id = ?",
            params![name, module_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if replace_topics {
        if let Err(e) = tx.execute("DELETE FROM module_topics WHERE module_id = ?", [&module_id]) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if replace_outcomes {
        if let Err(e) = tx.execute(
            "DELETE FROM learning_outcomes WHERE module_id = ?",
            [&module_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = insert_topics_and_outcomes(
        &tx,
        &module_id,
        if replace_topics { &topics } else { &[] },
        if replace_outcomes { &outcomes } else { &[] },
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "moduleId": module_id }))
}

fn handle_module_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM modules WHERE id = ?", [&module_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "module not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Questions and coverage records are intentionally left behind; the read
    // path tolerates orphans and nothing lists them once the module is gone.
    for sql in [
        "DELETE FROM learning_outcomes WHERE module_id = ?",
        "DELETE FROM module_topics WHERE module_id = ?",
        "DELETE FROM modules WHERE id = ?",
    ] {
        if let Err(e) = tx.execute(sql, [&module_id]) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

fn handle_module_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "modules": [] }));
    };

    // Correlated subqueries keep the counts join-free.
    let mut stmt = match conn.prepare(
        "SELECT
           m.id,
           m.code,
           m.name,
           (SELECT COUNT(*) FROM learning_outcomes lo WHERE lo.module_id = m.id) AS outcome_count,
           (SELECT COUNT(*) FROM questions q WHERE q.module_id = m.id) AS question_count
         FROM modules m
         ORDER BY m.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let name: String = row.get(2)?;
            let outcome_count: i64 = row.get(3)?;
            let question_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "outcomeCount": outcome_count,
                "questionCount": question_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(modules) => ok(&req.id, json!({ "modules": modules })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn load_outcomes_json(
    conn: &Connection,
    module_id: &str,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT lo_ref, description, bloom FROM learning_outcomes
         WHERE module_id = ? ORDER BY sort_order",
    )?;
    stmt.query_map([module_id], |row| {
        let lo_ref: String = row.get(0)?;
        let description: String = row.get(1)?;
        let bloom: String = row.get(2)?;
        Ok(json!({
            "loRef": lo_ref,
            "description": description,
            "bloomLevel": BloomLevel::display_label(&bloom)
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

fn handle_module_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };

    let row: Option<(String, String)> = match conn
        .query_row(
            "SELECT code, name FROM modules WHERE id = ?",
            [&module_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((code, name)) = row else {
        return err(&req.id, "not_found", "module not found", None);
    };

    let topics = {
        let mut stmt = match conn.prepare(
            "SELECT name, subtopics FROM module_topics WHERE module_id = ? ORDER BY sort_order",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([&module_id], |row| {
                let name: String = row.get(0)?;
                let subtopics_json: String = row.get(1)?;
                let subtopics: Vec<String> =
                    serde_json::from_str(&subtopics_json).unwrap_or_default();
                Ok(json!({ "name": name, "subtopics": subtopics }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let outcomes = match load_outcomes_json(conn, &module_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "id": module_id,
            "code": code,
            "name": name,
            "topics": topics,
            "outcomes": outcomes
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "module.create" => Some(handle_module_create(state, req)),
        "module.update" => Some(handle_module_update(state, req)),
        "module.delete" => Some(handle_module_delete(state, req)),
        "module.list" => Some(handle_module_list(state, req)),
        "module.get" => Some(handle_module_get(state, req)),
        _ => None,
    }
}
