use crate::coverage::{self, CoverageError, QuestionMatch};
use crate::db;
use crate::oracle::{clamp_score, SimilarityOracle};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub analyzed: bool,
    pub lo_count: usize,
    pub question_count: usize,
}

const NO_OP: RunOutcome = RunOutcome {
    analyzed: false,
    lo_count: 0,
    question_count: 0,
};

struct QuestionRow {
    id: String,
    text: String,
}

fn load_outcomes(conn: &Connection, module_id: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT lo_ref, description FROM learning_outcomes
         WHERE module_id = ? ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([module_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Explicit ids are restricted to questions that actually belong to the
/// module; ids from another module (or nowhere) silently drop out.
fn resolve_questions(
    conn: &Connection,
    module_id: &str,
    question_ids: Option<&[String]>,
) -> anyhow::Result<Vec<QuestionRow>> {
    if let Some(ids) = question_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = std::iter::repeat("?")
            .take(ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT id, text FROM questions
             WHERE module_id = ? AND id IN ({})
             ORDER BY created_at, id",
            placeholders
        );
        let mut values: Vec<Value> = Vec::with_capacity(ids.len() + 1);
        values.push(Value::Text(module_id.to_string()));
        for id in ids {
            values.push(Value::Text(id.clone()));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |r| {
                Ok(QuestionRow {
                    id: r.get(0)?,
                    text: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    } else {
        let mut stmt = conn.prepare(
            "SELECT id, text FROM questions WHERE module_id = ? ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([module_id], |r| {
                Ok(QuestionRow {
                    id: r.get(0)?,
                    text: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// One full coverage run for a (module, scope) pair.
///
/// Replaces every prior record in that exact scope, then writes one fresh
/// record per learning outcome. Runs under other tags are untouched. A module
/// with no outcomes, or a resolved question set that is empty, is a silent
/// no-op rather than an error so implicit triggers stay quiet.
///
/// The delete+insert sequence is deliberately not wrapped in a transaction;
/// the read path's dedup-by-latest-timestamp compensates for an interleaved
/// or interrupted run.
pub fn run_analysis(
    conn: &Connection,
    oracle: &dyn SimilarityOracle,
    module_id: &str,
    question_ids: Option<&[String]>,
    analysis_tag: Option<&str>,
) -> anyhow::Result<RunOutcome> {
    let module_exists: bool = conn
        .query_row("SELECT COUNT(*) FROM modules WHERE id = ?", [module_id], |r| {
            r.get::<_, i64>(0)
        })
        .map(|n| n > 0)?;
    if !module_exists {
        return Err(CoverageError::new(
            "module_not_found",
            format!("module not found: {}", module_id),
        )
        .into());
    }

    let outcomes = load_outcomes(conn, module_id)?;
    if outcomes.is_empty() {
        return Ok(NO_OP);
    }

    let questions = resolve_questions(conn, module_id, question_ids)?;
    if questions.is_empty() {
        return Ok(NO_OP);
    }

    conn.execute(
        "DELETE FROM coverage_records WHERE module_id = ? AND analysis_tag IS ?",
        params![module_id, analysis_tag],
    )?;

    let analyzed_ids_json = match question_ids {
        Some(_) => Some(serde_json::to_string(
            &questions.iter().map(|q| q.id.as_str()).collect::<Vec<_>>(),
        )?),
        None => None,
    };
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

    for (lo_ref, description) in &outcomes {
        let mut matches: Vec<QuestionMatch> = Vec::new();
        for q in &questions {
            let score = match oracle.similarity(description, &q.text) {
                Ok(raw) => clamp_score(raw),
                Err(e) => {
                    // A single bad pair never sinks the LO, let alone the run.
                    warn!(
                        lo_ref = lo_ref.as_str(),
                        question_id = q.id.as_str(),
                        error = %e,
                        "similarity oracle failed for pair, skipping"
                    );
                    continue;
                }
            };
            if score > coverage::RELEVANCE_THRESHOLD {
                matches.push(QuestionMatch {
                    question_id: q.id.clone(),
                    score,
                });
            }
        }

        let scores: Vec<f64> = matches.iter().map(|m| m.score).collect();
        let percentage = coverage::coverage_percentage(&scores);
        let status = coverage::status_for(percentage);

        conn.execute(
            "INSERT INTO coverage_records(
                id, module_id, lo_ref, percentage, status, matches,
                analysis_tag, question_count, analyzed_question_ids, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                module_id,
                lo_ref,
                percentage,
                status.as_str(),
                serde_json::to_string(&matches)?,
                analysis_tag,
                questions.len() as i64,
                analyzed_ids_json,
                created_at,
            ],
        )?;
    }

    info!(
        module_id,
        tag = analysis_tag.unwrap_or("<default>"),
        los = outcomes.len(),
        questions = questions.len(),
        "coverage analysis complete"
    );

    Ok(RunOutcome {
        analyzed: true,
        lo_count: outcomes.len(),
        question_count: questions.len(),
    })
}

/// Fire-and-forget re-analysis of a module's default scope, used after a
/// question is added or generated. The worker opens its own connection; any
/// failure ends up in the log and never in the triggering response.
pub fn spawn_background_analysis(
    workspace: PathBuf,
    oracle: Arc<dyn SimilarityOracle>,
    module_id: String,
) {
    std::thread::spawn(move || {
        let conn = match db::open_db(&workspace) {
            Ok(c) => c,
            Err(e) => {
                error!(module_id = module_id.as_str(), error = %e, "background analysis could not open workspace db");
                return;
            }
        };
        if let Err(e) = run_analysis(&conn, oracle.as_ref(), &module_id, None, None) {
            error!(module_id = module_id.as_str(), error = %e, "background coverage analysis failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    /// Returns scripted scores keyed by (LO description, question text);
    /// unscripted pairs score 0.0, pairs in `failing` return Err.
    struct ScriptedOracle {
        scores: HashMap<(String, String), f64>,
        failing: HashSet<(String, String)>,
    }

    impl ScriptedOracle {
        fn new() -> Self {
            Self {
                scores: HashMap::new(),
                failing: HashSet::new(),
            }
        }

        fn score(mut self, lo: &str, q: &str, v: f64) -> Self {
            self.scores.insert((lo.to_string(), q.to_string()), v);
            self
        }

        fn fail_on(mut self, lo: &str, q: &str) -> Self {
            self.failing.insert((lo.to_string(), q.to_string()));
            self
        }
    }

    impl SimilarityOracle for ScriptedOracle {
        fn similarity(&self, lo_text: &str, question_text: &str) -> anyhow::Result<f64> {
            let key = (lo_text.to_string(), question_text.to_string());
            if self.failing.contains(&key) {
                anyhow::bail!("scripted oracle failure");
            }
            Ok(self.scores.get(&key).copied().unwrap_or(0.0))
        }
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn seed_module(conn: &Connection, id: &str, code: &str) {
        conn.execute(
            "INSERT INTO modules(id, code, name) VALUES(?, ?, ?)",
            params![id, code, code],
        )
        .expect("insert module");
    }

    fn seed_lo(conn: &Connection, module_id: &str, lo_ref: &str, desc: &str, order: i64) {
        conn.execute(
            "INSERT INTO learning_outcomes(module_id, lo_ref, description, bloom, sort_order)
             VALUES(?, ?, ?, 'understand', ?)",
            params![module_id, lo_ref, desc, order],
        )
        .expect("insert lo");
    }

    fn seed_question(conn: &Connection, id: &str, module_id: &str, text: &str) {
        conn.execute(
            "INSERT INTO questions(id, module_id, text, qtype, source, created_at)
             VALUES(?, ?, ?, 'structured', 'manual', ?)",
            params![id, module_id, text, format!("2026-01-01T00:00:0{}Z", id.len() % 10)],
        )
        .expect("insert question");
    }

    struct RecordRow {
        lo_ref: String,
        percentage: i64,
        status: String,
        matches: Vec<QuestionMatch>,
        question_count: i64,
        analyzed_question_ids: Option<String>,
        analysis_tag: Option<String>,
    }

    fn load_records(conn: &Connection, module_id: &str) -> Vec<RecordRow> {
        let mut stmt = conn
            .prepare(
                "SELECT lo_ref, percentage, status, matches, question_count,
                        analyzed_question_ids, analysis_tag
                 FROM coverage_records WHERE module_id = ? ORDER BY lo_ref, analysis_tag",
            )
            .expect("prepare");
        stmt.query_map([module_id], |r| {
            let matches_json: String = r.get(3)?;
            Ok(RecordRow {
                lo_ref: r.get(0)?,
                percentage: r.get(1)?,
                status: r.get(2)?,
                matches: serde_json::from_str(&matches_json).unwrap_or_default(),
                question_count: r.get(4)?,
                analyzed_question_ids: r.get(5)?,
                analysis_tag: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .expect("load records")
    }

    #[test]
    fn computes_percentage_and_status_per_lo() {
        let conn = test_conn();
        seed_module(&conn, "m1", "CS101");
        seed_lo(&conn, "m1", "LO1", "understand loops", 0);
        seed_lo(&conn, "m1", "LO2", "build a sorting algorithm", 1);
        seed_question(&conn, "q1", "m1", "t1");
        seed_question(&conn, "q2", "m1", "t2");
        seed_question(&conn, "q3", "m1", "t3");

        let oracle = ScriptedOracle::new()
            .score("understand loops", "t1", 0.8)
            .score("understand loops", "t2", 0.1)
            .score("understand loops", "t3", 0.5);
        // LO2 gets the unscripted default of 0.0 everywhere.

        let outcome = run_analysis(&conn, &oracle, "m1", None, None).expect("run");
        assert!(outcome.analyzed);
        assert_eq!(outcome.lo_count, 2);
        assert_eq!(outcome.question_count, 3);

        let records = load_records(&conn, "m1");
        assert_eq!(records.len(), 2);

        let lo1 = &records[0];
        assert_eq!(lo1.lo_ref, "LO1");
        assert_eq!(lo1.percentage, 65); // round(((0.8 + 0.5) / 2) * 100)
        assert_eq!(lo1.status, "partial");
        assert_eq!(lo1.matches.len(), 2);
        assert_eq!(lo1.question_count, 3);
        assert!(lo1.analyzed_question_ids.is_none());

        let lo2 = &records[1];
        assert_eq!(lo2.percentage, 0);
        assert_eq!(lo2.status, "not_covered");
        assert!(lo2.matches.is_empty());
    }

    #[test]
    fn exact_threshold_score_does_not_count_as_covering() {
        let conn = test_conn();
        seed_module(&conn, "m1", "CS101");
        seed_lo(&conn, "m1", "LO1", "desc", 0);
        seed_question(&conn, "q1", "m1", "at threshold");
        seed_question(&conn, "q2", "m1", "just above");

        let oracle = ScriptedOracle::new()
            .score("desc", "at threshold", 0.3)
            .score("desc", "just above", 0.31);

        run_analysis(&conn, &oracle, "m1", None, None).expect("run");
        let records = load_records(&conn, "m1");
        assert_eq!(records[0].matches.len(), 1);
        assert_eq!(records[0].matches[0].question_id, "q2");
        assert_eq!(records[0].percentage, 31);
    }

    #[test]
    fn rerun_supersedes_own_scope_only() {
        let conn = test_conn();
        seed_module(&conn, "m1", "CS101");
        seed_lo(&conn, "m1", "LO1", "desc", 0);
        seed_question(&conn, "q1", "m1", "text");

        let oracle = ScriptedOracle::new().score("desc", "text", 0.9);
        run_analysis(&conn, &oracle, "m1", None, None).expect("default scope");
        run_analysis(&conn, &oracle, "m1", None, Some("midterm")).expect("tagged scope");

        // Re-running the tagged scope with a weaker oracle replaces only it.
        let weaker = ScriptedOracle::new().score("desc", "text", 0.4);
        run_analysis(&conn, &weaker, "m1", None, Some("midterm")).expect("re-run tagged");

        let records = load_records(&conn, "m1");
        assert_eq!(records.len(), 2);
        let default = records
            .iter()
            .find(|r| r.analysis_tag.is_none())
            .expect("default record");
        let tagged = records
            .iter()
            .find(|r| r.analysis_tag.as_deref() == Some("midterm"))
            .expect("tagged record");
        assert_eq!(default.percentage, 90);
        assert_eq!(tagged.percentage, 40);
    }

    #[test]
    fn explicit_subset_excludes_foreign_questions_and_records_ids() {
        let conn = test_conn();
        seed_module(&conn, "m1", "CS101");
        seed_module(&conn, "m2", "CS102");
        seed_lo(&conn, "m1", "LO1", "desc", 0);
        seed_question(&conn, "q1", "m1", "local");
        seed_question(&conn, "qx", "m2", "foreign");

        let oracle = ScriptedOracle::new()
            .score("desc", "local", 0.8)
            .score("desc", "foreign", 0.9);

        let ids = vec!["q1".to_string(), "qx".to_string()];
        let outcome = run_analysis(&conn, &oracle, "m1", Some(&ids), Some("subset")).expect("run");
        assert_eq!(outcome.question_count, 1);

        let records = load_records(&conn, "m1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].question_count, 1);
        let analyzed: Vec<String> =
            serde_json::from_str(records[0].analyzed_question_ids.as_deref().unwrap())
                .expect("analyzed ids json");
        assert_eq!(analyzed, vec!["q1".to_string()]);
        assert_eq!(records[0].matches.len(), 1);
        assert_eq!(records[0].matches[0].question_id, "q1");
    }

    #[test]
    fn subset_of_only_foreign_ids_is_a_no_op() {
        let conn = test_conn();
        seed_module(&conn, "m1", "CS101");
        seed_module(&conn, "m2", "CS102");
        seed_lo(&conn, "m1", "LO1", "desc", 0);
        seed_question(&conn, "qx", "m2", "foreign");

        let oracle = ScriptedOracle::new();
        let ids = vec!["qx".to_string()];
        let outcome = run_analysis(&conn, &oracle, "m1", Some(&ids), None).expect("run");
        assert!(!outcome.analyzed);
        assert!(load_records(&conn, "m1").is_empty());
    }

    #[test]
    fn module_without_outcomes_or_questions_is_a_no_op() {
        let conn = test_conn();
        seed_module(&conn, "m1", "CS101");
        let oracle = ScriptedOracle::new();

        // No LOs yet.
        seed_question(&conn, "q1", "m1", "text");
        assert!(!run_analysis(&conn, &oracle, "m1", None, None).expect("run").analyzed);

        // LOs but an empty question module.
        let conn2 = test_conn();
        seed_module(&conn2, "m2", "CS102");
        seed_lo(&conn2, "m2", "LO1", "desc", 0);
        assert!(!run_analysis(&conn2, &oracle, "m2", None, None).expect("run").analyzed);
        assert!(load_records(&conn2, "m2").is_empty());
    }

    #[test]
    fn missing_module_is_an_error() {
        let conn = test_conn();
        let oracle = ScriptedOracle::new();
        assert!(run_analysis(&conn, &oracle, "nope", None, None).is_err());
    }

    #[test]
    fn failed_pair_is_skipped_without_aborting_the_lo() {
        let conn = test_conn();
        seed_module(&conn, "m1", "CS101");
        seed_lo(&conn, "m1", "LO1", "desc", 0);
        seed_question(&conn, "q1", "m1", "good");
        seed_question(&conn, "q2", "m1", "bad");

        let oracle = ScriptedOracle::new()
            .score("desc", "good", 0.8)
            .fail_on("desc", "bad");

        run_analysis(&conn, &oracle, "m1", None, None).expect("run");
        let records = load_records(&conn, "m1");
        assert_eq!(records[0].matches.len(), 1);
        // The failed pair contributes nothing to the mean.
        assert_eq!(records[0].percentage, 80);
        // But the question still counts toward the resolved-set size.
        assert_eq!(records[0].question_count, 2);
    }

    #[test]
    fn out_of_range_scores_are_clamped_before_thresholding() {
        let conn = test_conn();
        seed_module(&conn, "m1", "CS101");
        seed_lo(&conn, "m1", "LO1", "desc", 0);
        seed_question(&conn, "q1", "m1", "hot");
        seed_question(&conn, "q2", "m1", "nan");

        let oracle = ScriptedOracle::new()
            .score("desc", "hot", 3.5)
            .score("desc", "nan", f64::NAN);

        run_analysis(&conn, &oracle, "m1", None, None).expect("run");
        let records = load_records(&conn, "m1");
        assert_eq!(records[0].matches.len(), 1);
        assert_eq!(records[0].percentage, 100);
    }
}
