use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("examlens.sqlite3");
    let conn = Connection::open(db_path)?;
    // Background analysis workers open their own connection; let concurrent
    // writers wait instead of failing with SQLITE_BUSY.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS modules(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS module_topics(
            id TEXT PRIMARY KEY,
            module_id TEXT NOT NULL,
            name TEXT NOT NULL,
            subtopics TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(module_id) REFERENCES modules(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_module_topics_module ON module_topics(module_id)",
        [],
    )?;

    // Learning outcomes are embedded in their module: the (module_id, lo_ref)
    // pair is the identity, lo_ref being the caller-assigned label ("LO1").
    conn.execute(
        "CREATE TABLE IF NOT EXISTS learning_outcomes(
            module_id TEXT NOT NULL,
            lo_ref TEXT NOT NULL,
            description TEXT NOT NULL,
            bloom TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(module_id, lo_ref),
            FOREIGN KEY(module_id) REFERENCES modules(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_learning_outcomes_module ON learning_outcomes(module_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            module_id TEXT NOT NULL,
            text TEXT NOT NULL,
            qtype TEXT NOT NULL,
            source TEXT NOT NULL,
            options TEXT,
            correct_answer TEXT,
            marks REAL,
            sample_answer TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(module_id) REFERENCES modules(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_module ON questions(module_id)",
        [],
    )?;

    // Written only by the engine. analysis_tag NULL = the default scope.
    // lo_ref is intentionally not a foreign key: records survive LO edits
    // and the read path joins them back with an "Unknown" fallback.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS coverage_records(
            id TEXT PRIMARY KEY,
            module_id TEXT NOT NULL,
            lo_ref TEXT NOT NULL,
            percentage INTEGER NOT NULL,
            status TEXT NOT NULL,
            matches TEXT NOT NULL,
            analysis_tag TEXT,
            question_count INTEGER NOT NULL,
            analyzed_question_ids TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(module_id) REFERENCES modules(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_coverage_records_module ON coverage_records(module_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_coverage_records_scope ON coverage_records(module_id, analysis_tag)",
        [],
    )?;

    ensure_questions_sample_answer(conn)?;

    Ok(())
}

fn ensure_questions_sample_answer(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate structured sample answers. Add the column if missing.
    if table_has_column(conn, "questions", "sample_answer")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE questions ADD COLUMN sample_answer TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
