use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "lectivo.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_periods(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            estado TEXT NOT NULL DEFAULT 'ACTIVO',
            estado_supletorio TEXT NOT NULL DEFAULT 'PENDIENTE',
            created_at TEXT,
            finalized_at TEXT
        )",
        [],
    )?;
    // At most one ACTIVO period, enforced by storage as well as by periods.create.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_academic_periods_single_active
         ON academic_periods(estado) WHERE estado = 'ACTIVO'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trimesters(
            id TEXT PRIMARY KEY,
            period_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            estado TEXT NOT NULL DEFAULT 'PENDIENTE',
            finalized_at TEXT,
            FOREIGN KEY(period_id) REFERENCES academic_periods(id),
            UNIQUE(period_id, ordinal)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_weights(
            period_id TEXT PRIMARY KEY,
            insumos REAL NOT NULL,
            proyecto REAL NOT NULL,
            examen REAL NOT NULL,
            FOREIGN KEY(period_id) REFERENCES academic_periods(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_sections(
            id TEXT PRIMARY KEY,
            period_id TEXT NOT NULL,
            name TEXT NOT NULL,
            grade_level INTEGER NOT NULL DEFAULT 0,
            is_final_year INTEGER NOT NULL DEFAULT 0,
            estado TEXT NOT NULL DEFAULT 'ACTIVO',
            FOREIGN KEY(period_id) REFERENCES academic_periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_sections_period ON course_sections(period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_offerings(
            id TEXT PRIMARY KEY,
            period_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            teacher_id TEXT,
            nature TEXT NOT NULL DEFAULT 'QUANTITATIVE',
            estado TEXT NOT NULL DEFAULT 'ACTIVO',
            FOREIGN KEY(period_id) REFERENCES academic_periods(id),
            FOREIGN KEY(section_id) REFERENCES course_sections(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_offerings_period ON subject_offerings(period_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_offerings_section ON subject_offerings(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            estado TEXT NOT NULL DEFAULT 'SIN_MATRICULA',
            current_section_id TEXT,
            updated_at TEXT,
            FOREIGN KEY(current_section_id) REFERENCES course_sections(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            estado TEXT NOT NULL DEFAULT 'ACTIVO',
            withdraw_reason TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(section_id) REFERENCES course_sections(id),
            FOREIGN KEY(period_id) REFERENCES academic_periods(id),
            UNIQUE(student_id, period_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section ON enrollments(section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_period ON enrollments(period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scores(
            id TEXT PRIMARY KEY,
            offering_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            trimester_id TEXT NOT NULL,
            evaluation_type TEXT,
            score REAL,
            qualitative TEXT,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(offering_id) REFERENCES subject_offerings(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(trimester_id) REFERENCES trimesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_scores_pair
         ON grade_scores(offering_id, student_id, trimester_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_scores_trimester ON grade_scores(trimester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trimester_averages(
            offering_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            trimester_id TEXT NOT NULL,
            promedio_insumos REAL,
            ponderado_insumos REAL,
            nota_proyecto REAL,
            ponderado_proyecto REAL,
            nota_examen REAL,
            ponderado_examen REAL,
            nota_final_trimestre REAL,
            cualitativa TEXT,
            computed_at TEXT NOT NULL,
            PRIMARY KEY(offering_id, student_id, trimester_id),
            FOREIGN KEY(offering_id) REFERENCES subject_offerings(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(trimester_id) REFERENCES trimesters(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS supplementary_records(
            period_id TEXT NOT NULL,
            offering_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            annual_average REAL,
            eligible INTEGER NOT NULL DEFAULT 1,
            score REAL,
            updated_at TEXT,
            PRIMARY KEY(period_id, offering_id, student_id),
            FOREIGN KEY(period_id) REFERENCES academic_periods(id),
            FOREIGN KEY(offering_id) REFERENCES subject_offerings(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

pub fn settings_delete(conn: &Connection, key: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM settings WHERE key = ?", [key])?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
