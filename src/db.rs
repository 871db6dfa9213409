use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("evald.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dept_name TEXT NOT NULL UNIQUE,
            is_enrolled INTEGER NOT NULL DEFAULT 1,
            note TEXT,
            note_updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS department_catalog_listings(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            department_id INTEGER NOT NULL,
            subject_area TEXT NOT NULL DEFAULT '',
            catalog_id TEXT,
            default_form_id INTEGER,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            FOREIGN KEY(default_form_id) REFERENCES department_forms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_catalog_listings_department
            ON department_catalog_listings(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS department_forms(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            deleted_at TEXT
        )",
        [],
    )?;
    // Form names are reusable after a soft delete, unique while live.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_department_forms_live_name
            ON department_forms(name) WHERE deleted_at IS NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_types(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;
    seed_evaluation_types(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS department_contacts(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            department_id INTEGER NOT NULL,
            uid TEXT NOT NULL,
            sis_id TEXT,
            first_name TEXT,
            last_name TEXT,
            email TEXT,
            can_receive_communications INTEGER NOT NULL DEFAULT 1,
            can_view_reports INTEGER NOT NULL DEFAULT 0,
            can_view_response_rates INTEGER NOT NULL DEFAULT 0,
            UNIQUE(department_id, uid),
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS contact_department_forms(
            contact_id INTEGER NOT NULL,
            form_id INTEGER NOT NULL,
            PRIMARY KEY(contact_id, form_id),
            FOREIGN KEY(contact_id) REFERENCES department_contacts(id),
            FOREIGN KEY(form_id) REFERENCES department_forms(id)
        )",
        [],
    )?;

    // Local override rows. Durable numeric ids survive later edits so
    // vendor history stays linkable across export runs. No uniqueness on
    // (term, department, course, instructor): duplicated evaluations
    // (midterm + final twins) are separate rows.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            term_id TEXT NOT NULL,
            department_id INTEGER NOT NULL,
            course_number TEXT NOT NULL,
            instructor_uid TEXT,
            status TEXT,
            department_form_id INTEGER,
            evaluation_type_id INTEGER,
            start_date TEXT,
            end_date TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_by TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            FOREIGN KEY(department_form_id) REFERENCES department_forms(id),
            FOREIGN KEY(evaluation_type_id) REFERENCES evaluation_types(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_term_course
            ON evaluations(term_id, course_number)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_term_department
            ON evaluations(term_id, department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS export_runs(
            id TEXT PRIMARY KEY,
            term_id TEXT NOT NULL,
            path TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_export_runs_term ON export_runs(term_id, started_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sis_sections(
            term_id TEXT NOT NULL,
            course_number TEXT NOT NULL,
            subject_area TEXT NOT NULL,
            catalog_id TEXT NOT NULL,
            instruction_format TEXT NOT NULL,
            section_num TEXT NOT NULL,
            course_title TEXT NOT NULL,
            is_primary INTEGER NOT NULL,
            instructor_uid TEXT,
            instructor_role_code TEXT,
            meeting_start_date TEXT,
            meeting_end_date TEXT,
            enrollment_count INTEGER NOT NULL DEFAULT 0,
            cross_listed_with TEXT,
            room_shared_with TEXT,
            foreign_department_course INTEGER NOT NULL DEFAULT 0,
            loaded_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sis_sections_term_course
            ON sis_sections(term_id, course_number)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sis_sections_term_subject
            ON sis_sections(term_id, subject_area)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sis_instructors(
            uid TEXT PRIMARY KEY,
            sis_id TEXT,
            first_name TEXT,
            last_name TEXT,
            email TEXT,
            affiliations TEXT,
            loaded_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sis_students(
            uid TEXT PRIMARY KEY,
            sis_id TEXT,
            first_name TEXT,
            last_name TEXT,
            email TEXT,
            loaded_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sis_enrollments(
            term_id TEXT NOT NULL,
            course_number TEXT NOT NULL,
            uid TEXT NOT NULL,
            PRIMARY KEY(term_id, course_number, uid)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sis_terms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            begin_date TEXT NOT NULL,
            end_date TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn seed_evaluation_types(conn: &Connection) -> anyhow::Result<()> {
    for name in ["F", "G"] {
        conn.execute(
            "INSERT OR IGNORE INTO evaluation_types(name) VALUES (?1)",
            [name],
        )?;
    }
    Ok(())
}

/// Settings values are stored as JSON text so lists and scalars share one
/// table.
pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let text: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    match text {
        None => Ok(None),
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_workspace() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("evald-db-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn open_is_idempotent_and_seeds_types() {
        let ws = temp_workspace();
        {
            let conn = open_db(&ws).unwrap();
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM evaluation_types", [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 2);
        }
        let conn = open_db(&ws).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM evaluation_types", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
        std::fs::remove_dir_all(ws).unwrap();
    }

    #[test]
    fn settings_roundtrip_json() {
        let ws = temp_workspace();
        let conn = open_db(&ws).unwrap();
        assert!(settings_get_json(&conn, "currentTermId").unwrap().is_none());
        settings_set_json(&conn, "currentTermId", &json!("2222")).unwrap();
        settings_set_json(&conn, "exemptDepartmentForms", &json!(["LAW"])).unwrap();
        assert_eq!(
            settings_get_json(&conn, "currentTermId").unwrap(),
            Some(json!("2222"))
        );
        settings_set_json(&conn, "currentTermId", &json!("2225")).unwrap();
        assert_eq!(
            settings_get_json(&conn, "currentTermId").unwrap(),
            Some(json!("2225"))
        );
        std::fs::remove_dir_all(ws).unwrap();
    }

    #[test]
    fn soft_deleted_form_name_is_reusable() {
        let ws = temp_workspace();
        let conn = open_db(&ws).unwrap();
        conn.execute(
            "INSERT INTO department_forms(name, created_at) VALUES ('HISTORY', '2022-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        assert!(conn
            .execute(
                "INSERT INTO department_forms(name, created_at) VALUES ('HISTORY', '2022-01-02T00:00:00Z')",
                [],
            )
            .is_err());
        conn.execute(
            "UPDATE department_forms SET deleted_at = '2022-01-03T00:00:00Z' WHERE name = 'HISTORY'",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO department_forms(name, created_at) VALUES ('HISTORY', '2022-01-04T00:00:00Z')",
            [],
        )
        .unwrap();
        std::fs::remove_dir_all(ws).unwrap();
    }
}
