//! SQLite database for persistent storage

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

use super::{StorageError, TemplateStore, WorksheetStore};
use crate::worksheet::{AnswerKey, GradedWorksheet, Template, WorksheetRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS templates (
    id   TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS worksheets (
    worksheet_id TEXT NOT NULL,
    version      TEXT NOT NULL,
    template_id  TEXT NOT NULL,
    answer_key   TEXT NOT NULL,
    PRIMARY KEY (worksheet_id, version)
);
CREATE TABLE IF NOT EXISTS graded (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    worksheet_id    TEXT NOT NULL,
    version         TEXT NOT NULL,
    template_id     TEXT NOT NULL,
    total_questions INTEGER NOT NULL,
    total_correct   INTEGER NOT NULL,
    letter_grade    TEXT NOT NULL,
    body            TEXT NOT NULL,
    graded_at       INTEGER NOT NULL
);
";

/// SQLite-backed template and worksheet store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create database at path
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening grader database at {:?}", path);
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    pub fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Number of stored templates
    pub fn template_count(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM templates", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Graded results recorded for a worksheet, oldest first
    pub fn graded_for(&self, worksheet_id: &str) -> Result<Vec<GradedWorksheet>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT body FROM graded WHERE worksheet_id = ?1 ORDER BY id")?;
        let bodies = stmt
            .query_map(params![worksheet_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut graded = Vec::with_capacity(bodies.len());
        for body in bodies {
            graded.push(serde_json::from_str(&body)?);
        }
        Ok(graded)
    }
}

impl TemplateStore for SqliteStore {
    fn get_template(&self, id: &str) -> Result<Option<Template>, StorageError> {
        let body: Option<String> = self
            .conn
            .lock()
            .query_row("SELECT body FROM templates WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn put_template(&self, template: &Template) -> Result<String, StorageError> {
        let id = template.id();
        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO templates (id, body) VALUES (?1, ?2)",
            params![id, template.canonical_json()],
        )?;
        debug!("put_template {} (new row: {})", id, inserted > 0);
        Ok(id)
    }
}

impl WorksheetStore for SqliteStore {
    fn get_worksheet(&self, worksheet_id: &str, version: &str) -> Result<Option<WorksheetRecord>, StorageError> {
        let row: Option<(String, String)> = self
            .conn
            .lock()
            .query_row(
                "SELECT template_id, answer_key FROM worksheets WHERE worksheet_id = ?1 AND version = ?2",
                params![worksheet_id, version],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((template_id, answer_key)) = row else {
            return Ok(None);
        };

        let answers: Vec<String> = serde_json::from_str(&answer_key)?;
        Ok(Some(WorksheetRecord {
            answer_key: AnswerKey {
                worksheet_id: worksheet_id.to_string(),
                version: version.to_string(),
                answers,
            },
            template_id,
        }))
    }

    fn put_worksheet(&self, record: &WorksheetRecord) -> Result<(), StorageError> {
        let answers = serde_json::to_string(&record.answer_key.answers)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO worksheets (worksheet_id, version, template_id, answer_key)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.answer_key.worksheet_id,
                record.answer_key.version,
                record.template_id,
                answers
            ],
        )?;
        Ok(())
    }

    fn put_graded(&self, graded: &GradedWorksheet) -> Result<(), StorageError> {
        let body = serde_json::to_string(graded)?;
        self.conn.lock().execute(
            "INSERT INTO graded
             (worksheet_id, version, template_id, total_questions, total_correct, letter_grade, body, graded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                graded.id,
                graded.version,
                graded.template_id,
                graded.total_questions as i64,
                graded.total_correct as i64,
                graded.letter_grade.as_str(),
                body,
                graded.graded_at as i64
            ],
        )?;
        Ok(())
    }
}
