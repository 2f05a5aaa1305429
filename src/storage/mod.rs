//! Storage Layer
//!
//! Template and worksheet stores the pipeline talks to. Lookups return
//! `Ok(None)` for "not found"; `Err` is reserved for back-end failures.

pub mod database;
pub mod memory;

pub use database::SqliteStore;
pub use memory::MemoryStore;

use anyhow::Result;
use std::path::PathBuf;
use thiserror::Error;

use crate::worksheet::{GradedWorksheet, Template, WorksheetRecord};

/// Storage back-end failure
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored record is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage location unavailable: {0}")]
    Location(String),
}

/// Content-addressed template store
pub trait TemplateStore: Send + Sync {
    fn get_template(&self, id: &str) -> Result<Option<Template>, StorageError>;

    /// Store a template and return its content id. Idempotent.
    fn put_template(&self, template: &Template) -> Result<String, StorageError>;
}

/// Answer-key and graded-result store
pub trait WorksheetStore: Send + Sync {
    fn get_worksheet(&self, worksheet_id: &str, version: &str) -> Result<Option<WorksheetRecord>, StorageError>;

    /// Register (or replace) the answer key for a worksheet version
    fn put_worksheet(&self, record: &WorksheetRecord) -> Result<(), StorageError>;

    fn put_graded(&self, graded: &GradedWorksheet) -> Result<(), StorageError>;
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "worksheetgrader", "WorksheetGrader")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    let data_dir = proj_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Database file used when the configuration does not name one
pub fn default_database_path() -> Result<PathBuf, StorageError> {
    get_data_dir()
        .map(|dir| dir.join("grader.db"))
        .map_err(|e| StorageError::Location(e.to_string()))
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "worksheetgrader", "WorksheetGrader")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}
