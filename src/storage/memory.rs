//! In-process store for tests and embedding applications

use parking_lot::RwLock;
use std::collections::HashMap;

use super::{StorageError, TemplateStore, WorksheetStore};
use crate::worksheet::{GradedWorksheet, Template, WorksheetRecord};

/// Template and worksheet store backed by in-memory maps
#[derive(Default)]
pub struct MemoryStore {
    templates: RwLock<HashMap<String, Template>>,
    worksheets: RwLock<HashMap<(String, String), WorksheetRecord>>,
    graded: RwLock<Vec<GradedWorksheet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn template_count(&self) -> usize {
        self.templates.read().len()
    }

    /// Snapshot of every graded record handed to this store
    pub fn graded(&self) -> Vec<GradedWorksheet> {
        self.graded.read().clone()
    }
}

impl TemplateStore for MemoryStore {
    fn get_template(&self, id: &str) -> Result<Option<Template>, StorageError> {
        Ok(self.templates.read().get(id).cloned())
    }

    fn put_template(&self, template: &Template) -> Result<String, StorageError> {
        let id = template.id();
        self.templates
            .write()
            .entry(id.clone())
            .or_insert_with(|| template.clone());
        Ok(id)
    }
}

impl WorksheetStore for MemoryStore {
    fn get_worksheet(&self, worksheet_id: &str, version: &str) -> Result<Option<WorksheetRecord>, StorageError> {
        let key = (worksheet_id.to_string(), version.to_string());
        Ok(self.worksheets.read().get(&key).cloned())
    }

    fn put_worksheet(&self, record: &WorksheetRecord) -> Result<(), StorageError> {
        let key = (
            record.answer_key.worksheet_id.clone(),
            record.answer_key.version.clone(),
        );
        self.worksheets.write().insert(key, record.clone());
        Ok(())
    }

    fn put_graded(&self, graded: &GradedWorksheet) -> Result<(), StorageError> {
        self.graded.write().push(graded.clone());
        Ok(())
    }
}
