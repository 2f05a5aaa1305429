//! Worksheet data model
//!
//! Logical/pixel coordinates, content-addressed templates, answer keys and
//! the records produced by grading.

pub mod template;
pub mod types;

pub use template::{Template, TemplateFile};
pub use types::{
    reason, AnswerKey, GradedWorksheet, LetterGrade, LogicalPoint, LogicalRect, MappedRegion, MarkerSet,
    PixelPoint, PixelRect, ProblemResult, RecognizedAnswer, WorksheetIdentity, WorksheetRecord,
};
