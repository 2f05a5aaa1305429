//! Grading error taxonomy
//!
//! Every request-level failure is one of these tagged values. Per-region
//! failures never appear here; they are carried inside `RecognizedAnswer`.

use thiserror::Error;

use crate::storage::StorageError;

/// Request-level failure of the grading pipeline
#[derive(Debug, Error)]
pub enum GradeError {
    /// The input file cannot be decoded as an image
    #[error("image unreadable: {0}")]
    ImageUnreadable(String),

    /// No 2D code found, or its payload is not a worksheet record
    #[error("worksheet identifier could not be decoded: {0}")]
    DecodeFailed(String),

    /// Worksheet id/version is not registered
    #[error("worksheet '{worksheet_id}' version '{version}' is not registered")]
    WorksheetUnknown { worksheet_id: String, version: String },

    /// Template referenced by the worksheet is not registered
    #[error("template '{0}' is not registered")]
    TemplateUnknown(String),

    /// Fewer than four required markers detected (or a required id is ambiguous)
    #[error("fiducial markers missing: {0}")]
    MarkersMissing(String),

    /// Marker quadrilateral degenerate, or the transform solve failed
    #[error("page geometry invalid: {0}")]
    GeometryInvalid(String),

    /// Classifier weights absent or unloadable at init
    #[error("digit classifier unavailable: {0}")]
    ModelUnavailable(String),

    /// The storage back-end failed (distinct from "not found")
    #[error("store unavailable: {0}")]
    Storage(#[from] StorageError),
}

impl GradeError {
    /// Stable tag reported verbatim to callers
    pub fn code(&self) -> &'static str {
        match self {
            GradeError::ImageUnreadable(_) => "IMAGE_UNREADABLE",
            GradeError::DecodeFailed(_) => "DECODE_FAILED",
            GradeError::WorksheetUnknown { .. } => "WORKSHEET_UNKNOWN",
            GradeError::TemplateUnknown(_) => "TEMPLATE_UNKNOWN",
            GradeError::MarkersMissing(_) => "MARKERS_MISSING",
            GradeError::GeometryInvalid(_) => "GEOMETRY_INVALID",
            GradeError::ModelUnavailable(_) => "MODEL_UNAVAILABLE",
            GradeError::Storage(_) => "STORE_UNAVAILABLE",
        }
    }
}
