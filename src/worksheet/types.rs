//! Coordinates, regions and grading records

use serde::{Deserialize, Serialize};

/// Point in logical page space: printer points from the bottom-left corner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogicalPoint {
    pub x: f64,
    pub y: f64,
}

impl LogicalPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Point in image space: pixels from the top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

impl PixelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Detected marker centers indexed by marker id: BL, TL, BR, TR in logical space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerSet {
    points: [PixelPoint; 4],
}

impl MarkerSet {
    pub fn new(points: [PixelPoint; 4]) -> Self {
        Self { points }
    }

    pub fn points(&self) -> [PixelPoint; 4] {
        self.points
    }
}

/// Axis-aligned answer region in logical space, `x1 < x2` and `y1 < y2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i64; 4]", into = "[i64; 4]")]
pub struct LogicalRect {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl LogicalRect {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// The ordering invariant every stored region satisfies
    pub fn is_well_formed(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }
}

impl From<[i64; 4]> for LogicalRect {
    fn from(v: [i64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<LogicalRect> for [i64; 4] {
    fn from(r: LogicalRect) -> Self {
        [r.x1, r.y1, r.x2, r.y2]
    }
}

/// Answer region in pixel space after mapping and clipping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }
}

/// Mapped region tagged with the problem it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// Index into the template's region list (and the answer key)
    pub index: usize,
    pub rect: PixelRect,
}

/// Identity of a printed worksheet as carried by its 2D code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksheetIdentity {
    pub worksheet_id: String,
    pub version: String,
}

/// Canonical answers for one worksheet version, in problem order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerKey {
    pub worksheet_id: String,
    pub version: String,
    pub answers: Vec<String>,
}

/// Stored worksheet: answer key plus the template it was printed with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksheetRecord {
    pub answer_key: AnswerKey,
    pub template_id: String,
}

/// Soft failure reasons carried inside a `RecognizedAnswer`
pub mod reason {
    pub const LOW_CONFIDENCE: &str = "low_confidence";
    pub const EMPTY_REGION: &str = "empty_region";
    pub const ZERO_AREA: &str = "zero_area_crop";
    pub const OUT_OF_BOUNDS: &str = "region_out_of_bounds";
    pub const CLASSIFIER_ERROR: &str = "classifier_error";
}

/// Recognition outcome for one answer region.
///
/// `text` is `None` iff recognition failed or fell below threshold, and then
/// `error` names the cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedAnswer {
    pub text: Option<String>,
    pub confidence: f32,
    pub error: Option<String>,
}

impl RecognizedAnswer {
    pub fn accepted(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: Some(text.into()),
            confidence: confidence.clamp(0.0, 1.0),
            error: None,
        }
    }

    pub fn low_confidence(confidence: f32) -> Self {
        Self {
            text: None,
            confidence: confidence.clamp(0.0, 1.0),
            error: Some(reason::LOW_CONFIDENCE.to_string()),
        }
    }

    /// Hard per-region failure: no text, zero confidence
    pub fn failed(cause: impl Into<String>) -> Self {
        Self {
            text: None,
            confidence: 0.0,
            error: Some(cause.into()),
        }
    }
}

/// Letter grade scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LetterGrade {
    A,
    B,
    C,
    D,
    F,
}

impl LetterGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            LetterGrade::A => "A",
            LetterGrade::B => "B",
            LetterGrade::C => "C",
            LetterGrade::D => "D",
            LetterGrade::F => "F",
        }
    }
}

impl std::fmt::Display for LetterGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-problem line of a graded worksheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemResult {
    pub expected: String,
    pub recognized: Option<String>,
    pub correct: bool,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final grading record; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedWorksheet {
    pub id: String,
    pub version: String,
    pub template_id: String,
    pub total_questions: usize,
    pub total_correct: usize,
    pub letter_grade: LetterGrade,
    pub per_problem: Vec<ProblemResult>,
    /// Unix timestamp (seconds)
    pub graded_at: u64,
}

impl GradedWorksheet {
    /// `total_correct / total_questions`, with `0/0 = 0`
    pub fn score(&self) -> f64 {
        if self.total_questions == 0 {
            0.0
        } else {
            self.total_correct as f64 / self.total_questions as f64
        }
    }
}
