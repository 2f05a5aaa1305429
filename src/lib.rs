//! Worksheet grader
//!
//! Grades photographed or scanned arithmetic worksheets: reads the worksheet
//! identifier, locates the corner fiducials, maps answer regions into the
//! image, recognizes the handwritten digits and scores them against the
//! stored answer key.

pub mod config;
pub mod error;
pub mod grading;
pub mod pipeline;
pub mod storage;
pub mod vision;
pub mod worksheet;

pub use config::GraderConfig;
pub use error::GradeError;
pub use pipeline::GradingPipeline;
