//! Vision Layer
//!
//! Everything that looks at pixels: identifier decoding, fiducial markers,
//! page geometry, glyph preprocessing and digit recognition.

pub mod fiducial;
pub mod geometry;
pub mod identifier;
pub mod models;
pub mod preprocess;
pub mod recognizer;

pub use fiducial::{detect_markers, draw_marker, FiducialLocator, FiducialParams, MarkerDetection};
pub use geometry::{is_valid_quad, map_template_regions, GeometryMapper, Homography};
pub use identifier::{parse_payload, IdentifierDecoder, QrIdentifierDecoder};
pub use models::{DigitClassifier, OnnxDigitClassifier};
pub use preprocess::PreprocessConfig;
pub use recognizer::AnswerRecognizer;
