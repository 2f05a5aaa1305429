//! Grader Configuration
//!
//! Geometry, recognition, marker and storage settings stored in TOML format.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Marker ids every worksheet carries, in logical corner order
pub const REQUIRED_MARKER_IDS: [u16; 4] = [0, 1, 2, 3];

/// Grader settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Coordinate system settings
    pub geometry: GeometryConfig,
    /// Digit recognition settings
    pub recognition: RecognitionConfig,
    /// Fiducial marker settings
    pub markers: MarkerConfig,
    /// Persistent store settings
    pub storage: StorageConfig,
}

/// DPI defaults applied to templates that do not declare their own
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// DPI of logical answer regions as emitted by the renderer
    pub logical_dpi: u32,
    /// DPI of the stored fiducial positions
    pub image_dpi: u32,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            logical_dpi: 72,
            image_dpi: 300,
        }
    }
}

/// Digit classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Path to the pre-trained ONNX digit classifier (required at init)
    pub classifier_model_path: Option<PathBuf>,
    /// Minimum softmax probability for an accepted digit (0.0 - 1.0)
    pub min_confidence: f32,
    /// Side length of the square classifier input
    pub classifier_input_size: u32,
    /// ONNX Runtime intra-op threads
    pub intra_threads: usize,
    /// What the model's output row holds
    pub classifier_output: ClassifierOutput,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            classifier_model_path: None,
            min_confidence: 0.8,
            classifier_input_size: 32,
            intra_threads: 1,
            classifier_output: ClassifierOutput::Logits,
        }
    }
}

/// Output convention of the exported classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierOutput {
    /// Raw class scores; the recognizer applies the softmax
    #[default]
    Logits,
    /// Scores already passed through a softmax
    Probabilities,
}

/// Fiducial dictionaries the locator understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarkerDictionary {
    /// 4x4 payload bits, 50 ids
    #[default]
    #[serde(rename = "4x4_50")]
    Dict4x4_50,
}

/// Fiducial marker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Marker dictionary printed on the worksheets
    pub dictionary: MarkerDictionary,
    /// Required marker ids (fixed)
    pub required_ids: Vec<u16>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            dictionary: MarkerDictionary::Dict4x4_50,
            required_ids: REQUIRED_MARKER_IDS.to_vec(),
        }
    }
}

/// Persistent store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; defaults to the application data directory
    pub database_path: Option<PathBuf>,
}

impl GraderConfig {
    /// Reject settings the pipeline cannot honor
    pub fn validate(&self) -> Result<()> {
        let min_confidence = self.recognition.min_confidence;
        if !(0.0..=1.0).contains(&min_confidence) {
            bail!("min_confidence must be within [0, 1], got {}", min_confidence);
        }
        if self.recognition.classifier_input_size == 0 {
            bail!("classifier_input_size must be positive");
        }
        if self.geometry.logical_dpi == 0 || self.geometry.image_dpi == 0 {
            bail!("logical_dpi and image_dpi must be positive");
        }
        if self.markers.required_ids != REQUIRED_MARKER_IDS {
            bail!(
                "required_ids is fixed to {:?}, got {:?}",
                REQUIRED_MARKER_IDS,
                self.markers.required_ids
            );
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<GraderConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: GraderConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &GraderConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = GraderConfig::default();

        assert_eq!(config.geometry.logical_dpi, 72);
        assert_eq!(config.geometry.image_dpi, 300);

        assert!(config.recognition.classifier_model_path.is_none());
        assert!((config.recognition.min_confidence - 0.8).abs() < 1e-6);
        assert_eq!(config.recognition.classifier_input_size, 32);

        assert_eq!(config.markers.dictionary, MarkerDictionary::Dict4x4_50);
        assert_eq!(config.markers.required_ids, vec![0, 1, 2, 3]);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = GraderConfig::default();
        config.recognition.classifier_model_path = Some(PathBuf::from("/models/digits.onnx"));
        config.recognition.min_confidence = 0.65;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("dictionary = \"4x4_50\""));

        let parsed: GraderConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(
            parsed.recognition.classifier_model_path,
            Some(PathBuf::from("/models/digits.onnx"))
        );
        assert!((parsed.recognition.min_confidence - 0.65).abs() < 1e-6);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[recognition]").unwrap();
        writeln!(temp_file, "classifier_model_path = \"digits.onnx\"").unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(
            config.recognition.classifier_model_path,
            Some(PathBuf::from("digits.onnx"))
        );
        assert!((config.recognition.min_confidence - 0.8).abs() < 1e-6);
        assert_eq!(config.geometry.image_dpi, 300);
    }

    #[test]
    fn test_save_and_load_config() {
        let config = GraderConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.geometry.logical_dpi, loaded.geometry.logical_dpi);
        assert_eq!(config.markers.required_ids, loaded.markers.required_ids);
    }

    #[test]
    fn test_invalid_confidence_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[recognition]").unwrap();
        writeln!(temp_file, "min_confidence = 1.5").unwrap();

        assert!(load_config(temp_file.path()).is_err());
    }

    #[test]
    fn test_classifier_output_kind() {
        assert_eq!(GraderConfig::default().recognition.classifier_output, ClassifierOutput::Logits);

        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[recognition]").unwrap();
        writeln!(temp_file, "classifier_output = \"probabilities\"").unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.recognition.classifier_output, ClassifierOutput::Probabilities);
    }

    #[test]
    fn test_required_ids_are_fixed() {
        let mut config = GraderConfig::default();
        config.markers.required_ids = vec![0, 1, 2, 7];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/grader.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        assert!(load_config(temp_file.path()).is_err());
    }
}
