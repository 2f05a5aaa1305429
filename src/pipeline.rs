//! Grading pipeline
//!
//! Runs one grading request end to end: identifier, stored answer key and
//! template, fiducials, region mapping, recognition, reconciliation. Every
//! collaborator is injected, so tests drive the pipeline with fakes.

use image::RgbImage;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::{GraderConfig, RecognitionConfig};
use crate::error::GradeError;
use crate::grading::reconcile;
use crate::storage::{TemplateStore, WorksheetStore};
use crate::vision::{
    map_template_regions, AnswerRecognizer, DigitClassifier, FiducialLocator, IdentifierDecoder,
    OnnxDigitClassifier, QrIdentifierDecoder,
};
use crate::worksheet::{reason, GradedWorksheet, RecognizedAnswer};

/// Load the configured ONNX classifier
pub fn load_classifier(config: &RecognitionConfig) -> Result<Arc<dyn DigitClassifier>, GradeError> {
    let path = config
        .classifier_model_path
        .as_deref()
        .ok_or_else(|| GradeError::ModelUnavailable("classifier_model_path is not configured".to_string()))?;
    let classifier = OnnxDigitClassifier::load(path, config.intra_threads, config.classifier_output)?;
    Ok(Arc::new(classifier))
}

/// Single-threaded grading of one page at a time; share it behind an `Arc`
/// to grade pages concurrently.
pub struct GradingPipeline {
    decoder: Arc<dyn IdentifierDecoder>,
    locator: FiducialLocator,
    recognizer: AnswerRecognizer,
    templates: Arc<dyn TemplateStore>,
    worksheets: Arc<dyn WorksheetStore>,
}

impl GradingPipeline {
    pub fn new(
        decoder: Arc<dyn IdentifierDecoder>,
        locator: FiducialLocator,
        recognizer: AnswerRecognizer,
        templates: Arc<dyn TemplateStore>,
        worksheets: Arc<dyn WorksheetStore>,
    ) -> Self {
        Self {
            decoder,
            locator,
            recognizer,
            templates,
            worksheets,
        }
    }

    /// Standard wiring: QR identifiers and the configured marker dictionary
    pub fn from_config(
        config: &GraderConfig,
        classifier: Arc<dyn DigitClassifier>,
        templates: Arc<dyn TemplateStore>,
        worksheets: Arc<dyn WorksheetStore>,
    ) -> Self {
        Self::new(
            Arc::new(QrIdentifierDecoder::new()),
            FiducialLocator::new(&config.markers),
            AnswerRecognizer::new(classifier, &config.recognition),
            templates,
            worksheets,
        )
    }

    /// Grade an image file
    pub fn grade_file(&self, path: &Path) -> Result<GradedWorksheet, GradeError> {
        let image = image::open(path)
            .map_err(|e| GradeError::ImageUnreadable(format!("{:?}: {}", path, e)))?
            .to_rgb8();
        self.grade_image(&image)
    }

    /// Grade a decoded page. The result is returned, not persisted.
    pub fn grade_image(&self, image: &RgbImage) -> Result<GradedWorksheet, GradeError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("grade", request = %request_id);
        let _enter = span.enter();

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(GradeError::ImageUnreadable("image is empty".to_string()));
        }

        let identity = self.decoder.decode(image)?;
        debug!("Worksheet {:?} version {:?}", identity.worksheet_id, identity.version);

        let record = self
            .worksheets
            .get_worksheet(&identity.worksheet_id, &identity.version)?
            .ok_or_else(|| GradeError::WorksheetUnknown {
                worksheet_id: identity.worksheet_id.clone(),
                version: identity.version.clone(),
            })?;
        let template = self
            .templates
            .get_template(&record.template_id)?
            .ok_or_else(|| GradeError::TemplateUnknown(record.template_id.clone()))?;

        let key = &record.answer_key;
        if key.answers.len() != template.regions.len() {
            warn!(
                "Answer key has {} entries but template {} has {} regions",
                key.answers.len(),
                record.template_id,
                template.regions.len()
            );
        }

        let markers = self.locator.locate(image)?;
        debug!("Markers: {:?}", markers.points());

        let mapped = map_template_regions(&template, &markers, width, height)?;

        let mut answers = vec![RecognizedAnswer::failed(reason::OUT_OF_BOUNDS); template.regions.len()];
        for region in &mapped {
            let answer = match AnswerRecognizer::crop(image, &region.rect) {
                Some(crop) => match key.answers.get(region.index) {
                    Some(expected) => self.recognizer.recognize_expecting(&crop, expected),
                    None => self.recognizer.recognize(&crop),
                },
                None => RecognizedAnswer::failed(reason::ZERO_AREA),
            };
            if let Some(error) = &answer.error {
                warn!("Region {} degraded: {} ({:.3})", region.index, error, answer.confidence);
            }
            answers[region.index] = answer;
        }

        let graded = reconcile(key, &record.template_id, &answers);
        info!(
            "Graded {} v{}: {}/{} ({:.0}%) grade {}",
            graded.id,
            graded.version,
            graded.total_correct,
            graded.total_questions,
            graded.score() * 100.0,
            graded.letter_grade
        );
        Ok(graded)
    }
}
