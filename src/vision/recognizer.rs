//! Answer recognition
//!
//! Classifies the ink in one answer region as a single digit, or as a short
//! left-to-right sequence of digits, decimal points and minus signs when the
//! expected answer is longer than one character.

use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, warn};

use super::models::{softmax_top, DigitClassifier};
use super::preprocess::{binarize_region, glyph_tensor, region_tensor, segment_glyphs, Glyph, PreprocessConfig};
use crate::config::RecognitionConfig;
use crate::grading::normalize;
use crate::worksheet::{reason, PixelRect, RecognizedAnswer};

/// What a segmented glyph was read as
#[derive(Debug, Clone, Copy, PartialEq)]
enum Symbol {
    Digit(usize, f32),
    Point,
    Minus,
}

/// Recognizes handwritten answers in region crops
pub struct AnswerRecognizer {
    classifier: Arc<dyn DigitClassifier>,
    min_confidence: f32,
    preprocess: PreprocessConfig,
}

impl AnswerRecognizer {
    pub fn new(classifier: Arc<dyn DigitClassifier>, config: &RecognitionConfig) -> Self {
        Self {
            classifier,
            min_confidence: config.min_confidence,
            preprocess: PreprocessConfig::with_input_size(config.classifier_input_size),
        }
    }

    /// Crop a mapped region out of the page
    pub fn crop(image: &RgbImage, rect: &PixelRect) -> Option<RgbImage> {
        let (w, h) = image.dimensions();
        if rect.width() == 0 || rect.height() == 0 || rect.x2 > w || rect.y2 > h {
            return None;
        }
        Some(image::imageops::crop_imm(image, rect.x1, rect.y1, rect.width(), rect.height()).to_image())
    }

    /// Single-digit recognition of everything inked in the region
    pub fn recognize(&self, crop: &RgbImage) -> RecognizedAnswer {
        if crop.width() == 0 || crop.height() == 0 {
            return RecognizedAnswer::failed(reason::ZERO_AREA);
        }
        let Some(binary) = binarize_region(crop, &self.preprocess) else {
            return RecognizedAnswer::failed(reason::EMPTY_REGION);
        };
        let Some(tensor) = region_tensor(&binary, &self.preprocess) else {
            return RecognizedAnswer::failed(reason::EMPTY_REGION);
        };

        match self.classifier.classify(&tensor) {
            Ok(scores) => {
                let (digit, confidence) = softmax_top(&scores);
                debug!("Single digit: {} ({:.3})", digit, confidence);
                self.threshold(digit.to_string(), confidence)
            }
            Err(e) => RecognizedAnswer::failed(format!("{}: {:#}", reason::CLASSIFIER_ERROR, e)),
        }
    }

    /// Left-to-right multi-symbol recognition; confidence is the weakest digit
    pub fn recognize_sequence(&self, crop: &RgbImage) -> RecognizedAnswer {
        if crop.width() == 0 || crop.height() == 0 {
            return RecognizedAnswer::failed(reason::ZERO_AREA);
        }
        let Some(binary) = binarize_region(crop, &self.preprocess) else {
            return RecognizedAnswer::failed(reason::EMPTY_REGION);
        };

        let glyphs = segment_glyphs(&binary);
        let Some(tallest) = glyphs.iter().map(|g| g.bbox.height()).max() else {
            return RecognizedAnswer::failed(reason::EMPTY_REGION);
        };

        let mut text = String::new();
        let mut confidence = 1.0f32;
        let mut digits = 0;
        for glyph in &glyphs {
            let symbol = match punctuation(glyph, &glyphs, tallest) {
                Some(symbol) => symbol,
                None => match self.classifier.classify(&glyph_tensor(glyph, &self.preprocess)) {
                    Ok(scores) => {
                        let (digit, p) = softmax_top(&scores);
                        Symbol::Digit(digit, p)
                    }
                    Err(e) => {
                        return RecognizedAnswer::failed(format!("{}: {:#}", reason::CLASSIFIER_ERROR, e));
                    }
                },
            };

            match symbol {
                Symbol::Digit(digit, p) => {
                    text.push_str(&digit.to_string());
                    confidence = confidence.min(p);
                    digits += 1;
                }
                Symbol::Point => text.push('.'),
                Symbol::Minus => text.push('-'),
            }
        }

        if digits == 0 {
            return RecognizedAnswer::failed(reason::EMPTY_REGION);
        }
        debug!("Sequence: {:?} ({:.3}, {} glyphs)", text, confidence, glyphs.len());
        self.threshold(text, confidence)
    }

    /// Single-digit attempt first; segment when a longer answer is expected
    /// and the single digit did not already match it.
    pub fn recognize_expecting(&self, crop: &RgbImage, expected: &str) -> RecognizedAnswer {
        let single = self.recognize(crop);
        let expected = normalize(expected);

        let matched = single.text.as_deref().map(normalize).as_deref() == Some(expected.as_str());
        if matched || expected.chars().count() <= 1 {
            return single;
        }
        // Blank and unreadable crops will not improve with segmentation
        if single.error.as_deref() == Some(reason::EMPTY_REGION) || single.error.as_deref() == Some(reason::ZERO_AREA) {
            return single;
        }

        let sequence = self.recognize_sequence(crop);
        if sequence.error.is_some() && single.error.is_none() {
            warn!("Multi-symbol recognition failed ({:?}), keeping single digit", sequence.error);
            return single;
        }
        sequence
    }

    fn threshold(&self, text: String, confidence: f32) -> RecognizedAnswer {
        if confidence < self.min_confidence {
            RecognizedAnswer::low_confidence(confidence)
        } else {
            RecognizedAnswer::accepted(text, confidence)
        }
    }
}

/// Decimal points are small and sit low; minus signs are flat and sit mid-height.
/// Anything else goes to the classifier.
fn punctuation(glyph: &Glyph, all: &[Glyph], tallest: u32) -> Option<Symbol> {
    if all.len() < 2 {
        return None;
    }
    let small = tallest as f32 * 0.35;
    let (w, h) = (glyph.bbox.width() as f32, glyph.bbox.height() as f32);
    if h > small {
        return None;
    }

    // Vertical extent of the tall glyphs
    let (top, bottom) = all
        .iter()
        .filter(|g| g.bbox.height() as f32 > small)
        .fold((u32::MAX, 0u32), |(t, b), g| (t.min(g.bbox.y0), b.max(g.bbox.y1)));
    if top >= bottom {
        return None;
    }
    let rel = (glyph.bbox.center_y() - top as f32) / (bottom - top) as f32;

    if w <= small && rel > 0.65 {
        Some(Symbol::Point)
    } else if w >= 1.5 * h && rel > 0.25 && rel < 0.75 {
        Some(Symbol::Minus)
    } else {
        None
    }
}
