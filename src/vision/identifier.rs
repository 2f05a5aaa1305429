//! Worksheet identifier decoding
//!
//! Locates the QR code printed on the page and parses its payload as a strict
//! JSON record `{"worksheet_id": ..., "version": ...}`. The payload is data
//! only; anything that is not such a record is rejected.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::contrast::otsu_level;
use rqrr::PreparedImage;
use serde::Deserialize;
use tracing::debug;

use crate::error::GradeError;
use crate::worksheet::WorksheetIdentity;

/// Reads the worksheet identity off a page image
pub trait IdentifierDecoder: Send + Sync {
    fn decode(&self, image: &RgbImage) -> Result<WorksheetIdentity, GradeError>;
}

/// Binarization strategies tried in order until one yields a code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Raw,
    Otsu,
    Downscale2x,
}

const STRATEGIES: [Strategy; 3] = [Strategy::Raw, Strategy::Otsu, Strategy::Downscale2x];

/// QR decoder backed by `rqrr`
#[derive(Debug, Default, Clone)]
pub struct QrIdentifierDecoder;

impl QrIdentifierDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Every distinct payload found with the first strategy that finds any
    fn scan(gray: &GrayImage) -> Vec<String> {
        for strategy in STRATEGIES {
            let payloads = match strategy {
                Strategy::Raw => decode_grids(gray, None),
                Strategy::Otsu => decode_grids(gray, Some(otsu_level(gray))),
                Strategy::Downscale2x => {
                    let (w, h) = gray.dimensions();
                    if w < 4 || h < 4 {
                        continue;
                    }
                    let small = imageops::resize(gray, w / 2, h / 2, FilterType::Triangle);
                    decode_grids(&small, None)
                }
            };
            if !payloads.is_empty() {
                debug!("QR strategy {:?} decoded {} code(s)", strategy, payloads.len());
                return payloads;
            }
        }
        vec![]
    }
}

fn decode_grids(gray: &GrayImage, threshold: Option<u8>) -> Vec<String> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let mut prepared = match threshold {
        Some(level) => PreparedImage::prepare_from_bitmap(w, h, |x, y| {
            gray.get_pixel(x as u32, y as u32)[0] <= level
        }),
        None => PreparedImage::prepare_from_greyscale(w, h, |x, y| gray.get_pixel(x as u32, y as u32)[0]),
    };

    let mut payloads: Vec<String> = prepared
        .detect_grids()
        .iter()
        .filter_map(|grid| grid.decode().ok())
        .map(|(_, content)| content)
        .collect();
    payloads.sort();
    payloads.dedup();
    payloads
}

impl IdentifierDecoder for QrIdentifierDecoder {
    fn decode(&self, image: &RgbImage) -> Result<WorksheetIdentity, GradeError> {
        let gray = imageops::grayscale(image);
        let payloads = Self::scan(&gray);

        match payloads.as_slice() {
            [] => Err(GradeError::DecodeFailed("no QR code found".to_string())),
            [payload] => parse_payload(payload),
            many => Err(GradeError::DecodeFailed(format!(
                "expected one QR code, found {} with different payloads",
                many.len()
            ))),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionTag {
    Text(String),
    Number(u64),
}

#[derive(Deserialize)]
struct IdentityRecord {
    worksheet_id: String,
    version: VersionTag,
}

/// Parse a QR payload into a worksheet identity.
///
/// Accepts only a JSON object with a non-empty string `worksheet_id` and a
/// `version` given as a string or non-negative integer. Extra keys are ignored.
pub fn parse_payload(payload: &str) -> Result<WorksheetIdentity, GradeError> {
    let value: serde_json::Value = serde_json::from_str(payload.trim())
        .map_err(|e| GradeError::DecodeFailed(format!("payload is not a JSON record: {}", e)))?;
    if !value.is_object() {
        return Err(GradeError::DecodeFailed("payload is not a key/value record".to_string()));
    }

    let record: IdentityRecord = serde_json::from_value(value)
        .map_err(|e| GradeError::DecodeFailed(format!("malformed identity record: {}", e)))?;

    let worksheet_id = record.worksheet_id.trim().to_string();
    let version = match record.version {
        VersionTag::Text(s) => s.trim().to_string(),
        VersionTag::Number(n) => n.to_string(),
    };
    if worksheet_id.is_empty() || version.is_empty() {
        return Err(GradeError::DecodeFailed(
            "worksheet_id and version must be non-empty".to_string(),
        ));
    }

    Ok(WorksheetIdentity { worksheet_id, version })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::imageops::replace;
    use image::{DynamicImage, Luma, Rgb};
    use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
    use qrcode::{Color, QrCode};

    const MODULE_PX: u32 = 6;
    const QUIET_MODULES: u32 = 4;

    /// Render a payload as a QR code with a quiet zone
    fn render_qr(payload: &str) -> GrayImage {
        let code = QrCode::new(payload.as_bytes()).unwrap();
        let width = code.width() as u32;
        let colors = code.to_colors();
        let side = (width + 2 * QUIET_MODULES) * MODULE_PX;

        GrayImage::from_fn(side, side, |x, y| {
            let (mx, my) = (x / MODULE_PX, y / MODULE_PX);
            let modules = QUIET_MODULES..width + QUIET_MODULES;
            let dark = modules.contains(&mx) && modules.contains(&my) && {
                let index = ((my - QUIET_MODULES) * width + (mx - QUIET_MODULES)) as usize;
                matches!(colors[index], Color::Dark)
            };
            Luma([if dark { 0 } else { 255 }])
        })
    }

    /// White page with codes pasted at the given offsets
    fn page_with(codes: &[(&str, i64, i64)]) -> GrayImage {
        let mut page = GrayImage::from_pixel(640, 640, Luma([255]));
        for &(payload, x, y) in codes {
            replace(&mut page, &render_qr(payload), x, y);
        }
        page
    }

    fn to_rgb(gray: GrayImage) -> RgbImage {
        DynamicImage::ImageLuma8(gray).to_rgb8()
    }

    #[test]
    fn test_parse_well_formed_payload() {
        let identity = parse_payload(r#"{"worksheet_id": "ws-42", "version": "3"}"#).unwrap();
        assert_eq!(identity.worksheet_id, "ws-42");
        assert_eq!(identity.version, "3");
    }

    #[test]
    fn test_parse_numeric_version_and_extra_keys() {
        let identity = parse_payload(r#"{"version": 7, "worksheet_id": "abc", "age": 6}"#).unwrap();
        assert_eq!(identity.version, "7");
        assert_eq!(identity.worksheet_id, "abc");
    }

    #[test]
    fn test_reject_missing_fields() {
        assert!(matches!(
            parse_payload(r#"{"worksheet_id": "abc"}"#),
            Err(GradeError::DecodeFailed(_))
        ));
        assert!(matches!(
            parse_payload(r#"{"version": "1"}"#),
            Err(GradeError::DecodeFailed(_))
        ));
        assert!(parse_payload(r#"{"worksheet_id": "  ", "version": "1"}"#).is_err());
    }

    #[test]
    fn test_reject_non_records() {
        assert!(parse_payload(r#"["abc", "1"]"#).is_err());
        assert!(parse_payload("42").is_err());
        assert!(parse_payload("").is_err());
        // Expression text is never evaluated
        assert!(parse_payload("{'worksheet_id': __import__('os').getcwd(), 'version': 1}").is_err());
        assert!(parse_payload(r#"{"worksheet_id": ["a"], "version": 1}"#).is_err());
    }

    #[test]
    fn test_decode_printed_code() {
        let image = to_rgb(page_with(&[(r#"{"worksheet_id":"ws-9","version":"2"}"#, 180, 200)]));
        let identity = QrIdentifierDecoder::new().decode(&image).unwrap();

        assert_eq!(identity.worksheet_id, "ws-9");
        assert_eq!(identity.version, "2");
    }

    #[test]
    fn test_decode_rotated_code() {
        let page = page_with(&[(r#"{"worksheet_id":"ws-9","version":2}"#, 180, 200)]);
        let rotated = rotate_about_center(&page, 15f32.to_radians(), Interpolation::Bilinear, Luma([255u8]));

        let identity = QrIdentifierDecoder::new().decode(&to_rgb(rotated)).unwrap();
        assert_eq!(identity.worksheet_id, "ws-9");
        assert_eq!(identity.version, "2");
    }

    #[test]
    fn test_two_different_codes_fail() {
        let image = to_rgb(page_with(&[
            (r#"{"worksheet_id":"ws-1","version":"1"}"#, 20, 20),
            (r#"{"worksheet_id":"ws-2","version":"1"}"#, 360, 360),
        ]));

        match QrIdentifierDecoder::new().decode(&image) {
            Err(GradeError::DecodeFailed(reason)) => assert!(reason.contains("found 2"), "{}", reason),
            other => panic!("expected DecodeFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_identical_code_is_one_identity() {
        let payload = r#"{"worksheet_id":"ws-3","version":"4"}"#;
        let image = to_rgb(page_with(&[(payload, 20, 20), (payload, 360, 360)]));

        let identity = QrIdentifierDecoder::new().decode(&image).unwrap();
        assert_eq!(identity.worksheet_id, "ws-3");
    }

    #[test]
    fn test_code_with_expression_payload_rejected() {
        let image = to_rgb(page_with(&[("{'worksheet_id': 'ws-1', 'version': 1}", 180, 200)]));
        assert!(matches!(
            QrIdentifierDecoder::new().decode(&image),
            Err(GradeError::DecodeFailed(_))
        ));
    }

    #[test]
    fn test_blank_page_fails_to_decode() {
        let image = RgbImage::from_pixel(320, 240, Rgb([255, 255, 255]));
        let result = QrIdentifierDecoder::new().decode(&image);
        assert!(matches!(result, Err(GradeError::DecodeFailed(_))));
    }
}
