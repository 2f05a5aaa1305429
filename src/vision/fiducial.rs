//! Fiducial marker location
//!
//! Finds the four corner markers of a printed worksheet. Markers are square
//! 4x4-bit codes with a one-cell black border. Detection runs on an Otsu
//! binarization: every outer contour is fitted with a quadrilateral, the cell
//! grid is sampled through the quad's perspective transform, and the payload
//! is matched against the dictionary under all four rotations.

use anyhow::{bail, Result};
use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::otsu_level;
use imageproc::point::Point;
use tracing::{debug, info};

use super::geometry::Homography;
use crate::config::{MarkerConfig, MarkerDictionary};
use crate::error::GradeError;
use crate::worksheet::{MarkerSet, PixelPoint};

/// Payload cells per side
const PAYLOAD_BITS: usize = 4;
/// Payload plus the black border ring
const GRID: usize = PAYLOAD_BITS + 2;

/// Codes for ids 0-3 of the 4x4_50 dictionary, row-major, MSB = top-left cell,
/// bit set = white cell. Worksheets only ever print these four ids.
const DICT_4X4_50_CODES: [u16; 4] = [0xB532, 0x0F9A, 0x332D, 0x9946];

fn dictionary_codes(dictionary: MarkerDictionary) -> &'static [u16] {
    match dictionary {
        MarkerDictionary::Dict4x4_50 => &DICT_4X4_50_CODES,
    }
}

/// Detector tuning
#[derive(Debug, Clone)]
pub struct FiducialParams {
    /// Shortest accepted marker side in pixels
    pub min_side_px: f64,
    /// Bit errors tolerated when matching a payload (dictionary distance is 7)
    pub max_correction_bits: u32,
    /// Border cells allowed to read white
    pub max_border_errors: usize,
}

impl Default for FiducialParams {
    fn default() -> Self {
        Self {
            min_side_px: 12.0,
            max_correction_bits: 1,
            max_border_errors: 1,
        }
    }
}

/// One decoded marker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerDetection {
    pub id: u16,
    /// Outer corners, clockwise on screen, in continuous pixel coordinates
    pub corners: [PixelPoint; 4],
    /// Centroid of the four corners
    pub center: PixelPoint,
    /// Payload bit errors corrected
    pub hamming: u32,
}

/// Render a marker as a printable grayscale image
pub fn draw_marker(dictionary: MarkerDictionary, id: u16, cell_px: u32) -> Result<GrayImage> {
    let Some(&code) = dictionary_codes(dictionary).get(id as usize) else {
        bail!("marker id {} is not in the {:?} dictionary", id, dictionary);
    };
    if cell_px == 0 {
        bail!("marker cell size must be positive");
    }

    let side = GRID as u32 * cell_px;
    Ok(GrayImage::from_fn(side, side, |x, y| {
        let gx = (x / cell_px) as usize;
        let gy = (y / cell_px) as usize;
        let border = gx == 0 || gy == 0 || gx == GRID - 1 || gy == GRID - 1;
        let white = !border && payload_bit(code, gy - 1, gx - 1);
        Luma([if white { 255 } else { 0 }])
    }))
}

fn payload_bit(code: u16, row: usize, col: usize) -> bool {
    (code >> (15 - (row * PAYLOAD_BITS + col))) & 1 == 1
}

/// Rotate a payload a quarter turn clockwise
fn rotate_code(code: u16) -> u16 {
    let mut out = 0u16;
    for r in 0..PAYLOAD_BITS {
        for c in 0..PAYLOAD_BITS {
            if payload_bit(code, PAYLOAD_BITS - 1 - c, r) {
                out |= 1 << (15 - (r * PAYLOAD_BITS + c));
            }
        }
    }
    out
}

/// Best dictionary match over four rotations: (id, bit errors)
fn match_code(code: u16, dictionary: &[u16]) -> Option<(u16, u32)> {
    let mut rotated = code;
    let mut best: Option<(u16, u32)> = None;
    for _ in 0..4 {
        for (id, &candidate) in dictionary.iter().enumerate() {
            let dist = (rotated ^ candidate).count_ones();
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((id as u16, dist));
            }
        }
        rotated = rotate_code(rotated);
    }
    best
}

/// Detect every dictionary marker in a grayscale image
pub fn detect_markers(gray: &GrayImage, dictionary: MarkerDictionary, params: &FiducialParams) -> Vec<MarkerDetection> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return vec![];
    }

    let level = otsu_level(gray);
    let binary = GrayImage::from_fn(width, height, |x, y| {
        if gray.get_pixel(x, y)[0] <= level {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    let codes = dictionary_codes(dictionary);
    let mut detections = Vec::new();

    for contour in find_contours::<i32>(&binary) {
        if contour.border_type != BorderType::Outer || contour.points.len() < 16 {
            continue;
        }
        let Some(quad) = fit_quad(&contour.points, params.min_side_px) else {
            continue;
        };
        let Some(cells) = sample_cells(gray, &quad, level) else {
            continue;
        };

        let border_errors = (0..GRID)
            .flat_map(|gy| (0..GRID).map(move |gx| (gx, gy)))
            .filter(|&(gx, gy)| gx == 0 || gy == 0 || gx == GRID - 1 || gy == GRID - 1)
            .filter(|&(gx, gy)| !cells[gy][gx])
            .count();
        if border_errors > params.max_border_errors {
            continue;
        }

        let mut code = 0u16;
        for r in 0..PAYLOAD_BITS {
            for c in 0..PAYLOAD_BITS {
                // Dark cell = 0, white cell = 1
                if !cells[r + 1][c + 1] {
                    code |= 1 << (15 - (r * PAYLOAD_BITS + c));
                }
            }
        }

        let Some((id, hamming)) = match_code(code, codes) else {
            continue;
        };
        if hamming > params.max_correction_bits {
            continue;
        }

        // Contour points are pixel centers; shift to continuous coordinates
        let corners = quad.map(|(x, y)| PixelPoint::new(x + 0.5, y + 0.5));
        let center = PixelPoint::new(
            corners.iter().map(|p| p.x).sum::<f64>() / 4.0,
            corners.iter().map(|p| p.y).sum::<f64>() / 4.0,
        );
        debug!("Marker {} at ({:.2}, {:.2}), {} bit(s) corrected", id, center.x, center.y, hamming);

        detections.push(MarkerDetection {
            id,
            corners,
            center,
            hamming,
        });
    }

    detections
}

/// Fit a quadrilateral to an outer contour, clockwise on screen
fn fit_quad(points: &[Point<i32>], min_side: f64) -> Option<[(f64, f64); 4]> {
    let pts: Vec<(f64, f64)> = points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
    let n = pts.len() as f64;
    let centroid = (
        pts.iter().map(|p| p.0).sum::<f64>() / n,
        pts.iter().map(|p| p.1).sum::<f64>() / n,
    );

    let farthest_from = |origin: (f64, f64)| {
        pts.iter()
            .copied()
            .max_by(|a, b| dist2(*a, origin).total_cmp(&dist2(*b, origin)))
    };

    // Two opposite corners, then the extremes on either side of their diagonal
    let c0 = farthest_from(centroid)?;
    let c2 = farthest_from(c0)?;
    let side = |p: (f64, f64)| (c2.0 - c0.0) * (p.1 - c0.1) - (c2.1 - c0.1) * (p.0 - c0.0);
    let c1 = pts.iter().copied().max_by(|a, b| side(*a).total_cmp(&side(*b)))?;
    let c3 = pts.iter().copied().min_by(|a, b| side(*a).total_cmp(&side(*b)))?;

    let diag = dist2(c0, c2).sqrt();
    if diag < 1e-9 || side(c1) / diag < min_side * 0.5 || -side(c3) / diag < min_side * 0.5 {
        return None;
    }

    let mut quad = [c0, c1, c2, c3];
    if shoelace(&quad) < 0.0 {
        quad = [c0, c3, c2, c1];
    }

    for i in 0..4 {
        if dist2(quad[i], quad[(i + 1) % 4]).sqrt() < min_side {
            return None;
        }
    }

    // The contour should hug the quad: reject blobs that merely have four extremes
    let quad_area = shoelace(&quad).abs() / 2.0;
    let perimeter: f64 = (0..4).map(|i| dist2(quad[i], quad[(i + 1) % 4]).sqrt()).sum();
    if (n - perimeter).abs() > perimeter * 0.35 || quad_area < min_side * min_side {
        return None;
    }

    Some(refine_corners(&pts, quad))
}

/// Sub-pixel corners: intersect least-squares lines fitted to each side
fn refine_corners(pts: &[(f64, f64)], quad: [(f64, f64); 4]) -> [(f64, f64); 4] {
    let mut lines = Vec::with_capacity(4);
    for i in 0..4 {
        let (a, b) = (quad[i], quad[(i + 1) % 4]);
        let len = dist2(a, b).sqrt();
        let dir = ((b.0 - a.0) / len, (b.1 - a.1) / len);

        let side_pts: Vec<(f64, f64)> = pts
            .iter()
            .copied()
            .filter(|p| {
                let t = (p.0 - a.0) * dir.0 + (p.1 - a.1) * dir.1;
                let d = (p.0 - a.0) * dir.1 - (p.1 - a.1) * dir.0;
                t > 0.15 * len && t < 0.85 * len && d.abs() < 2.0
            })
            .collect();

        match fit_line(&side_pts) {
            Some(line) => lines.push(line),
            None => return quad,
        }
    }

    let mut refined = quad;
    for i in 0..4 {
        // Corner i joins side i-1 and side i
        let prev = lines[(i + 3) % 4];
        match intersect(prev, lines[i]) {
            Some(p) if dist2(p, quad[i]).sqrt() < 3.0 => refined[i] = p,
            _ => {}
        }
    }
    refined
}

/// Total-least-squares line through points: (point on line, unit direction)
fn fit_line(pts: &[(f64, f64)]) -> Option<((f64, f64), (f64, f64))> {
    if pts.len() < 3 {
        return None;
    }
    let n = pts.len() as f64;
    let mx = pts.iter().map(|p| p.0).sum::<f64>() / n;
    let my = pts.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in pts {
        let (dx, dy) = (p.0 - mx, p.1 - my);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    Some(((mx, my), (theta.cos(), theta.sin())))
}

fn intersect(l1: ((f64, f64), (f64, f64)), l2: ((f64, f64), (f64, f64))) -> Option<(f64, f64)> {
    let ((p, d), (q, e)) = (l1, l2);
    let denom = d.0 * e.1 - d.1 * e.0;
    if denom.abs() < 1e-9 {
        return None;
    }
    let t = ((q.0 - p.0) * e.1 - (q.1 - p.1) * e.0) / denom;
    Some((p.0 + t * d.0, p.1 + t * d.1))
}

/// Read the cell grid through the quad; `true` = dark cell
fn sample_cells(gray: &GrayImage, quad: &[(f64, f64); 4], level: u8) -> Option<[[bool; GRID]; GRID]> {
    let g = GRID as f64;
    let unit = [(0.0, 0.0), (g, 0.0), (g, g), (0.0, g)];
    let h = Homography::from_points(&unit, quad)?;
    let (width, height) = gray.dimensions();

    let mut cells = [[false; GRID]; GRID];
    for (gy, row) in cells.iter_mut().enumerate() {
        for (gx, cell) in row.iter_mut().enumerate() {
            let mut sum = 0u32;
            let mut count = 0u32;
            for oy in [-0.2, 0.0, 0.2] {
                for ox in [-0.2, 0.0, 0.2] {
                    let (u, v) = h.apply(gx as f64 + 0.5 + ox, gy as f64 + 0.5 + oy)?;
                    let px = u.round().clamp(0.0, (width - 1) as f64) as u32;
                    let py = v.round().clamp(0.0, (height - 1) as f64) as u32;
                    sum += gray.get_pixel(px, py)[0] as u32;
                    count += 1;
                }
            }
            *cell = sum / count <= level as u32;
        }
    }
    Some(cells)
}

fn dist2(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)
}

fn shoelace(quad: &[(f64, f64); 4]) -> f64 {
    (0..4)
        .map(|i| {
            let (p, q) = (quad[i], quad[(i + 1) % 4]);
            p.0 * q.1 - q.0 * p.1
        })
        .sum()
}

/// Fiducial locator producing a `MarkerSet` in canonical id order
pub struct FiducialLocator {
    dictionary: MarkerDictionary,
    required_ids: Vec<u16>,
    params: FiducialParams,
}

impl FiducialLocator {
    pub fn new(config: &MarkerConfig) -> Self {
        Self {
            dictionary: config.dictionary,
            required_ids: config.required_ids.clone(),
            params: FiducialParams::default(),
        }
    }

    /// Locate all four required markers or fail with `MarkersMissing`
    pub fn locate(&self, image: &RgbImage) -> Result<MarkerSet, GradeError> {
        let gray = image::imageops::grayscale(image);
        let detections = detect_markers(&gray, self.dictionary, &self.params);
        info!("Detected {} fiducial marker(s)", detections.len());

        let mut missing = Vec::new();
        let mut ambiguous = Vec::new();
        let mut points = [PixelPoint::new(0.0, 0.0); 4];

        for (slot, &id) in self.required_ids.iter().enumerate().take(4) {
            let found: Vec<&MarkerDetection> = detections.iter().filter(|d| d.id == id).collect();
            match found.as_slice() {
                [one] => points[slot] = one.center,
                [] => missing.push(id),
                _ => ambiguous.push(id),
            }
        }

        if !missing.is_empty() || !ambiguous.is_empty() {
            let mut reason = format!("found {} of 4 required markers", 4 - missing.len() - ambiguous.len());
            if !missing.is_empty() {
                reason.push_str(&format!(", missing ids {:?}", missing));
            }
            if !ambiguous.is_empty() {
                reason.push_str(&format!(", duplicated ids {:?}", ambiguous));
            }
            return Err(GradeError::MarkersMissing(reason));
        }

        Ok(MarkerSet::new(points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::imageops::replace;
    use imageproc::geometric_transformations::{rotate_about_center, warp, Interpolation, Projection};

    const CELL: u32 = 10;
    const SIDE: u32 = GRID as u32 * CELL;

    /// White page with the given marker ids placed at top-left offsets
    fn page(markers: &[(u16, i64, i64)]) -> GrayImage {
        let mut canvas = GrayImage::from_pixel(600, 800, Luma([255]));
        for &(id, x, y) in markers {
            let marker = draw_marker(MarkerDictionary::Dict4x4_50, id, CELL).unwrap();
            replace(&mut canvas, &marker, x, y);
        }
        canvas
    }

    fn four_corner_page() -> GrayImage {
        page(&[(0, 80, 660), (1, 80, 80), (2, 460, 660), (3, 460, 80)])
    }

    fn to_rgb(gray: &GrayImage) -> RgbImage {
        image::DynamicImage::ImageLuma8(gray.clone()).to_rgb8()
    }

    #[test]
    fn test_draw_marker_layout() {
        let marker = draw_marker(MarkerDictionary::Dict4x4_50, 0, CELL).unwrap();
        assert_eq!(marker.dimensions(), (SIDE, SIDE));
        // Border is black
        assert_eq!(marker.get_pixel(0, 0)[0], 0);
        assert_eq!(marker.get_pixel(SIDE - 1, SIDE / 2)[0], 0);
        // 0xB532: first payload cell (bit 15) is set, so white
        assert_eq!(marker.get_pixel(CELL + 1, CELL + 1)[0], 255);
        // Second payload cell (bit 14) is clear, so black
        assert_eq!(marker.get_pixel(2 * CELL + 1, CELL + 1)[0], 0);
    }

    #[test]
    fn test_draw_marker_unknown_id() {
        assert!(draw_marker(MarkerDictionary::Dict4x4_50, 49, CELL).is_err());
        assert!(draw_marker(MarkerDictionary::Dict4x4_50, 0, 0).is_err());
    }

    #[test]
    fn test_rotate_code_four_times_is_identity() {
        for &code in &DICT_4X4_50_CODES {
            let mut c = code;
            for _ in 0..4 {
                c = rotate_code(c);
            }
            assert_eq!(c, code);
            assert_ne!(rotate_code(code), code);
        }
    }

    #[test]
    fn test_match_code_with_rotation_and_bit_error() {
        let rotated = rotate_code(rotate_code(DICT_4X4_50_CODES[2]));
        assert_eq!(match_code(rotated, &DICT_4X4_50_CODES), Some((2, 0)));

        let flipped = DICT_4X4_50_CODES[3] ^ 0x0010;
        assert_eq!(match_code(flipped, &DICT_4X4_50_CODES), Some((3, 1)));
    }

    #[test]
    fn test_detect_axis_aligned_markers() {
        let gray = four_corner_page();
        let detections = detect_markers(&gray, MarkerDictionary::Dict4x4_50, &FiducialParams::default());

        let mut ids: Vec<u16> = detections.iter().map(|d| d.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_locate_returns_centers_in_id_order() {
        let locator = FiducialLocator::new(&MarkerConfig::default());
        let markers = locator.locate(&to_rgb(&four_corner_page())).unwrap();

        let half = SIDE as f64 / 2.0;
        let expected = [
            (80.0 + half, 660.0 + half),
            (80.0 + half, 80.0 + half),
            (460.0 + half, 660.0 + half),
            (460.0 + half, 80.0 + half),
        ];
        for (p, e) in markers.points().iter().zip(expected.iter()) {
            assert!((p.x - e.0).abs() < 0.5, "x {} vs {}", p.x, e.0);
            assert!((p.y - e.1).abs() < 0.5, "y {} vs {}", p.y, e.1);
        }
    }

    #[test]
    fn test_missing_marker() {
        let gray = page(&[(0, 80, 660), (1, 80, 80), (3, 460, 80)]);
        let locator = FiducialLocator::new(&MarkerConfig::default());

        match locator.locate(&to_rgb(&gray)) {
            Err(GradeError::MarkersMissing(reason)) => assert!(reason.contains("[2]"), "{}", reason),
            other => panic!("expected MarkersMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_marker_rejected() {
        let gray = page(&[(0, 80, 660), (1, 80, 80), (2, 460, 660), (3, 460, 80), (1, 270, 370)]);
        let locator = FiducialLocator::new(&MarkerConfig::default());
        assert!(matches!(
            locator.locate(&to_rgb(&gray)),
            Err(GradeError::MarkersMissing(_))
        ));
    }

    #[test]
    fn test_rotated_page_detected_and_stable() {
        let gray = rotate_about_center(
            &four_corner_page(),
            8f32.to_radians(),
            Interpolation::Bilinear,
            Luma([255u8]),
        );
        let rgb = to_rgb(&gray);
        let locator = FiducialLocator::new(&MarkerConfig::default());

        let first = locator.locate(&rgb).unwrap();
        let second = locator.locate(&rgb).unwrap();
        assert_eq!(first, second);

        // Rotation preserves distances between marker centers
        let p = first.points();
        let top = ((p[3].x - p[1].x).powi(2) + (p[3].y - p[1].y).powi(2)).sqrt();
        assert!((top - 380.0).abs() < 2.0, "top edge {}", top);
    }

    #[test]
    fn test_keystoned_page_detected_and_stable() {
        // Camera tilted away at the top: top corners pulled in, bottom ones spread
        let from = [(0.0, 0.0), (600.0, 0.0), (600.0, 800.0), (0.0, 800.0)];
        let to = [(30.0, 20.0), (575.0, 25.0), (600.0, 790.0), (0.0, 800.0)];
        let projection = Projection::from_control_points(from, to).unwrap();
        let warped = warp(&four_corner_page(), &projection, Interpolation::Bilinear, Luma([255u8]));
        let rgb = to_rgb(&warped);

        let locator = FiducialLocator::new(&MarkerConfig::default());
        let first = locator.locate(&rgb).unwrap();
        let second = locator.locate(&rgb).unwrap();
        assert_eq!(first, second);

        let as_f64 = |pts: [(f32, f32); 4]| pts.map(|(x, y)| (x as f64, y as f64));
        let h = Homography::from_points(&as_f64(from), &as_f64(to)).unwrap();
        let half = SIDE as f64 / 2.0;
        let flat = [
            (80.0 + half, 660.0 + half),
            (80.0 + half, 80.0 + half),
            (460.0 + half, 660.0 + half),
            (460.0 + half, 80.0 + half),
        ];
        for (p, &(x, y)) in first.points().iter().zip(flat.iter()) {
            let (ex, ey) = h.apply(x, y).unwrap();
            assert!((p.x - ex).abs() < 1.5, "x {} vs {}", p.x, ex);
            assert!((p.y - ey).abs() < 1.5, "y {} vs {}", p.y, ey);
        }
    }

    #[test]
    fn test_blank_page_has_no_markers() {
        let gray = GrayImage::from_pixel(200, 200, Luma([255]));
        assert!(detect_markers(&gray, MarkerDictionary::Dict4x4_50, &FiducialParams::default()).is_empty());
    }
}
