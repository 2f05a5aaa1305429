//! Page geometry: logical page space to image pixels
//!
//! The only place where the bottom-left/top-left origin flip and the
//! region/marker DPI ratio are handled. The flip is carried entirely by the
//! marker correspondences fed to the homography; nothing here flips `y` by hand.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use tracing::{debug, warn};

use crate::error::GradeError;
use crate::worksheet::{LogicalRect, MappedRegion, MarkerSet, PixelPoint, PixelRect, Template};

/// Minimum |cross product| for three corners to count as non-collinear
const COLLINEAR_EPSILON: f64 = 1e-6;

/// 3x3 perspective transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
}

impl Homography {
    /// Standard four-point solve: the transform sending `src[i]` to `dst[i]`
    pub fn from_points(src: &[(f64, f64); 4], dst: &[(f64, f64); 4]) -> Option<Self> {
        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();

        for i in 0..4 {
            let (x, y) = src[i];
            let (u, v) = dst[i];
            let r = 2 * i;

            a[(r, 0)] = x;
            a[(r, 1)] = y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -u * x;
            a[(r, 7)] = -u * y;
            b[r] = u;

            a[(r + 1, 3)] = x;
            a[(r + 1, 4)] = y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -v * x;
            a[(r + 1, 7)] = -v * y;
            b[r + 1] = v;
        }

        let h = a.lu().solve(&b)?;
        if h.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let matrix = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        if matrix.determinant().abs() < 1e-12 {
            return None;
        }
        Some(Self { matrix })
    }

    /// Project a point; `None` if it lands on the line at infinity
    pub fn apply(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let p = self.matrix * Vector3::new(x, y, 1.0);
        if p[2].abs() < 1e-12 {
            return None;
        }
        Some((p[0] / p[2], p[1] / p[2]))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }
}

/// Corners of a marker set in cyclic order (BL, TL, TR, BR by id 0, 1, 3, 2)
fn cyclic_order(points: &[(f64, f64); 4]) -> [(f64, f64); 4] {
    [points[0], points[1], points[3], points[2]]
}

fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

/// Whether four id-ordered corners form a non-degenerate convex quadrilateral
pub fn is_valid_quad(points: &[(f64, f64); 4]) -> bool {
    if points.iter().any(|p| !p.0.is_finite() || !p.1.is_finite()) {
        return false;
    }

    // No three corners collinear (this also excludes coincident corners)
    for i in 0..4 {
        for j in (i + 1)..4 {
            for k in (j + 1)..4 {
                if cross(points[i], points[j], points[k]).abs() < COLLINEAR_EPSILON {
                    return false;
                }
            }
        }
    }

    let quad = cyclic_order(points);
    let mut sign = 0.0f64;
    let mut area2 = 0.0f64;
    for i in 0..4 {
        let turn = cross(quad[i], quad[(i + 1) % 4], quad[(i + 2) % 4]);
        if sign == 0.0 {
            sign = turn.signum();
        } else if turn.signum() != sign {
            return false;
        }
        let (p, q) = (quad[i], quad[(i + 1) % 4]);
        area2 += p.0 * q.1 - q.0 * p.1;
    }

    area2.abs() > COLLINEAR_EPSILON
}

/// Maps logical answer regions of a template into an image
pub struct GeometryMapper {
    homography: Homography,
    region_scale: f64,
    width: u32,
    height: u32,
}

impl GeometryMapper {
    /// Solve the page transform from the template's markers to the detected ones
    pub fn new(template: &Template, markers: &MarkerSet, width: u32, height: u32) -> Result<Self, GradeError> {
        let logical = template.marker_points().map(|p| (p.x, p.y));
        let pixel = markers.points().map(|p| (p.x, p.y));

        if !is_valid_quad(&logical) {
            return Err(GradeError::GeometryInvalid(
                "template marker quadrilateral is degenerate".to_string(),
            ));
        }
        if !is_valid_quad(&pixel) {
            return Err(GradeError::GeometryInvalid(
                "detected marker quadrilateral is degenerate".to_string(),
            ));
        }

        let homography = Homography::from_points(&logical, &pixel).ok_or_else(|| {
            GradeError::GeometryInvalid("perspective transform solve failed".to_string())
        })?;
        debug!("Page homography: {:?}", homography.matrix());

        Ok(Self {
            homography,
            region_scale: template.region_scale(),
            width,
            height,
        })
    }

    /// Map one logical region; `None` if it degenerates after clipping
    pub fn map_region(&self, region: &LogicalRect) -> Option<PixelRect> {
        let s = self.region_scale;
        let (x1, y1) = (region.x1 as f64 * s, region.y1 as f64 * s);
        let (x2, y2) = (region.x2 as f64 * s, region.y2 as f64 * s);

        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for (x, y) in [(x1, y1), (x1, y2), (x2, y1), (x2, y2)] {
            let (u, v) = self.homography.apply(x, y)?;
            min_x = min_x.min(u);
            min_y = min_y.min(v);
            max_x = max_x.max(u);
            max_y = max_y.max(v);
        }

        let w = self.width as f64;
        let h = self.height as f64;
        let rect = PixelRect {
            x1: min_x.clamp(0.0, w).round() as u32,
            y1: min_y.clamp(0.0, h).round() as u32,
            x2: max_x.clamp(0.0, w).round() as u32,
            y2: max_y.clamp(0.0, h).round() as u32,
        };

        if rect.x2 <= rect.x1 || rect.y2 <= rect.y1 {
            return None;
        }
        Some(rect)
    }

    /// Map every region in order, dropping (and warning about) degenerate ones
    pub fn map_regions(&self, regions: &[LogicalRect]) -> Vec<MappedRegion> {
        regions
            .iter()
            .enumerate()
            .filter_map(|(index, region)| match self.map_region(region) {
                Some(rect) => Some(MappedRegion { index, rect }),
                None => {
                    warn!(
                        "Dropping answer region {} {:?}: degenerate after mapping into {}x{} image",
                        index, region, self.width, self.height
                    );
                    None
                }
            })
            .collect()
    }
}

/// Convenience: map a template's regions through detected markers
pub fn map_template_regions(
    template: &Template,
    markers: &MarkerSet,
    width: u32,
    height: u32,
) -> Result<Vec<MappedRegion>, GradeError> {
    let mapper = GeometryMapper::new(template, markers, width, height)?;
    Ok(mapper.map_regions(&template.regions))
}

/// Where an ideal renderer puts a logical point in an image of `page_height`
/// pixels at `px_per_unit` pixels per marker unit
pub fn ideal_placement(x: f64, y: f64, px_per_unit: f64, page_height: f64) -> PixelPoint {
    PixelPoint::new(x * px_per_unit, page_height - y * px_per_unit)
}
