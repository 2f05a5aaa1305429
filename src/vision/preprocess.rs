//! Image preprocessing for the digit classifier
//!
//! Turns a cropped answer region into a clean binary glyph (ink = 255) and
//! then into the square NCHW tensor the classifier expects. Also splits a
//! binary region into left-to-right glyphs for multi-symbol answers.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::filter::gaussian_blur_f32;
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array4;
use std::collections::BTreeMap;

/// Preprocessing configuration
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Side of the square classifier input
    pub input_size: u32,
    /// Lower percentile of the contrast stretch
    pub low_percentile: f32,
    /// Upper percentile of the contrast stretch
    pub high_percentile: f32,
    /// Minimum intensity spread for a region to count as written on
    pub min_contrast: u8,
    /// Sigma of the denoising blur
    pub blur_sigma: f32,
    /// Padding around the glyph as a fraction of its longer side
    pub glyph_margin: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            input_size: 32,
            low_percentile: 2.0,
            high_percentile: 98.0,
            min_contrast: 24,
            blur_sigma: 0.7,
            // Digits sit in the middle ~70% of the frame, as in MNIST-style training data
            glyph_margin: 0.2,
        }
    }
}

impl PreprocessConfig {
    pub fn with_input_size(input_size: u32) -> Self {
        Self {
            input_size,
            ..Default::default()
        }
    }
}

/// Bounding box of ink pixels, end-exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InkBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl InkBox {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn center_y(&self) -> f32 {
        (self.y0 + self.y1) as f32 / 2.0
    }

    fn union(&self, other: &InkBox) -> InkBox {
        InkBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Horizontal overlap as a fraction of the narrower box
    fn x_overlap(&self, other: &InkBox) -> f32 {
        let overlap = self.x1.min(other.x1).saturating_sub(self.x0.max(other.x0));
        let narrower = self.width().min(other.width()).max(1);
        overlap as f32 / narrower as f32
    }
}

/// One connected glyph of a binarized region
#[derive(Debug, Clone)]
pub struct Glyph {
    pub bbox: InkBox,
    /// Ink pixel count
    pub area: u32,
    /// Glyph pixels only, sized to `bbox`
    pub mask: GrayImage,
}

/// Single-channel intensity
pub fn to_intensity(crop: &RgbImage) -> GrayImage {
    imageops::grayscale(crop)
}

/// Stretch the percentile range to full scale; `None` if the region has no contrast
pub fn contrast_stretch(gray: &GrayImage, config: &PreprocessConfig) -> Option<GrayImage> {
    let total = gray.width() as u64 * gray.height() as u64;
    if total == 0 {
        return None;
    }

    let mut hist = [0u64; 256];
    for p in gray.pixels() {
        hist[p[0] as usize] += 1;
    }

    let percentile = |pct: f32| -> u8 {
        let target = ((pct as f64 / 100.0) * total as f64).ceil().max(1.0) as u64;
        let mut cum = 0u64;
        for (v, &count) in hist.iter().enumerate() {
            cum += count;
            if cum >= target {
                return v as u8;
            }
        }
        255
    };

    let mut lo = percentile(config.low_percentile);
    let mut hi = percentile(config.high_percentile);
    if hi.saturating_sub(lo) < config.min_contrast {
        // Small glyphs can sit entirely inside the tails; fall back to the full range
        lo = hist.iter().position(|&c| c > 0).unwrap_or(0) as u8;
        hi = hist.iter().rposition(|&c| c > 0).unwrap_or(0) as u8;
        if hi.saturating_sub(lo) < config.min_contrast {
            return None;
        }
    }

    let span = (hi - lo) as f32;
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        let v = (p[0].saturating_sub(lo) as f32 * 255.0 / span).round();
        p[0] = v.min(255.0) as u8;
    }
    Some(out)
}

/// Blur, then Otsu threshold; dark ink becomes 255
pub fn binarize(stretched: &GrayImage, config: &PreprocessConfig) -> GrayImage {
    let blurred = if config.blur_sigma > 0.0 {
        gaussian_blur_f32(stretched, config.blur_sigma)
    } else {
        stretched.clone()
    };
    let level = otsu_level(&blurred);

    let mut binary = blurred;
    for p in binary.pixels_mut() {
        p[0] = if p[0] <= level { 255 } else { 0 };
    }
    binary
}

/// Minimum (erode) or maximum (dilate) over a 2x2 window.
///
/// `forward` looks at (x, y)..(x+1, y+1), otherwise at (x-1, y-1)..(x, y).
/// Pixels outside the image are ignored.
fn window_2x2(binary: &GrayImage, forward: bool, erode: bool) -> GrayImage {
    let (w, h) = binary.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let mut acc = binary.get_pixel(x, y)[0];
        for (dx, dy) in [(1i64, 0i64), (0, 1), (1, 1)] {
            let (dx, dy) = if forward { (dx, dy) } else { (-dx, -dy) };
            let (nx, ny) = (x as i64 + dx, y as i64 + dy);
            if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                continue;
            }
            let v = binary.get_pixel(nx as u32, ny as u32)[0];
            acc = if erode { acc.min(v) } else { acc.max(v) };
        }
        Luma([acc])
    })
}

/// Opening then closing with a 2x2 structuring element
pub fn open_close(binary: &GrayImage) -> GrayImage {
    let opened = window_2x2(&window_2x2(binary, true, true), false, false);
    window_2x2(&window_2x2(&opened, false, false), true, true)
}

/// Steps 1-4: intensity, stretch, denoise + Otsu, morphology.
///
/// `None` when the region is blank.
pub fn binarize_region(crop: &RgbImage, config: &PreprocessConfig) -> Option<GrayImage> {
    let gray = to_intensity(crop);
    let stretched = contrast_stretch(&gray, config)?;
    let binary = open_close(&binarize(&stretched, config));
    ink_bbox(&binary)?;
    Some(binary)
}

/// Bounding box of all ink
pub fn ink_bbox(binary: &GrayImage) -> Option<InkBox> {
    let mut bbox: Option<InkBox> = None;
    for (x, y, p) in binary.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        let pixel = InkBox { x0: x, y0: y, x1: x + 1, y1: y + 1 };
        bbox = Some(match bbox {
            Some(b) => b.union(&pixel),
            None => pixel,
        });
    }
    bbox
}

/// Crop to the box, pad to a centered square and resize to the input size
pub fn square_glyph(binary: &GrayImage, bbox: InkBox, config: &PreprocessConfig) -> GrayImage {
    let glyph = imageops::crop_imm(binary, bbox.x0, bbox.y0, bbox.width(), bbox.height()).to_image();
    pad_and_resize(&glyph, config)
}

fn pad_and_resize(glyph: &GrayImage, config: &PreprocessConfig) -> GrayImage {
    let (w, h) = glyph.dimensions();
    let longer = w.max(h);
    let margin = (longer as f32 * config.glyph_margin).round() as u32;
    let side = longer + 2 * margin;

    let mut square = GrayImage::new(side, side);
    imageops::replace(
        &mut square,
        glyph,
        ((side - w) / 2) as i64,
        ((side - h) / 2) as i64,
    );
    imageops::resize(&square, config.input_size, config.input_size, FilterType::Triangle)
}

/// Convert a square glyph to a (1, 1, S, S) tensor in [0, 1], ink = 1
pub fn to_tensor(glyph: &GrayImage) -> Array4<f32> {
    let (w, h) = glyph.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 1, h as usize, w as usize));

    for (x, y, p) in glyph.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = p[0] as f32 / 255.0;
    }

    tensor
}

/// Classifier input for the whole ink of a region
pub fn region_tensor(binary: &GrayImage, config: &PreprocessConfig) -> Option<Array4<f32>> {
    let bbox = ink_bbox(binary)?;
    Some(to_tensor(&square_glyph(binary, bbox, config)))
}

/// Classifier input for one segmented glyph
pub fn glyph_tensor(glyph: &Glyph, config: &PreprocessConfig) -> Array4<f32> {
    to_tensor(&pad_and_resize(&glyph.mask, config))
}

/// Split a binary region into glyphs ordered left to right.
///
/// Components overlapping by at least half the narrower width in x are
/// merged so a broken pen stroke stays one glyph. Specks under 1% of the
/// total ink are discarded.
pub fn segment_glyphs(binary: &GrayImage) -> Vec<Glyph> {
    let labels = connected_components(binary, Connectivity::Eight, Luma([0u8]));

    let mut components: BTreeMap<u32, (InkBox, u32)> = BTreeMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        let pixel = InkBox { x0: x, y0: y, x1: x + 1, y1: y + 1 };
        components
            .entry(label)
            .and_modify(|(bbox, area)| {
                *bbox = bbox.union(&pixel);
                *area += 1;
            })
            .or_insert((pixel, 1));
    }

    let total_ink: u32 = components.values().map(|(_, area)| area).sum();
    let min_area = ((total_ink as f32 * 0.01).ceil() as u32).max(2);

    let mut ordered: Vec<(u32, InkBox, u32)> = components
        .into_iter()
        .filter(|(_, (_, area))| *area >= min_area)
        .map(|(label, (bbox, area))| (label, bbox, area))
        .collect();
    ordered.sort_by_key(|(label, bbox, _)| (bbox.x0, *label));

    // (labels, bbox, area) per merged group
    let mut groups: Vec<(Vec<u32>, InkBox, u32)> = Vec::new();
    for (label, bbox, area) in ordered {
        match groups.last_mut() {
            Some((group_labels, group_box, group_area)) if group_box.x_overlap(&bbox) >= 0.5 => {
                group_labels.push(label);
                *group_box = group_box.union(&bbox);
                *group_area += area;
            }
            _ => groups.push((vec![label], bbox, area)),
        }
    }

    groups
        .into_iter()
        .map(|(group_labels, bbox, area)| {
            let mask = GrayImage::from_fn(bbox.width(), bbox.height(), |x, y| {
                let label = labels.get_pixel(bbox.x0 + x, bbox.y0 + y)[0];
                Luma([if group_labels.contains(&label) { 255 } else { 0 }])
            });
            Glyph { bbox, area, mask }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn page(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([250, 250, 250]))
    }

    fn ink(image: &mut RgbImage, x: i32, y: i32, w: u32, h: u32) {
        draw_filled_rect_mut(image, Rect::at(x, y).of_size(w, h), Rgb([20, 20, 20]));
    }

    #[test]
    fn test_blank_region_has_no_glyph() {
        let config = PreprocessConfig::default();
        assert!(binarize_region(&page(40, 40), &config).is_none());

        // Faint noise below the contrast floor
        let mut faint = page(40, 40);
        faint.put_pixel(3, 3, Rgb([240, 240, 240]));
        assert!(binarize_region(&faint, &config).is_none());
    }

    #[test]
    fn test_contrast_stretch_full_range() {
        let mut gray = GrayImage::from_pixel(10, 10, Luma([200]));
        for x in 0..10 {
            gray.put_pixel(x, 0, Luma([100]));
        }
        let stretched = contrast_stretch(&gray, &PreprocessConfig::default()).unwrap();
        assert_eq!(stretched.get_pixel(0, 0)[0], 0);
        assert_eq!(stretched.get_pixel(5, 5)[0], 255);
    }

    #[test]
    fn test_small_glyph_survives_percentile_tails() {
        // 1% ink: both percentiles land on paper, full-range fallback applies
        let mut crop = page(50, 20);
        ink(&mut crop, 20, 5, 2, 5);
        let binary = binarize_region(&crop, &PreprocessConfig::default()).unwrap();
        let bbox = ink_bbox(&binary).unwrap();
        assert!(bbox.x0 >= 18 && bbox.x1 <= 24);
    }

    #[test]
    fn test_dark_ink_becomes_foreground() {
        let mut crop = page(40, 40);
        ink(&mut crop, 10, 8, 12, 20);
        let binary = binarize_region(&crop, &PreprocessConfig::default()).unwrap();

        assert_eq!(binary.get_pixel(15, 18)[0], 255);
        assert_eq!(binary.get_pixel(2, 2)[0], 0);
        let bbox = ink_bbox(&binary).unwrap();
        assert!((bbox.x0 as i32 - 10).abs() <= 1 && (bbox.x1 as i32 - 22).abs() <= 1);
    }

    #[test]
    fn test_open_close_removes_speckle_and_closes_gaps() {
        let mut binary = GrayImage::new(20, 20);
        // Isolated speck
        binary.put_pixel(2, 2, Luma([255]));
        // Bar with a one-pixel break
        for x in 5..15 {
            if x != 10 {
                for y in 8..12 {
                    binary.put_pixel(x, y, Luma([255]));
                }
            }
        }

        let cleaned = open_close(&binary);
        assert_eq!(cleaned.get_pixel(2, 2)[0], 0);
        assert_eq!(cleaned.get_pixel(10, 9)[0], 255);
        assert_eq!(cleaned.get_pixel(6, 9)[0], 255);
        assert_eq!(cleaned.get_pixel(6, 14)[0], 0);
    }

    #[test]
    fn test_square_glyph_preserves_aspect() {
        let mut binary = GrayImage::new(60, 60);
        for y in 10..50 {
            for x in 25..35 {
                binary.put_pixel(x, y, Luma([255]));
            }
        }
        let config = PreprocessConfig::default();
        let bbox = ink_bbox(&binary).unwrap();
        let glyph = square_glyph(&binary, bbox, &config);
        assert_eq!(glyph.dimensions(), (32, 32));

        let inner = ink_bbox(&glyph).unwrap();
        // Tall thin stroke stays tall and thin
        assert!(inner.height() > 2 * inner.width());
        // Centered horizontally
        assert!((inner.x0 as i32 + inner.x1 as i32 - 32).abs() <= 2);
    }

    #[test]
    fn test_tensor_layout() {
        let mut glyph = GrayImage::new(4, 4);
        glyph.put_pixel(3, 1, Luma([255]));
        let tensor = to_tensor(&glyph);
        assert_eq!(tensor.dim(), (1, 1, 4, 4));
        assert_eq!(tensor[[0, 0, 1, 3]], 1.0);
        assert_eq!(tensor[[0, 0, 3, 1]], 0.0);
    }

    #[test]
    fn test_segment_orders_left_to_right_and_merges_breaks() {
        let mut binary = GrayImage::new(80, 30);
        let mut fill = |x0: u32, y0: u32, x1: u32, y1: u32| {
            for y in y0..y1 {
                for x in x0..x1 {
                    binary.put_pixel(x, y, Luma([255]));
                }
            }
        };
        // Right glyph drawn first, as two vertically separated strokes
        fill(50, 3, 60, 12);
        fill(50, 16, 60, 27);
        // Left glyph
        fill(10, 3, 18, 27);

        let glyphs = segment_glyphs(&binary);
        assert_eq!(glyphs.len(), 2);
        assert_eq!(glyphs[0].bbox.x0, 10);
        assert_eq!(glyphs[1].bbox, InkBox { x0: 50, y0: 3, x1: 60, y1: 27 });
        assert_eq!(glyphs[1].area, 10 * 9 + 10 * 11);
        // Gap between the merged strokes stays empty in the mask
        assert_eq!(glyphs[1].mask.get_pixel(5, 11)[0], 0);
        assert_eq!(glyphs[1].mask.get_pixel(5, 2)[0], 255);
    }
}
