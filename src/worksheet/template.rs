//! Content-addressed worksheet templates
//!
//! A template is the per-layout record of logical marker positions and answer
//! regions. Its id is the SHA-256 of its canonical JSON serialization, so the
//! same layout always maps to the same id regardless of who registers it.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::types::{LogicalPoint, LogicalRect};
use crate::config::GeometryConfig;

/// Worksheet layout in logical (bottom-left origin) coordinates.
///
/// Field order is the canonical key order; keep it lexicographic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// DPI of the `markers` coordinates
    pub marker_dpi: u32,
    /// Marker centers `[x, y]` indexed by marker id (BL, TL, BR, TR)
    pub markers: [[i64; 2]; 4],
    /// DPI of the `regions` coordinates
    pub region_dpi: u32,
    /// Answer regions `[x1, y1, x2, y2]` in problem order
    pub regions: Vec<LogicalRect>,
}

/// Template as written by the renderer. Either DPI may be omitted, in which
/// case the configured default applies before the layout is content-addressed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TemplateFile {
    pub marker_dpi: Option<u32>,
    pub markers: [[i64; 2]; 4],
    pub region_dpi: Option<u32>,
    pub regions: Vec<LogicalRect>,
}

impl TemplateFile {
    /// Resolve missing DPIs: regions default to `logical_dpi`, markers to `image_dpi`
    pub fn with_default_dpi(self, geometry: &GeometryConfig) -> Template {
        Template::new(
            self.markers,
            self.regions,
            self.region_dpi.unwrap_or(geometry.logical_dpi),
            self.marker_dpi.unwrap_or(geometry.image_dpi),
        )
    }
}

impl Template {
    /// Parse a renderer template file, apply DPI defaults and validate
    pub fn from_json(json: &str, geometry: &GeometryConfig) -> Result<Self> {
        let file: TemplateFile = serde_json::from_str(json).context("malformed template JSON")?;
        let template = file.with_default_dpi(geometry);
        template.validate()?;
        Ok(template)
    }

    pub fn new(markers: [[i64; 2]; 4], regions: Vec<LogicalRect>, region_dpi: u32, marker_dpi: u32) -> Self {
        Self {
            marker_dpi,
            markers,
            region_dpi,
            regions,
        }
    }

    /// Compact JSON with stable key order and integer-only numbers
    pub fn canonical_json(&self) -> String {
        // Only integers, strings and fixed-size arrays: serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Content address: lowercase hex SHA-256 of the canonical JSON
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Marker centers as logical points in id order
    pub fn marker_points(&self) -> [LogicalPoint; 4] {
        self.markers.map(|[x, y]| LogicalPoint::new(x as f64, y as f64))
    }

    /// Reject layouts the geometry mapper could never use
    pub fn validate(&self) -> Result<()> {
        if self.marker_dpi == 0 || self.region_dpi == 0 {
            bail!("marker_dpi and region_dpi must be positive");
        }
        if let Some((index, region)) = self.regions.iter().enumerate().find(|(_, r)| !r.is_well_formed()) {
            bail!("region {} {:?} needs x1 < x2 and y1 < y2", index, region);
        }
        let [bl, tl, br, tr] = self.markers;
        if !(bl[0] < br[0] && tl[0] < tr[0] && bl[1] < tl[1] && br[1] < tr[1]) {
            bail!("markers must be ordered bottom-left, top-left, bottom-right, top-right");
        }
        Ok(())
    }

    /// Factor that brings region coordinates into marker coordinates
    pub fn region_scale(&self) -> f64 {
        if self.region_dpi == 0 {
            return 1.0;
        }
        self.marker_dpi as f64 / self.region_dpi as f64
    }
}
