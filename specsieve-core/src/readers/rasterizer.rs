//! Region rasterization through poppler's `pdftoppm`.

use super::RegionRenderer;
use crate::error::OcrError;
use crate::types::{Bitmap, BoundingBox};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

const PDFTOPPM_NOT_FOUND: &str =
    "pdftoppm not found. Install poppler-utils (apt install poppler-utils / brew install poppler)";

/// Renders cropped page regions of a PDF to PNG
pub struct PopplerRasterizer {
    pdf_path: PathBuf,
}

impl PopplerRasterizer {
    pub fn new(pdf_path: impl Into<PathBuf>) -> Self {
        Self {
            pdf_path: pdf_path.into(),
        }
    }

    pub fn pdf_path(&self) -> &Path {
        &self.pdf_path
    }
}

/// Convert a bbox in points to the pixel crop window pdftoppm expects
pub fn crop_window(bbox: &BoundingBox, dpi: u32) -> (u32, u32, u32, u32) {
    let scale = dpi as f64 / 72.0;
    let px = |v: f32| (v as f64 * scale).round();
    let x = px(bbox.x0).max(0.0) as u32;
    let y = px(bbox.y0).max(0.0) as u32;
    let w = px(bbox.width()).max(1.0) as u32;
    let h = px(bbox.height()).max(1.0) as u32;
    (x, y, w, h)
}

impl RegionRenderer for PopplerRasterizer {
    fn render(&self, page: u32, bbox: &BoundingBox, dpi: u32) -> Result<Bitmap, OcrError> {
        let temp = tempfile::TempDir::new()?;
        let output_prefix = temp.path().join("region");
        let (x, y, w, h) = crop_window(bbox, dpi);
        let page_str = page.to_string();

        debug!(page, x, y, w, h, dpi, "Rendering region");

        let status = Command::new("pdftoppm")
            .args(["-png", "-singlefile", "-r", &dpi.to_string()])
            .args(["-f", &page_str, "-l", &page_str])
            .args(["-x", &x.to_string(), "-y", &y.to_string()])
            .args(["-W", &w.to_string(), "-H", &h.to_string()])
            .arg(&self.pdf_path)
            .arg(&output_prefix)
            .status();

        match status {
            Ok(s) if s.success() => {
                let png = std::fs::read(output_prefix.with_extension("png")).map_err(|e| {
                    OcrError::RenderFailed(format!("no image generated for page {}: {}", page, e))
                })?;
                Ok(Bitmap { png, dpi })
            }
            Ok(s) => Err(OcrError::RenderFailed(format!(
                "pdftoppm exited with {} for page {}",
                s, page
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                OcrError::BackendNotAvailable(PDFTOPPM_NOT_FOUND.to_string()),
            ),
            Err(e) => Err(OcrError::Io(e)),
        }
    }
}
