//! Tesseract OCR engine.
//!
//! Runs tesseract via command line in TSV mode so every word comes back with
//! its own confidence.

use super::{OcrEngine, OcrToken};
use crate::error::OcrError;
use crate::types::Bitmap;
use std::process::Command;
use tempfile::TempDir;

pub struct TesseractEngine {
    binary: String,
}

impl TesseractEngine {
    pub fn new() -> Self {
        Self {
            binary: "tesseract".to_string(),
        }
    }

    /// Use a tesseract binary at a non-default location
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrEngine for TesseractEngine {
    fn recognize(&self, bitmap: &Bitmap, language: &str) -> Result<Vec<OcrToken>, OcrError> {
        let temp_dir = TempDir::new()?;
        let image_path = temp_dir.path().join("region.png");
        std::fs::write(&image_path, &bitmap.png)?;

        let output = Command::new(&self.binary)
            .arg(&image_path)
            .arg("stdout")
            .args(["-l", language])
            .args(["--dpi", &bitmap.dpi.to_string()])
            .arg("tsv")
            .output();

        match output {
            Ok(output) if output.status.success() => {
                Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(OcrError::RecognitionFailed(format!(
                    "tesseract failed: {}",
                    stderr.trim()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                OcrError::BackendNotAvailable("tesseract not found (install tesseract-ocr)".into()),
            ),
            Err(e) => Err(OcrError::Io(e)),
        }
    }

    fn name(&self) -> &str {
        "tesseract"
    }

    fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// Parse tesseract TSV output into word tokens.
///
/// Columns: level page_num block_num par_num line_num word_num left top width
/// height conf text. Only word rows (level 5) with a non-negative confidence
/// and non-empty text are kept; conf is 0-100.
pub fn parse_tsv(tsv: &str) -> Vec<OcrToken> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }
            let conf: f32 = cols[10].trim().parse().ok()?;
            let text = cols[11].trim();
            if conf < 0.0 || text.is_empty() {
                return None;
            }
            Some(OcrToken::new(text, (conf / 100.0).clamp(0.0, 1.0)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_word_rows_only() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
1\t1\t0\t0\t0\t0\t0\t0\t100\t40\t-1\t\n\
5\t1\t1\t1\t1\t1\t10\t10\t30\t12\t91.5\tFigure\n\
5\t1\t1\t1\t1\t2\t45\t10\t10\t12\t-1\t \n\
5\t1\t1\t1\t1\t3\t60\t10\t10\t12\t78\t3\n";
        let tokens = parse_tsv(tsv);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].text, "Figure");
        assert!((tokens[0].confidence - 0.915).abs() < 1e-6);
        assert_eq!(tokens[1].text, "3");
    }

    #[test]
    fn missing_binary_is_backend_unavailable() {
        let engine = TesseractEngine::with_binary("definitely-not-tesseract-binary");
        let bitmap = Bitmap {
            png: vec![0u8; 4],
            dpi: 300,
        };
        let err = engine.recognize(&bitmap, "eng").unwrap_err();
        assert!(matches!(err, OcrError::BackendNotAvailable(_)));
        assert!(!engine.is_available());
    }
}
