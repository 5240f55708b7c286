//! OCR engine contract and the gate deciding which regions get OCR.
//!
//! - `TesseractEngine`: tesseract via command line, TSV output for per-word confidence
//! - `OcrGate`: overlap test, citation reservation, dispatch and confidence filter

pub mod gate;
pub mod tesseract;

use crate::error::OcrError;
use crate::types::Bitmap;

pub use gate::{OcrCandidate, OcrGate, OcrGateSettings};
pub use tesseract::TesseractEngine;

/// One recognized token with its confidence (0.0 - 1.0)
#[derive(Debug, Clone, PartialEq)]
pub struct OcrToken {
    pub text: String,
    pub confidence: f32,
}

impl OcrToken {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Bitmap in, tokens out
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, bitmap: &Bitmap, language: &str) -> Result<Vec<OcrToken>, OcrError>;

    /// Engine identifier recorded on every OCR result
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }
}

/// Mean token confidence; `None` when nothing was recognized
pub fn aggregate_confidence(tokens: &[OcrToken]) -> Option<f32> {
    if tokens.is_empty() {
        return None;
    }
    let sum: f32 = tokens.iter().map(|t| t.confidence).sum();
    Some(sum / tokens.len() as f32)
}

pub fn join_tokens(tokens: &[OcrToken]) -> String {
    tokens
        .iter()
        .map(|t| t.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
