//! OCR backends behind the [`TextRecognizer`] seam.
//!
//! The detector hands a grayscale crop of the plate region to a recognizer
//! and only ever sees text back, so any engine can be plugged in.

use crate::config::OcrConfig;
use crate::detector::DetectError;
use image::{GrayImage, ImageFormat};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Reads text from a cropped plate region.
#[cfg_attr(test, mockall::automock)]
pub trait TextRecognizer: Send + Sync {
    /// Return the raw recognized text, or `None` when nothing was read.
    fn recognize(&self, crop: &GrayImage) -> Result<Option<String>, DetectError>;
}

/// Keep only ASCII letters and digits.
pub fn sanitize_plate_text(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Runs an external OCR program on a scratch PNG of the crop.
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
}

impl CommandRecognizer {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            scratch_dir: config.scratch_dir.clone(),
        }
    }
}

impl TextRecognizer for CommandRecognizer {
    fn recognize(&self, crop: &GrayImage) -> Result<Option<String>, DetectError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let input = self.scratch_dir.join(format!("{}.png", Uuid::new_v4()));
        crop.save_with_format(&input, ImageFormat::Png)?;

        let input_arg = input.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{input}", &input_arg))
            .collect();

        let output = Command::new(&self.program).args(&args).output();

        if let Err(e) = std::fs::remove_file(&input) {
            debug!(path = %input.display(), error = %e, "Failed to remove OCR scratch file");
        }

        let output = output
            .map_err(|e| DetectError::Ocr(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(DetectError::Ocr(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }
}

#[cfg(feature = "tesseract")]
pub use self::tesseract::TesseractRecognizer;

#[cfg(feature = "tesseract")]
mod tesseract {
    use super::TextRecognizer;
    use crate::detector::DetectError;
    use image::{GrayImage, ImageFormat};
    use leptess::{LepTess, Variable};
    use parking_lot::Mutex;
    use std::io::Cursor;

    struct TessHandle(LepTess);

    // SAFETY: the handle is only reachable through the mutex below, so the
    // Tesseract API is never entered from two threads at once.
    unsafe impl Send for TessHandle {}

    /// In-process Tesseract, tuned for single-line plates.
    pub struct TesseractRecognizer {
        api: Mutex<TessHandle>,
    }

    impl TesseractRecognizer {
        pub fn new(tessdata: Option<&str>, language: &str) -> Result<Self, DetectError> {
            let mut api =
                LepTess::new(tessdata, language).map_err(|e| DetectError::Ocr(e.to_string()))?;

            api.set_variable(Variable::TesseditPagesegMode, "7")
                .map_err(|e| DetectError::Ocr(e.to_string()))?;
            api.set_variable(
                Variable::TesseditCharWhitelist,
                "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789",
            )
            .map_err(|e| DetectError::Ocr(e.to_string()))?;

            Ok(Self {
                api: Mutex::new(TessHandle(api)),
            })
        }
    }

    impl TextRecognizer for TesseractRecognizer {
        fn recognize(&self, crop: &GrayImage) -> Result<Option<String>, DetectError> {
            let mut png = Vec::new();
            crop.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

            let mut handle = self.api.lock();
            handle
                .0
                .set_image_from_mem(&png)
                .map_err(|e| DetectError::Ocr(e.to_string()))?;
            let text = handle
                .0
                .get_utf8_text()
                .map_err(|e| DetectError::Ocr(e.to_string()))?;

            let text = text.trim();
            Ok((!text.is_empty()).then(|| text.to_string()))
        }
    }
}

/// Build the recognizer named by the configuration.
pub fn build_recognizer(config: &OcrConfig) -> Result<Box<dyn TextRecognizer>, DetectError> {
    info!(backend = %config.backend, "Initializing OCR backend");

    match config.backend.as_str() {
        "command" => Ok(Box::new(CommandRecognizer::new(config))),
        #[cfg(feature = "tesseract")]
        "tesseract" => Ok(Box::new(TesseractRecognizer::new(
            config.tessdata.as_deref(),
            &config.language,
        )?)),
        #[cfg(not(feature = "tesseract"))]
        "tesseract" => Err(DetectError::Ocr(
            "built without the `tesseract` feature".to_string(),
        )),
        other => Err(DetectError::Ocr(format!("unknown OCR backend: {}", other))),
    }
}
