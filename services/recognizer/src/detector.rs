//! Plate localisation and reading.
//!
//! The contour detector follows the classic approach: grayscale, edge
//! preserving smoothing, Canny edges, contour extraction, then the first
//! quadrilateral among the largest contours is taken as the plate. The crop
//! is handed to a [`TextRecognizer`] and the returned text filtered down to
//! letters and digits.

use crate::config::DetectorConfig;
use crate::ocr::{sanitize_plate_text, TextRecognizer};
use ab_glyph::{FontArc, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::contours::{find_contours, Contour};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::edges::canny;
use imageproc::filter::bilateral_filter;
use imageproc::point::Point;
use imageproc::rect::Rect;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors raised while decoding, reading or encoding an image.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("Invalid label font {path}: {message}")]
    Font { path: String, message: String },
}

/// A plate read from an image.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateResult {
    /// Plate text, letters and digits only, never empty
    pub text: String,
    /// Bounding box of the plate-shaped region
    pub region: Rect,
}

/// Locates and reads a licence plate.
pub trait PlateDetector: Send + Sync {
    /// Returns `None` when no plate-shaped region is found or nothing legible
    /// remains after filtering.
    fn detect(&self, image: &DynamicImage) -> Result<Option<PlateResult>, DetectError>;
}

/// Contour based detector: first 4-vertex polygon among the top-K contours by
/// area wins.
pub struct ContourPlateDetector {
    top_k: usize,
    polygon_epsilon: f64,
    canny_low: f32,
    canny_high: f32,
    bilateral_window: u32,
    bilateral_sigma_color: f32,
    bilateral_sigma_spatial: f32,
    recognizer: Box<dyn TextRecognizer>,
}

impl ContourPlateDetector {
    pub fn new(config: &DetectorConfig, recognizer: Box<dyn TextRecognizer>) -> Self {
        Self {
            top_k: config.top_k,
            polygon_epsilon: config.polygon_epsilon,
            canny_low: config.canny_low,
            canny_high: config.canny_high,
            bilateral_window: config.bilateral_window,
            bilateral_sigma_color: config.bilateral_sigma_color,
            bilateral_sigma_spatial: config.bilateral_sigma_spatial,
            recognizer,
        }
    }

    /// Find the bounding box of the plate-shaped region, if any.
    pub fn locate(&self, gray: &GrayImage) -> Option<Rect> {
        let smoothed = if self.bilateral_window > 0 {
            bilateral_filter(
                gray,
                self.bilateral_window,
                self.bilateral_sigma_color,
                self.bilateral_sigma_spatial,
            )
        } else {
            gray.clone()
        };

        let edges = canny(&smoothed, self.canny_low, self.canny_high);
        let contours = find_contours::<i32>(&edges);
        trace!(contours = contours.len(), "Extracted contours");

        let quad = find_plate_quad(contours, self.top_k, self.polygon_epsilon)?;
        Some(bounding_rect(&quad, gray.width(), gray.height()))
    }

    /// Crop `region` from `gray` and run OCR on it.
    pub fn read_region(
        &self,
        gray: &GrayImage,
        region: Rect,
    ) -> Result<Option<PlateResult>, DetectError> {
        let crop = image::imageops::crop_imm(
            gray,
            region.left() as u32,
            region.top() as u32,
            region.width(),
            region.height(),
        )
        .to_image();

        let raw = self.recognizer.recognize(&crop)?;
        let text = raw.as_deref().map(sanitize_plate_text).unwrap_or_default();

        if text.is_empty() {
            debug!(raw = ?raw, "OCR produced no usable text");
            return Ok(None);
        }

        Ok(Some(PlateResult { text, region }))
    }
}

impl PlateDetector for ContourPlateDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Option<PlateResult>, DetectError> {
        let gray = image.to_luma8();

        match self.locate(&gray) {
            Some(region) => self.read_region(&gray, region),
            None => {
                debug!("No plate-shaped region found");
                Ok(None)
            }
        }
    }
}

/// Sort contours by area, keep the `top_k` largest and return the first one
/// whose polygon approximation has exactly four vertices.
pub fn find_plate_quad(
    contours: Vec<Contour<i32>>,
    top_k: usize,
    epsilon: f64,
) -> Option<Vec<Point<i32>>> {
    let mut candidates: Vec<(f64, Vec<Point<i32>>)> = contours
        .into_iter()
        .map(|contour| (polygon_area(&contour.points), contour.points))
        .collect();

    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    candidates
        .into_iter()
        .take(top_k)
        .map(|(_, points)| approximate_closed_polygon(&points, epsilon))
        .find(|polygon| polygon.len() == 4)
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }

    let twice_area: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();

    (twice_area as f64 / 2.0).abs()
}

/// Douglas-Peucker on a closed curve: split at the point farthest from the
/// start, simplify both halves and join them.
fn approximate_closed_polygon(points: &[Point<i32>], epsilon: f64) -> Vec<Point<i32>> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let first = points[0];
    let split = points
        .iter()
        .enumerate()
        .max_by_key(|(_, p)| squared_distance(first, **p))
        .map(|(i, _)| i)
        .unwrap_or(0);

    if split == 0 {
        return vec![first];
    }

    let mut polygon = simplify(&points[..=split], epsilon);

    let mut back_half = points[split..].to_vec();
    back_half.push(first);
    let back = simplify(&back_half, epsilon);

    // Both halves share the split point and the start point.
    polygon.pop();
    polygon.extend(back);
    polygon.pop();
    polygon
}

/// Douglas-Peucker on an open curve, keeping both endpoints.
fn simplify(points: &[Point<i32>], epsilon: f64) -> Vec<Point<i32>> {
    let (start, end) = match (points.first(), points.last()) {
        (Some(s), Some(e)) if points.len() > 2 => (*s, *e),
        _ => return points.to_vec(),
    };

    let (index, distance) = points[1..points.len() - 1]
        .iter()
        .enumerate()
        .map(|(i, p)| (i + 1, perpendicular_distance(*p, start, end)))
        .fold((0, 0.0), |best, current| if current.1 > best.1 { current } else { best });

    if distance > epsilon {
        let mut left = simplify(&points[..=index], epsilon);
        let right = simplify(&points[index..], epsilon);
        left.pop();
        left.extend(right);
        left
    } else {
        vec![start, end]
    }
}

fn squared_distance(a: Point<i32>, b: Point<i32>) -> i64 {
    let dx = (a.x - b.x) as i64;
    let dy = (a.y - b.y) as i64;
    dx * dx + dy * dy
}

fn perpendicular_distance(p: Point<i32>, a: Point<i32>, b: Point<i32>) -> f64 {
    let (dx, dy) = ((b.x - a.x) as f64, (b.y - a.y) as f64);
    let length = (dx * dx + dy * dy).sqrt();
    if length == 0.0 {
        return (squared_distance(p, a) as f64).sqrt();
    }
    ((p.x - a.x) as f64 * dy - (p.y - a.y) as f64 * dx).abs() / length
}

/// Axis-aligned bounding box of `points`, clamped to the image.
fn bounding_rect(points: &[Point<i32>], width: u32, height: u32) -> Rect {
    let max_x = width.saturating_sub(1) as i32;
    let max_y = height.saturating_sub(1) as i32;

    let left = points.iter().map(|p| p.x).min().unwrap_or(0).clamp(0, max_x);
    let right = points.iter().map(|p| p.x).max().unwrap_or(0).clamp(0, max_x);
    let top = points.iter().map(|p| p.y).min().unwrap_or(0).clamp(0, max_y);
    let bottom = points.iter().map(|p| p.y).max().unwrap_or(0).clamp(0, max_y);

    Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32)
}

const LABEL_SCALE: f32 = 32.0;
const LABEL_GAP: i32 = 10;

/// Load the TrueType font used for plate labels.
pub fn load_label_font(path: &Path) -> Result<FontArc, DetectError> {
    let bytes = std::fs::read(path)?;
    FontArc::try_from_vec(bytes).map_err(|e| DetectError::Font {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Draw a 3px green frame around the plate region and, when a font is
/// given, the plate text just below it (above it if it would not fit).
pub fn annotate_plate(
    image: &DynamicImage,
    plate: &PlateResult,
    font: Option<&FontArc>,
) -> RgbImage {
    let mut canvas = image.to_rgb8();
    let green = Rgb([0u8, 255, 0]);
    let region = plate.region;

    for grow in 0..3i32 {
        let frame = Rect::at(region.left() - grow, region.top() - grow).of_size(
            region.width() + 2 * grow as u32,
            region.height() + 2 * grow as u32,
        );
        draw_hollow_rect_mut(&mut canvas, frame, green);
    }

    if let Some(font) = font {
        let scale = PxScale::from(LABEL_SCALE);
        let (_, text_height) = text_size(scale, font, &plate.text);
        let below = region.bottom() + LABEL_GAP;
        let y = if below + text_height as i32 <= canvas.height() as i32 {
            below
        } else {
            (region.top() - LABEL_GAP - text_height as i32).max(0)
        };
        draw_text_mut(&mut canvas, green, region.left(), y, scale, font, &plate.text);
    }

    canvas
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, DetectError> {
    let mut bytes = Vec::new();
    image.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, quality))?;
    Ok(bytes)
}
