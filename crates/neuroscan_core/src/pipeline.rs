//! Image decoding, letterbox normalization and region cropping.

use std::io::Cursor;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::{ImageReader, Rgb, RgbImage};
use ndarray::Array3;

use crate::error::PipelineError;

/// Background used for letterbox padding.
const PAD_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Immutable 8-bit RGB pixel buffer, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pixels: RgbImage,
}

impl Image {
    /// Wraps raw RGB bytes (`width * height * 3`).
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, PipelineError> {
        let pixels = RgbImage::from_raw(width, height, data).ok_or_else(|| {
            PipelineError::decode("raw buffer", "buffer length does not match dimensions")
        })?;
        Self::from_rgb(pixels, "raw buffer")
    }

    fn from_rgb(pixels: RgbImage, source_name: &str) -> Result<Self, PipelineError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(PipelineError::decode(source_name, "image has no pixels"));
        }
        Ok(Self { pixels })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Raw channel bytes in `R, G, B` order.
    pub fn as_raw(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    /// `R, G, B` at `(x, y)`, or `None` outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        self.pixels.get_pixel_checked(x, y).map(|p| p.0)
    }

    /// Encodes the image; format follows the file extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), image::ImageError> {
        self.pixels.save(path)
    }
}

/// Square or rectangular output dimensions of [`normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub const fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }
}

impl Default for TargetSize {
    fn default() -> Self {
        Self::square(224)
    }
}

/// An [`Image`] letterboxed to an exact target size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    image: Image,
}

impl NormalizedImage {
    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Channel values scaled to `[0.0, 1.0]`, shaped `(height, width, 3)`.
    pub fn to_unit_range(&self) -> Array3<f32> {
        let (w, h) = (self.width() as usize, self.height() as usize);
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
            f32::from(self.image.pixels.get_pixel(x as u32, y as u32).0[c]) / 255.0
        })
    }

    pub fn into_image(self) -> Image {
        self.image
    }
}

/// User-selected points in image pixel coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Region {
    points: Vec<(f32, f32)>,
}

impl Region {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self { points }
    }

    pub fn push(&mut self, x: f32, y: f32) {
        self.points.push((x, y));
    }

    pub fn points(&self) -> &[(f32, f32)] {
        &self.points
    }

    /// Bounding box `(left, top, right, bottom)` clamped to `width x height`,
    /// right/bottom exclusive.
    fn clamped_box(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let (first, rest) = self.points.split_first()?;
        let (mut min_x, mut min_y) = *first;
        let (mut max_x, mut max_y) = *first;
        for &(x, y) in rest {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        let clamp = |v: f32, hi: u32| v.clamp(0.0, hi as f32) as u32;
        Some((
            clamp(min_x.floor(), width),
            clamp(min_y.floor(), height),
            clamp(max_x.ceil(), width),
            clamp(max_y.ceil(), height),
        ))
    }
}

impl FromIterator<(f32, f32)> for Region {
    fn from_iter<I: IntoIterator<Item = (f32, f32)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Decodes an image file (PNG, JPEG, BMP, ...) into RGB.
pub fn load_image(path: impl AsRef<Path>) -> Result<Image, PipelineError> {
    let path = path.as_ref();
    let name = path.display().to_string();
    let reader = ImageReader::open(path)
        .map_err(|e| PipelineError::decode(&name, e))?
        .with_guessed_format()
        .map_err(|e| PipelineError::decode(&name, e))?;
    let decoded = reader
        .decode()
        .map_err(|e| PipelineError::decode(&name, e))?;
    Image::from_rgb(decoded.to_rgb8(), &name)
}

/// Decodes an in-memory encoded image.
pub fn decode_image(bytes: &[u8]) -> Result<Image, PipelineError> {
    let decoded = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::decode("memory buffer", e))?
        .decode()
        .map_err(|e| PipelineError::decode("memory buffer", e))?;
    Image::from_rgb(decoded.to_rgb8(), "memory buffer")
}

/// Size of the resized content inside the letterbox canvas.
fn content_size(width: u32, height: u32, target: TargetSize) -> (u32, u32) {
    let aspect = f64::from(width) / f64::from(height);
    let (w, h) = if aspect > 1.0 {
        (
            f64::from(target.width),
            (f64::from(target.width) / aspect).round(),
        )
    } else {
        (
            (f64::from(target.height) * aspect).round(),
            f64::from(target.height),
        )
    };
    ((w as u32).max(1), (h as u32).max(1))
}

/// Letterbox-resizes `image` onto a black `target` canvas.
///
/// Content keeps its aspect ratio and is centred with floor-based offsets, so
/// an odd leftover pixel of padding lands on the right/bottom edge.
pub fn normalize(image: &Image, target: TargetSize) -> Result<NormalizedImage, PipelineError> {
    if target.width == 0 || target.height == 0 {
        return Err(PipelineError::InvalidTarget {
            width: target.width,
            height: target.height,
        });
    }
    let (new_w, new_h) = content_size(image.width(), image.height(), target);
    let (new_w, new_h) = (new_w.min(target.width), new_h.min(target.height));

    let resized = if (new_w, new_h) == (image.width(), image.height()) {
        image.pixels.clone()
    } else {
        imageops::resize(&image.pixels, new_w, new_h, FilterType::Lanczos3)
    };

    let mut canvas = RgbImage::from_pixel(target.width, target.height, PAD_COLOR);
    let offset_x = (target.width - new_w) / 2;
    let offset_y = (target.height - new_h) / 2;
    imageops::overlay(
        &mut canvas,
        &resized,
        i64::from(offset_x),
        i64::from(offset_y),
    );

    Ok(NormalizedImage {
        image: Image { pixels: canvas },
    })
}

/// [`normalize`] followed by scaling every channel to `[0.0, 1.0]`.
pub fn normalize_to_unit_range(
    image: &Image,
    target: TargetSize,
) -> Result<Array3<f32>, PipelineError> {
    Ok(normalize(image, target)?.to_unit_range())
}

/// Crops the clamped bounding box of `region` out of `image`.
pub fn crop_region(image: &Image, region: &Region) -> Result<Image, PipelineError> {
    if region.points().len() < 2 {
        return Err(PipelineError::InvalidRegion(format!(
            "need at least 2 points, got {}",
            region.points().len()
        )));
    }
    let (left, top, right, bottom) = region
        .clamped_box(image.width(), image.height())
        .ok_or_else(|| PipelineError::InvalidRegion("region has no points".into()))?;
    if right <= left || bottom <= top {
        return Err(PipelineError::InvalidRegion(format!(
            "clamped box ({left},{top})-({right},{bottom}) has zero area"
        )));
    }
    let cropped = imageops::crop_imm(&image.pixels, left, top, right - left, bottom - top);
    Ok(Image {
        pixels: cropped.to_image(),
    })
}
