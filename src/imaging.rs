//! Image composition engine
//!
//! Decodes screenshot fragments, crops and splices them, and encodes the
//! composite. All placement is integer pixel geometry with opaque overwrite,
//! so the output dimensions are fully determined by the inputs.

use crate::WorkerError;
use image::buffer::ConvertBuffer;
use image::{imageops, DynamicImage, ImageOutputFormat, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;

/// JPEG quality used for every JPEG encode.
pub const JPEG_QUALITY: u8 = 80;

/// Output encodings. Only `png` and `jpeg` are recognised by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Png
    }
}

impl OutputFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "png" => Some(Self::Png),
            "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    /// Format implied by a file extension (`png`, `jpeg`, `jpg`).
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "png" => Some(Self::Png),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }
}

/// Requested output size for a fragment, applied with [`cut_image`] from the
/// fragment's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrimSize {
    pub width: u32,
    pub height: u32,
}

/// One raw screenshot region as produced by a capture.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawFragment {
    pub data: Vec<u8>,
    #[serde(default)]
    pub trim: Option<TrimSize>,
}

impl RawFragment {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, trim: None }
    }

    pub fn trimmed(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            trim: Some(TrimSize { width, height }),
        }
    }
}

/// A decoded fragment. Owned by the call that decoded it.
#[derive(Debug, Clone)]
pub struct Fragment {
    image: RgbaImage,
}

impl Fragment {
    pub fn decode(bytes: &[u8]) -> Result<Self, WorkerError> {
        decode(bytes).map(|image| Self { image })
    }

    /// Pixel bounds as `(width, height)`.
    pub fn bounds(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

pub fn decode(bytes: &[u8]) -> Result<RgbaImage, WorkerError> {
    image::load_from_memory(bytes)
        .map(|image| image.to_rgba8())
        .map_err(|e| WorkerError::ImageDecode(e.to_string()))
}

/// Encode by format name. Names other than `png` and `jpeg` produce an empty
/// buffer and no error.
pub fn encode(image: &RgbaImage, format: &str) -> Result<Vec<u8>, WorkerError> {
    match OutputFormat::from_name(format) {
        Some(format) => encode_as(image, format),
        None => Ok(Vec::new()),
    }
}

pub fn encode_as(image: &RgbaImage, format: OutputFormat) -> Result<Vec<u8>, WorkerError> {
    let mut buffer = Vec::new();
    let mut cursor = Cursor::new(&mut buffer);

    let written = match format {
        OutputFormat::Png => {
            DynamicImage::ImageRgba8(image.clone()).write_to(&mut cursor, ImageOutputFormat::Png)
        }
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb: RgbImage = image.convert();
            DynamicImage::ImageRgb8(rgb)
                .write_to(&mut cursor, ImageOutputFormat::Jpeg(JPEG_QUALITY))
        }
    };
    written.map_err(|e| WorkerError::ImageEncode(e.to_string()))?;

    Ok(buffer)
}

/// Place `second` after `first`, below it when `vertical`, to its right
/// otherwise.
///
/// The canvas is the union of both placed rectangles. Uncovered pixels stay
/// transparent. Pixels are copied, never blended.
pub fn splice_images(
    first: &RgbaImage,
    second: &RgbaImage,
    vertical: bool,
) -> Result<RgbaImage, WorkerError> {
    let (first_w, first_h) = first.dimensions();
    let (second_w, second_h) = second.dimensions();

    let (origin_x, origin_y) = if vertical { (0, first_h) } else { (first_w, 0) };

    let overflow = || {
        WorkerError::InvalidGeometry(format!(
            "splice of {first_w}x{first_h} and {second_w}x{second_h} overflows"
        ))
    };
    let width = first_w.max(origin_x.checked_add(second_w).ok_or_else(overflow)?);
    let height = first_h.max(origin_y.checked_add(second_h).ok_or_else(overflow)?);

    let mut canvas = RgbaImage::new(width, height);
    imageops::replace(&mut canvas, first, 0, 0);
    imageops::replace(&mut canvas, second, i64::from(origin_x), i64::from(origin_y));

    Ok(canvas)
}

/// Decode two images, splice them and encode the composite by format name.
pub fn splice(
    first: &[u8],
    second: &[u8],
    vertical: bool,
    format: &str,
) -> Result<Vec<u8>, WorkerError> {
    let first = Fragment::decode(first)?;
    let second = Fragment::decode(second)?;
    let composite = splice_images(first.image(), second.image(), vertical)?;
    encode(&composite, format)
}

/// Allocate a `(x1 - x0) x (y1 - y0)` canvas and copy the source into it from
/// the source's own origin.
///
/// The read region is not offset by `(x0, y0)`: only the output size depends
/// on the rectangle. Description trimming relies on exactly this.
pub fn cut_image(
    source: &RgbaImage,
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
) -> Result<RgbaImage, WorkerError> {
    if x1 <= x0 || y1 <= y0 {
        return Err(WorkerError::InvalidGeometry(format!(
            "empty cut rectangle ({x0},{y0})-({x1},{y1})"
        )));
    }

    let mut canvas = RgbaImage::new(x1 - x0, y1 - y0);
    imageops::replace(&mut canvas, source, 0, 0);
    Ok(canvas)
}

/// Byte-level [`cut_image`]; always encodes PNG.
pub fn cut(bytes: &[u8], x0: u32, y0: u32, x1: u32, y1: u32) -> Result<Vec<u8>, WorkerError> {
    let source = decode(bytes)?;
    let cropped = cut_image(&source, x0, y0, x1, y1)?;
    encode_as(&cropped, OutputFormat::Png)
}

/// Trim each fragment that asks for it, stack all of them vertically in
/// order and encode the result.
///
/// Returns an empty buffer when there are no fragments.
pub fn compose_fragments(
    fragments: &[RawFragment],
    format: OutputFormat,
) -> Result<Vec<u8>, WorkerError> {
    let mut composite: Option<RgbaImage> = None;

    for fragment in fragments {
        let mut image = Fragment::decode(&fragment.data)?.into_image();
        if let Some(trim) = fragment.trim {
            image = cut_image(&image, 0, 0, trim.width, trim.height)?;
        }

        composite = Some(match composite {
            Some(above) => splice_images(&above, &image, true)?,
            None => image,
        });
    }

    match composite {
        Some(composite) => encode_as(&composite, format),
        None => Ok(Vec::new()),
    }
}

/// Read an image file and re-encode it in the format named by its extension.
pub fn read_image_file(path: &Path) -> Result<Vec<u8>, WorkerError> {
    let format = format_for_path(path)?;
    let bytes = std::fs::read(path)?;
    encode_as(&decode(&bytes)?, format)
}

/// Decode `bytes` and write them to `path` in the format named by its
/// extension.
pub fn save_image_file(bytes: &[u8], path: &Path) -> Result<(), WorkerError> {
    let format = format_for_path(path)?;
    let encoded = encode_as(&decode(bytes)?, format)?;
    std::fs::write(path, encoded)?;
    Ok(())
}

/// Splice two image files into `output`.
pub fn splice_files(
    first: &Path,
    second: &Path,
    output: &Path,
    vertical: bool,
) -> Result<(), WorkerError> {
    let format = format_for_path(output)?;
    let first = std::fs::read(first)?;
    let second = std::fs::read(second)?;
    let composite = splice(&first, &second, vertical, format.name())?;
    std::fs::write(output, composite)?;
    Ok(())
}

fn format_for_path(path: &Path) -> Result<OutputFormat, WorkerError> {
    OutputFormat::from_path(path).ok_or_else(|| {
        WorkerError::ImageEncode(format!(
            "unsupported image extension: {}",
            path.display()
        ))
    })
}
