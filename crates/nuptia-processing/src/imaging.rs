//! Image introspection and thumbnail derivation.

use anyhow::Context;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use std::io::Cursor;

/// Encoded thumbnail ready to be stored next to its original.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// File extension for the thumbnail key
    pub extension: &'static str,
    pub content_type: &'static str,
}

/// What was learned from decoding an uploaded image.
#[derive(Debug, Clone)]
pub struct ImageDerivatives {
    pub width: u32,
    pub height: u32,
    pub thumbnail: Thumbnail,
}

pub struct ImageProcessor;

impl ImageProcessor {
    fn decode(data: &[u8]) -> Result<(DynamicImage, Option<ImageFormat>), anyhow::Error> {
        let reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .context("Failed to read image header")?;
        let format = reader.format();
        let img = reader.decode().context("Failed to decode image")?;
        Ok((img, format))
    }

    /// Width and height of an encoded image.
    pub fn dimensions(data: &[u8]) -> Result<(u32, u32), anyhow::Error> {
        let (img, _) = Self::decode(data)?;
        Ok(img.dimensions())
    }

    /// Fit `(width, height)` inside a `max_dimension` square, keeping the
    /// aspect ratio. Images already inside the box are left alone.
    pub fn thumbnail_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
        if width <= max_dimension && height <= max_dimension {
            return (width, height);
        }
        if width >= height {
            let h = (height as f64 * max_dimension as f64 / width as f64).round() as u32;
            (max_dimension, h.max(1))
        } else {
            let w = (width as f64 * max_dimension as f64 / height as f64).round() as u32;
            (w.max(1), max_dimension)
        }
    }

    /// Decode, measure and shrink an image.
    ///
    /// JPEG sources get a JPEG thumbnail; everything else is encoded as PNG
    /// so transparency survives.
    pub fn derive(data: &[u8], max_dimension: u32) -> Result<ImageDerivatives, anyhow::Error> {
        let (img, format) = Self::decode(data)?;
        let (width, height) = img.dimensions();
        let (thumb_w, thumb_h) = Self::thumbnail_dimensions(width, height, max_dimension);

        let resized = if (thumb_w, thumb_h) == (width, height) {
            img
        } else {
            img.resize_exact(thumb_w, thumb_h, image::imageops::FilterType::Triangle)
        };

        let mut out = Cursor::new(Vec::new());
        let (extension, content_type) = match format {
            Some(ImageFormat::Jpeg) => {
                DynamicImage::ImageRgb8(resized.to_rgb8())
                    .write_to(&mut out, ImageFormat::Jpeg)
                    .context("Failed to encode JPEG thumbnail")?;
                ("jpg", "image/jpeg")
            }
            _ => {
                resized
                    .write_to(&mut out, ImageFormat::Png)
                    .context("Failed to encode PNG thumbnail")?;
                ("png", "image/png")
            }
        };

        Ok(ImageDerivatives {
            width,
            height,
            thumbnail: Thumbnail {
                data: out.into_inner(),
                width: thumb_w,
                height: thumb_h,
                extension,
                content_type,
            },
        })
    }

    /// [`ImageProcessor::derive`] off the async pool; decoding is CPU-bound.
    pub async fn derive_blocking(
        data: Vec<u8>,
        max_dimension: u32,
    ) -> Result<ImageDerivatives, anyhow::Error> {
        let derived =
            tokio::task::spawn_blocking(move || Self::derive(&data, max_dimension)).await??;
        Ok(derived)
    }
}
