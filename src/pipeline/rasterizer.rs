//! Fixed-canvas page rasterization

use std::num::NonZeroU32;

use fast_image_resize as fr;
use image::{ImageBuffer, Rgba};
use log::{debug, warn};
use rayon::prelude::*;

use super::document::DocumentHandle;
use super::error::PipelineError;
use super::types::{PageImage, RGBA_CHANNELS, RawBitmap};
use crate::config::PipelineConfig;

/// Placement of a scaled page inside the canvas
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FitSpec {
    width: u32,
    height: u32,
    offset_x: u32,
    offset_y: u32,
}

impl FitSpec {
    /// Largest aspect-preserving size that fits the canvas, centered
    fn compute(source: (u32, u32), canvas: (u32, u32)) -> Self {
        let (src_w, src_h) = (source.0 as f32, source.1 as f32);
        let (dst_w, dst_h) = (canvas.0 as f32, canvas.1 as f32);

        let scale = (dst_w / src_w).min(dst_h / src_h);
        let width = ((src_w * scale).round() as u32).clamp(1, canvas.0);
        let height = ((src_h * scale).round() as u32).clamp(1, canvas.1);

        Self {
            width,
            height,
            offset_x: (canvas.0 - width) / 2,
            offset_y: (canvas.1 - height) / 2,
        }
    }
}

/// Renders pages at one configured canvas size, whatever their native size.
#[derive(Clone, Debug)]
pub struct PageRasterizer {
    width: u32,
    height: u32,
    background: [u8; 4],
}

impl PageRasterizer {
    #[must_use]
    pub fn new(width: u32, height: u32, background: [u8; 4]) -> Self {
        Self {
            width,
            height,
            background,
        }
    }

    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.target_page_width,
            config.target_page_height,
            config.page_background,
        )
    }

    #[must_use]
    pub fn target_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Render `page` of `document` onto a fresh canvas
    pub fn rasterize(
        &self,
        document: &DocumentHandle,
        page: usize,
    ) -> Result<PageImage, PipelineError> {
        let bitmap = document.render_page(page, self.width, self.height)?;
        self.fit_to_canvas(page, bitmap)
    }

    /// Place an engine bitmap on the target canvas.
    ///
    /// A bitmap already at the target size is used as is; anything else is
    /// scaled to fit and centered on the background color.
    pub fn fit_to_canvas(&self, page: usize, bitmap: RawBitmap) -> Result<PageImage, PipelineError> {
        if bitmap.width == 0 || bitmap.height == 0 {
            return Err(PipelineError::render(page, "engine returned an empty bitmap"));
        }
        if bitmap.pixels.len() != bitmap.expected_len() {
            return Err(PipelineError::render(
                page,
                format!(
                    "pixel buffer of {} bytes does not match {}x{} RGBA",
                    bitmap.pixels.len(),
                    bitmap.width,
                    bitmap.height
                ),
            ));
        }

        if (bitmap.width, bitmap.height) == (self.width, self.height) {
            return Ok(PageImage {
                page,
                width: self.width,
                height: self.height,
                pixels: bitmap.pixels,
            });
        }

        let fit = FitSpec::compute((bitmap.width, bitmap.height), (self.width, self.height));
        debug!(
            "Fitting page {page} from {}x{} to {}x{} at ({}, {})",
            bitmap.width, bitmap.height, fit.width, fit.height, fit.offset_x, fit.offset_y
        );

        let scaled = if (bitmap.width, bitmap.height) == (fit.width, fit.height) {
            bitmap.pixels
        } else {
            match fast_resize_rgba(&bitmap, fit.width, fit.height) {
                Ok(pixels) => pixels,
                Err(e) => {
                    warn!("Fast resize failed for page {page}: {e}, falling back to slow resize");
                    slow_resize_rgba(bitmap, fit.width, fit.height).ok_or_else(|| {
                        PipelineError::render(page, "could not resize engine bitmap")
                    })?
                }
            }
        };

        Ok(PageImage {
            page,
            width: self.width,
            height: self.height,
            pixels: self.compose(&scaled, fit),
        })
    }

    fn compose(&self, scaled: &[u8], fit: FitSpec) -> Vec<u8> {
        let stride = self.width as usize * RGBA_CHANNELS;
        let mut canvas = vec![0u8; stride * self.height as usize];
        let src_stride = fit.width as usize * RGBA_CHANNELS;
        let x_start = fit.offset_x as usize * RGBA_CHANNELS;
        let rows = fit.offset_y as usize..(fit.offset_y + fit.height) as usize;

        canvas
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| {
                for px in row.chunks_exact_mut(RGBA_CHANNELS) {
                    px.copy_from_slice(&self.background);
                }
                if rows.contains(&y) {
                    let src_start = (y - rows.start) * src_stride;
                    row[x_start..x_start + src_stride]
                        .copy_from_slice(&scaled[src_start..src_start + src_stride]);
                }
            });

        canvas
    }
}

fn fast_resize_rgba(
    bitmap: &RawBitmap,
    new_width: u32,
    new_height: u32,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let src_image = fr::Image::from_vec_u8(
        NonZeroU32::new(bitmap.width).ok_or("Invalid width")?,
        NonZeroU32::new(bitmap.height).ok_or("Invalid height")?,
        bitmap.pixels.clone(),
        fr::PixelType::U8x4,
    )?;

    let dst_width = NonZeroU32::new(new_width).ok_or("Invalid target width")?;
    let dst_height = NonZeroU32::new(new_height).ok_or("Invalid target height")?;
    let mut dst_image = fr::Image::new(dst_width, dst_height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
    resizer.resize(&src_image.view(), &mut dst_image.view_mut())?;

    Ok(dst_image.into_vec())
}

fn slow_resize_rgba(bitmap: RawBitmap, new_width: u32, new_height: u32) -> Option<Vec<u8>> {
    let src: ImageBuffer<Rgba<u8>, Vec<u8>> =
        ImageBuffer::from_raw(bitmap.width, bitmap.height, bitmap.pixels)?;
    let resized = image::imageops::resize(
        &src,
        new_width,
        new_height,
        image::imageops::FilterType::Lanczos3,
    );
    Some(resized.into_raw())
}
