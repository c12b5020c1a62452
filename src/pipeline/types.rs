//! Core types for the render pipeline

use std::sync::Arc;

use super::error::PipelineError;

/// Bytes per RGBA8 pixel
pub const RGBA_CHANNELS: usize = 4;

/// Pixel buffer as produced by a rasterization engine, before the canvas
/// policy is applied.
#[derive(Clone)]
pub struct RawBitmap {
    /// RGBA8 pixel data, row-major, no padding
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawBitmap {
    #[must_use]
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            pixels,
            width,
            height,
        }
    }

    /// Buffer length implied by the stated dimensions
    #[must_use]
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * RGBA_CHANNELS
    }
}

impl std::fmt::Debug for RawBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// A rendered page, always sized to the configured target canvas.
#[derive(Clone, PartialEq, Eq)]
pub struct PageImage {
    /// Page number (0-indexed)
    pub page: usize,
    /// Canvas width in pixels
    pub width: u32,
    /// Canvas height in pixels
    pub height: u32,
    /// RGBA8 pixel data (4 bytes per pixel: R, G, B, A)
    pub pixels: Vec<u8>,
}

impl PageImage {
    /// RGBA value of a single pixel, `None` when out of bounds
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * RGBA_CHANNELS;
        let px = self.pixels.get(offset..offset + RGBA_CHANNELS)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Size of the pixel buffer in bytes
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for PageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageImage")
            .field("page", &self.page)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish_non_exhaustive()
    }
}

/// Result of a non-blocking page store lookup
#[derive(Clone, Debug)]
pub enum PageLookup {
    /// The page is rendered and available
    Ready(Arc<PageImage>),
    /// The page is scheduled or being rendered
    Pending,
    /// Nothing is known for this index (not requested, failed, or out of range)
    Absent,
}

impl PageLookup {
    #[must_use]
    pub fn ready(self) -> Option<Arc<PageImage>> {
        match self {
            Self::Ready(image) => Some(image),
            Self::Pending | Self::Absent => None,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Loading state reported to observers: `(is_loading, current_page, total_pages)`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub is_loading: bool,
    pub current_page: Option<usize>,
    pub total_pages: Option<usize>,
}

impl ProgressEvent {
    /// First event of every load
    #[must_use]
    pub const fn started() -> Self {
        Self {
            is_loading: true,
            current_page: None,
            total_pages: None,
        }
    }

    /// Page `page` of `total` is about to be rendered
    #[must_use]
    pub const fn page(page: usize, total: usize) -> Self {
        Self {
            is_loading: true,
            current_page: Some(page),
            total_pages: Some(total),
        }
    }

    /// Terminal event
    #[must_use]
    pub const fn finished(current_page: Option<usize>, total_pages: Option<usize>) -> Self {
        Self {
            is_loading: false,
            current_page,
            total_pages,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.is_loading
    }
}

/// What a finished run produced
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Page count, when the document was opened
    pub total_pages: Option<usize>,
    /// Number of pages published to the store
    pub rendered: usize,
    /// Pages that failed to render, in the order they failed
    pub failed_pages: Vec<usize>,
}

/// Final result of a load, shared by every handle attached to the run
#[derive(Clone, Debug)]
pub enum LoadOutcome {
    Completed(LoadSummary),
    Cancelled(LoadSummary),
    Failed(Arc<PipelineError>),
}

impl LoadOutcome {
    #[must_use]
    pub fn summary(&self) -> Option<&LoadSummary> {
        match self {
            Self::Completed(summary) | Self::Cancelled(summary) => Some(summary),
            Self::Failed(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            Self::Failed(err) => Some(err),
            Self::Completed(_) | Self::Cancelled(_) => None,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
