//! The rasterization capability the pipeline delegates document work to.
//!
//! The pipeline never parses document bytes itself. An engine opens a
//! [`StagedResource`] and hands back a [`RasterDocument`] that can turn page
//! `N` into a pixel buffer of a requested size.

use super::error::EngineFault;
use super::source::StagedResource;
use super::types::RawBitmap;

/// Opens staged documents.
pub trait RasterEngine: Send + Sync {
    /// Parse enough of the document to know its page count.
    ///
    /// Any error here is reported as a malformed document.
    fn open(&self, resource: &StagedResource) -> Result<Box<dyn RasterDocument>, EngineFault>;
}

/// An opened document.
///
/// `render` may be called from several threads at once when parallel
/// rendering is configured; engines that cannot render concurrently must
/// serialize internally.
pub trait RasterDocument: Send + Sync {
    fn page_count(&self) -> usize;

    /// Rasterize `page` into an RGBA8 buffer, ideally `width` x `height`.
    ///
    /// Returning a different size is allowed; the rasterizer fits the result
    /// into the target canvas.
    fn render(&self, page: usize, width: u32, height: u32) -> Result<RawBitmap, EngineFault>;

    /// Release engine-side resources. Called exactly once.
    fn close(&mut self) {}
}
