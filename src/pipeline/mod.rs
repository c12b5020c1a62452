//! Document load pipeline: stage, open, rasterize, publish

mod document;
mod engine;
mod error;
mod ledger;
#[cfg(feature = "mupdf")]
mod mupdf_engine;
mod progress;
mod rasterizer;
mod service;
mod source;
mod state;
mod store;
mod types;
mod worker;

pub use document::DocumentHandle;
pub use engine::{RasterDocument, RasterEngine};
pub use error::{EngineFault, FailureKind, PipelineError};
pub use ledger::ResourceLedger;
#[cfg(feature = "mupdf")]
pub use mupdf_engine::MupdfEngine;
pub use progress::{ErrorReport, Listener, NoopSink, PipelineEvent, ProgressSink};
pub use rasterizer::PageRasterizer;
pub use service::{LoadHandle, LoadPipeline};
pub use source::{DocumentSource, ReadSeek, StagedResource, Stager};
pub use state::PipelineState;
pub use store::PageStore;
pub use types::*;

/// Default canvas width in pixels (A4 at 150 dpi)
pub const DEFAULT_PAGE_WIDTH: u32 = 1240;
/// Default canvas height in pixels
pub const DEFAULT_PAGE_HEIGHT: u32 = 1754;
