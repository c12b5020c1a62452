//! MuPDF-backed rasterization engine

use std::path::Path;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use log::{debug, warn};
use mupdf::{Colorspace, Document, Matrix, Pixmap};

use super::engine::{RasterDocument, RasterEngine};
use super::error::EngineFault;
use super::source::StagedResource;
use super::types::{RGBA_CHANNELS, RawBitmap};

/// Renders PDF (and the other formats MuPDF reads) from file-staged input.
///
/// MuPDF documents are not `Send`, so each opened document lives on its own
/// thread and renders are funneled to it over a channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct MupdfEngine;

impl MupdfEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

enum Job {
    Render {
        page: usize,
        width: u32,
        height: u32,
        reply: Sender<Result<RawBitmap, EngineFault>>,
    },
    Close,
}

impl RasterEngine for MupdfEngine {
    fn open(&self, resource: &StagedResource) -> Result<Box<dyn RasterDocument>, EngineFault> {
        let Some(path) = resource.path() else {
            return Err(EngineFault::generic(format!(
                "{} is staged in memory; the MuPDF engine needs temp_file staging",
                resource.origin()
            )));
        };
        let path = path.to_path_buf();

        let (ready_tx, ready_rx) = flume::bounded(1);
        let (job_tx, job_rx) = flume::unbounded();
        let thread = thread::Builder::new()
            .name("pageflow-mupdf".to_string())
            .spawn(move || document_worker(&path, &ready_tx, &job_rx))
            .map_err(|e| EngineFault::generic(format!("failed to start MuPDF thread: {e}")))?;

        let page_count = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => return Err(EngineFault::generic("MuPDF thread exited while opening")),
        };

        Ok(Box::new(MupdfDocument {
            page_count,
            jobs: job_tx,
            thread: Some(thread),
        }))
    }
}

struct MupdfDocument {
    page_count: usize,
    jobs: Sender<Job>,
    thread: Option<JoinHandle<()>>,
}

impl RasterDocument for MupdfDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render(&self, page: usize, width: u32, height: u32) -> Result<RawBitmap, EngineFault> {
        let (reply, result) = flume::bounded(1);
        self.jobs
            .send(Job::Render {
                page,
                width,
                height,
                reply,
            })
            .map_err(|_| EngineFault::generic("MuPDF thread is gone"))?;
        result
            .recv()
            .map_err(|_| EngineFault::generic("MuPDF thread dropped the render"))?
    }

    fn close(&mut self) {
        let _ = self.jobs.send(Job::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("MuPDF thread panicked");
            }
        }
    }
}

fn document_worker(path: &Path, ready: &Sender<Result<usize, EngineFault>>, jobs: &Receiver<Job>) {
    let opened = Document::open(path.to_string_lossy().as_ref())
        .map_err(EngineFault::from)
        .and_then(|doc| {
            let count = doc.page_count()?;
            Ok((doc, usize::try_from(count).unwrap_or(0)))
        });

    let doc = match opened {
        Ok((doc, count)) => {
            debug!("MuPDF opened {path:?} with {count} pages");
            let _ = ready.send(Ok(count));
            doc
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    for job in jobs.iter() {
        match job {
            Job::Render {
                page,
                width,
                height,
                reply,
            } => {
                let _ = reply.send(render_stretched(&doc, page, width, height));
            }
            Job::Close => break,
        }
    }
}

/// Scale the page independently on each axis to fill `width` x `height`
fn render_stretched(
    doc: &Document,
    page_num: usize,
    width: u32,
    height: u32,
) -> Result<RawBitmap, EngineFault> {
    let index = i32::try_from(page_num)
        .map_err(|_| EngineFault::generic(format!("page {page_num} beyond MuPDF range")))?;
    let page = doc.load_page(index)?;

    let bounds = page.bounds()?;
    let (page_width, page_height) = (bounds.x1 - bounds.x0, bounds.y1 - bounds.y0);
    if page_width <= 0.0 || page_height <= 0.0 {
        return Err(EngineFault::generic(format!(
            "page {page_num} has empty bounds"
        )));
    }

    let transform = Matrix::new_scale(width as f32 / page_width, height as f32 / page_height);
    let rgb = Colorspace::device_rgb();
    let pixmap = page.to_pixmap(&transform, &rgb, false, false)?;
    pixmap_to_rgba(&pixmap)
}

fn pixmap_to_rgba(pixmap: &Pixmap) -> Result<RawBitmap, EngineFault> {
    let n = pixmap.n() as usize;
    if n < 3 {
        return Err(EngineFault::generic(format!(
            "unsupported pixmap format: {n} channels"
        )));
    }

    let width = pixmap.width() as usize;
    let height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    let row_bytes = width * n;
    if samples.len() < stride.saturating_mul(height) || row_bytes > stride {
        return Err(EngineFault::generic("pixmap buffer size mismatch"));
    }

    let mut out = Vec::with_capacity(width * height * RGBA_CHANNELS);
    for y in 0..height {
        let row = &samples[y * stride..y * stride + row_bytes];
        for px in row.chunks_exact(n) {
            out.extend_from_slice(&px[..3]);
            out.push(if n >= 4 { px[3] } else { 0xFF });
        }
    }

    Ok(RawBitmap::new(pixmap.width(), pixmap.height(), out))
}
