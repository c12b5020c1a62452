//! Load worker - runs one document load on a background thread

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flume::Receiver;
use log::{debug, error, info, warn};
use rayon::prelude::*;

use super::document::DocumentHandle;
use super::engine::RasterEngine;
use super::error::{FailureKind, PipelineError};
use super::ledger::ResourceLedger;
use super::progress::{Broadcast, ErrorReport};
use super::rasterizer::PageRasterizer;
use super::source::{DocumentSource, Stager};
use super::state::{PipelineState, StateCell};
use super::store::PageStore;
use super::types::{LoadOutcome, LoadSummary, PageImage, ProgressEvent};
use crate::config::{PageFailurePolicy, PipelineConfig, RenderOrder};

/// Messages to an on-demand run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageRequest {
    /// Render this page if it is not resolved yet
    Render(usize),
    /// Stop serving requests and finish normally
    Finish,
    /// Re-check the cancellation flag
    Wake,
}

/// Everything a run needs, owned by the worker thread
pub(crate) struct RunContext {
    pub origin: String,
    pub config: PipelineConfig,
    pub engine: Arc<dyn RasterEngine>,
    pub store: Arc<PageStore>,
    pub ledger: Arc<ResourceLedger>,
    pub events: Arc<Broadcast>,
    pub state: Arc<StateCell>,
    pub cancel: Arc<AtomicBool>,
    pub requests: Option<Receiver<PageRequest>>,
}

/// Progress bookkeeping for one run
#[derive(Debug, Default)]
struct Tally {
    total: Option<usize>,
    /// Highest page index announced in a progress event
    last_announced: Option<usize>,
    rendered: usize,
    failed: Vec<usize>,
}

impl Tally {
    fn summary(&self) -> LoadSummary {
        LoadSummary {
            total_pages: self.total,
            rendered: self.rendered,
            failed_pages: self.failed.clone(),
        }
    }
}

/// How the render loop ended
enum Flow {
    Finished,
    Cancelled,
    Aborted(PipelineError),
}

impl RunContext {
    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn announce(&self, tally: &mut Tally, page: usize, total: usize) {
        self.events.progress(ProgressEvent::page(page, total));
        tally.last_announced = Some(page);
    }

    fn report(&self, error: &PipelineError) {
        self.events.error(ErrorReport::from_error(error));
    }

    /// Terminal path for fatal failures before or after rendering started
    fn fail(&self, error: PipelineError, tally: &Tally) -> LoadOutcome {
        let kind = error.kind();
        error!("Load of {} failed ({kind}): {error}", self.origin);

        self.state.advance(PipelineState::Failed(kind));
        self.report(&error);
        let current = if kind == FailureKind::Render {
            tally.last_announced
        } else {
            None
        };
        self.events
            .progress(ProgressEvent::finished(current, tally.total));
        LoadOutcome::Failed(Arc::new(error))
    }

    fn cancelled(&self, tally: &Tally) -> LoadOutcome {
        info!("Load of {} cancelled after {} pages", self.origin, tally.rendered);

        self.state
            .advance(PipelineState::Failed(FailureKind::Cancelled));
        self.report(&PipelineError::Cancelled);
        self.events
            .progress(ProgressEvent::finished(tally.last_announced, tally.total));
        LoadOutcome::Cancelled(tally.summary())
    }

    fn done(&self, tally: &Tally) -> LoadOutcome {
        info!(
            "Loaded {}: {} of {:?} pages rendered, {} failed",
            self.origin,
            tally.rendered,
            tally.total,
            tally.failed.len()
        );

        self.state.advance(PipelineState::Done);
        self.events.progress(ProgressEvent::finished(None, tally.total));
        LoadOutcome::Completed(tally.summary())
    }

    /// Publish a rendered page unless the run was cancelled meanwhile
    fn publish(&self, tally: &mut Tally, image: PageImage) -> bool {
        if self.is_cancelled() {
            debug!("Dropping page {} rendered after cancellation", image.page);
            return false;
        }

        let page = image.page;
        match self.store.publish(image) {
            Ok(()) => tally.rendered += 1,
            Err(e @ PipelineError::Spill { .. }) => {
                // Stored; only the page it displaced stays unspilled
                tally.rendered += 1;
                warn!("Publishing page {page} could not spill: {e}");
                self.report(&e);
            }
            Err(e) => {
                warn!("Publishing page {page} failed: {e}");
                self.report(&e);
            }
        }
        true
    }

    /// Record a page failure. Returns the fatal error under the abort policy.
    fn page_failed(&self, tally: &mut Tally, error: PipelineError) -> Option<PipelineError> {
        let page = error.page();
        warn!("Load of {}: {error}", self.origin);

        if let Some(page) = page {
            self.store.discard_pending(page);
            tally.failed.push(page);
        }

        match (error.kind(), self.config.page_failure) {
            (FailureKind::Render, PageFailurePolicy::Continue) => {
                self.report(&error);
                None
            }
            _ => Some(error),
        }
    }
}

/// Stage, open, render. Always releases the document before returning.
pub(crate) fn run_load(ctx: &RunContext, source: DocumentSource) -> LoadOutcome {
    let mut tally = Tally::default();

    ctx.state.advance(PipelineState::Staging);
    ctx.events.progress(ProgressEvent::started());
    info!("Loading {}", ctx.origin);

    if ctx.is_cancelled() {
        return ctx.cancelled(&tally);
    }

    let stager = Stager::new(
        ctx.config.staging,
        ctx.config.staging_dir.clone(),
        Arc::clone(&ctx.ledger),
    );
    let staged = match stager.stage(source) {
        Ok(staged) => staged,
        Err(e) => return ctx.fail(e, &tally),
    };

    ctx.state.advance(PipelineState::Opening);
    if ctx.is_cancelled() {
        drop(staged);
        return ctx.cancelled(&tally);
    }

    let mut handle = match DocumentHandle::open(ctx.engine.as_ref(), staged) {
        Ok(handle) => handle,
        Err(e) => return ctx.fail(e, &tally),
    };

    let total = handle.page_count();
    tally.total = Some(total);
    ctx.store.set_page_count(total);
    ctx.state.advance(PipelineState::Rendering(0));

    let rasterizer = PageRasterizer::from_config(&ctx.config);
    let flow = match (ctx.config.render_order, ctx.config.max_concurrent_renders) {
        (RenderOrder::Sequential, jobs) if jobs > 1 => {
            render_windowed(ctx, &handle, &rasterizer, &mut tally, jobs)
        }
        (RenderOrder::Sequential, _) => render_sequential(ctx, &handle, &rasterizer, &mut tally),
        (RenderOrder::OnDemand, _) => serve_requests(ctx, &handle, &rasterizer, &mut tally),
    };

    handle.close();
    ctx.store.abandon_pending();

    match flow {
        Flow::Finished => ctx.done(&tally),
        Flow::Cancelled => ctx.cancelled(&tally),
        Flow::Aborted(error) => ctx.fail(error, &tally),
    }
}

fn render_sequential(
    ctx: &RunContext,
    handle: &DocumentHandle,
    rasterizer: &PageRasterizer,
    tally: &mut Tally,
) -> Flow {
    let total = handle.page_count();
    ctx.store.mark_pending_range(0..total);

    for page in 0..total {
        if ctx.is_cancelled() {
            return Flow::Cancelled;
        }

        ctx.state.advance(PipelineState::Rendering(page));
        ctx.announce(tally, page, total);

        match rasterizer.rasterize(handle, page) {
            Ok(image) => {
                debug!("Rendered page {page} of {}", ctx.origin);
                if !ctx.publish(tally, image) {
                    return Flow::Cancelled;
                }
            }
            Err(e) => {
                if let Some(fatal) = ctx.page_failed(tally, e) {
                    return Flow::Aborted(fatal);
                }
            }
        }
    }

    Flow::Finished
}

/// Render `jobs` pages at a time, announcing and publishing in index order
fn render_windowed(
    ctx: &RunContext,
    handle: &DocumentHandle,
    rasterizer: &PageRasterizer,
    tally: &mut Tally,
    jobs: usize,
) -> Flow {
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .thread_name(|i| format!("pageflow-render-{i}"))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            warn!("Could not start {jobs} render threads ({e}), rendering sequentially");
            return render_sequential(ctx, handle, rasterizer, tally);
        }
    };

    let total = handle.page_count();
    ctx.store.mark_pending_range(0..total);

    let mut next = 0;
    while next < total {
        if ctx.is_cancelled() {
            return Flow::Cancelled;
        }

        let window = next..(next + jobs).min(total);
        ctx.state.advance(PipelineState::Rendering(window.start));
        for page in window.clone() {
            ctx.announce(tally, page, total);
        }

        let results: Vec<_> = pool.install(|| {
            window
                .clone()
                .into_par_iter()
                .map(|page| rasterizer.rasterize(handle, page))
                .collect()
        });

        for result in results {
            match result {
                Ok(image) => {
                    if !ctx.publish(tally, image) {
                        return Flow::Cancelled;
                    }
                }
                Err(e) => {
                    if let Some(fatal) = ctx.page_failed(tally, e) {
                        return Flow::Aborted(fatal);
                    }
                }
            }
        }

        next = window.end;
    }

    Flow::Finished
}

/// Render requested pages, first request first served
fn serve_requests(
    ctx: &RunContext,
    handle: &DocumentHandle,
    rasterizer: &PageRasterizer,
    tally: &mut Tally,
) -> Flow {
    let Some(requests) = ctx.requests.as_ref() else {
        return Flow::Aborted(PipelineError::contract(
            "on-demand load started without a request channel",
        ));
    };
    let total = handle.page_count();

    loop {
        if ctx.is_cancelled() {
            return Flow::Cancelled;
        }
        if tally.rendered + tally.failed.len() >= total {
            debug!("Every page of {} resolved", ctx.origin);
            return Flow::Finished;
        }

        let page = match requests.recv() {
            Ok(PageRequest::Render(page)) => page,
            Ok(PageRequest::Wake) => continue,
            Ok(PageRequest::Finish) | Err(_) => return Flow::Finished,
        };

        if page >= total {
            ctx.report(&PipelineError::contract(format!(
                "requested page {page} out of range (document has {total} pages)"
            )));
            continue;
        }
        if tally.failed.contains(&page) {
            ctx.store.discard_pending(page);
            continue;
        }
        if ctx.store.is_resolved(page) {
            continue;
        }

        ctx.state.advance(PipelineState::Rendering(page));
        if tally.last_announced.is_none_or(|last| page > last) {
            ctx.announce(tally, page, total);
        }

        match rasterizer.rasterize(handle, page) {
            Ok(image) => {
                if !ctx.publish(tally, image) {
                    return Flow::Cancelled;
                }
            }
            Err(e) => {
                if let Some(fatal) = ctx.page_failed(tally, e) {
                    return Flow::Aborted(fatal);
                }
            }
        }
    }
}
