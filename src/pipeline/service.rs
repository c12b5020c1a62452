//! Load service - owns the page store and drives one load at a time

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};

use super::engine::RasterEngine;
use super::error::{FailureKind, PipelineError};
use super::ledger::ResourceLedger;
use super::progress::{Broadcast, ErrorReport, PipelineEvent, ProgressSink};
use super::source::DocumentSource;
use super::state::{PipelineState, StateCell};
use super::store::PageStore;
use super::types::{LoadOutcome, PageLookup, ProgressEvent};
use super::worker::{PageRequest, RunContext, run_load};
use crate::config::{PipelineConfig, RenderOrder};

const LOAD_THREAD_NAME: &str = "pageflow-load";

/// Outcome slot shared by the worker and every handle of a run
struct Completion {
    inner: Mutex<CompletionInner>,
}

#[derive(Default)]
struct CompletionInner {
    outcome: Option<LoadOutcome>,
    waiters: Vec<Sender<LoadOutcome>>,
}

impl Completion {
    fn new() -> Self {
        Self {
            inner: Mutex::new(CompletionInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CompletionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, outcome: LoadOutcome) {
        let mut inner = self.lock();
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        inner.outcome = Some(outcome);
    }

    fn subscribe(&self) -> Receiver<LoadOutcome> {
        let (tx, rx) = flume::bounded(1);
        let mut inner = self.lock();
        match &inner.outcome {
            Some(outcome) => {
                let _ = tx.send(outcome.clone());
            }
            None => inner.waiters.push(tx),
        }
        rx
    }

    fn outcome(&self) -> Option<LoadOutcome> {
        self.lock().outcome.clone()
    }
}

/// Bookkeeping for the current (or last) run
struct ActiveRun {
    origin: String,
    events: Arc<Broadcast>,
    state: Arc<StateCell>,
    cancel: Arc<AtomicBool>,
    requests: Option<Sender<PageRequest>>,
    completion: Arc<Completion>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveRun {
    fn handle(&self) -> LoadHandle {
        LoadHandle {
            origin: self.origin.clone(),
            receiver: self.completion.subscribe(),
            outcome: None,
        }
    }

    fn is_finished(&self) -> bool {
        self.completion.outcome().is_some()
    }

    /// A finished run for the same origin can be reused unless it ended early
    fn is_reusable(&self) -> bool {
        match self.completion.outcome() {
            None | Some(LoadOutcome::Completed(_)) => true,
            Some(LoadOutcome::Cancelled(_) | LoadOutcome::Failed(_)) => false,
        }
    }

    fn signal_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(requests) = &self.requests {
            let _ = requests.send(PageRequest::Wake);
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Load thread for {} exited abnormally", self.origin);
            }
        }
    }
}

/// Drives document loads against a [`RasterEngine`].
///
/// One load runs at a time on a background thread; the caller never blocks.
/// Rendered pages land in the shared [`PageStore`], which stays readable
/// while the load is in flight and after it ends.
pub struct LoadPipeline {
    engine: Arc<dyn RasterEngine>,
    config: PipelineConfig,
    store: Arc<PageStore>,
    ledger: Arc<ResourceLedger>,
    run: Mutex<Option<ActiveRun>>,
}

impl LoadPipeline {
    #[must_use]
    pub fn new(engine: Arc<dyn RasterEngine>, config: PipelineConfig) -> Self {
        let store = PageStore::new(config.max_resident_pages)
            .with_spill_root(config.staging_dir.clone());

        Self {
            engine,
            config,
            store: Arc::new(store),
            ledger: ResourceLedger::new(),
            run: Mutex::new(None),
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start loading `source`, reporting to `sink`.
    ///
    /// Starting the origin that is already loading (or finished loading)
    /// attaches `sink` to that run instead: it receives every event emitted so
    /// far, then live events. A different origin while a load is still in
    /// flight is rejected with [`PipelineError::AlreadyRunning`]; call
    /// [`LoadPipeline::reset`] first to abandon it.
    pub fn start(
        &self,
        source: DocumentSource,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<LoadHandle, PipelineError> {
        self.config
            .validate()
            .map_err(|e| PipelineError::contract(e.to_string()))?;

        let mut slot = self.lock_run();

        if let Some(run) = slot.as_ref() {
            if run.origin == source.origin() && run.is_reusable() {
                debug!("{} is already loading or loaded, attaching observer", run.origin);
                run.events.attach(sink);
                return Ok(run.handle());
            }
            if !run.is_finished() {
                return Err(PipelineError::AlreadyRunning {
                    origin: run.origin.clone(),
                });
            }
        }

        if let Some(mut previous) = slot.take() {
            previous.join();
        }
        self.store.clear();

        let origin = source.origin().to_string();
        let events = Arc::new(Broadcast::new());
        events.attach(sink);
        let state = Arc::new(StateCell::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let completion = Arc::new(Completion::new());

        let (request_tx, request_rx) = match self.config.render_order {
            RenderOrder::OnDemand => {
                let (tx, rx) = flume::unbounded();
                (Some(tx), Some(rx))
            }
            RenderOrder::Sequential => (None, None),
        };

        let ctx = RunContext {
            origin: origin.clone(),
            config: self.config.clone(),
            engine: Arc::clone(&self.engine),
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            events: Arc::clone(&events),
            state: Arc::clone(&state),
            cancel: Arc::clone(&cancel),
            requests: request_rx,
        };
        let worker_completion = Arc::clone(&completion);

        let thread = thread::Builder::new()
            .name(LOAD_THREAD_NAME.to_string())
            .spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| run_load(&ctx, source)))
                {
                    Ok(outcome) => outcome,
                    Err(_) => worker_lost(&ctx),
                };
                worker_completion.resolve(outcome);
            })?;

        info!("Started load of {origin}");
        let run = ActiveRun {
            origin,
            events,
            state,
            cancel,
            requests: request_tx,
            completion,
            thread: Some(thread),
        };
        let handle = run.handle();
        *slot = Some(run);
        Ok(handle)
    }

    /// Ask the current load to stop before its next page.
    ///
    /// Pages already published stay in the store.
    pub fn cancel(&self) {
        if let Some(run) = self.lock_run().as_ref() {
            if !run.is_finished() {
                info!("Cancelling load of {}", run.origin);
                run.signal_cancel();
            }
        }
    }

    /// End an on-demand load normally once queued requests are served
    pub fn finish(&self) {
        if let Some(run) = self.lock_run().as_ref() {
            if let Some(requests) = &run.requests {
                let _ = requests.send(PageRequest::Finish);
            }
        }
    }

    /// Queue `page` for rendering in an on-demand load.
    ///
    /// Resolved pages are accepted and ignored. Requests with no on-demand
    /// load in flight, or beyond the page count once it is known, are
    /// contract violations.
    pub fn request_page(&self, page: usize) -> Result<(), PipelineError> {
        let slot = self.lock_run();
        let Some(run) = slot.as_ref() else {
            return Err(PipelineError::contract("no load in progress"));
        };
        let Some(requests) = &run.requests else {
            return Err(PipelineError::contract(format!(
                "load of {} renders sequentially and takes no page requests",
                run.origin
            )));
        };
        if run.is_finished() {
            return Err(PipelineError::contract(format!(
                "load of {} has already finished",
                run.origin
            )));
        }
        if let Some(count) = self.store.page_count() {
            if page >= count {
                return Err(PipelineError::contract(format!(
                    "requested page {page} out of range (document has {count} pages)"
                )));
            }
        }
        if self.store.is_resolved(page) {
            return Ok(());
        }

        // Refused once the run has sealed the store on its way out
        if !self.store.mark_pending(page) {
            return Err(PipelineError::contract(format!(
                "load of {} is no longer taking page requests",
                run.origin
            )));
        }
        if requests.send(PageRequest::Render(page)).is_err() {
            self.store.discard_pending(page);
            return Err(PipelineError::WorkerLost);
        }
        debug!("Requested page {page} of {}", run.origin);
        Ok(())
    }

    /// Cancel the current load, wait for it to release its resources and
    /// empty the store
    pub fn reset(&self) {
        let previous = self.lock_run().take();
        if let Some(mut run) = previous {
            run.signal_cancel();
            run.join();
        }
        self.store.clear();
    }

    /// State of the current (or last) load; `Idle` before the first
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.lock_run()
            .as_ref()
            .map_or(PipelineState::Idle, |run| run.state.get())
    }

    /// Origin of the current (or last) load
    #[must_use]
    pub fn origin(&self) -> Option<String> {
        self.lock_run().as_ref().map(|run| run.origin.clone())
    }

    /// Events of the current (or last) load, in emission order
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.lock_run()
            .as_ref()
            .map(|run| run.events.history())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    #[must_use]
    pub fn get(&self, page: usize) -> PageLookup {
        self.store.get(page)
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl Drop for LoadPipeline {
    fn drop(&mut self) {
        let run = self
            .run
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut run) = run {
            run.signal_cancel();
            run.join();
        }
    }
}

/// Terminal bookkeeping when the run itself panicked
fn worker_lost(ctx: &RunContext) -> LoadOutcome {
    error!("Load worker for {} panicked", ctx.origin);

    let error = PipelineError::WorkerLost;
    ctx.store.abandon_pending();
    if !ctx.state.get().is_terminal() {
        ctx.state.advance(PipelineState::Failed(FailureKind::Io));
    }
    ctx.events.error(ErrorReport::from_error(&error));
    ctx.events
        .progress(ProgressEvent::finished(None, ctx.store.page_count()));
    LoadOutcome::Failed(Arc::new(error))
}

fn lost_outcome() -> LoadOutcome {
    LoadOutcome::Failed(Arc::new(PipelineError::WorkerLost))
}

/// Completion of one load, as seen by one caller
#[derive(Debug)]
pub struct LoadHandle {
    origin: String,
    receiver: Receiver<LoadOutcome>,
    outcome: Option<LoadOutcome>,
}

impl LoadHandle {
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Block until the load ends
    pub fn wait(mut self) -> LoadOutcome {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        self.receiver.recv().unwrap_or_else(|_| lost_outcome())
    }

    /// Block for at most `timeout`; `None` if the load is still running
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<LoadOutcome> {
        if self.outcome.is_none() {
            self.outcome = match self.receiver.recv_timeout(timeout) {
                Ok(outcome) => Some(outcome),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(lost_outcome()),
            };
        }
        self.outcome.clone()
    }

    /// Outcome if the load already ended
    pub fn try_outcome(&mut self) -> Option<LoadOutcome> {
        if self.outcome.is_none() {
            self.outcome = match self.receiver.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(lost_outcome()),
            };
        }
        self.outcome.clone()
    }
}
