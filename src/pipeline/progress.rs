//! Progress observers and ordered event delivery

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::Sender;

use super::error::{FailureKind, PipelineError};
use super::types::ProgressEvent;

/// Structured description of a failure, fatal or per-page
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: FailureKind,
    pub page: Option<usize>,
    pub message: String,
}

impl ErrorReport {
    #[must_use]
    pub fn from_error(error: &PipelineError) -> Self {
        Self {
            kind: error.kind(),
            page: error.page(),
            message: error.to_string(),
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

/// Everything a run tells its observers, in emission order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    Progress(ProgressEvent),
    Error(ErrorReport),
}

impl PipelineEvent {
    #[must_use]
    pub fn as_progress(&self) -> Option<&ProgressEvent> {
        match self {
            Self::Progress(event) => Some(event),
            Self::Error(_) => None,
        }
    }

    #[must_use]
    pub fn as_error(&self) -> Option<&ErrorReport> {
        match self {
            Self::Error(report) => Some(report),
            Self::Progress(_) => None,
        }
    }
}

/// Receives progress and failures of a run.
///
/// Callbacks run on the load worker thread, one at a time and in order. They
/// must not block for long and must not call back into the pipeline.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);

    fn on_error(&self, report: &ErrorReport) {
        let _ = report;
    }
}

/// Pollable sink: events are queued on a channel
impl ProgressSink for Sender<PipelineEvent> {
    fn on_progress(&self, event: ProgressEvent) {
        let _ = self.send(PipelineEvent::Progress(event));
    }

    fn on_error(&self, report: &ErrorReport) {
        let _ = self.send(PipelineEvent::Error(report.clone()));
    }
}

/// Adapts a closure taking `(is_loading, current_page, total_pages)`
pub struct Listener<F>(F);

impl<F> Listener<F>
where
    F: Fn(bool, Option<usize>, Option<usize>) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<F> ProgressSink for Listener<F>
where
    F: Fn(bool, Option<usize>, Option<usize>) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        (self.0)(event.is_loading, event.current_page, event.total_pages);
    }
}

/// Sink that ignores everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn on_progress(&self, _event: ProgressEvent) {}
}

struct BroadcastInner {
    sinks: Vec<Arc<dyn ProgressSink>>,
    history: Vec<PipelineEvent>,
}

/// Single ordering point for a run's events.
///
/// Every event is recorded and delivered under one lock, so all sinks see the
/// same total order. A sink attached mid-run first receives the recorded
/// history, then live events, with nothing lost or duplicated in between.
pub(crate) struct Broadcast {
    inner: Mutex<BroadcastInner>,
}

impl Broadcast {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(BroadcastInner {
                sinks: Vec::new(),
                history: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BroadcastInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(&self, sink: Arc<dyn ProgressSink>) {
        let mut inner = self.lock();
        for event in &inner.history {
            deliver(sink.as_ref(), event);
        }
        inner.sinks.push(sink);
    }

    pub(crate) fn progress(&self, event: ProgressEvent) {
        self.emit(PipelineEvent::Progress(event));
    }

    pub(crate) fn error(&self, report: ErrorReport) {
        self.emit(PipelineEvent::Error(report));
    }

    fn emit(&self, event: PipelineEvent) {
        let mut inner = self.lock();
        for sink in &inner.sinks {
            deliver(sink.as_ref(), &event);
        }
        inner.history.push(event);
    }

    pub(crate) fn history(&self) -> Vec<PipelineEvent> {
        self.lock().history.clone()
    }
}

fn deliver(sink: &dyn ProgressSink, event: &PipelineEvent) {
    match event {
        PipelineEvent::Progress(progress) => sink.on_progress(*progress),
        PipelineEvent::Error(report) => sink.on_error(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingSink;

    #[test]
    fn late_sink_gets_history_then_live_events() {
        let broadcast = Broadcast::new();
        let early = Arc::new(RecordingSink::new());
        broadcast.attach(early.clone());

        broadcast.progress(ProgressEvent::started());
        broadcast.progress(ProgressEvent::page(0, 2));

        let late = Arc::new(RecordingSink::new());
        broadcast.attach(late.clone());

        broadcast.error(ErrorReport::from_error(&PipelineError::render(1, "bad")));
        broadcast.progress(ProgressEvent::finished(None, Some(2)));

        assert_eq!(early.events(), late.events());
        assert_eq!(late.events().len(), 4);
        assert_eq!(broadcast.history(), late.events());
    }

    #[test]
    fn channel_sink_queues_events() {
        let (tx, rx) = flume::unbounded();
        tx.on_progress(ProgressEvent::started());
        tx.on_error(&ErrorReport::from_error(&PipelineError::Cancelled));

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_progress(), Some(&ProgressEvent::started()));
        assert_eq!(events[1].as_error().map(|r| r.kind), Some(FailureKind::Cancelled));
    }

    #[test]
    fn listener_receives_tuple() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let listener = Listener::new(move |loading, current, total| {
            captured.lock().unwrap().push((loading, current, total));
        });

        listener.on_progress(ProgressEvent::page(1, 3));
        listener.on_error(&ErrorReport::from_error(&PipelineError::Cancelled));

        assert_eq!(*seen.lock().unwrap(), vec![(true, Some(1), Some(3))]);
    }
}
