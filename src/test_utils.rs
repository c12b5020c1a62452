//! Deterministic engine and observers for exercising the pipeline without a
//! real document backend.
//!
//! A scripted document is a short text header such as
//! `pages=5;fail=1,3;size=40x60;delay_ms=2`. Only `pages` is required. Pages
//! listed in `fail` return an engine error, `size` fixes the native bitmap
//! size (otherwise the requested size is honoured), `delay_ms` slows every
//! render down.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::pipeline::{
    EngineFault, ErrorReport, PipelineEvent, ProgressEvent, ProgressSink, RasterDocument,
    RasterEngine, RawBitmap, StagedResource,
};

/// Builder for scripted document bytes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptedDoc {
    pub pages: usize,
    pub failing: Vec<usize>,
    pub native_size: Option<(u32, u32)>,
    pub delay_ms: u64,
}

impl ScriptedDoc {
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    pub fn failing(mut self, pages: &[usize]) -> Self {
        self.failing = pages.to_vec();
        self
    }

    pub fn native_size(mut self, width: u32, height: u32) -> Self {
        self.native_size = Some((width, height));
        self
    }

    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn to_header(&self) -> String {
        let mut header = format!("pages={}", self.pages);
        if !self.failing.is_empty() {
            let list: Vec<String> = self.failing.iter().map(ToString::to_string).collect();
            header.push_str(&format!(";fail={}", list.join(",")));
        }
        if let Some((w, h)) = self.native_size {
            header.push_str(&format!(";size={w}x{h}"));
        }
        if self.delay_ms > 0 {
            header.push_str(&format!(";delay_ms={}", self.delay_ms));
        }
        header
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_header().into_bytes()
    }

    /// Parse a header; anything else is not a scripted document
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut doc = Self::default();
        let mut saw_pages = false;

        for field in text.trim().split(';').filter(|f| !f.is_empty()) {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| format!("bad field {field:?}"))?;
            match key {
                "pages" => {
                    doc.pages = parse_num(value)?;
                    saw_pages = true;
                }
                "fail" => {
                    doc.failing = value
                        .split(',')
                        .filter(|v| !v.is_empty())
                        .map(parse_num)
                        .collect::<Result<_, _>>()?;
                }
                "size" => {
                    let (w, h) = value
                        .split_once('x')
                        .ok_or_else(|| format!("bad size {value:?}"))?;
                    doc.native_size = Some((parse_num(w)?, parse_num(h)?));
                }
                "delay_ms" => doc.delay_ms = parse_num(value)?,
                other => return Err(format!("unknown field {other:?}")),
            }
        }

        if saw_pages {
            Ok(doc)
        } else {
            Err("missing page count".to_string())
        }
    }
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("bad number {value:?}"))
}

/// Solid colour every scripted page is filled with
pub fn page_color(page: usize) -> [u8; 4] {
    let n = page as u8;
    [n.wrapping_mul(37), n.wrapping_mul(91).wrapping_add(13), 200, 0xFF]
}

#[derive(Default)]
struct GateState {
    reached: bool,
    released: bool,
}

/// Blocks a page render until released
#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.reached = true;
        self.changed.notify_all();
        while !state.released {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Test-side control of a gated page
#[derive(Clone)]
pub struct GateControl {
    gate: Arc<Gate>,
}

impl GateControl {
    /// Wait until a render of the gated page has started
    pub fn wait_reached(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.gate.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.reached {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .gate
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Let the gated render (and any later one) through
    pub fn release(&self) {
        let mut state = self.gate.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.released = true;
        self.gate.changed.notify_all();
    }
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    renders: AtomicUsize,
    gates: Mutex<HashMap<usize, Arc<Gate>>>,
}

/// [`RasterEngine`] that understands scripted document headers
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    counters: Arc<Counters>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `open` calls, including ones that failed to parse
    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Number of render calls that produced a bitmap
    pub fn renders(&self) -> usize {
        self.counters.renders.load(Ordering::SeqCst)
    }

    /// Make every render of `page` block until the returned gate is released
    pub fn gate_page(&self, page: usize) -> GateControl {
        let gate = Arc::new(Gate::default());
        self.counters
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page, Arc::clone(&gate));
        GateControl { gate }
    }
}

impl RasterEngine for ScriptedEngine {
    fn open(&self, resource: &StagedResource) -> Result<Box<dyn RasterDocument>, EngineFault> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);

        let mut text = String::new();
        resource
            .open_reader()
            .and_then(|mut reader| reader.read_to_string(&mut text))
            .map_err(|e| EngineFault::generic(e.to_string()))?;
        let script = ScriptedDoc::parse(&text).map_err(EngineFault::generic)?;

        Ok(Box::new(ScriptedDocument {
            script,
            counters: Arc::clone(&self.counters),
            closed: false,
        }))
    }
}

struct ScriptedDocument {
    script: ScriptedDoc,
    counters: Arc<Counters>,
    closed: bool,
}

impl RasterDocument for ScriptedDocument {
    fn page_count(&self) -> usize {
        self.script.pages
    }

    fn render(&self, page: usize, width: u32, height: u32) -> Result<RawBitmap, EngineFault> {
        let gate = self
            .counters
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&page)
            .cloned();
        if let Some(gate) = gate {
            gate.pass();
        }
        if self.script.delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.script.delay_ms));
        }
        if self.script.failing.contains(&page) {
            return Err(EngineFault::generic(format!("scripted failure on page {page}")));
        }

        let (w, h) = self.script.native_size.unwrap_or((width, height));
        let pixels = page_color(page).repeat(w as usize * h as usize);
        self.counters.renders.fetch_add(1, Ordering::SeqCst);
        Ok(RawBitmap::new(w, h, pixels))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Sink that keeps every event it sees
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn progress_events(&self) -> Vec<ProgressEvent> {
        self.events()
            .iter()
            .filter_map(PipelineEvent::as_progress)
            .copied()
            .collect()
    }

    pub fn error_reports(&self) -> Vec<ErrorReport> {
        self.events()
            .iter()
            .filter_map(PipelineEvent::as_error)
            .cloned()
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PipelineEvent::Progress(event));
    }

    fn on_error(&self, report: &ErrorReport) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PipelineEvent::Error(report.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_parse() {
        let doc = ScriptedDoc::new(5)
            .failing(&[1, 3])
            .native_size(40, 60)
            .delay_ms(2);
        assert_eq!(doc.to_header(), "pages=5;fail=1,3;size=40x60;delay_ms=2");
        assert_eq!(ScriptedDoc::parse(&doc.to_header()), Ok(doc));
    }

    #[test]
    fn garbage_is_not_a_script() {
        assert!(ScriptedDoc::parse("not a document").is_err());
        assert!(ScriptedDoc::parse("fail=1").is_err());
        assert!(ScriptedDoc::parse("pages=two").is_err());
    }
}
