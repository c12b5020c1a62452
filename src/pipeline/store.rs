//! Index-keyed store of rendered pages with optional spill to disk

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::{Receiver, Sender};
use log::{debug, error, warn};
use lru::LruCache;
use tempfile::TempDir;

use super::error::PipelineError;
use super::types::{PageImage, PageLookup};

#[derive(Clone, Debug)]
enum Slot {
    /// Scheduled, not rendered yet
    Pending,
    /// Rendered; pixels are resident, spilled, or both
    Resolved { spill: Option<PathBuf> },
}

struct StoreInner {
    page_count: Option<usize>,
    slots: BTreeMap<usize, Slot>,
    resident: LruCache<usize, Arc<PageImage>>,
    /// Evicted pages whose spill failed, kept in memory over the limit
    pinned: BTreeMap<usize, Arc<PageImage>>,
    spill_dir: Option<TempDir>,
    subscribers: Vec<Sender<usize>>,
    /// Bumped on every clear so restores started before it are discarded
    generation: u64,
    /// Set once the run ends; no new pages may be scheduled until cleared
    sealed: bool,
}

/// Rendered pages keyed by index.
///
/// Single writer (the load worker), any number of readers. Once a page is
/// resolved it never changes until the store is cleared for a new document.
/// With a resident limit, least recently used pages are encoded to PNG in a
/// store-owned temp directory and decoded again on access.
pub struct PageStore {
    inner: Mutex<StoreInner>,
    max_resident: Option<NonZeroUsize>,
    spill_root: Option<PathBuf>,
}

impl PageStore {
    /// Create a store keeping at most `max_resident` decoded pages in memory
    /// (`None` keeps everything resident).
    #[must_use]
    pub fn new(max_resident: Option<usize>) -> Self {
        let max_resident = max_resident.and_then(NonZeroUsize::new);
        let resident = match max_resident {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };

        Self {
            inner: Mutex::new(StoreInner {
                page_count: None,
                slots: BTreeMap::new(),
                resident,
                pinned: BTreeMap::new(),
                spill_dir: None,
                subscribers: Vec::new(),
                generation: 0,
                sealed: false,
            }),
            max_resident,
            spill_root: None,
        }
    }

    /// Create spill directories under `root` instead of the system temp dir
    #[must_use]
    pub fn with_spill_root(mut self, root: Option<PathBuf>) -> Self {
        self.spill_root = root;
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every entry and spilled file
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.page_count = None;
        inner.slots.clear();
        inner.resident.clear();
        inner.pinned.clear();
        inner.generation = inner.generation.wrapping_add(1);
        inner.sealed = false;
        if let Some(dir) = inner.spill_dir.take() {
            debug!("Removing spill directory {:?}", dir.path());
        }
    }

    /// Fix the valid index range; entries outside it are dropped
    pub fn set_page_count(&self, count: usize) {
        let mut inner = self.lock();
        inner.page_count = Some(count);
        inner.slots.retain(|&page, _| page < count);
        inner.pinned.retain(|&page, _| page < count);
    }

    #[must_use]
    pub fn page_count(&self) -> Option<usize> {
        self.lock().page_count
    }

    /// Mark `page` as scheduled. Resolved pages are left alone.
    ///
    /// Returns false if the page is out of range or the store was sealed by
    /// [`PageStore::abandon_pending`].
    pub fn mark_pending(&self, page: usize) -> bool {
        let mut inner = self.lock();
        if inner.sealed || inner.page_count.is_some_and(|count| page >= count) {
            return false;
        }
        inner.slots.entry(page).or_insert(Slot::Pending);
        true
    }

    pub fn mark_pending_range(&self, pages: std::ops::Range<usize>) {
        let mut inner = self.lock();
        if inner.sealed {
            return;
        }
        for page in pages {
            if inner.page_count.is_some_and(|count| page >= count) {
                break;
            }
            inner.slots.entry(page).or_insert(Slot::Pending);
        }
    }

    /// Forget a pending page, e.g. after its render failed
    pub fn discard_pending(&self, page: usize) {
        let mut inner = self.lock();
        if matches!(inner.slots.get(&page), Some(Slot::Pending)) {
            inner.slots.remove(&page);
        }
    }

    /// Forget every pending page and refuse new ones until the store is
    /// cleared. Called when a run ends.
    pub fn abandon_pending(&self) {
        let mut inner = self.lock();
        inner
            .slots
            .retain(|_, slot| matches!(slot, Slot::Resolved { .. }));
        inner.sealed = true;
    }

    /// Whether pages can still be scheduled
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Insert the rendered image for `image.page`.
    ///
    /// Publishing an index outside the page range, or one that is already
    /// resolved, is a contract violation. Otherwise the page is stored. If
    /// making room spills another page and that spill fails, the evicted page
    /// stays in memory over the limit and the returned error names it.
    pub fn publish(&self, image: PageImage) -> Result<(), PipelineError> {
        let page = image.page;
        let mut inner = self.lock();

        if let Some(count) = inner.page_count {
            if page >= count {
                return Err(PipelineError::contract(format!(
                    "publish of page {page} out of range (document has {count} pages)"
                )));
            }
        }
        if matches!(inner.slots.get(&page), Some(Slot::Resolved { .. })) {
            return Err(PipelineError::contract(format!(
                "page {page} is already resolved"
            )));
        }

        inner.slots.insert(page, Slot::Resolved { spill: None });
        let spill_result = self.admit(&mut inner, page, Arc::new(image));

        inner.subscribers.retain(|tx| tx.send(page).is_ok());
        drop(inner);

        debug!("Published page {page}");
        spill_result
    }

    /// Non-blocking lookup; spilled pages are decoded transparently.
    ///
    /// Decode failures are logged and reported as `Absent`; use
    /// [`PageStore::try_get`] to see the error.
    #[must_use]
    pub fn get(&self, page: usize) -> PageLookup {
        match self.try_get(page) {
            Ok(lookup) => lookup,
            Err(e) => {
                error!("Failed to restore page {page}: {e}");
                PageLookup::Absent
            }
        }
    }

    pub fn try_get(&self, page: usize) -> Result<PageLookup, PipelineError> {
        loop {
            let (generation, path) = {
                let mut inner = self.lock();
                let spill = match inner.slots.get(&page).cloned() {
                    None => return Ok(PageLookup::Absent),
                    Some(Slot::Pending) => return Ok(PageLookup::Pending),
                    Some(Slot::Resolved { spill }) => spill,
                };
                if let Some(image) = inner.resident.get(&page) {
                    return Ok(PageLookup::Ready(Arc::clone(image)));
                }
                if let Some(image) = inner.pinned.get(&page) {
                    return Ok(PageLookup::Ready(Arc::clone(image)));
                }
                let Some(path) = spill else {
                    return Err(PipelineError::Spill {
                        page,
                        detail: "page is neither resident nor spilled".to_string(),
                    });
                };
                (inner.generation, path)
            };

            // Decode outside the lock; spilled files are immutable.
            let image = match decode_png(page, &path) {
                Ok(image) => Arc::new(image),
                Err(_) if self.lock().generation != generation => continue,
                Err(e) => return Err(e),
            };

            if let Some(lookup) = self.install_restored(page, generation, &path, image) {
                debug!("Restored page {page} from {path:?}");
                return Ok(lookup);
            }
            debug!("Store changed while restoring page {page}, looking up again");
        }
    }

    /// Admit a decoded spill file, unless the store moved on since `generation`
    /// or the page no longer points at `path`.
    fn install_restored(
        &self,
        page: usize,
        generation: u64,
        path: &Path,
        image: Arc<PageImage>,
    ) -> Option<PageLookup> {
        let mut inner = self.lock();
        let same_entry = matches!(
            inner.slots.get(&page),
            Some(Slot::Resolved { spill: Some(p) }) if p.as_path() == path
        );
        if inner.generation != generation || !same_entry {
            return None;
        }

        if let Some(existing) = inner.resident.get(&page) {
            return Some(PageLookup::Ready(Arc::clone(existing)));
        }
        if let Err(e) = self.admit(&mut inner, page, Arc::clone(&image)) {
            warn!("Spill while restoring page {page} failed: {e}");
        }
        Some(PageLookup::Ready(image))
    }

    /// Receive the index of every page published from now on
    #[must_use]
    pub fn subscribe(&self) -> Receiver<usize> {
        let (tx, rx) = flume::unbounded();
        self.lock().subscribers.push(tx);
        rx
    }

    #[must_use]
    pub fn is_resolved(&self, page: usize) -> bool {
        matches!(self.lock().slots.get(&page), Some(Slot::Resolved { .. }))
    }

    #[must_use]
    pub fn is_pending(&self, page: usize) -> bool {
        matches!(self.lock().slots.get(&page), Some(Slot::Pending))
    }

    /// Resolved page indices in ascending order
    #[must_use]
    pub fn resolved_pages(&self) -> Vec<usize> {
        self.lock()
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Resolved { .. }))
            .map(|(&page, _)| page)
            .collect()
    }

    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Resolved { .. }))
            .count()
    }

    /// Pages whose pixels are currently decoded in memory
    #[must_use]
    pub fn resident_count(&self) -> usize {
        let inner = self.lock();
        inner.resident.len() + inner.pinned.len()
    }

    /// Resolved pages that exist only on disk right now
    #[must_use]
    pub fn spilled_count(&self) -> usize {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .filter(|(page, slot)| {
                matches!(slot, Slot::Resolved { spill: Some(_) })
                    && !inner.resident.contains(*page)
            })
            .count()
    }

    /// Directory holding spilled pages, once anything has been spilled
    #[must_use]
    pub fn spill_dir(&self) -> Option<PathBuf> {
        self.lock()
            .spill_dir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
    }

    #[must_use]
    pub fn max_resident(&self) -> Option<usize> {
        self.max_resident.map(NonZeroUsize::get)
    }

    /// Put `image` in the resident set, spilling whatever falls out.
    fn admit(
        &self,
        inner: &mut StoreInner,
        page: usize,
        image: Arc<PageImage>,
    ) -> Result<(), PipelineError> {
        let Some((evicted_page, evicted)) = inner.resident.push(page, image) else {
            return Ok(());
        };
        if evicted_page == page {
            return Ok(());
        }

        let already_spilled = matches!(
            inner.slots.get(&evicted_page),
            Some(Slot::Resolved { spill: Some(_) })
        );
        if already_spilled {
            return Ok(());
        }

        match self.spill(inner, &evicted) {
            Ok(path) => {
                debug!("Spilled page {evicted_page} to {path:?}");
                inner
                    .slots
                    .insert(evicted_page, Slot::Resolved { spill: Some(path) });
                Ok(())
            }
            Err(e) => {
                error!("Keeping page {evicted_page} in memory over the limit: {e}");
                inner.pinned.insert(evicted_page, evicted);
                Err(e)
            }
        }
    }

    fn spill(&self, inner: &mut StoreInner, image: &PageImage) -> Result<PathBuf, PipelineError> {
        let as_spill_error = |e: std::io::Error| PipelineError::Spill {
            page: image.page,
            detail: e.to_string(),
        };

        if inner.spill_dir.is_none() {
            let mut builder = tempfile::Builder::new();
            builder.prefix("pageflow-spill-");
            let dir = match &self.spill_root {
                Some(root) => builder.tempdir_in(root),
                None => builder.tempdir(),
            }
            .map_err(as_spill_error)?;
            inner.spill_dir = Some(dir);
        }

        let dir = inner
            .spill_dir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| as_spill_error(std::io::Error::other("spill directory missing")))?;
        let path = dir.join(format!("page-{:05}.png", image.page));
        encode_png(image, &path)?;
        Ok(path)
    }
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PageStore")
            .field("page_count", &inner.page_count)
            .field("slots", &inner.slots.len())
            .field("resident", &inner.resident.len())
            .field("max_resident", &self.max_resident)
            .finish_non_exhaustive()
    }
}

fn encode_png(image: &PageImage, path: &Path) -> Result<(), PipelineError> {
    let spill_error = |detail: String| PipelineError::Spill {
        page: image.page,
        detail,
    };

    let file = File::create(path).map_err(|e| spill_error(e.to_string()))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), image.width, image.height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_compression(png::Compression::Fast);

    let mut writer = encoder
        .write_header()
        .map_err(|e| spill_error(e.to_string()))?;
    writer
        .write_image_data(&image.pixels)
        .map_err(|e| spill_error(e.to_string()))?;
    writer.finish().map_err(|e| spill_error(e.to_string()))
}

fn decode_png(page: usize, path: &Path) -> Result<PageImage, PipelineError> {
    let spill_error = |detail: String| PipelineError::Spill { page, detail };

    let file = File::open(path).map_err(|e| spill_error(e.to_string()))?;
    let decoder = png::Decoder::new(BufReader::new(file));
    let mut reader = decoder.read_info().map_err(|e| spill_error(e.to_string()))?;
    let mut pixels = vec![0; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut pixels)
        .map_err(|e| spill_error(e.to_string()))?;

    if info.color_type != png::ColorType::Rgba || info.bit_depth != png::BitDepth::Eight {
        return Err(spill_error(format!(
            "unexpected spill format {:?}/{:?}",
            info.color_type, info.bit_depth
        )));
    }
    pixels.truncate(info.buffer_size());

    Ok(PageImage {
        page,
        width: info.width,
        height: info.height,
        pixels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_image(page: usize) -> PageImage {
        let pixels = (0..4 * 3 * 4).map(|i| (i as u8).wrapping_add(page as u8)).collect();
        PageImage {
            page,
            width: 4,
            height: 3,
            pixels,
        }
    }

    #[test]
    fn lookup_states() {
        let store = PageStore::new(None);
        store.set_page_count(3);

        assert!(store.get(0).is_absent());
        store.mark_pending(0);
        assert!(store.get(0).is_pending());

        store.publish(test_image(0)).unwrap();
        let image = store.get(0).ready().unwrap();
        assert_eq!(*image, test_image(0));

        assert!(store.get(5).is_absent());
    }

    #[test]
    fn resolved_pages_are_immutable() {
        let store = PageStore::new(None);
        store.set_page_count(2);
        store.publish(test_image(1)).unwrap();

        let err = store.publish(test_image(1)).unwrap_err();
        assert!(matches!(err, PipelineError::ContractViolation { .. }));
        assert_eq!(*store.get(1).ready().unwrap(), test_image(1));
    }

    #[test]
    fn publish_out_of_range_is_rejected() {
        let store = PageStore::new(None);
        store.set_page_count(2);
        let err = store.publish(test_image(2)).unwrap_err();
        assert!(matches!(err, PipelineError::ContractViolation { .. }));
        assert_eq!(store.resolved_count(), 0);
    }

    #[test]
    fn pending_pages_can_be_discarded() {
        let store = PageStore::new(None);
        store.set_page_count(4);
        store.mark_pending_range(0..4);
        store.publish(test_image(0)).unwrap();

        store.discard_pending(1);
        assert!(store.get(1).is_absent());

        store.abandon_pending();
        assert!(store.get(2).is_absent());
        assert!(store.get(0).is_ready());
        assert_eq!(store.resolved_pages(), vec![0]);
    }

    #[test]
    fn eviction_spills_and_restores_transparently() {
        let root = TempDir::new().unwrap();
        let store = PageStore::new(Some(2)).with_spill_root(Some(root.path().to_path_buf()));
        store.set_page_count(5);

        for page in 0..5 {
            store.publish(test_image(page)).unwrap();
        }

        assert_eq!(store.resident_count(), 2);
        assert_eq!(store.spilled_count(), 3);
        assert_eq!(store.resolved_count(), 5);

        for page in 0..5 {
            let image = store.get(page).ready().unwrap();
            assert_eq!(*image, test_image(page));
            assert!(store.resident_count() <= 2);
        }

        let spill_dir = store.spill_dir().unwrap();
        assert!(spill_dir.exists());
        store.clear();
        assert!(!spill_dir.exists());
        assert!(store.get(0).is_absent());
    }

    #[test]
    fn subscribers_see_published_indices() {
        let store = PageStore::new(None);
        store.set_page_count(3);
        let rx = store.subscribe();

        store.publish(test_image(2)).unwrap();
        store.publish(test_image(0)).unwrap();

        let seen: Vec<usize> = rx.try_iter().collect();
        assert_eq!(seen, vec![2, 0]);
    }

    #[test]
    fn sealed_store_refuses_new_pending_pages() {
        let store = PageStore::new(None);
        store.set_page_count(3);
        assert!(store.mark_pending(0));

        store.abandon_pending();
        assert!(store.is_sealed());
        assert!(!store.mark_pending(1));
        store.mark_pending_range(0..3);
        assert!(!store.is_pending(0));
        assert!(!store.is_pending(1));

        store.clear();
        assert!(!store.is_sealed());
        assert!(store.mark_pending(1));
    }

    #[test]
    fn failed_spill_keeps_pages_in_memory() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("does-not-exist");
        let store = PageStore::new(Some(1)).with_spill_root(Some(missing));
        store.set_page_count(3);

        store.publish(test_image(0)).unwrap();
        let err = store.publish(test_image(1)).unwrap_err();
        assert!(matches!(err, PipelineError::Spill { page: 0, .. }));
        let err = store.publish(test_image(2)).unwrap_err();
        assert!(matches!(err, PipelineError::Spill { page: 1, .. }));

        assert_eq!(store.resolved_pages(), vec![0, 1, 2]);
        assert_eq!(store.resident_count(), 3);
        assert_eq!(store.spilled_count(), 0);
        for page in 0..3 {
            assert_eq!(*store.get(page).ready().unwrap(), test_image(page));
        }
    }

    #[test]
    fn restore_from_a_cleared_store_is_discarded() {
        let root = TempDir::new().unwrap();
        let store = PageStore::new(Some(1)).with_spill_root(Some(root.path().to_path_buf()));
        store.set_page_count(2);
        store.publish(test_image(0)).unwrap();
        store.publish(test_image(1)).unwrap();

        let (generation, path) = {
            let inner = store.lock();
            match inner.slots.get(&0) {
                Some(Slot::Resolved { spill: Some(path) }) => (inner.generation, path.clone()),
                other => panic!("page 0 should be spilled, got {other:?}"),
            }
        };
        let stale = Arc::new(decode_png(0, &path).unwrap());

        store.clear();
        store.set_page_count(2);
        let mut replacement = test_image(0);
        replacement.pixels.iter_mut().for_each(|b| *b = 0xAB);
        store.publish(replacement.clone()).unwrap();

        assert!(store.install_restored(0, generation, &path, stale).is_none());
        assert_eq!(*store.get(0).ready().unwrap(), replacement);
    }

    #[test]
    fn shrinking_page_count_drops_entries() {
        let store = PageStore::new(None);
        store.mark_pending(1);
        store.mark_pending(7);
        store.set_page_count(3);

        assert!(store.is_pending(1));
        assert!(!store.is_pending(7));
    }
}
