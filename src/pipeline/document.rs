//! Scoped ownership of an opened document and its staged bytes

use std::sync::Arc;

use log::{debug, warn};

use super::engine::{RasterDocument, RasterEngine};
use super::error::PipelineError;
use super::ledger::ResourceLedger;
use super::source::StagedResource;
use super::types::RawBitmap;

/// An open document plus the staged resource it was opened from.
///
/// Closing releases both. `close` is idempotent and also runs on drop, so
/// every exit path (including unwinding out of a render) releases the engine
/// handle and removes the staged file.
pub struct DocumentHandle {
    document: Option<Box<dyn RasterDocument>>,
    resource: Option<StagedResource>,
    page_count: usize,
    ledger: Arc<ResourceLedger>,
}

impl DocumentHandle {
    /// Open `resource` with `engine`.
    ///
    /// Unparsable and zero-page documents are `MalformedDocument`. The
    /// resource is released before the error is returned.
    pub fn open(engine: &dyn RasterEngine, resource: StagedResource) -> Result<Self, PipelineError> {
        if resource.is_empty() {
            return Err(PipelineError::malformed(format!(
                "{} is empty",
                resource.origin()
            )));
        }

        let document = engine
            .open(&resource)
            .map_err(|e| PipelineError::malformed(e.to_string()))?;

        let ledger = Arc::clone(resource.ledger());
        ledger.record_handle_open();

        let page_count = document.page_count();
        let mut handle = Self {
            document: Some(document),
            resource: Some(resource),
            page_count,
            ledger,
        };

        if page_count == 0 {
            let origin = handle.origin().to_string();
            handle.close();
            return Err(PipelineError::malformed(format!("{origin} has no pages")));
        }

        debug!("Opened {} with {} pages", handle.origin(), page_count);
        Ok(handle)
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.document.is_some()
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        self.resource
            .as_ref()
            .map_or("<closed>", StagedResource::origin)
    }

    /// Render one page.
    ///
    /// `index` outside `0..page_count` and rendering after `close` are
    /// contract violations; engine errors are `Render` failures scoped to the
    /// page and leave the handle usable.
    pub fn render_page(
        &self,
        index: usize,
        width: u32,
        height: u32,
    ) -> Result<RawBitmap, PipelineError> {
        let Some(document) = self.document.as_ref() else {
            return Err(PipelineError::contract(format!(
                "render of page {index} on a closed document"
            )));
        };

        if index >= self.page_count {
            return Err(PipelineError::contract(format!(
                "page {index} out of range (document has {} pages)",
                self.page_count
            )));
        }

        document
            .render(index, width, height)
            .map_err(|e| PipelineError::render(index, e.to_string()))
    }

    /// Release the engine handle and the staged resource
    pub fn close(&mut self) {
        if let Some(mut document) = self.document.take() {
            document.close();
            drop(document);
            self.ledger.record_handle_close();
            debug!("Closed document {}", self.origin());
        }

        if let Some(resource) = self.resource.take() {
            drop(resource);
        }
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        if self.document.is_some() {
            warn!("Document {} dropped without close", self.origin());
        }
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingMode;
    use crate::pipeline::source::{DocumentSource, Stager};
    use crate::test_utils::{ScriptedDoc, ScriptedEngine};

    fn stage(bytes: Vec<u8>) -> (StagedResource, Arc<ResourceLedger>) {
        let ledger = ResourceLedger::new();
        let stager = Stager::new(StagingMode::Memory, None, Arc::clone(&ledger));
        let staged = stager
            .stage(DocumentSource::from_bytes("doc", bytes))
            .unwrap();
        (staged, ledger)
    }

    #[test]
    fn open_reports_page_count() {
        let engine = ScriptedEngine::new();
        let (staged, ledger) = stage(ScriptedDoc::new(4).to_bytes());

        let mut handle = DocumentHandle::open(&engine, staged).unwrap();
        assert_eq!(handle.page_count(), 4);
        assert_eq!(ledger.live_handles(), 1);

        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert!(ledger.is_clean());
        assert_eq!(engine.closes(), 1);
    }

    #[test]
    fn zero_pages_is_malformed_and_released() {
        let engine = ScriptedEngine::new();
        let (staged, ledger) = stage(ScriptedDoc::new(0).to_bytes());

        let err = DocumentHandle::open(&engine, staged).err().unwrap();
        assert!(matches!(err, PipelineError::MalformedDocument { .. }));
        assert!(ledger.is_clean());
        assert_eq!(engine.opens(), 1);
        assert_eq!(engine.closes(), 1);
    }

    #[test]
    fn garbage_and_empty_inputs_are_malformed() {
        let engine = ScriptedEngine::new();

        let (staged, ledger) = stage(b"not a document".to_vec());
        let err = DocumentHandle::open(&engine, staged).err().unwrap();
        assert!(matches!(err, PipelineError::MalformedDocument { .. }));
        assert!(ledger.is_clean());

        let (staged, ledger) = stage(Vec::new());
        let err = DocumentHandle::open(&engine, staged).err().unwrap();
        assert!(matches!(err, PipelineError::MalformedDocument { .. }));
        assert!(ledger.is_clean());
        assert_eq!(engine.opens(), 1);
    }

    #[test]
    fn render_checks_range_and_isolates_page_failures() {
        let engine = ScriptedEngine::new();
        let (staged, _ledger) = stage(ScriptedDoc::new(3).failing(&[1]).to_bytes());
        let handle = DocumentHandle::open(&engine, staged).unwrap();

        let err = handle.render_page(3, 10, 10).unwrap_err();
        assert!(matches!(err, PipelineError::ContractViolation { .. }));

        let err = handle.render_page(1, 10, 10).unwrap_err();
        assert!(matches!(err, PipelineError::Render { page: 1, .. }));

        let bitmap = handle.render_page(2, 10, 12).unwrap();
        assert_eq!((bitmap.width, bitmap.height), (10, 12));
    }

    #[test]
    fn drop_closes_handle() {
        let engine = ScriptedEngine::new();
        let (staged, ledger) = stage(ScriptedDoc::new(2).to_bytes());
        let handle = DocumentHandle::open(&engine, staged).unwrap();
        drop(handle);
        assert!(ledger.is_clean());
        assert_eq!(engine.closes(), 1);
    }
}
