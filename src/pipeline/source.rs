//! Staging of forward-only document streams into seekable resources

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use tempfile::NamedTempFile;

use super::error::PipelineError;
use super::ledger::ResourceLedger;
use crate::config::StagingMode;

/// Upper bound for pre-allocating a memory stage from a length hint
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// An input document: a byte stream that is read exactly once, front to back.
pub struct DocumentSource {
    origin: String,
    length_hint: Option<u64>,
    seekable: bool,
    reader: Box<dyn Read + Send>,
}

impl DocumentSource {
    /// Wrap an arbitrary stream of unknown length
    pub fn from_reader(origin: impl Into<String>, reader: impl Read + Send + 'static) -> Self {
        Self {
            origin: origin.into(),
            length_hint: None,
            seekable: false,
            reader: Box::new(reader),
        }
    }

    /// Wrap an in-memory document
    pub fn from_bytes(origin: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self {
            origin: origin.into(),
            length_hint: Some(bytes.len() as u64),
            seekable: true,
            reader: Box::new(Cursor::new(bytes)),
        }
    }

    /// Open a file on disk; the path becomes the origin
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            origin: path.to_string_lossy().into_owned(),
            length_hint: Some(len),
            seekable: true,
            reader: Box::new(file),
        })
    }

    #[must_use]
    pub fn with_length_hint(mut self, len: u64) -> Self {
        self.length_hint = Some(len);
        self
    }

    /// Identifier of the logical document, used for the re-entrancy guard
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn length_hint(&self) -> Option<u64> {
        self.length_hint
    }

    #[must_use]
    pub fn is_seekable(&self) -> bool {
        self.seekable
    }
}

impl std::fmt::Debug for DocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSource")
            .field("origin", &self.origin)
            .field("length_hint", &self.length_hint)
            .field("seekable", &self.seekable)
            .finish_non_exhaustive()
    }
}

/// Reader over a staged document
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

enum Backing {
    File(NamedTempFile),
    Memory(Arc<[u8]>),
}

/// Seekable, immutable copy of a document.
///
/// The backing temp file (if any) is removed when the resource is dropped.
pub struct StagedResource {
    origin: String,
    backing: Backing,
    len: u64,
    ledger: Arc<ResourceLedger>,
}

impl StagedResource {
    fn new(origin: String, backing: Backing, len: u64, ledger: Arc<ResourceLedger>) -> Self {
        ledger.record_stage_create();
        Self {
            origin,
            backing,
            len,
            ledger,
        }
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub(crate) fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// Size of the document in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file, `None` for memory-staged documents
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(file) => Some(file.path()),
            Backing::Memory(_) => None,
        }
    }

    /// Open a fresh reader positioned at the start of the document
    pub fn open_reader(&self) -> io::Result<Box<dyn ReadSeek>> {
        match &self.backing {
            Backing::File(file) => Ok(Box::new(file.reopen()?)),
            Backing::Memory(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
        }
    }

    /// Full contents of the document
    pub fn bytes(&self) -> io::Result<Arc<[u8]>> {
        match &self.backing {
            Backing::File(file) => Ok(std::fs::read(file.path())?.into()),
            Backing::Memory(bytes) => Ok(Arc::clone(bytes)),
        }
    }
}

impl Drop for StagedResource {
    fn drop(&mut self) {
        if let Some(path) = self.path() {
            debug!("Releasing staged file {:?} for {}", path, self.origin);
        }
        self.ledger.record_stage_release();
    }
}

impl std::fmt::Debug for StagedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedResource")
            .field("origin", &self.origin)
            .field("path", &self.path())
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Drains document streams into [`StagedResource`]s
#[derive(Clone, Debug)]
pub struct Stager {
    mode: StagingMode,
    dir: Option<PathBuf>,
    ledger: Arc<ResourceLedger>,
}

impl Stager {
    #[must_use]
    pub fn new(mode: StagingMode, dir: Option<PathBuf>, ledger: Arc<ResourceLedger>) -> Self {
        Self { mode, dir, ledger }
    }

    /// Read `source` to the end into a seekable backing store.
    ///
    /// On failure nothing is left behind: a partially written temp file is
    /// removed before the error is returned.
    pub fn stage(&self, source: DocumentSource) -> Result<StagedResource, PipelineError> {
        let DocumentSource {
            origin,
            length_hint,
            mut reader,
            ..
        } = source;

        match self.mode {
            StagingMode::TempFile => {
                let mut builder = tempfile::Builder::new();
                builder.prefix("pageflow-").suffix(".stage");
                let mut file = match &self.dir {
                    Some(dir) => builder.tempfile_in(dir)?,
                    None => builder.tempfile()?,
                };

                let len = match copy_all(&mut reader, file.as_file_mut()) {
                    Ok(len) => len,
                    Err(e) => {
                        warn!("Staging {} failed after partial write: {}", origin, e);
                        return Err(e.into());
                    }
                };

                debug!("Staged {} ({} bytes) to {:?}", origin, len, file.path());
                Ok(StagedResource::new(
                    origin,
                    Backing::File(file),
                    len,
                    Arc::clone(&self.ledger),
                ))
            }
            StagingMode::Memory => {
                let capacity = length_hint.unwrap_or(0).min(MAX_PREALLOCATION) as usize;
                let mut buf = Vec::with_capacity(capacity);
                reader.read_to_end(&mut buf)?;
                let len = buf.len() as u64;

                debug!("Staged {} ({} bytes) in memory", origin, len);
                Ok(StagedResource::new(
                    origin,
                    Backing::Memory(buf.into()),
                    len,
                    Arc::clone(&self.ledger),
                ))
            }
        }
    }
}

fn copy_all(reader: &mut dyn Read, file: &mut File) -> io::Result<u64> {
    let len = io::copy(reader, file)?;
    file.flush()?;
    file.rewind()?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FailingReader {
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::other("stream reset"));
            }
            self.served = true;
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&b"%PDF"[..n]);
            Ok(n)
        }
    }

    fn stager(mode: StagingMode, dir: &TempDir) -> (Stager, Arc<ResourceLedger>) {
        let ledger = ResourceLedger::new();
        let stager = Stager::new(mode, Some(dir.path().to_path_buf()), Arc::clone(&ledger));
        (stager, ledger)
    }

    fn dir_entries(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn temp_file_staging_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let (stager, ledger) = stager(StagingMode::TempFile, &dir);
        let source = DocumentSource::from_reader("stream", &b"hello pages"[..]);

        let staged = stager.stage(source).unwrap();
        let path = staged.path().unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(staged.len(), 11);
        assert_eq!(&*staged.bytes().unwrap(), b"hello pages");
        assert_eq!(ledger.live_staged(), 1);

        drop(staged);
        assert!(!path.exists());
        assert_eq!(dir_entries(&dir), 0);
        assert!(ledger.is_clean());
    }

    #[test]
    fn staged_resource_can_be_reopened() {
        let dir = TempDir::new().unwrap();
        for mode in [StagingMode::TempFile, StagingMode::Memory] {
            let (stager, _) = stager(mode, &dir);
            let staged = stager
                .stage(DocumentSource::from_bytes("bytes", b"abcdef".to_vec()))
                .unwrap();

            for _ in 0..2 {
                let mut reader = staged.open_reader().unwrap();
                let mut out = String::new();
                reader.read_to_string(&mut out).unwrap();
                assert_eq!(out, "abcdef");
            }
        }
    }

    #[test]
    fn failed_read_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let (stager, ledger) = stager(StagingMode::TempFile, &dir);
        let source = DocumentSource::from_reader("flaky", FailingReader { served: false });

        let err = stager.stage(source).unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
        assert_eq!(dir_entries(&dir), 0);
        assert_eq!(ledger.total_staged(), 0);
    }

    #[test]
    fn memory_staging_has_no_path() {
        let dir = TempDir::new().unwrap();
        let (stager, ledger) = stager(StagingMode::Memory, &dir);
        let staged = stager
            .stage(DocumentSource::from_reader("mem", &b"xyz"[..]).with_length_hint(3))
            .unwrap();

        assert!(staged.path().is_none());
        assert_eq!(&*staged.bytes().unwrap(), b"xyz");
        assert_eq!(dir_entries(&dir), 0);
        drop(staged);
        assert!(ledger.is_clean());
    }
}
