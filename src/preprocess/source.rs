//! Blob sources read by preprocess tasks
//!
//! A [`BlobResolver`] turns a [`BlobDescriptor`] into a [`ValueSource`]. A
//! source either exposes a ready-made file handle (the fast path) or is read
//! incrementally, signalling readiness through a [`ReadyWaker`] when a read
//! would otherwise block.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;

use crate::value::{BlobDescriptor, BlobId};

/// Result of a non-blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were copied into the buffer
    Read(usize),
    /// No data available yet; register a waker and try again later
    Pending,
    /// End of stream
    Eof,
}

/// One-shot readiness callback handed to a pending source
pub struct ReadyWaker {
    notify: Box<dyn FnOnce() + Send + 'static>,
}

impl ReadyWaker {
    pub fn new(notify: impl FnOnce() + Send + 'static) -> Self {
        Self {
            notify: Box::new(notify),
        }
    }

    /// Signal that the source can be read again
    pub fn wake(self) {
        (self.notify)()
    }
}

impl std::fmt::Debug for ReadyWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReadyWaker")
    }
}

/// Opaque stream reader for one out-of-band value
pub trait ValueSource: Send {
    /// Hand out a file handle for the whole stored value, if the source is
    /// file-backed. Called once, before any `read`.
    fn file_handle(&mut self) -> Option<File> {
        None
    }

    /// Read without blocking
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus>;

    /// Register a waker fired once the next `read` can make progress
    fn notify_when_ready(&mut self, waker: ReadyWaker);
}

/// Opens sources for blob descriptors
pub trait BlobResolver: Send + Sync {
    fn open(&self, blob: &BlobDescriptor) -> io::Result<Box<dyn ValueSource>>;
}

/// Source over bytes already in memory, always ready
pub struct MemorySource {
    data: Bytes,
    position: usize,
}

impl MemorySource {
    pub fn new(data: Bytes) -> Self {
        Self { data, position: 0 }
    }
}

impl ValueSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        let remaining = &self.data[self.position..];
        if remaining.is_empty() {
            return Ok(ReadStatus::Eof);
        }
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(ReadStatus::Read(n))
    }

    fn notify_when_ready(&mut self, waker: ReadyWaker) {
        waker.wake();
    }
}

/// Resolver serving blobs registered in memory
#[derive(Default)]
pub struct MemoryBlobResolver {
    blobs: RwLock<HashMap<BlobId, Bytes>>,
}

impl MemoryBlobResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the stored bytes of a blob
    pub fn insert(&self, id: BlobId, data: impl Into<Bytes>) {
        self.blobs.write().unwrap_or_else(|poisoned| poisoned.into_inner()).insert(id, data.into());
    }

    pub fn remove(&self, id: BlobId) -> Option<Bytes> {
        self.blobs.write().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(&id)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobResolver for MemoryBlobResolver {
    fn open(&self, blob: &BlobDescriptor) -> io::Result<Box<dyn ValueSource>> {
        let blobs = self.blobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match blobs.get(&blob.id) {
            Some(data) => Ok(Box::new(MemorySource::new(data.clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("blob {} is not registered", blob.id.0),
            )),
        }
    }
}

/// Source backed by a file on disk; offers its handle for the fast path
pub struct FileSource {
    file: Option<File>,
}

impl FileSource {
    pub fn new(file: File) -> Self {
        Self { file: Some(file) }
    }
}

impl ValueSource for FileSource {
    fn file_handle(&mut self) -> Option<File> {
        self.file.take()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(ReadStatus::Eof),
        };
        match file.read(buf)? {
            0 => Ok(ReadStatus::Eof),
            n => Ok(ReadStatus::Read(n)),
        }
    }

    fn notify_when_ready(&mut self, waker: ReadyWaker) {
        waker.wake();
    }
}

/// Resolver reading blobs from `<root>/<blob id>`
#[derive(Debug, Clone)]
pub struct DirectoryBlobResolver {
    root: PathBuf,
}

impl DirectoryBlobResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding a blob
    pub fn blob_path(&self, id: BlobId) -> PathBuf {
        self.root.join(id.0.to_string())
    }
}

impl BlobResolver for DirectoryBlobResolver {
    fn open(&self, blob: &BlobDescriptor) -> io::Result<Box<dyn ValueSource>> {
        let file = File::open(self.blob_path(blob.id))?;
        Ok(Box::new(FileSource::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn descriptor(id: u64) -> BlobDescriptor {
        BlobDescriptor {
            id: BlobId(id),
            size: None,
            compressed: false,
        }
    }

    #[test]
    fn test_memory_source_reads_in_chunks() {
        let mut source = MemorySource::new(Bytes::from_static(b"abcdef"));
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), ReadStatus::Read(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(source.read(&mut buf).unwrap(), ReadStatus::Read(2));
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(source.read(&mut buf).unwrap(), ReadStatus::Eof);
        assert!(source.file_handle().is_none());
    }

    #[test]
    fn test_memory_resolver_unknown_blob() {
        let resolver = MemoryBlobResolver::new();
        resolver.insert(BlobId(1), &b"x"[..]);
        assert_eq!(resolver.len(), 1);
        assert!(resolver.open(&descriptor(1)).is_ok());
        let err = resolver.open(&descriptor(2)).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_memory_source_wakes_immediately() {
        let mut source = MemorySource::new(Bytes::new());
        let woken = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&woken);
        source.notify_when_ready(ReadyWaker::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(woken.load(Ordering::SeqCst));
    }

    #[test]
    fn test_directory_resolver_exposes_file_handle() {
        let dir = tempdir().unwrap();
        let resolver = DirectoryBlobResolver::new(dir.path());
        std::fs::write(resolver.blob_path(BlobId(7)), b"stored").unwrap();

        let mut source = resolver.open(&descriptor(7)).unwrap();
        let mut file = source.file_handle().expect("file-backed source");
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "stored");

        assert!(resolver.open(&descriptor(8)).is_err());
    }
}
