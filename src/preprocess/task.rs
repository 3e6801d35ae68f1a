//! One preprocess task: stream a single out-of-band value into memory
//!
//! ```text
//!   Initial ──(file handle?)──────────────────────────┐
//!      │                                               ▼
//!      └──▶ WaitingForStreamReady ──(ready)──▶ read chunks ──▶ Finishing ──▶ Completed
//!                  ▲                                │            (owning context)
//!                  └────────────(pending)───────────┘
//! ```
//!
//! Every step runs on the task's serial queue. The result is handed to the
//! owning context as a [`LocalEvent`]; the owning context marks the task
//! completed once it has consumed the report.

use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use flate2::write::ZlibDecoder;

use super::pool::SerialQueue;
use super::source::{BlobResolver, ReadStatus, ReadyWaker, ValueSource};
use crate::actor::context::{LocalEvent, LocalSender};
use crate::error::ErrorCode;
use crate::protocol::RequestId;
use crate::value::BlobDescriptor;

/// Lifecycle of a preprocess task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Initial,
    WaitingForStreamReady,
    Finishing,
    Completed,
}

/// Result of one task, delivered to the owning context
#[derive(Debug)]
pub struct TaskReport {
    pub request: RequestId,
    /// Position of the task within its set
    pub slot: usize,
    pub clone_index: u32,
    pub result: std::result::Result<Bytes, ErrorCode>,
}

/// Accumulates decoded bytes, inflating them if the blob is compressed
enum Sink {
    Plain(Vec<u8>),
    Zlib(ZlibDecoder<Vec<u8>>),
}

impl Sink {
    fn new(compressed: bool) -> Self {
        if compressed {
            Sink::Zlib(ZlibDecoder::new(Vec::new()))
        } else {
            Sink::Plain(Vec::new())
        }
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Sink::Plain(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Sink::Zlib(decoder) => decoder.write_all(chunk),
        }
    }

    fn len(&self) -> usize {
        match self {
            Sink::Plain(buf) => buf.len(),
            Sink::Zlib(decoder) => decoder.get_ref().len(),
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Sink::Plain(buf) => Ok(buf),
            Sink::Zlib(decoder) => decoder.finish(),
        }
    }
}

enum Step {
    Wait,
    Finish(std::result::Result<Bytes, ErrorCode>),
}

pub(crate) struct PreprocessTask {
    request: RequestId,
    slot: usize,
    clone_index: u32,
    blob: BlobDescriptor,
    state: TaskState,
    resolver: Arc<dyn BlobResolver>,
    source: Option<Box<dyn ValueSource>>,
    sink: Option<Sink>,
    chunk: Vec<u8>,
    max_value_bytes: usize,
    detached: Arc<AtomicBool>,
    reply: LocalSender,
}

impl PreprocessTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request: RequestId,
        slot: usize,
        clone_index: u32,
        blob: BlobDescriptor,
        resolver: Arc<dyn BlobResolver>,
        chunk_bytes: usize,
        max_value_bytes: usize,
        reply: LocalSender,
    ) -> Self {
        Self {
            request,
            slot,
            clone_index,
            blob,
            state: TaskState::Initial,
            resolver,
            source: None,
            sink: None,
            chunk: vec![0u8; chunk_bytes.max(1)],
            max_value_bytes,
            detached: Arc::new(AtomicBool::new(false)),
            reply,
        }
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn start(&mut self) -> Step {
        if self.is_detached() {
            return Step::Finish(Err(ErrorCode::Abort));
        }

        if !self.blob.compressed {
            if let Some(size) = self.blob.size {
                if size > self.max_value_bytes as u64 {
                    return Step::Finish(Err(ErrorCode::QuotaExceeded));
                }
            }
        }

        let mut source = match self.resolver.open(&self.blob) {
            Ok(source) => source,
            Err(e) => {
                log::warn!("{}: failed to open blob {}: {}", self.request, self.blob.id.0, e);
                return Step::Finish(Err(ErrorCode::Io));
            }
        };
        self.sink = Some(Sink::new(self.blob.compressed));

        if let Some(file) = source.file_handle() {
            log::debug!("{}: reading blob {} through its file handle", self.request, self.blob.id.0);
            return Step::Finish(self.read_file(file));
        }

        self.source = Some(source);
        self.read_available()
    }

    fn read_file(&mut self, mut file: File) -> std::result::Result<Bytes, ErrorCode> {
        loop {
            if self.is_detached() {
                return Err(ErrorCode::Abort);
            }
            let n = file.read(&mut self.chunk).map_err(|e| {
                log::warn!("{}: read of blob {} failed: {}", self.request, self.blob.id.0, e);
                ErrorCode::Io
            })?;
            if n == 0 {
                return self.finish_sink();
            }
            self.absorb(n)?;
        }
    }

    fn read_available(&mut self) -> Step {
        loop {
            if self.is_detached() {
                return Step::Finish(Err(ErrorCode::Abort));
            }
            let source = match self.source.as_mut() {
                Some(source) => source,
                None => return Step::Finish(Err(ErrorCode::Unknown)),
            };
            match source.read(&mut self.chunk) {
                Ok(ReadStatus::Read(0)) | Ok(ReadStatus::Eof) => {
                    return Step::Finish(self.finish_sink());
                }
                Ok(ReadStatus::Read(n)) => {
                    if let Err(code) = self.absorb(n) {
                        return Step::Finish(Err(code));
                    }
                }
                Ok(ReadStatus::Pending) => return Step::Wait,
                Err(e) => {
                    log::warn!("{}: read of blob {} failed: {}", self.request, self.blob.id.0, e);
                    return Step::Finish(Err(ErrorCode::Io));
                }
            }
        }
    }

    fn absorb(&mut self, n: usize) -> std::result::Result<(), ErrorCode> {
        let sink = self.sink.as_mut().ok_or(ErrorCode::Unknown)?;
        sink.write(&self.chunk[..n]).map_err(|e| {
            log::warn!("{}: blob {} is corrupt: {}", self.request, self.blob.id.0, e);
            ErrorCode::DataClone
        })?;
        if sink.len() > self.max_value_bytes {
            return Err(ErrorCode::QuotaExceeded);
        }
        Ok(())
    }

    fn finish_sink(&mut self) -> std::result::Result<Bytes, ErrorCode> {
        let sink = self.sink.take().ok_or(ErrorCode::Unknown)?;
        let data = sink.finish().map_err(|e| {
            log::warn!("{}: blob {} is corrupt: {}", self.request, self.blob.id.0, e);
            ErrorCode::DataClone
        })?;
        if data.len() > self.max_value_bytes {
            return Err(ErrorCode::QuotaExceeded);
        }
        Ok(Bytes::from(data))
    }

    /// Hop back to the owning context with the result
    fn finish(&mut self, result: std::result::Result<Bytes, ErrorCode>) {
        self.state = TaskState::Finishing;
        self.source = None;
        self.sink = None;

        if self.is_detached() {
            log::debug!("{}: discarding result of detached preprocess task", self.request);
            self.release();
            return;
        }

        let report = TaskReport {
            request: self.request,
            slot: self.slot,
            clone_index: self.clone_index,
            result,
        };
        if self.reply.send(LocalEvent::PreprocessFinished(report)).is_err() {
            log::debug!("{}: owning context is gone, dropping preprocess result", self.request);
            self.release();
        }
    }

    fn release(&mut self) {
        self.state = TaskState::Completed;
        self.source = None;
        self.sink = None;
        self.chunk = Vec::new();
    }
}

/// Owner-side handle of a running task
#[derive(Clone)]
pub(crate) struct TaskHandle {
    task: Arc<Mutex<PreprocessTask>>,
    detached: Arc<AtomicBool>,
}

impl TaskHandle {
    #[cfg(test)]
    pub(crate) fn state(&self) -> TaskState {
        lock(&self.task).state
    }

    /// Stop reporting; the task finishes its current chunk and discards the result
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Mark the report as consumed and release buffers
    pub(crate) fn complete(&self) {
        lock(&self.task).release();
    }
}

fn lock(task: &Mutex<PreprocessTask>) -> MutexGuard<'_, PreprocessTask> {
    task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Start a task on its serial queue
pub(crate) fn spawn(task: PreprocessTask, queue: SerialQueue) -> TaskHandle {
    let detached = Arc::clone(&task.detached);
    let task = Arc::new(Mutex::new(task));
    let handle = TaskHandle {
        task: Arc::clone(&task),
        detached,
    };

    let job_task = Arc::clone(&task);
    let job_queue = queue.clone();
    if !queue.dispatch(Box::new(move || run(job_task, job_queue))) {
        log::warn!("Preprocess pool is gone, failing task immediately");
        lock(&task).finish(Err(ErrorCode::Unknown));
    }
    handle
}

fn run(cell: Arc<Mutex<PreprocessTask>>, queue: SerialQueue) {
    let mut guard = lock(&cell);
    let task = &mut *guard;

    let step = match task.state {
        TaskState::Initial => task.start(),
        TaskState::WaitingForStreamReady => task.read_available(),
        TaskState::Finishing | TaskState::Completed => return,
    };

    match step {
        Step::Wait => {
            task.state = TaskState::WaitingForStreamReady;
            let waker_cell = Arc::clone(&cell);
            let waker_queue = queue.clone();
            let waker = ReadyWaker::new(move || {
                let next_queue = waker_queue.clone();
                waker_queue.dispatch(Box::new(move || run(waker_cell, next_queue)));
            });
            if let Some(source) = task.source.as_mut() {
                source.notify_when_ready(waker);
                return;
            }
            task.finish(Err(ErrorCode::Unknown));
        }
        Step::Finish(result) => task.finish(result),
    }
}
