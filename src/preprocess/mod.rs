//! Background preprocessing of out-of-band values
//!
//! When a response carries values too large to inline, the remote side first
//! sends a preprocess message listing one blob per value. Each blob is
//! streamed by its own [`task`] on the shared [`pool::PreprocessPool`]; a
//! [`PreprocessSet`] counts the running tasks and produces the single
//! aggregated answer once the last one reports.

pub mod config;
pub mod pool;
pub mod source;
pub mod task;

pub use config::PreprocessConfig;
pub use pool::{PreprocessPool, SerialQueue};
pub use source::{
    BlobResolver, DirectoryBlobResolver, FileSource, MemoryBlobResolver, MemorySource, ReadStatus,
    ReadyWaker, ValueSource,
};
pub use task::{TaskReport, TaskState};

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::actor::context::LocalSender;
use crate::error::ErrorCode;
use crate::protocol::{PreprocessInfo, PreprocessOutcome, RequestId};
use task::{PreprocessTask, TaskHandle};

/// The tasks spawned for one preprocess message
pub(crate) struct PreprocessSet {
    request: RequestId,
    tasks: Vec<TaskHandle>,
    clone_indexes: Vec<u32>,
    finished: Vec<bool>,
    running: usize,
    first_error: Option<ErrorCode>,
    prepared: BTreeMap<u32, Bytes>,
    outcome_produced: bool,
}

impl PreprocessSet {
    /// Spawn one task per value
    pub(crate) fn spawn(
        request: RequestId,
        values: &[PreprocessInfo],
        pool: &PreprocessPool,
        resolver: &Arc<dyn BlobResolver>,
        config: &PreprocessConfig,
        reply: &LocalSender,
    ) -> Self {
        let mut tasks = Vec::with_capacity(values.len());
        for (slot, info) in values.iter().enumerate() {
            let task = PreprocessTask::new(
                request,
                slot,
                info.clone_index,
                info.blob.clone(),
                Arc::clone(resolver),
                config.chunk_bytes,
                config.max_value_bytes,
                reply.clone(),
            );
            tasks.push(task::spawn(task, pool.serial_queue()));
        }
        log::debug!("{}: spawned {} preprocess tasks", request, tasks.len());

        Self {
            request,
            clone_indexes: values.iter().map(|info| info.clone_index).collect(),
            finished: vec![false; tasks.len()],
            running: tasks.len(),
            tasks,
            first_error: None,
            prepared: BTreeMap::new(),
            outcome_produced: false,
        }
    }

    /// Record one task's report. Returns the aggregated outcome when the last
    /// running task reports, and never again afterwards.
    pub(crate) fn on_task_finished(
        &mut self,
        slot: usize,
        result: std::result::Result<Bytes, ErrorCode>,
    ) -> Option<PreprocessOutcome> {
        match self.finished.get(slot) {
            Some(false) => {}
            Some(true) => {
                log::warn!("{}: preprocess task {} reported twice", self.request, slot);
                return None;
            }
            None => {
                log::warn!("{}: report for unknown preprocess task {}", self.request, slot);
                return None;
            }
        }
        self.finished[slot] = true;
        self.tasks[slot].complete();
        self.running -= 1;

        match result {
            Ok(data) => {
                self.prepared.insert(self.clone_indexes[slot], data);
            }
            Err(code) => {
                if self.first_error.is_none() {
                    log::debug!("{}: preprocess task {} failed with {}", self.request, slot, code);
                    self.first_error = Some(code);
                }
            }
        }

        if self.running > 0 || self.outcome_produced {
            return None;
        }
        self.outcome_produced = true;
        Some(self.outcome())
    }

    fn outcome(&self) -> PreprocessOutcome {
        match self.first_error {
            Some(code) => PreprocessOutcome::Failed(code),
            None => PreprocessOutcome::Ready {
                prepared: self.prepared.keys().copied().collect(),
                total_bytes: self.prepared.values().map(|data| data.len() as u64).sum(),
            },
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.running == 0
    }

    pub(crate) fn error(&self) -> Option<ErrorCode> {
        self.first_error
    }

    /// Take the decoded bytes for one response position
    pub(crate) fn take_prepared(&mut self, clone_index: u32) -> Option<Bytes> {
        self.prepared.remove(&clone_index)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub(crate) fn task_states(&self) -> Vec<TaskState> {
        self.tasks.iter().map(TaskHandle::state).collect()
    }

    /// Detach every task still running
    pub(crate) fn detach(&self) {
        for (slot, task) in self.tasks.iter().enumerate() {
            if !self.finished[slot] {
                task.detach();
            }
        }
    }
}

impl Drop for PreprocessSet {
    fn drop(&mut self) {
        if self.running > 0 {
            log::debug!("{}: detaching {} running preprocess tasks", self.request, self.running);
            self.detach();
        }
    }
}
