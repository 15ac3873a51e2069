//! Background rebuild worker.
//!
//! One dedicated thread waits on a single-slot channel. A rebuild request
//! is only sent by the caller that won the index's in-flight flag, so the
//! slot never holds more than one request and later triggers coalesce
//! into the rebuild already pending.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::error::{CoreError, CoreResult};
use crate::index::VectorIndex;

/// What happened to a rebuild request.
#[derive(Debug, Clone, PartialEq)]
pub enum RebuildOutcome {
    /// A new snapshot was published.
    Published {
        generation: u64,
        items: usize,
        partitions: usize,
        elapsed: Duration,
    },
    /// Another rebuild was already in flight; this request folded into it.
    Coalesced,
    /// Shutdown was requested; the partial snapshot was discarded.
    Abandoned,
}

#[derive(Debug)]
pub(crate) struct RebuildWorker {
    sender: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RebuildWorker {
    pub fn spawn(index: Weak<VectorIndex>) -> CoreResult<Self> {
        let (sender, receiver) = bounded(1);
        let handle = thread::Builder::new()
            .name("folio-rebuild".to_string())
            .spawn(move || run(index, receiver))
            .map_err(|e| CoreError::Internal {
                reason: format!("failed to spawn rebuild worker: {e}"),
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Hands a request to the worker. Returns `false` if it is gone.
    pub fn request(&self) -> bool {
        match &self.sender {
            Some(sender) => match sender.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => true,
                Err(TrySendError::Disconnected(())) => false,
            },
            None => false,
        }
    }

    /// Closes the channel and joins the thread.
    ///
    /// When called from the worker thread itself (the last index handle
    /// was dropped there) the thread is detached instead.
    pub fn stop(&mut self) {
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Rebuild worker panicked");
            }
        }
    }
}

impl Drop for RebuildWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(index: Weak<VectorIndex>, receiver: Receiver<()>) {
    for () in receiver.iter() {
        let Some(index) = index.upgrade() else {
            break;
        };
        index.run_background_rebuild();
    }
    tracing::debug!("Rebuild worker stopped");
}
