// ── History persistence worker ──
//
// Transports hand metrics to a bounded queue; one worker task drains it
// into `Store::append_history` on the blocking pool. A full queue drops
// the sample at the sender (see `EventEmitter::metrics`), so persistence
// can never stall the live event path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use homelink_api::MetricsSample;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Store, StoreError};

pub const HISTORY_QUEUE_CAPACITY: usize = 256;

/// Snapshot of the worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryStats {
    pub written: u64,
    pub failed: u64,
    /// Samples discarded because the store was already closed.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> HistoryStats {
        HistoryStats {
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct HistoryWriter {
    tx: mpsc::Sender<MetricsSample>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryWriter {
    /// Spawn the worker on the current runtime.
    pub fn spawn(store: Arc<Store>) -> Self {
        Self::with_capacity(store, HISTORY_QUEUE_CAPACITY)
    }

    pub fn with_capacity(store: Arc<Store>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(store, rx, Arc::clone(&counters), cancel.clone()));

        Self {
            tx,
            counters,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue handle for transports.
    pub fn sender(&self) -> mpsc::Sender<MetricsSample> {
        self.tx.clone()
    }

    pub fn stats(&self) -> HistoryStats {
        self.counters.snapshot()
    }

    /// Stop the worker after persisting whatever is already queued.
    pub async fn shutdown(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        self.cancel.cancel();
        if let Err(e) = task.await {
            warn!(error = %e, "history worker panicked");
        }
        let stats = self.stats();
        info!(
            written = stats.written,
            failed = stats.failed,
            dropped = stats.dropped,
            "history worker stopped"
        );
    }
}

impl Drop for HistoryWriter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    store: Arc<Store>,
    mut rx: mpsc::Receiver<MetricsSample>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let sample = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sample = rx.recv() => match sample {
                Some(sample) => sample,
                None => break,
            },
        };
        persist(&store, sample, &counters).await;
    }

    rx.close();
    while let Ok(sample) = rx.try_recv() {
        persist(&store, sample, &counters).await;
    }
}

async fn persist(store: &Arc<Store>, sample: MetricsSample, counters: &Counters) {
    let store = Arc::clone(store);
    let result = tokio::task::spawn_blocking(move || store.append_history(&sample)).await;

    match result {
        Ok(Ok(())) => {
            counters.written.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(StoreError::Closed)) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("store closed, history sample dropped");
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to persist history sample");
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "history write task failed");
        }
    }
}
