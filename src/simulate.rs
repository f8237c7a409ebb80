//! In-process run of the whole pipeline, used by `collab-sync simulate`.
//!
//! Two workers share one store, one document store and one bus, the way
//! two processes share Redis and the database. Each worker has its own
//! lock manager, flush worker, dispatcher and connection router. Every
//! writer holds one connection per document on one of the workers and
//! inserts `ops` small edits into every document.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastChannel, MemoryPubSub};
use crate::config::SyncConfig;
use crate::document::{ConnectionId, DocumentId, EditOperation, MemoryDocumentStore};
use crate::error::SyncResult;
use crate::lock::LockManager;
use crate::router::{ClientMessage, ConnectionRouter};
use crate::store::MemoryStore;
use crate::updates::{Dispatcher, FlushScheduler, FlushWorker, UpdateQueue};

const LOG_TARGET: &str = "collab_sync::simulate";

const WORKERS: usize = 2;
const SETTLE_POLL: Duration = Duration::from_millis(10);
const DELIVERY_GRACE: Duration = Duration::from_secs(1);

type Worker = FlushWorker<MemoryStore, MemoryDocumentStore, MemoryPubSub>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationOptions {
    pub docs: usize,
    pub writers: usize,
    pub ops: usize,
}

/// Outcome for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentReport {
    pub doc_id: String,
    pub version: u64,
    pub expected_version: u64,
    /// Document length in chars
    pub text_len: usize,
    pub acks: usize,
    pub updates: usize,
    pub resyncs: usize,
}

impl DocumentReport {
    pub fn is_complete(&self) -> bool {
        self.version == self.expected_version
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub documents: Vec<DocumentReport>,
    pub elapsed: Duration,
}

impl SimulationReport {
    pub fn is_complete(&self) -> bool {
        self.documents.iter().all(DocumentReport::is_complete)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MessageCounts {
    acks: usize,
    updates: usize,
    resyncs: usize,
}

struct SimWorker {
    worker: Arc<Worker>,
    scheduler: Arc<FlushScheduler<MemoryStore, MemoryDocumentStore, MemoryPubSub>>,
    router: ConnectionRouter<MemoryPubSub>,
}

/// Run the simulation and wait (bounded by `settle_timeout`) for every
/// document to reach `writers * ops`.
pub async fn run_simulation(
    config: &SyncConfig,
    options: SimulationOptions,
    settle_timeout: Duration,
) -> SyncResult<SimulationReport> {
    let started = tokio::time::Instant::now();
    let store = Arc::new(MemoryStore::new());
    let documents = Arc::new(MemoryDocumentStore::new());
    let broadcast = BroadcastChannel::new(Arc::new(MemoryPubSub::new()));
    let queue = UpdateQueue::new(Arc::clone(&store), config.queue);

    let doc_ids: Vec<DocumentId> = (0..options.docs)
        .map(|n| DocumentId::new(format!("doc-{}", n)))
        .collect();
    for doc_id in &doc_ids {
        documents.create(doc_id, "");
    }

    let mut workers = Vec::with_capacity(WORKERS);
    let mut dispatchers = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        let locks = Arc::new(LockManager::new(Arc::clone(&store), config.lock));
        let worker = Arc::new(FlushWorker::new(
            Arc::clone(&store),
            Arc::clone(&documents),
            locks,
            broadcast.clone(),
            config.queue,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&worker),
            config.sweep_interval,
        ));
        dispatchers.push(dispatcher.spawn());
        workers.push(SimWorker {
            scheduler: Arc::new(FlushScheduler::with_delay(
                Arc::clone(&worker),
                config.flush_delay,
            )),
            worker,
            router: ConnectionRouter::new(broadcast.clone()),
        });
    }

    // One connection per (writer, document); the channel outlives the run.
    let capacity = options.writers * options.ops + 16;
    let mut counters: Vec<(usize, JoinHandle<MessageCounts>)> = Vec::new();
    for writer in 0..options.writers {
        let router = &workers[writer % WORKERS].router;
        for (index, doc_id) in doc_ids.iter().enumerate() {
            let (tx, rx) = mpsc::channel(capacity);
            router
                .register_connection(doc_id.clone(), connection_id(writer, doc_id), Arc::new(tx))
                .await?;
            counters.push((index, tokio::spawn(count_messages(rx))));
        }
    }

    let mut writers = Vec::with_capacity(options.writers);
    for writer in 0..options.writers {
        let queue = queue.clone();
        let scheduler = Arc::clone(&workers[writer % WORKERS].scheduler);
        let doc_ids = doc_ids.clone();
        let ops = options.ops;
        writers.push(tokio::spawn(async move {
            for k in 0..ops {
                for doc_id in &doc_ids {
                    let op = EditOperation::insert(0, format!("{}:{};", writer, k), 0)
                        .with_source(connection_id(writer, doc_id));
                    queue.enqueue(doc_id, &op).await?;
                    scheduler.schedule(doc_id.clone());
                }
                tokio::task::yield_now().await;
            }
            SyncResult::Ok(())
        }));
    }
    for handle in writers {
        match handle.await {
            Ok(result) => result?,
            Err(e) => log::error!(target: LOG_TARGET, "Writer task failed: {}", e),
        }
    }

    let expected_version = (options.writers * options.ops) as u64;
    let settled = tokio::time::timeout(
        settle_timeout,
        wait_for_versions(&workers[0].worker, &documents, &doc_ids, expected_version),
    )
    .await
    .is_ok();
    if !settled {
        log::warn!(
            target: LOG_TARGET,
            "Documents did not reach version {} within {:?}",
            expected_version,
            settle_timeout
        );
    }

    let delivered = tokio::time::timeout(
        DELIVERY_GRACE,
        wait_for_delivery(&workers, &doc_ids, expected_version),
    )
    .await
    .is_ok();
    if !delivered {
        log::debug!(target: LOG_TARGET, "Not every router saw the final version");
    }

    for handle in dispatchers {
        handle.shutdown().await;
    }
    for worker in &workers {
        worker.scheduler.cancel_all();
        worker.router.shutdown();
    }

    let mut reports: Vec<DocumentReport> = doc_ids
        .iter()
        .map(|doc_id| {
            let snapshot = documents.snapshot(doc_id);
            DocumentReport {
                doc_id: doc_id.to_string(),
                version: snapshot.as_ref().map_or(0, |s| s.version),
                expected_version,
                text_len: snapshot.map_or(0, |s| s.text().chars().count()),
                ..DocumentReport::default()
            }
        })
        .collect();
    for (index, handle) in counters {
        let counts = match handle.await {
            Ok(counts) => counts,
            Err(e) => {
                log::error!(target: LOG_TARGET, "Connection task failed: {}", e);
                continue;
            }
        };
        let report = &mut reports[index];
        report.acks += counts.acks;
        report.updates += counts.updates;
        report.resyncs += counts.resyncs;
    }

    Ok(SimulationReport {
        documents: reports,
        elapsed: started.elapsed(),
    })
}

fn connection_id(writer: usize, doc_id: &DocumentId) -> ConnectionId {
    ConnectionId::new(format!("writer-{}/{}", writer, doc_id))
}

async fn count_messages(mut rx: mpsc::Receiver<ClientMessage>) -> MessageCounts {
    let mut counts = MessageCounts::default();
    while let Some(message) = rx.recv().await {
        match message {
            ClientMessage::VersionAck { .. } => counts.acks += 1,
            ClientMessage::ApplyUpdate { .. } => counts.updates += 1,
            ClientMessage::ForceResync { .. } => counts.resyncs += 1,
        }
    }
    counts
}

async fn wait_for_versions(
    worker: &Worker,
    documents: &MemoryDocumentStore,
    doc_ids: &[DocumentId],
    expected_version: u64,
) {
    loop {
        let mut done = true;
        for doc_id in doc_ids {
            let version = documents.snapshot(doc_id).map_or(0, |s| s.version);
            let pending = worker.pending_len(doc_id).await.unwrap_or(1);
            if version < expected_version || pending > 0 {
                done = false;
                break;
            }
        }
        if done {
            return;
        }
        tokio::time::sleep(SETTLE_POLL).await;
    }
}

async fn wait_for_delivery(workers: &[SimWorker], doc_ids: &[DocumentId], expected_version: u64) {
    loop {
        let delivered = workers.iter().all(|worker| {
            doc_ids.iter().all(|doc_id| {
                !worker.router.is_subscribed(doc_id)
                    || worker.router.last_version(doc_id) == Some(expected_version)
            })
        });
        if delivered {
            return;
        }
        tokio::time::sleep(SETTLE_POLL).await;
    }
}
