//! # Request Dispatcher
//!
//! `RequestHandler` implementation in front of a [`NetworkRequester`].
//!
//! ## Strategy
//!
//! - Callers never block: requests go through a bounded queue with
//!   `try_send`; overflow is dropped and counted.
//! - A key requested again inside its de-duplication window is suppressed.
//!   The window doubles with every re-request of a key that is still
//!   unresolved, up to `2^max_backoff_exponent` times the base window.
//! - A single worker drains the queue and spawns one task per request.
//!   Each task waits for a per-shard semaphore permit, so at most
//!   `max_outstanding_per_shard` requests are in flight towards one shard
//!   while other shards keep being served.

use crate::config::{RequestDispatcherConfig, MAX_BACKOFF_EXPONENT};
use crate::metrics;
use crate::ports::{DataRequest, NetworkRequester, RequestHandler, RequestKind};
use parking_lot::Mutex;
use shared_types::{Hash, MetaHeader, ShardId, METACHAIN_SHARD_ID};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy)]
struct RecentRequest {
    last_sent: Instant,
    attempts: u32,
}

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub enqueued: AtomicU64,
    pub suppressed: AtomicU64,
    pub dropped: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub enqueued: u64,
    pub suppressed: u64,
    pub dropped: u64,
    pub sent: u64,
    pub failed: u64,
}

pub struct RequestDispatcher {
    self_shard: ShardId,
    epoch: AtomicU32,
    queue: mpsc::Sender<DataRequest>,
    recent: Mutex<HashMap<RequestKind, RecentRequest>>,
    config: RequestDispatcherConfig,
    stats: Arc<DispatcherStats>,
}

impl RequestDispatcher {
    /// Dispatcher plus the receiving end of its queue, with no worker.
    pub fn new(
        self_shard: ShardId,
        config: RequestDispatcherConfig,
    ) -> (Self, mpsc::Receiver<DataRequest>) {
        let (queue, rx) = mpsc::channel(config.queue_depth.max(1));
        let dispatcher = Self {
            self_shard,
            epoch: AtomicU32::new(0),
            queue,
            recent: Mutex::new(HashMap::new()),
            config,
            stats: Arc::new(DispatcherStats::default()),
        };
        (dispatcher, rx)
    }

    /// Dispatcher with its worker running on the current runtime.
    pub fn start(
        network: Arc<dyn NetworkRequester>,
        self_shard: ShardId,
        config: RequestDispatcherConfig,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (dispatcher, rx) = Self::new(self_shard, config);
        let worker = dispatcher.spawn_worker(rx, network);
        (Arc::new(dispatcher), worker)
    }

    /// Spawns the worker draining `rx` into `network`.
    ///
    /// The worker ends once every sender is dropped and the queue is empty.
    pub fn spawn_worker(
        &self,
        mut rx: mpsc::Receiver<DataRequest>,
        network: Arc<dyn NetworkRequester>,
    ) -> JoinHandle<()> {
        let per_shard = self.config.max_outstanding_per_shard.max(1);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let mut permits: HashMap<ShardId, Arc<Semaphore>> = HashMap::new();
            let mut in_flight = Vec::new();
            while let Some(request) = rx.recv().await {
                let semaphore = Arc::clone(
                    permits
                        .entry(request.kind.target_shard())
                        .or_insert_with(|| Arc::new(Semaphore::new(per_shard))),
                );
                let network = Arc::clone(&network);
                let stats = Arc::clone(&stats);
                in_flight.retain(|task: &JoinHandle<()>| !task.is_finished());
                // The permit is awaited inside the task: a saturated shard
                // must not hold back requests for other shards.
                in_flight.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    match network.send(request).await {
                        Ok(()) => {
                            stats.sent.fetch_add(1, Ordering::Relaxed);
                            metrics::record_request(&request.kind, "sent");
                        }
                        Err(e) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            metrics::record_request(&request.kind, "failed");
                            debug!(request = %request.kind, error = %e, "data request failed");
                        }
                    }
                }));
            }
            for task in in_flight {
                let _ = task.await;
            }
        })
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Forgets the backoff state of keys whose data arrived.
    fn resolved(&self, kinds: &[RequestKind]) {
        let mut recent = self.recent.lock();
        for kind in kinds {
            recent.remove(kind);
        }
    }

    fn window_for(&self, attempts: u32) -> Duration {
        let exponent = attempts
            .saturating_sub(1)
            .min(self.config.max_backoff_exponent)
            .min(MAX_BACKOFF_EXPONENT);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Duration::from_millis(self.config.dedup_window_ms.saturating_mul(factor))
    }

    /// Records an attempt for `kind`; false if it falls inside the window.
    fn admit(&self, kind: RequestKind) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock();
        if let Some(entry) = recent.get(&kind).copied() {
            if now.duration_since(entry.last_sent) < self.window_for(entry.attempts) {
                return false;
            }
        }
        let entry = recent.entry(kind).or_insert(RecentRequest {
            last_sent: now,
            attempts: 0,
        });
        entry.last_sent = now;
        entry.attempts = entry.attempts.saturating_add(1);

        if recent.len() > self.config.queue_depth.saturating_mul(4) {
            let horizon = self.window_for(self.config.max_backoff_exponent.saturating_add(1));
            recent.retain(|_, r| now.duration_since(r.last_sent) < horizon);
        }
        true
    }

    fn enqueue(&self, kind: RequestKind) {
        if !self.admit(kind) {
            self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
            metrics::record_request(&kind, "suppressed");
            trace!(request = %kind, "duplicate request suppressed");
            return;
        }
        let request = DataRequest {
            kind,
            epoch: self.epoch(),
        };
        match self.queue.try_send(request) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                metrics::record_request(&kind, "enqueued");
            }
            Err(_) => {
                // Let the key be retried as soon as the queue drains.
                self.recent.lock().remove(&kind);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_request(&kind, "dropped");
                warn!(request = %kind, "request queue full, request dropped");
            }
        }
    }
}

impl RequestHandler for RequestDispatcher {
    fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    fn request_shard_header(&self, shard: ShardId, hash: Hash) {
        self.enqueue(RequestKind::ShardHeader { shard, hash });
    }

    fn request_shard_header_by_nonce(&self, shard: ShardId, nonce: u64) {
        self.enqueue(RequestKind::ShardHeaderByNonce { shard, nonce });
    }

    fn request_meta_header(&self, hash: Hash) {
        self.enqueue(RequestKind::MetaHeader { hash });
    }

    fn request_meta_header_by_nonce(&self, nonce: u64) {
        self.enqueue(RequestKind::MetaHeaderByNonce { nonce });
    }

    fn request_mini_blocks(&self, meta_header: &MetaHeader) {
        for (hash, sender) in meta_header.mini_block_headers_with_dst(self.self_shard) {
            self.enqueue(RequestKind::MiniBlock { sender, hash });
        }
    }

    fn header_received(&self, shard: ShardId, nonce: u64, hash: Hash) {
        if shard == METACHAIN_SHARD_ID {
            self.resolved(&[
                RequestKind::MetaHeader { hash },
                RequestKind::MetaHeaderByNonce { nonce },
            ]);
        } else {
            self.resolved(&[
                RequestKind::ShardHeader { shard, hash },
                RequestKind::ShardHeaderByNonce { shard, nonce },
            ]);
        }
    }
}
