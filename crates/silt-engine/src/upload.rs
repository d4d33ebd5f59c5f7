//! # Upload Stream Driver
//!
//! One upload stream keeps up to `pending_depth` concurrent `POST /upload`
//! requests in flight, fed from a per-stream queue of pre-filled random
//! buffers. The queue is refilled whenever it runs low or the stream has
//! made no progress for a while. During a warmup the buffer size ramps
//! logarithmically from 4 KiB to 64 KiB across the first thirty buffers so
//! a slow link is not swamped before discovery has a say; outside warmups
//! every buffer is full size.
//!
//! Bytes are credited only when a POST completes with a 2xx. A chunk that
//! exhausts its retries terminates the stream; the warmup's next reconcile
//! pass replaces it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};

use crate::config::UploadConfig;
use crate::events::Direction;
use crate::manager::{StreamManager, StreamShared};

// ─── Buffer Queue ───────────────────────────────────────────────────────────

/// Bounded queue of pre-filled upload buffers with slow-start sizing.
pub(crate) struct BufferQueue {
    buffers: VecDeque<Bytes>,
    /// Buffers ever produced, across refills.
    produced: u32,
    warmup: bool,
    floor: usize,
    full: usize,
    span: u32,
    capacity: usize,
    low_water: usize,
    refill_idle: Duration,
    last_progress: Instant,
}

impl BufferQueue {
    pub(crate) fn new(cfg: &UploadConfig, warmup: bool) -> Self {
        let mut queue = BufferQueue {
            buffers: VecDeque::with_capacity(cfg.queue_capacity),
            produced: 0,
            warmup,
            floor: cfg.slow_start_floor,
            full: cfg.buffer_bytes,
            span: cfg.slow_start_span,
            capacity: cfg.queue_capacity,
            low_water: cfg.queue_low_water,
            refill_idle: cfg.refill_idle,
            last_progress: Instant::now(),
        };
        queue.refill();
        queue
    }

    /// Size of the next buffer to generate.
    pub(crate) fn next_size(&self) -> usize {
        if !self.warmup || self.produced >= self.span {
            return self.full;
        }
        let ratio = self.full as f64 / self.floor as f64;
        let size = self.floor as f64 * ratio.powf(f64::from(self.produced) / f64::from(self.span));
        (size as usize).min(self.full)
    }

    /// Top the queue back up to capacity with fresh random buffers.
    pub(crate) fn refill(&mut self) {
        let mut rng = rand::rng();
        while self.buffers.len() < self.capacity {
            let mut buf = vec![0u8; self.next_size()];
            rng.fill_bytes(&mut buf);
            self.buffers.push_back(Bytes::from(buf));
            self.produced += 1;
        }
        self.last_progress = Instant::now();
    }

    pub(crate) fn pop(&mut self) -> Option<Bytes> {
        self.buffers.pop_front()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Low-water or idle predicate.
    pub(crate) fn needs_refill(&self, now: Instant) -> bool {
        self.buffers.len() < self.low_water
            || now.duration_since(self.last_progress) >= self.refill_idle
    }

    pub(crate) fn note_progress(&mut self, now: Instant) {
        self.last_progress = now;
    }
}

// ─── Driver ─────────────────────────────────────────────────────────────────

pub(crate) struct UploadCtx {
    pub(crate) manager: Arc<StreamManager>,
    pub(crate) shared: Arc<StreamShared>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) is_warmup: bool,
    /// Live pending-depth, shared across the direction's streams.
    pub(crate) depth: watch::Receiver<u32>,
}

pub(crate) async fn run(mut ctx: UploadCtx) {
    let id = ctx.shared.id();
    let cfg = ctx.manager.upload_cfg().clone();
    let url = format!("{}/upload", ctx.manager.origin());
    let mut queue = BufferQueue::new(&cfg, ctx.is_warmup);
    let mut inflight: JoinSet<bool> = JoinSet::new();
    let mut housekeeping = interval(Duration::from_millis(50));
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'drive: loop {
        if *ctx.cancel.borrow() {
            break;
        }

        let depth = (*ctx.depth.borrow()).max(1) as usize;
        while inflight.len() < depth {
            let Some(buf) = queue.pop() else { break };
            inflight.spawn(post_chunk(
                ctx.manager.http().clone(),
                url.clone(),
                Arc::clone(&ctx.shared),
                buf,
                cfg.clone(),
            ));
        }
        if queue.needs_refill(Instant::now()) {
            queue.refill();
        }

        tokio::select! {
            _ = ctx.cancel.changed() => break 'drive,
            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                match done {
                    Ok(true) => queue.note_progress(Instant::now()),
                    Ok(false) => {
                        // Retries exhausted; give the stream up. The
                        // manager's maintenance pass respawns it.
                        tracing::debug!(stream_id = id, "upload stream giving up after failed chunk");
                        break 'drive;
                    }
                    Err(_) => break 'drive,
                }
            }
            _ = housekeeping.tick() => {}
        }
    }

    inflight.abort_all();
    ctx.manager.finish_stream(id, Direction::Upload);
}

/// POST one buffer with retries. Returns whether the chunk was credited.
async fn post_chunk(
    client: reqwest::Client,
    url: String,
    shared: Arc<StreamShared>,
    buf: Bytes,
    cfg: UploadConfig,
) -> bool {
    let len = buf.len();
    for attempt in 0..=cfg.retries {
        if attempt > 0 {
            sleep(cfg.retry_backoff).await;
        }
        let send = client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .header("Cache-Control", "no-store")
            .header("X-Stream-ID", shared.id().to_string())
            .header("X-Priority", "bulk")
            .header("X-Retry", attempt.to_string())
            .body(buf.clone())
            .send();
        match timeout(cfg.post_timeout, send).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                shared.credit(len);
                return true;
            }
            Ok(Ok(resp)) => {
                tracing::debug!(
                    stream_id = shared.id(),
                    status = %resp.status(),
                    attempt,
                    "upload chunk rejected"
                );
            }
            Ok(Err(err)) => {
                tracing::debug!(stream_id = shared.id(), error = %err, attempt, "upload chunk failed");
            }
            Err(_) => {
                tracing::debug!(stream_id = shared.id(), attempt, "upload chunk timed out");
            }
        }
    }
    false
}
