//! # Phase Controller
//!
//! Ordered execution of the measurement phases with an enforced barrier
//! between them. The schedule is fixed:
//!
//! ```text
//!   Baseline ──▶ DownloadWarmup ──▶ Download ──▶ UploadWarmup ──▶ Upload
//!                                                                   │
//!                       Complete ◀── Bidirectional ◀────────────────┘
//! ```
//!
//! Each transition ends the current phase, drives the [`PhaseBarrier`]
//! until no load stream remains registered, and only then publishes the
//! next phase's start event. Requesting any phase other than the legal
//! successor is the one fatal error in the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::barrier::PhaseBarrier;
use crate::error::EngineError;
use crate::events::{Direction, Event, EventBus, PhaseChange, PhaseEdge};

// ─── Phase Kind ─────────────────────────────────────────────────────────────

/// The seven phases of a measurement session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Baseline,
    DownloadWarmup,
    Download,
    UploadWarmup,
    Upload,
    Bidirectional,
    Complete,
}

impl PhaseKind {
    /// The phase that legally follows this one, if any.
    pub fn successor(self) -> Option<PhaseKind> {
        match self {
            PhaseKind::Baseline => Some(PhaseKind::DownloadWarmup),
            PhaseKind::DownloadWarmup => Some(PhaseKind::Download),
            PhaseKind::Download => Some(PhaseKind::UploadWarmup),
            PhaseKind::UploadWarmup => Some(PhaseKind::Upload),
            PhaseKind::Upload => Some(PhaseKind::Bidirectional),
            PhaseKind::Bidirectional => Some(PhaseKind::Complete),
            PhaseKind::Complete => None,
        }
    }

    /// Whether parameter discovery runs during this phase.
    pub fn is_warmup(self) -> bool {
        matches!(self, PhaseKind::DownloadWarmup | PhaseKind::UploadWarmup)
    }

    /// The direction a warmup explores, if this is a warmup.
    pub fn warmup_direction(self) -> Option<Direction> {
        match self {
            PhaseKind::DownloadWarmup => Some(Direction::Download),
            PhaseKind::UploadWarmup => Some(Direction::Upload),
            _ => None,
        }
    }

    /// Whether this phase intentionally carries load in the given direction.
    /// Bytes observed in any other combination are out-of-phase traffic.
    pub fn exercises(self, direction: Direction) -> bool {
        match (self, direction) {
            (PhaseKind::DownloadWarmup | PhaseKind::Download, Direction::Download) => true,
            (PhaseKind::UploadWarmup | PhaseKind::Upload, Direction::Upload) => true,
            (PhaseKind::Bidirectional, _) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PhaseKind::Baseline => "baseline",
            PhaseKind::DownloadWarmup => "download_warmup",
            PhaseKind::Download => "download",
            PhaseKind::UploadWarmup => "upload_warmup",
            PhaseKind::Upload => "upload",
            PhaseKind::Bidirectional => "bidirectional",
            PhaseKind::Complete => "complete",
        };
        f.write_str(name)
    }
}

// ─── Phase Records ──────────────────────────────────────────────────────────

/// One phase's start/end instants.
#[derive(Debug, Clone, Copy)]
pub struct PhaseRecord {
    pub kind: PhaseKind,
    pub started: Instant,
    pub ended: Option<Instant>,
}

impl PhaseRecord {
    /// Offsets relative to the session epoch, for the report.
    fn summarize(&self, epoch: Instant) -> PhaseSummary {
        PhaseSummary {
            phase: self.kind,
            start_s: self.started.duration_since(epoch).as_secs_f64(),
            end_s: self
                .ended
                .map(|e| e.duration_since(epoch).as_secs_f64()),
        }
    }
}

/// Serializable phase transition timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: PhaseKind,
    /// Seconds since session start.
    pub start_s: f64,
    /// Seconds since session start; `None` while the phase is running.
    pub end_s: Option<f64>,
}

// ─── Controller ─────────────────────────────────────────────────────────────

/// Drives the fixed phase schedule and owns the current-phase identity.
pub struct PhaseController {
    bus: EventBus,
    barrier: PhaseBarrier,
    epoch: Instant,
    current: Option<PhaseRecord>,
    history: Vec<PhaseRecord>,
    phase_tx: watch::Sender<PhaseKind>,
}

impl PhaseController {
    /// Create a controller. The watch receiver mirrors the current phase for
    /// components that tag samples (prober, throughput monitor).
    pub fn new(
        bus: EventBus,
        barrier: PhaseBarrier,
        epoch: Instant,
    ) -> (Self, watch::Receiver<PhaseKind>) {
        let (phase_tx, phase_rx) = watch::channel(PhaseKind::Baseline);
        let controller = PhaseController {
            bus,
            barrier,
            epoch,
            current: None,
            history: Vec::with_capacity(8),
            phase_tx,
        };
        (controller, phase_rx)
    }

    /// Start the given phase. Ends the current phase (if any), waits for the
    /// barrier to drain every load stream, then records and announces the new
    /// phase. Fails with [`EngineError::InvalidTransition`] unless `kind` is
    /// the next expected phase.
    pub async fn start_phase(&mut self, kind: PhaseKind) -> Result<(), EngineError> {
        let expected = match &self.current {
            Some(record) => record.kind.successor(),
            None => match self.history.last() {
                Some(record) => record.kind.successor(),
                None => Some(PhaseKind::Baseline),
            },
        };
        if expected != Some(kind) {
            return Err(EngineError::InvalidTransition {
                current: self.current.as_ref().map(|r| r.kind),
                requested: kind,
            });
        }

        if self.current.is_some() {
            self.end_phase().await;
        } else {
            // No phase to end, but the no-streams guarantee holds for the
            // first phase too.
            self.barrier.enforce().await;
        }

        self.begin(kind);
        Ok(())
    }

    /// End the current phase: record the end instant, publish the end event,
    /// then drive the barrier until the registry is empty.
    pub async fn end_phase(&mut self) {
        let Some(mut record) = self.current.take() else {
            return;
        };
        let now = Instant::now();
        record.ended = Some(now);
        tracing::info!(
            phase = %record.kind,
            elapsed_s = now.duration_since(record.started).as_secs_f64(),
            "phase ended"
        );
        self.bus.publish(Event::PhaseChange(PhaseChange {
            edge: PhaseEdge::End,
            phase: record.kind,
            time: now.duration_since(self.epoch).as_secs_f64(),
            phase_elapsed: now.duration_since(record.started).as_secs_f64(),
        }));
        self.history.push(record);

        self.barrier.enforce().await;
    }

    /// Skip directly to `Complete`, regardless of where the schedule stood.
    /// Used on external shutdown; the barrier still runs so no stream
    /// survives into the terminal phase.
    pub async fn complete(&mut self) {
        if matches!(self.current, Some(PhaseRecord { kind: PhaseKind::Complete, .. })) {
            return;
        }
        if self.current.is_some() {
            self.end_phase().await;
        } else {
            self.barrier.enforce().await;
        }
        self.begin(PhaseKind::Complete);
    }

    fn begin(&mut self, kind: PhaseKind) {
        let now = Instant::now();
        self.current = Some(PhaseRecord {
            kind,
            started: now,
            ended: None,
        });
        let _ = self.phase_tx.send(kind);
        tracing::info!(phase = %kind, "phase started");
        self.bus.publish(Event::PhaseChange(PhaseChange {
            edge: PhaseEdge::Start,
            phase: kind,
            time: now.duration_since(self.epoch).as_secs_f64(),
            phase_elapsed: 0.0,
        }));
    }

    /// The phase currently running, if any.
    pub fn current_phase(&self) -> Option<PhaseKind> {
        self.current.as_ref().map(|r| r.kind)
    }

    /// How long the current phase has been running.
    pub fn phase_elapsed(&self) -> Option<std::time::Duration> {
        self.current.as_ref().map(|r| r.started.elapsed())
    }

    /// Time since the session epoch.
    pub fn total_elapsed(&self) -> std::time::Duration {
        self.epoch.elapsed()
    }

    /// Every phase entered so far, in order, including the current one.
    pub fn phase_history(&self) -> Vec<PhaseSummary> {
        let mut out: Vec<PhaseSummary> = self
            .history
            .iter()
            .map(|r| r.summarize(self.epoch))
            .collect();
        if let Some(current) = &self.current {
            out.push(current.summarize(self.epoch));
        }
        out
    }
}
