//! # Throughput Monitor
//!
//! Samples instantaneous per-direction throughput on a fixed cadence. Each
//! tick drains the per-stream byte deltas (terminated streams included via
//! the registry residuals), converts to Mbps against the measured tick
//! width, smooths with an EWMA, tags the sample with the current phase and
//! publishes it. A sample is flagged out-of-phase when bytes moved in a
//! direction the current phase is not meant to exercise.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::config::MonitorConfig;
use crate::events::{Direction, Event, EventBus};
use crate::manager::StreamManager;
use crate::phase::PhaseKind;
use crate::session::Recorder;

// ─── Sample ─────────────────────────────────────────────────────────────────

/// One throughput sample for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    /// Seconds since session start.
    pub time: f64,
    pub direction: Direction,
    /// Raw megabits per second over the tick.
    pub mbps: f64,
    /// EWMA-smoothed megabits per second.
    pub smoothed_mbps: f64,
    /// Bytes drained for this tick.
    pub bytes: u64,
    /// Phase the sample was taken in.
    pub phase: PhaseKind,
    /// Bytes moved in a direction the phase does not exercise.
    pub out_of_phase: bool,
}

/// Mbps over an interval: `bytes × 8 / (seconds × 1e6)`.
pub fn mbps(bytes: u64, elapsed_s: f64) -> f64 {
    if elapsed_s <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (elapsed_s * 1e6)
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    primed: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&alpha));
        Ewma {
            alpha,
            value: 0.0,
            primed: false,
        }
    }

    /// Fold in a sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if self.primed {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        } else {
            self.value = sample;
            self.primed = true;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

// ─── Monitor ────────────────────────────────────────────────────────────────

/// The sampling task. Spawned once per session; exits on shutdown.
pub(crate) struct ThroughputMonitor {
    pub(crate) manager: Arc<StreamManager>,
    pub(crate) bus: EventBus,
    pub(crate) recorder: Arc<Recorder>,
    pub(crate) phase_rx: watch::Receiver<PhaseKind>,
    pub(crate) cfg: MonitorConfig,
    pub(crate) epoch: Instant,
}

impl ThroughputMonitor {
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.cfg.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; use it to establish the window.
        tick.tick().await;
        let mut last = Instant::now();
        let mut smoothers = [
            Ewma::new(self.cfg.smoothing_alpha),
            Ewma::new(self.cfg.smoothing_alpha),
        ];

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let now = Instant::now();
            let elapsed_s = now.duration_since(last).as_secs_f64();
            last = now;
            let phase = *self.phase_rx.borrow();

            for (i, direction) in Direction::ALL.into_iter().enumerate() {
                let bytes = self.manager.drain_deltas(direction);
                let raw = mbps(bytes, elapsed_s);
                let smoothed = smoothers[i].update(raw);
                let sample = ThroughputSample {
                    time: now.duration_since(self.epoch).as_secs_f64(),
                    direction,
                    mbps: raw,
                    smoothed_mbps: smoothed,
                    bytes,
                    phase,
                    out_of_phase: bytes > 0 && !phase.exercises(direction),
                };
                self.recorder.push_throughput(sample);
                self.bus.publish(Event::Throughput(sample));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbps_arithmetic() {
        // 1 MB over one second: 8 Mbps.
        assert!((mbps(1_000_000, 1.0) - 8.0).abs() < 1e-9);
        // Same bytes over a 200 ms tick: 40 Mbps.
        assert!((mbps(1_000_000, 0.2) - 40.0).abs() < 1e-9);
        assert_eq!(mbps(0, 0.2), 0.0);
        assert_eq!(mbps(1_000, 0.0), 0.0);
    }

    #[test]
    fn ewma_first_sample_passes_through() {
        let mut ewma = Ewma::new(0.3);
        assert_eq!(ewma.update(100.0), 100.0);
    }

    #[test]
    fn ewma_smooths_with_alpha() {
        let mut ewma = Ewma::new(0.3);
        ewma.update(100.0);
        let v = ewma.update(0.0);
        assert!((v - 70.0).abs() < 1e-9);
    }

    #[test]
    fn ewma_converges_toward_constant_input() {
        let mut ewma = Ewma::new(0.3);
        for _ in 0..50 {
            ewma.update(42.0);
        }
        assert!((ewma.value() - 42.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_emits_tagged_samples() {
        use crate::config::ManagerConfig;
        use crate::phase::PhaseKind;

        let bus = EventBus::new(1024);
        let manager = StreamManager::new(
            ManagerConfig::default(),
            "http://127.0.0.1:1",
            bus.clone(),
            Instant::now(),
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        let (phase_tx, phase_rx) = watch::channel(PhaseKind::Upload);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Credit download bytes while the phase says Upload: the download
        // sample must be flagged out-of-phase.
        let id = manager.spawn_idle_stream(Direction::Download);
        manager
            .shared_for(id, Direction::Download)
            .unwrap()
            .credit(250_000);

        let monitor = ThroughputMonitor {
            manager: Arc::clone(&manager),
            bus: bus.clone(),
            recorder: Arc::clone(&recorder),
            phase_rx,
            cfg: MonitorConfig::default(),
            epoch: Instant::now(),
        };
        let mut rx = bus.subscribe();
        let task = tokio::spawn(monitor.run(shutdown_rx));

        // Let a few ticks elapse, then stop.
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        shutdown_tx.send(true).unwrap();
        let _ = task.await;

        let mut download_bytes = 0u64;
        let mut saw_out_of_phase = false;
        let mut upload_samples = 0usize;
        while let Ok(ev) = rx.try_recv() {
            if let Event::Throughput(s) = ev {
                match s.direction {
                    Direction::Download => {
                        download_bytes += s.bytes;
                        if s.out_of_phase {
                            saw_out_of_phase = true;
                        }
                        assert_eq!(s.phase, PhaseKind::Upload);
                    }
                    Direction::Upload => {
                        upload_samples += 1;
                        assert!(!s.out_of_phase, "no upload bytes moved");
                    }
                }
            }
        }
        assert_eq!(download_bytes, 250_000, "drained bytes must all be sampled");
        assert!(saw_out_of_phase);
        assert!(upload_samples > 0, "samples are produced every tick either way");
        drop(phase_tx);

        // The recorder saw the same series.
        assert!(!recorder.download_series().is_empty());
    }
}
