//! # Session
//!
//! Owns everything for one measurement run: the bus, the stream manager,
//! the phase controller, the background prober and monitor tasks, and the
//! recorder the samples land in. Drives the fixed schedule
//! Baseline → DownloadWarmup → Download → UploadWarmup → Upload →
//! Bidirectional → Complete, running parameter discovery through each
//! warmup and freezing its causal optimum for the load phase that follows.
//!
//! External code interacts through three surfaces: [`Session::run`] for the
//! final [`SessionReport`], [`Session::bus`] for live events (and for
//! injecting the accepted control events), and [`SessionHandle::shutdown`]
//! to cancel at any point — cancellation drains the registry through the
//! barrier and still yields a well-formed partial report.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, Instant};

use crate::barrier::PhaseBarrier;
use crate::config::EngineConfig;
use crate::discovery::{Discovery, DiscoveryOutcome, Measurement, ParameterSet, StepAction, Trial};
use crate::error::EngineError;
use crate::events::{Direction, Event, EventBus};
use crate::manager::StreamManager;
use crate::phase::{PhaseController, PhaseKind, PhaseSummary};
use crate::probe::{LatencyProber, LatencySample};
use crate::throughput::{ThroughputMonitor, ThroughputSample};

// ─── Recorder ───────────────────────────────────────────────────────────────

/// Session-owned store for every latency and throughput sample.
#[derive(Default)]
pub struct Recorder {
    latency: Mutex<Vec<LatencySample>>,
    throughput: Mutex<Vec<ThroughputSample>>,
}

impl Recorder {
    pub(crate) fn push_latency(&self, sample: LatencySample) {
        self.latency.lock().unwrap().push(sample);
    }

    pub(crate) fn push_throughput(&self, sample: ThroughputSample) {
        self.throughput.lock().unwrap().push(sample);
    }

    /// Full latency series since session start.
    pub fn latency_series(&self) -> Vec<LatencySample> {
        self.latency.lock().unwrap().clone()
    }

    /// Full tagged download throughput series.
    pub fn download_series(&self) -> Vec<ThroughputSample> {
        self.series(Direction::Download)
    }

    /// Full tagged upload throughput series.
    pub fn upload_series(&self) -> Vec<ThroughputSample> {
        self.series(Direction::Upload)
    }

    fn series(&self, direction: Direction) -> Vec<ThroughputSample> {
        self.throughput
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.direction == direction)
            .copied()
            .collect()
    }

    /// Mean of the non-synthetic round trips recorded in one phase.
    pub fn mean_latency_ms(&self, phase: PhaseKind) -> Option<f64> {
        let samples = self.latency.lock().unwrap();
        let mut sum = 0.0;
        let mut n = 0usize;
        for s in samples.iter().filter(|s| s.phase == phase && !s.timeout) {
            sum += s.rtt_ms;
            n += 1;
        }
        (n > 0).then(|| sum / n as f64)
    }
}

// ─── Report ─────────────────────────────────────────────────────────────────

/// Everything a session surfaces when it finishes.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Wall-clock session start.
    pub started_at: DateTime<Utc>,
    /// Baseline latency the thresholds were derived from.
    pub baseline_latency_ms: f64,
    /// Whether the session was cancelled before running the full schedule.
    pub interrupted: bool,
    /// Phase transition timestamps, in entry order.
    pub phases: Vec<PhaseSummary>,
    /// Full tagged latency series.
    pub latency: Vec<LatencySample>,
    /// Full tagged throughput series, per direction.
    pub throughput_download: Vec<ThroughputSample>,
    pub throughput_upload: Vec<ThroughputSample>,
    /// Frozen warmup selections. Absent if the session never got there.
    pub optimal_download: Option<ParameterSet>,
    pub optimal_upload: Option<ParameterSet>,
    /// Whether each discovery converged on its own.
    pub download_converged: bool,
    pub upload_converged: bool,
    /// Tagged trial histories for visualization.
    pub download_trials: Vec<Trial>,
    pub upload_trials: Vec<Trial>,
}

impl SessionReport {
    /// Latency samples recorded in one phase.
    pub fn latency_for(&self, phase: PhaseKind) -> Vec<LatencySample> {
        self.latency.iter().filter(|s| s.phase == phase).copied().collect()
    }

    /// Mean non-synthetic latency in one phase.
    pub fn mean_latency_ms(&self, phase: PhaseKind) -> Option<f64> {
        let samples: Vec<f64> = self
            .latency
            .iter()
            .filter(|s| s.phase == phase && !s.timeout)
            .map(|s| s.rtt_ms)
            .collect();
        (!samples.is_empty()).then(|| samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Latency added under load in one phase, relative to baseline.
    pub fn latency_delta_ms(&self, phase: PhaseKind) -> Option<f64> {
        self.mean_latency_ms(phase).map(|m| m - self.baseline_latency_ms)
    }

    /// Mean raw throughput in one phase and direction.
    pub fn mean_throughput_mbps(&self, direction: Direction, phase: PhaseKind) -> Option<f64> {
        let series = match direction {
            Direction::Download => &self.throughput_download,
            Direction::Upload => &self.throughput_upload,
        };
        let samples: Vec<f64> = series
            .iter()
            .filter(|s| s.phase == phase)
            .map(|s| s.mbps)
            .collect();
        (!samples.is_empty()).then(|| samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Cancellation handle for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    /// Cancel the session. Idempotent and non-blocking; the session drains
    /// its streams and returns a partial report.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScheduleState {
    baseline_ms: f64,
    download: Option<DiscoveryOutcome>,
    upload: Option<DiscoveryOutcome>,
    interrupted: bool,
}

/// One measurement session.
pub struct Session {
    cfg: EngineConfig,
    bus: EventBus,
    manager: Arc<StreamManager>,
    controller: PhaseController,
    phase_rx: watch::Receiver<PhaseKind>,
    recorder: Arc<Recorder>,
    shutdown_rx: watch::Receiver<bool>,
    epoch: Instant,
    started_at: DateTime<Utc>,
}

impl Session {
    /// Build a session against the configured origin.
    pub fn new(cfg: EngineConfig) -> Result<(Self, SessionHandle), EngineError> {
        let epoch = Instant::now();
        let bus = EventBus::new(cfg.bus_capacity);
        let manager =
            StreamManager::new(cfg.manager.clone(), cfg.origin.clone(), bus.clone(), epoch)?;
        let barrier = PhaseBarrier::new(Arc::clone(&manager), cfg.barrier.clone());
        let (controller, phase_rx) = PhaseController::new(bus.clone(), barrier, epoch);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Session {
            cfg,
            bus,
            manager,
            controller,
            phase_rx,
            recorder: Arc::new(Recorder::default()),
            shutdown_rx,
            epoch,
            started_at: Utc::now(),
        };
        let handle = SessionHandle {
            shutdown_tx: Arc::new(shutdown_tx),
        };
        Ok((session, handle))
    }

    /// Live event stream; also the channel for injecting control events
    /// (`force_backoff`, `set_min_duration`).
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Run the full schedule and surface the report.
    pub async fn run(mut self) -> Result<SessionReport, EngineError> {
        tracing::info!(origin = %self.cfg.origin, "measurement session starting");

        let (tasks_tx, tasks_rx) = watch::channel(false);
        let prober = LatencyProber {
            http: self.manager.http().clone(),
            origin: self.cfg.origin.clone(),
            bus: self.bus.clone(),
            recorder: Arc::clone(&self.recorder),
            phase_rx: self.phase_rx.clone(),
            cfg: self.cfg.probe.clone(),
            epoch: self.epoch,
        };
        let monitor = ThroughputMonitor {
            manager: Arc::clone(&self.manager),
            bus: self.bus.clone(),
            recorder: Arc::clone(&self.recorder),
            phase_rx: self.phase_rx.clone(),
            cfg: self.cfg.monitor.clone(),
            epoch: self.epoch,
        };
        let prober_task = tokio::spawn(prober.run(tasks_rx.clone()));
        let monitor_task = tokio::spawn(monitor.run(tasks_rx));

        let schedule = self.run_schedule().await;

        // Whatever happened, leave the registry empty and the tasks stopped
        // before surfacing anything.
        self.controller.complete().await;
        let _ = tasks_tx.send(true);
        let _ = prober_task.await;
        let _ = monitor_task.await;

        let state = schedule?;
        let report = self.build_report(state);
        tracing::info!(
            baseline_ms = report.baseline_latency_ms,
            phases = report.phases.len(),
            interrupted = report.interrupted,
            "session finished"
        );
        Ok(report)
    }

    async fn run_schedule(&mut self) -> Result<ScheduleState, EngineError> {
        let mut state = ScheduleState {
            baseline_ms: self.cfg.baseline_fallback_ms,
            ..ScheduleState::default()
        };
        let load = self.cfg.schedule.load;

        state.interrupted = 'schedule: {
            // Baseline: probes only, no load.
            self.controller.start_phase(PhaseKind::Baseline).await?;
            let stopped = self.pause(self.cfg.schedule.baseline).await;
            if let Some(measured) = self.recorder.mean_latency_ms(PhaseKind::Baseline) {
                state.baseline_ms = measured;
            } else {
                tracing::warn!(
                    fallback_ms = state.baseline_ms,
                    "baseline produced no usable samples"
                );
            }
            if stopped {
                break 'schedule true;
            }

            // Download: discover, then run with the frozen optimum.
            self.controller.start_phase(PhaseKind::DownloadWarmup).await?;
            let (outcome, stopped) = self.run_warmup(Direction::Download, state.baseline_ms).await;
            let download_params = outcome.optimal;
            state.download = Some(outcome);
            if stopped {
                break 'schedule true;
            }

            self.controller.start_phase(PhaseKind::Download).await?;
            self.manager
                .start_download_saturation(false, download_params)
                .await;
            if self.pause(load).await {
                break 'schedule true;
            }

            // Upload: same dance.
            self.controller.start_phase(PhaseKind::UploadWarmup).await?;
            let (outcome, stopped) = self.run_warmup(Direction::Upload, state.baseline_ms).await;
            let upload_params = outcome.optimal;
            state.upload = Some(outcome);
            if stopped {
                break 'schedule true;
            }

            self.controller.start_phase(PhaseKind::Upload).await?;
            self.manager
                .start_upload_saturation(false, upload_params)
                .await;
            if self.pause(load).await {
                break 'schedule true;
            }

            // Both at once.
            self.controller.start_phase(PhaseKind::Bidirectional).await?;
            self.manager
                .start_bidirectional_saturation(download_params, upload_params)
                .await;
            if self.pause(load).await {
                break 'schedule true;
            }

            self.controller.start_phase(PhaseKind::Complete).await?;
            false
        };

        Ok(state)
    }

    /// Drive one warmup to convergence (or its deadline), reconciling the
    /// stream population after every parameter decision and honouring the
    /// control events accepted on the bus.
    async fn run_warmup(
        &mut self,
        direction: Direction,
        baseline_ms: f64,
    ) -> (DiscoveryOutcome, bool) {
        let tuning = match direction {
            Direction::Download => self.cfg.discovery_download.clone(),
            Direction::Upload => self.cfg.discovery_upload.clone(),
        };
        let stabilization = tuning.stabilization;
        let now = Instant::now();
        let deadline = now + self.cfg.schedule.warmup_max;
        let mut discovery = Discovery::new(
            direction,
            baseline_ms,
            tuning,
            self.cfg.schedule.warmup_min,
            self.epoch,
            now,
        );
        let mut rx = self.bus.subscribe();

        match direction {
            Direction::Download => {
                self.manager
                    .start_download_saturation(true, discovery.params())
                    .await
            }
            Direction::Upload => {
                self.manager
                    .start_upload_saturation(true, discovery.params())
                    .await
            }
        }

        let mut latest_throughput = 0.0f64;
        let mut latest_latency: Option<f64> = None;
        let mut next_step = Instant::now() + stabilization;
        let mut stopped = false;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown_rx) => {
                    stopped = true;
                    break;
                }
                _ = sleep_until(next_step) => {
                    next_step = Instant::now() + stabilization;
                    if Instant::now() >= deadline {
                        tracing::warn!(%direction, "warmup hit its maximum duration without converging");
                        break;
                    }
                    let Some(latency_ms) = latest_latency else { continue };
                    let measurement = Measurement {
                        throughput_mbps: latest_throughput,
                        latency_ms,
                    };
                    match discovery.observe(measurement, Instant::now()) {
                        StepAction::Hold => {}
                        StepAction::Apply(params) => {
                            self.manager.apply_params(direction, true, params).await;
                        }
                        StepAction::Converged => break,
                    }
                }
                ev = rx.recv() => match ev {
                    Ok(Event::Throughput(s)) if s.direction == direction => {
                        latest_throughput = s.smoothed_mbps;
                    }
                    Ok(Event::Latency(s)) => latest_latency = Some(s.rtt_ms),
                    Ok(Event::ForceBackoff { direction: d, factor }) if d == direction => {
                        let params = discovery.force_backoff(factor, Instant::now());
                        self.manager.apply_params(direction, true, params).await;
                    }
                    Ok(Event::SetMinDuration { direction: d, min_duration_ms }) if d == direction => {
                        discovery.set_min_duration(Duration::from_millis(min_duration_ms));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "warmup consumer lagged, resuming with next event");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }

        (discovery.finish(), stopped)
    }

    /// Sleep, but wake early on shutdown. Returns whether shutdown fired.
    async fn pause(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        tokio::select! {
            _ = sleep_until(deadline) => false,
            _ = wait_shutdown(&mut self.shutdown_rx) => true,
        }
    }

    fn build_report(&self, state: ScheduleState) -> SessionReport {
        SessionReport {
            started_at: self.started_at,
            baseline_latency_ms: state.baseline_ms,
            interrupted: state.interrupted,
            phases: self.controller.phase_history(),
            latency: self.recorder.latency_series(),
            throughput_download: self.recorder.download_series(),
            throughput_upload: self.recorder.upload_series(),
            optimal_download: state.download.as_ref().map(|o| o.optimal),
            optimal_upload: state.upload.as_ref().map(|o| o.optimal),
            download_converged: state.download.as_ref().is_some_and(|o| o.converged),
            upload_converged: state.upload.as_ref().is_some_and(|o| o.converged),
            download_trials: state.download.map(|o| o.trials).unwrap_or_default(),
            upload_trials: state.upload.map(|o| o.trials).unwrap_or_default(),
        }
    }
}

/// Resolve once shutdown is signalled; pend forever if the handle is gone.
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    loop {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *rx.borrow() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(phase: PhaseKind, rtt_ms: f64, timeout: bool) -> LatencySample {
        LatencySample {
            time: 0.0,
            rtt_ms,
            timeout,
            consecutive_timeouts: 0,
            phase,
        }
    }

    #[test]
    fn recorder_mean_skips_synthetic_samples() {
        let recorder = Recorder::default();
        recorder.push_latency(sample(PhaseKind::Baseline, 20.0, false));
        recorder.push_latency(sample(PhaseKind::Baseline, 30.0, false));
        recorder.push_latency(sample(PhaseKind::Baseline, 2000.0, true));
        recorder.push_latency(sample(PhaseKind::Download, 90.0, false));

        let mean = recorder.mean_latency_ms(PhaseKind::Baseline).unwrap();
        assert!((mean - 25.0).abs() < 1e-9);
        assert!(recorder.mean_latency_ms(PhaseKind::Upload).is_none());
    }

    #[test]
    fn report_latency_delta() {
        let report = SessionReport {
            started_at: Utc::now(),
            baseline_latency_ms: 20.0,
            interrupted: false,
            phases: Vec::new(),
            latency: vec![
                sample(PhaseKind::Upload, 420.0, false),
                sample(PhaseKind::Upload, 440.0, false),
                sample(PhaseKind::Upload, 2000.0, true),
            ],
            throughput_download: Vec::new(),
            throughput_upload: Vec::new(),
            optimal_download: None,
            optimal_upload: None,
            download_converged: false,
            upload_converged: false,
            download_trials: Vec::new(),
            upload_trials: Vec::new(),
        };
        let delta = report.latency_delta_ms(PhaseKind::Upload).unwrap();
        assert!((delta - 410.0).abs() < 1e-9);
        assert!(report.latency_delta_ms(PhaseKind::Download).is_none());
    }

    #[test]
    fn report_serializes() {
        let report = SessionReport {
            started_at: Utc::now(),
            baseline_latency_ms: 18.5,
            interrupted: false,
            phases: Vec::new(),
            latency: Vec::new(),
            throughput_download: Vec::new(),
            throughput_upload: Vec::new(),
            optimal_download: Some(ParameterSet::new(4, 1)),
            optimal_upload: Some(ParameterSet::new(2, 3)),
            download_converged: true,
            upload_converged: true,
            download_trials: Vec::new(),
            upload_trials: Vec::new(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"stream_count\":4"));
        assert!(json.contains("baseline_latency_ms"));
    }

    #[tokio::test]
    async fn wait_shutdown_sees_pre_set_flag() {
        let (tx, mut rx) = watch::channel(true);
        // Already true: resolves immediately.
        wait_shutdown(&mut rx).await;
        drop(tx);
    }
}
