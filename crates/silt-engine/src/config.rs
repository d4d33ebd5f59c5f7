//! # Engine Configuration
//!
//! Every tunable in the engine lives here as a config struct with sensible
//! defaults. The defaults are the measured production values; tests shrink
//! the durations to run whole sessions in well under a second.

use std::time::Duration;

use crate::events::Direction;

// ─── Top Level ──────────────────────────────────────────────────────────────

/// Complete engine configuration for one measurement session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the cooperative origin, e.g. `http://localhost:8080`.
    /// The engine appends `/ping`, `/download` and `/upload`.
    pub origin: String,
    /// Phase durations.
    pub schedule: PhaseSchedule,
    /// Phase-boundary barrier tuning.
    pub barrier: BarrierConfig,
    /// Latency prober tuning.
    pub probe: ProbeConfig,
    /// Throughput sampler tuning.
    pub monitor: MonitorConfig,
    /// Stream manager tuning (spawn pacing, upload pipeline, pacing).
    pub manager: ManagerConfig,
    /// Parameter discovery tuning for download warmups.
    pub discovery_download: DiscoveryTuning,
    /// Parameter discovery tuning for upload warmups.
    pub discovery_upload: DiscoveryTuning,
    /// Baseline latency assumed when the baseline phase produced no usable
    /// samples (all probes timed out).
    pub baseline_fallback_ms: f64,
    /// Broadcast bus capacity. Control events are far below this rate;
    /// sample consumers tolerate loss.
    pub bus_capacity: usize,
}

impl EngineConfig {
    /// Configuration with all defaults against the given origin.
    pub fn new(origin: impl Into<String>) -> Self {
        EngineConfig {
            origin: origin.into(),
            schedule: PhaseSchedule::default(),
            barrier: BarrierConfig::default(),
            probe: ProbeConfig::default(),
            monitor: MonitorConfig::default(),
            manager: ManagerConfig::default(),
            discovery_download: DiscoveryTuning::download(),
            discovery_upload: DiscoveryTuning::upload(),
            baseline_fallback_ms: 50.0,
            bus_capacity: 1024,
        }
    }
}

// ─── Phase Schedule ─────────────────────────────────────────────────────────

/// How long each phase runs.
#[derive(Debug, Clone)]
pub struct PhaseSchedule {
    /// Unloaded baseline interval.
    pub baseline: Duration,
    /// Each of the Download, Upload and Bidirectional load intervals.
    pub load: Duration,
    /// Minimum warmup duration, honoured even if discovery converges early.
    pub warmup_min: Duration,
    /// Hard stop for a warmup whose discovery never converges. Selection
    /// still runs over whatever trials were recorded.
    pub warmup_max: Duration,
}

impl Default for PhaseSchedule {
    fn default() -> Self {
        PhaseSchedule {
            baseline: Duration::from_secs(5),
            load: Duration::from_secs(5),
            warmup_min: Duration::from_secs(15),
            warmup_max: Duration::from_secs(40),
        }
    }
}

// ─── Barrier ────────────────────────────────────────────────────────────────

/// Phase-boundary barrier tuning.
#[derive(Debug, Clone)]
pub struct BarrierConfig {
    /// Fixed wait after commanding termination, before verification starts.
    pub quiescence: Duration,
    /// Maximum verification rounds before the emergency reset.
    pub verify_rounds: u32,
    /// Delay before the first re-check; doubles each round.
    pub verify_initial_delay: Duration,
    /// Per-round delay ceiling.
    pub verify_max_delay: Duration,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        BarrierConfig {
            quiescence: Duration::from_millis(200),
            verify_rounds: 15,
            verify_initial_delay: Duration::from_millis(100),
            verify_max_delay: Duration::from_secs(1),
        }
    }
}

// ─── Latency Prober ─────────────────────────────────────────────────────────

/// Latency prober tuning.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Probe cadence.
    pub interval: Duration,
    /// Per-request timeout floor.
    pub timeout_floor: Duration,
    /// Per-request timeout ceiling.
    pub timeout_ceiling: Duration,
    /// Timeout grows by this much per consecutive timeout.
    pub timeout_step: Duration,
    /// Synthetic sample value grows by this many ms per consecutive timeout,
    /// from the floor up to the ceiling.
    pub synthetic_step_ms: f64,
    /// Consecutive timeouts before a forced backoff is requested.
    pub backoff_after: u32,
    /// The consecutive-timeout counter restarts here after a forced backoff
    /// so a lone success does not mask a still-congested path.
    pub counter_reset: u32,
    /// Forced-backoff factor during a download warmup.
    pub download_backoff_factor: f64,
    /// Forced-backoff factor during an upload warmup.
    pub upload_backoff_factor: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            interval: Duration::from_millis(100),
            timeout_floor: Duration::from_millis(1000),
            timeout_ceiling: Duration::from_millis(2000),
            timeout_step: Duration::from_millis(100),
            synthetic_step_ms: 25.0,
            backoff_after: 5,
            counter_reset: 3,
            download_backoff_factor: 0.5,
            upload_backoff_factor: 0.9,
        }
    }
}

impl ProbeConfig {
    /// Adaptive per-request timeout for the given consecutive-timeout count.
    pub fn request_timeout(&self, consecutive_timeouts: u32) -> Duration {
        (self.timeout_floor + self.timeout_step * consecutive_timeouts).min(self.timeout_ceiling)
    }

    /// Synthetic RTT recorded for a timed-out probe, in ms.
    pub fn synthetic_rtt_ms(&self, consecutive_timeouts: u32) -> f64 {
        let floor = self.timeout_floor.as_millis() as f64;
        let ceiling = self.timeout_ceiling.as_millis() as f64;
        (floor + self.synthetic_step_ms * consecutive_timeouts as f64).min(ceiling)
    }

    /// Forced-backoff factor for a warmup in the given direction.
    pub fn backoff_factor(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Download => self.download_backoff_factor,
            Direction::Upload => self.upload_backoff_factor,
        }
    }
}

// ─── Throughput Monitor ─────────────────────────────────────────────────────

/// Throughput sampler tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling cadence.
    pub interval: Duration,
    /// EWMA smoothing factor for the smoothed series.
    pub smoothing_alpha: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval: Duration::from_millis(200),
            smoothing_alpha: 0.3,
        }
    }
}

// ─── Stream Manager ─────────────────────────────────────────────────────────

/// Stream manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Spawn pacing between sibling streams and directions.
    pub spawn: SpawnConfig,
    /// Upload stream pipeline tuning.
    pub upload: UploadConfig,
    /// Download stream tuning.
    pub download: DownloadConfig,
    /// Cadence of the maintenance pass that respawns streams lost
    /// mid-phase, keeping the live population at the applied parameter
    /// set until the next barrier.
    pub reconcile_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            spawn: SpawnConfig::default(),
            upload: UploadConfig::default(),
            download: DownloadConfig::default(),
            reconcile_interval: Duration::from_millis(500),
        }
    }
}

/// Pacing between stream spawns.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Delay between spawning sibling streams of one direction.
    pub inter_spawn_delay: Duration,
    /// Gap between starting the download and upload halves of a
    /// bidirectional load.
    pub bidirectional_gap: Duration,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        SpawnConfig {
            inter_spawn_delay: Duration::from_millis(100),
            bidirectional_gap: Duration::from_millis(200),
        }
    }
}

/// Upload stream pipeline tuning.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Per-POST timeout.
    pub post_timeout: Duration,
    /// Retries per chunk on transient failure.
    pub retries: u32,
    /// Backoff between retries.
    pub retry_backoff: Duration,
    /// Steady-state buffer size.
    pub buffer_bytes: usize,
    /// Starting buffer size during the warmup slow-start ramp.
    pub slow_start_floor: usize,
    /// Buffers over which the slow-start ramp reaches the full size.
    pub slow_start_span: u32,
    /// Buffers held in the queue when full.
    pub queue_capacity: usize,
    /// Refill when the queue falls below this many buffers.
    pub queue_low_water: usize,
    /// Refill when this long passes without a completed chunk.
    pub refill_idle: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            post_timeout: Duration::from_secs(5),
            retries: 2,
            retry_backoff: Duration::from_millis(100),
            buffer_bytes: 64 * 1024,
            slow_start_floor: 4 * 1024,
            slow_start_span: 30,
            queue_capacity: 10,
            queue_low_water: 5,
            refill_idle: Duration::from_millis(300),
        }
    }
}

/// Download stream tuning.
#[derive(Debug, Clone, Default)]
pub struct DownloadConfig {
    /// Optional pause between body chunks. Off unless the caller explicitly
    /// wants paced reads.
    pub chunk_delay: Option<Duration>,
}

// ─── Parameter Discovery ────────────────────────────────────────────────────

/// Parameter discovery tuning for one direction.
#[derive(Debug, Clone)]
pub struct DiscoveryTuning {
    /// Maximum concurrent streams to explore.
    pub max_streams: u32,
    /// Maximum pending-request depth to explore.
    pub max_depth: u32,
    /// Soft latency threshold floor, ms.
    pub soft_floor_ms: f64,
    /// Soft latency threshold as a multiple of baseline.
    pub soft_multiplier: f64,
    /// Hard latency cap as a multiple of baseline.
    pub hard_multiplier: f64,
    /// Hard cap clamp floor, ms.
    pub hard_floor_ms: f64,
    /// Hard cap clamp ceiling, ms.
    pub hard_ceiling_ms: f64,
    /// Consecutive no-change measurements required to converge.
    pub stable_threshold: u32,
    /// Measurements required at a parameter set before ramping further.
    pub min_samples_per_set: u32,
    /// Wait between consuming measurements.
    pub stabilization: Duration,
    /// High-latency strikes before a backoff.
    pub strike_limit: u32,
    /// Strike counter restart value after a backoff.
    pub strike_reset: u32,
    /// Probability that a backoff shrinks pending depth rather than
    /// stream count (when both can shrink).
    pub backoff_depth_bias: f64,
    /// Throughput weight in the trial score.
    pub score_weight_throughput: f64,
    /// Latency-headroom weight in the trial score.
    pub score_weight_latency: f64,
    /// During selection, a later trial displaces the incumbent when its
    /// score reaches this ratio of the incumbent's (download only).
    pub score_ratio_update: f64,
    /// ... or when its throughput improves on the incumbent's by this
    /// fraction (download only).
    pub throughput_update: f64,
    /// Delay before the automatic one-step re-ramp after a forced backoff.
    pub reramp_delay: Duration,
}

impl DiscoveryTuning {
    /// Download-direction defaults.
    pub fn download() -> Self {
        DiscoveryTuning {
            max_streams: 24,
            max_depth: 3,
            soft_floor_ms: 75.0,
            soft_multiplier: 1.75,
            hard_multiplier: 2.5,
            hard_floor_ms: 150.0,
            hard_ceiling_ms: 250.0,
            stable_threshold: 3,
            min_samples_per_set: 2,
            stabilization: Duration::from_millis(300),
            strike_limit: 3,
            strike_reset: 2,
            backoff_depth_bias: 0.5,
            score_weight_throughput: 0.5,
            score_weight_latency: 0.5,
            score_ratio_update: 0.95,
            throughput_update: 0.10,
            reramp_delay: Duration::from_secs(3),
        }
    }

    /// Upload-direction defaults.
    pub fn upload() -> Self {
        DiscoveryTuning {
            max_streams: 16,
            max_depth: 16,
            soft_floor_ms: 100.0,
            soft_multiplier: 2.0,
            hard_multiplier: 3.0,
            hard_floor_ms: 200.0,
            hard_ceiling_ms: 400.0,
            stable_threshold: 2,
            min_samples_per_set: 2,
            stabilization: Duration::from_millis(300),
            strike_limit: 3,
            strike_reset: 2,
            backoff_depth_bias: 0.75,
            score_weight_throughput: 0.7,
            score_weight_latency: 0.3,
            score_ratio_update: 1.0,
            throughput_update: f64::INFINITY,
            reramp_delay: Duration::from_secs(3),
        }
    }

    /// Soft latency threshold for the given baseline.
    pub fn soft_threshold_ms(&self, baseline_ms: f64) -> f64 {
        (baseline_ms * self.soft_multiplier).max(self.soft_floor_ms)
    }

    /// Hard latency cap for the given baseline.
    pub fn hard_cap_ms(&self, baseline_ms: f64) -> f64 {
        (baseline_ms * self.hard_multiplier).clamp(self.hard_floor_ms, self.hard_ceiling_ms)
    }
}
