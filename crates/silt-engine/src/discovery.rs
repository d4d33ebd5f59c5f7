//! # Parameter Discovery
//!
//! During a warmup the engine explores the `(stream_count, pending_depth)`
//! space looking for the load that saturates the link without collapsing
//! latency. The explorer is a pure state machine: the warmup driver feeds
//! it one combined throughput/latency measurement per stabilization window
//! and applies whatever parameter change it asks for.
//!
//! ```text
//!              measurement
//!                   │
//!        latency ≤ soft threshold ──▶ ramp one parameter up
//!                   │                 (after 2 samples at the set)
//!        latency > soft threshold ──▶ strike; 3 strikes or a hard-cap
//!                   │                 breach backs one parameter off
//!        no change possible ────────▶ stability accumulates; converge
//!                                     once the edge was explored and the
//!                                     minimum duration has elapsed
//! ```
//!
//! At the end of the warmup the recorded trials are scored and the
//! parameters *applied immediately before* the best-scoring trial are
//! returned: the best outcome was produced by the set that was live while
//! its traffic ramped, not the one recorded alongside it.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::DiscoveryTuning;
use crate::events::Direction;

// ─── Parameter Set ──────────────────────────────────────────────────────────

/// A load parameter combination. Both values are always at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Concurrent streams in one direction.
    pub stream_count: u32,
    /// Concurrent requests a single upload stream keeps in flight.
    pub pending_depth: u32,
}

impl ParameterSet {
    pub fn new(stream_count: u32, pending_depth: u32) -> Self {
        ParameterSet {
            stream_count: stream_count.max(1),
            pending_depth: pending_depth.max(1),
        }
    }

    /// The exploration starting point.
    pub fn initial() -> Self {
        ParameterSet::new(1, 1)
    }
}

impl std::fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.stream_count, self.pending_depth)
    }
}

/// Defaults used when discovery fails outright.
pub fn fallback_params(direction: Direction) -> ParameterSet {
    match direction {
        Direction::Download => ParameterSet::new(3, 1),
        Direction::Upload => ParameterSet::new(2, 2),
    }
}

// ─── Trials ─────────────────────────────────────────────────────────────────

/// One recorded (parameter set, outcome) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub params: ParameterSet,
    pub throughput_mbps: f64,
    pub latency_ms: f64,
    /// Seconds since session start.
    pub time: f64,
    /// The best-scoring outcome of the warmup. At most one per history.
    pub is_optimal_outcome: bool,
    /// The trial whose parameters produced the best outcome. At most one
    /// per history, always immediately before the optimal outcome.
    pub caused_optimal_outcome: bool,
}

/// A combined measurement consumed once per stabilization window.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub throughput_mbps: f64,
    pub latency_ms: f64,
}

/// What the warmup driver should do after a measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepAction {
    /// Keep the current parameters.
    Hold,
    /// Reconcile the stream manager to these parameters.
    Apply(ParameterSet),
    /// Discovery is done; freeze and select.
    Converged,
}

/// Result of a completed warmup.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryOutcome {
    pub direction: Direction,
    /// The causal parameters to run the load phase with.
    pub optimal: ParameterSet,
    /// Whether discovery converged on its own (as opposed to running out
    /// of warmup).
    pub converged: bool,
    /// Full trial history, tagged for visualization.
    pub trials: Vec<Trial>,
}

// ─── Explorer ───────────────────────────────────────────────────────────────

/// Warmup-scoped parameter explorer. Owned by the warmup driver and dropped
/// when the warmup ends.
pub struct Discovery {
    direction: Direction,
    tuning: DiscoveryTuning,
    soft_ms: f64,
    hard_ms: f64,
    params: ParameterSet,
    trials: Vec<Trial>,
    /// Consecutive measurements above the soft threshold.
    strikes: u32,
    /// Consecutive measurements that changed nothing.
    stable: u32,
    /// Measurements consumed at the current parameter set.
    samples_at_set: u32,
    /// Whether exploration hit a bound or backed off at least once.
    edge_reached: bool,
    started: Instant,
    epoch: Instant,
    min_duration: Duration,
    /// One-step re-ramp scheduled by a forced backoff.
    reramp_due: Option<Instant>,
    converged: bool,
}

impl Discovery {
    pub fn new(
        direction: Direction,
        baseline_ms: f64,
        tuning: DiscoveryTuning,
        min_duration: Duration,
        epoch: Instant,
        now: Instant,
    ) -> Self {
        let soft_ms = tuning.soft_threshold_ms(baseline_ms);
        let hard_ms = tuning.hard_cap_ms(baseline_ms);
        tracing::debug!(
            %direction,
            baseline_ms,
            soft_ms,
            hard_ms,
            "discovery starting at 1x1"
        );
        Discovery {
            direction,
            tuning,
            soft_ms,
            hard_ms,
            params: ParameterSet::initial(),
            trials: Vec::with_capacity(64),
            strikes: 0,
            stable: 0,
            samples_at_set: 0,
            edge_reached: false,
            started: now,
            epoch,
            min_duration,
            reramp_due: None,
            converged: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn params(&self) -> ParameterSet {
        self.params
    }

    pub fn soft_threshold_ms(&self) -> f64 {
        self.soft_ms
    }

    pub fn hard_cap_ms(&self) -> f64 {
        self.hard_ms
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    /// Override the minimum warmup duration (external control event).
    pub fn set_min_duration(&mut self, min_duration: Duration) {
        self.min_duration = min_duration;
    }

    // ─── Control Loop ───────────────────────────────────────────────────

    /// Consume one measurement and decide what happens next.
    pub fn observe(&mut self, m: Measurement, now: Instant) -> StepAction {
        if self.converged {
            return StepAction::Converged;
        }

        self.trials.push(Trial {
            params: self.params,
            throughput_mbps: m.throughput_mbps,
            latency_ms: m.latency_ms,
            time: now.duration_since(self.epoch).as_secs_f64(),
            is_optimal_outcome: false,
            caused_optimal_outcome: false,
        });
        self.samples_at_set += 1;

        // A due re-ramp takes precedence over this measurement.
        if let Some(due) = self.reramp_due {
            if now >= due {
                self.reramp_due = None;
                if self.increase_one() {
                    self.note_param_change();
                    tracing::debug!(direction = %self.direction, params = %self.params, "re-ramping after forced backoff");
                    return StepAction::Apply(self.params);
                }
            }
        }

        let mut action = StepAction::Hold;
        if m.latency_ms > self.soft_ms {
            self.strikes += 1;
            if m.latency_ms > self.hard_ms || self.strikes >= self.tuning.strike_limit {
                let changed = self.back_off_one();
                // Restart above zero so one good sample cannot mask a
                // still-loaded queue.
                self.strikes = self.tuning.strike_reset;
                self.edge_reached = true;
                self.reramp_due = None;
                if changed {
                    self.note_param_change();
                    tracing::debug!(
                        direction = %self.direction,
                        latency_ms = m.latency_ms,
                        params = %self.params,
                        "latency backoff"
                    );
                    action = StepAction::Apply(self.params);
                } else {
                    self.stable += 1;
                }
            } else {
                self.stable += 1;
            }
        } else {
            self.strikes = self.strikes.saturating_sub(1);
            if self.samples_at_set >= self.tuning.min_samples_per_set {
                if self.increase_one() {
                    self.note_param_change();
                    action = StepAction::Apply(self.params);
                } else {
                    self.edge_reached = true;
                    self.stable += 1;
                }
            } else {
                self.stable += 1;
            }
        }

        if action == StepAction::Hold
            && self.stable >= self.tuning.stable_threshold
            && self.edge_reached
            && now.duration_since(self.started) >= self.min_duration
        {
            self.converged = true;
            tracing::debug!(direction = %self.direction, params = %self.params, trials = self.trials.len(), "discovery converged");
            return StepAction::Converged;
        }
        action
    }

    /// External backoff request (sustained probe timeouts). Scales one
    /// parameter by `factor` and schedules a one-step re-ramp.
    pub fn force_backoff(&mut self, factor: f64, now: Instant) -> ParameterSet {
        let scale = |v: u32| -> u32 { ((f64::from(v) * factor).ceil() as u32).max(1) };

        // Prefer the parameter that dominates queueing for the direction.
        let prefer_depth = self.direction == Direction::Upload;
        let order = if prefer_depth {
            [Knob::Depth, Knob::Streams]
        } else {
            [Knob::Streams, Knob::Depth]
        };
        for knob in order {
            let cur = match knob {
                Knob::Streams => self.params.stream_count,
                Knob::Depth => self.params.pending_depth,
            };
            let scaled = scale(cur);
            if scaled < cur {
                match knob {
                    Knob::Streams => self.params.stream_count = scaled,
                    Knob::Depth => self.params.pending_depth = scaled,
                }
                break;
            }
        }

        self.edge_reached = true;
        self.strikes = self.tuning.strike_reset;
        self.note_param_change();
        self.reramp_due = Some(now + self.tuning.reramp_delay);
        tracing::debug!(direction = %self.direction, factor, params = %self.params, "forced backoff");
        self.params
    }

    fn note_param_change(&mut self) {
        self.stable = 0;
        self.samples_at_set = 0;
    }

    fn increase_one(&mut self) -> bool {
        let p = &mut self.params;
        match self.direction {
            Direction::Upload => {
                if p.pending_depth < 2 {
                    p.pending_depth += 1;
                    true
                } else if p.stream_count < self.tuning.max_streams {
                    p.stream_count += 1;
                    true
                } else if p.pending_depth < self.tuning.max_depth {
                    p.pending_depth += 1;
                    true
                } else {
                    false
                }
            }
            Direction::Download => {
                if p.stream_count < self.tuning.max_streams {
                    p.stream_count += 1;
                    true
                } else if p.pending_depth < self.tuning.max_depth {
                    p.pending_depth += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn back_off_one(&mut self) -> bool {
        let can_streams = self.params.stream_count > 1;
        let can_depth = self.params.pending_depth > 1;
        let pick_depth = match (can_depth, can_streams) {
            (false, false) => return false,
            (true, false) => true,
            (false, true) => false,
            (true, true) => rand::rng().random_bool(self.tuning.backoff_depth_bias),
        };
        if pick_depth {
            self.params.pending_depth -= 1;
        } else {
            self.params.stream_count -= 1;
        }
        true
    }

    // ─── Selection ──────────────────────────────────────────────────────

    /// Score and tag the trial history, returning the causal optimum.
    pub fn finish(mut self) -> DiscoveryOutcome {
        if self.trials.is_empty() {
            tracing::warn!(direction = %self.direction, "warmup recorded no trials, using fallback parameters");
            return DiscoveryOutcome {
                direction: self.direction,
                optimal: fallback_params(self.direction),
                converged: self.converged,
                trials: Vec::new(),
            };
        }

        let scores: Vec<f64> = self.trials.iter().map(|t| self.score(t)).collect();
        let mut best = 0usize;
        for i in 1..self.trials.len() {
            let better_score = scores[i] > scores[best] * self.tuning.score_ratio_update;
            let better_throughput = self.trials[i].throughput_mbps
                > self.trials[best].throughput_mbps * (1.0 + self.tuning.throughput_update);
            if better_score || better_throughput {
                best = i;
            }
        }

        self.trials[best].is_optimal_outcome = true;
        let causal = best.saturating_sub(1);
        if causal != best {
            self.trials[causal].caused_optimal_outcome = true;
        }
        let optimal = self.trials[causal].params;

        tracing::info!(
            direction = %self.direction,
            optimal = %optimal,
            best_throughput_mbps = self.trials[best].throughput_mbps,
            best_latency_ms = self.trials[best].latency_ms,
            converged = self.converged,
            "warmup selection complete"
        );
        DiscoveryOutcome {
            direction: self.direction,
            optimal,
            converged: self.converged,
            trials: self.trials,
        }
    }

    /// Combined throughput/latency score: full credit for throughput, plus
    /// weighted credit for latency headroom under the soft threshold.
    fn score(&self, t: &Trial) -> f64 {
        let headroom = (1.0 - t.latency_ms / self.soft_ms).max(0.0);
        self.tuning.score_weight_throughput * t.throughput_mbps
            + self.tuning.score_weight_latency * headroom * t.throughput_mbps
    }

    #[cfg(test)]
    fn seed_trial(&mut self, params: ParameterSet, throughput_mbps: f64, latency_ms: f64) {
        self.trials.push(Trial {
            params,
            throughput_mbps,
            latency_ms,
            time: self.trials.len() as f64,
            is_optimal_outcome: false,
            caused_optimal_outcome: false,
        });
    }
}

#[derive(Clone, Copy)]
enum Knob {
    Streams,
    Depth,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(15);

    fn download(baseline_ms: f64) -> Discovery {
        let epoch = Instant::now();
        Discovery::new(
            Direction::Download,
            baseline_ms,
            DiscoveryTuning::download(),
            MIN,
            epoch,
            epoch,
        )
    }

    fn upload(baseline_ms: f64) -> Discovery {
        let epoch = Instant::now();
        Discovery::new(
            Direction::Upload,
            baseline_ms,
            DiscoveryTuning::upload(),
            MIN,
            epoch,
            epoch,
        )
    }

    fn good(tput: f64) -> Measurement {
        Measurement {
            throughput_mbps: tput,
            latency_ms: 20.0,
        }
    }

    fn bloated(tput: f64, latency_ms: f64) -> Measurement {
        Measurement {
            throughput_mbps: tput,
            latency_ms,
        }
    }

    #[test]
    fn starts_at_one_by_one() {
        let d = download(20.0);
        assert_eq!(d.params(), ParameterSet::new(1, 1));
        assert_eq!(d.soft_threshold_ms(), 75.0);
        assert_eq!(d.hard_cap_ms(), 150.0);
    }

    #[test]
    fn ramp_waits_for_two_samples_per_set() {
        let mut d = download(20.0);
        let now = Instant::now();
        assert_eq!(d.observe(good(50.0), now), StepAction::Hold);
        match d.observe(good(52.0), now) {
            StepAction::Apply(p) => assert_eq!(p, ParameterSet::new(2, 1)),
            other => panic!("expected ramp, got {other:?}"),
        }
    }

    #[test]
    fn download_ramps_streams_before_depth() {
        let mut d = download(20.0);
        let now = Instant::now();
        for _ in 0..8 {
            d.observe(good(100.0), now);
        }
        assert!(d.params().stream_count > 1);
        assert_eq!(d.params().pending_depth, 1);
    }

    #[test]
    fn upload_ramps_depth_to_two_then_streams() {
        let mut u = upload(20.0);
        let now = Instant::now();
        u.observe(good(10.0), now);
        match u.observe(good(10.0), now) {
            StepAction::Apply(p) => assert_eq!(p, ParameterSet::new(1, 2)),
            other => panic!("expected depth ramp, got {other:?}"),
        }
        u.observe(good(12.0), now);
        match u.observe(good(12.0), now) {
            StepAction::Apply(p) => assert_eq!(p, ParameterSet::new(2, 2)),
            other => panic!("expected stream ramp, got {other:?}"),
        }
    }

    #[test]
    fn three_soft_strikes_back_off() {
        let mut d = download(20.0);
        let now = Instant::now();
        // Get to (3,1) first.
        for _ in 0..4 {
            d.observe(good(100.0), now);
        }
        assert_eq!(d.params(), ParameterSet::new(3, 1));

        // Latency between soft (75) and hard (150): strikes accumulate.
        assert_eq!(d.observe(bloated(100.0, 100.0), now), StepAction::Hold);
        assert_eq!(d.observe(bloated(100.0, 100.0), now), StepAction::Hold);
        match d.observe(bloated(100.0, 100.0), now) {
            StepAction::Apply(p) => assert_eq!(p, ParameterSet::new(2, 1)),
            other => panic!("expected backoff, got {other:?}"),
        }
    }

    #[test]
    fn strike_counter_restarts_at_two_after_backoff() {
        let mut d = download(20.0);
        let now = Instant::now();
        for _ in 0..4 {
            d.observe(good(100.0), now);
        }
        // Trigger a backoff via strikes.
        d.observe(bloated(100.0, 100.0), now);
        d.observe(bloated(100.0, 100.0), now);
        d.observe(bloated(100.0, 100.0), now);
        assert_eq!(d.params(), ParameterSet::new(2, 1));

        // One more high sample reaches the limit straight away (2 + 1).
        match d.observe(bloated(80.0, 100.0), now) {
            StepAction::Apply(p) => assert_eq!(p, ParameterSet::new(1, 1)),
            other => panic!("expected immediate re-backoff, got {other:?}"),
        }
    }

    #[test]
    fn hard_cap_backs_off_immediately() {
        let mut d = download(20.0);
        let now = Instant::now();
        for _ in 0..4 {
            d.observe(good(100.0), now);
        }
        assert_eq!(d.params(), ParameterSet::new(3, 1));
        match d.observe(bloated(100.0, 300.0), now) {
            StepAction::Apply(p) => assert_eq!(p, ParameterSet::new(2, 1)),
            other => panic!("expected hard-cap backoff, got {other:?}"),
        }
    }

    #[test]
    fn never_below_one_by_one_and_converges_under_bloat() {
        let mut u = upload(20.0);
        let t0 = Instant::now();
        let late = t0 + Duration::from_secs(16);
        // Saturated queue from the start: every sample far above the hard
        // cap. Parameters are pinned at the floor.
        for _ in 0..3 {
            u.observe(bloated(5.0, 500.0), late);
            assert_eq!(u.params(), ParameterSet::new(1, 1));
        }
        assert!(u.is_converged(), "pinned-at-floor discovery must converge");
    }

    #[test]
    fn convergence_waits_for_min_duration() {
        let mut u = upload(20.0);
        let t0 = Instant::now();
        for _ in 0..10 {
            u.observe(bloated(5.0, 500.0), t0);
        }
        assert!(!u.is_converged(), "must not converge before the minimum duration");

        u.observe(bloated(5.0, 500.0), t0 + Duration::from_secs(16));
        assert!(u.is_converged());
    }

    #[test]
    fn set_min_duration_takes_effect() {
        let mut u = upload(20.0);
        let t0 = Instant::now();
        u.set_min_duration(Duration::from_secs(1));
        for _ in 0..3 {
            u.observe(bloated(5.0, 500.0), t0 + Duration::from_secs(2));
        }
        assert!(u.is_converged());
    }

    #[test]
    fn converges_at_bounds_on_ideal_link() {
        let mut u = upload(10.0);
        let t0 = Instant::now();
        let late = t0 + Duration::from_secs(20);
        // Ideal link: never strains latency, so discovery rides the ramp
        // all the way to the bounds and settles there.
        for _ in 0..2000 {
            u.observe(good(500.0), late);
            if u.is_converged() {
                break;
            }
        }
        assert!(u.is_converged());
        assert_eq!(u.params().stream_count, 16);
        assert_eq!(u.params().pending_depth, 16);
    }

    #[test]
    fn lookback_selects_causal_parameters() {
        // Soft threshold of 100 ms: baseline such that 1.75 × b = 100.
        let mut d = download(400.0 / 7.0);
        assert!((d.soft_threshold_ms() - 100.0).abs() < 1e-6);

        d.seed_trial(ParameterSet::new(1, 1), 50.0, 25.0);
        d.seed_trial(ParameterSet::new(2, 1), 95.0, 30.0);
        d.seed_trial(ParameterSet::new(3, 1), 180.0, 35.0);
        d.seed_trial(ParameterSet::new(4, 1), 190.0, 120.0);

        let outcome = d.finish();
        assert_eq!(outcome.optimal, ParameterSet::new(2, 1));
        assert!(outcome.trials[2].is_optimal_outcome);
        assert!(outcome.trials[1].caused_optimal_outcome);

        // Tag cardinality invariant.
        assert_eq!(outcome.trials.iter().filter(|t| t.is_optimal_outcome).count(), 1);
        assert_eq!(
            outcome.trials.iter().filter(|t| t.caused_optimal_outcome).count(),
            1
        );
    }

    #[test]
    fn lookback_first_trial_best_returns_itself() {
        let mut u = upload(20.0);
        u.seed_trial(ParameterSet::new(1, 1), 100.0, 25.0);
        u.seed_trial(ParameterSet::new(1, 2), 40.0, 350.0);
        let outcome = u.finish();
        assert_eq!(outcome.optimal, ParameterSet::new(1, 1));
        assert!(outcome.trials[0].is_optimal_outcome);
        assert!(!outcome.trials[0].caused_optimal_outcome);
        assert!(outcome.trials.iter().all(|t| !t.caused_optimal_outcome));
    }

    #[test]
    fn upload_selection_requires_strict_improvement() {
        let mut u = upload(20.0);
        // Two trials with identical outcomes: the earlier one wins.
        u.seed_trial(ParameterSet::new(2, 2), 100.0, 50.0);
        u.seed_trial(ParameterSet::new(3, 2), 100.0, 50.0);
        let outcome = u.finish();
        assert!(outcome.trials[0].is_optimal_outcome);
    }

    #[test]
    fn download_selection_prefers_near_tie_with_better_throughput() {
        let mut d = download(20.0);
        // Later trial scores slightly lower but within the 0.95 ratio, so
        // the selection moves to it.
        d.seed_trial(ParameterSet::new(3, 1), 180.0, 20.0);
        d.seed_trial(ParameterSet::new(4, 1), 178.0, 22.0);
        let outcome = d.finish();
        assert!(outcome.trials[1].is_optimal_outcome);
        assert_eq!(outcome.optimal, ParameterSet::new(3, 1));
    }

    #[test]
    fn empty_history_falls_back() {
        let d = download(20.0);
        let outcome = d.finish();
        assert_eq!(outcome.optimal, ParameterSet::new(3, 1));
        assert!(outcome.trials.is_empty());

        let u = upload(20.0);
        assert_eq!(u.finish().optimal, ParameterSet::new(2, 2));
    }

    #[test]
    fn forced_backoff_scales_one_parameter() {
        let mut d = download(20.0);
        let now = Instant::now();
        for _ in 0..6 {
            d.observe(good(100.0), now);
        }
        assert_eq!(d.params(), ParameterSet::new(4, 1));

        let p = d.force_backoff(0.5, now);
        assert_eq!(p, ParameterSet::new(2, 1));
    }

    #[test]
    fn forced_backoff_schedules_reramp() {
        let mut d = download(20.0);
        let now = Instant::now();
        for _ in 0..6 {
            d.observe(good(100.0), now);
        }
        d.force_backoff(0.5, now);
        assert_eq!(d.params(), ParameterSet::new(2, 1));

        // Before the timer: measurements accumulate normally but the first
        // sample at the reduced set holds.
        assert_eq!(d.observe(good(90.0), now + Duration::from_secs(1)), StepAction::Hold);

        // After three seconds the scheduled one-step re-ramp fires.
        match d.observe(good(90.0), now + Duration::from_secs(4)) {
            StepAction::Apply(p) => assert_eq!(p, ParameterSet::new(3, 1)),
            other => panic!("expected re-ramp, got {other:?}"),
        }
    }

    #[test]
    fn natural_backoff_cancels_pending_reramp() {
        let mut d = download(20.0);
        let now = Instant::now();
        for _ in 0..6 {
            d.observe(good(100.0), now);
        }
        d.force_backoff(0.5, now);
        assert_eq!(d.params(), ParameterSet::new(2, 1));

        // A hard-cap breach before the re-ramp timer fires both backs off
        // and cancels the pending re-ramp.
        match d.observe(bloated(50.0, 400.0), now + Duration::from_secs(1)) {
            StepAction::Apply(p) => assert_eq!(p, ParameterSet::new(1, 1)),
            other => panic!("expected backoff, got {other:?}"),
        }
        // Well past the original timer: no spontaneous ramp on the first
        // sample at the new set.
        assert_eq!(
            d.observe(good(50.0), now + Duration::from_secs(10)),
            StepAction::Hold
        );
    }

    #[test]
    fn forced_backoff_at_floor_is_harmless() {
        let mut u = upload(20.0);
        let now = Instant::now();
        let p = u.force_backoff(0.9, now);
        assert_eq!(p, ParameterSet::new(1, 1));
    }

    #[test]
    fn trials_record_in_order() {
        let mut d = download(20.0);
        let t0 = Instant::now();
        for i in 0..5u64 {
            d.observe(good(50.0 + i as f64), t0 + Duration::from_millis(300 * i));
        }
        let times: Vec<f64> = d.trials().iter().map(|t| t.time).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(d.trials().len(), 5);
    }
}
