//! # Latency Prober
//!
//! Round-trip probing on its own task so load work never starves it. One
//! `GET /ping` per interval with a cache-defeating nonce; the per-request
//! timeout adapts upward while probes keep timing out, and every timeout
//! yields a synthetic sample so the latency series never goes silent under
//! congestion. Sustained timeouts during a warmup ask the discovery loop to
//! back its parameters off.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

use crate::config::ProbeConfig;
use crate::events::{Event, EventBus};
use crate::phase::PhaseKind;
use crate::session::Recorder;

// ─── Sample ─────────────────────────────────────────────────────────────────

/// One round-trip sample. Timed-out probes produce synthetic values with
/// the flag set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    /// Send instant, seconds since session start.
    pub time: f64,
    /// Measured (or synthetic) round-trip time in ms.
    pub rtt_ms: f64,
    /// Whether this sample is synthetic, from a timed-out probe.
    pub timeout: bool,
    /// Consecutive timeouts up to and including this sample.
    pub consecutive_timeouts: u32,
    /// Phase the probe was sent in.
    pub phase: PhaseKind,
}

// ─── Prober ─────────────────────────────────────────────────────────────────

/// The probing task. Spawned once per session; exits on shutdown.
pub(crate) struct LatencyProber {
    pub(crate) http: reqwest::Client,
    pub(crate) origin: String,
    pub(crate) bus: EventBus,
    pub(crate) recorder: std::sync::Arc<Recorder>,
    pub(crate) phase_rx: watch::Receiver<PhaseKind>,
    pub(crate) cfg: ProbeConfig,
    pub(crate) epoch: Instant,
}

impl LatencyProber {
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let url = format!("{}/ping", self.origin);
        let mut tick = interval(self.cfg.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_timeouts = 0u32;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let phase = *self.phase_rx.borrow();
            let sent_at = Instant::now();
            let time = sent_at.duration_since(self.epoch).as_secs_f64();
            let budget = self.cfg.request_timeout(consecutive_timeouts);

            let rtt_ms = match timeout(budget, self.ping(&url)).await {
                Ok(Ok(())) => Some(sent_at.elapsed().as_secs_f64() * 1e3),
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "probe failed");
                    None
                }
                Err(_) => None,
            };

            let sample = match rtt_ms {
                Some(rtt_ms) => {
                    consecutive_timeouts = 0;
                    LatencySample {
                        time,
                        rtt_ms,
                        timeout: false,
                        consecutive_timeouts: 0,
                        phase,
                    }
                }
                None => {
                    consecutive_timeouts += 1;
                    let sample = LatencySample {
                        time,
                        rtt_ms: self.cfg.synthetic_rtt_ms(consecutive_timeouts),
                        timeout: true,
                        consecutive_timeouts,
                        phase,
                    };
                    if consecutive_timeouts >= self.cfg.backoff_after {
                        if let Some(direction) = phase.warmup_direction() {
                            let factor = self.cfg.backoff_factor(direction);
                            tracing::warn!(
                                %direction,
                                factor,
                                consecutive_timeouts,
                                "sustained probe timeouts, requesting backoff"
                            );
                            self.bus.publish(Event::ForceBackoff { direction, factor });
                        }
                        consecutive_timeouts = self.cfg.counter_reset;
                    }
                    sample
                }
            };

            self.recorder.push_latency(sample);
            self.bus.publish(Event::Latency(sample));
        }
    }

    /// One probe round-trip, including reading the (tiny) body.
    async fn ping(&self, url: &str) -> reqwest::Result<()> {
        let nonce: u64 = rand::random();
        let response = self
            .http
            .get(url)
            .query(&[("nonce", nonce.to_string())])
            .header("Cache-Control", "no-store")
            .header("Pragma", "no-cache")
            .send()
            .await?
            .error_for_status()?;
        let _ = response.bytes().await?;
        Ok(())
    }
}
