//! # Phase Barrier
//!
//! Synchronous checkpoint between phases: commands the stream manager to
//! terminate every active stream, waits a fixed quiescence interval, then
//! verifies the registry actually drained. Verification re-checks with
//! exponentially spaced delays; if streams still survive after the last
//! round the registry is forcibly reset and the session continues. A
//! barrier never aborts a transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::BarrierConfig;
use crate::manager::StreamManager;

/// Outcome of one barrier enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// The registry drained within the verification window.
    Verified,
    /// Verification failed and the registry was forcibly reset.
    ForcedReset,
}

/// Phase-boundary barrier over the stream registry.
pub struct PhaseBarrier {
    manager: Arc<StreamManager>,
    cfg: BarrierConfig,
}

impl PhaseBarrier {
    pub fn new(manager: Arc<StreamManager>, cfg: BarrierConfig) -> Self {
        PhaseBarrier { manager, cfg }
    }

    /// Terminate everything and wait until the registry is verifiably empty.
    pub async fn enforce(&self) -> BarrierOutcome {
        self.manager.terminate_all();
        sleep(self.cfg.quiescence).await;

        let mut delay = self.cfg.verify_initial_delay;
        for round in 0..self.cfg.verify_rounds {
            let counts = self.manager.active_counts();
            if counts.total == 0 {
                tracing::debug!(rounds = round, "barrier verified");
                return BarrierOutcome::Verified;
            }
            tracing::debug!(
                round,
                download = counts.download,
                upload = counts.upload,
                delay_ms = delay.as_millis() as u64,
                "streams still registered, re-checking"
            );
            sleep(delay).await;
            delay = (delay * 2).min(self.cfg.verify_max_delay);
        }

        let counts = self.manager.active_counts();
        tracing::warn!(
            download = counts.download,
            upload = counts.upload,
            "barrier verification failed, forcing registry reset"
        );
        self.manager.reset_registry();
        BarrierOutcome::ForcedReset
    }
}

/// Exponential verification delays, capped. Mirrors the loop in `enforce`.
#[cfg(test)]
fn verification_delays(cfg: &BarrierConfig) -> Vec<Duration> {
    let mut delays = Vec::with_capacity(cfg.verify_rounds as usize);
    let mut delay = cfg.verify_initial_delay;
    for _ in 0..cfg.verify_rounds {
        delays.push(delay);
        delay = (delay * 2).min(cfg.verify_max_delay);
    }
    delays
}
