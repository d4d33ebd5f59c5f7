//! # Event Bus
//!
//! Single broadcast channel carrying every engine event: phase transitions,
//! stream lifecycle, throughput and latency samples, and the control events
//! the engine accepts from outside (forced backoff, minimum warmup duration).
//!
//! Control events are low-rate and effectively lossless at the configured
//! capacity; sample consumers are expected to tolerate a lagged receiver by
//! skipping to the next sample.
//!
//! Every payload is a tagged serde variant with a fixed schema, so external
//! subscribers (a UI layer, a recorder) can match on the tag and never need
//! runtime type inspection.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::phase::PhaseKind;
use crate::probe::LatencySample;
use crate::throughput::ThroughputSample;

// ─── Direction ──────────────────────────────────────────────────────────────

/// Transfer direction, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    /// Both directions, download first.
    pub const ALL: [Direction; 2] = [Direction::Download, Direction::Upload];
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

// ─── Event Payloads ─────────────────────────────────────────────────────────

/// Whether a phase event marks the start or the end of the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEdge {
    Start,
    End,
}

/// Payload of a `phase.change` event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseChange {
    /// Start or end edge.
    pub edge: PhaseEdge,
    /// The phase this edge belongs to.
    pub phase: PhaseKind,
    /// Seconds since session start.
    pub time: f64,
    /// Seconds this phase had been running at the edge (zero on start).
    pub phase_elapsed: f64,
}

/// Stream lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAction {
    Created,
    Terminated,
}

/// Payload of a `stream.lifecycle` event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamLifecycle {
    pub action: StreamAction,
    pub stream_id: u64,
    pub direction: Direction,
    /// Seconds since session start.
    pub time: f64,
}

// ─── Event ──────────────────────────────────────────────────────────────────

/// Everything that travels on the engine bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A phase started or ended.
    #[serde(rename = "phase.change")]
    PhaseChange(PhaseChange),

    /// A stream was registered or removed.
    #[serde(rename = "stream.lifecycle")]
    StreamLifecycle(StreamLifecycle),

    /// The registry was forcibly reset.
    #[serde(rename = "stream.reset")]
    StreamReset {
        /// Seconds since session start.
        time: f64,
    },

    /// A throughput sample for one direction.
    #[serde(rename = "throughput")]
    Throughput(ThroughputSample),

    /// A round-trip latency sample (or synthetic timeout sample).
    #[serde(rename = "latency")]
    Latency(LatencySample),

    /// Request that the active warmup back its parameters off by `factor`.
    #[serde(rename = "force_backoff")]
    ForceBackoff { direction: Direction, factor: f64 },

    /// Override the minimum warmup duration for one direction.
    #[serde(rename = "set_min_duration")]
    SetMinDuration {
        direction: Direction,
        min_duration_ms: u64,
    },
}

// ─── Bus ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the engine's broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publish an event. A bus with no subscribers swallows the event.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_change_wire_shape() {
        let ev = Event::PhaseChange(PhaseChange {
            edge: PhaseEdge::Start,
            phase: PhaseKind::DownloadWarmup,
            time: 5.2,
            phase_elapsed: 0.0,
        });
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"phase.change\""));
        assert!(json.contains("\"edge\":\"start\""));
        assert!(json.contains("download_warmup"));
    }

    #[test]
    fn lifecycle_wire_shape() {
        let ev = Event::StreamLifecycle(StreamLifecycle {
            action: StreamAction::Terminated,
            stream_id: 42,
            direction: Direction::Upload,
            time: 12.0,
        });
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("stream.lifecycle"));
        assert!(json.contains("\"stream_id\":42"));
        assert!(json.contains("\"direction\":\"upload\""));
    }

    #[test]
    fn control_events_round_trip() {
        let ev = Event::ForceBackoff {
            direction: Direction::Download,
            factor: 0.5,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        match back {
            Event::ForceBackoff { direction, factor } => {
                assert_eq!(direction, Direction::Download);
                assert_eq!(factor, 0.5);
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let ev = Event::SetMinDuration {
            direction: Direction::Upload,
            min_duration_ms: 20_000,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("set_min_duration"));
        assert!(json.contains("20000"));
    }

    #[tokio::test]
    async fn bus_fan_out() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::StreamReset { time: 1.0 });

        assert!(matches!(a.recv().await.unwrap(), Event::StreamReset { .. }));
        assert!(matches!(b.recv().await.unwrap(), Event::StreamReset { .. }));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(Event::StreamReset { time: 0.0 });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
