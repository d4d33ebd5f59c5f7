//! # silt-engine
//!
//! Client-side bufferbloat measurement engine. Runs one time-bounded
//! session against a cooperative HTTP origin (`GET /ping`, `GET /download`,
//! `POST /upload`): a quiet baseline, a download-saturation interval, an
//! upload-saturation interval and a bidirectional interval, each load
//! interval preceded by a warmup that discovers the stream count and
//! pending-request depth that saturate the link without collapsing latency.
//!
//! ## Crate structure
//!
//! - [`session`] — session orchestration, sample recorder, final report
//! - [`phase`] — phase schedule and controller
//! - [`barrier`] — phase-boundary stream drain and verification
//! - [`manager`] — stream registry, byte accounting, saturation operations
//! - [`discovery`] — warmup parameter exploration and causal selection
//! - [`throughput`] — fixed-cadence throughput sampling and smoothing
//! - [`probe`] — independent round-trip latency probing
//! - [`events`] — broadcast bus and the tagged event model
//! - [`config`] — every tunable, with production defaults
//!
//! ## Quick start
//!
//! ```no_run
//! use silt_engine::{EngineConfig, Session};
//!
//! # async fn run() -> Result<(), silt_engine::EngineError> {
//! let (session, handle) = Session::new(EngineConfig::new("http://localhost:8080"))?;
//! # let _ = handle;
//! let report = session.run().await?;
//! println!("upload bloat: {:?} ms", report.latency_delta_ms(silt_engine::PhaseKind::Upload));
//! # Ok(())
//! # }
//! ```

pub mod barrier;
pub mod config;
pub mod discovery;
mod download;
pub mod error;
pub mod events;
pub mod manager;
pub mod phase;
pub mod probe;
pub mod session;
pub mod throughput;
mod upload;

pub use barrier::{BarrierOutcome, PhaseBarrier};
pub use config::{
    BarrierConfig, DiscoveryTuning, DownloadConfig, EngineConfig, ManagerConfig, MonitorConfig,
    PhaseSchedule, ProbeConfig, SpawnConfig, UploadConfig,
};
pub use discovery::{
    fallback_params, Discovery, DiscoveryOutcome, Measurement, ParameterSet, StepAction, Trial,
};
pub use error::EngineError;
pub use events::{Direction, Event, EventBus, PhaseChange, PhaseEdge, StreamAction, StreamLifecycle};
pub use manager::{ActiveCounts, StreamManager};
pub use phase::{PhaseController, PhaseKind, PhaseSummary};
pub use probe::LatencySample;
pub use session::{Recorder, Session, SessionHandle, SessionReport};
pub use throughput::{Ewma, ThroughputSample};
