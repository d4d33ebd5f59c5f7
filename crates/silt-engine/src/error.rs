//! Engine error type.
//!
//! Loaders absorb transport errors internally (a failed stream is terminated
//! and replaced by the next refill or reconcile cycle), so very little
//! surfaces to the caller: an out-of-order phase transition is fatal for the
//! session, and HTTP client construction can fail before anything runs.

use thiserror::Error;

use crate::phase::PhaseKind;

/// Errors surfaced by the measurement engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A phase was requested out of order. Fatal for the session.
    #[error("invalid phase transition to {requested} (current: {current:?})")]
    InvalidTransition {
        /// The phase the session was in, if any.
        current: Option<PhaseKind>,
        /// The phase that was illegally requested.
        requested: PhaseKind,
    },

    /// The HTTP client could not be constructed.
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}
