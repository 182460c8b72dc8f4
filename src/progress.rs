//! Pipeline state machine and the observer trait for stage events.
//!
//! Inject an [`Arc<dyn IngestObserver>`](IngestObserver) via
//! [`crate::ingest::Ingestor::with_observer`] to receive every state
//! transition of every run.
//!
//! The CLI drives its spinner from these events and the integration tests
//! record the stages a run entered. The trait is `Send + Sync`: concurrent
//! uploads share one observer.
//!
//! # Example
//!
//! ```rust
//! use bizcard_ingest::{IngestObserver, PipelineState};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingObserver {
//!     completed: AtomicUsize,
//! }
//!
//! impl IngestObserver for CountingObserver {
//!     fn on_transition(&self, _job: &str, _from: &PipelineState, to: &PipelineState) {
//!         if matches!(to, PipelineState::Completed) {
//!             self.completed.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//! ```

use crate::error::Stage;
use std::fmt;
use std::sync::Arc;

/// Where one pipeline run currently is.
///
/// Transitions only move forward along
/// `Received → Persisting → Recognizing → Extracting → Normalizing → Sinking → Completed`;
/// `Failed` is reachable from any non-terminal state and absorbs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Persisting,
    Recognizing,
    Extracting,
    Normalizing,
    Sinking,
    Completed,
    Failed { stage: Stage, cause: String },
}

impl PipelineState {
    /// The state that follows a successful stage, or `None` if terminal.
    pub fn next(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Received => Some(PipelineState::Persisting),
            PipelineState::Persisting => Some(PipelineState::Recognizing),
            PipelineState::Recognizing => Some(PipelineState::Extracting),
            PipelineState::Extracting => Some(PipelineState::Normalizing),
            PipelineState::Normalizing => Some(PipelineState::Sinking),
            PipelineState::Sinking => Some(PipelineState::Completed),
            PipelineState::Completed | PipelineState::Failed { .. } => None,
        }
    }

    /// The stage running in this state, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Received => Some(Stage::Upload),
            PipelineState::Persisting => Some(Stage::Persist),
            PipelineState::Recognizing => Some(Stage::Recognize),
            PipelineState::Extracting => Some(Stage::Extract),
            PipelineState::Normalizing => Some(Stage::Normalize),
            PipelineState::Sinking => Some(Stage::Sink),
            PipelineState::Completed | PipelineState::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed { .. })
    }

    /// Move to `Failed`, attributing the failure to the stage running now.
    ///
    /// A terminal state stays as it is.
    pub fn fail(&self, cause: impl Into<String>) -> PipelineState {
        match self.stage() {
            Some(stage) => PipelineState::Failed {
                stage,
                cause: cause.into(),
            },
            None => self.clone(),
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Received => f.write_str("received"),
            PipelineState::Persisting => f.write_str("persisting"),
            PipelineState::Recognizing => f.write_str("recognizing"),
            PipelineState::Extracting => f.write_str("extracting"),
            PipelineState::Normalizing => f.write_str("normalizing"),
            PipelineState::Sinking => f.write_str("sinking"),
            PipelineState::Completed => f.write_str("completed"),
            PipelineState::Failed { stage, .. } => write!(f, "failed at {stage}"),
        }
    }
}

/// Called by the orchestrator on every state transition.
///
/// `job` is the upload's file name, which is the only identity a run has
/// before its locator is issued. Implementations may be called concurrently
/// from different requests and must synchronise their own state.
pub trait IngestObserver: Send + Sync {
    fn on_transition(&self, job: &str, from: &PipelineState, to: &PipelineState) {
        let _ = (job, from, to);
    }
}

/// Type alias for a shareable observer.
pub type Observer = Arc<dyn IngestObserver>;
