//! Execution side of operation application.
//!
//! The orchestrator only talks to [`StrokeEngine`]: open a unit of work,
//! queue jobs into it, then close or cancel it. [`ThreadedStrokeEngine`] is
//! the in-process implementation that runs jobs on a worker thread.

mod backups;
mod job;
#[cfg(any(test, feature = "test-helpers"))]
mod recording;
mod threaded;

use document::NodeId;
use model::{FrameId, Rect};
use protocol::{CancellationKind, CancellationToken, StrokeHandle};
use smol_str::SmolStr;

pub use job::{
    BarrierJob, CleanupJob, ComputeArea, ComputeAreaSlot, ComputeJob, JobKind, StrokeJob,
};
#[cfg(any(test, feature = "test-helpers"))]
pub use recording::{EngineCall, RecordedJob, RecordingEngine};
pub use threaded::{EngineConfig, EngineFeedbackReceiver, EngineStartError, ThreadedStrokeEngine};

#[derive(Debug, Clone)]
pub struct UnitRequest {
    pub label: SmolStr,
    pub node: NodeId,
    /// Consulted by the engine when it handles a cancellation of this unit.
    pub token: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OpenUnitError {
    #[error("target node {0:?} does not exist")]
    NodeMissing(NodeId),
    #[error("target node {0:?} has no backing paint device")]
    NoBackingStore(NodeId),
}

/// Contract between the orchestrator and whatever executes its jobs.
///
/// Jobs of one unit are dequeued in submission order. Calling `submit`,
/// `close_unit` or `cancel_unit` on a handle that was already closed or
/// cancelled is a protocol violation.
pub trait StrokeEngine {
    fn open_unit(&mut self, request: UnitRequest) -> Result<StrokeHandle, OpenUnitError>;

    fn submit(&mut self, handle: StrokeHandle, job: StrokeJob);

    /// Ends the unit normally; its effects become one undoable action.
    fn close_unit(&mut self, handle: StrokeHandle);

    /// Ends the unit abnormally. How loudly depends on the unit's token at
    /// the time the engine handles the cancellation.
    fn cancel_unit(&mut self, handle: StrokeHandle);
}

/// Out-of-band reports from the engine to the UI thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitFeedback {
    /// Regions that need repainting. `frame` is `None` for cleanup and
    /// rollback repaints.
    RegionsUpdated {
        handle: StrokeHandle,
        frame: Option<FrameId>,
        regions: Vec<Rect>,
    },
    BarrierReached {
        handle: StrokeHandle,
    },
    /// Never emitted for silently cancelled units.
    JobFailed {
        handle: StrokeHandle,
        message: String,
    },
    Completed {
        handle: StrokeHandle,
        undo_index: usize,
    },
    Cancelled {
        handle: StrokeHandle,
        kind: CancellationKind,
    },
}

impl UnitFeedback {
    /// Events the UI cannot reconstruct later. The engine holds these back
    /// instead of dropping them when the feedback queue is full.
    pub fn must_deliver(&self) -> bool {
        matches!(
            self,
            UnitFeedback::JobFailed { .. }
                | UnitFeedback::Completed { .. }
                | UnitFeedback::Cancelled { .. }
        )
    }
}
