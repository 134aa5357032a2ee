use std::sync::Arc;

use document::{NodeId, ResourceSnapshot};
use model::{FrameId, Rect};
use protocol::{BarrierSignal, CancellationKind, CancellationToken, OperationConfig, StrokeHandle};
use slotmap::SlotMap;
use smol_str::SmolStr;

use crate::{
    BarrierJob, CleanupJob, ComputeArea, OpenUnitError, StrokeEngine, StrokeJob, UnitRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedJob {
    Compute {
        operation: SmolStr,
        frame: FrameId,
        process_rect: Rect,
        update_rect: Rect,
    },
    Barrier,
    Cleanup {
        regions: Vec<Rect>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Open {
        handle: StrokeHandle,
        label: SmolStr,
        node: NodeId,
    },
    Submit {
        handle: StrokeHandle,
        job: RecordedJob,
    },
    Close {
        handle: StrokeHandle,
    },
    /// `token_kind` is what the unit's token held when the cancel arrived.
    Cancel {
        handle: StrokeHandle,
        token_kind: Option<CancellationKind>,
    },
}

/// Engine double that executes nothing. Compute areas are resolved against
/// the device on submission. Barrier jobs stay pending until the test
/// satisfies them, which models a worker that has not caught up yet.
#[derive(Default)]
pub struct RecordingEngine {
    calls: Vec<EngineCall>,
    open_units: SlotMap<StrokeHandle, CancellationToken>,
    max_open_units: usize,
    pending_barriers: Vec<(StrokeHandle, BarrierSignal)>,
    snapshots: Vec<Arc<ResourceSnapshot>>,
    configs: Vec<Arc<OperationConfig>>,
    fail_next_open: Option<OpenUnitError>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[EngineCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<EngineCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn open_unit_count(&self) -> usize {
        self.open_units.len()
    }

    /// Highest number of simultaneously open units seen so far.
    pub fn max_open_units(&self) -> usize {
        self.max_open_units
    }

    pub fn is_open(&self, handle: StrokeHandle) -> bool {
        self.open_units.contains_key(handle)
    }

    pub fn token(&self, handle: StrokeHandle) -> Option<&CancellationToken> {
        self.open_units.get(handle)
    }

    /// Snapshots of every compute job, in submission order.
    pub fn snapshots(&self) -> &[Arc<ResourceSnapshot>] {
        &self.snapshots
    }

    /// Configs of every compute job, in submission order.
    pub fn configs(&self) -> &[Arc<OperationConfig>] {
        &self.configs
    }

    pub fn pending_barrier_count(&self) -> usize {
        self.pending_barriers.len()
    }

    /// Makes the next `open_unit` call fail with `error`.
    pub fn fail_next_open(&mut self, error: OpenUnitError) {
        self.fail_next_open = Some(error);
    }

    /// Satisfies every pending barrier of `handle`; returns how many.
    pub fn satisfy_barriers(&mut self, handle: StrokeHandle) -> usize {
        let (matching, rest) = std::mem::take(&mut self.pending_barriers)
            .into_iter()
            .partition::<Vec<_>, _>(|(owner, _)| *owner == handle);
        self.pending_barriers = rest;
        let count = matching.len();
        for (_, signal) in matching {
            signal.satisfy();
        }
        count
    }

    pub fn satisfy_all_barriers(&mut self) -> usize {
        let count = self.pending_barriers.len();
        for (_, signal) in self.pending_barriers.drain(..) {
            signal.satisfy();
        }
        count
    }

    fn require_open(&self, handle: StrokeHandle, action: &str) {
        if !self.open_units.contains_key(handle) {
            panic!("{action} stroke {handle:?} which is not open");
        }
    }
}

impl StrokeEngine for RecordingEngine {
    fn open_unit(&mut self, request: UnitRequest) -> Result<StrokeHandle, OpenUnitError> {
        if let Some(error) = self.fail_next_open.take() {
            return Err(error);
        }
        let handle = self.open_units.insert(request.token);
        self.max_open_units = self.max_open_units.max(self.open_units.len());
        self.calls.push(EngineCall::Open {
            handle,
            label: request.label,
            node: request.node,
        });
        Ok(handle)
    }

    fn submit(&mut self, handle: StrokeHandle, job: StrokeJob) {
        self.require_open(handle, "submit to");
        let recorded = match job {
            StrokeJob::Compute(compute) => {
                // Resolved as if the job started on submission.
                let area = compute
                    .snapshot
                    .device()
                    .read_frame(compute.frame, |source| compute.resolve_area(source))
                    .unwrap_or(ComputeArea::EMPTY);
                compute.area.publish(area);
                let recorded = RecordedJob::Compute {
                    operation: SmolStr::new(compute.config.name()),
                    frame: compute.frame,
                    process_rect: area.process_rect,
                    update_rect: area.update_rect,
                };
                self.snapshots.push(compute.snapshot);
                self.configs.push(compute.config);
                recorded
            }
            StrokeJob::Barrier(BarrierJob { signal }) => {
                self.pending_barriers.push((handle, signal));
                RecordedJob::Barrier
            }
            StrokeJob::Cleanup(CleanupJob { regions }) => RecordedJob::Cleanup { regions },
        };
        self.calls.push(EngineCall::Submit {
            handle,
            job: recorded,
        });
    }

    fn close_unit(&mut self, handle: StrokeHandle) {
        self.require_open(handle, "close");
        self.open_units.remove(handle);
        self.calls.push(EngineCall::Close { handle });
    }

    fn cancel_unit(&mut self, handle: StrokeHandle) {
        self.require_open(handle, "cancel");
        let token_kind = self.open_units.remove(handle).and_then(|token| token.kind());
        // A cancelled unit never reaches its queued barriers.
        self.pending_barriers.retain(|(owner, _)| *owner != handle);
        self.calls.push(EngineCall::Cancel { handle, token_kind });
    }
}
