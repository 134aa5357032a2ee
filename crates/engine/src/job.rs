use std::fmt;
use std::sync::{Arc, OnceLock};

use document::{PixelBuffer, ResourceSnapshot};
use filters::Filter;
use model::{FrameId, Rect};
use protocol::{BarrierSignal, OperationConfig};

/// Applies a filter over one frame of the snapshot's device.
///
/// The area is not fixed at submission: the engine resolves it from the
/// frame as it finds it when the job starts, after every earlier unit's
/// rollback has landed, and publishes it through `area`.
pub struct ComputeJob {
    pub snapshot: Arc<ResourceSnapshot>,
    pub config: Arc<OperationConfig>,
    pub filter: Arc<dyn Filter>,
    pub frame: FrameId,
    pub area: ComputeAreaSlot,
}

impl ComputeJob {
    /// Works out the job's area from `source`, the frame it is about to read.
    pub fn resolve_area(&self, source: &PixelBuffer) -> ComputeArea {
        let device_bounds = source.bounds();
        let area = if self.filter.needs_full_document_context() {
            self.snapshot.document_bounds()
        } else {
            source.exact_bounds()
        };
        let process_rect = self
            .snapshot
            .clip_to_selection(area.intersect(device_bounds));
        let update_rect = self.snapshot.clip_to_selection(
            self.filter
                .changed_rect(process_rect, &self.config)
                .intersect(device_bounds),
        );
        ComputeArea {
            process_rect,
            update_rect,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ComputeArea {
    /// Pixels the filter's input covers.
    pub process_rect: Rect,
    /// Pixels the job rewrites: `process_rect` grown by the filter's reach,
    /// clipped to the device and the selection.
    pub update_rect: Rect,
}

impl ComputeArea {
    pub const EMPTY: Self = Self {
        process_rect: Rect::EMPTY,
        update_rect: Rect::EMPTY,
    };
}

/// Filled once by the engine when the compute job starts.
#[derive(Debug, Default, Clone)]
pub struct ComputeAreaSlot(Arc<OnceLock<ComputeArea>>);

impl ComputeAreaSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the engine has started the job.
    pub fn get(&self) -> Option<ComputeArea> {
        self.0.get().copied()
    }

    pub(crate) fn publish(&self, area: ComputeArea) {
        if self.0.set(area).is_err() {
            panic!("compute area published twice");
        }
    }
}

impl fmt::Debug for ComputeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeJob")
            .field("filter", &self.filter.id())
            .field("config", &self.config.name())
            .field("node", &self.snapshot.node())
            .field("frame", &self.frame)
            .field("area", &self.area.get())
            .finish()
    }
}

/// Does no visible work; being dequeued proves every earlier job of the
/// unit has finished.
#[derive(Debug)]
pub struct BarrierJob {
    pub signal: BarrierSignal,
}

/// Repaints regions left stale by a superseded unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupJob {
    pub regions: Vec<Rect>,
}

#[derive(Debug)]
pub enum StrokeJob {
    Compute(ComputeJob),
    Barrier(BarrierJob),
    Cleanup(CleanupJob),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Compute,
    Barrier,
    Cleanup,
}

impl StrokeJob {
    pub fn kind(&self) -> JobKind {
        match self {
            StrokeJob::Compute(_) => JobKind::Compute,
            StrokeJob::Barrier(_) => JobKind::Barrier,
            StrokeJob::Cleanup(_) => JobKind::Cleanup,
        }
    }
}
