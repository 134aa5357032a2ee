//! Preview/apply orchestration for long-running operations.
//!
//! [`OperationOrchestrator`] keeps at most one unit of work open in its
//! engine. Re-applying while a unit is open supersedes it silently; regions
//! the superseded unit may have left half-painted are carried into the next
//! unit's cleanup job. All methods are non-blocking and meant to be called
//! from the UI thread only.

mod config;
mod last_used;

use std::sync::Arc;

use document::{CaptureError, Document, ResourceSnapshot};
use engine::{
    BarrierJob, CleanupJob, ComputeAreaSlot, ComputeJob, OpenUnitError, StrokeEngine, StrokeJob,
    UnitRequest,
};
use filters::{Filter, FilterRegistry};
use model::{DirtyRegionSet, Rect};
use protocol::{
    CancellationKind, CancellationToken, ConfigSnapshotError, IdleBarrier, OperationConfig,
    StrokeHandle, idle_barrier,
};
use smol_str::SmolStr;

pub use config::{CarryForwardPolicy, ConfigLoadError, OrchestratorConfig};
pub use last_used::{
    JsonFileLastUsedStore, LastUsedStore, LastUsedStoreError, MemoryLastUsedStore,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("unknown operation '{name}'")]
    UnknownOperation { name: SmolStr },
    #[error("operation is not applicable: {0}")]
    NotApplicable(#[from] CaptureError),
    #[error(transparent)]
    ConfigSnapshot(#[from] ConfigSnapshotError),
    #[error("engine refused to open a unit: {0}")]
    Engine(#[from] OpenUnitError),
    #[error("no operation has been applied yet")]
    NothingToRepeat,
    #[error("an operation is still running")]
    OperationInProgress,
}

struct RunningUnit {
    handle: StrokeHandle,
    token: CancellationToken,
    barrier: IdleBarrier,
    /// Config as the caller passed it; this is what "last used" remembers.
    requested: OperationConfig,
    config: Arc<OperationConfig>,
    filter: Arc<dyn Filter>,
    snapshot: Arc<ResourceSnapshot>,
    /// Filled by the engine once the preview compute starts.
    area: ComputeAreaSlot,
    /// Regions carried into this unit's cleanup job.
    cleanup: Vec<Rect>,
}

enum State {
    Idle,
    Running(RunningUnit),
}

/// Everything `apply` resolves before it touches any state.
struct PreparedUnit {
    filter: Arc<dyn Filter>,
    config: Arc<OperationConfig>,
    snapshot: Arc<ResourceSnapshot>,
}

pub struct OperationOrchestrator<E: StrokeEngine> {
    engine: E,
    document: Arc<Document>,
    filters: Arc<FilterRegistry>,
    config: OrchestratorConfig,
    last_used_store: Box<dyn LastUsedStore>,
    last_used: Option<OperationConfig>,
    state: State,
    pending_cleanup: DirtyRegionSet,
}

impl<E: StrokeEngine> OperationOrchestrator<E> {
    pub fn new(
        engine: E,
        document: Arc<Document>,
        filters: Arc<FilterRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let store = config.last_used_store();
        Self::with_last_used_store(engine, document, filters, config, store)
    }

    pub fn with_last_used_store(
        engine: E,
        document: Arc<Document>,
        filters: Arc<FilterRegistry>,
        config: OrchestratorConfig,
        last_used_store: Box<dyn LastUsedStore>,
    ) -> Self {
        let last_used = match last_used_store.load() {
            Ok(last_used) => last_used,
            Err(error) => {
                tracing::warn!(%error, "ignoring unreadable last used operation");
                None
            }
        };
        Self {
            engine,
            document,
            filters,
            config,
            last_used_store,
            last_used,
            state: State::Idle,
            pending_cleanup: DirtyRegionSet::new(),
        }
    }

    /// Starts previewing `config`, superseding the running unit if any.
    ///
    /// Rejections leave the orchestrator exactly as it was, except for an
    /// engine refusing to open the new unit: the superseded unit is gone by
    /// then and the orchestrator ends up idle.
    pub fn apply(&mut self, config: &OperationConfig) -> Result<(), ApplyError> {
        let prepared = match self.prepare(config) {
            Ok(prepared) => prepared,
            Err(error) => {
                tracing::warn!(operation = config.name(), %error, "apply rejected");
                return Err(error);
            }
        };
        if let State::Running(running) = std::mem::replace(&mut self.state, State::Idle) {
            self.supersede(running);
        }
        self.open(config.clone(), prepared)
    }

    /// Commits the running unit as one undoable action.
    ///
    /// # Panics
    ///
    /// When no unit is running.
    pub fn finish(&mut self) {
        let State::Running(running) = std::mem::replace(&mut self.state, State::Idle) else {
            panic!("finish called with no running operation");
        };
        if self.config.fan_out_to_selected_frames {
            self.fan_out(&running);
        }
        self.engine.close_unit(running.handle);
        self.pending_cleanup.clear();
        tracing::debug!(
            handle = ?running.handle,
            operation = running.requested.name(),
            "operation finished"
        );

        if let Err(error) = self.last_used_store.store(&running.requested) {
            tracing::warn!(%error, "could not persist last used operation");
        }
        self.last_used = Some(running.requested);
    }

    /// Abandons the running unit; the engine rolls it back visibly.
    ///
    /// # Panics
    ///
    /// When no unit is running.
    pub fn cancel(&mut self) {
        let State::Running(running) = std::mem::replace(&mut self.state, State::Idle) else {
            panic!("cancel called with no running operation");
        };
        running.token.request(CancellationKind::Visible);
        self.engine.cancel_unit(running.handle);
        self.pending_cleanup.clear();
        tracing::debug!(
            handle = ?running.handle,
            operation = running.requested.name(),
            "operation cancelled"
        );
    }

    /// Applies and immediately finishes the last used operation.
    pub fn repeat_last(&mut self) -> Result<(), ApplyError> {
        if self.is_stroke_running() {
            return Err(ApplyError::OperationInProgress);
        }
        let config = self.last_used.clone().ok_or(ApplyError::NothingToRepeat)?;
        self.apply(&config)?;
        self.finish();
        Ok(())
    }

    pub fn is_stroke_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// `true` unless the running unit's barrier has not been reached yet.
    pub fn is_idle(&self) -> bool {
        match &self.state {
            State::Idle => true,
            State::Running(running) => running.barrier.is_released(),
        }
    }

    pub fn running_handle(&self) -> Option<StrokeHandle> {
        match &self.state {
            State::Idle => None,
            State::Running(running) => Some(running.handle),
        }
    }

    pub fn current_config(&self) -> Option<&OperationConfig> {
        match &self.state {
            State::Idle => None,
            State::Running(running) => Some(&running.requested),
        }
    }

    pub fn last_used_config(&self) -> Option<&OperationConfig> {
        self.last_used.as_ref()
    }

    pub fn pending_cleanup_regions(&self) -> &[Rect] {
        self.pending_cleanup.as_slice()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    fn prepare(&self, config: &OperationConfig) -> Result<PreparedUnit, ApplyError> {
        let filter =
            self.filters
                .get(config.name())
                .ok_or_else(|| ApplyError::UnknownOperation {
                    name: SmolStr::new(config.name()),
                })?;
        let snapshot = ResourceSnapshot::capture(&self.document)?;
        let resources = self.document.resources();
        let config = config.snapshot_with_resources(&*resources)?;
        Ok(PreparedUnit {
            filter,
            config: Arc::new(config),
            snapshot: Arc::new(snapshot),
        })
    }

    fn supersede(&mut self, running: RunningUnit) {
        // Cancelling abandons the barrier, so read it first.
        let busy = !running.barrier.is_released();
        running.token.request(CancellationKind::Silent);
        self.engine.cancel_unit(running.handle);

        // Its own preview counts only while unfinished. Inherited regions are
        // always kept: the cleanup job sits behind the barrier and is dropped
        // with the unit either way.
        let touched = running
            .area
            .get()
            .filter(|_| busy)
            .map(|area| [area.process_rect, area.update_rect]);
        match (self.config.carry_forward, touched) {
            (CarryForwardPolicy::Accumulate, touched) => {
                self.pending_cleanup.extend(running.cleanup);
                self.pending_cleanup.extend(touched.into_iter().flatten());
            }
            (CarryForwardPolicy::Replace, Some(touched)) => self.pending_cleanup.replace(touched),
            (CarryForwardPolicy::Replace, None) => self.pending_cleanup.extend(running.cleanup),
        }
        tracing::debug!(
            handle = ?running.handle,
            operation = running.requested.name(),
            pending_cleanup = self.pending_cleanup.len(),
            "running operation superseded"
        );
    }

    fn open(
        &mut self,
        requested: OperationConfig,
        prepared: PreparedUnit,
    ) -> Result<(), ApplyError> {
        let token = CancellationToken::new();
        let request = UnitRequest {
            label: SmolStr::new(requested.name()),
            node: prepared.snapshot.node(),
            token: token.clone(),
        };
        let handle = match self.engine.open_unit(request) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(operation = requested.name(), %error, "engine refused operation");
                return Err(error.into());
            }
        };

        let (barrier, signal) = idle_barrier();
        let area = ComputeAreaSlot::new();
        self.engine.submit(
            handle,
            StrokeJob::Compute(ComputeJob {
                snapshot: Arc::clone(&prepared.snapshot),
                config: Arc::clone(&prepared.config),
                filter: Arc::clone(&prepared.filter),
                frame: prepared.snapshot.active_frame(),
                area: area.clone(),
            }),
        );
        self.engine
            .submit(handle, StrokeJob::Barrier(BarrierJob { signal }));
        let cleanup = self.pending_cleanup.take();
        if !cleanup.is_empty() {
            self.engine.submit(
                handle,
                StrokeJob::Cleanup(CleanupJob {
                    regions: cleanup.clone(),
                }),
            );
        }

        tracing::debug!(
            ?handle,
            operation = requested.name(),
            frame = prepared.snapshot.active_frame(),
            cleanup = cleanup.len(),
            "operation started"
        );
        self.state = State::Running(RunningUnit {
            handle,
            token,
            barrier,
            requested,
            config: prepared.config,
            filter: prepared.filter,
            snapshot: prepared.snapshot,
            area,
            cleanup,
        });
        Ok(())
    }

    /// Queues the running operation for every other selected frame. Times
    /// that share a frame are computed once, and the previewed frame is
    /// never computed again.
    fn fan_out(&mut self, running: &RunningUnit) {
        let device = running.snapshot.device();
        if !device.is_animated() {
            return;
        }
        let selected_times = self.document.selected_times();
        let previewed = running.snapshot.active_frame();
        for frame in device.unique_frames_at(selected_times.iter().copied()) {
            if frame == previewed {
                continue;
            }
            self.engine.submit(
                running.handle,
                StrokeJob::Compute(ComputeJob {
                    snapshot: Arc::clone(&running.snapshot),
                    config: Arc::clone(&running.config),
                    filter: Arc::clone(&running.filter),
                    frame,
                    area: ComputeAreaSlot::new(),
                }),
            );
        }
    }
}

impl<E: StrokeEngine> Drop for OperationOrchestrator<E> {
    fn drop(&mut self) {
        if let State::Running(running) = std::mem::replace(&mut self.state, State::Idle) {
            running.token.request(CancellationKind::Silent);
            self.engine.cancel_unit(running.handle);
            tracing::debug!(handle = ?running.handle, "running operation dropped");
        }
    }
}
