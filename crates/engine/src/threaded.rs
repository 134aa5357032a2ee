use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use document::{Document, NodeId, NodeKind, PaintDevice, PixelBuffer, UndoEntry};
use filters::{FilterContext, FilterError};
use model::{DirtyRegionSet, FrameId};
use protocol::{CancellationKind, CancellationToken, StrokeHandle};
use slotmap::SlotMap;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::backups::UnitBackups;
use crate::{
    BarrierJob, CleanupJob, ComputeArea, ComputeJob, OpenUnitError, StrokeEngine, StrokeJob,
    UnitFeedback, UnitRequest,
};

const BACKLOG_RETRY: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Slots in the feedback queue. Events that must be delivered wait in a
    /// worker-side backlog while it is full; repaint hints are dropped.
    pub feedback_capacity: usize,
    pub worker_name: String,
    /// Compute jobs poll for cancellation between bands of this many rows.
    pub rows_per_cancel_check: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feedback_capacity: 256,
            worker_name: "stroke_engine".to_owned(),
            rows_per_cancel_check: 16,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineStartError {
    #[error("feedback queue capacity must be non-zero")]
    ZeroFeedbackCapacity,
    #[error("rows per cancellation check must be non-zero")]
    ZeroRowsPerCancelCheck,
    #[error("spawn stroke engine worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct EngineFeedbackReceiver {
    consumer: rtrb::Consumer<UnitFeedback>,
}

impl EngineFeedbackReceiver {
    pub fn pop_feedback(&mut self) -> Option<UnitFeedback> {
        self.consumer.pop().ok()
    }

    pub fn drain(&mut self) -> Vec<UnitFeedback> {
        let mut drained = Vec::with_capacity(self.consumer.slots());
        while let Ok(feedback) = self.consumer.pop() {
            drained.push(feedback);
        }
        drained
    }
}

#[derive(Debug)]
struct UnitControl {
    cancel_requested: Arc<AtomicBool>,
}

enum WorkerCommand {
    Open {
        handle: StrokeHandle,
        label: SmolStr,
        node: NodeId,
        device: Arc<PaintDevice>,
        token: CancellationToken,
        cancel_requested: Arc<AtomicBool>,
    },
    Job {
        handle: StrokeHandle,
        job: StrokeJob,
    },
    Close {
        handle: StrokeHandle,
    },
    Cancel {
        handle: StrokeHandle,
    },
    Shutdown,
}

/// Runs every unit's jobs in submission order on one worker thread and
/// writes results straight into the target paint device.
///
/// Pixels overwritten by a unit are backed up until the unit ends, so a
/// cancelled unit leaves the device exactly as it found it.
pub struct ThreadedStrokeEngine {
    document: Arc<Document>,
    units: SlotMap<StrokeHandle, UnitControl>,
    command_sender: Sender<WorkerCommand>,
    join_handle: Option<JoinHandle<()>>,
}

impl ThreadedStrokeEngine {
    pub fn start(
        document: Arc<Document>,
        config: EngineConfig,
    ) -> Result<(Self, EngineFeedbackReceiver), EngineStartError> {
        if config.feedback_capacity == 0 {
            return Err(EngineStartError::ZeroFeedbackCapacity);
        }
        if config.rows_per_cancel_check == 0 {
            return Err(EngineStartError::ZeroRowsPerCancelCheck);
        }
        let (feedback_producer, feedback_consumer) =
            rtrb::RingBuffer::new(config.feedback_capacity);
        let (command_sender, command_receiver) = crossbeam_channel::unbounded();
        let worker_document = Arc::clone(&document);
        let rows_per_cancel_check = config.rows_per_cancel_check;

        let join_handle = std::thread::Builder::new()
            .name(config.worker_name.clone())
            .spawn(move || {
                stroke_engine_loop(
                    worker_document,
                    rows_per_cancel_check,
                    command_receiver,
                    FeedbackSender::new(feedback_producer),
                )
            })?;
        tracing::debug!(worker = %config.worker_name, "stroke engine started");

        Ok((
            Self {
                document,
                units: SlotMap::with_key(),
                command_sender,
                join_handle: Some(join_handle),
            },
            EngineFeedbackReceiver {
                consumer: feedback_consumer,
            },
        ))
    }

    pub fn open_unit_count(&self) -> usize {
        self.units.len()
    }

    fn send(&self, command: WorkerCommand) {
        if self.command_sender.send(command).is_err() {
            panic!("stroke engine worker disconnected");
        }
    }
}

impl StrokeEngine for ThreadedStrokeEngine {
    fn open_unit(&mut self, request: UnitRequest) -> Result<StrokeHandle, OpenUnitError> {
        let node = self
            .document
            .node(request.node)
            .ok_or(OpenUnitError::NodeMissing(request.node))?;
        let device = match node.kind {
            NodeKind::PaintLayer { device } => device,
            NodeKind::Group => return Err(OpenUnitError::NoBackingStore(request.node)),
        };

        let cancel_requested = Arc::new(AtomicBool::new(false));
        let handle = self.units.insert(UnitControl {
            cancel_requested: Arc::clone(&cancel_requested),
        });
        tracing::debug!(?handle, label = %request.label, "stroke unit opened");
        self.send(WorkerCommand::Open {
            handle,
            label: request.label,
            node: request.node,
            device,
            token: request.token,
            cancel_requested,
        });
        Ok(handle)
    }

    fn submit(&mut self, handle: StrokeHandle, job: StrokeJob) {
        if !self.units.contains_key(handle) {
            panic!("submit {:?} job to stroke {handle:?} which is not open", job.kind());
        }
        self.send(WorkerCommand::Job { handle, job });
    }

    fn close_unit(&mut self, handle: StrokeHandle) {
        if self.units.remove(handle).is_none() {
            panic!("close stroke {handle:?} which is not open");
        }
        self.send(WorkerCommand::Close { handle });
    }

    fn cancel_unit(&mut self, handle: StrokeHandle) {
        let Some(control) = self.units.remove(handle) else {
            panic!("cancel stroke {handle:?} which is not open");
        };
        control.cancel_requested.store(true, Ordering::Release);
        self.send(WorkerCommand::Cancel { handle });
    }
}

impl Drop for ThreadedStrokeEngine {
    fn drop(&mut self) {
        for (_, control) in self.units.drain() {
            control.cancel_requested.store(true, Ordering::Release);
        }
        let _ = self.command_sender.send(WorkerCommand::Shutdown);
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                tracing::error!("stroke engine worker panicked");
            }
        }
    }
}

struct WorkerUnit {
    label: SmolStr,
    node: NodeId,
    device: Arc<PaintDevice>,
    token: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
    backups: UnitBackups,
    frames: SmallVec<[FrameId; 4]>,
    regions: DirtyRegionSet,
    failed: bool,
}

#[derive(Debug, thiserror::Error)]
enum ComputeError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("frame {0} is missing from the target device")]
    FrameMissing(FrameId),
}

enum ComputeOutcome {
    Finished(ComputeArea),
    Interrupted,
}

/// Worker end of the feedback queue.
struct FeedbackSender {
    producer: rtrb::Producer<UnitFeedback>,
    backlog: VecDeque<UnitFeedback>,
}

impl FeedbackSender {
    fn new(producer: rtrb::Producer<UnitFeedback>) -> Self {
        Self {
            producer,
            backlog: VecDeque::new(),
        }
    }

    fn push(&mut self, feedback: UnitFeedback) {
        self.flush();
        let feedback = if self.backlog.is_empty() {
            match self.producer.push(feedback) {
                Ok(()) => return,
                Err(rtrb::PushError::Full(feedback)) => feedback,
            }
        } else {
            feedback
        };
        if feedback.must_deliver() {
            tracing::debug!(?feedback, "stroke engine feedback queue full, holding event back");
            self.backlog.push_back(feedback);
        } else {
            tracing::warn!(dropped = ?feedback, "stroke engine feedback queue full");
        }
    }

    /// Moves held-back events into the queue, oldest first, while it has room.
    fn flush(&mut self) {
        while let Some(feedback) = self.backlog.pop_front() {
            if let Err(rtrb::PushError::Full(feedback)) = self.producer.push(feedback) {
                self.backlog.push_front(feedback);
                return;
            }
        }
    }

    fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }
}

fn stroke_engine_loop(
    document: Arc<Document>,
    rows_per_cancel_check: u32,
    command_receiver: Receiver<WorkerCommand>,
    mut feedback: FeedbackSender,
) {
    let mut units = HashMap::<StrokeHandle, WorkerUnit>::new();
    loop {
        let command = if feedback.has_backlog() {
            match command_receiver.recv_timeout(BACKLOG_RETRY) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    feedback.flush();
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match command_receiver.recv() {
                Ok(command) => command,
                Err(_) => break,
            }
        };
        match command {
            WorkerCommand::Open {
                handle,
                label,
                node,
                device,
                token,
                cancel_requested,
            } => {
                let previous = units.insert(
                    handle,
                    WorkerUnit {
                        label,
                        node,
                        device,
                        token,
                        cancel_requested,
                        backups: UnitBackups::default(),
                        frames: SmallVec::new(),
                        regions: DirtyRegionSet::new(),
                        failed: false,
                    },
                );
                if previous.is_some() {
                    panic!("stroke {handle:?} opened twice");
                }
            }
            WorkerCommand::Job { handle, job } => {
                let Some(unit) = units.get_mut(&handle) else {
                    panic!("job for unknown stroke {handle:?}");
                };
                run_job(handle, unit, job, rows_per_cancel_check, &mut feedback);
            }
            WorkerCommand::Close { handle } => {
                let Some(unit) = units.remove(&handle) else {
                    panic!("close for unknown stroke {handle:?}");
                };
                commit_unit(&document, handle, unit, &mut feedback);
            }
            WorkerCommand::Cancel { handle } => {
                let Some(unit) = units.remove(&handle) else {
                    panic!("cancel for unknown stroke {handle:?}");
                };
                roll_back_unit(handle, unit, &mut feedback);
            }
            WorkerCommand::Shutdown => break,
        }
    }

    if feedback.has_backlog() {
        tracing::warn!(
            held_back = feedback.backlog.len(),
            "stroke engine stopped with undelivered feedback"
        );
    }
    for (handle, unit) in units.drain() {
        tracing::debug!(?handle, "rolling back stroke left open at shutdown");
        unit.backups.restore_into(&unit.device);
    }
}

fn run_job(
    handle: StrokeHandle,
    unit: &mut WorkerUnit,
    job: StrokeJob,
    rows_per_cancel_check: u32,
    feedback: &mut FeedbackSender,
) {
    if unit.cancel_requested.load(Ordering::Acquire) {
        // Dropping a barrier signal unsatisfied marks it abandoned.
        tracing::trace!(?handle, kind = ?job.kind(), "skipping job of cancelled stroke");
        return;
    }
    match job {
        StrokeJob::Compute(compute) => {
            if unit.failed {
                return;
            }
            let frame = compute.frame;
            match run_compute(unit, &compute, rows_per_cancel_check) {
                Ok(ComputeOutcome::Finished(area)) => {
                    if !unit.frames.contains(&frame) {
                        unit.frames.push(frame);
                    }
                    if !area.update_rect.is_empty() {
                        unit.regions.insert(area.update_rect);
                        feedback.push(UnitFeedback::RegionsUpdated {
                            handle,
                            frame: Some(frame),
                            regions: vec![area.update_rect],
                        });
                    }
                }
                Ok(ComputeOutcome::Interrupted) => {
                    tracing::trace!(?handle, frame, "compute interrupted by cancellation");
                }
                Err(error) => {
                    unit.failed = true;
                    if unit.token.is_silent() {
                        tracing::trace!(?handle, %error, "compute failed in silently cancelled stroke");
                        return;
                    }
                    tracing::error!(?handle, label = %unit.label, %error, "compute job failed");
                    feedback.push(UnitFeedback::JobFailed {
                        handle,
                        message: error.to_string(),
                    });
                }
            }
        }
        StrokeJob::Barrier(BarrierJob { signal }) => {
            signal.satisfy();
            feedback.push(UnitFeedback::BarrierReached { handle });
        }
        StrokeJob::Cleanup(CleanupJob { regions }) => {
            tracing::debug!(?handle, count = regions.len(), "repainting superseded regions");
            feedback.push(UnitFeedback::RegionsUpdated {
                handle,
                frame: None,
                regions,
            });
        }
    }
}

fn run_compute(
    unit: &mut WorkerUnit,
    job: &ComputeJob,
    rows_per_cancel_check: u32,
) -> Result<ComputeOutcome, ComputeError> {
    let device = job.snapshot.device();
    let source = device
        .read_frame(job.frame, PixelBuffer::clone)
        .ok_or(ComputeError::FrameMissing(job.frame))?;
    let area = job.resolve_area(&source);
    job.area.publish(area);
    let context = FilterContext {
        canvas: job.snapshot.canvas(),
    };

    for band in area.update_rect.row_bands(rows_per_cancel_check) {
        if unit.cancel_requested.load(Ordering::Acquire) {
            return Ok(ComputeOutcome::Interrupted);
        }
        let output = job.filter.process(&source, band, &job.config, &context)?;
        let target = output.rect();
        device
            .write_frame(job.frame, |buffer| {
                unit.backups.record(job.frame, buffer.read_region(target));
                for y in target.y..target.bottom() {
                    for x in target.x..target.right() {
                        if !job.snapshot.is_selected(x, y) {
                            continue;
                        }
                        if let Some(color) = output.get(x, y) {
                            buffer.set_pixel(x, y, color);
                        }
                    }
                }
            })
            .ok_or(ComputeError::FrameMissing(job.frame))?;
    }
    Ok(ComputeOutcome::Finished(area))
}

fn commit_unit(
    document: &Document,
    handle: StrokeHandle,
    mut unit: WorkerUnit,
    feedback: &mut FeedbackSender,
) {
    let undo_index = document.push_undo(UndoEntry {
        label: unit.label.clone(),
        node: unit.node,
        frames: unit.frames.into_vec(),
        regions: unit.regions.take(),
    });
    tracing::debug!(?handle, label = %unit.label, undo_index, "stroke committed");
    feedback.push(UnitFeedback::Completed { handle, undo_index });
}

fn roll_back_unit(
    handle: StrokeHandle,
    unit: WorkerUnit,
    feedback: &mut FeedbackSender,
) {
    let kind = unit.token.kind_at_cancellation();
    let restored = unit.backups.restore_into(&unit.device);
    match kind {
        CancellationKind::Silent => {
            tracing::debug!(?handle, label = %unit.label, "stroke superseded")
        }
        CancellationKind::Visible => {
            tracing::info!(?handle, label = %unit.label, "stroke cancelled")
        }
    }
    if !restored.is_empty() {
        feedback.push(UnitFeedback::RegionsUpdated {
            handle,
            frame: None,
            regions: restored,
        });
    }
    feedback.push(UnitFeedback::Cancelled { handle, kind });
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use document::{Node, ResourceSnapshot, Selection};
    use filters::{Filter, FilterRegistry};
    use model::Rect;
    use protocol::{BarrierOutcome, OperationConfig, PropertyValue, idle_barrier};

    use super::*;
    use crate::ComputeAreaSlot;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        document: Arc<Document>,
        node: NodeId,
        device: Arc<PaintDevice>,
    }

    fn fixture() -> Fixture {
        layer_fixture(Rect::new(0, 0, 8, 8), [10, 20, 30, 255])
    }

    fn layer_fixture(painted: Rect, color: [u8; 4]) -> Fixture {
        let document = Arc::new(Document::new(8, 8));
        let device = Arc::new(PaintDevice::new(document.bounds()));
        device.fill(PaintDevice::STATIC_FRAME, painted, color);
        let node = document.add_node(Node::paint_layer("layer", Arc::clone(&device)));
        document.set_active_node(Some(node));
        Fixture {
            document,
            node,
            device,
        }
    }

    fn start(document: &Arc<Document>) -> (ThreadedStrokeEngine, EngineFeedbackReceiver) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        ThreadedStrokeEngine::start(
            Arc::clone(document),
            EngineConfig {
                rows_per_cancel_check: 2,
                ..EngineConfig::default()
            },
        )
        .expect("start engine")
    }

    fn request(node: NodeId, token: &CancellationToken) -> UnitRequest {
        UnitRequest {
            label: "invert".into(),
            node,
            token: token.clone(),
        }
    }

    fn compute_with(
        document: &Document,
        filter: Arc<dyn Filter>,
        config: OperationConfig,
        area: &ComputeAreaSlot,
    ) -> StrokeJob {
        let snapshot = ResourceSnapshot::capture(document).expect("capture");
        StrokeJob::Compute(ComputeJob {
            frame: snapshot.active_frame(),
            snapshot: Arc::new(snapshot),
            config: Arc::new(config),
            filter,
            area: area.clone(),
        })
    }

    fn compute(document: &Document, filter: Arc<dyn Filter>) -> StrokeJob {
        let config = OperationConfig::new(filter.id());
        compute_with(document, filter, config, &ComputeAreaSlot::new())
    }

    fn builtin(id: &str) -> Arc<dyn Filter> {
        FilterRegistry::with_builtins().get(id).expect("builtin filter")
    }

    fn invert() -> Arc<dyn Filter> {
        builtin("invert")
    }

    fn wait_for(
        receiver: &mut EngineFeedbackReceiver,
        done: impl Fn(&UnitFeedback) -> bool,
    ) -> Vec<UnitFeedback> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match receiver.pop_feedback() {
                Some(feedback) => {
                    let finished = done(&feedback);
                    seen.push(feedback);
                    if finished {
                        return seen;
                    }
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        panic!("timed out waiting for feedback, saw {seen:?}");
    }

    struct Failing;

    impl Filter for Failing {
        fn id(&self) -> &str {
            "failing"
        }

        fn process(
            &self,
            _source: &PixelBuffer,
            _rect: Rect,
            _config: &OperationConfig,
            _context: &FilterContext<'_>,
        ) -> Result<document::PixelRegion, FilterError> {
            Err(FilterError::Failed {
                filter: "failing".into(),
                reason: "always".to_owned(),
            })
        }
    }

    #[test]
    fn start_rejects_zero_capacity_and_zero_band_rows() {
        let document = Arc::new(Document::new(1, 1));
        let zero_capacity = ThreadedStrokeEngine::start(
            Arc::clone(&document),
            EngineConfig {
                feedback_capacity: 0,
                ..EngineConfig::default()
            },
        );
        assert!(matches!(
            zero_capacity,
            Err(EngineStartError::ZeroFeedbackCapacity)
        ));
        let zero_rows = ThreadedStrokeEngine::start(
            document,
            EngineConfig {
                rows_per_cancel_check: 0,
                ..EngineConfig::default()
            },
        );
        assert!(matches!(
            zero_rows,
            Err(EngineStartError::ZeroRowsPerCancelCheck)
        ));
    }

    #[test]
    fn open_unit_rejects_missing_and_group_nodes() {
        let fixture = fixture();
        let group = fixture.document.add_node(Node::group("group"));
        let (mut engine, _feedback) = start(&fixture.document);
        let token = CancellationToken::new();

        assert_eq!(
            engine.open_unit(request(group, &token)),
            Err(OpenUnitError::NoBackingStore(group))
        );
        fixture.document.remove_node(group);
        assert_eq!(
            engine.open_unit(request(group, &token)),
            Err(OpenUnitError::NodeMissing(group))
        );
        assert_eq!(engine.open_unit_count(), 0);
    }

    #[test]
    fn closed_unit_keeps_pixels_and_records_one_undo_entry() {
        let fixture = fixture();
        let (mut engine, mut feedback) = start(&fixture.document);
        let token = CancellationToken::new();
        let handle = engine
            .open_unit(request(fixture.node, &token))
            .expect("open");
        let (barrier, signal) = idle_barrier();

        engine.submit(handle, compute(&fixture.document, invert()));
        engine.submit(handle, StrokeJob::Barrier(BarrierJob { signal }));
        engine.close_unit(handle);

        let seen = wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Completed { .. })
        });
        assert_eq!(barrier.wait_timeout(WAIT), BarrierOutcome::Satisfied);
        assert_eq!(
            seen,
            vec![
                UnitFeedback::RegionsUpdated {
                    handle,
                    frame: Some(PaintDevice::STATIC_FRAME),
                    regions: vec![Rect::new(0, 0, 8, 8)],
                },
                UnitFeedback::BarrierReached { handle },
                UnitFeedback::Completed {
                    handle,
                    undo_index: 0
                },
            ]
        );
        assert_eq!(
            fixture.device.pixel(PaintDevice::STATIC_FRAME, 3, 3),
            [245, 235, 225, 255]
        );
        let history = fixture.document.undo_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].frames, vec![PaintDevice::STATIC_FRAME]);
        assert_eq!(history[0].regions, vec![Rect::new(0, 0, 8, 8)]);
    }

    #[test]
    fn compute_respects_captured_selection() {
        let fixture = fixture();
        fixture
            .document
            .set_selection(Some(Selection::from_rects([Rect::new(0, 0, 2, 2)])));
        let (mut engine, mut feedback) = start(&fixture.document);
        let token = CancellationToken::new();
        let handle = engine
            .open_unit(request(fixture.node, &token))
            .expect("open");

        engine.submit(handle, compute(&fixture.document, invert()));
        engine.close_unit(handle);
        wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Completed { .. })
        });

        let frame = PaintDevice::STATIC_FRAME;
        assert_eq!(fixture.device.pixel(frame, 1, 1), [245, 235, 225, 255]);
        assert_eq!(fixture.device.pixel(frame, 5, 5), [10, 20, 30, 255]);
    }

    #[test]
    fn visible_cancel_restores_pixels_and_reports_visible() {
        let fixture = fixture();
        let (mut engine, mut feedback) = start(&fixture.document);
        let token = CancellationToken::new();
        let handle = engine
            .open_unit(request(fixture.node, &token))
            .expect("open");
        let (barrier, signal) = idle_barrier();
        engine.submit(handle, compute(&fixture.document, invert()));
        engine.submit(handle, StrokeJob::Barrier(BarrierJob { signal }));
        assert_eq!(barrier.wait_timeout(WAIT), BarrierOutcome::Satisfied);

        token.request(CancellationKind::Visible);
        engine.cancel_unit(handle);
        let seen = wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Cancelled { .. })
        });

        assert_eq!(
            seen.last(),
            Some(&UnitFeedback::Cancelled {
                handle,
                kind: CancellationKind::Visible
            })
        );
        assert_eq!(
            fixture.device.pixel(PaintDevice::STATIC_FRAME, 3, 3),
            [10, 20, 30, 255]
        );
        assert!(fixture.document.undo_history().is_empty());
    }

    #[test]
    fn silent_cancel_of_untouched_unit_reports_only_silent_cancellation() {
        let fixture = fixture();
        let (mut engine, mut feedback) = start(&fixture.document);
        let token = CancellationToken::new();
        let handle = engine
            .open_unit(request(fixture.node, &token))
            .expect("open");

        token.request(CancellationKind::Silent);
        // A later visible request loses; the first kind sticks.
        token.request(CancellationKind::Visible);
        engine.cancel_unit(handle);
        let seen = wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Cancelled { .. })
        });

        assert_eq!(
            seen,
            vec![UnitFeedback::Cancelled {
                handle,
                kind: CancellationKind::Silent
            }]
        );
        assert_eq!(engine.open_unit_count(), 0);
    }

    #[test]
    fn jobs_skipped_after_cancel_request_drop_their_barrier() {
        let fixture = fixture();
        let (mut engine, mut feedback) = start(&fixture.document);
        let token = CancellationToken::new();
        let handle = engine
            .open_unit(request(fixture.node, &token))
            .expect("open");
        let (barrier, signal) = idle_barrier();
        let flag = Arc::clone(&engine.units[handle].cancel_requested);
        flag.store(true, Ordering::Release);

        engine.submit(handle, StrokeJob::Barrier(BarrierJob { signal }));
        engine.cancel_unit(handle);
        wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Cancelled { .. })
        });

        assert_eq!(barrier.wait_timeout(WAIT), BarrierOutcome::Abandoned);
    }

    #[test]
    fn failure_is_reported_only_for_units_not_cancelled_silently() {
        let fixture = fixture();
        let (mut engine, mut feedback) = start(&fixture.document);

        let loud = CancellationToken::new();
        let handle = engine
            .open_unit(request(fixture.node, &loud))
            .expect("open");
        engine.submit(
            handle,
            compute(&fixture.document, Arc::new(Failing)),
        );
        engine.close_unit(handle);
        let seen = wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Completed { .. })
        });
        assert!(matches!(seen[0], UnitFeedback::JobFailed { handle: failed, .. } if failed == handle));

        let quiet = CancellationToken::new();
        quiet.request(CancellationKind::Silent);
        let handle = engine
            .open_unit(request(fixture.node, &quiet))
            .expect("open");
        engine.submit(
            handle,
            compute(&fixture.document, Arc::new(Failing)),
        );
        engine.close_unit(handle);
        let seen = wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Completed { .. })
        });
        assert!(
            !seen
                .iter()
                .any(|feedback| matches!(feedback, UnitFeedback::JobFailed { .. }))
        );
    }

    #[test]
    fn cleanup_job_reports_regions_without_frame() {
        let fixture = fixture();
        let (mut engine, mut feedback) = start(&fixture.document);
        let token = CancellationToken::new();
        let handle = engine
            .open_unit(request(fixture.node, &token))
            .expect("open");
        let regions = vec![Rect::new(0, 0, 2, 2), Rect::new(4, 4, 2, 2)];

        engine.submit(
            handle,
            StrokeJob::Cleanup(CleanupJob {
                regions: regions.clone(),
            }),
        );
        engine.close_unit(handle);
        let seen = wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Completed { .. })
        });
        assert_eq!(
            seen[0],
            UnitFeedback::RegionsUpdated {
                handle,
                frame: None,
                regions
            }
        );
    }

    #[test]
    fn blur_writes_its_grown_area_clipped_to_the_device() {
        let fixture = layer_fixture(Rect::new(0, 0, 3, 3), [90, 90, 90, 255]);
        let (mut engine, mut feedback) = start(&fixture.document);
        let token = CancellationToken::new();
        let handle = engine
            .open_unit(request(fixture.node, &token))
            .expect("open");
        let area = ComputeAreaSlot::new();

        engine.submit(
            handle,
            compute_with(
                &fixture.document,
                builtin("box_blur"),
                OperationConfig::new("box_blur"),
                &area,
            ),
        );
        engine.close_unit(handle);
        let seen = wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Completed { .. })
        });

        let grown = Rect::new(0, 0, 4, 4);
        assert_eq!(
            area.get(),
            Some(ComputeArea {
                process_rect: Rect::new(0, 0, 3, 3),
                update_rect: grown,
            })
        );
        assert_eq!(
            seen[0],
            UnitFeedback::RegionsUpdated {
                handle,
                frame: Some(PaintDevice::STATIC_FRAME),
                regions: vec![grown],
            }
        );
        let frame = PaintDevice::STATIC_FRAME;
        assert_eq!(fixture.device.pixel(frame, 3, 1), [30, 30, 30, 85]);
        assert_eq!(fixture.device.pixel(frame, 4, 1), [0, 0, 0, 0]);
        assert_eq!(fixture.document.undo_history()[0].regions, vec![grown]);
    }

    #[test]
    fn compute_area_follows_pixels_restored_by_earlier_rollback() {
        let painted = Rect::new(5, 5, 1, 1);
        let fixture = layer_fixture(painted, [100, 100, 100, 255]);
        let (mut engine, mut feedback) = start(&fixture.document);
        let frame = PaintDevice::STATIC_FRAME;

        let blurred = CancellationToken::new();
        let first = engine
            .open_unit(request(fixture.node, &blurred))
            .expect("open");
        let (barrier, signal) = idle_barrier();
        engine.submit(
            first,
            compute_with(
                &fixture.document,
                builtin("box_blur"),
                OperationConfig::new("box_blur").with("radius", PropertyValue::Int(8)),
                &ComputeAreaSlot::new(),
            ),
        );
        engine.submit(first, StrokeJob::Barrier(BarrierJob { signal }));
        assert_eq!(barrier.wait_timeout(WAIT), BarrierOutcome::Satisfied);
        assert!(fixture.device.exact_bounds(frame).is_empty());

        blurred.request(CancellationKind::Silent);
        engine.cancel_unit(first);
        let token = CancellationToken::new();
        let second = engine
            .open_unit(request(fixture.node, &token))
            .expect("open");
        let area = ComputeAreaSlot::new();
        engine.submit(
            second,
            compute_with(
                &fixture.document,
                invert(),
                OperationConfig::new("invert"),
                &area,
            ),
        );
        engine.close_unit(second);
        wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Completed { .. })
        });

        assert_eq!(area.get().map(|area| area.process_rect), Some(painted));
        assert_eq!(fixture.device.pixel(frame, 5, 5), [155, 155, 155, 255]);
        assert_eq!(fixture.document.undo_history()[0].regions, vec![painted]);
    }

    #[test]
    fn lifecycle_events_wait_out_a_full_feedback_queue() {
        let fixture = fixture();
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (mut engine, mut feedback) = ThreadedStrokeEngine::start(
            Arc::clone(&fixture.document),
            EngineConfig {
                feedback_capacity: 1,
                ..EngineConfig::default()
            },
        )
        .expect("start engine");

        let committed = CancellationToken::new();
        let first = engine
            .open_unit(request(fixture.node, &committed))
            .expect("open");
        engine.submit(first, compute(&fixture.document, invert()));
        engine.close_unit(first);
        let cancelled = CancellationToken::new();
        let second = engine
            .open_unit(request(fixture.node, &cancelled))
            .expect("open");
        cancelled.request(CancellationKind::Visible);
        engine.cancel_unit(second);

        // Give the worker time to overrun the single slot.
        std::thread::sleep(Duration::from_millis(50));
        let seen = wait_for(&mut feedback, |feedback| {
            matches!(feedback, UnitFeedback::Cancelled { .. })
        });

        assert!(seen.contains(&UnitFeedback::Completed {
            handle: first,
            undo_index: 0
        }));
        assert_eq!(
            seen.last(),
            Some(&UnitFeedback::Cancelled {
                handle: second,
                kind: CancellationKind::Visible
            })
        );
    }

    #[test]
    #[should_panic(expected = "which is not open")]
    fn submit_after_close_panics() {
        let fixture = fixture();
        let (mut engine, _feedback) = start(&fixture.document);
        let token = CancellationToken::new();
        let handle = engine
            .open_unit(request(fixture.node, &token))
            .expect("open");
        engine.close_unit(handle);
        let (_barrier, signal) = idle_barrier();
        engine.submit(handle, StrokeJob::Barrier(BarrierJob { signal }));
    }
}
