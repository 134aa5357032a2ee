//! Vocabulary shared between the UI thread and the stroke execution engine.

mod barrier;
mod cancellation;
mod config;

pub use barrier::{BarrierOutcome, BarrierSignal, IdleBarrier, idle_barrier};
pub use cancellation::{CancellationKind, CancellationToken};
pub use config::{
    ConfigSnapshotError, EmbeddedResource, GradientStop, OperationConfig, PropertyValue,
    ResourceData, ResourceLookup,
};

slotmap::new_key_type! {
    /// One open unit of work ("stroke") inside the execution engine.
    pub struct StrokeHandle;
}
