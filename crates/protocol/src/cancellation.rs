use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const UNSET: u8 = 0;
const SILENT: u8 = 1;
const VISIBLE: u8 = 2;

/// How a cancelled unit of work must end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancellationKind {
    /// Superseded by a newer preview: no error reporting, no undo entry.
    Silent,
    /// Cancelled by the user: rollback and reporting are expected.
    Visible,
}

impl CancellationKind {
    fn encode(self) -> u8 {
        match self {
            CancellationKind::Silent => SILENT,
            CancellationKind::Visible => VISIBLE,
        }
    }

    fn decode(raw: u8) -> Option<Self> {
        match raw {
            UNSET => None,
            SILENT => Some(CancellationKind::Silent),
            VISIBLE => Some(CancellationKind::Visible),
            other => panic!("corrupted cancellation token state {other}"),
        }
    }
}

/// Shared flag telling the engine how a unit's cancellation must be handled.
///
/// The orchestrator writes it right before asking the engine to cancel; the
/// engine reads it only while handling that cancellation. The first request
/// wins, later requests are ignored.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<AtomicU8>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call decided the kind.
    pub fn request(&self, kind: CancellationKind) -> bool {
        self.state
            .compare_exchange(UNSET, kind.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn kind(&self) -> Option<CancellationKind> {
        CancellationKind::decode(self.state.load(Ordering::Acquire))
    }

    pub fn is_silent(&self) -> bool {
        self.kind() == Some(CancellationKind::Silent)
    }

    /// Kind to use when a cancellation is being handled. A token nobody
    /// marked is treated as a user-visible cancellation.
    pub fn kind_at_cancellation(&self) -> CancellationKind {
        self.kind().unwrap_or(CancellationKind::Visible)
    }

    /// Number of live clones, the orchestrator's own included.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.state)
    }
}
