use std::sync::Arc;

use model::{FrameId, FrameTime, Rect};

use super::{CanvasSettings, Document, NodeId, NodeKind, PaintDevice, Selection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("no active node")]
    NoActiveNode,
    #[error("active node {0:?} no longer exists")]
    NodeMissing(NodeId),
    #[error("active node {0:?} has no paint device")]
    NoPaintDevice(NodeId),
    #[error("active node {0:?} is locked")]
    NodeLocked(NodeId),
    #[error("active node {0:?} is hidden")]
    NodeHidden(NodeId),
}

/// Everything an operation reads from the document's live globals, frozen
/// at one instant.
///
/// Selection and canvas settings are immutable values shared with the
/// document's cells; the document replaces rather than mutates them, so the
/// values seen here never change. The device is the write target and is the
/// only part the engine mutates.
#[derive(Debug)]
pub struct ResourceSnapshot {
    node: NodeId,
    node_name: smol_str::SmolStr,
    device: Arc<PaintDevice>,
    time: FrameTime,
    active_frame: FrameId,
    selection: Option<Arc<Selection>>,
    canvas: Arc<CanvasSettings>,
    document_bounds: Rect,
}

impl ResourceSnapshot {
    pub fn capture(document: &Document) -> Result<Self, CaptureError> {
        let node_id = document.active_node().ok_or(CaptureError::NoActiveNode)?;
        let node = document
            .node(node_id)
            .ok_or(CaptureError::NodeMissing(node_id))?;
        let device = match &node.kind {
            NodeKind::PaintLayer { device } => Arc::clone(device),
            NodeKind::Group => return Err(CaptureError::NoPaintDevice(node_id)),
        };
        if node.locked {
            return Err(CaptureError::NodeLocked(node_id));
        }
        if !node.visible {
            return Err(CaptureError::NodeHidden(node_id));
        }

        let time = document.current_time();
        Ok(Self {
            node: node_id,
            node_name: node.name,
            active_frame: device.frame_at(time),
            device,
            time,
            selection: document.selection(),
            canvas: document.canvas_settings(),
            document_bounds: document.bounds(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn device(&self) -> &Arc<PaintDevice> {
        &self.device
    }

    pub fn time(&self) -> FrameTime {
        self.time
    }

    /// Frame shown at capture time; previews compute only this one.
    pub fn active_frame(&self) -> FrameId {
        self.active_frame
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_deref()
    }

    pub fn canvas(&self) -> &CanvasSettings {
        &self.canvas
    }

    pub fn document_bounds(&self) -> Rect {
        self.document_bounds
    }

    /// Clips `rect` to the captured selection, if any.
    pub fn clip_to_selection(&self, rect: Rect) -> Rect {
        match self.selection() {
            Some(selection) => rect.intersect(selection.bounds()),
            None => rect,
        }
    }

    pub fn is_selected(&self, x: i32, y: i32) -> bool {
        self.selection()
            .is_none_or(|selection| selection.contains(x, y))
    }
}
