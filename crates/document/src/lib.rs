mod device;
mod snapshot;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arc_swap::{ArcSwap, ArcSwapOption};
use model::{FrameId, FrameTime, Rect};
use protocol::{ResourceData, ResourceLookup};
use slotmap::SlotMap;
use smol_str::SmolStr;

pub use device::{DeviceError, PaintDevice, PixelBuffer, PixelRegion, Rgba8, TRANSPARENT};
pub use snapshot::{CaptureError, ResourceSnapshot};

slotmap::new_key_type! {
    pub struct NodeId;
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    PaintLayer { device: Arc<PaintDevice> },
    Group,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: SmolStr,
    pub kind: NodeKind,
    pub locked: bool,
    pub visible: bool,
}

impl Node {
    pub fn paint_layer(name: impl Into<SmolStr>, device: Arc<PaintDevice>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::PaintLayer { device },
            locked: false,
            visible: true,
        }
    }

    pub fn group(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Group,
            locked: false,
            visible: true,
        }
    }

    pub fn paint_device(&self) -> Option<&Arc<PaintDevice>> {
        match &self.kind {
            NodeKind::PaintLayer { device } => Some(device),
            NodeKind::Group => None,
        }
    }
}

/// Union of rectangular areas the user selected. Immutable once built; the
/// document swaps in a new value on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    rects: Vec<Rect>,
}

impl Selection {
    pub fn from_rects(rects: impl IntoIterator<Item = Rect>) -> Self {
        Self {
            rects: rects.into_iter().filter(|rect| !rect.is_empty()).collect(),
        }
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn bounds(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::EMPTY, |bounds, rect| bounds.union(*rect))
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|rect| rect.contains_point(x, y))
    }
}

/// Canvas-wide painting state filters may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasSettings {
    pub foreground: Rgba8,
    pub background: Rgba8,
}

impl Default for CanvasSettings {
    fn default() -> Self {
        Self {
            foreground: [0, 0, 0, 255],
            background: [255, 255, 255, 255],
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ResourceLibrary {
    entries: HashMap<SmolStr, Arc<ResourceData>>,
}

impl ResourceLibrary {
    pub fn get(&self, name: &str) -> Option<&Arc<ResourceData>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResourceLookup for ResourceLibrary {
    fn lookup(&self, name: &str) -> Option<Arc<ResourceData>> {
        self.entries.get(name).cloned()
    }
}

/// One committed unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub label: SmolStr,
    pub node: NodeId,
    pub frames: Vec<FrameId>,
    pub regions: Vec<Rect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("node {0:?} does not exist")]
    NodeNotFound(NodeId),
}

/// The document operations run against.
///
/// Node structure is edited from the UI thread only. The globals an
/// operation depends on (active node, selection, canvas settings, resources,
/// timeline) sit in atomically swappable cells so that a snapshot is a set of
/// cheap loads and never observes a half-written value.
pub struct Document {
    bounds: Rect,
    nodes: RwLock<SlotMap<NodeId, Node>>,
    active_node: ArcSwapOption<NodeId>,
    selection: ArcSwapOption<Selection>,
    canvas: ArcSwap<CanvasSettings>,
    resources: ArcSwap<ResourceLibrary>,
    current_time: AtomicI32,
    selected_times: ArcSwap<BTreeSet<FrameTime>>,
    history: Mutex<Vec<UndoEntry>>,
}

impl Document {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            bounds: Rect::new(0, 0, width, height),
            nodes: RwLock::new(SlotMap::with_key()),
            active_node: ArcSwapOption::empty(),
            selection: ArcSwapOption::empty(),
            canvas: ArcSwap::from_pointee(CanvasSettings::default()),
            resources: ArcSwap::from_pointee(ResourceLibrary::default()),
            current_time: AtomicI32::new(0),
            selected_times: ArcSwap::from_pointee(BTreeSet::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn add_node(&self, node: Node) -> NodeId {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node)
    }

    pub fn remove_node(&self, node_id: NodeId) -> Option<Node> {
        let removed = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id);
        if removed.is_some() && self.active_node() == Some(node_id) {
            self.active_node.store(None);
        }
        removed
    }

    pub fn node(&self, node_id: NodeId) -> Option<Node> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    pub fn update_node(
        &self,
        node_id: NodeId,
        update: impl FnOnce(&mut Node),
    ) -> Result<(), DocumentError> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let node = nodes
            .get_mut(node_id)
            .ok_or(DocumentError::NodeNotFound(node_id))?;
        update(node);
        Ok(())
    }

    pub fn set_active_node(&self, node_id: Option<NodeId>) {
        self.active_node.store(node_id.map(Arc::new));
    }

    pub fn active_node(&self) -> Option<NodeId> {
        self.active_node.load().as_deref().copied()
    }

    pub fn set_selection(&self, selection: Option<Selection>) {
        self.selection.store(selection.map(Arc::new));
    }

    pub fn selection(&self) -> Option<Arc<Selection>> {
        self.selection.load_full()
    }

    pub fn set_canvas_settings(&self, settings: CanvasSettings) {
        self.canvas.store(Arc::new(settings));
    }

    pub fn canvas_settings(&self) -> Arc<CanvasSettings> {
        self.canvas.load_full()
    }

    pub fn set_resource(&self, name: impl Into<SmolStr>, data: ResourceData) {
        let name = name.into();
        let data = Arc::new(data);
        self.resources.rcu(|library| {
            let mut library = ResourceLibrary::clone(library);
            library.entries.insert(name.clone(), Arc::clone(&data));
            library
        });
    }

    pub fn remove_resource(&self, name: &str) {
        self.resources.rcu(|library| {
            let mut library = ResourceLibrary::clone(library);
            library.entries.remove(name);
            library
        });
    }

    pub fn resources(&self) -> Arc<ResourceLibrary> {
        self.resources.load_full()
    }

    pub fn set_current_time(&self, time: FrameTime) {
        self.current_time.store(time, Ordering::Release);
    }

    pub fn current_time(&self) -> FrameTime {
        self.current_time.load(Ordering::Acquire)
    }

    /// Timeline positions the user flagged for "apply here too".
    pub fn set_selected_times(&self, times: impl IntoIterator<Item = FrameTime>) {
        self.selected_times
            .store(Arc::new(times.into_iter().collect()));
    }

    pub fn selected_times(&self) -> Arc<BTreeSet<FrameTime>> {
        self.selected_times.load_full()
    }

    pub fn push_undo(&self, entry: UndoEntry) -> usize {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push(entry);
        history.len() - 1
    }

    pub fn undo_history(&self) -> Vec<UndoEntry> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removing_active_node_clears_it() {
        let document = Document::new(32, 32);
        let node_id = document.add_node(Node::group("group"));
        document.set_active_node(Some(node_id));

        assert!(document.remove_node(node_id).is_some());
        assert_eq!(document.active_node(), None);
        assert_eq!(
            document.update_node(node_id, |node| node.locked = true),
            Err(DocumentError::NodeNotFound(node_id))
        );
    }

    #[test]
    fn resource_updates_replace_library_without_touching_old_loads() {
        let document = Document::new(8, 8);
        document.set_resource(
            "mono",
            ResourceData::Palette {
                colors: vec![[0, 0, 0, 255]],
            },
        );
        let before = document.resources();

        document.set_resource(
            "mono",
            ResourceData::Palette {
                colors: vec![[255, 255, 255, 255]],
            },
        );
        document.remove_resource("missing");

        assert_eq!(
            before.get("mono").map(|data| (**data).clone()),
            Some(ResourceData::Palette {
                colors: vec![[0, 0, 0, 255]],
            })
        );
        assert_eq!(
            document.resources().lookup("mono").map(|data| (*data).clone()),
            Some(ResourceData::Palette {
                colors: vec![[255, 255, 255, 255]],
            })
        );
    }

    #[test]
    fn oversized_document_bounds_saturate() {
        let document = Document::new(u32::MAX, u32::MAX);
        let bounds = document.bounds();
        assert_eq!((bounds.right(), bounds.bottom()), (i32::MAX, i32::MAX));
        assert!(bounds.contains_rect(Rect::new(0, 0, 16, 16)));
    }

    #[test]
    fn selection_bounds_cover_all_rects() {
        let selection = Selection::from_rects([
            Rect::new(0, 0, 2, 2),
            Rect::EMPTY,
            Rect::new(5, 5, 1, 3),
        ]);
        assert_eq!(selection.rects().len(), 2);
        assert_eq!(selection.bounds(), Rect::new(0, 0, 6, 8));
        assert!(selection.contains(5, 7));
        assert!(!selection.contains(3, 3));
    }
}
