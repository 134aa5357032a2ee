//! Pixel transformations the engine runs inside compute jobs.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use document::{CanvasSettings, PixelBuffer, PixelRegion};
use model::Rect;
use protocol::OperationConfig;
use smol_str::SmolStr;

pub use builtin::{BoxBlur, Brightness, FlattenBackground, GradientMap, Invert};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("filter '{filter}' property '{property}' is invalid: {reason}")]
    InvalidProperty {
        filter: SmolStr,
        property: SmolStr,
        reason: String,
    },
    #[error("filter '{filter}' needs an embedded resource in property '{property}'")]
    MissingResource { filter: SmolStr, property: SmolStr },
    #[error("filter '{filter}' failed: {reason}")]
    Failed { filter: SmolStr, reason: String },
}

/// Read-only inputs besides the pixels themselves.
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub canvas: &'a CanvasSettings,
}

pub trait Filter: Send + Sync {
    fn id(&self) -> &str;

    /// Filters that look at transparent pixels (or the whole canvas) must run
    /// over the document bounds instead of the layer's painted extent.
    fn needs_full_document_context(&self) -> bool {
        false
    }

    /// Area whose on-screen appearance changes when `rect` is processed.
    fn changed_rect(&self, rect: Rect, _config: &OperationConfig) -> Rect {
        rect
    }

    /// Computes the new pixels of `rect`, reading from `source`.
    fn process(
        &self,
        source: &PixelBuffer,
        rect: Rect,
        config: &OperationConfig,
        context: &FilterContext<'_>,
    ) -> Result<PixelRegion, FilterError>;
}

#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<SmolStr, Arc<dyn Filter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Invert));
        registry.register(Arc::new(Brightness));
        registry.register(Arc::new(BoxBlur));
        registry.register(Arc::new(GradientMap));
        registry.register(Arc::new(FlattenBackground));
        registry
    }

    /// Returns the filter previously registered under the same id.
    pub fn register(&mut self, filter: Arc<dyn Filter>) -> Option<Arc<dyn Filter>> {
        self.filters.insert(SmolStr::new(filter.id()), filter)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(SmolStr::as_str)
    }
}

/// Runs `map` over every pixel of `rect` that lies inside `source`.
pub(crate) fn map_pixels(
    source: &PixelBuffer,
    rect: Rect,
    mut map: impl FnMut(i32, i32, [u8; 4]) -> [u8; 4],
) -> PixelRegion {
    let rect = rect.intersect(source.bounds());
    let mut output = PixelRegion::transparent(rect);
    for y in rect.y..rect.bottom() {
        for x in rect.x..rect.right() {
            output.set(x, y, map(x, y, source.pixel(x, y)));
        }
    }
    output
}
