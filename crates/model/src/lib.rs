mod dirty;

pub use dirty::DirtyRegionSet;

/// Identifier of one raster frame inside an animated paint device.
/// Several frame times may point at the same frame (cloned keyframes).
pub type FrameId = u64;
/// Position on the animation timeline.
pub type FrameTime = i32;

/// Document-space rectangle. `x`/`y` are inclusive, the far edges exclusive.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const EMPTY: Self = Self {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Builds a rect from edges; inverted edges collapse to [`Rect::EMPTY`].
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        if right <= left || bottom <= top {
            return Self::EMPTY;
        }
        Self {
            x: left,
            y: top,
            width: (i64::from(right) - i64::from(left)) as u32,
            height: (i64::from(bottom) - i64::from(top)) as u32,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i32 {
        edge(self.x, self.width)
    }

    pub fn bottom(&self) -> i32 {
        edge(self.y, self.height)
    }

    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn contains_rect(&self, other: Rect) -> bool {
        if other.is_empty() {
            return true;
        }
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn intersect(&self, other: Rect) -> Rect {
        if self.is_empty() || other.is_empty() {
            return Self::EMPTY;
        }
        Self::from_edges(
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        )
    }

    pub fn intersects(&self, other: Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Smallest rect covering both. Empty operands are ignored.
    pub fn union(&self, other: Rect) -> Rect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return *self;
        }
        Self::from_edges(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Grows every edge outward by `margin` pixels.
    pub fn inflate(&self, margin: u32) -> Rect {
        if self.is_empty() || margin == 0 {
            return *self;
        }
        let margin = i32::try_from(margin).unwrap_or(i32::MAX);
        Self::from_edges(
            self.x.saturating_sub(margin),
            self.y.saturating_sub(margin),
            self.right().saturating_add(margin),
            self.bottom().saturating_add(margin),
        )
    }

    /// Splits the rect into horizontal bands of at most `rows` rows each.
    pub fn row_bands(&self, rows: u32) -> impl Iterator<Item = Rect> + '_ {
        let rows = rows.max(1);
        let band_count = if self.is_empty() {
            0
        } else {
            self.height.div_ceil(rows)
        };
        (0..band_count).map(move |band| {
            let offset = band * rows;
            Rect {
                x: self.x,
                y: edge(self.y, offset),
                width: self.width,
                height: rows.min(self.height - offset),
            }
        })
    }
}

/// Far edges past `i32::MAX` saturate, so oversized rects stay usable.
fn edge(origin: i32, extent: u32) -> i32 {
    let edge = i64::from(origin) + i64::from(extent);
    i32::try_from(edge).unwrap_or(i32::MAX)
}
