use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use model::{FrameId, FrameTime, Rect};

pub type Rgba8 = [u8; 4];

pub const TRANSPARENT: Rgba8 = [0, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("paint device is not animated")]
    NotAnimated,
    #[error("no keyframe at time {time}")]
    NoKeyframeAt { time: FrameTime },
}

/// Pixels for one rect, row-major. Used for filter output and undo backups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelRegion {
    rect: Rect,
    pixels: Vec<Rgba8>,
}

impl PixelRegion {
    pub fn transparent(rect: Rect) -> Self {
        Self {
            rect,
            pixels: vec![TRANSPARENT; rect.area() as usize],
        }
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn get(&self, x: i32, y: i32) -> Option<Rgba8> {
        region_index(self.rect, x, y).map(|index| self.pixels[index])
    }

    pub fn set(&mut self, x: i32, y: i32, color: Rgba8) {
        let Some(index) = region_index(self.rect, x, y) else {
            panic!(
                "pixel ({x}, {y}) outside region {:?}",
                self.rect
            );
        };
        self.pixels[index] = color;
    }
}

/// One raster frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    bounds: Rect,
    pixels: Vec<Rgba8>,
}

impl PixelBuffer {
    pub fn new(bounds: Rect) -> Self {
        Self::filled(bounds, TRANSPARENT)
    }

    pub fn filled(bounds: Rect, color: Rgba8) -> Self {
        Self {
            bounds,
            pixels: vec![color; bounds.area() as usize],
        }
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Pixels outside the buffer read as transparent.
    pub fn pixel(&self, x: i32, y: i32) -> Rgba8 {
        region_index(self.bounds, x, y)
            .map(|index| self.pixels[index])
            .unwrap_or(TRANSPARENT)
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, color: Rgba8) -> bool {
        let Some(index) = region_index(self.bounds, x, y) else {
            return false;
        };
        self.pixels[index] = color;
        true
    }

    pub fn fill(&mut self, rect: Rect, color: Rgba8) {
        let rect = rect.intersect(self.bounds);
        for y in rect.y..rect.bottom() {
            for x in rect.x..rect.right() {
                self.set_pixel(x, y, color);
            }
        }
    }

    /// Bounding box of every pixel with non-zero alpha.
    pub fn exact_bounds(&self) -> Rect {
        let mut found = Rect::EMPTY;
        for y in self.bounds.y..self.bounds.bottom() {
            let mut row_min = None;
            let mut row_max = None;
            for x in self.bounds.x..self.bounds.right() {
                if self.pixel(x, y)[3] != 0 {
                    row_min.get_or_insert(x);
                    row_max = Some(x);
                }
            }
            if let (Some(min_x), Some(max_x)) = (row_min, row_max) {
                found = found.union(Rect::from_edges(min_x, y, max_x + 1, y + 1));
            }
        }
        found
    }

    pub fn read_region(&self, rect: Rect) -> PixelRegion {
        let rect = rect.intersect(self.bounds);
        let mut region = PixelRegion::transparent(rect);
        for y in rect.y..rect.bottom() {
            for x in rect.x..rect.right() {
                region.set(x, y, self.pixel(x, y));
            }
        }
        region
    }

    pub fn write_region(&mut self, region: &PixelRegion) {
        let rect = region.rect.intersect(self.bounds);
        for y in rect.y..rect.bottom() {
            for x in rect.x..rect.right() {
                if let Some(color) = region.get(x, y) {
                    self.set_pixel(x, y, color);
                }
            }
        }
    }
}

fn region_index(rect: Rect, x: i32, y: i32) -> Option<usize> {
    if !rect.contains_point(x, y) {
        return None;
    }
    let column = (x - rect.x) as usize;
    let row = (y - rect.y) as usize;
    Some(row * rect.width as usize + column)
}

#[derive(Debug)]
struct DeviceFrames {
    frames: BTreeMap<FrameId, PixelBuffer>,
    keyframes: BTreeMap<FrameTime, FrameId>,
    next_frame_id: FrameId,
}

/// Pixel storage of a paint layer. Animated devices hold one raster per
/// frame id and map timeline positions onto frame ids.
#[derive(Debug)]
pub struct PaintDevice {
    bounds: Rect,
    animated: bool,
    state: RwLock<DeviceFrames>,
}

impl PaintDevice {
    pub const STATIC_FRAME: FrameId = 0;

    pub fn new(bounds: Rect) -> Self {
        Self::with_animation(bounds, false)
    }

    /// Starts with a single keyframe at time 0.
    pub fn new_animated(bounds: Rect) -> Self {
        Self::with_animation(bounds, true)
    }

    fn with_animation(bounds: Rect, animated: bool) -> Self {
        Self {
            bounds,
            animated,
            state: RwLock::new(DeviceFrames {
                frames: BTreeMap::from([(Self::STATIC_FRAME, PixelBuffer::new(bounds))]),
                keyframes: BTreeMap::from([(0, Self::STATIC_FRAME)]),
                next_frame_id: Self::STATIC_FRAME + 1,
            }),
        }
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn is_animated(&self) -> bool {
        self.animated
    }

    pub fn add_keyframe(&self, time: FrameTime) -> Result<FrameId, DeviceError> {
        if !self.animated {
            return Err(DeviceError::NotAnimated);
        }
        let mut state = self.write_state();
        let frame_id = state.next_frame_id;
        state.next_frame_id += 1;
        state.frames.insert(frame_id, PixelBuffer::new(self.bounds));
        state.keyframes.insert(time, frame_id);
        Ok(frame_id)
    }

    /// Makes `target_time` show the same raster as `source_time`.
    pub fn clone_keyframe(
        &self,
        source_time: FrameTime,
        target_time: FrameTime,
    ) -> Result<FrameId, DeviceError> {
        if !self.animated {
            return Err(DeviceError::NotAnimated);
        }
        let mut state = self.write_state();
        let Some(&frame_id) = state.keyframes.get(&source_time) else {
            return Err(DeviceError::NoKeyframeAt { time: source_time });
        };
        state.keyframes.insert(target_time, frame_id);
        Ok(frame_id)
    }

    /// Frame id visible at `time`: the closest keyframe at or before it, or
    /// the earliest keyframe when `time` precedes all of them.
    pub fn frame_at(&self, time: FrameTime) -> FrameId {
        if !self.animated {
            return Self::STATIC_FRAME;
        }
        let state = self.read_state();
        state
            .keyframes
            .range(..=time)
            .next_back()
            .or_else(|| state.keyframes.iter().next())
            .map(|(_, frame_id)| *frame_id)
            .unwrap_or(Self::STATIC_FRAME)
    }

    /// Distinct frame ids shown at any of `times`, in ascending order.
    pub fn unique_frames_at(&self, times: impl IntoIterator<Item = FrameTime>) -> BTreeSet<FrameId> {
        times.into_iter().map(|time| self.frame_at(time)).collect()
    }

    pub fn has_frame(&self, frame: FrameId) -> bool {
        self.read_state().frames.contains_key(&frame)
    }

    pub fn read_frame<R>(&self, frame: FrameId, read: impl FnOnce(&PixelBuffer) -> R) -> Option<R> {
        let state = self.read_state();
        state.frames.get(&frame).map(read)
    }

    pub fn write_frame<R>(
        &self,
        frame: FrameId,
        write: impl FnOnce(&mut PixelBuffer) -> R,
    ) -> Option<R> {
        let mut state = self.write_state();
        state.frames.get_mut(&frame).map(write)
    }

    pub fn exact_bounds(&self, frame: FrameId) -> Rect {
        self.read_frame(frame, PixelBuffer::exact_bounds)
            .unwrap_or(Rect::EMPTY)
    }

    pub fn pixel(&self, frame: FrameId, x: i32, y: i32) -> Rgba8 {
        self.read_frame(frame, |buffer| buffer.pixel(x, y))
            .unwrap_or(TRANSPARENT)
    }

    pub fn fill(&self, frame: FrameId, rect: Rect, color: Rgba8) {
        self.write_frame(frame, |buffer| buffer.fill(rect, color));
    }

    fn read_state(&self) -> RwLockReadGuard<'_, DeviceFrames> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, DeviceFrames> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
