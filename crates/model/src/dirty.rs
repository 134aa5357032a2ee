//! Ordered, deduplicated rectangle sets.
//!
//! Used to carry regions touched by an abandoned operation forward into the
//! next one, so stale pixels left on screen get repainted.

use std::collections::HashSet;

use super::Rect;

#[derive(Debug, Default, Clone)]
pub struct DirtyRegionSet {
    // Insertion order is preserved; `seen` only guards against duplicates.
    rects: Vec<Rect>,
    seen: HashSet<Rect>,
}

impl DirtyRegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the rect is empty or already present.
    pub fn insert(&mut self, rect: Rect) -> bool {
        if rect.is_empty() {
            return false;
        }
        if !self.seen.insert(rect) {
            return false;
        }
        self.rects.push(rect);
        true
    }

    pub fn extend(&mut self, rects: impl IntoIterator<Item = Rect>) {
        for rect in rects {
            self.insert(rect);
        }
    }

    /// Drops the current contents and keeps only `rects`.
    pub fn replace(&mut self, rects: impl IntoIterator<Item = Rect>) {
        self.clear();
        self.extend(rects);
    }

    pub fn contains(&self, rect: &Rect) -> bool {
        self.seen.contains(rect)
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rect> {
        self.rects.iter()
    }

    pub fn as_slice(&self) -> &[Rect] {
        &self.rects
    }

    pub fn bounding_rect(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::EMPTY, |bounds, rect| bounds.union(*rect))
    }

    /// Moves all rects out in insertion order, leaving the set empty.
    pub fn take(&mut self) -> Vec<Rect> {
        self.seen.clear();
        std::mem::take(&mut self.rects)
    }

    pub fn clear(&mut self) {
        self.rects.clear();
        self.seen.clear();
    }
}

impl FromIterator<Rect> for DirtyRegionSet {
    fn from_iter<T: IntoIterator<Item = Rect>>(iter: T) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}
