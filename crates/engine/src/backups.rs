use document::{PaintDevice, PixelRegion};
use model::{FrameId, Rect};

/// Original pixels overwritten by one unit, kept until the unit is closed
/// (dropped) or cancelled (written back).
#[derive(Debug, Default)]
pub(crate) struct UnitBackups {
    regions: Vec<(FrameId, PixelRegion)>,
}

impl UnitBackups {
    pub(crate) fn record(&mut self, frame: FrameId, region: PixelRegion) {
        if region.rect().is_empty() {
            return;
        }
        self.regions.push((frame, region));
    }

    pub(crate) fn len(&self) -> usize {
        self.regions.len()
    }

    /// Writes backups back newest first, so overlapping writes unwind to the
    /// oldest pixels. Returns the restored rects in restore order.
    pub(crate) fn restore_into(self, device: &PaintDevice) -> Vec<Rect> {
        let mut restored = Vec::with_capacity(self.regions.len());
        for (frame, region) in self.regions.into_iter().rev() {
            let written = device.write_frame(frame, |buffer| buffer.write_region(&region));
            if written.is_none() {
                panic!("rollback target frame {frame} vanished from paint device");
            }
            restored.push(region.rect());
        }
        restored
    }
}
