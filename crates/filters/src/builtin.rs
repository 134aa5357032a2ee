use document::{PixelBuffer, PixelRegion};
use model::Rect;
use protocol::{GradientStop, OperationConfig, PropertyValue, ResourceData};
use smol_str::SmolStr;

use super::{Filter, FilterContext, FilterError, map_pixels};

const MAX_BLUR_RADIUS: i64 = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct Invert;

impl Filter for Invert {
    fn id(&self) -> &str {
        "invert"
    }

    fn process(
        &self,
        source: &PixelBuffer,
        rect: Rect,
        _config: &OperationConfig,
        _context: &FilterContext<'_>,
    ) -> Result<PixelRegion, FilterError> {
        Ok(map_pixels(source, rect, |_, _, [r, g, b, a]| {
            [255 - r, 255 - g, 255 - b, a]
        }))
    }
}

/// Adds `amount` (-255..=255) to every color channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Brightness;

impl Filter for Brightness {
    fn id(&self) -> &str {
        "brightness"
    }

    fn process(
        &self,
        source: &PixelBuffer,
        rect: Rect,
        config: &OperationConfig,
        _context: &FilterContext<'_>,
    ) -> Result<PixelRegion, FilterError> {
        let amount = int_property(self.id(), config, "amount", 0, -255..=255)? as i16;
        Ok(map_pixels(source, rect, |_, _, [r, g, b, a]| {
            let shift = |channel: u8| (i16::from(channel) + amount).clamp(0, 255) as u8;
            [shift(r), shift(g), shift(b), a]
        }))
    }
}

/// Averages a `(2 * radius + 1)` square window around every pixel.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxBlur;

impl BoxBlur {
    fn radius(config: &OperationConfig) -> Result<u32, FilterError> {
        int_property("box_blur", config, "radius", 1, 0..=MAX_BLUR_RADIUS).map(|radius| radius as u32)
    }
}

impl Filter for BoxBlur {
    fn id(&self) -> &str {
        "box_blur"
    }

    fn changed_rect(&self, rect: Rect, config: &OperationConfig) -> Rect {
        let radius = Self::radius(config).unwrap_or(0);
        rect.inflate(radius)
    }

    fn process(
        &self,
        source: &PixelBuffer,
        rect: Rect,
        config: &OperationConfig,
        _context: &FilterContext<'_>,
    ) -> Result<PixelRegion, FilterError> {
        let radius = Self::radius(config)? as i32;
        let window = ((2 * radius + 1) * (2 * radius + 1)) as u32;
        Ok(map_pixels(source, rect, |x, y, _| {
            let mut sums = [0u32; 4];
            for sample_y in y - radius..=y + radius {
                for sample_x in x - radius..=x + radius {
                    let sample = source.pixel(sample_x, sample_y);
                    for (sum, channel) in sums.iter_mut().zip(sample) {
                        *sum += u32::from(channel);
                    }
                }
            }
            sums.map(|sum| (sum / window) as u8)
        }))
    }
}

/// Maps pixel luminance onto an embedded gradient resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientMap;

impl Filter for GradientMap {
    fn id(&self) -> &str {
        "gradient_map"
    }

    fn process(
        &self,
        source: &PixelBuffer,
        rect: Rect,
        config: &OperationConfig,
        _context: &FilterContext<'_>,
    ) -> Result<PixelRegion, FilterError> {
        let Some(resource) = config.get_resource("gradient") else {
            return Err(FilterError::MissingResource {
                filter: SmolStr::new(self.id()),
                property: SmolStr::new_static("gradient"),
            });
        };
        let ResourceData::Gradient { stops } = &**resource else {
            return Err(FilterError::InvalidProperty {
                filter: SmolStr::new(self.id()),
                property: SmolStr::new_static("gradient"),
                reason: "resource is not a gradient".to_owned(),
            });
        };
        if stops.is_empty() {
            return Err(FilterError::InvalidProperty {
                filter: SmolStr::new(self.id()),
                property: SmolStr::new_static("gradient"),
                reason: "gradient has no stops".to_owned(),
            });
        }
        let mut stops = stops.clone();
        stops.sort_by(|a, b| a.position.total_cmp(&b.position));

        Ok(map_pixels(source, rect, |_, _, [r, g, b, a]| {
            let luminance =
                (0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)) / 255.0;
            let [mr, mg, mb, _] = sample_gradient(&stops, luminance);
            [mr, mg, mb, a]
        }))
    }
}

/// Composites the layer over the canvas background color. Transparent areas
/// of the whole canvas get filled, so this one needs the document bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenBackground;

impl Filter for FlattenBackground {
    fn id(&self) -> &str {
        "flatten_background"
    }

    fn needs_full_document_context(&self) -> bool {
        true
    }

    fn process(
        &self,
        source: &PixelBuffer,
        rect: Rect,
        _config: &OperationConfig,
        context: &FilterContext<'_>,
    ) -> Result<PixelRegion, FilterError> {
        let background = context.canvas.background;
        Ok(map_pixels(source, rect, |_, _, [r, g, b, a]| {
            let alpha = u32::from(a);
            let blend = |top: u8, bottom: u8| {
                ((u32::from(top) * alpha + u32::from(bottom) * (255 - alpha)) / 255) as u8
            };
            [
                blend(r, background[0]),
                blend(g, background[1]),
                blend(b, background[2]),
                255,
            ]
        }))
    }
}

fn int_property(
    filter: &str,
    config: &OperationConfig,
    property: &'static str,
    default: i64,
    range: std::ops::RangeInclusive<i64>,
) -> Result<i64, FilterError> {
    let value = match config.get(property) {
        None => default,
        Some(PropertyValue::Int(value)) => *value,
        Some(other) => {
            return Err(FilterError::InvalidProperty {
                filter: SmolStr::new(filter),
                property: SmolStr::new_static(property),
                reason: format!("expected integer, got {other:?}"),
            });
        }
    };
    if !range.contains(&value) {
        return Err(FilterError::InvalidProperty {
            filter: SmolStr::new(filter),
            property: SmolStr::new_static(property),
            reason: format!(
                "{value} outside {}..={}",
                range.start(),
                range.end()
            ),
        });
    }
    Ok(value)
}

fn sample_gradient(stops: &[GradientStop], position: f32) -> [u8; 4] {
    let first = stops[0];
    if position <= first.position {
        return first.color;
    }
    for pair in stops.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if position <= end.position {
            let span = end.position - start.position;
            let t = if span <= f32::EPSILON {
                1.0
            } else {
                (position - start.position) / span
            };
            let mut color = [0u8; 4];
            for (index, channel) in color.iter_mut().enumerate() {
                let from = f32::from(start.color[index]);
                let to = f32::from(end.color[index]);
                *channel = (from + (to - from) * t).round() as u8;
            }
            return color;
        }
    }
    stops[stops.len() - 1].color
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use document::CanvasSettings;
    use protocol::{EmbeddedResource, GradientStop, PropertyValue, ResourceData};

    use super::*;

    fn context(canvas: &CanvasSettings) -> FilterContext<'_> {
        FilterContext { canvas }
    }

    #[test]
    fn invert_keeps_alpha_and_clips_to_source() {
        let source = PixelBuffer::filled(Rect::new(0, 0, 4, 4), [10, 20, 30, 128]);
        let canvas = CanvasSettings::default();
        let region = Invert
            .process(
                &source,
                Rect::new(2, 2, 8, 8),
                &OperationConfig::new("invert"),
                &context(&canvas),
            )
            .expect("invert");

        assert_eq!(region.rect(), Rect::new(2, 2, 2, 2));
        assert_eq!(region.get(3, 3), Some([245, 235, 225, 128]));
    }

    #[test]
    fn brightness_clamps_and_validates_amount() {
        let source = PixelBuffer::filled(Rect::new(0, 0, 2, 2), [250, 5, 100, 255]);
        let canvas = CanvasSettings::default();
        let config = OperationConfig::new("brightness").with("amount", PropertyValue::Int(10));
        let region = Brightness
            .process(&source, source.bounds(), &config, &context(&canvas))
            .expect("brightness");
        assert_eq!(region.get(0, 0), Some([255, 15, 110, 255]));

        let invalid = OperationConfig::new("brightness").with("amount", PropertyValue::Int(999));
        assert!(matches!(
            Brightness.process(&source, source.bounds(), &invalid, &context(&canvas)),
            Err(FilterError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn box_blur_grows_changed_rect_and_averages_neighbours() {
        let mut source = PixelBuffer::new(Rect::new(0, 0, 5, 5));
        source.set_pixel(2, 2, [90, 90, 90, 90]);
        let canvas = CanvasSettings::default();
        let config = OperationConfig::new("box_blur").with("radius", PropertyValue::Int(1));

        assert_eq!(
            BoxBlur.changed_rect(Rect::new(2, 2, 1, 1), &config),
            Rect::new(1, 1, 3, 3)
        );
        let region = BoxBlur
            .process(&source, Rect::new(1, 1, 3, 3), &config, &context(&canvas))
            .expect("blur");
        assert_eq!(region.get(1, 1), Some([10, 10, 10, 10]));
        assert_eq!(region.get(2, 2), Some([10, 10, 10, 10]));
    }

    #[test]
    fn gradient_map_requires_embedded_gradient() {
        let source = PixelBuffer::filled(Rect::new(0, 0, 1, 1), [255, 255, 255, 200]);
        let canvas = CanvasSettings::default();
        let unresolved = OperationConfig::new("gradient_map")
            .with("gradient", PropertyValue::ResourceRef("sunset".into()));
        assert!(matches!(
            GradientMap.process(&source, source.bounds(), &unresolved, &context(&canvas)),
            Err(FilterError::MissingResource { .. })
        ));

        let embedded = OperationConfig::new("gradient_map").with(
            "gradient",
            PropertyValue::Resource(EmbeddedResource {
                name: "sunset".into(),
                data: Arc::new(ResourceData::Gradient {
                    stops: vec![
                        GradientStop {
                            position: 1.0,
                            color: [200, 100, 0, 255],
                        },
                        GradientStop {
                            position: 0.0,
                            color: [0, 0, 0, 255],
                        },
                    ],
                }),
            }),
        );
        let region = GradientMap
            .process(&source, source.bounds(), &embedded, &context(&canvas))
            .expect("gradient map");
        assert_eq!(region.get(0, 0), Some([200, 100, 0, 200]));
    }

    #[test]
    fn flatten_background_fills_transparent_pixels() {
        let source = PixelBuffer::new(Rect::new(0, 0, 2, 1));
        let canvas = CanvasSettings {
            foreground: [0, 0, 0, 255],
            background: [40, 50, 60, 255],
        };
        let region = FlattenBackground
            .process(
                &source,
                source.bounds(),
                &OperationConfig::new("flatten_background"),
                &context(&canvas),
            )
            .expect("flatten");
        assert_eq!(region.get(1, 0), Some([40, 50, 60, 255]));
    }
}
