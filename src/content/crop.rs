//! Cropped content
//!
//! Both regions are normalized boxes: `input_region` selects part of the
//! frame, `output_region` the part of the content box it is drawn into.

use parking_lot::Mutex;

use super::{Actor, ActorBox, Content, PaintNode, VideoContent};
use crate::error::MediaError;

const LOG_TARGET: &str = "immersive_media_bridge::content";

const FULL: ActorBox = ActorBox::new(0.0, 0.0, 1.0, 1.0);

struct CropState {
    input_region: ActorBox,
    output_region: ActorBox,
    paint_borders: bool,
}

pub struct CropContent {
    content: VideoContent,
    state: Mutex<CropState>,
}

impl Default for CropContent {
    fn default() -> Self {
        Self::new(VideoContent::new())
    }
}

fn validate(region: &ActorBox) -> Result<(), MediaError> {
    let in_unit = |v: f32| (0.0..=1.0).contains(&v);
    if in_unit(region.x1) && in_unit(region.x2) && in_unit(region.y1) && in_unit(region.y2)
        && region.x1 <= region.x2
        && region.y1 <= region.y2
    {
        Ok(())
    } else {
        Err(MediaError::InvalidArgument(format!(
            "region ({}, {}, {}, {}) must satisfy 0 <= x1 <= x2 <= 1 and 0 <= y1 <= y2 <= 1",
            region.x1, region.y1, region.x2, region.y2
        )))
    }
}

impl CropContent {
    pub fn new(content: VideoContent) -> Self {
        Self {
            content,
            state: Mutex::new(CropState {
                input_region: FULL,
                output_region: FULL,
                paint_borders: false,
            }),
        }
    }

    pub fn content(&self) -> &VideoContent {
        &self.content
    }

    pub fn input_region(&self) -> ActorBox {
        self.state.lock().input_region
    }

    /// Part of the frame to show; rejected regions keep the previous one
    pub fn set_input_region(&self, region: ActorBox) -> Result<(), MediaError> {
        if let Err(e) = validate(&region) {
            tracing::warn!(target: LOG_TARGET, "input region rejected: {}", e);
            return Err(e);
        }
        self.state.lock().input_region = region;
        self.content.invalidate();
        Ok(())
    }

    pub fn output_region(&self) -> ActorBox {
        self.state.lock().output_region
    }

    /// Part of the content box to draw into; rejected regions keep the
    /// previous one
    pub fn set_output_region(&self, region: ActorBox) -> Result<(), MediaError> {
        if let Err(e) = validate(&region) {
            tracing::warn!(target: LOG_TARGET, "output region rejected: {}", e);
            return Err(e);
        }
        self.state.lock().output_region = region;
        self.content.invalidate();
        Ok(())
    }

    pub fn paint_borders(&self) -> bool {
        self.state.lock().paint_borders
    }

    pub fn set_paint_borders(&self, paint: bool) {
        if std::mem::replace(&mut self.state.lock().paint_borders, paint) != paint {
            self.content.invalidate();
        }
    }
}

impl Content for CropContent {
    fn preferred_size(&self) -> Option<(f32, f32)> {
        self.content.preferred_size()
    }

    fn paint_content(&self, actor: &Actor, root: &mut PaintNode) {
        let content = &self.content;
        if !content.has_painting_content() {
            content.paint_idle(actor, root);
            return;
        }
        let Some(frame) = content.frame() else {
            return;
        };

        let (input, output, paint_borders) = {
            let st = self.state.lock();
            (st.input_region, st.output_region, st.paint_borders)
        };
        let bx = actor.content_box;
        let opacity = actor.paint_opacity;
        let to_actor = |x: f32, y: f32| (bx.x1 + x * bx.width(), bx.y1 + y * bx.height());
        let (ox1, oy1) = to_actor(output.x1, output.y1);
        let (ox2, oy2) = to_actor(output.x2, output.y2);
        let out_box = ActorBox::new(ox1, oy1, ox2, oy2);

        if content.paint_frame() {
            let mut node = PaintNode::pipeline("Video", frame.material().clone(), opacity);
            node.add_texture_rectangle(out_box, input.x1, input.y1, input.x2, input.y2);
            root.add_child(node);
        }

        if paint_borders && output != FULL {
            let strips = bx.complement(&out_box);
            if !strips.is_empty() {
                let mut node = PaintNode::color("VideoBorders", actor.background.with_alpha(opacity));
                for strip in strips {
                    node.add_rectangle(strip);
                }
                root.add_child(node);
            }
        }

        // Frame coordinates through the input region into the output box
        let (in_w, in_h) = (input.width(), input.height());
        if in_w > 0.0 && in_h > 0.0 {
            content.paint_overlays_mapped(&frame, opacity, root, |x, y| {
                (
                    out_box.x1 + (x - input.x1) / in_w * out_box.width(),
                    out_box.y1 + (y - input.y1) / in_h * out_box.height(),
                )
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{push, rgb, sink};
    use super::*;
    use crate::content::{Color, PaintNodeKind};

    fn bound() -> (crate::mainloop::MainContext, crate::sink::VideoSink, CropContent) {
        let (ctx, sink) = sink();
        let content = CropContent::new(VideoContent::with_sink(sink.clone()));
        (ctx, sink, content)
    }

    #[test]
    fn test_defaults() {
        let crop = CropContent::default();
        assert_eq!(crop.input_region(), FULL);
        assert_eq!(crop.output_region(), FULL);
        assert!(!crop.paint_borders());
    }

    #[test]
    fn test_invalid_regions_rejected() {
        let crop = CropContent::default();
        let good = ActorBox::new(0.25, 0.25, 0.75, 0.5);
        crop.set_input_region(good).unwrap();

        for bad in [
            ActorBox::new(-0.1, 0.0, 1.0, 1.0),
            ActorBox::new(0.0, 0.0, 1.5, 1.0),
            ActorBox::new(0.6, 0.0, 0.4, 1.0),
            ActorBox::new(0.0, 0.8, 1.0, 0.2),
        ] {
            let err = crop.set_input_region(bad).unwrap_err();
            assert!(matches!(err, MediaError::InvalidArgument(_)));
            assert!(crop.set_output_region(bad).is_err());
        }
        assert_eq!(crop.input_region(), good);
        assert_eq!(crop.output_region(), FULL);
    }

    #[test]
    fn test_draws_input_into_output() {
        let (ctx, sink, crop) = bound();
        push(&ctx, &sink, &rgb(64, 64));
        crop.set_input_region(ActorBox::new(0.25, 0.0, 0.75, 0.5)).unwrap();
        crop.set_output_region(ActorBox::new(0.5, 0.5, 1.0, 1.0)).unwrap();

        let mut root = PaintNode::root();
        crop.paint_content(&Actor::with_size(200.0, 100.0), &mut root);
        let r = root.find("Video").unwrap().rectangles()[0];
        assert_eq!(r.rect, ActorBox::new(100.0, 50.0, 200.0, 100.0));
        assert_eq!((r.s1, r.t1, r.s2, r.t2), (0.25, 0.0, 0.75, 0.5));
        assert!(root.find("VideoBorders").is_none());
    }

    #[test]
    fn test_borders_complement_output() {
        let (ctx, sink, crop) = bound();
        push(&ctx, &sink, &rgb(64, 64));
        crop.set_output_region(ActorBox::new(0.25, 0.25, 0.75, 0.75)).unwrap();
        crop.set_paint_borders(true);

        let mut actor = Actor::with_size(100.0, 100.0);
        actor.background = Color::new(0, 0, 255, 255);
        actor.paint_opacity = 128;
        let mut root = PaintNode::root();
        crop.paint_content(&actor, &mut root);

        let borders = root.find("VideoBorders").unwrap();
        assert!(matches!(borders.kind(), PaintNodeKind::Color(c) if *c == Color::new(0, 0, 255, 128)));
        let area: f32 = borders.rectangles().iter().map(|r| r.rect.width() * r.rect.height()).sum();
        assert_eq!(area, 100.0 * 100.0 - 50.0 * 50.0);
    }

    #[test]
    fn test_full_output_has_no_borders() {
        let (ctx, sink, crop) = bound();
        push(&ctx, &sink, &rgb(64, 64));
        crop.set_paint_borders(true);
        let mut root = PaintNode::root();
        crop.paint_content(&Actor::with_size(100.0, 100.0), &mut root);
        assert!(root.find("VideoBorders").is_none());
    }

    #[test]
    fn test_idle_without_frame() {
        let crop = CropContent::default();
        let mut root = PaintNode::root();
        crop.paint_content(&Actor::with_size(10.0, 10.0), &mut root);
        assert!(root.find("IdleVideo").is_some());
    }
}
