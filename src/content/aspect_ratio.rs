//! Letterboxed / pillarboxed content

use std::sync::atomic::{AtomicBool, Ordering};

use super::{Actor, ActorBox, Color, Content, PaintNode, VideoContent};
use crate::video::Frame;

/// Paints the frame at its display aspect ratio, centred in the content box
pub struct AspectRatioContent {
    content: VideoContent,
    paint_borders: AtomicBool,
}

impl Default for AspectRatioContent {
    fn default() -> Self {
        Self::new(VideoContent::new())
    }
}

impl AspectRatioContent {
    pub fn new(content: VideoContent) -> Self {
        Self {
            content,
            paint_borders: AtomicBool::new(false),
        }
    }

    /// Binding, frame and paint switches
    pub fn content(&self) -> &VideoContent {
        &self.content
    }

    pub fn paint_borders(&self) -> bool {
        self.paint_borders.load(Ordering::Relaxed)
    }

    /// Fill the bars around the frame with the actor's background colour
    pub fn set_paint_borders(&self, paint: bool) {
        if self.paint_borders.swap(paint, Ordering::Relaxed) != paint {
            self.content.invalidate();
        }
    }

    /// Where the current frame lands inside `bx`
    pub fn paint_box(&self, bx: &ActorBox) -> ActorBox {
        match self.content.frame() {
            Some(frame) => fit(bx, display_aspect(&frame)),
            None => *bx,
        }
    }

    /// Width matching `for_height` at the frame aspect; the frame width
    /// when `for_height` is not positive
    pub fn preferred_width(&self, for_height: f32) -> Option<f32> {
        let frame = self.content.frame()?;
        if for_height > 0.0 {
            Some(for_height * display_aspect(&frame) as f32)
        } else {
            Some(frame.width() as f32)
        }
    }

    /// Height matching `for_width` at the frame aspect; the frame height
    /// when `for_width` is not positive
    pub fn preferred_height(&self, for_width: f32) -> Option<f32> {
        let frame = self.content.frame()?;
        if for_width > 0.0 {
            Some(for_width / display_aspect(&frame) as f32)
        } else {
            Some(frame.height() as f32)
        }
    }
}

fn display_aspect(frame: &Frame) -> f64 {
    frame.resolution().display_aspect()
}

/// Largest box of `aspect` centred in `bx`
fn fit(bx: &ActorBox, aspect: f64) -> ActorBox {
    let (width, height) = (bx.width() as f64, bx.height() as f64);
    if width <= 0.0 || height <= 0.0 {
        return *bx;
    }

    let (new_width, new_height) = if width / height < aspect {
        (width, width / aspect)
    } else {
        (height * aspect, height)
    };
    let x1 = bx.x1 as f64 + (width - new_width) / 2.0;
    let y1 = bx.y1 as f64 + (height - new_height) / 2.0;
    ActorBox::new(
        x1 as f32,
        y1 as f32,
        (x1 + new_width) as f32,
        (y1 + new_height) as f32,
    )
}

impl Content for AspectRatioContent {
    fn preferred_size(&self) -> Option<(f32, f32)> {
        self.content.preferred_size()
    }

    fn paint_content(&self, actor: &Actor, root: &mut PaintNode) {
        let content = &self.content;
        if !content.has_painting_content() {
            content.paint_idle(actor, root);
            return;
        }

        let bx = actor.content_box;
        let opacity = actor.paint_opacity;
        let frame = content.frame();
        let paint_box = self.paint_box(&bx);

        if content.paint_frame() {
            let mut node = match &frame {
                Some(frame) => PaintNode::pipeline("AspectRatioVideoFrame", frame.material().clone(), opacity),
                None => PaintNode::color("BlankVideoFrame", Color::BLACK.with_alpha(opacity)),
            };
            node.add_rectangle(paint_box);
            root.add_child(node);
        }

        if self.paint_borders() {
            let strips = bx.complement(&paint_box);
            if !strips.is_empty() {
                let mut node = PaintNode::color("AspectRatioVideoBorders", actor.background.modulated(opacity));
                for strip in strips {
                    node.add_rectangle(strip);
                }
                root.add_child(node);
            }
        }

        if let Some(frame) = &frame {
            content.paint_overlays_mapped(frame, opacity, root, |x, y| {
                (
                    paint_box.x1 + x * paint_box.width(),
                    paint_box.y1 + y * paint_box.height(),
                )
            });
        }
    }
}
