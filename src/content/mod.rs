//! Scene-graph content backed by a video sink
//!
//! A content object follows the frames of one `VideoSink`, either bound
//! directly or through a `Player`, and turns the current frame and its
//! overlays into paint nodes for the compositor. `VideoContent` stretches
//! the frame over the content box; `AspectRatioContent` and `CropContent`
//! place it differently.

mod aspect_ratio;
mod crop;
mod paint;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::player::Player;
use crate::signal::{HandlerId, Signal};
use crate::sink::{Overlay, VideoSink};
use crate::video::{Fraction, Frame};

pub use aspect_ratio::AspectRatioContent;
pub use crop::CropContent;
pub use paint::{Actor, ActorBox, Color, ContentRepeat, PaintNode, PaintNodeKind, TextureRectangle};

const LOG_TARGET: &str = "immersive_media_bridge::content";

/// Something the compositor can size and paint
pub trait Content: Send + Sync {
    /// Natural size, `None` until a frame has been seen
    fn preferred_size(&self) -> Option<(f32, f32)>;

    /// Append this content's nodes under `root`
    fn paint_content(&self, actor: &Actor, root: &mut PaintNode);
}

#[derive(Default)]
pub struct ContentSignals {
    /// Frame width and height changed
    pub size_change: Signal<(u32, u32)>,
    /// Painted output is stale
    pub invalidate: Signal<()>,
}

struct SinkHandlers {
    new_frame: HandlerId,
    new_overlays: HandlerId,
    par_changed: HandlerId,
}

struct ContentState {
    sink: Option<VideoSink>,
    handlers: Option<SinkHandlers>,
    player: Option<Arc<dyn Player>>,
    frame: Option<Frame>,
    overlays: Vec<Overlay>,
    paint_frame: bool,
    paint_overlays: bool,
}

struct ContentInner {
    state: Mutex<ContentState>,
    signals: ContentSignals,
}

/// Frame content stretched over the content box. Cheap to clone.
#[derive(Clone)]
pub struct VideoContent {
    inner: Arc<ContentInner>,
}

impl Default for VideoContent {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoContent {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContentInner {
                state: Mutex::new(ContentState {
                    sink: None,
                    handlers: None,
                    player: None,
                    frame: None,
                    overlays: Vec::new(),
                    paint_frame: true,
                    paint_overlays: true,
                }),
                signals: ContentSignals::default(),
            }),
        }
    }

    pub fn with_sink(sink: VideoSink) -> Self {
        let content = Self::new();
        content.set_sink(Some(sink));
        content
    }

    pub fn with_player(player: Arc<dyn Player>) -> Self {
        let content = Self::new();
        content.set_player(Some(player));
        content
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BINDING
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn sink(&self) -> Option<VideoSink> {
        self.inner.state.lock().sink.clone()
    }

    /// Follow `sink` directly; any player binding is dropped
    pub fn set_sink(&self, sink: Option<VideoSink>) {
        self.bind_sink(sink, false);
    }

    pub fn player(&self) -> Option<Arc<dyn Player>> {
        self.inner.state.lock().player.clone()
    }

    /// Follow the sink of `player`
    pub fn set_player(&self, player: Option<Arc<dyn Player>>) {
        let sink = {
            let mut st = self.inner.state.lock();
            let same = match (&st.player, &player) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if same {
                return;
            }
            let sink = player.as_ref().map(|p| p.video_sink());
            st.player = player;
            sink
        };
        self.bind_sink(sink, true);
    }

    fn bind_sink(&self, sink: Option<VideoSink>, from_player: bool) {
        let previous = {
            let mut st = self.inner.state.lock();
            let same = match (&st.sink, &sink) {
                (Some(a), Some(b)) => a.ptr_eq(b),
                (None, None) => true,
                _ => false,
            };
            if same {
                return;
            }
            if !from_player {
                st.player = None;
            }
            st.sink.take().zip(st.handlers.take())
        };

        if let Some((old, handlers)) = previous {
            let signals = old.signals();
            signals.new_frame.disconnect(handlers.new_frame);
            signals.new_overlays.disconnect(handlers.new_overlays);
            signals.pixel_aspect_ratio_changed.disconnect(handlers.par_changed);
        }

        let Some(sink) = sink else {
            tracing::debug!(target: LOG_TARGET, "content unbound");
            return;
        };

        let handlers = self.connect_sink(&sink);
        {
            let mut st = self.inner.state.lock();
            st.sink = Some(sink.clone());
            st.handlers = Some(handlers);
        }
        tracing::debug!(target: LOG_TARGET, ready = sink.is_ready(), from_player, "content bound to sink");

        if sink.is_ready() {
            if let Some(frame) = sink.frame() {
                self.update_frame(&frame);
            }
            self.inner.state.lock().overlays = sink.overlays();
        }
    }

    fn connect_sink(&self, sink: &VideoSink) -> SinkHandlers {
        let signals = sink.signals();

        let weak: Weak<ContentInner> = Arc::downgrade(&self.inner);
        let new_frame = signals.new_frame.connect(move |frame: &Frame| {
            if let Some(inner) = weak.upgrade() {
                let content = VideoContent { inner };
                content.update_frame(frame);
                content.invalidate_if_painting();
            }
        });

        let weak: Weak<ContentInner> = Arc::downgrade(&self.inner);
        let overlay_sink = sink.clone();
        let new_overlays = signals.new_overlays.connect(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().overlays = overlay_sink.overlays();
                VideoContent { inner }.invalidate_if_painting();
            }
        });

        let weak: Weak<ContentInner> = Arc::downgrade(&self.inner);
        let par_changed = signals.pixel_aspect_ratio_changed.connect(move |par: &Fraction| {
            if let Some(inner) = weak.upgrade() {
                if let Some(frame) = inner.state.lock().frame.as_mut() {
                    frame.set_pixel_aspect_ratio(par.num, par.den);
                }
                VideoContent { inner }.invalidate_if_painting();
            }
        });

        SinkHandlers {
            new_frame,
            new_overlays,
            par_changed,
        }
    }

    fn update_frame(&self, frame: &Frame) {
        let resized = {
            let mut st = self.inner.state.lock();
            let previous = st.frame.replace(frame.clone());
            previous.map_or(true, |old| old.width() != frame.width() || old.height() != frame.height())
        };
        if resized {
            tracing::debug!(target: LOG_TARGET, width = frame.width(), height = frame.height(), "content size changed");
            self.inner.signals.size_change.emit(&(frame.width(), frame.height()));
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STATE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Latest frame seen on the bound sink
    pub fn frame(&self) -> Option<Frame> {
        self.inner.state.lock().frame.clone()
    }

    pub fn overlays(&self) -> Vec<Overlay> {
        self.inner.state.lock().overlays.clone()
    }

    pub fn paint_frame(&self) -> bool {
        self.inner.state.lock().paint_frame
    }

    pub fn set_paint_frame(&self, paint: bool) {
        if std::mem::replace(&mut self.inner.state.lock().paint_frame, paint) != paint {
            self.invalidate();
        }
    }

    pub fn paint_overlays(&self) -> bool {
        self.inner.state.lock().paint_overlays
    }

    pub fn set_paint_overlays(&self, paint: bool) {
        if std::mem::replace(&mut self.inner.state.lock().paint_overlays, paint) != paint {
            self.invalidate();
        }
    }

    /// A frame or overlays are there and switched on
    pub fn has_painting_content(&self) -> bool {
        let st = self.inner.state.lock();
        (st.paint_frame && st.frame.is_some()) || (st.paint_overlays && !st.overlays.is_empty())
    }

    pub fn signals(&self) -> &ContentSignals {
        &self.inner.signals
    }

    pub fn invalidate(&self) {
        self.inner.signals.invalidate.emit(&());
    }

    fn invalidate_if_painting(&self) {
        if self.has_painting_content() {
            self.invalidate();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PAINTING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Background colour over the content box
    pub(crate) fn paint_idle(&self, actor: &Actor, root: &mut PaintNode) {
        let mut node = PaintNode::color("IdleVideo", actor.background.with_alpha(actor.paint_opacity));
        node.add_rectangle(actor.content_box);
        root.add_child(node);
    }

    /// Overlays of `frame`; `map` takes normalized frame coordinates to
    /// actor coordinates
    pub(crate) fn paint_overlays_mapped<F>(&self, frame: &Frame, opacity: u8, root: &mut PaintNode, map: F)
    where
        F: Fn(f32, f32) -> (f32, f32),
    {
        if !self.paint_overlays() {
            return;
        }
        let (fw, fh) = (frame.width() as f32, frame.height() as f32);
        for overlay in self.overlays() {
            let r = overlay.rect;
            let (x1, y1) = map(r.x1 / fw, r.y1 / fh);
            let (x2, y2) = map(r.x2 / fw, r.y2 / fh);
            let mut node = PaintNode::pipeline("VideoOverlay", overlay.material.clone(), opacity);
            node.add_rectangle(ActorBox::new(x1, y1, x2, y2));
            root.add_child(node);
        }
    }
}

impl Content for VideoContent {
    fn preferred_size(&self) -> Option<(f32, f32)> {
        self.frame().map(|f| (f.width() as f32, f.height() as f32))
    }

    fn paint_content(&self, actor: &Actor, root: &mut PaintNode) {
        if !self.has_painting_content() {
            self.paint_idle(actor, root);
            return;
        }

        let bx = actor.content_box;
        let opacity = actor.paint_opacity;
        let Some(frame) = self.frame() else {
            return;
        };

        if self.paint_frame() {
            let mut node = PaintNode::pipeline("Video", frame.material().clone(), opacity);
            if actor.repeat == ContentRepeat::None {
                node.add_rectangle(bx);
            } else {
                let t_w = if actor.repeat.repeats_x() {
                    bx.width() / frame.width() as f32
                } else {
                    1.0
                };
                let t_h = if actor.repeat.repeats_y() {
                    bx.height() / frame.height() as f32
                } else {
                    1.0
                };
                node.add_texture_rectangle(bx, 0.0, 0.0, t_w, t_h);
            }
            root.add_child(node);
        }

        self.paint_overlays_mapped(&frame, opacity, root, |x, y| {
            (bx.x1 + x * bx.width(), bx.y1 + y * bx.height())
        });
    }
}

impl Drop for ContentInner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let Some((sink, handlers)) = st.sink.take().zip(st.handlers.take()) {
            let signals = sink.signals();
            signals.new_frame.disconnect(handlers.new_frame);
            signals.new_overlays.disconnect(handlers.new_overlays);
            signals.pixel_aspect_ratio_changed.disconnect(handlers.par_changed);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::gpu::SoftwareContext;
    use crate::mainloop::MainContext;
    use crate::sink::VideoSink;
    use crate::video::{OverlayRectangle, PixelFormat, VideoBuffer, VideoCaps};

    pub(crate) fn sink() -> (MainContext, VideoSink) {
        let ctx = MainContext::with_manual_clock();
        let sink = VideoSink::new(&ctx, Arc::new(SoftwareContext::new()));
        (ctx, sink)
    }

    pub(crate) fn push(ctx: &MainContext, sink: &VideoSink, caps: &VideoCaps) {
        push_with_overlays(ctx, sink, caps, Vec::new());
    }

    pub(crate) fn push_with_overlays(
        ctx: &MainContext,
        sink: &VideoSink,
        caps: &VideoCaps,
        overlays: Vec<OverlayRectangle>,
    ) {
        if sink.caps() != Some(*caps) {
            sink.set_caps(caps).unwrap();
        }
        sink.render(VideoBuffer::zeroed(caps).with_overlays(overlays)).unwrap();
        ctx.run_pending();
    }

    pub(crate) fn rgb(width: u32, height: u32) -> VideoCaps {
        VideoCaps::new(PixelFormat::Rgb24, width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{push, push_with_overlays, rgb, sink};
    use super::*;
    use crate::pipeline::SimulatedPlaybin;
    use crate::player::PipelinePlayer;
    use crate::video::OverlayRectangle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter<A: 'static>(signal: &Signal<A>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_idle_without_frame() {
        let content = VideoContent::new();
        assert_eq!(content.preferred_size(), None);

        let mut actor = Actor::with_size(320.0, 240.0);
        actor.background = Color::new(10, 20, 30, 255);
        actor.paint_opacity = 200;
        let mut root = PaintNode::root();
        content.paint_content(&actor, &mut root);

        let idle = root.find("IdleVideo").unwrap();
        assert!(matches!(idle.kind(), PaintNodeKind::Color(c) if *c == Color::new(10, 20, 30, 200)));
        assert_eq!(idle.rectangles()[0].rect, actor.content_box);
        assert!(root.find("Video").is_none());
    }

    #[test]
    fn test_follows_sink_frames() {
        let (ctx, sink) = sink();
        let content = VideoContent::with_sink(sink.clone());
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&sizes);
        content.signals().size_change.connect(move |size| s.lock().push(*size));
        let invalidated = counter(&content.signals().invalidate);

        push(&ctx, &sink, &rgb(64, 48));
        push(&ctx, &sink, &rgb(64, 48));
        push(&ctx, &sink, &rgb(32, 32));

        assert_eq!(*sizes.lock(), vec![(64, 48), (32, 32)]);
        assert_eq!(invalidated.load(Ordering::SeqCst), 3);
        assert_eq!(content.preferred_size(), Some((32.0, 32.0)));
        assert!(content.frame().unwrap().shares_material(&sink.frame().unwrap()));
    }

    #[test]
    fn test_par_change_alone_is_not_a_size_change() {
        let (ctx, sink) = sink();
        let content = VideoContent::with_sink(sink.clone());
        let resized = counter(&content.signals().size_change);

        push(&ctx, &sink, &rgb(64, 48));
        push(&ctx, &sink, &rgb(64, 48).with_pixel_aspect_ratio(4, 3));
        assert_eq!(resized.load(Ordering::SeqCst), 1);
        assert_eq!(content.frame().unwrap().resolution().par_n, 4);
    }

    #[test]
    fn test_paints_stretched_frame() {
        let (ctx, sink) = sink();
        let content = VideoContent::with_sink(sink.clone());
        push(&ctx, &sink, &rgb(64, 48));

        let mut root = PaintNode::root();
        content.paint_content(&Actor::with_size(640.0, 480.0), &mut root);
        let video = root.find("Video").unwrap();
        assert_eq!(video.rectangles().len(), 1);
        let r = video.rectangles()[0];
        assert_eq!(r.rect, ActorBox::from_size(640.0, 480.0));
        assert_eq!((r.s2, r.t2), (1.0, 1.0));
        assert!(matches!(video.kind(), PaintNodeKind::Pipeline { opacity: 255, .. }));
    }

    #[test]
    fn test_repeat_texture_coordinates() {
        let (ctx, sink) = sink();
        let content = VideoContent::with_sink(sink.clone());
        push(&ctx, &sink, &rgb(64, 48));

        let mut actor = Actor::with_size(256.0, 96.0);
        actor.repeat = ContentRepeat::XAxis;
        let mut root = PaintNode::root();
        content.paint_content(&actor, &mut root);
        let r = root.find("Video").unwrap().rectangles()[0];
        assert_eq!((r.s1, r.t1, r.s2, r.t2), (0.0, 0.0, 4.0, 1.0));

        actor.repeat = ContentRepeat::Both;
        let mut root = PaintNode::root();
        content.paint_content(&actor, &mut root);
        let r = root.find("Video").unwrap().rectangles()[0];
        assert_eq!((r.s2, r.t2), (4.0, 2.0));
    }

    #[test]
    fn test_overlays_scaled_into_box() {
        let (ctx, sink) = sink();
        let content = VideoContent::with_sink(sink.clone());
        let subtitle = OverlayRectangle::new(vec![255; 8 * 4 * 4], 8, 4, 16, 40);
        push_with_overlays(&ctx, &sink, &rgb(64, 48), vec![subtitle]);

        let mut root = PaintNode::root();
        content.paint_content(&Actor::with_size(128.0, 96.0), &mut root);
        let overlay = root.find("VideoOverlay").unwrap();
        assert_eq!(overlay.rectangles()[0].rect, ActorBox::new(32.0, 80.0, 48.0, 88.0));

        content.set_paint_overlays(false);
        let mut root = PaintNode::root();
        content.paint_content(&Actor::with_size(128.0, 96.0), &mut root);
        assert!(root.find("VideoOverlay").is_none());
        assert!(root.find("Video").is_some());
    }

    #[test]
    fn test_paint_frame_switch() {
        let (ctx, sink) = sink();
        let content = VideoContent::with_sink(sink.clone());
        push(&ctx, &sink, &rgb(64, 48));
        let invalidated = counter(&content.signals().invalidate);

        content.set_paint_frame(false);
        content.set_paint_frame(false);
        assert_eq!(invalidated.load(Ordering::SeqCst), 1);

        let mut root = PaintNode::root();
        content.paint_content(&Actor::with_size(64.0, 48.0), &mut root);
        assert!(root.find("Video").is_none());
        assert!(root.find("IdleVideo").is_some());
    }

    #[test]
    fn test_binding_ready_sink_pulls_frame() {
        let (ctx, sink) = sink();
        push(&ctx, &sink, &rgb(40, 30));

        let content = VideoContent::new();
        let resized = counter(&content.signals().size_change);
        content.set_sink(Some(sink));
        assert_eq!(resized.load(Ordering::SeqCst), 1);
        assert_eq!(content.preferred_size(), Some((40.0, 30.0)));
    }

    #[test]
    fn test_player_binding() {
        let (ctx, sink) = sink();
        let player: Arc<dyn Player> =
            Arc::new(PipelinePlayer::new(&ctx, Arc::new(SimulatedPlaybin::new(&ctx)), sink.clone()).unwrap());
        let content = VideoContent::with_player(Arc::clone(&player));
        assert!(content.sink().unwrap().ptr_eq(&sink));
        assert!(content.player().is_some());

        push(&ctx, &sink, &rgb(16, 16));
        assert_eq!(content.preferred_size(), Some((16.0, 16.0)));

        // An explicit sink replaces the player binding
        let (other_ctx, other) = test_support::sink();
        content.set_sink(Some(other.clone()));
        assert!(content.player().is_none());
        push(&ctx, &sink, &rgb(8, 8));
        assert_eq!(content.preferred_size(), Some((16.0, 16.0)));
        assert_eq!(sink.signals().new_frame.handler_count(), 1);

        push(&other_ctx, &other, &rgb(24, 12));
        assert_eq!(content.preferred_size(), Some((24.0, 12.0)));
    }

    #[test]
    fn test_drop_disconnects() {
        let (_ctx, sink) = sink();
        let content = VideoContent::with_sink(sink.clone());
        assert_eq!(sink.signals().new_overlays.handler_count(), 1);
        drop(content);
        assert_eq!(sink.signals().new_frame.handler_count(), 0);
        assert_eq!(sink.signals().new_overlays.handler_count(), 0);
        assert_eq!(sink.signals().pixel_aspect_ratio_changed.handler_count(), 0);
    }
}
