//! Video sink: decoded buffers in, GPU frames out
//!
//! Producer threads call `set_caps` and `render`. The newest buffer waits
//! in a single slot; a coalesced main-context dispatch picks it up on the
//! render thread, uploads it through the negotiated renderer and emits
//! `new_frame`. Intermediate buffers that arrive before the render thread
//! gets to them are dropped.
//!
//! ```text
//!  decoder thread              render thread
//!  ──────────────              ─────────────
//!  set_caps(caps) ──┐
//!  render(buf) ─────┼─► slot ─► dispatch ─► upload ─► new_frame(Frame)
//!  render(buf') ────┘  (newest wins)
//! ```

pub mod overlay;
pub mod pool;
pub mod renderer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::MediaError;
use crate::gpu::{GpuContext, Material};
use crate::mainloop::MainContext;
use crate::pipeline::{Bus, BusMessage, MessageSource};
use crate::signal::Signal;
use crate::video::{Fraction, Frame, PixelFormat, Resolution, VideoBuffer, VideoCaps};

pub use overlay::{Overlay, OverlayRect};
pub use pool::{BufferPool, PooledBuffer};
pub use renderer::Renderer;

const LOG_TARGET: &str = "immersive_media_bridge::sink";

/// Buffers kept in the producer-side pool
const POOL_CAPACITY: usize = 4;

/// Producer-facing result of `set_caps`, `render` and `acquire`
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("sink is flushing")]
    Flushing,
    #[error("caps not negotiated")]
    NotNegotiated,
    #[error("fatal sink error")]
    Error,
}

/// Sink lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// No caps yet
    Uninit,
    /// Caps negotiated, nothing uploaded since
    Ready,
    /// At least one frame uploaded with the current caps
    Running,
    /// Deactivated; needs fresh caps
    Stopped,
}

/// Signals emitted on the render thread
#[derive(Default)]
pub struct SinkSignals {
    pub new_frame: Signal<Frame>,
    /// Once per sink lifetime, before the first `new_frame`
    pub pipeline_ready: Signal<()>,
    pub pixel_aspect_ratio_changed: Signal<Fraction>,
    pub new_overlays: Signal<()>,
}

#[derive(Default)]
struct PendingSlot {
    buffer: Option<VideoBuffer>,
    caps: Option<VideoCaps>,
    has_new_caps: bool,
}

struct RenderState {
    state: SinkState,
    caps: Option<VideoCaps>,
    renderer: Option<&'static Renderer>,
    frame: Option<Frame>,
    has_pipeline: bool,
    ready_emitted: bool,
    par: Fraction,
    overlays: Vec<Overlay>,
}

struct SinkInner {
    ctx: MainContext,
    gpu: Arc<dyn GpuContext>,
    renderers: Vec<&'static Renderer>,
    slot: Mutex<PendingSlot>,
    dispatch_scheduled: AtomicBool,
    active: AtomicBool,
    flow_error: Mutex<Option<FlowError>>,
    dropped: AtomicU64,
    render: Mutex<RenderState>,
    pool: BufferPool,
    bus: Mutex<Option<Bus>>,
    signals: SinkSignals,
}

/// Cheap to clone; clones share one sink
#[derive(Clone)]
pub struct VideoSink {
    inner: Arc<SinkInner>,
}

impl VideoSink {
    /// Create a sink rendering with `gpu`, dispatching on `ctx`
    pub fn new(ctx: &MainContext, gpu: Arc<dyn GpuContext>) -> Self {
        let renderers = renderer::available_renderers(gpu.features());
        tracing::debug!(
            target: LOG_TARGET,
            backend = gpu.backend_name(),
            features = ?gpu.features(),
            renderers = renderers.len(),
            "video sink created"
        );
        Self {
            inner: Arc::new(SinkInner {
                ctx: ctx.clone(),
                gpu,
                renderers,
                slot: Mutex::new(PendingSlot::default()),
                dispatch_scheduled: AtomicBool::new(false),
                active: AtomicBool::new(true),
                flow_error: Mutex::new(None),
                dropped: AtomicU64::new(0),
                render: Mutex::new(RenderState {
                    state: SinkState::Uninit,
                    caps: None,
                    renderer: None,
                    frame: None,
                    has_pipeline: false,
                    ready_emitted: false,
                    par: Fraction::ONE,
                    overlays: Vec::new(),
                }),
                pool: BufferPool::new(POOL_CAPACITY),
                bus: Mutex::new(None),
                signals: SinkSignals::default(),
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PRODUCER SIDE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Negotiate caps. Fails with `NotNegotiated` and changes nothing when
    /// no renderer handles the format.
    pub fn set_caps(&self, caps: &VideoCaps) -> Result<(), FlowError> {
        if let Err(e) = caps.validate() {
            tracing::warn!(target: LOG_TARGET, "rejecting caps: {}", e);
            return Err(FlowError::NotNegotiated);
        }
        let Some(renderer) = renderer::find_renderer(&self.inner.renderers, caps.format) else {
            tracing::warn!(
                target: LOG_TARGET,
                format = %caps.format,
                backend = self.inner.gpu.backend_name(),
                "no renderer for format"
            );
            return Err(FlowError::NotNegotiated);
        };

        tracing::debug!(target: LOG_TARGET, caps = %caps, renderer = renderer.name, "caps negotiated");
        {
            let mut slot = self.inner.slot.lock();
            slot.caps = Some(*caps);
            slot.has_new_caps = true;
            // Buffers of the old size are useless now
            slot.buffer = None;
        }
        self.inner.pool.configure(caps.frame_size());
        self.schedule_dispatch();
        Ok(())
    }

    /// Hand a decoded buffer to the sink. Replaces any buffer the render
    /// thread has not picked up yet.
    pub fn render(&self, buffer: VideoBuffer) -> Result<(), FlowError> {
        if let Some(err) = *self.inner.flow_error.lock() {
            return Err(err);
        }
        if !self.inner.active.load(Ordering::SeqCst) {
            return Err(FlowError::Flushing);
        }
        {
            let mut slot = self.inner.slot.lock();
            if slot.caps.is_none() {
                return Err(FlowError::NotNegotiated);
            }
            if slot.buffer.replace(buffer).is_some() {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(target: LOG_TARGET, dropped, "replaced pending buffer");
            }
        }
        self.schedule_dispatch();
        Ok(())
    }

    /// Block until the pool has a buffer sized for the negotiated caps
    pub fn acquire_buffer(&self) -> Result<PooledBuffer, FlowError> {
        self.inner.pool.acquire()
    }

    fn schedule_dispatch(&self) {
        if self.inner.dispatch_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<SinkInner> = Arc::downgrade(&self.inner);
        self.inner.ctx.invoke(move || {
            if let Some(inner) = weak.upgrade() {
                VideoSink { inner }.dispatch();
            }
        });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RENDER THREAD
    // ═══════════════════════════════════════════════════════════════════════════

    fn dispatch(&self) {
        self.inner.dispatch_scheduled.store(false, Ordering::SeqCst);

        let (new_caps, buffer) = {
            let mut slot = self.inner.slot.lock();
            let caps = if slot.has_new_caps {
                slot.has_new_caps = false;
                slot.caps
            } else {
                None
            };
            (caps, slot.buffer.take())
        };

        let mut par_changed = None;
        let mut emit_ready = false;
        let mut emit_overlays = false;
        let mut new_frame = None;

        {
            let mut render = self.inner.render.lock();

            if let Some(caps) = new_caps {
                render.renderer = renderer::find_renderer(&self.inner.renderers, caps.format);
                render.caps = Some(caps);
                render.state = SinkState::Ready;
                if caps.pixel_aspect_ratio != render.par {
                    render.par = caps.pixel_aspect_ratio;
                    par_changed = Some(render.par);
                }
            }

            if let Some(buffer) = buffer {
                match (render.state, render.caps, render.renderer) {
                    (SinkState::Ready | SinkState::Running, Some(caps), Some(renderer)) => {
                        if self.inner.gpu.is_lost() {
                            drop(render);
                            self.fail_context_lost();
                            return;
                        }
                        match renderer.upload(self.inner.gpu.as_ref(), &caps, buffer.data()) {
                            Ok(material) => {
                                let resolution = Resolution::new(caps.width, caps.height)
                                    .with_par(caps.pixel_aspect_ratio.num, caps.pixel_aspect_ratio.den);
                                let frame = Frame::with_resolution(material, resolution);

                                if !buffer.overlays.is_empty() || !render.overlays.is_empty() {
                                    render.overlays =
                                        overlay::build_overlays(self.inner.gpu.as_ref(), &buffer.overlays);
                                    emit_overlays = true;
                                }

                                render.frame = Some(frame.clone());
                                render.state = SinkState::Running;
                                render.has_pipeline = true;
                                if !render.ready_emitted {
                                    render.ready_emitted = true;
                                    emit_ready = true;
                                }
                                new_frame = Some(frame);
                            }
                            Err(e) => {
                                tracing::warn!(
                                    target: LOG_TARGET,
                                    renderer = renderer.name,
                                    "dropping frame: {}",
                                    e
                                );
                            }
                        }
                    }
                    (state, _, _) => {
                        tracing::trace!(target: LOG_TARGET, ?state, "dropping buffer without negotiated caps");
                    }
                }
            }
        }

        // Emit with no lock held; handlers may call back into the sink
        let signals = &self.inner.signals;
        if let Some(par) = par_changed {
            signals.pixel_aspect_ratio_changed.emit(&par);
        }
        if emit_ready {
            tracing::debug!(target: LOG_TARGET, "pipeline ready");
            signals.pipeline_ready.emit(&());
        }
        if emit_overlays {
            signals.new_overlays.emit(&());
        }
        if let Some(frame) = new_frame {
            signals.new_frame.emit(&frame);
        }
    }

    fn fail_context_lost(&self) {
        *self.inner.flow_error.lock() = Some(FlowError::Error);
        tracing::error!(target: LOG_TARGET, "GPU context lost, video sink stopped");
        let bus = self.inner.bus.lock().clone();
        match bus {
            Some(bus) => bus.post(BusMessage::Error {
                source: MessageSource::Element("video-sink".to_string()),
                error: MediaError::Gpu("GPU context lost".into()),
                debug: Some(format!("backend {}", self.inner.gpu.backend_name())),
            }),
            None => tracing::warn!(target: LOG_TARGET, "no bus to report context loss on"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ACTIVATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Activate the input; waiting buffers can be acquired again
    pub fn start(&self) {
        self.inner.active.store(true, Ordering::SeqCst);
        self.inner.pool.set_flushing(false);
    }

    /// Deactivate the input, releasing textures and the pending slot
    pub fn stop(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.pool.set_flushing(true);
        *self.inner.slot.lock() = PendingSlot::default();

        let mut render = self.inner.render.lock();
        render.state = SinkState::Stopped;
        render.caps = None;
        render.renderer = None;
        render.frame = None;
        render.has_pipeline = false;
        render.overlays.clear();
        tracing::debug!(target: LOG_TARGET, "video sink stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ACCESSORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Most recent frame, `None` before the first upload
    pub fn frame(&self) -> Option<Frame> {
        self.inner.render.lock().frame.clone()
    }

    /// Material of the most recent frame
    pub fn pipeline(&self) -> Option<Material> {
        self.inner.render.lock().frame.as_ref().map(|f| f.material().clone())
    }

    /// True once caps are negotiated and a frame material exists
    pub fn is_ready(&self) -> bool {
        self.inner.render.lock().has_pipeline
    }

    pub fn state(&self) -> SinkState {
        self.inner.render.lock().state
    }

    pub fn caps(&self) -> Option<VideoCaps> {
        self.inner.render.lock().caps
    }

    pub fn renderer_name(&self) -> Option<&'static str> {
        self.inner.render.lock().renderer.map(|r| r.name)
    }

    /// Formats accepted with this sink's GPU context, in preference order
    pub fn supported_formats(&self) -> Vec<PixelFormat> {
        let mut formats = Vec::new();
        for r in &self.inner.renderers {
            if !formats.contains(&r.format) {
                formats.push(r.format);
            }
        }
        formats
    }

    pub fn pixel_aspect_ratio(&self) -> Fraction {
        self.inner.render.lock().par
    }

    pub fn overlays(&self) -> Vec<Overlay> {
        self.inner.render.lock().overlays.clone()
    }

    /// Buffers replaced before the render thread picked them up
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Bus used to report fatal errors
    pub fn set_bus(&self, bus: Option<Bus>) {
        *self.inner.bus.lock() = bus;
    }

    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn gpu_context(&self) -> Arc<dyn GpuContext> {
        Arc::clone(&self.inner.gpu)
    }

    pub fn main_context(&self) -> &MainContext {
        &self.inner.ctx
    }

    pub fn signals(&self) -> &SinkSignals {
        &self.inner.signals
    }

    pub fn ptr_eq(&self, other: &VideoSink) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuFeatures, SoftwareContext};
    use crate::video::OverlayRectangle;
    use std::sync::atomic::AtomicUsize;

    fn sink_with(features: GpuFeatures) -> (MainContext, Arc<SoftwareContext>, VideoSink) {
        let ctx = MainContext::with_manual_clock();
        let gpu = Arc::new(SoftwareContext::with_features(features));
        let sink = VideoSink::new(&ctx, gpu.clone());
        (ctx, gpu, sink)
    }

    fn rgba_caps(w: u32, h: u32) -> VideoCaps {
        VideoCaps::new(PixelFormat::Rgba32, w, h)
    }

    #[test]
    fn test_new_frame_on_render_thread_only() {
        let (ctx, _gpu, sink) = sink_with(GpuFeatures::all());
        let frames = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&frames);
        sink.signals().new_frame.connect(move |frame| {
            assert!(frame.resolution().is_valid());
            f.fetch_add(1, Ordering::SeqCst);
        });

        let caps = rgba_caps(4, 2);
        sink.set_caps(&caps).unwrap();
        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        assert_eq!(frames.load(Ordering::SeqCst), 0);
        assert!(!sink.is_ready());

        ctx.run_pending();
        assert_eq!(frames.load(Ordering::SeqCst), 1);
        assert!(sink.is_ready());
        assert_eq!(sink.state(), SinkState::Running);
        assert_eq!(sink.frame().unwrap().width(), 4);
    }

    #[test]
    fn test_newest_buffer_wins() {
        let (ctx, gpu, sink) = sink_with(GpuFeatures::all());
        let caps = rgba_caps(1, 1);
        sink.set_caps(&caps).unwrap();
        sink.render(VideoBuffer::from_vec(vec![1, 0, 0, 255])).unwrap();
        sink.render(VideoBuffer::from_vec(vec![2, 0, 0, 255])).unwrap();
        sink.render(VideoBuffer::from_vec(vec![3, 0, 0, 255])).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let g = Arc::clone(&gpu);
        sink.signals().new_frame.connect(move |frame| {
            let texels = g.read_texture(frame.material().layer(0).unwrap()).unwrap();
            s.lock().push(texels[0]);
        });
        ctx.run_pending();

        assert_eq!(*seen.lock(), vec![3]);
        assert_eq!(sink.dropped_frames(), 2);
    }

    #[test]
    fn test_unsupported_format_not_negotiated() {
        let (ctx, _gpu, sink) = sink_with(GpuFeatures::NONE);
        let caps = VideoCaps::new(PixelFormat::I420, 4, 4);
        assert_eq!(sink.set_caps(&caps), Err(FlowError::NotNegotiated));
        ctx.run_pending();
        assert_eq!(sink.state(), SinkState::Uninit);
        assert!(sink.caps().is_none());
        assert_eq!(sink.render(VideoBuffer::zeroed(&caps)), Err(FlowError::NotNegotiated));
    }

    #[test]
    fn test_oversized_caps_not_negotiated() {
        let (ctx, _gpu, sink) = sink_with(GpuFeatures::NONE);
        let caps = VideoCaps::new(PixelFormat::Rgba32, u32::MAX, u32::MAX);
        assert_eq!(sink.set_caps(&caps), Err(FlowError::NotNegotiated));
        ctx.run_pending();
        assert_eq!(sink.state(), SinkState::Uninit);
        assert!(sink.caps().is_none());
    }

    #[test]
    fn test_supported_formats_follow_features() {
        let (_ctx, _gpu, sink) = sink_with(GpuFeatures::NONE);
        assert_eq!(
            sink.supported_formats(),
            vec![PixelFormat::Rgb24, PixelFormat::Bgr24, PixelFormat::Rgba32, PixelFormat::Bgra32]
        );
        let (_ctx, _gpu, full) = sink_with(GpuFeatures::all());
        assert_eq!(full.supported_formats().len(), 7);
        assert_eq!(full.supported_formats()[0], PixelFormat::Ayuv);
    }

    #[test]
    fn test_ready_precedes_first_frame_and_fires_once() {
        let (ctx, _gpu, sink) = sink_with(GpuFeatures::all());
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        sink.signals().pipeline_ready.connect(move |_| o.lock().push("ready"));
        let o = Arc::clone(&order);
        sink.signals().new_frame.connect(move |_| o.lock().push("frame"));

        let caps = rgba_caps(2, 2);
        sink.set_caps(&caps).unwrap();
        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        ctx.run_pending();
        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        ctx.run_pending();

        sink.stop();
        sink.start();
        sink.set_caps(&caps).unwrap();
        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        ctx.run_pending();

        assert_eq!(*order.lock(), vec!["ready", "frame", "frame", "frame"]);
    }

    #[test]
    fn test_par_change_notified() {
        let (ctx, _gpu, sink) = sink_with(GpuFeatures::all());
        let pars = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&pars);
        sink.signals().pixel_aspect_ratio_changed.connect(move |par| p.lock().push(*par));

        let caps = rgba_caps(2, 2);
        sink.set_caps(&caps).unwrap();
        ctx.run_pending();
        assert!(pars.lock().is_empty());

        let anamorphic = caps.with_pixel_aspect_ratio(16, 15);
        sink.set_caps(&anamorphic).unwrap();
        sink.render(VideoBuffer::zeroed(&anamorphic)).unwrap();
        ctx.run_pending();
        assert_eq!(*pars.lock(), vec![Fraction::new(16, 15)]);
        let frame = sink.frame().unwrap();
        assert_eq!((frame.resolution().par_n, frame.resolution().par_d), (16, 15));

        let mut blank = Frame::new_blank(sink.gpu_context().as_ref()).unwrap();
        blank.update_par_from_sink(&sink);
        assert_eq!(blank.resolution().par_n, 16);
    }

    #[test]
    fn test_stop_releases_everything() {
        let (ctx, gpu, sink) = sink_with(GpuFeatures::all());
        let caps = rgba_caps(2, 2);
        sink.set_caps(&caps).unwrap();
        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        ctx.run_pending();
        assert_eq!(gpu.live_materials(), 1);

        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        sink.stop();
        ctx.run_pending();
        assert_eq!(gpu.live_materials(), 0);
        assert!(sink.frame().is_none());
        assert!(!sink.is_ready());
        assert_eq!(sink.state(), SinkState::Stopped);
        assert_eq!(sink.render(VideoBuffer::zeroed(&caps)), Err(FlowError::Flushing));
        assert_eq!(sink.acquire_buffer().err(), Some(FlowError::Flushing));
    }

    #[test]
    fn test_upload_failure_drops_frame_and_continues() {
        let (ctx, _gpu, sink) = sink_with(GpuFeatures::all());
        let frames = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&frames);
        sink.signals().new_frame.connect(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let caps = rgba_caps(4, 4);
        sink.set_caps(&caps).unwrap();
        sink.render(VideoBuffer::from_vec(vec![0; 3])).unwrap();
        ctx.run_pending();
        assert_eq!(frames.load(Ordering::SeqCst), 0);

        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        ctx.run_pending();
        assert_eq!(frames.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_context_loss_is_fatal_and_reported() {
        let (ctx, gpu, sink) = sink_with(GpuFeatures::all());
        let bus = Bus::new(&ctx);
        sink.set_bus(Some(bus.clone()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        bus.add_watch(move |msg| {
            if let BusMessage::Error { error, .. } = msg {
                e.lock().push(error.kind());
            }
        });

        let caps = rgba_caps(2, 2);
        sink.set_caps(&caps).unwrap();
        gpu.set_lost(true);
        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        ctx.run_pending();

        assert_eq!(*errors.lock(), vec![crate::error::ErrorKind::Decoding]);
        assert_eq!(sink.render(VideoBuffer::zeroed(&caps)), Err(FlowError::Error));
    }

    #[test]
    fn test_pooled_buffers_round_trip() {
        let (ctx, _gpu, sink) = sink_with(GpuFeatures::all());
        let caps = rgba_caps(2, 2);
        sink.set_caps(&caps).unwrap();
        let mut buffer = sink.acquire_buffer().unwrap();
        buffer.fill(0x80);
        sink.render(VideoBuffer::from_pooled(buffer)).unwrap();
        assert_eq!(sink.pool().outstanding(), 1);
        ctx.run_pending();
        assert_eq!(sink.pool().outstanding(), 0);
    }

    #[test]
    fn test_overlays_rebuilt_per_frame() {
        let (ctx, _gpu, sink) = sink_with(GpuFeatures::all());
        let notified = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&notified);
        sink.signals().new_overlays.connect(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        let caps = rgba_caps(8, 8);
        sink.set_caps(&caps).unwrap();
        let subtitle = OverlayRectangle::new(vec![255; 4 * 2 * 4], 4, 2, 2, 6);
        sink.render(VideoBuffer::zeroed(&caps).with_overlays(vec![subtitle])).unwrap();
        ctx.run_pending();
        assert_eq!(sink.overlays().len(), 1);

        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        ctx.run_pending();
        assert!(sink.overlays().is_empty());
        assert_eq!(notified.load(Ordering::SeqCst), 2);

        // No overlays before or after: no notification
        sink.render(VideoBuffer::zeroed(&caps)).unwrap();
        ctx.run_pending();
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }
}
