//! Players: uniform frame producers over a media pipeline
//!
//! Every player owns a `VideoSink` and relays its frames through
//! `PlayerSignals`. Consumers (content, UIs) only rely on the `Player`
//! trait; playback and camera specifics live on the concrete types.
//!
//! - `PlaybackPlayer`: URI playback with seeking, buffering and stream selection
//! - `CameraPlayer`: camera viewfinder, photo capture and video recording
//! - `PipelinePlayer`: wraps an externally built pipeline

mod camera;
mod camera_device;
mod camera_manager;
mod pipeline_player;
mod playback;
mod subtitles;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{ErrorKind, MediaError};
use crate::mainloop::MainContext;
use crate::pipeline::PipelineHandle;
use crate::signal::{HandlerId, Signal};
use crate::sink::VideoSink;
use crate::video::Frame;

pub use camera::{CameraPlayer, CameraSignals, ColorBalanceProperty};
pub use camera_device::CameraDevice;
pub use camera_manager::{CameraManager, CameraManagerSignals};
pub use pipeline_player::PipelinePlayer;
pub use playback::{PlaybackPlayer, PlaybackSignals, SeekMode, StreamInfo};

/// Observable player properties, carried by the `notify` signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerProperty {
    Playing,
    Idle,
    AudioVolume,
    Progress,
    Duration,
    BufferFill,
    CanSeek,
    InSeek,
    Uri,
    SubtitleUri,
    SubtitleFontName,
    UserAgent,
    AudioStreams,
    AudioStream,
    SubtitleTracks,
    SubtitleTrack,
    VideoSink,
    Device,
    Filter,
}

/// Signals shared by every player, emitted on the render thread
#[derive(Default)]
pub struct PlayerSignals {
    pub new_frame: Signal<Frame>,
    /// Before the first `new_frame`
    pub ready: Signal<()>,
    pub eos: Signal<()>,
    pub error: Signal<(ErrorKind, String)>,
    /// New frame width and height; precedes the frame that changed them
    pub size_change: Signal<(u32, u32)>,
    pub notify: Signal<PlayerProperty>,
}

/// Capabilities every frame producer offers
pub trait Player: Send + Sync {
    /// Latest frame; a blank frame before the first one arrives
    fn frame(&self) -> Frame;

    /// Underlying pipeline, for introspection only
    fn pipeline(&self) -> PipelineHandle;

    fn video_sink(&self) -> VideoSink;

    fn is_playing(&self) -> bool;
    fn set_playing(&self, playing: bool);

    /// Cubic volume in 0..=1
    fn audio_volume(&self) -> f64;
    fn set_audio_volume(&self, volume: f64);

    fn is_idle(&self) -> bool;

    fn signals(&self) -> &PlayerSignals;
}

// ═══════════════════════════════════════════════════════════════════════════════
// FRAME RELAY
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink binding shared by the player implementations.
///
/// Keeps the current frame, turns sink signals into player signals and
/// disconnects from the sink when dropped.
pub(crate) struct PlayerCore {
    ctx: MainContext,
    sink: VideoSink,
    frame: Mutex<Frame>,
    signals: PlayerSignals,
    /// `(new_frame, pipeline_ready)` handlers on the sink
    sink_handlers: Mutex<Option<(HandlerId, HandlerId)>>,
}

impl PlayerCore {
    pub(crate) fn new(ctx: &MainContext, sink: VideoSink) -> Result<Arc<Self>, MediaError> {
        let blank = Frame::new_blank(sink.gpu_context().as_ref())?;
        let core = Arc::new(Self {
            ctx: ctx.clone(),
            sink,
            frame: Mutex::new(blank),
            signals: PlayerSignals::default(),
            sink_handlers: Mutex::new(None),
        });
        core.connect_sink();
        Ok(core)
    }

    fn connect_sink(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let on_frame = self.sink.signals().new_frame.connect(move |frame| {
            if let Some(core) = weak.upgrade() {
                core.receive_frame(frame);
            }
        });
        let weak: Weak<Self> = Arc::downgrade(self);
        let on_ready = self.sink.signals().pipeline_ready.connect(move |_| {
            if let Some(core) = weak.upgrade() {
                core.signals.ready.emit(&());
            }
        });
        *self.sink_handlers.lock() = Some((on_frame, on_ready));
    }

    fn receive_frame(&self, frame: &Frame) {
        let previous = std::mem::replace(&mut *self.frame.lock(), frame.clone());
        if !previous.same_resolution(frame) {
            tracing::debug!(
                width = frame.width(),
                height = frame.height(),
                par_n = frame.resolution().par_n,
                par_d = frame.resolution().par_d,
                "frame size changed"
            );
            self.signals.size_change.emit(&(frame.width(), frame.height()));
        }
        self.signals.new_frame.emit(frame);
    }

    pub(crate) fn frame(&self) -> Frame {
        self.frame.lock().clone()
    }

    pub(crate) fn sink(&self) -> &VideoSink {
        &self.sink
    }

    pub(crate) fn main_context(&self) -> &MainContext {
        &self.ctx
    }

    pub(crate) fn signals(&self) -> &PlayerSignals {
        &self.signals
    }

    pub(crate) fn notify(&self, property: PlayerProperty) {
        self.signals.notify.emit(&property);
    }

    pub(crate) fn notify_all(&self, properties: &[PlayerProperty]) {
        for property in properties {
            self.signals.notify.emit(property);
        }
    }

    pub(crate) fn emit_error(&self, kind: ErrorKind, message: &str) {
        self.signals.error.emit(&(kind, message.to_string()));
    }
}

impl Drop for PlayerCore {
    fn drop(&mut self) {
        if let Some((on_frame, on_ready)) = self.sink_handlers.lock().take() {
            self.sink.signals().new_frame.disconnect(on_frame);
            self.sink.signals().pipeline_ready.disconnect(on_ready);
        }
    }
}
