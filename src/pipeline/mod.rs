//! Interfaces to the decoding and capture pipelines
//!
//! Players drive a pipeline only through these traits: `MediaPipeline` for
//! state and bus, `Playbin` for URI playback and `CameraBin` for capture.
//! `simulated` provides scripted in-process pipelines; the `gst` feature
//! adds GStreamer-backed ones.

pub mod bus;
pub mod simulated;

#[cfg(feature = "gst")]
pub mod gst;

use std::any::Any;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::player::CameraDevice;
use crate::sink::VideoSink;

pub use bus::{Bus, BusMessage, ElementMessage, MessageSource, PreviewSample};
pub use simulated::{MediaInfo, SimulatedCameraBin, SimulatedPlaybin};

// ═══════════════════════════════════════════════════════════════════════════════
// STATES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// No pending state
    VoidPending,
    Null,
    Ready,
    Paused,
    Playing,
}

impl State {
    /// One step towards `target`, or `self` when already there
    pub fn step_towards(self, target: State) -> State {
        use State::*;
        match self.cmp(&target) {
            std::cmp::Ordering::Less => match self {
                VoidPending | Null => Ready,
                Ready => Paused,
                Paused | Playing => Playing,
            },
            std::cmp::Ordering::Greater => match self {
                Playing => Paused,
                Paused => Ready,
                Ready | Null | VoidPending => Null,
            },
            std::cmp::Ordering::Equal => self,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::VoidPending => "void-pending",
            State::Null => "null",
            State::Ready => "ready",
            State::Paused => "paused",
            State::Playing => "playing",
        };
        f.write_str(name)
    }
}

/// Result of a state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Success,
    /// Completes later; `AsyncDone` is posted when it does
    Async,
    /// Live source: PAUSED cannot preroll
    NoPreroll,
    Failure,
}

// ═══════════════════════════════════════════════════════════════════════════════
// FLAGS
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! bit_flags {
    ($name:ident { $($(#[$doc:meta])* $flag:ident = $value:expr,)* }) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$doc])* pub const $flag: Self = Self($value);)*

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut names: Vec<&str> = Vec::new();
                $(if $value != 0 && self.contains(Self::$flag) {
                    names.push(stringify!($flag));
                })*
                write!(f, "{}({})", stringify!($name), names.join(" | "))
            }
        }
    };
}

bit_flags!(PlayFlags {
    VIDEO = 1 << 0,
    AUDIO = 1 << 1,
    /// Render subtitles
    TEXT = 1 << 2,
    VIS = 1 << 3,
    SOFT_VOLUME = 1 << 4,
    NATIVE_AUDIO = 1 << 5,
    NATIVE_VIDEO = 1 << 6,
    /// Progressive download buffering
    DOWNLOAD = 1 << 7,
    BUFFERING = 1 << 8,
    DEINTERLACE = 1 << 9,
});

bit_flags!(SeekFlags {
    FLUSH = 1 << 0,
    ACCURATE = 1 << 1,
    /// Snap to the nearest keyframe
    KEY_UNIT = 1 << 2,
});

// ═══════════════════════════════════════════════════════════════════════════════
// QUERIES AND METADATA
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BufferingMode {
    #[default]
    Stream,
    Download,
    Timeshift,
    Live,
}

/// Result of a buffering query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingQuery {
    pub mode: BufferingMode,
    /// The queue still wants to buffer (below its high watermark)
    pub busy: bool,
    pub percent: i32,
    /// Estimated time to finish the download, -1 when unknown
    pub estimated_total_ms: i64,
}

/// Tags of one audio or text stream
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamTags {
    pub language_code: Option<String>,
    pub language_name: Option<String>,
    pub codec: Option<String>,
}

impl StreamTags {
    pub fn language(code: &str) -> Self {
        Self {
            language_code: Some(code.to_string()),
            ..Default::default()
        }
    }

    pub fn with_codec(mut self, codec: &str) -> Self {
        self.codec = Some(codec.to_string());
        self
    }

    pub fn with_language_name(mut self, name: &str) -> Self {
        self.language_name = Some(name.to_string());
        self
    }
}

/// Notifications raised by a playbin on arbitrary threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybinEvent {
    VolumeChanged,
    AudioStreamsChanged,
    TextStreamsChanged,
    AudioTagsChanged(i32),
    TextTagsChanged(i32),
    CurrentAudioChanged,
    CurrentTextChanged,
    /// A new source element was created
    SourceChanged,
}

/// Notifications raised by a camera bin on arbitrary threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraBinEvent {
    ReadyForCaptureChanged(bool),
}

pub type EventHandler<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Still or video capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Image = 1,
    Video = 2,
}

/// Container plus stream formats used when encoding captures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingProfile {
    pub container: String,
    #[serde(default)]
    pub video: Option<String>,
    #[serde(default)]
    pub audio: Option<String>,
}

impl EncodingProfile {
    /// Ogg container with Theora video and Vorbis audio
    pub fn ogg_theora_vorbis() -> Self {
        Self {
            container: "application/ogg".to_string(),
            video: Some("video/x-theora".to_string()),
            audio: Some("audio/x-vorbis".to_string()),
        }
    }

    /// Single-image profile
    pub fn image(format: &str) -> Self {
        Self {
            container: format.to_string(),
            video: None,
            audio: None,
        }
    }
}

/// Valid range of a numeric element property
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyRange {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl PropertyRange {
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// Element with numeric properties (gamma, colour balance)
pub trait TunableElement: Send + Sync {
    fn property_range(&self, name: &str) -> Option<PropertyRange>;
    fn property(&self, name: &str) -> Option<f64>;
    fn set_property(&self, name: &str, value: f64) -> bool;
}

/// Opaque video processing element inserted into a camera's filter chain
#[derive(Clone)]
pub struct FilterElement {
    name: String,
    element: Arc<dyn Any + Send + Sync>,
}

impl FilterElement {
    pub fn new(name: impl Into<String>, element: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            element,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.element.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &FilterElement) -> bool {
        Arc::ptr_eq(&self.element, &other.element)
    }
}

impl fmt::Debug for FilterElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterElement").field("name", &self.name).finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE TRAITS
// ═══════════════════════════════════════════════════════════════════════════════

pub trait MediaPipeline: Send + Sync {
    fn name(&self) -> &str;

    fn set_state(&self, state: State) -> StateChange;

    /// Current and pending state; pending is `VoidPending` when settled
    fn state(&self) -> (State, State);

    fn bus(&self) -> Bus;
}

/// Observation handle returned by players
pub type PipelineHandle = Arc<dyn MediaPipeline>;

/// URI playback pipeline
pub trait Playbin: MediaPipeline {
    fn uri(&self) -> Option<String>;
    fn set_uri(&self, uri: Option<&str>);
    fn suburi(&self) -> Option<String>;
    fn set_suburi(&self, uri: Option<&str>);
    fn set_subtitle_font(&self, font: &str);

    fn flags(&self) -> PlayFlags;
    fn set_flags(&self, flags: PlayFlags);

    /// Linear volume
    fn volume(&self) -> f64;
    fn set_volume(&self, volume: f64);

    fn set_video_sink(&self, sink: VideoSink);

    /// Flushing seek to `position`; false if the pipeline refused it
    fn seek(&self, position: Duration, flags: SeekFlags) -> bool;

    fn query_position(&self) -> Option<Duration>;
    fn query_duration(&self) -> Option<Duration>;
    fn query_seekable(&self) -> Option<bool>;
    fn query_buffering(&self) -> Option<BufferingQuery>;

    fn buffer_size(&self) -> i64;
    fn set_buffer_size(&self, bytes: i64);
    fn buffer_duration(&self) -> i64;
    fn set_buffer_duration(&self, nanos: i64);

    fn n_audio(&self) -> usize;
    fn audio_tags(&self, index: usize) -> Option<StreamTags>;
    fn current_audio(&self) -> i32;
    fn set_current_audio(&self, index: i32);

    fn n_text(&self) -> usize;
    fn text_tags(&self, index: usize) -> Option<StreamTags>;
    fn current_text(&self) -> i32;
    fn set_current_text(&self, index: i32);

    /// User agent of the current source element, if it has one
    fn source_user_agent(&self) -> Option<String>;
    /// False when there is no source or it has no user agent
    fn set_source_user_agent(&self, user_agent: &str) -> bool;

    fn set_event_handler(&self, handler: Option<EventHandler<PlaybinEvent>>);
}

/// Camera capture pipeline
pub trait CameraBin: MediaPipeline {
    fn set_viewfinder_sink(&self, sink: VideoSink);
    fn set_video_source(&self, device: &CameraDevice) -> Result<(), MediaError>;
    /// Apply a capture size to the video, image and viewfinder sockets
    fn set_capture_caps(&self, width: u32, height: u32);

    fn is_ready_for_capture(&self) -> bool;
    fn set_mode(&self, mode: CaptureMode);
    fn set_location(&self, location: Option<&str>);
    fn start_capture(&self);
    fn stop_capture(&self);

    fn set_post_previews(&self, post: bool);
    fn set_preview_caps(&self, width: u32, height: u32);
    fn set_video_profile(&self, profile: &EncodingProfile);
    fn set_image_profile(&self, profile: &EncodingProfile);

    fn set_valve_drop(&self, drop: bool);
    fn unlink_custom_filter(&self);
    fn unlink_default(&self);
    fn link_custom_filter(&self, filter: &FilterElement) -> bool;
    fn link_default(&self) -> bool;
    fn set_filter_state(&self, state: State);

    fn gamma_element(&self) -> Option<Arc<dyn TunableElement>>;
    fn color_balance_element(&self) -> Option<Arc<dyn TunableElement>>;

    fn set_event_handler(&self, handler: Option<EventHandler<CameraBinEvent>>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_and_steps() {
        assert!(State::Playing > State::Paused);
        assert!(State::Null > State::VoidPending);
        assert_eq!(State::Null.step_towards(State::Playing), State::Ready);
        assert_eq!(State::Playing.step_towards(State::Null), State::Paused);
        assert_eq!(State::Ready.step_towards(State::Ready), State::Ready);
    }

    #[test]
    fn test_play_flags() {
        let mut flags = PlayFlags::VIDEO | PlayFlags::AUDIO | PlayFlags::TEXT;
        flags.remove(PlayFlags::TEXT);
        assert!(!flags.contains(PlayFlags::TEXT));
        flags.insert(PlayFlags::DOWNLOAD);
        assert_eq!(flags.bits(), 0b1000_0011);
        assert_eq!(format!("{:?}", flags), "PlayFlags(VIDEO | AUDIO | DOWNLOAD)");
    }

    #[test]
    fn test_property_range_clamp() {
        let range = PropertyRange {
            min: 0.01,
            max: 10.0,
            default: 1.0,
        };
        assert_eq!(range.clamp(20.0), 10.0);
        assert_eq!(range.clamp(0.0), 0.01);
    }
}
