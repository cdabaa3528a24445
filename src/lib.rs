//! Immersive Media Bridge
//!
//! Moves decoded video from a media pipeline into a GPU scene graph.
//! A `VideoSink` uploads buffers into GPU materials and hands out `Frame`s
//! on the render thread; players (URI playback, camera capture, external
//! pipelines) drive the pipeline and relay frames; content objects turn
//! frames into paint nodes with stretch, aspect-ratio or crop placement.

pub mod config;
pub mod content;
pub mod error;
pub mod gpu;
pub mod mainloop;
pub mod pipeline;
pub mod player;
pub mod signal;
pub mod sink;
pub mod telemetry;
pub mod video;

pub use config::{CameraConfig, PlaybackConfig};
pub use content::{Actor, ActorBox, AspectRatioContent, Content, CropContent, PaintNode, VideoContent};
pub use error::{ErrorKind, MediaError};
pub use mainloop::MainContext;
pub use player::{CameraDevice, CameraManager, CameraPlayer, PipelinePlayer, PlaybackPlayer, Player, PlayerSignals};
pub use sink::VideoSink;
pub use video::{Frame, Resolution};
