//! Player over an externally built pipeline
//!
//! The application owns the pipeline and drives its state; this player
//! only relays the frames of the `VideoSink` inside it. Volume and
//! playing writes are ignored.

use std::sync::Arc;

use super::{Player, PlayerCore, PlayerSignals};
use crate::error::MediaError;
use crate::mainloop::MainContext;
use crate::pipeline::{PipelineHandle, State};
use crate::sink::VideoSink;
use crate::video::Frame;

pub struct PipelinePlayer {
    core: Arc<PlayerCore>,
    pipeline: PipelineHandle,
}

impl PipelinePlayer {
    /// Relay frames of `sink`, which must be part of `pipeline`
    pub fn new(ctx: &MainContext, pipeline: PipelineHandle, sink: VideoSink) -> Result<Self, MediaError> {
        let core = PlayerCore::new(ctx, sink.clone())?;
        // A sink that already rendered hands over its frame right away
        if let Some(frame) = sink.frame() {
            core.receive_frame(&frame);
        }
        tracing::debug!(pipeline = pipeline.name(), "wrapping external pipeline");
        Ok(Self { core, pipeline })
    }
}

impl Player for PipelinePlayer {
    fn frame(&self) -> Frame {
        self.core.frame()
    }

    fn pipeline(&self) -> PipelineHandle {
        Arc::clone(&self.pipeline)
    }

    fn video_sink(&self) -> VideoSink {
        self.core.sink().clone()
    }

    fn is_playing(&self) -> bool {
        let (current, pending) = self.pipeline.state();
        if pending != State::VoidPending {
            pending == State::Playing
        } else {
            current == State::Playing
        }
    }

    fn set_playing(&self, _playing: bool) {}

    fn audio_volume(&self) -> f64 {
        0.0
    }

    fn set_audio_volume(&self, _volume: f64) {}

    fn is_idle(&self) -> bool {
        false
    }

    fn signals(&self) -> &PlayerSignals {
        self.core.signals()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareContext;
    use crate::pipeline::{CameraBin, MediaInfo, MediaPipeline, Playbin, SimulatedCameraBin, SimulatedPlaybin};
    use crate::player::CameraDevice;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn sink(ctx: &MainContext) -> VideoSink {
        VideoSink::new(ctx, Arc::new(SoftwareContext::new()))
    }

    #[test]
    fn test_relays_frames_from_external_pipeline() {
        let ctx = MainContext::with_manual_clock();
        let sink = sink(&ctx);
        let camerabin = SimulatedCameraBin::new(&ctx);
        camerabin.set_viewfinder_sink(sink.clone());
        camerabin
            .set_video_source(&CameraDevice::new("v4l2src", "/dev/video0", "Webcam", Vec::new()))
            .unwrap();
        camerabin.set_capture_caps(320, 180);

        let player = PipelinePlayer::new(&ctx, Arc::new(camerabin.clone()), sink).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        player.signals().ready.connect(move |_| l.lock().push("ready"));
        let l = Arc::clone(&log);
        player.signals().new_frame.connect(move |_| l.lock().push("frame"));

        assert!(!player.is_playing());
        camerabin.set_state(State::Playing);
        ctx.run_pending();

        assert!(player.is_playing());
        assert_eq!(*log.lock(), vec!["ready", "frame"]);
        assert_eq!((player.frame().width(), player.frame().height()), (320, 180));
        assert_eq!(player.pipeline().name(), "camerabin");
    }

    #[test]
    fn test_pending_state_counts_as_playing() {
        let ctx = MainContext::with_manual_clock();
        let sink = sink(&ctx);
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.set_video_sink(sink.clone());
        playbin.add_media("file:///clip.webm", MediaInfo::new(Duration::from_secs(10)));
        playbin.set_uri(Some("file:///clip.webm"));

        let player = PipelinePlayer::new(&ctx, Arc::new(playbin.clone()), sink).unwrap();
        playbin.set_state(State::Playing);
        // Preroll has not run yet
        assert_eq!(playbin.state().1, State::Playing);
        assert!(player.is_playing());

        ctx.run_pending();
        assert_eq!(playbin.state(), (State::Playing, State::VoidPending));
        assert!(player.is_playing());
    }

    #[test]
    fn test_writes_are_ignored() {
        let ctx = MainContext::with_manual_clock();
        let sink = sink(&ctx);
        let player = PipelinePlayer::new(&ctx, Arc::new(SimulatedPlaybin::new(&ctx)), sink.clone()).unwrap();

        player.set_playing(true);
        player.set_audio_volume(1.0);
        assert!(!player.is_playing());
        assert_eq!(player.audio_volume(), 0.0);
        assert!(!player.is_idle());
        assert!(player.video_sink().ptr_eq(&sink));
    }

    #[test]
    fn test_adopts_frame_of_running_sink() {
        let ctx = MainContext::with_manual_clock();
        let sink = sink(&ctx);
        let camerabin = SimulatedCameraBin::new(&ctx);
        camerabin.set_viewfinder_sink(sink.clone());
        camerabin
            .set_video_source(&CameraDevice::new("v4l2src", "/dev/video0", "Webcam", Vec::new()))
            .unwrap();
        camerabin.set_state(State::Playing);
        ctx.run_pending();

        let player = PipelinePlayer::new(&ctx, Arc::new(camerabin), sink).unwrap();
        assert_eq!((player.frame().width(), player.frame().height()), (320, 240));
    }
}
