//! URI playback player
//!
//! Drives a `Playbin` through a target state that the consumer controls
//! (`set_playing`) and a forced state used while buffering or switching
//! URIs. Bus messages and playbin notifications are handled on the render
//! thread; every public method is expected to be called there too.
//!
//! ```text
//!   set_playing ──► target_state ──┐
//!                                  ├─► playbin.set_state()
//!   buffering/uri ─► force_state ──┘   (force wins unless VoidPending)
//! ```

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::subtitles::{filename_to_uri, find_sibling_subtitle};
use super::{Player, PlayerCore, PlayerProperty, PlayerSignals};
use crate::config::PlaybackConfig;
use crate::error::MediaError;
use crate::mainloop::{ControlFlow, MainContext, SourceId};
use crate::pipeline::{
    BufferingMode, BufferingQuery, BusMessage, MediaPipeline, MessageSource, PipelineHandle, PlayFlags, Playbin,
    PlaybinEvent, SeekFlags, State, StateChange, StreamTags,
};
use crate::signal::{HandlerId, Signal};
use crate::sink::VideoSink;
use crate::video::Frame;

const LOG_TARGET: &str = "immersive_media_bridge::playback";

/// Progress notification period while a URI is set
const TICK_TIMEOUT: Duration = Duration::from_millis(500);
/// Download-buffering query period
const BUFFERING_TIMEOUT: Duration = Duration::from_millis(250);

const DEFAULT_VOLUME: f64 = 0.5;
const DEFAULT_SUBTITLE_FONT: &str = "Sans 16";

/// Seek precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SeekMode {
    /// Snap to the nearest keyframe
    #[default]
    #[serde(rename = "none", alias = "fast")]
    Fast,
    /// Land on the exact frame
    Accurate,
}

impl SeekMode {
    fn seek_flags(self) -> SeekFlags {
        match self {
            SeekMode::Fast => SeekFlags::KEY_UNIT,
            SeekMode::Accurate => SeekFlags::ACCURATE,
        }
    }
}

/// One audio stream or subtitle track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub index: usize,
    pub language: Option<String>,
    pub codec: Option<String>,
    /// Human-readable label
    pub description: String,
}

impl StreamInfo {
    fn from_tags(index: usize, tags: Option<StreamTags>) -> Self {
        let tags = tags.unwrap_or_default();
        let description = tags
            .language_name
            .clone()
            .or_else(|| tags.language_code.clone())
            .or_else(|| tags.codec.clone())
            .unwrap_or_else(|| format!("Track {}", index));
        Self {
            index,
            language: tags.language_code,
            codec: tags.codec,
            description,
        }
    }
}

/// Playback-only signals
#[derive(Default)]
pub struct PlaybackSignals {
    /// Download-buffering policy override; the first handler decides
    pub should_buffer: Signal<BufferingQuery, bool>,
}

struct PlaybackState {
    uri: Option<String>,
    subtitle_uri: Option<String>,
    user_agent: Option<String>,
    subtitle_font: String,

    target_state: State,
    /// `VoidPending` when not overriding the target
    force_state: State,

    is_idle: bool,
    is_live: bool,
    can_seek: bool,
    in_seek: bool,
    in_eos: bool,
    in_error: bool,
    is_changing_uri: bool,
    in_download_buffering: bool,

    target_progress: f64,
    /// -1 when no seek is parked
    stacked_progress: f64,
    /// Seconds
    duration: f64,
    buffer_fill: f64,
    volume: f64,
    seek_mode: SeekMode,

    audio_streams: Vec<StreamInfo>,
    subtitle_tracks: Vec<StreamInfo>,

    tick_id: Option<SourceId>,
    buffering_timeout_id: Option<SourceId>,
}

/// Deferred work collected under the state lock and run after it is released
enum Emit {
    Notify(PlayerProperty),
    CheckBuffering,
}

struct PlaybackInner {
    core: Arc<PlayerCore>,
    playbin: Arc<dyn Playbin>,
    handle: PipelineHandle,
    state: Mutex<PlaybackState>,
    signals: PlaybackSignals,
    bus_watch: Mutex<Option<HandlerId>>,
}

/// Plays media from a URI. Cheap to clone; clones share one player.
#[derive(Clone)]
pub struct PlaybackPlayer {
    inner: Arc<PlaybackInner>,
}

impl PlaybackPlayer {
    /// Build a player on `playbin`, rendering into `sink`
    pub fn with_playbin<P>(ctx: &MainContext, sink: VideoSink, playbin: Arc<P>) -> Result<Self, MediaError>
    where
        P: Playbin + 'static,
    {
        let core = PlayerCore::new(ctx, sink.clone())?;
        let handle: PipelineHandle = playbin.clone();
        let playbin: Arc<dyn Playbin> = playbin;

        playbin.set_video_sink(sink);
        playbin.set_subtitle_font(DEFAULT_SUBTITLE_FONT);
        playbin.set_volume(DEFAULT_VOLUME.powi(3));
        if playbin.set_state(State::Ready) == StateChange::Failure {
            return Err(MediaError::Decoding(format!("{} failed to reach READY", playbin.name())));
        }

        let inner = Arc::new(PlaybackInner {
            core,
            playbin,
            handle,
            state: Mutex::new(PlaybackState {
                uri: None,
                subtitle_uri: None,
                user_agent: None,
                subtitle_font: DEFAULT_SUBTITLE_FONT.to_string(),
                target_state: State::Paused,
                force_state: State::VoidPending,
                is_idle: true,
                is_live: false,
                can_seek: false,
                in_seek: false,
                in_eos: false,
                in_error: false,
                is_changing_uri: false,
                in_download_buffering: false,
                target_progress: 0.0,
                stacked_progress: -1.0,
                duration: 0.0,
                buffer_fill: 0.0,
                volume: DEFAULT_VOLUME,
                seek_mode: SeekMode::Fast,
                audio_streams: Vec::new(),
                subtitle_tracks: Vec::new(),
                tick_id: None,
                buffering_timeout_id: None,
            }),
            signals: PlaybackSignals::default(),
            bus_watch: Mutex::new(None),
        });
        PlaybackInner::connect(&inner);

        tracing::debug!(target: LOG_TARGET, pipeline = inner.playbin.name(), "playback player created");
        Ok(Self { inner })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // URI
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn uri(&self) -> Option<String> {
        self.inner.state.lock().uri.clone()
    }

    /// Switch media. `None` stops playback and marks the player idle.
    pub fn set_uri(&self, uri: Option<&str>) {
        self.inner.set_uri(uri);
    }

    /// Play a local file; relative paths resolve against the current directory
    pub fn set_filename(&self, path: impl AsRef<Path>) {
        match filename_to_uri(path.as_ref()) {
            Ok(uri) => self.inner.set_uri(Some(&uri)),
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, "set_filename: {}", e);
                self.inner.core.emit_error(e.kind(), e.message());
            }
        }
    }

    pub fn subtitle_uri(&self) -> Option<String> {
        self.inner.state.lock().subtitle_uri.clone()
    }

    pub fn set_subtitle_uri(&self, uri: Option<&str>) {
        {
            let mut st = self.inner.state.lock();
            self.inner.apply_subtitle_uri(&mut st, uri);
        }
        self.inner.core.notify(PlayerProperty::SubtitleUri);
    }

    pub fn subtitle_font_name(&self) -> String {
        self.inner.state.lock().subtitle_font.clone()
    }

    /// Pango-style font description, e.g. "Sans 16"
    pub fn set_subtitle_font_name(&self, font: &str) {
        self.inner.state.lock().subtitle_font = font.to_string();
        self.inner.playbin.set_subtitle_font(font);
        self.inner.core.notify(PlayerProperty::SubtitleFontName);
    }

    /// Custom user agent if set, else the source element's own
    pub fn user_agent(&self) -> Option<String> {
        let custom = self.inner.state.lock().user_agent.clone();
        custom.or_else(|| self.inner.playbin.source_user_agent())
    }

    /// Applied to the current source and re-applied to every new one
    pub fn set_user_agent(&self, user_agent: Option<&str>) {
        self.inner.state.lock().user_agent = user_agent.map(str::to_string);
        if let Some(ua) = user_agent {
            self.inner.playbin.set_source_user_agent(ua);
        }
        self.inner.core.notify(PlayerProperty::UserAgent);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // POSITION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Fraction of the media played, 0..=1
    pub fn progress(&self) -> f64 {
        {
            let st = self.inner.state.lock();
            if st.in_error {
                return 0.0;
            }
            if st.in_eos {
                return 1.0;
            }
            if st.in_seek || st.is_changing_uri {
                return st.target_progress;
            }
        }
        match (self.inner.playbin.query_position(), self.inner.playbin.query_duration()) {
            (Some(position), Some(duration)) if !duration.is_zero() => {
                (position.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    /// Seek to `progress * duration`; parked while a seek or URI switch is in flight
    pub fn set_progress(&self, progress: f64) {
        let mut out = Vec::new();
        {
            let mut st = self.inner.state.lock();
            self.inner.set_progress_locked(&mut st, progress.clamp(0.0, 1.0), &mut out);
        }
        self.inner.dispatch(out);
    }

    /// Position in seconds, 0 when unknown
    pub fn position(&self) -> f64 {
        self.inner.playbin.query_position().map(|p| p.as_secs_f64()).unwrap_or(0.0)
    }

    /// Duration in seconds, 0 when unknown
    pub fn duration(&self) -> f64 {
        self.inner.state.lock().duration
    }

    pub fn can_seek(&self) -> bool {
        self.inner.state.lock().can_seek
    }

    pub fn in_seek(&self) -> bool {
        self.inner.state.lock().in_seek
    }

    pub fn is_live_media(&self) -> bool {
        self.inner.state.lock().is_live
    }

    pub fn seek_mode(&self) -> SeekMode {
        self.inner.state.lock().seek_mode
    }

    pub fn set_seek_mode(&self, mode: SeekMode) {
        self.inner.state.lock().seek_mode = mode;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BUFFERING
    // ═══════════════════════════════════════════════════════════════════════════

    /// 0..=1, 1 when the buffers are full
    pub fn buffer_fill(&self) -> f64 {
        self.inner.state.lock().buffer_fill
    }

    pub fn buffering_mode(&self) -> BufferingMode {
        self.inner.buffering_mode()
    }

    pub fn set_buffering_mode(&self, mode: BufferingMode) {
        let mut flags = self.inner.playbin.flags();
        match mode {
            BufferingMode::Stream => flags.remove(PlayFlags::DOWNLOAD),
            BufferingMode::Download => flags.insert(PlayFlags::DOWNLOAD),
            other => {
                tracing::warn!(target: LOG_TARGET, ?other, "unsupported buffering mode");
                return;
            }
        }
        self.inner.playbin.set_flags(flags);
        if mode == BufferingMode::Stream {
            let mut st = self.inner.state.lock();
            self.inner.clear_download_buffering(&mut st);
        }
    }

    /// Queue size in bytes, -1 for the pipeline default
    pub fn buffer_size(&self) -> i64 {
        self.inner.playbin.buffer_size()
    }

    pub fn set_buffer_size(&self, bytes: i64) {
        self.inner.playbin.set_buffer_size(bytes);
    }

    /// Queue duration in nanoseconds, -1 for the pipeline default
    pub fn buffer_duration(&self) -> i64 {
        self.inner.playbin.buffer_duration()
    }

    pub fn set_buffer_duration(&self, nanos: i64) {
        self.inner.playbin.set_buffer_duration(nanos);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STREAMS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn audio_streams(&self) -> Vec<StreamInfo> {
        self.inner.state.lock().audio_streams.clone()
    }

    /// Index of the playing audio stream, -1 if none
    pub fn audio_stream(&self) -> i32 {
        self.inner.playbin.current_audio()
    }

    pub fn set_audio_stream(&self, index: i32) -> Result<(), MediaError> {
        let count = self.inner.state.lock().audio_streams.len();
        if index < 0 || index as usize >= count {
            return Err(MediaError::InvalidArgument(format!(
                "audio stream {} out of range (0..{})",
                index, count
            )));
        }
        tracing::debug!(target: LOG_TARGET, index, "selecting audio stream");
        self.inner.playbin.set_current_audio(index);
        Ok(())
    }

    pub fn subtitle_tracks(&self) -> Vec<StreamInfo> {
        self.inner.state.lock().subtitle_tracks.clone()
    }

    /// Index of the shown subtitle track, -1 when subtitles are off
    pub fn subtitle_track(&self) -> i32 {
        if !self.inner.playbin.flags().contains(PlayFlags::TEXT) {
            return -1;
        }
        self.inner.playbin.current_text()
    }

    /// Select a subtitle track; -1 turns subtitles off
    pub fn set_subtitle_track(&self, index: i32) -> Result<(), MediaError> {
        let count = self.inner.state.lock().subtitle_tracks.len();
        if index < -1 || index >= count as i32 {
            return Err(MediaError::InvalidArgument(format!(
                "subtitle track {} out of range (-1..{})",
                index, count
            )));
        }
        tracing::debug!(target: LOG_TARGET, index, "selecting subtitle track");
        let mut flags = self.inner.playbin.flags();
        flags.remove(PlayFlags::TEXT);
        self.inner.playbin.set_flags(flags);
        if index >= 0 {
            self.inner.playbin.set_current_text(index);
            flags.insert(PlayFlags::TEXT);
            self.inner.playbin.set_flags(flags);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // MISC
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn playback_signals(&self) -> &PlaybackSignals {
        &self.inner.signals
    }

    /// Push a parsed configuration into the player
    pub fn apply_config(&self, config: &PlaybackConfig) {
        if let Some(font) = &config.subtitle_font_name {
            self.set_subtitle_font_name(font);
        }
        if config.user_agent.is_some() {
            self.set_user_agent(config.user_agent.as_deref());
        }
        self.set_seek_mode(config.seek_flags);
        self.set_buffering_mode(config.buffering_mode);
        if let Some(bytes) = config.buffer_size {
            self.set_buffer_size(bytes);
        }
        if let Some(nanos) = config.buffer_duration {
            self.set_buffer_duration(nanos);
        }
        if let Some(volume) = config.audio_volume {
            self.set_audio_volume(volume);
        }
        if config.uri.is_some() {
            self.set_uri(config.uri.as_deref());
        }
        if config.subtitle_uri.is_some() {
            self.set_subtitle_uri(config.subtitle_uri.as_deref());
        }
        if let Some(index) = config.audio_stream {
            if let Err(e) = self.set_audio_stream(index) {
                tracing::warn!(target: LOG_TARGET, "config: {}", e);
            }
        }
        if let Some(index) = config.subtitle_track {
            if let Err(e) = self.set_subtitle_track(index) {
                tracing::warn!(target: LOG_TARGET, "config: {}", e);
            }
        }
    }
}

impl Player for PlaybackPlayer {
    fn frame(&self) -> Frame {
        self.inner.core.frame()
    }

    fn pipeline(&self) -> PipelineHandle {
        Arc::clone(&self.inner.handle)
    }

    fn video_sink(&self) -> VideoSink {
        self.inner.core.sink().clone()
    }

    fn is_playing(&self) -> bool {
        let st = self.inner.state.lock();
        st.uri.is_some() && st.target_state == State::Playing
    }

    fn set_playing(&self, playing: bool) {
        {
            let mut st = self.inner.state.lock();
            st.in_error = false;
            st.in_eos = false;
            if st.uri.is_none() && playing {
                tracing::warn!(target: LOG_TARGET, "unable to start playing: no URI is set");
                return;
            }
            let target = if playing { State::Playing } else { State::Paused };
            self.inner.set_pipeline_target_state(&mut st, target);
        }
        self.inner
            .core
            .notify_all(&[PlayerProperty::Playing, PlayerProperty::Progress]);
    }

    fn audio_volume(&self) -> f64 {
        self.inner.state.lock().volume
    }

    fn set_audio_volume(&self, volume: f64) {
        let volume = volume.clamp(0.0, 1.0);
        self.inner.state.lock().volume = volume;
        self.inner.playbin.set_volume(volume.powi(3));
        self.inner.core.notify(PlayerProperty::AudioVolume);
    }

    fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle
    }

    fn signals(&self) -> &PlayerSignals {
        self.inner.core.signals()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATE MACHINE
// ═══════════════════════════════════════════════════════════════════════════════

impl PlaybackInner {
    fn connect(this: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let id = this.playbin.bus().add_watch(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_bus_message(message);
            }
        });
        *this.bus_watch.lock() = Some(id);

        // Playbin notifications arrive on streaming threads; re-dispatch them
        let weak: Weak<Self> = Arc::downgrade(this);
        let ctx = this.core.main_context().clone();
        this.playbin.set_event_handler(Some(Arc::new(move |event: PlaybinEvent| {
            let weak = weak.clone();
            ctx.invoke(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_playbin_event(event);
                }
            });
        })));
    }

    fn ctx(&self) -> &MainContext {
        self.core.main_context()
    }

    fn dispatch(self: &Arc<Self>, out: Vec<Emit>) {
        for emit in out {
            match emit {
                Emit::Notify(property) => self.core.notify(property),
                Emit::CheckBuffering => {
                    let installed = self.state.lock().buffering_timeout_id.is_some();
                    if installed {
                        self.buffering_timeout();
                    }
                }
            }
        }
    }

    fn set_idle(st: &mut PlaybackState, idle: bool, out: &mut Vec<Emit>) {
        if st.is_idle != idle {
            st.is_idle = idle;
            out.push(Emit::Notify(PlayerProperty::Idle));
        }
    }

    fn set_pipeline_target_state(&self, st: &mut PlaybackState, state: State) {
        st.target_state = state;
        if st.uri.is_some() && st.force_state == State::VoidPending {
            tracing::debug!(target: LOG_TARGET, %state, "applying target state");
            self.playbin.set_state(state);
        }
    }

    /// Override the target; `VoidPending` returns to it
    fn force_pipeline_state(&self, st: &mut PlaybackState, state: State) {
        st.force_state = state;
        let applied = if state == State::VoidPending {
            st.target_state
        } else {
            state
        };
        tracing::debug!(target: LOG_TARGET, forced = %state, %applied, "forcing pipeline state");
        self.playbin.set_state(applied);
    }

    /// Probe PAUSED: live sources cannot preroll. Restores the previous state.
    fn is_live_pipeline(&self) -> bool {
        let (state, pending) = self.playbin.state();
        let is_live = self.playbin.set_state(State::Paused) == StateChange::NoPreroll;
        let restore = if pending == State::VoidPending { state } else { pending };
        self.playbin.set_state(restore);
        is_live
    }

    fn buffering_mode(&self) -> BufferingMode {
        if self.playbin.flags().contains(PlayFlags::DOWNLOAD) {
            BufferingMode::Download
        } else {
            BufferingMode::Stream
        }
    }

    fn apply_subtitle_uri(&self, st: &mut PlaybackState, uri: Option<&str>) {
        tracing::debug!(target: LOG_TARGET, ?uri, "setting subtitle uri");
        let flags = self.playbin.flags();
        self.playbin.set_suburi(uri);
        self.playbin.set_flags(flags);
        st.subtitle_uri = uri.map(str::to_string);
    }

    fn install_tick(self: &Arc<Self>, st: &mut PlaybackState) {
        if st.tick_id.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        st.tick_id = Some(self.ctx().add_timeout(TICK_TIMEOUT, move || match weak.upgrade() {
            Some(inner) => {
                inner.core.notify(PlayerProperty::Progress);
                ControlFlow::Continue
            }
            None => ControlFlow::Break,
        }));
    }

    fn remove_tick(&self, st: &mut PlaybackState) {
        if let Some(id) = st.tick_id.take() {
            self.ctx().remove(id);
        }
    }

    fn set_uri(self: &Arc<Self>, uri: Option<&str>) {
        tracing::info!(target: LOG_TARGET, ?uri, "setting uri");
        let mut out = Vec::new();
        {
            let mut st = self.state.lock();
            st.in_eos = false;
            st.in_error = false;

            match uri {
                Some(_) => {
                    self.install_tick(&mut st);
                    self.apply_subtitle_uri(&mut st, None);
                    self.clear_download_buffering(&mut st);
                }
                None => {
                    self.remove_tick(&mut st);
                    self.clear_download_buffering(&mut st);
                }
            }

            st.uri = uri.map(str::to_string);
            st.can_seek = false;
            st.duration = 0.0;
            st.stacked_progress = -1.0;
            st.target_progress = 0.0;

            match uri {
                Some(uri) => {
                    // NULL lets the URI change; unforcing returns to the target
                    self.force_pipeline_state(&mut st, State::Null);
                    self.playbin.set_uri(Some(uri));
                    st.is_live = self.is_live_pipeline();

                    self.apply_subtitle_uri(&mut st, None);
                    if let Some(subtitle) = find_sibling_subtitle(uri) {
                        tracing::info!(target: LOG_TARGET, %subtitle, "found subtitle file");
                        self.apply_subtitle_uri(&mut st, Some(&subtitle));
                        out.push(Emit::Notify(PlayerProperty::SubtitleUri));
                    }

                    self.force_pipeline_state(&mut st, State::VoidPending);
                    st.is_changing_uri = true;
                }
                None => {
                    st.is_live = false;
                    self.apply_subtitle_uri(&mut st, None);
                    self.playbin.set_state(State::Null);
                    self.playbin.set_uri(None);
                    Self::set_idle(&mut st, true, &mut out);
                }
            }

            st.audio_streams.clear();
            st.subtitle_tracks.clear();
        }

        out.extend(
            [
                PlayerProperty::Uri,
                PlayerProperty::CanSeek,
                PlayerProperty::Duration,
                PlayerProperty::Progress,
                PlayerProperty::AudioStreams,
                PlayerProperty::SubtitleTracks,
            ]
            .into_iter()
            .map(Emit::Notify),
        );
        self.dispatch(out);
    }

    fn set_progress_locked(&self, st: &mut PlaybackState, progress: f64, out: &mut Vec<Emit>) {
        st.in_eos = false;
        st.target_progress = progress;

        if st.is_changing_uri || st.in_seek {
            tracing::debug!(target: LOG_TARGET, progress, "seek in flight, stacking progress");
            st.stacked_progress = progress;
            return;
        }

        let position = match self.playbin.query_duration() {
            Some(duration) => duration.mul_f64(progress),
            None if progress == 0.0 => {
                tracing::debug!(target: LOG_TARGET, "duration unknown, already at the start");
                st.stacked_progress = -1.0;
                return;
            }
            None => {
                tracing::debug!(target: LOG_TARGET, progress, "cannot seek without a duration");
                return;
            }
        };

        let flags = SeekFlags::FLUSH | st.seek_mode.seek_flags();
        if !self.playbin.seek(position, flags) {
            tracing::warn!(target: LOG_TARGET, progress, "seek refused by the pipeline");
            st.stacked_progress = -1.0;
            return;
        }

        st.in_seek = true;
        out.push(Emit::Notify(PlayerProperty::InSeek));
        tracing::debug!(target: LOG_TARGET, progress, position = position.as_secs_f64(), "seeking");

        // Download buffering must babysit the queue again after a seek
        if !st.is_live && self.buffering_mode() == BufferingMode::Download {
            self.force_pipeline_state(st, State::Paused);
        }
        st.stacked_progress = -1.0;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DOWNLOAD BUFFERING
    // ═══════════════════════════════════════════════════════════════════════════

    fn configure_buffering_timeout(self: &Arc<Self>, st: &mut PlaybackState, interval: Option<Duration>, out: &mut Vec<Emit>) {
        if let Some(id) = st.buffering_timeout_id.take() {
            self.ctx().remove(id);
        }
        if let Some(interval) = interval {
            let weak: Weak<Self> = Arc::downgrade(self);
            st.buffering_timeout_id = Some(self.ctx().add_timeout(interval, move || match weak.upgrade() {
                Some(inner) => inner.buffering_timeout(),
                None => ControlFlow::Break,
            }));
            out.push(Emit::CheckBuffering);
        }
    }

    fn clear_download_buffering(&self, st: &mut PlaybackState) {
        if let Some(id) = st.buffering_timeout_id.take() {
            self.ctx().remove(id);
        }
        st.in_download_buffering = false;
    }

    /// Default policy: keep buffering while the download is not known to
    /// finish before playback catches up, or while the queue is busy
    fn default_should_buffer(&self, query: &BufferingQuery) -> bool {
        let position = self.playbin.query_position().map(|p| p.as_secs_f64()).unwrap_or(0.0);
        let duration = self.state.lock().duration;
        let play_left_ms = (duration - position).max(0.0) * 1000.0;

        query.estimated_total_ms == -1 || query.estimated_total_ms as f64 * 1.1 >= play_left_ms || query.busy
    }

    fn buffering_timeout(self: &Arc<Self>) -> ControlFlow {
        if self.state.lock().in_seek {
            return ControlFlow::Continue;
        }

        let Some(query) = self.playbin.query_buffering() else {
            tracing::trace!(target: LOG_TARGET, "buffering query failed");
            return ControlFlow::Continue;
        };

        let mut out = Vec::new();
        let flow = if query.mode != BufferingMode::Download {
            let mut st = self.state.lock();
            self.clear_download_buffering(&mut st);
            // Stream buffering keeps its own force until it reports 100%
            if !query.busy {
                tracing::debug!(target: LOG_TARGET, "not download buffering, restoring the pipeline");
                self.force_pipeline_state(&mut st, State::VoidPending);
            }
            ControlFlow::Break
        } else {
            let should_buffer = self
                .signals
                .should_buffer
                .emit_first(&query)
                .unwrap_or_else(|| self.default_should_buffer(&query));

            let mut st = self.state.lock();
            if should_buffer {
                if st.buffer_fill != 0.0 {
                    st.buffer_fill = 0.0;
                    out.push(Emit::Notify(PlayerProperty::BufferFill));
                }
                if st.force_state == State::VoidPending {
                    tracing::debug!(target: LOG_TARGET, "buffering, pausing the pipeline");
                    self.force_pipeline_state(&mut st, State::Paused);
                }
                ControlFlow::Continue
            } else {
                tracing::debug!(target: LOG_TARGET, "buffered enough, restoring the pipeline");
                self.clear_download_buffering(&mut st);
                self.force_pipeline_state(&mut st, State::VoidPending);
                if st.buffer_fill != 1.0 {
                    st.buffer_fill = 1.0;
                    out.push(Emit::Notify(PlayerProperty::BufferFill));
                }
                ControlFlow::Break
            }
        };
        self.dispatch(out);
        flow
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BUS
    // ═══════════════════════════════════════════════════════════════════════════

    fn on_bus_message(self: &Arc<Self>, message: &BusMessage) {
        match message {
            BusMessage::Error { error, debug, source } => self.on_error(error, debug.as_deref(), source),
            BusMessage::Eos => self.on_eos(),
            BusMessage::Buffering { percent, mode } => self.on_buffering(*percent, *mode),
            BusMessage::DurationChanged => self.on_duration_changed(),
            BusMessage::StateChanged {
                source: MessageSource::Pipeline,
                old,
                new,
                ..
            } => self.on_state_changed(*old, *new),
            BusMessage::AsyncDone => self.on_async_done(),
            BusMessage::StateChanged { .. } | BusMessage::Element { .. } => {}
        }
    }

    fn on_error(self: &Arc<Self>, error: &MediaError, debug_info: Option<&str>, source: &MessageSource) {
        tracing::warn!(target: LOG_TARGET, ?source, details = ?debug_info, "pipeline error: {}", error);
        self.playbin.set_state(State::Null);
        self.state.lock().in_error = true;
        self.core.emit_error(error.kind(), error.message());

        let mut out = Vec::new();
        Self::set_idle(&mut self.state.lock(), true, &mut out);
        self.dispatch(out);
    }

    fn on_eos(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if st.in_eos {
                tracing::debug!(target: LOG_TARGET, "ignoring repeated end of stream");
                return;
            }
            st.in_eos = true;
        }
        tracing::info!(target: LOG_TARGET, "end of stream");
        self.playbin.set_state(State::Ready);

        self.core.signals().eos.emit(&());
        self.core.notify(PlayerProperty::Progress);

        // A handler may have restarted playback (looping)
        let (current, pending) = self.playbin.state();
        let state = if pending != State::VoidPending { pending } else { current };
        if state != State::Playing && state != State::Paused {
            let mut out = Vec::new();
            Self::set_idle(&mut self.state.lock(), true, &mut out);
            self.dispatch(out);
        }
    }

    fn on_buffering(self: &Arc<Self>, percent: i32, mode: BufferingMode) {
        let mut out = Vec::new();
        {
            let mut st = self.state.lock();
            if mode != BufferingMode::Download {
                st.in_download_buffering = false;
            }

            match mode {
                BufferingMode::Stream | BufferingMode::Live => {
                    st.buffer_fill = (percent as f64 / 100.0).clamp(0.0, 1.0);
                    tracing::trace!(target: LOG_TARGET, fill = st.buffer_fill, "buffer fill");

                    if !st.is_live {
                        if st.buffer_fill < 1.0 {
                            if st.force_state != State::Paused {
                                tracing::debug!(target: LOG_TARGET, "buffering, pausing the pipeline");
                                self.force_pipeline_state(&mut st, State::Paused);
                            }
                        } else if st.force_state != State::VoidPending {
                            tracing::debug!(target: LOG_TARGET, "buffered, restoring the pipeline");
                            self.force_pipeline_state(&mut st, State::VoidPending);
                        }
                    }
                    out.push(Emit::Notify(PlayerProperty::BufferFill));
                }
                BufferingMode::Download => {
                    // The periodic query takes over from here
                    if !st.in_download_buffering {
                        st.buffer_fill = 0.0;
                        out.push(Emit::Notify(PlayerProperty::BufferFill));
                        self.configure_buffering_timeout(&mut st, Some(BUFFERING_TIMEOUT), &mut out);
                        st.in_download_buffering = true;
                    }
                }
                BufferingMode::Timeshift => {}
            }
        }
        self.dispatch(out);
    }

    fn on_duration_changed(&self) {
        let Some(duration) = self.playbin.query_duration() else {
            return;
        };
        let new_duration = duration.as_secs_f64();
        let changed = {
            let mut st = self.state.lock();
            let diff = (new_duration - st.duration).abs();
            if diff > 1e-3 {
                st.duration = new_duration;
            }
            diff > 1.0
        };
        if changed {
            self.core.notify(PlayerProperty::Duration);
        }
    }

    fn on_state_changed(self: &Arc<Self>, old: State, new: State) {
        if old == new {
            return;
        }
        tracing::debug!(target: LOG_TARGET, %old, %new, "pipeline state changed");

        let mut out = Vec::new();
        if old == State::Ready && new == State::Paused {
            let can_seek = match self.playbin.query_seekable() {
                Some(seekable) => seekable,
                None => {
                    let uri = self.state.lock().uri.clone();
                    !uri.is_some_and(|u| u.starts_with("http://"))
                }
            };
            let duration = self.playbin.query_duration().map(|d| d.as_secs_f64());
            let audio = self.read_streams(true);
            let text = self.read_streams(false);

            let mut st = self.state.lock();
            st.can_seek = can_seek;
            out.push(Emit::Notify(PlayerProperty::CanSeek));
            if let Some(duration) = duration {
                st.duration = duration;
                out.push(Emit::Notify(PlayerProperty::Duration));
            }
            st.is_changing_uri = false;

            st.audio_streams = audio;
            st.subtitle_tracks = text;
            out.push(Emit::Notify(PlayerProperty::AudioStreams));
            out.push(Emit::Notify(PlayerProperty::SubtitleTracks));

            if st.stacked_progress != -1.0 && st.can_seek {
                let stacked = st.stacked_progress;
                self.set_progress_locked(&mut st, stacked, &mut out);
            }
        }

        {
            let mut st = self.state.lock();
            if old > State::Ready && new == State::Ready {
                Self::set_idle(&mut st, true, &mut out);
            } else if new == State::Playing {
                Self::set_idle(&mut st, false, &mut out);
            }
        }
        self.dispatch(out);
    }

    fn on_async_done(self: &Arc<Self>) {
        let mut out = Vec::new();
        {
            let mut st = self.state.lock();
            if !st.in_seek {
                return;
            }
            out.push(Emit::Notify(PlayerProperty::Progress));
            st.in_seek = false;
            out.push(Emit::Notify(PlayerProperty::InSeek));
            if self.buffering_mode() == BufferingMode::Download {
                self.configure_buffering_timeout(&mut st, Some(BUFFERING_TIMEOUT), &mut out);
            }

            if st.stacked_progress != -1.0 {
                let stacked = st.stacked_progress;
                self.set_progress_locked(&mut st, stacked, &mut out);
            }
        }
        self.dispatch(out);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PLAYBIN NOTIFICATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    fn read_streams(&self, audio: bool) -> Vec<StreamInfo> {
        let count = if audio {
            self.playbin.n_audio()
        } else {
            self.playbin.n_text()
        };
        (0..count)
            .map(|i| {
                let tags = if audio {
                    self.playbin.audio_tags(i)
                } else {
                    self.playbin.text_tags(i)
                };
                StreamInfo::from_tags(i, tags)
            })
            .collect()
    }

    fn on_playbin_event(self: &Arc<Self>, event: PlaybinEvent) {
        match event {
            PlaybinEvent::VolumeChanged => {
                let volume = self.playbin.volume().max(0.0).cbrt();
                {
                    let mut st = self.state.lock();
                    // Echo of our own cubic write
                    if (st.volume - volume).abs() > 1e-6 {
                        st.volume = volume.clamp(0.0, 1.0);
                    }
                }
                self.core.notify(PlayerProperty::AudioVolume);
            }
            PlaybinEvent::AudioStreamsChanged => self.refresh_audio_streams(),
            PlaybinEvent::TextStreamsChanged => self.refresh_subtitle_tracks(),
            PlaybinEvent::AudioTagsChanged(index) => {
                if index == self.playbin.current_audio() {
                    self.refresh_audio_streams();
                }
            }
            PlaybinEvent::TextTagsChanged(index) => {
                if index == self.playbin.current_text() {
                    self.refresh_subtitle_tracks();
                }
            }
            PlaybinEvent::CurrentAudioChanged => self.core.notify(PlayerProperty::AudioStream),
            PlaybinEvent::CurrentTextChanged => self.core.notify(PlayerProperty::SubtitleTrack),
            PlaybinEvent::SourceChanged => {
                let user_agent = self.state.lock().user_agent.clone();
                if let Some(ua) = user_agent {
                    tracing::debug!(target: LOG_TARGET, user_agent = %ua, "applying user agent to new source");
                    self.playbin.set_source_user_agent(&ua);
                }
            }
        }
    }

    fn refresh_audio_streams(&self) {
        let streams = self.read_streams(true);
        self.state.lock().audio_streams = streams;
        tracing::debug!(target: LOG_TARGET, "audio streams changed");
        self.core.notify(PlayerProperty::AudioStreams);
    }

    fn refresh_subtitle_tracks(&self) {
        let tracks = self.read_streams(false);
        self.state.lock().subtitle_tracks = tracks;
        tracing::debug!(target: LOG_TARGET, "subtitle tracks changed");
        self.core.notify(PlayerProperty::SubtitleTracks);
    }
}

impl Drop for PlaybackInner {
    fn drop(&mut self) {
        let (tick, buffering) = {
            let mut st = self.state.lock();
            (st.tick_id.take(), st.buffering_timeout_id.take())
        };
        for id in [tick, buffering].into_iter().flatten() {
            self.core.main_context().remove(id);
        }
        if let Some(id) = self.bus_watch.lock().take() {
            self.playbin.bus().remove_watch(id);
        }
        self.playbin.set_event_handler(None);
        self.playbin.set_state(State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::gpu::SoftwareContext;
    use crate::pipeline::{MediaInfo, SimulatedPlaybin};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CLIP: &str = "file:///media/clip.mkv";
    const OTHER: &str = "file:///media/other.mkv";
    const LIVE: &str = "rtsp://camera.local/stream";

    fn setup() -> (MainContext, SimulatedPlaybin, PlaybackPlayer) {
        let ctx = MainContext::with_manual_clock();
        let sink = VideoSink::new(&ctx, Arc::new(SoftwareContext::new()));
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.add_media(
            CLIP,
            MediaInfo::new(Duration::from_secs(100))
                .with_audio(vec![
                    StreamTags::language("en"),
                    StreamTags::language("fr").with_language_name("Français"),
                ])
                .with_text(vec![StreamTags::default().with_codec("SubRip")]),
        );
        playbin.add_media(
            OTHER,
            MediaInfo::new(Duration::from_secs(30)).with_audio(vec![StreamTags::default()]),
        );
        playbin.add_media(LIVE, MediaInfo::live());
        let player = PlaybackPlayer::with_playbin(&ctx, sink, Arc::new(playbin.clone())).unwrap();
        (ctx, playbin, player)
    }

    fn count(signal: &Signal<()>) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        counter
    }

    fn record_idle(player: &PlaybackPlayer) -> Arc<Mutex<Vec<bool>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let p = player.clone();
        player.signals().notify.connect(move |prop| {
            if *prop == PlayerProperty::Idle {
                s.lock().push(p.is_idle());
            }
        });
        seen
    }

    #[test]
    fn test_initial_state() {
        let (_ctx, playbin, player) = setup();
        assert!(player.is_idle());
        assert!(!player.is_playing());
        assert_eq!(player.audio_volume(), 0.5);
        assert!((playbin.volume() - 0.125).abs() < 1e-12);
        assert_eq!(player.subtitle_font_name(), "Sans 16");
        assert_eq!(playbin.subtitle_font().as_deref(), Some("Sans 16"));
        assert_eq!(player.frame().width(), 1);
        assert_eq!(playbin.state().0, State::Ready);
    }

    #[test]
    fn test_play_emits_ready_then_frames() {
        let (ctx, _playbin, player) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        player.signals().ready.connect(move |_| o.lock().push("ready"));
        let o = Arc::clone(&order);
        player.signals().new_frame.connect(move |_| o.lock().push("frame"));

        player.set_uri(Some(CLIP));
        player.set_playing(true);
        ctx.run_pending();

        assert!(player.is_playing());
        assert!(!player.is_idle());
        assert_eq!(order.lock().first(), Some(&"ready"));
        assert!(order.lock().contains(&"frame"));
        assert_eq!(player.duration(), 100.0);
        assert!(player.can_seek());
        assert_eq!(player.frame().width(), 16);
    }

    #[test]
    fn test_set_playing_without_uri_is_ignored() {
        let (ctx, playbin, player) = setup();
        player.set_playing(true);
        ctx.run_pending();
        assert!(!player.is_playing());
        assert_eq!(playbin.state().0, State::Ready);
    }

    #[test]
    fn test_uri_switch_marks_idle_once() {
        let (ctx, _playbin, player) = setup();
        player.set_uri(Some(CLIP));
        player.set_playing(true);
        ctx.run_pending();
        assert!(!player.is_idle());
        assert_eq!(player.audio_streams().len(), 2);

        let idle = record_idle(&player);
        player.set_uri(Some(OTHER));
        assert_eq!(player.progress(), 0.0);
        assert!(player.audio_streams().is_empty());
        ctx.run_pending();

        assert_eq!(*idle.lock(), vec![true, false]);
        assert_eq!(player.duration(), 30.0);
        assert_eq!(player.audio_streams().len(), 1);
        assert_eq!(player.audio_streams()[0].description, "Track 0");
    }

    #[test]
    fn test_stacked_seek_replayed_after_async_done() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        ctx.run_pending();
        playbin.set_hold_async_done(true);

        player.set_progress(0.25);
        assert!(player.in_seek());
        player.set_progress(0.75);
        assert_eq!(player.progress(), 0.75);
        assert_eq!(playbin.seek_log().len(), 1);

        playbin.complete_seek();
        ctx.run_pending();
        assert_eq!(playbin.seek_log().len(), 2);
        assert!(player.in_seek());

        playbin.complete_seek();
        ctx.run_pending();
        assert!(!player.in_seek());
        assert!(player.progress() >= 0.75 - 1e-9);
        assert_eq!(player.inner.state.lock().stacked_progress, -1.0);
        let log = playbin.seek_log();
        assert_eq!(log[0].0, Duration::from_secs(25));
        assert_eq!(log[1].0, Duration::from_secs(75));
        assert!(log[1].1.contains(SeekFlags::FLUSH | SeekFlags::KEY_UNIT));
    }

    #[test]
    fn test_progress_during_uri_change_is_parked() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        player.set_progress(0.5);
        assert_eq!(player.progress(), 0.5);
        assert!(playbin.seek_log().is_empty());
        ctx.run_pending();
        assert_eq!(playbin.seek_log().len(), 1);
        assert_eq!(player.progress(), 0.5);
    }

    #[test]
    fn test_accurate_seek_mode() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        ctx.run_pending();
        player.set_seek_mode(SeekMode::Accurate);
        player.set_progress(0.1);
        ctx.run_pending();
        let flags = playbin.seek_log()[0].1;
        assert!(flags.contains(SeekFlags::ACCURATE));
        assert!(!flags.contains(SeekFlags::KEY_UNIT));
    }

    #[test]
    fn test_progress_zero_without_duration_does_not_seek() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(LIVE));
        ctx.run_pending();
        player.set_progress(0.0);
        player.set_progress(0.5);
        assert!(playbin.seek_log().is_empty());
        assert!(!player.in_seek());
    }

    #[test]
    fn test_subtitle_autoload() {
        let dir = std::env::temp_dir().join(format!("imb-autoload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("movie.mkv"), b"").unwrap();
        std::fs::write(dir.join("movie.srt"), b"").unwrap();
        let uri = url::Url::from_file_path(dir.join("movie.mkv")).unwrap().to_string();
        let srt = url::Url::from_file_path(dir.join("movie.srt")).unwrap().to_string();

        let (_ctx, playbin, player) = setup();
        playbin.add_media(&uri, MediaInfo::new(Duration::from_secs(5)));
        player.set_uri(Some(&uri));
        assert_eq!(player.subtitle_uri(), Some(srt.clone()));
        assert_eq!(playbin.suburi(), Some(srt));

        std::fs::remove_file(dir.join("movie.srt")).unwrap();
        player.set_uri(Some(&uri));
        assert_eq!(player.subtitle_uri(), None);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_live_media_ignores_buffering_state() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(LIVE));
        player.set_playing(true);
        ctx.run_pending();
        assert!(player.is_live_media());

        playbin.post_buffering(50, BufferingMode::Stream);
        ctx.run_pending();
        assert_eq!(player.buffer_fill(), 0.5);
        assert_eq!(player.inner.state.lock().force_state, State::VoidPending);
        assert_eq!(playbin.state().0, State::Playing);
    }

    #[test]
    fn test_stream_buffering_pauses_until_full() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        player.set_playing(true);
        ctx.run_pending();
        assert!(!player.is_live_media());

        playbin.post_buffering(40, BufferingMode::Stream);
        ctx.run_pending();
        assert_eq!(player.inner.state.lock().force_state, State::Paused);
        assert_eq!(playbin.state().0, State::Paused);
        assert!(player.is_playing());

        playbin.post_buffering(100, BufferingMode::Stream);
        ctx.run_pending();
        assert_eq!(player.inner.state.lock().force_state, State::VoidPending);
        assert_eq!(playbin.state().0, State::Playing);
        assert_eq!(player.buffer_fill(), 1.0);
    }

    #[test]
    fn test_stream_buffering_survives_seek() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        player.set_playing(true);
        ctx.run_pending();

        playbin.post_buffering(40, BufferingMode::Stream);
        ctx.run_pending();
        assert_eq!(player.inner.state.lock().force_state, State::Paused);

        player.set_progress(0.5);
        ctx.run_pending();
        ctx.advance(BUFFERING_TIMEOUT);
        ctx.run_pending();
        assert!(!player.in_seek());
        assert_eq!(player.inner.state.lock().force_state, State::Paused);
        assert!(player.inner.state.lock().buffering_timeout_id.is_none());
        assert_eq!(playbin.state().0, State::Paused);

        playbin.post_buffering(100, BufferingMode::Stream);
        ctx.run_pending();
        assert_eq!(player.inner.state.lock().force_state, State::VoidPending);
        assert_eq!(playbin.state().0, State::Playing);
    }

    fn download_query(estimated_total_ms: i64, busy: bool) -> BufferingQuery {
        BufferingQuery {
            mode: BufferingMode::Download,
            busy,
            percent: 10,
            estimated_total_ms,
        }
    }

    #[test]
    fn test_download_buffering_query_loop() {
        let (ctx, playbin, player) = setup();
        player.set_buffering_mode(BufferingMode::Download);
        assert!(playbin.flags().contains(PlayFlags::DOWNLOAD));
        player.set_uri(Some(CLIP));
        player.set_playing(true);
        ctx.run_pending();

        // 100 s left to play, download needs 200 s: keep buffering
        playbin.set_buffering_query(Some(download_query(200_000, false)));
        playbin.post_buffering(10, BufferingMode::Download);
        ctx.run_pending();
        assert_eq!(player.buffer_fill(), 0.0);
        assert_eq!(playbin.state().0, State::Paused);
        assert!(player.inner.state.lock().buffering_timeout_id.is_some());

        // A second DOWNLOAD message does not reinstall the query
        playbin.post_buffering(20, BufferingMode::Download);
        ctx.run_pending();

        playbin.set_buffering_query(Some(download_query(1_000, false)));
        ctx.advance(BUFFERING_TIMEOUT);
        ctx.run_pending();
        assert_eq!(player.buffer_fill(), 1.0);
        assert!(player.inner.state.lock().buffering_timeout_id.is_none());
        assert_eq!(playbin.state().0, State::Playing);
    }

    #[test]
    fn test_unknown_estimate_keeps_buffering() {
        let (ctx, playbin, player) = setup();
        player.set_buffering_mode(BufferingMode::Download);
        player.set_uri(Some(CLIP));
        player.set_playing(true);
        ctx.run_pending();

        playbin.set_buffering_query(Some(download_query(-1, false)));
        playbin.post_buffering(10, BufferingMode::Download);
        ctx.run_pending();
        ctx.advance(BUFFERING_TIMEOUT * 4);
        ctx.run_pending();
        assert_eq!(player.buffer_fill(), 0.0);
        assert_eq!(playbin.state().0, State::Paused);
    }

    #[test]
    fn test_should_buffer_override_first_handler_wins() {
        let (ctx, playbin, player) = setup();
        player.set_buffering_mode(BufferingMode::Download);
        player.set_uri(Some(CLIP));
        player.set_playing(true);
        ctx.run_pending();

        player.playback_signals().should_buffer.connect(|_| false);
        player.playback_signals().should_buffer.connect(|_| true);
        playbin.set_buffering_query(Some(download_query(-1, true)));
        playbin.post_buffering(10, BufferingMode::Download);
        ctx.run_pending();
        assert_eq!(player.buffer_fill(), 1.0);
        assert_eq!(playbin.state().0, State::Playing);
    }

    #[test]
    fn test_eos_once_then_idle() {
        let (ctx, playbin, player) = setup();
        let eos = count(&player.signals().eos);
        player.set_uri(Some(OTHER));
        player.set_playing(true);
        ctx.run_pending();

        playbin.advance(Duration::from_secs(31));
        ctx.run_pending();
        assert_eq!(eos.load(Ordering::SeqCst), 1);
        assert!(player.is_idle());
        assert_eq!(player.progress(), 1.0);

        // A duplicate EOS from the pipeline is not forwarded
        playbin.bus().post(BusMessage::Eos);
        ctx.run_pending();
        assert_eq!(eos.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eos_handler_can_loop() {
        let (ctx, playbin, player) = setup();
        let looper = player.clone();
        player.signals().eos.connect(move |_| {
            looper.set_progress(0.0);
            looper.set_playing(true);
        });
        player.set_uri(Some(OTHER));
        player.set_playing(true);
        ctx.run_pending();

        playbin.advance(Duration::from_secs(31));
        ctx.run_pending();
        assert!(!player.is_idle());
        assert_eq!(playbin.state().0, State::Playing);
        assert!(player.progress() < 0.1);
    }

    #[test]
    fn test_error_sets_idle_and_null() {
        let (ctx, playbin, player) = setup();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        player.signals().error.connect(move |(kind, message)| e.lock().push((*kind, message.clone())));

        player.set_uri(Some(CLIP));
        player.set_playing(true);
        ctx.run_pending();
        playbin.post_error("corrupt stream");
        ctx.run_pending();

        assert_eq!(*errors.lock(), vec![(ErrorKind::Decoding, "corrupt stream".to_string())]);
        assert!(player.is_idle());
        assert_eq!(playbin.state().0, State::Null);
        assert_eq!(player.progress(), 0.0);
    }

    #[test]
    fn test_unreachable_uri_reports_io_error() {
        let (ctx, _playbin, player) = setup();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        player.signals().error.connect(move |(kind, _)| e.lock().push(*kind));
        player.set_uri(Some("file:///does/not/exist.mkv"));
        ctx.run_pending();
        assert_eq!(*errors.lock(), vec![ErrorKind::IoOrUri]);
    }

    #[test]
    fn test_clear_uri() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        player.set_playing(true);
        ctx.run_pending();
        assert!(player.inner.state.lock().tick_id.is_some());

        player.set_uri(None);
        ctx.run_pending();
        assert!(player.is_idle());
        assert!(!player.is_playing());
        assert_eq!(playbin.state().0, State::Null);
        assert!(player.inner.state.lock().tick_id.is_none());
    }

    #[test]
    fn test_tick_notifies_progress() {
        let (ctx, _playbin, player) = setup();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        player.signals().notify.connect(move |prop| {
            if *prop == PlayerProperty::Progress {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });
        player.set_uri(Some(CLIP));
        ctx.run_pending();
        let before = ticks.load(Ordering::SeqCst);
        ctx.advance(TICK_TIMEOUT * 3);
        ctx.run_pending();
        assert!(ticks.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn test_volume_is_cubic_and_clamped() {
        let (ctx, playbin, player) = setup();
        player.set_audio_volume(0.8);
        ctx.run_pending();
        assert_eq!(player.audio_volume(), 0.8);
        assert!((playbin.volume() - 0.512).abs() < 1e-12);

        player.set_audio_volume(3.0);
        ctx.run_pending();
        assert_eq!(player.audio_volume(), 1.0);

        playbin.simulate_external_volume(0.125);
        ctx.run_pending();
        assert!((player.audio_volume() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_stream_selection() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        ctx.run_pending();

        let audio = player.audio_streams();
        assert_eq!(audio[0].description, "en");
        assert_eq!(audio[1].description, "Français");
        assert_eq!(player.subtitle_tracks()[0].description, "SubRip");

        assert!(player.set_audio_stream(1).is_ok());
        assert_eq!(player.audio_stream(), 1);
        let err = player.set_audio_stream(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(player.audio_stream(), 1);

        assert!(player.set_subtitle_track(0).is_ok());
        assert_eq!(player.subtitle_track(), 0);
        assert!(player.set_subtitle_track(-1).is_ok());
        assert_eq!(player.subtitle_track(), -1);
        assert!(!playbin.flags().contains(PlayFlags::TEXT));
        assert!(player.set_subtitle_track(1).is_err());
    }

    #[test]
    fn test_audio_tags_change_refreshes_current_stream_only() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        ctx.run_pending();
        player.set_audio_stream(0).unwrap();
        ctx.run_pending();

        playbin.update_audio_tags(1, StreamTags::language("de"));
        ctx.run_pending();
        assert_eq!(player.audio_streams()[1].description, "Français");

        playbin.update_audio_tags(0, StreamTags::language("es"));
        ctx.run_pending();
        assert_eq!(player.audio_streams()[0].description, "es");
        assert_eq!(player.audio_streams()[1].description, "de");
    }

    #[test]
    fn test_user_agent_reapplied_to_new_sources() {
        let (ctx, playbin, player) = setup();
        let http = "http://example.com/clip.webm";
        playbin.add_media(http, MediaInfo::new(Duration::from_secs(10)).with_seekable(None));
        player.set_user_agent(Some("Immersive/1.0"));
        player.set_uri(Some(http));
        ctx.run_pending();
        assert_eq!(playbin.source_user_agent().as_deref(), Some("Immersive/1.0"));
        assert_eq!(player.user_agent().as_deref(), Some("Immersive/1.0"));
        // Seeking query fails: http falls back to not seekable
        assert!(!player.can_seek());
    }

    #[test]
    fn test_duration_change_thresholds() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        ctx.run_pending();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&notified);
        player.signals().notify.connect(move |prop| {
            if *prop == PlayerProperty::Duration {
                n.fetch_add(1, Ordering::SeqCst);
            }
        });

        playbin.set_duration(Duration::from_millis(100_500));
        ctx.run_pending();
        assert_eq!(player.duration(), 100.5);
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        playbin.set_duration(Duration::from_secs(120));
        ctx.run_pending();
        assert_eq!(player.duration(), 120.0);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_filename_builds_file_uri() {
        let (_ctx, _playbin, player) = setup();
        player.set_filename("/media/clip.mkv");
        assert_eq!(player.uri().as_deref(), Some(CLIP));
    }

    #[test]
    fn test_apply_config() {
        let (ctx, playbin, player) = setup();
        let config = PlaybackConfig::from_xml_str(
            r#"<playback>
                <uri>file:///media/clip.mkv</uri>
                <seekFlags>accurate</seekFlags>
                <bufferingMode>download</bufferingMode>
                <audioVolume>0.25</audioVolume>
                <bufferSize>2097152</bufferSize>
                <subtitleFontName>Serif 20</subtitleFontName>
            </playback>"#,
        )
        .unwrap();
        player.apply_config(&config);
        ctx.run_pending();

        assert_eq!(player.uri().as_deref(), Some(CLIP));
        assert_eq!(player.seek_mode(), SeekMode::Accurate);
        assert_eq!(player.buffering_mode(), BufferingMode::Download);
        assert_eq!(player.audio_volume(), 0.25);
        assert_eq!(player.buffer_size(), 2_097_152);
        assert_eq!(playbin.subtitle_font().as_deref(), Some("Serif 20"));
    }

    #[test]
    fn test_pipeline_handle_is_observation_only() {
        let (ctx, playbin, player) = setup();
        player.set_uri(Some(CLIP));
        ctx.run_pending();
        let handle = player.pipeline();
        assert_eq!(handle.name(), "playbin");
        assert_eq!(handle.state(), playbin.state());
    }
}
