//! Scripted in-process pipelines
//!
//! `SimulatedPlaybin` and `SimulatedCameraBin` behave like the decoding and
//! capture pipelines as far as the players can observe: state walks with
//! asynchronous preroll, bus messages, stream metadata, seeking and
//! buffering queries. Media is registered per URI and time only moves when
//! the owner calls `advance`, which keeps player tests deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    Bus, BusMessage, BufferingMode, BufferingQuery, CameraBin, CameraBinEvent, CaptureMode, ElementMessage,
    EncodingProfile, EventHandler, FilterElement, MediaPipeline, MessageSource, PlayFlags, Playbin, PlaybinEvent,
    PreviewSample, PropertyRange, SeekFlags, State, StateChange, StreamTags, TunableElement,
};
use crate::error::MediaError;
use crate::mainloop::MainContext;
use crate::player::CameraDevice;
use crate::sink::VideoSink;
use crate::video::{PixelFormat, VideoBuffer, VideoCaps};

/// User agent of a freshly created HTTP source
pub const DEFAULT_USER_AGENT: &str = "GStreamer souphttpsrc";

// ═══════════════════════════════════════════════════════════════════════════════
// MEDIA
// ═══════════════════════════════════════════════════════════════════════════════

/// Description of a piece of media served by `SimulatedPlaybin`
#[derive(Debug, Clone)]
pub struct MediaInfo {
    /// `None` for unknown duration (live streams)
    pub duration: Option<Duration>,
    /// Answer to the seeking query; `None` makes the query fail
    pub seekable: Option<bool>,
    /// Live sources cannot preroll
    pub live: bool,
    pub caps: VideoCaps,
    pub audio: Vec<StreamTags>,
    pub text: Vec<StreamTags>,
    /// KEY_UNIT seeks snap down to a multiple of this
    pub keyframe_interval: Option<Duration>,
}

impl MediaInfo {
    /// Seekable on-demand clip with one video stream
    pub fn new(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            seekable: Some(true),
            live: false,
            caps: VideoCaps::new(PixelFormat::Rgba32, 16, 16),
            audio: Vec::new(),
            text: Vec::new(),
            keyframe_interval: None,
        }
    }

    /// Live stream without duration or seeking
    pub fn live() -> Self {
        Self {
            duration: None,
            seekable: Some(false),
            live: true,
            ..Self::new(Duration::ZERO)
        }
    }

    pub fn with_caps(mut self, caps: VideoCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_seekable(mut self, seekable: Option<bool>) -> Self {
        self.seekable = seekable;
        self
    }

    pub fn with_audio(mut self, audio: Vec<StreamTags>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_text(mut self, text: Vec<StreamTags>) -> Self {
        self.text = text;
        self
    }

    pub fn with_keyframe_interval(mut self, interval: Duration) -> Self {
        self.keyframe_interval = Some(interval);
        self
    }
}

struct SourceElement {
    http: bool,
    user_agent: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLAYBIN
// ═══════════════════════════════════════════════════════════════════════════════

struct PlaybinState {
    current: State,
    pending: State,
    target: State,
    /// Bumped on every state request so stale prerolls are ignored
    generation: u64,
    media: HashMap<String, MediaInfo>,
    uri: Option<String>,
    suburi: Option<String>,
    subtitle_font: Option<String>,
    flags: PlayFlags,
    volume: f64,
    sink: Option<VideoSink>,
    position: Duration,
    buffer_size: i64,
    buffer_duration: i64,
    current_audio: i32,
    current_text: i32,
    source: Option<SourceElement>,
    error_posted: bool,
    eos_posted: bool,
    hold_async_done: bool,
    seek_held: bool,
    seeks: Vec<(Duration, SeekFlags)>,
    buffering: Option<BufferingQuery>,
}

impl PlaybinState {
    fn media(&self) -> Option<&MediaInfo> {
        self.uri.as_ref().and_then(|uri| self.media.get(uri))
    }

    fn media_mut(&mut self) -> Option<&mut MediaInfo> {
        match self.uri.as_ref() {
            Some(uri) => self.media.get_mut(uri),
            None => None,
        }
    }

    fn prerolled(&self) -> bool {
        self.current >= State::Paused
    }

    fn pending_after(&self, reached: State) -> State {
        if reached == self.target {
            State::VoidPending
        } else {
            self.target
        }
    }
}

struct PlaybinInner {
    name: String,
    ctx: MainContext,
    bus: Bus,
    state: Mutex<PlaybinState>,
    handler: Mutex<Option<EventHandler<PlaybinEvent>>>,
}

/// Frame to push once the state lock is released
type FramePush = (VideoSink, VideoCaps, Duration);

/// In-process URI playback pipeline. Cheap to clone.
#[derive(Clone)]
pub struct SimulatedPlaybin {
    inner: Arc<PlaybinInner>,
}

impl SimulatedPlaybin {
    pub fn new(ctx: &MainContext) -> Self {
        Self {
            inner: Arc::new(PlaybinInner {
                name: "playbin".to_string(),
                ctx: ctx.clone(),
                bus: Bus::new(ctx),
                state: Mutex::new(PlaybinState {
                    current: State::Null,
                    pending: State::VoidPending,
                    target: State::Null,
                    generation: 0,
                    media: HashMap::new(),
                    uri: None,
                    suburi: None,
                    subtitle_font: None,
                    flags: PlayFlags::VIDEO | PlayFlags::AUDIO | PlayFlags::TEXT | PlayFlags::SOFT_VOLUME,
                    volume: 1.0,
                    sink: None,
                    position: Duration::ZERO,
                    buffer_size: -1,
                    buffer_duration: -1,
                    current_audio: -1,
                    current_text: -1,
                    source: None,
                    error_posted: false,
                    eos_posted: false,
                    hold_async_done: false,
                    seek_held: false,
                    seeks: Vec::new(),
                    buffering: None,
                }),
                handler: Mutex::new(None),
            }),
        }
    }

    /// Serve `info` for `uri`
    pub fn add_media(&self, uri: &str, info: MediaInfo) {
        self.inner.state.lock().media.insert(uri.to_string(), info);
    }

    /// Current position in the media
    pub fn position(&self) -> Duration {
        self.inner.state.lock().position
    }

    /// Every seek issued, in order
    pub fn seek_log(&self) -> Vec<(Duration, SeekFlags)> {
        self.inner.state.lock().seeks.clone()
    }

    pub fn subtitle_font(&self) -> Option<String> {
        self.inner.state.lock().subtitle_font.clone()
    }

    /// While set, seeks only post `AsyncDone` from `complete_seek`
    pub fn set_hold_async_done(&self, hold: bool) {
        self.inner.state.lock().hold_async_done = hold;
    }

    /// Finish a seek held by `set_hold_async_done`
    pub fn complete_seek(&self) -> bool {
        let held = std::mem::replace(&mut self.inner.state.lock().seek_held, false);
        if held {
            self.inner.bus.post(BusMessage::AsyncDone);
        }
        held
    }

    /// Advance the playback clock. Pushes a frame while playing and posts
    /// EOS once when the end of the media is reached.
    pub fn advance(&self, by: Duration) {
        let mut push = None;
        let mut eos = false;
        {
            let mut st = self.inner.state.lock();
            if st.current != State::Playing {
                return;
            }
            st.position += by;
            if let Some(duration) = st.media().and_then(|m| m.duration) {
                if st.position >= duration {
                    st.position = duration;
                    if !st.eos_posted {
                        st.eos_posted = true;
                        eos = true;
                    }
                }
            }
            if !eos {
                push = frame_push(&st);
            }
        }
        if let Some(push) = push {
            deliver_frame(push);
        }
        if eos {
            tracing::debug!(target: "immersive_media_bridge::playback", "simulated end of stream");
            self.inner.bus.post(BusMessage::Eos);
        }
    }

    /// Push one frame of the current media to the video sink
    pub fn push_frame(&self) {
        let push = frame_push(&self.inner.state.lock());
        if let Some(push) = push {
            deliver_frame(push);
        }
    }

    pub fn post_buffering(&self, percent: i32, mode: BufferingMode) {
        self.inner.bus.post(BusMessage::Buffering { percent, mode });
    }

    /// Answer returned by the next buffering queries
    pub fn set_buffering_query(&self, query: Option<BufferingQuery>) {
        self.inner.state.lock().buffering = query;
    }

    pub fn post_error(&self, message: &str) {
        self.inner.bus.post(BusMessage::Error {
            source: MessageSource::Element("decoder".to_string()),
            error: MediaError::Decoding(message.to_string()),
            debug: None,
        });
    }

    /// Change the duration of the current media and post `DurationChanged`
    pub fn set_duration(&self, duration: Duration) {
        if let Some(media) = self.inner.state.lock().media_mut() {
            media.duration = Some(duration);
        }
        self.inner.bus.post(BusMessage::DurationChanged);
    }

    /// Volume changed by something other than the player (mixer, OS)
    pub fn simulate_external_volume(&self, volume: f64) {
        self.inner.state.lock().volume = volume;
        self.fire(PlaybinEvent::VolumeChanged);
    }

    /// Replace the audio tags of stream `index` of the current media
    pub fn update_audio_tags(&self, index: usize, tags: StreamTags) {
        let updated = {
            let mut st = self.inner.state.lock();
            match st.media_mut().and_then(|m| m.audio.get_mut(index)) {
                Some(slot) => {
                    *slot = tags;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.fire(PlaybinEvent::AudioTagsChanged(index as i32));
        }
    }

    /// Replace the stream lists of the current media
    pub fn set_streams(&self, audio: Vec<StreamTags>, text: Vec<StreamTags>) {
        if let Some(media) = self.inner.state.lock().media_mut() {
            media.audio = audio;
            media.text = text;
        }
        self.fire(PlaybinEvent::AudioStreamsChanged);
        self.fire(PlaybinEvent::TextStreamsChanged);
    }

    fn fire(&self, event: PlaybinEvent) {
        let handler = self.inner.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn post_state_changed(&self, old: State, new: State, pending: State) {
        self.inner.bus.post(BusMessage::StateChanged {
            source: MessageSource::Pipeline,
            old,
            new,
            pending,
        });
    }

    fn schedule_preroll(&self, generation: u64) {
        let weak: Weak<PlaybinInner> = Arc::downgrade(&self.inner);
        self.inner.ctx.invoke(move || {
            if let Some(inner) = weak.upgrade() {
                SimulatedPlaybin { inner }.finish_preroll(generation);
            }
        });
    }

    fn finish_preroll(&self, generation: u64) {
        let push;
        let continue_to_playing;
        let pending;
        {
            let mut st = self.inner.state.lock();
            if st.generation != generation || st.current != State::Ready {
                return;
            }
            st.current = State::Paused;
            pending = st.pending_after(State::Paused);
            continue_to_playing = st.target == State::Playing;
            push = frame_push(&st);
        }

        self.post_state_changed(State::Ready, State::Paused, pending);
        if let Some(push) = push {
            deliver_frame(push);
        }
        self.inner.bus.post(BusMessage::AsyncDone);

        if continue_to_playing {
            {
                let mut st = self.inner.state.lock();
                st.current = State::Playing;
                st.pending = State::VoidPending;
            }
            self.post_state_changed(State::Paused, State::Playing, State::VoidPending);
        } else {
            self.inner.state.lock().pending = State::VoidPending;
        }
    }
}

fn frame_push(st: &PlaybinState) -> Option<FramePush> {
    let sink = st.sink.clone()?;
    let caps = st.media()?.caps;
    Some((sink, caps, st.position))
}

fn deliver_frame((sink, caps, pts): FramePush) {
    if sink.caps() != Some(caps) && sink.set_caps(&caps).is_err() {
        return;
    }
    if let Err(e) = sink.render(VideoBuffer::zeroed(&caps).with_pts(pts)) {
        tracing::trace!("simulated frame refused: {}", e);
    }
}

impl MediaPipeline for SimulatedPlaybin {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn set_state(&self, target: State) -> StateChange {
        let mut events = Vec::new();
        let mut result = StateChange::Success;
        {
            let mut st = self.inner.state.lock();
            st.generation += 1;
            st.target = target;

            loop {
                let current = st.current;
                if current == target {
                    st.pending = State::VoidPending;
                    break;
                }
                let next = current.step_towards(target);

                if next < current {
                    st.current = next;
                    if next <= State::Ready {
                        st.position = Duration::ZERO;
                        st.eos_posted = false;
                        st.seek_held = false;
                    }
                    if next == State::Null {
                        st.source = None;
                    }
                    let pending = st.pending_after(next);
                    self.post_state_changed(current, next, pending);
                    continue;
                }

                match next {
                    State::Ready => {
                        st.current = State::Ready;
                        let pending = st.pending_after(State::Ready);
                        self.post_state_changed(current, State::Ready, pending);
                    }
                    State::Paused => {
                        let Some(media) = st.media().cloned() else {
                            let uri = st.uri.clone().unwrap_or_default();
                            st.pending = State::VoidPending;
                            if !st.error_posted {
                                st.error_posted = true;
                                self.inner.bus.post(BusMessage::Error {
                                    source: MessageSource::Element("source".to_string()),
                                    error: MediaError::IoOrUri(format!("could not open resource '{}'", uri)),
                                    debug: None,
                                });
                            }
                            result = StateChange::Failure;
                            break;
                        };

                        if st.source.is_none() {
                            let http = st
                                .uri
                                .as_deref()
                                .map(|u| u.starts_with("http://") || u.starts_with("https://"))
                                .unwrap_or(false);
                            st.source = Some(SourceElement {
                                http,
                                user_agent: http.then(|| DEFAULT_USER_AGENT.to_string()),
                            });
                            events.push(PlaybinEvent::SourceChanged);
                        }

                        if media.live {
                            st.current = State::Paused;
                            let pending = st.pending_after(State::Paused);
                            self.post_state_changed(State::Ready, State::Paused, pending);
                            if target == State::Paused {
                                result = StateChange::NoPreroll;
                            }
                            continue;
                        }

                        st.pending = target;
                        let generation = st.generation;
                        self.schedule_preroll(generation);
                        result = StateChange::Async;
                        break;
                    }
                    State::Playing => {
                        st.current = State::Playing;
                        self.post_state_changed(current, State::Playing, State::VoidPending);
                    }
                    State::Null | State::VoidPending => break,
                }
            }
        }

        for event in events {
            self.fire(event);
        }
        tracing::trace!(%target, ?result, "simulated playbin state request");
        result
    }

    fn state(&self) -> (State, State) {
        let st = self.inner.state.lock();
        (st.current, st.pending)
    }

    fn bus(&self) -> Bus {
        self.inner.bus.clone()
    }
}

impl Playbin for SimulatedPlaybin {
    fn uri(&self) -> Option<String> {
        self.inner.state.lock().uri.clone()
    }

    fn set_uri(&self, uri: Option<&str>) {
        let mut st = self.inner.state.lock();
        st.uri = uri.map(str::to_string);
        st.error_posted = false;
        st.source = None;
        st.current_audio = -1;
        st.current_text = -1;
    }

    fn suburi(&self) -> Option<String> {
        self.inner.state.lock().suburi.clone()
    }

    fn set_suburi(&self, uri: Option<&str>) {
        self.inner.state.lock().suburi = uri.map(str::to_string);
    }

    fn set_subtitle_font(&self, font: &str) {
        self.inner.state.lock().subtitle_font = Some(font.to_string());
    }

    fn flags(&self) -> PlayFlags {
        self.inner.state.lock().flags
    }

    fn set_flags(&self, flags: PlayFlags) {
        self.inner.state.lock().flags = flags;
    }

    fn volume(&self) -> f64 {
        self.inner.state.lock().volume
    }

    fn set_volume(&self, volume: f64) {
        self.inner.state.lock().volume = volume;
        self.fire(PlaybinEvent::VolumeChanged);
    }

    fn set_video_sink(&self, sink: VideoSink) {
        sink.set_bus(Some(self.inner.bus.clone()));
        self.inner.state.lock().sink = Some(sink);
    }

    fn seek(&self, position: Duration, flags: SeekFlags) -> bool {
        let push;
        {
            let mut st = self.inner.state.lock();
            if !st.prerolled() {
                tracing::debug!(position = position.as_secs_f64(), "seek refused before preroll");
                return false;
            }
            let Some(media) = st.media().cloned() else {
                return false;
            };
            if media.seekable == Some(false) {
                return false;
            }

            let mut target = position;
            if flags.contains(SeekFlags::KEY_UNIT) {
                if let Some(interval) = media.keyframe_interval.filter(|i| !i.is_zero()) {
                    let units = target.as_nanos() / interval.as_nanos();
                    target = interval * units as u32;
                }
            }
            if let Some(duration) = media.duration {
                target = target.min(duration);
            }

            st.position = target;
            st.eos_posted = false;
            st.seeks.push((target, flags));
            tracing::debug!(
                target: "immersive_media_bridge::playback",
                requested = position.as_secs_f64(),
                actual = target.as_secs_f64(),
                ?flags,
                "simulated seek"
            );
            if st.hold_async_done {
                st.seek_held = true;
            }
            push = frame_push(&st).map(|p| (p, st.seek_held));
        }

        if let Some((push, held)) = push {
            deliver_frame(push);
            if !held {
                self.inner.bus.post(BusMessage::AsyncDone);
            }
        } else if !self.inner.state.lock().seek_held {
            self.inner.bus.post(BusMessage::AsyncDone);
        }
        true
    }

    fn query_position(&self) -> Option<Duration> {
        let st = self.inner.state.lock();
        st.prerolled().then_some(st.position)
    }

    fn query_duration(&self) -> Option<Duration> {
        let st = self.inner.state.lock();
        if !st.prerolled() {
            return None;
        }
        st.media().and_then(|m| m.duration)
    }

    fn query_seekable(&self) -> Option<bool> {
        let st = self.inner.state.lock();
        if !st.prerolled() {
            return None;
        }
        st.media().and_then(|m| m.seekable)
    }

    fn query_buffering(&self) -> Option<BufferingQuery> {
        self.inner.state.lock().buffering
    }

    fn buffer_size(&self) -> i64 {
        self.inner.state.lock().buffer_size
    }

    fn set_buffer_size(&self, bytes: i64) {
        self.inner.state.lock().buffer_size = bytes;
    }

    fn buffer_duration(&self) -> i64 {
        self.inner.state.lock().buffer_duration
    }

    fn set_buffer_duration(&self, nanos: i64) {
        self.inner.state.lock().buffer_duration = nanos;
    }

    fn n_audio(&self) -> usize {
        let st = self.inner.state.lock();
        if !st.prerolled() {
            return 0;
        }
        st.media().map(|m| m.audio.len()).unwrap_or(0)
    }

    fn audio_tags(&self, index: usize) -> Option<StreamTags> {
        let st = self.inner.state.lock();
        st.media().and_then(|m| m.audio.get(index).cloned())
    }

    fn current_audio(&self) -> i32 {
        self.inner.state.lock().current_audio
    }

    fn set_current_audio(&self, index: i32) {
        self.inner.state.lock().current_audio = index;
        self.fire(PlaybinEvent::CurrentAudioChanged);
    }

    fn n_text(&self) -> usize {
        let st = self.inner.state.lock();
        if !st.prerolled() {
            return 0;
        }
        st.media().map(|m| m.text.len()).unwrap_or(0)
    }

    fn text_tags(&self, index: usize) -> Option<StreamTags> {
        let st = self.inner.state.lock();
        st.media().and_then(|m| m.text.get(index).cloned())
    }

    fn current_text(&self) -> i32 {
        self.inner.state.lock().current_text
    }

    fn set_current_text(&self, index: i32) {
        self.inner.state.lock().current_text = index;
        self.fire(PlaybinEvent::CurrentTextChanged);
    }

    fn source_user_agent(&self) -> Option<String> {
        let st = self.inner.state.lock();
        st.source.as_ref().and_then(|s| s.user_agent.clone())
    }

    fn set_source_user_agent(&self, user_agent: &str) -> bool {
        let mut st = self.inner.state.lock();
        match st.source.as_mut() {
            Some(source) if source.http => {
                source.user_agent = Some(user_agent.to_string());
                true
            }
            _ => false,
        }
    }

    fn set_event_handler(&self, handler: Option<EventHandler<PlaybinEvent>>) {
        *self.inner.handler.lock() = handler;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAMERA BIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Element exposing clamped numeric properties
pub struct SimulatedTunable {
    properties: Mutex<HashMap<String, (PropertyRange, f64)>>,
}

impl SimulatedTunable {
    pub fn new(properties: &[(&str, PropertyRange)]) -> Self {
        Self {
            properties: Mutex::new(
                properties
                    .iter()
                    .map(|(name, range)| (name.to_string(), (*range, range.default)))
                    .collect(),
            ),
        }
    }

    fn gamma() -> Self {
        Self::new(&[(
            "gamma",
            PropertyRange {
                min: 0.01,
                max: 10.0,
                default: 1.0,
            },
        )])
    }

    fn color_balance() -> Self {
        let range = |min, max, default| PropertyRange { min, max, default };
        Self::new(&[
            ("brightness", range(-1.0, 1.0, 0.0)),
            ("contrast", range(0.0, 2.0, 1.0)),
            ("saturation", range(0.0, 2.0, 1.0)),
            ("hue", range(-1.0, 1.0, 0.0)),
        ])
    }
}

impl TunableElement for SimulatedTunable {
    fn property_range(&self, name: &str) -> Option<PropertyRange> {
        self.properties.lock().get(name).map(|(range, _)| *range)
    }

    fn property(&self, name: &str) -> Option<f64> {
        self.properties.lock().get(name).map(|(_, value)| *value)
    }

    fn set_property(&self, name: &str, value: f64) -> bool {
        match self.properties.lock().get_mut(name) {
            Some((range, current)) => {
                *current = range.clamp(value);
                true
            }
            None => false,
        }
    }
}

const VIEWFINDER_DEFAULT: (u32, u32) = (320, 240);

struct CameraBinState {
    current: State,
    target: State,
    sink: Option<VideoSink>,
    source: Option<(String, String)>,
    capture_caps: Option<(u32, u32)>,
    ready_for_capture: bool,
    mode: CaptureMode,
    location: Option<String>,
    recording: bool,
    post_previews: bool,
    preview_caps: (u32, u32),
    video_profile: Option<EncodingProfile>,
    image_profile: Option<EncodingProfile>,
    valve_drop: bool,
    valve_log: Vec<bool>,
    /// valve is linked to gamma, directly or through the custom filter
    linked: bool,
    custom_filter: Option<FilterElement>,
    filter_state: State,
    rejected_filters: HashSet<String>,
    captures: Vec<(CaptureMode, Option<String>)>,
}

struct CameraBinInner {
    name: String,
    ctx: MainContext,
    bus: Bus,
    state: Mutex<CameraBinState>,
    gamma: Mutex<Option<Arc<SimulatedTunable>>>,
    color_balance: Mutex<Option<Arc<SimulatedTunable>>>,
    handler: Mutex<Option<EventHandler<CameraBinEvent>>>,
}

/// In-process camera capture pipeline. Cheap to clone.
#[derive(Clone)]
pub struct SimulatedCameraBin {
    inner: Arc<CameraBinInner>,
}

impl SimulatedCameraBin {
    pub fn new(ctx: &MainContext) -> Self {
        Self {
            inner: Arc::new(CameraBinInner {
                name: "camerabin".to_string(),
                ctx: ctx.clone(),
                bus: Bus::new(ctx),
                state: Mutex::new(CameraBinState {
                    current: State::Null,
                    target: State::Null,
                    sink: None,
                    source: None,
                    capture_caps: None,
                    ready_for_capture: false,
                    mode: CaptureMode::Image,
                    location: None,
                    recording: false,
                    post_previews: false,
                    preview_caps: (160, 120),
                    video_profile: None,
                    image_profile: None,
                    valve_drop: false,
                    valve_log: Vec::new(),
                    linked: true,
                    custom_filter: None,
                    filter_state: State::Null,
                    rejected_filters: HashSet::new(),
                    captures: Vec::new(),
                }),
                gamma: Mutex::new(Some(Arc::new(SimulatedTunable::gamma()))),
                color_balance: Mutex::new(Some(Arc::new(SimulatedTunable::color_balance()))),
                handler: Mutex::new(None),
            }),
        }
    }

    /// Camera bin built without a gamma element
    pub fn without_gamma(self) -> Self {
        *self.inner.gamma.lock() = None;
        self
    }

    /// Camera bin built without a colour balance element
    pub fn without_color_balance(self) -> Self {
        *self.inner.color_balance.lock() = None;
        self
    }

    /// Make `link_custom_filter` fail for filters named `name`
    pub fn reject_filter(&self, name: &str) {
        self.inner.state.lock().rejected_filters.insert(name.to_string());
    }

    /// Elements currently linked after the source, in order
    pub fn filter_chain(&self) -> Vec<String> {
        let st = self.inner.state.lock();
        let mut chain = vec!["identity".to_string(), "valve".to_string()];
        if !st.linked {
            return chain;
        }
        if let Some(filter) = &st.custom_filter {
            chain.push(filter.name().to_string());
        }
        chain.extend(
            ["gamma", "videoconvert", "videobalance", "videoconvert"]
                .iter()
                .map(|s| s.to_string()),
        );
        chain
    }

    /// Every value the valve's drop property took, in order
    pub fn valve_log(&self) -> Vec<bool> {
        self.inner.state.lock().valve_log.clone()
    }

    pub fn filter_state(&self) -> State {
        self.inner.state.lock().filter_state
    }

    pub fn capture_caps(&self) -> Option<(u32, u32)> {
        self.inner.state.lock().capture_caps
    }

    /// Factory and node of the configured camera source
    pub fn video_source(&self) -> Option<(String, String)> {
        self.inner.state.lock().source.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.state.lock().recording
    }

    pub fn location(&self) -> Option<String> {
        self.inner.state.lock().location.clone()
    }

    pub fn video_profile(&self) -> Option<EncodingProfile> {
        self.inner.state.lock().video_profile.clone()
    }

    pub fn image_profile(&self) -> Option<EncodingProfile> {
        self.inner.state.lock().image_profile.clone()
    }

    /// Every capture started, in order
    pub fn captures(&self) -> Vec<(CaptureMode, Option<String>)> {
        self.inner.state.lock().captures.clone()
    }

    /// Push one I420 viewfinder frame to the sink
    pub fn push_viewfinder_frame(&self) {
        let push = {
            let st = self.inner.state.lock();
            st.sink.clone().map(|sink| {
                let (w, h) = st.capture_caps.unwrap_or(VIEWFINDER_DEFAULT);
                (sink, VideoCaps::new(PixelFormat::I420, w, h), Duration::ZERO)
            })
        };
        if let Some(push) = push {
            deliver_frame(push);
        }
    }

    pub fn post_error(&self, message: &str) {
        self.inner.bus.post(BusMessage::Error {
            source: MessageSource::Element("camerasrc".to_string()),
            error: MediaError::Decoding(message.to_string()),
            debug: None,
        });
    }

    fn set_ready_for_capture(&self, ready: bool) {
        let changed = {
            let mut st = self.inner.state.lock();
            std::mem::replace(&mut st.ready_for_capture, ready) != ready
        };
        if changed {
            let handler = self.inner.handler.lock().clone();
            if let Some(handler) = handler {
                handler(CameraBinEvent::ReadyForCaptureChanged(ready));
            }
        }
    }

    fn post_element(&self, message: ElementMessage) {
        self.inner.bus.post(BusMessage::Element {
            source: MessageSource::Element("camerabin".to_string()),
            message,
        });
    }

    fn finish_image_capture(&self) {
        let (location, preview) = {
            let st = self.inner.state.lock();
            let preview = st.post_previews.then(|| {
                let (w, h) = st.preview_caps;
                let stride = (w as usize * 3 + 3) & !3;
                PreviewSample {
                    data: vec![0x40; stride * h as usize],
                    width: w,
                    height: h,
                }
            });
            (st.location.clone(), preview)
        };
        if let Some(sample) = preview {
            self.post_element(ElementMessage::PreviewImage(sample));
        }
        self.post_element(ElementMessage::ImageDone {
            filename: location.unwrap_or_default(),
        });
        self.set_ready_for_capture(true);
    }
}

impl MediaPipeline for SimulatedCameraBin {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn set_state(&self, target: State) -> StateChange {
        let mut reached_playing = false;
        let mut left_playing = false;
        {
            let mut st = self.inner.state.lock();
            st.target = target;
            if target >= State::Ready && st.source.is_none() {
                tracing::warn!(target: "immersive_media_bridge::camera", "camera bin has no video source");
                return StateChange::Failure;
            }
            while st.current != target {
                let old = st.current;
                let new = old.step_towards(target);
                st.current = new;
                if new == State::Playing {
                    reached_playing = true;
                }
                if old == State::Playing {
                    left_playing = true;
                    st.recording = false;
                }
                self.inner.bus.post(BusMessage::StateChanged {
                    source: MessageSource::Pipeline,
                    old,
                    new,
                    pending: if new == target { State::VoidPending } else { target },
                });
            }
        }

        if left_playing {
            self.set_ready_for_capture(false);
        }
        if reached_playing {
            self.set_ready_for_capture(true);
            self.push_viewfinder_frame();
        }
        StateChange::Success
    }

    fn state(&self) -> (State, State) {
        let st = self.inner.state.lock();
        (st.current, State::VoidPending)
    }

    fn bus(&self) -> Bus {
        self.inner.bus.clone()
    }
}

impl CameraBin for SimulatedCameraBin {
    fn set_viewfinder_sink(&self, sink: VideoSink) {
        sink.set_bus(Some(self.inner.bus.clone()));
        self.inner.state.lock().sink = Some(sink);
    }

    fn set_video_source(&self, device: &CameraDevice) -> Result<(), MediaError> {
        if device.factory().is_empty() {
            return Err(MediaError::NotSupported(format!(
                "no source factory for device {}",
                device.node()
            )));
        }
        self.inner.state.lock().source = Some((device.factory().to_string(), device.node().to_string()));
        Ok(())
    }

    fn set_capture_caps(&self, width: u32, height: u32) {
        self.inner.state.lock().capture_caps = Some((width, height));
    }

    fn is_ready_for_capture(&self) -> bool {
        self.inner.state.lock().ready_for_capture
    }

    fn set_mode(&self, mode: CaptureMode) {
        self.inner.state.lock().mode = mode;
    }

    fn set_location(&self, location: Option<&str>) {
        self.inner.state.lock().location = location.map(str::to_string);
    }

    fn start_capture(&self) {
        let mode = {
            let mut st = self.inner.state.lock();
            if st.current != State::Playing || !st.ready_for_capture {
                tracing::warn!(target: "immersive_media_bridge::camera", "capture started while not ready");
                return;
            }
            let entry = (st.mode, st.location.clone());
            st.captures.push(entry);
            if st.mode == CaptureMode::Video {
                st.recording = true;
            }
            st.mode
        };

        self.set_ready_for_capture(false);
        if mode == CaptureMode::Image {
            let weak: Weak<CameraBinInner> = Arc::downgrade(&self.inner);
            self.inner.ctx.invoke(move || {
                if let Some(inner) = weak.upgrade() {
                    SimulatedCameraBin { inner }.finish_image_capture();
                }
            });
        }
    }

    fn stop_capture(&self) {
        let was_recording = std::mem::replace(&mut self.inner.state.lock().recording, false);
        if was_recording {
            self.post_element(ElementMessage::VideoDone);
            self.set_ready_for_capture(true);
        }
    }

    fn set_post_previews(&self, post: bool) {
        self.inner.state.lock().post_previews = post;
    }

    fn set_preview_caps(&self, width: u32, height: u32) {
        self.inner.state.lock().preview_caps = (width, height);
    }

    fn set_video_profile(&self, profile: &EncodingProfile) {
        self.inner.state.lock().video_profile = Some(profile.clone());
    }

    fn set_image_profile(&self, profile: &EncodingProfile) {
        self.inner.state.lock().image_profile = Some(profile.clone());
    }

    fn set_valve_drop(&self, drop: bool) {
        let mut st = self.inner.state.lock();
        st.valve_drop = drop;
        st.valve_log.push(drop);
    }

    fn unlink_custom_filter(&self) {
        let mut st = self.inner.state.lock();
        st.custom_filter = None;
        st.filter_state = State::Null;
        st.linked = false;
    }

    fn unlink_default(&self) {
        self.inner.state.lock().linked = false;
    }

    fn link_custom_filter(&self, filter: &FilterElement) -> bool {
        let mut st = self.inner.state.lock();
        if !st.valve_drop {
            tracing::warn!(target: "immersive_media_bridge::camera", "relinking with the valve open");
        }
        if st.rejected_filters.contains(filter.name()) {
            return false;
        }
        st.custom_filter = Some(filter.clone());
        st.linked = true;
        true
    }

    fn link_default(&self) -> bool {
        let mut st = self.inner.state.lock();
        st.custom_filter = None;
        st.linked = true;
        true
    }

    fn set_filter_state(&self, state: State) {
        let mut st = self.inner.state.lock();
        if st.custom_filter.is_some() {
            st.filter_state = state;
        }
    }

    fn gamma_element(&self) -> Option<Arc<dyn TunableElement>> {
        self.inner
            .gamma
            .lock()
            .clone()
            .map(|g| g as Arc<dyn TunableElement>)
    }

    fn color_balance_element(&self) -> Option<Arc<dyn TunableElement>> {
        self.inner
            .color_balance
            .lock()
            .clone()
            .map(|c| c as Arc<dyn TunableElement>)
    }

    fn set_event_handler(&self, handler: Option<EventHandler<CameraBinEvent>>) {
        *self.inner.handler.lock() = handler;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareContext;

    fn collect_states(bus: &Bus) -> Arc<Mutex<Vec<(State, State)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.add_watch(move |msg| {
            if let BusMessage::StateChanged { old, new, .. } = msg {
                s.lock().push((*old, *new));
            }
        });
        seen
    }

    #[test]
    fn test_preroll_is_async() {
        let ctx = MainContext::with_manual_clock();
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.add_media("file:///a.mkv", MediaInfo::new(Duration::from_secs(10)));
        playbin.set_uri(Some("file:///a.mkv"));
        let states = collect_states(&playbin.bus());

        assert_eq!(playbin.set_state(State::Playing), StateChange::Async);
        assert_eq!(playbin.state(), (State::Ready, State::Playing));
        assert_eq!(playbin.query_duration(), None);

        ctx.run_pending();
        assert_eq!(playbin.state(), (State::Playing, State::VoidPending));
        assert_eq!(
            *states.lock(),
            vec![
                (State::Null, State::Ready),
                (State::Ready, State::Paused),
                (State::Paused, State::Playing)
            ]
        );
        assert_eq!(playbin.query_duration(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_live_media_reports_no_preroll() {
        let ctx = MainContext::with_manual_clock();
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.add_media("rtsp://cam/live", MediaInfo::live());
        playbin.set_uri(Some("rtsp://cam/live"));
        assert_eq!(playbin.set_state(State::Paused), StateChange::NoPreroll);
        assert_eq!(playbin.set_state(State::Playing), StateChange::Success);
    }

    #[test]
    fn test_unknown_uri_fails_once() {
        let ctx = MainContext::with_manual_clock();
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.set_uri(Some("file:///missing.mkv"));
        let errors = Arc::new(Mutex::new(0));
        let e = Arc::clone(&errors);
        playbin.bus().add_watch(move |msg| {
            if matches!(msg, BusMessage::Error { .. }) {
                *e.lock() += 1;
            }
        });
        assert_eq!(playbin.set_state(State::Paused), StateChange::Failure);
        assert_eq!(playbin.set_state(State::Paused), StateChange::Failure);
        ctx.run_pending();
        assert_eq!(*errors.lock(), 1);
    }

    #[test]
    fn test_state_request_cancels_preroll() {
        let ctx = MainContext::with_manual_clock();
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.add_media("file:///a.mkv", MediaInfo::new(Duration::from_secs(10)));
        playbin.set_uri(Some("file:///a.mkv"));
        playbin.set_state(State::Paused);
        playbin.set_state(State::Null);
        ctx.run_pending();
        assert_eq!(playbin.state(), (State::Null, State::VoidPending));
    }

    #[test]
    fn test_key_unit_seek_snaps_to_keyframe() {
        let ctx = MainContext::with_manual_clock();
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.add_media(
            "file:///a.mkv",
            MediaInfo::new(Duration::from_secs(100)).with_keyframe_interval(Duration::from_secs(2)),
        );
        playbin.set_uri(Some("file:///a.mkv"));
        assert!(!playbin.seek(Duration::from_secs(5), SeekFlags::FLUSH));
        playbin.set_state(State::Paused);
        ctx.run_pending();

        assert!(playbin.seek(Duration::from_secs(25), SeekFlags::FLUSH | SeekFlags::KEY_UNIT));
        assert_eq!(playbin.position(), Duration::from_secs(24));
        assert!(playbin.seek(Duration::from_secs(25), SeekFlags::FLUSH | SeekFlags::ACCURATE));
        assert_eq!(playbin.position(), Duration::from_secs(25));
        assert!(playbin.seek(Duration::from_secs(500), SeekFlags::FLUSH));
        assert_eq!(playbin.position(), Duration::from_secs(100));
    }

    #[test]
    fn test_eos_posted_once() {
        let ctx = MainContext::with_manual_clock();
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.add_media("file:///a.mkv", MediaInfo::new(Duration::from_secs(1)));
        playbin.set_uri(Some("file:///a.mkv"));
        playbin.set_state(State::Playing);
        ctx.run_pending();
        let eos = Arc::new(Mutex::new(0));
        let e = Arc::clone(&eos);
        playbin.bus().add_watch(move |msg| {
            if matches!(msg, BusMessage::Eos) {
                *e.lock() += 1;
            }
        });
        playbin.advance(Duration::from_millis(600));
        playbin.advance(Duration::from_millis(600));
        playbin.advance(Duration::from_millis(600));
        ctx.run_pending();
        assert_eq!(*eos.lock(), 1);
    }

    #[test]
    fn test_frames_reach_sink() {
        let ctx = MainContext::with_manual_clock();
        let sink = VideoSink::new(&ctx, Arc::new(SoftwareContext::new()));
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.add_media(
            "file:///a.mkv",
            MediaInfo::new(Duration::from_secs(10)).with_caps(VideoCaps::new(PixelFormat::I420, 8, 6)),
        );
        playbin.set_video_sink(sink.clone());
        playbin.set_uri(Some("file:///a.mkv"));
        playbin.set_state(State::Paused);
        ctx.run_pending();
        let frame = sink.frame().expect("preroll frame");
        assert_eq!((frame.width(), frame.height()), (8, 6));
        assert_eq!(sink.renderer_name(), Some("I420 shader"));
    }

    #[test]
    fn test_user_agent_only_on_http_sources() {
        let ctx = MainContext::with_manual_clock();
        let playbin = SimulatedPlaybin::new(&ctx);
        playbin.add_media("http://example.com/a.webm", MediaInfo::new(Duration::from_secs(10)));
        playbin.add_media("file:///a.webm", MediaInfo::new(Duration::from_secs(10)));

        playbin.set_uri(Some("http://example.com/a.webm"));
        playbin.set_state(State::Paused);
        assert_eq!(playbin.source_user_agent().as_deref(), Some(DEFAULT_USER_AGENT));
        assert!(playbin.set_source_user_agent("Immersive/1.0"));
        assert_eq!(playbin.source_user_agent().as_deref(), Some("Immersive/1.0"));

        playbin.set_state(State::Null);
        playbin.set_uri(Some("file:///a.webm"));
        playbin.set_state(State::Paused);
        assert!(!playbin.set_source_user_agent("Immersive/1.0"));
    }

    fn camera_device() -> CameraDevice {
        CameraDevice::new("v4l2src", "/dev/video0", "Test Camera", vec![(640, 480)])
    }

    #[test]
    fn test_camera_ready_for_capture_follows_playing() {
        let ctx = MainContext::with_manual_clock();
        let camerabin = SimulatedCameraBin::new(&ctx);
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        camerabin.set_event_handler(Some(Arc::new(move |ev: CameraBinEvent| e.lock().push(ev))));

        assert_eq!(camerabin.set_state(State::Playing), StateChange::Failure);
        camerabin.set_video_source(&camera_device()).unwrap();
        assert_eq!(camerabin.set_state(State::Playing), StateChange::Success);
        assert!(camerabin.is_ready_for_capture());
        camerabin.set_state(State::Null);
        assert!(!camerabin.is_ready_for_capture());
        assert_eq!(
            *events.lock(),
            vec![
                CameraBinEvent::ReadyForCaptureChanged(true),
                CameraBinEvent::ReadyForCaptureChanged(false)
            ]
        );
    }

    #[test]
    fn test_camera_image_capture_posts_done() {
        let ctx = MainContext::with_manual_clock();
        let camerabin = SimulatedCameraBin::new(&ctx);
        camerabin.set_video_source(&camera_device()).unwrap();
        camerabin.set_state(State::Playing);
        let done = Arc::new(Mutex::new(Vec::new()));
        let d = Arc::clone(&done);
        camerabin.bus().add_watch(move |msg| {
            if let BusMessage::Element { message, .. } = msg {
                d.lock().push(message.clone());
            }
        });

        camerabin.set_mode(CaptureMode::Image);
        camerabin.set_location(Some("shot.jpg"));
        camerabin.start_capture();
        assert!(!camerabin.is_ready_for_capture());
        ctx.run_pending();
        assert!(camerabin.is_ready_for_capture());
        assert_eq!(
            *done.lock(),
            vec![ElementMessage::ImageDone {
                filename: "shot.jpg".to_string()
            }]
        );
    }

    #[test]
    fn test_camera_filter_chain() {
        let ctx = MainContext::with_manual_clock();
        let camerabin = SimulatedCameraBin::new(&ctx);
        let filter = FilterElement::new("edgetv", Arc::new(()));
        camerabin.set_valve_drop(true);
        camerabin.unlink_default();
        assert_eq!(camerabin.filter_chain(), vec!["identity", "valve"]);
        assert!(camerabin.link_custom_filter(&filter));
        camerabin.set_valve_drop(false);
        assert_eq!(camerabin.filter_chain()[2], "edgetv");
        assert_eq!(camerabin.filter_chain().len(), 7);

        camerabin.reject_filter("broken");
        camerabin.unlink_custom_filter();
        assert!(!camerabin.link_custom_filter(&FilterElement::new("broken", Arc::new(()))));
        assert!(camerabin.link_default());
        assert_eq!(camerabin.filter_chain().len(), 6);
    }

    #[test]
    fn test_tunable_clamps() {
        let ctx = MainContext::with_manual_clock();
        let camerabin = SimulatedCameraBin::new(&ctx);
        let balance = camerabin.color_balance_element().unwrap();
        assert!(balance.set_property("contrast", 5.0));
        assert_eq!(balance.property("contrast"), Some(2.0));
        assert!(!balance.set_property("gamma", 1.0));
        assert!(camerabin.without_gamma().gamma_element().is_none());
    }
}
