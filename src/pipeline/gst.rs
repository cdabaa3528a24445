//! GStreamer-backed pipelines
//!
//! `GstPlaybin` wraps `playbin`, `GstCameraBin` wraps `camerabin` with a
//! `wrappercamerabinsrc` whose video source is our own chain:
//!
//! ```text
//! <device source> ! valve ! [custom filter] ! videoconvert ! videobalance ! gamma
//! ```
//!
//! Frames reach the `VideoSink` through an `appsink`. Bus messages are
//! translated in a sync handler and re-posted on our `Bus`, so no GLib main
//! loop is needed.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_pbutils as gst_pbutils;
use gstreamer_video as gst_video;
use parking_lot::Mutex;

use super::{
    BufferingMode, BufferingQuery, Bus, BusMessage, CameraBin, CameraBinEvent, CaptureMode, ElementMessage,
    EncodingProfile, EventHandler, FilterElement, MediaPipeline, MessageSource, PlayFlags, Playbin, PlaybinEvent,
    PreviewSample, PropertyRange, SeekFlags, State, StateChange, StreamTags, TunableElement,
};
use crate::error::MediaError;
use crate::mainloop::MainContext;
use crate::player::CameraDevice;
use crate::sink::{FlowError, VideoSink};
use crate::video::{PixelFormat, VideoBuffer, VideoCaps};

const LOG_TARGET: &str = "immersive_media_bridge::gst";

/// Initialize GStreamer. Safe to call more than once.
pub fn init() -> Result<(), MediaError> {
    gst::init().map_err(|e| MediaError::NotSupported(format!("GStreamer init failed: {e}")))
}

fn make(factory: &str) -> Result<gst::Element, MediaError> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| MediaError::NotSupported(format!("Failed to create {factory}: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONVERSIONS
// ═══════════════════════════════════════════════════════════════════════════════

fn to_gst_state(state: State) -> gst::State {
    match state {
        State::VoidPending => gst::State::VoidPending,
        State::Null => gst::State::Null,
        State::Ready => gst::State::Ready,
        State::Paused => gst::State::Paused,
        State::Playing => gst::State::Playing,
    }
}

fn from_gst_state(state: gst::State) -> State {
    match state {
        gst::State::Null => State::Null,
        gst::State::Ready => State::Ready,
        gst::State::Paused => State::Paused,
        gst::State::Playing => State::Playing,
        _ => State::VoidPending,
    }
}

fn set_element_state(element: &gst::Element, state: State) -> StateChange {
    match element.set_state(to_gst_state(state)) {
        Ok(gst::StateChangeSuccess::Success) => StateChange::Success,
        Ok(gst::StateChangeSuccess::Async) => StateChange::Async,
        Ok(gst::StateChangeSuccess::NoPreroll) => StateChange::NoPreroll,
        Err(_) => StateChange::Failure,
    }
}

fn element_state(element: &gst::Element) -> (State, State) {
    let (_, current, pending) = element.state(gst::ClockTime::ZERO);
    (from_gst_state(current), from_gst_state(pending))
}

fn from_gst_buffering_mode(mode: gst::BufferingMode) -> BufferingMode {
    match mode {
        gst::BufferingMode::Download => BufferingMode::Download,
        gst::BufferingMode::Timeshift => BufferingMode::Timeshift,
        gst::BufferingMode::Live => BufferingMode::Live,
        _ => BufferingMode::Stream,
    }
}

fn to_gst_seek_flags(flags: SeekFlags) -> gst::SeekFlags {
    let mut out = gst::SeekFlags::empty();
    if flags.contains(SeekFlags::FLUSH) {
        out |= gst::SeekFlags::FLUSH;
    }
    if flags.contains(SeekFlags::ACCURATE) {
        out |= gst::SeekFlags::ACCURATE;
    }
    if flags.contains(SeekFlags::KEY_UNIT) {
        out |= gst::SeekFlags::KEY_UNIT;
    }
    out
}

fn to_duration(time: gst::ClockTime) -> Duration {
    Duration::from_nanos(time.nseconds())
}

fn classify_error(error: &glib::Error) -> MediaError {
    let message = error.to_string();
    if let Some(kind) = error.kind::<gst::ResourceError>() {
        return match kind {
            gst::ResourceError::NotFound
            | gst::ResourceError::OpenRead
            | gst::ResourceError::OpenReadWrite
            | gst::ResourceError::Read => MediaError::IoOrUri(message),
            _ => MediaError::Decoding(message),
        };
    }
    if let Some(kind) = error.kind::<gst::StreamError>() {
        return match kind {
            gst::StreamError::Format => MediaError::NotNegotiated(message),
            gst::StreamError::CodecNotFound => MediaError::NotSupported(message),
            _ => MediaError::Decoding(message),
        };
    }
    match error.kind::<gst::CoreError>() {
        Some(gst::CoreError::Negotiation) => MediaError::NotNegotiated(message),
        Some(gst::CoreError::MissingPlugin) => MediaError::NotSupported(message),
        _ => MediaError::Decoding(message),
    }
}

fn preview_from_sample(sample: &gst::Sample) -> Option<PreviewSample> {
    let info = gst_video::VideoInfo::from_caps(sample.caps()?).ok()?;
    let map = sample.buffer()?.map_readable().ok()?;
    Some(PreviewSample {
        data: map.as_slice().to_vec(),
        width: info.width(),
        height: info.height(),
    })
}

/// Translate one GStreamer message; `None` for messages nobody watches
fn translate(msg: &gst::Message, pipeline: &gst::Object) -> Option<BusMessage> {
    let source = || match msg.src() {
        Some(src) if src == pipeline => MessageSource::Pipeline,
        Some(src) => MessageSource::Element(src.name().to_string()),
        None => MessageSource::Pipeline,
    };

    match msg.view() {
        gst::MessageView::Error(err) => Some(BusMessage::Error {
            source: source(),
            error: classify_error(&err.error()),
            debug: err.debug().map(|d| d.to_string()),
        }),
        gst::MessageView::Eos(_) => Some(BusMessage::Eos),
        gst::MessageView::Buffering(buffering) => {
            let (mode, _, _, _) = buffering.buffering_stats();
            Some(BusMessage::Buffering {
                percent: buffering.percent(),
                mode: from_gst_buffering_mode(mode),
            })
        }
        gst::MessageView::DurationChanged(_) => Some(BusMessage::DurationChanged),
        gst::MessageView::StateChanged(state) => Some(BusMessage::StateChanged {
            source: source(),
            old: from_gst_state(state.old()),
            new: from_gst_state(state.current()),
            pending: from_gst_state(state.pending()),
        }),
        gst::MessageView::AsyncDone(_) => Some(BusMessage::AsyncDone),
        gst::MessageView::Element(element) => {
            let structure = element.structure()?;
            let message = match structure.name().as_str() {
                "preview-image" => {
                    let sample = structure.get::<gst::Sample>("sample").ok()?;
                    ElementMessage::PreviewImage(preview_from_sample(&sample)?)
                }
                "image-done" => ElementMessage::ImageDone {
                    filename: structure.get::<String>("filename").unwrap_or_default(),
                },
                "video-done" => ElementMessage::VideoDone,
                _ => return None,
            };
            Some(BusMessage::Element {
                source: source(),
                message,
            })
        }
        _ => None,
    }
}

/// Forward every message of `element`'s bus to `bus` from the posting thread
fn forward_bus(element: &gst::Element, bus: &Bus) -> Result<gst::Bus, MediaError> {
    let gst_bus = element
        .bus()
        .ok_or_else(|| MediaError::NotSupported(format!("{} has no bus", element.name())))?;
    let bus = bus.clone();
    let pipeline = element.downgrade();
    gst_bus.set_sync_handler(move |_, msg| {
        if let Some(pipeline) = pipeline.upgrade() {
            if let Some(message) = translate(msg, pipeline.upcast_ref()) {
                bus.post(message);
            }
        }
        gst::BusSyncReply::Drop
    });
    Ok(gst_bus)
}

/// Flags property read as raw bits
fn flags_property(element: &gst::Element, name: &str) -> u32 {
    let value = element.property_value(name);
    glib::FlagsValue::from_value(&value)
        .map(|(_, values)| values.iter().fold(0, |acc, v| acc | v.value()))
        .unwrap_or(0)
}

fn set_flags_property(element: &gst::Element, name: &str, bits: u32) {
    let Some(pspec) = element.find_property(name) else {
        return;
    };
    match glib::FlagsClass::with_type(pspec.value_type()).and_then(|class| class.to_value(bits)) {
        Some(value) => element.set_property_from_value(name, &value),
        None => tracing::warn!(target: LOG_TARGET, property = name, bits, "cannot convert flags"),
    }
}

fn set_enum_property(element: &gst::Element, name: &str, value: i32) {
    let Some(pspec) = element.find_property(name) else {
        return;
    };
    match glib::EnumClass::with_type(pspec.value_type()).and_then(|class| class.to_value(value)) {
        Some(value) => element.set_property_from_value(name, &value),
        None => tracing::warn!(target: LOG_TARGET, property = name, value, "cannot convert enum"),
    }
}

fn has_property_of<T: glib::types::StaticType>(object: &impl IsA<glib::Object>, name: &str) -> bool {
    object
        .find_property(name)
        .is_some_and(|pspec| pspec.value_type() == T::static_type())
}

// ═══════════════════════════════════════════════════════════════════════════════
// APPSINK BRIDGE
// ═══════════════════════════════════════════════════════════════════════════════

fn sink_flow_error(err: FlowError) -> gst::FlowError {
    match err {
        FlowError::Flushing => gst::FlowError::Flushing,
        FlowError::NotNegotiated => gst::FlowError::NotNegotiated,
        FlowError::Error => gst::FlowError::Error,
    }
}

fn caps_from_info(info: &gst_video::VideoInfo) -> Option<VideoCaps> {
    let format = PixelFormat::from_caps_name(info.format().to_str())?;
    let fps = info.fps();
    let par = info.par();
    Some(
        VideoCaps::new(format, info.width(), info.height())
            .with_framerate(fps.numer().max(0) as u32, fps.denom().max(1) as u32)
            .with_pixel_aspect_ratio(par.numer().max(1) as u32, par.denom().max(1) as u32),
    )
}

/// Copy a mapped frame into the sink's plane layout
fn repack(data: &[u8], info: &gst_video::VideoInfo, caps: &VideoCaps) -> Option<Vec<u8>> {
    let planes = caps.plane_layout();
    if data.len() == caps.frame_size()
        && planes
            .iter()
            .zip(info.stride().iter().zip(info.offset()))
            .all(|(p, (&stride, &offset))| p.stride == stride as usize && p.offset == offset)
    {
        return Some(data.to_vec());
    }

    let mut out = vec![0u8; caps.frame_size()];
    for (index, plane) in planes.iter().enumerate() {
        let src_stride = *info.stride().get(index)? as usize;
        let src_offset = *info.offset().get(index)?;
        let row = plane.stride.min(src_stride);
        for y in 0..plane.height as usize {
            let src = src_offset + y * src_stride;
            let dst = plane.offset + y * plane.stride;
            out[dst..dst + row].copy_from_slice(data.get(src..src + row)?);
        }
    }
    Some(out)
}

fn push_sample(sink: &VideoSink, appsink: &gst_app::AppSink) -> Result<gst::FlowSuccess, gst::FlowError> {
    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
    let info = sample
        .caps()
        .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
        .ok_or(gst::FlowError::NotNegotiated)?;
    let caps = caps_from_info(&info).ok_or(gst::FlowError::NotNegotiated)?;
    if sink.caps() != Some(caps) {
        sink.set_caps(&caps).map_err(sink_flow_error)?;
    }

    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
    let data = repack(map.as_slice(), &info, &caps).ok_or_else(|| {
        tracing::debug!(target: LOG_TARGET, "frame smaller than its caps");
        gst::FlowError::Error
    })?;

    let mut frame = VideoBuffer::from_vec(data);
    if let Some(pts) = buffer.pts() {
        frame = frame.with_pts(to_duration(pts));
    }
    sink.render(frame).map_err(sink_flow_error)?;
    Ok(gst::FlowSuccess::Ok)
}

/// `appsink` restricted to the sink's formats, rendering into `sink`
pub fn video_sink_element(sink: &VideoSink) -> Result<gst::Element, MediaError> {
    let formats: Vec<gst_video::VideoFormat> = sink
        .supported_formats()
        .iter()
        .map(|f| gst_video::VideoFormat::from_string(f.caps_name()))
        .filter(|f| *f != gst_video::VideoFormat::Unknown)
        .collect();
    if formats.is_empty() {
        return Err(MediaError::NotNegotiated("sink supports no raw formats".into()));
    }

    let target = sink.clone();
    let appsink = gst_app::AppSink::builder()
        .caps(&gst_video::VideoCapsBuilder::new().format_list(formats).build())
        .max_buffers(2)
        .drop(true)
        .callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| push_sample(&target, appsink))
                .build(),
        )
        .build();
    Ok(appsink.upcast())
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLAYBIN
// ═══════════════════════════════════════════════════════════════════════════════

type SharedHandler<E> = Arc<Mutex<Option<EventHandler<E>>>>;

fn fire<E: Copy>(handler: &SharedHandler<E>, event: E) {
    let handler = handler.lock().clone();
    if let Some(handler) = handler {
        handler(event);
    }
}

fn stream_tags(tags: &gst::TagList, audio: bool) -> StreamTags {
    let codec = if audio {
        tags.get::<gst::tags::AudioCodec>().map(|v| v.get().to_string())
    } else {
        tags.get::<gst::tags::SubtitleCodec>().map(|v| v.get().to_string())
    };
    StreamTags {
        language_code: tags.get::<gst::tags::LanguageCode>().map(|v| v.get().to_string()),
        language_name: tags.get::<gst::tags::LanguageName>().map(|v| v.get().to_string()),
        codec,
    }
}

pub struct GstPlaybin {
    name: String,
    element: gst::Element,
    bus: Bus,
    gst_bus: gst::Bus,
    handler: SharedHandler<PlaybinEvent>,
}

impl GstPlaybin {
    pub fn new(ctx: &MainContext, name: &str) -> Result<Self, MediaError> {
        init()?;
        let element = gst::ElementFactory::make("playbin")
            .name(name)
            .build()
            .map_err(|e| MediaError::NotSupported(format!("Failed to create playbin: {e}")))?;
        let bus = Bus::new(ctx);
        let gst_bus = forward_bus(&element, &bus)?;
        let handler: SharedHandler<PlaybinEvent> = Arc::default();

        for (property, event) in [
            ("volume", PlaybinEvent::VolumeChanged),
            ("current-audio", PlaybinEvent::CurrentAudioChanged),
            ("current-text", PlaybinEvent::CurrentTextChanged),
            ("source", PlaybinEvent::SourceChanged),
        ] {
            let handler = handler.clone();
            element.connect_notify(Some(property), move |_, _| fire(&handler, event));
        }
        for (signal, event) in [
            ("audio-changed", PlaybinEvent::AudioStreamsChanged),
            ("text-changed", PlaybinEvent::TextStreamsChanged),
        ] {
            let handler = handler.clone();
            element.connect(signal, false, move |_| {
                fire(&handler, event);
                None
            });
        }
        for (signal, audio) in [("audio-tags-changed", true), ("text-tags-changed", false)] {
            let handler = handler.clone();
            element.connect(signal, false, move |values| {
                let index = values.get(1)?.get::<i32>().ok()?;
                let event = if audio {
                    PlaybinEvent::AudioTagsChanged(index)
                } else {
                    PlaybinEvent::TextTagsChanged(index)
                };
                fire(&handler, event);
                None
            });
        }

        tracing::debug!(target: LOG_TARGET, name, "playbin created");
        Ok(Self {
            name: name.to_string(),
            element,
            bus,
            gst_bus,
            handler,
        })
    }

    pub fn element(&self) -> &gst::Element {
        &self.element
    }

    fn source(&self) -> Option<gst::Element> {
        self.element.property::<Option<gst::Element>>("source")
    }

    fn tags(&self, signal: &str, index: usize, audio: bool) -> Option<StreamTags> {
        let index = i32::try_from(index).ok()?;
        let tags = self.element.emit_by_name::<Option<gst::TagList>>(signal, &[&index])?;
        Some(stream_tags(&tags, audio))
    }
}

impl Drop for GstPlaybin {
    fn drop(&mut self) {
        self.handler.lock().take();
        let _ = self.element.set_state(gst::State::Null);
        self.gst_bus.unset_sync_handler();
    }
}

impl MediaPipeline for GstPlaybin {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_state(&self, state: State) -> StateChange {
        set_element_state(&self.element, state)
    }

    fn state(&self) -> (State, State) {
        element_state(&self.element)
    }

    fn bus(&self) -> Bus {
        self.bus.clone()
    }
}

impl Playbin for GstPlaybin {
    fn uri(&self) -> Option<String> {
        self.element.property::<Option<String>>("uri")
    }

    fn set_uri(&self, uri: Option<&str>) {
        self.element.set_property("uri", uri);
    }

    fn suburi(&self) -> Option<String> {
        self.element.property::<Option<String>>("suburi")
    }

    fn set_suburi(&self, uri: Option<&str>) {
        self.element.set_property("suburi", uri);
    }

    fn set_subtitle_font(&self, font: &str) {
        self.element.set_property("subtitle-font-desc", font);
    }

    fn flags(&self) -> PlayFlags {
        PlayFlags::from_bits(flags_property(&self.element, "flags"))
    }

    fn set_flags(&self, flags: PlayFlags) {
        set_flags_property(&self.element, "flags", flags.bits());
    }

    fn volume(&self) -> f64 {
        self.element.property::<f64>("volume")
    }

    fn set_volume(&self, volume: f64) {
        self.element.set_property("volume", volume);
    }

    fn set_video_sink(&self, sink: VideoSink) {
        match video_sink_element(&sink) {
            Ok(appsink) => {
                sink.set_bus(Some(self.bus.clone()));
                self.element.set_property("video-sink", &appsink);
            }
            Err(e) => tracing::warn!(target: LOG_TARGET, "cannot attach video sink: {}", e),
        }
    }

    fn seek(&self, position: Duration, flags: SeekFlags) -> bool {
        let target = gst::ClockTime::from_nseconds(position.as_nanos() as u64);
        self.element.seek_simple(to_gst_seek_flags(flags), target).is_ok()
    }

    fn query_position(&self) -> Option<Duration> {
        self.element.query_position::<gst::ClockTime>().map(to_duration)
    }

    fn query_duration(&self) -> Option<Duration> {
        self.element.query_duration::<gst::ClockTime>().map(to_duration)
    }

    fn query_seekable(&self) -> Option<bool> {
        let mut query = gst::query::Seeking::new(gst::Format::Time);
        self.element.query(&mut query).then(|| query.result().0)
    }

    fn query_buffering(&self) -> Option<BufferingQuery> {
        let mut query = gst::query::Buffering::new(gst::Format::Percent);
        if !self.element.query(&mut query) {
            return None;
        }
        let (busy, percent) = query.percent();
        let (mode, _, _, _) = query.stats();
        let (_, _, estimated_total) = query.range();
        Some(BufferingQuery {
            mode: from_gst_buffering_mode(mode),
            busy,
            percent,
            estimated_total_ms: estimated_total,
        })
    }

    fn buffer_size(&self) -> i64 {
        self.element.property::<i32>("buffer-size") as i64
    }

    fn set_buffer_size(&self, bytes: i64) {
        let bytes = bytes.clamp(-1, i32::MAX as i64) as i32;
        self.element.set_property("buffer-size", bytes);
    }

    fn buffer_duration(&self) -> i64 {
        self.element.property::<i64>("buffer-duration")
    }

    fn set_buffer_duration(&self, nanos: i64) {
        self.element.set_property("buffer-duration", nanos.max(-1));
    }

    fn n_audio(&self) -> usize {
        self.element.property::<i32>("n-audio").max(0) as usize
    }

    fn audio_tags(&self, index: usize) -> Option<StreamTags> {
        self.tags("get-audio-tags", index, true)
    }

    fn current_audio(&self) -> i32 {
        self.element.property::<i32>("current-audio")
    }

    fn set_current_audio(&self, index: i32) {
        self.element.set_property("current-audio", index);
    }

    fn n_text(&self) -> usize {
        self.element.property::<i32>("n-text").max(0) as usize
    }

    fn text_tags(&self, index: usize) -> Option<StreamTags> {
        self.tags("get-text-tags", index, false)
    }

    fn current_text(&self) -> i32 {
        self.element.property::<i32>("current-text")
    }

    fn set_current_text(&self, index: i32) {
        self.element.set_property("current-text", index);
    }

    fn source_user_agent(&self) -> Option<String> {
        let source = self.source()?;
        if !has_property_of::<String>(&source, "user-agent") {
            return None;
        }
        source.property::<Option<String>>("user-agent")
    }

    fn set_source_user_agent(&self, user_agent: &str) -> bool {
        match self.source() {
            Some(source) if has_property_of::<String>(&source, "user-agent") => {
                source.set_property("user-agent", user_agent);
                true
            }
            _ => false,
        }
    }

    fn set_event_handler(&self, handler: Option<EventHandler<PlaybinEvent>>) {
        *self.handler.lock() = handler;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAMERABIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Double properties of one element
struct GstTunable {
    element: gst::Element,
}

impl TunableElement for GstTunable {
    fn property_range(&self, name: &str) -> Option<PropertyRange> {
        let pspec = self.element.find_property(name)?;
        let pspec = pspec.downcast_ref::<glib::ParamSpecDouble>()?;
        Some(PropertyRange {
            min: pspec.minimum(),
            max: pspec.maximum(),
            default: pspec.default_value(),
        })
    }

    fn property(&self, name: &str) -> Option<f64> {
        has_property_of::<f64>(&self.element, name).then(|| self.element.property::<f64>(name))
    }

    fn set_property(&self, name: &str, value: f64) -> bool {
        if !has_property_of::<f64>(&self.element, name) {
            return false;
        }
        self.element.set_property(name, value);
        true
    }
}

/// The bin handed to `wrappercamerabinsrc` as its video source
struct SourceChain {
    bin: gst::Bin,
    valve: gst::Element,
    convert: gst::Element,
    balance: Option<gst::Element>,
    gamma: Option<gst::Element>,
    source: Option<gst::Element>,
    custom: Option<gst::Element>,
}

impl SourceChain {
    fn build() -> Result<Self, MediaError> {
        let bin = gst::Bin::builder().name("camera_source_chain").build();
        let valve = make("valve")?;
        let convert = make("videoconvert")?;
        // Optional plugins; their controls report unsupported when absent
        let balance = make("videobalance").ok();
        let gamma = make("gamma").ok();

        let mut chain: Vec<&gst::Element> = vec![&convert];
        chain.extend(balance.iter());
        chain.extend(gamma.iter());
        bin.add_many([&valve])
            .and_then(|_| bin.add_many(chain.iter().copied()))
            .map_err(|e| MediaError::NotSupported(format!("Failed to add elements: {e}")))?;
        valve
            .link(&convert)
            .and_then(|_| gst::Element::link_many(chain.iter().copied()))
            .map_err(|e| MediaError::NotSupported(format!("Failed to link source chain: {e}")))?;

        let last = chain.last().copied().unwrap_or(&convert);
        let src = last
            .static_pad("src")
            .ok_or_else(|| MediaError::NotSupported("source chain has no src pad".into()))?;
        let ghost = gst::GhostPad::with_target(&src)
            .map_err(|e| MediaError::NotSupported(format!("Failed to create ghost pad: {e}")))?;
        bin.add_pad(&ghost)
            .map_err(|e| MediaError::NotSupported(format!("Failed to add ghost pad: {e}")))?;

        Ok(Self {
            bin,
            valve,
            convert,
            balance,
            gamma,
            source: None,
            custom: None,
        })
    }
}

pub struct GstCameraBin {
    name: String,
    element: gst::Element,
    chain: Mutex<SourceChain>,
    bus: Bus,
    gst_bus: gst::Bus,
    handler: SharedHandler<CameraBinEvent>,
}

impl GstCameraBin {
    pub fn new(ctx: &MainContext, name: &str) -> Result<Self, MediaError> {
        init()?;
        let element = gst::ElementFactory::make("camerabin")
            .name(name)
            .build()
            .map_err(|e| MediaError::NotSupported(format!("Failed to create camerabin: {e}")))?;
        let chain = SourceChain::build()?;
        let wrapper = make("wrappercamerabinsrc")?;
        wrapper.set_property("video-source", &chain.bin);
        element.set_property("camera-source", &wrapper);

        let bus = Bus::new(ctx);
        let gst_bus = forward_bus(&element, &bus)?;
        let handler: SharedHandler<CameraBinEvent> = Arc::default();
        {
            let handler = handler.clone();
            element.connect_notify(Some("ready-for-capture"), move |camerabin, _| {
                let ready = camerabin.property::<bool>("ready-for-capture");
                fire(&handler, CameraBinEvent::ReadyForCaptureChanged(ready));
            });
        }

        tracing::debug!(target: LOG_TARGET, name, "camerabin created");
        Ok(Self {
            name: name.to_string(),
            element,
            chain: Mutex::new(chain),
            bus,
            gst_bus,
            handler,
        })
    }

    pub fn element(&self) -> &gst::Element {
        &self.element
    }
}

impl Drop for GstCameraBin {
    fn drop(&mut self) {
        self.handler.lock().take();
        let _ = self.element.set_state(gst::State::Null);
        self.gst_bus.unset_sync_handler();
    }
}

fn raw_caps(width: u32, height: u32) -> gst::Caps {
    gst::Caps::builder("video/x-raw")
        .field("width", width as i32)
        .field("height", height as i32)
        .build()
}

fn encoding_profile(profile: &EncodingProfile) -> Result<gst_pbutils::EncodingProfile, MediaError> {
    let caps = |s: &str| {
        gst::Caps::from_str(s).map_err(|e| MediaError::InvalidArgument(format!("bad profile caps '{s}': {e}")))
    };
    if profile.video.is_none() && profile.audio.is_none() {
        return Ok(gst_pbutils::EncodingVideoProfile::builder(&caps(&profile.container)?)
            .variable_framerate(true)
            .build()
            .upcast());
    }

    let mut builder = gst_pbutils::EncodingContainerProfile::builder(&caps(&profile.container)?);
    if let Some(video) = &profile.video {
        builder = builder.add_profile(gst_pbutils::EncodingVideoProfile::builder(&caps(video)?).build());
    }
    if let Some(audio) = &profile.audio {
        builder = builder.add_profile(gst_pbutils::EncodingAudioProfile::builder(&caps(audio)?).build());
    }
    Ok(builder.build().upcast())
}

impl MediaPipeline for GstCameraBin {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_state(&self, state: State) -> StateChange {
        set_element_state(&self.element, state)
    }

    fn state(&self) -> (State, State) {
        element_state(&self.element)
    }

    fn bus(&self) -> Bus {
        self.bus.clone()
    }
}

impl CameraBin for GstCameraBin {
    fn set_viewfinder_sink(&self, sink: VideoSink) {
        match video_sink_element(&sink) {
            Ok(appsink) => {
                sink.set_bus(Some(self.bus.clone()));
                self.element.set_property("viewfinder-sink", &appsink);
            }
            Err(e) => tracing::warn!(target: LOG_TARGET, "cannot attach viewfinder sink: {}", e),
        }
    }

    fn set_video_source(&self, device: &CameraDevice) -> Result<(), MediaError> {
        if device.factory().is_empty() {
            return Err(MediaError::NotSupported(format!(
                "no source factory for device {}",
                device.node()
            )));
        }
        let source = make(device.factory())?;
        if has_property_of::<String>(&source, "device") {
            source.set_property("device", device.node());
        }

        let mut chain = self.chain.lock();
        if let Some(old) = chain.source.take() {
            let _ = old.set_state(gst::State::Null);
            let _ = chain.bin.remove(&old);
        }
        chain
            .bin
            .add(&source)
            .map_err(|e| MediaError::NotSupported(format!("Failed to add {}: {e}", device.factory())))?;
        if let Err(e) = source.link(&chain.valve) {
            let _ = chain.bin.remove(&source);
            return Err(MediaError::NotSupported(format!("Failed to link {}: {e}", device.factory())));
        }
        let _ = source.sync_state_with_parent();
        tracing::debug!(target: LOG_TARGET, device = device.node(), factory = device.factory(), "video source set");
        chain.source = Some(source);
        Ok(())
    }

    fn set_capture_caps(&self, width: u32, height: u32) {
        let caps = raw_caps(width, height);
        for property in ["video-capture-caps", "image-capture-caps", "viewfinder-caps"] {
            self.element.set_property(property, &caps);
        }
    }

    fn is_ready_for_capture(&self) -> bool {
        self.element.property::<bool>("ready-for-capture")
    }

    fn set_mode(&self, mode: CaptureMode) {
        set_enum_property(&self.element, "mode", mode as i32);
    }

    fn set_location(&self, location: Option<&str>) {
        self.element.set_property("location", location);
    }

    fn start_capture(&self) {
        self.element.emit_by_name::<()>("start-capture", &[]);
    }

    fn stop_capture(&self) {
        self.element.emit_by_name::<()>("stop-capture", &[]);
    }

    fn set_post_previews(&self, post: bool) {
        self.element.set_property("post-previews", post);
    }

    fn set_preview_caps(&self, width: u32, height: u32) {
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", width as i32)
            .field("height", height as i32)
            .build();
        self.element.set_property("preview-caps", &caps);
    }

    fn set_video_profile(&self, profile: &EncodingProfile) {
        match encoding_profile(profile) {
            Ok(p) => self.element.set_property("video-profile", &p),
            Err(e) => tracing::warn!(target: LOG_TARGET, "video profile rejected: {}", e),
        }
    }

    fn set_image_profile(&self, profile: &EncodingProfile) {
        match encoding_profile(profile) {
            Ok(p) => self.element.set_property("image-profile", &p),
            Err(e) => tracing::warn!(target: LOG_TARGET, "image profile rejected: {}", e),
        }
    }

    fn set_valve_drop(&self, drop: bool) {
        self.chain.lock().valve.set_property("drop", drop);
    }

    fn unlink_custom_filter(&self) {
        let mut chain = self.chain.lock();
        if let Some(custom) = chain.custom.take() {
            chain.valve.unlink(&custom);
            custom.unlink(&chain.convert);
            let _ = custom.set_state(gst::State::Null);
            let _ = chain.bin.remove(&custom);
        }
    }

    fn unlink_default(&self) {
        let chain = self.chain.lock();
        chain.valve.unlink(&chain.convert);
    }

    fn link_custom_filter(&self, filter: &FilterElement) -> bool {
        let Some(element) = filter.element::<gst::Element>() else {
            tracing::warn!(target: LOG_TARGET, filter = filter.name(), "filter is not a GStreamer element");
            return false;
        };
        let mut chain = self.chain.lock();
        if chain.bin.add(element).is_err() {
            return false;
        }
        if gst::Element::link_many([&chain.valve, element, &chain.convert]).is_err() {
            chain.valve.unlink(element);
            let _ = chain.bin.remove(element);
            return false;
        }
        chain.custom = Some(element.clone());
        true
    }

    fn link_default(&self) -> bool {
        let chain = self.chain.lock();
        chain.valve.link(&chain.convert).is_ok()
    }

    fn set_filter_state(&self, state: State) {
        if let Some(custom) = &self.chain.lock().custom {
            let _ = custom.set_state(to_gst_state(state));
        }
    }

    fn gamma_element(&self) -> Option<Arc<dyn TunableElement>> {
        let element = self.chain.lock().gamma.clone()?;
        Some(Arc::new(GstTunable { element }))
    }

    fn color_balance_element(&self) -> Option<Arc<dyn TunableElement>> {
        let element = self.chain.lock().balance.clone()?;
        Some(Arc::new(GstTunable { element }))
    }

    fn set_event_handler(&self, handler: Option<EventHandler<CameraBinEvent>>) {
        *self.handler.lock() = handler;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        for state in [State::Null, State::Ready, State::Paused, State::Playing] {
            assert_eq!(from_gst_state(to_gst_state(state)), state);
        }
        assert_eq!(from_gst_state(gst::State::VoidPending), State::VoidPending);
    }

    #[test]
    fn test_seek_flags() {
        let flags = to_gst_seek_flags(SeekFlags::FLUSH | SeekFlags::KEY_UNIT);
        assert!(flags.contains(gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT));
        assert!(!flags.contains(gst::SeekFlags::ACCURATE));
    }

    #[test]
    fn test_repack_removes_source_padding() {
        init().unwrap();
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgba, 2, 2)
            .stride(&[12])
            .offset(&[0])
            .build()
            .unwrap();
        let caps = caps_from_info(&info).unwrap();
        let data: Vec<u8> = (0..24).collect();
        let packed = repack(&data, &info, &caps).unwrap();
        assert_eq!(packed.len(), 16);
        assert_eq!(&packed[..8], &data[..8]);
        assert_eq!(&packed[8..], &data[12..20]);
    }
}
