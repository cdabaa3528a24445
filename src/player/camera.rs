//! Camera player
//!
//! Viewfinder frames from a `CameraBin` are relayed like any other player's
//! frames. On top of that the camera takes photos (saved to a file or
//! delivered as an `RgbImage`), records video, and exposes the gamma and
//! colour balance elements of its filter chain:
//!
//! ```text
//!   source ─► identity ─► valve ─► [custom filter] ─► gamma ─► convert ─► balance ─► convert
//! ```
//!
//! The valve drops buffers while the custom filter segment is relinked.

use std::sync::{Arc, Weak};

use image::RgbImage;
use parking_lot::Mutex;

use super::camera_device::CameraDevice;
use super::camera_manager::CameraManager;
use super::{Player, PlayerCore, PlayerProperty, PlayerSignals};
use crate::config::CameraConfig;
use crate::error::MediaError;
use crate::mainloop::MainContext;
use crate::pipeline::{
    BusMessage, CameraBin, CameraBinEvent, CaptureMode, ElementMessage, EncodingProfile, FilterElement,
    MessageSource, PipelineHandle, PreviewSample, State, StateChange, TunableElement,
};
use crate::signal::{HandlerId, Signal};
use crate::sink::VideoSink;
use crate::video::Frame;

const LOG_TARGET: &str = "immersive_media_bridge::camera";

/// Preview size used when the device reports no capture resolution
const DEFAULT_PREVIEW_SIZE: (u32, u32) = (640, 480);

/// Colour balance channels of the camera's filter chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorBalanceProperty {
    Brightness,
    Contrast,
    Saturation,
    Hue,
}

impl ColorBalanceProperty {
    pub const ALL: [ColorBalanceProperty; 4] = [
        ColorBalanceProperty::Brightness,
        ColorBalanceProperty::Contrast,
        ColorBalanceProperty::Saturation,
        ColorBalanceProperty::Hue,
    ];

    /// Element property name
    pub fn name(self) -> &'static str {
        match self {
            ColorBalanceProperty::Brightness => "brightness",
            ColorBalanceProperty::Contrast => "contrast",
            ColorBalanceProperty::Saturation => "saturation",
            ColorBalanceProperty::Hue => "hue",
        }
    }
}

/// Camera-only signals
#[derive(Default)]
pub struct CameraSignals {
    /// Preview of a photo taken with `take_photo_pixbuf`
    pub photo_taken: Signal<RgbImage>,
    /// The file requested by `take_photo` was written
    pub photo_saved: Signal<()>,
    pub video_saved: Signal<()>,
    pub ready_for_capture: Signal<bool>,
}

struct CameraState {
    device: Option<CameraDevice>,
    device_handler: Option<HandlerId>,
    is_idle: bool,
    is_recording: bool,
    /// Target of the pending `take_photo`
    photo_filename: Option<String>,
    custom_filter: Option<FilterElement>,
}

struct CameraInner {
    core: Arc<PlayerCore>,
    camerabin: Arc<dyn CameraBin>,
    handle: PipelineHandle,
    state: Mutex<CameraState>,
    signals: CameraSignals,
    bus_watch: Mutex<Option<HandlerId>>,
}

/// Camera viewfinder and capture. Cheap to clone.
#[derive(Clone)]
pub struct CameraPlayer {
    inner: Arc<CameraInner>,
}

impl CameraPlayer {
    /// Build a camera on `camerabin`, selecting the first probed device
    pub fn with_camerabin<C>(ctx: &MainContext, sink: VideoSink, camerabin: Arc<C>) -> Result<Self, MediaError>
    where
        C: CameraBin + 'static,
    {
        Self::with_manager(ctx, sink, camerabin, CameraManager::default())
    }

    /// Build a camera selecting the first device of `manager`
    pub fn with_manager<C>(
        ctx: &MainContext,
        sink: VideoSink,
        camerabin: Arc<C>,
        manager: &CameraManager,
    ) -> Result<Self, MediaError>
    where
        C: CameraBin + 'static,
    {
        let core = PlayerCore::new(ctx, sink.clone())?;
        let handle: PipelineHandle = camerabin.clone();
        let camerabin: Arc<dyn CameraBin> = camerabin;

        camerabin.set_viewfinder_sink(sink);
        camerabin.set_video_profile(&EncodingProfile::ogg_theora_vorbis());

        let inner = Arc::new(CameraInner {
            core,
            camerabin,
            handle,
            state: Mutex::new(CameraState {
                device: None,
                device_handler: None,
                is_idle: true,
                is_recording: false,
                photo_filename: None,
                custom_filter: None,
            }),
            signals: CameraSignals::default(),
            bus_watch: Mutex::new(None),
        });
        CameraInner::connect(&inner);
        let player = Self { inner };

        if let Some(device) = manager.first_device() {
            if !player.set_camera_device(&device) {
                return Err(MediaError::NotSupported(format!(
                    "unable to select capture device {}",
                    device.node()
                )));
            }
        } else {
            tracing::warn!(target: LOG_TARGET, "no camera devices available");
        }

        tracing::debug!(target: LOG_TARGET, pipeline = player.inner.camerabin.name(), "camera player created");
        Ok(player)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DEVICE
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn camera_device(&self) -> Option<CameraDevice> {
        self.inner.state.lock().device.clone()
    }

    /// Switch capture device; playback resumes if it was running
    pub fn set_camera_device(&self, device: &CameraDevice) -> bool {
        let inner = &self.inner;
        if inner.state.lock().is_recording {
            self.stop_video_recording();
        }

        let was_playing = self.is_playing();
        if was_playing {
            inner.camerabin.set_state(State::Null);
        }

        if let Err(e) = inner.camerabin.set_video_source(device) {
            tracing::warn!(target: LOG_TARGET, node = device.node(), factory = device.factory(), "unable to create device source: {}", e);
            return false;
        }
        tracing::info!(target: LOG_TARGET, node = device.node(), name = device.name(), "active camera device");

        let weak: Weak<CameraInner> = Arc::downgrade(inner);
        let watched = device.clone();
        let handler = device.capture_resolution_changed().connect(move |&(width, height)| {
            if let Some(inner) = weak.upgrade() {
                inner.on_capture_resolution_changed(&watched, width, height);
            }
        });

        let previous = {
            let mut st = inner.state.lock();
            let previous = st.device.take().zip(st.device_handler.take());
            st.device = Some(device.clone());
            st.device_handler = Some(handler);
            previous
        };
        if let Some((old, id)) = previous {
            old.capture_resolution_changed().disconnect(id);
        }

        if let Some((width, height)) = device.capture_resolution() {
            inner.apply_capture_caps(width, height);
        }
        inner.core.notify(PlayerProperty::Device);

        if was_playing {
            inner.camerabin.set_state(State::Playing);
        }
        true
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CAPTURE
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn is_ready_for_capture(&self) -> bool {
        self.inner.camerabin.is_ready_for_capture()
    }

    pub fn is_recording_video(&self) -> bool {
        self.inner.state.lock().is_recording
    }

    fn can_capture(&self) -> bool {
        if self.inner.state.lock().is_recording {
            tracing::debug!(target: LOG_TARGET, "capture refused while recording");
            return false;
        }
        self.is_playing() && self.is_ready_for_capture()
    }

    /// Save a photo to `filename`; `photo_saved` follows once written
    pub fn take_photo(&self, filename: &str) -> bool {
        if !self.can_capture() {
            return false;
        }
        self.inner.state.lock().photo_filename = Some(filename.to_string());
        tracing::info!(target: LOG_TARGET, filename, "taking photo");

        let camerabin = &self.inner.camerabin;
        camerabin.set_location(Some(filename));
        camerabin.set_mode(CaptureMode::Image);
        camerabin.start_capture();
        true
    }

    /// Take a photo delivered through `photo_taken` instead of a file
    pub fn take_photo_pixbuf(&self) -> bool {
        if !self.can_capture() {
            return false;
        }
        self.inner.state.lock().photo_filename = None;

        let (width, height) = self
            .camera_device()
            .and_then(|d| d.capture_resolution())
            .unwrap_or(DEFAULT_PREVIEW_SIZE);
        tracing::info!(target: LOG_TARGET, width, height, "taking preview photo");

        let camerabin = &self.inner.camerabin;
        camerabin.set_post_previews(true);
        camerabin.set_preview_caps(width, height);
        camerabin.set_location(None);
        camerabin.set_mode(CaptureMode::Image);
        camerabin.start_capture();
        true
    }

    /// Record to `filename` until `stop_video_recording`
    pub fn start_video_recording(&self, filename: &str) -> bool {
        if self.inner.state.lock().is_recording {
            return true;
        }
        if !self.is_playing() || !self.is_ready_for_capture() {
            return false;
        }
        tracing::info!(target: LOG_TARGET, filename, "starting video recording");

        let camerabin = &self.inner.camerabin;
        camerabin.set_mode(CaptureMode::Video);
        camerabin.set_location(Some(filename));
        camerabin.start_capture();
        self.inner.state.lock().is_recording = true;
        true
    }

    pub fn stop_video_recording(&self) {
        if !self.inner.state.lock().is_recording || !self.is_playing() {
            return;
        }

        let camerabin = &self.inner.camerabin;
        if camerabin.state().0 == State::Playing {
            tracing::info!(target: LOG_TARGET, "stopping video recording");
            camerabin.stop_capture();
        } else {
            tracing::warn!(target: LOG_TARGET, "cannot cleanly shut down the recording pipeline, forcing");
            camerabin.set_state(State::Null);
            camerabin.set_state(State::Playing);
            self.inner.state.lock().is_recording = false;
        }
    }

    pub fn set_video_profile(&self, profile: &EncodingProfile) {
        self.inner.camerabin.set_video_profile(profile);
    }

    pub fn set_photo_profile(&self, profile: &EncodingProfile) {
        self.inner.camerabin.set_image_profile(profile);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // FILTER
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn filter(&self) -> Option<FilterElement> {
        self.inner.state.lock().custom_filter.clone()
    }

    /// Insert `filter` before the gamma element, replacing the current one.
    /// `None` restores the default chain. On a link failure the default
    /// chain is restored and false returned.
    pub fn set_filter(&self, filter: Option<FilterElement>) -> bool {
        let inner = &self.inner;
        let current = inner.state.lock().custom_filter.take();
        if current.is_none() && filter.is_none() {
            return true;
        }

        let camerabin = &inner.camerabin;
        camerabin.set_valve_drop(true);

        if current.is_some() {
            camerabin.unlink_custom_filter();
        } else {
            camerabin.unlink_default();
        }

        let ok = match filter {
            Some(filter) => {
                if camerabin.link_custom_filter(&filter) {
                    tracing::debug!(target: LOG_TARGET, filter = filter.name(), "filter inserted");
                    inner.state.lock().custom_filter = Some(filter);
                    if self.is_playing() {
                        camerabin.set_filter_state(State::Playing);
                    }
                    true
                } else {
                    tracing::warn!(target: LOG_TARGET, filter = filter.name(), "unable to link filter, restoring default chain");
                    camerabin.link_default();
                    false
                }
            }
            None => camerabin.link_default(),
        };

        camerabin.set_valve_drop(false);
        inner.core.notify(PlayerProperty::Filter);
        ok
    }

    pub fn remove_filter(&self) -> bool {
        self.set_filter(None)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // GAMMA AND COLOUR BALANCE
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn supports_gamma_correction(&self) -> bool {
        self.inner.camerabin.gamma_element().is_some()
    }

    /// (min, max, default)
    pub fn gamma_range(&self) -> Option<(f64, f64, f64)> {
        tunable_range(self.inner.camerabin.gamma_element(), "gamma")
    }

    pub fn gamma(&self) -> Option<f64> {
        self.inner.camerabin.gamma_element()?.property("gamma")
    }

    /// Clamped into the element's range; false without a gamma element
    pub fn set_gamma(&self, value: f64) -> bool {
        set_tunable(self.inner.camerabin.gamma_element(), "gamma", value)
    }

    pub fn supports_color_balance(&self) -> bool {
        self.inner.camerabin.color_balance_element().is_some()
    }

    pub fn color_balance_property_range(&self, property: ColorBalanceProperty) -> Option<(f64, f64, f64)> {
        tunable_range(self.inner.camerabin.color_balance_element(), property.name())
    }

    pub fn color_balance_property(&self, property: ColorBalanceProperty) -> Option<f64> {
        self.inner
            .camerabin
            .color_balance_element()?
            .property(property.name())
    }

    pub fn set_color_balance_property(&self, property: ColorBalanceProperty, value: f64) -> bool {
        set_tunable(self.inner.camerabin.color_balance_element(), property.name(), value)
    }

    pub fn brightness_range(&self) -> Option<(f64, f64, f64)> {
        self.color_balance_property_range(ColorBalanceProperty::Brightness)
    }

    pub fn brightness(&self) -> Option<f64> {
        self.color_balance_property(ColorBalanceProperty::Brightness)
    }

    pub fn set_brightness(&self, value: f64) -> bool {
        self.set_color_balance_property(ColorBalanceProperty::Brightness, value)
    }

    pub fn contrast_range(&self) -> Option<(f64, f64, f64)> {
        self.color_balance_property_range(ColorBalanceProperty::Contrast)
    }

    pub fn contrast(&self) -> Option<f64> {
        self.color_balance_property(ColorBalanceProperty::Contrast)
    }

    pub fn set_contrast(&self, value: f64) -> bool {
        self.set_color_balance_property(ColorBalanceProperty::Contrast, value)
    }

    pub fn saturation_range(&self) -> Option<(f64, f64, f64)> {
        self.color_balance_property_range(ColorBalanceProperty::Saturation)
    }

    pub fn saturation(&self) -> Option<f64> {
        self.color_balance_property(ColorBalanceProperty::Saturation)
    }

    pub fn set_saturation(&self, value: f64) -> bool {
        self.set_color_balance_property(ColorBalanceProperty::Saturation, value)
    }

    pub fn hue_range(&self) -> Option<(f64, f64, f64)> {
        self.color_balance_property_range(ColorBalanceProperty::Hue)
    }

    pub fn hue(&self) -> Option<f64> {
        self.color_balance_property(ColorBalanceProperty::Hue)
    }

    pub fn set_hue(&self, value: f64) -> bool {
        self.set_color_balance_property(ColorBalanceProperty::Hue, value)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // MISC
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn camera_signals(&self) -> &CameraSignals {
        &self.inner.signals
    }

    /// Push a parsed configuration, resolving the device through the
    /// process-wide manager
    pub fn apply_config(&self, config: &CameraConfig) {
        self.apply_config_with(config, CameraManager::default());
    }

    pub fn apply_config_with(&self, config: &CameraConfig, manager: &CameraManager) {
        if let Some(node) = &config.device {
            match manager.find_by_node(node) {
                Some(device) => {
                    if !self.set_camera_device(&device) {
                        tracing::warn!(target: LOG_TARGET, node = %node, "config: unable to select device");
                    }
                }
                None => tracing::warn!(target: LOG_TARGET, node = %node, "config: unknown camera device"),
            }
        }

        let balance = [
            (ColorBalanceProperty::Brightness, config.brightness),
            (ColorBalanceProperty::Contrast, config.contrast),
            (ColorBalanceProperty::Saturation, config.saturation),
            (ColorBalanceProperty::Hue, config.hue),
        ];
        for (property, value) in balance {
            if let Some(value) = value {
                if !self.set_color_balance_property(property, value) {
                    tracing::warn!(target: LOG_TARGET, property = property.name(), "config: colour balance not supported");
                }
            }
        }
        if let Some(gamma) = config.gamma {
            if !self.set_gamma(gamma) {
                tracing::warn!(target: LOG_TARGET, "config: gamma correction not supported");
            }
        }

        if let Some(profile) = &config.video_profile {
            self.set_video_profile(profile);
        }
        if let Some(profile) = &config.photo_profile {
            self.set_photo_profile(profile);
        }
    }
}

fn tunable_range(element: Option<Arc<dyn TunableElement>>, name: &str) -> Option<(f64, f64, f64)> {
    element?
        .property_range(name)
        .map(|range| (range.min, range.max, range.default))
}

fn set_tunable(element: Option<Arc<dyn TunableElement>>, name: &str, value: f64) -> bool {
    let Some(element) = element else {
        return false;
    };
    match element.property_range(name) {
        Some(range) => element.set_property(name, range.clamp(value)),
        None => false,
    }
}

impl Player for CameraPlayer {
    fn frame(&self) -> Frame {
        self.inner.core.frame()
    }

    fn pipeline(&self) -> PipelineHandle {
        Arc::clone(&self.inner.handle)
    }

    fn video_sink(&self) -> VideoSink {
        self.inner.core.sink().clone()
    }

    /// Pending state when a change is in flight, else the current state
    fn is_playing(&self) -> bool {
        let (current, pending) = self.inner.camerabin.state();
        if pending != State::VoidPending {
            pending == State::Playing
        } else {
            current == State::Playing
        }
    }

    fn set_playing(&self, playing: bool) {
        let target = if playing { State::Playing } else { State::Null };
        if !playing {
            // Finalize the file while the pipeline can still flush it
            self.stop_video_recording();
        }
        if self.inner.camerabin.set_state(target) == StateChange::Failure {
            tracing::warn!(target: LOG_TARGET, state = %target, "camera state change failed");
        }
        if !playing {
            self.inner.state.lock().is_recording = false;
        }
        self.inner.core.notify(PlayerProperty::Playing);
    }

    fn audio_volume(&self) -> f64 {
        0.0
    }

    fn set_audio_volume(&self, _volume: f64) {}

    fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle
    }

    fn signals(&self) -> &PlayerSignals {
        self.inner.core.signals()
    }
}

impl CameraInner {
    fn connect(this: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let id = this.camerabin.bus().add_watch(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_bus_message(message);
            }
        });
        *this.bus_watch.lock() = Some(id);

        let weak: Weak<Self> = Arc::downgrade(this);
        let ctx = this.core.main_context().clone();
        this.camerabin.set_event_handler(Some(Arc::new(move |event: CameraBinEvent| {
            let weak = weak.clone();
            ctx.invoke(move || {
                if let Some(inner) = weak.upgrade() {
                    match event {
                        CameraBinEvent::ReadyForCaptureChanged(ready) => inner.signals.ready_for_capture.emit(&ready),
                    }
                }
            });
        })));
    }

    fn apply_capture_caps(&self, width: u32, height: u32) {
        tracing::debug!(target: LOG_TARGET, width, height, "capture caps");
        self.camerabin.set_capture_caps(width, height);
    }

    fn on_capture_resolution_changed(&self, device: &CameraDevice, width: u32, height: u32) {
        let current = self
            .state
            .lock()
            .device
            .as_ref()
            .is_some_and(|d| d.ptr_eq(device));
        if current {
            self.apply_capture_caps(width, height);
        }
    }

    fn set_idle(&self, idle: bool) {
        let changed = {
            let mut st = self.state.lock();
            std::mem::replace(&mut st.is_idle, idle) != idle
        };
        if changed {
            self.core.notify(PlayerProperty::Idle);
        }
    }

    fn on_bus_message(&self, message: &BusMessage) {
        match message {
            BusMessage::Error { error, source, .. } => {
                tracing::warn!(target: LOG_TARGET, ?source, "camera error: {}", error);
                self.set_idle(true);
            }
            BusMessage::StateChanged {
                source: MessageSource::Pipeline,
                new,
                ..
            } => {
                if *new != State::Playing {
                    // Leaving PLAYING ends any capture in progress
                    self.state.lock().is_recording = false;
                }
                self.set_idle(*new != State::Playing);
            }
            BusMessage::Element { message, .. } => self.on_element_message(message),
            _ => {}
        }
    }

    fn on_element_message(&self, message: &ElementMessage) {
        match message {
            ElementMessage::PreviewImage(sample) => match preview_to_image(sample) {
                Some(image) => {
                    self.camerabin.set_post_previews(false);
                    self.signals.photo_taken.emit(&image);
                }
                None => tracing::warn!(
                    target: LOG_TARGET,
                    width = sample.width,
                    height = sample.height,
                    len = sample.data.len(),
                    "unusable preview sample"
                ),
            },
            ElementMessage::ImageDone { filename } => {
                let matches = self.state.lock().photo_filename.as_deref() == Some(filename.as_str());
                if matches {
                    tracing::info!(target: LOG_TARGET, %filename, "photo saved");
                    self.signals.photo_saved.emit(&());
                }
            }
            ElementMessage::VideoDone => {
                tracing::info!(target: LOG_TARGET, "video saved");
                self.state.lock().is_recording = false;
                self.signals.video_saved.emit(&());
            }
        }
    }
}

/// Packed RGB rows of `sample`, dropping row padding
fn preview_to_image(sample: &PreviewSample) -> Option<RgbImage> {
    if sample.width == 0 || sample.height == 0 {
        return None;
    }
    let stride = sample.data.len() / sample.height as usize;
    let row = sample.width as usize * 3;
    if stride < row {
        return None;
    }
    let pixels: Vec<u8> = sample
        .data
        .chunks_exact(stride)
        .take(sample.height as usize)
        .flat_map(|line| &line[..row])
        .copied()
        .collect();
    RgbImage::from_raw(sample.width, sample.height, pixels)
}

impl Drop for CameraInner {
    fn drop(&mut self) {
        let device = {
            let mut st = self.state.lock();
            st.device.take().zip(st.device_handler.take())
        };
        if let Some((device, id)) = device {
            device.capture_resolution_changed().disconnect(id);
        }
        if let Some(id) = self.bus_watch.lock().take() {
            self.camerabin.bus().remove_watch(id);
        }
        self.camerabin.set_event_handler(None);
        self.camerabin.set_state(State::Null);
    }
}
