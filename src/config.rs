//! Player configuration files
//!
//! Playback and camera options are read from small XML documents, one
//! element per option:
//!
//! ```xml
//! <playback>
//!     <uri>file:///media/intro.mkv</uri>
//!     <seekFlags>accurate</seekFlags>
//!     <audioVolume>0.8</audioVolume>
//! </playback>
//! ```
//!
//! Configuration is input only; players never write it back.

use std::fs;
use std::path::Path;

use quick_xml::de::from_str;
use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::pipeline::{BufferingMode, EncodingProfile};
use crate::player::SeekMode;

/// Options understood by `PlaybackPlayer::apply_config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename = "playback")]
pub struct PlaybackConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(rename = "subtitleUri", default, skip_serializing_if = "Option::is_none")]
    pub subtitle_uri: Option<String>,

    #[serde(rename = "subtitleFontName", default, skip_serializing_if = "Option::is_none")]
    pub subtitle_font_name: Option<String>,

    #[serde(rename = "userAgent", default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// `none` (keyframe) or `accurate`
    #[serde(rename = "seekFlags", default)]
    pub seek_flags: SeekMode,

    /// `stream` or `download`
    #[serde(rename = "bufferingMode", default)]
    pub buffering_mode: BufferingMode,

    /// Bytes, -1 for the pipeline default
    #[serde(rename = "bufferSize", default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<i64>,

    /// Nanoseconds, -1 for the pipeline default
    #[serde(rename = "bufferDuration", default, skip_serializing_if = "Option::is_none")]
    pub buffer_duration: Option<i64>,

    #[serde(rename = "audioStream", default, skip_serializing_if = "Option::is_none")]
    pub audio_stream: Option<i32>,

    #[serde(rename = "subtitleTrack", default, skip_serializing_if = "Option::is_none")]
    pub subtitle_track: Option<i32>,

    /// Cubic volume, 0..=1
    #[serde(rename = "audioVolume", default, skip_serializing_if = "Option::is_none")]
    pub audio_volume: Option<f64>,
}

impl PlaybackConfig {
    pub fn from_xml_str(xml: &str) -> Result<Self, MediaError> {
        let mut config: Self = from_str(xml)?;
        config.sanitize();
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MediaError> {
        let contents = fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "loading playback config");
        Self::from_xml_str(&contents)
    }

    fn sanitize(&mut self) {
        if let Some(volume) = self.audio_volume.as_mut() {
            *volume = volume.clamp(0.0, 1.0);
        }
        // Only stream and download buffering can be selected
        if !matches!(self.buffering_mode, BufferingMode::Stream | BufferingMode::Download) {
            tracing::warn!(mode = ?self.buffering_mode, "unsupported buffering mode, using stream");
            self.buffering_mode = BufferingMode::Stream;
        }
    }
}

/// Options understood by `CameraPlayer::apply_config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename = "camera")]
pub struct CameraConfig {
    /// Device node, e.g. `/dev/video0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturation: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hue: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,

    #[serde(rename = "videoProfile", default, skip_serializing_if = "Option::is_none")]
    pub video_profile: Option<EncodingProfile>,

    #[serde(rename = "photoProfile", default, skip_serializing_if = "Option::is_none")]
    pub photo_profile: Option<EncodingProfile>,
}

impl CameraConfig {
    pub fn from_xml_str(xml: &str) -> Result<Self, MediaError> {
        Ok(from_str(xml)?)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MediaError> {
        let contents = fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "loading camera config");
        Self::from_xml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_defaults() {
        let config = PlaybackConfig::from_xml_str("<playback></playback>").unwrap();
        assert_eq!(config, PlaybackConfig::default());
        assert_eq!(config.seek_flags, SeekMode::Fast);
        assert_eq!(config.buffering_mode, BufferingMode::Stream);
    }

    #[test]
    fn test_playback_options() {
        let config = PlaybackConfig::from_xml_str(
            r#"<playback>
                <uri>http://example.com/stream.webm</uri>
                <userAgent>Immersive/1.0</userAgent>
                <seekFlags>none</seekFlags>
                <bufferDuration>5000000000</bufferDuration>
                <subtitleTrack>-1</subtitleTrack>
                <audioVolume>1.5</audioVolume>
            </playback>"#,
        )
        .unwrap();
        assert_eq!(config.uri.as_deref(), Some("http://example.com/stream.webm"));
        assert_eq!(config.user_agent.as_deref(), Some("Immersive/1.0"));
        assert_eq!(config.seek_flags, SeekMode::Fast);
        assert_eq!(config.buffer_duration, Some(5_000_000_000));
        assert_eq!(config.subtitle_track, Some(-1));
        assert_eq!(config.audio_volume, Some(1.0));
    }

    #[test]
    fn test_fast_alias_accepted() {
        let config = PlaybackConfig::from_xml_str("<playback><seekFlags>fast</seekFlags></playback>").unwrap();
        assert_eq!(config.seek_flags, SeekMode::Fast);
    }

    #[test]
    fn test_malformed_config_is_config_error() {
        let err = PlaybackConfig::from_xml_str("<playback><audioVolume>loud</audioVolume></playback>").unwrap_err();
        assert!(matches!(err, MediaError::Config(_)));
    }

    #[test]
    fn test_camera_config() {
        let config = CameraConfig::from_xml_str(
            r#"<camera>
                <device>/dev/video2</device>
                <brightness>0.25</brightness>
                <gamma>1.4</gamma>
                <videoProfile>
                    <container>video/webm</container>
                    <video>video/x-vp8</video>
                </videoProfile>
            </camera>"#,
        )
        .unwrap();
        assert_eq!(config.device.as_deref(), Some("/dev/video2"));
        assert_eq!(config.brightness, Some(0.25));
        assert_eq!(config.gamma, Some(1.4));
        assert_eq!(config.contrast, None);
        let profile = config.video_profile.unwrap();
        assert_eq!(profile.container, "video/webm");
        assert_eq!(profile.video.as_deref(), Some("video/x-vp8"));
        assert_eq!(profile.audio, None);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = CameraConfig::load("/nonexistent/camera.xml").unwrap_err();
        assert!(matches!(err, MediaError::Io(_)));
    }
}
