//! Raw video caps and buffers as delivered by the decoding pipeline
//!
//! `VideoCaps` describes the negotiated stream (format, size, framerate,
//! pixel aspect ratio). `VideoBuffer` carries one decoded frame's bytes,
//! laid out as `VideoCaps::plane_layout` describes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::MediaError;
use crate::sink::pool::PooledBuffer;

/// Pixel formats the sink accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
    Ayuv,
    I420,
    Yv12,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 7] = [
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Rgba32,
        PixelFormat::Bgra32,
        PixelFormat::Ayuv,
        PixelFormat::I420,
        PixelFormat::Yv12,
    ];

    /// Format name used in caps strings
    pub fn caps_name(&self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB",
            PixelFormat::Bgr24 => "BGR",
            PixelFormat::Rgba32 => "RGBA",
            PixelFormat::Bgra32 => "BGRA",
            PixelFormat::Ayuv => "AYUV",
            PixelFormat::I420 => "I420",
            PixelFormat::Yv12 => "YV12",
        }
    }

    pub fn from_caps_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.caps_name() == name)
    }

    pub fn is_planar(&self) -> bool {
        matches!(self, PixelFormat::I420 | PixelFormat::Yv12)
    }

    pub fn is_yuv(&self) -> bool {
        matches!(self, PixelFormat::Ayuv | PixelFormat::I420 | PixelFormat::Yv12)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.caps_name())
    }
}

/// Positive rational number (framerate, pixel aspect ratio)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub const ONE: Fraction = Fraction { num: 1, den: 1 };

    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Fraction {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || MediaError::NotNegotiated(format!("invalid fraction '{}'", s));
        let (num, den) = match s.split_once('/') {
            Some((n, d)) => (n.trim(), d.trim()),
            None => (s.trim(), "1"),
        };
        Ok(Fraction {
            num: num.parse().map_err(|_| bad())?,
            den: den.parse().map_err(|_| bad())?,
        })
    }
}

/// One plane of a raw frame inside the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub offset: usize,
    pub stride: usize,
    pub width: u32,
    pub height: u32,
}

const fn round_up_2(v: u32) -> u32 {
    v.saturating_add(1) & !1
}

const fn round_up_4(v: usize) -> usize {
    v.saturating_add(3) & !3
}

/// Largest width or height accepted during negotiation
pub const MAX_DIMENSION: u32 = 16384;

/// Negotiated stream description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoCaps {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
    pub pixel_aspect_ratio: Fraction,
}

impl VideoCaps {
    /// Caps with framerate 0/1 (variable) and square pixels
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            framerate: Fraction::new(0, 1),
            pixel_aspect_ratio: Fraction::ONE,
        }
    }

    pub fn with_framerate(mut self, num: u32, den: u32) -> Self {
        self.framerate = Fraction::new(num, den);
        self
    }

    pub fn with_pixel_aspect_ratio(mut self, num: u32, den: u32) -> Self {
        self.pixel_aspect_ratio = Fraction::new(num, den);
        self
    }

    pub fn validate(&self) -> Result<(), MediaError> {
        if self.width == 0 || self.height == 0 {
            return Err(MediaError::NotNegotiated(format!(
                "invalid frame size {}x{}",
                self.width, self.height
            )));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(MediaError::InvalidArgument(format!(
                "frame size {}x{} exceeds {}x{}",
                self.width, self.height, MAX_DIMENSION, MAX_DIMENSION
            )));
        }
        if self.pixel_aspect_ratio.num == 0 || self.pixel_aspect_ratio.den == 0 {
            return Err(MediaError::NotNegotiated(format!(
                "invalid pixel-aspect-ratio {}",
                self.pixel_aspect_ratio
            )));
        }
        if self.framerate.den == 0 {
            return Err(MediaError::NotNegotiated(format!("invalid framerate {}", self.framerate)));
        }
        Ok(())
    }

    /// Plane offsets and strides with the default 4-byte row alignment
    pub fn plane_layout(&self) -> Vec<Plane> {
        let w = self.width;
        let h = self.height;
        let packed = |bpp: usize, align: bool| {
            let row = w as usize * bpp;
            vec![Plane {
                offset: 0,
                stride: if align { round_up_4(row) } else { row },
                width: w,
                height: h,
            }]
        };

        match self.format {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => packed(3, true),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 | PixelFormat::Ayuv => packed(4, false),
            PixelFormat::I420 | PixelFormat::Yv12 => {
                let y_stride = round_up_4(w as usize);
                let chroma_w = round_up_2(w) / 2;
                let chroma_h = round_up_2(h) / 2;
                let chroma_stride = round_up_4(chroma_w as usize);
                let first = y_stride * h as usize;
                let second = first + chroma_stride * chroma_h as usize;
                vec![
                    Plane {
                        offset: 0,
                        stride: y_stride,
                        width: w,
                        height: h,
                    },
                    Plane {
                        offset: first,
                        stride: chroma_stride,
                        width: chroma_w,
                        height: chroma_h,
                    },
                    Plane {
                        offset: second,
                        stride: chroma_stride,
                        width: chroma_w,
                        height: chroma_h,
                    },
                ]
            }
        }
    }

    /// Total bytes of one frame
    pub fn frame_size(&self) -> usize {
        self.plane_layout()
            .iter()
            .map(|p| p.offset + p.stride * p.height as usize)
            .max()
            .unwrap_or(0)
    }

    /// Parse `video/x-raw,format=I420,width=640,height=480,...`
    ///
    /// Type annotations such as `(int)` or `(fraction)` are accepted and ignored.
    pub fn parse(caps: &str) -> Result<Self, MediaError> {
        let mut fields = caps.split(',').map(str::trim);
        let media_type = fields.next().unwrap_or_default();
        if media_type != "video/x-raw" {
            return Err(MediaError::NotNegotiated(format!("unsupported media type '{}'", media_type)));
        }

        let mut format = None;
        let mut width = None;
        let mut height = None;
        let mut framerate = Fraction::new(0, 1);
        let mut par = Fraction::ONE;

        for field in fields.filter(|f| !f.is_empty()) {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| MediaError::NotNegotiated(format!("malformed caps field '{}'", field)))?;
            let value = strip_type(value.trim());
            let bad = || MediaError::NotNegotiated(format!("invalid value for {}: '{}'", key.trim(), value));
            match key.trim() {
                "format" => format = Some(PixelFormat::from_caps_name(value).ok_or_else(bad)?),
                "width" => width = Some(value.parse::<u32>().map_err(|_| bad())?),
                "height" => height = Some(value.parse::<u32>().map_err(|_| bad())?),
                "framerate" => framerate = value.parse()?,
                "pixel-aspect-ratio" => par = value.parse()?,
                other => tracing::trace!(field = other, "ignoring caps field"),
            }
        }

        let caps = VideoCaps {
            format: format.ok_or_else(|| MediaError::NotNegotiated("caps without format".into()))?,
            width: width.ok_or_else(|| MediaError::NotNegotiated("caps without width".into()))?,
            height: height.ok_or_else(|| MediaError::NotNegotiated("caps without height".into()))?,
            framerate,
            pixel_aspect_ratio: par,
        };
        caps.validate()?;
        Ok(caps)
    }
}

fn strip_type(value: &str) -> &str {
    if value.starts_with('(') {
        if let Some(end) = value.find(')') {
            return value[end + 1..].trim();
        }
    }
    value
}

impl fmt::Display for VideoCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "video/x-raw, format={}, width={}, height={}, framerate={}, pixel-aspect-ratio={}",
            self.format, self.width, self.height, self.framerate, self.pixel_aspect_ratio
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUFFERS
// ═══════════════════════════════════════════════════════════════════════════════

/// RGBA bitmap composited over the frame, positioned in frame pixels
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayRectangle {
    /// Tightly packed RGBA pixels
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub x: i32,
    pub y: i32,
    pub render_width: u32,
    pub render_height: u32,
}

impl OverlayRectangle {
    /// Overlay rendered at its natural size
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, x: i32, y: i32) -> Self {
        Self {
            pixels,
            width,
            height,
            x,
            y,
            render_width: width,
            render_height: height,
        }
    }
}

enum BufferMemory {
    Owned(Vec<u8>),
    Pooled(PooledBuffer),
}

/// One decoded frame
pub struct VideoBuffer {
    memory: BufferMemory,
    pub pts: Option<Duration>,
    pub overlays: Vec<OverlayRectangle>,
}

impl VideoBuffer {
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            memory: BufferMemory::Owned(data),
            pts: None,
            overlays: Vec::new(),
        }
    }

    /// Wrap pool memory; it returns to the pool when the buffer drops
    pub fn from_pooled(buffer: PooledBuffer) -> Self {
        Self {
            memory: BufferMemory::Pooled(buffer),
            pts: None,
            overlays: Vec::new(),
        }
    }

    /// All-zero frame for `caps`
    pub fn zeroed(caps: &VideoCaps) -> Self {
        Self::from_vec(vec![0; caps.frame_size()])
    }

    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_overlays(mut self, overlays: Vec<OverlayRectangle>) -> Self {
        self.overlays = overlays;
        self
    }

    pub fn data(&self) -> &[u8] {
        match &self.memory {
            BufferMemory::Owned(v) => v,
            BufferMemory::Pooled(p) => p,
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.memory, BufferMemory::Pooled(_))
    }
}

impl fmt::Debug for VideoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoBuffer")
            .field("len", &self.len())
            .field("pooled", &self.is_pooled())
            .field("pts", &self.pts)
            .field("overlays", &self.overlays.len())
            .finish()
    }
}
