//! Raw video caps, decoded buffers and frame descriptors

mod format;
mod frame;

pub use format::{Fraction, OverlayRectangle, PixelFormat, Plane, VideoBuffer, VideoCaps};
pub use frame::{Frame, Resolution};
