//! Frame descriptor handed from the sink to players and content
//!
//! A `Frame` is a GPU material plus the storage resolution and pixel
//! aspect ratio. Cloning shares the material; the GPU resources go away
//! when the last clone is released.

use crate::error::MediaError;
use crate::gpu::{GpuContext, Material, MaterialProgram, TextureFormat};
use crate::sink::VideoSink;

/// Storage size and pixel aspect ratio of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub par_n: u32,
    pub par_d: u32,
}

impl Resolution {
    /// Square-pixel resolution
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            par_n: 1,
            par_d: 1,
        }
    }

    pub const fn with_par(mut self, par_n: u32, par_d: u32) -> Self {
        self.par_n = par_n;
        self.par_d = par_d;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.par_n > 0 && self.par_d > 0
    }

    /// Display aspect: `(width * par_n) / (height * par_d)`
    pub fn display_aspect(&self) -> f64 {
        if !self.is_valid() {
            return 1.0;
        }
        (self.width as f64 * self.par_n as f64) / (self.height as f64 * self.par_d as f64)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    material: Material,
    resolution: Resolution,
}

impl Frame {
    /// Frame sized after the material's first layer, square pixels
    pub fn new(material: Material) -> Self {
        let (width, height) = material
            .layer(0)
            .map(|t| (t.width(), t.height()))
            .unwrap_or((1, 1));
        Self {
            material,
            resolution: Resolution::new(width, height),
        }
    }

    pub fn with_resolution(material: Material, resolution: Resolution) -> Self {
        Self { material, resolution }
    }

    /// 1x1 transparent black frame
    pub fn new_blank(ctx: &dyn GpuContext) -> Result<Self, MediaError> {
        let texture = ctx.create_texture(1, 1, TextureFormat::Rgba8)?;
        ctx.upload_texture(&texture, &[0, 0, 0, 0], 4)?;
        let material = ctx.create_material(MaterialProgram::Rgba, vec![texture])?;
        Ok(Self::new(material))
    }

    /// The GPU material sampling this frame
    pub fn material(&self) -> &Material {
        &self.material
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Copy the sink's negotiated pixel aspect ratio into this frame
    pub fn update_par_from_sink(&mut self, sink: &VideoSink) {
        let par = sink.pixel_aspect_ratio();
        self.set_pixel_aspect_ratio(par.num, par.den);
    }

    /// Zero components are ignored
    pub fn set_pixel_aspect_ratio(&mut self, par_n: u32, par_d: u32) {
        if par_n == 0 || par_d == 0 {
            tracing::warn!(par_n, par_d, "ignoring invalid pixel aspect ratio");
            return;
        }
        self.resolution.par_n = par_n;
        self.resolution.par_d = par_d;
    }

    /// Same storage size and pixel aspect ratio
    pub fn same_resolution(&self, other: &Frame) -> bool {
        self.resolution == other.resolution
    }

    /// True if both frames share one material
    pub fn shares_material(&self, other: &Frame) -> bool {
        self.material.ptr_eq(&other.material)
    }

    /// Drop this reference to the material
    pub fn release(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareContext;

    #[test]
    fn test_blank_frame() {
        let ctx = SoftwareContext::new();
        let frame = Frame::new_blank(&ctx).unwrap();
        assert_eq!(frame.resolution(), Resolution::new(1, 1));
        assert_eq!(ctx.sample(frame.material(), 0.5, 0.5), [0.0; 4]);
    }

    #[test]
    fn test_copy_shares_material_until_release() {
        let ctx = SoftwareContext::new();
        let frame = Frame::new_blank(&ctx).unwrap();
        let copy = frame.clone();
        assert!(copy.shares_material(&frame));
        frame.release();
        assert_eq!(ctx.live_materials(), 1);
        copy.release();
        assert_eq!(ctx.live_materials(), 0);
    }

    #[test]
    fn test_display_aspect() {
        let res = Resolution::new(720, 576).with_par(16, 15);
        assert!((res.display_aspect() - 720.0 * 16.0 / (576.0 * 15.0)).abs() < 1e-9);
        assert!(!Resolution::new(0, 10).is_valid());
    }

    #[test]
    fn test_invalid_par_ignored() {
        let ctx = SoftwareContext::new();
        let mut frame = Frame::new_blank(&ctx).unwrap();
        frame.set_pixel_aspect_ratio(0, 1);
        assert_eq!(frame.resolution().par_n, 1);
        frame.set_pixel_aspect_ratio(10, 11);
        assert_eq!((frame.resolution().par_n, frame.resolution().par_d), (10, 11));
    }
}
