//! CPU implementation of `GpuContext`
//!
//! Textures are plain byte vectors. `sample` evaluates a material at a
//! texture coordinate with the same conversion math as
//! `shaders/video_material.wgsl`, so colour handling can be checked
//! without a GPU.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{required_len, GpuContext, GpuFeatures, Material, MaterialProgram, Texture, TextureFormat};
use crate::error::MediaError;

/// Texel storage, tightly packed (`width * bytes_per_texel` per row)
struct SoftwareTexture {
    pixels: Mutex<Vec<u8>>,
}

pub struct SoftwareContext {
    features: GpuFeatures,
    lost: AtomicBool,
    live_materials: Arc<AtomicUsize>,
    uploads: AtomicUsize,
}

impl Default for SoftwareContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareContext {
    /// Context advertising every upload strategy
    pub fn new() -> Self {
        Self::with_features(GpuFeatures::all())
    }

    pub fn with_features(features: GpuFeatures) -> Self {
        Self {
            features,
            lost: AtomicBool::new(false),
            live_materials: Arc::new(AtomicUsize::new(0)),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Simulate losing (or recovering) the context
    pub fn set_lost(&self, lost: bool) {
        self.lost.store(lost, Ordering::SeqCst);
    }

    /// Materials created by this context and not yet released
    pub fn live_materials(&self) -> usize {
        self.live_materials.load(Ordering::SeqCst)
    }

    /// Total successful texture uploads
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Copy of a texture's packed texels
    pub fn read_texture(&self, texture: &Texture) -> Option<Vec<u8>> {
        texture.backend::<SoftwareTexture>().map(|t| t.pixels.lock().clone())
    }

    /// Evaluate `material` at normalized coordinate (`u`, `v`), nearest texel.
    ///
    /// Returns RGBA in 0..1.
    pub fn sample(&self, material: &Material, u: f32, v: f32) -> [f32; 4] {
        match material.program() {
            MaterialProgram::Rgba => {
                let Some(layer) = material.layer(0) else {
                    return [0.0; 4];
                };
                let t = fetch(layer, u, v);
                match layer.format() {
                    TextureFormat::Bgra8 => [t[2], t[1], t[0], t[3]],
                    TextureFormat::Rgba8 => t,
                    TextureFormat::R8 => [t[0], t[0], t[0], 1.0],
                }
            }
            MaterialProgram::Ayuv => {
                let Some(layer) = material.layer(0) else {
                    return [0.0; 4];
                };
                // Packed bytes land in r,g,b,a as A,Y,U,V
                let t = fetch(layer, u, v);
                let [r, g, b] = yuv_to_rgb(t[1], t[2], t[3]);
                [r, g, b, t[0]]
            }
            MaterialProgram::PlanarYuv => {
                let (Some(y), Some(cu), Some(cv)) = (material.layer(0), material.layer(1), material.layer(2)) else {
                    return [0.0; 4];
                };
                let [r, g, b] = yuv_to_rgb(fetch(y, u, v)[0], fetch(cu, u, v)[0], fetch(cv, u, v)[0]);
                [r, g, b, 1.0]
            }
        }
    }

    fn check_lost(&self) -> Result<(), MediaError> {
        if self.is_lost() {
            Err(MediaError::Gpu("software context lost".into()))
        } else {
            Ok(())
        }
    }
}

/// BT.601 limited-range conversion, inputs in 0..1
pub fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [f32; 3] {
    let y = 1.164 * (y - 0.0625);
    let u = u - 0.5;
    let v = v - 0.5;
    [
        (y + 1.596 * v).clamp(0.0, 1.0),
        (y - 0.391 * u - 0.813 * v).clamp(0.0, 1.0),
        (y + 2.016 * u).clamp(0.0, 1.0),
    ]
}

fn fetch(texture: &Texture, u: f32, v: f32) -> [f32; 4] {
    let Some(storage) = texture.backend::<SoftwareTexture>() else {
        return [0.0; 4];
    };
    let w = texture.width().max(1);
    let h = texture.height().max(1);
    let x = ((u.clamp(0.0, 1.0) * w as f32) as u32).min(w - 1) as usize;
    let y = ((v.clamp(0.0, 1.0) * h as f32) as u32).min(h - 1) as usize;
    let bpp = texture.format().bytes_per_texel();
    let offset = (y * w as usize + x) * bpp;

    let pixels = storage.pixels.lock();
    let mut out = [0.0, 0.0, 0.0, 1.0];
    for (c, slot) in out.iter_mut().enumerate().take(bpp) {
        *slot = pixels.get(offset + c).copied().unwrap_or(0) as f32 / 255.0;
    }
    out
}

impl GpuContext for SoftwareContext {
    fn backend_name(&self) -> &'static str {
        "software"
    }

    fn features(&self) -> GpuFeatures {
        self.features
    }

    fn create_texture(&self, width: u32, height: u32, format: TextureFormat) -> Result<Texture, MediaError> {
        self.check_lost()?;
        if width == 0 || height == 0 {
            return Err(MediaError::Gpu(format!("invalid texture size {}x{}", width, height)));
        }
        let len = width as usize * height as usize * format.bytes_per_texel();
        let storage = SoftwareTexture {
            pixels: Mutex::new(vec![0; len]),
        };
        Ok(Texture::new(width, height, format, Arc::new(storage)))
    }

    fn upload_texture(&self, texture: &Texture, data: &[u8], stride: usize) -> Result<(), MediaError> {
        self.check_lost()?;
        let storage = texture
            .backend::<SoftwareTexture>()
            .ok_or_else(|| MediaError::Gpu("texture not created by the software context".into()))?;

        let row_bytes = texture.width() as usize * texture.format().bytes_per_texel();
        if stride < row_bytes || data.len() < required_len(row_bytes, stride, texture.height()) {
            return Err(MediaError::Gpu(format!(
                "upload of {} bytes (stride {}) too small for {}x{} {:?}",
                data.len(),
                stride,
                texture.width(),
                texture.height(),
                texture.format()
            )));
        }

        let mut pixels = storage.pixels.lock();
        for (row, dst) in pixels.chunks_exact_mut(row_bytes).enumerate() {
            let src = row * stride;
            dst.copy_from_slice(&data[src..src + row_bytes]);
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_material(&self, program: MaterialProgram, layers: Vec<Texture>) -> Result<Material, MediaError> {
        self.check_lost()?;
        let counter = Arc::clone(&self.live_materials);
        let material = Material::new(
            program,
            layers,
            None,
            Some(Box::new(move || {
                counter.fetch_sub(1, Ordering::SeqCst);
            })),
        )?;
        self.live_materials.fetch_add(1, Ordering::SeqCst);
        Ok(material)
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.02
    }

    #[test]
    fn test_upload_respects_stride() {
        let ctx = SoftwareContext::new();
        let tex = ctx.create_texture(2, 2, TextureFormat::R8).unwrap();
        // Stride 4 with two padding bytes per row
        let data = [1, 2, 0xff, 0xff, 3, 4, 0xff, 0xff];
        ctx.upload_texture(&tex, &data, 4).unwrap();
        assert_eq!(ctx.read_texture(&tex).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_upload_too_short_fails() {
        let ctx = SoftwareContext::new();
        let tex = ctx.create_texture(4, 4, TextureFormat::Rgba8).unwrap();
        assert!(ctx.upload_texture(&tex, &[0; 16], 16).is_err());
    }

    #[test]
    fn test_lost_context_rejects_work() {
        let ctx = SoftwareContext::new();
        ctx.set_lost(true);
        assert!(ctx.create_texture(1, 1, TextureFormat::R8).is_err());
    }

    #[test]
    fn test_live_material_count() {
        let ctx = SoftwareContext::new();
        let tex = ctx.create_texture(1, 1, TextureFormat::Rgba8).unwrap();
        let material = ctx.create_material(MaterialProgram::Rgba, vec![tex]).unwrap();
        assert_eq!(ctx.live_materials(), 1);
        drop(material);
        assert_eq!(ctx.live_materials(), 0);
    }

    #[test]
    fn test_yuv_white_and_black() {
        let white = yuv_to_rgb(235.0 / 255.0, 0.5, 0.5);
        assert!(white.iter().all(|c| approx(*c, 1.0)));
        let black = yuv_to_rgb(16.0 / 255.0, 0.5, 0.5);
        assert!(black.iter().all(|c| approx(*c, 0.0)));
    }

    #[test]
    fn test_sample_bgra_swaps_channels() {
        let ctx = SoftwareContext::new();
        let tex = ctx.create_texture(1, 1, TextureFormat::Bgra8).unwrap();
        ctx.upload_texture(&tex, &[0, 0, 255, 255], 4).unwrap();
        let material = ctx.create_material(MaterialProgram::Rgba, vec![tex]).unwrap();
        let c = ctx.sample(&material, 0.5, 0.5);
        assert!(approx(c[0], 1.0) && approx(c[2], 0.0));
    }
}
