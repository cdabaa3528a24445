//! Upload strategies, one per accepted pixel format
//!
//! `RENDERERS` is ordered by preference: shader-program renderers first,
//! then fragment-program renderers, then plain texture uploads. A sink
//! keeps the entries whose required features its GPU context offers and
//! picks the first one matching the negotiated format.

use crate::error::MediaError;
use crate::gpu::{GpuContext, GpuFeatures, Material, MaterialProgram, Texture, TextureFormat};
use crate::video::{PixelFormat, Plane, VideoCaps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upload {
    /// 3-byte pixels expanded to RGBA, optionally swapping R and B
    ExpandRgb { swap: bool },
    /// One 4-byte texture sampled by `program`
    Packed { texture: TextureFormat, program: MaterialProgram },
    /// Three single-channel planes; `swap_uv` when memory order is Y, V, U
    Planar { swap_uv: bool },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Renderer {
    pub name: &'static str,
    pub format: PixelFormat,
    /// GPU features this strategy requires
    pub flags: GpuFeatures,
    upload: Upload,
}

const SHADER_MULTI: GpuFeatures = GpuFeatures::SHADER_PROGRAM.union(GpuFeatures::MULTI_TEXTURE);
const FRAGMENT_MULTI: GpuFeatures = GpuFeatures::FRAGMENT_PROGRAM.union(GpuFeatures::MULTI_TEXTURE);

/// Every renderer, in decreasing order of preference
pub static RENDERERS: [Renderer; 10] = [
    Renderer {
        name: "AYUV shader",
        format: PixelFormat::Ayuv,
        flags: GpuFeatures::SHADER_PROGRAM,
        upload: Upload::Packed {
            texture: TextureFormat::Rgba8,
            program: MaterialProgram::Ayuv,
        },
    },
    Renderer {
        name: "I420 shader",
        format: PixelFormat::I420,
        flags: SHADER_MULTI,
        upload: Upload::Planar { swap_uv: false },
    },
    Renderer {
        name: "YV12 shader",
        format: PixelFormat::Yv12,
        flags: SHADER_MULTI,
        upload: Upload::Planar { swap_uv: true },
    },
    Renderer {
        name: "AYUV fragment program",
        format: PixelFormat::Ayuv,
        flags: GpuFeatures::FRAGMENT_PROGRAM,
        upload: Upload::Packed {
            texture: TextureFormat::Rgba8,
            program: MaterialProgram::Ayuv,
        },
    },
    Renderer {
        name: "I420 fragment program",
        format: PixelFormat::I420,
        flags: FRAGMENT_MULTI,
        upload: Upload::Planar { swap_uv: false },
    },
    Renderer {
        name: "YV12 fragment program",
        format: PixelFormat::Yv12,
        flags: FRAGMENT_MULTI,
        upload: Upload::Planar { swap_uv: true },
    },
    Renderer {
        name: "RGB 24",
        format: PixelFormat::Rgb24,
        flags: GpuFeatures::NONE,
        upload: Upload::ExpandRgb { swap: false },
    },
    Renderer {
        name: "BGR 24",
        format: PixelFormat::Bgr24,
        flags: GpuFeatures::NONE,
        upload: Upload::ExpandRgb { swap: true },
    },
    Renderer {
        name: "RGBA 32",
        format: PixelFormat::Rgba32,
        flags: GpuFeatures::NONE,
        upload: Upload::Packed {
            texture: TextureFormat::Rgba8,
            program: MaterialProgram::Rgba,
        },
    },
    Renderer {
        name: "BGRA 32",
        format: PixelFormat::Bgra32,
        flags: GpuFeatures::NONE,
        upload: Upload::Packed {
            texture: TextureFormat::Bgra8,
            program: MaterialProgram::Rgba,
        },
    },
];

/// Renderers usable with `features`, preference order kept
pub fn available_renderers(features: GpuFeatures) -> Vec<&'static Renderer> {
    RENDERERS.iter().filter(|r| features.contains(r.flags)).collect()
}

/// First renderer in `renderers` handling `format`
pub fn find_renderer(renderers: &[&'static Renderer], format: PixelFormat) -> Option<&'static Renderer> {
    renderers.iter().copied().find(|r| r.format == format)
}

impl Renderer {
    /// Upload one frame into fresh textures and wrap them in a material
    pub fn upload(&self, ctx: &dyn GpuContext, caps: &VideoCaps, data: &[u8]) -> Result<Material, MediaError> {
        let expected = caps.frame_size();
        if data.len() < expected {
            return Err(MediaError::Decoding(format!(
                "{} buffer of {} bytes, expected {}",
                caps.format,
                data.len(),
                expected
            )));
        }
        let planes = caps.plane_layout();

        match self.upload {
            Upload::ExpandRgb { swap } => {
                let plane = planes[0];
                // No 3-byte texel format on the GPU side
                let rgba = expand_rgb(data, &plane, swap);
                let texture = ctx.create_texture(plane.width, plane.height, TextureFormat::Rgba8)?;
                ctx.upload_texture(&texture, &rgba, plane.width as usize * 4)?;
                ctx.create_material(MaterialProgram::Rgba, vec![texture])
            }
            Upload::Packed { texture, program } => {
                let layer = upload_plane(ctx, data, &planes[0], texture)?;
                ctx.create_material(program, vec![layer])
            }
            Upload::Planar { swap_uv } => {
                let y = upload_plane(ctx, data, &planes[0], TextureFormat::R8)?;
                let first = upload_plane(ctx, data, &planes[1], TextureFormat::R8)?;
                let second = upload_plane(ctx, data, &planes[2], TextureFormat::R8)?;
                // Layers are always Y, U, V
                let layers = if swap_uv {
                    vec![y, second, first]
                } else {
                    vec![y, first, second]
                };
                ctx.create_material(MaterialProgram::PlanarYuv, layers)
            }
        }
    }
}

fn upload_plane(ctx: &dyn GpuContext, data: &[u8], plane: &Plane, format: TextureFormat) -> Result<Texture, MediaError> {
    let texture = ctx.create_texture(plane.width, plane.height, format)?;
    ctx.upload_texture(&texture, &data[plane.offset..], plane.stride)?;
    Ok(texture)
}

fn expand_rgb(data: &[u8], plane: &Plane, swap: bool) -> Vec<u8> {
    let width = plane.width as usize;
    let mut out = Vec::with_capacity(width * plane.height as usize * 4);
    for row in 0..plane.height as usize {
        let start = plane.offset + row * plane.stride;
        for px in data[start..start + width * 3].chunks_exact(3) {
            if swap {
                out.extend_from_slice(&[px[2], px[1], px[0], 255]);
            } else {
                out.extend_from_slice(&[px[0], px[1], px[2], 255]);
            }
        }
    }
    out
}
