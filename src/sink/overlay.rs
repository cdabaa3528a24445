//! Overlay compositions attached to frames (subtitles, OSD)

use crate::gpu::{GpuContext, Material, MaterialProgram, TextureFormat};
use crate::video::OverlayRectangle;

/// Axis-aligned rectangle in frame pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayRect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// An uploaded overlay bitmap and where it goes on the frame
#[derive(Debug, Clone)]
pub struct Overlay {
    pub material: Material,
    pub rect: OverlayRect,
}

/// Upload every rectangle; ones that fail are skipped with a warning
pub(crate) fn build_overlays(ctx: &dyn GpuContext, rectangles: &[OverlayRectangle]) -> Vec<Overlay> {
    rectangles
        .iter()
        .filter_map(|r| match upload(ctx, r) {
            Ok(material) => Some(Overlay {
                material,
                rect: OverlayRect {
                    x1: r.x as f32,
                    y1: r.y as f32,
                    x2: r.x as f32 + r.render_width as f32,
                    y2: r.y as f32 + r.render_height as f32,
                },
            }),
            Err(e) => {
                tracing::warn!(target: "immersive_media_bridge::sink", "dropping overlay: {}", e);
                None
            }
        })
        .collect()
}

fn upload(ctx: &dyn GpuContext, rect: &OverlayRectangle) -> Result<Material, crate::error::MediaError> {
    let texture = ctx.create_texture(rect.width, rect.height, TextureFormat::Rgba8)?;
    ctx.upload_texture(&texture, &rect.pixels, rect.width as usize * 4)?;
    ctx.create_material(MaterialProgram::Rgba, vec![texture])
}
