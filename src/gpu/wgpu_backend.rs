//! wgpu implementation of `GpuContext`
//!
//! Each material owns a bind group (three texture layers, a sampler and a
//! `QuadParams` uniform). Render pipelines are built lazily per
//! (program, target format) and shared by every material.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{required_len, GpuContext, GpuFeatures, Material, MaterialProgram, Texture, TextureFormat};
use crate::error::MediaError;

/// Embedded material shader source
pub const VIDEO_MATERIAL_SHADER: &str = include_str!("../shaders/video_material.wgsl");

/// Quad placement and modulation, matching `QuadParams` in the shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct QuadParams {
    /// Destination rectangle in target space (0..1, y down): x, y, w, h
    pub rect: [f32; 4],
    /// Texture coordinates: u0, v0, u1, v1
    pub tex_rect: [f32; 4],
    /// Modulation colour
    pub color: [f32; 4],
}

impl Default for QuadParams {
    fn default() -> Self {
        Self {
            rect: [0.0, 0.0, 1.0, 1.0],
            tex_rect: [0.0, 0.0, 1.0, 1.0],
            color: [1.0; 4],
        }
    }
}

struct WgpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct WgpuMaterial {
    bind_group: wgpu::BindGroup,
    params_buffer: wgpu::Buffer,
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    // YUV data must not be gamma-decoded by the sampler, so every layer is linear
    match format {
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Bgra8 => wgpu::TextureFormat::Bgra8Unorm,
    }
}

fn fragment_entry(program: MaterialProgram) -> &'static str {
    match program {
        MaterialProgram::Rgba => "fs_rgba",
        MaterialProgram::Ayuv => "fs_ayuv",
        MaterialProgram::PlanarYuv => "fs_planar_yuv",
    }
}

pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    sampler: wgpu::Sampler,
    pipelines: Mutex<HashMap<(MaterialProgram, wgpu::TextureFormat), Arc<wgpu::RenderPipeline>>>,
    lost: Arc<AtomicBool>,
}

impl WgpuContext {
    /// Request an adapter and device without a surface
    pub async fn request_headless() -> Result<Self, MediaError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| MediaError::Gpu("no suitable GPU adapter".into()))?;

        tracing::info!("Using GPU: {}", adapter.get_info().name);
        tracing::info!("Backend: {:?}", adapter.get_info().backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Media Bridge Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| MediaError::Gpu(format!("failed to create device: {}", e)))?;

        Ok(Self::from_parts(device, queue))
    }

    /// Blocking wrapper around `request_headless`
    pub fn new_headless() -> Result<Self, MediaError> {
        pollster::block_on(Self::request_headless())
    }

    /// Wrap a device and queue owned by the compositor
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            lost_flag.store(true, Ordering::SeqCst);
            tracing::error!(?reason, %message, "GPU device lost");
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Video Material Shader"),
            source: wgpu::ShaderSource::Wgsl(VIDEO_MATERIAL_SHADER.into()),
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Video Material Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Video Material Bind Group Layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Video Material Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        Self {
            device,
            queue,
            shader,
            bind_group_layout,
            pipeline_layout,
            sampler,
            pipelines: Mutex::new(HashMap::new()),
            lost,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn pipeline_for(&self, program: MaterialProgram, target: wgpu::TextureFormat) -> Arc<wgpu::RenderPipeline> {
        let mut pipelines = self.pipelines.lock();
        if let Some(p) = pipelines.get(&(program, target)) {
            return Arc::clone(p);
        }

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Video Material Pipeline"),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &self.shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.shader,
                entry_point: Some(fragment_entry(program)),
                targets: &[Some(wgpu::ColorTargetState {
                    format: target,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        tracing::debug!(?program, ?target, "created video material pipeline");
        let pipeline = Arc::new(pipeline);
        pipelines.insert((program, target), Arc::clone(&pipeline));
        pipeline
    }

    /// Draw `material` as a quad into `view`, loading existing contents
    pub fn render_material(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        target_format: wgpu::TextureFormat,
        material: &Material,
        params: QuadParams,
    ) -> Result<(), MediaError> {
        let backend = material
            .backend::<WgpuMaterial>()
            .ok_or_else(|| MediaError::Gpu("material not created by the wgpu context".into()))?;

        self.queue
            .write_buffer(&backend.params_buffer, 0, bytemuck::bytes_of(&params));
        let pipeline = self.pipeline_for(material.program(), target_format);

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Video Material Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        render_pass.set_pipeline(&pipeline);
        render_pass.set_bind_group(0, &backend.bind_group, &[]);
        render_pass.draw(0..6, 0..1);
        Ok(())
    }

    fn check_lost(&self) -> Result<(), MediaError> {
        if self.is_lost() {
            Err(MediaError::Gpu("wgpu device lost".into()))
        } else {
            Ok(())
        }
    }
}

impl GpuContext for WgpuContext {
    fn backend_name(&self) -> &'static str {
        "wgpu"
    }

    fn features(&self) -> GpuFeatures {
        GpuFeatures::SHADER_PROGRAM | GpuFeatures::MULTI_TEXTURE
    }

    fn create_texture(&self, width: u32, height: u32, format: TextureFormat) -> Result<Texture, MediaError> {
        self.check_lost()?;
        let max = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(MediaError::Gpu(format!(
                "texture size {}x{} outside 1..={}",
                width, height, max
            )));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Video Layer Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(format),
            usage: wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Texture::new(width, height, format, Arc::new(WgpuTexture { texture, view })))
    }

    fn upload_texture(&self, texture: &Texture, data: &[u8], stride: usize) -> Result<(), MediaError> {
        self.check_lost()?;
        let backend = texture
            .backend::<WgpuTexture>()
            .ok_or_else(|| MediaError::Gpu("texture not created by the wgpu context".into()))?;

        let row_bytes = texture.width() as usize * texture.format().bytes_per_texel();
        if stride < row_bytes || data.len() < required_len(row_bytes, stride, texture.height()) {
            return Err(MediaError::Gpu(format!(
                "upload of {} bytes (stride {}) too small for {}x{}",
                data.len(),
                stride,
                texture.width(),
                texture.height()
            )));
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &backend.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(stride as u32),
                rows_per_image: Some(texture.height()),
            },
            wgpu::Extent3d {
                width: texture.width(),
                height: texture.height(),
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn create_material(&self, program: MaterialProgram, layers: Vec<Texture>) -> Result<Material, MediaError> {
        self.check_lost()?;
        let views: Vec<&wgpu::TextureView> = layers
            .iter()
            .map(|t| {
                t.backend::<WgpuTexture>()
                    .map(|b| &b.view)
                    .ok_or_else(|| MediaError::Gpu("texture not created by the wgpu context".into()))
            })
            .collect::<Result<_, _>>()?;
        let first = *views
            .first()
            .ok_or_else(|| MediaError::Gpu("material needs at least one layer".into()))?;
        // Single-layer programs bind layer 0 in every slot
        let view_at = |i: usize| views.get(i).copied().unwrap_or(first);

        let params_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Quad Params Buffer"),
            size: std::mem::size_of::<QuadParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue
            .write_buffer(&params_buffer, 0, bytemuck::bytes_of(&QuadParams::default()));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Video Material Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view_at(0)),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(view_at(1)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(view_at(2)),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        Material::new(
            program,
            layers,
            Some(Arc::new(WgpuMaterial {
                bind_group,
                params_buffer,
            })),
            None,
        )
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_params_layout() {
        // Three vec4<f32> in the shader
        assert_eq!(std::mem::size_of::<QuadParams>(), 48);
    }

    #[test]
    fn test_shader_has_all_entry_points() {
        for entry in ["vs_main", "fs_rgba", "fs_ayuv", "fs_planar_yuv"] {
            assert!(VIDEO_MATERIAL_SHADER.contains(&format!("fn {}(", entry)));
        }
    }

    #[test]
    fn test_layer_formats_are_linear() {
        assert!(!wgpu_format(TextureFormat::Rgba8).is_srgb());
        assert!(!wgpu_format(TextureFormat::Bgra8).is_srgb());
        assert_eq!(wgpu_format(TextureFormat::R8), wgpu::TextureFormat::R8Unorm);
    }
}
