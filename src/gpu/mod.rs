//! GPU seam between the sink and the compositor's graphics context
//!
//! The sink only talks to a `GpuContext`: it probes features, creates and
//! fills textures, and bundles them into a `Material` (the textures plus
//! the sampling program). Two backends are provided: `wgpu_backend` for
//! real GPUs and `software` for headless use.

pub mod software;
pub mod wgpu_backend;

use std::any::Any;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::MediaError;

pub use software::SoftwareContext;
pub use wgpu_backend::WgpuContext;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

// ═══════════════════════════════════════════════════════════════════════════════
// FEATURES
// ═══════════════════════════════════════════════════════════════════════════════

/// Upload strategies a context can execute
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GpuFeatures(u32);

impl GpuFeatures {
    pub const NONE: Self = Self(0);
    /// More than one texture layer per material
    pub const MULTI_TEXTURE: Self = Self(1 << 0);
    /// Assembly-level fragment programs
    pub const FRAGMENT_PROGRAM: Self = Self(1 << 1);
    /// High-level shader programs
    pub const SHADER_PROGRAM: Self = Self(1 << 2);

    pub const fn all() -> Self {
        Self::MULTI_TEXTURE.union(Self::FRAGMENT_PROGRAM).union(Self::SHADER_PROGRAM)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for GpuFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for GpuFeatures {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for GpuFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::MULTI_TEXTURE) {
            names.push("MULTI_TEXTURE");
        }
        if self.contains(Self::FRAGMENT_PROGRAM) {
            names.push("FRAGMENT_PROGRAM");
        }
        if self.contains(Self::SHADER_PROGRAM) {
            names.push("SHADER_PROGRAM");
        }
        write!(f, "GpuFeatures({})", names.join(" | "))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEXTURES
// ═══════════════════════════════════════════════════════════════════════════════

/// Texel layout of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// One 8-bit channel (a single YUV plane)
    R8,
    /// 8-bit RGBA, also used for packed AYUV
    Rgba8,
    /// 8-bit BGRA
    Bgra8,
}

impl TextureFormat {
    pub fn bytes_per_texel(&self) -> usize {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rgba8 | TextureFormat::Bgra8 => 4,
        }
    }
}

/// Reference-counted texture handle. Backends keep their storage in `backend`.
#[derive(Clone)]
pub struct Texture {
    id: u64,
    width: u32,
    height: u32,
    format: TextureFormat,
    backend: Arc<dyn Any + Send + Sync>,
}

impl Texture {
    pub fn new(width: u32, height: u32, format: TextureFormat, backend: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            id: next_resource_id(),
            width,
            height,
            format,
            backend,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Backend storage, if it is of type `T`
    pub fn backend<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.backend.downcast_ref::<T>()
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MATERIALS
// ═══════════════════════════════════════════════════════════════════════════════

/// How the material's layers are turned into RGBA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialProgram {
    /// Sample layer 0 as-is
    Rgba,
    /// Layer 0 holds packed A,Y,U,V bytes
    Ayuv,
    /// Layers 0/1/2 hold the Y, U and V planes
    PlanarYuv,
}

impl MaterialProgram {
    pub fn layer_count(&self) -> usize {
        match self {
            MaterialProgram::Rgba | MaterialProgram::Ayuv => 1,
            MaterialProgram::PlanarYuv => 3,
        }
    }
}

struct MaterialInner {
    id: u64,
    program: MaterialProgram,
    layers: Vec<Texture>,
    backend: Option<Arc<dyn Any + Send + Sync>>,
    on_release: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Drop for MaterialInner {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
        tracing::trace!(material = self.id, "material released");
    }
}

/// GPU material: textures plus the program that samples them.
///
/// Cloning shares the same GPU resources; they are released when the
/// last clone is dropped.
#[derive(Clone)]
pub struct Material {
    inner: Arc<MaterialInner>,
}

impl Material {
    /// Assemble a material. `on_release` runs once when the last handle drops.
    pub fn new(
        program: MaterialProgram,
        layers: Vec<Texture>,
        backend: Option<Arc<dyn Any + Send + Sync>>,
        on_release: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Result<Self, MediaError> {
        if layers.len() != program.layer_count() {
            return Err(MediaError::Gpu(format!(
                "{:?} program needs {} layers, got {}",
                program,
                program.layer_count(),
                layers.len()
            )));
        }
        Ok(Self {
            inner: Arc::new(MaterialInner {
                id: next_resource_id(),
                program,
                layers,
                backend,
                on_release,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn program(&self) -> MaterialProgram {
        self.inner.program
    }

    pub fn layers(&self) -> &[Texture] {
        &self.inner.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Texture> {
        self.inner.layers.get(index)
    }

    /// Backend data attached at creation, if it is of type `T`
    pub fn backend<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.backend.as_ref().and_then(|b| b.downcast_ref::<T>())
    }

    /// Number of live handles sharing this material
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Material) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Material")
            .field("id", &self.inner.id)
            .field("program", &self.inner.program)
            .field("layers", &self.inner.layers)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

/// Graphics context used by the sink on the render thread
pub trait GpuContext: Send + Sync {
    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Upload strategies available on this context
    fn features(&self) -> GpuFeatures;

    fn create_texture(&self, width: u32, height: u32, format: TextureFormat) -> Result<Texture, MediaError>;

    /// Fill a texture from `data`, whose rows are `stride` bytes apart
    fn upload_texture(&self, texture: &Texture, data: &[u8], stride: usize) -> Result<(), MediaError>;

    fn create_material(&self, program: MaterialProgram, layers: Vec<Texture>) -> Result<Material, MediaError>;

    /// True once the context is unusable
    fn is_lost(&self) -> bool;
}

/// Bytes covered by `height` rows of `row_bytes` spaced `stride` apart
pub(crate) fn required_len(row_bytes: usize, stride: usize, height: u32) -> usize {
    if height == 0 {
        return 0;
    }
    stride * (height as usize - 1) + row_bytes
}
