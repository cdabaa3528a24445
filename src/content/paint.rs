//! Paint-node tree handed to the scene-graph compositor

use crate::gpu::Material;

/// Axis-aligned box in actor coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActorBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl ActorBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box at the origin
    pub const fn from_size(width: f32, height: f32) -> Self {
        Self::new(0.0, 0.0, width, height)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    /// Parts of `self` not covered by `inner`, which must lie inside it.
    ///
    /// Left and right strips span the full height; top and bottom strips
    /// span the width of `inner`. Empty strips are skipped.
    pub fn complement(&self, inner: &ActorBox) -> Vec<ActorBox> {
        [
            ActorBox::new(self.x1, self.y1, inner.x1, self.y2),
            ActorBox::new(inner.x2, self.y1, self.x2, self.y2),
            ActorBox::new(inner.x1, self.y1, inner.x2, inner.y1),
            ActorBox::new(inner.x1, inner.y2, inner.x2, self.y2),
        ]
        .into_iter()
        .filter(|b| !b.is_empty())
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::new(0, 0, 0, 255);
    pub const TRANSPARENT: Color = Color::new(0, 0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn with_alpha(self, a: u8) -> Self {
        Self { a, ..self }
    }

    /// Alpha scaled by `opacity`
    pub fn modulated(self, opacity: u8) -> Self {
        let a = (self.a as u16 * opacity as u16 + 127) / 255;
        self.with_alpha(a as u8)
    }
}

/// Which axes of the content box tile the texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentRepeat {
    #[default]
    None,
    XAxis,
    YAxis,
    Both,
}

impl ContentRepeat {
    pub fn repeats_x(self) -> bool {
        matches!(self, ContentRepeat::XAxis | ContentRepeat::Both)
    }

    pub fn repeats_y(self) -> bool {
        matches!(self, ContentRepeat::YAxis | ContentRepeat::Both)
    }
}

/// What content needs to know about the actor it paints into
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Actor {
    pub content_box: ActorBox,
    pub background: Color,
    pub paint_opacity: u8,
    pub repeat: ContentRepeat,
}

impl Actor {
    /// Opaque actor of the given size, black background, no repeat
    pub fn with_size(width: f32, height: f32) -> Self {
        Self {
            content_box: ActorBox::from_size(width, height),
            background: Color::BLACK,
            paint_opacity: 255,
            repeat: ContentRepeat::None,
        }
    }
}

/// Rectangle plus the texture coordinates mapped onto it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureRectangle {
    pub rect: ActorBox,
    pub s1: f32,
    pub t1: f32,
    pub s2: f32,
    pub t2: f32,
}

#[derive(Debug, Clone)]
pub enum PaintNodeKind {
    /// Container only
    Root,
    /// Textured quads drawn with `material`, tinted by `opacity`
    Pipeline { material: Material, opacity: u8 },
    /// Solid fill
    Color(Color),
}

#[derive(Debug, Clone)]
pub struct PaintNode {
    name: String,
    kind: PaintNodeKind,
    rectangles: Vec<TextureRectangle>,
    children: Vec<PaintNode>,
}

impl PaintNode {
    pub fn root() -> Self {
        Self::with_kind("Root", PaintNodeKind::Root)
    }

    pub fn pipeline(name: &str, material: Material, opacity: u8) -> Self {
        Self::with_kind(name, PaintNodeKind::Pipeline { material, opacity })
    }

    pub fn color(name: &str, color: Color) -> Self {
        Self::with_kind(name, PaintNodeKind::Color(color))
    }

    fn with_kind(name: &str, kind: PaintNodeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            rectangles: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PaintNodeKind {
        &self.kind
    }

    pub fn rectangles(&self) -> &[TextureRectangle] {
        &self.rectangles
    }

    pub fn children(&self) -> &[PaintNode] {
        &self.children
    }

    /// Rectangle textured with the whole texture
    pub fn add_rectangle(&mut self, rect: ActorBox) {
        self.add_texture_rectangle(rect, 0.0, 0.0, 1.0, 1.0);
    }

    pub fn add_texture_rectangle(&mut self, rect: ActorBox, s1: f32, t1: f32, s2: f32, t2: f32) {
        self.rectangles.push(TextureRectangle { rect, s1, t1, s2, t2 });
    }

    pub fn add_child(&mut self, child: PaintNode) {
        self.children.push(child);
    }

    /// First node named `name`, depth first, including `self`
    pub fn find(&self, name: &str) -> Option<&PaintNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Every node named `name`, depth first
    pub fn find_all(&self, name: &str) -> Vec<&PaintNode> {
        let mut found = Vec::new();
        self.collect(name, &mut found);
        found
    }

    fn collect<'a>(&'a self, name: &str, found: &mut Vec<&'a PaintNode>) {
        if self.name == name {
            found.push(self);
        }
        for child in &self.children {
            child.collect(name, found);
        }
    }
}
