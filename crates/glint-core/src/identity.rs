//! Stable content-derived identities for shaders and pipeline resources.
//!
//! A [`ShaderIdentity`] is the 64-bit XXH3 hash of the exact bytecode bytes the
//! application handed to the runtime. It is not a pointer: two runtime shader
//! objects created from byte-identical blobs share one identity, and the same
//! blob loaded across process runs hashes to the same value. Everything keyed by
//! shader (visited sets, replacement records, on-disk override files) keys on
//! this.
//!
//! Resource identities (index buffers, render targets) deliberately hash only
//! descriptor fields, not contents: two distinct buffers with identical
//! descriptors collide. Hunting only needs "good enough" grouping, and the
//! on-disk override format depends on these exact values, so the weaker hash is
//! part of the contract.

use std::fmt;

use xxhash_rust::xxh3::xxh3_64;

/// 64-bit content hash of a shader's bytecode.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShaderIdentity(u64);

impl ShaderIdentity {
    /// Hashes the exact bytecode bytes. Deterministic and unsalted.
    pub fn of_bytecode(bytes: &[u8]) -> Self {
        Self(xxh3_64(bytes))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Parses the 16-hex-digit form used in override file names.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(Self)
    }
}

impl fmt::Display for ShaderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for ShaderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaderIdentity({:016x})", self.0)
    }
}

/// 64-bit descriptor hash of a non-shader pipeline resource.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceIdentity(u64);

impl ResourceIdentity {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceIdentity({:016x})", self.0)
    }
}

/// Shader pipeline stage. Only the stages participating in draw gating are
/// tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    /// Tag used in override file names (`<id>-vs_replace.txt`).
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Vertex => "vs",
            Self::Pixel => "ps",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "vs" => Some(Self::Vertex),
            "ps" => Some(Self::Pixel),
            _ => None,
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The four resource classes the hunting cursor iterates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    VertexShader,
    PixelShader,
    IndexBuffer,
    RenderTarget,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::VertexShader,
        ResourceClass::PixelShader,
        ResourceClass::IndexBuffer,
        ResourceClass::RenderTarget,
    ];

    pub const fn shader_stage(self) -> Option<ShaderStage> {
        match self {
            Self::VertexShader => Some(ShaderStage::Vertex),
            Self::PixelShader => Some(ShaderStage::Pixel),
            Self::IndexBuffer | Self::RenderTarget => None,
        }
    }
}

/// Descriptor of an index buffer as supplied at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferDesc {
    pub length: u32,
    pub usage: u32,
    pub format: u32,
    pub pool: u32,
}

impl IndexBufferDesc {
    /// Descriptor-only identity; see the module docs for why contents are
    /// intentionally excluded.
    pub fn identity(&self) -> ResourceIdentity {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.usage.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.format.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.pool.to_le_bytes());
        ResourceIdentity(xxh3_64(&bytes))
    }
}

/// Descriptor of a render-target surface as supplied at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub multisample: u32,
}

impl RenderTargetDesc {
    pub fn identity(&self) -> ResourceIdentity {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.width.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.height.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.format.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.multisample.to_le_bytes());
        ResourceIdentity(xxh3_64(&bytes))
    }
}
