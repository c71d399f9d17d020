//! Value types shared by every hires crate.
//!
//! All request-facing values are validated at construction: a [`ModelVariant`]
//! or [`Scale`] that exists is, by definition, supported.  Parsing is the only
//! place `InvalidModel` / `InvalidScale` can originate.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HiresError, Result};

/// Decoded raster image.  Channel depth and alpha are preserved as decoded.
pub type PixelBuffer = image::DynamicImage;

// ─── Model variants ──────────────────────────────────────────────────────────

/// Fixed RRDB architecture parameters for one model variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ArchParams {
    /// Input channels.
    pub num_in_ch: u32,
    /// Output channels.
    pub num_out_ch: u32,
    /// Feature width.
    pub num_feat: u32,
    /// Residual-in-residual dense block count.
    pub num_block: u32,
    /// Dense block growth channels.
    pub num_grow_ch: u32,
}

/// Supported super-resolution network configurations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ModelVariant {
    /// General-purpose photographic model, 23 RRDB blocks.
    #[default]
    X4Plus,
    /// Lightweight anime/illustration model, 6 RRDB blocks.
    X4PlusAnime6B,
}

impl ModelVariant {
    /// Every supported variant, in presentation order.
    pub const ALL: [ModelVariant; 2] = [Self::X4Plus, Self::X4PlusAnime6B];

    /// Canonical request name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::X4Plus => "RealESRGAN_x4plus",
            Self::X4PlusAnime6B => "RealESRGAN_x4plus_anime_6B",
        }
    }

    pub const fn architecture(self) -> ArchParams {
        let num_block = match self {
            Self::X4Plus => 23,
            Self::X4PlusAnime6B => 6,
        };
        ArchParams {
            num_in_ch: 3,
            num_out_ch: 3,
            num_feat: 64,
            num_block,
            num_grow_ch: 32,
        }
    }

    /// Magnification the network produces natively, before output rescaling.
    pub const fn native_scale(self) -> u32 {
        4
    }

    /// File name of the exported ONNX weights, both in the local cache and remotely.
    pub fn weights_file(self) -> String {
        format!("{}.onnx", self.name())
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelVariant {
    type Err = HiresError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.name() == s)
            .ok_or_else(|| HiresError::InvalidModel(s.to_string()))
    }
}

impl Serialize for ModelVariant {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

// ─── Scale ───────────────────────────────────────────────────────────────────

/// Requested output magnification, always one of 2, 3 or 4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "u32")]
pub struct Scale(u32);

impl Scale {
    pub const SUPPORTED: [u32; 3] = [2, 3, 4];

    pub fn new(factor: u32) -> Result<Self> {
        if Self::SUPPORTED.contains(&factor) {
            Ok(Self(factor))
        } else {
            Err(HiresError::InvalidScale(factor))
        }
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self(4)
    }
}

impl From<Scale> for u32 {
    fn from(scale: Scale) -> Self {
        scale.0
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Session identity ────────────────────────────────────────────────────────

/// Unique token naming one request's upload/result/archive artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Strictly parse a caller-supplied id.  Anything that is not a UUID cannot
    /// name a session, so it is reported as `SessionNotFound`.
    pub fn parse(raw: &str) -> Result<Self> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| HiresError::SessionNotFound(raw.to_string()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = HiresError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ─── Devices ─────────────────────────────────────────────────────────────────

/// Compute device an engine is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Discrete NVIDIA accelerator.
    Cuda,
    /// Apple integrated accelerator (Metal Performance Shaders).
    Mps,
    /// General-purpose processor.
    Cpu,
}

impl DeviceKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Mps => "mps",
            Self::Cpu => "cpu",
        }
    }

    pub const fn is_accelerator(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DeviceKind {
    type Err = HiresError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "mps" | "metal" => Ok(Self::Mps),
            "cpu" => Ok(Self::Cpu),
            other => Err(HiresError::Config(format!(
                "Unknown device '{other}'. Use cuda, mps or cpu."
            ))),
        }
    }
}

// ─── Engine configuration ────────────────────────────────────────────────────

/// Where an engine loads its weights from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WeightsSource {
    /// Already present in the local weights cache.
    Local(PathBuf),
    /// Must be fetched; `cache_path` is where the download lands.
    Remote { url: String, cache_path: PathBuf },
}

/// Everything an [`EngineFactory`](crate::backend::EngineFactory) needs to build one engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub variant: ModelVariant,
    pub arch: ArchParams,
    pub native_scale: u32,
    pub weights: WeightsSource,
    pub device: DeviceKind,
    /// Reduced precision; only ever set on accelerators.
    pub half: bool,
}

/// Per-call engine knobs.  These are the mutable fields of a model handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnhanceParams {
    /// Final magnification relative to the input.
    pub outscale: u32,
    /// Tile window in input pixels; 0 disables tiling.
    pub tile: u32,
    /// Overlap added around every tile.
    pub tile_pad: u32,
    /// Edge padding added before inference and cropped afterwards.
    pub pre_pad: u32,
}

impl EnhanceParams {
    pub const DEFAULT_TILE_PAD: u32 = 10;

    pub const fn untiled(outscale: u32) -> Self {
        Self {
            outscale,
            tile: 0,
            tile_pad: Self::DEFAULT_TILE_PAD,
            pre_pad: 0,
        }
    }
}
