use serde::{Deserialize, Serialize};

use crate::common::{deg_to_rad, RECORD_FIELDS, SH_REST_COUNT};
use crate::error::ConversionError;

/// One Gaussian splat sample, fields in wire order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRecord {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
    pub sh_rest: [f32; SH_REST_COUNT],
    pub opacity: f32,
    pub scale: [f32; 3],
    pub rotation: [f32; 4],
}

impl Default for PointRecord {
    fn default() -> Self {
        PointRecord {
            position: [0.0; 3],
            normal: [0.0; 3],
            color: [0.0; 3],
            sh_rest: [0.0; SH_REST_COUNT],
            opacity: 0.0,
            scale: [0.0; 3],
            rotation: [0.0; 4],
        }
    }
}

impl PointRecord {
    pub fn fields(&self) -> [f32; RECORD_FIELDS] {
        let mut out = [0.0f32; RECORD_FIELDS];
        let parts: [&[f32]; 7] = [
            &self.position,
            &self.normal,
            &self.color,
            &self.sh_rest,
            std::slice::from_ref(&self.opacity),
            &self.scale,
            &self.rotation,
        ];
        let mut offset = 0;
        for part in parts {
            out[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }
        out
    }

    pub fn from_fields(f: &[f32; RECORD_FIELDS]) -> Self {
        let mut r = PointRecord::default();
        r.position.copy_from_slice(&f[0..3]);
        r.normal.copy_from_slice(&f[3..6]);
        r.color.copy_from_slice(&f[6..9]);
        r.sh_rest.copy_from_slice(&f[9..54]);
        r.opacity = f[54];
        r.scale.copy_from_slice(&f[55..58]);
        r.rotation.copy_from_slice(&f[58..62]);
        r
    }
}

/// Packed deletion flags: record `i` lives in word `i >> 5`, bit `i & 31`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionMask {
    words: Vec<u32>,
    len: usize,
}

impl DeletionMask {
    pub fn new(len: usize) -> Self {
        DeletionMask {
            words: vec![0; len.div_ceil(32)],
            len,
        }
    }

    /// Wraps words produced elsewhere (e.g. a GPU readback). Missing words read as "not deleted".
    pub fn from_words(words: Vec<u32>, len: usize) -> Self {
        DeletionMask { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[inline]
    pub fn is_deleted(&self, index: usize) -> bool {
        self.words
            .get(index >> 5)
            .is_some_and(|w| w & (1u32 << (index & 31)) != 0)
    }

    pub fn set_deleted(&mut self, index: usize, deleted: bool) {
        let word = index >> 5;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.len = self.len.max(index + 1);
        let bit = 1u32 << (index & 31);
        if deleted {
            self.words[word] |= bit;
        } else {
            self.words[word] &= !bit;
        }
    }

    pub fn count_deleted(&self) -> usize {
        (0..self.len).filter(|&i| self.is_deleted(i)).count()
    }
}

/// The live point-cloud collaborator that supplies splat data at export time.
pub trait PointSource {
    fn point_count(&self) -> usize;
    fn position(&self, index: usize) -> [f32; 3];
    fn normal(&self, index: usize) -> [f32; 3];
    fn color(&self, index: usize) -> [f32; 3];
    fn sh_rest(&self, index: usize) -> [f32; SH_REST_COUNT];
    fn opacity(&self, index: usize) -> f32;
    fn scale(&self, index: usize) -> [f32; 3];
    fn rotation(&self, index: usize) -> [f32; 4];
    fn is_deleted(&self, index: usize) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointSet {
    pub records: Vec<PointRecord>,
    pub deleted: DeletionMask,
}

impl PointSet {
    pub fn new(records: Vec<PointRecord>) -> Self {
        let deleted = DeletionMask::new(records.len());
        PointSet { records, deleted }
    }

    pub fn with_mask(records: Vec<PointRecord>, deleted: DeletionMask) -> Self {
        PointSet { records, deleted }
    }

    /// Snapshots a source into an owned set.
    pub fn from_source<S: PointSource + ?Sized>(source: &S) -> Self {
        let n = source.point_count();
        let mut deleted = DeletionMask::new(n);
        let records = (0..n)
            .map(|i| {
                if source.is_deleted(i) {
                    deleted.set_deleted(i, true);
                }
                PointRecord {
                    position: source.position(i),
                    normal: source.normal(i),
                    color: source.color(i),
                    sh_rest: source.sh_rest(i),
                    opacity: source.opacity(i),
                    scale: source.scale(i),
                    rotation: source.rotation(i),
                }
            })
            .collect();
        PointSet { records, deleted }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl PointSource for PointSet {
    fn point_count(&self) -> usize {
        self.records.len()
    }
    fn position(&self, index: usize) -> [f32; 3] {
        self.records[index].position
    }
    fn normal(&self, index: usize) -> [f32; 3] {
        self.records[index].normal
    }
    fn color(&self, index: usize) -> [f32; 3] {
        self.records[index].color
    }
    fn sh_rest(&self, index: usize) -> [f32; SH_REST_COUNT] {
        self.records[index].sh_rest
    }
    fn opacity(&self, index: usize) -> f32 {
        self.records[index].opacity
    }
    fn scale(&self, index: usize) -> [f32; 3] {
        self.records[index].scale
    }
    fn rotation(&self, index: usize) -> [f32; 4] {
        self.records[index].rotation
    }
    fn is_deleted(&self, index: usize) -> bool {
        self.deleted.is_deleted(index)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
pub enum TextureSize {
    Size512 = 512,
    Size1024 = 1024,
    #[default]
    Size2048 = 2048,
    Size4096 = 4096,
    Size8192 = 8192,
}

impl TextureSize {
    pub const ALL: [TextureSize; 5] = [
        TextureSize::Size512,
        TextureSize::Size1024,
        TextureSize::Size2048,
        TextureSize::Size4096,
        TextureSize::Size8192,
    ];

    pub fn pixels(self) -> u32 {
        self as u32
    }

    pub fn label(self) -> &'static str {
        match self {
            TextureSize::Size512 => "0.5K",
            TextureSize::Size1024 => "1K",
            TextureSize::Size2048 => "2K",
            TextureSize::Size4096 => "4K",
            TextureSize::Size8192 => "8K",
        }
    }
}

impl TryFrom<u32> for TextureSize {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        TextureSize::ALL
            .into_iter()
            .find(|t| t.pixels() == value)
            .ok_or_else(|| {
                format!(
                    "unsupported texture size {} (expected one of 512, 1024, 2048, 4096, 8192)",
                    value
                )
            })
    }
}

impl From<TextureSize> for u32 {
    fn from(t: TextureSize) -> u32 {
        t.pixels()
    }
}

/// Per-request knobs for the conversion service. The angle is already in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionParameters {
    pub min_detail_size: f32,
    pub simplify: f32,
    pub angle_limit_radians: f32,
    pub texture_size: TextureSize,
}

impl Default for ConversionParameters {
    fn default() -> Self {
        ConversionParameters {
            min_detail_size: 0.01,
            simplify: 0.0,
            angle_limit_radians: deg_to_rad(60.0),
            texture_size: TextureSize::Size2048,
        }
    }
}

impl ConversionParameters {
    pub fn validate(&self) -> Result<(), ConversionError> {
        if !self.min_detail_size.is_finite() || self.min_detail_size < 0.0 {
            return Err(ConversionError::InvalidParameters(format!(
                "min_detail_size must be a finite value >= 0, got {}",
                self.min_detail_size
            )));
        }
        if !(0.0..=1.0).contains(&self.simplify) {
            return Err(ConversionError::InvalidParameters(format!(
                "simplify must be within [0, 1], got {}",
                self.simplify
            )));
        }
        if !self.angle_limit_radians.is_finite() {
            return Err(ConversionError::InvalidParameters(format!(
                "angle_limit must be finite, got {}",
                self.angle_limit_radians
            )));
        }
        Ok(())
    }
}
