//! The `Image` data model: a frame plus its lazily-computed statistics
//! bundle, as described in the data model section of the job spec.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::stats::{self, LsEstimatorMode};

/// Conventional negative ids for calibration and reference frames.
pub const ID_DARK: i64 = -1;
pub const ID_FLAT: i64 = -2;
pub const ID_ALIGN_REF: i64 = -3;

/// A single FITS-style header value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Dates are kept as opaque RFC 3339-ish strings; real calendar
    /// handling belongs to the codec that produced the header.
    Date(String),
}

/// Keyword metadata carried alongside pixel data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    pub values: BTreeMap<String, HeaderValue>,
    pub comments: Vec<String>,
    pub history: Vec<String>,
}

impl Header {
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: HeaderValue) {
        self.values.insert(key.into(), value);
    }
}

/// Sign-tagged bit width, matching the FITS `BITPIX` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitPix {
    U8,
    U16,
    U32,
    F32,
    F64,
}

impl BitPix {
    pub fn code(self) -> i32 {
        match self {
            BitPix::U8 => 8,
            BitPix::U16 => 16,
            BitPix::U32 => 32,
            BitPix::F32 => -32,
            BitPix::F64 => -64,
        }
    }
}

/// Affine 2D transform to the reference frame's coordinate system.
/// `[x', y'] = [[a, b], [c, d]] * [x, y] + [e, f]`. Identity by default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform2D {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Default for Transform2D {
    fn default() -> Self {
        Transform2D { a: 1.0, b: 0.0, c: 0.0, d: 1.0, e: 0.0, f: 0.0 }
    }
}

impl Transform2D {
    pub fn is_identity(&self) -> bool {
        *self == Transform2D::default()
    }
}

/// One star detection. Opaque to the core beyond these three fields.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StarDetection {
    pub x: f64,
    pub y: f64,
    pub mass: f64,
    pub hfr: f64,
}

bitflags! {
    /// Which lazy `Stats` fields are stale and need recomputing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Dirty: u8 {
        const STD_DEV = 0b0001;
        const LOCATION = 0b0010;
        const SCALE    = 0b0100;
        const NOISE    = 0b1000;
    }
}

/// Lazily evaluated statistics bundle attached to an `Image`.
///
/// `min`/`mean`/`max` are eager (computed at load time). `std_dev`,
/// `location`, `scale`, and `noise` are computed on first access and
/// cached; the four `Dirty` bits gate recomputation independently.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub min: f32,
    pub mean: f32,
    pub max: f32,
    std_dev: f32,
    location: f32,
    scale: f32,
    noise: f32,
    dirty: Dirty,
}

impl Stats {
    /// Build the eager part of the bundle from raw pixel data; lazy
    /// fields start dirty.
    pub fn from_data(data: &[f32]) -> Self {
        let (min, mean, max) = stats::min_mean_max(data);
        Stats { min, mean, max, std_dev: 0.0, location: 0.0, scale: 0.0, noise: 0.0, dirty: Dirty::all() }
    }

    pub fn std_dev(&mut self, data: &[f32]) -> f32 {
        if self.dirty.contains(Dirty::STD_DEV) {
            self.std_dev = stats::variance(data, self.mean as f64).sqrt() as f32;
            self.dirty.remove(Dirty::STD_DEV);
        }
        self.std_dev
    }

    pub fn location_scale(&mut self, data: &[f32], mode: LsEstimatorMode) -> (f32, f32) {
        if self.dirty.intersects(Dirty::LOCATION | Dirty::SCALE) {
            let (loc, scale) = stats::estimate_location_scale(data, mode);
            self.location = loc as f32;
            self.scale = scale as f32;
            self.dirty.remove(Dirty::LOCATION | Dirty::SCALE);
        }
        (self.location, self.scale)
    }

    pub fn noise(&mut self, data: &[f32], row_width: usize) -> f32 {
        if self.dirty.contains(Dirty::NOISE) {
            self.noise = stats::noise_estimate(data, row_width) as f32;
            self.dirty.remove(Dirty::NOISE);
        }
        self.noise
    }

    /// Apply the documented affine update rule (`x <- a*x + b`) to every
    /// cached value instead of invalidating the cache. Noise, std_dev, and
    /// scale scale by `|a|`; location and the eager fields shift with the
    /// transform; min/max swap if `a` is negative.
    pub fn apply_affine(&mut self, a: f32, b: f32) {
        self.min = self.min * a + b;
        self.mean = self.mean * a + b;
        self.max = self.max * a + b;
        if a < 0.0 {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        if !self.dirty.contains(Dirty::STD_DEV) {
            self.std_dev *= a.abs();
        }
        if !self.dirty.contains(Dirty::LOCATION) {
            self.location = self.location * a + b;
        }
        if !self.dirty.contains(Dirty::SCALE) {
            self.scale *= a.abs();
        }
        if !self.dirty.contains(Dirty::NOISE) {
            self.noise *= a.abs();
        }
    }

    /// Any non-affine mutation of `data` must clear the whole cache.
    pub fn invalidate(&mut self) {
        self.dirty = Dirty::all();
    }
}

/// A frame: pixel data plus header and derived metadata.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: i64,
    pub file_name: Option<PathBuf>,
    pub header: Header,
    pub bitpix: BitPix,
    pub bzero: f64,
    pub bscale: f64,
    pub naxisn: Vec<usize>,
    pub data: Vec<f32>,
    pub exposure: f64,
    pub stats: Stats,
    pub stars: Vec<StarDetection>,
    pub hfr: f32,
    pub trans: Transform2D,
    pub residual: f32,
}

impl Image {
    pub fn new(id: i64, naxisn: Vec<usize>, data: Vec<f32>) -> Self {
        let stats = Stats::from_data(&data);
        Image {
            id,
            file_name: None,
            header: Header::default(),
            bitpix: BitPix::F32,
            bzero: 0.0,
            bscale: 1.0,
            naxisn,
            data,
            exposure: 0.0,
            stats,
            stars: Vec::new(),
            hfr: 0.0,
            trans: Transform2D::default(),
            residual: 0.0,
        }
    }

    pub fn pixels(&self) -> usize {
        self.naxisn.iter().product()
    }

    pub fn width(&self) -> usize {
        self.naxisn.first().copied().unwrap_or(0)
    }

    pub fn height(&self) -> usize {
        self.naxisn.get(1).copied().unwrap_or(0)
    }

    pub fn channels(&self) -> usize {
        self.naxisn.get(2).copied().unwrap_or(1)
    }

    pub fn plane_len(&self) -> usize {
        self.width() * self.height()
    }

    pub fn plane(&self, channel: usize) -> &[f32] {
        let p = self.plane_len();
        &self.data[channel * p..(channel + 1) * p]
    }

    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        let p = self.plane_len();
        &mut self.data[channel * p..(channel + 1) * p]
    }

    /// In-place affine rescale `data <- a*data + b`, with the stats cache
    /// kept correct via `Stats::apply_affine` rather than invalidated.
    pub fn scale_offset(&mut self, a: f32, b: f32) {
        for v in self.data.iter_mut() {
            *v = *v * a + b;
        }
        self.stats.apply_affine(a, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_layout_matches_naxisn() {
        let img = Image::new(1, vec![2, 3, 2], vec![0.0; 12]);
        assert_eq!(img.pixels(), 12);
        assert_eq!(img.plane_len(), 6);
        assert_eq!(img.channels(), 2);
    }

    #[test]
    fn scale_offset_updates_eager_stats_affinely() {
        let mut img = Image::new(1, vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(img.stats.min, 1.0);
        assert_eq!(img.stats.max, 4.0);
        img.scale_offset(2.0, 1.0);
        assert_eq!(img.data, vec![3.0, 5.0, 7.0, 9.0]);
        assert_eq!(img.stats.min, 3.0);
        assert_eq!(img.stats.max, 9.0);
        assert_eq!(img.stats.mean, (1.0f32 + 2.0 + 3.0 + 4.0) / 4.0 * 2.0 + 1.0);
    }

    #[test]
    fn negative_scale_swaps_min_and_max() {
        let mut img = Image::new(1, vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        img.scale_offset(-1.0, 0.0);
        assert_eq!(img.stats.min, -4.0);
        assert_eq!(img.stats.max, -1.0);
    }

    #[test]
    fn affine_update_matches_recompute_from_scratch() {
        let data = vec![1.0, 5.0, -3.0, 2.5, 0.0, 7.25];
        let mut img = Image::new(1, vec![6, 1], data.clone());
        // force lazy fields to populate before the affine transform
        img.stats.std_dev(&img.data.clone());
        img.stats.location_scale(&img.data.clone(), LsEstimatorMode::MeanStdDev);
        img.stats.noise(&img.data.clone(), 6);

        img.scale_offset(3.0, -1.0);

        let transformed: Vec<f32> = data.iter().map(|&v| v * 3.0 - 1.0).collect();
        let mut fresh = Stats::from_data(&transformed);
        let fresh_std = fresh.std_dev(&transformed);
        let (fresh_loc, fresh_scale) = fresh.location_scale(&transformed, LsEstimatorMode::MeanStdDev);
        let fresh_noise = fresh.noise(&transformed, 6);

        assert!((img.stats.std_dev - fresh_std).abs() < 1e-4);
        assert!((img.stats.location - fresh_loc).abs() < 1e-3);
        assert!((img.stats.scale - fresh_scale).abs() < 1e-3);
        assert!((img.stats.noise - fresh_noise).abs() < 1e-3);
    }
}
