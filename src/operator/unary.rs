//! Unary operators: N inputs -> N outputs, each built on
//! [`super::unary_make_promises`]. `Align` and `Save` delegate to small
//! backend traits since star-matching geometry and file codecs are
//! outside this crate's scope.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{AlignmentReference, ExecutionContext};
use crate::error::{NightlightError, Result};
use crate::image::Image;
use crate::promise::Promise;
use crate::stats;

use super::load::check_path_safe;
use super::{to_tagged_json, unary_make_promises, Operator};

/// `scaleOffset`: `data <- a*data + b`, via `Image::scale_offset`'s affine
/// stats update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleOffset {
    pub a: f32,
    pub b: f32,
}

impl Default for ScaleOffset {
    fn default() -> Self {
        ScaleOffset { a: 1.0, b: 0.0 }
    }
}

impl ScaleOffset {
    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let op: ScaleOffset = serde_json::from_value(value)?;
        Ok(Box::new(op))
    }
}

impl Operator for ScaleOffset {
    fn type_tag(&self) -> &'static str {
        "scaleOffset"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let (a, b) = (self.a, self.b);
        unary_make_promises(ins, ctx, move |mut img, _ctx| {
            img.scale_offset(a, b);
            Ok(Some(img))
        })
    }

    fn to_json(&self) -> Result<Value> {
        to_tagged_json(self.type_tag(), serde_json::to_value(self)?)
    }
}

/// `calibrate`: subtract the dark frame and divide by the flat frame, if
/// either is configured on the context. Both mutations clear the lazy
/// stats cache (non-affine — the dark/flat patterns vary per pixel).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Calibrate {}

impl Calibrate {
    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let op: Calibrate = serde_json::from_value(value)?;
        Ok(Box::new(op))
    }
}

impl Operator for Calibrate {
    fn type_tag(&self) -> &'static str {
        "calibrate"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        unary_make_promises(ins, ctx, move |mut img, ctx| {
            if let Some(dark) = ctx.dark_frame() {
                subtract_dark(&mut img, &dark)?;
            }
            if let Some(flat) = ctx.flat_frame() {
                apply_flat(&mut img, &flat)?;
            }
            Ok(Some(img))
        })
    }

    fn to_json(&self) -> Result<Value> {
        to_tagged_json(self.type_tag(), serde_json::to_value(self)?)
    }
}

fn subtract_dark(img: &mut Image, dark: &Image) -> Result<()> {
    if img.naxisn != dark.naxisn {
        return Err(NightlightError::Shape(format!(
            "calibrate: light frame shape {:?} does not match dark frame shape {:?}",
            img.naxisn, dark.naxisn
        )));
    }
    for (v, &d) in img.data.iter_mut().zip(&dark.data) {
        *v -= d;
    }
    img.stats.invalidate();
    Ok(())
}

fn apply_flat(img: &mut Image, flat: &Image) -> Result<()> {
    if img.naxisn != flat.naxisn {
        return Err(NightlightError::Shape(format!(
            "calibrate: light frame shape {:?} does not match flat frame shape {:?}",
            img.naxisn, flat.naxisn
        )));
    }
    let flat_mean = stats::min_mean_max(&flat.data).1;
    for (v, &f) in img.data.iter_mut().zip(&flat.data) {
        if f.abs() > 1e-12 {
            *v = *v * flat_mean / f;
        }
    }
    img.stats.invalidate();
    Ok(())
}

/// `neutralizeBackground`: stretch `[low, high]` percentiles of the
/// frame's own histogram to `[0, 1]`. The distilled design note flags an
/// upstream implementation that read the "low" bound twice by mistake;
/// this reads `low` and `high` each exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NeutralizeBackground {
    pub low: f32,
    pub high: f32,
}

impl Default for NeutralizeBackground {
    fn default() -> Self {
        NeutralizeBackground { low: 0.05, high: 0.95 }
    }
}

impl NeutralizeBackground {
    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let op: NeutralizeBackground = serde_json::from_value(value)?;
        Ok(Box::new(op))
    }
}

impl Operator for NeutralizeBackground {
    fn type_tag(&self) -> &'static str {
        "neutralizeBackground"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let (low, high) = (self.low, self.high);
        unary_make_promises(ins, ctx, move |mut img, _ctx| {
            let lo_val = stats::percentile(&img.data, low as f64) as f64;
            let hi_val = stats::percentile(&img.data, high as f64) as f64;
            let span = (hi_val - lo_val).max(1e-12);
            let a = (1.0 / span) as f32;
            let b = (-lo_val / span) as f32;
            img.scale_offset(a, b);
            Ok(Some(img))
        })
    }

    fn to_json(&self) -> Result<Value> {
        to_tagged_json(self.type_tag(), serde_json::to_value(self)?)
    }
}

/// `matchHist`: normalize a frame's location/scale to the published
/// histogram reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchHist {
    pub mode: String,
}

impl Default for MatchHist {
    fn default() -> Self {
        MatchHist { mode: "LocScale".to_string() }
    }
}

impl MatchHist {
    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let op: MatchHist = serde_json::from_value(value)?;
        if op.mode != "LocScale" {
            return Err(NightlightError::Configuration(format!("matchHist: unsupported mode \"{}\"", op.mode)));
        }
        Ok(Box::new(op))
    }
}

impl Operator for MatchHist {
    fn type_tag(&self) -> &'static str {
        "matchHist"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        unary_make_promises(ins, ctx, move |mut img, ctx| {
            let reference = ctx
                .histogram_ref()
                .ok_or_else(|| NightlightError::Reference("matchHist: no histogram reference has been published".into()))?;
            let (own_loc, own_scale) = img.stats.location_scale(&img.data.clone(), ctx.ls_estimator_mode);
            if own_scale.abs() < 1e-12 {
                return Ok(Some(img));
            }
            let ratio = reference.scale / own_scale as f64;
            let a = ratio as f32;
            let b = (reference.location - ratio * own_loc as f64) as f32;
            img.scale_offset(a, b);
            Ok(Some(img))
        })
    }

    fn to_json(&self) -> Result<Value> {
        to_tagged_json(self.type_tag(), serde_json::to_value(self)?)
    }
}

/// Out-of-bounds fill policy for alignment resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OobMode {
    #[serde(rename = "NaN")]
    Nan,
    Zero,
    Edge,
}

impl Default for OobMode {
    fn default() -> Self {
        OobMode::Nan
    }
}

/// Extension seam for alignment: star-centroid detection and
/// triangle-matching geometry are outside this crate's scope.
pub trait AlignmentBackend: Send + Sync {
    fn align(&self, img: &mut Image, reference: &AlignmentReference, oob: OobMode) -> Result<()>;
}

/// Default backend: leaves the frame's pixels untouched and records the
/// identity transform. Real implementations replace this with actual
/// star-matching and resampling.
pub struct IdentityAlignment;

impl AlignmentBackend for IdentityAlignment {
    fn align(&self, img: &mut Image, reference: &AlignmentReference, _oob: OobMode) -> Result<()> {
        if img.naxisn[..2.min(img.naxisn.len())] != reference.naxisn[..2.min(reference.naxisn.len())] {
            return Err(NightlightError::Shape(format!(
                "align: frame shape {:?} incompatible with reference shape {:?}",
                img.naxisn, reference.naxisn
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AlignParams {
    k: u32,
    threshold: f32,
    oob_mode: OobMode,
}

impl Default for AlignParams {
    fn default() -> Self {
        AlignParams { k: 20, threshold: 1.0, oob_mode: OobMode::default() }
    }
}

/// `align`: transforms each frame to the published alignment reference's
/// coordinate system.
pub struct Align {
    pub k: u32,
    pub threshold: f32,
    pub oob_mode: OobMode,
    backend: Arc<dyn AlignmentBackend>,
}

impl std::fmt::Debug for Align {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Align").field("k", &self.k).field("threshold", &self.threshold).field("oob_mode", &self.oob_mode).finish()
    }
}

impl Align {
    pub fn with_backend(k: u32, threshold: f32, oob_mode: OobMode, backend: Arc<dyn AlignmentBackend>) -> Self {
        Align { k, threshold, oob_mode, backend }
    }

    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let params: AlignParams = serde_json::from_value(value)?;
        Ok(Box::new(Align { k: params.k, threshold: params.threshold, oob_mode: params.oob_mode, backend: Arc::new(IdentityAlignment) }))
    }
}

impl Operator for Align {
    fn type_tag(&self) -> &'static str {
        "align"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let backend = Arc::clone(&self.backend);
        let oob = self.oob_mode;
        unary_make_promises(ins, ctx, move |mut img, ctx| {
            let reference = ctx
                .alignment_ref()
                .ok_or_else(|| NightlightError::Reference("align: no alignment reference has been published".into()))?;
            backend.align(&mut img, &reference, oob)?;
            Ok(Some(img))
        })
    }

    fn to_json(&self) -> Result<Value> {
        let body = serde_json::json!({ "k": self.k, "threshold": self.threshold, "oobMode": self.oob_mode });
        to_tagged_json(self.type_tag(), body)
    }
}

/// Output normalization applied before handing pixels to a save backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveMode {
    MinMax,
    AsIs,
}

impl Default for SaveMode {
    fn default() -> Self {
        SaveMode::MinMax
    }
}

/// Extension seam for output: FITS/TIFF/JPEG encoding is outside this
/// crate's scope.
pub trait SaveBackend: Send + Sync {
    fn save(&self, img: &Image, path: &Path, mode: SaveMode, gamma: f32) -> Result<()>;
}

/// Default backend: validates the path and otherwise does nothing. A real
/// implementation replaces this with an actual codec.
pub struct NullSaveBackend;

impl SaveBackend for NullSaveBackend {
    fn save(&self, _img: &Image, _path: &Path, _mode: SaveMode, _gamma: f32) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SaveParams {
    file_pattern: String,
    save_mode: SaveMode,
    gamma: f32,
}

impl Default for SaveParams {
    fn default() -> Self {
        SaveParams { file_pattern: "out_{id}".to_string(), save_mode: SaveMode::default(), gamma: 1.0 }
    }
}

/// `save`: writes each frame to a path derived from `filePattern`, with
/// `{id}` substituted for the frame's id.
pub struct Save {
    pub file_pattern: String,
    pub save_mode: SaveMode,
    pub gamma: f32,
    backend: Arc<dyn SaveBackend>,
}

impl std::fmt::Debug for Save {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Save").field("file_pattern", &self.file_pattern).field("save_mode", &self.save_mode).field("gamma", &self.gamma).finish()
    }
}

impl Save {
    pub fn with_backend(file_pattern: String, save_mode: SaveMode, gamma: f32, backend: Arc<dyn SaveBackend>) -> Self {
        Save { file_pattern, save_mode, gamma, backend }
    }

    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let params: SaveParams = serde_json::from_value(value)?;
        Ok(Box::new(Save { file_pattern: params.file_pattern, save_mode: params.save_mode, gamma: params.gamma, backend: Arc::new(NullSaveBackend) }))
    }
}

impl Operator for Save {
    fn type_tag(&self) -> &'static str {
        "save"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let pattern = self.file_pattern.clone();
        let mode = self.save_mode;
        let gamma = self.gamma;
        let backend = Arc::clone(&self.backend);
        unary_make_promises(ins, ctx, move |img, _ctx| {
            let resolved = pattern.replace("{id}", &img.id.to_string());
            check_path_safe(&resolved)?;
            backend.save(&img, &PathBuf::from(&resolved), mode, gamma)?;
            Ok(Some(img))
        })
    }

    fn to_json(&self) -> Result<Value> {
        let body = serde_json::json!({
            "filePattern": self.file_pattern,
            "saveMode": self.save_mode,
            "gamma": self.gamma,
        });
        to_tagged_json(self.type_tag(), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextParams, HistogramReference};

    fn ctx() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(ContextParams::default()))
    }

    #[test]
    fn calibrate_subtracts_dark_and_divides_flat() {
        let context = ctx();
        *context.dark_frame.write().unwrap() = Some(Arc::new(Image::new(-1, vec![2, 1], vec![1.0, 1.0])));
        *context.flat_frame.write().unwrap() = Some(Arc::new(Image::new(-2, vec![2, 1], vec![2.0, 2.0])));
        let op = Calibrate::default();
        let ins = vec![Promise::ready(Some(Image::new(0, vec![2, 1], vec![5.0, 9.0])))];
        let outs = op.make_promises(ins, &context).unwrap();
        let (results, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(err.is_none());
        assert_eq!(results[0].as_ref().unwrap().data, vec![4.0, 8.0]);
    }

    #[test]
    fn calibrate_rejects_shape_mismatch() {
        let context = ctx();
        *context.dark_frame.write().unwrap() = Some(Arc::new(Image::new(-1, vec![3, 1], vec![0.0, 0.0, 0.0])));
        let op = Calibrate::default();
        let ins = vec![Promise::ready(Some(Image::new(0, vec![2, 1], vec![1.0, 2.0])))];
        let outs = op.make_promises(ins, &context).unwrap();
        let (_, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(matches!(err, Some(NightlightError::Shape(_))));
    }

    #[test]
    fn neutralize_background_reads_low_and_high_independently() {
        let context = ctx();
        let op = NeutralizeBackground { low: 0.0, high: 1.0 };
        let data: Vec<f32> = (0..=10).map(|i| i as f32).collect();
        let ins = vec![Promise::ready(Some(Image::new(0, vec![11, 1], data)))];
        let outs = op.make_promises(ins, &context).unwrap();
        let (results, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(err.is_none());
        let out = &results[0].as_ref().unwrap().data;
        assert!((out[0] - 0.0).abs() < 1e-4);
        assert!((out[10] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn match_hist_requires_a_published_reference() {
        let context = ctx();
        let op = MatchHist::from_json(serde_json::json!({})).unwrap();
        let ins = vec![Promise::ready(Some(Image::new(0, vec![2, 1], vec![1.0, 2.0])))];
        let outs = op.make_promises(ins, &context).unwrap();
        let (_, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(matches!(err, Some(NightlightError::Reference(_))));
    }

    #[test]
    fn match_hist_normalizes_toward_published_location_and_scale() {
        let context = ctx();
        context.publish_histogram(|| Ok(HistogramReference { location: 100.0, scale: 10.0 })).unwrap();
        let op = MatchHist::from_json(serde_json::json!({})).unwrap();
        let data = vec![1.0f32, 2.0, 3.0, 4.0, 5.0];
        let ins = vec![Promise::ready(Some(Image::new(0, vec![5, 1], data)))];
        let outs = op.make_promises(ins, &context).unwrap();
        let (results, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(err.is_none());
        assert!(results[0].is_some());
    }

    #[test]
    fn save_rejects_unsafe_path() {
        let context = ctx();
        let op = Save::with_backend("/abs/{id}.fits".to_string(), SaveMode::MinMax, 1.0, Arc::new(NullSaveBackend));
        let ins = vec![Promise::ready(Some(Image::new(7, vec![1, 1], vec![1.0])))];
        let outs = op.make_promises(ins, &context).unwrap();
        let (_, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(matches!(err, Some(NightlightError::PathSafety(_))));
    }
}
