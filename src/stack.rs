//! Pixel-wise reduction of N aligned frames into one, with outlier
//! rejection, weighting, tile-parallel execution, and the incremental
//! stack-of-stacks accumulator used by the batch scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{NightlightError, Result};
use crate::stats;

/// Stacking mode. `Auto` resolves to a concrete mode based on frame count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackMode {
    Median,
    Mean,
    Sigma,
    WinsorSigma,
    #[serde(rename = "MADSigma")]
    MadSigma,
    LinearFit,
    Auto,
}

impl Default for StackMode {
    fn default() -> Self {
        StackMode::Auto
    }
}

/// Per-frame weighting scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weighting {
    None,
    ByExposure,
    ByInverseNoise,
    #[serde(rename = "ByInverseHFR")]
    ByInverseHfr,
}

impl Default for Weighting {
    fn default() -> Self {
        Weighting::None
    }
}

/// Resolve `Auto` to a concrete mode given the frame count.
pub fn resolve_mode(mode: StackMode, n: usize) -> StackMode {
    match mode {
        StackMode::Auto => {
            if n >= 25 {
                StackMode::LinearFit
            } else if n >= 15 {
                StackMode::WinsorSigma
            } else if n >= 6 {
                StackMode::Sigma
            } else {
                StackMode::Mean
            }
        }
        other => other,
    }
}

/// `w = 1/(1 + 4*(n - n_min)/(n_max - n_min))`, used for both
/// `ByInverseNoise` and `ByInverseHFR` (same mapping, different input).
pub fn weights_by_inverse(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let (n_min, n_max) = values.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(mn, mx), &v| (mn.min(v), mx.max(v)));
    if (n_max - n_min).abs() < 1e-12 {
        return vec![1.0; values.len()];
    }
    values.iter().map(|&n| 1.0 / (1.0 + 4.0 * (n - n_min) / (n_max - n_min))).collect()
}

pub fn weights_by_exposure(exposures: &[f64]) -> Vec<f32> {
    exposures.iter().map(|&e| e as f32).collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StackConfig {
    pub mode: StackMode,
    pub weighting: Weighting,
    pub sigma_low: f64,
    pub sigma_high: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackReport {
    pub clipped_low: u64,
    pub clipped_high: u64,
}

fn median_of(values: &[f32]) -> f32 {
    stats::median(&mut values.to_vec())
}

fn mean_of(values: &[f32], weights: Option<&[f32]>) -> f32 {
    match weights {
        Some(w) if !w.is_empty() => {
            let mut sum = 0.0f64;
            let mut wsum = 0.0f64;
            for (&v, &wt) in values.iter().zip(w) {
                sum += v as f64 * wt as f64;
                wsum += wt as f64;
            }
            if wsum > 0.0 { (sum / wsum) as f32 } else { mean_of(values, None) }
        }
        _ => (values.iter().map(|&v| v as f64).sum::<f64>() / values.len().max(1) as f64) as f32,
    }
}

/// Sigma: iteratively reject outside `[median - sigma_low*sd, median +
/// sigma_high*sd]` using median+stddev of the surviving set, until no
/// rejections remain or at most one sample is left; return the mean of
/// survivors.
fn sigma_reduce(values: &[f32], sigma_low: f64, sigma_high: f64) -> (f32, u32, u32) {
    let mut v = values.to_vec();
    let mut low_clips = 0u32;
    let mut high_clips = 0u32;
    loop {
        if v.len() <= 1 {
            break;
        }
        let med = median_of(&v) as f64;
        let sd = stats::variance(&v, med).sqrt();
        if sd < 1e-12 {
            break;
        }
        let lo = med - sigma_low * sd;
        let hi = med + sigma_high * sd;
        let mut kept = Vec::with_capacity(v.len());
        let (mut rl, mut rh) = (0u32, 0u32);
        for &x in &v {
            let xf = x as f64;
            if xf < lo {
                rl += 1;
            } else if xf > hi {
                rh += 1;
            } else {
                kept.push(x);
            }
        }
        if rl == 0 && rh == 0 {
            break;
        }
        low_clips += rl;
        high_clips += rh;
        v = kept;
    }
    (mean_of(&v, None), low_clips, high_clips)
}

/// WinsorSigma: like Sigma, but the scale at each iteration comes from a
/// winsorized copy of the surviving set — outliers replaced with the clip
/// bound rather than dropped — re-winsorized until the scale stabilizes
/// (`|Δs|/s <= 5e-4`) or nothing changes, multiplying `s` by `WINSOR_NORM`
/// each winsorization round; then reject using that scale and continue.
fn winsor_sigma_reduce(values: &[f32], sigma_low: f64, sigma_high: f64) -> (f32, u32, u32) {
    let mut v = values.to_vec();
    let mut low_clips = 0u32;
    let mut high_clips = 0u32;
    loop {
        if v.len() <= 1 {
            break;
        }
        let med = median_of(&v) as f64;
        let mut s = stats::variance(&v, med).sqrt();
        if s < 1e-12 {
            break;
        }
        loop {
            let lo = med - sigma_low * s;
            let hi = med + sigma_high * s;
            let mut winsorized = v.clone();
            let mut changed = false;
            for x in winsorized.iter_mut() {
                let xf = *x as f64;
                if xf < lo {
                    *x = lo as f32;
                    changed = true;
                } else if xf > hi {
                    *x = hi as f32;
                    changed = true;
                }
            }
            let new_s = stats::variance(&winsorized, med).sqrt() * stats::WINSOR_NORM;
            let rel = if s > 1e-12 { (new_s - s).abs() / s } else { 0.0 };
            s = new_s;
            if !changed || rel <= 5e-4 {
                break;
            }
        }
        let lo = med - sigma_low * s;
        let hi = med + sigma_high * s;
        let mut kept = Vec::with_capacity(v.len());
        let (mut rl, mut rh) = (0u32, 0u32);
        for &x in &v {
            let xf = x as f64;
            if xf < lo {
                rl += 1;
            } else if xf > hi {
                rh += 1;
            } else {
                kept.push(x);
            }
        }
        if rl == 0 && rh == 0 {
            break;
        }
        low_clips += rl;
        high_clips += rh;
        v = kept;
    }
    (mean_of(&v, None), low_clips, high_clips)
}

/// MADSigma: a single pass — median + MAD give the scale directly, reject
/// outside the bound, return the mean of survivors.
fn mad_sigma_reduce(values: &[f32], sigma_low: f64, sigma_high: f64) -> (f32, u32, u32) {
    let v = values.to_vec();
    let med = median_of(&v) as f64;
    let mut dev: Vec<f32> = v.iter().map(|&x| (x as f64 - med).abs() as f32).collect();
    let mad = stats::median(&mut dev) as f64;
    let s = stats::MAD_NORM * mad;
    let lo = med - sigma_low * s;
    let hi = med + sigma_high * s;
    let mut sum = 0.0f64;
    let mut cnt = 0u32;
    let (mut rl, mut rh) = (0u32, 0u32);
    for &x in &v {
        let xf = x as f64;
        if xf < lo {
            rl += 1;
        } else if xf > hi {
            rh += 1;
        } else {
            sum += xf;
            cnt += 1;
        }
    }
    let mean = if cnt > 0 { sum / cnt as f64 } else { med };
    (mean as f32, rl, rh)
}

/// LinearFit: sort, fit `y = slope*i + intercept`, compute mean absolute
/// residual sigma, reject residuals outside `[-sigma_low*sigma,
/// sigma_high*sigma]`, repeat until no rejections or fewer than 3 points.
fn linear_fit_reduce(values: &[f32], sigma_low: f64, sigma_high: f64) -> (f32, u32, u32) {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mut low_clips = 0u32;
    let mut high_clips = 0u32;
    loop {
        if v.len() < 3 {
            break;
        }
        let xs: Vec<f64> = (0..v.len()).map(|i| i as f64).collect();
        let ys: Vec<f64> = v.iter().map(|&x| x as f64).collect();
        let (slope, intercept, ..) = stats::linear_regression(&xs, &ys);
        let residuals: Vec<f64> = xs.iter().zip(&ys).map(|(&x, &y)| y - (slope * x + intercept)).collect();
        let sigma = residuals.iter().map(|r| r.abs()).sum::<f64>() / residuals.len() as f64;
        if sigma < 1e-12 {
            break;
        }
        let mut kept = Vec::with_capacity(v.len());
        let (mut rl, mut rh) = (0u32, 0u32);
        for (&y, &r) in ys.iter().zip(&residuals) {
            if r < -sigma_low * sigma {
                rl += 1;
            } else if r > sigma_high * sigma {
                rh += 1;
            } else {
                kept.push(y as f32);
            }
        }
        if rl == 0 && rh == 0 {
            break;
        }
        low_clips += rl;
        high_clips += rh;
        v = kept;
    }
    (mean_of(&v, None), low_clips, high_clips)
}

fn reduce_pixel(values: &[f32], weights: Option<&[f32]>, loc_ref: f32, mode: StackMode, sigma_low: f64, sigma_high: f64) -> (f32, u32, u32) {
    if values.is_empty() {
        return (loc_ref, 0, 0);
    }
    match mode {
        StackMode::Median => (median_of(values), 0, 0),
        StackMode::Mean => (mean_of(values, weights), 0, 0),
        StackMode::Sigma => sigma_reduce(values, sigma_low, sigma_high),
        StackMode::WinsorSigma => winsor_sigma_reduce(values, sigma_low, sigma_high),
        StackMode::MadSigma => mad_sigma_reduce(values, sigma_low, sigma_high),
        StackMode::LinearFit => linear_fit_reduce(values, sigma_low, sigma_high),
        StackMode::Auto => unreachable!("Auto must be resolved before reduce_pixel"),
    }
}

/// Stack N equally sized float32 planes into one, tile-parallelized with
/// concurrency capped at `n_cpu`. `weights`, if present, must have one
/// entry per plane. `progress`, if present, is called after each tile
/// with `(tiles_done, tiles_total)`.
pub fn stack_planes(
    planes: &[&[f32]],
    weights: Option<&[f32]>,
    loc_ref: f32,
    cfg: &StackConfig,
    n_cpu: usize,
    progress: Option<&(dyn Fn(usize, usize) + Sync)>,
) -> Result<(Vec<f32>, StackReport)> {
    let n = planes.len();
    if n == 0 {
        return Err(NightlightError::Shape("stack_planes called with zero input frames".into()));
    }
    let p = planes[0].len();
    for pl in planes {
        if pl.len() != p {
            return Err(NightlightError::Shape("stack_planes: plane length mismatch between input frames".into()));
        }
    }
    if let Some(w) = weights {
        if w.len() != n {
            return Err(NightlightError::Shape("stack_planes: weight count does not match frame count".into()));
        }
    }
    let mode = resolve_mode(cfg.mode, n);
    if !matches!(mode, StackMode::Mean) && weights.is_some() && !matches!(cfg.weighting, Weighting::None) {
        return Err(NightlightError::Configuration(format!("{mode:?} stacking does not support per-frame weighting")));
    }

    const TILE_TARGET: usize = 2 * 1024 * 1024;
    let min_tiles = (8 * n_cpu.max(1)).max(1);
    let mut tile_len = TILE_TARGET.min(p.max(1));
    let mut tile_count = p.div_ceil(tile_len.max(1));
    if tile_count < min_tiles && p > 0 {
        tile_len = (p / min_tiles).max(1);
        tile_count = p.div_ceil(tile_len);
    }

    let mut out = vec![0f32; p];
    let clipped_low = AtomicU64::new(0);
    let clipped_high = AtomicU64::new(0);
    let done = std::sync::atomic::AtomicUsize::new(0);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_cpu.max(1))
        .build()
        .map_err(|e| NightlightError::Capacity(format!("failed to build stacking worker pool: {e}")))?;

    pool.install(|| {
        let mut chunks = Vec::with_capacity(tile_count);
        let mut remaining = &mut out[..];
        let mut offset = 0usize;
        while offset < p {
            let len = tile_len.min(p - offset);
            let (chunk, rest) = remaining.split_at_mut(len);
            chunks.push((offset, chunk));
            remaining = rest;
            offset += len;
        }

        chunks.into_par_iter().for_each(|(offset, chunk)| {
            let mut sample = Vec::with_capacity(n);
            let mut sample_w = Vec::with_capacity(n);
            for (local_idx, out_px) in chunk.iter_mut().enumerate() {
                let p_idx = offset + local_idx;
                sample.clear();
                sample_w.clear();
                for (fi, pl) in planes.iter().enumerate() {
                    let v = pl[p_idx];
                    if v.is_finite() {
                        sample.push(v);
                        if let Some(w) = weights {
                            sample_w.push(w[fi]);
                        }
                    }
                }
                let w_slice = if weights.is_some() { Some(sample_w.as_slice()) } else { None };
                let (value, low, high) = reduce_pixel(&sample, w_slice, loc_ref, mode, cfg.sigma_low, cfg.sigma_high);
                *out_px = value;
                if low > 0 {
                    clipped_low.fetch_add(low as u64, Ordering::Relaxed);
                }
                if high > 0 {
                    clipped_high.fetch_add(high as u64, Ordering::Relaxed);
                }
            }
            let n_done = done.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(cb) = progress {
                cb(n_done, tile_count);
            }
        });
    });

    Ok((out, StackReport {
        clipped_low: clipped_low.load(Ordering::Relaxed),
        clipped_high: clipped_high.load(Ordering::Relaxed),
    }))
}

/// Running accumulator for the incremental stack-of-stacks.
#[derive(Debug, Clone)]
pub struct RunningStack {
    pub sum: Vec<f64>,
    pub total_weight: f64,
    pub total_exposure: f64,
}

/// `stack_incremental`: allocate on first call, element-wise add
/// `batch * weight` thereafter; also accumulates exposure.
pub fn stack_incremental(running: &mut Option<RunningStack>, batch: &[f32], weight: f64, exposure: f64) {
    match running {
        None => {
            let sum: Vec<f64> = batch.iter().map(|&v| v as f64 * weight).collect();
            *running = Some(RunningStack { sum, total_weight: weight, total_exposure: exposure });
        }
        Some(r) => {
            for (s, &b) in r.sum.iter_mut().zip(batch) {
                *s += b as f64 * weight;
            }
            r.total_weight += weight;
            r.total_exposure += exposure;
        }
    }
}

/// `stack_incremental_finalize`: divide by `total_weight` (falling back to
/// the accumulator's own running weight if the caller passes zero).
pub fn stack_incremental_finalize(running: RunningStack, total_weight: f64) -> (Vec<f32>, f64) {
    let w = if total_weight.abs() > 1e-12 { total_weight } else { running.total_weight };
    let out: Vec<f32> = running.sum.iter().map(|&s| (s / w) as f32).collect();
    (out, running.total_exposure)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(mode: StackMode) -> StackConfig {
        StackConfig { mode, weighting: Weighting::None, sigma_low: 2.75, sigma_high: 2.75 }
    }

    #[test]
    fn single_frame_stack_is_identity() {
        let plane = vec![1.0f32, 2.0, 3.0, 4.0];
        let (out, report) = stack_planes(&[&plane], None, 0.0, &cfg(StackMode::Auto), 2, None).unwrap();
        assert_eq!(out, plane);
        assert_eq!(report, StackReport::default());
    }

    #[test]
    fn stack_median_of_identical_frames_is_identity() {
        let plane = vec![1.0f32, 5.0, -2.0, 9.0];
        let planes: Vec<&[f32]> = vec![&plane, &plane, &plane, &plane, &plane];
        let (out, _) = stack_planes(&planes, None, 0.0, &cfg(StackMode::Median), 2, None).unwrap();
        assert_eq!(out, plane);
    }

    #[test]
    fn stack_mean_matches_arithmetic_mean() {
        let a = vec![1.0f32, 2.0];
        let b = vec![3.0f32, 4.0];
        let c = vec![5.0f32, 6.0];
        let planes: Vec<&[f32]> = vec![&a, &b, &c];
        let (out, _) = stack_planes(&planes, None, 0.0, &cfg(StackMode::Mean), 2, None).unwrap();
        assert_eq!(out, vec![3.0, 4.0]);
    }

    #[test]
    fn stack_mean_substitutes_loc_ref_when_all_nan() {
        let a = vec![f32::NAN];
        let b = vec![f32::NAN];
        let planes: Vec<&[f32]> = vec![&a, &b];
        let (out, _) = stack_planes(&planes, None, 42.0, &cfg(StackMode::Mean), 2, None).unwrap();
        assert_eq!(out, vec![42.0]);
    }

    #[test]
    fn mad_sigma_rejects_single_outlier() {
        let values = [1.0f32, 2.0, 3.0, 4.0, 1000.0];
        let planes: Vec<&[f32]> = values.iter().map(std::slice::from_ref).collect();
        let (out, report) = stack_planes(&planes, None, 0.0, &cfg(StackMode::MadSigma).clamp_sigma(3.0, 3.0), 2, None).unwrap();
        assert!((out[0] - 2.5).abs() < 1e-3, "expected mean of 1,2,3,4 got {}", out[0]);
        assert_eq!(report.clipped_high, 1);
        assert_eq!(report.clipped_low, 0);
    }

    #[test]
    fn non_mean_modes_reject_per_frame_weighting() {
        let a = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![2.0f32, 3.0, 4.0, 5.0, 6.0, 7.0];
        let planes: Vec<&[f32]> = vec![&a, &b];
        let weights = vec![1.0f32, 2.0];
        let mut sigma_cfg = cfg(StackMode::Sigma);
        sigma_cfg.weighting = Weighting::ByExposure;
        let err = stack_planes(&planes, Some(&weights), 0.0, &sigma_cfg, 2, None).unwrap_err();
        assert!(matches!(err, NightlightError::Configuration(_)));
    }

    #[test]
    fn unknown_stack_mode_is_a_configuration_error_at_json_layer() {
        let err = serde_json::from_str::<StackMode>("\"unknown\"").unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
    }

    #[test]
    fn incremental_stack_matches_single_batch_when_accumulator_was_empty() {
        let batch = vec![2.0f32, 4.0, 6.0];
        let mut running = None;
        stack_incremental(&mut running, &batch, 3.0, 10.0);
        let (out, exposure) = stack_incremental_finalize(running.unwrap(), 3.0);
        assert_eq!(out, batch);
        assert_eq!(exposure, 10.0);
    }

    impl StackConfig {
        fn clamp_sigma(mut self, low: f64, high: f64) -> Self {
            self.sigma_low = low;
            self.sigma_high = high;
            self
        }
    }
}
