//! Robust location/scale estimators over float32 arrays, plus the shared
//! selection/quantile primitives the stacking kernel also uses.
//!
//! All estimators here operate on finite values only; NaN and infinities
//! are filtered out before sampling or selection, per the pervasive NaN
//! policy ("selection operates only on finite subsets").

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Qn normalizing constant (consistency factor for Gaussian data).
pub const QN_NORM: f64 = 2.21914;
/// MAD normalizing constant.
pub const MAD_NORM: f64 = 1.4826;
/// Winsorizing normalizing constant.
pub const WINSOR_NORM: f64 = 1.134;

/// Fixed seed for the "deterministic fast PRNG seeded per call" rule:
/// every sampling call gets its own freshly seeded generator so results
/// are reproducible across runs and independent of call ordering.
const SAMPLE_SEED: u64 = 0x4e49_4748_544c_4946; // "NIGHTLIF" in hex-ish

fn sampling_rng() -> SmallRng {
    SmallRng::seed_from_u64(SAMPLE_SEED)
}

/// Estimator-selection enum for `Stats::location_scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LsEstimatorMode {
    MeanStdDev,
    #[serde(rename = "MedianMAD")]
    MedianMad,
    #[serde(rename = "IKSS")]
    Ikss,
    #[serde(rename = "SCMedianQn")]
    ScMedianQn,
    Histogram,
}

impl Default for LsEstimatorMode {
    fn default() -> Self {
        LsEstimatorMode::ScMedianQn
    }
}

/// Single-pass min/mean/max. NaN-propagating: if any sample is NaN, all
/// three outputs are NaN.
pub fn min_mean_max(data: &[f32]) -> (f32, f32, f32) {
    if data.is_empty() {
        return (f32::NAN, f32::NAN, f32::NAN);
    }
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f64;
    let mut has_nan = false;
    for &v in data {
        if v.is_nan() {
            has_nan = true;
        }
        sum += v as f64;
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    if has_nan {
        return (f32::NAN, f32::NAN, f32::NAN);
    }
    let mean = (sum / data.len() as f64) as f32;
    (min, mean, max)
}

/// Single-pass variance from a known mean.
pub fn variance(data: &[f32], mean: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = data.iter().map(|&v| {
        let d = v as f64 - mean;
        d * d
    }).sum();
    sum_sq / data.len() as f64
}

/// O(n) selection of the k-th smallest element (0-indexed). Mutates `data`.
pub fn quickselect(data: &mut [f32], k: usize) -> f32 {
    let k = k.min(data.len().saturating_sub(1));
    *data.select_nth_unstable_by(k, |a, b| a.partial_cmp(b).unwrap()).1
}

/// Median via quickselect; averages the two middle elements for even n.
pub fn median(data: &mut [f32]) -> f32 {
    let n = data.len();
    if n == 0 {
        return f32::NAN;
    }
    if n % 2 == 1 {
        quickselect(data, n / 2)
    } else {
        let hi = quickselect(data, n / 2);
        let lo = data[..n / 2].iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (hi + lo) / 2.0
    }
}

fn finite_copy(data: &[f32]) -> Vec<f32> {
    data.iter().copied().filter(|v| v.is_finite()).collect()
}

/// Percentile (linear index, nearest-rank) over the finite subset of `data`.
pub fn percentile(data: &[f32], q: f64) -> f32 {
    let mut v = finite_copy(data);
    if v.is_empty() {
        return f32::NAN;
    }
    let q = q.clamp(0.0, 1.0);
    let idx = ((v.len() - 1) as f64 * q).round() as usize;
    quickselect(&mut v, idx)
}

fn sample_up_to(data: &[f32], n: usize) -> Vec<f32> {
    if data.len() <= n {
        return data.to_vec();
    }
    let mut rng = sampling_rng();
    let idx = rand::seq::index::sample(&mut rng, data.len(), n);
    idx.into_iter().map(|i| data[i]).collect()
}

/// Size of the reservoir sample median_absolute_deviation / sigma_clipped
/// initialization draw from.
pub const SAMPLE_SIZE: usize = 2048;
/// Size of the reservoir sample Qn's pairwise differences are drawn from;
/// 512 choose 2 = 130,816 pairs, matching the spec's "~128K samples" budget.
const QN_SAMPLE_N: usize = 512;

/// Randomized-subsampling MAD, scaled by `MAD_NORM`.
pub fn median_absolute_deviation(data: &[f32]) -> f64 {
    let sample = sample_up_to(&finite_copy(data), SAMPLE_SIZE);
    if sample.is_empty() {
        return 0.0;
    }
    let med = median(&mut sample.clone()) as f64;
    let mut dev: Vec<f32> = sample.iter().map(|&v| (v as f64 - med).abs() as f32).collect();
    median(&mut dev) as f64 * MAD_NORM
}

/// Randomized-subsampling Qn scale estimator, scaled by `QN_NORM`.
pub fn qn(data: &[f32]) -> f64 {
    let finite = finite_copy(data);
    if finite.len() < 2 {
        return 0.0;
    }
    let sample = sample_up_to(&finite, QN_SAMPLE_N);
    let m = sample.len();
    if m < 2 {
        return 0.0;
    }
    let mut diffs = Vec::with_capacity(m * (m - 1) / 2);
    for i in 0..m {
        for j in (i + 1)..m {
            diffs.push((sample[i] - sample[j]).abs());
        }
    }
    let h = m / 2 + 1;
    let k = (h * (h.saturating_sub(1))) / 2;
    let k = k.min(diffs.len() - 1);
    quickselect(&mut diffs, k) as f64 * QN_NORM
}

/// Sigma-clipped median + Qn, the default location/scale estimator.
pub fn sigma_clipped_median_and_qn(
    data: &[f32],
    sigma_low: f64,
    sigma_high: f64,
    eps: f64,
    n_samples: usize,
) -> (f64, f64) {
    let finite = finite_copy(data);
    if finite.is_empty() {
        return (0.0, 0.0);
    }
    let sample = sample_up_to(&finite, n_samples);
    let mut loc = median(&mut sample.clone()) as f64;
    let mut scale = qn(&sample);

    for _ in 0..10 {
        if scale <= 0.0 {
            break;
        }
        let lo = loc - sigma_low * scale;
        let hi = loc + sigma_high * scale;
        let bounded: Vec<f32> = sample.iter().copied().filter(|&v| (v as f64) >= lo && (v as f64) <= hi).collect();
        if bounded.is_empty() {
            break;
        }
        let new_loc = median(&mut bounded.clone()) as f64;
        let new_scale = qn(&bounded);
        let delta = (new_loc - loc).abs() + (new_scale - scale).abs();
        loc = new_loc;
        scale = new_scale;
        if delta <= eps {
            break;
        }
    }
    // on stop, compute unbounded Qn once more over the original sample
    let final_scale = qn(&sample);
    (loc, final_scale)
}

fn biweight_midvariance(window: &[f32], med: f64, mad: f64) -> f64 {
    if mad < 1e-12 {
        return 0.0;
    }
    const C: f64 = 9.0;
    let mut num = 0.0f64;
    let mut den = 0.0f64;
    for &v in window {
        let u = (v as f64 - med) / (C * mad);
        if u.abs() < 1.0 {
            let u2 = u * u;
            let term = (v as f64 - med) * (1.0 - u2) * (1.0 - u2);
            num += term * term;
            den += (1.0 - u2) * (1.0 - 5.0 * u2);
        }
    }
    if den.abs() < 1e-12 {
        return 0.0;
    }
    (window.len() as f64) * num / (den * den)
}

/// Iterative k-sigma with biweight midvariance (IKSS): sort, compute
/// biweight midvariance, contract the window by 4 sigma on each side,
/// repeat until the relative change in scale is below `eps`.
pub fn ikss(data: &[f32], eps: f64) -> (f64, f64) {
    let mut finite = finite_copy(data);
    if finite.is_empty() {
        return (0.0, 0.0);
    }
    finite.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut lo = 0usize;
    let mut hi = finite.len();
    let mut last_scale = f64::INFINITY;
    let mut med = finite[finite.len() / 2] as f64;

    loop {
        let window = &finite[lo..hi];
        if window.len() < 2 {
            break;
        }
        let mut w = window.to_vec();
        med = median(&mut w) as f64;
        let mut dev: Vec<f32> = window.iter().map(|&v| (v as f64 - med).abs() as f32).collect();
        let mad = median(&mut dev) as f64;
        let scale = biweight_midvariance(window, med, mad).sqrt();
        if scale <= 0.0 {
            return (med, scale);
        }

        let lo_bound = med - 4.0 * scale;
        let hi_bound = med + 4.0 * scale;
        let new_lo = lo + window.partition_point(|&v| (v as f64) < lo_bound);
        let new_hi = lo + window.partition_point(|&v| (v as f64) <= hi_bound);

        let rel_change = if last_scale.is_finite() && last_scale > 0.0 {
            (scale - last_scale).abs() / last_scale
        } else {
            f64::INFINITY
        };
        if rel_change < eps || (new_lo == lo && new_hi == hi) || new_hi <= new_lo {
            return (med, scale);
        }
        last_scale = scale;
        lo = new_lo;
        hi = new_hi;
    }
    (med, last_scale.max(0.0))
}

/// Histogram peak location + half-width scale estimator. Bins `data` into
/// `bins` buckets over `[min, max]`, finds the tallest interior bin,
/// locates its center, then expands symmetrically until the cumulative
/// count reaches 0.6827 of the total (one Gaussian sigma's worth).
pub fn histogram_scale_loc(data: &[f32], min: f32, max: f32, bins: usize) -> (f64, f64) {
    if bins < 3 || !(max > min) {
        return (0.0, 0.0);
    }
    let mut hist = vec![0u64; bins];
    let range = (max - min) as f64;
    let mut total = 0u64;
    for &v in data {
        if !v.is_finite() {
            continue;
        }
        let t = ((v - min) as f64 / range).clamp(0.0, 1.0);
        let b = ((t * bins as f64) as usize).min(bins - 1);
        hist[b] += 1;
        total += 1;
    }
    if total == 0 {
        return (0.0, 0.0);
    }

    let mut peak_i = 1usize;
    let mut peak_v = hist[1];
    for (i, &count) in hist.iter().enumerate().take(bins - 1).skip(1) {
        if count > peak_v {
            peak_v = count;
            peak_i = i;
        }
    }
    let bin_width = range / bins as f64;
    let loc = min as f64 + (peak_i as f64 + 0.5) * bin_width;

    let target = (0.6827 * total as f64).ceil() as u64;
    let mut half_width_bins = 0usize;
    let mut cum = hist[peak_i];
    while cum < target {
        half_width_bins += 1;
        let lo_i = peak_i.saturating_sub(half_width_bins);
        let hi_i = (peak_i + half_width_bins).min(bins - 1);
        cum = hist[lo_i..=hi_i].iter().sum();
        if lo_i == 0 && hi_i == bins - 1 {
            break;
        }
    }
    (loc, half_width_bins as f64 * bin_width)
}

/// Ordinary least squares over (x, y) pairs.
pub fn linear_regression(xs: &[f64], ys: &[f64]) -> (f64, f64, f64, f64, f64, f64) {
    let n = xs.len() as f64;
    if xs.is_empty() || xs.len() != ys.len() {
        return (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    }
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = ys.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = x - x_mean;
        let dy = y - y_mean;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let intercept = y_mean - slope * x_mean;
    (slope, intercept, x_mean, (sxx / n).sqrt(), y_mean, (syy / n).sqrt())
}

/// 3x3-Laplacian-based noise estimate: the MAD of a high-pass filter
/// response, normalized so flat Gaussian noise recovers its own sigma.
pub fn noise_estimate(data: &[f32], row_width: usize) -> f64 {
    if row_width < 3 || data.len() < row_width * 3 {
        return 0.0;
    }
    let height = data.len() / row_width;
    let mut diffs: Vec<f32> = Vec::new();
    for y in 1..height.saturating_sub(1) {
        for x in 1..row_width.saturating_sub(1) {
            let i = y * row_width + x;
            let center = data[i];
            let nbrs = [data[i - 1], data[i + 1], data[i - row_width], data[i + row_width]];
            if !center.is_finite() || nbrs.iter().any(|v| !v.is_finite()) {
                continue;
            }
            let lap = 4.0 * center - nbrs[0] - nbrs[1] - nbrs[2] - nbrs[3];
            diffs.push(lap);
        }
    }
    if diffs.is_empty() {
        return 0.0;
    }
    let med = median(&mut diffs.clone()) as f64;
    let mut abs_dev: Vec<f32> = diffs.iter().map(|&v| (v as f64 - med).abs() as f32).collect();
    let mad = median(&mut abs_dev) as f64;
    // the Laplacian kernel has L2 norm sqrt(20); scale MAD back to a
    // per-pixel sigma estimate.
    (mad * MAD_NORM) / 20.0f64.sqrt()
}

/// Dispatch to the estimator named by `mode`, with the defaults this
/// engine uses when no explicit sigma/eps/sample-count is supplied by
/// the caller (matches `Stats::location_scale`'s generic usage).
pub fn estimate_location_scale(data: &[f32], mode: LsEstimatorMode) -> (f64, f64) {
    match mode {
        LsEstimatorMode::MeanStdDev => {
            let (_, mean, _) = min_mean_max(data);
            (mean as f64, variance(data, mean as f64).sqrt())
        }
        LsEstimatorMode::MedianMad => {
            let mut v = finite_copy(data);
            let med = median(&mut v) as f64;
            (med, median_absolute_deviation(data))
        }
        LsEstimatorMode::Ikss => ikss(data, 1e-4),
        LsEstimatorMode::ScMedianQn => sigma_clipped_median_and_qn(data, 3.0, 3.0, 1e-3, SAMPLE_SIZE),
        LsEstimatorMode::Histogram => {
            let (min, _, max) = min_mean_max(data);
            if min.is_nan() {
                (0.0, 0.0)
            } else {
                histogram_scale_loc(data, min, max, 256)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_mean_max_basic() {
        let (min, mean, max) = min_mean_max(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(min, 1.0);
        assert_eq!(max, 4.0);
        assert!((mean - 2.5).abs() < 1e-6);
    }

    #[test]
    fn min_mean_max_propagates_nan() {
        let (min, mean, max) = min_mean_max(&[1.0, f32::NAN, 3.0]);
        assert!(min.is_nan() && mean.is_nan() && max.is_nan());
    }

    #[test]
    fn median_odd_and_even() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [1.0, 2.0, 3.0, 4.0]), 2.5);
    }

    #[test]
    fn qn_is_zero_for_constant_data() {
        let data = vec![5.0f32; 50];
        assert_eq!(qn(&data), 0.0);
    }

    #[test]
    fn sigma_clipped_median_and_qn_recovers_center_with_outlier() {
        let mut data = vec![10.0f32; 200];
        data.push(10_000.0);
        let (loc, _scale) = sigma_clipped_median_and_qn(&data, 3.0, 3.0, 1e-3, SAMPLE_SIZE);
        assert!((loc - 10.0).abs() < 0.5);
    }

    #[test]
    fn ikss_recovers_location_on_clean_gaussian_like_data() {
        let data: Vec<f32> = (0..500).map(|i| ((i % 50) as f32 - 25.0) * 0.1).collect();
        let (loc, _scale) = ikss(&data, 1e-4);
        assert!(loc.abs() < 1.0);
    }

    #[test]
    fn histogram_scale_loc_finds_dominant_bin() {
        let mut data = vec![0.0f32; 900];
        data.extend(vec![50.0f32; 100]);
        let (loc, scale) = histogram_scale_loc(&data, 0.0, 50.0, 50);
        assert!(loc < 5.0);
        assert!(scale >= 0.0);
    }

    #[test]
    fn linear_regression_recovers_exact_line() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| 2.0 * x + 1.0).collect();
        let (slope, intercept, ..) = linear_regression(&xs, &ys);
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((intercept - 1.0).abs() < 1e-9);
    }
}
