//! `stack`: an N-input, one-output operator. Materializes every input
//! frame, computes per-frame weights for the configured weighting scheme,
//! then reduces each channel plane independently.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{NightlightError, Result};
use crate::image::Image;
use crate::promise::{materialize_all, Promise};
use crate::stack::{self, StackConfig, StackMode, Weighting};

use super::{to_tagged_json, Operator};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stack {
    pub mode: StackMode,
    pub weighting: Weighting,
    pub sigma_low: f64,
    pub sigma_high: f64,
}

impl Default for Stack {
    fn default() -> Self {
        Stack { mode: StackMode::default(), weighting: Weighting::default(), sigma_low: 2.75, sigma_high: 2.75 }
    }
}

impl Stack {
    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let op: Stack = serde_json::from_value(value)?;
        Ok(Box::new(op))
    }

    fn weights(&self, frames: &[Image], ctx: &ExecutionContext) -> Option<Vec<f32>> {
        match self.weighting {
            Weighting::None => None,
            Weighting::ByExposure => {
                let exposures: Vec<f64> = frames.iter().map(|f| f.exposure).collect();
                Some(stack::weights_by_exposure(&exposures))
            }
            Weighting::ByInverseNoise => {
                let noises: Vec<f32> = frames
                    .iter()
                    .map(|f| crate::stats::noise_estimate(&f.data, f.width()) as f32)
                    .collect();
                Some(stack::weights_by_inverse(&noises))
            }
            Weighting::ByInverseHfr => {
                let _ = ctx;
                let hfrs: Vec<f32> = frames.iter().map(|f| f.hfr).collect();
                Some(stack::weights_by_inverse(&hfrs))
            }
        }
    }
}

impl Operator for Stack {
    fn type_tag(&self) -> &'static str {
        "stack"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let cfg = *self;
        let ctx = Arc::clone(ctx);
        Ok(vec![Promise::new(move || {
            let (materialized, err) = materialize_all(ins, ctx.max_threads, false);
            if let Some(e) = err {
                return Err(e);
            }
            let frames: Vec<Image> = materialized.into_iter().flatten().collect();
            if frames.is_empty() {
                return Ok(None);
            }
            let naxisn = frames[0].naxisn.clone();
            for f in &frames {
                if f.naxisn != naxisn {
                    return Err(NightlightError::Shape(format!(
                        "stack: frame {} shape {:?} does not match first frame shape {:?}",
                        f.id, f.naxisn, naxisn
                    )));
                }
            }
            let weights = cfg.weights(&frames, &ctx);
            let loc_ref = frames[0].data.first().copied().unwrap_or(0.0);
            let channels = frames[0].channels();
            let plane_len = frames[0].plane_len();
            let mut out_data = vec![0f32; plane_len * channels];
            let stack_cfg = StackConfig {
                mode: cfg.mode,
                weighting: cfg.weighting,
                sigma_low: cfg.sigma_low,
                sigma_high: cfg.sigma_high,
            };
            for ch in 0..channels {
                let planes: Vec<&[f32]> = frames.iter().map(|f| f.plane(ch)).collect();
                let (reduced, _report) =
                    stack::stack_planes(&planes, weights.as_deref(), loc_ref, &stack_cfg, ctx.max_threads, None)?;
                out_data[ch * plane_len..(ch + 1) * plane_len].copy_from_slice(&reduced);
            }
            let mut out = Image::new(0, naxisn, out_data);
            out.exposure = frames.iter().map(|f| f.exposure).sum();
            Ok(Some(out))
        })])
    }

    fn to_json(&self) -> Result<Value> {
        to_tagged_json(self.type_tag(), serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;

    fn ctx() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(ContextParams::default()))
    }

    #[test]
    fn stack_reduces_multiple_frames_to_one() {
        let context = ctx();
        let op = Stack { mode: StackMode::Mean, weighting: Weighting::None, sigma_low: 2.75, sigma_high: 2.75 };
        let ins = vec![
            Promise::ready(Some(Image::new(0, vec![2, 1], vec![1.0, 2.0]))),
            Promise::ready(Some(Image::new(1, vec![2, 1], vec![3.0, 4.0]))),
        ];
        let outs = op.make_promises(ins, &context).unwrap();
        assert_eq!(outs.len(), 1);
        let (results, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(err.is_none());
        assert_eq!(results[0].as_ref().unwrap().data, vec![2.0, 3.0]);
    }

    #[test]
    fn stack_rejects_mismatched_shapes() {
        let context = ctx();
        let op = Stack::default();
        let ins = vec![
            Promise::ready(Some(Image::new(0, vec![2, 1], vec![1.0, 2.0]))),
            Promise::ready(Some(Image::new(1, vec![3, 1], vec![1.0, 2.0, 3.0]))),
        ];
        let outs = op.make_promises(ins, &context).unwrap();
        let (_, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(matches!(err, Some(NightlightError::Shape(_))));
    }

    #[test]
    fn stack_with_no_frames_yields_nil() {
        let context = ctx();
        let op = Stack::default();
        let outs = op.make_promises(vec![Promise::ready(None)], &context).unwrap();
        let (results, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(err.is_none());
        assert!(results[0].is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let op = Stack { mode: StackMode::Auto, weighting: Weighting::None, sigma_low: 2.75, sigma_high: 2.75 };
        let json = op.to_json().unwrap();
        assert_eq!(json["type"], "stack");
        let decoded = Stack::from_json(serde_json::json!({
            "mode": "Auto", "weighting": "None", "sigmaLow": 2.75, "sigmaHigh": 2.75
        })).unwrap();
        assert_eq!(decoded.to_json().unwrap(), json);
    }
}
