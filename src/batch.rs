//! `stackBatches` (component F): partitions an input frame set into
//! memory-feasible batches, randomizes assignment, and folds each batch's
//! stack into an overall incremental accumulator.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{NightlightError, Result};
use crate::image::Image;
use crate::operator::{to_tagged_json, Operator, Registry};
use crate::promise::{materialize_all, Promise};
use crate::stack::{stack_incremental, stack_incremental_finalize, RunningStack};

/// Fixed seed for the batch-assignment shuffle: deterministic across runs,
/// like the statistics kernel's sampling RNG.
const SHUFFLE_SEED: u64 = 0x4e49_4748_5442_4154; // "NIGHTBAT" in hex-ish

/// Compute `(max_threads, batch_size)` per the memory-budget search: start
/// from `n_cpu` threads, shrink until a feasible batch size is found or no
/// threads remain.
fn plan_batches(n: usize, width: usize, height: usize, stack_memory_mb: u64, n_cpu: usize, has_dark: bool, has_flat: bool) -> Result<(usize, usize)> {
    let per_frame_bytes = 4usize * width.max(1) * height.max(1);
    let available = ((stack_memory_mb as usize) * (1usize << 20)) / per_frame_bytes.max(1);

    let mut max_threads = n_cpu.max(1);
    loop {
        let mut batch = available as i64 - max_threads as i64 - i64::from(has_dark) - i64::from(has_flat);
        if batch > 0 {
            let n_batches = (n as i64 + batch - 1) / batch;
            if n_batches > 1 {
                batch -= 2;
            }
        }
        if batch >= 2i64.max(max_threads as i64) {
            let mut batch = batch as usize;
            loop {
                let n_batches = n.div_ceil(batch.max(1));
                if batch > 1 && (batch - 1) * n_batches >= n {
                    batch -= 1;
                } else {
                    break;
                }
            }
            return Ok((max_threads, batch));
        }
        if max_threads <= 1 {
            return Err(NightlightError::Capacity(format!(
                "stackBatches: no feasible (batch_size, max_threads) fits stack_memory_mb={stack_memory_mb} for {n} frames of {width}x{height}"
            )));
        }
        max_threads -= 1;
    }
}

/// Fisher-Yates shuffle the `(original_index, Promise)` pairs, then
/// restore ascending original-index order within each contiguous batch
/// slice, so logs stay reproducible while cross-batch assignment is
/// randomized.
fn shuffle_and_resort(mut items: Vec<(usize, Promise)>, batch_size: usize) -> Vec<(usize, Promise)> {
    let mut rng = SmallRng::seed_from_u64(SHUFFLE_SEED);
    items.shuffle(&mut rng);
    let mut out = Vec::with_capacity(items.len());
    for chunk in items.chunks_mut(batch_size.max(1)) {
        chunk.sort_by_key(|(idx, _)| *idx);
        out.extend(chunk.iter_mut().map(|(idx, p)| (*idx, std::mem::replace(p, Promise::ready(None)))));
    }
    out
}

pub struct StackBatches {
    per_batch: Arc<dyn Operator>,
}

impl std::fmt::Debug for StackBatches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackBatches").field("per_batch", &self.per_batch.type_tag()).finish()
    }
}

impl StackBatches {
    pub fn with_per_batch(per_batch: Arc<dyn Operator>) -> Self {
        StackBatches { per_batch }
    }

    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let obj = value.as_object().ok_or_else(|| NightlightError::Configuration("stackBatches: body must be an object".into()))?;
        let per_batch_json = obj.get("perBatch").ok_or_else(|| NightlightError::Configuration("stackBatches: missing \"perBatch\" field".into()))?;
        let registry = Registry::with_builtins();
        let per_batch: Arc<dyn Operator> = Arc::from(registry.create(per_batch_json)?);
        Ok(Box::new(StackBatches { per_batch }))
    }
}

/// Split an already shuffled-and-resorted `(index, Promise)` list into
/// contiguous batches of `batch_size`, each batch's promises in original
/// relative order, dropping the index (only needed for the resort above).
fn into_batches(ordered: Vec<(usize, Promise)>, batch_size: usize) -> Vec<Vec<Promise>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(ordered.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);
    for (_, promise) in ordered {
        current.push(promise);
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn run_stack_batches(ins: Vec<Promise>, per_batch: Arc<dyn Operator>, ctx: Arc<ExecutionContext>) -> Result<Option<Image>> {
    let n = ins.len();
    if n == 0 {
        return Ok(None);
    }
    let mut indexed: Vec<(usize, Promise)> = ins.into_iter().enumerate().collect();
    let (first_idx, first_promise) = indexed.remove(0);
    let first_img = first_promise
        .materialize()?
        .ok_or_else(|| NightlightError::Reference("stackBatches: first frame was filtered out before batching".into()))?;
    let width = first_img.width();
    let height = first_img.height();
    let naxisn = first_img.naxisn.clone();

    let (_max_threads, batch_size) = plan_batches(
        n,
        width,
        height,
        ctx.stack_memory_mb,
        ctx.max_threads,
        ctx.dark_frame().is_some(),
        ctx.flat_frame().is_some(),
    )?;

    indexed.push((first_idx, Promise::ready(Some(first_img))));
    let ordered = shuffle_and_resort(indexed, batch_size);
    let batches = into_batches(ordered, batch_size);
    ctx.log.info(format!("stackBatches: {} frames split into {} batches of up to {} frames", n, batches.len(), batch_size));

    let mut running: Option<RunningStack> = None;
    for batch in batches {
        let batch_len = batch.len() as f64;
        let outs = per_batch.make_promises(batch, &ctx)?;
        let (mut results, err) = materialize_all(outs, ctx.max_threads, false);
        if let Some(e) = err {
            return Err(e);
        }
        let batch_image = results
            .pop()
            .flatten()
            .ok_or_else(|| NightlightError::Reference("stackBatches: a batch produced no stacked frame".into()))?;
        stack_incremental(&mut running, &batch_image.data, batch_len, batch_image.exposure);
        // Batch inputs and intermediates go out of scope here; request the
        // allocator return pages to the OS before admitting the next batch.
        drop(batch_image);
    }

    let running = running.ok_or_else(|| NightlightError::Reference("stackBatches: no batches were produced".into()))?;
    let (data, exposure) = stack_incremental_finalize(running, n as f64);
    let mut out = Image::new(0, naxisn, data);
    out.exposure = exposure;
    Ok(Some(out))
}

impl Operator for StackBatches {
    fn type_tag(&self) -> &'static str {
        "stackBatches"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let per_batch = Arc::clone(&self.per_batch);
        let ctx = Arc::clone(ctx);
        Ok(vec![Promise::new(move || run_stack_batches(ins, per_batch, ctx))])
    }

    fn to_json(&self) -> Result<Value> {
        to_tagged_json(self.type_tag(), serde_json::json!({ "perBatch": self.per_batch.to_json()? }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::operator::stack_op::Stack;
    use crate::stack::{StackMode, Weighting};

    #[test]
    fn plan_batches_finds_a_feasible_split_for_the_documented_scenario() {
        let (max_threads, batch) = plan_batches(10, 1000, 1000, 32, 4, false, false).unwrap();
        assert!(max_threads >= 1);
        assert!(batch >= 1 && batch <= 7);
        let n_batches = 10usize.div_ceil(batch);
        assert!(n_batches >= 2);
    }

    #[test]
    fn plan_batches_fails_when_memory_budget_is_too_small() {
        let err = plan_batches(100, 4000, 4000, 1, 8, true, true).unwrap_err();
        assert!(matches!(err, NightlightError::Capacity(_)));
    }

    #[test]
    fn stack_batches_matches_a_single_batch_mean_stack_within_tolerance() {
        let mut params = ContextParams::default();
        params.max_threads = 2;
        params.stack_memory_mb = 4096;
        let ctx = Arc::new(ExecutionContext::new(params));
        let per_batch: Arc<dyn Operator> = Arc::new(Stack { mode: StackMode::Mean, weighting: Weighting::None, sigma_low: 2.75, sigma_high: 2.75 });
        let op = StackBatches::with_per_batch(per_batch);

        let n = 6;
        let ins: Vec<Promise> = (0..n)
            .map(|i| Promise::ready(Some(Image::new(i as i64, vec![2, 1], vec![i as f32, (i * 2) as f32]))))
            .collect();
        let outs = op.make_promises(ins, &ctx).unwrap();
        let (results, err) = materialize_all(outs, 1, false);
        assert!(err.is_none());
        let out = results[0].as_ref().unwrap();
        let expected_0: f32 = (0..n).map(|i| i as f32).sum::<f32>() / n as f32;
        let expected_1: f32 = (0..n).map(|i| (i * 2) as f32).sum::<f32>() / n as f32;
        assert!((out.data[0] - expected_0).abs() < 1e-3);
        assert!((out.data[1] - expected_1).abs() < 1e-3);
    }
}
