//! `selectReference` (component E): the operator that picks the
//! alignment or histogram reference and publishes it to the shared
//! context. The first of its output promises to run performs the
//! selection; every other promise for this call blocks on the same
//! local gate, then takes its own frame back out of the stashed batch
//! (clearing that slot) rather than re-materializing or re-cloning the
//! whole batch.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{AlignmentReference, ExecutionContext, HistogramReference};
use crate::error::{NightlightError, Result};
use crate::image::{Image, StarDetection};
use crate::operator::load::{check_path_safe, FsLoadBackend, LoadBackend};
use crate::operator::{to_tagged_json, Operator};
use crate::promise::{materialize_all, Promise};
use crate::stats;

/// Extension seam for named-file reference selection: centroid detection
/// and HFR measurement are outside this crate's scope.
pub trait StarDetectBackend: Send + Sync {
    fn detect(&self, img: &Image) -> Result<(Vec<StarDetection>, f32)>;
}

/// Default backend: reports no stars found. A real implementation
/// replaces this with an actual centroid detector.
pub struct NoopStarDetect;

impl StarDetectBackend for NoopStarDetect {
    fn detect(&self, _img: &Image) -> Result<(Vec<StarDetection>, f32)> {
        Ok((Vec::new(), 0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RefTarget {
    Alignment,
    Histogram,
}

/// How the reference frame is picked. Encoded in JSON as a single `mode`
/// field that is either a path, one of the three `%`-prefixed tokens, or
/// a numeric index.
#[derive(Debug, Clone)]
pub enum RefSpec {
    NamedFile(String),
    StarsHfr,
    Location,
    Id(usize),
    Rgb,
}

fn parse_mode(value: &Value) -> Result<RefSpec> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(|id| RefSpec::Id(id as usize))
            .ok_or_else(|| NightlightError::Configuration(format!("selectReference: \"mode\" is not a valid index: {value}"))),
        Value::String(s) if s == "%starsHFR" => Ok(RefSpec::StarsHfr),
        Value::String(s) if s == "%location" => Ok(RefSpec::Location),
        Value::String(s) if s == "%rgb" => Ok(RefSpec::Rgb),
        Value::String(s) => Ok(RefSpec::NamedFile(s.clone())),
        other => Err(NightlightError::Configuration(format!("selectReference: invalid \"mode\" value: {other}"))),
    }
}

fn mode_to_json(spec: &RefSpec) -> Value {
    match spec {
        RefSpec::NamedFile(s) => Value::String(s.clone()),
        RefSpec::StarsHfr => Value::String("%starsHFR".to_string()),
        RefSpec::Location => Value::String("%location".to_string()),
        RefSpec::Id(id) => Value::Number((*id as u64).into()),
        RefSpec::Rgb => Value::String("%rgb".to_string()),
    }
}

pub struct SelectReference {
    pub target: RefTarget,
    pub spec: RefSpec,
    backend: Arc<dyn LoadBackend>,
    star_detect: Arc<dyn StarDetectBackend>,
}

impl std::fmt::Debug for SelectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectReference").field("target", &self.target).field("spec", &self.spec).finish()
    }
}

impl SelectReference {
    pub fn with_backend(target: RefTarget, spec: RefSpec, backend: Arc<dyn LoadBackend>) -> Self {
        SelectReference { target, spec, backend, star_detect: Arc::new(NoopStarDetect) }
    }

    pub fn with_backends(target: RefTarget, spec: RefSpec, backend: Arc<dyn LoadBackend>, star_detect: Arc<dyn StarDetectBackend>) -> Self {
        SelectReference { target, spec, backend, star_detect }
    }

    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let obj = value.as_object().ok_or_else(|| NightlightError::Configuration("selectReference: body must be an object".into()))?;
        let target: RefTarget = obj
            .get("target")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| NightlightError::Configuration("selectReference: missing \"target\" field".into()))?;
        let mode = obj.get("mode").ok_or_else(|| NightlightError::Configuration("selectReference: missing \"mode\" field".into()))?;
        let spec = parse_mode(mode)?;
        Ok(Box::new(SelectReference { target, spec, backend: Arc::new(FsLoadBackend), star_detect: Arc::new(NoopStarDetect) }))
    }

    fn make_promises_named_file(&self, file_name: String, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        check_path_safe(&file_name)?;
        let target = self.target;
        let mut out = Vec::with_capacity(ins.len());
        for input in ins {
            let backend = Arc::clone(&self.backend);
            let star_detect = Arc::clone(&self.star_detect);
            let file_name = file_name.clone();
            let ctx = Arc::clone(ctx);
            out.push(Promise::new(move || {
                match target {
                    RefTarget::Alignment => {
                        ctx.publish_alignment(|| {
                            let img = backend.load(&PathBuf::from(&file_name))?;
                            let (stars, hfr) = star_detect.detect(&img)?;
                            Ok(AlignmentReference { naxisn: img.naxisn.clone(), stars, hfr })
                        })?;
                    }
                    RefTarget::Histogram => {
                        ctx.publish_histogram(|| {
                            let mut img = backend.load(&PathBuf::from(&file_name))?;
                            star_detect.detect(&img)?;
                            let (loc, scale) = img.stats.location_scale(&img.data.clone(), ctx.ls_estimator_mode);
                            Ok(HistogramReference { location: loc as f64, scale: scale as f64 })
                        })?;
                    }
                }
                input.materialize()
            }));
        }
        Ok(out)
    }

    fn make_promises_materialize_all(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let n = ins.len();
        let shared_ins: Arc<Mutex<Vec<Option<Promise>>>> = Arc::new(Mutex::new(ins.into_iter().map(Some).collect()));
        let selection: Arc<Mutex<Option<Result<Vec<Option<Image>>>>>> = Arc::new(Mutex::new(None));
        let target = self.target;

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let shared_ins = Arc::clone(&shared_ins);
            let selection = Arc::clone(&selection);
            let spec = self.spec.clone();
            let ctx = Arc::clone(ctx);
            out.push(Promise::new(move || {
                let mut guard = selection.lock().unwrap();
                if guard.is_none() {
                    let result = materialize_all_inputs(&shared_ins, &ctx).and_then(|imgs| select_and_publish(target, &spec, imgs, &ctx));
                    *guard = Some(result);
                }
                match guard.as_mut().unwrap() {
                    Ok(images) => Ok(images.get_mut(i).and_then(Option::take)),
                    Err(e) => Err(e.clone()),
                }
            }));
        }
        Ok(out)
    }
}

fn materialize_all_inputs(shared_ins: &Arc<Mutex<Vec<Option<Promise>>>>, ctx: &ExecutionContext) -> Result<Vec<Option<Image>>> {
    let promises: Vec<Promise> = {
        let mut guard = shared_ins.lock().unwrap();
        std::mem::take(&mut *guard).into_iter().flatten().collect()
    };
    let (materialized, err) = materialize_all(promises, ctx.max_threads, false);
    match err {
        Some(e) => Err(e),
        None => Ok(materialized),
    }
}

fn select_index(spec: &RefSpec, images: &mut [Option<Image>], ctx: &ExecutionContext) -> Result<usize> {
    match spec {
        RefSpec::StarsHfr => {
            let mut best: Option<usize> = None;
            let mut best_score = -1.0f64;
            for (i, slot) in images.iter().enumerate() {
                if let Some(img) = slot {
                    let score = if img.hfr.abs() > 1e-12 { img.stars.len() as f64 / img.hfr as f64 } else { 0.0 };
                    if best.is_none() || score >= best_score {
                        best_score = score;
                        best = Some(i);
                    }
                }
            }
            best.ok_or_else(|| NightlightError::Reference("selectReference: no candidate frames for stars/HFR selection".into()))
        }
        RefSpec::Location => {
            let mut locs: Vec<(usize, f64)> = Vec::new();
            for (i, slot) in images.iter_mut().enumerate() {
                if let Some(img) = slot {
                    let (loc, _) = img.stats.location_scale(&img.data.clone(), ctx.ls_estimator_mode);
                    locs.push((i, loc as f64));
                }
            }
            if locs.is_empty() {
                return Err(NightlightError::Reference("selectReference: no candidate frames for location selection".into()));
            }
            let mut vals: Vec<f32> = locs.iter().map(|&(_, l)| l as f32).collect();
            let med = stats::median(&mut vals) as f64;
            let mut best = locs[0].0;
            let mut best_d = f64::INFINITY;
            for &(i, l) in &locs {
                let d = (l - med).abs();
                if d < best_d {
                    best_d = d;
                    best = i;
                }
            }
            Ok(best)
        }
        RefSpec::Id(id) => {
            if *id >= images.len() || images[*id].is_none() {
                return Err(NightlightError::Reference(format!("selectReference: id {id} is out of range or was filtered out")));
            }
            Ok(*id)
        }
        RefSpec::Rgb => {
            if images.len() > 3 {
                if images[3].is_none() {
                    return Err(NightlightError::Reference("selectReference: %rgb luminance slot (index 3) was filtered out".into()));
                }
                Ok(3)
            } else {
                select_index(&RefSpec::StarsHfr, images, ctx)
            }
        }
        RefSpec::NamedFile(_) => unreachable!("named-file mode never reaches select_index"),
    }
}

fn select_and_publish(target: RefTarget, spec: &RefSpec, mut images: Vec<Option<Image>>, ctx: &ExecutionContext) -> Result<Vec<Option<Image>>> {
    let idx = select_index(spec, &mut images, ctx)?;
    match target {
        RefTarget::Alignment => {
            ctx.publish_alignment(|| {
                let img = images[idx].as_ref().expect("select_index returned a present slot");
                Ok(AlignmentReference { naxisn: img.naxisn.clone(), stars: img.stars.clone(), hfr: img.hfr })
            })?;
        }
        RefTarget::Histogram => {
            ctx.publish_histogram(|| {
                let img = images[idx].as_mut().expect("select_index returned a present slot");
                let (loc, scale) = img.stats.location_scale(&img.data.clone(), ctx.ls_estimator_mode);
                Ok(HistogramReference { location: loc as f64, scale: scale as f64 })
            })?;
        }
    }
    Ok(images)
}

impl Operator for SelectReference {
    fn type_tag(&self) -> &'static str {
        "selectReference"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        match &self.spec {
            RefSpec::NamedFile(path) => self.make_promises_named_file(path.clone(), ins, ctx),
            _ => self.make_promises_materialize_all(ins, ctx),
        }
    }

    fn to_json(&self) -> Result<Value> {
        to_tagged_json(self.type_tag(), serde_json::json!({ "target": self.target, "mode": mode_to_json(&self.spec) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::image::StarDetection;

    fn ctx() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(ContextParams::default()))
    }

    fn frame_with_stars_hfr(id: i64, n_stars: usize, hfr: f32) -> Image {
        let mut img = Image::new(id, vec![1, 1], vec![0.0]);
        img.stars = (0..n_stars).map(|_| StarDetection { x: 0.0, y: 0.0, mass: 1.0, hfr }).collect();
        img.hfr = hfr;
        img
    }

    #[test]
    fn stars_hfr_breaks_ties_toward_the_later_frame() {
        let context = ctx();
        let op = SelectReference::with_backend(RefTarget::Alignment, RefSpec::StarsHfr, Arc::new(FsLoadBackend));
        let ins = vec![
            Promise::ready(Some(frame_with_stars_hfr(0, 100, 2.0))),
            Promise::ready(Some(frame_with_stars_hfr(1, 50, 1.0))),
            Promise::ready(Some(frame_with_stars_hfr(2, 200, 5.0))),
        ];
        let outs = op.make_promises(ins, &context).unwrap();
        let (results, err) = materialize_all(outs, 3, false);
        assert!(err.is_none());
        let chosen = context.alignment_ref().unwrap();
        assert_eq!(chosen.stars.len(), 50);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(Option::is_some));
    }

    #[test]
    fn id_mode_rejects_out_of_range_index() {
        let context = ctx();
        let op = SelectReference::with_backend(RefTarget::Alignment, RefSpec::Id(5), Arc::new(FsLoadBackend));
        let ins = vec![Promise::ready(Some(Image::new(0, vec![1, 1], vec![0.0])))];
        let outs = op.make_promises(ins, &context).unwrap();
        let (_, err) = materialize_all(outs, 1, false);
        assert!(matches!(err, Some(NightlightError::Reference(_))));
    }

    #[test]
    fn reference_is_published_exactly_once_across_all_output_promises() {
        let context = ctx();
        let op = SelectReference::with_backend(RefTarget::Histogram, RefSpec::Location, Arc::new(FsLoadBackend));
        let ins = (0..4)
            .map(|i| Promise::ready(Some(Image::new(i, vec![4, 1], vec![1.0, 2.0, 3.0, 4.0 + i as f32]))))
            .collect::<Vec<_>>();
        let outs = op.make_promises(ins, &context).unwrap();
        let (results, err) = materialize_all(outs, 4, false);
        assert!(err.is_none());
        assert!(context.histogram_ref().is_some());
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn named_file_mode_rejects_unsafe_paths_before_any_work() {
        let context = ctx();
        let op = SelectReference::with_backend(RefTarget::Alignment, RefSpec::NamedFile("/etc/ref.fits".to_string()), Arc::new(FsLoadBackend));
        let err = op.make_promises(vec![Promise::ready(None)], &context).unwrap_err();
        assert!(matches!(err, NightlightError::PathSafety(_)));
    }

    #[test]
    fn rgb_mode_uses_luminance_slot_when_more_than_three_inputs() {
        let context = ctx();
        let op = SelectReference::with_backend(RefTarget::Alignment, RefSpec::Rgb, Arc::new(FsLoadBackend));
        let ins = (0..4).map(|i| Promise::ready(Some(frame_with_stars_hfr(i, 1, 1.0)))).collect::<Vec<_>>();
        let outs = op.make_promises(ins, &context).unwrap();
        let (_, err) = materialize_all(outs, 4, false);
        assert!(err.is_none());
        assert!(context.alignment_ref().is_some());
    }

    #[test]
    fn each_output_promise_returns_its_own_distinct_frame_exactly_once() {
        let context = ctx();
        let op = SelectReference::with_backend(RefTarget::Alignment, RefSpec::Location, Arc::new(FsLoadBackend));
        let ins = (0..4)
            .map(|i| Promise::ready(Some(Image::new(100 + i, vec![1, 1], vec![i as f32]))))
            .collect::<Vec<_>>();
        let outs = op.make_promises(ins, &context).unwrap();
        let (results, err) = materialize_all(outs, 4, false);
        assert!(err.is_none());
        let mut ids: Vec<i64> = results.iter().map(|r| r.as_ref().unwrap().id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![100, 101, 102, 103]);
    }

    struct StubLoad;

    impl LoadBackend for StubLoad {
        fn glob(&self, _pattern: &str) -> Result<Vec<PathBuf>> {
            Ok(Vec::new())
        }

        fn load(&self, _path: &std::path::Path) -> Result<Image> {
            Ok(Image::new(0, vec![1, 1], vec![0.0]))
        }
    }

    struct CountingStarDetect {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl StarDetectBackend for CountingStarDetect {
        fn detect(&self, _img: &Image) -> Result<(Vec<StarDetection>, f32)> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok((vec![StarDetection { x: 1.0, y: 2.0, mass: 3.0, hfr: 4.0 }], 4.0))
        }
    }

    #[test]
    fn named_file_mode_invokes_the_star_detect_backend() {
        let context = ctx();
        let detector = Arc::new(CountingStarDetect { calls: std::sync::atomic::AtomicUsize::new(0) });
        let op = SelectReference::with_backends(
            RefTarget::Alignment,
            RefSpec::NamedFile("ref.fits".to_string()),
            Arc::new(StubLoad),
            Arc::clone(&detector),
        );
        let outs = op.make_promises(vec![Promise::ready(None)], &context).unwrap();
        let (_, err) = materialize_all(outs, 1, false);
        assert!(err.is_none());
        assert_eq!(detector.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let chosen = context.alignment_ref().unwrap();
        assert_eq!(chosen.stars.len(), 1);
        assert_eq!(chosen.hfr, 4.0);
    }
}
