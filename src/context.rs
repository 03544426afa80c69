//! The execution context: process-scoped state shared across workers, and
//! the mutex-guarded one-shot cell the reference-frame coordinator uses to
//! publish its result.

use std::sync::{Arc, Mutex, RwLock};

use serde::Deserialize;

use crate::error::{NightlightError, Result};
use crate::image::{Image, StarDetection};
use crate::stats::LsEstimatorMode;

/// The published alignment reference: the frame geometry and star field
/// every other frame is transformed to match.
#[derive(Debug, Clone)]
pub struct AlignmentReference {
    pub naxisn: Vec<usize>,
    pub stars: Vec<StarDetection>,
    pub hfr: f32,
}

/// The published histogram reference: location/scale every other frame is
/// normalized against.
#[derive(Debug, Clone, Copy)]
pub struct HistogramReference {
    pub location: f64,
    pub scale: f64,
}

enum OnceState<T> {
    Empty,
    Ready(T),
    Failed(String),
}

/// A mutex-guarded one-shot cell: the first caller to find it empty runs
/// its initializer *while holding the lock*, so every other caller blocks
/// on that single mutex until the value (or the sticky failure) is ready.
pub struct RefOnce<T: Clone> {
    state: Mutex<OnceState<T>>,
}

impl<T: Clone> RefOnce<T> {
    pub fn new() -> Self {
        RefOnce { state: Mutex::new(OnceState::Empty) }
    }

    pub fn get(&self) -> Option<T> {
        match &*self.state.lock().unwrap() {
            OnceState::Ready(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Returns the published value, computing it via `init` if this is the
    /// first call. A prior failure is sticky: later callers observe the
    /// same error without re-running `init`.
    pub fn get_or_init(&self, init: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock().unwrap();
        match &*guard {
            OnceState::Ready(v) => return Ok(v.clone()),
            OnceState::Failed(msg) => return Err(NightlightError::Reference(msg.clone())),
            OnceState::Empty => {}
        }
        match init() {
            Ok(v) => {
                *guard = OnceState::Ready(v.clone());
                Ok(v)
            }
            Err(e) => {
                *guard = OnceState::Failed(e.to_string());
                Err(e)
            }
        }
    }
}

impl<T: Clone> Default for RefOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only text sink for `Context.log`; every line is also emitted
/// through `tracing` so a run is observable without inspecting the sink.
#[derive(Default)]
pub struct LogSink {
    lines: Mutex<Vec<String>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::info!("{msg}");
        self.lines.lock().unwrap().push(msg);
    }

    pub fn warn(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!("{msg}");
        self.lines.lock().unwrap().push(msg);
    }

    pub fn error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::error!("{msg}");
        self.lines.lock().unwrap().push(msg);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

/// Context parameters recognized in Job JSON (section 6): everything else
/// is internally managed and not user-configurable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    pub ls_estimator_mode: LsEstimatorMode,
    pub memory_mb: u64,
    pub stack_memory_mb: u64,
    pub max_threads: usize,
}

impl Default for ContextParams {
    fn default() -> Self {
        ContextParams {
            ls_estimator_mode: LsEstimatorMode::default(),
            memory_mb: 4096,
            stack_memory_mb: 2048,
            max_threads: num_cpus::get(),
        }
    }
}

/// Process-scoped state shared across all workers for the duration of one
/// job.
pub struct ExecutionContext {
    pub log: LogSink,
    pub ls_estimator_mode: LsEstimatorMode,
    pub memory_mb: u64,
    pub stack_memory_mb: u64,
    pub max_threads: usize,
    pub dark_frame: RwLock<Option<Arc<Image>>>,
    pub flat_frame: RwLock<Option<Arc<Image>>>,
    pub lum_frame: RwLock<Option<Arc<Image>>>,
    align: RefOnce<AlignmentReference>,
    histo: RefOnce<HistogramReference>,
    ref_frame_error: Mutex<Option<String>>,
}

impl ExecutionContext {
    pub fn new(params: ContextParams) -> Self {
        ExecutionContext {
            log: LogSink::new(),
            ls_estimator_mode: params.ls_estimator_mode,
            memory_mb: params.memory_mb,
            stack_memory_mb: params.stack_memory_mb,
            max_threads: params.max_threads.max(1),
            dark_frame: RwLock::new(None),
            flat_frame: RwLock::new(None),
            lum_frame: RwLock::new(None),
            align: RefOnce::new(),
            histo: RefOnce::new(),
            ref_frame_error: Mutex::new(None),
        }
    }

    pub fn alignment_ref(&self) -> Option<AlignmentReference> {
        self.align.get()
    }

    pub fn publish_alignment(&self, init: impl FnOnce() -> Result<AlignmentReference>) -> Result<AlignmentReference> {
        let result = self.align.get_or_init(init);
        if let Err(e) = &result {
            self.mark_ref_frame_error(e.to_string());
        }
        result
    }

    pub fn histogram_ref(&self) -> Option<HistogramReference> {
        self.histo.get()
    }

    pub fn publish_histogram(&self, init: impl FnOnce() -> Result<HistogramReference>) -> Result<HistogramReference> {
        let result = self.histo.get_or_init(init);
        if let Err(e) = &result {
            self.mark_ref_frame_error(e.to_string());
        }
        result
    }

    fn mark_ref_frame_error(&self, msg: String) {
        let mut guard = self.ref_frame_error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(msg);
        }
    }

    /// A sticky flag so later workers short-circuit once any reference
    /// selection has failed, rather than retrying a doomed computation.
    pub fn ref_frame_error(&self) -> Option<NightlightError> {
        self.ref_frame_error.lock().unwrap().clone().map(NightlightError::Reference)
    }

    pub fn dark_frame(&self) -> Option<Arc<Image>> {
        self.dark_frame.read().unwrap().clone()
    }

    pub fn flat_frame(&self) -> Option<Arc<Image>> {
        self.flat_frame.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn ref_once_runs_init_exactly_once() {
        let cell: RefOnce<i32> = RefOnce::new();
        let calls = StdArc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let calls = StdArc::clone(&calls);
            let v = cell.get_or_init(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }).unwrap();
            assert_eq!(v, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ref_once_failure_is_sticky() {
        let cell: RefOnce<i32> = RefOnce::new();
        let first = cell.get_or_init(|| Err(NightlightError::Reference("no candidates".into())));
        assert!(first.is_err());
        let second = cell.get_or_init(|| Ok(1));
        assert!(second.is_err());
        assert_eq!(second.unwrap_err().to_string(), first.unwrap_err().to_string());
    }

    #[test]
    fn context_params_defaults_are_sane() {
        let params = ContextParams::default();
        assert!(params.max_threads >= 1);
        assert_eq!(params.memory_mb, 4096);
    }
}
