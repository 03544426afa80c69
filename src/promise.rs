//! Lazy promises and the bounded-concurrency materialization runtime.
//!
//! A `Promise` is a deferred computation yielding `Image | Error`; `apply`
//! returning `Ok(None)` means "frame filtered out," which is not an error.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::error::{NightlightError, Result};
use crate::image::Image;

/// A deferred computation of one frame. Materialized at most once.
pub struct Promise {
    inner: Box<dyn FnOnce() -> Result<Option<Image>> + Send>,
}

impl Promise {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<Option<Image>> + Send + 'static,
    {
        Promise { inner: Box::new(f) }
    }

    /// An already-resolved promise, for source operators that hand out a
    /// value they already hold (e.g. the reference coordinator's cache).
    pub fn ready(image: Option<Image>) -> Self {
        Promise::new(move || Ok(image))
    }

    pub fn materialize(self) -> Result<Option<Image>> {
        (self.inner)()
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Promise(..)")
    }
}

/// Run up to `max_threads` promises concurrently; results preserve input
/// order unless `forget` is true, in which case the returned list is
/// empty. Errors are aggregated: the first non-nil error is returned
/// (duplicate messages collapsed, distinct ones concatenated), but every
/// promise runs to completion regardless of earlier failures.
pub fn materialize_all(promises: Vec<Promise>, max_threads: usize, forget: bool) -> (Vec<Option<Image>>, Option<NightlightError>) {
    if promises.is_empty() {
        return (Vec::new(), None);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads.max(1))
        .build()
        .expect("failed to build promise worker pool");

    let results: Vec<Result<Option<Image>>> = pool.install(|| promises.into_par_iter().map(Promise::materialize).collect());

    let mut first: Option<NightlightError> = None;
    let mut seen = HashSet::new();
    for r in &results {
        if let Err(e) = r {
            let msg = e.to_string();
            if seen.insert(msg) {
                first = Some(NightlightError::join(first.clone(), e.clone()));
            }
        }
    }

    if forget {
        return (Vec::new(), first);
    }
    let images = results.into_iter().map(|r| r.unwrap_or(None)).collect();
    (images, first)
}

/// Compact a list in place, removing `None` entries left by filtered
/// frames, preserving relative order.
pub fn remove_nils(list: &mut Vec<Option<Image>>) -> Vec<Image> {
    list.drain(..).flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_all_preserves_order() {
        let promises = (0..8)
            .map(|i| Promise::new(move || Ok(Some(Image::new(i, vec![1, 1], vec![i as f32])))))
            .collect();
        let (images, err) = materialize_all(promises, 4, false);
        assert!(err.is_none());
        let ids: Vec<i64> = images.into_iter().map(|img| img.unwrap().id).collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn materialize_all_runs_everything_and_aggregates_distinct_errors() {
        let promises = vec![
            Promise::new(|| Err(NightlightError::Io("a".into()))),
            Promise::new(|| Ok(Some(Image::new(1, vec![1, 1], vec![1.0])))),
            Promise::new(|| Err(NightlightError::Io("b".into()))),
            Promise::new(|| Err(NightlightError::Io("a".into()))),
        ];
        let (images, err) = materialize_all(promises, 2, false);
        assert_eq!(images.len(), 4);
        let msg = err.unwrap().to_string();
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
    }

    #[test]
    fn forget_returns_empty_list() {
        let promises = vec![Promise::new(|| Ok(Some(Image::new(1, vec![1, 1], vec![1.0]))))];
        let (images, err) = materialize_all(promises, 1, true);
        assert!(images.is_empty());
        assert!(err.is_none());
    }

    #[test]
    fn remove_nils_compacts_in_place() {
        let mut list = vec![
            Some(Image::new(1, vec![1, 1], vec![0.0])),
            None,
            Some(Image::new(2, vec![1, 1], vec![0.0])),
        ];
        let compacted = remove_nils(&mut list);
        assert_eq!(compacted.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 2]);
    }
}
