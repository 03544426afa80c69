//! `LoadMany`: zero-to-many source operator. Expands a list of glob
//! patterns into one load promise per matched path, rejecting unsafe
//! paths before any filesystem access.
//!
//! Actual frame decoding (FITS/TIFF/JPEG) is outside this crate's scope;
//! `LoadBackend` is the extension seam a host supplies a real codec
//! through. The default backend only resolves paths on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{NightlightError, Result};
use crate::image::Image;
use crate::promise::Promise;

use super::{to_tagged_json, Operator};

/// Reject absolute paths and any path containing a `..` segment, before
/// any I/O is attempted.
pub fn check_path_safe(path: &str) -> Result<()> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(NightlightError::PathSafety(format!("absolute paths are not allowed: {path}")));
    }
    if p.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(NightlightError::PathSafety(format!("paths must not contain \"..\": {path}")));
    }
    Ok(())
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..])),
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(pc), Some(tc)) if pc == tc => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// Expand a single glob pattern (supporting `*` and `?` within the final
/// path segment only — no recursive `**`) against the filesystem.
pub fn glob_match_fs(pattern: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(pattern);
    let (dir, file_pattern): (PathBuf, String) = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => (
            parent.to_path_buf(),
            path.file_name().and_then(|s| s.to_str()).unwrap_or("").to_string(),
        ),
        _ => (PathBuf::from("."), pattern.to_string()),
    };
    let mut matches = Vec::new();
    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if glob_match(file_pattern.as_bytes(), name_str.as_bytes()) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Extension seam for frame I/O: decoding real pixel data is out of scope
/// for this crate.
pub trait LoadBackend: Send + Sync {
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>>;
    fn load(&self, path: &Path) -> Result<Image>;
}

/// Default backend: resolves glob patterns against the real filesystem,
/// but has no codec — `load` always fails, documenting this as an
/// external-collaborator seam rather than a stub pretending to work.
pub struct FsLoadBackend;

impl LoadBackend for FsLoadBackend {
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        glob_match_fs(pattern)
    }

    fn load(&self, path: &Path) -> Result<Image> {
        Err(NightlightError::Io(format!(
            "no frame codec configured for {}: FITS/TIFF/JPEG decoding is outside this crate",
            path.display()
        )))
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LoadManyParams {
    file_patterns: Vec<String>,
}

pub struct LoadMany {
    pub file_patterns: Vec<String>,
    backend: Arc<dyn LoadBackend>,
}

impl std::fmt::Debug for LoadMany {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadMany").field("file_patterns", &self.file_patterns).finish()
    }
}

impl LoadMany {
    pub fn with_backend(file_patterns: Vec<String>, backend: Arc<dyn LoadBackend>) -> Self {
        LoadMany { file_patterns, backend }
    }

    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let params: LoadManyParams = serde_json::from_value(value)?;
        Ok(Box::new(LoadMany { file_patterns: params.file_patterns, backend: Arc::new(FsLoadBackend) }))
    }
}

impl Operator for LoadMany {
    fn type_tag(&self) -> &'static str {
        "loadMany"
    }

    fn make_promises(&self, _ins: Vec<Promise>, _ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let mut paths = Vec::new();
        for pattern in &self.file_patterns {
            check_path_safe(pattern)?;
            for matched in self.backend.glob(pattern)? {
                check_path_safe(&matched.to_string_lossy())?;
                paths.push(matched);
            }
        }
        let mut out = Vec::with_capacity(paths.len());
        for (idx, path) in paths.into_iter().enumerate() {
            let backend = Arc::clone(&self.backend);
            out.push(Promise::new(move || {
                let mut img = backend.load(&path)?;
                img.id = idx as i64;
                img.file_name = Some(path);
                Ok(Some(img))
            }));
        }
        Ok(out)
    }

    fn to_json(&self) -> Result<Value> {
        to_tagged_json("loadMany", serde_json::json!({ "filePatterns": self.file_patterns }))
    }
}
