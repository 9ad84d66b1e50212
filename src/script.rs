//! The script loader (spec §4.6): resolves a logical script name to its
//! body, stripped of blank lines and `#`-comment lines, memoized
//! process-wide by name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::ScriptLoaderError;

static CACHE: OnceCell<Mutex<HashMap<String, Arc<str>>>> = OnceCell::new();

fn cache() -> &'static Mutex<HashMap<String, Arc<str>>> {
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Reads `name` from `search_dirs` (tried in order, falling back to the
/// current directory), strips blank and `#`-comment lines, and returns the
/// remaining lines joined with `\n`. Subsequent calls for the same `name`
/// return the memoized body without touching the filesystem again.
pub fn load(name: &str, search_dirs: &[PathBuf]) -> Result<Arc<str>, ScriptLoaderError> {
    if let Some(cached) = cache().lock().get(name) {
        return Ok(cached.clone());
    }

    let path = resolve(name, search_dirs).ok_or_else(|| ScriptLoaderError::NotFound(name.to_string()))?;
    let raw = std::fs::read_to_string(&path)?;
    let body: Arc<str> = Arc::from(strip(&raw));

    cache().lock().insert(name.to_string(), body.clone());
    Ok(body)
}

fn resolve(name: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in search_dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let fallback = Path::new(name);
    fallback.is_file().then(|| fallback.to_path_buf())
}

fn strip(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Clears the process-wide memo cache. Test-only: production callers have
/// no supported way to invalidate a loaded script, matching spec §4.6's
/// "process-wide, guarded by a monitor" cache with no eviction path.
#[cfg(test)]
pub(crate) fn clear_cache_for_tests() {
    cache().lock().clear();
}
