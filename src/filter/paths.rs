//! Filter directory layout
//!
//! ```text
//! <root>/filters/
//! ├── g0000000007-<csid>.sqlite   finished filter, generation-addressed
//! ├── <csid>.lock                 build lock
//! └── tmp-<uuid>.sqlite           build in progress
//! ```

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::warn;
use uuid::Uuid;

use super::errors::{MaterializeError, MaterializeResult};

pub const FILTERS_DIR: &str = "filters";

const FILTER_SUFFIX: &str = ".sqlite";
const TEMP_PREFIX: &str = "tmp-";

/// A finished filter found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterEntry {
    pub path: PathBuf,
    pub generation: u64,
    pub csid: String,
    pub modified: SystemTime,
}

/// Paths inside the filters directory of one index
#[derive(Debug, Clone)]
pub struct FilterPaths {
    dir: PathBuf,
}

impl FilterPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(FILTERS_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> MaterializeResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| MaterializeError::io(&self.dir, e))
    }

    pub fn filter_path(&self, generation: u64, csid: &str) -> PathBuf {
        self.dir
            .join(format!("g{:010}-{}{}", generation, csid, FILTER_SUFFIX))
    }

    pub fn lock_path(&self, csid: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", csid))
    }

    /// Fresh, unique build location
    pub fn temp_path(&self) -> PathBuf {
        self.dir.join(format!(
            "{}{}{}",
            TEMP_PREFIX,
            Uuid::new_v4().simple(),
            FILTER_SUFFIX
        ))
    }

    /// Every finished filter; empty if the directory does not exist yet
    pub fn list(&self) -> MaterializeResult<Vec<FilterEntry>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MaterializeError::io(&self.dir, e)),
        };

        let mut filters = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MaterializeError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some((generation, csid)) = name.to_str().and_then(parse_filter_name) else {
                continue;
            };
            // Removed between listing and stat: skip it.
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            filters.push(FilterEntry {
                path: entry.path(),
                generation,
                csid,
                modified,
            });
        }
        Ok(filters)
    }

    /// Build files not modified for at least `age`
    pub fn stale_temps(&self, age: Duration) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let now = SystemTime::now();
        entries
            .filter_map(Result::ok)
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(TEMP_PREFIX) && n.ends_with(FILTER_SUFFIX))
            })
            .filter(|e| {
                e.metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .is_some_and(|elapsed| elapsed >= age)
            })
            .map(|e| e.path())
            .collect()
    }
}

/// Split `g<generation>-<csid>.sqlite`
pub fn parse_filter_name(name: &str) -> Option<(u64, String)> {
    let stem = name.strip_prefix('g')?.strip_suffix(FILTER_SUFFIX)?;
    let (generation, csid) = stem.split_once('-')?;
    if csid.is_empty() || !generation.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((generation.parse().ok()?, csid.to_string()))
}

/// Refresh the modification time of a filter; eviction ranks by it
pub fn touch(path: &Path) {
    let result = OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to touch state filter");
    }
}

/// fsync a directory so a rename into it is durable
pub fn fsync_dir(path: &Path) -> MaterializeResult<()> {
    let dir = File::open(path).map_err(|e| MaterializeError::io(path, e))?;
    dir.sync_all().map_err(|e| MaterializeError::io(path, e))
}

/// Copy a file and fsync the copy
pub fn copy_with_fsync(src: &Path, dst: &Path) -> MaterializeResult<()> {
    fs::copy(src, dst).map_err(|e| MaterializeError::io(src, e))?;
    let file = OpenOptions::new()
        .write(true)
        .open(dst)
        .map_err(|e| MaterializeError::io(dst, e))?;
    file.sync_all().map_err(|e| MaterializeError::io(dst, e))
}

/// Remove a file that may already be gone
pub fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}
