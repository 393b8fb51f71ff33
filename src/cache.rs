//! Space-bounded store of display-ready photos.
//!
//! Every entry maps to exactly one regular file in the working directory and
//! `used_space` is the sum of the recorded entry sizes. Files whose name starts
//! with a dot are in-flight writes and are never tracked.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nix::sys::statvfs::statvfs;
use tracing::{debug, info, warn};

use crate::error::CacheError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub file_id: String,
    pub storage_path: PathBuf,
    pub size_bytes: u64,
    pub last_touched: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudget {
    pub max_available_space: u64,
}

impl CacheBudget {
    /// Budget for `dir`: the smaller of the configured maximum and the free
    /// space left after keeping `reserve` bytes available on the volume.
    pub fn for_directory(dir: &Path, configured_max: u64, reserve: u64) -> Result<Self, CacheError> {
        ensure_directory(dir)?;
        let stats = statvfs(dir).map_err(|source| CacheError::Budget {
            path: dir.to_path_buf(),
            source,
        })?;
        let free = (stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64);
        let budget = Self::from_free_space(free, configured_max, reserve);
        info!(
            dir = %dir.display(),
            free_bytes = free,
            reserve_bytes = reserve,
            configured_max,
            max_available_space = budget.max_available_space,
            "computed cache budget"
        );
        Ok(budget)
    }

    pub fn from_free_space(free: u64, configured_max: u64, reserve: u64) -> Self {
        Self {
            max_available_space: free.saturating_sub(reserve).min(configured_max),
        }
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    pub retries: u32,
}

#[derive(Debug)]
pub struct CacheManager {
    working_dir: PathBuf,
    entries: HashMap<String, CacheEntry>,
    used_space: u64,
    budget: CacheBudget,
    retry_limit: u32,
}

impl CacheManager {
    /// Creates `working_dir` if needed, adopts the photos already in it and
    /// runs one eviction pass. Leftover partial writes are removed.
    pub fn initialize(
        working_dir: impl Into<PathBuf>,
        budget: CacheBudget,
        retry_limit: u32,
    ) -> Result<Self, CacheError> {
        let working_dir = working_dir.into();
        ensure_directory(&working_dir)?;

        let mut manager = Self {
            working_dir,
            entries: HashMap::new(),
            used_space: 0,
            budget,
            retry_limit,
        };
        manager.scan()?;
        info!(
            dir = %manager.working_dir.display(),
            entries = manager.entries.len(),
            used_space = manager.used_space,
            max_available_space = budget.max_available_space,
            "cache initialized"
        );
        manager.evict();
        Ok(manager)
    }

    fn scan(&mut self) -> Result<(), CacheError> {
        let read_dir = fs::read_dir(&self.working_dir).map_err(|source| CacheError::Directory {
            path: self.working_dir.clone(),
            source,
        })?;
        for dir_entry in read_dir {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let path = dir_entry.path();
            let Some(name) = dir_entry.file_name().to_str().map(str::to_owned) else {
                warn!(path = %path.display(), "ignoring cache file with non UTF-8 name");
                continue;
            };
            if name.starts_with('.') {
                debug!(path = %path.display(), "removing interrupted write");
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "failed to remove partial file");
                }
                continue;
            }
            let metadata = dir_entry.metadata()?;
            let entry = CacheEntry {
                file_id: name.clone(),
                storage_path: path,
                size_bytes: metadata.len(),
                last_touched: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            };
            self.used_space += entry.size_bytes;
            self.entries.insert(name, entry);
        }
        Ok(())
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Final location for `file_id`.
    pub fn storage_path(&self, file_id: &str) -> PathBuf {
        self.working_dir.join(file_id)
    }

    /// Hidden sibling used while a file is being written; renamed into place
    /// once complete.
    pub fn partial_path(&self, file_id: &str) -> PathBuf {
        self.working_dir.join(format!(".{file_id}.partial"))
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.entries.contains_key(file_id)
    }

    pub fn get(&self, file_id: &str) -> Option<&CacheEntry> {
        self.entries.get(file_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_space(&self) -> u64 {
        self.used_space
    }

    pub fn budget(&self) -> CacheBudget {
        self.budget
    }

    pub fn usage_percent(&self) -> f64 {
        if self.budget.max_available_space == 0 {
            return 100.0;
        }
        self.used_space as f64 / self.budget.max_available_space as f64 * 100.0
    }

    /// Records the file at `path` under `file_id` and evicts down to budget.
    pub fn add(&mut self, file_id: &str, path: &Path) -> io::Result<EvictionReport> {
        let metadata = fs::metadata(path)?;
        let entry = CacheEntry {
            file_id: file_id.to_string(),
            storage_path: path.to_path_buf(),
            size_bytes: metadata.len(),
            last_touched: metadata.modified()?,
        };
        self.used_space += entry.size_bytes;
        if let Some(previous) = self.entries.insert(file_id.to_string(), entry) {
            self.used_space = self.used_space.saturating_sub(previous.size_bytes);
        }
        debug!(file_id, used_space = self.used_space, "added cache entry");
        Ok(self.evict())
    }

    /// Marks `file_id` as recently used. Never evicts.
    pub fn touch(&mut self, file_id: &str) -> bool {
        match self.entries.get_mut(file_id) {
            Some(entry) => {
                entry.last_touched = SystemTime::now();
                true
            }
            None => false,
        }
    }

    /// Removes `file_id` right away, independent of the budget. Returns
    /// whether an entry existed.
    pub fn delete(&mut self, file_id: &str) -> io::Result<bool> {
        let Some(entry) = self.entries.get(file_id) else {
            return Ok(false);
        };
        match fs::remove_file(&entry.storage_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(file_id, "deleted entry whose file was already gone");
            }
            Err(err) => return Err(err),
        }
        if let Some(entry) = self.entries.remove(file_id) {
            self.used_space = self.used_space.saturating_sub(entry.size_bytes);
        }
        info!(file_id, used_space = self.used_space, "deleted cache entry");
        Ok(true)
    }

    /// Deletes least recently touched entries until the budget holds, one
    /// entry remains, or the retry limit is reached.
    fn evict(&mut self) -> EvictionReport {
        let mut report = EvictionReport::default();
        let max = self.budget.max_available_space;
        if self.used_space <= max || self.entries.len() <= 1 {
            return report;
        }

        let mut oldest_first: BinaryHeap<Reverse<(SystemTime, String)>> = self
            .entries
            .values()
            .map(|entry| Reverse((entry.last_touched, entry.file_id.clone())))
            .collect();

        while self.used_space > max
            && self.entries.len() > 1
            && report.retries < self.retry_limit
        {
            let Some(Reverse((_, file_id))) = oldest_first.pop() else {
                break;
            };
            let Some(path) = self.entries.get(&file_id).map(|e| e.storage_path.clone()) else {
                continue;
            };

            match fs::remove_file(&path) {
                Ok(()) => {
                    self.forget(&file_id);
                    debug!(file_id, used_space = self.used_space, "evicted cache entry");
                    report.evicted.push(file_id);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    report.retries += 1;
                    self.forget(&file_id);
                    warn!(file_id, "cache file vanished; dropping stale entry");
                }
                Err(err) => {
                    report.retries += 1;
                    warn!(file_id, error = %err, "failed to evict cache file; skipping");
                }
            }
        }

        if self.used_space > max && self.entries.len() > 1 {
            warn!(
                used_space = self.used_space,
                max_available_space = max,
                retries = report.retries,
                "eviction pass gave up over budget"
            );
        } else if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                used_space = self.used_space,
                "eviction pass complete"
            );
        }
        report
    }

    fn forget(&mut self, file_id: &str) {
        if let Some(entry) = self.entries.remove(file_id) {
            self.used_space = self.used_space.saturating_sub(entry.size_bytes);
        }
    }
}

fn ensure_directory(dir: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(dir).map_err(|source| CacheError::Directory {
        path: dir.to_path_buf(),
        source,
    })
}
