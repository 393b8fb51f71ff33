use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Photo ids that must never be fetched again, one per line on disk.
///
/// Inserts are appended to the file immediately so a crash cannot lose them.
#[derive(Debug)]
pub struct RejectionSet {
    path: PathBuf,
    ids: HashSet<String>,
}

impl RejectionSet {
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let ids = match fs::read_to_string(&path) {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_owned)
                .collect(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashSet::new(),
            Err(err) => return Err(err),
        };
        info!(path = %path.display(), rejected = ids.len(), "loaded rejection list");
        Ok(Self { path, ids })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Adds `id` and persists it. Returns false when it was already present.
    pub fn insert(&mut self, id: &str) -> io::Result<bool> {
        let id = id.trim();
        if id.is_empty() || self.ids.contains(id) {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{id}")?;
        file.sync_data()?;
        self.ids.insert(id.to_string());
        debug!(id, "rejected photo");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let set = RejectionSet::load(dir.path().join("rejected.txt")).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn inserts_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/rejected.txt");
        let mut set = RejectionSet::load(&path).unwrap();
        assert!(set.insert("abc.jpg").unwrap());
        assert!(!set.insert("abc.jpg").unwrap());
        assert!(set.insert("def.jpg").unwrap());

        let reloaded = RejectionSet::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("abc.jpg"));
        assert!(reloaded.contains("def.jpg"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "abc.jpg\ndef.jpg\n");
    }
}
