#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::UNIX_EPOCH;

use models::SharedFile;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use utilities::{mime_for_path, FileSystem};
use uuid::Uuid;

mod watcher;

pub use watcher::spawn_watcher;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no indexed file with id {0}")]
    NotFound(Uuid),
    #[error("path {0:?} escapes the shared root")]
    PathEscape(String),
}

/// The table of files under the shared root.
///
/// Rescans build a fresh map and swap it in whole, so readers observing
/// the table mid-scan still see a consistent snapshot.
pub struct FileIndex {
    root: RwLock<PathBuf>,
    fs: Arc<dyn FileSystem>,
    table: RwLock<Arc<HashMap<Uuid, SharedFile>>>,
    snapshot_tx: watch::Sender<Vec<SharedFile>>,
}

impl FileIndex {
    pub fn new(root: PathBuf, fs: Arc<dyn FileSystem>) -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        FileIndex {
            root: RwLock::new(root),
            fs,
            table: RwLock::new(Arc::new(HashMap::new())),
            snapshot_tx,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.root.read().unwrap().clone()
    }

    /// Point the index at a different shared root. Takes effect on the
    /// next rescan.
    pub fn set_root(&self, root: PathBuf) {
        *self.root.write().unwrap() = root;
    }

    /// Walk the shared root and replace the table with what could be
    /// read. Returns the number of indexed files.
    pub fn rescan(&self) -> usize {
        let root = self.root();
        let mut table = HashMap::new();
        walk(self.fs.as_ref(), &root, &root, &mut table);
        let count = table.len();
        let snapshot = sorted_files(&table);
        *self.table.write().unwrap() = Arc::new(table);
        // send_replace so the latest snapshot is kept even with no
        // subscriber listening yet
        self.snapshot_tx.send_replace(snapshot);
        debug!(count, root = %root.display(), "index rescanned");
        count
    }

    /// Current files, ordered by relative path.
    pub fn files(&self) -> Vec<SharedFile> {
        let table = self.table.read().unwrap().clone();
        sorted_files(&table)
    }

    /// Restartable stream of index snapshots; a fresh receiver sees the
    /// latest snapshot immediately.
    pub fn subscribe(&self) -> watch::Receiver<Vec<SharedFile>> {
        self.snapshot_tx.subscribe()
    }

    pub fn get(&self, file_id: Uuid) -> Option<SharedFile> {
        self.table.read().unwrap().get(&file_id).cloned()
    }

    /// Re-derive the absolute path for `file_id`, refusing anything that
    /// resolves outside the shared root.
    pub fn resolve(&self, file_id: Uuid) -> Result<(SharedFile, PathBuf), IndexError> {
        let file = self.get(file_id).ok_or(IndexError::NotFound(file_id))?;
        let rel = Path::new(&file.relative_path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(IndexError::PathEscape(file.relative_path.clone()));
        }
        let root = self.root();
        let absolute = root.join(rel);
        if !absolute.starts_with(&root) {
            return Err(IndexError::PathEscape(file.relative_path.clone()));
        }
        Ok((file, absolute))
    }
}

fn sorted_files(table: &HashMap<Uuid, SharedFile>) -> Vec<SharedFile> {
    let mut files: Vec<SharedFile> = table.values().cloned().collect();
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    files
}

fn walk(fs: &dyn FileSystem, root: &Path, dir: &Path, out: &mut HashMap<Uuid, SharedFile>) {
    let entries = match fs.read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return;
        }
    };
    for entry in entries {
        let name = match entry.path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => continue,
        };
        if name.starts_with('.') {
            continue;
        }
        if entry.metadata.is_dir {
            walk(fs, root, &entry.path, out);
            continue;
        }
        if !entry.metadata.is_file {
            continue;
        }
        let rel = match entry.path.strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let relative_path = posix_join(rel);
        let last_modified = entry
            .metadata
            .modified
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let file = SharedFile {
            file_id: SharedFile::id_for(&relative_path),
            name,
            size: entry.metadata.len,
            mime_type: mime_for_path(&entry.path),
            relative_path,
            last_modified,
        };
        out.insert(file.file_id, file);
    }
}

/// `/`-separated relative path regardless of host separator.
fn posix_join(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
