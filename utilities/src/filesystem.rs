use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

#[derive(Debug, Clone)]
pub struct FsMetadata {
    pub is_file: bool,
    pub is_dir: bool,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path: PathBuf,
    pub metadata: FsMetadata,
}

/// A write handle that can be fsynced before the atomic rename.
pub trait FileWriter: Write + Send {
    fn sync(&mut self) -> io::Result<()>;
}

pub trait FileSystem: Send + Sync {
    fn metadata(&self, path: &Path) -> io::Result<FsMetadata>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileWriter>>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/* Real filesystem (std) */

#[derive(Debug, Default, Clone)]
pub struct RealFileSystem;

impl RealFileSystem {
    pub fn new() -> Self {
        Self
    }
}

struct RealFileWriter(std::fs::File);

impl Write for RealFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FileWriter for RealFileWriter {
    fn sync(&mut self) -> io::Result<()> {
        self.0.sync_all()
    }
}

impl FileSystem for RealFileSystem {
    fn metadata(&self, path: &Path) -> io::Result<FsMetadata> {
        let md = std::fs::metadata(path)?;
        Ok(FsMetadata {
            is_file: md.is_file(),
            is_dir: md.is_dir(),
            len: md.len(),
            modified: md.modified().ok(),
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let entries = std::fs::read_dir(path)?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let md = entry.metadata()?;
            out.push(DirEntry {
                path,
                metadata: FsMetadata {
                    is_file: md.is_file(),
                    is_dir: md.is_dir(),
                    len: md.len(),
                    modified: md.modified().ok(),
                },
            });
        }
        Ok(out)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, data)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let f = std::fs::File::open(path)?;
        Ok(Box::new(f))
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileWriter>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let f = std::fs::File::create(path)?;
        Ok(Box::new(RealFileWriter(f)))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/* In-memory filesystem for tests */

#[derive(Debug, Clone)]
pub struct VirtualFileSystem {
    inner: Arc<Mutex<VirtualFsInner>>,
}

#[derive(Debug, Default)]
struct VirtualFsInner {
    nodes: HashMap<PathBuf, VNode>,
    children: HashMap<PathBuf, BTreeMap<String, PathBuf>>,
    unreadable: HashSet<PathBuf>,
}

#[derive(Debug, Clone)]
enum VNode {
    File { data: Vec<u8>, modified: SystemTime },
    Dir { modified: SystemTime },
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        let mut inner = VirtualFsInner::default();
        inner.nodes.insert(
            PathBuf::from("/"),
            VNode::Dir {
                modified: SystemTime::now(),
            },
        );
        VirtualFileSystem {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Mark a path as unreadable to simulate permission failures.
    pub fn set_unreadable(&self, path: &Path) {
        let norm = Self::normalize(path);
        self.inner.lock().unwrap().unreadable.insert(norm);
    }

    fn normalize(path: &Path) -> PathBuf {
        let mut components = Vec::new();
        for comp in path.components() {
            match comp {
                Component::RootDir => {
                    components.clear();
                    components.push(PathBuf::from("/"));
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    components.pop();
                }
                Component::Normal(c) => {
                    let mut p = components
                        .last()
                        .cloned()
                        .unwrap_or_else(|| PathBuf::from("/"));
                    p.push(c);
                    components.push(p);
                }
                Component::Prefix(_) => {}
            }
        }
        components
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn check_readable(inner: &VirtualFsInner, path: &Path) -> io::Result<()> {
        if inner.unreadable.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not readable", path.display()),
            ));
        }
        Ok(())
    }

    fn ensure_parent(inner: &mut VirtualFsInner, path: &Path) {
        if let Some(parent) = path.parent() {
            if parent.as_os_str().is_empty() {
                return;
            }
            let norm = Self::normalize(parent);
            inner.nodes.entry(norm).or_insert(VNode::Dir {
                modified: SystemTime::now(),
            });
        }
    }

    fn link_child(inner: &mut VirtualFsInner, path: &PathBuf) {
        if let Some(parent) = path.parent() {
            let parent_norm = Self::normalize(parent);
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();
            inner
                .children
                .entry(parent_norm.clone())
                .or_default()
                .insert(name, path.clone());
            inner.nodes.entry(parent_norm).or_insert(VNode::Dir {
                modified: SystemTime::now(),
            });
        }
    }

    fn insert_file(&self, path: &Path, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let norm = Self::normalize(path);
        Self::ensure_parent(&mut inner, &norm);
        inner.nodes.insert(
            norm.clone(),
            VNode::File {
                data,
                modified: SystemTime::now(),
            },
        );
        Self::link_child(&mut inner, &norm);
    }

    fn append_file(&self, path: &Path, buf: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get_mut(path) {
            Some(VNode::File { data, modified }) => {
                data.extend_from_slice(buf);
                *modified = SystemTime::now();
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
        }
    }
}

/// Commits into the map on every write so partially-written temp files
/// stay observable to other handles.
struct VirtualFileWriter {
    fs: VirtualFileSystem,
    path: PathBuf,
}

impl Write for VirtualFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.fs.append_file(&self.path, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileWriter for VirtualFileWriter {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileSystem for VirtualFileSystem {
    fn metadata(&self, path: &Path) -> io::Result<FsMetadata> {
        let inner = self.inner.lock().unwrap();
        let norm = Self::normalize(path);
        Self::check_readable(&inner, &norm)?;
        let node = inner.nodes.get(&norm).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", norm.display()),
            )
        })?;
        match node {
            VNode::File { data, modified } => Ok(FsMetadata {
                is_file: true,
                is_dir: false,
                len: data.len() as u64,
                modified: Some(*modified),
            }),
            VNode::Dir { modified } => Ok(FsMetadata {
                is_file: false,
                is_dir: true,
                len: 0,
                modified: Some(*modified),
            }),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let inner = self.inner.lock().unwrap();
        let norm = Self::normalize(path);
        Self::check_readable(&inner, &norm)?;
        match inner.nodes.get(&norm) {
            Some(VNode::Dir { .. }) => {}
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} is not a directory", norm.display()),
                ))
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", norm.display()),
                ))
            }
        }
        let mut out = Vec::new();
        if let Some(children) = inner.children.get(&norm) {
            for child_path in children.values() {
                if let Some(node) = inner.nodes.get(child_path) {
                    let metadata = match node {
                        VNode::File { data, modified } => FsMetadata {
                            is_file: true,
                            is_dir: false,
                            len: data.len() as u64,
                            modified: Some(*modified),
                        },
                        VNode::Dir { modified } => FsMetadata {
                            is_file: false,
                            is_dir: true,
                            len: 0,
                            modified: Some(*modified),
                        },
                    };
                    out.push(DirEntry {
                        path: child_path.clone(),
                        metadata,
                    });
                }
            }
        }
        Ok(out)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let norm = Self::normalize(path);
        Self::check_readable(&inner, &norm)?;
        match inner.nodes.get(&norm) {
            Some(VNode::File { data, .. }) => Ok(data.clone()),
            Some(VNode::Dir { .. }) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is a directory", norm.display()),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", norm.display()),
            )),
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.insert_file(path, data.to_vec());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut current = PathBuf::from("/");
        for comp in path.components() {
            if let Component::Normal(c) = comp {
                current.push(c);
                inner.nodes.entry(current.clone()).or_insert(VNode::Dir {
                    modified: SystemTime::now(),
                });
                let current_clone = current.clone();
                Self::link_child(&mut inner, &current_clone);
            }
        }
        Ok(())
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let data = self.read(path)?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileWriter>> {
        let norm = Self::normalize(path);
        {
            let inner = self.inner.lock().unwrap();
            Self::check_readable(&inner, &norm)?;
        }
        self.insert_file(&norm, Vec::new());
        Ok(Box::new(VirtualFileWriter {
            fs: self.clone(),
            path: norm,
        }))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let from_norm = Self::normalize(from);
        let to_norm = Self::normalize(to);

        if from_norm == to_norm {
            return Ok(());
        }

        Self::ensure_parent(&mut inner, &to_norm);

        let node = inner.nodes.remove(&from_norm).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", from_norm.display()),
            )
        })?;
        inner.nodes.insert(to_norm.clone(), node);

        if let Some(parent) = from_norm.parent() {
            if let Some(children) = inner.children.get_mut(&Self::normalize(parent)) {
                children.retain(|_, p| p != &from_norm);
            }
        }
        Self::link_child(&mut inner, &to_norm);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let norm = Self::normalize(path);
        match inner.nodes.get(&norm) {
            Some(VNode::File { .. }) => {}
            Some(VNode::Dir { .. }) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} is a directory", norm.display()),
                ))
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", norm.display()),
                ))
            }
        }
        inner.nodes.remove(&norm);
        if let Some(parent) = norm.parent() {
            if let Some(children) = inner.children.get_mut(&Self::normalize(parent)) {
                children.retain(|_, p| p != &norm);
            }
        }
        Ok(())
    }
}
