//! In-memory filesystem backing. Keys are normalized paths; a single
//! readers-writer lock protects the map (spec §4.6, §5 "Shared resource
//! policy").

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::error::{Error, Result};

use super::{normalize_path, FileMeta, Filesystem, SeekFrom, VfsFile};

#[derive(Clone)]
struct Entry {
    bytes: Vec<u8>,
    mode: u32,
    modtime: SystemTime,
    is_dir: bool,
}

pub struct MemoryFs {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/".to_string(),
            Entry {
                bytes: Vec::new(),
                mode: 0o755,
                modtime: SystemTime::now(),
                is_dir: true,
            },
        );
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    fn not_found(name: &str) -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{name} not found"),
        ))
    }

    fn parent_of(path: &str) -> String {
        match path.rfind('/') {
            Some(0) => "/".to_string(),
            Some(idx) => path[..idx].to_string(),
            None => "/".to_string(),
        }
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryHandle {
    fs_entries: Arc<RwLock<BTreeMap<String, Entry>>>,
    path: String,
    buf: Vec<u8>,
    pos: usize,
    dirty: bool,
}

impl VfsFile for MemoryHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.buf[self.pos.min(self.buf.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let end = self.pos + buf.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        self.dirty = true;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.buf.len() as i64 + delta,
        };
        if new_pos < 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "negative seek offset",
            )));
        }
        self.pos = new_pos as usize;
        Ok(self.pos as u64)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.buf.resize(size as usize, 0);
        self.dirty = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.dirty {
            let mut guard = self.fs_entries.write();
            if let Some(entry) = guard.get_mut(&self.path) {
                entry.bytes = self.buf.clone();
                entry.modtime = SystemTime::now();
            }
            self.dirty = false;
        }
        Ok(())
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

impl Filesystem for MemoryFs {
    fn open(&self, name: &str) -> Result<Box<dyn VfsFile>> {
        let path = normalize_path(name);
        let guard = self.entries.read();
        let entry = guard.get(&path).ok_or_else(|| Self::not_found(&path))?;
        if entry.is_dir {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{path} is a directory"),
            )));
        }
        Ok(Box::new(MemoryHandle {
            fs_entries: Arc::clone(&self.entries),
            path,
            buf: entry.bytes.clone(),
            pos: 0,
            dirty: false,
        }))
    }

    fn stat(&self, name: &str) -> Result<FileMeta> {
        let path = normalize_path(name);
        let guard = self.entries.read();
        let entry = guard.get(&path).ok_or_else(|| Self::not_found(&path))?;
        Ok(FileMeta {
            name: path,
            size: entry.bytes.len() as u64,
            mode: entry.mode,
            modtime: entry.modtime,
            is_dir: entry.is_dir,
        })
    }

    fn read_dir(&self, name: &str) -> Result<Vec<FileMeta>> {
        let path = normalize_path(name);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let guard = self.entries.read();
        if !guard.contains_key(&path) {
            return Err(Self::not_found(&path));
        }
        let mut children = Vec::new();
        for (key, entry) in guard.iter() {
            if key == &path {
                continue;
            }
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    children.push(FileMeta {
                        name: key.clone(),
                        size: entry.bytes.len() as u64,
                        mode: entry.mode,
                        modtime: entry.modtime,
                        is_dir: entry.is_dir,
                    });
                }
            }
        }
        Ok(children)
    }

    fn create(&self, name: &str) -> Result<Box<dyn VfsFile>> {
        let path = normalize_path(name);
        let parent = Self::parent_of(&path);
        {
            let guard = self.entries.read();
            if !guard.contains_key(&parent) {
                return Err(Self::not_found(&parent));
            }
        }
        self.entries.write().insert(
            path.clone(),
            Entry {
                bytes: Vec::new(),
                mode: 0o644,
                modtime: SystemTime::now(),
                is_dir: false,
            },
        );
        self.open(&path)
    }

    fn mkdir(&self, name: &str) -> Result<()> {
        let path = normalize_path(name);
        let parent = Self::parent_of(&path);
        let mut guard = self.entries.write();
        if !guard.contains_key(&parent) {
            return Err(Self::not_found(&parent));
        }
        guard.entry(path).or_insert(Entry {
            bytes: Vec::new(),
            mode: 0o755,
            modtime: SystemTime::now(),
            is_dir: true,
        });
        Ok(())
    }

    fn mkdir_all(&self, name: &str) -> Result<()> {
        let path = normalize_path(name);
        let mut guard = self.entries.write();
        let mut built = String::new();
        for seg in path.trim_start_matches('/').split('/') {
            if seg.is_empty() {
                continue;
            }
            built.push('/');
            built.push_str(seg);
            guard.entry(built.clone()).or_insert(Entry {
                bytes: Vec::new(),
                mode: 0o755,
                modtime: SystemTime::now(),
                is_dir: true,
            });
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = normalize_path(name);
        let mut guard = self.entries.write();
        if guard.remove(&path).is_none() {
            return Err(Self::not_found(&path));
        }
        Ok(())
    }

    fn remove_all(&self, name: &str) -> Result<()> {
        let path = normalize_path(name);
        let prefix = format!("{path}/");
        let mut guard = self.entries.write();
        guard.retain(|key, _| key != &path && !key.starts_with(&prefix));
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        let mut guard = self.entries.write();
        let entry = guard.remove(&from).ok_or_else(|| Self::not_found(&from))?;
        guard.insert(to, entry);
        Ok(())
    }

    fn chmod(&self, name: &str, mode: u32) -> Result<()> {
        let path = normalize_path(name);
        let mut guard = self.entries.write();
        let entry = guard.get_mut(&path).ok_or_else(|| Self::not_found(&path))?;
        entry.mode = mode;
        Ok(())
    }

    fn chown(&self, name: &str, _uid: u32, _gid: u32) -> Result<()> {
        let path = normalize_path(name);
        let guard = self.entries.read();
        if !guard.contains_key(&path) {
            return Err(Self::not_found(&path));
        }
        Ok(())
    }

    fn chtimes(&self, name: &str, _atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let path = normalize_path(name);
        let mut guard = self.entries.write();
        let entry = guard.get_mut(&path).ok_or_else(|| Self::not_found(&path))?;
        entry.modtime = mtime;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let fs = MemoryFs::new();
        fs.mkdir_all("/a/b").unwrap();
        let mut f = fs.create("/a/b/file.txt").unwrap();
        f.write(b"hello").unwrap();
        f.sync().unwrap();
        drop(f);
        let mut f2 = fs.open("/a/b/file.txt").unwrap();
        let mut buf = [0u8; 5];
        f2.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_dir_lists_immediate_children_only() {
        let fs = MemoryFs::new();
        fs.mkdir_all("/a/b").unwrap();
        fs.create("/a/top.txt").unwrap();
        fs.create("/a/b/nested.txt").unwrap();
        let children = fs.read_dir("/a").unwrap();
        let names: Vec<_> = children.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"/a/top.txt"));
        assert!(names.contains(&"/a/b"));
        assert!(!names.contains(&"/a/b/nested.txt"));
    }

    #[test]
    fn remove_all_matches_by_prefix() {
        let fs = MemoryFs::new();
        fs.mkdir_all("/a/b").unwrap();
        fs.create("/a/b/one.txt").unwrap();
        fs.create("/a/b/two.txt").unwrap();
        fs.remove_all("/a/b").unwrap();
        assert!(fs.stat("/a/b").is_err());
        assert!(fs.stat("/a/b/one.txt").is_err());
    }

    #[test]
    fn rename_moves_entry() {
        let fs = MemoryFs::new();
        fs.create("/x.txt").unwrap();
        fs.rename("/x.txt", "/y.txt").unwrap();
        assert!(fs.stat("/x.txt").is_err());
        assert!(fs.stat("/y.txt").is_ok());
    }
}
