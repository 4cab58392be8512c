//! Virtual filesystem abstraction consumed by runners (spec §4.6).
//!
//! Four concrete backings share one `Filesystem` interface: OS-backed
//! passthrough, an in-memory map, a read-only single-file view, and a
//! read-only multipart view. All mutating operations on a read-only
//! backing return [`Error::PermissionError`] and leave the view unchanged
//! (spec §8 invariant 7).

mod memory;
mod multipart;
mod os;
mod single_file;

pub use memory::MemoryFs;
pub use multipart::MultipartFs;
pub use os::OsFs;
pub use single_file::SingleFileFs;

use crate::error::Result;
use std::time::SystemTime;

/// Metadata for one filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub modtime: SystemTime,
    pub is_dir: bool,
}

/// An open file handle. Read-only backings return `PermissionError` from
/// `write`/`truncate`/`sync`.
pub trait VfsFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    /// Seek to an absolute offset. A negative resulting offset is an error.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;
    fn truncate(&mut self, size: u64) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// Mirrors `std::io::SeekFrom` so backings don't need to depend on a file
/// actually being `std::io`-backed (the in-memory one isn't).
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    End(i64),
    Current(i64),
}

/// Read-mostly hierarchical filesystem view.
///
/// Path normalization collapses `.`/`..` segments and treats `/` and `.`
/// as equivalent for the root (spec §4.6 invariant).
pub trait Filesystem: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn VfsFile>>;
    fn stat(&self, name: &str) -> Result<FileMeta>;
    fn read_dir(&self, name: &str) -> Result<Vec<FileMeta>>;
    fn create(&self, name: &str) -> Result<Box<dyn VfsFile>>;
    fn mkdir(&self, name: &str) -> Result<()>;
    fn mkdir_all(&self, name: &str) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
    fn remove_all(&self, name: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn chmod(&self, name: &str, mode: u32) -> Result<()>;
    fn chown(&self, name: &str, uid: u32, gid: u32) -> Result<()>;
    fn chtimes(&self, name: &str, atime: SystemTime, mtime: SystemTime) -> Result<()>;
}

/// Collapse `.`/`..` segments and map `.`/empty to `/`.
///
/// `../` above the root clamps at the root rather than erroring, matching
/// the "read-mostly" no-escape posture the in-memory and multipart
/// backings rely on.
pub fn normalize_path(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in name.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(normalize_path("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_path("."), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/a/../../b"), "/b");
    }
}
