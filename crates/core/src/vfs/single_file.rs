//! Virtual single-file filesystem: exposes one named path backed by a byte
//! buffer. All mutations return `PermissionError` (spec §4.6).

use std::time::SystemTime;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::message::permission_denied;

use super::{normalize_path, FileMeta, Filesystem, SeekFrom, VfsFile};

pub struct SingleFileFs {
    path: String,
    data: RwLock<Vec<u8>>,
    modtime: SystemTime,
}

impl SingleFileFs {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: normalize_path(&path.into()),
            data: RwLock::new(data.into()),
            modtime: SystemTime::now(),
        }
    }

    fn check_path(&self, name: &str) -> Result<()> {
        if normalize_path(name) == self.path {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{name} not found in single-file view"),
            )))
        }
    }
}

struct SingleFileHandle {
    data: Vec<u8>,
    pos: usize,
}

impl VfsFile for SingleFileHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(permission_denied("write", "single-file view"))
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.data.len() as i64 + delta,
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

    fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(permission_denied("truncate", "single-file view"))
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Filesystem for SingleFileFs {
    fn open(&self, name: &str) -> Result<Box<dyn VfsFile>> {
        self.check_path(name)?;
        Ok(Box::new(SingleFileHandle {
            data: self.data.read().clone(),
            pos: 0,
        }))
    }

    fn stat(&self, name: &str) -> Result<FileMeta> {
        self.check_path(name)?;
        Ok(FileMeta {
            name: self.path.clone(),
            size: self.data.read().len() as u64,
            mode: 0o444,
            modtime: self.modtime,
            is_dir: false,
        })
    }

    fn read_dir(&self, name: &str) -> Result<Vec<FileMeta>> {
        if normalize_path(name) == "/" {
            Ok(vec![self.stat(&self.path)?])
        } else {
            Ok(vec![])
        }
    }

    fn create(&self, _name: &str) -> Result<Box<dyn VfsFile>> {
        Err(permission_denied("create", "single-file view"))
    }
    fn mkdir(&self, _name: &str) -> Result<()> {
        Err(permission_denied("mkdir", "single-file view"))
    }
    fn mkdir_all(&self, _name: &str) -> Result<()> {
        Err(permission_denied("mkdir_all", "single-file view"))
    }
    fn remove(&self, _name: &str) -> Result<()> {
        Err(permission_denied("remove", "single-file view"))
    }
    fn remove_all(&self, _name: &str) -> Result<()> {
        Err(permission_denied("remove_all", "single-file view"))
    }
    fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(permission_denied("rename", "single-file view"))
    }
    fn chmod(&self, _name: &str, _mode: u32) -> Result<()> {
        Err(permission_denied("chmod", "single-file view"))
    }
    fn chown(&self, _name: &str, _uid: u32, _gid: u32) -> Result<()> {
        Err(permission_denied("chown", "single-file view"))
    }
    fn chtimes(&self, _name: &str, _atime: SystemTime, _mtime: SystemTime) -> Result<()> {
        Err(permission_denied("chtimes", "single-file view"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_view_rejects_every_mutation() {
        let fs = SingleFileFs::new("/data", b"hello".to_vec());
        assert!(fs.create("/x").is_err());
        assert!(fs.mkdir("/x").is_err());
        assert!(fs.remove("/data").is_err());
        assert!(fs.rename("/data", "/other").is_err());
        assert!(fs.chmod("/data", 0o600).is_err());
        let mut file = fs.open("/data").unwrap();
        assert!(file.write(b"x").is_err());
        assert!(file.truncate(0).is_err());
        // unaffected: the underlying bytes are unchanged
        assert_eq!(fs.stat("/data").unwrap().size, 5);
    }

    #[test]
    fn seek_rejects_negative_offset() {
        let fs = SingleFileFs::new("/data", b"hello".to_vec());
        let mut file = fs.open("/data").unwrap();
        assert!(file.seek(SeekFrom::Current(-1)).is_err());
    }
}
