//! Multipart filesystem: exposes files uploaded in an HTTP multipart form.
//! Read-only; directory listing returns the flat list of uploaded parts
//! (spec §4.6).

use std::collections::HashMap;
use std::time::SystemTime;

use crate::error::Result;
use crate::message::permission_denied;

use super::{normalize_path, FileMeta, Filesystem, SeekFrom, VfsFile};

pub struct MultipartFs {
    parts: HashMap<String, Vec<u8>>,
    uploaded_at: SystemTime,
}

impl MultipartFs {
    /// Build from the parsed `(field_name, bytes)` pairs of a multipart
    /// form. Field names are normalized to absolute paths, e.g. `"avatar"`
    /// becomes `/avatar`.
    pub fn new(parts: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        let parts = parts
            .into_iter()
            .map(|(name, bytes)| (normalize_path(&name), bytes))
            .collect();
        Self {
            parts,
            uploaded_at: SystemTime::now(),
        }
    }
}

struct MultipartHandle {
    data: Vec<u8>,
    pos: usize,
}

impl VfsFile for MultipartHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(permission_denied("write", "multipart view"))
    }
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.data.len() as i64 + delta,
        };
        if new_pos < 0 {
            return Err(crate::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "negative seek offset",
            )));
        }
        self.pos = new_pos as usize;
        Ok(self.pos as u64)
    }
    fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(permission_denied("truncate", "multipart view"))
    }
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Filesystem for MultipartFs {
    fn open(&self, name: &str) -> Result<Box<dyn VfsFile>> {
        let path = normalize_path(name);
        let data = self
            .parts
            .get(&path)
            .ok_or_else(|| {
                crate::error::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{path} not found in multipart view"),
                ))
            })?
            .clone();
        Ok(Box::new(MultipartHandle { data, pos: 0 }))
    }

    fn stat(&self, name: &str) -> Result<FileMeta> {
        let path = normalize_path(name);
        let data = self.parts.get(&path).ok_or_else(|| {
            crate::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{path} not found in multipart view"),
            ))
        })?;
        Ok(FileMeta {
            name: path,
            size: data.len() as u64,
            mode: 0o444,
            modtime: self.uploaded_at,
            is_dir: false,
        })
    }

    fn read_dir(&self, _name: &str) -> Result<Vec<FileMeta>> {
        let mut out: Vec<FileMeta> = self
            .parts
            .iter()
            .map(|(name, data)| FileMeta {
                name: name.clone(),
                size: data.len() as u64,
                mode: 0o444,
                modtime: self.uploaded_at,
                is_dir: false,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn create(&self, _name: &str) -> Result<Box<dyn VfsFile>> {
        Err(permission_denied("create", "multipart view"))
    }
    fn mkdir(&self, _name: &str) -> Result<()> {
        Err(permission_denied("mkdir", "multipart view"))
    }
    fn mkdir_all(&self, _name: &str) -> Result<()> {
        Err(permission_denied("mkdir_all", "multipart view"))
    }
    fn remove(&self, _name: &str) -> Result<()> {
        Err(permission_denied("remove", "multipart view"))
    }
    fn remove_all(&self, _name: &str) -> Result<()> {
        Err(permission_denied("remove_all", "multipart view"))
    }
    fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(permission_denied("rename", "multipart view"))
    }
    fn chmod(&self, _name: &str, _mode: u32) -> Result<()> {
        Err(permission_denied("chmod", "multipart view"))
    }
    fn chown(&self, _name: &str, _uid: u32, _gid: u32) -> Result<()> {
        Err(permission_denied("chown", "multipart view"))
    }
    fn chtimes(&self, _name: &str, _atime: SystemTime, _mtime: SystemTime) -> Result<()> {
        Err(permission_denied("chtimes", "multipart view"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_listing_and_read_only() {
        let fs = MultipartFs::new([
            ("avatar".to_string(), b"pngbytes".to_vec()),
            ("notes".to_string(), b"text".to_vec()),
        ]);
        let listing = fs.read_dir("/").unwrap();
        assert_eq!(listing.len(), 2);
        let mut f = fs.open("/avatar").unwrap();
        let mut buf = vec![0u8; 8];
        f.read(&mut buf).unwrap();
        assert_eq!(&buf, b"pngbytes");
        assert!(fs.create("/other").is_err());
    }
}
