//! OS-backed filesystem: passthrough to the host filesystem, rooted at a
//! configured directory (spec §4.6).

use std::fs;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{Error, Result};

use super::{normalize_path, FileMeta, Filesystem, SeekFrom, VfsFile};

pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let normalized = normalize_path(name);
        self.root.join(normalized.trim_start_matches('/'))
    }

    fn meta(name: &str, path: &Path) -> Result<FileMeta> {
        let m = fs::metadata(path)?;
        Ok(FileMeta {
            name: name.to_string(),
            size: m.len(),
            mode: mode_of(&m),
            modtime: m.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_dir: m.is_dir(),
        })
    }
}

#[cfg(unix)]
fn mode_of(m: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    m.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(m: &fs::Metadata) -> u32 {
    if m.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

struct OsHandle(fs::File);

impl VfsFile for OsHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.0.read(buf)?)
    }
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.0.write(buf)?)
    }
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let std_pos = match pos {
            SeekFrom::Start(p) => std::io::SeekFrom::Start(p),
            SeekFrom::End(d) => std::io::SeekFrom::End(d),
            SeekFrom::Current(d) => std::io::SeekFrom::Current(d),
        };
        self.0.seek(std_pos).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidInput {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "negative seek offset",
                ))
            } else {
                Error::Io(e)
            }
        })
    }
    fn truncate(&mut self, size: u64) -> Result<()> {
        Ok(self.0.set_len(size)?)
    }
    fn sync(&mut self) -> Result<()> {
        Ok(self.0.sync_all()?)
    }
}

impl Filesystem for OsFs {
    fn open(&self, name: &str) -> Result<Box<dyn VfsFile>> {
        let f = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.resolve(name))?;
        Ok(Box::new(OsHandle(f)))
    }

    fn stat(&self, name: &str) -> Result<FileMeta> {
        Self::meta(&normalize_path(name), &self.resolve(name))
    }

    fn read_dir(&self, name: &str) -> Result<Vec<FileMeta>> {
        let base = normalize_path(name);
        let mut out = Vec::new();
        for entry in fs::read_dir(self.resolve(name))? {
            let entry = entry?;
            let child_name = format!(
                "{}/{}",
                base.trim_end_matches('/'),
                entry.file_name().to_string_lossy()
            );
            out.push(Self::meta(&child_name, &entry.path())?);
        }
        Ok(out)
    }

    fn create(&self, name: &str) -> Result<Box<dyn VfsFile>> {
        let f = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.resolve(name))?;
        Ok(Box::new(OsHandle(f)))
    }

    fn mkdir(&self, name: &str) -> Result<()> {
        Ok(fs::create_dir(self.resolve(name))?)
    }

    fn mkdir_all(&self, name: &str) -> Result<()> {
        Ok(fs::create_dir_all(self.resolve(name))?)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.resolve(name);
        if path.is_dir() {
            Ok(fs::remove_dir(path)?)
        } else {
            Ok(fs::remove_file(path)?)
        }
    }

    fn remove_all(&self, name: &str) -> Result<()> {
        let path = self.resolve(name);
        if path.is_dir() {
            Ok(fs::remove_dir_all(path)?)
        } else {
            Ok(fs::remove_file(path)?)
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        Ok(fs::rename(self.resolve(from), self.resolve(to))?)
    }

    #[cfg(unix)]
    fn chmod(&self, name: &str, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        Ok(fs::set_permissions(
            self.resolve(name),
            fs::Permissions::from_mode(mode),
        )?)
    }
    #[cfg(not(unix))]
    fn chmod(&self, name: &str, mode: u32) -> Result<()> {
        let mut perms = fs::metadata(self.resolve(name))?.permissions();
        perms.set_readonly(mode & 0o200 == 0);
        Ok(fs::set_permissions(self.resolve(name), perms)?)
    }

    fn chown(&self, _name: &str, _uid: u32, _gid: u32) -> Result<()> {
        // Ownership changes require platform-specific privileged syscalls
        // not exposed by std; host deployments that need this should run
        // the process as the target user instead.
        Err(Error::PermissionError(
            "chown is not supported on the OS-backed view".to_string(),
        ))
    }

    fn chtimes(&self, name: &str, _atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let path = self.resolve(name);
        let f = fs::OpenOptions::new().write(true).open(&path)?;
        let duration = mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        f.set_modified(SystemTime::UNIX_EPOCH + duration)?;
        Ok(())
    }
}
