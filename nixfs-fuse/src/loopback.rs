//! Loopback delegate performing real syscalls against the store tree.
//!
//! This is the production [`PassthroughNode`]: every operation maps onto the
//! file of the same relative path beneath the configured store root. The
//! overlay above it has already decided visibility; nothing here consults
//! the policy.

use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirEntryExt, FileExt, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};

use crate::node::{DirEntry, Errno, FileHandle, PassthroughNode, RawDirStream};

/// Delegate serving the real directory tree rooted at the store path.
pub struct LoopbackNode {
    root: PathBuf,
}

impl LoopbackNode {
    /// Serve the tree rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }
}

impl PassthroughNode for LoopbackNode {
    fn getattr(&self, rel: &Path) -> Result<FileAttr, Errno> {
        let meta = fs::symlink_metadata(self.full(rel)).map_err(|e| errno_from(&e))?;
        Ok(attr_from(&meta))
    }

    fn readlink(&self, rel: &Path) -> Result<OsString, Errno> {
        let target = fs::read_link(self.full(rel)).map_err(|e| errno_from(&e))?;
        Ok(target.into_os_string())
    }

    fn open(&self, rel: &Path, _flags: i32) -> Result<Box<dyn FileHandle>, Errno> {
        // The overlay has already vetted the access mode.
        let file = File::open(self.full(rel)).map_err(|e| errno_from(&e))?;
        Ok(Box::new(LoopbackFile { file }))
    }

    fn getxattr(&self, rel: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        let path = cstring(&self.full(rel))?;
        let name = CString::new(name.as_bytes()).map_err(|_| libc::EINVAL)?;
        // Size probe first, then fetch. ERANGE means the attribute grew in
        // between; probe again.
        loop {
            let len =
                unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
            if len < 0 {
                return Err(last_errno());
            }
            let mut buf = vec![0u8; len as usize];
            let got = unsafe {
                libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
            };
            if got >= 0 {
                buf.truncate(got as usize);
                return Ok(buf);
            }
            let errno = last_errno();
            if errno != libc::ERANGE {
                return Err(errno);
            }
        }
    }

    fn opendir(&self, rel: &Path) -> Result<Box<dyn RawDirStream>, Errno> {
        let stream = LoopbackDirStream::open(self.full(rel))?;
        Ok(Box::new(stream))
    }
}

struct LoopbackFile {
    file: File,
}

impl FileHandle for LoopbackFile {
    fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(errno_from(&e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

/// Lazy raw enumerator over one real directory.
///
/// Offsets are entry ordinals starting at 1, with `.` and `..` occupying the
/// first two slots the way a raw getdents listing would. `seek` re-reads the
/// directory and skips, which keeps the stream lazy at the cost of a re-read
/// on resync.
struct LoopbackDirStream {
    dir: PathBuf,
    iter: fs::ReadDir,
    next_offset: i64,
    self_ino: u64,
    parent_ino: u64,
}

impl LoopbackDirStream {
    fn open(dir: PathBuf) -> Result<Self, Errno> {
        let iter = fs::read_dir(&dir).map_err(|e| errno_from(&e))?;
        let self_ino = ino_of(&dir)?;
        let parent_ino = ino_of(dir.parent().unwrap_or(&dir))?;
        Ok(Self {
            dir,
            iter,
            next_offset: 1,
            self_ino,
            parent_ino,
        })
    }
}

impl RawDirStream for LoopbackDirStream {
    fn next_entry(&mut self) -> Result<Option<DirEntry>, Errno> {
        let offset = self.next_offset;
        if offset == 1 {
            self.next_offset += 1;
            return Ok(Some(DirEntry {
                name: OsString::from("."),
                ino: self.self_ino,
                kind: FileType::Directory,
                offset,
            }));
        }
        if offset == 2 {
            self.next_offset += 1;
            return Ok(Some(DirEntry {
                name: OsString::from(".."),
                ino: self.parent_ino,
                kind: FileType::Directory,
                offset,
            }));
        }
        match self.iter.next() {
            None => Ok(None),
            Some(Err(err)) => Err(errno_from(&err)),
            Some(Ok(entry)) => {
                self.next_offset += 1;
                let kind = entry
                    .file_type()
                    .map(file_type)
                    .unwrap_or(FileType::RegularFile);
                Ok(Some(DirEntry {
                    name: entry.file_name(),
                    ino: entry.ino(),
                    kind,
                    offset,
                }))
            }
        }
    }

    fn seek(&mut self, offset: i64) -> Result<(), Errno> {
        self.iter = fs::read_dir(&self.dir).map_err(|e| errno_from(&e))?;
        // Ordinals 1 and 2 are the synthetic dot entries; only the rest
        // consume the real iterator.
        let skip_real = (offset - 2).max(0);
        for _ in 0..skip_real {
            match self.iter.next() {
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(errno_from(&err)),
                None => break,
            }
        }
        self.next_offset = offset + 1;
        Ok(())
    }

    fn sync(&mut self, datasync: bool) -> Result<(), Errno> {
        let dir = File::open(&self.dir).map_err(|e| errno_from(&e))?;
        let result = if datasync {
            dir.sync_data()
        } else {
            dir.sync_all()
        };
        result.map_err(|e| errno_from(&e))
    }
}

fn ino_of(path: &Path) -> Result<u64, Errno> {
    fs::symlink_metadata(path)
        .map(|meta| meta.ino())
        .map_err(|e| errno_from(&e))
}

fn cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)
}

fn errno_from(err: &io::Error) -> Errno {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn last_errno() -> Errno {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn file_type(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn attr_from(meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        ino: meta.ino(),
        size: meta.size(),
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: file_type(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn timestamp(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}
