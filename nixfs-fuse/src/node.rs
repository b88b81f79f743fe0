//! The delegate boundary and the access-checking overlay in front of it.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::Arc;

use fuser::{FileAttr, FileType};

use crate::dirstream::FilteredDirStream;
use crate::policy::AccessPolicy;

/// Raw OS error number returned to the kernel.
pub type Errno = libc::c_int;

/// One entry produced by a directory stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name within its directory.
    pub name: OsString,
    /// Inode number of the underlying file.
    pub ino: u64,
    /// File type, as far as the enumerator knows it.
    pub kind: FileType,
    /// Cursor offset the kernel uses to resume enumeration after this entry.
    pub offset: i64,
}

/// Lazy enumerator over the raw entries of one real directory.
pub trait RawDirStream: Send {
    /// Produce the next entry, or `None` once exhausted.
    fn next_entry(&mut self) -> Result<Option<DirEntry>, Errno>;

    /// Reposition so the next entry returned is the one after `offset`.
    fn seek(&mut self, _offset: i64) -> Result<(), Errno> {
        Err(libc::ENOTSUP)
    }

    /// Flush directory metadata to stable storage.
    fn sync(&mut self, _datasync: bool) -> Result<(), Errno> {
        Err(libc::ENOTSUP)
    }
}

/// An open, read-only file.
pub trait FileHandle: Send + Sync {
    /// Read up to `size` bytes at `offset`.
    fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>, Errno>;
}

/// Read-only capabilities the overlay borrows from the real filesystem.
///
/// Implementations perform the actual syscalls against the store tree; the
/// overlay in front decides what may be revealed. Keeping this a trait keeps
/// the access logic testable without a kernel mount, and makes it explicit
/// that no mutating capability is ever requested from below.
pub trait PassthroughNode: Send + Sync {
    /// Stat the file at `rel`, without following a final symlink.
    fn getattr(&self, rel: &Path) -> Result<FileAttr, Errno>;

    /// Read the target of the symlink at `rel`.
    fn readlink(&self, rel: &Path) -> Result<OsString, Errno>;

    /// Open the file at `rel` for reading.
    fn open(&self, rel: &Path, flags: i32) -> Result<Box<dyn FileHandle>, Errno>;

    /// Read the extended attribute `name` of the file at `rel`.
    fn getxattr(&self, rel: &Path, name: &OsStr) -> Result<Vec<u8>, Errno>;

    /// Enumerate the raw entries of the directory at `rel`.
    fn opendir(&self, rel: &Path) -> Result<Box<dyn RawDirStream>, Errno>;
}

/// Access-filtered, effectively read-only view over the passthrough delegate.
///
/// Denied paths fail with `ENOENT` rather than a permission error, so a
/// filtered object is indistinguishable from an absent one.
pub struct Overlay {
    policy: Arc<AccessPolicy>,
    delegate: Arc<dyn PassthroughNode>,
}

impl Overlay {
    /// Enforce `policy` in front of `delegate`.
    pub fn new(policy: Arc<AccessPolicy>, delegate: Arc<dyn PassthroughNode>) -> Self {
        Self { policy, delegate }
    }

    fn check(&self, rel: &Path) -> Result<(), Errno> {
        if self.policy.permits(rel) {
            Ok(())
        } else {
            Err(libc::ENOENT)
        }
    }

    /// Resolve `name` within the directory `rel`.
    pub fn lookup(&self, rel: &Path, name: &OsStr) -> Result<FileAttr, Errno> {
        let child = rel.join(name);
        self.check(&child)?;
        self.delegate.getattr(&child)
    }

    /// Stat the file at `rel`.
    pub fn getattr(&self, rel: &Path) -> Result<FileAttr, Errno> {
        self.check(rel)?;
        self.delegate.getattr(rel)
    }

    /// Read the symlink target at `rel`.
    pub fn readlink(&self, rel: &Path) -> Result<OsString, Errno> {
        self.check(rel)?;
        self.delegate.readlink(rel)
    }

    /// Read one extended attribute of the file at `rel`.
    pub fn getxattr(&self, rel: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        self.check(rel)?;
        self.delegate.getxattr(rel, name)
    }

    /// Open the file at `rel`; only read-only access modes are served.
    pub fn open(&self, rel: &Path, flags: i32) -> Result<Box<dyn FileHandle>, Errno> {
        self.check(rel)?;
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(libc::ENOTSUP);
        }
        self.delegate.open(rel, flags)
    }

    /// Handle a create request for `name` within `rel`.
    ///
    /// Nothing is ever created: read-only flags on an existing file degrade
    /// to a plain open, everything else is refused even though the access
    /// check already passed.
    pub fn create(
        &self,
        rel: &Path,
        name: &OsStr,
        flags: i32,
    ) -> Result<(FileAttr, Box<dyn FileHandle>), Errno> {
        let child = rel.join(name);
        self.check(&child)?;
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(libc::ENOTSUP);
        }
        let attr = self.delegate.getattr(&child)?;
        let handle = self.delegate.open(&child, flags)?;
        Ok((attr, handle))
    }

    /// Open the directory at `rel` as a filtered stream.
    pub fn opendir(&self, rel: &Path) -> Result<FilteredDirStream, Errno> {
        self.check(rel)?;
        let raw = self.delegate.opendir(rel)?;
        Ok(FilteredDirStream::new(raw, Arc::clone(&self.policy), rel))
    }

    // Mutations are refused outright. No access check happens first, so a
    // denied path and a permitted one answer identically.

    /// Refuse to create a special file.
    pub fn mknod(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to create a directory.
    pub fn mkdir(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to remove a directory.
    pub fn rmdir(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to remove a file.
    pub fn unlink(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to rename.
    pub fn rename(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to create a symlink.
    pub fn symlink(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to create a hardlink.
    pub fn link(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to change attributes.
    pub fn setattr(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to set an extended attribute.
    pub fn setxattr(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to remove an extended attribute.
    pub fn removexattr(&self) -> Errno {
        libc::ENOTSUP
    }

    /// Refuse to copy a byte range.
    pub fn copy_file_range(&self) -> Errno {
        libc::ENOTSUP
    }
}
