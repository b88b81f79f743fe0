//! Kernel adapter: inode bookkeeping and fuser replies around [`Overlay`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};

use crate::dirstream::FilteredDirStream;
use crate::node::{Errno, FileHandle, Overlay};

/// Attribute TTL handed to the kernel. The store is immutable for the
/// lifetime of the mount, so a generous value is safe.
const TTL: Duration = Duration::from_secs(60);

const ROOT_INO: u64 = 1;

struct InodeEntry {
    rel: PathBuf,
    nlookup: u64,
}

struct DirHandle {
    stream: FilteredDirStream,
    /// Offset of the last entry delivered to the kernel; -1 forces a reseek.
    last_offset: i64,
}

/// The mounted filesystem: an [`Overlay`] plus per-mount kernel state.
///
/// Inode numbers are handed out per relative path, starting at the root.
/// They live as long as the kernel holds lookups on them and are evicted by
/// `forget`. Open files and directories sit in handle tables keyed by the
/// file-handle word returned to the kernel.
pub struct NixFs {
    overlay: Overlay,
    inodes: HashMap<u64, InodeEntry>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
    dir_handles: HashMap<u64, DirHandle>,
    file_handles: HashMap<u64, Box<dyn FileHandle>>,
    next_fh: u64,
}

impl NixFs {
    /// Wrap `overlay` for mounting.
    pub fn new(overlay: Overlay) -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_INO,
            InodeEntry {
                rel: PathBuf::new(),
                nlookup: 1,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(PathBuf::new(), ROOT_INO);
        Self {
            overlay,
            inodes,
            by_path,
            next_ino: ROOT_INO + 1,
            dir_handles: HashMap::new(),
            file_handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn rel(&self, ino: u64) -> Result<PathBuf, Errno> {
        self.inodes
            .get(&ino)
            .map(|entry| entry.rel.clone())
            .ok_or(libc::ESTALE)
    }

    /// Record a kernel lookup on `rel`, minting an inode if needed.
    fn register(&mut self, rel: PathBuf) -> u64 {
        if let Some(&ino) = self.by_path.get(&rel) {
            if let Some(entry) = self.inodes.get_mut(&ino) {
                entry.nlookup += 1;
            }
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_path.insert(rel.clone(), ino);
        self.inodes.insert(ino, InodeEntry { rel, nlookup: 1 });
        ino
    }

    fn mint_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }
}

impl Filesystem for NixFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let dir = match self.rel(parent) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        match self.overlay.lookup(&dir, name) {
            Ok(mut attr) => {
                let ino = self.register(dir.join(name));
                attr.ino = ino;
                reply.entry(&TTL, &attr, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.nlookup = entry.nlookup.saturating_sub(nlookup);
            if entry.nlookup == 0 {
                let rel = entry.rel.clone();
                self.inodes.remove(&ino);
                self.by_path.remove(&rel);
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let rel = match self.rel(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        match self.overlay.getattr(&rel) {
            Ok(mut attr) => {
                attr.ino = ino;
                reply.attr(&TTL, &attr);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let rel = match self.rel(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        match self.overlay.readlink(&rel) {
            Ok(target) => {
                use std::os::unix::ffi::OsStrExt;
                reply.data(target.as_bytes());
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let rel = match self.rel(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        match self.overlay.open(&rel, flags) {
            Ok(handle) => {
                let fh = self.mint_fh();
                self.file_handles.insert(fh, handle);
                reply.opened(fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let handle = match self.file_handles.get(&fh) {
            Some(handle) => handle,
            None => return reply.error(libc::EBADF),
        };
        match handle.read_at(offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.file_handles.remove(&fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let rel = match self.rel(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        match self.overlay.opendir(&rel) {
            Ok(stream) => {
                let fh = self.mint_fh();
                self.dir_handles.insert(
                    fh,
                    DirHandle {
                        stream,
                        last_offset: 0,
                    },
                );
                reply.opened(fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let handle = match self.dir_handles.get_mut(&fh) {
            Some(handle) => handle,
            None => return reply.error(libc::EBADF),
        };
        if offset != handle.last_offset {
            if let Err(errno) = handle.stream.seek(offset) {
                return reply.error(errno);
            }
            handle.last_offset = offset;
        }
        loop {
            match handle.stream.next() {
                Ok(Some(entry)) => {
                    if reply.add(entry.ino, entry.offset, entry.kind, &entry.name) {
                        // Full buffer: the pulled entry was not delivered,
                        // so force a reseek when the kernel resumes.
                        handle.last_offset = -1;
                        break;
                    }
                    handle.last_offset = entry.offset;
                }
                Ok(None) => break,
                Err(errno) => return reply.error(errno),
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles.remove(&fh);
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.dir_handles.get(&fh) {
            Some(handle) => match handle.stream.sync(datasync) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let rel = match self.rel(ino) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        match self.overlay.getxattr(&rel, name) {
            Ok(value) if size == 0 => reply.size(value.len() as u32),
            Ok(value) if value.len() <= size as usize => reply.data(&value),
            Ok(_) => reply.error(libc::ERANGE),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let dir = match self.rel(parent) {
            Ok(rel) => rel,
            Err(errno) => return reply.error(errno),
        };
        match self.overlay.create(&dir, name, flags) {
            Ok((mut attr, handle)) => {
                let ino = self.register(dir.join(name));
                attr.ino = ino;
                let fh = self.mint_fh();
                self.file_handles.insert(fh, handle);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.overlay.mknod());
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.overlay.mkdir());
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.overlay.rmdir());
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.overlay.unlink());
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.overlay.rename());
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(self.overlay.symlink());
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(self.overlay.link());
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(self.overlay.setattr());
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.overlay.setxattr());
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.overlay.removexattr());
    }

    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        _ino_in: u64,
        _fh_in: u64,
        _offset_in: i64,
        _ino_out: u64,
        _fh_out: u64,
        _offset_out: i64,
        _len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        reply.error(self.overlay.copy_file_range());
    }
}

/// Mount the filesystem at `mountpoint` and block until it is unmounted.
///
/// `item` names the mounted derivation in the filesystem source field, so
/// mount tables show what the view was filtered to.
pub fn mount(fs: NixFs, mountpoint: &Path, item: &str) -> std::io::Result<()> {
    let options = [
        MountOption::AllowOther,
        MountOption::FSName(format!("derivation: {item}")),
        MountOption::Subtype("nixfs".to_owned()),
    ];
    fuser::mount2(fs, mountpoint, &options)
}
