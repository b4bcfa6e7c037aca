//! Passthrough FUSE filesystem over a source directory.
//!
//! Every request is forwarded to the same relative path under the source
//! directory. Attributes on the way out and ownership/mode changes on the
//! way in go through [`AttrTransformer`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use libc::{EBADF, EINVAL, EIO, ENOENT, ENOTDIR};
use log::{debug, error, info, warn};
use nix::sys::stat::{mknod, utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::statvfs;
use nix::sys::time::TimeSpec;
use nix::unistd::mkfifo;
use rebind_core::attrs::{ChmodDecision, LinkMode, PathProbe};
use rebind_core::{AttrTransformer, Attributes, Requester, TransformError};

/// Attribute TTL when every requester sees the same attributes.
pub const SHARED_ATTR_TTL: Duration = Duration::from_secs(1);

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFLNK: u32 = libc::S_IFLNK as u32;
const S_IFBLK: u32 = libc::S_IFBLK as u32;
const S_IFCHR: u32 = libc::S_IFCHR as u32;
const S_IFIFO: u32 = libc::S_IFIFO as u32;
const S_IFSOCK: u32 = libc::S_IFSOCK as u32;
const S_ISGID: u32 = libc::S_ISGID as u32;

type OpResult<T> = Result<T, TransformError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn requester(req: &Request<'_>) -> Requester {
    Requester::new(req.uid(), req.gid())
}

fn file_kind(mode: u32) -> FileType {
    match mode & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        S_IFBLK => FileType::BlockDevice,
        S_IFCHR => FileType::CharDevice,
        S_IFIFO => FileType::NamedPipe,
        S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

/// Attributes exactly as stored in the source tree.
fn raw_attr(meta: &fs::Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: file_kind(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn timespec(time: Option<TimeOrNow>) -> TimeSpec {
    match time {
        None => TimeSpec::UTIME_OMIT,
        Some(TimeOrNow::Now) => TimeSpec::UTIME_NOW,
        Some(TimeOrNow::SpecificTime(t)) => {
            TimeSpec::from(t.duration_since(UNIX_EPOCH).unwrap_or_default())
        }
    }
}

/// utimensat(2) without following a final symlink.
fn set_times(path: &Path, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>) -> io::Result<()> {
    utimensat(
        None,
        path,
        &timespec(atime),
        &timespec(mtime),
        UtimensatFlags::NoFollowSymlink,
    )?;
    Ok(())
}

/// Passthrough filesystem applying rebind's identity and permission rules.
pub struct RebindFs {
    source: PathBuf,
    transformer: AttrTransformer,
    /// Zero while mirroring, since requesters then see different owners.
    attr_ttl: Duration,
    /// Inode to path (relative to `source`) mapping.
    inode_to_path: Mutex<HashMap<u64, PathBuf>>,
    /// Path to inode mapping.
    path_to_inode: Mutex<HashMap<PathBuf, u64>>,
    /// Next available inode number.
    next_inode: Mutex<u64>,
    next_fh: AtomicU64,
    /// Open files by handle. Dropping a `File` closes its descriptor.
    handles: Mutex<HashMap<u64, File>>,
}

impl RebindFs {
    pub fn new(source: PathBuf, transformer: AttrTransformer) -> Self {
        let attr_ttl = if transformer.settings().mirroring_enabled() {
            Duration::ZERO
        } else {
            SHARED_ATTR_TTL
        };

        let mut inode_to_path = HashMap::new();
        let mut path_to_inode = HashMap::new();
        inode_to_path.insert(FUSE_ROOT_ID, PathBuf::new());
        path_to_inode.insert(PathBuf::new(), FUSE_ROOT_ID);

        Self {
            source,
            transformer,
            attr_ttl,
            inode_to_path: Mutex::new(inode_to_path),
            path_to_inode: Mutex::new(path_to_inode),
            next_inode: Mutex::new(FUSE_ROOT_ID + 1),
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn attr_ttl(&self) -> Duration {
        self.attr_ttl
    }

    // =========================================================================
    // Inode bookkeeping
    // =========================================================================

    /// Get or create inode for a relative path.
    fn inode_for(&self, rel: &Path) -> u64 {
        let mut path_to_inode = lock(&self.path_to_inode);
        if let Some(&ino) = path_to_inode.get(rel) {
            return ino;
        }

        let ino = {
            let mut next = lock(&self.next_inode);
            let ino = *next;
            *next += 1;
            ino
        };
        path_to_inode.insert(rel.to_path_buf(), ino);
        lock(&self.inode_to_path).insert(ino, rel.to_path_buf());
        ino
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        lock(&self.inode_to_path).get(&ino).cloned()
    }

    /// Drop `rel` and everything below it.
    fn forget(&self, rel: &Path) {
        let mut path_to_inode = lock(&self.path_to_inode);
        let mut inode_to_path = lock(&self.inode_to_path);
        path_to_inode.retain(|path, ino| {
            let gone = path.starts_with(rel) && *ino != FUSE_ROOT_ID;
            if gone {
                inode_to_path.remove(ino);
            }
            !gone
        });
    }

    /// Re-key `from` and everything below it to live under `to`.
    fn relocate(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        self.forget(to);
        let mut path_to_inode = lock(&self.path_to_inode);
        let mut inode_to_path = lock(&self.inode_to_path);

        let moved: Vec<(PathBuf, u64)> = path_to_inode
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let Ok(suffix) = old.strip_prefix(from) else {
                continue;
            };
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            path_to_inode.remove(&old);
            path_to_inode.insert(new.clone(), ino);
            inode_to_path.insert(ino, new);
        }
    }

    fn real(&self, rel: &Path) -> PathBuf {
        self.source.join(rel)
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    // =========================================================================
    // Attribute helpers
    // =========================================================================

    /// Attributes of `rel` as `who` should see them.
    fn attr_for(&self, who: Requester, ino: u64, rel: &Path) -> OpResult<FileAttr> {
        let real = self.real(rel);
        let meta = fs::symlink_metadata(&real)?;
        self.transform_attr(who, ino, &real, &meta)
    }

    fn transform_attr(
        &self,
        who: Requester,
        ino: u64,
        real: &Path,
        meta: &fs::Metadata,
    ) -> OpResult<FileAttr> {
        let raw = Attributes {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
        };
        let seen = self
            .transformer
            .reported_attributes(raw, who, &PathProbe::new(real))?;

        let settings = self.transformer.settings();
        let mut attr = raw_attr(meta, ino);
        attr.uid = seen.uid;
        attr.gid = seen.gid;
        attr.perm = (seen.mode & 0o7777) as u16;
        if settings.ctime_from_mtime {
            attr.ctime = attr.mtime;
        }
        if settings.hide_hard_links {
            attr.nlink = 1;
        }
        Ok(attr)
    }

    /// Look up a fresh entry and hand out its inode.
    fn entry_for(&self, who: Requester, rel: &Path) -> OpResult<FileAttr> {
        let real = self.real(rel);
        let meta = fs::symlink_metadata(&real)?;
        let ino = self.inode_for(rel);
        self.transform_attr(who, ino, &real, &meta)
    }

    /// Give a just-created inode its owner, best-effort. The inode already
    /// exists, so neither an identity overflow nor a refused chown fails the
    /// request; both leave it owned by the mounter.
    fn chown_new(&self, who: Requester, rel: &Path, link: LinkMode) {
        let parent_has_setgid = rel
            .parent()
            .and_then(|parent| fs::metadata(self.real(parent)).ok())
            .is_some_and(|meta| meta.mode() & S_ISGID != 0);

        let owner = match self.transformer.owner_for_new_file(who, parent_has_setgid) {
            Ok(owner) => owner,
            Err(e) => {
                debug!("No owner for new inode {}: {}", rel.display(), e);
                return;
            }
        };
        if let Err(e) = owner.apply(&self.real(rel), link) {
            debug!("Failed to chown new inode {}: {}", rel.display(), e);
        }
    }

    /// Map an error to an errno, logging the unexpected ones.
    fn errno(op: &str, err: TransformError) -> i32 {
        match &err {
            TransformError::PolicyDenied(_) => {}
            TransformError::IdOutOfRange { .. } => debug!("{}: {}", op, err),
            TransformError::Io(e) if e.kind() == io::ErrorKind::NotFound => {}
            TransformError::Io(_) => debug!("{}: {}", op, err),
        }
        err.to_errno()
    }

    // =========================================================================
    // Operation bodies
    // =========================================================================

    fn do_mknod(&self, who: Requester, rel: &Path, mode: u32, umask: u32, rdev: u32) -> OpResult<FileAttr> {
        let requested = (mode & S_IFMT) | (mode & !umask & 0o7777);
        let mode = self.transformer.creation_mode(requested);
        let real = self.real(rel);
        let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);

        if mode & S_IFMT == S_IFIFO {
            mkfifo(&real, perm).map_err(io::Error::from)?;
        } else {
            let kind = SFlag::from_bits_truncate((mode & S_IFMT) as libc::mode_t);
            mknod(&real, kind, perm, libc::dev_t::from(rdev)).map_err(io::Error::from)?;
        }

        self.chown_new(who, rel, LinkMode::Follow);
        self.entry_for(who, rel)
    }

    fn do_mkdir(&self, who: Requester, rel: &Path, mode: u32, umask: u32) -> OpResult<FileAttr> {
        let mode = self
            .transformer
            .creation_mode(S_IFDIR | (mode & !umask & 0o7777));
        DirBuilder::new()
            .mode(mode & 0o7777)
            .create(self.real(rel))?;

        self.chown_new(who, rel, LinkMode::Follow);
        self.entry_for(who, rel)
    }

    fn do_symlink(&self, who: Requester, rel: &Path, target: &Path) -> OpResult<FileAttr> {
        std::os::unix::fs::symlink(target, self.real(rel))?;
        self.chown_new(who, rel, LinkMode::NoFollow);
        self.entry_for(who, rel)
    }

    fn do_create(
        &self,
        who: Requester,
        rel: &Path,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> OpResult<(FileAttr, u64)> {
        let mode = self
            .transformer
            .creation_mode(S_IFREG | (mode & !umask & 0o7777));

        let mut options = open_options(flags);
        options.create(true).mode(mode & 0o7777);
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        }
        let file = options.open(self.real(rel))?;

        self.chown_new(who, rel, LinkMode::Follow);
        let attr = self.entry_for(who, rel)?;

        let fh = self.alloc_fh();
        lock(&self.handles).insert(fh, file);
        Ok((attr, fh))
    }

    #[allow(clippy::too_many_arguments)]
    fn do_setattr(
        &self,
        who: Requester,
        ino: u64,
        rel: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> OpResult<FileAttr> {
        let real = self.real(rel);

        if let Some(requested) = mode {
            let current = fs::symlink_metadata(&real)?.mode();
            match self.transformer.chmod_request(current, requested) {
                ChmodDecision::Apply(new_mode) => {
                    fs::set_permissions(&real, fs::Permissions::from_mode(new_mode))?;
                }
                ChmodDecision::Skip => debug!("setattr: chmod of {} ignored", rel.display()),
                ChmodDecision::Deny => return Err(TransformError::PolicyDenied("chmod")),
            }
        }

        if uid.is_some() || gid.is_some() {
            let owner = self.transformer.chown_request(uid, gid)?;
            owner.apply(&real, LinkMode::NoFollow);
        }

        if let Some(new_size) = size {
            let via_handle = match fh {
                Some(fh) => lock(&self.handles)
                    .get(&fh)
                    .map(|file| file.set_len(new_size)),
                None => None,
            };
            match via_handle {
                Some(result) => result?,
                None => OpenOptions::new().write(true).open(&real)?.set_len(new_size)?,
            }
        }

        if atime.is_some() || mtime.is_some() {
            set_times(&real, atime, mtime)?;
        }

        self.attr_for(who, ino, rel)
    }
}

/// Translate open(2) flags into `OpenOptions`.
fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    if flags & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    options.custom_flags(
        flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL),
    );
    options
}

impl Filesystem for RebindFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!("Serving {}", self.source.display());
        Ok(())
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup: parent={}, name={:?}", parent, name);

        let parent_path = match self.path_of(parent) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.entry_for(requester(req), &parent_path.join(name)) {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(e) => reply.error(Self::errno("lookup", e)),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr: ino={}", ino);

        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.attr_for(requester(req), ino, &path) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(e) => reply.error(Self::errno("getattr", e)),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr: ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?}",
            ino, mode, uid, gid, size
        );

        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.do_setattr(
            requester(req),
            ino,
            &path,
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            fh,
        ) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(e) => reply.error(Self::errno("setattr", e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink: ino={}", ino);

        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match fs::read_link(self.real(&path)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod: parent={}, name={:?}, mode={:o}", parent, name, mode);

        let parent_path = match self.path_of(parent) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.do_mknod(requester(req), &parent_path.join(name), mode, umask, rdev) {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(e) => reply.error(Self::errno("mknod", e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir: parent={}, name={:?}, mode={:o}", parent, name, mode);

        let parent_path = match self.path_of(parent) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.do_mkdir(requester(req), &parent_path.join(name), mode, umask) {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(e) => reply.error(Self::errno("mkdir", e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink: parent={}, name={:?}", parent, name);

        if let Err(e) = self.transformer.check_delete() {
            reply.error(Self::errno("unlink", e));
            return;
        }

        let parent_path = match self.path_of(parent) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let path = parent_path.join(name);

        match fs::remove_file(self.real(&path)) {
            Ok(()) => {
                RebindFs::forget(self, &path);
                reply.ok();
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir: parent={}, name={:?}", parent, name);

        if let Err(e) = self.transformer.check_delete() {
            reply.error(Self::errno("rmdir", e));
            return;
        }

        let parent_path = match self.path_of(parent) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let path = parent_path.join(name);

        match fs::remove_dir(self.real(&path)) {
            Ok(()) => {
                RebindFs::forget(self, &path);
                reply.ok();
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!(
            "symlink: parent={}, name={:?}, target={}",
            parent,
            link_name,
            target.display()
        );

        let parent_path = match self.path_of(parent) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.do_symlink(requester(req), &parent_path.join(link_name), target) {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(e) => reply.error(Self::errno("symlink", e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename: parent={}, name={:?}, newparent={}, newname={:?}",
            parent, name, newparent, newname
        );

        if let Err(e) = self.transformer.check_rename() {
            reply.error(Self::errno("rename", e));
            return;
        }
        // RENAME_NOREPLACE and RENAME_EXCHANGE are not forwarded.
        if flags != 0 {
            reply.error(EINVAL);
            return;
        }

        let (old_parent, new_parent) = match (self.path_of(parent), self.path_of(newparent)) {
            (Some(old), Some(new)) => (old, new),
            _ => {
                reply.error(ENOENT);
                return;
            }
        };
        let old_path = old_parent.join(name);
        let new_path = new_parent.join(newname);

        match fs::rename(self.real(&old_path), self.real(&new_path)) {
            Ok(()) => {
                self.relocate(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link: ino={}, newparent={}, newname={:?}", ino, newparent, newname);

        let (path, new_parent) = match (self.path_of(ino), self.path_of(newparent)) {
            (Some(path), Some(parent)) => (path, parent),
            _ => {
                reply.error(ENOENT);
                return;
            }
        };
        let new_path = new_parent.join(newname);

        if let Err(e) = fs::hard_link(self.real(&path), self.real(&new_path)) {
            reply.error(e.raw_os_error().unwrap_or(EIO));
            return;
        }
        match self.entry_for(requester(req), &new_path) {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(e) => reply.error(Self::errno("link", e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open: ino={}, flags={:#x}", ino, flags);

        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match open_options(flags).open(self.real(&path)) {
            Ok(file) => {
                let fh = self.alloc_fh();
                lock(&self.handles).insert(fh, file);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read: ino={}, offset={}, size={}", ino, offset, size);

        let handles = lock(&self.handles);
        let Some(file) = handles.get(&fh) else {
            warn!("read: unknown file handle {}", fh);
            reply.error(EBADF);
            return;
        };

        let mut buf = vec![0u8; size as usize];
        match file.read_at(&mut buf, offset.max(0) as u64) {
            Ok(n) => {
                buf.truncate(n);
                reply.data(&buf);
            }
            Err(e) => {
                error!("read error for ino {}: {}", ino, e);
                reply.error(e.raw_os_error().unwrap_or(EIO));
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write: ino={}, offset={}, size={}", ino, offset, data.len());

        let handles = lock(&self.handles);
        let Some(file) = handles.get(&fh) else {
            warn!("write: unknown file handle {}", fh);
            reply.error(EBADF);
            return;
        };

        match file.write_at(data, offset.max(0) as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => {
                error!("write error for ino {}: {}", ino, e);
                reply.error(e.raw_os_error().unwrap_or(EIO));
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
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
        lock(&self.handles).remove(&fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync: ino={}, datasync={}", ino, datasync);

        let handles = lock(&self.handles);
        let Some(file) = handles.get(&fh) else {
            reply.error(EBADF);
            return;
        };
        let result = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir: ino={}", ino);

        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match fs::metadata(self.real(&path)) {
            Ok(meta) if meta.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(ENOTDIR),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={}, offset={}", ino, offset);

        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let dir = match fs::read_dir(self.real(&path)) {
            Ok(dir) => dir,
            Err(e) => {
                reply.error(e.raw_os_error().unwrap_or(EIO));
                return;
            }
        };

        let parent_ino = path
            .parent()
            .map(|parent| self.inode_for(parent))
            .unwrap_or(FUSE_ROOT_ID);
        let mut entries: Vec<(u64, FileType, std::ffi::OsString)> = vec![
            (ino, FileType::Directory, ".".into()),
            (parent_ino, FileType::Directory, "..".into()),
        ];

        for entry in dir.flatten() {
            let name = entry.file_name();
            let kind = match entry.file_type() {
                Ok(t) if t.is_dir() => FileType::Directory,
                Ok(t) if t.is_symlink() => FileType::Symlink,
                Ok(_) => entry
                    .metadata()
                    .map(|m| file_kind(m.mode()))
                    .unwrap_or(FileType::RegularFile),
                Err(_) => FileType::RegularFile,
            };
            let child_ino = self.inode_for(&path.join(&name));
            entries.push((child_ino, kind, name));
        }

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        debug!("statfs");

        match statvfs(&self.source) {
            Ok(stat) => reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(e) => {
                error!("statfs failed for {}: {}", self.source.display(), e);
                reply.error(e as i32);
            }
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create: parent={}, name={:?}, mode={:o}", parent, name, mode);

        let parent_path = match self.path_of(parent) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        match self.do_create(requester(req), &parent_path.join(name), mode, umask, flags) {
            Ok((attr, fh)) => reply.created(&self.attr_ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(Self::errno("create", e)),
        }
    }
}
