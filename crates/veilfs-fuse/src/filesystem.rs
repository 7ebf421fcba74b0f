//! The registered FUSE operation table.
//!
//! [`VeilFs`] is handed to the dispatch layer at mount time; every handler
//! reads the shared [`SessionContext`] and resolves the target through the
//! encrypted root's name seam before touching the backing store. Handlers
//! not implemented here are left unset, which the interface layer reports
//! as "not supported".
//!
//! Two session-level duties live here as well: every handler feeds the
//! activity tracker the idle monitor polls, and `init` closes the
//! preserved diagnostic stream once a daemonized mount is known to be up.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;

use veilfs_mount::PreservedStderr;

use crate::handles::HandleTable;
use crate::inode::{InodeTable, ROOT_INODE};
use crate::root::EncryptedRoot;
use crate::session::SessionContext;

/// Attribute and entry TTL when caching is enabled.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// The filesystem value registered with the dispatch layer.
pub struct VeilFs {
    ctx: Arc<SessionContext>,
    inodes: InodeTable,
    handles: HandleTable,
    preserved_stderr: Option<Arc<PreservedStderr>>,
    attr_ttl: Duration,
}

impl VeilFs {
    /// Builds the operation-table state for a session.
    ///
    /// The context's root is already in place (the driver initializes it
    /// before constructing this value), so no callback can observe an
    /// absent root.
    pub fn new(ctx: Arc<SessionContext>, preserved_stderr: Option<Arc<PreservedStderr>>) -> Self {
        let attr_ttl = if ctx.config().attr_caching_disabled() {
            Duration::ZERO
        } else {
            ATTR_TTL
        };
        let handles = HandleTable::new(Arc::clone(&ctx.activity));
        Self {
            ctx,
            inodes: InodeTable::new(),
            handles,
            preserved_stderr,
            attr_ttl,
        }
    }

    fn root(&self) -> Result<Arc<EncryptedRoot>, c_int> {
        // Teardown clears the root only after the dispatch loop returns,
        // so this cannot fail while handlers run.
        self.ctx.root().ok_or(libc::EIO)
    }

    /// Resolves an inode to its virtual path and backing path.
    fn resolve(&self, ino: u64) -> Result<(Arc<EncryptedRoot>, PathBuf, PathBuf), c_int> {
        let root = self.root()?;
        let virt = self.inodes.path_of(ino).ok_or(libc::ENOENT)?;
        let backing = root.backing_path(&virt);
        Ok((root, virt, backing))
    }

    /// Resolves a (parent, name) pair, hiding the volume configuration
    /// document from the mounted view.
    fn resolve_child(
        &self,
        parent: u64,
        name: &OsStr,
    ) -> Result<(Arc<EncryptedRoot>, PathBuf, PathBuf), c_int> {
        let (root, parent_virt, _) = self.resolve(parent)?;
        if parent == ROOT_INODE && root.is_config_name(name) {
            return Err(libc::ENOENT);
        }
        let virt = parent_virt.join(name);
        let backing = root.backing_path(&virt);
        Ok((root, virt, backing))
    }

    fn deny_if_read_only(root: &EncryptedRoot) -> Result<(), c_int> {
        if root.read_only() {
            Err(libc::EROFS)
        } else {
            Ok(())
        }
    }

    fn entry_for(&self, virt: &Path, backing: &Path) -> Result<(u64, FileAttr), c_int> {
        let md = fs::symlink_metadata(backing).map_err(|e| errno_of(&e))?;
        let ino = self.inodes.assign(virt);
        Ok((ino, attr_from_metadata(ino, &md)))
    }
}

fn errno_of(e: &io::Error) -> c_int {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn file_type_of(ft: fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else {
        FileType::RegularFile
    }
}

fn attr_from_metadata(ino: u64, md: &fs::Metadata) -> FileAttr {
    use std::os::unix::fs::MetadataExt;

    let ctime = if md.ctime() >= 0 {
        UNIX_EPOCH + Duration::new(md.ctime() as u64, md.ctime_nsec() as u32)
    } else {
        UNIX_EPOCH
    };

    FileAttr {
        ino,
        size: md.size(),
        blocks: md.blocks(),
        atime: md.accessed().unwrap_or(UNIX_EPOCH),
        mtime: md.modified().unwrap_or(UNIX_EPOCH),
        ctime,
        crtime: UNIX_EPOCH,
        kind: file_type_of(md.file_type()),
        perm: (md.mode() & 0o7777) as u16,
        nlink: md.nlink() as u32,
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev() as u32,
        blksize: md.blksize() as u32,
        flags: 0,
    }
}

fn open_options_from_flags(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            options.write(true);
        }
        libc::O_RDWR => {
            options.read(true).write(true);
        }
        _ => {
            options.read(true);
        }
    }
    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    if flags & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    options
}

fn wants_write(flags: i32) -> bool {
    (flags & libc::O_ACCMODE) != libc::O_RDONLY
}

fn read_at_fully(file: &File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;

    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

impl Filesystem for VeilFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        // The dispatch loop is live; a daemonized session no longer needs
        // the preserved terminal stream.
        if self.ctx.config().is_daemon {
            if let Some(preserved) = &self.preserved_stderr {
                tracing::debug!("closing preserved stderr");
                preserved.close();
            }
        }
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        self.ctx.activity.record_op();
        match self
            .resolve_child(parent, name)
            .and_then(|(_, virt, backing)| self.entry_for(&virt, &backing))
        {
            Ok((_, attr)) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.ctx.activity.record_op();
        match self.resolve(ino) {
            Ok((_, _, backing)) => match fs::symlink_metadata(&backing) {
                Ok(md) => reply.attr(&self.attr_ttl, &attr_from_metadata(ino, &md)),
                Err(e) => reply.error(errno_of(&e)),
            },
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
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
        self.ctx.activity.record_op();
        let (root, _, backing) = match self.resolve(ino) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        if let Err(errno) = Self::deny_if_read_only(&root) {
            return reply.error(errno);
        }

        if let Some(new_size) = size {
            let result = match fh.and_then(|fh| self.handles.get(fh)) {
                Some(handle) => handle.file.lock().set_len(new_size),
                None => OpenOptions::new()
                    .write(true)
                    .open(&backing)
                    .and_then(|f| f.set_len(new_size)),
            };
            if let Err(e) = result {
                return reply.error(errno_of(&e));
            }
        }

        if let Some(new_mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                fs::set_permissions(&backing, fs::Permissions::from_mode(new_mode & 0o7777))
            {
                return reply.error(errno_of(&e));
            }
        }

        if uid.is_some() || gid.is_some() {
            if let Err(e) = std::os::unix::fs::chown(&backing, uid, gid) {
                return reply.error(errno_of(&e));
            }
        }

        if atime.is_some() || mtime.is_some() {
            use filetime::FileTime;
            let md = match fs::symlink_metadata(&backing) {
                Ok(md) => md,
                Err(e) => return reply.error(errno_of(&e)),
            };
            let to_filetime = |t: TimeOrNow| match t {
                TimeOrNow::SpecificTime(st) => FileTime::from_system_time(st),
                TimeOrNow::Now => FileTime::now(),
            };
            let new_atime = atime
                .map(to_filetime)
                .unwrap_or_else(|| FileTime::from_last_access_time(&md));
            let new_mtime = mtime
                .map(to_filetime)
                .unwrap_or_else(|| FileTime::from_last_modification_time(&md));
            if let Err(e) = filetime::set_file_times(&backing, new_atime, new_mtime) {
                return reply.error(errno_of(&e));
            }
        }

        match fs::symlink_metadata(&backing) {
            Ok(md) => reply.attr(&self.attr_ttl, &attr_from_metadata(ino, &md)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        use std::os::unix::ffi::OsStrExt;

        self.ctx.activity.record_op();
        match self.resolve(ino) {
            Ok((_, _, backing)) => match fs::read_link(&backing) {
                Ok(target) => reply.data(target.as_os_str().as_bytes()),
                Err(e) => reply.error(errno_of(&e)),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        use std::os::unix::fs::DirBuilderExt;

        self.ctx.activity.record_op();
        let (root, virt, backing) = match self.resolve_child(parent, name) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        if let Err(errno) = Self::deny_if_read_only(&root) {
            return reply.error(errno);
        }

        let result = fs::DirBuilder::new()
            .mode(mode & !umask & 0o7777)
            .create(&backing);
        match result {
            Ok(()) => match self.entry_for(&virt, &backing) {
                Ok((_, attr)) => reply.entry(&self.attr_ttl, &attr, 0),
                Err(errno) => reply.error(errno),
            },
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.ctx.activity.record_op();
        let (root, virt, backing) = match self.resolve_child(parent, name) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        if let Err(errno) = Self::deny_if_read_only(&root) {
            return reply.error(errno);
        }
        match fs::remove_file(&backing) {
            Ok(()) => {
                self.inodes.forget_path(&virt);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.ctx.activity.record_op();
        let (root, virt, backing) = match self.resolve_child(parent, name) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        if let Err(errno) = Self::deny_if_read_only(&root) {
            return reply.error(errno);
        }
        match fs::remove_dir(&backing) {
            Ok(()) => {
                self.inodes.forget_path(&virt);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        self.ctx.activity.record_op();
        let (root, virt, backing) = match self.resolve_child(parent, link_name) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        if let Err(errno) = Self::deny_if_read_only(&root) {
            return reply.error(errno);
        }
        match std::os::unix::fs::symlink(target, &backing) {
            Ok(()) => match self.entry_for(&virt, &backing) {
                Ok((_, attr)) => reply.entry(&self.attr_ttl, &attr, 0),
                Err(errno) => reply.error(errno),
            },
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        self.ctx.activity.record_op();
        let (root, old_virt, old_backing) = match self.resolve_child(parent, name) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        let (_, new_virt, new_backing) = match self.resolve_child(newparent, newname) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        if let Err(errno) = Self::deny_if_read_only(&root) {
            return reply.error(errno);
        }
        match fs::rename(&old_backing, &new_backing) {
            Ok(()) => {
                self.inodes.forget_path(&new_virt);
                self.inodes.rename_subtree(&old_virt, &new_virt);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.ctx.activity.record_op();
        let (root, _, backing) = match self.resolve(ino) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        if wants_write(flags) {
            if let Err(errno) = Self::deny_if_read_only(&root) {
                return reply.error(errno);
            }
        }
        match open_options_from_flags(flags).open(&backing) {
            Ok(file) => {
                let fh = self.handles.insert(ino, file);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        use std::os::unix::fs::OpenOptionsExt;

        self.ctx.activity.record_op();
        let (root, virt, backing) = match self.resolve_child(parent, name) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        if let Err(errno) = Self::deny_if_read_only(&root) {
            return reply.error(errno);
        }

        let mut options = open_options_from_flags(flags);
        options.create(true).mode(mode & !umask & 0o7777);
        match options.open(&backing) {
            Ok(file) => match self.entry_for(&virt, &backing) {
                Ok((ino, attr)) => {
                    let fh = self.handles.insert(ino, file);
                    reply.created(&self.attr_ttl, &attr, 0, fh, 0);
                }
                Err(errno) => reply.error(errno),
            },
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        self.ctx.activity.record_op();
        let Some(handle) = self.handles.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let file = handle.file.lock();
        match read_at_fully(&file, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        use std::os::unix::fs::FileExt;

        self.ctx.activity.record_op();
        let Some(handle) = self.handles.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let file = handle.file.lock();
        match file.write_all_at(data, offset.max(0) as u64) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        self.ctx.activity.record_op();
        let Some(handle) = self.handles.get(fh) else {
            return reply.error(libc::EBADF);
        };
        // flush runs once per close(2); surface write-back errors here
        // rather than losing them in release.
        match handle.file.lock().sync_data() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
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
        self.ctx.activity.record_op();
        self.handles.remove(fh);
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        self.ctx.activity.record_op();
        let Some(handle) = self.handles.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let file = handle.file.lock();
        let result = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
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
        use std::ffi::OsString;

        self.ctx.activity.record_op();
        let (root, virt, backing) = match self.resolve(ino) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };

        let parent_ino = virt
            .parent()
            .map(|p| self.inodes.assign(p))
            .unwrap_or(ROOT_INODE);
        let mut entries: Vec<(u64, FileType, OsString)> = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];

        let listing = match fs::read_dir(&backing) {
            Ok(listing) => listing,
            Err(e) => return reply.error(errno_of(&e)),
        };
        for dirent in listing {
            let dirent = match dirent {
                Ok(dirent) => dirent,
                Err(e) => return reply.error(errno_of(&e)),
            };
            let name = dirent.file_name();
            if ino == ROOT_INODE && root.is_config_name(&name) {
                continue;
            }
            let kind = match dirent.file_type() {
                Ok(ft) => file_type_of(ft),
                Err(_) => FileType::RegularFile,
            };
            let child_ino = self.inodes.assign(&virt.join(&name));
            entries.push((child_ino, kind, name));
        }

        for (i, (entry_ino, kind, name)) in
            entries.iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        self.ctx.activity.record_op();
        let (_, _, backing) = match self.resolve(ino) {
            Ok(resolved) => resolved,
            Err(errno) => return reply.error(errno),
        };
        match nix::sys::statvfs::statvfs(&backing) {
            Ok(stat) => reply.statfs(
                u64::from(stat.blocks()),
                u64::from(stat.blocks_free()),
                u64::from(stat.blocks_available()),
                u64::from(stat.files()),
                u64::from(stat.files_free()),
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as c_int),
        }
    }
}
