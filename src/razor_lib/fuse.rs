/// FUSE operations: argument marshaling between the kernel protocol and
/// the core. No filesystem logic lives here.
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::time::{SystemTime, UNIX_EPOCH};

use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{EINVAL, ERANGE};
use log::{debug, error};

use crate::razor_lib::utils::{now_secs, system_time_secs, utc_time};
use crate::razor_lib::{FileAttr, RazorFS, TTL};
use crate::rep;

fn time_or_now_secs(t: TimeOrNow) -> u32 {
    match t {
        TimeOrNow::SpecificTime(st) => system_time_secs(st),
        TimeOrNow::Now => now_secs(),
    }
}

impl RazorFS {
    fn to_fuse_attr(&self, attr: &FileAttr) -> fuser::FileAttr {
        let (uid, gid) = self.owner();
        fuser::FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: utc_time(attr.atime),
            mtime: utc_time(attr.mtime),
            ctime: utc_time(attr.ctime),
            crtime: UNIX_EPOCH,
            kind: if attr.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: attr.perm,
            nlink: attr.nlink,
            uid,
            gid,
            rdev: 0,
            blksize: self.config.block_size,
            flags: 0,
        }
    }
}

macro_rules! name_str {
    ($reply:expr, $name:expr) => {
        match $name.to_str() {
            Some(n) => n,
            None => {
                $reply.error(EINVAL);
                return;
            }
        }
    };
}

impl Filesystem for RazorFS {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("fuse session started");
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.rfs_destroy() {
            error!("final save failed: {}", e);
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name_str!(reply, name);
        rep!(reply, r, self.rfs_lookup(parent, name));
        let (_, attr) = r;
        reply.entry(&TTL, &self.to_fuse_attr(&attr), 0);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        rep!(reply, attr, self.rfs_getattr(ino));
        reply.attr(&TTL, &self.to_fuse_attr(&attr));
    }

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
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        rep!(
            reply,
            attr,
            self.rfs_setattr(
                ino,
                mode,
                uid,
                gid,
                size,
                atime.map(time_or_now_secs),
                mtime.map(time_or_now_secs),
            )
        );
        reply.attr(&TTL, &self.to_fuse_attr(&attr));
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name_str!(reply, name);
        let kind = mode & libc::S_IFMT;
        if kind != 0 && kind != libc::S_IFREG {
            reply.error(libc::ENOSYS);
            return;
        }
        rep!(reply, r, self.rfs_create(parent, name, mode));
        let (_, attr) = r;
        reply.entry(&TTL, &self.to_fuse_attr(&attr), 0);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name_str!(reply, name);
        rep!(reply, r, self.rfs_mkdir(parent, name, mode));
        let (_, attr) = r;
        reply.entry(&TTL, &self.to_fuse_attr(&attr), 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_str!(reply, name);
        rep!(reply, self.rfs_unlink(parent, name));
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_str!(reply, name);
        rep!(reply, self.rfs_rmdir(parent, name));
        reply.ok();
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
        let name = name_str!(reply, name);
        let newname = name_str!(reply, newname);
        let no_replace = flags & libc::RENAME_NOREPLACE != 0;
        rep!(reply, self.rfs_rename(parent, name, newparent, newname, no_replace));
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = name_str!(reply, newname);
        rep!(reply, r, self.rfs_link(ino, newparent, newname));
        let (_, attr) = r;
        reply.entry(&TTL, &self.to_fuse_attr(&attr), 0);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        rep!(reply, self.rfs_access(ino));
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        rep!(reply, data, self.rfs_read(ino, offset, size));
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        rep!(reply, written, self.rfs_write(ino, offset, data));
        reply.written(written);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        rep!(reply, self.rfs_flush());
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        rep!(reply, self.rfs_release());
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        rep!(reply, self.rfs_fsync(datasync));
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        rep!(reply, children, self.rfs_readdir(ino));
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".into()),
            (ino, FileType::Directory, "..".into()),
        ];
        for (name, child_ino, is_dir) in children {
            let kind = if is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child_ino, kind, name));
        }
        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let st = self.rfs_statfs();
        reply.statfs(
            st.total_blocks,
            st.free_blocks,
            st.free_blocks,
            st.total_inodes,
            st.free_inodes,
            st.block_size,
            st.max_name_len,
            st.block_size,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name_str!(reply, name);
        rep!(reply, self.rfs_setxattr(ino, name, value));
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = name_str!(reply, name);
        rep!(reply, value, self.rfs_getxattr(ino, name));
        if size == 0 {
            reply.size(value.len() as u32);
        } else if value.len() as u32 <= size {
            reply.data(&value);
        } else {
            reply.error(ERANGE);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        rep!(reply, names, self.rfs_listxattr(ino));
        let mut buf = Vec::new();
        for name in names {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        if size == 0 {
            reply.size(buf.len() as u32);
        } else if buf.len() as u32 <= size {
            reply.data(&buf);
        } else {
            reply.error(ERANGE);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_str!(reply, name);
        rep!(reply, self.rfs_removexattr(ino, name));
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        rep!(reply, self.rfs_access(ino));
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name_str!(reply, name);
        rep!(reply, r, self.rfs_create(parent, name, mode));
        let (_, attr) = r;
        reply.created(&TTL, &self.to_fuse_attr(&attr), 0, 0, 0);
    }
}
