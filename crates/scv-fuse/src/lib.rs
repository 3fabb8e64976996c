#![forbid(unsafe_code)]
//! Read-only FUSE view over a recovered metadata index.
//!
//! This crate is a thin translation layer: kernel FUSE requests arrive via
//! the `fuser` crate and are answered from the index alone, except for
//! regular file reads, which go to the raw device through the chunk map.
//! Nothing is ever written.
//!
//! Regular files expose their first extent's byte range only; inline
//! extents and symlink targets are served straight from the index. Without
//! a device, only inline file data is visible.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyOpen, ReplyXattr, Request,
};
use scv_block::ByteDevice;
use scv_error::ScvError;
use scv_index::{ChunkMap, Index, IndexItem};
use scv_ondisk::{DIR_ITEM_KEY, DirEntryType, FIRST_FREE_OBJECT_ID, FS_TREE_OBJECT_ID, key_first, name_hash};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::warn;

/// TTL for cached attributes and entries. The index never changes while
/// mounted, so a generous TTL is safe.
const ATTR_TTL: Duration = Duration::from_secs(60);

const ROOT_INO: u64 = 1;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("scavenge".to_owned()),
        MountOption::Subtype("scv".to_owned()),
        MountOption::RO,
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

// ── Attribute conversion ────────────────────────────────────────────────────

/// Map a POSIX mode to the FUSE file type. Unrecognized modes degrade to
/// regular files so damaged inodes stay visible.
fn kind_from_mode(mode: u32) -> FileType {
    match mode & 0o170_000 {
        0o040_000 => FileType::Directory,
        0o120_000 => FileType::Symlink,
        0o060_000 => FileType::BlockDevice,
        0o020_000 => FileType::CharDevice,
        0o010_000 => FileType::NamedPipe,
        0o140_000 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn kind_from_entry_type(entry_type: DirEntryType) -> FileType {
    match entry_type {
        DirEntryType::Directory => FileType::Directory,
        DirEntryType::Symlink => FileType::Symlink,
        DirEntryType::BlockDevice => FileType::BlockDevice,
        DirEntryType::CharDevice => FileType::CharDevice,
        DirEntryType::Fifo => FileType::NamedPipe,
        DirEntryType::Socket => FileType::Socket,
        DirEntryType::Unknown | DirEntryType::Xattr | DirEntryType::RegularFile => {
            FileType::RegularFile
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // rdev is a packed dev_t
fn attr_from_inode(ino: u64, item: &IndexItem, blksize: u32) -> Option<FileAttr> {
    let inode = item.as_inode_item()?;
    Some(FileAttr {
        ino,
        size: inode.size(),
        blocks: inode.size().div_ceil(512),
        atime: inode.atime().to_system_time(),
        mtime: inode.mtime().to_system_time(),
        ctime: inode.ctime().to_system_time(),
        crtime: inode.otime().to_system_time(),
        kind: kind_from_mode(inode.mode()),
        perm: (inode.mode() & 0o7777) as u16,
        nlink: inode.nlink(),
        uid: inode.uid(),
        gid: inode.gid(),
        rdev: inode.rdev() as u32,
        blksize,
        flags: 0,
    })
}

/// Synthetic attributes for directories whose inode item was not recovered.
fn synthetic_dir_attr(ino: u64, blksize: u32) -> FileAttr {
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o555,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize,
        flags: 0,
    }
}

// ── The rescue filesystem ───────────────────────────────────────────────────

/// A filesystem object as the index names it: the owning tree and the
/// object id within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeRef {
    owner: u64,
    object_id: u64,
}

/// Read-only filesystem serving recovered metadata, rooted at the FS tree's
/// first free object id.
pub struct RescueFs {
    index: Index,
    device: Option<Box<dyn ByteDevice>>,
    chunk_map: Option<ChunkMap>,
    nodes: HashMap<u64, NodeRef>,
    inos: HashMap<NodeRef, u64>,
    next_ino: u64,
}

impl RescueFs {
    #[must_use]
    pub fn new(index: Index, device: Option<Box<dyn ByteDevice>>) -> Self {
        let root = NodeRef {
            owner: FS_TREE_OBJECT_ID,
            object_id: FIRST_FREE_OBJECT_ID,
        };
        let mut fs = Self {
            index,
            device,
            chunk_map: None,
            nodes: HashMap::new(),
            inos: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        fs.nodes.insert(ROOT_INO, root);
        fs.inos.insert(root, ROOT_INO);
        fs
    }

    fn blksize(&self) -> u32 {
        self.index.metadata().block_size
    }

    fn node(&self, ino: u64) -> Option<NodeRef> {
        self.nodes.get(&ino).copied()
    }

    fn ino_for(&mut self, node: NodeRef) -> u64 {
        if let Some(&ino) = self.inos.get(&node) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, node);
        self.inos.insert(node, ino);
        ino
    }

    /// Look up one name in a directory: hash point-lookup first, full scan
    /// as the fallback for hash collisions and partial indexes.
    fn lookup_entry(&self, node: NodeRef, name: &[u8]) -> Result<Option<IndexItem>, ScvError> {
        let hash = u64::from(name_hash(name));
        if let Some(item) = self.index.find_item(
            node.owner,
            key_first(&[u64::from(DIR_ITEM_KEY), node.object_id, hash]),
        )? {
            if item.as_dir_item().is_some_and(|dir| dir.name_bytes() == name) {
                return Ok(Some(item));
            }
        }
        for entry in self.index.dir_items(node.owner, node.object_id)? {
            let item = entry?;
            if item.as_dir_item().is_some_and(|dir| dir.name_bytes() == name) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Where a directory entry leads: into a subvolume's tree, or to an
    /// object in the same tree.
    fn target_of(node: NodeRef, item: &IndexItem) -> Option<NodeRef> {
        let dir = item.as_dir_item()?;
        let location = dir.location();
        Some(if dir.is_subvolume() {
            NodeRef {
                owner: location.object_id,
                object_id: FIRST_FREE_OBJECT_ID,
            }
        } else {
            NodeRef {
                owner: node.owner,
                object_id: location.object_id,
            }
        })
    }

    fn attr_for(&self, ino: u64, node: NodeRef) -> Result<Option<FileAttr>, ScvError> {
        match self.index.find_inode_item(node.owner, node.object_id)? {
            Some(item) => Ok(attr_from_inode(ino, &item, self.blksize())),
            None if ino == ROOT_INO => Ok(Some(synthetic_dir_attr(ino, self.blksize()))),
            None => Ok(None),
        }
    }

    fn chunk_map(&mut self) -> Result<&ChunkMap, ScvError> {
        if self.chunk_map.is_none() {
            self.chunk_map = Some(ChunkMap::build(&self.index)?);
        }
        match &self.chunk_map {
            Some(map) => Ok(map),
            None => Err(ScvError::Closed),
        }
    }

    /// Read from a file's first extent. Inline extents come from the index;
    /// regular extents are read from the device at their physical offset.
    fn read_file(&mut self, node: NodeRef, offset: u64, size: u32) -> Result<Vec<u8>, ScvError> {
        let Some(item) = self
            .index
            .find_file_extent_item(node.owner, node.object_id)?
        else {
            return Err(ScvError::NotFound("file extent".to_owned()));
        };
        let Some(extent) = item.as_file_extent_item() else {
            return Err(ScvError::Format("not a file extent item".to_owned()));
        };

        if extent.is_inline() {
            let data = extent.inline_data();
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
            let end = start.saturating_add(size as usize).min(data.len());
            return Ok(data[start..end].to_vec());
        }

        if extent.is_compressed() {
            return Err(ScvError::Format(
                "compressed extents are not supported".to_owned(),
            ));
        }
        if offset >= extent.num_bytes() {
            return Ok(Vec::new());
        }

        let logical = extent.disk_byte_nr() + extent.offset() + offset;
        let len = u64::from(size).min(extent.num_bytes() - offset);

        let resolved = self.chunk_map()?.physical(logical);
        let Some((_, physical)) = resolved else {
            return Err(ScvError::NotFound(format!(
                "no chunk covers logical address {logical:#x}"
            )));
        };
        let Some(device) = &self.device else {
            return Err(ScvError::NotFound(
                "no device given, only inline file data is visible".to_owned(),
            ));
        };
        let mut buf = vec![0_u8; usize::try_from(len).unwrap_or(usize::MAX)];
        device.read_exact_at(physical, &mut buf)?;
        Ok(buf)
    }

    fn readlink_target(&self, node: NodeRef) -> Result<Vec<u8>, ScvError> {
        // Link text is stored as an inline extent.
        let Some(item) = self
            .index
            .find_file_extent_item(node.owner, node.object_id)?
        else {
            return Err(ScvError::NotFound("link extent".to_owned()));
        };
        match item.as_file_extent_item() {
            Some(extent) if extent.is_inline() => Ok(extent.inline_data().to_vec()),
            _ => Err(ScvError::NotFound("link extent is not inline".to_owned())),
        }
    }
}

impl Filesystem for RescueFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_for(ino, node) {
            Ok(Some(attr)) => reply.attr(&ATTR_TTL, &attr),
            Ok(None) => reply.error(libc::ENOENT),
            Err(error) => {
                warn!(ino, %error, "getattr failed");
                reply.error(error.to_errno());
            }
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_node) = self.node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let name_bytes = name.as_encoded_bytes();
        match self.lookup_entry(parent_node, name_bytes) {
            Ok(Some(item)) => {
                let Some(target) = Self::target_of(parent_node, &item) else {
                    reply.error(libc::EIO);
                    return;
                };
                let ino = self.ino_for(target);
                match self.attr_for(ino, target) {
                    Ok(Some(attr)) => reply.entry(&ATTR_TTL, &attr, 0),
                    Ok(None) => reply.error(libc::ENOENT),
                    Err(error) => {
                        warn!(parent, ?name, %error, "lookup attr failed");
                        reply.error(error.to_errno());
                    }
                }
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(error) => {
                warn!(parent, ?name, %error, "lookup failed");
                reply.error(error.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless open: no file handles are tracked.
        reply.opened(0, 0);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let entries = match self.index.dir_items(node.owner, node.object_id) {
            Ok(range) => range,
            Err(error) => {
                warn!(ino, %error, "readdir failed");
                reply.error(error.to_errno());
                return;
            }
        };

        let mut listing: Vec<(u64, FileType, String)> =
            vec![(ino, FileType::Directory, ".".to_owned()), (ROOT_INO, FileType::Directory, "..".to_owned())];
        for entry in entries {
            let item = match entry {
                Ok(item) => item,
                Err(error) => {
                    warn!(ino, %error, "readdir entry failed");
                    reply.error(error.to_errno());
                    return;
                }
            };
            let Some(target) = Self::target_of(node, &item) else {
                continue;
            };
            let Some((name, kind)) = item
                .as_dir_item()
                .map(|dir| (dir.name(), kind_from_entry_type(dir.entry_type())))
            else {
                continue;
            };
            let entry_ino = self.ino_for(target);
            listing.push((entry_ino, kind, name));
        }

        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        for (i, (entry_ino, kind, name)) in listing.iter().enumerate().skip(start) {
            if reply.add(*entry_ino, i as i64 + 1, *kind, name.as_str()) {
                break;
            }
        }
        reply.ok();
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
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.read_file(node, offset, size) {
            Ok(data) => reply.data(&data),
            Err(error) => {
                warn!(ino, offset, size, %error, "read failed");
                reply.error(error.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.readlink_target(node) {
            Ok(target) => reply.data(&target),
            Err(error) => {
                warn!(ino, %error, "readlink failed");
                reply.error(error.to_errno());
            }
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
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let wanted = name.as_encoded_bytes();
        let entries = match self.index.xattr_items(node.owner, node.object_id) {
            Ok(range) => range,
            Err(error) => {
                reply.error(error.to_errno());
                return;
            }
        };
        for entry in entries {
            let Ok(item) = entry else {
                reply.error(libc::EIO);
                return;
            };
            let Some(found) = item.as_dir_item().and_then(|attr| {
                (attr.name_bytes() == wanted).then(|| attr.data().to_vec())
            }) else {
                continue;
            };
            if size == 0 {
                reply.size(found.len() as u32);
            } else if found.len() <= size as usize {
                reply.data(&found);
            } else {
                reply.error(libc::ERANGE);
            }
            return;
        }
        reply.error(libc::ENODATA);
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.index.xattr_items(node.owner, node.object_id) {
            Ok(range) => range,
            Err(error) => {
                reply.error(error.to_errno());
                return;
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let Ok(item) = entry else {
                reply.error(libc::EIO);
                return;
            };
            if let Some(attr) = item.as_dir_item() {
                names.extend_from_slice(attr.name_bytes());
                names.push(0);
            }
        }
        if size == 0 {
            reply.size(names.len() as u32);
        } else if names.len() <= size as usize {
            reply.data(&names);
        } else {
            reply.error(libc::ERANGE);
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

/// Mount the rescue filesystem at `mountpoint` and serve until unmounted.
pub fn mount(
    fs: RescueFs,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), MountError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(MountError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    Ok(())
}
