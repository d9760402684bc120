//! Read-only file system operations on top of a populated [`PathIndex`].
//!
//! Every operation takes `&self` and only reads the index, so a [`TarFs`] can be shared between
//! any number of concurrent request handlers. Failures are reported as `io::Error`s carrying the
//! errno value to hand back to the kernel.

use std::io;
use std::sync::Arc;

use crate::index::{canonical_path, Node, PathIndex};
use crate::io::{ReadAt, Reader, SectionReader};
use crate::stat::{check_permission, Access, Caller, FileType};

/// We use this to return an errno value back to the caller.
macro_rules! io_return {
    ($errno:expr) => {{
        return Err(::std::io::Error::from_raw_os_error($errno));
    }};
}

/// Attributes of an entry as reported by `getattr`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attr {
    pub inode: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
}

impl Attr {
    /// Attributes of an index node, without any permission check.
    pub fn from_node(node: &Node) -> Self {
        let stat = node.stat();
        Self {
            inode: node.inode(),
            mode: type_and_permissions(node),
            nlink: if node.is_dir() { 2 } else { 1 },
            uid: stat.uid,
            gid: stat.gid,
            size: stat.size,
            mtime: stat.mtime,
            atime: stat.atime,
            ctime: stat.ctime,
        }
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }
}

/// A directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    pub mode: u32,
}

impl DirEntry {
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }
}

/// File system statistics. Only the limits are filled in, there is no usage accounting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
}

/// Outcome of a successful read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadResult {
    /// This many bytes were placed at the start of the buffer.
    Data(usize),
    /// The read started at or beyond the end of the file.
    EndOfData,
}

/// An open file: the part of the archive holding one entry's contents.
pub struct FileHandle {
    name: String,
    contents: SectionReader,
}

impl FileHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.contents.len()
    }
}

fn type_and_permissions(node: &Node) -> u32 {
    let stat = node.stat();
    stat.file_type().mode_bits() | stat.permissions()
}

/// A tar archive's contents, served read-only.
pub struct TarFs {
    index: PathIndex,
    reader: Reader,
    size: u64,
}

impl TarFs {
    pub fn new(index: PathIndex, reader: Reader, size: u64) -> Self {
        Self {
            index,
            reader,
            size,
        }
    }

    pub fn index(&self) -> &PathIndex {
        &self.index
    }

    /// Size of the underlying archive in bytes.
    pub fn archive_size(&self) -> u64 {
        self.size
    }

    fn lookup(&self, path: &str) -> io::Result<(String, &Node)> {
        let path = canonical_path(path);
        match self.index.get(&path) {
            Some(node) => Ok((path, node)),
            None => io_return!(libc::ENOENT),
        }
    }

    fn lookup_permitted(&self, path: &str, caller: &Caller) -> io::Result<(String, &Node)> {
        let (path, node) = self.lookup(path)?;
        if !check_permission(node.stat(), caller, Access::READ) {
            io_return!(libc::EPERM);
        }
        Ok((path, node))
    }

    pub fn getattr(&self, path: &str, caller: &Caller) -> io::Result<Attr> {
        let (_, node) = self.lookup_permitted(path, caller)?;
        Ok(Attr::from_node(node))
    }

    fn listed_entries(&self, path: &str, caller: &Caller) -> io::Result<Vec<&Node>> {
        let (path, dir) = self.lookup(path)?;
        if !dir.is_dir() {
            io_return!(libc::EIO);
        }
        if !check_permission(dir.stat(), caller, Access::READ) {
            io_return!(libc::EPERM);
        }
        Ok(self.index.entries(&path))
    }

    /// List a directory, sorted by name. The listing does not include `.` and `..`.
    pub fn read_dir(&self, path: &str, caller: &Caller) -> io::Result<Vec<DirEntry>> {
        Ok(self
            .listed_entries(path, caller)?
            .into_iter()
            .map(|node| DirEntry {
                name: node.name().to_string(),
                inode: node.inode(),
                mode: type_and_permissions(node),
            })
            .collect())
    }

    /// Like [`read_dir`](Self::read_dir), with the attributes of every entry.
    ///
    /// Only the directory is checked against `caller`. Entries the caller could not `getattr`
    /// themselves are still part of the listing, as with a readable directory on disk.
    pub fn read_dir_plus(&self, path: &str, caller: &Caller) -> io::Result<Vec<(String, Attr)>> {
        Ok(self
            .listed_entries(path, caller)?
            .into_iter()
            .map(|node| (node.name().to_string(), Attr::from_node(node)))
            .collect())
    }

    /// Open an entry for reading. Requests for write access fail with `EROFS`.
    pub fn open(&self, path: &str, flags: i32) -> io::Result<FileHandle> {
        let (_, node) = self.lookup(path)?;
        if (flags & libc::O_ACCMODE) != libc::O_RDONLY || (flags & libc::O_TRUNC) != 0 {
            io_return!(libc::EROFS);
        }

        let stat = node.stat();
        Ok(FileHandle {
            name: node.name().to_string(),
            contents: SectionReader::new(Arc::clone(&self.reader), stat.offset, stat.size),
        })
    }

    /// Read from an open file at `offset`.
    ///
    /// Short reads only happen at the end of the file. Reading at or past the end yields
    /// [`ReadResult::EndOfData`].
    pub fn read(&self, handle: &FileHandle, buf: &mut [u8], offset: u64) -> io::Result<ReadResult> {
        let mut pos = 0;
        while pos < buf.len() {
            match handle
                .contents
                .read_at(&mut buf[pos..], offset.saturating_add(pos as u64))
            {
                Ok(0) => break,
                Ok(got) => pos += got,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("failed to read {:?} at {}: {}", handle.name, offset, err);
                    io_return!(libc::EIO);
                }
            }
        }

        if pos == 0 && !buf.is_empty() {
            Ok(ReadResult::EndOfData)
        } else {
            Ok(ReadResult::Data(pos))
        }
    }

    pub fn readlink(&self, path: &str, caller: &Caller) -> io::Result<String> {
        let (_, node) = self.lookup_permitted(path, caller)?;
        match node.link_target() {
            Some(target) => Ok(target.to_string()),
            None => io_return!(libc::EINVAL),
        }
    }

    /// Check whether `caller` may access `path` with `mask`. Write access is never granted.
    pub fn access(&self, path: &str, mask: Access, caller: &Caller) -> io::Result<()> {
        let (_, node) = self.lookup(path)?;
        if mask.contains(Access::WRITE) {
            io_return!(libc::EROFS);
        }
        if !check_permission(node.stat(), caller, mask) {
            io_return!(libc::EPERM);
        }
        Ok(())
    }

    pub fn statfs(&self) -> FsStats {
        FsStats {
            files: self.index.len() as u64,
            block_size: 512,
            name_max: 255,
            ..Default::default()
        }
    }
}
