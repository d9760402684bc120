//! Build the path index from a tar stream in a single forward pass.
//!
//! Entries may show up before the directory containing them. In that case a placeholder
//! directory is created for the parent and remembered as pending; it is upgraded in place once
//! the archive provides the real directory entry. Placeholders still pending after the last entry
//! mean the archive is incomplete.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::{format_err, Error};

use crate::fs::TarFs;
use crate::index::{canonical_path, file_name, parent_path, Node, PathIndex, ROOT_INODE, ROOT_PATH};
use crate::io::{Reader, StreamReader};
use crate::stat::{Caller, Stat, DEFAULT_DIR_MODE};

/// Reasons for rejecting an archive.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("error reading tar: {0}")]
    Read(#[from] io::Error),
    #[error("missing directory entries: {}", .0.join(", "))]
    MissingDirectories(Vec<String>),
    #[error("parent of {0:?} is not a directory")]
    NotADirectory(String),
    #[error("hard link {0:?} points to unknown entry {1:?}")]
    MissingLinkTarget(String, String),
    #[error("hard link {0:?} points to directory {1:?}")]
    LinkToDirectory(String, String),
    #[error("{field} of {path:?} out of range: {value}")]
    IdOutOfRange {
        path: String,
        field: &'static str,
        value: u64,
    },
}

/// Ingestion state: the index being filled and the set of pending placeholder directories.
pub struct Builder {
    index: PathIndex,
    pending: BTreeSet<String>,
    entry_count: usize,
}

impl Builder {
    /// Start building into `index`, seeding it with a default root directory owned by the
    /// current process.
    pub fn new(mut index: PathIndex) -> Result<Self, Error> {
        let owner = Caller::current();
        let root = Stat {
            mode: DEFAULT_DIR_MODE,
            uid: owner.uid,
            gid: owner.gid,
            offset: ROOT_INODE,
            ..Default::default()
        };
        index.add(ROOT_PATH, Node::directory("", root))?;

        Ok(Self {
            index,
            pending: BTreeSet::new(),
            entry_count: 0,
        })
    }

    /// Add a single entry at canonical `path` and link it into its parent directory.
    pub fn add(&mut self, path: &str, node: Node) -> Result<(), Error> {
        if node.is_dir() {
            if self.pending.remove(path) {
                log::debug!("resolved placeholder directory {:?}", path);
            }
        } else if let Some(existing) = self.index.get(path) {
            if let Some(children) = existing.children().filter(|list| !list.is_empty()) {
                log::warn!(
                    "{:?} replaces a directory, hiding {} entries below it",
                    path,
                    children.len()
                );
            }
        }
        self.index.add(path, node)?;
        self.link_to_parent(path)?;
        self.entry_count += 1;
        Ok(())
    }

    fn link_to_parent(&mut self, path: &str) -> Result<(), Error> {
        let parent = match parent_path(path) {
            Some(parent) => parent,
            None => return Ok(()),
        };
        let name = file_name(path);

        match self.index.get_mut(parent) {
            Some(dir) if dir.is_dir() => dir.add_child(name),
            Some(_) => return Err(BuildError::NotADirectory(path.to_string()).into()),
            None => {
                log::debug!("creating placeholder directory {:?}", parent);
                let mut placeholder = Node::directory(file_name(parent), Stat::placeholder());
                placeholder.add_child(name);
                self.index.add(parent, placeholder)?;
                self.pending.insert(parent.to_string());
            }
        }
        Ok(())
    }

    /// Read all entries of a tar stream.
    pub fn add_archive<R: Read>(&mut self, archive: &mut tar::Archive<R>) -> Result<(), Error> {
        for entry in archive.entries().map_err(BuildError::Read)? {
            let mut entry = entry.map_err(BuildError::Read)?;
            self.add_tar_entry(&mut entry)?;
        }
        Ok(())
    }

    fn add_tar_entry<R: Read>(&mut self, entry: &mut tar::Entry<R>) -> Result<(), Error> {
        let entry_type = entry.header().entry_type();
        if entry_type.is_pax_global_extensions() {
            return Ok(());
        }

        let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let path = canonical_path(&raw_name);

        if entry_type.is_gnu_sparse() {
            log::warn!("skipping sparse file {:?}", path);
            return Ok(());
        }

        let stat = entry_stat(entry, &path)?;
        let link_name = entry
            .link_name_bytes()
            .map(|name| String::from_utf8_lossy(&name).into_owned());

        log::debug!(
            "tar entry {:?} (type {:?}, offset {}, size {})",
            path,
            entry_type,
            stat.offset,
            stat.size
        );

        let name = file_name(&path).to_string();
        let node = if entry_type.is_dir() || (entry_type.is_file() && raw_name.ends_with('/')) {
            Node::directory(
                name,
                Stat {
                    mode: libc::S_IFDIR | (stat.mode & 0o7777),
                    ..stat
                },
            )
        } else if entry_type.is_hard_link() {
            let target = canonical_path(&link_name.unwrap_or_default());
            let linked = match self.index.get(&target) {
                Some(node) if node.is_dir() => {
                    return Err(BuildError::LinkToDirectory(path, target).into())
                }
                Some(node) => node,
                None => return Err(BuildError::MissingLinkTarget(path, target).into()),
            };
            let data = linked.stat();
            let node = Node::new(
                name,
                Stat {
                    mode: data.mode,
                    size: data.size,
                    offset: data.offset,
                    ..stat
                },
            );
            match linked.link_target() {
                Some(link_target) => node.with_link_target(link_target),
                None => node,
            }
        } else if entry_type.is_symlink() {
            Node::new(name, Stat { size: 0, ..stat }).with_link_target(link_name.unwrap_or_default())
        } else {
            Node::new(name, stat)
        };

        self.add(&path, node)
    }

    /// Number of archive entries added so far.
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Finish ingestion, failing if any referenced parent directory never showed up.
    pub fn finish(self) -> Result<PathIndex, Error> {
        if !self.pending.is_empty() {
            let missing = self.pending.into_iter().collect();
            return Err(BuildError::MissingDirectories(missing).into());
        }
        Ok(self.index)
    }
}

fn type_bits(entry_type: tar::EntryType) -> u32 {
    if entry_type.is_dir() {
        libc::S_IFDIR
    } else if entry_type.is_symlink() {
        libc::S_IFLNK
    } else if entry_type.is_character_special() {
        libc::S_IFCHR
    } else if entry_type.is_block_special() {
        libc::S_IFBLK
    } else if entry_type.is_fifo() {
        libc::S_IFIFO
    } else {
        libc::S_IFREG
    }
}

/// Blank or malformed numeric header fields read as `default`.
fn header_field(path: &str, field: &str, value: io::Result<u64>, default: u64) -> u64 {
    match value {
        Ok(value) => value,
        Err(err) => {
            log::debug!("{:?}: unusable {} field ({}), using {}", path, field, err, default);
            default
        }
    }
}

fn default_permissions(entry_type: tar::EntryType) -> u32 {
    if entry_type.is_dir() {
        0o755
    } else if entry_type.is_symlink() {
        0o777
    } else {
        0o644
    }
}

fn to_id(path: &str, field: &'static str, value: u64) -> Result<u32, Error> {
    u32::try_from(value).map_err(|_| {
        BuildError::IdOutOfRange {
            path: path.to_string(),
            field,
            value,
        }
        .into()
    })
}

fn entry_stat<R: Read>(entry: &mut tar::Entry<R>, path: &str) -> Result<Stat, Error> {
    let header = entry.header();
    let entry_type = header.entry_type();
    let permissions = match header.mode() {
        Ok(mode) => mode & 0o7777,
        Err(_) => default_permissions(entry_type),
    };
    let mode = type_bits(entry_type) | permissions;
    let mut uid = header_field(path, "uid", header.uid(), 0);
    let mut gid = header_field(path, "gid", header.gid(), 0);
    let mut mtime = header_field(path, "mtime", header.mtime(), 0) as i64;
    let (mut atime, mut ctime) = match header.as_gnu() {
        Some(gnu) => (
            gnu_time(gnu.atime()).unwrap_or(mtime),
            gnu_time(gnu.ctime()).unwrap_or(mtime),
        ),
        None => (mtime, mtime),
    };
    let size = entry.size();
    let offset = entry.raw_file_position();

    if let Some(extensions) = entry.pax_extensions().map_err(BuildError::Read)? {
        for extension in extensions {
            let extension = extension.map_err(BuildError::Read)?;
            let (key, value) = match (extension.key(), extension.value()) {
                (Ok(key), Ok(value)) => (key, value),
                _ => continue,
            };
            match key {
                "uid" => uid = value.parse().unwrap_or(uid),
                "gid" => gid = value.parse().unwrap_or(gid),
                "mtime" => mtime = pax_time(value).unwrap_or(mtime),
                "atime" => atime = pax_time(value).unwrap_or(atime),
                "ctime" => ctime = pax_time(value).unwrap_or(ctime),
                _ => (),
            }
        }
    }

    Ok(Stat {
        mode,
        uid: to_id(path, "uid", uid)?,
        gid: to_id(path, "gid", gid)?,
        size,
        mtime,
        atime,
        ctime,
        offset,
    })
}

/// GNU headers leave access and change time zeroed unless the writer filled them in.
fn gnu_time(time: io::Result<u64>) -> Option<i64> {
    match time {
        Ok(0) | Err(_) => None,
        Ok(time) => Some(time as i64),
    }
}

/// Whole seconds of a pax time stamp like `1700000000.25`.
fn pax_time(value: &str) -> Option<i64> {
    let secs = value.split('.').next()?;
    secs.parse().ok()
}

/// Build a file system from `size` bytes of tar data readable through `reader`.
///
/// The stream is read exactly once, front to back. File contents are not copied; the returned
/// [`TarFs`] reads them from `reader` on demand, so the data must stay unchanged while it is in
/// use.
pub fn build_from_readable(reader: Reader, size: u64, index: PathIndex) -> Result<TarFs, Error> {
    let mut builder = Builder::new(index)?;
    let mut archive = tar::Archive::new(StreamReader::new(Arc::clone(&reader), size));
    builder.add_archive(&mut archive)?;

    let entry_count = builder.entry_count();
    let index = builder.finish()?;
    log::info!("indexed {} archive entries", entry_count);

    Ok(TarFs::new(index, reader, size))
}

/// Build a file system from a tar file.
pub fn build_from_file<P: AsRef<Path>>(path: P, index: PathIndex) -> Result<TarFs, Error> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|err| format_err!("unable to open archive {:?} - {}", path, err))?;
    let size = file.metadata()?.len();
    build_from_readable(Arc::new(file), size, index)
}
