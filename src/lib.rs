//! Read-only file system view of tar archives.
//!
//! An archive is indexed once by [`build_from_file`] or [`build_from_readable`]; the resulting
//! [`TarFs`] answers path based file system requests from that index and reads file contents
//! straight from the archive.

pub mod builder;
pub mod fs;
pub mod index;
pub mod io;
pub mod stat;

pub use builder::{build_from_file, build_from_readable, BuildError, Builder};
pub use fs::{Attr, DirEntry, FileHandle, FsStats, ReadResult, TarFs};
pub use index::{canonical_path, Node, PathIndex, ROOT_INODE, ROOT_PATH};
pub use io::{ReadAt, Reader};
pub use stat::{check_permission, Access, Caller, FileType, Stat};
