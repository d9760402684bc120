//! Per-entry metadata and the permission rule applied to it.

use bitflags::bitflags;

/// Mode of the synthetic root directory.
pub const DEFAULT_DIR_MODE: u32 = libc::S_IFDIR | 0o755;

/// Metadata of a single archive entry.
///
/// `offset` is the position of the entry's content in the archive stream. It is meaningless for
/// directories.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub offset: u64,
}

impl Stat {
    /// Metadata for a directory which has been referenced as a parent but not seen yet.
    pub fn placeholder() -> Self {
        Self {
            mode: libc::S_IFDIR,
            ..Default::default()
        }
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFDIR
    }

    #[inline]
    pub fn is_symlink(&self) -> bool {
        (self.mode & libc::S_IFMT) == libc::S_IFLNK
    }

    /// The `rwxrwxrwx` bits.
    #[inline]
    pub fn permissions(&self) -> u32 {
        self.mode & 0o777
    }
}

/// File type as reported to the file system layer.
///
/// Anything which is neither a directory nor a symlink is presented as a regular file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Directory,
    Symlink,
    Regular,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            _ => FileType::Regular,
        }
    }

    /// The `S_IFMT` bits for this type.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::Directory => libc::S_IFDIR,
            FileType::Symlink => libc::S_IFLNK,
            FileType::Regular => libc::S_IFREG,
        }
    }
}

/// Identity of the process issuing a file system request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The identity of the current process.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

bitflags! {
    /// Requested access, using the bit positions of the "other" permission class.
    pub struct Access: u32 {
        const READ = 0o4;
        const WRITE = 0o2;
        const EXECUTE = 0o1;
    }
}

/// Check whether `caller` may perform `access` on an entry with metadata `stat`.
///
/// The "other" class is consulted first, then the group class if the caller's gid matches, and
/// only then the owner class. A matching group decides on its own, even if the caller also owns
/// the entry.
pub fn check_permission(stat: &Stat, caller: &Caller, access: Access) -> bool {
    let perms = stat.permissions();
    let wanted = access.bits();
    let granted = |shift: u32| ((perms >> shift) & wanted) == wanted;

    if granted(0) {
        return true;
    }
    if stat.gid == caller.gid {
        return granted(3);
    }
    if stat.uid == caller.uid {
        return granted(6);
    }

    false
}
