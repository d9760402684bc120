use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Error;
use tar::{EntryType, Header};

use tarfs::{
    build_from_file, build_from_readable, BuildError, Caller, FileType, PathIndex, ReadAt,
    ReadResult, Reader, TarFs,
};

const OWNER: u32 = 1000;

fn header(name: &str, entry_type: EntryType, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    // write the name verbatim, `set_path` would normalize it
    header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(OWNER as u64);
    header.set_gid(OWNER as u64);
    header.set_mtime(1_600_000_000);
    header
}

fn append(builder: &mut tar::Builder<Vec<u8>>, mut header: Header, data: &[u8]) {
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder.append(&header, data).unwrap();
}

fn dir(builder: &mut tar::Builder<Vec<u8>>, name: &str) {
    append(builder, header(name, EntryType::Directory, 0o755), &[]);
}

fn file(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    append(builder, header(name, EntryType::Regular, 0o644), data);
}

fn finish(builder: tar::Builder<Vec<u8>>) -> Vec<u8> {
    builder.into_inner().unwrap()
}

fn build(data: Vec<u8>) -> Result<TarFs, Error> {
    let size = data.len() as u64;
    build_from_readable(Arc::new(data), size, PathIndex::new())
}

fn list(fs: &TarFs, path: &str) -> Vec<String> {
    fs.read_dir(path, &Caller::current())
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect()
}

fn read_all(fs: &TarFs, path: &str) -> Vec<u8> {
    let handle = fs.open(path, libc::O_RDONLY).unwrap();
    let mut buf = vec![0u8; handle.size() as usize];
    match fs.read(&handle, &mut buf, 0).unwrap() {
        ReadResult::Data(got) => buf.truncate(got),
        ReadResult::EndOfData => buf.clear(),
    }
    buf
}

fn sample_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    dir(&mut builder, "foo/");
    file(&mut builder, "foo/bar", &[0xa]);
    file(&mut builder, "foo/baz", &[0xb]);
    dir(&mut builder, "foo/quux/");
    file(&mut builder, "foo/quux/hello", b"hello");
    finish(builder)
}

#[test]
fn test_from_reader_at() -> Result<(), Error> {
    let fs = build(sample_archive())?;
    let caller = Caller::current();

    assert_eq!(list(&fs, "."), ["foo"]);
    assert_eq!(list(&fs, "foo"), ["bar", "baz", "quux"]);
    assert_eq!(list(&fs, "foo/quux"), ["hello"]);

    for name in ["foo", "foo/bar", "foo/baz", "foo/quux", "foo/quux/hello"] {
        let attr = fs.getattr(name, &caller)?;
        assert_eq!(attr.uid, OWNER);
        assert_eq!(attr.mtime, 1_600_000_000);
    }
    assert_eq!(fs.getattr("foo", &caller)?.file_type(), FileType::Directory);
    assert_eq!(fs.getattr("foo/bar", &caller)?.file_type(), FileType::Regular);

    assert_eq!(read_all(&fs, "foo/bar"), [0xa]);
    assert_eq!(read_all(&fs, "foo/baz"), [0xb]);
    assert_eq!(read_all(&fs, "foo/quux/hello"), b"hello");
    Ok(())
}

#[test]
fn test_names_match_paths() -> Result<(), Error> {
    let fs = build(sample_archive())?;
    for (path, node) in fs.index().iter() {
        let expected = path.rsplit('/').next().unwrap();
        assert_eq!(node.name(), expected, "name of {:?}", path);
        assert_eq!(fs.index().get(path).unwrap().inode(), node.inode());
    }
    assert_eq!(fs.index().len(), 6);
    Ok(())
}

#[test]
fn test_children_before_parents() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    file(&mut builder, "foo/quux/hello", b"hello");
    file(&mut builder, "foo/zeta", b"z");
    dir(&mut builder, "foo/quux/");
    file(&mut builder, "foo/alpha", b"a");
    dir(&mut builder, "foo/");
    let fs = build(finish(builder))?;

    assert_eq!(list(&fs, "/"), ["foo"]);
    assert_eq!(list(&fs, "/foo"), ["alpha", "quux", "zeta"]);
    assert_eq!(list(&fs, "/foo/quux"), ["hello"]);
    assert_eq!(read_all(&fs, "/foo/quux/hello"), b"hello");

    let quux = fs.getattr("/foo/quux", &Caller::current())?;
    assert_eq!(quux.mode, libc::S_IFDIR | 0o755);
    assert_eq!(quux.uid, OWNER);
    Ok(())
}

#[test]
fn test_missing_directory_entry() {
    let mut builder = tar::Builder::new(Vec::new());
    dir(&mut builder, "present/");
    file(&mut builder, "present/file", b"data");
    file(&mut builder, "missing/file", b"data");
    let err = build(finish(builder)).err().expect("ingestion should fail");

    assert!(err.to_string().contains("missing"), "{}", err);
    match err.downcast_ref::<BuildError>() {
        Some(BuildError::MissingDirectories(paths)) => assert_eq!(paths, &["/missing"]),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_read_round_trip() -> Result<(), Error> {
    let content: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let mut builder = tar::Builder::new(Vec::new());
    file(&mut builder, "first", b"neighbour");
    file(&mut builder, "data", &content);
    file(&mut builder, "last", b"neighbour");
    let fs = build(finish(builder))?;

    let handle = fs.open("/data", libc::O_RDONLY)?;
    assert_eq!(handle.size(), content.len() as u64);

    let mut buf = vec![0u8; content.len() + 100];
    assert_eq!(
        fs.read(&handle, &mut buf, 0)?,
        ReadResult::Data(content.len())
    );
    assert_eq!(&buf[..content.len()], &content[..]);

    let mut buf = [0u8; 10];
    assert_eq!(fs.read(&handle, &mut buf, 1995)?, ReadResult::Data(5));
    assert_eq!(&buf[..5], &content[1995..]);

    assert_eq!(
        fs.read(&handle, &mut buf, content.len() as u64)?,
        ReadResult::EndOfData
    );
    Ok(())
}

#[test]
fn test_permissions() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, header("secret", EntryType::Regular, 0o400), b"top secret");
    append(&mut builder, header("private/", EntryType::Directory, 0o700), &[]);
    file(&mut builder, "private/file", b"x");
    let fs = build(finish(builder))?;

    let stranger = Caller::new(2000, 2000);
    let owner = Caller::new(OWNER, 2000);

    let err = fs.getattr("secret", &stranger).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));
    let err = fs.read_dir("private", &stranger).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));

    assert_eq!(fs.getattr("secret", &owner)?.size, 10);
    assert_eq!(fs.read_dir("private", &owner)?.len(), 1);

    // the root is readable by everyone
    assert_eq!(fs.read_dir("/", &stranger)?.len(), 2);
    Ok(())
}

#[test]
fn test_links() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    file(&mut builder, "target", b"shared contents");

    let mut symlink = header("symlink", EntryType::Symlink, 0o777);
    symlink.set_link_name("target")?;
    append(&mut builder, symlink, &[]);

    let mut hardlink = header("hardlink", EntryType::Link, 0o644);
    hardlink.set_link_name("target")?;
    append(&mut builder, hardlink, &[]);

    let fs = build(finish(builder))?;
    let caller = Caller::current();

    let attr = fs.getattr("symlink", &caller)?;
    assert_eq!(attr.file_type(), FileType::Symlink);
    assert_eq!(fs.readlink("symlink", &caller)?, "target");

    assert_eq!(fs.getattr("hardlink", &caller)?.size, 15);
    assert_eq!(read_all(&fs, "hardlink"), b"shared contents");
    Ok(())
}

#[test]
fn test_hardlink_to_unknown_entry() {
    let mut builder = tar::Builder::new(Vec::new());
    let mut hardlink = header("hardlink", EntryType::Link, 0o644);
    hardlink.set_link_name("nowhere").unwrap();
    append(&mut builder, hardlink, &[]);

    let err = build(finish(builder)).err().expect("ingestion should fail");
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::MissingLinkTarget(_, _))
    ));
}

#[test]
fn test_explicit_root_entry() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    file(&mut builder, "./early", b"1");
    let mut root = header("./", EntryType::Directory, 0o750);
    root.set_uid(4321);
    append(&mut builder, root, &[]);
    file(&mut builder, "./late", b"2");
    let fs = build(finish(builder))?;

    let owner = Caller::new(4321, 0);
    let attr = fs.getattr("/", &owner)?;
    assert_eq!(attr.mode, libc::S_IFDIR | 0o750);
    assert_eq!(attr.uid, 4321);
    assert_eq!(attr.inode, tarfs::ROOT_INODE);

    let names: Vec<String> = fs
        .read_dir("/", &owner)?
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(names, ["early", "late"]);
    Ok(())
}

#[test]
fn test_empty_archive() -> Result<(), Error> {
    let fs = build(finish(tar::Builder::new(Vec::new())))?;
    let caller = Caller::current();

    let root = fs.getattr("/", &caller)?;
    assert_eq!(root.mode, libc::S_IFDIR | 0o755);
    assert_eq!(root.uid, caller.uid);
    assert_eq!(root.gid, caller.gid);
    assert!(fs.read_dir("/", &caller)?.is_empty());
    Ok(())
}

#[test]
fn test_idempotent_ingestion() -> Result<(), Error> {
    let data = sample_archive();
    let first = build(data.clone())?;
    let second = build(data)?;
    let caller = Caller::current();

    assert_eq!(first.read_dir("/", &caller)?, second.read_dir("/", &caller)?);
    for (path, node) in first.index().iter() {
        let other = second.index().get(path).expect("path missing in second index");
        assert_eq!(node.name(), other.name());
        assert_eq!(node.stat(), other.stat());
        assert_eq!(first.getattr(path, &caller)?, second.getattr(path, &caller)?);
        if !node.is_dir() {
            assert_eq!(read_all(&first, path), read_all(&second, path));
        }
    }
    Ok(())
}

struct BreakableReader {
    data: Vec<u8>,
    broken: AtomicBool,
}

impl ReadAt for BreakableReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "medium error"));
        }
        self.data.read_at(buf, offset)
    }
}

#[test]
fn test_read_fault() -> Result<(), Error> {
    let data = sample_archive();
    let size = data.len() as u64;
    let source = Arc::new(BreakableReader {
        data,
        broken: AtomicBool::new(false),
    });
    let reader: Reader = source.clone();
    let fs = build_from_readable(reader, size, PathIndex::new())?;

    let handle = fs.open("foo/quux/hello", libc::O_RDONLY)?;
    source.broken.store(true, Ordering::SeqCst);

    let mut buf = [0u8; 5];
    let err = fs.read(&handle, &mut buf, 0).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EIO));

    // metadata is still served from the index
    assert_eq!(list(&fs, "foo/quux"), ["hello"]);
    Ok(())
}

#[test]
fn test_stream_fault_aborts_ingestion() {
    let data = sample_archive();
    let size = data.len() as u64;
    let reader: Reader = Arc::new(BreakableReader {
        data,
        broken: AtomicBool::new(true),
    });

    let err = build_from_readable(reader, size, PathIndex::new())
        .err()
        .expect("ingestion should fail");
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::Read(_))
    ));
}

#[test]
fn test_build_from_file() -> Result<(), Error> {
    let path = std::env::temp_dir().join(format!("tarfs-test-{}.tar", std::process::id()));
    std::fs::write(&path, sample_archive())?;

    let result = build_from_file(&path, PathIndex::new());
    std::fs::remove_file(&path)?;
    let fs = result?;

    assert_eq!(fs.archive_size(), sample_archive().len() as u64);
    assert_eq!(read_all(&fs, "foo/quux/hello"), b"hello");

    assert!(build_from_file("/nonexistent/archive.tar", PathIndex::new()).is_err());
    Ok(())
}

#[test]
fn test_blank_header_fields() -> Result<(), Error> {
    // only name, type and size are filled in, the way `Header::new_gnu()` leaves them
    let bare = |name: &str, entry_type: EntryType| {
        let mut header = Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_entry_type(entry_type);
        header
    };

    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, bare("foo/", EntryType::Directory), &[]);
    append(&mut builder, bare("foo/hello", EntryType::Regular), b"hello world\n");
    let fs = build(finish(builder))?;
    let caller = Caller::current();

    let dir = fs.getattr("/foo", &caller)?;
    assert_eq!(dir.mode, libc::S_IFDIR | 0o755);
    assert_eq!((dir.uid, dir.gid, dir.mtime), (0, 0, 0));

    let file = fs.getattr("/foo/hello", &caller)?;
    assert_eq!(file.mode, libc::S_IFREG | 0o644);
    assert_eq!((file.uid, file.gid, file.mtime), (0, 0, 0));
    assert_eq!(read_all(&fs, "/foo/hello"), b"hello world\n");
    Ok(())
}

#[test]
fn test_listing_with_unreadable_entries() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    dir(&mut builder, "etc/");
    file(&mut builder, "etc/hosts", b"127.0.0.1 localhost\n");
    append(&mut builder, header("etc/shadow", EntryType::Regular, 0o600), b"root:*:");
    let fs = build(finish(builder))?;
    let stranger = Caller::new(2000, 2000);

    let err = fs.getattr("/etc/shadow", &stranger).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));

    let entries = fs.read_dir_plus("/etc", &stranger)?;
    let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["hosts", "shadow"]);
    assert_eq!(entries[1].1.mode, libc::S_IFREG | 0o600);
    assert_eq!(entries[1].1.size, 7);
    Ok(())
}

#[test]
fn test_concurrent_reads() -> Result<(), Error> {
    let contents: Vec<Vec<u8>> = (0..8usize)
        .map(|i| (0..(700 + i * 300)).map(|j| (j * (i + 1) % 251) as u8).collect())
        .collect();
    let mut builder = tar::Builder::new(Vec::new());
    for (i, data) in contents.iter().enumerate() {
        file(&mut builder, &format!("file{}", i), data);
    }
    let fs = build(finish(builder))?;

    std::thread::scope(|scope| {
        for (i, expected) in contents.iter().enumerate() {
            let fs = &fs;
            scope.spawn(move || {
                let path = format!("/file{}", i);
                let mut buf = [0u8; 256];
                for round in 0..200usize {
                    let handle = fs.open(&path, libc::O_RDONLY).unwrap();
                    let offset = (round * 7) % expected.len();
                    let wanted = std::cmp::min(buf.len(), expected.len() - offset);
                    assert_eq!(
                        fs.read(&handle, &mut buf, offset as u64).unwrap(),
                        ReadResult::Data(wanted)
                    );
                    assert_eq!(&buf[..wanted], &expected[offset..(offset + wanted)]);
                }
            });
        }
    });
    Ok(())
}

#[test]
fn test_pax_overrides() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_pax_extensions([
        ("uid", &b"99999"[..]),
        ("gid", &b"99998"[..]),
        ("mtime", &b"1700000000.25"[..]),
        ("atime", &b"1700000001"[..]),
        ("ctime", &b"1700000002"[..]),
    ])?;
    file(&mut builder, "described", b"data");
    file(&mut builder, "plain", b"data");
    let fs = build(finish(builder))?;
    let caller = Caller::current();

    let attr = fs.getattr("/described", &caller)?;
    assert_eq!((attr.uid, attr.gid), (99999, 99998));
    assert_eq!(attr.mtime, 1_700_000_000);
    assert_eq!(attr.atime, 1_700_000_001);
    assert_eq!(attr.ctime, 1_700_000_002);
    assert_eq!(read_all(&fs, "/described"), b"data");

    // extensions only describe the entry following them
    let attr = fs.getattr("/plain", &caller)?;
    assert_eq!((attr.uid, attr.gid), (OWNER, OWNER));
    assert_eq!(attr.mtime, 1_600_000_000);
    Ok(())
}

#[test]
fn test_pax_id_out_of_range() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_pax_extensions([("uid", &b"4294967296"[..])])?;
    file(&mut builder, "huge", b"data");

    let err = build(finish(builder)).err().expect("ingestion should fail");
    match err.downcast_ref::<BuildError>() {
        Some(BuildError::IdOutOfRange { path, field, value }) => {
            assert_eq!(path, "/huge");
            assert_eq!(*field, "uid");
            assert_eq!(*value, 1 << 32);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    Ok(())
}

#[test]
fn test_gnu_times() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut stamped = header("stamped", EntryType::Regular, 0o644);
    let gnu = stamped.as_gnu_mut().unwrap();
    gnu.set_atime(1_650_000_000);
    gnu.set_ctime(1_660_000_000);
    append(&mut builder, stamped, b"x");
    file(&mut builder, "unstamped", b"y");
    let fs = build(finish(builder))?;
    let caller = Caller::current();

    let attr = fs.getattr("/stamped", &caller)?;
    assert_eq!(attr.mtime, 1_600_000_000);
    assert_eq!(attr.atime, 1_650_000_000);
    assert_eq!(attr.ctime, 1_660_000_000);

    // zeroed access and change times fall back to the modification time
    let attr = fs.getattr("/unstamped", &caller)?;
    assert_eq!(attr.atime, 1_600_000_000);
    assert_eq!(attr.ctime, 1_600_000_000);
    Ok(())
}

#[test]
fn test_sparse_entry_skipped() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut sparse = header("holes", EntryType::GNUSparse, 0o644);
    let gnu = sparse.as_gnu_mut().unwrap();
    gnu.sparse[0].set_offset(4091);
    gnu.sparse[0].set_length(5);
    gnu.set_real_size(4096);
    append(&mut builder, sparse, b"tail!");
    file(&mut builder, "after", b"after");
    let fs = build(finish(builder))?;

    assert_eq!(list(&fs, "/"), ["after"]);
    let err = fs.getattr("/holes", &Caller::current()).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    assert_eq!(read_all(&fs, "/after"), b"after");
    Ok(())
}

#[test]
fn test_regular_entry_with_trailing_slash() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, header("legacy/", EntryType::Regular, 0o755), &[]);
    file(&mut builder, "legacy/inside", b"in");
    let fs = build(finish(builder))?;

    let attr = fs.getattr("/legacy", &Caller::current())?;
    assert_eq!(attr.file_type(), FileType::Directory);
    assert_eq!(attr.mode, libc::S_IFDIR | 0o755);
    assert_eq!(list(&fs, "/legacy"), ["inside"]);
    Ok(())
}

#[test]
fn test_hardlink_to_symlink() -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    file(&mut builder, "target", b"contents");
    let mut symlink = header("symlink", EntryType::Symlink, 0o777);
    symlink.set_link_name("target")?;
    append(&mut builder, symlink, &[]);
    let mut twin = header("twin", EntryType::Link, 0o644);
    twin.set_link_name("symlink")?;
    append(&mut builder, twin, &[]);
    let fs = build(finish(builder))?;
    let caller = Caller::current();

    let attr = fs.getattr("/twin", &caller)?;
    assert_eq!(attr.file_type(), FileType::Symlink);
    assert_eq!(attr.size, 0);
    assert_eq!(fs.readlink("/twin", &caller)?, "target");
    Ok(())
}

#[test]
fn test_hardlink_to_directory() {
    let mut builder = tar::Builder::new(Vec::new());
    dir(&mut builder, "dir/");
    let mut link = header("link", EntryType::Link, 0o644);
    link.set_link_name("dir").unwrap();
    append(&mut builder, link, &[]);

    let err = build(finish(builder)).err().expect("ingestion should fail");
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::LinkToDirectory(_, _))
    ));
}
