//! Asynchronous fuse implementation serving a [`TarFs`].

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::io;
use std::mem;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{format_err, Error};
use futures::channel::mpsc::UnboundedSender;
use futures::select;
use futures::sink::SinkExt;
use futures::stream::{StreamExt, TryStreamExt};

use proxmox_io::vec;

use proxmox_fuse::requests::{self, FuseRequest};
use proxmox_fuse::{EntryParam, Fuse, ReplyBufState, Request};
use proxmox_lang::io_format_err;

use tarfs::index::join_path;
use tarfs::{Attr, Caller, PathIndex, ReadResult, TarFs};

pub struct Session {
    fut: Pin<Box<dyn Future<Output = Result<(), Error>> + Send + Sync + 'static>>,
}

impl Session {
    /// Create a fuse session for a tar archive.
    pub async fn mount_path(
        archive_path: &Path,
        options: &OsStr,
        verbose: bool,
        mountpoint: &Path,
    ) -> Result<Self, Error> {
        let fs = tarfs::build_from_file(archive_path, PathIndex::new())?;
        Self::mount(fs, options, verbose, mountpoint)
    }

    /// Create a new fuse session for an already indexed archive.
    pub fn mount(fs: TarFs, options: &OsStr, verbose: bool, path: &Path) -> Result<Self, Error> {
        let mut builder = Fuse::builder("tarfs")?
            .options_os(options)?
            .enable_readdirplus()
            .enable_read()
            .enable_readlink();
        if verbose {
            builder = builder.debug();
        }
        let fuse = builder.build()?.mount(path)?;

        let session = SessionImpl::new(fs, verbose);

        Ok(Self {
            fut: Box::pin(session.main(fuse)),
        })
    }
}

impl Future for Session {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Pin::new(&mut self.fut).poll(cx)
    }
}

/// We use this to return an errno value back to the kernel.
macro_rules! io_return {
    ($errno:expr) => {{
        return Err(::std::io::Error::from_raw_os_error($errno).into());
    }};
}

struct SessionImpl {
    fs: TarFs,
    verbose: bool,
    /// fuse does not tell us who is asking, requests are checked against the mounting user
    caller: Caller,
}

impl SessionImpl {
    fn new(fs: TarFs, verbose: bool) -> Self {
        Self {
            fs,
            verbose,
            caller: Caller::current(),
        }
    }

    /// Here's how we deal with errors:
    ///
    /// Any error will be logged if a log level of at least 'debug' was set, otherwise the
    /// message will be silently dropped.
    ///
    /// Opaque errors will cause the fuse main loop to bail out with that error.
    ///
    /// `io::Error`s will cause the fuse request to responded to with the given `io::Error`. An
    /// `io::ErrorKind::Other` translates to a generic `EIO`.
    async fn handle_err(
        &self,
        request: impl FuseRequest,
        err: Error,
        mut sender: UnboundedSender<Error>,
    ) {
        let final_result = match err.downcast::<io::Error>() {
            Ok(err) => {
                if err.kind() == io::ErrorKind::Other {
                    log::error!("an IO error occurred: {}", err);
                } else {
                    log::debug!("request failed: {}", err);
                }

                request.io_fail(err).map_err(Error::from)
            }
            Err(err) => {
                log::error!("internal error: {}, bailing out", err);
                Err(err)
            }
        };
        if let Err(err) = final_result {
            sender
                .send(err)
                .await
                .expect("failed to propagate error to main loop");
        }
    }

    async fn main(self, fuse: Fuse) -> Result<(), Error> {
        Arc::new(self).main_do(fuse).await
    }

    async fn main_do(self: Arc<Self>, fuse: Fuse) -> Result<(), Error> {
        let (err_send, mut err_recv) = futures::channel::mpsc::unbounded::<Error>();
        let mut fuse = fuse.fuse(); // make this a futures::stream::FusedStream!
        loop {
            select! {
                request = fuse.try_next() => match request? {
                    Some(request) => {
                        tokio::spawn(Arc::clone(&self).handle_request(request, err_send.clone()));
                    }
                    None => break,
                },
                err = err_recv.next() => match err {
                    Some(err) => {
                        log::error!("cancelling fuse main loop due to error: {}", err);
                        return Err(err);
                    }
                    None => panic!("error channel was closed unexpectedly"),
                },
            }
        }
        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        request: Request,
        mut err_sender: UnboundedSender<Error>,
    ) {
        let result: Result<(), Error> = match request {
            Request::Lookup(request) => match self.lookup(request.parent, &request.file_name) {
                Ok(entry) => request.reply(&entry).map_err(Error::from),
                Err(err) => return self.handle_err(request, err, err_sender).await,
            },
            Request::Forget(request) => {
                // entries live as long as the session, there is nothing to release
                request.reply();
                Ok(())
            }
            Request::Getattr(request) => match self.getattr(request.inode) {
                Ok(stat) => request.reply(&stat, f64::MAX).map_err(Error::from),
                Err(err) => return self.handle_err(request, err, err_sender).await,
            },
            Request::ReaddirPlus(mut request) => match self.readdirplus(&mut request) {
                Ok(()) => request.reply().map_err(Error::from),
                Err(err) => return self.handle_err(request, err, err_sender).await,
            },
            Request::Read(request) => {
                match self.read(request.inode, request.size, request.offset) {
                    Ok(data) => request.reply(&data).map_err(Error::from),
                    Err(err) => return self.handle_err(request, err, err_sender).await,
                }
            }
            Request::Readlink(request) => match self.readlink(request.inode) {
                Ok(data) => request.reply(&data).map_err(Error::from),
                Err(err) => return self.handle_err(request, err, err_sender).await,
            },
            other => {
                log::error!("Received unexpected fuse request");
                other.fail(libc::ENOSYS).map_err(Error::from)
            }
        };

        if let Err(err) = result {
            err_sender
                .send(err)
                .await
                .expect("failed to propagate error to main loop");
        }
    }

    fn path_of(&self, inode: u64) -> Result<&str, Error> {
        match self.fs.index().get_by_inode(inode) {
            Some((path, _)) => Ok(path),
            None => io_return!(libc::ENOENT),
        }
    }

    fn lookup(&self, parent: u64, file_name: &OsStr) -> Result<EntryParam, Error> {
        let dir = self.path_of(parent)?;
        let path = join_path(dir, &file_name.to_string_lossy());
        let attr = self.fs.getattr(&path, &self.caller)?;
        Ok(EntryParam::simple(attr.inode, to_stat(&attr)?))
    }

    fn getattr(&self, inode: u64) -> Result<libc::stat, Error> {
        let path = self.path_of(inode)?;
        to_stat(&self.fs.getattr(path, &self.caller)?)
    }

    fn readdirplus(&self, request: &mut requests::ReaddirPlus) -> Result<(), Error> {
        let offset = usize::try_from(request.offset)
            .map_err(|_| io_format_err!("directory offset out of range"))?;

        let path = self.path_of(request.inode)?;
        let entries = self.fs.read_dir_plus(path, &self.caller)?;
        let entry_count = entries.len() as isize;

        let mut next = offset as isize;
        for (name, attr) in entries.into_iter().skip(offset) {
            next += 1;
            let stat = to_stat(&attr)?;
            match request.add_entry(OsStr::new(&name), &stat, next, 1, f64::MAX, f64::MAX)? {
                ReplyBufState::Ok => (),
                ReplyBufState::Full => return Ok(()),
            }
        }

        if next == entry_count {
            next += 1;
            let stat = self.node_stat(path)?;
            match request.add_entry(OsStr::new("."), &stat, next, 1, f64::MAX, f64::MAX)? {
                ReplyBufState::Ok => (),
                ReplyBufState::Full => return Ok(()),
            }
        }

        if next == entry_count + 1 {
            next += 1;
            let parent = tarfs::index::parent_path(path).unwrap_or(path);
            let stat = self.node_stat(parent)?;
            match request.add_entry(OsStr::new(".."), &stat, next, 1, f64::MAX, f64::MAX)? {
                ReplyBufState::Ok => (),
                ReplyBufState::Full => return Ok(()),
            }
        }

        Ok(())
    }

    /// Listed entries were already permitted by reading their directory.
    fn node_stat(&self, path: &str) -> Result<libc::stat, Error> {
        match self.fs.index().get(path) {
            Some(node) => to_stat(&Attr::from_node(node)),
            None => io_return!(libc::ENOENT),
        }
    }

    fn read(&self, inode: u64, len: usize, offset: u64) -> Result<Vec<u8>, Error> {
        let path = self.path_of(inode)?;
        let file = self.fs.open(path, libc::O_RDONLY)?;
        let mut buf = vec::undefined(len);
        // fuse' read is different from normal read - no short reads allowed except for EOF!
        // the returned data will be 0-byte padded up to len by fuse
        match self.fs.read(&file, &mut buf, offset)? {
            ReadResult::Data(got) => buf.truncate(got),
            ReadResult::EndOfData => buf.clear(),
        }
        Ok(buf)
    }

    fn readlink(&self, inode: u64) -> Result<OsString, Error> {
        let path = self.path_of(inode)?;
        Ok(OsString::from(self.fs.readlink(path, &self.caller)?))
    }
}

fn to_stat(attr: &Attr) -> Result<libc::stat, Error> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    stat.st_ino = attr.inode;
    stat.st_nlink = attr.nlink as _;
    stat.st_mode = attr.mode;
    stat.st_size = i64::try_from(attr.size)
        .map_err(|err| format_err!("size does not fit into st_size field: {}", err))?;
    stat.st_uid = attr.uid;
    stat.st_gid = attr.gid;
    stat.st_atime = attr.atime;
    stat.st_mtime = attr.mtime;
    stat.st_ctime = attr.ctime;
    Ok(stat)
}
