use std::ffi::OsStr;
use std::path::Path;

use anyhow::{format_err, Error};
use futures::future::FutureExt;
use futures::select;
use tokio::signal::unix::{signal, SignalKind};

use proxmox_router::cli::*;
use proxmox_schema::api;

use tarfs::{Node, PathIndex};

#[api(
    input: {
        properties: {
            archive: { description: "Archive name." },
            mountpoint: { description: "Mountpoint for the file system." },
            verbose: {
                description: "Verbose output, running in the foreground (for debugging).",
                optional: true,
                default: false,
            },
        },
    },
)]
/// Mount the archive to the provided mountpoint via FUSE.
async fn mount_archive(archive: String, mountpoint: String, verbose: bool) -> Result<(), Error> {
    let archive = Path::new(&archive);
    let mountpoint = Path::new(&mountpoint);
    let options = OsStr::new("ro,default_permissions");

    let session = tarfs_fuse::Session::mount_path(archive, options, verbose, mountpoint)
        .await
        .map_err(|err| format_err!("tarfs mount failed: {}", err))?;

    let mut interrupt = signal(SignalKind::interrupt())?;

    select! {
        res = session.fuse() => res?,
        _ = interrupt.recv().fuse() => {
            log::debug!("interrupted");
        }
    }

    Ok(())
}

fn format_single_line_entry(path: &str, node: &Node) -> String {
    let stat = node.stat();
    let kind = if stat.is_dir() {
        'd'
    } else if stat.is_symlink() {
        'l'
    } else {
        '-'
    };
    let link = match node.link_target() {
        Some(target) => format!(" -> {}", target),
        None => String::new(),
    };

    format!(
        "{}{:04o} {:>5}/{:<5} {:>12} {} {}{}",
        kind,
        stat.permissions(),
        stat.uid,
        stat.gid,
        stat.size,
        stat.mtime,
        path,
        link,
    )
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name.",
            },
        },
    },
)]
/// Index an archive and list its contents.
fn list_archive(archive: String) -> Result<(), Error> {
    let fs = tarfs::build_from_file(&archive, PathIndex::new())?;

    for (path, node) in fs.index().iter() {
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("{}", format_single_line_entry(path, node));
        } else {
            log::info!("{}", path);
        }
    }
    Ok(())
}

fn main() {
    init_cli_logger("TARFS_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "mount",
            CliCommand::new(&API_METHOD_MOUNT_ARCHIVE)
                .arg_param(&["archive", "mountpoint"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("mountpoint", complete_file_name),
        )
        .insert(
            "list",
            CliCommand::new(&API_METHOD_LIST_ARCHIVE)
                .arg_param(&["archive"])
                .completion_cb("archive", complete_file_name),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| proxmox_async::runtime::main(future)),
    );
}
