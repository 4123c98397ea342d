//! Unpacking a layer tar stream into a destination directory.
//!
//! Every entry is materialized under the destination with its metadata
//! restored in an order that keeps later steps from clobbering earlier
//! ones: ownership first (chown clears capabilities), then xattrs, then
//! mode, then times. Directory times are deferred until after the whole
//! stream, since writing into a directory would update its mtime again.
//!
//! AUFS whiteout entries are executed rather than materialized: a
//! `.wh.<name>` entry deletes `<name>`, and an opaque marker deletes
//! everything in its directory that this stream did not itself create —
//! which is what hides lower-layer content when layers are applied in
//! sequence with [`open_and_unpack_multi`].
//!
//! Symlink and hardlink targets are resolved lexically and must stay
//! contained in the destination; escapes fail the unpack.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{DirBuilder, File};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rustix::fs::{
    chmod, chownat, linkat, lsetxattr, lstat, makedev, mkdir, mknodat, openat, symlinkat, AtFlags,
    FileType, Gid, OFlags, Uid, XattrFlags, CWD,
};
use rustix::io::Errno;
use tar::EntryType;
use tokio_util::io::SyncIoBridge;
pub use tokio_util::sync::CancellationToken;

use crate::entry::EntryHeader;
use crate::error::{flatten_join, LayerError, Result};
use crate::fs::{
    contained, directory_exists, entry_rel_path, lexical_join, lset_times, remove_all,
    set_file_times,
};
use crate::whiteout::{
    is_whiteout_name, WHITEOUT_META_PREFIX, WHITEOUT_OPAQUE_DIR, WHITEOUT_PREFIX,
};

/// Controls the behavior of the unpack operations.
#[derive(Debug, Clone, Default)]
pub struct UnpackOptions {
    /// Skip ownership restoration. Useful when unpacking as an
    /// unprivileged user.
    pub no_chown: bool,
    /// Checked between entries; cancelling makes the unpack return
    /// [`LayerError::Cancelled`] promptly.
    pub cancel: Option<CancellationToken>,
}

struct DeferredDir {
    path: PathBuf,
    atime: Option<i64>,
    mtime: i64,
}

/// Unpack the tar stream `src` into the directory `dest`.
///
/// A missing destination is created with mode 0700; an existing
/// non-directory fails before any entry is read.
pub fn unpack_tar(src: impl Read, dest: &Path, options: &UnpackOptions) -> Result<()> {
    if !directory_exists(dest)? {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dest)
            .map_err(|err| LayerError::DirectoryCreateFailed(dest.to_owned(), err))?;
    }

    let mut archive = tar::Archive::new(io::BufReader::new(src));
    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut deferred_dirs: Vec<DeferredDir> = Vec::new();

    let mut entries = archive.entries().map_err(LayerError::Read)?;
    loop {
        if let Some(cancel) = &options.cancel {
            if cancel.is_cancelled() {
                return Err(LayerError::Cancelled);
            }
        }
        let Some(entry) = entries.next() else {
            break;
        };

        let mut entry = entry.map_err(LayerError::Read)?;
        let header = EntryHeader::from_entry(&mut entry)?;
        let Some(rel) = entry_rel_path(&header.path) else {
            return Err(LayerError::Read(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry path {:?} escapes the destination", header.path),
            )));
        };
        if rel.as_os_str().is_empty() {
            // The root entry carries no content of its own.
            continue;
        }
        let full = dest.join(&rel);

        let base = full.file_name().map(OsStr::as_bytes).unwrap_or_default();
        if is_whiteout_name(base) {
            apply_whiteout(&full, &unpacked)?;
            continue;
        }

        materialize(&mut entry, &header, &full, dest, options)?;

        if header.entry_type() == EntryType::Directory {
            deferred_dirs.push(DeferredDir {
                path: full.clone(),
                atime: header.atime,
                mtime: header.mtime()?,
            });
        }
        unpacked.insert(full);
    }

    // Re-apply directory times now that no more children will land in
    // them.
    for dir in deferred_dirs {
        set_file_times(&dir.path, effective_atime(dir.atime, dir.mtime), dir.mtime)?;
    }
    Ok(())
}

/// Asynchronous wrapper for [`unpack_tar`].
///
/// The stream is consumed on a blocking task; dropping the returned future
/// cancels the unpack at the next entry boundary.
pub async fn unpack(
    src: impl tokio::io::AsyncRead + Send + 'static,
    dest: impl Into<PathBuf>,
    options: UnpackOptions,
) -> Result<()> {
    let dest = dest.into();
    let mut options = options;
    let token = options
        .cancel
        .get_or_insert_with(CancellationToken::new)
        .clone();
    let guard = token.drop_guard();

    let task = tokio::task::spawn_blocking(move || {
        let src = SyncIoBridge::new(Box::pin(src));
        unpack_tar(src, &dest, &options)
    });
    let result = flatten_join(task.await);
    guard.disarm();
    result
}

/// Unpack the layer archive at `layer` into `dest`.
pub fn open_and_unpack(layer: &Path, dest: &Path, options: &UnpackOptions) -> Result<()> {
    let file =
        File::open(layer).map_err(|err| LayerError::FailedOpen(layer.to_owned(), err))?;
    unpack_tar(file, dest, options)
}

/// Unpack the layer archives in order into `dest`.
///
/// Each later layer observes the side effects of the earlier ones, so its
/// whiteouts delete paths the earlier layers materialized.
pub fn open_and_unpack_multi(
    layers: &[impl AsRef<Path>],
    dest: &Path,
    options: &UnpackOptions,
) -> Result<()> {
    for layer in layers {
        open_and_unpack(layer.as_ref(), dest, options)?;
    }
    Ok(())
}

fn effective_atime(atime: Option<i64>, mtime: i64) -> i64 {
    match atime {
        Some(atime) if atime >= mtime => atime,
        _ => mtime,
    }
}

fn apply_whiteout(full: &Path, unpacked: &HashSet<PathBuf>) -> Result<()> {
    let base = full.file_name().map(OsStr::as_bytes).unwrap_or_default();
    if base == WHITEOUT_OPAQUE_DIR.as_bytes() {
        let Some(parent) = full.parent() else {
            return Ok(());
        };
        match lstat(parent) {
            Err(Errno::NOENT) => return Ok(()),
            Err(errno) => return Err(errno.into()),
            Ok(_) => {}
        }
        debug!("opaque directory: clearing lower-layer content of {parent:?}");
        return remove_unexpected(parent, unpacked).map_err(LayerError::Io);
    }

    // Remaining `.wh..wh.` names are AUFS bookkeeping (the `.wh..wh.plnk`
    // hardlink directory), not deletions of `.wh.`-prefixed files.
    if base.starts_with(WHITEOUT_META_PREFIX.as_bytes()) {
        debug!("skipping aufs metadata entry {full:?}");
        return Ok(());
    }

    let stripped = &base[WHITEOUT_PREFIX.len()..];
    let original = full.with_file_name(OsStr::from_bytes(stripped));
    debug!("whiteout: removing {original:?}");
    remove_all(&original).map_err(LayerError::Io)
}

// Delete everything under `dir` that the current stream did not create.
// A subtree whose root is foreign goes as a whole.
fn remove_unexpected(dir: &Path, unpacked: &HashSet<PathBuf>) -> io::Result<()> {
    for child in std::fs::read_dir(dir)? {
        let child = child?;
        let path = child.path();
        if !unpacked.contains(&path) {
            remove_all(&path)?;
        } else if child.file_type()?.is_dir() {
            remove_unexpected(&path, unpacked)?;
        }
    }
    Ok(())
}

fn materialize(
    body: &mut impl Read,
    header: &EntryHeader,
    full: &Path,
    dest: &Path,
    options: &UnpackOptions,
) -> Result<()> {
    let mode = header.mode()? & 0o7777;
    match header.entry_type() {
        EntryType::Directory => create_directory(full, mode)?,
        EntryType::Regular | EntryType::Continuous => create_file(full, mode, body)?,
        EntryType::Symlink => create_symlink(full, header, dest)?,
        EntryType::Link => create_hardlink(full, header, dest)?,
        EntryType::Char | EntryType::Block | EntryType::Fifo => {
            create_special(full, header, mode)?
        }
        _ => return Err(LayerError::UnknownHeader(full.to_owned())),
    }
    restore_metadata(full, header, dest, options)
}

fn create_directory(path: &Path, mode: u32) -> Result<()> {
    match directory_exists(path) {
        // A non-directory in the way is fatal; an existing directory is
        // normal when a later layer re-states one.
        Err(LayerError::PathIsNotDirectory(_)) => {
            return Err(LayerError::DirectoryExists(path.to_owned()))
        }
        Err(other) => return Err(other),
        Ok(_) => {}
    }
    match mkdir(path, mode.into()) {
        Ok(()) | Err(Errno::EXIST) => Ok(()),
        Err(errno) => Err(LayerError::DirectoryCreateFailed(
            path.to_owned(),
            errno.into(),
        )),
    }
}

fn create_file(path: &Path, mode: u32, body: &mut impl Read) -> Result<()> {
    // A stale symlink or device node from an earlier layer must not be
    // written through; replace it like the other materializers do.
    remove_all(path)?;
    let fd = openat(
        CWD,
        path,
        OFlags::CREATE | OFlags::WRONLY | OFlags::TRUNC | OFlags::CLOEXEC,
        mode.into(),
    )
    .map_err(|errno| LayerError::FailedOpen(path.to_owned(), errno.into()))?;
    let mut file = File::from(fd);
    io::copy(body, &mut file).map_err(|err| LayerError::FailedWrite(path.to_owned(), err))?;
    Ok(())
}

fn create_symlink(path: &Path, header: &EntryHeader, dest: &Path) -> Result<()> {
    let Some(target) = header.link_target.as_deref() else {
        return Err(LayerError::InvalidSymlink(path.to_owned()));
    };
    let parent = path.parent().unwrap_or(dest);
    let resolved = lexical_join(parent, target);
    if !contained(&resolved, dest) {
        return Err(LayerError::InvalidSymlink(target.to_owned()));
    }
    remove_all(path)?;
    symlinkat(target, CWD, path)?;
    Ok(())
}

fn create_hardlink(path: &Path, header: &EntryHeader, dest: &Path) -> Result<()> {
    let Some(target) = header.link_target.as_deref() else {
        return Err(LayerError::InvalidHardlink(path.to_owned()));
    };
    let resolved = lexical_join(dest, target);
    if !contained(&resolved, dest) {
        return Err(LayerError::InvalidHardlink(target.to_owned()));
    }
    // The link target must already have been materialized.
    if lstat(&resolved).is_err() {
        return Err(LayerError::InvalidHardlink(target.to_owned()));
    }
    remove_all(path)?;
    linkat(CWD, &resolved, CWD, path, AtFlags::empty())?;
    Ok(())
}

fn create_special(path: &Path, header: &EntryHeader, mode: u32) -> Result<()> {
    let file_type = match header.entry_type() {
        EntryType::Char => FileType::CharacterDevice,
        EntryType::Block => FileType::BlockDevice,
        _ => FileType::Fifo,
    };
    let (major, minor) = header.device()?;
    remove_all(path)?;
    mknodat(CWD, path, file_type, mode.into(), makedev(major, minor))?;
    Ok(())
}

fn restore_metadata(
    full: &Path,
    header: &EntryHeader,
    dest: &Path,
    options: &UnpackOptions,
) -> Result<()> {
    let entry_type = header.entry_type();

    if !options.no_chown {
        chownat(
            CWD,
            full,
            Some(Uid::from_raw(header.uid()?)),
            Some(Gid::from_raw(header.gid()?)),
            AtFlags::SYMLINK_NOFOLLOW,
        )?;
    }

    // After chown, which clears security.capability.
    for (name, value) in &header.xattrs {
        match lsetxattr(full, name.as_os_str(), value, XattrFlags::empty()) {
            Ok(()) => {}
            Err(Errno::NOTSUP) => {
                warn!("cannot apply xattr {name:?} to {full:?}: not supported");
            }
            Err(errno) => return Err(errno.into()),
        }
    }

    // POSIX gives symlinks no mode of their own; hardlinks share their
    // target's, unless the target turned out to be a symlink.
    match entry_type {
        EntryType::Symlink => {}
        EntryType::Link => {
            if hardlink_target_is_regular(header, dest) {
                chmod(full, (header.mode()? & 0o7777).into())?;
            }
        }
        _ => chmod(full, (header.mode()? & 0o7777).into())?,
    }

    let mtime = header.mtime()?;
    let atime = effective_atime(header.atime, mtime);
    match entry_type {
        EntryType::Symlink => match lset_times(full, Some(atime), mtime) {
            Err(LayerError::SyscallNotImplemented(path)) => {
                warn!("cannot set times on {path:?}: utimensat not implemented");
            }
            other => other?,
        },
        EntryType::Link => {
            if hardlink_target_is_regular(header, dest) {
                set_file_times(full, atime, mtime)?;
            }
        }
        _ => set_file_times(full, atime, mtime)?,
    }
    Ok(())
}

fn hardlink_target_is_regular(header: &EntryHeader, dest: &Path) -> bool {
    let Some(target) = header.link_target.as_deref() else {
        return false;
    };
    match lstat(&lexical_join(dest, target)) {
        Ok(stat) => FileType::from_raw_mode(stat.st_mode) != FileType::Symlink,
        Err(_) => false,
    }
}
