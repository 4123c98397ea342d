//! Platform filesystem helpers.
//!
//! Small wrappers over the raw syscalls the packer and unpacker need:
//! symlink-aware time setting, destination probing, capability xattr
//! reading, and the lexical path arithmetic used for containment checks.

use std::fs;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use rustix::fs::{getxattr, lstat, utimensat, AtFlags, FileType, Timespec, Timestamps, CWD};
use rustix::io::Errno;

use crate::error::{LayerError, Result};

pub(crate) const SECURITY_CAPABILITY_XATTR: &str = "security.capability";

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// `tv_nsec` value that makes utimensat leave a timestamp untouched.
const UTIME_OMIT_NSEC: i64 = (1 << 30) - 2;

/// The latest file time the platform can represent, in whole seconds.
///
/// With a 64-bit `tv_nsec` the limiting factor is the nanosecond range of
/// the kernel interfaces; with a 32-bit timespec it is the second counter
/// itself.
static MAX_FILE_TIME: Lazy<i64> = Lazy::new(|| {
    let probe = Timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if std::mem::size_of_val(&probe.tv_nsec) == 8 {
        i64::MAX / NANOS_PER_SEC
    } else {
        i32::MAX as i64
    }
});

/// Clamp a file time to `[unix epoch, MAX_FILE_TIME]`.
///
/// Out-of-range values collapse to the epoch, where the behavior of the
/// time-setting syscalls is defined.
pub(crate) fn clamp_file_time(secs: i64) -> i64 {
    if secs < 0 || secs > *MAX_FILE_TIME {
        0
    } else {
        secs
    }
}

fn timespec(secs: i64) -> Timespec {
    Timespec {
        tv_sec: secs as _,
        tv_nsec: 0,
    }
}

/// Reports whether `path` is a directory.
///
/// Returns `Ok(true)` for a directory, `Ok(false)` for a missing path, and
/// [`LayerError::PathIsNotDirectory`] when something else sits there.
pub fn directory_exists(path: &Path) -> Result<bool> {
    match lstat(path) {
        Ok(stat) => {
            if FileType::from_raw_mode(stat.st_mode) == FileType::Directory {
                Ok(true)
            } else {
                Err(LayerError::PathIsNotDirectory(path.to_owned()))
            }
        }
        Err(_) => Ok(false),
    }
}

/// Set access and modification times without following symlinks.
///
/// A missing access time is left untouched via `UTIME_OMIT`. Kernels that
/// do not implement `utimensat` surface [`LayerError::SyscallNotImplemented`],
/// which the unpacker treats as non-fatal.
pub fn lset_times(path: &Path, atime: Option<i64>, mtime: i64) -> Result<()> {
    let times = Timestamps {
        last_access: match atime {
            Some(secs) => timespec(clamp_file_time(secs)),
            None => Timespec {
                tv_sec: 0,
                tv_nsec: UTIME_OMIT_NSEC as _,
            },
        },
        last_modification: timespec(clamp_file_time(mtime)),
    };
    match utimensat(CWD, path, &times, AtFlags::SYMLINK_NOFOLLOW) {
        Ok(()) => Ok(()),
        Err(Errno::NOSYS) => Err(LayerError::SyscallNotImplemented(path.to_owned())),
        Err(errno) => Err(errno.into()),
    }
}

/// Set access and modification times, following symlinks, clamped.
pub(crate) fn set_file_times(path: &Path, atime: i64, mtime: i64) -> Result<()> {
    let times = Timestamps {
        last_access: timespec(clamp_file_time(atime)),
        last_modification: timespec(clamp_file_time(mtime)),
    };
    utimensat(CWD, path, &times, AtFlags::empty())?;
    Ok(())
}

/// Formats a string like "/proc/self/fd/3" for the given fd, for kernel
/// APIs that don't directly accept file descriptors.
pub(crate) fn proc_self_fd(fd: impl AsFd) -> String {
    format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())
}

/// Read the `security.capability` xattr of the object behind `fd`, if any.
///
/// Goes via /proc/self/fd so that O_PATH fds work.
pub(crate) fn capability_xattr(fd: impl AsFd) -> Result<Option<Box<[u8]>>> {
    let mut buffer = [MaybeUninit::new(0u8); 65536];
    match getxattr(proc_self_fd(fd), SECURITY_CAPABILITY_XATTR, &mut buffer) {
        Ok((value, _)) => Ok(Some(Box::from(&*value))),
        Err(Errno::NODATA) | Err(Errno::NOTSUP) => Ok(None),
        Err(errno) => Err(errno.into()),
    }
}

/// Remove a path of any type, recursively for directories. A missing path
/// is not an error.
pub(crate) fn remove_all(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => return ignore_not_found(err),
    };
    result.or_else(ignore_not_found)
}

fn ignore_not_found(err: io::Error) -> io::Result<()> {
    if err.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(err)
    }
}

/// Lexically normalize a path: drop `.`, resolve `..` against preceding
/// components. Leading `..` components of a relative path are kept; a
/// rooted path never climbs above the root.
pub(crate) fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut rooted = false;
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::RootDir => {
                out.push(Component::RootDir);
                rooted = true;
            }
            Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !rooted {
                    out.push(Component::ParentDir);
                }
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    out
}

/// Normalize a tar entry name into a path relative to the destination.
///
/// Leading roots and `.` are dropped. Returns `None` for names that try to
/// climb out with `..` — those never describe layer content.
pub(crate) fn entry_rel_path(name: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in name.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

/// Resolve `path` against `base` the way a filesystem would, but lexically:
/// an absolute `path` wins, a relative one is joined and cleaned.
pub(crate) fn lexical_join(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        lexical_clean(path)
    } else {
        lexical_clean(&base.join(path))
    }
}

/// Containment: `path` equals `root` or has it as a directory prefix.
pub(crate) fn contained(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Express `target` relative to the directory `base` (both cleaned and of
/// the same rootedness), `..`-stepping out of the non-shared prefix.
pub(crate) fn relative_to(base: &Path, target: &Path) -> PathBuf {
    let mut base_parts = base.components().peekable();
    let mut target_parts = target.components().peekable();
    while let (Some(b), Some(t)) = (base_parts.peek(), target_parts.peek()) {
        if b != t {
            break;
        }
        base_parts.next();
        target_parts.next();
    }
    let mut out = PathBuf::new();
    for _ in base_parts {
        out.push(Component::ParentDir);
    }
    for part in target_parts {
        out.push(part);
    }
    if out.as_os_str().is_empty() {
        out.push(Component::CurDir);
    }
    out
}
