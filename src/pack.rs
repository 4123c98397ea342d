//! Packing a directory tree into a layer tar stream.
//!
//! The walk is fd-relative and deterministic: siblings are visited in
//! lexicographic order, so packing the same tree twice produces the same
//! entry sequence. Hardlinked files are tracked by `(st_dev, st_ino)` and
//! every occurrence after the first becomes a hardlink entry pointing at
//! the first-seen path. Symlink targets are stored relative to the link's
//! parent directory; `security.capability` is the one xattr captured.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use rustix::fd::OwnedFd;
use rustix::fs::{fstat, major, minor, openat, readlinkat, Dir, FileType, Mode, OFlags, CWD};
use tar::{EntryType, Header};
use tokio_util::io::SyncIoBridge;

use crate::entry::{EntryHeader, TarWriter};
use crate::error::{flatten_join, LayerError, Result};
use crate::fs::{
    capability_xattr, lexical_clean, lexical_join, relative_to, SECURITY_CAPABILITY_XATTR,
};

/// Pack the directory tree at `source` into `dest` as a tar stream.
///
/// The source directory itself is not emitted; unreadable entries abort
/// the walk.
pub fn pack_tar<W: Write>(source: &Path, dest: W) -> Result<()> {
    let source_abs = lexical_clean(&std::path::absolute(source)?);
    let root = openat(
        CWD,
        source,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|errno| LayerError::FailedOpen(source.to_owned(), errno.into()))?;

    let mut packer = Packer {
        writer: TarWriter::new(dest),
        inodes: HashMap::new(),
        source: source_abs,
    };
    packer.pack_directory_contents(&root, Path::new(""))?;
    packer.writer.finish()
}

/// Asynchronous wrapper for [`pack_tar`]; the walk runs on a blocking task
/// bridged to `dest`.
pub async fn pack(
    source: impl Into<PathBuf>,
    dest: impl tokio::io::AsyncWrite + Send + 'static,
) -> Result<()> {
    let source = source.into();
    let task = tokio::task::spawn_blocking(move || {
        let mut dest = SyncIoBridge::new(Box::pin(dest));
        pack_tar(&source, &mut dest)?;
        dest.shutdown()?;
        Ok(())
    });
    flatten_join(task.await)
}

struct Packer<W: Write> {
    writer: TarWriter<W>,
    // First-seen path of every multiply-linked inode.
    inodes: HashMap<(u64, u64), PathBuf>,
    // Absolute source root, for rewriting absolute symlink targets.
    source: PathBuf,
}

impl<W: Write> Packer<W> {
    fn pack_directory_contents(&mut self, dirfd: &OwnedFd, rel: &Path) -> Result<()> {
        let mut children: Vec<(OsString, FileType)> = Vec::new();
        for item in Dir::read_from(dirfd)? {
            let dirent = item?;
            let name = OsStr::from_bytes(dirent.file_name().to_bytes());
            if name == "." || name == ".." {
                continue;
            }
            children.push((name.to_os_string(), dirent.file_type()));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, file_type) in children {
            let rel_child = rel.join(&name);
            if file_type == FileType::Directory {
                self.pack_directory(dirfd, &name, &rel_child)?;
            } else {
                self.pack_leaf(dirfd, &name, &rel_child, file_type)?;
            }
        }
        Ok(())
    }

    fn pack_directory(&mut self, dirfd: &OwnedFd, name: &OsStr, rel: &Path) -> Result<()> {
        let fd = openat(
            dirfd,
            name,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|errno| LayerError::FailedOpen(rel.to_owned(), errno.into()))?;
        let stat = fstat(&fd)?;

        let mut header = base_header(&stat);
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);

        let mut name_with_slash = rel.as_os_str().to_os_string();
        name_with_slash.push("/");
        let entry = EntryHeader {
            header,
            path: PathBuf::from(name_with_slash),
            link_target: None,
            xattrs: capability_map(&fd)?,
            atime: Some(stat.st_atime as i64),
            ctime: Some(stat.st_ctime as i64),
        };
        self.writer.write_header(&entry)?;

        self.pack_directory_contents(&fd, rel)
    }

    fn pack_leaf(
        &mut self,
        dirfd: &OwnedFd,
        name: &OsStr,
        rel: &Path,
        dirent_type: FileType,
    ) -> Result<()> {
        let oflags = match dirent_type {
            FileType::RegularFile => OFlags::RDONLY,
            _ => OFlags::PATH,
        };
        let fd = openat(
            dirfd,
            name,
            oflags | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|errno| LayerError::FailedOpen(rel.to_owned(), errno.into()))?;
        let stat = fstat(&fd)?;
        let file_type = FileType::from_raw_mode(stat.st_mode);
        if file_type != dirent_type {
            return Err(LayerError::Io(std::io::Error::other(format!(
                "file type of {rel:?} changed during walk"
            ))));
        }

        let mut header = base_header(&stat);
        let xattrs = capability_map(&fd)?;
        let atime = Some(stat.st_atime as i64);
        let ctime = Some(stat.st_ctime as i64);

        match file_type {
            FileType::RegularFile => {
                if stat.st_nlink > 1 {
                    let key = (stat.st_dev, stat.st_ino);
                    if let Some(first_path) = self.inodes.get(&key) {
                        header.set_entry_type(EntryType::Link);
                        header.set_size(0);
                        let entry = EntryHeader {
                            header,
                            path: rel.to_owned(),
                            link_target: Some(first_path.clone()),
                            xattrs,
                            atime,
                            ctime,
                        };
                        return self.writer.write_header(&entry);
                    }
                    self.inodes.insert(key, rel.to_owned());
                }
                header.set_entry_type(EntryType::Regular);
                header.set_size(stat.st_size as u64);
                let entry = EntryHeader {
                    header,
                    path: rel.to_owned(),
                    link_target: None,
                    xattrs,
                    atime,
                    ctime,
                };
                self.writer.write_entry(&entry, File::from(fd))
            }
            FileType::Symlink => {
                let target = readlinkat(&fd, "", Vec::new())
                    .map_err(|_| LayerError::InvalidSymlink(rel.to_owned()))?;
                let target = PathBuf::from(OsString::from_vec(target.into_bytes()));
                let link_target = self.normalize_symlink_target(rel, &target)?;
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                let entry = EntryHeader {
                    header,
                    path: rel.to_owned(),
                    link_target: Some(link_target),
                    xattrs,
                    atime,
                    ctime,
                };
                self.writer.write_header(&entry)
            }
            FileType::CharacterDevice | FileType::BlockDevice => {
                header.set_entry_type(if file_type == FileType::CharacterDevice {
                    EntryType::Char
                } else {
                    EntryType::Block
                });
                header.set_size(0);
                header.set_device_major(major(stat.st_rdev))?;
                header.set_device_minor(minor(stat.st_rdev))?;
                let entry = EntryHeader {
                    header,
                    path: rel.to_owned(),
                    link_target: None,
                    xattrs,
                    atime,
                    ctime,
                };
                self.writer.write_header(&entry)
            }
            FileType::Fifo => {
                header.set_entry_type(EntryType::Fifo);
                header.set_size(0);
                let entry = EntryHeader {
                    header,
                    path: rel.to_owned(),
                    link_target: None,
                    xattrs,
                    atime,
                    ctime,
                };
                self.writer.write_header(&entry)
            }
            // Sockets have no tar representation.
            _ => Err(LayerError::UnknownHeader(rel.to_owned())),
        }
    }

    /// Symlink targets are stored relative to the link's parent directory;
    /// absolute targets are rewritten, relative ones normalized.
    fn normalize_symlink_target(&self, rel: &Path, target: &Path) -> Result<PathBuf> {
        if target.as_os_str().is_empty() {
            return Err(LayerError::InvalidSymlink(rel.to_owned()));
        }
        let parent = lexical_clean(&self.source.join(rel))
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| LayerError::InvalidSymlink(rel.to_owned()))?;
        let resolved = lexical_join(&parent, target);
        Ok(relative_to(&parent, &resolved))
    }
}

fn base_header(stat: &rustix::fs::Stat) -> Header {
    let mut header = Header::new_ustar();
    header.set_mode(stat.st_mode & 0o7777);
    header.set_uid(stat.st_uid as u64);
    header.set_gid(stat.st_gid as u64);
    header.set_mtime(stat.st_mtime.max(0) as u64);
    header
}

fn capability_map(fd: &OwnedFd) -> Result<BTreeMap<OsString, Box<[u8]>>> {
    let mut xattrs = BTreeMap::new();
    if let Some(value) = capability_xattr(fd)? {
        xattrs.insert(OsString::from(SECURITY_CAPABILITY_XATTR), value);
    }
    Ok(xattrs)
}
