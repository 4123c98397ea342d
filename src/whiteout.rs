//! Whiteout translation between the AUFS and OverlayFS conventions.
//!
//! Union filesystems mark "this file was deleted in an upper layer" in two
//! incompatible ways. AUFS (and the OCI layer format) uses in-band names: a
//! regular file `.wh.<name>` whites out `<name>`, and `.wh..wh..opq` inside
//! a directory hides everything below it in lower layers. OverlayFS uses
//! out-of-band metadata: a character device with device number 0:0 at the
//! deleted path, and a `trusted.overlay.opaque="y"` xattr on an opaque
//! directory.
//!
//! [`OverlayWhiteoutFilter`] rewrites an AUFS-encoded stream to the overlay
//! encoding; [`AufsWhiteoutFilter`] is its inverse. Chaining both yields
//! the original stream back, byte for byte, for entries both encodings can
//! express.
//!
//! The overlay direction is the interesting one: the AUFS opaque marker is
//! a *child* of the directory it modifies, while overlay wants the xattr on
//! the directory's own header. Directory headers are therefore withheld
//! until the stream shows whether an opaque marker follows. Only headers
//! are buffered; directories carry no body.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tar::EntryType;

use crate::entry::{EntryHeader, TarWriter};
use crate::error::{LayerError, Result};
use crate::filter::{Emit, TarFilter};
use crate::fs::lexical_clean;

/// Basename prefix marking an AUFS whiteout.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Prefix for AUFS metadata entries that are not plain whiteouts.
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";
/// AUFS hardlink auxiliary directory.
pub const WHITEOUT_LINK_DIR: &str = ".wh..wh.plnk";
/// Basename of the AUFS opaque-directory marker.
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";
/// Xattr marking an overlay directory as opaque.
pub const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";
/// Value of [`OVERLAY_OPAQUE_XATTR`] on an opaque directory.
pub const OVERLAY_OPAQUE_XATTR_VALUE: &[u8] = b"y";

/// Whether a basename marks an AUFS whiteout (including the opaque marker).
pub(crate) fn is_whiteout_name(base: &[u8]) -> bool {
    base.starts_with(WHITEOUT_PREFIX.as_bytes())
}

fn nonempty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|parent| !parent.as_os_str().is_empty())
}

/// Rewrites AUFS whiteouts to the overlay encoding.
#[derive(Debug, Default)]
pub struct OverlayWhiteoutFilter {
    // Directory headers waiting for a possible opaque marker, keyed by
    // cleaned path. Sorted iteration doubles as the deterministic flush
    // order.
    withheld: BTreeMap<PathBuf, EntryHeader>,
    attached: bool,
}

impl OverlayWhiteoutFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush_withheld<W: Write>(&mut self, out: &mut TarWriter<W>) -> Result<()> {
        for (_, header) in std::mem::take(&mut self.withheld) {
            out.write_header(&header)?;
        }
        Ok(())
    }
}

impl<W: Write> TarFilter<W> for OverlayWhiteoutFilter {
    fn attach(&mut self) -> Result<()> {
        if self.attached {
            return Err(LayerError::AlreadyAttached);
        }
        self.attached = true;
        Ok(())
    }

    fn handle(&mut self, entry: &mut EntryHeader, out: &mut TarWriter<W>) -> Result<Emit> {
        let name = lexical_clean(&entry.path);

        if entry.entry_type() == EntryType::Directory {
            // Release a still-withheld parent before its subtree.
            if let Some(parent) = nonempty_parent(&name) {
                if let Some(parent_header) = self.withheld.remove(parent) {
                    out.write_header(&parent_header)?;
                }
            }
            self.withheld.insert(name, entry.clone());
            return Ok(Emit::NONE);
        }

        let base = name.file_name().map(OsStr::as_bytes).unwrap_or_default();
        let withheld_parent =
            nonempty_parent(&name).and_then(|parent| self.withheld.remove(parent));
        match withheld_parent {
            Some(mut parent_header) => {
                if base == WHITEOUT_OPAQUE_DIR.as_bytes() {
                    parent_header.xattrs.insert(
                        OsString::from(OVERLAY_OPAQUE_XATTR),
                        Box::from(OVERLAY_OPAQUE_XATTR_VALUE),
                    );
                    out.write_header(&parent_header)?;
                    return Ok(Emit::NONE);
                }
                out.write_header(&parent_header)?;
            }
            None => {
                // The stream has moved past every withheld subtree; no
                // opaque marker can arrive for them anymore.
                self.flush_withheld(out)?;
            }
        }

        if let Some(stripped) = base.strip_prefix(WHITEOUT_PREFIX.as_bytes()) {
            entry.path = name.with_file_name(OsStr::from_bytes(stripped));
            entry.header.set_entry_type(EntryType::Char);
            entry.header.set_device_major(0)?;
            entry.header.set_device_minor(0)?;
            return Ok(Emit::HEADER);
        }

        Ok(Emit::ALL)
    }

    fn close(&mut self, out: &mut TarWriter<W>) -> Result<()> {
        self.flush_withheld(out)
    }
}

/// Rewrites overlay whiteouts back to the AUFS encoding.
#[derive(Debug, Default)]
pub struct AufsWhiteoutFilter {
    attached: bool,
}

impl AufsWhiteoutFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<W: Write> TarFilter<W> for AufsWhiteoutFilter {
    fn attach(&mut self) -> Result<()> {
        if self.attached {
            return Err(LayerError::AlreadyAttached);
        }
        self.attached = true;
        Ok(())
    }

    fn handle(&mut self, entry: &mut EntryHeader, out: &mut TarWriter<W>) -> Result<Emit> {
        match entry.entry_type() {
            EntryType::Char => {
                let (major, minor) = entry.device()?;
                if (major, minor) != (0, 0) {
                    return Ok(Emit::ALL);
                }
                let base = entry.path.file_name().unwrap_or_default();
                let mut marker = OsString::from(WHITEOUT_PREFIX);
                marker.push(base);
                entry.path = entry.path.with_file_name(marker);
                entry.header.set_entry_type(EntryType::Regular);
                entry.header.set_size(0);
                entry.clear_device_fields();
                Ok(Emit::HEADER)
            }
            EntryType::Directory => {
                let opaque = entry
                    .xattrs
                    .get(OsStr::new(OVERLAY_OPAQUE_XATTR))
                    .is_some_and(|value| &**value == OVERLAY_OPAQUE_XATTR_VALUE);
                if opaque {
                    entry.xattrs.remove(OsStr::new(OVERLAY_OPAQUE_XATTR));
                    // The directory itself, then the marker synthesized
                    // from it, so the pair round-trips back to overlay.
                    out.write_header(entry)?;
                    entry.path = entry.path.join(WHITEOUT_OPAQUE_DIR);
                    entry.header.set_entry_type(EntryType::Regular);
                    entry.header.set_size(0);
                }
                Ok(Emit::HEADER)
            }
            _ => Ok(Emit::ALL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::filter_tar;
    use std::io::Cursor;
    use tar::Header;

    fn append_entry(builder: &mut tar::Builder<&mut Vec<u8>>, name: &str, kind: EntryType) {
        let mut header = Header::new_ustar();
        header.set_path(name).unwrap();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_entry_type(kind);
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();
    }

    fn build_tar(items: &[(&str, EntryType)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut builder = tar::Builder::new(&mut bytes);
        for (name, kind) in items {
            append_entry(&mut builder, name, *kind);
        }
        builder.finish().unwrap();
        drop(builder);
        bytes
    }

    fn read_headers(bytes: &[u8]) -> Vec<EntryHeader> {
        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let mut headers = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            headers.push(EntryHeader::from_entry(&mut entry).unwrap());
        }
        headers
    }

    #[test]
    fn test_opaque_translation() {
        let input = build_tar(&[
            ("emptydir", EntryType::Directory),
            ("foo", EntryType::Regular),
            ("bar", EntryType::Directory),
            ("bar/.wh..wh..opq", EntryType::Regular),
            ("boo", EntryType::Directory),
            ("boo/.wh.baz", EntryType::Regular),
            ("lastemptydir", EntryType::Directory),
        ]);

        let mut output = Vec::new();
        filter_tar(
            Cursor::new(input),
            &mut output,
            &mut OverlayWhiteoutFilter::new(),
        )
        .unwrap();

        let headers = read_headers(&output);
        let expected = [
            ("emptydir", EntryType::Directory),
            ("foo", EntryType::Regular),
            ("bar", EntryType::Directory),
            ("boo", EntryType::Directory),
            ("boo/baz", EntryType::Char),
            ("lastemptydir", EntryType::Directory),
        ];
        assert_eq!(headers.len(), expected.len());
        for (header, (name, kind)) in headers.iter().zip(expected) {
            assert_eq!(header.path, Path::new(name));
            assert_eq!(header.entry_type(), kind);
        }

        // Only `bar` carries the opaque xattr.
        for header in &headers {
            let opaque = header.xattrs.get(OsStr::new(OVERLAY_OPAQUE_XATTR));
            if header.path == Path::new("bar") {
                assert_eq!(opaque.map(|value| &**value), Some(&b"y"[..]));
            } else {
                assert_eq!(opaque, None);
            }
        }

        // The whiteout became a 0:0 device.
        let baz = &headers[4];
        assert_eq!(baz.device().unwrap(), (0, 0));
    }

    #[test]
    fn test_toplevel_whiteout_conversion() {
        let input = build_tar(&[(".wh.gone", EntryType::Regular)]);
        let mut output = Vec::new();
        filter_tar(
            Cursor::new(input),
            &mut output,
            &mut OverlayWhiteoutFilter::new(),
        )
        .unwrap();

        let headers = read_headers(&output);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].path, Path::new("gone"));
        assert_eq!(headers[0].entry_type(), EntryType::Char);
    }

    #[test]
    fn test_aufs_rewrites_opaque_directory() {
        let mut opaque_dir = Vec::new();
        {
            let mut writer = TarWriter::new(&mut opaque_dir);
            let mut header = Header::new_ustar();
            header.set_size(0);
            header.set_mode(0o755);
            header.set_entry_type(EntryType::Directory);
            header.set_cksum();
            let mut entry = EntryHeader {
                header,
                path: PathBuf::from("dir"),
                link_target: None,
                xattrs: BTreeMap::new(),
                atime: None,
                ctime: None,
            };
            entry.xattrs.insert(
                OsString::from(OVERLAY_OPAQUE_XATTR),
                Box::from(OVERLAY_OPAQUE_XATTR_VALUE),
            );
            writer.write_header(&entry).unwrap();
            writer.finish().unwrap();
        }

        let mut output = Vec::new();
        filter_tar(
            Cursor::new(opaque_dir),
            &mut output,
            &mut AufsWhiteoutFilter::new(),
        )
        .unwrap();

        let headers = read_headers(&output);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].path, Path::new("dir"));
        assert_eq!(headers[0].entry_type(), EntryType::Directory);
        assert!(headers[0].xattrs.is_empty());
        assert_eq!(headers[1].path, Path::new("dir/.wh..wh..opq"));
        assert_eq!(headers[1].entry_type(), EntryType::Regular);
        assert_eq!(headers[1].size().unwrap(), 0);
    }

    #[test]
    fn test_double_attach_fails() {
        let mut filter = OverlayWhiteoutFilter::new();
        TarFilter::<Vec<u8>>::attach(&mut filter).unwrap();
        assert!(matches!(
            TarFilter::<Vec<u8>>::attach(&mut filter),
            Err(LayerError::AlreadyAttached)
        ));
    }
}
