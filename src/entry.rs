//! Tar entry headers as values.
//!
//! [`EntryHeader`] is the canonical record exchanged between pipeline
//! stages: the raw tar header plus the fields the raw header cannot carry
//! on its own — the untruncated path, the untruncated link target, the
//! xattr map and second-resolution access/change times collected from PAX
//! extension records. Filters receive one per input entry, mutate it in
//! place, and the writer re-emits it with matching PAX records.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use tar::{Builder, EntryType, Header};

use crate::error::{LayerError, Result};

// PAX extension key prefix for extended attributes.
const PAX_SCHILY_XATTR: &str = "SCHILY.xattr.";

/// A tar entry header with its PAX-carried side data.
#[derive(Debug, Clone)]
pub struct EntryHeader {
    /// The raw wire header: typeflag, mode, uid, gid, size, mtime, devices.
    pub header: Header,
    /// Entry path, verbatim (long names already resolved).
    pub path: PathBuf,
    /// Symlink or hardlink target, verbatim.
    pub link_target: Option<PathBuf>,
    /// Extended attributes, from `SCHILY.xattr.*` PAX records.
    pub xattrs: BTreeMap<OsString, Box<[u8]>>,
    /// Access time in whole seconds, from the `atime` PAX record.
    pub atime: Option<i64>,
    /// Change time in whole seconds, from the `ctime` PAX record.
    pub ctime: Option<i64>,
}

impl EntryHeader {
    /// Capture the header of a freshly read archive entry.
    pub fn from_entry<R: Read>(entry: &mut tar::Entry<R>) -> Result<Self> {
        let header = entry.header().clone();
        // entry.path() resolves GNU long names and PAX paths; the raw
        // header field is truncated to 100 bytes.
        let path = entry.path().map_err(LayerError::Read)?.into_owned();
        let link_target = entry
            .link_name()
            .map_err(LayerError::Read)?
            .map(|target| target.into_owned());

        let mut xattrs = BTreeMap::new();
        let mut atime = None;
        let mut ctime = None;
        if let Some(extensions) = entry.pax_extensions().map_err(LayerError::Read)? {
            for extension in extensions {
                let extension = extension.map_err(LayerError::Read)?;
                let Ok(key) = extension.key() else {
                    continue;
                };
                if let Some(name) = key.strip_prefix(PAX_SCHILY_XATTR) {
                    xattrs.insert(OsString::from(name), Box::from(extension.value_bytes()));
                } else if key == "atime" {
                    atime = parse_pax_time(extension.value_bytes());
                } else if key == "ctime" {
                    ctime = parse_pax_time(extension.value_bytes());
                }
            }
        }

        Ok(EntryHeader {
            header,
            path,
            link_target,
            xattrs,
            atime,
            ctime,
        })
    }

    pub fn entry_type(&self) -> EntryType {
        self.header.entry_type()
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.header.size()?)
    }

    pub fn mode(&self) -> Result<u32> {
        Ok(self.header.mode()?)
    }

    pub fn uid(&self) -> Result<u32> {
        Ok(self.header.uid()? as u32)
    }

    pub fn gid(&self) -> Result<u32> {
        Ok(self.header.gid()? as u32)
    }

    pub fn mtime(&self) -> Result<i64> {
        Ok(self.header.mtime()? as i64)
    }

    /// Device major/minor numbers; entries without device fields read as 0.
    pub fn device(&self) -> Result<(u32, u32)> {
        let major = self.header.device_major()?.unwrap_or(0);
        let minor = self.header.device_minor()?.unwrap_or(0);
        Ok((major, minor))
    }

    /// Blank the raw device number fields.
    ///
    /// Tar writers leave these fields empty for non-device entries, so a
    /// header rewritten from a device type must drop them to serialize the
    /// same as one that was never a device.
    pub fn clear_device_fields(&mut self) {
        if let Some(ustar) = self.header.as_ustar_mut() {
            ustar.dev_major = [0; 8];
            ustar.dev_minor = [0; 8];
        } else if let Some(gnu) = self.header.as_gnu_mut() {
            gnu.dev_major = [0; 8];
            gnu.dev_minor = [0; 8];
        }
    }

    fn pax_records(&self) -> Vec<(String, Vec<u8>)> {
        let mut records = Vec::new();
        if let Some(atime) = self.atime {
            records.push(("atime".to_string(), atime.to_string().into_bytes()));
        }
        if let Some(ctime) = self.ctime {
            records.push(("ctime".to_string(), ctime.to_string().into_bytes()));
        }
        for (name, value) in &self.xattrs {
            let key = format!("{}{}", PAX_SCHILY_XATTR, name.to_string_lossy());
            records.push((key, value.to_vec()));
        }
        records
    }
}

fn clear_name_fields(header: &mut Header) {
    if let Some(ustar) = header.as_ustar_mut() {
        ustar.name = [0; 100];
        ustar.prefix = [0; 155];
        ustar.linkname = [0; 100];
    } else if let Some(gnu) = header.as_gnu_mut() {
        gnu.name = [0; 100];
        gnu.linkname = [0; 100];
    } else {
        let old = header.as_old_mut();
        old.name = [0; 100];
        old.linkname = [0; 100];
    }
}

fn parse_pax_time(value: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(value).ok()?;
    let seconds = text.split('.').next()?;
    seconds.parse().ok()
}

/// PAX-aware tar output stream.
///
/// Wraps [`tar::Builder`], emitting each [`EntryHeader`]'s side data as a
/// PAX extension entry ahead of the real one and routing link entries
/// through the long-linkname-safe append path.
pub struct TarWriter<W: Write> {
    inner: Builder<W>,
}

impl<W: Write> TarWriter<W> {
    pub fn new(dest: W) -> Self {
        TarWriter {
            inner: Builder::new(dest),
        }
    }

    /// Write a header with no body bytes.
    pub fn write_header(&mut self, entry: &EntryHeader) -> Result<()> {
        self.write(entry, io::empty())
    }

    /// Write a header followed by its body, read exactly from `body`.
    pub fn write_entry(&mut self, entry: &EntryHeader, body: impl Read) -> Result<()> {
        self.write(entry, body)
    }

    fn write(&mut self, entry: &EntryHeader, body: impl Read) -> Result<()> {
        let records = entry.pax_records();
        if !records.is_empty() {
            self.inner
                .append_pax_extensions(records.iter().map(|(key, value)| (key.as_str(), value.as_slice())))?;
        }

        let mut header = entry.header.clone();
        // The append APIs overwrite the name fields in place without
        // clearing them; a path shorter than the original would keep its
        // stale tail.
        clear_name_fields(&mut header);
        match entry.entry_type() {
            EntryType::Symlink => {
                let target = entry
                    .link_target
                    .as_deref()
                    .ok_or_else(|| LayerError::InvalidSymlink(entry.path.clone()))?;
                self.inner.append_link(&mut header, &entry.path, target)?;
            }
            EntryType::Link => {
                let target = entry
                    .link_target
                    .as_deref()
                    .ok_or_else(|| LayerError::InvalidHardlink(entry.path.clone()))?;
                self.inner.append_link(&mut header, &entry.path, target)?;
            }
            _ => self.inner.append_data(&mut header, &entry.path, body)?,
        }
        Ok(())
    }

    /// Terminate the archive. Further writes are an error.
    pub fn finish(&mut self) -> Result<()> {
        Ok(self.inner.finish()?)
    }

    /// Terminate the archive and recover the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        Ok(self.inner.into_inner()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reg_header(size: u64) -> Header {
        let mut header = Header::new_ustar();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        header
    }

    #[test]
    fn test_xattrs_round_trip_through_pax() {
        let mut buffer = Vec::new();
        {
            let mut writer = TarWriter::new(&mut buffer);
            let mut entry = EntryHeader {
                header: reg_header(0),
                path: PathBuf::from("a"),
                link_target: None,
                xattrs: BTreeMap::new(),
                atime: Some(17),
                ctime: Some(23),
            };
            entry
                .xattrs
                .insert(OsString::from("security.capability"), Box::from(&b"\x01\x02"[..]));
            writer.write_header(&entry).unwrap();
            writer.finish().unwrap();
        }

        let mut archive = tar::Archive::new(Cursor::new(buffer));
        let mut entries = archive.entries().unwrap();
        let mut first = entries.next().unwrap().unwrap();
        let read_back = EntryHeader::from_entry(&mut first).unwrap();
        assert_eq!(read_back.path, PathBuf::from("a"));
        assert_eq!(read_back.atime, Some(17));
        assert_eq!(read_back.ctime, Some(23));
        assert_eq!(
            read_back
                .xattrs
                .get(std::ffi::OsStr::new("security.capability"))
                .map(|value| &**value),
            Some(&b"\x01\x02"[..])
        );
    }

    #[test]
    fn test_parse_pax_time() {
        assert_eq!(parse_pax_time(b"1234567890"), Some(1234567890));
        assert_eq!(parse_pax_time(b"1234567890.123456789"), Some(1234567890));
        assert_eq!(parse_pax_time(b"bogus"), None);
    }
}
