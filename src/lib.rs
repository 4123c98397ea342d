//! Tar manipulation for container image layers.
//!
//! Layer tarballs are ordinary POSIX tar streams with two extra
//! dialects layered on top: the AUFS whiteout convention used by the OCI
//! layer format (`.wh.` name markers) and the OverlayFS convention used by
//! the kernel (0:0 character devices and `trusted.overlay.opaque` xattrs).
//! This crate translates between the two, and packs and unpacks layer
//! trees faithfully — ownership, mode, xattrs, timestamps, hard links,
//! symlinks and device nodes included.
//!
//! The building blocks:
//!
//! - [`filter::filter`] streams a tar through a per-entry
//!   [`filter::TarFilter`] and hands back the filtered stream; stages
//!   chain by feeding one reader into the next.
//! - [`whiteout::OverlayWhiteoutFilter`] and
//!   [`whiteout::AufsWhiteoutFilter`] are the two translation filters;
//!   chaining both reproduces the input byte for byte.
//! - [`pack::pack`] walks a directory into a layer tar;
//!   [`unpack::unpack`] materializes one into a destination, enforcing
//!   that link targets stay inside it and honoring whiteout deletions
//!   across layers ([`unpack::open_and_unpack_multi`]).
//!
//! Compression, digests and manifest handling are the caller's business:
//! everything here speaks plain tar bytes. Linux only.

pub mod entry;
pub mod error;
pub mod filter;
pub mod fs;
pub mod pack;
pub mod unpack;
pub mod whiteout;

pub use entry::{EntryHeader, TarWriter};
pub use error::{LayerError, Result};
pub use filter::{filter, filter_tar, Emit, FilteredReader, TarFilter};
pub use pack::{pack, pack_tar};
pub use unpack::{open_and_unpack, open_and_unpack_multi, unpack, unpack_tar, UnpackOptions};
pub use whiteout::{AufsWhiteoutFilter, OverlayWhiteoutFilter};
