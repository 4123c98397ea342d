//! Filter pipeline tests: pass-through fidelity, whiteout translation,
//! and the AUFS → overlay → AUFS round trip.

use std::io::{Cursor, Write};

use sha2::{Digest, Sha256};
use tar::{EntryType, Header};
use tokio::io::AsyncReadExt;

use layertar::{
    filter, filter_tar, AufsWhiteoutFilter, Emit, EntryHeader, OverlayWhiteoutFilter, TarFilter,
    TarWriter,
};

/// Pass-through filter, for testing the pump itself.
#[derive(Default)]
struct NullFilter {
    attached: bool,
}

impl<W: Write> TarFilter<W> for NullFilter {
    fn attach(&mut self) -> layertar::Result<()> {
        if self.attached {
            return Err(layertar::LayerError::AlreadyAttached);
        }
        self.attached = true;
        Ok(())
    }

    fn handle(
        &mut self,
        _entry: &mut EntryHeader,
        _out: &mut TarWriter<W>,
    ) -> layertar::Result<Emit> {
        Ok(Emit::ALL)
    }
}

fn append_simple(builder: &mut tar::Builder<&mut Vec<u8>>, name: &str, kind: EntryType) {
    let mut header = Header::new_ustar();
    header.set_path(name).unwrap();
    header.set_size(0);
    header.set_mode(0o644);
    header.set_entry_type(kind);
    header.set_cksum();
    builder.append(&header, std::io::empty()).unwrap();
}

/// A stream of `num_entries` empty regular files, each followed by a
/// hardlink to it.
fn generate_tar(num_entries: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut builder = tar::Builder::new(&mut bytes);
    for i in 0..num_entries {
        let name = format!("foo{i}");
        append_simple(&mut builder, &name, EntryType::Regular);

        let mut header = Header::new_ustar();
        header.set_path(format!("{name}.lnk")).unwrap();
        header.set_link_name(&name).unwrap();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Link);
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();
    }
    builder.finish().unwrap();
    drop(builder);
    bytes
}

fn build_tar(items: &[(&str, EntryType)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut builder = tar::Builder::new(&mut bytes);
    for (name, kind) in items {
        append_simple(&mut builder, name, *kind);
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

/// The seven-entry AUFS stream used by the translation scenarios.
fn aufs_scenario_tar() -> Vec<u8> {
    build_tar(&[
        ("emptydir", EntryType::Directory),
        ("foo", EntryType::Regular),
        ("bar", EntryType::Directory),
        ("bar/.wh..wh..opq", EntryType::Regular),
        ("boo", EntryType::Directory),
        ("boo/.wh.baz", EntryType::Regular),
        ("lastemptydir", EntryType::Directory),
    ])
}

#[test]
fn test_consume_tar() {
    assert_eq!(read_headers(&generate_tar(25)).len(), 50);
}

#[test]
fn test_null_filter_is_identity() {
    let input = generate_tar(25);
    let mut output = Vec::new();
    filter_tar(
        Cursor::new(input.clone()),
        &mut output,
        &mut NullFilter::default(),
    )
    .unwrap();

    assert_eq!(read_headers(&output).len(), 50);
    assert_eq!(input, output);
}

#[test]
fn test_overlay_filter_passes_dummy_files() {
    let input = generate_tar(25);
    let mut output = Vec::new();
    filter_tar(
        Cursor::new(input),
        &mut output,
        &mut OverlayWhiteoutFilter::new(),
    )
    .unwrap();
    assert_eq!(read_headers(&output).len(), 50);
}

#[tokio::test]
async fn test_filter_returns_streaming_reader() {
    let input = generate_tar(25);
    let mut reader = filter(Cursor::new(input), NullFilter::default());
    let mut output = Vec::new();
    reader.read_to_end(&mut output).await.unwrap();
    assert_eq!(read_headers(&output).len(), 50);
}

#[tokio::test]
async fn test_overlay_whiteout_translation() {
    let mut reader = filter(
        Cursor::new(aufs_scenario_tar()),
        OverlayWhiteoutFilter::new(),
    );
    let mut output = Vec::new();
    reader.read_to_end(&mut output).await.unwrap();

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
        assert_eq!(header.path, std::path::Path::new(name), "entry order mismatch");
        assert_eq!(header.entry_type(), kind);
        let opaque = header
            .xattrs
            .get(std::ffi::OsStr::new("trusted.overlay.opaque"))
            .map(|value| &**value);
        if name == "bar" {
            assert_eq!(opaque, Some(&b"y"[..]));
        } else {
            assert_eq!(opaque, None);
        }
    }
}

#[tokio::test]
async fn test_whiteout_round_trip_hash() {
    let input = aufs_scenario_tar();
    let original_hash = Sha256::digest(&input);

    let overlay = filter(Cursor::new(input), OverlayWhiteoutFilter::new());
    let mut aufs = filter(overlay, AufsWhiteoutFilter::new());

    let mut output = Vec::new();
    aufs.read_to_end(&mut output).await.unwrap();
    let round_tripped_hash = Sha256::digest(&output);

    assert_eq!(
        hex::encode(original_hash),
        hex::encode(round_tripped_hash),
        "original & round-tripped streams must hash the same"
    );
}

#[tokio::test]
async fn test_trailing_empty_directories_flush_sorted() {
    let input = build_tar(&[
        ("zebra", EntryType::Directory),
        ("alpha", EntryType::Directory),
        ("middle", EntryType::Directory),
    ]);
    let mut reader = filter(Cursor::new(input), OverlayWhiteoutFilter::new());
    let mut output = Vec::new();
    reader.read_to_end(&mut output).await.unwrap();

    let names: Vec<_> = read_headers(&output)
        .into_iter()
        .map(|header| header.path)
        .collect();
    assert_eq!(names, ["alpha", "middle", "zebra"].map(std::path::PathBuf::from));
}

#[tokio::test]
async fn test_producer_error_reaches_consumer() {
    // Not a tar stream at all.
    let mut reader = filter(Cursor::new(vec![1u8; 1024]), NullFilter::default());
    let mut output = Vec::new();
    let err = reader.read_to_end(&mut output).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Other);
}
