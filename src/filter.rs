//! Streaming tar filtering.
//!
//! A [`TarFilter`] sees every entry header of an input archive and decides
//! what reaches the output: the pump loop in [`filter_tar`] reads entries,
//! hands each header to the filter for in-place rewriting, and copies the
//! body bytes for entries the filter lets through. Filters may also write
//! additional headers of their own, which is how look-ahead filters release
//! entries they buffered.
//!
//! [`filter`] runs the same pump as one producer stage over a byte pipe and
//! hands back the read end immediately; stages compose by chaining their
//! pipes.

use std::future::Future;
use std::io::{BufReader, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use crate::entry::{EntryHeader, TarWriter};
use crate::error::{LayerError, Result};

// Matches the duplex pipe capacity used between a blocking tar producer
// and its async consumer elsewhere in the containers ecosystem.
const PIPE_CAPACITY: usize = 8192;

/// What the pump should emit for the entry a filter just handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emit {
    /// Write the (possibly rewritten) header to the output.
    pub header: bool,
    /// Copy the entry's body bytes to the output.
    pub body: bool,
}

impl Emit {
    /// Emit header and body.
    pub const ALL: Emit = Emit {
        header: true,
        body: true,
    };
    /// Emit the header only, discarding any body.
    pub const HEADER: Emit = Emit {
        header: true,
        body: false,
    };
    /// Emit nothing for this entry.
    pub const NONE: Emit = Emit {
        header: false,
        body: false,
    };
}

/// A per-entry transformation over a tar stream.
///
/// The output writer is owned by the pump loop and lent to the filter, so
/// `handle` can write headers of its own (withheld directories, synthesized
/// whiteout markers) in addition to steering the current entry via the
/// returned [`Emit`] flags.
pub trait TarFilter<W: Write> {
    /// Called exactly once, before any entry. Fails if the filter is
    /// already in use by another pipeline.
    fn attach(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle one entry. May mutate `entry` in place and may write entries
    /// to `out` independently of the returned flags.
    fn handle(&mut self, entry: &mut EntryHeader, out: &mut TarWriter<W>) -> Result<Emit>;

    /// Called once after the last entry, before the archive is terminated.
    fn close(&mut self, out: &mut TarWriter<W>) -> Result<()> {
        let _ = out;
        Ok(())
    }
}

/// Pump `src` through `filter` into `dest`.
///
/// This is the synchronous stage core; [`filter`] wraps it in a producer
/// task. The output archive is terminated on success, after the filter's
/// `close` ran.
pub fn filter_tar<W: Write>(
    src: impl Read,
    dest: W,
    filter: &mut impl TarFilter<W>,
) -> Result<()> {
    let mut archive = tar::Archive::new(BufReader::new(src));
    let mut out = TarWriter::new(dest);

    filter.attach()?;
    for entry in archive.entries().map_err(LayerError::Read)? {
        let mut entry = entry.map_err(LayerError::Read)?;
        let mut header = EntryHeader::from_entry(&mut entry)?;

        let emit = filter.handle(&mut header, &mut out)?;
        if !emit.header {
            continue;
        }
        if emit.body && header.size()? > 0 {
            out.write_entry(&header, &mut entry)?;
        } else {
            out.write_header(&header)?;
        }
    }
    filter.close(&mut out)?;
    out.finish()
}

/// The write end of a filter stage's byte pipe.
pub type PipeWriter = SyncIoBridge<DuplexStream>;

/// Run `filter` over `src` as one producer stage and return the filtered
/// tar stream.
///
/// The read end is returned immediately; one blocking producer task pumps
/// entries behind it. A stage error is surfaced on the consumer's next
/// read once the pipe drains. Dropping the reader closes the pipe, which
/// terminates the producer on its next write.
///
/// Must be called from within a tokio runtime.
pub fn filter<R, F>(src: R, mut filter: F) -> FilteredReader
where
    R: tokio::io::AsyncRead + Send + 'static,
    F: TarFilter<PipeWriter> + Send + 'static,
{
    let (tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
    let producer = tokio::task::spawn_blocking(move || {
        let src = SyncIoBridge::new(Box::pin(src));
        let dest = SyncIoBridge::new(tx);
        filter_tar(src, dest, &mut filter)
    });
    FilteredReader {
        pipe: rx,
        producer: Some(producer),
    }
}

/// Read end of a filter stage.
///
/// Reads like any other stream of tar bytes. When the pipe drains, the
/// producer's result is joined and its error, if any, is returned from the
/// read that observed end-of-stream.
pub struct FilteredReader {
    pipe: DuplexStream,
    producer: Option<JoinHandle<Result<()>>>,
}

impl AsyncRead for FilteredReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let filled_before = buf.filled().len();
        match Pin::new(&mut this.pipe).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == filled_before => {
                // End of pipe: surface the producer's fate exactly once.
                let Some(producer) = this.producer.as_mut() else {
                    return Poll::Ready(Ok(()));
                };
                match Pin::new(producer).poll(cx) {
                    Poll::Ready(joined) => {
                        this.producer = None;
                        match crate::error::flatten_join(joined) {
                            Ok(()) => Poll::Ready(Ok(())),
                            Err(err) => Poll::Ready(Err(std::io::Error::other(err))),
                        }
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            other => other,
        }
    }
}
