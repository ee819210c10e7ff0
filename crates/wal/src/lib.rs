//! # WAL: write-ahead log
//!
//! Provides crash-safe durability for the ShoalDB storage engine.
//!
//! Every write batch is appended to the WAL **before** it is applied to the
//! mutable stage, and the manifest reuses the same framing for its version
//! edits. On restart the log is replayed; a torn tail left by a crash is
//! discarded, while damage in the middle of the stream is reported.
//!
//! ## Binary Record Format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][body ...]
//! ```
//!
//! `record_len` includes the 4-byte CRC but **not** itself. The body is an
//! opaque byte string owned by the caller.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wal::{WalReader, WalWriter};
//!
//! let mut w = WalWriter::create("000001.log", true).unwrap();
//! w.append(b"batch bytes").unwrap();
//! drop(w);
//!
//! let mut r = WalReader::open("000001.log").unwrap();
//! let summary = r.replay(|rec| println!("{} bytes", rec.len())).unwrap();
//! assert_eq!(summary.records, 1);
//! ```

use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

/// Size of the frame header: `record_len` + `crc32`.
pub const HEADER_BYTES: usize = 8;

/// Largest record body accepted on replay (64 MiB). Anything bigger is
/// treated as a damaged length field.
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A damaged record followed by intact ones: not a crash-torn tail.
    #[error("corrupt record at offset {offset}")]
    Corrupt { offset: u64 },
}

/// What a replay saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Complete, checksum-valid records handed to the callback.
    pub records: u64,
    /// Bytes discarded as a crash-torn tail.
    pub dropped_bytes: u64,
}

/// Append-only WAL writer.
///
/// Records are framed and CRC-checksummed in an in-memory buffer, then
/// written with a single `write_all`. When `sync` is `true`, every append is
/// followed by `sync_data()` so the record is durable before the call
/// returns; otherwise the caller decides when to [`sync`](WalWriter::sync).
pub struct WalWriter {
    file: BufWriter<File>,
    sync: bool,
    /// Byte offset of the end of the last appended record.
    position: u64,
    /// Reusable scratch buffer to avoid allocation on every append.
    buf: Vec<u8>,
}

impl WalWriter {
    /// Opens (or creates) a WAL file in append mode.
    ///
    /// # Arguments
    ///
    /// * `path` - file system path for the WAL (created if it does not exist).
    /// * `sync` - if true, every `append` call is followed by an fsync.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let position = file.metadata()?.len();
        Ok(Self {
            file: BufWriter::new(file),
            sync,
            position,
            buf: Vec::with_capacity(256),
        })
    }

    /// Frames `body` and appends it to the WAL file.
    ///
    /// Returns the file offset just past the new record.
    ///
    /// Layout:
    /// [record_len: u32 LE][crc32: u32 LE][body bytes...]
    pub fn append(&mut self, body: &[u8]) -> Result<u64, WalError> {
        // record_len = body.len() + 4 (CRC), must fit the replay cap
        let record_len = (body.len() as u64) + 4;
        if body.is_empty() || record_len > u64::from(MAX_RECORD_SIZE) {
            return Err(WalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("WAL record size {} out of range", body.len()),
            )));
        }

        let mut hasher = Crc32::new();
        hasher.update(body);
        let crc = hasher.finalize();

        self.buf.clear();
        self.buf.extend_from_slice(&(record_len as u32).to_le_bytes());
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf.extend_from_slice(body);

        // Single write call for the entire frame
        self.file.write_all(&self.buf)?;
        self.file.flush()?;

        if self.sync {
            self.file.get_ref().sync_data()?;
        }

        self.position += self.buf.len() as u64;
        Ok(self.position)
    }

    /// Forces everything appended so far to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Byte offset of the end of the log.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }
}

/// Outcome of decoding one frame.
enum Frame {
    /// Complete record with a valid checksum, and its total framed length.
    Valid(usize),
    /// Not enough bytes left for the frame the header announces.
    Truncated,
    /// Implausible length field.
    BadLength,
    /// The whole frame is present but its checksum is wrong; carries the
    /// framed length the header announced.
    BadChecksum(usize),
}

/// Decodes the frame starting at `data[0]`, copying the body into `body`.
fn decode_frame(data: &[u8], body: &mut Vec<u8>) -> Frame {
    if data.len() < HEADER_BYTES {
        return Frame::Truncated;
    }
    let mut hdr = &data[..HEADER_BYTES];
    // Reading from an 8-byte slice cannot fail.
    let record_len = hdr.read_u32::<LittleEndian>().unwrap_or(0);
    let crc = hdr.read_u32::<LittleEndian>().unwrap_or(0);

    // Empty bodies are never written, so `record_len == 4` is damage too.
    if record_len <= 4 || record_len > MAX_RECORD_SIZE {
        return Frame::BadLength;
    }
    let body_len = (record_len - 4) as usize;
    if data.len() < HEADER_BYTES + body_len {
        return Frame::Truncated;
    }
    let candidate = &data[HEADER_BYTES..HEADER_BYTES + body_len];
    let mut hasher = Crc32::new();
    hasher.update(candidate);
    if hasher.finalize() != crc {
        return Frame::BadChecksum(HEADER_BYTES + body_len);
    }
    body.clear();
    body.extend_from_slice(candidate);
    Frame::Valid(HEADER_BYTES + body_len)
}

/// Sequential WAL reader that yields valid records.
///
/// The reader is generic over any `Read` implementor, allowing it to be used
/// with real files (`WalReader<File>`) or in-memory buffers for testing.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
}

impl WalReader<File> {
    /// Opens an existing WAL file for sequential replay.
    ///
    /// Returns `WalError::Io` if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader {
            rdr: BufReader::new(f),
        })
    }
}

impl<R: Read> WalReader<R> {
    /// Constructs a reader from any `Read` implementor.
    ///
    /// Useful for unit tests that supply an in-memory buffer (e.g., `Cursor<Vec<u8>>`).
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Replays every valid record in the WAL, calling `apply` for each one.
    ///
    /// # Termination
    ///
    /// - **Clean EOF** -> `Ok`.
    /// - **Truncated tail** (partial record at end, e.g. crash mid-write) ->
    ///   `Ok` after yielding all complete records before it.
    /// - **Bad checksum or length with nothing valid after it** -> torn
    ///   tail, same as above. After a checksum failure the search starts
    ///   past the frame the header announced.
    /// - **Bad or short record followed by a valid record** -> `Err(WalError::Corrupt)`
    ///   without calling `apply` for anything past the damage.
    /// - **I/O error** -> `Err(WalError::Io(...))`.
    ///
    /// The log is read into memory in one piece: logs are bounded by the
    /// write buffer size, and resynchronising after damage needs random
    /// access to the tail.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<ReplaySummary, WalError>
    where
        F: FnMut(&[u8]),
    {
        let mut data = Vec::new();
        self.rdr.read_to_end(&mut data)?;

        let mut summary = ReplaySummary::default();
        let mut body = Vec::with_capacity(256);
        let mut pos = 0usize;

        while pos < data.len() {
            match decode_frame(&data[pos..], &mut body) {
                Frame::Valid(len) => {
                    apply(&body);
                    summary.records += 1;
                    pos += len;
                }
                damaged => {
                    // A checksum failure leaves the frame's extent usable,
                    // so frames nested inside its body are not mistaken for
                    // later records. A short or garbled header gives no
                    // extent and the search starts at the next byte.
                    let resume = match damaged {
                        Frame::BadChecksum(len) => pos + len,
                        _ => pos + 1,
                    };
                    if Self::valid_frame_after(&data, resume) {
                        return Err(WalError::Corrupt { offset: pos as u64 });
                    }
                    summary.dropped_bytes = (data.len() - pos) as u64;
                    break;
                }
            }
        }

        if summary.dropped_bytes > 0 {
            tracing::warn!(
                offset = pos,
                dropped = summary.dropped_bytes,
                "discarding torn WAL tail"
            );
        }
        Ok(summary)
    }

    /// Scans forward from `start` for any complete, checksum-valid frame.
    ///
    /// Byte-granular, so a valid frame carried inside the body of a frame
    /// that was cut short by a crash still reads as later data and the
    /// tail is reported as corrupt rather than dropped.
    fn valid_frame_after(data: &[u8], start: usize) -> bool {
        let mut scratch = Vec::new();
        (start..data.len())
            .any(|p| matches!(decode_frame(&data[p..], &mut scratch), Frame::Valid(_)))
    }
}

#[cfg(test)]
mod tests;
