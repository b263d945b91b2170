//! Value Log Module
//!
//! An **append-only**, **checksummed** log that stores every value written to
//! the engine. SSTables only hold `(key, offset, vlen)` triples pointing into
//! this file, which keeps tables small and makes compaction cheap: merging
//! tables never moves value bytes.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC u8 = 0xFF][CRC16 u16][KEY u64][VLEN u32][VALUE vlen bytes]
//! [MAGIC u8 = 0xFF][CRC16 u16][KEY u64][VLEN u32][VALUE vlen bytes]
//! ...
//! ```
//!
//! All integers are little-endian. The checksum is CRC-16/IBM-3740
//! (also known as CCITT-FALSE) computed over `key_le || vlen_le || value`.
//!
//! # Head and tail
//!
//! - `head` is the append position (the file length).
//! - `tail` is the first byte that has not been reclaimed by garbage
//!   collection. Everything before it has been hole-punched.
//!
//! Both only move forward, except through [`ValueLog::reset`].
//!
//! # Recovery
//!
//! Neither pointer is persisted. On open, `head` is the file length and
//! `tail` is the first non-zero byte, which must start a valid record.
//! Records are then walked up to `head`. Bytes that fail to parse are
//! truncated only when no valid record follows them (an interrupted
//! append); otherwise open fails with [`VlogError::Corrupt`].
//!
//! # File handles
//!
//! The log does not keep a file descriptor open. Each operation opens the
//! file, performs positioned I/O and drops the handle.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crc::{CRC_16_IBM_3740, Crc};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// First byte of every record.
pub const RECORD_MAGIC: u8 = 0xFF;

/// Size of the fixed record prefix: magic + crc16 + key + vlen.
pub const RECORD_HEADER_SIZE: u64 = 1 + 2 + 8 + 4;

/// Window used when scanning for the first record on open.
const SCAN_WINDOW: usize = 64 * 1024;

/// Chunk size for the zero-fill fallback of hole punching.
const ZERO_CHUNK: usize = 64 * 1024;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by value log operations.
#[derive(Debug, Error)]
pub enum VlogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header encoding or decoding failure.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The bytes at `offset` are not a valid record.
    #[error("Corrupt record at offset {offset}: {reason}")]
    Corrupt {
        /// Byte offset of the record.
        offset: u64,
        /// What failed to validate.
        reason: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Record structures
// ------------------------------------------------------------------------------------------------

/// Fixed-width prefix of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: u8,
    pub checksum: u16,
    pub key: u64,
    pub vlen: u32,
}

impl Encode for RecordHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.checksum.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.vlen.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for RecordHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (checksum, n) = u16::decode_from(&buf[off..])?;
        off += n;
        let (key, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (vlen, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                checksum,
                key,
                vlen,
            },
            off,
        ))
    }
}

impl RecordHeader {
    /// Total on-disk size of the record this header introduces.
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_SIZE + u64::from(self.vlen)
    }
}

/// A fully read and validated record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlogRecord {
    /// Offset of the record's magic byte.
    pub offset: u64,
    pub key: u64,
    pub value: Vec<u8>,
}

impl VlogRecord {
    /// Total on-disk size of the record.
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_SIZE + self.value.len() as u64
    }
}

/// CRC-16 over `key_le || vlen_le || value`.
pub fn record_checksum(key: u64, vlen: u32, value: &[u8]) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(&key.to_le_bytes());
    digest.update(&vlen.to_le_bytes());
    digest.update(value);
    digest.finalize()
}

// ------------------------------------------------------------------------------------------------
// Value log core
// ------------------------------------------------------------------------------------------------

/// The append-only value store.
#[derive(Debug)]
pub struct ValueLog {
    /// Location of the log file.
    path: PathBuf,

    /// Append position.
    head: u64,

    /// First unreclaimed byte.
    tail: u64,

    /// Whether appends are followed by `fsync`.
    sync_writes: bool,
}

impl ValueLog {
    /// Opens (or creates) the log at `path` and recovers `head` and `tail`.
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self, VlogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let mut log = Self {
            path,
            head: file.metadata()?.len(),
            tail: 0,
            sync_writes,
        };
        drop(file);

        log.recover()?;

        info!(
            path = %log.path.display(),
            head = log.head,
            tail = log.tail,
            "Opened value log"
        );
        Ok(log)
    }

    /// Append position.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// First unreclaimed byte.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record per live entry, in order, with a single write.
    ///
    /// Each input is `(key, Some(value))` for a live value or `(key, None)`
    /// for a tombstone. The returned vector holds one offset per input:
    /// the record's offset for live values, and for tombstones the position
    /// the next record would have been written at. `head` advances only
    /// after the write (and the optional sync) succeeded.
    pub fn append_batch<'a, I>(&mut self, entries: I) -> Result<Vec<u64>, VlogError>
    where
        I: IntoIterator<Item = (u64, Option<&'a [u8]>)>,
    {
        let mut buf = Vec::new();
        let mut offsets = Vec::new();

        for (key, value) in entries {
            offsets.push(self.head + buf.len() as u64);
            let Some(value) = value else {
                continue;
            };

            let vlen = encoding::len_to_u32(value.len())?;
            let header = RecordHeader {
                magic: RECORD_MAGIC,
                checksum: record_checksum(key, vlen, value),
                key,
                vlen,
            };
            header.encode_to(&mut buf)?;
            buf.extend_from_slice(value);
        }

        if !buf.is_empty() {
            let mut file = self.open_rw()?;
            file.seek(SeekFrom::Start(self.head))?;
            file.write_all(&buf)?;
            if self.sync_writes {
                file.sync_data()?;
            }
            self.head += buf.len() as u64;
        }

        debug!(
            records = offsets.len(),
            bytes = buf.len(),
            head = self.head,
            "Appended batch to value log"
        );
        Ok(offsets)
    }

    /// Reads the record at `offset` without verifying its checksum.
    ///
    /// This is the lookup path: the caller already knows from an SSTable
    /// that a record lives here.
    pub fn read_record_at(&self, offset: u64) -> Result<VlogRecord, VlogError> {
        let mut file = self.open_ro()?;
        let header = read_header(&mut file, offset, self.head)?;
        let value = read_value(&mut file, offset, &header, self.head)?;
        trace!(offset, key = header.key, vlen = header.vlen, "Read vlog record");
        Ok(VlogRecord {
            offset,
            key: header.key,
            value,
        })
    }

    /// Reads and fully validates the record at `offset`.
    ///
    /// Wrong magic, a record running past `head`, or a checksum mismatch
    /// are all reported as [`VlogError::Corrupt`].
    pub fn validate_record_at(&self, offset: u64) -> Result<VlogRecord, VlogError> {
        let mut file = self.open_ro()?;
        check_record(&mut file, offset, self.head).inspect_err(|e| {
            if let VlogError::Corrupt { reason, .. } = e {
                error!(offset, reason = %reason, "Value log record failed validation");
            }
        })
    }

    /// Deallocates `[offset, offset + len)` without changing the file size.
    ///
    /// Reads of the range return zeros afterwards.
    pub fn punch_hole(&self, offset: u64, len: u64) -> Result<(), VlogError> {
        if len == 0 {
            return Ok(());
        }
        let mut file = self.open_rw()?;
        punch_hole_impl(&mut file, offset, len)?;
        if self.sync_writes {
            file.sync_data()?;
        }
        debug!(offset, len, "Punched hole in value log");
        Ok(())
    }

    /// Moves `tail` forward. Moving it backwards or past `head` is ignored.
    pub fn advance_tail(&mut self, new_tail: u64) {
        if new_tail < self.tail || new_tail > self.head {
            warn!(
                tail = self.tail,
                head = self.head,
                new_tail,
                "Ignoring out-of-range tail update"
            );
            return;
        }
        self.tail = new_tail;
    }

    /// Truncates the log to zero bytes and zeroes both pointers.
    pub fn reset(&mut self) -> Result<(), VlogError> {
        let file = self.open_rw()?;
        file.set_len(0)?;
        file.sync_all()?;
        self.head = 0;
        self.tail = 0;
        info!(path = %self.path.display(), "Reset value log");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------------------------------

    fn recover(&mut self) -> Result<(), VlogError> {
        let mut file = self.open_rw()?;
        let len = self.head;

        // Reclaimed space reads as zeros, so the first non-zero byte is
        // where the live region starts.
        let first = first_data_offset(&file, len);
        let data_start = skip_zeros(&mut file, first, len)?;

        self.tail = match find_first_record(&mut file, data_start, len)? {
            Some(offset) if offset > data_start => {
                return Err(self.corrupt_on_open(
                    data_start,
                    format!("unreadable bytes before first valid record at {offset}"),
                ));
            }
            Some(offset) => offset,
            None => data_start,
        };

        // Walk record headers from the tail. A bad header is only an
        // interrupted append when nothing valid follows it.
        let mut pos = self.tail;
        while pos < len {
            let reason = match read_header(&mut file, pos, len) {
                Ok(h) if h.magic != RECORD_MAGIC => "bad magic",
                Ok(h) if pos + h.record_len() > len => "record runs past end of file",
                Ok(h) if pos + h.record_len() < len => {
                    pos += h.record_len();
                    continue;
                }
                Ok(_) => match check_record(&mut file, pos, len) {
                    Ok(_) => break,
                    Err(VlogError::Io(e)) => return Err(VlogError::Io(e)),
                    Err(_) => "checksum mismatch on final record",
                },
                Err(VlogError::Corrupt { .. }) => "truncated record header",
                Err(e) => return Err(e),
            };

            if let Some(next) = find_first_record(&mut file, pos + 1, len)? {
                return Err(self.corrupt_on_open(
                    pos,
                    format!("{reason}, valid record follows at {next}"),
                ));
            }

            warn!(
                offset = pos,
                dropped = len - pos,
                reason,
                "Truncating trailing garbage in value log"
            );
            file.set_len(pos)?;
            file.sync_all()?;
            self.head = pos;
            break;
        }

        Ok(())
    }

    fn corrupt_on_open(&self, offset: u64, reason: String) -> VlogError {
        error!(
            path = %self.path.display(),
            offset,
            reason = %reason,
            "Value log is corrupt; refusing to open"
        );
        corrupt(offset, reason)
    }

    fn open_ro(&self) -> Result<File, VlogError> {
        Ok(File::open(&self.path)?)
    }

    fn open_rw(&self) -> Result<File, VlogError> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?)
    }
}

// ------------------------------------------------------------------------------------------------
// Positioned I/O helpers
// ------------------------------------------------------------------------------------------------

fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

fn corrupt(offset: u64, reason: impl Into<String>) -> VlogError {
    VlogError::Corrupt {
        offset,
        reason: reason.into(),
    }
}

/// Reads the record header at `offset`, bounded by `limit`.
fn read_header(file: &mut File, offset: u64, limit: u64) -> Result<RecordHeader, VlogError> {
    if offset + RECORD_HEADER_SIZE > limit {
        return Err(corrupt(offset, "record header runs past end of log"));
    }
    let mut raw = [0u8; RECORD_HEADER_SIZE as usize];
    read_exact_at(file, offset, &mut raw)?;
    let (header, _) = RecordHeader::decode_from(&raw)?;
    Ok(header)
}

fn read_value(
    file: &mut File,
    offset: u64,
    header: &RecordHeader,
    limit: u64,
) -> Result<Vec<u8>, VlogError> {
    if header.magic != RECORD_MAGIC {
        return Err(corrupt(
            offset,
            format!("bad magic 0x{:02x}", header.magic),
        ));
    }
    if offset + header.record_len() > limit {
        return Err(corrupt(offset, "record value runs past end of log"));
    }
    let mut value = vec![0u8; header.vlen as usize];
    read_exact_at(file, offset + RECORD_HEADER_SIZE, &mut value)?;
    Ok(value)
}

/// Reads the record at `offset` and verifies magic, bounds and checksum.
fn check_record(file: &mut File, offset: u64, limit: u64) -> Result<VlogRecord, VlogError> {
    let header = read_header(file, offset, limit)?;
    let value = read_value(file, offset, &header, limit)?;

    let computed = record_checksum(header.key, header.vlen, &value);
    if computed != header.checksum {
        return Err(corrupt(
            offset,
            format!(
                "checksum mismatch (stored {:04x}, computed {:04x})",
                header.checksum, computed
            ),
        ));
    }

    Ok(VlogRecord {
        offset,
        key: header.key,
        value,
    })
}

/// Scans forward from `start` for the first offset holding a valid record.
fn find_first_record(file: &mut File, start: u64, len: u64) -> Result<Option<u64>, VlogError> {
    let mut window = vec![0u8; SCAN_WINDOW];
    let mut pos = start;

    while pos < len {
        let n = (len - pos).min(SCAN_WINDOW as u64) as usize;
        read_exact_at(file, pos, &mut window[..n])?;

        for (i, byte) in window[..n].iter().enumerate() {
            if *byte != RECORD_MAGIC {
                continue;
            }
            let candidate = pos + i as u64;
            match check_record(file, candidate, len) {
                Ok(_) => return Ok(Some(candidate)),
                Err(VlogError::Io(e)) => return Err(VlogError::Io(e)),
                Err(_) => continue,
            }
        }
        pos += n as u64;
    }

    Ok(None)
}

/// Returns the first non-zero byte at or after `start`, or `len`.
fn skip_zeros(file: &mut File, start: u64, len: u64) -> Result<u64, VlogError> {
    let mut window = vec![0u8; SCAN_WINDOW];
    let mut pos = start;

    while pos < len {
        let n = (len - pos).min(SCAN_WINDOW as u64) as usize;
        read_exact_at(file, pos, &mut window[..n])?;
        if let Some(i) = window[..n].iter().position(|b| *b != 0) {
            return Ok(pos + i as u64);
        }
        pos += n as u64;
    }

    Ok(len)
}

/// Returns the first allocated byte at or after 0, as reported by the
/// filesystem. Falls back to 0 when the hint is unavailable.
#[cfg(target_os = "linux")]
fn first_data_offset(file: &File, len: u64) -> u64 {
    use std::os::unix::io::AsRawFd;

    // SAFETY: `fd` is a valid, open descriptor owned by `file` for the
    // duration of the call. `lseek` does not retain it.
    let pos = unsafe { libc::lseek(file.as_raw_fd(), 0, libc::SEEK_DATA) };
    if pos >= 0 {
        return (pos as u64).min(len);
    }
    match io::Error::last_os_error().raw_os_error() {
        // No data after offset 0: the whole file is a hole.
        Some(libc::ENXIO) => len,
        _ => 0,
    }
}

#[cfg(not(target_os = "linux"))]
fn first_data_offset(_file: &File, _len: u64) -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn punch_hole_impl(file: &mut File, offset: u64, len: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: `fd` is a valid, open descriptor owned by `file`; the range is
    // plain integers and KEEP_SIZE leaves the file length untouched.
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => {
            debug!("fallocate punch-hole unsupported, zero-filling instead");
            zero_fill(file, offset, len)
        }
        _ => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole_impl(file: &mut File, offset: u64, len: u64) -> io::Result<()> {
    zero_fill(file, offset, len)
}

fn zero_fill(file: &mut File, offset: u64, len: u64) -> io::Result<()> {
    let zeros = vec![0u8; ZERO_CHUNK];
    file.seek(SeekFrom::Start(offset))?;
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(ZERO_CHUNK as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}
