//! Append-only mutation journal with a durable cursor
//!
//! # File Structure
//!
//! ```text
//! binlog.log
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "ANXLOG01"
//! 0x08     8       u64 LE      base_seq: sequence before the first retained record
//! 0x10     ...     records
//!
//! record
//! ─────────────────────────────────────────────
//!          4       u32 LE      len: body length
//!          len     body        seq u64 | key u64 | op u8 | payload_len u32 | payload
//!          4       u32 LE      crc32c(body)
//!
//! binlog.cursor
//! ─────────────────────────────────────────────
//!          8       u64 LE      last applied sequence
//!          4       u32 LE      crc32c of the 8 bytes above
//! ```
//!
//! Every append is `sync_data`'d before it returns. On open, a torn final
//! record (short, zero-filled, or failing its checksum with nothing after it)
//! is cut back to the last good record. Damage anywhere before the final
//! record is reported as `Corrupt` and the file is left untouched.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::error::{Result, StoreError};
use crate::fsutil::{commit_tmp, tmp_path, write_atomic};

pub const LOG_FILE: &str = "binlog.log";
pub const CURSOR_FILE: &str = "binlog.cursor";

const MAGIC: &[u8; 8] = b"ANXLOG01";
const HEADER_SIZE: u64 = 16;
/// seq + key + op + payload_len
const BODY_FIXED: usize = 8 + 8 + 1 + 4;
/// Upper bound on a record body
const MAX_BODY: usize = 256 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Upsert = 1,
    Delete = 2,
}

impl OpKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OpKind::Upsert),
            2 => Some(OpKind::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub seq: u64,
    pub key: u64,
    pub op: OpKind,
    /// Codec bytes for `Upsert`, empty for `Delete`
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32, size: u64 },
    #[error("Incomplete record")]
    Incomplete,
    #[error("Record length {0} out of range")]
    BadLength(usize),
    #[error("Malformed record: {0}")]
    Malformed(String),
}

impl From<RecordError> for StoreError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Io(e) => StoreError::Io(e),
            other => StoreError::Corrupt(format!("binlog record: {other}")),
        }
    }
}

fn encode_record(seq: u64, key: u64, op: OpKind, payload: &[u8]) -> Vec<u8> {
    let body_len = BODY_FIXED + payload.len();
    let mut buf = Vec::with_capacity(4 + body_len + 4);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&key.to_le_bytes());
    buf.push(op as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32c::crc32c(&buf[4..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Read one record, never reading past `remaining` bytes.
///
/// Returns the entry and the number of bytes it occupied, or `None` at a
/// clean end.
fn read_record<R: Read>(
    reader: &mut R,
    remaining: u64,
) -> std::result::Result<Option<(LogEntry, u64)>, RecordError> {
    if remaining == 0 {
        return Ok(None);
    }
    if remaining < 4 {
        return Err(RecordError::Incomplete);
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let body_len = u32::from_le_bytes(len_buf) as usize;
    if !(BODY_FIXED..=MAX_BODY).contains(&body_len) {
        return Err(RecordError::BadLength(body_len));
    }
    if remaining < (4 + body_len + 4) as u64 {
        return Err(RecordError::Incomplete);
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body)?;
    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;

    let expected = u32::from_le_bytes(crc_buf);
    let actual = crc32c::crc32c(&body);
    if expected != actual {
        return Err(RecordError::CrcMismatch {
            expected,
            actual,
            size: (4 + body_len + 4) as u64,
        });
    }

    let seq = le_u64(&body[0..8]);
    let key = le_u64(&body[8..16]);
    let op = OpKind::from_u8(body[16])
        .ok_or_else(|| RecordError::Malformed(format!("unknown op {} at seq {seq}", body[16])))?;
    let payload_len = le_u32(&body[17..21]) as usize;
    if payload_len != body_len - BODY_FIXED {
        return Err(RecordError::Malformed(format!(
            "payload length {payload_len} disagrees with body length {body_len} at seq {seq}"
        )));
    }
    body.drain(..BODY_FIXED);

    Ok(Some((
        LogEntry {
            seq,
            key,
            op,
            payload: body,
        },
        (4 + body_len + 4) as u64,
    )))
}

/// True when the next `len` bytes are all zero, as left by a crash after the
/// file grew but before the record landed.
fn rest_is_zeroed<R: Read>(reader: &mut R, len: u64) -> io::Result<bool> {
    let mut chunk = [0u8; 4096];
    let mut rest = reader.by_ref().take(len);
    loop {
        let n = rest.read(&mut chunk)?;
        if n == 0 {
            return Ok(true);
        }
        if chunk[..n].iter().any(|&b| b != 0) {
            return Ok(false);
        }
    }
}

fn header_bytes(base_seq: u64) -> [u8; HEADER_SIZE as usize] {
    let mut buf = [0u8; HEADER_SIZE as usize];
    buf[0..8].copy_from_slice(MAGIC);
    buf[8..16].copy_from_slice(&base_seq.to_le_bytes());
    buf
}

fn write_cursor(dir: &Path, seq: u64) -> io::Result<()> {
    let mut buf = [0u8; 12];
    buf[0..8].copy_from_slice(&seq.to_le_bytes());
    let crc = crc32c::crc32c(&buf[0..8]);
    buf[8..12].copy_from_slice(&crc.to_le_bytes());
    write_atomic(&dir.join(CURSOR_FILE), &buf)
}

fn read_cursor(dir: &Path, base_seq: u64) -> Result<u64> {
    let path = dir.join(CURSOR_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(
                "binlog cursor {} missing, starting from base seq {}",
                path.display(),
                base_seq
            );
            return Ok(base_seq);
        }
        Err(e) => return Err(e.into()),
    };
    if bytes.len() != 12 {
        return Err(StoreError::Corrupt(format!(
            "binlog cursor has {} bytes, expected 12",
            bytes.len()
        )));
    }
    let expected = le_u32(&bytes[8..12]);
    let actual = crc32c::crc32c(&bytes[0..8]);
    if expected != actual {
        return Err(StoreError::Corrupt(format!(
            "binlog cursor CRC mismatch: expected {expected:#x}, got {actual:#x}"
        )));
    }
    Ok(le_u64(&bytes[0..8]))
}

pub struct BinLog {
    dir: PathBuf,
    /// Append-mode handle; every write lands at the end of the file
    file: File,
    /// Length of the valid prefix, header included
    len: u64,
    base_seq: u64,
    last_seq: u64,
    cursor: u64,
}

impl BinLog {
    /// Start an empty journal in `dir`, replacing any previous one.
    pub fn create(dir: &Path) -> Result<Self> {
        write_atomic(&dir.join(LOG_FILE), &header_bytes(0))?;
        write_cursor(dir, 0)?;
        Self::open(dir)
    }

    /// Open an existing journal, cutting away a torn tail.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE {
            return Err(StoreError::Corrupt(format!(
                "binlog {} is shorter than its header",
                path.display()
            )));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..8] != MAGIC {
            return Err(StoreError::Corrupt(format!(
                "binlog {} has invalid magic",
                path.display()
            )));
        }
        let base_seq = le_u64(&header[8..16]);

        let mut offset = HEADER_SIZE;
        let mut last_seq = base_seq;
        {
            let mut reader = BufReader::new(&file);
            loop {
                match read_record(&mut reader, file_len - offset) {
                    Ok(None) => break,
                    Ok(Some((entry, size))) => {
                        if entry.seq != last_seq + 1 {
                            return Err(StoreError::Corrupt(format!(
                                "binlog sequence gap: seq {} follows {}",
                                entry.seq, last_seq
                            )));
                        }
                        last_seq = entry.seq;
                        offset += size;
                    }
                    Err(RecordError::Incomplete) => break,
                    Err(RecordError::Io(e)) => return Err(e.into()),
                    Err(RecordError::CrcMismatch { size, .. }) if offset + size == file_len => break,
                    Err(RecordError::BadLength(_))
                        if rest_is_zeroed(&mut reader, file_len - offset - 4)? =>
                    {
                        break
                    }
                    Err(err) => {
                        return Err(StoreError::Corrupt(format!(
                            "binlog {} damaged after seq {} (byte {}): {}",
                            path.display(),
                            last_seq,
                            offset,
                            err
                        )))
                    }
                }
            }
        }

        let cursor = read_cursor(dir, base_seq)?;
        if cursor < base_seq || cursor > last_seq {
            return Err(StoreError::Corrupt(format!(
                "binlog cursor {cursor} outside journal range {base_seq}..={last_seq}"
            )));
        }

        if offset < file_len {
            tracing::warn!(
                "binlog {}: truncating {} byte torn tail after seq {}",
                path.display(),
                file_len - offset,
                last_seq
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            len: offset,
            base_seq,
            last_seq,
            cursor,
        })
    }

    /// Journal one operation; durable once this returns.
    pub fn append(&mut self, key: u64, op: OpKind, payload: &[u8]) -> Result<u64> {
        let seq = self.last_seq + 1;
        let record = encode_record(seq, key, op, payload);

        if let Err(err) = self
            .file
            .write_all(&record)
            .and_then(|_| self.file.sync_data())
        {
            // Drop whatever part of the record reached the file
            if let Err(rollback) = self.file.set_len(self.len) {
                tracing::error!("binlog rollback after failed append failed: {rollback}");
            }
            return Err(err.into());
        }

        self.len += record.len() as u64;
        self.last_seq = seq;
        Ok(seq)
    }

    /// Lazily replay entries with `seq >= from_seq`.
    ///
    /// The iterator owns its own file handle and stops at the journal length
    /// seen when it was created, so appends may continue while it is read.
    pub fn entries(&self, from_seq: u64) -> Result<BinLogIter> {
        let mut file = File::open(self.dir.join(LOG_FILE))?;
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(BinLogIter {
            reader: BufReader::new(file),
            remaining: self.len - HEADER_SIZE,
            from_seq,
            done: false,
        })
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Durably record that everything up to `seq` has been applied.
    pub fn commit_cursor(&mut self, seq: u64) -> Result<()> {
        if seq < self.base_seq || seq > self.last_seq {
            return Err(StoreError::Corrupt(format!(
                "cursor {seq} outside journal range {}..={}",
                self.base_seq, self.last_seq
            )));
        }
        write_cursor(&self.dir, seq)?;
        self.cursor = seq;
        Ok(())
    }

    /// Discard entries with `seq <= upto_seq`.
    ///
    /// Only applied entries may go: `upto_seq` must not pass the cursor.
    pub fn truncate(&mut self, upto_seq: u64) -> Result<()> {
        if upto_seq > self.cursor {
            return Err(StoreError::InvalidTruncate {
                requested: upto_seq,
                cursor: self.cursor,
            });
        }
        if upto_seq <= self.base_seq {
            return Ok(());
        }

        let path = self.dir.join(LOG_FILE);
        let tmp = tmp_path(&path);
        let mut kept = 0u64;
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            out.write_all(&header_bytes(upto_seq))?;
            for entry in self.entries(upto_seq + 1)? {
                let entry = entry?;
                out.write_all(&encode_record(entry.seq, entry.key, entry.op, &entry.payload))?;
                kept += 1;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        commit_tmp(&tmp, &path)?;

        self.file = OpenOptions::new().append(true).open(&path)?;
        self.len = fs::metadata(&path)?.len();
        tracing::info!(
            "binlog compacted: dropped seq {}..={}, kept {} entries",
            self.base_seq + 1,
            upto_seq,
            kept
        );
        self.base_seq = upto_seq;
        Ok(())
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    /// Entries journaled but not yet applied
    pub fn pending(&self) -> u64 {
        self.last_seq - self.cursor
    }

    /// Bytes in the journal file, header included
    pub fn byte_len(&self) -> u64 {
        self.len
    }
}

pub struct BinLogIter {
    reader: BufReader<File>,
    remaining: u64,
    from_seq: u64,
    done: bool,
}

impl Iterator for BinLogIter {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match read_record(&mut self.reader, self.remaining) {
                Ok(None) => self.done = true,
                Ok(Some((entry, size))) => {
                    self.remaining -= size;
                    if entry.seq >= self.from_seq {
                        return Some(Ok(entry));
                    }
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
        }
        None
    }
}
