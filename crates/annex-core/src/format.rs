//! `.vec` vector file layout
//!
//! ```text
//! Offset   Size    Type        Field
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     "ANXVEC01"
//! 0x08     4       u32 LE      count
//! 0x0C     4       u32 LE      dimensions
//! 0x10     8       u64 LE      applied journal sequence
//! 0x18     N*D*4   [f32 LE]    rows, indexed by internal id
//! ```
//!
//! The writer streams rows behind a zeroed header and fills the header in
//! on [`VecWriter::finish`]; an unfinished file fails the magic check.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

pub const MAGIC: [u8; 8] = *b"ANXVEC01";

pub const HEADER_SIZE: usize = 24;

const ROW_ELEMENT: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("not a vector file (bad magic)")]
    InvalidMagic,

    #[error("truncated header: {0} bytes")]
    Truncated(usize),

    #[error("row has {actual} components, file holds {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VecHeader {
    pub count: u32,
    pub dimensions: u32,
    pub applied_seq: u64,
}

impl VecHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let Some(head) = bytes.get(..HEADER_SIZE) else {
            return Err(FormatError::Truncated(bytes.len()));
        };
        let (magic, fields) = head.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let (count, rest) = fields.split_at(4);
        let (dimensions, applied_seq) = rest.split_at(4);
        Ok(Self {
            count: u32::from_le_bytes(le_array(count)),
            dimensions: u32::from_le_bytes(le_array(dimensions)),
            applied_seq: u64::from_le_bytes(le_array(applied_seq)),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..8].copy_from_slice(&MAGIC);
        out[8..12].copy_from_slice(&self.count.to_le_bytes());
        out[12..16].copy_from_slice(&self.dimensions.to_le_bytes());
        out[16..].copy_from_slice(&self.applied_seq.to_le_bytes());
        out
    }

    fn row_bytes(&self) -> usize {
        self.dimensions as usize * ROW_ELEMENT
    }

    /// Byte offset of the row for internal id `index`
    #[inline(always)]
    pub fn offset(&self, index: usize) -> usize {
        HEADER_SIZE + index * self.row_bytes()
    }

    pub fn file_size(&self) -> usize {
        self.offset(self.count as usize)
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Streaming `.vec` writer
pub struct VecWriter {
    out: BufWriter<File>,
    dimensions: usize,
    rows: u32,
}

impl VecWriter {
    pub fn new<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self, FormatError> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&[0u8; HEADER_SIZE])?;
        Ok(Self {
            out,
            dimensions,
            rows: 0,
        })
    }

    pub fn write_vector(&mut self, row: &[f32]) -> Result<(), FormatError> {
        if row.len() != self.dimensions {
            return Err(FormatError::DimensionMismatch {
                expected: self.dimensions,
                actual: row.len(),
            });
        }
        for component in row {
            self.out.write_all(&component.to_le_bytes())?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Stamp the header with the row count and `applied_seq`, then fsync.
    pub fn finish(mut self, applied_seq: u64) -> Result<u32, FormatError> {
        let header = VecHeader {
            count: self.rows,
            dimensions: self.dimensions as u32,
            applied_seq,
        };
        self.out.flush()?;
        let file = self.out.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;
        Ok(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_row_offsets() {
        let header = VecHeader {
            count: 10,
            dimensions: 3,
            applied_seq: 0,
        };
        assert_eq!(header.offset(0), HEADER_SIZE);
        assert_eq!(header.offset(2), HEADER_SIZE + 24);
        assert_eq!(header.file_size(), HEADER_SIZE + 120);
    }

    #[test]
    fn test_finish_stamps_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.vec");

        let mut writer = VecWriter::new(&path, 2).unwrap();
        writer.write_vector(&[1.5, -2.0]).unwrap();
        writer.write_vector(&[0.0, 4.0]).unwrap();
        assert_eq!(writer.finish(17).unwrap(), 2);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 16);
        assert_eq!(
            VecHeader::from_bytes(&bytes).unwrap(),
            VecHeader {
                count: 2,
                dimensions: 2,
                applied_seq: 17
            }
        );
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 4], &1.5f32.to_le_bytes());
    }

    #[test]
    fn test_header_bytes_parse_back() {
        let header = VecHeader {
            count: 0x0102_0304,
            dimensions: 768,
            applied_seq: u64::MAX - 5,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..8], b"ANXVEC01");
        assert_eq!(&bytes[12..16], &768u32.to_le_bytes());
        assert_eq!(VecHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_unfinished_file_reads_as_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.vec");
        let mut writer = VecWriter::new(&path, 2).unwrap();
        writer.write_vector(&[1.0, 1.0]).unwrap();
        drop(writer);

        let bytes = std::fs::read(&path).unwrap();
        assert!(matches!(
            VecHeader::from_bytes(&bytes),
            Err(FormatError::InvalidMagic)
        ));
    }

    #[test]
    fn test_rejects_short_rows_and_headers() {
        let dir = tempdir().unwrap();
        let mut writer = VecWriter::new(dir.path().join("bad.vec"), 3).unwrap();
        assert!(matches!(
            writer.write_vector(&[1.0, 2.0]),
            Err(FormatError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(matches!(
            VecHeader::from_bytes(&MAGIC),
            Err(FormatError::Truncated(8))
        ));
    }
}
