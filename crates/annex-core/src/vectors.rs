//! Memory-mapped vector file reader
//!
//! Zero-copy access to `.vec` files through the OS page cache. Used when a
//! persisted index is reopened: the graph loader copies the rows it needs
//! out of the mapping and then drops it, so the file can be replaced by the
//! next persist.
//!
//! # Safety
//!
//! `bytemuck::try_cast_slice` converts `&[u8]` to `&[f32]` with an alignment
//! check instead of a raw pointer cast.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::format::{FormatError, VecHeader};

#[derive(Error, Debug)]
pub enum VectorFileError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index out of bounds: {index} >= {count}")]
    IndexOutOfBounds { index: usize, count: usize },

    #[error("Alignment error: byte slice not aligned to f32 (4 bytes)")]
    AlignmentError,
}

/// Read-only mapping of a `.vec` file
pub struct VectorFile {
    mmap: Mmap,
    header: VecHeader,
}

impl VectorFile {
    /// Map a `.vec` file.
    ///
    /// The file must not be truncated while mapped; writers always replace
    /// it through a rename, which leaves existing mappings intact.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VectorFileError> {
        let file = File::open(path)?;
        // SAFETY: the file is only ever replaced via rename, never modified in place.
        let mmap = unsafe { Mmap::map(&file)? };

        let header = VecHeader::from_bytes(&mmap)?;

        let expected_size = header.file_size();
        if mmap.len() < expected_size {
            return Err(VectorFileError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "File truncated: expected {} bytes, got {}",
                    expected_size,
                    mmap.len()
                ),
            )));
        }

        Ok(Self { mmap, header })
    }

    pub fn len(&self) -> usize {
        self.header.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    pub fn dim(&self) -> usize {
        self.header.dimensions as usize
    }

    /// Journal watermark recorded when the file was written
    pub fn applied_seq(&self) -> u64 {
        self.header.applied_seq
    }

    /// Borrow the vector with internal id `index` straight from the mapping.
    pub fn get(&self, index: usize) -> Result<&[f32], VectorFileError> {
        if index >= self.len() {
            return Err(VectorFileError::IndexOutOfBounds {
                index,
                count: self.len(),
            });
        }

        let start = self.header.offset(index);
        let end = self.header.offset(index + 1);
        bytemuck::try_cast_slice(&self.mmap[start..end]).map_err(|_| VectorFileError::AlignmentError)
    }

    /// Copy the first `count` vectors into one flat buffer.
    pub fn to_flat(&self, count: usize) -> Result<Vec<f32>, VectorFileError> {
        let count = count.min(self.len());
        let mut flat = Vec::with_capacity(count * self.dim());
        for index in 0..count {
            flat.extend_from_slice(self.get(index)?);
        }
        Ok(flat)
    }
}
