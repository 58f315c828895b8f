//! Input wire formats
//!
//! # Feature files
//!
//! ```text
//! Offset   Size       Type     Description
//! ────────────────────────────────────────────────
//! 0x00     4          u32 LE   D: vector dimension
//! 0x04     N*D*8      [f64]    vector data, row-major (Little Endian)
//! ```
//!
//! EOF defines N: `N = (file_size − 4) / (8 · D)`. Trailing bytes that do
//! not fill a whole vector are ignored.
//!
//! # Times files
//!
//! ASCII whitespace-separated doubles, one timestamp per vector.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("feature file truncated: {0} bytes, need at least 4")]
    TruncatedHeader(usize),

    #[error("feature file declares dimension 0")]
    ZeroDim,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("bad value {text:?} in times file")]
    BadTimestamp { text: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A feature file loaded into memory.
///
/// The payload is kept as raw little-endian bytes so inserts can copy it
/// into the mapped data region verbatim; `vectors()` decodes it for the
/// query paths, which need an owned copy anyway.
pub struct FeatureFile {
    dim: usize,
    payload: Vec<u8>,
}

impl FeatureFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FormatError> {
        let mut file = File::open(path)?;
        let mut header = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            match file.read(&mut header[read..])? {
                0 => return Err(FormatError::TruncatedHeader(read)),
                n => read += n,
            }
        }
        let dim = u32::from_le_bytes(header) as usize;
        if dim == 0 {
            return Err(FormatError::ZeroDim);
        }

        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;
        Ok(Self { dim, payload })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Whole vectors in the file; a trailing partial row does not count.
    pub fn num_vectors(&self) -> usize {
        self.payload.len() / (8 * self.dim)
    }

    /// The raw payload bytes of the whole vectors, little-endian doubles.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.num_vectors() * self.dim * 8]
    }

    /// Decode the payload into doubles, row-major.
    pub fn vectors(&self) -> Vec<f64> {
        self.payload()
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }
}

/// Writer for producing feature files (test fixtures and external
/// producers share it).
pub struct FeatureWriter {
    writer: BufWriter<File>,
    dim: usize,
    count: usize,
}

impl FeatureWriter {
    pub fn new<P: AsRef<Path>>(path: P, dim: usize) -> Result<Self, FormatError> {
        if dim == 0 {
            return Err(FormatError::ZeroDim);
        }
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&(dim as u32).to_le_bytes())?;
        Ok(Self {
            writer,
            dim,
            count: 0,
        })
    }

    pub fn write_vector(&mut self, vector: &[f64]) -> Result<(), FormatError> {
        if vector.len() != self.dim {
            return Err(FormatError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        for &val in vector {
            self.writer.write_all(&val.to_le_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<usize, FormatError> {
        self.writer.flush()?;
        Ok(self.count)
    }
}

/// Read a list file: UTF-8 text, one non-empty entry per line.
pub fn read_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>, FormatError> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Parse every double in an ASCII times file.
pub fn read_times<P: AsRef<Path>>(path: P) -> Result<Vec<f64>, FormatError> {
    let text = std::fs::read_to_string(path)?;
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>().map_err(|_| FormatError::BadTimestamp {
                text: tok.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_writer_reader_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ftr");

        let mut writer = FeatureWriter::new(&path, 3).unwrap();
        writer.write_vector(&[1.0, 2.0, 3.0]).unwrap();
        writer.write_vector(&[4.0, 5.0, 6.0]).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let file = FeatureFile::open(&path).unwrap();
        assert_eq!(file.dim(), 3);
        assert_eq!(file.num_vectors(), 2);
        assert_eq!(file.vectors(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(file.payload().len(), 48);
    }

    #[test]
    fn test_zero_vector_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.ftr");
        let writer = FeatureWriter::new(&path, 8).unwrap();
        writer.finish().unwrap();

        let file = FeatureFile::open(&path).unwrap();
        assert_eq!(file.num_vectors(), 0);
        assert!(file.payload().is_empty());
    }

    #[test]
    fn test_trailing_partial_row_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ragged.ftr");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        for v in [1.0f64, 2.0, 3.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();

        let file = FeatureFile::open(&path).unwrap();
        assert_eq!(file.num_vectors(), 1);
        assert_eq!(file.vectors(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_writer_dimension_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ftr");
        let mut writer = FeatureWriter::new(&path, 4).unwrap();
        assert!(matches!(
            writer.write_vector(&[1.0, 2.0, 3.0]),
            Err(FormatError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_open_rejects_dim_zero_and_truncation() {
        let dir = tempdir().unwrap();
        let zero = dir.path().join("zero.ftr");
        std::fs::write(&zero, 0u32.to_le_bytes()).unwrap();
        assert!(matches!(FeatureFile::open(&zero), Err(FormatError::ZeroDim)));

        let short = dir.path().join("short.ftr");
        std::fs::write(&short, [1u8, 0]).unwrap();
        assert!(matches!(
            FeatureFile::open(&short),
            Err(FormatError::TruncatedHeader(2))
        ));
    }

    #[test]
    fn test_read_times() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("times.txt");
        std::fs::write(&path, "0.0 0.1\n0.2\t0.3  0.4\n").unwrap();
        assert_eq!(read_times(&path).unwrap(), vec![0.0, 0.1, 0.2, 0.3, 0.4]);

        std::fs::write(&path, "0.0 oops").unwrap();
        assert!(matches!(
            read_times(&path),
            Err(FormatError::BadTimestamp { .. })
        ));
    }
}
