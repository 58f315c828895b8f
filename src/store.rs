//! Memory-mapped database storage
//!
//! A `Database` owns the whole-file read-write mapping of one backing file
//! and exposes typed, bounds-checked views over its table regions. All
//! mutation happens through `&mut self`; the mapping is released when the
//! handle drops.
//!
//! # Safety
//!
//! Memory mapping is inherently unsafe: truncating the file while mapped can
//! SIGBUS, and the single-writer assumption is not enforced by the OS. The
//! `f64`/`u32` views use `bytemuck` casts; `Layout` guarantees every region
//! offset has the required alignment, and the map itself is page-aligned.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use thiserror::Error;

use crate::format::{read_list, read_times, FeatureFile, FormatError};
use crate::layout::{
    DbHeader, Layout, LayoutError, AUX_ENTRIES, DEFAULT_DB_SIZE, FLAG_L2_NORMED, FLAG_TIMESTAMPED,
    HEADER_SIZE, KEY_SLOT, MAX_FILES,
};
use crate::vecmath::unit_norm_recording;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("cannot open database {path}: {source}")]
    CannotOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("dimension mismatch: database dimension {expected}, feature file {got}")]
    DimensionMismatch { expected: u32, got: u32 },

    #[error("database full: {needed} bytes needed, {available} available")]
    Full { needed: u64, available: u64 },

    #[error("database is timestamped; this operation must supply timestamps")]
    TimesRequired,

    #[error("cannot read times file {path}: {source}")]
    TimesFileMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("times file holds {got} values for {expected} vectors")]
    TimesCountMismatch { expected: usize, got: usize },

    #[error("database is already L2-normed")]
    AlreadyL2Normed,

    #[error("key longer than {} bytes: {len}", KEY_SLOT - 1)]
    KeyTooLong { len: usize },

    #[error("{list} list ended before the feature list")]
    BatchListExhausted { list: &'static str },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One insert operation.
pub struct InsertRequest<'a> {
    pub features: &'a Path,
    /// Defaults to the feature-file path when absent.
    pub key: Option<&'a str>,
    pub times: Option<&'a Path>,
}

/// What an insert did. Duplicate keys and empty feature files are warnings,
/// not errors: the database is unchanged and the operation reports success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { vectors: u32, bytes: u64 },
    DuplicateKey,
    EmptyFeatureFile,
}

/// Batch insert: list files of paths, one per line.
pub struct BatchRequest<'a> {
    pub feature_list: &'a Path,
    /// A key list equal to the feature list path means "key every file by
    /// its own path".
    pub key_list: Option<&'a Path>,
    pub times_list: Option<&'a Path>,
}

/// Read-only status snapshot of the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct DbStatus {
    pub num_files: u32,
    pub dim: u32,
    pub total_vectors: usize,
    pub vectors_available: u64,
    pub total_bytes: u32,
    pub used_percent: f64,
    pub bytes_available: u64,
    pub available_percent: f64,
    pub flags: u32,
    /// Keys with no vectors at all.
    pub null_count: usize,
    /// Keys shorter than the sequence length but not empty.
    pub short_count: usize,
}

/// An open, memory-mapped database.
pub struct Database {
    path: PathBuf,
    map: MmapMut,
    layout: Layout,
    header: DbHeader,
}

impl Database {
    /// Create a new empty database of the default size.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::create_sized(path, DEFAULT_DB_SIZE)
    }

    /// Create a new empty database backed by a file of exactly `db_size`
    /// bytes. The file is sparse until written.
    pub fn create_sized<P: AsRef<Path>>(path: P, db_size: u64) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        let layout = Layout::for_size(db_size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| DbError::CannotOpen {
                path: path.clone(),
                source,
            })?;
        file.set_len(db_size)?;

        let map = unsafe { MmapMut::map_mut(&file)? };

        let mut db = Self {
            path,
            map,
            layout,
            header: DbHeader::empty(),
        };
        db.commit_header();
        tracing::info!("NEW {} ({} bytes)", db.path.display(), db_size);
        Ok(db)
    }

    /// Open an existing database and derive its layout from the file size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| DbError::CannotOpen {
                path: path.clone(),
                source,
            })?;
        let layout = Layout::for_size(file.metadata()?.len())?;

        let map = unsafe { MmapMut::map_mut(&file)? };
        let header = DbHeader::from_bytes(&map[..HEADER_SIZE])?;

        Ok(Self {
            path,
            map,
            layout,
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn commit_header(&mut self) {
        let bytes = self.header.to_bytes();
        self.map[..HEADER_SIZE].copy_from_slice(&bytes);
    }

    // ------------------------------------------------------------------
    // Typed table views
    // ------------------------------------------------------------------

    fn key_slot(&self, idx: usize) -> &[u8] {
        debug_assert!(idx < MAX_FILES);
        let start = self.layout.key_table + idx * KEY_SLOT;
        &self.map[start..start + KEY_SLOT]
    }

    /// Key at catalog position `idx`, NUL padding stripped.
    pub fn key_at(&self, idx: usize) -> String {
        let slot = self.key_slot(idx);
        let end = slot.iter().position(|&b| b == 0).unwrap_or(KEY_SLOT);
        String::from_utf8_lossy(&slot[..end]).into_owned()
    }

    /// Per-key vector counts for the occupied catalog prefix.
    pub fn seg_table(&self) -> &[u32] {
        let start = self.layout.seg_table;
        let full: &[u32] = bytemuck::cast_slice(&self.map[start..start + MAX_FILES * 4]);
        &full[..self.header.num_files as usize]
    }

    /// The whole payload as doubles, row-major.
    pub fn payload(&self) -> &[f64] {
        let start = self.layout.data;
        bytemuck::cast_slice(&self.map[start..start + self.header.length as usize])
    }

    /// Per-vector timestamps for the occupied payload prefix.
    pub fn times(&self) -> &[f64] {
        let start = self.layout.times;
        let total = self.header.total_vectors();
        bytemuck::cast_slice(&self.map[start..start + total * 8])
    }

    /// Per-vector pre-normalization norms for the occupied payload prefix.
    pub fn norms(&self) -> &[f64] {
        let start = self.layout.norms;
        let total = self.header.total_vectors();
        bytemuck::cast_slice(&self.map[start..start + total * 8])
    }

    /// Position of the first stored key that starts with `key`.
    ///
    /// Comparison is byte-prefix, so probe `"abc"` matches a stored
    /// `"abcd"`. This mirrors the historical on-disk contract and is a known
    /// compatibility hazard.
    pub fn find_key(&self, key: &str) -> Option<usize> {
        let probe = key.as_bytes();
        (0..self.header.num_files as usize).find(|&k| self.key_slot(k).starts_with(probe))
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Append one feature file under a key, growing every table in
    /// lock-step. The header is committed last, so a reader that honors
    /// `num_files` always sees a consistent prefix.
    pub fn insert(&mut self, req: &InsertRequest<'_>) -> Result<InsertOutcome, DbError> {
        let feature = FeatureFile::open(req.features)?;

        if self.header.dim == 0 && self.header.length == 0 {
            self.header.dim = feature.dim() as u32;
        } else if self.header.dim as usize != feature.dim() {
            return Err(DbError::DimensionMismatch {
                expected: self.header.dim,
                got: feature.dim() as u32,
            });
        }

        if req.times.is_none() && self.header.is_timestamped() {
            return Err(DbError::TimesRequired);
        }

        let bytes = feature.payload().len() as u64;
        let available = self.layout.data_capacity() - self.header.length as u64;
        if bytes > available {
            return Err(DbError::Full {
                needed: bytes,
                available,
            });
        }
        if self.header.num_files as usize >= MAX_FILES {
            return Err(DbError::Full {
                needed: 1,
                available: 0,
            });
        }

        let path_key = req.features.to_string_lossy();
        let key = req.key.unwrap_or(&path_key);
        if key.len() > KEY_SLOT - 1 {
            return Err(DbError::KeyTooLong { len: key.len() });
        }

        if self.find_key(key).is_some() {
            tracing::warn!("key already exists in database, ignoring: {key}");
            return Ok(InsertOutcome::DuplicateKey);
        }

        let num_vectors = feature.num_vectors();
        if num_vectors == 0 {
            tracing::warn!("ignoring zero-length feature vector file: {key}");
            return Ok(InsertOutcome::EmptyFeatureFile);
        }

        let vector_index = self.header.total_vectors();
        if vector_index + num_vectors > AUX_ENTRIES {
            return Err(DbError::Full {
                needed: (num_vectors * 8) as u64,
                available: ((AUX_ENTRIES - vector_index) * 8) as u64,
            });
        }

        self.ingest_times(num_vectors, vector_index, req.times)?;

        // key slot
        let slot = self.layout.key_table + self.header.num_files as usize * KEY_SLOT;
        self.map[slot..slot + key.len()].copy_from_slice(key.as_bytes());

        // segment table entry
        let seg = self.layout.seg_table + self.header.num_files as usize * 4;
        self.map[seg..seg + 4].copy_from_slice(&(num_vectors as u32).to_le_bytes());

        // payload
        let dst = self.layout.data + self.header.length as usize;
        self.map[dst..dst + bytes as usize].copy_from_slice(feature.payload());

        // norms for the freshly appended block
        if self.header.is_l2_normed() {
            let dim = self.header.dim as usize;
            let block: &mut [f64] =
                bytemuck::cast_slice_mut(&mut self.map[dst..dst + bytes as usize]);
            let norms = unit_norm_recording(block, dim);
            self.write_norms(vector_index, &norms);
        }

        self.header.num_files += 1;
        self.header.length += bytes as u32;
        self.commit_header();

        tracing::info!(
            "INSERT {} {} {num_vectors} vectors {bytes} bytes",
            self.path.display(),
            key
        );
        Ok(InsertOutcome::Inserted {
            vectors: num_vectors as u32,
            bytes,
        })
    }

    /// Stream timestamps for a new block into the timestamp table.
    ///
    /// The first insert that supplies times turns the database timestamped
    /// for good. A times file on an already-populated non-timestamped
    /// database is ignored with a warning. The file may hold up to two
    /// values more than the vector count; anything else is an error.
    fn ingest_times(
        &mut self,
        num_vectors: usize,
        vector_index: usize,
        times: Option<&Path>,
    ) -> Result<(), DbError> {
        let Some(times_path) = times else {
            return Ok(());
        };

        if !self.header.is_timestamped() && self.header.num_files > 0 {
            tracing::warn!(
                "timestamp file used with non time-stamped database: ignoring timestamps"
            );
            return Ok(());
        }

        let values = match read_times(times_path) {
            Ok(values) => values,
            Err(FormatError::Io(source)) => {
                return Err(DbError::TimesFileMissing {
                    path: times_path.to_path_buf(),
                    source,
                })
            }
            Err(err) => return Err(err.into()),
        };

        if values.len() < num_vectors || values.len() > num_vectors + 2 {
            return Err(DbError::TimesCountMismatch {
                expected: num_vectors,
                got: values.len(),
            });
        }

        // the first insert that supplies valid times fixes the mode for good
        self.header.flags |= FLAG_TIMESTAMPED;

        let start = self.layout.times + vector_index * 8;
        let table: &mut [f64] =
            bytemuck::cast_slice_mut(&mut self.map[start..start + num_vectors * 8]);
        table.copy_from_slice(&values[..num_vectors]);
        Ok(())
    }

    fn write_norms(&mut self, vector_index: usize, norms: &[f64]) {
        let start = self.layout.norms + vector_index * 8;
        let table: &mut [f64] =
            bytemuck::cast_slice_mut(&mut self.map[start..start + norms.len() * 8]);
        table.copy_from_slice(norms);
    }

    /// Apply `insert` to every path named in the feature list. Duplicate
    /// keys and empty files are skipped with a warning; returns the total
    /// vectors actually inserted.
    pub fn batch_insert(&mut self, req: &BatchRequest<'_>) -> Result<u64, DbError> {
        if req.times_list.is_none() && self.header.is_timestamped() {
            return Err(DbError::TimesRequired);
        }

        let features = read_list(req.feature_list)?;

        let keys: Option<Vec<String>> = match req.key_list {
            Some(path) if path != req.feature_list => {
                let keys = read_list(path)?;
                if keys.len() < features.len() {
                    return Err(DbError::BatchListExhausted { list: "key" });
                }
                Some(keys)
            }
            _ => None,
        };

        let times: Option<Vec<String>> = match req.times_list {
            Some(path) => {
                let times = read_list(path)?;
                if times.len() < features.len() {
                    return Err(DbError::BatchListExhausted { list: "times" });
                }
                Some(times)
            }
            None => None,
        };

        let mut total = 0u64;
        for (i, feature) in features.iter().enumerate() {
            let key = keys.as_ref().map(|ks| ks[i].as_str());
            let times_path = times.as_ref().map(|ts| Path::new(ts[i].as_str()));
            let outcome = self.insert(&InsertRequest {
                features: Path::new(feature),
                key,
                times: times_path,
            })?;
            if let InsertOutcome::Inserted { vectors, .. } = outcome {
                total += vectors as u64;
            }
        }

        tracing::info!("BATCHINSERT {} {total} vectors", self.path.display());
        Ok(total)
    }

    // ------------------------------------------------------------------
    // L2 retrofit
    // ------------------------------------------------------------------

    /// Unit-normalize every existing payload vector in place, record the
    /// original norms, and flag the database so future inserts normalize on
    /// the fly. One-shot: re-entry is an error.
    pub fn l2norm(&mut self) -> Result<(), DbError> {
        if self.header.is_l2_normed() {
            return Err(DbError::AlreadyL2Normed);
        }

        if self.header.length > 0 {
            let dim = self.header.dim as usize;
            let start = self.layout.data;
            let len = self.header.length as usize;
            let block: &mut [f64] = bytemuck::cast_slice_mut(&mut self.map[start..start + len]);
            let norms = unit_norm_recording(block, dim);
            self.write_norms(0, &norms);
        }

        self.header.flags |= FLAG_L2_NORMED;
        self.commit_header();
        tracing::info!("L2NORM {}", self.path.display());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reporters
    // ------------------------------------------------------------------

    /// Catalog summary. `sequence_length` bounds the short-key census.
    pub fn status(&self, sequence_length: usize) -> DbStatus {
        let capacity = self.layout.data_capacity();
        let used = self.header.length as u64;
        let available = capacity - used;
        let dim = self.header.dim as u64;

        let mut null_count = 0;
        let mut short_count = 0;
        for &n in self.seg_table() {
            if (n as usize) < sequence_length {
                if n == 0 {
                    null_count += 1;
                } else {
                    short_count += 1;
                }
            }
        }

        DbStatus {
            num_files: self.header.num_files,
            dim: self.header.dim,
            total_vectors: self.header.total_vectors(),
            vectors_available: if dim > 0 { available / (8 * dim) } else { 0 },
            total_bytes: self.header.length,
            used_percent: 100.0 * used as f64 / capacity as f64,
            bytes_available: available,
            available_percent: 100.0 * available as f64 / capacity as f64,
            flags: self.header.flags,
            null_count,
            short_count,
        }
    }

    /// Every key with its vector count, in catalog order.
    pub fn dump(&self) -> Vec<(String, u32)> {
        self.seg_table()
            .iter()
            .enumerate()
            .map(|(k, &n)| (self.key_at(k), n))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FeatureWriter;
    use tempfile::TempDir;

    pub(crate) fn small_db(dir: &TempDir, slack: u64) -> Database {
        let path = dir.path().join("test.adb");
        Database::create_sized(&path, Layout::min_size() + slack).unwrap()
    }

    pub(crate) fn write_features(dir: &TempDir, name: &str, dim: usize, rows: &[&[f64]]) -> PathBuf {
        let path = dir.path().join(name);
        let mut writer = FeatureWriter::new(&path, dim).unwrap();
        for row in rows {
            writer.write_vector(row).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn insert_simple(db: &mut Database, features: &Path, key: &str) -> InsertOutcome {
        db.insert(&InsertRequest {
            features,
            key: Some(key),
            times: None,
        })
        .unwrap()
    }

    #[test]
    fn test_create_open_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.adb");
        {
            Database::create_sized(&path, Layout::min_size() + 8192).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.header().num_files, 0);
        assert_eq!(db.header().dim, 0);
        assert_eq!(db.header().length, 0);
        assert_eq!(db.status(16).total_vectors, 0);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.adb");
        std::fs::write(&path, vec![0u8; Layout::min_size() as usize]).unwrap();
        assert!(matches!(
            Database::open(&path),
            Err(DbError::Layout(LayoutError::CorruptHeader { .. }))
        ));
    }

    #[test]
    fn test_insert_grows_tables_in_lockstep() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        let a = write_features(&dir, "a.ftr", 2, &[&[0.0, 1.0], &[1.0, 0.0]]);
        let b = write_features(&dir, "b.ftr", 2, &[&[0.5, 0.5]]);

        assert_eq!(
            insert_simple(&mut db, &a, "first"),
            InsertOutcome::Inserted {
                vectors: 2,
                bytes: 32
            }
        );
        insert_simple(&mut db, &b, "second");

        let header = db.header();
        assert_eq!(header.num_files, 2);
        assert_eq!(header.dim, 2);
        // length = 8 · dim · Σ segTable
        assert_eq!(header.length as usize, 8 * 2 * 3);
        assert_eq!(db.seg_table(), &[2, 1]);
        assert_eq!(db.payload(), &[0.0, 1.0, 1.0, 0.0, 0.5, 0.5]);
        assert_eq!(db.dump(), vec![("first".into(), 2), ("second".into(), 1)]);
        assert_eq!(db.find_key("second"), Some(1));
        assert_eq!(db.find_key("sec"), Some(1)); // prefix-match contract
        assert_eq!(db.find_key("absent"), None);
    }

    #[test]
    fn test_duplicate_key_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        let a = write_features(&dir, "a.ftr", 2, &[&[0.0, 1.0]]);

        insert_simple(&mut db, &a, "thekey");
        let before = db.status(16);
        assert_eq!(insert_simple(&mut db, &a, "thekey"), InsertOutcome::DuplicateKey);
        assert_eq!(db.status(16), before);
    }

    #[test]
    fn test_zero_length_file_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        let empty = write_features(&dir, "empty.ftr", 2, &[]);

        assert_eq!(
            insert_simple(&mut db, &empty, "nothing"),
            InsertOutcome::EmptyFeatureFile
        );
        assert_eq!(db.header().num_files, 0);
        assert_eq!(db.header().length, 0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        let a = write_features(&dir, "a.ftr", 2, &[&[0.0, 1.0]]);
        let b = write_features(&dir, "b.ftr", 3, &[&[0.0, 1.0, 2.0]]);

        insert_simple(&mut db, &a, "first");
        let err = db
            .insert(&InsertRequest {
                features: &b,
                key: Some("second"),
                times: None,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::DimensionMismatch {
                expected: 2,
                got: 3
            }
        ));
    }

    #[test]
    fn test_capacity_check() {
        let dir = TempDir::new().unwrap();
        // room for exactly 4 vectors of dim 2
        let mut db = small_db(&dir, 4 * 2 * 8);
        let a = write_features(&dir, "a.ftr", 2, &[&[0.0, 1.0], &[1.0, 0.0], &[0.5, 0.5]]);
        let b = write_features(&dir, "b.ftr", 2, &[&[1.0, 1.0], &[2.0, 2.0]]);

        insert_simple(&mut db, &a, "fits");
        let err = db
            .insert(&InsertRequest {
                features: &b,
                key: Some("overflows"),
                times: None,
            })
            .unwrap_err();
        assert!(matches!(err, DbError::Full { .. }));
        assert_eq!(db.header().num_files, 1);
    }

    #[test]
    fn test_timestamp_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        let a = write_features(&dir, "a.ftr", 2, &[&[0.0, 1.0], &[1.0, 0.0]]);
        let b = write_features(&dir, "b.ftr", 2, &[&[0.5, 0.5]]);
        let times_a = dir.path().join("a.times");
        std::fs::write(&times_a, "0.0 0.1\n").unwrap();

        db.insert(&InsertRequest {
            features: &a,
            key: Some("first"),
            times: Some(&times_a),
        })
        .unwrap();
        assert!(db.header().is_timestamped());
        assert_eq!(db.times(), &[0.0, 0.1]);

        // once timestamped, inserts must keep supplying times
        let err = db
            .insert(&InsertRequest {
                features: &b,
                key: Some("second"),
                times: None,
            })
            .unwrap_err();
        assert!(matches!(err, DbError::TimesRequired));
    }

    #[test]
    fn test_times_count_tolerance() {
        let dir = TempDir::new().unwrap();

        for (text, ok) in [
            ("0.0", false),            // N-1
            ("0.0 0.1", true),         // N
            ("0.0 0.1 0.2", true),     // N+1
            ("0.0 0.1 0.2 0.3", true), // N+2
            ("0.0 0.1 0.2 0.3 0.4", false),
        ] {
            let mut db = small_db(&dir, 65536);
            let name = format!("a{}.ftr", text.len());
            let a = write_features(&dir, &name, 2, &[&[0.0, 1.0], &[1.0, 0.0]]);
            let times = dir.path().join(format!("t{}.times", text.len()));
            std::fs::write(&times, text).unwrap();

            let result = db.insert(&InsertRequest {
                features: &a,
                key: Some("first"),
                times: Some(&times),
            });
            if ok {
                assert!(result.is_ok(), "expected success for {text:?}");
                assert_eq!(db.times(), &[0.0, 0.1]);
            } else {
                assert!(
                    matches!(result, Err(DbError::TimesCountMismatch { .. })),
                    "expected mismatch for {text:?}"
                );
            }
        }
    }

    #[test]
    fn test_times_ignored_on_populated_untimestamped_db() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        let a = write_features(&dir, "a.ftr", 2, &[&[0.0, 1.0]]);
        let b = write_features(&dir, "b.ftr", 2, &[&[1.0, 0.0]]);
        let times = dir.path().join("b.times");
        std::fs::write(&times, "0.0").unwrap();

        insert_simple(&mut db, &a, "first");
        db.insert(&InsertRequest {
            features: &b,
            key: Some("second"),
            times: Some(&times),
        })
        .unwrap();
        assert!(!db.header().is_timestamped());
    }

    #[test]
    fn test_l2norm_retrofit() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        let a = write_features(&dir, "a.ftr", 2, &[&[3.0, 4.0], &[0.0, 2.0]]);
        insert_simple(&mut db, &a, "first");

        db.l2norm().unwrap();
        assert!(db.header().is_l2_normed());
        assert_eq!(db.norms(), &[5.0, 2.0]);
        for row in db.payload().chunks_exact(2) {
            let norm = crate::vecmath::dot(row, row).sqrt();
            assert!((norm - 1.0).abs() < 1e-9);
        }

        assert!(matches!(db.l2norm(), Err(DbError::AlreadyL2Normed)));
    }

    #[test]
    fn test_l2norm_before_first_insert() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        db.l2norm().unwrap();

        let a = write_features(&dir, "a.ftr", 2, &[&[0.0, 0.5], &[0.5, 0.0]]);
        insert_simple(&mut db, &a, "first");

        // the flag alone makes inserts auto-normalize
        assert_eq!(db.payload(), &[0.0, 1.0, 1.0, 0.0]);
        assert_eq!(db.norms(), &[0.5, 0.5]);
    }

    #[test]
    fn test_batch_insert() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        let a = write_features(&dir, "a.ftr", 2, &[&[0.0, 1.0]]);
        let b = write_features(&dir, "b.ftr", 2, &[&[1.0, 0.0], &[0.5, 0.5]]);

        let list = dir.path().join("features.list");
        std::fs::write(&list, format!("{}\n{}\n", a.display(), b.display())).unwrap();
        let keys = dir.path().join("keys.list");
        std::fs::write(&keys, "alpha\nbeta\n").unwrap();

        let total = db
            .batch_insert(&BatchRequest {
                feature_list: &list,
                key_list: Some(&keys),
                times_list: None,
            })
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(db.dump(), vec![("alpha".into(), 1), ("beta".into(), 2)]);

        // key list == feature list means "key by path"
        let mut db2 = {
            let path = dir.path().join("test2.adb");
            Database::create_sized(&path, Layout::min_size() + 65536).unwrap()
        };
        db2.batch_insert(&BatchRequest {
            feature_list: &list,
            key_list: Some(&list),
            times_list: None,
        })
        .unwrap();
        assert_eq!(db2.key_at(0), a.to_string_lossy());
    }

    #[test]
    fn test_status_census() {
        let dir = TempDir::new().unwrap();
        let mut db = small_db(&dir, 65536);
        let a = write_features(&dir, "a.ftr", 2, &[&[0.0, 1.0], &[1.0, 0.0]]);
        insert_simple(&mut db, &a, "first");

        let status = db.status(16);
        assert_eq!(status.num_files, 1);
        assert_eq!(status.dim, 2);
        assert_eq!(status.total_vectors, 2);
        assert_eq!(status.total_bytes, 32);
        assert_eq!(status.null_count, 0);
        assert_eq!(status.short_count, 1); // 2 vectors < default sequence length

        let roomy = db.status(2);
        assert_eq!(roomy.short_count, 0);
    }
}
