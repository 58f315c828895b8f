//! Query engines
//!
//! Three linear-scan ranking engines over one database:
//!
//! - **point**: exhaustive k-nearest by inner product over every payload
//!   vector;
//! - **segment**: per-key ranking, each key scored by the mean of its top
//!   `point_nn` point scores;
//! - **sequence**: matched-filter correlation over length-`W` shingles with
//!   a power/silence gate (requires an L2-normed database).
//!
//! On an L2-normed database the query vectors are copied and unit-normalized
//! first, so every score is a cosine similarity in `[-1, 1]`: higher is more
//! similar, and all result lists are descending.

use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::format::{read_times, FeatureFile, FormatError};
use crate::store::{Database, DbError};
use crate::vecmath::{dot, unit_norm_recording};

/// Relative tolerance of the timestamp duration gate.
pub const TIMES_TOL: f64 = 0.1;

const KNOB_MAX: usize = 1000;
const QPOINT_MAX: usize = 10_000;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("database must be L2-normed for sequence queries")]
    NotL2Normed,

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("{what} out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        what: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },

    #[error("unknown query type: {0}")]
    UnknownQueryType(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Format(#[from] FormatError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Point,
    Segment,
    Sequence,
}

impl FromStr for QueryType {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "point" => Ok(Self::Point),
            "segment" => Ok(Self::Segment),
            "sequence" => Ok(Self::Sequence),
            other => Err(QueryError::UnknownQueryType(other.to_string())),
        }
    }
}

/// Ranking knobs shared by the engines.
#[derive(Debug, Clone)]
pub struct QueryOpts {
    /// Single query point to use; `None` iterates every query vector
    /// (exhaustive mode).
    pub qpoint: Option<usize>,
    /// Point-level list length (`-n`).
    pub point_nn: usize,
    /// Segment-level result length (`-r`).
    pub seg_nn: usize,
    /// Shingle length `W` for sequence queries (`-l`).
    pub seq_len: usize,
    /// Shingle hop `H` for sequence queries (`-h`).
    pub seq_hop: usize,
}

impl Default for QueryOpts {
    fn default() -> Self {
        Self {
            qpoint: Some(0),
            point_nn: 10,
            seg_nn: 10,
            seq_len: 16,
            seq_hop: 1,
        }
    }
}

impl QueryOpts {
    fn validate(&self) -> Result<(), QueryError> {
        let knobs = [
            ("pointNN", self.point_nn),
            ("resultLength", self.seg_nn),
            ("sequenceLength", self.seq_len),
            ("sequenceHop", self.seq_hop),
        ];
        for (what, value) in knobs {
            if !(1..=KNOB_MAX).contains(&value) {
                return Err(QueryError::OutOfRange {
                    what,
                    value,
                    min: 1,
                    max: KNOB_MAX,
                });
            }
        }
        if let Some(p) = self.qpoint {
            if p > QPOINT_MAX {
                return Err(QueryError::OutOfRange {
                    what: "queryPoint",
                    value: p,
                    min: 0,
                    max: QPOINT_MAX,
                });
            }
        }
        Ok(())
    }
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub key: String,
    pub distance: f64,
    pub qpos: u32,
    pub spos: u32,
}

// ----------------------------------------------------------------------
// Top-K primitive
// ----------------------------------------------------------------------

struct Slot<P> {
    score: f64,
    payload: Option<P>,
}

/// Fixed-length descending score list maintained by shift-insertion.
///
/// A candidate enters at the bottom-most rank whose score it meets, so equal
/// scores rank below earlier insertions. Scores below every kept score (in
/// particular negative scores against empty 0.0 slots) are dropped.
pub struct TopK<P> {
    slots: Vec<Slot<P>>,
}

impl<P> TopK<P> {
    pub fn new(k: usize) -> Self {
        assert!(k > 0);
        Self {
            slots: (0..k).map(|_| Slot { score: 0.0, payload: None }).collect(),
        }
    }

    pub fn try_insert(&mut self, score: f64, payload: P) {
        let mut n = self.slots.len();
        while n > 0 {
            n -= 1;
            if score < self.slots[n].score {
                return;
            }
            if n == 0 || score <= self.slots[n - 1].score {
                self.slots[n..].rotate_right(1);
                self.slots[n] = Slot {
                    score,
                    payload: Some(payload),
                };
                return;
            }
        }
    }

    /// Mean over all `k` slots; never-filled slots count as 0.0.
    pub fn mean(&self) -> f64 {
        self.slots.iter().map(|s| s.score).sum::<f64>() / self.slots.len() as f64
    }

    /// Occupied entries in rank order (descending by score).
    pub fn entries(&self) -> impl Iterator<Item = (f64, &P)> {
        self.slots
            .iter()
            .filter_map(|s| s.payload.as_ref().map(|p| (s.score, p)))
    }

    /// Highest-ranked occupied entry.
    pub fn best(&self) -> Option<(f64, &P)> {
        self.entries().next()
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.score = 0.0;
            slot.payload = None;
        }
    }
}

// ----------------------------------------------------------------------
// Timestamp gate
// ----------------------------------------------------------------------

/// Successive intervals of a timestamp stream; the final slot has no
/// defined interval and is pinned to 0.0.
fn intervals(times: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; times.len()];
    for i in 0..times.len().saturating_sub(1) {
        out[i] = times[i + 1] - times[i];
    }
    out
}

/// Mean interval of a timestamp stream, 0.0 when fewer than two points.
fn mean_interval(times: &[f64]) -> f64 {
    match times.len() {
        0 | 1 => 0.0,
        n => (times[n - 1] - times[0]) / (n - 1) as f64,
    }
}

fn within_tolerance(db_dur: f64, q_dur: f64) -> bool {
    (db_dur - q_dur).abs() < q_dur * TIMES_TOL
}

/// Load and validate query timestamps, deciding whether the duration gate
/// applies. The gate needs timestamps on both sides; a one-sided supply is
/// warned about and ignored. The times file tolerates up to two trailing
/// extra values, like insertion.
fn query_times(
    db: &Database,
    times: Option<&Path>,
    num_vectors: usize,
) -> Result<Option<Vec<f64>>, QueryError> {
    match (times, db.header().is_timestamped()) {
        (Some(_), false) => {
            tracing::warn!("ignoring query timestamps for non-timestamped database");
            Ok(None)
        }
        (None, true) => {
            tracing::warn!("no timestamps given for query, ignoring database timestamps");
            Ok(None)
        }
        (None, false) => Ok(None),
        (Some(path), true) => {
            let values = match read_times(path) {
                Ok(values) => values,
                Err(FormatError::Io(source)) => {
                    return Err(DbError::TimesFileMissing {
                        path: path.to_path_buf(),
                        source,
                    }
                    .into())
                }
                Err(err) => return Err(err.into()),
            };
            if values.len() < num_vectors || values.len() > num_vectors + 2 {
                return Err(DbError::TimesCountMismatch {
                    expected: num_vectors,
                    got: values.len(),
                }
                .into());
            }
            Ok(Some(values[..num_vectors].to_vec()))
        }
    }
}

// ----------------------------------------------------------------------
// Shared scaffolding
// ----------------------------------------------------------------------

/// Query payload, unit-normalized iff the database is.
fn load_query(db: &Database, features: &Path) -> Result<Option<(Vec<f64>, Vec<f64>)>, QueryError> {
    let feature = FeatureFile::open(features)?;
    if db.header().dim == 0 {
        // empty database: nothing can match
        return Ok(None);
    }
    if feature.dim() != db.header().dim as usize {
        return Err(DbError::DimensionMismatch {
            expected: db.header().dim,
            got: feature.dim() as u32,
        }
        .into());
    }
    if feature.num_vectors() == 0 {
        return Ok(None);
    }

    let mut q = feature.vectors();
    let qnorm = if db.header().is_l2_normed() {
        unit_norm_recording(&mut q, feature.dim())
    } else {
        Vec::new()
    };
    Ok(Some((q, qnorm)))
}

/// Resolve an optional key-list restriction to segment positions; without
/// one, every segment is scanned in catalog order.
fn resolve_segments(db: &Database, key_list: Option<&[String]>) -> Result<Vec<usize>, QueryError> {
    match key_list {
        Some(keys) => keys
            .iter()
            .map(|key| {
                db.find_key(key)
                    .ok_or_else(|| QueryError::KeyNotFound(key.clone()))
            })
            .collect(),
        None => Ok((0..db.header().num_files as usize).collect()),
    }
}

/// Prefix-sum of the segment table, in vectors.
fn segment_offsets(db: &Database) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(db.seg_table().len());
    let mut cum = 0usize;
    for &n in db.seg_table() {
        offsets.push(cum);
        cum += n as usize;
    }
    offsets
}

fn check_qpoint(qpoint: usize, limit: usize, what: &'static str) -> Result<(), QueryError> {
    if limit == 0 || qpoint > limit - 1 {
        return Err(QueryError::OutOfRange {
            what,
            value: qpoint,
            min: 0,
            max: limit.saturating_sub(1),
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Point query
// ----------------------------------------------------------------------

/// Exhaustive k-nearest point search over every payload vector.
pub fn point_query(
    db: &Database,
    features: &Path,
    opts: &QueryOpts,
    times: Option<&Path>,
) -> Result<Vec<Hit>, QueryError> {
    opts.validate()?;
    let Some((q, _)) = load_query(db, features)? else {
        return Ok(Vec::new());
    };
    let dim = db.header().dim as usize;
    let nq = q.len() / dim;
    let total = db.header().total_vectors();
    let payload = db.payload();

    let q_times = query_times(db, times, nq)?;
    let gate = q_times.map(|ts| (intervals(&ts), intervals(db.times())));

    // with the gate on, the last query vector has no interval to compare
    let nq_eff = if gate.is_some() { nq - 1 } else { nq };
    let q_range = match opts.qpoint {
        Some(p) => {
            check_qpoint(p, nq, "queryPoint")?;
            p..p + 1
        }
        None => 0..nq_eff,
    };

    let mut top = TopK::new(opts.point_nn);
    for qi in q_range {
        let q_row = &q[qi * dim..(qi + 1) * dim];
        for di in 0..total {
            if let Some((q_durs, db_durs)) = &gate {
                if !within_tolerance(db_durs[di], q_durs[qi]) {
                    continue;
                }
            }
            let score = dot(q_row, &payload[di * dim..(di + 1) * dim]);
            top.try_insert(score, (qi as u32, di as u32));
        }
    }

    // map each global vector index to (key, offset within key)
    let seg = db.seg_table();
    let mut hits = Vec::new();
    for (score, &(qi, di)) in top.entries() {
        let mut cum = 0u32;
        for (k, &n) in seg.iter().enumerate() {
            cum += n;
            if di < cum {
                hits.push(Hit {
                    key: db.key_at(k),
                    distance: score,
                    qpos: qi,
                    spos: di + n - cum,
                });
                break;
            }
        }
    }
    Ok(hits)
}

// ----------------------------------------------------------------------
// Segment point query
// ----------------------------------------------------------------------

/// Rank whole segments by the mean of their top `point_nn` point scores.
pub fn seg_point_query(
    db: &Database,
    features: &Path,
    opts: &QueryOpts,
    times: Option<&Path>,
    key_list: Option<&[String]>,
) -> Result<Vec<Hit>, QueryError> {
    opts.validate()?;
    let Some((q, _)) = load_query(db, features)? else {
        return Ok(Vec::new());
    };
    let dim = db.header().dim as usize;
    let nq = q.len() / dim;
    let payload = db.payload();

    let q_times = query_times(db, times, nq)?;
    let mean_q_dur = q_times.as_ref().map(|ts| mean_interval(ts));

    if let Some(p) = opts.qpoint {
        check_qpoint(p, nq, "queryPoint")?;
    }

    let segments = resolve_segments(db, key_list)?;
    let offsets = segment_offsets(db);
    let seg_table = db.seg_table();

    let mut seg_top = TopK::new(opts.seg_nn);
    let mut point_top = TopK::new(opts.point_nn);

    for &s in &segments {
        let count = seg_table[s] as usize;
        let base = offsets[s];

        if let Some(mq) = mean_q_dur {
            let window = &db.times()[base..base + count];
            if !within_tolerance(mean_interval(window), mq) {
                continue;
            }
        }

        point_top.reset();
        let q_range = match opts.qpoint {
            Some(p) => p..p + 1,
            None => 0..nq,
        };
        for qi in q_range {
            let q_row = &q[qi * dim..(qi + 1) * dim];
            for k in 0..count {
                let row = &payload[(base + k) * dim..(base + k + 1) * dim];
                point_top.try_insert(dot(q_row, row), (qi as u32, k as u32));
            }
        }

        let score = point_top.mean();
        if let Some((_, &(bq, bs))) = point_top.best() {
            seg_top.try_insert(score, (s, bq, bs));
        }
    }

    Ok(seg_top
        .entries()
        .map(|(score, &(s, bq, bs))| Hit {
            key: db.key_at(s),
            distance: score,
            qpos: bq,
            spos: bs,
        })
        .collect())
}

// ----------------------------------------------------------------------
// Sequence query (matched filter)
// ----------------------------------------------------------------------

/// Running sums of `w` consecutive norms: `sums[i] = Σ norms[i..i+w]`,
/// maintained by the sliding recurrence
/// `s[i] = s[i-1] - norm[i-1] + norm[i+w-1]`.
fn shingle_sums(norms: &[f64], w: usize) -> Vec<f64> {
    if norms.len() < w {
        return Vec::new();
    }
    let mut sums = Vec::with_capacity(norms.len() - w + 1);
    let mut acc: f64 = norms[..w].iter().sum();
    sums.push(acc);
    for i in 1..=norms.len() - w {
        acc = acc - norms[i - 1] + norms[i + w - 1];
        sums.push(acc);
    }
    sums
}

/// Matched-filter search over length-`W` shingles.
///
/// Scores are mean inner products along diagonals of the query/segment
/// cross-correlation matrix. A shingle pair is admitted only when both
/// shingle norms clear the silence threshold, both exceed their stream
/// means, and their difference stays under the diff threshold; gated pairs
/// score 0.
pub fn seg_sequence_query(
    db: &Database,
    features: &Path,
    opts: &QueryOpts,
    times: Option<&Path>,
    key_list: Option<&[String]>,
) -> Result<Vec<Hit>, QueryError> {
    opts.validate()?;
    if !db.header().is_l2_normed() {
        return Err(QueryError::NotL2Normed);
    }
    let Some((q, qnorm)) = load_query(db, features)? else {
        return Ok(Vec::new());
    };
    let dim = db.header().dim as usize;
    let nq = q.len() / dim;
    let w = opts.seq_len;
    let hop = opts.seq_hop;
    if w > nq {
        return Err(QueryError::OutOfRange {
            what: "sequenceLength",
            value: w,
            min: 1,
            max: nq,
        });
    }
    let payload = db.payload();
    let seg_table = db.seg_table();
    let offsets = segment_offsets(db);
    let segments = resolve_segments(db, key_list)?;

    // per-segment shingle norms and their means; thresholds from the global
    // mean over segments long enough to hold a shingle
    let norms = db.norms();
    let mut seg_sums: Vec<Vec<f64>> = Vec::with_capacity(seg_table.len());
    let mut seg_mean = vec![0.0f64; seg_table.len()];
    let mut processed = 0usize;
    let mut global_mean = 0.0f64;
    for (s, &n) in seg_table.iter().enumerate() {
        let count = n as usize;
        let sums = shingle_sums(&norms[offsets[s]..offsets[s] + count], w);
        if !sums.is_empty() {
            seg_mean[s] = sums.iter().sum::<f64>() / sums.len() as f64;
            global_mean += seg_mean[s];
            processed += 1;
        }
        seg_sums.push(sums);
    }
    if processed > 0 {
        global_mean /= processed as f64;
    }
    let diff_thresh = global_mean / 2.0;
    let silence_thresh = diff_thresh / 10.0;

    let q_sums = shingle_sums(&qnorm, w);
    let q_mean = q_sums.iter().sum::<f64>() / q_sums.len() as f64;

    let q_times = query_times(db, times, nq)?;
    let mean_q_dur = q_times.as_ref().map(|ts| mean_interval(ts));

    // restrict to one query shingle when a query point is set
    let (q_base, nq_eff) = match opts.qpoint {
        Some(p) => {
            check_qpoint(p, nq - w + 1, "queryPoint")?;
            (p, w)
        }
        None => (0, nq),
    };

    // scratch for the correlation and matched-filter matrices, sized once
    // for the longest matchable segment
    let max_count = segments
        .iter()
        .map(|&s| seg_table[s] as usize)
        .filter(|&c| c > w)
        .max()
        .unwrap_or(0);
    let mut d = vec![0.0f64; nq_eff * max_count];
    let mut dd = vec![0.0f64; nq_eff * max_count];

    let mut seg_top = TopK::new(opts.seg_nn);
    let mut point_top = TopK::new(opts.point_nn);

    for &s in &segments {
        let count = seg_table[s] as usize;
        if count <= w {
            continue;
        }
        let base = offsets[s];

        if let Some(mq) = mean_q_dur {
            let window = &db.times()[base..base + count];
            if !within_tolerance(mean_interval(window), mq) {
                continue;
            }
        }

        // cross-correlation D[j][k] = <query[q_base+j], data[base+k]>
        for j in 0..nq_eff {
            let q_row = &q[(q_base + j) * dim..(q_base + j + 1) * dim];
            for k in 0..count {
                let row = &payload[(base + k) * dim..(base + k + 1) * dim];
                d[j * count + k] = dot(q_row, row);
            }
        }

        // matched filter DD[j][k] = Σ_w D[j+w][k+w], walking one diagonal
        // at a time
        dd[..nq_eff * count].fill(0.0);
        for wi in 0..w {
            for j in (0..nq_eff - wi).step_by(hop) {
                for k in (0..count - wi).step_by(hop) {
                    dd[j * count + k] += d[(j + wi) * count + (k + wi)];
                }
            }
        }

        point_top.reset();
        for j in (0..=nq_eff - w).step_by(hop) {
            let qn = q_sums[q_base + j];
            let qpos = if opts.qpoint.is_some() { q_base } else { j };
            for k in (0..=count - w).step_by(hop) {
                let sn = seg_sums[s][k];
                let admitted = qn > silence_thresh
                    && sn > silence_thresh
                    && qn > q_mean
                    && sn > seg_mean[s]
                    && (qn - sn).abs() < diff_thresh;
                let score = if admitted {
                    dd[j * count + k] / w as f64
                } else {
                    0.0
                };
                point_top.try_insert(score, (qpos as u32, k as u32));
            }
        }

        let score = point_top.mean();
        if let Some((_, &(bq, bs))) = point_top.best() {
            seg_top.try_insert(score, (s, bq, bs));
        }
    }

    Ok(seg_top
        .entries()
        .map(|(score, &(s, bq, bs))| Hit {
            key: db.key_at(s),
            distance: score,
            qpos: bq,
            spos: bs,
        })
        .collect())
}

/// Dispatch on query type. The key-list restriction only applies to the
/// segment-level engines.
pub fn query(
    db: &Database,
    query_type: QueryType,
    features: &Path,
    opts: &QueryOpts,
    times: Option<&Path>,
    key_list: Option<&[String]>,
) -> Result<Vec<Hit>, QueryError> {
    match query_type {
        QueryType::Point => point_query(db, features, opts, times),
        QueryType::Segment => seg_point_query(db, features, opts, times, key_list),
        QueryType::Sequence => seg_sequence_query(db, features, opts, times, key_list),
    }
}
