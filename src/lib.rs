//! Tremolo-DB - a feature-vector database for content-based retrieval
//!
//! Named sequences of D-dimensional vectors live in one memory-mapped file;
//! similarity queries return ranked matches by inner product.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Query engines (point · segment · sequence)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Database (mmap region · catalog · insert · L2 retrofit)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │        Layout (header · five fixed-offset tables)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All searches are linear scans; speed comes from the flat memory layout
//! and tight inner loops, not from index structures.

pub mod format;
pub mod layout;
pub mod query;
pub mod server;
pub mod store;
pub mod vecmath;

pub use format::{FeatureFile, FeatureWriter};
pub use query::{Hit, QueryOpts, QueryType, TopK};
pub use store::{Database, DbError, InsertOutcome, InsertRequest};
