//! Lookups over sorted CDX indexes, either plain text files or ZipNum
//! clusters: gzip-compressed blocks of lines spread over shard files, plus a
//! small sorted summary with one row per block.
//!
//! A query names a key and a [`SearchMode`]. Every source, single or merged,
//! answers through [`CdxSource`] with a lazy stream of matching lines in sort
//! order and a [`TruncationFlag`] that tells the caller whether anything was
//! left out: a skipped source, a damaged block, or a read cap.

pub mod config;
pub mod error;
pub mod fs;
pub mod gzip;
pub mod iter;
pub mod lines;
pub mod loader;
pub mod merge;
pub mod query;
pub mod stream;
pub mod zipnum;

pub use config::{Config, ReadOptions, Registry, Strictness};
pub use error::Error;
pub use iter::{BoxedLines, CloseableIter};
pub use lines::SortedTextFile;
pub use query::{CdxSource, ErrorPolicy, InputSet, Query, SearchMode, SearchResult, TruncationFlag};
pub use zipnum::{builder::ClusterBuilder, ClusterLimits, SummaryRecord, ZipNumCluster};
