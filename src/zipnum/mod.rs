// A ZipNum cluster is a CDX index cut into blocks of consecutive lines. Each
// block is compressed as one gzip member and appended to a shard file; the
// summary has one line per block:
//
//   key<TAB>lineCount<TAB>offset<TAB>compressedLength<TAB>shard
//
// where key is the first two fields of the block's first line. The summary is
// small and sorted, so a query binary-searches it for the first block that
// can hold a match, then pulls blocks one at a time, each with a single
// ranged read of exactly its compressed bytes.

use std::{
    fmt,
    io::Read,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ReadOptions, Strictness},
    error::Error,
    gzip::{FooterStatus, GzipSeries},
    iter::{leading_fields, BoxedLines, CloseableIter},
    lines::LineReader,
    loader::BlockLoader,
    query::{CdxSource, Position, Query, SearchResult, TruncationFlag},
    stream::Stream,
};

pub mod builder;

/// Leading fields of a block's first line that make up its summary key.
pub const SUMMARY_KEY_FIELDS: usize = 2;

/// Largest compressed block a reader will buffer. A summary row claiming
/// more is treated as corrupt.
pub const MAX_BLOCK_BYTES: u64 = 64 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRecord {
    pub key: String,
    pub line_count: u64,
    pub offset: u64,
    pub compressed_len: u64,
    pub shard: String,
}

impl SummaryRecord {
    pub fn parse(row: &str) -> Result<Self, String> {
        let fields: Vec<&str> = row.split('\t').collect();
        let [key, line_count, offset, compressed_len, shard] = fields[..] else {
            return Err(format!("expected 5 tab-separated fields, found {}", fields.len()));
        };
        let number = |name: &str, value: &str| {
            value
                .parse::<u64>()
                .map_err(|e| format!("bad {} {:?}: {}", name, value, e))
        };
        if shard.is_empty() {
            return Err("empty shard name".to_owned());
        }
        Ok(SummaryRecord {
            key: key.to_owned(),
            line_count: number("line count", line_count)?,
            offset: number("offset", offset)?,
            compressed_len: number("compressed length", compressed_len)?,
            shard: shard.to_owned(),
        })
    }
}

impl fmt::Display for SummaryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}",
            self.key, self.line_count, self.offset, self.compressed_len, self.shard
        )
    }
}

fn row_key(row: &str) -> &str {
    row.split('\t').next().unwrap_or_default()
}

/// Caps on how much work one query may do. Hitting one while more blocks
/// are needed ends the result early and marks it truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterLimits {
    pub max_blocks: usize,
    pub max_compressed_bytes: Option<u64>,
    pub time_budget_ms: Option<u64>,
}

impl Default for ClusterLimits {
    fn default() -> Self {
        ClusterLimits {
            max_blocks: 1000,
            max_compressed_bytes: None,
            time_budget_ms: None,
        }
    }
}

impl ClusterLimits {
    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_ms.map(Duration::from_millis)
    }
}

pub struct ZipNumCluster {
    name: String,
    summary: String,
    loader: Arc<dyn BlockLoader>,
    options: ReadOptions,
}

impl ZipNumCluster {
    pub fn new(name: &str, summary: &str, loader: Arc<dyn BlockLoader>, options: ReadOptions) -> Self {
        ZipNumCluster {
            name: name.to_owned(),
            summary: summary.to_owned(),
            loader,
            options,
        }
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    fn iter(
        &self,
        query: &Query,
        truncated: &TruncationFlag,
        skip_blocks: usize,
        page_limit: Option<usize>,
    ) -> anyhow::Result<ClusterIter> {
        let mut summary = self.loader.open(&self.summary, self.options.strictness)?;
        if let Err(e) = position(&mut summary, query) {
            summary.close();
            return Err(e);
        }
        Ok(ClusterIter {
            name: self.name.clone(),
            loader: self.loader.clone(),
            strictness: self.options.strictness,
            limits: self.options.limits,
            query: query.clone(),
            truncated: truncated.clone(),
            summary: Some(summary),
            shard: None,
            block: Vec::new().into_iter(),
            skip_blocks,
            page_limit,
            rows_taken: 0,
            blocks_read: 0,
            bytes_read: 0,
            started: Instant::now(),
            done: false,
        })
    }

    /// Number of blocks a query touches, from the summary alone.
    pub fn count_blocks(&self, query: &Query) -> anyhow::Result<usize> {
        let mut it = self.iter(query, &TruncationFlag::new(), 0, None)?;
        let mut n = 0;
        let result = loop {
            match it.next_record() {
                Ok(Some(_)) => n += 1,
                Ok(None) => break Ok(n),
                Err(e) => break Err(e),
            }
        };
        it.close();
        result
    }

    /// The lines of blocks `[page * page_size, (page + 1) * page_size)` of the
    /// query's blocks, as counted by [`ZipNumCluster::count_blocks`].
    pub fn search_page(&self, query: &Query, page: usize, page_size: usize) -> anyhow::Result<SearchResult> {
        let truncated = TruncationFlag::new();
        let it = self.iter(query, &truncated, page * page_size, Some(page_size))?;
        Ok(SearchResult {
            lines: Box::new(it),
            truncated,
        })
    }
}

// Leaves the summary reader at the last row whose key is strictly below the
// query start cut to summary key width, or at the first row if there is
// none. Row keys hold only the leading fields, so a longer start would sort
// after a row key equal to its own prefix and skip the block before it.
fn position(summary: &mut LineReader, query: &Query) -> anyhow::Result<()> {
    let start = leading_fields(query.start(), SUMMARY_KEY_FIELDS);
    let boundary = summary.find_boundary(|row| row_key(row) < start)?;
    summary.seek_to_previous_line(boundary)?;
    Ok(())
}

impl CdxSource for ZipNumCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, query: &Query, truncated: &TruncationFlag) -> anyhow::Result<BoxedLines> {
        Ok(Box::new(self.iter(query, truncated, 0, None)?))
    }
}

/// Walks summary rows forward and inflates one block at a time, only when
/// the lines of the previous block ran out before passing the query bound.
struct ClusterIter {
    name: String,
    loader: Arc<dyn BlockLoader>,
    strictness: Strictness,
    limits: ClusterLimits,
    query: Query,
    truncated: TruncationFlag,
    summary: Option<LineReader>,
    // Consecutive blocks mostly live in the same shard, so its stream stays
    // open.
    shard: Option<(String, Stream)>,
    block: std::vec::IntoIter<String>,
    skip_blocks: usize,
    page_limit: Option<usize>,
    rows_taken: usize,
    blocks_read: usize,
    bytes_read: u64,
    started: Instant,
    done: bool,
}

impl ClusterIter {
    fn next_record(&mut self) -> anyhow::Result<Option<SummaryRecord>> {
        let Some(summary) = self.summary.as_mut() else {
            return Ok(None);
        };
        loop {
            let at = summary.offset();
            let Some(row) = summary.read_line()? else {
                return Ok(None);
            };
            let record = match SummaryRecord::parse(&row) {
                Ok(record) => record,
                Err(msg) => match self.strictness {
                    Strictness::Strict => {
                        return Err(Error::corrupt(summary.location(), at, msg).into())
                    }
                    Strictness::Lenient => {
                        warn!("{}: skipping summary row at {}: {}", summary.location(), at, msg);
                        self.truncated.mark();
                        continue;
                    }
                },
            };
            if self.query.classify(&record.key) == Position::After {
                return Ok(None);
            }
            return Ok(Some(record));
        }
    }

    fn over_limit(&self, record: &SummaryRecord) -> Option<&'static str> {
        if self.blocks_read >= self.limits.max_blocks {
            return Some("block count");
        }
        if let Some(max) = self.limits.max_compressed_bytes {
            if self.bytes_read.saturating_add(record.compressed_len) > max {
                return Some("compressed bytes");
            }
        }
        match self.limits.time_budget() {
            Some(budget) if self.started.elapsed() >= budget => Some("time"),
            _ => None,
        }
    }

    fn close_shard(&mut self) {
        if let Some((name, mut stream)) = self.shard.take() {
            if let Err(e) = stream.close() {
                debug!("{}: closing {}: {}", self.name, name, e);
            }
        }
    }

    fn fetch(&mut self, record: &SummaryRecord) -> anyhow::Result<Vec<String>> {
        if !matches!(&self.shard, Some((name, _)) if *name == record.shard) {
            self.close_shard();
            let stream = self.loader.open_stream(&record.shard)?;
            self.shard = Some((record.shard.clone(), stream));
        }
        let Some((_, stream)) = self.shard.as_mut() else {
            return Err(Error::Closed.into());
        };
        debug!(
            "{}: block {:?} at {}:{}+{}",
            self.name, record.key, record.shard, record.offset, record.compressed_len
        );
        let location = stream.location().to_owned();
        if record.compressed_len == 0 || record.compressed_len > MAX_BLOCK_BYTES {
            return Err(Error::corrupt(
                &location,
                record.offset,
                format!("compressed length {} out of range", record.compressed_len),
            )
            .into());
        }
        let end = record.offset.checked_add(record.compressed_len);
        if let Some(len) = stream.len()? {
            if !matches!(end, Some(end) if end <= len) {
                return Err(Error::corrupt(
                    &location,
                    record.offset,
                    format!("block of {} bytes runs past shard end {}", record.compressed_len, len),
                )
                .into());
            }
        }
        // One backend read per block.
        stream.set_buffer_size(record.compressed_len as usize);
        stream.set_offset(record.offset)?;

        let mut series = GzipSeries::new(
            Read::take(&mut *stream, record.compressed_len),
            record.offset,
            self.strictness,
            &location,
        );
        let member = series.next_member_bytes()?;
        let ended_early = series.ended_early();
        let corrupt = |msg: String| Error::corrupt(&location, record.offset, msg);

        let Some((info, data)) = member else {
            return Err(corrupt("no gzip member at block offset".to_owned()).into());
        };
        if ended_early || info.status != FooterStatus::Valid {
            return Err(corrupt(format!("damaged block: {:?}", info.status)).into());
        }
        let text = match String::from_utf8(data) {
            Ok(text) => text,
            Err(e) => match self.strictness {
                Strictness::Strict => return Err(corrupt(e.to_string()).into()),
                Strictness::Lenient => {
                    warn!("{}: block at {}: {}", location, record.offset, e);
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            },
        };
        let lines: Vec<String> = text.lines().map(str::to_owned).collect();
        if lines.len() as u64 != record.line_count {
            return Err(corrupt(format!(
                "block has {} lines, summary says {}",
                lines.len(),
                record.line_count
            ))
            .into());
        }
        Ok(lines)
    }
}

impl CloseableIter<String> for ClusterIter {
    fn next(&mut self) -> anyhow::Result<Option<String>> {
        while !self.done {
            if let Some(line) = self.block.next() {
                match self.query.classify(&line) {
                    Position::Before => continue,
                    Position::Inside => return Ok(Some(line)),
                    Position::After => {
                        self.close();
                        break;
                    }
                }
            }

            let record = match self.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.close();
                    break;
                }
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };
            if self.skip_blocks > 0 {
                self.skip_blocks -= 1;
                continue;
            }
            if matches!(self.page_limit, Some(limit) if self.rows_taken >= limit) {
                self.close();
                break;
            }
            self.rows_taken += 1;
            if let Some(cap) = self.over_limit(&record) {
                warn!(
                    "{}: {} cap reached after {} blocks, result truncated",
                    self.name, cap, self.blocks_read
                );
                self.truncated.mark();
                self.close();
                break;
            }

            self.blocks_read += 1;
            self.bytes_read = self.bytes_read.saturating_add(record.compressed_len);
            match self.fetch(&record) {
                Ok(lines) => self.block = lines.into_iter(),
                Err(e) => {
                    let corrupt = matches!(Error::find(&e), Some(Error::Corrupt { .. }));
                    if corrupt && self.strictness == Strictness::Lenient {
                        warn!("{}: skipping block {:?}: {:#}", self.name, record.key, e);
                        self.truncated.mark();
                        continue;
                    }
                    self.close();
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.done = true;
        self.block = Vec::new().into_iter();
        if let Some(mut summary) = self.summary.take() {
            summary.close();
        }
        self.close_shard();
    }
}

impl Drop for ClusterIter {
    fn drop(&mut self) {
        self.close();
    }
}
