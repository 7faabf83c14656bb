use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::{anyhow, bail};
use log::debug;

use super::{SummaryRecord, SUMMARY_KEY_FIELDS};
use crate::{
    fs::MemoryFs,
    gzip::write_member,
    iter::{leading_fields, CloseableIter},
    merge::ExternalSorter,
};

pub const SUMMARY_NAME: &str = "ALL.summary";
pub const LOC_NAME: &str = "ALL.loc";

/// Where built files go.
pub trait ClusterSink {
    fn create(&self, name: &str) -> anyhow::Result<Box<dyn Write>>;
}

impl ClusterSink for Path {
    fn create(&self, name: &str) -> anyhow::Result<Box<dyn Write>> {
        let path = self.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }
}

impl ClusterSink for MemoryFs {
    fn create(&self, name: &str) -> anyhow::Result<Box<dyn Write>> {
        Ok(Box::new(MemoryFs::create(self, name)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub records: Vec<SummaryRecord>,
    pub shards: Vec<String>,
    pub lines: u64,
}

/// Writes a cluster: shards of `blocks_per_shard` gzip members holding
/// `lines_per_block` lines each, the summary, and a `.loc` file mapping
/// every shard name to where it was written.
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    lines_per_block: usize,
    blocks_per_shard: usize,
    prefix: String,
}

struct ShardWriter {
    name: String,
    w: Box<dyn Write>,
    offset: u64,
    blocks: usize,
}

impl ClusterBuilder {
    pub fn new(lines_per_block: usize, blocks_per_shard: usize) -> Self {
        ClusterBuilder {
            lines_per_block: lines_per_block.max(1),
            blocks_per_shard: blocks_per_shard.max(1),
            prefix: String::new(),
        }
    }

    /// Prepended to every file name written, e.g. a directory.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_owned();
        self
    }

    fn shard_name(n: usize) -> String {
        format!("part-{:05}.gz", n)
    }

    /// Builds from lines already in sort order.
    pub fn build_sorted<I, S>(&self, lines: I, sink: &S) -> anyhow::Result<BuildSummary>
    where
        I: IntoIterator<Item = String>,
        S: ClusterSink + ?Sized,
    {
        let blocks = SortedBlocks::new(lines.into_iter().map(Ok), self.lines_per_block);
        self.write_fallible_blocks(blocks, sink)
    }

    /// Builds from sorted text, one line per row, reading a block at a time.
    pub fn build_from_reader<R, S>(&self, reader: R, sink: &S) -> anyhow::Result<BuildSummary>
    where
        R: BufRead,
        S: ClusterSink + ?Sized,
    {
        let lines = reader.lines().map(|line| line.map_err(anyhow::Error::from));
        self.write_fallible_blocks(SortedBlocks::new(lines, self.lines_per_block), sink)
    }

    /// Sorts `lines` with `sorter` first.
    pub fn build_unsorted<I, S>(&self, lines: &mut I, sorter: &ExternalSorter, sink: &S) -> anyhow::Result<BuildSummary>
    where
        I: CloseableIter<String> + ?Sized,
        S: ClusterSink + ?Sized,
    {
        let mut sorted = tempfile::tempfile()?;
        {
            let mut w = BufWriter::new(&mut sorted);
            sorter.sort(lines, &mut w)?;
            w.flush()?;
        }
        sorted.seek(SeekFrom::Start(0))?;
        self.build_from_reader(BufReader::new(sorted), sink)
    }

    /// Writes caller-chosen blocks, one gzip member each.
    pub fn write_blocks<B, S>(&self, blocks: B, sink: &S) -> anyhow::Result<BuildSummary>
    where
        B: IntoIterator<Item = Vec<String>>,
        S: ClusterSink + ?Sized,
    {
        self.write_fallible_blocks(blocks.into_iter().map(Ok), sink)
    }

    fn write_fallible_blocks<B, S>(&self, blocks: B, sink: &S) -> anyhow::Result<BuildSummary>
    where
        B: Iterator<Item = anyhow::Result<Vec<String>>>,
        S: ClusterSink + ?Sized,
    {
        let mut out = BuildSummary::default();
        let mut shard: Option<ShardWriter> = None;
        let mut data = Vec::new();

        for block in blocks {
            let block = block?;
            let Some(first) = block.first() else {
                continue;
            };
            let key = leading_fields(first, SUMMARY_KEY_FIELDS).to_owned();
            if matches!(out.records.last(), Some(prev) if prev.key > key) {
                bail!("block keys out of order at {:?}", key);
            }

            let mut current = match shard.take() {
                Some(current) if current.blocks < self.blocks_per_shard => current,
                full => {
                    if let Some(mut full) = full {
                        full.w.flush()?;
                    }
                    let name = Self::shard_name(out.shards.len());
                    let w = sink.create(&format!("{}{}", self.prefix, name))?;
                    out.shards.push(name.clone());
                    ShardWriter {
                        name,
                        w,
                        offset: 0,
                        blocks: 0,
                    }
                }
            };

            data.clear();
            for line in &block {
                data.extend_from_slice(line.as_bytes());
                data.push(b'\n');
            }
            let compressed_len = write_member(&mut current.w, &data, None)?;
            out.records.push(SummaryRecord {
                key,
                line_count: block.len() as u64,
                offset: current.offset,
                compressed_len,
                shard: current.name.clone(),
            });
            current.offset += compressed_len;
            current.blocks += 1;
            out.lines += block.len() as u64;
            shard = Some(current);
        }
        if let Some(mut last) = shard.take() {
            last.w.flush()?;
        }

        let mut summary = sink.create(&format!("{}{}", self.prefix, SUMMARY_NAME))?;
        for record in &out.records {
            writeln!(summary, "{}", record)?;
        }
        summary.flush()?;

        let mut loc = sink.create(&format!("{}{}", self.prefix, LOC_NAME))?;
        for name in &out.shards {
            writeln!(loc, "{}\t{}{}", name, self.prefix, name)?;
        }
        loc.flush()?;

        debug!(
            "built {} lines in {} blocks over {} shards",
            out.lines,
            out.records.len(),
            out.shards.len()
        );
        Ok(out)
    }
}

/// Cuts sorted lines into blocks, failing at the first line out of order.
struct SortedBlocks<I> {
    lines: I,
    lines_per_block: usize,
    prev: Option<String>,
    seen: usize,
}

impl<I> SortedBlocks<I> {
    fn new(lines: I, lines_per_block: usize) -> Self {
        SortedBlocks {
            lines,
            lines_per_block,
            prev: None,
            seen: 0,
        }
    }
}

impl<I: Iterator<Item = anyhow::Result<String>>> Iterator for SortedBlocks<I> {
    type Item = anyhow::Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut block = Vec::with_capacity(self.lines_per_block);
        while block.len() < self.lines_per_block {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            };
            self.seen += 1;
            if matches!(&self.prev, Some(p) if *p > line) {
                return Some(Err(anyhow!("input is not sorted at line {}: {:?}", self.seen, line)));
            }
            self.prev = Some(line.clone());
            block.push(line);
        }
        (!block.is_empty()).then_some(Ok(block))
    }
}
