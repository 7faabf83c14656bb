use std::{io::BufRead, io::Read, sync::Arc};

use anyhow::bail;
use log::{debug, warn};

use crate::{
    config::Strictness,
    error::Error,
    iter::{BoxedLines, Bounded, CloseableIter},
    loader::BlockLoader,
    query::{CdxSource, Query, TruncationFlag},
    stream::Stream,
};

/// Once the candidate byte range is this small the search reads lines in
/// order instead of probing; one stream buffer covers it.
pub const LINEAR_SCAN_THRESHOLD: u64 = 4096;

const BACKWARD_CHUNK: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    /// First line `>= key`.
    Inclusive,
    /// First line `> key`.
    Strict,
}

/// Line-oriented access to a sorted text file on top of a [`Stream`].
#[derive(Debug)]
pub struct LineReader {
    stream: Stream,
    strictness: Strictness,
    scan_threshold: u64,
    scratch: Vec<u8>,
}

impl LineReader {
    pub fn new(stream: Stream) -> Self {
        Self::with_strictness(stream, Strictness::default())
    }

    pub fn with_strictness(stream: Stream, strictness: Strictness) -> Self {
        LineReader {
            stream,
            strictness,
            scan_threshold: LINEAR_SCAN_THRESHOLD,
            scratch: Vec::with_capacity(512),
        }
    }

    pub fn set_scan_threshold(&mut self, bytes: u64) {
        self.scan_threshold = bytes.max(1);
    }

    pub fn location(&self) -> &str {
        self.stream.location()
    }

    pub fn offset(&self) -> u64 {
        self.stream.offset()
    }

    pub fn seek(&mut self, offset: u64) -> anyhow::Result<()> {
        self.stream.set_offset(offset)?;
        Ok(())
    }

    pub fn len(&mut self) -> anyhow::Result<u64> {
        match self.stream.len()? {
            Some(len) => Ok(len),
            None => bail!("{} has no known length", self.location()),
        }
    }

    pub fn close(&mut self) {
        if let Err(e) = self.stream.close() {
            warn!("closing {}: {}", self.stream.location(), e);
        }
    }

    /// Reads the line at the current offset without its terminator.
    pub fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        let start = self.stream.offset();
        self.scratch.clear();
        if self.stream.read_until(b'\n', &mut self.scratch)? == 0 {
            return Ok(None);
        }
        if self.scratch.last() == Some(&b'\n') {
            self.scratch.pop();
            if self.scratch.last() == Some(&b'\r') {
                self.scratch.pop();
            }
        }
        match std::str::from_utf8(&self.scratch) {
            Ok(s) => Ok(Some(s.to_owned())),
            Err(e) => match self.strictness {
                Strictness::Strict => {
                    Err(Error::corrupt(self.stream.location(), start, e.to_string()).into())
                }
                Strictness::Lenient => {
                    warn!(
                        "{}: invalid UTF-8 in line at offset {}",
                        self.stream.location(),
                        start
                    );
                    Ok(Some(String::from_utf8_lossy(&self.scratch).into_owned()))
                }
            },
        }
    }

    // Consumes through the next newline. False if the file ended first.
    fn skip_line(&mut self) -> anyhow::Result<bool> {
        loop {
            let available = self.stream.fill_buf()?;
            if available.is_empty() {
                return Ok(false);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    self.stream.consume(i + 1);
                    return Ok(true);
                }
                None => {
                    let n = available.len();
                    self.stream.consume(n);
                }
            }
        }
    }

    /// Positions the reader at the first line starting at or after `pos` and
    /// returns that offset (the file length if there is none).
    fn line_start_at_or_after(&mut self, pos: u64) -> anyhow::Result<u64> {
        if pos == 0 {
            self.seek(0)?;
            return Ok(0);
        }
        self.seek(pos - 1)?;
        self.skip_line()?;
        Ok(self.offset())
    }

    /// Finds the first line for which `is_before` is false, assuming it is
    /// true for some prefix of the file and false after. Leaves the reader
    /// positioned at that line and returns its offset.
    ///
    /// Invariants while probing: every line starting before `lo` is before
    /// the boundary, and the boundary line starts in `[lo, hi)` or is the
    /// closest boundary candidate already seen, with no line starting between
    /// `hi` and it.
    pub fn find_boundary<F>(&mut self, mut is_before: F) -> anyhow::Result<u64>
    where
        F: FnMut(&str) -> bool,
    {
        let size = self.len()?;
        let mut lo = 0_u64;
        let mut hi = size;
        let mut steps = 0;
        while hi - lo > self.scan_threshold {
            let mid = lo + (hi - lo) / 2;
            let start = self.line_start_at_or_after(mid)?;
            steps += 1;
            if start >= hi {
                hi = mid;
                continue;
            }
            let before = match self.read_line()? {
                Some(line) => is_before(&line),
                None => false,
            };
            if before {
                lo = start + 1;
            } else {
                hi = mid;
            }
        }

        let mut pos = self.line_start_at_or_after(lo)?;
        while let Some(line) = self.read_line()? {
            if !is_before(&line) {
                break;
            }
            pos = self.offset();
        }
        debug!(
            "{}: boundary at {} after {} steps",
            self.location(),
            pos,
            steps
        );
        self.seek(pos)?;
        Ok(pos)
    }

    /// Starts iterating at the first line `>= key` (or `> key`).
    pub fn search(mut self, key: &str, inclusion: Inclusion) -> anyhow::Result<LineIter> {
        match inclusion {
            Inclusion::Inclusive => self.find_boundary(|line| line < key)?,
            Inclusion::Strict => self.find_boundary(|line| line <= key)?,
        };
        Ok(LineIter::new(self))
    }

    pub fn into_iter_from_here(self) -> LineIter {
        LineIter::new(self)
    }

    /// Moves to the start of the line before the one starting at `offset`.
    /// `None` when `offset` is the first line.
    pub fn seek_to_previous_line(&mut self, offset: u64) -> anyhow::Result<Option<u64>> {
        if offset == 0 {
            return Ok(None);
        }
        // offset - 1 holds the newline ending the previous line.
        let mut chunk_end = offset - 1;
        let mut chunk = Vec::new();
        let mut found = 0;
        while chunk_end > 0 {
            let chunk_start = chunk_end.saturating_sub(BACKWARD_CHUNK);
            chunk.resize((chunk_end - chunk_start) as usize, 0);
            self.seek(chunk_start)?;
            self.stream.read_exact(&mut chunk)?;
            if let Some(i) = chunk.iter().rposition(|b| *b == b'\n') {
                found = chunk_start + i as u64 + 1;
                break;
            }
            chunk_end = chunk_start;
        }
        self.seek(found)?;
        Ok(Some(found))
    }
}

/// Lazily reads lines from wherever its reader was left. Owns the reader and
/// closes it on exhaustion, `close`, or drop.
#[derive(Debug)]
pub struct LineIter {
    reader: Option<LineReader>,
}

impl LineIter {
    pub fn new(reader: LineReader) -> Self {
        LineIter {
            reader: Some(reader),
        }
    }
}

impl CloseableIter<String> for LineIter {
    fn next(&mut self) -> anyhow::Result<Option<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let line = reader.read_line()?;
        if line.is_none() {
            self.close();
        }
        Ok(line)
    }

    fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
    }
}

impl Drop for LineIter {
    fn drop(&mut self) {
        self.close();
    }
}

/// A plain sorted CDX file as a query source.
pub struct SortedTextFile {
    name: String,
    loader: Arc<dyn BlockLoader>,
    strictness: Strictness,
}

impl SortedTextFile {
    pub fn new(name: &str, loader: Arc<dyn BlockLoader>, strictness: Strictness) -> Self {
        SortedTextFile {
            name: name.to_owned(),
            loader,
            strictness,
        }
    }
}

impl CdxSource for SortedTextFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, query: &Query, _truncated: &TruncationFlag) -> anyhow::Result<BoxedLines> {
        let stream = self.loader.open_stream(&self.name)?;
        let reader = LineReader::with_strictness(stream, self.strictness);
        let lines = reader.search(query.start(), Inclusion::Inclusive)?;
        Ok(Box::new(Bounded::new(lines, query.clone())))
    }
}
