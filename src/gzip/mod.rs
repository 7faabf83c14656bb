// Reader for a concatenation of independent gzip members (RFC 1952), the
// layout of ZipNum shards: every block is its own member, so a member can be
// decoded starting from its offset without touching the ones before it.
//
// Each member is:
//
//   +---+---+---+---+---+---+---+---+---+---+
//   |ID1|ID2|CM |FLG|     MTIME     |XFL|OS |
//   +---+---+---+---+---+---+---+---+---+---+
//   [XLEN, extra] [name\0] [comment\0] [CRC16]
//   deflate data ...
//   +---+---+---+---+---+---+---+---+
//   |     CRC32     |     ISIZE     |
//   +---+---+---+---+---+---+---+---+
//
// The deflate stream ends itself, so the parser inflates until the decoder
// reports the end, then reads the 8 byte footer right after the last input
// byte the decoder consumed. There is no way to skip a member without
// inflating it.

use std::io::{self, BufRead, Read, Write};

use flate2::{Compression, Decompress, FlushDecompress, GzBuilder, Status};
use log::warn;

use crate::{config::Strictness, error::Error};

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const CM_DEFLATE: u8 = 8;

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = 0xe0;

const FOOTER_LEN: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GzipHeader {
    pub flags: u8,
    pub mtime: u32,
    pub xfl: u8,
    pub os: u8,
    pub extra: Option<Vec<u8>>,
    pub name: Option<String>,
    pub comment: Option<String>,
    /// Bytes the header occupies, including the optional parts.
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GzipFooter {
    pub crc32: u32,
    pub isize: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FooterStatus {
    Valid,
    Mismatch {
        stored_crc: u32,
        actual_crc: u32,
        stored_len: u32,
        actual_len: u32,
    },
    /// The series ended before the footer.
    Missing,
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub start_offset: u64,
    pub header: GzipHeader,
    /// Header, deflate data and footer.
    pub compressed_len: u64,
    pub uncompressed_len: u64,
    pub footer: Option<GzipFooter>,
    pub status: FooterStatus,
}

// Counts consumed bytes so member boundaries are known exactly.
struct Counted<R> {
    inner: R,
    consumed: u64,
}

impl<R: BufRead> Read for Counted<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = std::cmp::min(available.len(), out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: BufRead> BufRead for Counted<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.consumed += amt as u64;
        self.inner.consume(amt);
    }
}

#[derive(Debug)]
enum HeaderProblem {
    Truncated,
    Malformed(String),
    Io(io::Error),
}

impl std::fmt::Display for HeaderProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderProblem::Truncated => write!(f, "truncated member header"),
            HeaderProblem::Malformed(msg) => write!(f, "{}", msg),
            HeaderProblem::Io(e) => write!(f, "{}", e),
        }
    }
}

fn take_byte<R: BufRead>(r: &mut R, seen: &mut Vec<u8>) -> Result<u8, HeaderProblem> {
    let buf = r.fill_buf().map_err(HeaderProblem::Io)?;
    let Some(&b) = buf.first() else {
        return Err(HeaderProblem::Truncated);
    };
    r.consume(1);
    seen.push(b);
    Ok(b)
}

fn take_u16<R: BufRead>(r: &mut R, seen: &mut Vec<u8>) -> Result<u16, HeaderProblem> {
    let lo = take_byte(r, seen)?;
    let hi = take_byte(r, seen)?;
    Ok(u16::from_le_bytes([lo, hi]))
}

// Header strings are ISO 8859-1.
fn take_zstring<R: BufRead>(r: &mut R, seen: &mut Vec<u8>) -> Result<String, HeaderProblem> {
    let mut s = String::new();
    loop {
        match take_byte(r, seen)? {
            0 => return Ok(s),
            b => s.push(b as char),
        }
    }
}

fn parse_header<R: BufRead>(r: &mut R) -> Result<GzipHeader, HeaderProblem> {
    let mut seen = Vec::with_capacity(16);
    let id1 = take_byte(r, &mut seen)?;
    let id2 = take_byte(r, &mut seen)?;
    if [id1, id2] != GZIP_MAGIC {
        return Err(HeaderProblem::Malformed(format!(
            "bad magic {:02x}{:02x}",
            id1, id2
        )));
    }
    let cm = take_byte(r, &mut seen)?;
    if cm != CM_DEFLATE {
        return Err(HeaderProblem::Malformed(format!(
            "unsupported compression method {}",
            cm
        )));
    }
    let flags = take_byte(r, &mut seen)?;
    if flags & FRESERVED != 0 {
        return Err(HeaderProblem::Malformed(format!(
            "reserved flag bits set: {:#04x}",
            flags
        )));
    }
    let mut mtime = [0_u8; 4];
    for b in mtime.iter_mut() {
        *b = take_byte(r, &mut seen)?;
    }
    let xfl = take_byte(r, &mut seen)?;
    let os = take_byte(r, &mut seen)?;

    let mut header = GzipHeader {
        flags,
        mtime: u32::from_le_bytes(mtime),
        xfl,
        os,
        ..GzipHeader::default()
    };
    if flags & FEXTRA != 0 {
        let xlen = take_u16(r, &mut seen)?;
        let mut extra = Vec::with_capacity(xlen as usize);
        for _ in 0..xlen {
            extra.push(take_byte(r, &mut seen)?);
        }
        header.extra = Some(extra);
    }
    if flags & FNAME != 0 {
        header.name = Some(take_zstring(r, &mut seen)?);
    }
    if flags & FCOMMENT != 0 {
        header.comment = Some(take_zstring(r, &mut seen)?);
    }
    if flags & FHCRC != 0 {
        let expected = (crc32fast::hash(&seen) & 0xffff) as u16;
        let stored = take_u16(r, &mut seen)?;
        if stored != expected {
            return Err(HeaderProblem::Malformed(format!(
                "header CRC {:#06x} does not match {:#06x}",
                stored, expected
            )));
        }
    }
    header.len = seen.len() as u64;
    Ok(header)
}

struct MemberState {
    start_offset: u64,
    header: GzipHeader,
    inflater: Decompress,
    crc: crc32fast::Hasher,
    produced: u64,
    finished: bool,
    footer: Option<GzipFooter>,
    status: FooterStatus,
}

impl MemberState {
    fn new(start_offset: u64, header: GzipHeader) -> Self {
        MemberState {
            start_offset,
            header,
            inflater: Decompress::new(false),
            crc: crc32fast::Hasher::new(),
            produced: 0,
            finished: false,
            footer: None,
            status: FooterStatus::Missing,
        }
    }
}

/// Lazily walks the members of a gzip series. Members are handed out one at
/// a time; asking for the next one finishes (inflates and discards) whatever
/// is left of the current one.
pub struct GzipSeries<R> {
    input: Counted<R>,
    base_offset: u64,
    strictness: Strictness,
    location: String,
    current: Option<MemberState>,
    done: bool,
    ended_early: bool,
    members: u64,
    bad_footers: u64,
}

impl<R: BufRead> GzipSeries<R> {
    /// `base_offset` is where `input` starts in the outer stream, so member
    /// offsets are reported in the outer stream's coordinates.
    pub fn new(input: R, base_offset: u64, strictness: Strictness, location: &str) -> Self {
        GzipSeries {
            input: Counted { inner: input, consumed: 0 },
            base_offset,
            strictness,
            location: location.to_owned(),
            current: None,
            done: false,
            ended_early: false,
            members: 0,
            bad_footers: 0,
        }
    }

    /// Offset of the next unread compressed byte in the outer stream.
    pub fn offset(&self) -> u64 {
        self.base_offset + self.input.consumed
    }

    /// True when the input stopped mid-member or with bytes that do not start
    /// a member, and the series was cut short instead of failing.
    pub fn ended_early(&self) -> bool {
        self.ended_early
    }

    pub fn members_seen(&self) -> u64 {
        self.members
    }

    pub fn bad_footers(&self) -> u64 {
        self.bad_footers
    }

    pub fn next_member(&mut self) -> anyhow::Result<Option<GzipMember<'_, R>>> {
        self.drain_current()?;
        self.current = None;
        if self.done {
            return Ok(None);
        }
        let start = self.offset();
        if self.input.fill_buf()?.is_empty() {
            self.done = true;
            return Ok(None);
        }
        match parse_header(&mut self.input) {
            Ok(header) => {
                self.current = Some(MemberState::new(start, header));
                self.members += 1;
                Ok(Some(GzipMember { series: self }))
            }
            Err(HeaderProblem::Io(e)) => Err(e.into()),
            Err(problem) => {
                self.done = true;
                match self.strictness {
                    Strictness::Strict => {
                        Err(Error::corrupt(&self.location, start, problem.to_string()).into())
                    }
                    Strictness::Lenient => {
                        warn!(
                            "{}: series ended early at offset {}: {}",
                            self.location, start, problem
                        );
                        self.ended_early = true;
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Reads the next member completely.
    pub fn next_member_bytes(&mut self) -> anyhow::Result<Option<(MemberInfo, Vec<u8>)>> {
        let Some(mut member) = self.next_member()? else {
            return Ok(None);
        };
        let mut data = Vec::new();
        member.read_to_end(&mut data)?;
        let info = member.finish()?;
        Ok(Some((info, data)))
    }

    fn corrupt(&self, offset: u64, message: String) -> io::Error {
        Error::corrupt(&self.location, offset, message).into_io()
    }

    // EOF inside a member.
    fn cut_short(&mut self, what: &str) -> io::Result<usize> {
        let offset = self.offset();
        if let Some(state) = self.current.as_mut() {
            state.finished = true;
        }
        self.done = true;
        match self.strictness {
            Strictness::Strict => Err(self.corrupt(offset, format!("{} truncated", what))),
            Strictness::Lenient => {
                warn!(
                    "{}: series ended early at offset {}: {} truncated",
                    self.location, offset, what
                );
                self.ended_early = true;
                Ok(0)
            }
        }
    }

    fn inflate(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            let state = match self.current.as_mut() {
                Some(state) if !state.finished => state,
                _ => return Ok(0),
            };
            let input = self.input.inner.fill_buf()?;
            if input.is_empty() {
                return self.cut_short("member");
            }
            let before_in = state.inflater.total_in();
            let before_out = state.inflater.total_out();
            let status = state
                .inflater
                .decompress(input, out, FlushDecompress::None)
                .map_err(|e| e.to_string());
            let consumed = (state.inflater.total_in() - before_in) as usize;
            let produced = (state.inflater.total_out() - before_out) as usize;
            state.crc.update(&out[..produced]);
            state.produced += produced as u64;
            let start = state.start_offset;
            self.input.consume(consumed);

            match status {
                Ok(Status::StreamEnd) => {
                    self.read_footer()?;
                    return Ok(produced);
                }
                Ok(_) if produced > 0 => return Ok(produced),
                Ok(_) if consumed == 0 => {
                    return Err(self.corrupt(start, "inflater made no progress".to_owned()))
                }
                Ok(_) => continue,
                Err(msg) => {
                    if let Some(state) = self.current.as_mut() {
                        state.finished = true;
                    }
                    self.done = true;
                    return Err(self.corrupt(start, msg));
                }
            }
        }
    }

    fn read_footer(&mut self) -> io::Result<()> {
        let mut buf = [0_u8; FOOTER_LEN];
        let mut filled = 0;
        while filled < FOOTER_LEN {
            let n = self.input.read(&mut buf[filled..])?;
            if n == 0 {
                self.cut_short("footer")?;
                return Ok(());
            }
            filled += n;
        }
        let footer = GzipFooter {
            crc32: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            isize: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        };
        let Some(state) = self.current.as_mut() else {
            return Ok(());
        };
        state.finished = true;
        state.footer = Some(footer);
        let actual_crc = state.crc.clone().finalize();
        // ISIZE is the length modulo 2^32.
        let actual_len = state.produced as u32;
        if actual_crc == footer.crc32 && actual_len == footer.isize {
            state.status = FooterStatus::Valid;
            return Ok(());
        }
        state.status = FooterStatus::Mismatch {
            stored_crc: footer.crc32,
            actual_crc,
            stored_len: footer.isize,
            actual_len,
        };
        let start = state.start_offset;
        self.bad_footers += 1;
        let message = format!(
            "footer mismatch: crc {:#010x} vs {:#010x}, length {} vs {}",
            footer.crc32, actual_crc, footer.isize, actual_len
        );
        match self.strictness {
            Strictness::Strict => Err(self.corrupt(start, message)),
            Strictness::Lenient => {
                warn!("{}: member at {}: {}", self.location, start, message);
                Ok(())
            }
        }
    }

    fn drain_current(&mut self) -> io::Result<()> {
        let mut scratch = [0_u8; 8192];
        while self.inflate(&mut scratch)? > 0 {}
        Ok(())
    }

    fn take_info(&mut self) -> Option<MemberInfo> {
        let end = self.offset();
        self.current.take().map(|state| MemberInfo {
            start_offset: state.start_offset,
            header: state.header,
            compressed_len: end - state.start_offset,
            uncompressed_len: state.produced,
            footer: state.footer,
            status: state.status,
        })
    }
}

/// The member currently being read. Reading inflates exactly this member's
/// payload and reports EOF at its end.
pub struct GzipMember<'a, R> {
    series: &'a mut GzipSeries<R>,
}

impl<'a, R: BufRead> GzipMember<'a, R> {
    pub fn header(&self) -> &GzipHeader {
        match self.series.current.as_ref() {
            Some(state) => &state.header,
            None => unreachable!("member outlived its state"),
        }
    }

    pub fn start_offset(&self) -> u64 {
        self.series
            .current
            .as_ref()
            .map(|s| s.start_offset)
            .unwrap_or_default()
    }

    /// Inflates the rest of the member without keeping the output.
    pub fn skip(self) -> anyhow::Result<MemberInfo> {
        self.finish()
    }

    /// Reads whatever is left, validates the footer, and describes the member.
    pub fn finish(self) -> anyhow::Result<MemberInfo> {
        self.series.drain_current()?;
        self.series.take_info().ok_or_else(|| Error::Closed.into())
    }
}

impl<'a, R: BufRead> Read for GzipMember<'a, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.series.inflate(out)
    }
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Appends one standard gzip member holding `data` and returns its
/// compressed size. Any gzip tool can read the result.
pub fn write_member<W: Write>(w: &mut W, data: &[u8], name: Option<&str>) -> io::Result<u64> {
    let mut counting = CountingWriter { inner: w, written: 0 };
    let mut builder = GzBuilder::new();
    if let Some(name) = name {
        builder = builder.filename(name);
    }
    let mut encoder = builder.write(&mut counting, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(counting.written)
}
