// A `Stream` is the one buffering layer every backend sits behind. Backends
// only know how to read from their current position, jump to an absolute
// position, and close; the stream keeps a read-ahead window so that the short
// hops a binary search makes (a jump, a few lines forward, back a little) are
// served from memory instead of costing the backend a seek, which for HTTP is
// a whole new request.
//
// The window is [buf_start, buf_start + buf.len()); the logical offset is
// buf_start + pos and is always the next byte a read returns.

use std::{
    io::{self, BufRead, Read, Seek, SeekFrom},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::error::Error;

pub mod file;
pub mod http;
#[cfg(test)]
pub(crate) mod test_server;

pub use file::FileSource;
pub use http::{
    ConnectionLimiter, ConnectionPermit, HttpSource, DEFAULT_CONNECTION_WAIT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_CONNECTIONS_PER_HOST,
};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Raw byte access to one backend.
pub trait RawSource: Send {
    /// Reads from the current position. Returning 0 for a non-empty `buf`
    /// means the source is exhausted.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Moves the current position to the absolute `offset`.
    fn seek(&mut self, offset: u64) -> io::Result<()>;

    /// Total size in bytes, if the backend can tell.
    fn len(&mut self) -> io::Result<Option<u64>>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Where the bytes come from, for error messages.
    fn location(&self) -> &str;
}

impl<S: RawSource + ?Sized> RawSource for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        (**self).seek(offset)
    }

    fn len(&mut self) -> io::Result<Option<u64>> {
        (**self).len()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn location(&self) -> &str {
        (**self).location()
    }
}

pub struct Stream {
    source: Box<dyn RawSource>,
    buf: Vec<u8>,
    buf_start: u64,
    pos: usize,
    capacity: usize,
    // The backend returned 0 at buf_start + buf.len().
    exhausted: bool,
    closed: bool,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("location", &self.source.location())
            .field("offset", &self.offset())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Stream {
    pub fn new(source: Box<dyn RawSource>) -> Self {
        Self::with_capacity(source, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(source: Box<dyn RawSource>, capacity: usize) -> Self {
        Stream {
            source,
            buf: Vec::with_capacity(capacity),
            buf_start: 0,
            pos: 0,
            capacity: capacity.max(1),
            exhausted: false,
            closed: false,
        }
    }

    /// Opens a stream whose first read happens at `offset`.
    pub fn open_at(source: Box<dyn RawSource>, offset: u64) -> io::Result<Self> {
        let mut stream = Self::new(source);
        if offset > 0 {
            stream.source.seek(offset)?;
            stream.buf_start = offset;
        }
        Ok(stream)
    }

    pub fn from_bytes(location: &str, data: Vec<u8>) -> Self {
        Self::new(Box::new(BytesSource::new(location, data)))
    }

    pub fn location(&self) -> &str {
        self.source.location()
    }

    pub fn offset(&self) -> u64 {
        self.buf_start + self.pos as u64
    }

    /// True once the backend is exhausted and every buffered byte was read.
    pub fn at_eof(&self) -> bool {
        self.exhausted && self.pos == self.buf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Size of subsequent backend reads; takes effect at the next refill.
    pub fn set_buffer_size(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn len(&mut self) -> io::Result<Option<u64>> {
        self.check_open()?;
        self.source.len()
    }

    pub fn set_offset(&mut self, offset: u64) -> io::Result<()> {
        self.check_open()?;
        let window_end = self.buf_start + self.buf.len() as u64;
        if offset >= self.buf_start && offset <= window_end {
            self.pos = (offset - self.buf_start) as usize;
            return Ok(());
        }
        self.source.seek(offset)?;
        self.buf.clear();
        self.buf_start = offset;
        self.pos = 0;
        self.exhausted = false;
        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buf = Vec::new();
        self.pos = 0;
        self.source.close()
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            Err(Error::Closed.into_io())
        } else {
            Ok(())
        }
    }
}

impl BufRead for Stream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.check_open()?;
        if self.pos < self.buf.len() || self.exhausted {
            return Ok(&self.buf[self.pos..]);
        }
        self.buf_start += self.buf.len() as u64;
        self.buf.clear();
        self.buf.resize(self.capacity, 0);
        self.pos = 0;
        let n = loop {
            match self.source.read(&mut self.buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        };
        self.buf.truncate(n);
        if n == 0 {
            self.exhausted = true;
        }
        Ok(&self.buf)
    }

    fn consume(&mut self, amt: usize) {
        self.pos = std::cmp::min(self.pos + amt, self.buf.len());
    }
}

impl Read for Stream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = std::cmp::min(available.len(), out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl Seek for Stream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(d) => self.offset().checked_add_signed(d),
            SeekFrom::End(d) => match self.len()? {
                Some(len) => len.checked_add_signed(d),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("{} has no known length", self.location()),
                    ))
                }
            },
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before byte 0")
        })?;
        self.set_offset(target)?;
        Ok(target)
    }
}

/// In-memory source. Counts backend seeks so tests can tell buffered hops
/// from real ones.
#[derive(Debug, Clone)]
pub struct BytesSource {
    location: String,
    data: Arc<Vec<u8>>,
    pos: usize,
    seeks: Arc<AtomicUsize>,
}

impl BytesSource {
    pub fn new(location: &str, data: Vec<u8>) -> Self {
        Self::shared(location, Arc::new(data))
    }

    pub fn shared(location: &str, data: Arc<Vec<u8>>) -> Self {
        BytesSource {
            location: location.to_owned(),
            data,
            pos: 0,
            seeks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn seek_counter(&self) -> Arc<AtomicUsize> {
        self.seeks.clone()
    }
}

impl RawSource for BytesSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = std::cmp::min(self.pos, self.data.len());
        let n = std::cmp::min(self.data.len() - start, buf.len());
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos = start + n;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.seeks.fetch_add(1, Ordering::SeqCst);
        self.pos = offset as usize;
        Ok(())
    }

    fn len(&mut self) -> io::Result<Option<u64>> {
        Ok(Some(self.data.len() as u64))
    }

    fn location(&self) -> &str {
        &self.location
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::{BufRead, Read, Seek, SeekFrom},
        sync::atomic::Ordering,
    };

    use super::{BytesSource, Stream};
    use crate::error::Error;

    fn numbered(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_seek_inside_window_is_free() {
        let source = BytesSource::new("mem", numbered(1000));
        let seeks = source.seek_counter();
        let mut stream = Stream::with_capacity(Box::new(source), 100);

        let mut buf = [0_u8; 10];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(stream.offset(), 10);

        // Backward and forward inside [0, 100).
        stream.set_offset(3).unwrap();
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 3);
        stream.set_offset(90).unwrap();
        stream.read_exact(&mut buf[..5]).unwrap();
        assert_eq!(buf[0], 90);
        assert_eq!(seeks.load(Ordering::SeqCst), 0);

        // Outside the window: one backend seek.
        stream.set_offset(500).unwrap();
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], (500 % 251) as u8);
        assert_eq!(stream.offset(), 510);
        assert_eq!(seeks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eof_is_never_zero_without_eof() {
        let mut stream = Stream::with_capacity(Box::new(BytesSource::new("mem", numbered(25))), 10);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, numbered(25));
        assert!(stream.at_eof());
        assert_eq!(stream.fill_buf().unwrap().len(), 0);

        // Seeking back clears the EOF condition.
        stream.set_offset(24).unwrap();
        assert!(!stream.at_eof());
        let mut b = [0_u8; 1];
        assert_eq!(stream.read(&mut b).unwrap(), 1);
        assert_eq!(stream.read(&mut b).unwrap(), 0);
        assert!(stream.at_eof());
    }

    #[test]
    fn test_read_after_close_fails() {
        let mut stream = Stream::from_bytes("mem", b"abc".to_vec());
        stream.close().unwrap();
        let err = stream.read(&mut [0_u8; 1]).unwrap_err();
        let err: anyhow::Error = err.into();
        assert!(matches!(Error::find(&err), Some(Error::Closed)));
        // Closing twice is fine.
        stream.close().unwrap();
    }

    #[test]
    fn test_seek_relative_and_from_end() {
        let mut stream = Stream::from_bytes("mem", numbered(50));
        assert_eq!(stream.seek(SeekFrom::End(-5)).unwrap(), 45);
        assert_eq!(stream.seek(SeekFrom::Current(-45)).unwrap(), 0);
        assert!(stream.seek(SeekFrom::Current(-1)).is_err());
        assert_eq!(stream.offset(), 0);
    }

    #[test]
    fn test_open_at() {
        let mut stream = Stream::open_at(Box::new(BytesSource::new("mem", numbered(50))), 20).unwrap();
        assert_eq!(stream.offset(), 20);
        let mut b = [0_u8; 2];
        stream.read_exact(&mut b).unwrap();
        assert_eq!(b, [20, 21]);
    }
}
