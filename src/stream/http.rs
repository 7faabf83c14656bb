// HTTP backend. Every read is one bounded `Range: bytes=N-M` request sized
// to the caller's buffer, and the response is fully consumed or dropped
// before the read returns. No body stays open between reads, so an idle
// query holds no connection slot.

use std::{
    collections::HashMap,
    fmt,
    io::{self, Read},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use reqwest::{
    blocking::{Client, Response},
    header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    StatusCode,
};

use super::RawSource;
use crate::error::Error;

pub const DEFAULT_MAX_CONNECTIONS: usize = 16;
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 4;
pub const DEFAULT_CONNECTION_WAIT: Duration = Duration::from_secs(30);

/// Bounds concurrent HTTP requests, in total and per host. A permit is held
/// only while a request is in flight.
#[derive(Debug)]
pub struct ConnectionLimiter {
    max_total: usize,
    max_per_host: usize,
    wait: Duration,
    state: Mutex<LimiterState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct LimiterState {
    total: usize,
    per_host: HashMap<String, usize>,
}

impl ConnectionLimiter {
    pub fn new(max_total: usize, max_per_host: usize, wait: Duration) -> Arc<Self> {
        Arc::new(ConnectionLimiter {
            max_total: max_total.max(1),
            max_per_host: max_per_host.max(1),
            wait,
            state: Mutex::new(LimiterState::default()),
            released: Condvar::new(),
        })
    }

    pub fn acquire(self: &Arc<Self>, host: &str) -> Result<ConnectionPermit, Error> {
        let deadline = Instant::now() + self.wait;
        let mut state = self.state.lock();
        loop {
            let host_count = state.per_host.get(host).copied().unwrap_or(0);
            if state.total < self.max_total && host_count < self.max_per_host {
                state.total += 1;
                *state.per_host.entry(host.to_owned()).or_insert(0) += 1;
                return Ok(ConnectionPermit {
                    limiter: self.clone(),
                    host: host.to_owned(),
                });
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::ConnectionLimit {
                    host: host.to_owned(),
                });
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().total
    }

    fn release(&self, host: &str) {
        let mut state = self.state.lock();
        state.total -= 1;
        if let Some(count) = state.per_host.get_mut(host) {
            *count -= 1;
            if *count == 0 {
                state.per_host.remove(host);
            }
        }
        drop(state);
        self.released.notify_all();
    }
}

#[derive(Debug)]
pub struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
    host: String,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limiter.release(&self.host);
    }
}

pub fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_default()
}

/// Parses the total length out of `Content-Range: bytes 0-99/1234`.
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

pub struct HttpSource {
    client: Client,
    limiter: Arc<ConnectionLimiter>,
    // Mirrors of the same object, tried in order.
    urls: Vec<String>,
    current: usize,
    offset: u64,
    len: Option<u64>,
}

impl HttpSource {
    pub fn new(client: Client, limiter: Arc<ConnectionLimiter>, urls: Vec<String>) -> Self {
        HttpSource {
            client,
            limiter,
            urls,
            current: 0,
            offset: 0,
            len: None,
        }
    }

    // One ranged GET of at most `buf.len()` bytes from `self.offset`. The
    // permit is dropped on return, with the body read or abandoned.
    fn fetch(&mut self, idx: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let url = self.urls[idx].clone();
        let _permit = self.limiter.acquire(&host_of(&url))?;
        let last = self.offset.saturating_add(buf.len() as u64 - 1);
        debug!("GET {} bytes {}-{}", url, self.offset, last);
        let mut response = self
            .client
            .get(&url)
            .header(RANGE, format!("bytes={}-{}", self.offset, last))
            .send()
            .map_err(|e| connection_error(&url, e))?;

        let status = response.status();
        if status == StatusCode::PARTIAL_CONTENT {
            if let Some(total) = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(total_from_content_range)
            {
                self.len = Some(total);
            }
        } else if status == StatusCode::OK && self.offset == 0 {
            if self.len.is_none() {
                self.len = response.content_length();
            }
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(0);
        } else if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound { location: url });
        } else {
            return Err(Error::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }
        fill(&mut response, buf).map_err(|e| connection_error(&url, e))
    }
}

fn connection_error(url: &str, e: impl fmt::Display) -> Error {
    Error::Connection {
        location: url.to_owned(),
        message: e.to_string(),
    }
}

// Reads until `buf` is full or the body ends.
fn fill(response: &mut Response, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match response.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(read) => n += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

impl RawSource for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || matches!(self.len, Some(len) if self.offset >= len) {
            return Ok(0);
        }
        let mut last_err = None;
        for idx in self.current..self.urls.len() {
            match self.fetch(idx, buf) {
                Ok(n) => {
                    self.current = idx;
                    self.offset += n as u64;
                    return Ok(n);
                }
                Err(e) => {
                    if idx + 1 < self.urls.len() {
                        warn!("{}; trying next mirror", e);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::Config("HTTP source without URLs".to_owned()))
            .into_io())
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.offset = offset;
        Ok(())
    }

    fn len(&mut self) -> io::Result<Option<u64>> {
        if self.len.is_some() {
            return Ok(self.len);
        }
        let url = self.urls.get(self.current).cloned().unwrap_or_default();
        let _permit = self.limiter.acquire(&host_of(&url)).map_err(Error::into_io)?;
        let response = self
            .client
            .head(&url)
            .send()
            .map_err(|e| connection_error(&url, e).into_io())?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound { location: url }.into_io());
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url,
                status: status.as_u16(),
            }
            .into_io());
        }
        self.len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Ok(self.len)
    }

    fn location(&self) -> &str {
        self.urls.get(self.current).map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod test {
    use std::{io::Read, sync::Arc, thread, time::Duration};

    use reqwest::blocking::Client;

    use super::{host_of, total_from_content_range, ConnectionLimiter, HttpSource};
    use crate::{
        error::Error,
        stream::{test_server::RangeServer, RawSource, Stream},
    };

    fn data() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 251) as u8).collect()
    }

    fn source(limiter: &Arc<ConnectionLimiter>, urls: Vec<String>) -> HttpSource {
        let client = Client::builder().no_proxy().build().unwrap();
        HttpSource::new(client, limiter.clone(), urls)
    }

    fn read_err(src: &mut HttpSource) -> anyhow::Error {
        let mut buf = [0u8; 10];
        anyhow::Error::from(src.read(&mut buf).unwrap_err())
    }

    #[test]
    fn test_content_range() {
        assert_eq!(total_from_content_range("bytes 0-99/1234"), Some(1234));
        assert_eq!(total_from_content_range("bytes 0-99/*"), None);
        assert_eq!(host_of("http://archive.example:8080/cdx/part-00001.gz"), "archive.example");
    }

    #[test]
    fn test_limiter_per_host() {
        let limiter = ConnectionLimiter::new(3, 2, Duration::from_millis(20));
        let a1 = limiter.acquire("a").unwrap();
        let _a2 = limiter.acquire("a").unwrap();
        assert!(matches!(
            limiter.acquire("a"),
            Err(Error::ConnectionLimit { .. })
        ));
        let _b1 = limiter.acquire("b").unwrap();
        // Total is exhausted now, even for a fresh host.
        assert!(limiter.acquire("c").is_err());
        drop(a1);
        let _a3 = limiter.acquire("a").unwrap();
        assert_eq!(limiter.in_use(), 3);
    }

    #[test]
    fn test_limiter_wakes_waiter() {
        let limiter = ConnectionLimiter::new(1, 1, Duration::from_secs(5));
        let held = limiter.acquire("a").unwrap();
        let other = limiter.clone();
        let waiter = thread::spawn(move || other.acquire("a").map(|_| ()));
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_bounded_range_reads() {
        let server = RangeServer::start();
        server.put("a.gz", data());
        let limiter = ConnectionLimiter::new(4, 1, Duration::from_secs(5));
        let mut src = source(&limiter, vec![server.url("a.gz")]);

        let mut buf = [0u8; 100];
        src.seek(250).unwrap();
        assert_eq!(src.read(&mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &data()[250..350]);
        assert_eq!(limiter.in_use(), 0);
        // Learned from Content-Range, no HEAD needed.
        assert_eq!(src.len().unwrap(), Some(1000));

        src.seek(950).unwrap();
        assert_eq!(src.read(&mut buf).unwrap(), 50);
        assert_eq!(&buf[..50], &data()[950..]);
        assert_eq!(src.read(&mut buf).unwrap(), 0);
        assert_eq!(
            server.take_requests(),
            vec!["GET /a.gz bytes=250-349", "GET /a.gz bytes=950-1049"]
        );

        // Past the end of an object whose length is not known yet.
        let mut fresh = source(&limiter, vec![server.url("a.gz")]);
        fresh.seek(5000).unwrap();
        assert_eq!(fresh.read(&mut buf).unwrap(), 0);
        assert_eq!(server.take_requests(), vec!["GET /a.gz bytes=5000-5099"]);
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_stream_over_http() {
        let server = RangeServer::start();
        server.put("a.gz", data());
        let limiter = ConnectionLimiter::new(4, 1, Duration::from_secs(5));
        let mut stream = Stream::with_capacity(Box::new(source(&limiter, vec![server.url("a.gz")])), 300);
        let mut all = Vec::new();
        stream.read_to_end(&mut all).unwrap();
        assert_eq!(all, data());
        assert_eq!(server.take_requests().len(), 4);
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_whole_body_reply() {
        let server = RangeServer::start();
        server.put("a.gz", data());
        server.ignore_ranges("a.gz");
        let limiter = ConnectionLimiter::new(4, 1, Duration::from_secs(5));
        let mut src = source(&limiter, vec![server.url("a.gz")]);

        // At offset 0 a full body serves the first buffer.
        let mut buf = [0u8; 100];
        assert_eq!(src.read(&mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &data()[..100]);
        assert_eq!(src.len().unwrap(), Some(1000));

        // Anywhere else it would hand back the wrong bytes.
        let err = read_err(&mut src);
        assert!(matches!(Error::find(&err), Some(Error::HttpStatus { status: 200, .. })));
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_status_errors() {
        let server = RangeServer::start();
        server.put("broken.gz", data());
        server.fail("broken.gz");
        let limiter = ConnectionLimiter::new(4, 1, Duration::from_secs(5));

        let err = read_err(&mut source(&limiter, vec![server.url("missing.gz")]));
        assert!(matches!(Error::find(&err), Some(Error::NotFound { .. })));
        let err = anyhow::Error::from(source(&limiter, vec![server.url("missing.gz")]).len().unwrap_err());
        assert!(matches!(Error::find(&err), Some(Error::NotFound { .. })));

        let err = read_err(&mut source(&limiter, vec![server.url("broken.gz")]));
        assert!(matches!(Error::find(&err), Some(Error::HttpStatus { status: 500, .. })));
        assert!(Error::find(&err).unwrap().is_source_failure());
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_mirror_failover() {
        let server = RangeServer::start();
        server.put("b/a.gz", data());
        server.put("c/a.gz", data());
        server.fail("c/a.gz");
        let limiter = ConnectionLimiter::new(4, 1, Duration::from_secs(5));
        let mut src = source(
            &limiter,
            vec![server.url("a/a.gz"), server.url("b/a.gz"), server.url("c/a.gz")],
        );

        let mut buf = [0u8; 10];
        src.seek(10).unwrap();
        assert_eq!(src.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..], &data()[10..20]);
        assert_eq!(src.location(), server.url("b/a.gz"));
        // The working mirror sticks.
        assert_eq!(src.read(&mut buf).unwrap(), 10);
        assert_eq!(
            server.take_requests(),
            vec![
                "GET /a/a.gz bytes=10-19",
                "GET /b/a.gz bytes=10-19",
                "GET /b/a.gz bytes=20-29"
            ]
        );

        let err = read_err(&mut source(&limiter, vec![server.url("a/a.gz"), server.url("c/a.gz")]));
        assert!(matches!(Error::find(&err), Some(Error::HttpStatus { status: 500, .. })));
    }
}
