use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    io::{self, Write},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{error::Error, stream::RawSource};

/// Handle to a distributed filesystem: opens a path for positioned reads.
pub trait DistributedFs: Debug + Send + Sync {
    fn open(&self, path: &str) -> anyhow::Result<Box<dyn RawSource>>;
}

/// In-memory filesystem. Every open and every backend read is recorded as an
/// [`Event`], which is what the trace tests look at to see which blocks a
/// query actually fetched. Paths can be marked as failing to simulate an
/// unreachable node.
#[derive(Clone, Debug, Default)]
pub struct MemoryFs {
    state: Arc<Mutex<MemoryFsState>>,
}

#[derive(Debug, Default)]
struct MemoryFsState {
    files: HashMap<String, Arc<Vec<u8>>>,
    failing: HashSet<String>,
    events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Create(String),
    Open(String),
    Read(String, u64, usize),
    Close(String),
}

impl Event {
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::Create(name) => write!(w, "Create({})", name),
            Event::Open(name) => write!(w, "Open({})", name),
            Event::Read(name, offset, len) => write!(w, "Read({}, {}, {})", name, offset, len),
            Event::Close(name) => write!(w, "Close({})", name),
        }
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, data: Vec<u8>) {
        let mut state = self.state.lock();
        state.events.push(Event::Create(path.to_owned()));
        state.files.insert(path.to_owned(), Arc::new(data));
    }

    /// Creates (or truncates) `path` and returns a writer appending to it.
    pub fn create(&self, path: &str) -> MemoryFile {
        self.put(path, Vec::new());
        MemoryFile {
            fs: self.clone(),
            path: path.to_owned(),
        }
    }

    pub fn read_all(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).map(|d| d.as_ref().clone())
    }

    pub fn ls(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().files.keys().cloned().collect();
        names.sort();
        names
    }

    /// Subsequent opens of `path` fail as if the node holding it were down.
    pub fn fail(&self, path: &str) {
        self.state.lock().failing.insert(path.to_owned());
    }

    pub fn heal(&self, path: &str) {
        self.state.lock().failing.remove(path);
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut self.state.lock().events)
    }

    pub fn count_events<F: Fn(&Event) -> bool>(&self, f: F) -> usize {
        self.state.lock().events.iter().filter(|e| f(e)).count()
    }

    fn record(&self, e: Event) {
        self.state.lock().events.push(e);
    }

    fn append(&self, path: &str, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        match state.files.get_mut(path) {
            Some(data) => {
                Arc::make_mut(data).extend_from_slice(buf);
                Ok(())
            }
            None => Err(Error::NotFound {
                location: path.to_owned(),
            }
            .into_io()),
        }
    }
}

impl DistributedFs for MemoryFs {
    fn open(&self, path: &str) -> anyhow::Result<Box<dyn RawSource>> {
        let mut state = self.state.lock();
        state.events.push(Event::Open(path.to_owned()));
        if state.failing.contains(path) {
            return Err(Error::Connection {
                location: path.to_owned(),
                message: "filesystem is down".to_owned(),
            }
            .into());
        }
        let data = match state.files.get(path) {
            Some(data) => data.clone(),
            None => {
                return Err(Error::NotFound {
                    location: path.to_owned(),
                }
                .into())
            }
        };
        Ok(Box::new(MemorySource {
            fs: self.clone(),
            path: path.to_owned(),
            data,
            pos: 0,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryFile {
    fs: MemoryFs,
    path: String,
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.fs.append(&self.path, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct MemorySource {
    fs: MemoryFs,
    path: String,
    data: Arc<Vec<u8>>,
    pos: u64,
}

impl RawSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = std::cmp::min(self.pos, self.data.len() as u64) as usize;
        let n = std::cmp::min(self.data.len() - start, buf.len());
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.fs.record(Event::Read(self.path.clone(), self.pos, n));
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.pos = offset;
        Ok(())
    }

    fn len(&mut self) -> io::Result<Option<u64>> {
        Ok(Some(self.data.len() as u64))
    }

    fn close(&mut self) -> io::Result<()> {
        self.fs.record(Event::Close(self.path.clone()));
        Ok(())
    }

    fn location(&self) -> &str {
        &self.path
    }
}

#[test]
fn test_memory_fs() -> anyhow::Result<()> {
    use std::io::Read;

    use crate::stream::Stream;

    let fs = MemoryFs::new();
    let mut f = fs.create("a");
    f.write_all(&[1, 2, 3, 4])?;
    assert_eq!(fs.read_all("a"), Some(vec![1, 2, 3, 4]));

    let mut stream = Stream::new(fs.open("a")?);
    stream.set_offset(2)?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out)?;
    assert_eq!(out, vec![3, 4]);
    stream.close()?;
    assert!(stream.is_closed());

    let mut trace = String::new();
    for e in fs.take_events() {
        e.write_abbrev(&mut trace).unwrap();
        trace.push('\n');
    }
    assert_eq!(
        trace,
        "Create(a)\nOpen(a)\nRead(a, 2, 2)\nRead(a, 4, 0)\nClose(a)\n"
    );

    fs.fail("a");
    let err = fs.open("a").err().unwrap();
    assert!(Error::find(&err).unwrap().is_source_failure());
    let err = fs.open("missing").err().unwrap();
    assert!(matches!(Error::find(&err), Some(Error::NotFound { .. })));

    fs.heal("a");
    assert!(fs.open("a").is_ok());
    assert_eq!(fs.count_events(|e| matches!(e, Event::Open(_))), 3);
    Ok(())
}
