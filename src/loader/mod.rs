// Turns the file names an index refers to (summary files, shards, plain CDX
// files) into open streams. A loader resolves the name against its base
// locations or a location map, and keeps one factory per name so that the
// resolution (and for local files the open handle) is reused by every
// query.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use reqwest::blocking::Client;

use crate::{
    config::{HttpSettings, Strictness},
    error::Error,
    fs::DistributedFs,
    lines::LineReader,
    stream::{ConnectionLimiter, FileSource, HttpSource, RawSource, Stream, DEFAULT_BUFFER_SIZE},
};

pub trait BlockLoader: Send + Sync {
    fn open_stream(&self, name: &str) -> anyhow::Result<Stream>;

    fn open(&self, name: &str, strictness: Strictness) -> anyhow::Result<LineReader> {
        Ok(LineReader::with_strictness(self.open_stream(name)?, strictness))
    }
}

/// Opens fresh raw sources for one resolved name. Creating a factory does no
/// I/O.
pub trait StreamFactory: Send + Sync {
    fn open(&self) -> anyhow::Result<Box<dyn RawSource>>;
}

pub trait Backend: Send + Sync {
    fn factory(&self, name: &str) -> Arc<dyn StreamFactory>;
}

pub fn is_absolute(name: &str) -> bool {
    name.starts_with('/') || name.starts_with("http://") || name.starts_with("https://")
}

/// Shard name to location(s), from a `.loc` file: one
/// `name<TAB>location[<TAB>location...]` per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationMap {
    entries: HashMap<String, Vec<String>>,
}

impl LocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse<R: BufRead>(r: R, origin: &str) -> anyhow::Result<Self> {
        let mut map = LocationMap::new();
        for (n, line) in r.lines().enumerate() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let name = fields.next().unwrap_or_default();
            let locations: Vec<String> = fields
                .filter(|f| !f.is_empty())
                .map(str::to_owned)
                .collect();
            if name.is_empty() || locations.is_empty() {
                return Err(Error::Config(format!(
                    "{} line {}: expected name<TAB>location",
                    origin,
                    n + 1
                ))
                .into());
            }
            map.entries.entry(name.to_owned()).or_default().extend(locations);
        }
        Ok(map)
    }

    pub fn insert(&mut self, name: &str, location: &str) {
        self.entries
            .entry(name.to_owned())
            .or_default()
            .push(location.to_owned());
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Candidate locations for a name, best first.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    bases: Vec<String>,
    map: Option<LocationMap>,
}

impl Resolver {
    pub fn new(bases: Vec<String>) -> Self {
        Resolver { bases, map: None }
    }

    pub fn with_location_map(mut self, map: LocationMap) -> Self {
        self.map = Some(map);
        self
    }

    pub fn resolve(&self, name: &str) -> Vec<String> {
        if is_absolute(name) {
            return vec![name.to_owned()];
        }
        let mapped = self.map.as_ref().and_then(|m| m.get(name));
        let relative: Vec<String> = match mapped {
            Some(locations) => locations.to_vec(),
            None => vec![name.to_owned()],
        };
        let mut out = Vec::new();
        for location in relative {
            if is_absolute(&location) || self.bases.is_empty() {
                out.push(location);
                continue;
            }
            for base in &self.bases {
                out.push(join(base, &location));
            }
        }
        out
    }
}

fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_owned();
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Caches one factory per name. Two threads missing the cache at once may
/// both build a factory; the first insert wins and the other is dropped.
pub struct CachingLoader<B> {
    backend: B,
    factories: DashMap<String, Arc<dyn StreamFactory>>,
    buffer_size: usize,
}

impl<B: Backend> CachingLoader<B> {
    pub fn new(backend: B) -> Self {
        CachingLoader {
            backend,
            factories: DashMap::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn cached(&self) -> usize {
        self.factories.len()
    }

    fn factory(&self, name: &str) -> Arc<dyn StreamFactory> {
        if let Some(factory) = self.factories.get(name) {
            return factory.value().clone();
        }
        let fresh = self.backend.factory(name);
        self.factories
            .entry(name.to_owned())
            .or_insert(fresh)
            .value()
            .clone()
    }
}

impl<B: Backend> BlockLoader for CachingLoader<B> {
    fn open_stream(&self, name: &str) -> anyhow::Result<Stream> {
        let source = self.factory(name).open()?;
        Ok(Stream::with_capacity(source, self.buffer_size))
    }
}

/// Local files under one or more base directories.
#[derive(Debug, Clone)]
pub struct FsBackend {
    resolver: Resolver,
}

impl FsBackend {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        let base: PathBuf = base.into();
        Self::with_resolver(Resolver::new(vec![base.display().to_string()]))
    }

    pub fn with_resolver(resolver: Resolver) -> Self {
        FsBackend { resolver }
    }
}

struct FileFactory {
    candidates: Vec<String>,
    // path, handle and length of the first candidate that opened
    opened: Mutex<Option<(String, Arc<File>, u64)>>,
}

impl StreamFactory for FileFactory {
    fn open(&self) -> anyhow::Result<Box<dyn RawSource>> {
        let mut opened = self.opened.lock();
        if let Some((path, file, len)) = opened.as_ref() {
            return Ok(Box::new(FileSource::from_shared(file.clone(), path.clone(), *len)));
        }
        let mut last_err = None;
        for path in &self.candidates {
            let f = match File::open(path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    last_err = Some(Error::NotFound {
                        location: path.clone(),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let len = f.metadata()?.len();
            let file = Arc::new(f);
            debug!("opened {} ({} bytes)", path, len);
            *opened = Some((path.clone(), file.clone(), len));
            return Ok(Box::new(FileSource::from_shared(file, path.clone(), len)));
        }
        Err(last_err
            .unwrap_or_else(|| Error::Config("no location to open".to_owned()))
            .into())
    }
}

impl Backend for FsBackend {
    fn factory(&self, name: &str) -> Arc<dyn StreamFactory> {
        Arc::new(FileFactory {
            candidates: self.resolver.resolve(name),
            opened: Mutex::new(None),
        })
    }
}

/// Objects over HTTP(S), fetched with range requests. Every resolved mirror
/// becomes a failover URL of the same source.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    limiter: Arc<ConnectionLimiter>,
    resolver: Resolver,
}

impl HttpBackend {
    pub fn new(settings: &HttpSettings, resolver: Resolver) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .pool_max_idle_per_host(settings.max_connections_per_host)
            .build()?;
        let limiter = ConnectionLimiter::new(
            settings.max_connections,
            settings.max_connections_per_host,
            Duration::from_secs(settings.connection_wait_secs),
        );
        Ok(Self::with_client(client, limiter, resolver))
    }

    pub fn with_client(client: Client, limiter: Arc<ConnectionLimiter>, resolver: Resolver) -> Self {
        HttpBackend {
            client,
            limiter,
            resolver,
        }
    }

    pub fn limiter(&self) -> &Arc<ConnectionLimiter> {
        &self.limiter
    }
}

struct HttpFactory {
    client: Client,
    limiter: Arc<ConnectionLimiter>,
    urls: Vec<String>,
}

impl StreamFactory for HttpFactory {
    fn open(&self) -> anyhow::Result<Box<dyn RawSource>> {
        Ok(Box::new(HttpSource::new(
            self.client.clone(),
            self.limiter.clone(),
            self.urls.clone(),
        )))
    }
}

impl Backend for HttpBackend {
    fn factory(&self, name: &str) -> Arc<dyn StreamFactory> {
        Arc::new(HttpFactory {
            client: self.client.clone(),
            limiter: self.limiter.clone(),
            urls: self.resolver.resolve(name),
        })
    }
}

/// Files on a distributed filesystem.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    fs: Arc<dyn DistributedFs>,
    resolver: Resolver,
}

impl RemoteBackend {
    pub fn new(fs: Arc<dyn DistributedFs>, resolver: Resolver) -> Self {
        RemoteBackend { fs, resolver }
    }
}

struct RemoteFactory {
    fs: Arc<dyn DistributedFs>,
    paths: Vec<String>,
}

impl StreamFactory for RemoteFactory {
    fn open(&self) -> anyhow::Result<Box<dyn RawSource>> {
        let mut last_err = None;
        for path in &self.paths {
            match self.fs.open(path) {
                Ok(source) => return Ok(source),
                Err(e) => {
                    debug!("{}: {:#}", path, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Config("no location to open".to_owned()).into()))
    }
}

impl Backend for RemoteBackend {
    fn factory(&self, name: &str) -> Arc<dyn StreamFactory> {
        Arc::new(RemoteFactory {
            fs: self.fs.clone(),
            paths: self.resolver.resolve(name),
        })
    }
}

#[cfg(test)]
mod test {
    use std::{io::Write, sync::Arc, time::Duration};

    use reqwest::blocking::Client;

    use super::{
        BlockLoader, CachingLoader, FsBackend, HttpBackend, LocationMap, RemoteBackend, Resolver,
    };
    use crate::{
        config::{ReadOptions, Strictness},
        error::Error,
        fs::{Event, MemoryFs},
        iter::CloseableIter,
        query::{CdxSource, InputSet, Query},
        stream::{test_server::RangeServer, ConnectionLimiter},
        zipnum::{
            builder::{ClusterBuilder, SUMMARY_NAME},
            ZipNumCluster,
        },
    };

    #[test]
    fn test_resolve() {
        let resolver = Resolver::new(vec!["http://a/cdx/".to_owned(), "http://b/cdx".to_owned()]);
        assert_eq!(
            resolver.resolve("part-00000.gz"),
            vec!["http://a/cdx/part-00000.gz", "http://b/cdx/part-00000.gz"]
        );
        assert_eq!(resolver.resolve("/data/x.gz"), vec!["/data/x.gz"]);
        assert_eq!(resolver.resolve("https://c/y.gz"), vec!["https://c/y.gz"]);

        let mut map = LocationMap::new();
        map.insert("part-00001.gz", "https://mirror/part-00001.gz");
        map.insert("part-00002.gz", "shards/part-00002.gz");
        let resolver = resolver.with_location_map(map);
        assert_eq!(
            resolver.resolve("part-00001.gz"),
            vec!["https://mirror/part-00001.gz"]
        );
        assert_eq!(
            resolver.resolve("part-00002.gz"),
            vec!["http://a/cdx/shards/part-00002.gz", "http://b/cdx/shards/part-00002.gz"]
        );
    }

    #[test]
    fn test_parse_loc_file() {
        let text = "part-00000.gz\thttp://a/p0.gz\thttp://b/p0.gz\n\n# note\npart-00001.gz\t/data/p1.gz\n";
        let map = LocationMap::parse(text.as_bytes(), "ALL.loc").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get("part-00000.gz").unwrap(),
            &["http://a/p0.gz".to_owned(), "http://b/p0.gz".to_owned()]
        );
        let err = LocationMap::parse("lonely\n".as_bytes(), "ALL.loc").unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Config(_))));
    }

    #[test]
    fn test_fs_loader_caches_factories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::File::create(dir.path().join("a.cdx"))?.write_all(b"a 1\nb 2\n")?;
        let loader = CachingLoader::new(FsBackend::new(dir.path()));

        let mut reader = loader.open("a.cdx", Strictness::Strict)?;
        assert_eq!(reader.read_line()?.as_deref(), Some("a 1"));
        let mut again = loader.open("a.cdx", Strictness::Strict)?;
        again.seek(4)?;
        assert_eq!(again.read_line()?.as_deref(), Some("b 2"));
        assert_eq!(loader.cached(), 1);

        let err = loader.open_stream("missing.cdx").unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn test_remote_failover() -> anyhow::Result<()> {
        let fs = MemoryFs::new();
        fs.put("primary/part-00000.gz", b"one".to_vec());
        fs.put("backup/part-00000.gz", b"two".to_vec());
        fs.fail("primary/part-00000.gz");
        fs.take_events();

        let resolver = Resolver::new(vec!["primary".to_owned(), "backup".to_owned()]);
        let loader = CachingLoader::new(RemoteBackend::new(Arc::new(fs.clone()), resolver));
        let mut reader = loader.open("part-00000.gz", Strictness::Lenient)?;
        assert_eq!(reader.read_line()?.as_deref(), Some("two"));
        assert_eq!(
            fs.take_events()[..2],
            [
                Event::Open("primary/part-00000.gz".to_owned()),
                Event::Open("backup/part-00000.gz".to_owned()),
            ]
        );

        fs.fail("backup/part-00000.gz");
        let err = loader.open_stream("part-00000.gz").unwrap_err();
        assert!(Error::find(&err).unwrap().is_source_failure());
        Ok(())
    }

    // Three clusters split round-robin from `data`, served over HTTP. The
    // cluster at `missing` (if any) points at a directory with nothing in it.
    fn http_clusters(
        server: &RangeServer,
        limiter: &Arc<ConnectionLimiter>,
        data: &[String],
        missing: Option<usize>,
    ) -> anyhow::Result<InputSet> {
        let fs = MemoryFs::new();
        let client = Client::builder().no_proxy().build()?;
        let mut clusters: Vec<Arc<dyn CdxSource>> = Vec::new();
        for i in 0..3 {
            let dir = format!("c{}", i);
            ClusterBuilder::new(7, 4)
                .with_prefix(&format!("{}/", dir))
                .build_sorted(data.iter().skip(i).step_by(3).cloned(), &fs)?;
            let base = if missing == Some(i) { "gone".to_owned() } else { dir.clone() };
            let backend = HttpBackend::with_client(
                client.clone(),
                limiter.clone(),
                Resolver::new(vec![server.url(&base)]),
            );
            clusters.push(Arc::new(ZipNumCluster::new(
                &dir,
                SUMMARY_NAME,
                Arc::new(CachingLoader::new(backend)),
                ReadOptions::default(),
            )));
        }
        for path in fs.ls() {
            server.put(&path, fs.read_all(&path).unwrap_or_default());
        }
        Ok(InputSet::new("three", clusters))
    }

    fn sites(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("com,site{:03})/ 2001", i)).collect()
    }

    #[test]
    fn test_http_clusters_under_one_connection_per_host() -> anyhow::Result<()> {
        let server = RangeServer::start();
        let limiter = ConnectionLimiter::new(16, 1, Duration::from_millis(500));
        let data = sites(300);
        let set = http_clusters(&server, &limiter, &data, None)?;

        let (lines, truncated) = set.search(&Query::prefix("com,site1"))?.collect()?;
        assert_eq!(lines, data[100..200].to_vec());
        assert!(!truncated);
        assert_eq!(limiter.in_use(), 0);

        // A result left half read holds no connection slot.
        let mut paused = set.search(&Query::from("com,"))?;
        assert_eq!(paused.lines.next()?.as_deref(), Some(data[0].as_str()));
        assert_eq!(limiter.in_use(), 0);
        let (lines, truncated) = set.search(&Query::exact("com,site250)/"))?.collect()?;
        assert_eq!(lines, vec![data[250].clone()]);
        assert!(!truncated);
        assert_eq!(paused.lines.next()?.as_deref(), Some(data[1].as_str()));
        paused.lines.close();
        Ok(())
    }

    #[test]
    fn test_http_cluster_not_found() -> anyhow::Result<()> {
        let server = RangeServer::start();
        let limiter = ConnectionLimiter::new(16, 1, Duration::from_millis(500));
        let data = sites(90);
        let set = http_clusters(&server, &limiter, &data, Some(1))?;

        let (lines, truncated) = set.search(&Query::from("com,"))?.collect()?;
        let kept: Vec<String> = data
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 1)
            .map(|(_, l)| l.clone())
            .collect();
        assert_eq!(lines, kept);
        assert!(truncated);
        assert!(server
            .take_requests()
            .iter()
            .any(|r| r.contains("/gone/ALL.summary")));
        Ok(())
    }
}
