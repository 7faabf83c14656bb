use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use log::debug;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    fs::DistributedFs,
    lines::SortedTextFile,
    loader::{BlockLoader, CachingLoader, FsBackend, HttpBackend, LocationMap, RemoteBackend, Resolver},
    query::{CdxSource, InputSet},
    stream::{
        ConnectionLimiter, DEFAULT_CONNECTION_WAIT, DEFAULT_MAX_CONNECTIONS,
        DEFAULT_MAX_CONNECTIONS_PER_HOST,
    },
    zipnum::{ClusterLimits, ZipNumCluster},
};

/// What to do with malformed data: a bad gzip member, a line that is not
/// UTF-8, a block with the wrong line count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Fail the read.
    Strict,
    /// Log, skip what cannot be recovered, and keep going.
    #[default]
    Lenient,
}

/// Per-source read settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub strictness: Strictness,
    pub limits: ClusterLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    pub timeout_secs: u64,
    pub connection_wait_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            timeout_secs: 30,
            connection_wait_secs: DEFAULT_CONNECTION_WAIT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    #[default]
    Filesystem,
    Http,
    DistributedFs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    #[default]
    Zipnum,
    /// One sorted, uncompressed CDX file.
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub format: SourceFormat,
    /// The summary file of a cluster, or the CDX file of a plain source.
    pub summary: String,
    #[serde(default)]
    pub loader: LoaderKind,
    /// Directories or URL prefixes relative names are resolved against.
    #[serde(default)]
    pub shard_base: Vec<String>,
    #[serde(default)]
    pub loc_file: Option<String>,
    #[serde(default)]
    pub strictness: Option<Strictness>,
    #[serde(default)]
    pub limits: Option<ClusterLimits>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub strictness: Strictness,
    pub limits: ClusterLimits,
    pub http: HttpSettings,
    pub clusters: BTreeMap<String, SourceConfig>,
    /// Logical names served by merging several clusters.
    pub groups: BTreeMap<String, Vec<String>>,
}

impl Config {
    pub fn from_json(contents: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&contents)
    }

    /// Writes the config next to `path` and renames it into place.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(&tmp_path)?;
        let encoded = serde_json::to_string_pretty(self)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        fs::rename(tmp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.limits.max_blocks == 0 {
            return Err(Error::Config("limits.max_blocks must be positive".to_owned()));
        }
        let http = &self.http;
        if http.max_connections == 0
            || http.max_connections_per_host == 0
            || http.max_connections_per_host > http.max_connections
        {
            return Err(Error::Config(format!(
                "bad connection limits: {} total, {} per host",
                http.max_connections, http.max_connections_per_host
            )));
        }
        for (name, cluster) in &self.clusters {
            if cluster.summary.is_empty() {
                return Err(Error::Config(format!("cluster {}: empty summary", name)));
            }
            if matches!(cluster.limits, Some(l) if l.max_blocks == 0) {
                return Err(Error::Config(format!(
                    "cluster {}: limits.max_blocks must be positive",
                    name
                )));
            }
        }
        for (name, members) in &self.groups {
            if self.clusters.contains_key(name) {
                return Err(Error::Config(format!(
                    "{} is both a cluster and a group",
                    name
                )));
            }
            if let Some(missing) = members.iter().find(|m| !self.clusters.contains_key(*m)) {
                return Err(Error::Config(format!(
                    "group {} names unknown cluster {}",
                    name, missing
                )));
            }
        }
        Ok(())
    }

    pub fn read_options(&self, cluster: &SourceConfig) -> ReadOptions {
        ReadOptions {
            strictness: cluster.strictness.unwrap_or(self.strictness),
            limits: cluster.limits.unwrap_or(self.limits),
        }
    }
}

/// Builds query sources from a [`Config`] and hands them out by name. Sources
/// are built on first use and shared afterwards; the HTTP client and
/// connection limiter are shared by every HTTP cluster.
pub struct Registry {
    config: Config,
    dfs: Option<Arc<dyn DistributedFs>>,
    limiter: Arc<ConnectionLimiter>,
    client: Mutex<Option<Client>>,
    sources: Mutex<HashMap<String, Arc<dyn CdxSource>>>,
}

impl Registry {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let limiter = ConnectionLimiter::new(
            config.http.max_connections,
            config.http.max_connections_per_host,
            Duration::from_secs(config.http.connection_wait_secs),
        );
        Ok(Registry {
            config,
            dfs: None,
            limiter,
            client: Mutex::new(None),
            sources: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_distributed_fs(mut self, dfs: Arc<dyn DistributedFs>) -> Self {
        self.dfs = Some(dfs);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every cluster and group name.
    pub fn names(&self) -> Vec<String> {
        self.config
            .clusters
            .keys()
            .chain(self.config.groups.keys())
            .cloned()
            .collect()
    }

    pub fn source(&self, name: &str) -> anyhow::Result<Arc<dyn CdxSource>> {
        if let Some(source) = self.sources.lock().get(name) {
            return Ok(source.clone());
        }
        let built: Arc<dyn CdxSource> = if let Some(members) = self.config.groups.get(name) {
            let members: Vec<&str> = members.iter().map(String::as_str).collect();
            Arc::new(self.input_set(name, &members)?)
        } else if let Some(cluster) = self.config.clusters.get(name) {
            self.build(name, cluster)?
        } else {
            return Err(Error::Config(format!("unknown source {}", name)).into());
        };
        Ok(self
            .sources
            .lock()
            .entry(name.to_owned())
            .or_insert(built)
            .clone())
    }

    /// An ad hoc merge of the named sources.
    pub fn input_set(&self, name: &str, members: &[&str]) -> anyhow::Result<InputSet> {
        let sources = members
            .iter()
            .map(|m| self.source(m))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(InputSet::new(name, sources))
    }

    fn http_client(&self) -> anyhow::Result<Client> {
        let mut client = self.client.lock();
        if let Some(client) = client.as_ref() {
            return Ok(client.clone());
        }
        let built = Client::builder()
            .timeout(Duration::from_secs(self.config.http.timeout_secs))
            .pool_max_idle_per_host(self.config.http.max_connections_per_host)
            .build()?;
        *client = Some(built.clone());
        Ok(built)
    }

    fn loader(&self, name: &str, cluster: &SourceConfig, resolver: Resolver) -> anyhow::Result<Arc<dyn BlockLoader>> {
        Ok(match cluster.loader {
            LoaderKind::Filesystem => Arc::new(CachingLoader::new(FsBackend::with_resolver(resolver))),
            LoaderKind::Http => Arc::new(CachingLoader::new(HttpBackend::with_client(
                self.http_client()?,
                self.limiter.clone(),
                resolver,
            ))),
            LoaderKind::DistributedFs => {
                let Some(dfs) = self.dfs.clone() else {
                    return Err(Error::Config(format!(
                        "cluster {} needs a distributed filesystem",
                        name
                    ))
                    .into());
                };
                Arc::new(CachingLoader::new(RemoteBackend::new(dfs, resolver)))
            }
        })
    }

    fn build(&self, name: &str, cluster: &SourceConfig) -> anyhow::Result<Arc<dyn CdxSource>> {
        let mut resolver = Resolver::new(cluster.shard_base.clone());
        if let Some(loc_file) = &cluster.loc_file {
            let bootstrap = self.loader(name, cluster, resolver.clone())?;
            let mut stream = bootstrap.open_stream(loc_file)?;
            let map = LocationMap::parse(&mut stream, loc_file);
            stream.close()?;
            let map = map?;
            debug!("{}: {} shard locations from {}", name, map.len(), loc_file);
            resolver = resolver.with_location_map(map);
        }
        let loader = self.loader(name, cluster, resolver)?;
        let options = self.config.read_options(cluster);
        Ok(match cluster.format {
            SourceFormat::Zipnum => Arc::new(ZipNumCluster::new(name, &cluster.summary, loader, options)),
            SourceFormat::Plain => Arc::new(SortedTextFile::new(&cluster.summary, loader, options.strictness)),
        })
    }
}
