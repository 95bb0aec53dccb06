//! Configuration snapshots for the source tree and the dispatch engine.
//!
//! Configuration is loaded once from TOML (or, for a quick single-pool setup,
//! from `POOLMUX_*` environment variables) into immutable snapshots. Live
//! changes are made by handing a new snapshot of a single node to the
//! engine, never by mutating a shared structure.
//!
//! ```toml
//! [engine]
//! max_fetch_attempts = 8
//!
//! [[chain]]
//! name = "Bitcoin"
//!
//! [chain.root]
//! name = "Work sources"
//!
//! [[chain.root.children]]
//! kind = "source"
//! name = "Main pool"
//! protocol = "stratum"
//! host = "pool.example.com"
//! port = 3333
//! username = "worker"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Name of the chain created when none is configured.
pub const DEFAULT_CHAIN: &str = "Bitcoin";

/// Default user agent sent to pools.
pub const USER_AGENT: &str = concat!("poolmux/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default, rename = "chain")]
    pub chains: Vec<ChainConfig>,
}

/// One blockchain and the root of the source tree serving it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChainConfig {
    pub name: String,
    pub root: GroupConfig,
}

/// A node of the source tree.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeConfig {
    Group(GroupConfig),
    Source(SourceConfig),
}

impl NodeConfig {
    pub fn name(&self) -> &str {
        match self {
            NodeConfig::Group(group) => &group.name,
            NodeConfig::Source(source) => &source.name,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GroupConfig {
    pub name: String,

    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub children: Vec<NodeConfig>,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            enabled: true,
            children: Vec::new(),
        }
    }

    /// The group's own settings, without its children.
    pub fn settings(&self) -> GroupSettings {
        GroupSettings {
            name: self.name.clone(),
            priority: self.priority,
            enabled: self.enabled,
        }
    }
}

/// Hot-applicable settings of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSettings {
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// JSON-RPC getwork over HTTP, with optional long-poll.
    Getwork,
    /// Stratum v1 over TCP.
    Stratum,
}

/// Settings of one leaf source.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub name: String,

    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub protocol: Protocol,

    pub host: String,

    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Interval between getwork polls.
    #[serde(default = "default_poll_interval", with = "duration_secs")]
    pub poll_interval: Duration,

    /// Follow the pool's long-poll channel if it advertises one.
    #[serde(default = "default_true")]
    pub longpoll_enabled: bool,

    #[serde(default = "default_backoff_min", with = "duration_secs")]
    pub reconnect_backoff_min: Duration,

    #[serde(default = "default_backoff_max", with = "duration_secs")]
    pub reconnect_backoff_max: Duration,

    /// Consecutive fetch failures before the source reports itself dead.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    /// How many workers may be handed the same job. Defaults to 1 for
    /// getwork and unlimited for Stratum.
    #[serde(default)]
    pub job_reuse: Option<u32>,

    /// How long the engine waits for a fetch before giving up on it.
    #[serde(default = "default_fetch_timeout", with = "duration_secs")]
    pub fetch_timeout: Duration,

    /// How long a submission may wait for the pool's answer.
    #[serde(default = "default_submit_timeout", with = "duration_secs")]
    pub submit_timeout: Duration,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Difficulty suggested to Stratum pools after authorizing.
    #[serde(default)]
    pub suggested_difficulty: Option<u64>,
}

impl SourceConfig {
    /// A source with default tuning.
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            enabled: true,
            protocol,
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            poll_interval: default_poll_interval(),
            longpoll_enabled: true,
            reconnect_backoff_min: default_backoff_min(),
            reconnect_backoff_max: default_backoff_max(),
            max_consecutive_failures: default_max_failures(),
            job_reuse: None,
            fetch_timeout: default_fetch_timeout(),
            submit_timeout: default_submit_timeout(),
            user_agent: default_user_agent(),
            suggested_difficulty: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Upstream URL for logging and for the protocol clients.
    pub fn url(&self) -> String {
        match self.protocol {
            Protocol::Getwork => format!("http://{}:{}/", self.host, self.port),
            Protocol::Stratum => format!("stratum+tcp://{}:{}", self.host, self.port),
        }
    }

    /// Number of workers a single job may be handed to.
    pub fn effective_job_reuse(&self) -> u32 {
        match (self.job_reuse, self.protocol) {
            (Some(n), _) => n.max(1),
            (None, Protocol::Getwork) => 1,
            (None, Protocol::Stratum) => u32::MAX,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| {
            Err(ConfigError::Invalid(format!(
                "source {:?}: {}",
                self.name, what
            )))
        };

        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("source with empty name".into()));
        }
        if self.host.trim().is_empty() {
            return invalid("host is empty");
        }
        if self.port == 0 {
            return invalid("port must be non-zero");
        }
        if self.max_consecutive_failures == 0 {
            return invalid("max_consecutive_failures must be at least 1");
        }
        if self.reconnect_backoff_min > self.reconnect_backoff_max {
            return invalid("reconnect_backoff_min exceeds reconnect_backoff_max");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be positive");
        }
        if self.fetch_timeout.is_zero() || self.submit_timeout.is_zero() {
            return invalid("timeouts must be positive");
        }
        if self.job_reuse == Some(0) {
            return invalid("job_reuse must be at least 1");
        }
        Ok(())
    }
}

/// Tuning of the dispatch engine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Consecutive fetch failures across sources before the chain is
    /// reported as having no work source.
    pub max_fetch_attempts: u32,

    /// Interval of the periodic re-selection pass.
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,

    /// Interval of the statistics log line.
    #[serde(with = "duration_secs")]
    pub status_interval: Duration,

    #[serde(with = "duration_secs")]
    pub no_source_backoff_min: Duration,

    #[serde(with = "duration_secs")]
    pub no_source_backoff_max: Duration,

    /// How long shutdown waits for fetches already in flight.
    #[serde(with = "duration_secs")]
    pub fetch_drain_timeout: Duration,

    /// How long shutdown waits for outstanding submissions.
    #[serde(with = "duration_secs")]
    pub drain_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fetch_attempts: 8,
            health_check_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(60),
            no_source_backoff_min: Duration::from_secs(1),
            no_source_backoff_max: Duration::from_secs(30),
            fetch_drain_timeout: Duration::from_secs(5),
            drain_deadline: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fetch_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_fetch_attempts must be at least 1".into(),
            ));
        }
        if self.health_check_interval.is_zero() || self.status_interval.is_zero() {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        if self.no_source_backoff_min > self.no_source_backoff_max {
            return Err(ConfigError::Invalid(
                "no_source_backoff_min exceeds no_source_backoff_max".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a single-source configuration from environment variables.
    ///
    /// Returns `Ok(None)` if `POOLMUX_POOL_URL` is not set.
    ///
    /// # Environment Variables
    ///
    /// - `POOLMUX_POOL_URL`: `stratum+tcp://host:port` or `http://host:port`
    /// - `POOLMUX_POOL_USER`: worker username (default: "poolmux")
    /// - `POOLMUX_POOL_PASS`: worker password (default: "x")
    /// - `POOLMUX_POOL_PROTOCOL`: `stratum` or `getwork`, overriding the
    ///   protocol implied by the URL scheme
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(url) = std::env::var("POOLMUX_POOL_URL") else {
            return Ok(None);
        };
        let user = std::env::var("POOLMUX_POOL_USER").unwrap_or_else(|_| "poolmux".to_string());
        let pass = std::env::var("POOLMUX_POOL_PASS").unwrap_or_else(|_| "x".to_string());

        let (scheme, address) = match url.split_once("://") {
            Some((scheme, address)) => (Some(scheme), address),
            None => (None, url.as_str()),
        };

        let protocol = match std::env::var("POOLMUX_POOL_PROTOCOL").ok().as_deref() {
            Some("stratum") => Protocol::Stratum,
            Some("getwork") => Protocol::Getwork,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "POOLMUX_POOL_PROTOCOL must be stratum or getwork, not {:?}",
                    other
                )))
            }
            None => match scheme {
                Some("http") | Some("https") => Protocol::Getwork,
                _ => Protocol::Stratum,
            },
        };

        let address = address.trim_end_matches('/');
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("no port in POOLMUX_POOL_URL {:?}", url)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad port in POOLMUX_POOL_URL {:?}", url)))?;

        let source = SourceConfig::new(host, protocol, host, port).with_credentials(user, pass);
        let mut root = GroupConfig::new("Work sources", 0);
        root.children.push(NodeConfig::Source(source));

        let config = Config {
            engine: EngineConfig::default(),
            chains: vec![ChainConfig {
                name: DEFAULT_CHAIN.to_string(),
                root,
            }],
        };
        config.validate()?;
        Ok(Some(config))
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;

        if self.chains.is_empty() {
            return Err(ConfigError::Invalid("no chains configured".into()));
        }

        let mut names = HashSet::new();
        for chain in &self.chains {
            if chain.name.trim().is_empty() {
                return Err(ConfigError::Invalid("chain with empty name".into()));
            }
            if !names.insert(chain.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate chain {:?}",
                    chain.name
                )));
            }
            validate_group(&chain.root)?;
        }
        Ok(())
    }

    /// Find a chain by name.
    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|chain| chain.name == name)
    }

    /// Insert the example/donation work sources.
    ///
    /// The default chain is created if missing. Its previous root is kept,
    /// renamed "User work sources" at priority 1000, under a new root that
    /// carries the old root's name, next to an "Example/donation work
    /// sources" group at priority 10.
    pub fn with_example_sources(mut self) -> Self {
        let index = match self.chains.iter().position(|c| c.name == DEFAULT_CHAIN) {
            Some(index) => index,
            None => {
                self.chains.push(ChainConfig {
                    name: DEFAULT_CHAIN.to_string(),
                    root: GroupConfig::new("Work sources", 0),
                });
                self.chains.len() - 1
            }
        };

        let chain = &mut self.chains[index];
        let mut user_sources = chain.root.clone();
        let mut root = GroupConfig::new(user_sources.name.clone(), user_sources.priority);
        user_sources.name = "User work sources".to_string();
        user_sources.priority = 1000;

        let mut examples = GroupConfig::new("Example/donation work sources", 10);
        examples.children.push(NodeConfig::Source(
            SourceConfig::new("BTCMP (donation)", Protocol::Getwork, "rr.btcmp.com", 7332)
                .with_priority(1)
                .with_credentials("TheSeven.worker", "TheSeven"),
        ));
        let mut stratum =
            SourceConfig::new("Joes Pool Donation", Protocol::Stratum, "pool.cr.rs", 4334)
                .with_priority(1)
                .with_credentials("Joe.DonateMPBM", "x");
        stratum.longpoll_enabled = false;
        examples.children.push(NodeConfig::Source(stratum));

        root.children.push(NodeConfig::Group(user_sources));
        root.children.push(NodeConfig::Group(examples));
        chain.root = root;
        self
    }
}

impl Default for Config {
    /// An empty tree for the default chain.
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            chains: vec![ChainConfig {
                name: DEFAULT_CHAIN.to_string(),
                root: GroupConfig::new("Work sources", 0),
            }],
        }
    }
}

fn validate_group(group: &GroupConfig) -> Result<(), ConfigError> {
    if group.name.trim().is_empty() {
        return Err(ConfigError::Invalid("group with empty name".into()));
    }
    for child in &group.children {
        validate_node(child)?;
    }
    Ok(())
}

pub(crate) fn validate_node(node: &NodeConfig) -> Result<(), ConfigError> {
    match node {
        NodeConfig::Group(group) => validate_group(group),
        NodeConfig::Source(source) => source.validate(),
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_backoff_min() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(60)
}

fn default_max_failures() -> u32 {
    3
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_submit_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    USER_AGENT.to_string()
}

/// Durations as (fractional) seconds.
mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
