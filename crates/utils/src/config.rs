use std::{env, fs, path::Path, sync::Arc, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
    alias::{AliasDirectory, SuppressionPolicy},
    delivery::{DeliveryTransport, LogTransport, SmtpTransport},
    directories::{ForwardRule, HttpAliasDirectory, StaticAliasDirectory},
    drainer::{DrainPolicy, Drainer},
    pipeline::Pipeline,
    queue::{MessageQueue, ReceiveOptions},
    rewriter::{HeaderPolicy, UnsubscribePolicy},
    storage::{ContentStore, FileContentStore},
};

/// Environment variable naming the TOML configuration file.
pub const CONFIG_ENV: &str = "TUMBLE_CONFIG";

/// Top-level configuration for Tumble.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub directory: DirectoryConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub headers: HeaderPolicy,

    #[serde(default)]
    pub suppression: SuppressionConfig,

    #[serde(default)]
    pub drain: DrainConfig,
}

/// Alias directory backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum DirectoryConfig {
    /// Remote alias API.
    #[serde(rename = "http")]
    Http {
        #[serde(default = "default_alias_api_url")]
        url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_lookup_timeout_secs")]
        timeout_secs: u64,
    },

    /// Forward mapping kept in configuration.
    #[serde(rename = "static")]
    Static {
        #[serde(default)]
        rules: Vec<ForwardRule>,
    },
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig::Http {
            url: default_alias_api_url(),
            token: None,
            timeout_secs: default_lookup_timeout_secs(),
        }
    }
}

/// Content store holding the raw inbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "file")]
    File {
        #[serde(default = "default_storage_path")]
        path: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File {
            path: default_storage_path(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Queue between the pipeline and the drainer.
///
/// The receiving and the draining sides run as separate processes, so only
/// a queue living outside of them can be configured.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum QueueConfig {
    #[serde(rename = "redis")]
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
        #[serde(default = "default_queue_name")]
        queue: String,
    },
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::Redis {
            url: default_redis_url(),
            queue: default_queue_name(),
        }
    }
}

/// Delivery transport used by the drainer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum TransportConfig {
    #[serde(rename = "smtp")]
    Smtp {
        #[serde(default = "default_smtp_host")]
        host: String,
        #[serde(default = "default_smtp_port")]
        port: u16,
        #[serde(default)]
        starttls: bool,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },

    /// Dry run, deliveries are only logged.
    #[default]
    #[serde(rename = "log")]
    Log,
}

/// Suppression thresholds applied to alias records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SuppressionConfig {
    #[serde(default = "default_max_bounces")]
    pub max_bounces: u64,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            max_bounces: default_max_bounces(),
        }
    }
}

/// Worker pool sizing and polling parameters of the drainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DrainConfig {
    #[serde(default = "default_backlog_divisor")]
    pub backlog_divisor: usize,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_iterations")]
    pub iterations: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            backlog_divisor: default_backlog_divisor(),
            max_concurrency: default_max_concurrency(),
            iterations: default_iterations(),
            batch_size: default_batch_size(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            wait_secs: default_wait_secs(),
        }
    }
}

impl DrainConfig {
    pub fn policy(&self) -> DrainPolicy {
        DrainPolicy {
            backlog_divisor: self.backlog_divisor,
            max_concurrency: self.max_concurrency,
            iterations: self.iterations,
            receive: ReceiveOptions {
                max_items: self.batch_size,
                visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
                wait: Duration::from_secs(self.wait_secs),
            },
        }
    }
}

impl DirectoryConfig {
    pub fn build(&self) -> Result<Arc<dyn AliasDirectory>, ConfigError> {
        match self {
            DirectoryConfig::Http {
                url,
                token,
                timeout_secs,
            } => {
                let directory =
                    HttpAliasDirectory::new(url, token.clone(), Duration::from_secs(*timeout_secs))
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok(Arc::new(directory))
            }
            DirectoryConfig::Static { rules } => Ok(Arc::new(StaticAliasDirectory::new(rules))),
        }
    }
}

impl StorageConfig {
    pub fn key_prefix(&self) -> &str {
        let StorageConfig::File { key_prefix, .. } = self;
        key_prefix
    }

    pub fn build(&self) -> Arc<dyn ContentStore> {
        let StorageConfig::File { path, .. } = self;
        Arc::new(FileContentStore::new(path.into()))
    }
}

impl QueueConfig {
    pub fn build(&self) -> Result<Arc<dyn MessageQueue>, ConfigError> {
        match self {
            #[cfg(feature = "redis")]
            QueueConfig::Redis { url, queue } => {
                let queue = crate::queues::RedisQueue::new(url, queue.clone())
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok(Arc::new(queue))
            }
            #[cfg(not(feature = "redis"))]
            QueueConfig::Redis { .. } => Err(ConfigError::Invalid(
                "redis queue requires the `redis` feature".to_string(),
            )),
        }
    }
}

impl TransportConfig {
    pub fn build(&self) -> Result<Arc<dyn DeliveryTransport>, ConfigError> {
        match self {
            TransportConfig::Smtp {
                host,
                port,
                starttls,
                username,
                password,
            } => {
                let credentials = username
                    .clone()
                    .map(|username| (username, password.clone().unwrap_or_default()));
                let transport = SmtpTransport::new(host, *port, *starttls, credentials)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok(Arc::new(transport))
            }
            TransportConfig::Log => Ok(Arc::new(LogTransport)),
        }
    }
}

impl Config {
    /// Loads the configuration file named by [`CONFIG_ENV`], when set, then
    /// applies the process environment on top and validates the result.
    pub fn from_environment() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => load_config(Path::new(&path))?,
            _ => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlays the process environment, see [`Config::apply_env_from`].
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| env::var(name).ok());
    }

    /// Overlays environment-style settings read through `lookup`.
    ///
    /// Empty values are ignored. `ALIAS_API_URL`, `QUEUE_URL` and
    /// `EMAIL_BUCKET` switch their backend to the remote alias API, the
    /// Redis queue and the file store respectively.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(url) = var("ALIAS_API_URL") {
            self.directory = match std::mem::take(&mut self.directory) {
                DirectoryConfig::Http {
                    token,
                    timeout_secs,
                    ..
                } => DirectoryConfig::Http {
                    url,
                    token,
                    timeout_secs,
                },
                DirectoryConfig::Static { .. } => DirectoryConfig::Http {
                    url,
                    token: None,
                    timeout_secs: default_lookup_timeout_secs(),
                },
            };
        }
        if let Some(value) = var("ALIAS_API_TOKEN") {
            if let DirectoryConfig::Http { token, .. } = &mut self.directory {
                *token = Some(value);
            }
        }

        let QueueConfig::Redis { url, queue } = &mut self.queue;
        if let Some(value) = var("QUEUE_URL") {
            *url = value;
        }
        if let Some(name) = var("QUEUE_NAME") {
            *queue = name;
        }

        let StorageConfig::File { path, key_prefix } = &mut self.storage;
        if let Some(value) = var("EMAIL_BUCKET") {
            *path = value;
        }
        if let Some(prefix) = var("EMAIL_KEY_PREFIX") {
            *key_prefix = prefix;
        }

        if let Some(prefix) = var("SUBJECT_PREFIX") {
            self.headers.subject_prefix = Some(prefix);
        }
        if let Some(from) = var("FROM_EMAIL") {
            self.headers.from_email = Some(from);
        }
        if let Some(to) = var("TO_EMAIL") {
            self.headers.to_email = Some(to);
        }

        let unsubscribe_url = var("UNSUBSCRIBE_URL");
        let subscription_domain = var("SUBSCRIPTION_DOMAIN");
        if unsubscribe_url.is_some() || subscription_domain.is_some() {
            let current = self.headers.unsubscribe.take();
            let url = unsubscribe_url.or_else(|| current.as_ref().map(|u| u.url.clone()));
            let domain = subscription_domain.or_else(|| current.as_ref().map(|u| u.domain.clone()));
            self.headers.unsubscribe = match (url, domain) {
                (Some(url), Some(domain)) => Some(UnsubscribePolicy { url, domain }),
                _ => current,
            };
        }
    }

    /// Rejects settings the pipeline or the drainer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let drain = &self.drain;
        for (name, value) in [
            ("drain.backlog_divisor", drain.backlog_divisor),
            ("drain.max_concurrency", drain.max_concurrency),
            ("drain.iterations", drain.iterations),
            ("drain.batch_size", drain.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }

        if let DirectoryConfig::Http { url, .. } = &self.directory {
            Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("directory.url {url:?}: {e}")))?;
        }

        if let Some(unsubscribe) = &self.headers.unsubscribe {
            Url::parse(&unsubscribe.url).map_err(|e| {
                ConfigError::Invalid(format!("headers.unsubscribe.url {:?}: {e}", unsubscribe.url))
            })?;
            if unsubscribe.domain.trim_start_matches(['@', '.']).is_empty() {
                return Err(ConfigError::Invalid(
                    "headers.unsubscribe.domain must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn suppression_policy(&self) -> SuppressionPolicy {
        SuppressionPolicy {
            max_bounces: self.suppression.max_bounces,
        }
    }

    /// Builds the forwarding pipeline from the configured backends.
    pub fn pipeline(&self) -> Result<Pipeline, ConfigError> {
        let pipeline = Pipeline::forwarding(
            self.directory.build()?,
            self.suppression_policy(),
            self.storage.build(),
            self.storage.key_prefix().to_string(),
            self.headers.clone(),
            self.queue.build()?,
        );
        info!(pipeline = ?pipeline, "Forwarding pipeline ready");
        Ok(pipeline)
    }

    /// Builds the drainer from the configured backends.
    pub fn drainer(&self) -> Result<Drainer, ConfigError> {
        Ok(Drainer::new(
            self.queue.build()?,
            self.storage.build(),
            self.transport.build()?,
            self.storage.key_prefix().to_string(),
            self.drain.policy(),
        ))
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    #[error("Config I/O error: {0}")]
    Io(std::io::Error),

    /// A parse error occurred deserializing TOML.
    #[error("Config parse error: {0}")]
    Parse(toml::de::Error),

    /// A setting has a value that cannot be used.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn default_alias_api_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_lookup_timeout_secs() -> u64 {
    5
}

fn default_storage_path() -> String {
    "mailbox".to_string()
}

fn default_key_prefix() -> String {
    "emails/".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_queue_name() -> String {
    "tumble_forwards".to_string()
}

fn default_smtp_host() -> String {
    "127.0.0.1".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_max_bounces() -> u64 {
    3
}

fn default_backlog_divisor() -> usize {
    40
}

fn default_max_concurrency() -> usize {
    14
}

fn default_iterations() -> usize {
    8
}

fn default_batch_size() -> usize {
    5
}

fn default_visibility_timeout_secs() -> u64 {
    10
}

fn default_wait_secs() -> u64 {
    5
}
