//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{
    env, io,
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use archivist_influx::{client, write};
use serde::Deserialize;
use tracing::debug;

use crate::{
    catalog::{self, Policy},
    convert::{CollisionPolicy, ValueFilter},
};

/// Environment variable that, when set, holds the whole configuration
/// document and takes precedence over the configuration file.
pub const CONFIG_ENV: &str = "ARCHIVIST_CONFIG";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// A tag value is empty, which the store would reject on every write.
    #[error("Tag {0} must not be empty")]
    EmptyTag(&'static str),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

fn default_url() -> String {
    "http://influxdb:8086".to_string()
}

fn default_org() -> String {
    "pcp-org".to_string()
}

fn default_bucket() -> String {
    "pcp-metrics".to_string()
}

fn default_measurement() -> String {
    "pcp_metrics".to_string()
}

fn default_write_batch_size() -> NonZeroUsize {
    NonZeroUsize::new(50_000).unwrap_or(NonZeroUsize::MIN)
}

fn default_flush_interval() -> NonZeroU64 {
    NonZeroU64::new(1_000).unwrap_or(NonZeroU64::MIN)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> NonZeroU64 {
    NonZeroU64::new(1_000).unwrap_or(NonZeroU64::MIN)
}

fn default_request_timeout() -> NonZeroU64 {
    NonZeroU64::new(30).unwrap_or(NonZeroU64::MIN)
}

fn default_validation_batch_size() -> NonZeroUsize {
    NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN)
}

fn default_progress_interval() -> NonZeroUsize {
    NonZeroUsize::new(200).unwrap_or(NonZeroUsize::MIN)
}

fn default_product_type() -> String {
    "SERVER1".to_string()
}

fn default_serial_number() -> String {
    "1234".to_string()
}

fn default_lister() -> PathBuf {
    PathBuf::from("pminfo")
}

fn default_sampler() -> PathBuf {
    PathBuf::from("pmrep")
}

fn default_extractor() -> PathBuf {
    PathBuf::from("tar")
}

fn default_sidecar_extension() -> String {
    "meta".to_string()
}

fn default_archive_suffixes() -> Vec<String> {
    vec![".tar.xz".to_string()]
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where archives arrive, are unpacked and end up
    pub directories: Directories,
    /// The time-series store written to
    #[serde(default)]
    pub store: Store,
    /// Tags attached to every point
    #[serde(default)]
    pub tags: TagSet,
    /// Which metric categories are exported
    #[serde(default)]
    pub categories: Policy,
    /// Metric validation and its cache
    #[serde(default)]
    pub validation: Validation,
    /// Registry of metric names that carried data. Defaults to
    /// `metrics_labels.csv` in the log directory.
    pub tracker_file: Option<PathBuf>,
    /// Extra exclusions for parsed values
    #[serde(default)]
    pub value_filters: Vec<ValueFilter>,
    /// What to do when two metrics share a field name
    #[serde(default)]
    pub field_collisions: CollisionPolicy,
    /// External programs
    #[serde(default)]
    pub tools: Tools,
    /// The method by which to express telemetry
    pub telemetry: Option<Telemetry>,
}

/// Directory layout.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Directories {
    /// Scanned for new archives
    pub watch: PathBuf,
    /// Scratch space for unpacked archives
    pub extract: PathBuf,
    /// Archives that were exported
    pub processed: PathBuf,
    /// Archives that could not be exported
    pub failed: PathBuf,
    /// Caches, the name registry and debug CSV copies
    pub log: PathBuf,
}

impl Directories {
    /// Every directory, for creation at startup.
    #[must_use]
    pub fn all(&self) -> [&Path; 5] {
        [
            self.watch.as_path(),
            self.extract.as_path(),
            self.processed.as_path(),
            self.failed.as_path(),
            self.log.as_path(),
        ]
    }
}

/// Store connection and write behavior.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Store {
    /// Base URL
    #[serde(default = "default_url")]
    pub url: String,
    /// API token
    #[serde(default)]
    pub token: String,
    /// Organization
    #[serde(default = "default_org")]
    pub org: String,
    /// Bucket
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Measurement every point is written to
    #[serde(default = "default_measurement")]
    pub measurement: String,
    /// Points per network batch
    #[serde(default = "default_write_batch_size")]
    pub batch_size: NonZeroUsize,
    /// Longest a partial batch waits before it is sent
    #[serde(default = "default_flush_interval")]
    pub flush_interval_milliseconds: NonZeroU64,
    /// Retries after a failed batch write
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each subsequent one
    #[serde(default = "default_retry_interval")]
    pub retry_interval_milliseconds: NonZeroU64,
    /// Per-request deadline
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: NonZeroU64,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: String::new(),
            org: default_org(),
            bucket: default_bucket(),
            measurement: default_measurement(),
            batch_size: default_write_batch_size(),
            flush_interval_milliseconds: default_flush_interval(),
            max_retries: default_max_retries(),
            retry_interval_milliseconds: default_retry_interval(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Store {
    /// Connection details for the store client.
    #[must_use]
    pub fn client_config(&self) -> client::Config {
        client::Config {
            url: self.url.clone(),
            token: self.token.clone(),
            org: self.org.clone(),
            bucket: self.bucket.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_seconds.get()),
        }
    }

    /// Batching and retry behavior for the write API.
    #[must_use]
    pub fn write_options(&self) -> write::Options {
        write::Options {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_milliseconds.get()),
            max_retries: self.max_retries,
            retry_interval: Duration::from_millis(self.retry_interval_milliseconds.get()),
            ..write::Options::default()
        }
    }
}

/// The fixed tag set attached to every point.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TagSet {
    /// Written as tag `product_type`
    #[serde(default = "default_product_type")]
    pub product_type: String,
    /// Written as tag `serialNumber`
    #[serde(default = "default_serial_number")]
    pub serial_number: String,
}

impl Default for TagSet {
    fn default() -> Self {
        Self {
            product_type: default_product_type(),
            serial_number: default_serial_number(),
        }
    }
}

impl TagSet {
    fn validate(&self) -> Result<(), Error> {
        if self.product_type.trim().is_empty() {
            return Err(Error::EmptyTag("product_type"));
        }
        if self.serial_number.trim().is_empty() {
            return Err(Error::EmptyTag("serial_number"));
        }
        Ok(())
    }

    /// Tag keys and values as written to the store.
    #[must_use]
    pub fn pairs(&self) -> Vec<(String, String)> {
        vec![
            ("product_type".to_string(), self.product_type.clone()),
            ("serialNumber".to_string(), self.serial_number.clone()),
        ]
    }
}

/// Metric validation.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Validation {
    /// Metrics probed per sampler invocation
    #[serde(default = "default_validation_batch_size")]
    pub batch_size: NonZeroUsize,
    /// Log progress every this many probed metrics
    #[serde(default = "default_progress_interval")]
    pub progress_interval: NonZeroUsize,
    /// Ignore the cache and validate again
    #[serde(default)]
    pub force_revalidate: bool,
    /// Export every listed metric without probing
    #[serde(default)]
    pub skip: bool,
    /// Validated set cache. Defaults to `validated_metrics.txt` in the log
    /// directory.
    pub cache_file: Option<PathBuf>,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            batch_size: default_validation_batch_size(),
            progress_interval: default_progress_interval(),
            force_revalidate: false,
            skip: false,
            cache_file: None,
        }
    }
}

/// External programs and archive naming.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Tools {
    /// Lists an archive's metrics
    #[serde(default = "default_lister")]
    pub lister: PathBuf,
    /// Samples metric values out of an archive
    #[serde(default = "default_sampler")]
    pub sampler: PathBuf,
    /// Unpacks archive bundles
    #[serde(default = "default_extractor")]
    pub extractor: PathBuf,
    /// Extension of the file that marks an archive base
    #[serde(default = "default_sidecar_extension")]
    pub sidecar_extension: String,
    /// File name endings that identify archive bundles
    #[serde(default = "default_archive_suffixes")]
    pub archive_suffixes: Vec<String>,
    /// Deadline for each non-streaming tool invocation
    pub command_timeout_seconds: Option<NonZeroU64>,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            lister: default_lister(),
            sampler: default_sampler(),
            extractor: default_extractor(),
            sidecar_extension: default_sidecar_extension(),
            archive_suffixes: default_archive_suffixes(),
            command_timeout_seconds: None,
        }
    }
}

impl Tools {
    /// The deadline for non-streaming invocations, if any.
    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_seconds
            .map(|secs| Duration::from_secs(secs.get()))
    }
}

/// Defines the manner of archivist's own telemetry.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Telemetry {
    /// Expose counters for scraping
    pub prometheus: Option<Prometheus>,
}

/// Prometheus exposition.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Prometheus {
    /// Address and port for prometheus exporter
    pub addr: SocketAddr,
}

impl Config {
    /// Validated set cache location.
    #[must_use]
    pub fn cache_file(&self) -> PathBuf {
        self.validation
            .cache_file
            .clone()
            .unwrap_or_else(|| self.directories.log.join("validated_metrics.txt"))
    }

    /// Name registry location.
    #[must_use]
    pub fn tracker_file(&self) -> PathBuf {
        self.tracker_file
            .clone()
            .unwrap_or_else(|| self.directories.log.join("metrics_labels.csv"))
    }

    /// Debug CSV location for the archive with stem `stem`.
    #[must_use]
    pub fn debug_csv(&self, stem: &str) -> PathBuf {
        self.directories
            .log
            .join(format!("sampler_output_{stem}.csv"))
    }

    /// Catalog settings.
    #[must_use]
    pub fn catalog_settings(&self) -> catalog::Settings {
        catalog::Settings {
            lister: self.tools.lister.clone(),
            sampler: self.tools.sampler.clone(),
            cache_path: self.cache_file(),
            batch_size: self.validation.batch_size,
            progress_interval: self.validation.progress_interval,
            skip_validation: self.validation.skip,
        }
    }
}

/// Parse a configuration document.
///
/// # Errors
///
/// Function will error if the document is not a valid configuration or a
/// tag value is empty.
pub fn parse(contents: &str) -> Result<Config, Error> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.tags.validate()?;
    Ok(config)
}

/// Load the configuration from [`CONFIG_ENV`] if set, else from `path`.
///
/// # Errors
///
/// Function will error if the file cannot be read or the document is not a
/// valid configuration.
pub fn load(path: &Path) -> Result<Config, Error> {
    let contents = if let Ok(value) = env::var(CONFIG_ENV) {
        debug!("Using config from env var '{CONFIG_ENV}'");
        value
    } else {
        debug!("Attempting to open configuration file at: {}", path.display());
        std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source,
        })?
    };
    parse(&contents)
}
