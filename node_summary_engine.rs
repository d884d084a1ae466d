//! # Node Summary Engine
//!
//! A periodic, per-node utilization summary engine. Every tick it enumerates
//! the known nodes of a cluster, samples the latest CPU, memory and storage
//! figures for each node from a time-series backend, and publishes one
//! summary record per node to a shared key-value store.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          NODE SUMMARY ENGINE                                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SCHEDULER → (per node task) CALCULATOR → RECONCILER ← STORE.load            │
//! │                                           RECONCILER → STORE.save            │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Category isolation**: a missing CPU sample never blocks memory or storage
//! - **Last known good**: a category that cannot be computed is carried forward
//! - **Node isolation**: one node's failures never touch another node's record
//! - **Non-destructive**: if the previous summary cannot be read, nothing is written

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{SecondsFormat, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::{Client as HttpClient, StatusCode};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;
use regex::Regex;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "node-summary-engine";
pub const ENGINE_FULL_NAME: &str = "Node Summary Aggregation Engine";

/// Prefix for environment variable overrides of the configuration file
pub const ENV_PREFIX: &str = "NODE_SUMMARY_";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default period between two aggregation ticks (seconds)
pub const DEFAULT_AGGREGATION_INTERVAL_SECS: u64 = 60;

/// Minimum allowed aggregation period (seconds)
pub const MIN_AGGREGATION_INTERVAL_SECS: u64 = 1;

/// Default delay before a node task starts querying the backend (milliseconds)
pub const DEFAULT_NODE_STAGGER_MS: u64 = 1000;

/// Default timeout for HTTP requests against etcd and the stats backend (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Grace period for in-flight node tasks on shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Backend Protocol
// ----------------------------------------------------------------------------

/// Body returned by the time-series backend when no sample exists yet
pub const EMPTY_STATS_SENTINEL: &str = "[]";

/// Query mode asking the backend for the most recent sample only
pub const LATEST_MODE: &str = "latest";

/// Key prefix under which node summaries are published
pub const DEFAULT_SUMMARY_KEY_PREFIX: &str = "monitoring/summary/nodes";

/// Default etcd client endpoint
pub const DEFAULT_ETCD_ENDPOINT: &str = "http://127.0.0.1:2379";

/// etcd v2 error code for a missing key
pub const ETCD_KEY_NOT_FOUND_CODE: u64 = 100;

/// Default stats endpoint. `{node}`, `{metric}` and `{mode}` are substituted per query.
pub const DEFAULT_STATS_URL_TEMPLATE: &str =
    "http://127.0.0.1:10080/api/stats/{node}/{metric}?mode={mode}";

// ----------------------------------------------------------------------------
// Metric Paths
// ----------------------------------------------------------------------------

pub const METRIC_CPU_USER: &str = "cpu.percent-user";
pub const METRIC_CPU_SYSTEM: &str = "cpu.percent-system";
pub const METRIC_MEMORY_USED: &str = "memory.memory-used";
pub const METRIC_MEMORY_TOTAL: &str = "aggregation-memory-sum.memory";
pub const METRIC_MEMORY_PERCENT_USED: &str = "memory.percent-used";
pub const METRIC_STORAGE_USED: &str = "df-*.df_complex-used";
pub const METRIC_STORAGE_FREE: &str = "df-*.df_complex-free";

// ============================================================================
// SECTION 3: SUMMARY DATA MODEL
// ============================================================================
// The record published per node. Every numeric field is a decimal string so
// that a blank value can represent "never measured" without a sentinel
// number. A category with an empty `updated_at` has never been computed.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Usage Categories
// ----------------------------------------------------------------------------

/// CPU usage of a node at `updated_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub percent_used: String,
    #[serde(default)]
    pub updated_at: String,
}

impl CpuUsage {
    /// A freshly measured CPU snapshot.
    pub fn measured(percent_used: f64, updated_at: impl Into<String>) -> Self {
        Self {
            percent_used: format_decimal(percent_used),
            updated_at: updated_at.into(),
        }
    }

    /// True if this category has never been computed.
    pub fn is_blank(&self) -> bool {
        self.updated_at.is_empty()
    }
}

/// Used/total capacity of a node resource (memory or storage) at `updated_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityUsage {
    #[serde(default)]
    pub used: String,
    #[serde(default)]
    pub total: String,
    #[serde(default)]
    pub percent_used: String,
    #[serde(default)]
    pub updated_at: String,
}

impl CapacityUsage {
    /// A freshly measured capacity snapshot.
    pub fn measured(used: f64, total: f64, percent_used: f64, updated_at: impl Into<String>) -> Self {
        Self {
            used: format_decimal(used),
            total: format_decimal(total),
            percent_used: format_decimal(percent_used),
            updated_at: updated_at.into(),
        }
    }

    /// True if this category has never been computed.
    pub fn is_blank(&self) -> bool {
        self.updated_at.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 3.2 Node Summary Record
// ----------------------------------------------------------------------------

/// The summary published for one node. Downstream dashboards read this record
/// directly from the store, so field names are part of the external contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub memory_usage: CapacityUsage,
    #[serde(default)]
    pub storage_usage: CapacityUsage,
    #[serde(default)]
    pub alert_count: u64,
}

impl NodeSummary {
    /// The all-blank record used before a node has ever been summarized.
    pub fn placeholder(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Encode as the single JSON record written to the store.
    pub fn to_record(&self) -> StoreResult<String> {
        serde_json::to_string(self).map_err(|e| StoreError::Encode {
            message: e.to_string(),
        })
    }

    /// Decode a stored record. `key` is only used for error context.
    pub fn from_record(key: &str, record: &str) -> StoreResult<Self> {
        serde_json::from_str(record).map_err(|e| StoreError::Corrupted {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 3.3 Candidate Snapshots
// ----------------------------------------------------------------------------

/// The three snapshots computed for one node in one cycle. `None` means the
/// category could not be computed this time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtilizationSnapshots {
    pub cpu: Option<CpuUsage>,
    pub memory: Option<CapacityUsage>,
    pub storage: Option<CapacityUsage>,
}

impl UtilizationSnapshots {
    /// Number of categories that will be carried forward.
    pub fn missing_count(&self) -> u64 {
        [self.cpu.is_none(), self.memory.is_none(), self.storage.is_none()]
            .iter()
            .filter(|missing| **missing)
            .count() as u64
    }
}

// ----------------------------------------------------------------------------
// 3.4 Formatting Helpers
// ----------------------------------------------------------------------------

/// Shortest round-trip positional rendering, keeping a trailing `.0` on
/// integral values (`3.5` -> "3.5", `75.0` -> "75.0", `1e16` ->
/// "10000000000000000.0"). Never uses exponent notation.
pub fn format_decimal(value: f64) -> String {
    let mut rendered = value.to_string();
    if value.is_finite() && !rendered.contains('.') {
        rendered.push_str(".0");
    }
    rendered
}

/// Current time as an RFC 3339 UTC string with microsecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all convertible into `SummaryError`.
// Category-level failures never leave the calculator; only store failures
// and configuration problems surface to callers.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Stats error: {0}")]
    Stats(#[from] StatsError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("Summary store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SummaryError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            SummaryError::Config(_) => false,
            SummaryError::Stats(_) => true,
            SummaryError::Registry(e) => e.is_recoverable(),
            SummaryError::Kv(e) => e.is_recoverable(),
            SummaryError::Store(e) => e.is_recoverable(),
            SummaryError::Io(_) => true,
            SummaryError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            SummaryError::Config(_) => "config",
            SummaryError::Stats(_) => "stats",
            SummaryError::Registry(_) => "registry",
            SummaryError::Kv(_) => "kv",
            SummaryError::Store(_) => "store",
            SummaryError::Io(_) => "io",
            SummaryError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Stats Errors
// ----------------------------------------------------------------------------

/// Failures while fetching or parsing one metric for one node.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("Stats not yet available in time series db")]
    StatsUnavailable,

    #[error("Current utilization not found in stats response")]
    MalformedStatsResponse,

    #[error("Received non-numeric utilization value '{value}'")]
    InvalidNumericValue { value: String },

    #[error("Time-series query failed: {message}")]
    QueryFailed { message: String },

    #[error("Node lookup failed: {0}")]
    Registry(#[from] RegistryError),
}

impl StatsError {
    /// `StatsUnavailable` is the normal state of a freshly added node.
    pub fn is_expected(&self) -> bool {
        matches!(self, StatsError::StatsUnavailable)
    }

    /// Priority at which this failure is reported on the event channel.
    pub fn priority(&self) -> EventPriority {
        if self.is_expected() {
            EventPriority::Debug
        } else {
            EventPriority::Warning
        }
    }

    pub fn query_failed(message: impl Into<String>) -> Self {
        StatsError::QueryFailed {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Registry Errors
// ----------------------------------------------------------------------------

/// Errors from the node-identity registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Node '{node_id}' not found")]
    NodeNotFound { node_id: String },

    #[error("Registry backend failure: {0}")]
    Backend(#[from] KvError),
}

impl RegistryError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            RegistryError::NodeNotFound { .. } => true,
            RegistryError::Backend(e) => e.is_recoverable(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Key-Value Store Errors
// ----------------------------------------------------------------------------

/// Errors from the distributed key-value store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    #[error("Connection to '{endpoint}' failed: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Store returned status {status} for '{key}': {message}")]
    Backend {
        key: String,
        status: u16,
        message: String,
    },

    #[error("Unexpected store response for '{key}': {message}")]
    Protocol { key: String, message: String },
}

impl KvError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, KvError::Protocol { .. })
    }

    pub fn is_key_not_found(&self) -> bool {
        matches!(self, KvError::KeyNotFound { .. })
    }

    pub fn key_not_found(key: impl Into<String>) -> Self {
        KvError::KeyNotFound { key: key.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Summary Store Errors
// ----------------------------------------------------------------------------

/// Errors from loading or saving node summaries
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to load summary '{key}': {source}")]
    Load {
        key: String,
        #[source]
        source: KvError,
    },

    #[error("Failed to save summary '{key}': {source}")]
    Save {
        key: String,
        #[source]
        source: KvError,
    },

    #[error("Stored summary '{key}' is corrupted: {message}")]
    Corrupted { key: String, message: String },

    #[error("Failed to encode summary: {message}")]
    Encode { message: String },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::Load { source, .. } | StoreError::Save { source, .. } => source.is_recoverable(),
            StoreError::Corrupted { .. } => false,
            StoreError::Encode { .. } => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.7 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type SummaryResult<T> = Result<T, SummaryError>;

/// Result type for metric queries and parsing
pub type StatsResult<T> = Result<T, StatsError>;

/// Result type for registry lookups
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type for key-value operations
pub type KvResult<T> = Result<T, KvError>;

/// Result type for summary persistence
pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file parsing with environment variable overrides
// (`NODE_SUMMARY_AGGREGATION__INTERVAL=30s`), validation and defaults for
// every field so that an empty file is a valid configuration.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Tick cadence and per-node task settings
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Metric paths queried for each category
    #[serde(default)]
    pub metrics: MetricPathsConfig,

    /// Source of node identities and alert ids
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Where summaries are published
    #[serde(default)]
    pub store: StoreConfig,

    /// etcd connection settings
    #[serde(default)]
    pub etcd: EtcdConfig,

    /// Time-series backend settings
    #[serde(default)]
    pub timeseries: TimeSeriesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregation.interval < Duration::from_secs(MIN_AGGREGATION_INTERVAL_SECS) {
            return Err(ConfigError::invalid_value(
                "aggregation.interval",
                format!(
                    "Aggregation interval must be at least {}s",
                    MIN_AGGREGATION_INTERVAL_SECS
                ),
            ));
        }

        if self.aggregation.summary_key_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::invalid_value(
                "aggregation.summary_key_prefix",
                "Summary key prefix cannot be empty",
            ));
        }

        if self.engine.publisher_id.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "engine.publisher_id",
                "Publisher id cannot be empty",
            ));
        }

        for placeholder in ["{node}", "{metric}"] {
            if !self.timeseries.stats_url_template.contains(placeholder) {
                return Err(ConfigError::invalid_value(
                    "timeseries.stats_url_template",
                    format!("Template must contain the {} placeholder", placeholder),
                ));
            }
        }

        let paths = self.metrics.as_pairs();
        if let Some((field, _)) = paths.iter().find(|(_, path)| path.trim().is_empty()) {
            return Err(ConfigError::invalid_value(
                format!("metrics.{}", field),
                "Metric path cannot be empty",
            ));
        }

        let mut seen = BTreeSet::new();
        for node in &self.registry.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::invalid_value(
                    "registry.nodes",
                    format!("Duplicate node id '{}'", node.id),
                ));
            }
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Publisher id attached to every event this engine reports
    #[serde(default = "default_publisher_id")]
    pub publisher_id: String,

    /// How long in-flight node tasks may run after a stop request
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            publisher_id: default_publisher_id(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_publisher_id() -> String {
    "performance_monitoring".into()
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)
}

// ----------------------------------------------------------------------------
// 5.3 Aggregation Configuration
// ----------------------------------------------------------------------------

/// Tick cadence and per-node task settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Period between two ticks
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Delay before every node task starts querying
    #[serde(default = "default_stagger", with = "humantime_serde")]
    pub stagger: Duration,

    /// Extra per-node delay in `[0, stagger_jitter)`, derived from the node id
    #[serde(default, with = "humantime_serde")]
    pub stagger_jitter: Duration,

    /// Key prefix of the published summaries
    #[serde(default = "default_summary_key_prefix")]
    pub summary_key_prefix: String,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            stagger: default_stagger(),
            stagger_jitter: Duration::ZERO,
            summary_key_prefix: default_summary_key_prefix(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(DEFAULT_AGGREGATION_INTERVAL_SECS)
}

fn default_stagger() -> Duration {
    Duration::from_millis(DEFAULT_NODE_STAGGER_MS)
}

fn default_summary_key_prefix() -> String {
    DEFAULT_SUMMARY_KEY_PREFIX.into()
}

// ----------------------------------------------------------------------------
// 5.4 Metric Paths Configuration
// ----------------------------------------------------------------------------

/// Metric paths queried for each category. Storage paths are wildcard paths
/// that match one series per filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricPathsConfig {
    #[serde(default = "default_cpu_user")]
    pub cpu_user: String,
    #[serde(default = "default_cpu_system")]
    pub cpu_system: String,
    #[serde(default = "default_memory_used")]
    pub memory_used: String,
    #[serde(default = "default_memory_total")]
    pub memory_total: String,
    #[serde(default = "default_memory_percent_used")]
    pub memory_percent_used: String,
    #[serde(default = "default_storage_used")]
    pub storage_used: String,
    #[serde(default = "default_storage_free")]
    pub storage_free: String,
}

impl MetricPathsConfig {
    fn as_pairs(&self) -> [(&'static str, &str); 7] {
        [
            ("cpu_user", self.cpu_user.as_str()),
            ("cpu_system", self.cpu_system.as_str()),
            ("memory_used", self.memory_used.as_str()),
            ("memory_total", self.memory_total.as_str()),
            ("memory_percent_used", self.memory_percent_used.as_str()),
            ("storage_used", self.storage_used.as_str()),
            ("storage_free", self.storage_free.as_str()),
        ]
    }
}

impl Default for MetricPathsConfig {
    fn default() -> Self {
        Self {
            cpu_user: default_cpu_user(),
            cpu_system: default_cpu_system(),
            memory_used: default_memory_used(),
            memory_total: default_memory_total(),
            memory_percent_used: default_memory_percent_used(),
            storage_used: default_storage_used(),
            storage_free: default_storage_free(),
        }
    }
}

fn default_cpu_user() -> String {
    METRIC_CPU_USER.into()
}

fn default_cpu_system() -> String {
    METRIC_CPU_SYSTEM.into()
}

fn default_memory_used() -> String {
    METRIC_MEMORY_USED.into()
}

fn default_memory_total() -> String {
    METRIC_MEMORY_TOTAL.into()
}

fn default_memory_percent_used() -> String {
    METRIC_MEMORY_PERCENT_USED.into()
}

fn default_storage_used() -> String {
    METRIC_STORAGE_USED.into()
}

fn default_storage_free() -> String {
    METRIC_STORAGE_FREE.into()
}

// ----------------------------------------------------------------------------
// 5.5 Registry & Store Configuration
// ----------------------------------------------------------------------------

/// Which registry implementation to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// Node identities read from etcd
    #[default]
    Etcd,
    /// Node identities listed in this file
    Static,
}

/// Node registry configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackend,

    /// Nodes served by the static backend
    #[serde(default)]
    pub nodes: Vec<StaticNodeConfig>,
}

/// One node of the static registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticNodeConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub alert_ids: Vec<String>,
}

/// Which key-value store implementation to publish to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Etcd,
    /// In-process map, lost on exit. Useful for dry runs.
    Memory,
}

/// Summary store configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

// ----------------------------------------------------------------------------
// 5.6 etcd Configuration
// ----------------------------------------------------------------------------

/// etcd v2 keys API settings, shared by the store and the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Directory whose children are the known node ids
    #[serde(default = "default_nodes_prefix")]
    pub nodes_prefix: String,

    /// Key, relative to a node directory, holding the node's display name
    #[serde(default = "default_node_name_key")]
    pub node_name_key: String,

    /// Directory whose per-node children are the active alert ids
    #[serde(default = "default_alerts_prefix")]
    pub alerts_prefix: String,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoint: default_etcd_endpoint(),
            request_timeout: default_http_timeout(),
            nodes_prefix: default_nodes_prefix(),
            node_name_key: default_node_name_key(),
            alerts_prefix: default_alerts_prefix(),
        }
    }
}

fn default_etcd_endpoint() -> String {
    DEFAULT_ETCD_ENDPOINT.into()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

fn default_nodes_prefix() -> String {
    "nodes".into()
}

fn default_node_name_key() -> String {
    "NodeContext/fqdn".into()
}

fn default_alerts_prefix() -> String {
    "alerting/nodes".into()
}

// ----------------------------------------------------------------------------
// 5.7 Time-Series Configuration
// ----------------------------------------------------------------------------

/// Time-series backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesConfig {
    /// URL queried per metric; `{node}`, `{metric}` and `{mode}` are substituted
    #[serde(default = "default_stats_url_template")]
    pub stats_url_template: String,

    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            stats_url_template: default_stats_url_template(),
            request_timeout: default_http_timeout(),
        }
    }
}

fn default_stats_url_template() -> String {
    DEFAULT_STATS_URL_TEMPLATE.into()
}

// ----------------------------------------------------------------------------
// 5.8 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & OBSERVABILITY
// ============================================================================
// Structured logging through `tracing`, plus the fire-and-forget event
// channel every component reports its failures to.
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> SummaryResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| SummaryError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| SummaryError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| SummaryError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "summary::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Event Priority & Payload
// ----------------------------------------------------------------------------

/// Priority of an event on the observability channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
}

impl Display for EventPriority {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EventPriority::Debug => write!(f, "debug"),
            EventPriority::Info => write!(f, "info"),
            EventPriority::Notice => write!(f, "notice"),
            EventPriority::Warning => write!(f, "warning"),
            EventPriority::Error => write!(f, "error"),
            EventPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Payload of an event: a message plus enough context to find the gap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SummaryEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_error(mut self, error: &dyn std::error::Error) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

// ----------------------------------------------------------------------------
// 6.3 Event Sink
// ----------------------------------------------------------------------------

/// The observability channel. `emit` must never block or fail the caller.
pub trait EventSink: Send + Sync + Debug {
    fn emit(&self, priority: EventPriority, event: SummaryEvent);
}

macro_rules! emit_event {
    ($level:ident, $publisher:expr, $priority:expr, $event:expr) => {
        tracing::$level!(
            target: "summary::events",
            publisher = %$publisher,
            priority = %$priority,
            node_id = $event.node_id.as_deref().unwrap_or("-"),
            resource = $event.resource.as_deref().unwrap_or("-"),
            error = $event.error.as_deref().unwrap_or(""),
            "{}",
            $event.message
        )
    };
}

/// Event sink that forwards every event to `tracing`, tagged with the
/// publisher id of this engine instance.
#[derive(Debug, Clone)]
pub struct TracingEventSink {
    publisher_id: String,
}

impl TracingEventSink {
    pub fn new(publisher_id: impl Into<String>) -> Self {
        Self {
            publisher_id: publisher_id.into(),
        }
    }
}

impl EventSink for TracingEventSink {
    fn emit(&self, priority: EventPriority, event: SummaryEvent) {
        match priority {
            EventPriority::Debug => emit_event!(debug, self.publisher_id, priority, event),
            EventPriority::Info | EventPriority::Notice => {
                emit_event!(info, self.publisher_id, priority, event)
            }
            EventPriority::Warning => emit_event!(warn, self.publisher_id, priority, event),
            EventPriority::Error | EventPriority::Critical => {
                emit_event!(error, self.publisher_id, priority, event)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 6.4 Aggregation Statistics
// ----------------------------------------------------------------------------

/// Lock-free counters shared by the scheduler and every node task.
#[derive(Debug, Default)]
pub struct AggregationStats {
    ticks: AtomicU64,
    registry_failures: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_completed: AtomicU64,
    summaries_saved: AtomicU64,
    load_failures: AtomicU64,
    save_failures: AtomicU64,
    categories_carried_forward: AtomicU64,
}

impl AggregationStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_tick(&self) {
        self.ticks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_registry_failure(&self) {
        self.registry_failures.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_dispatch(&self) {
        self.tasks_dispatched.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_outcome(&self, outcome: AggregationOutcome) {
        self.tasks_completed.fetch_add(1, AtomicOrdering::Relaxed);
        let counter = match outcome {
            AggregationOutcome::Saved => &self.summaries_saved,
            AggregationOutcome::LoadFailed => &self.load_failures,
            AggregationOutcome::SaveFailed => &self.save_failures,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_carried_forward(&self, categories: u64) {
        self.categories_carried_forward
            .fetch_add(categories, AtomicOrdering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> AggregationStatsSnapshot {
        AggregationStatsSnapshot {
            ticks: self.ticks.load(AtomicOrdering::Relaxed),
            registry_failures: self.registry_failures.load(AtomicOrdering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(AtomicOrdering::Relaxed),
            tasks_completed: self.tasks_completed.load(AtomicOrdering::Relaxed),
            summaries_saved: self.summaries_saved.load(AtomicOrdering::Relaxed),
            load_failures: self.load_failures.load(AtomicOrdering::Relaxed),
            save_failures: self.save_failures.load(AtomicOrdering::Relaxed),
            categories_carried_forward: self.categories_carried_forward.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationStatsSnapshot {
    pub ticks: u64,
    pub registry_failures: u64,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub summaries_saved: u64,
    pub load_failures: u64,
    pub save_failures: u64,
    pub categories_carried_forward: u64,
}

impl AggregationStatsSnapshot {
    pub fn in_flight(&self) -> u64 {
        self.tasks_dispatched.saturating_sub(self.tasks_completed)
    }
}

// ============================================================================
// SECTION 7: COLLABORATOR CONTRACTS
// ============================================================================
// The engine owns none of its backends. Each is injected behind a trait so
// that every component can be exercised against in-process fakes.
// ============================================================================

/// Node-identity registry: which nodes exist, what they are called and how
/// many alerts are active on them.
#[async_trait]
pub trait NodeRegistry: Send + Sync + Debug {
    /// All currently known node ids.
    async fn node_ids(&self) -> RegistryResult<BTreeSet<String>>;

    /// Display name of a node, as known to the time-series backend.
    async fn node_name(&self, node_id: &str) -> RegistryResult<String>;

    /// Active alert ids of a node. Empty when there are none.
    async fn alert_ids(&self, node_id: &str) -> RegistryResult<Vec<String>>;
}

/// Time-series backend returning raw stats text for one metric path.
/// `metric_path` may contain a wildcard segment.
#[async_trait]
pub trait StatsSource: Send + Sync + Debug {
    async fn query(&self, node_name: &str, metric_path: &str, mode: &str) -> StatsResult<String>;
}

/// Distributed key-value store. A missing key is `KvError::KeyNotFound`.
#[async_trait]
pub trait KvStore: Send + Sync + Debug {
    async fn read(&self, key: &str) -> KvResult<String>;

    async fn write(&self, key: &str, value: String) -> KvResult<()>;
}

// ============================================================================
// SECTION 8: METRIC STAT PARSER
// ============================================================================
// The backend answers with free-form text containing one
// `Current:<value>Max` fragment per matched series. A single extraction path
// classifies the body once and fails fast with a typed error.
// ============================================================================

static CURRENT_VALUE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Current:(.+?)Max").expect("current value pattern is a valid regex"));

/// Every captured `Current:` value, in response order.
fn current_captures(stats: &str) -> StatsResult<Vec<&str>> {
    let body = stats.trim();
    if body.is_empty() || body == EMPTY_STATS_SENTINEL {
        return Err(StatsError::StatsUnavailable);
    }

    let values: Vec<&str> = CURRENT_VALUE_PATTERN
        .captures_iter(stats)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .collect();

    if values.is_empty() {
        return Err(StatsError::MalformedStatsResponse);
    }
    Ok(values)
}

/// Parse one captured value, rejecting NaN.
pub fn parse_numeric(raw: &str) -> StatsResult<f64> {
    let raw = raw.trim();
    match raw.parse::<f64>() {
        Ok(value) if !value.is_nan() => Ok(value),
        _ => Err(StatsError::InvalidNumericValue {
            value: raw.to_string(),
        }),
    }
}

/// The first `Current:` value of a single-series response.
pub fn extract_current(stats: &str) -> StatsResult<f64> {
    let values = current_captures(stats)?;
    match values.first() {
        Some(raw) => parse_numeric(raw),
        None => Err(StatsError::MalformedStatsResponse),
    }
}

/// All `Current:` values of a wildcard response, unparsed.
pub fn extract_all_current(stats: &str) -> StatsResult<Vec<String>> {
    Ok(current_captures(stats)?
        .into_iter()
        .map(|raw| raw.trim().to_string())
        .collect())
}

/// Sum of the values, skipping NaN and unparseable entries.
pub fn sum_skipping_nan(values: &[String]) -> f64 {
    values
        .iter()
        .filter_map(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| !value.is_nan())
        .sum()
}

/// Stats parser that reports every failure on the event channel before
/// handing it back to the caller.
#[derive(Debug, Clone)]
pub struct MetricStatParser {
    sink: Arc<dyn EventSink>,
}

impl MetricStatParser {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Single-series form.
    pub fn current_value(&self, node_id: &str, resource: &str, stats: &str) -> StatsResult<f64> {
        extract_current(stats).map_err(|err| {
            self.report(node_id, resource, &err, "Failed to get latest stat for node summary");
            err
        })
    }

    /// Wildcard form.
    pub fn current_values(
        &self,
        node_id: &str,
        resource: &str,
        stats: &str,
    ) -> StatsResult<Vec<String>> {
        extract_all_current(stats).map_err(|err| {
            self.report(node_id, resource, &err, "Failed to get latest stats for node summary");
            err
        })
    }

    fn report(&self, node_id: &str, resource: &str, err: &StatsError, message: &str) {
        trace!(target: "summary::parser", node_id, resource, error = %err, "Stats extraction failed");
        self.sink.emit(
            err.priority(),
            SummaryEvent::new(message)
                .with_node(node_id)
                .with_resource(resource)
                .with_error(err),
        );
    }
}

// ============================================================================
// SECTION 9: NODE UTILIZATION CALCULATOR
// ============================================================================
// Three independent snapshots per node. A failed query turns its category
// into `None` and nothing else: the other categories, the other nodes and
// the scheduler never see the error.
// ============================================================================

/// A node id paired with the name the time-series backend knows it by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef<'a> {
    pub id: &'a str,
    pub name: &'a str,
}

impl<'a> NodeRef<'a> {
    pub fn new(id: &'a str, name: &'a str) -> Self {
        Self { id, name }
    }
}

/// Computes CPU, memory and storage snapshots for one node at a time.
#[derive(Debug, Clone)]
pub struct NodeUtilizationCalculator {
    registry: Arc<dyn NodeRegistry>,
    source: Arc<dyn StatsSource>,
    sink: Arc<dyn EventSink>,
    parser: MetricStatParser,
    paths: MetricPathsConfig,
}

impl NodeUtilizationCalculator {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        source: Arc<dyn StatsSource>,
        sink: Arc<dyn EventSink>,
        paths: MetricPathsConfig,
    ) -> Self {
        Self {
            parser: MetricStatParser::new(sink.clone()),
            registry,
            source,
            sink,
            paths,
        }
    }

    /// Display name of the node, reported once on failure.
    async fn resolve_name(&self, node_id: &str) -> Option<String> {
        match self.registry.node_name(node_id).await {
            Ok(name) => Some(name),
            Err(err) => {
                let err = StatsError::from(err);
                self.sink.emit(
                    err.priority(),
                    SummaryEvent::new("Failed to resolve node name for node summary")
                        .with_node(node_id)
                        .with_error(&err),
                );
                None
            }
        }
    }

    /// Raw stats text for one metric. Transport failures are reported here;
    /// parse failures are reported by the parser.
    async fn fetch_stats(&self, node: &NodeRef<'_>, resource: &str) -> StatsResult<String> {
        self.source
            .query(node.name, resource, LATEST_MODE)
            .await
            .map_err(|err| {
                self.sink.emit(
                    err.priority(),
                    SummaryEvent::new("Failed to query time-series backend for node summary")
                        .with_node(node.id)
                        .with_resource(resource)
                        .with_error(&err),
                );
                err
            })
    }

    /// Latest value of a single-series metric.
    pub async fn latest_stat(&self, node: &NodeRef<'_>, resource: &str) -> StatsResult<f64> {
        let stats = self.fetch_stats(node, resource).await?;
        self.parser.current_value(node.id, resource, &stats)
    }

    /// Latest values of every series matched by a wildcard metric.
    pub async fn latest_stats(&self, node: &NodeRef<'_>, resource: &str) -> StatsResult<Vec<String>> {
        let stats = self.fetch_stats(node, resource).await?;
        self.parser.current_values(node.id, resource, &stats)
    }

    /// User plus system CPU time.
    pub async fn cpu_utilization(&self, node: &NodeRef<'_>) -> Option<CpuUsage> {
        let user = self.latest_stat(node, &self.paths.cpu_user).await.ok()?;
        let system = self.latest_stat(node, &self.paths.cpu_system).await.ok()?;
        Some(CpuUsage::measured(user + system, timestamp_now()))
    }

    /// Used, total and percent-used memory; all three or nothing.
    pub async fn memory_utilization(&self, node: &NodeRef<'_>) -> Option<CapacityUsage> {
        let used = self.latest_stat(node, &self.paths.memory_used).await.ok()?;
        let total = self.latest_stat(node, &self.paths.memory_total).await.ok()?;
        let percent_used = self
            .latest_stat(node, &self.paths.memory_percent_used)
            .await
            .ok()?;
        Some(CapacityUsage::measured(used, total, percent_used, timestamp_now()))
    }

    /// Storage summed over every filesystem of the node.
    pub async fn storage_utilization(&self, node: &NodeRef<'_>) -> Option<CapacityUsage> {
        let used = sum_skipping_nan(&self.latest_stats(node, &self.paths.storage_used).await.ok()?);
        let free = sum_skipping_nan(&self.latest_stats(node, &self.paths.storage_free).await.ok()?);
        let total = used + free;
        if total <= 0.0 {
            debug!(
                target: "summary::calculator",
                node_id = node.id,
                "No storage visible for node, skipping storage snapshot"
            );
            return None;
        }
        Some(CapacityUsage::measured(used, total, used * 100.0 / total, timestamp_now()))
    }

    /// All three categories, queried concurrently. The node name is resolved
    /// once; if that fails every category is unavailable this cycle.
    pub async fn compute(&self, node_id: &str) -> UtilizationSnapshots {
        let Some(name) = self.resolve_name(node_id).await else {
            return UtilizationSnapshots::default();
        };
        let node = NodeRef::new(node_id, &name);
        let (cpu, memory, storage) = tokio::join!(
            self.cpu_utilization(&node),
            self.memory_utilization(&node),
            self.storage_utilization(&node),
        );
        trace!(
            target: "summary::calculator",
            node_id,
            cpu = cpu.is_some(),
            memory = memory.is_some(),
            storage = storage.is_some(),
            "Utilization snapshots computed"
        );
        UtilizationSnapshots { cpu, memory, storage }
    }
}

// ============================================================================
// SECTION 10: SUMMARY RECONCILER
// ============================================================================

/// Merges fresh snapshots with the last persisted summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryReconciler;

impl SummaryReconciler {
    /// Each category is either wholly fresh or wholly carried forward from
    /// `previous`. The alert count is always the live one and the node id is
    /// always the one the cycle runs for.
    pub fn reconcile(
        node_id: &str,
        previous: &NodeSummary,
        fresh: UtilizationSnapshots,
        alert_count: u64,
    ) -> NodeSummary {
        NodeSummary {
            node_id: node_id.to_string(),
            cpu_usage: carry_forward(fresh.cpu, &previous.cpu_usage),
            memory_usage: carry_forward(fresh.memory, &previous.memory_usage),
            storage_usage: carry_forward(fresh.storage, &previous.storage_usage),
            alert_count,
        }
    }
}

/// The candidate if present, otherwise an unchanged copy of the previous value.
pub fn carry_forward<T: Clone>(candidate: Option<T>, previous: &T) -> T {
    candidate.unwrap_or_else(|| previous.clone())
}

// ============================================================================
// SECTION 11: NODE SUMMARY STORE
// ============================================================================

/// Loads and saves node summaries as single JSON records.
#[derive(Debug, Clone)]
pub struct NodeSummaryStore {
    kv: Arc<dyn KvStore>,
    key_prefix: String,
}

impl NodeSummaryStore {
    pub fn new(kv: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            key_prefix: key_prefix.into(),
        }
    }

    /// Store key of a node's summary.
    pub fn key_for(&self, node_id: &str) -> String {
        format!("{}/{}", self.key_prefix.trim_end_matches('/'), node_id)
    }

    /// The persisted summary, or the placeholder if none exists yet. Any
    /// other failure is returned so the caller can skip writing. A record
    /// naming a different node is corrupted.
    pub async fn load(&self, node_id: &str) -> StoreResult<NodeSummary> {
        let key = self.key_for(node_id);
        match self.kv.read(&key).await {
            Ok(record) => {
                let mut summary = NodeSummary::from_record(&key, &record)?;
                if summary.node_id.is_empty() {
                    summary.node_id = node_id.to_string();
                } else if summary.node_id != node_id {
                    return Err(StoreError::Corrupted {
                        message: format!("record belongs to node '{}'", summary.node_id),
                        key,
                    });
                }
                Ok(summary)
            }
            Err(KvError::KeyNotFound { .. }) => {
                debug!(target: "summary::store", node_id, "No previous summary, starting from placeholder");
                Ok(NodeSummary::placeholder(node_id))
            }
            Err(source) => Err(StoreError::Load { key, source }),
        }
    }

    /// Overwrite the node's record in one put. The key is derived from
    /// `node_id`, never from the record.
    pub async fn save(&self, node_id: &str, summary: &NodeSummary) -> StoreResult<()> {
        let key = self.key_for(node_id);
        let record = summary.to_record()?;
        self.kv
            .write(&key, record)
            .await
            .map_err(|source| StoreError::Save { key, source })
    }
}

// ============================================================================
// SECTION 12: PER-NODE AGGREGATION
// ============================================================================

/// Result of one node task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOutcome {
    /// Reconciled summary written
    Saved,
    /// Previous summary unreadable, nothing written
    LoadFailed,
    /// Write rejected; retried on the next tick
    SaveFailed,
}

/// Runs calculate -> load -> reconcile -> save for one node.
#[derive(Debug)]
pub struct NodeAggregator {
    calculator: NodeUtilizationCalculator,
    registry: Arc<dyn NodeRegistry>,
    store: NodeSummaryStore,
    sink: Arc<dyn EventSink>,
    stats: Arc<AggregationStats>,
}

impl NodeAggregator {
    pub fn new(
        calculator: NodeUtilizationCalculator,
        registry: Arc<dyn NodeRegistry>,
        store: NodeSummaryStore,
        sink: Arc<dyn EventSink>,
        stats: Arc<AggregationStats>,
    ) -> Self {
        Self {
            calculator,
            registry,
            store,
            sink,
            stats,
        }
    }

    pub fn store(&self) -> &NodeSummaryStore {
        &self.store
    }

    /// Active alert count; a registry failure counts as zero alerts.
    async fn live_alert_count(&self, node_id: &str) -> u64 {
        match self.registry.alert_ids(node_id).await {
            Ok(ids) => ids.len() as u64,
            Err(err) => {
                self.sink.emit(
                    EventPriority::Warning,
                    SummaryEvent::new("Failed to fetch active alerts, reporting zero")
                        .with_node(node_id)
                        .with_error(&err),
                );
                0
            }
        }
    }

    /// Aggregate one node. Never panics on backend failures; the outcome is
    /// also recorded in the shared statistics.
    pub async fn aggregate(&self, node_id: &str) -> AggregationOutcome {
        let started = Instant::now();
        let fresh = self.calculator.compute(node_id).await;
        let alert_count = self.live_alert_count(node_id).await;

        let outcome = match self.store.load(node_id).await {
            Ok(previous) => {
                self.stats.record_carried_forward(fresh.missing_count());
                let summary = SummaryReconciler::reconcile(node_id, &previous, fresh, alert_count);
                match self.store.save(node_id, &summary).await {
                    Ok(()) => AggregationOutcome::Saved,
                    Err(err) => {
                        self.sink.emit(
                            EventPriority::Error,
                            SummaryEvent::new("Failed to save node summary")
                                .with_node(node_id)
                                .with_error(&err),
                        );
                        AggregationOutcome::SaveFailed
                    }
                }
            }
            Err(err) => {
                self.sink.emit(
                    EventPriority::Warning,
                    SummaryEvent::new("Failed to fetch previously computed summary from store")
                        .with_node(node_id)
                        .with_error(&err),
                );
                AggregationOutcome::LoadFailed
            }
        };

        self.stats.record_outcome(outcome);
        debug!(
            target: "summary::aggregator",
            node_id,
            outcome = ?outcome,
            duration_ms = started.elapsed().as_millis() as u64,
            "Node aggregation finished"
        );
        outcome
    }
}

// ============================================================================
// SECTION 13: AGGREGATION SCHEDULER
// ============================================================================
// One driver loop. Every tick spawns one task per known node and moves on;
// ticks never wait for the previous tick's tasks. Stopping ends the loop
// and leaves dispatched tasks to finish on their own.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Scheduler State & Stagger
// ----------------------------------------------------------------------------

/// Scheduler lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Stopped,
}

/// Delay applied at the start of each node task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaggerPolicy {
    pub base: Duration,
    pub jitter: Duration,
}

impl StaggerPolicy {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    /// `base` plus a stable, node-specific share of `jitter`.
    pub fn delay_for(&self, node_id: &str) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(xxh3_64(node_id.as_bytes()) % jitter_ms)
    }
}

impl From<&AggregationConfig> for StaggerPolicy {
    fn from(config: &AggregationConfig) -> Self {
        Self::new(config.stagger, config.stagger_jitter)
    }
}

// ----------------------------------------------------------------------------
// 13.2 Scheduler
// ----------------------------------------------------------------------------

/// Fixed-interval driver dispatching one aggregation task per node per tick.
#[derive(Debug)]
pub struct AggregationScheduler {
    registry: Arc<dyn NodeRegistry>,
    aggregator: Arc<NodeAggregator>,
    stats: Arc<AggregationStats>,
    period: Duration,
    stagger: StaggerPolicy,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl AggregationScheduler {
    pub fn new(
        config: &AggregationConfig,
        registry: Arc<dyn NodeRegistry>,
        aggregator: Arc<NodeAggregator>,
        stats: Arc<AggregationStats>,
    ) -> Self {
        Self {
            registry,
            aggregator,
            stats,
            period: config.interval,
            stagger: StaggerPolicy::from(config),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.shutdown.is_cancelled() {
            SchedulerState::Stopped
        } else {
            SchedulerState::Running
        }
    }

    /// Request termination. No tick starts after this returns.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(target: "summary::scheduler", in_flight = self.tasks.len(), "Stop requested");
        }
        self.shutdown.cancel();
    }

    /// Node tasks spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Tick until stopped. The first tick fires immediately.
    pub async fn run(&self) {
        info!(
            target: "summary::scheduler",
            interval = %humantime::format_duration(self.period),
            stagger_ms = self.stagger.base.as_millis() as u64,
            "Aggregation scheduler started"
        );

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.dispatch_tick().await;
                }
            }
        }

        info!(
            target: "summary::scheduler",
            in_flight = self.tasks.len(),
            "Aggregation scheduler stopped"
        );
    }

    /// Enumerate nodes and spawn one task per node without waiting for them.
    /// Returns the number of tasks spawned.
    pub async fn dispatch_tick(&self) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }
        self.stats.record_tick();

        let node_ids = match self.registry.node_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                self.stats.record_registry_failure();
                warn!(target: "summary::scheduler", error = %err, "Failed to enumerate nodes, skipping tick");
                return 0;
            }
        };
        if self.shutdown.is_cancelled() {
            return 0;
        }

        let mut dispatched = 0;
        for node_id in node_ids {
            let delay = self.stagger.delay_for(&node_id);
            let aggregator = Arc::clone(&self.aggregator);
            self.stats.record_dispatch();
            self.tasks.spawn(async move {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                aggregator.aggregate(&node_id).await;
            });
            dispatched += 1;
        }

        debug!(target: "summary::scheduler", nodes = dispatched, "Tick dispatched");
        dispatched
    }

    /// One tick, then wait until every in-flight node task has finished.
    pub async fn aggregate_once(&self) -> usize {
        let dispatched = self.dispatch_tick().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
        dispatched
    }

    /// Wait up to `grace` for in-flight tasks. Returns false on timeout.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tasks.close();
        timeout(grace, self.tasks.wait()).await.is_ok()
    }
}

// ============================================================================
// SECTION 14: BACKEND ADAPTERS
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 etcd v2 Client
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

impl EtcdNode {
    /// Last path segment of the node key.
    fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
}

/// Minimal client for the etcd v2 keys API.
#[derive(Debug, Clone)]
pub struct EtcdClient {
    client: HttpClient,
    endpoint: String,
}

impl EtcdClient {
    pub fn new(config: &EtcdConfig) -> SummaryResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SummaryError::Internal(format!("Failed to build etcd client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v2/keys/{}", self.endpoint, key.trim_start_matches('/'))
    }

    fn connection_error(&self, err: reqwest::Error) -> KvError {
        KvError::Connection {
            endpoint: self.endpoint.clone(),
            message: err.to_string(),
        }
    }

    /// Map a non-success response to a typed error.
    fn response_error(key: &str, status: StatusCode, body: &str) -> KvError {
        match serde_json::from_str::<EtcdErrorBody>(body) {
            Ok(err) if err.error_code == ETCD_KEY_NOT_FOUND_CODE => KvError::key_not_found(key),
            Ok(err) => KvError::Backend {
                key: key.to_string(),
                status: status.as_u16(),
                message: err.message,
            },
            Err(_) if status == StatusCode::NOT_FOUND => KvError::key_not_found(key),
            Err(_) => KvError::Backend {
                key: key.to_string(),
                status: status.as_u16(),
                message: body.trim().to_string(),
            },
        }
    }

    async fn get_node(&self, key: &str) -> KvResult<EtcdNode> {
        let response = self
            .client
            .get(self.key_url(key))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.connection_error(e))?;

        if !status.is_success() {
            return Err(Self::response_error(key, status, &body));
        }

        let parsed: EtcdResponse = serde_json::from_str(&body).map_err(|e| KvError::Protocol {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        parsed.node.ok_or_else(|| KvError::Protocol {
            key: key.to_string(),
            message: "response carries no node".into(),
        })
    }

    /// Value of a leaf key.
    pub async fn get(&self, key: &str) -> KvResult<String> {
        let node = self.get_node(key).await?;
        if node.dir {
            return Err(KvError::Protocol {
                key: key.to_string(),
                message: "key is a directory".into(),
            });
        }
        Ok(node.value.unwrap_or_default())
    }

    /// Names of the direct children of a directory key.
    pub async fn list(&self, dir: &str) -> KvResult<Vec<String>> {
        let node = self.get_node(dir).await?;
        Ok(node.nodes.iter().map(|child| child.name().to_string()).collect())
    }

    /// Overwrite a leaf key.
    pub async fn put(&self, key: &str, value: String) -> KvResult<()> {
        let response = self
            .client
            .put(self.key_url(key))
            .form(&[("value", value)])
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::response_error(key, status, &body))
    }
}

#[async_trait]
impl KvStore for EtcdClient {
    async fn read(&self, key: &str) -> KvResult<String> {
        self.get(key).await
    }

    async fn write(&self, key: &str, value: String) -> KvResult<()> {
        self.put(key, value).await
    }
}

// ----------------------------------------------------------------------------
// 14.2 etcd Node Registry
// ----------------------------------------------------------------------------

/// Node identities and alerts as laid out in etcd.
#[derive(Debug, Clone)]
pub struct EtcdNodeRegistry {
    client: EtcdClient,
    nodes_prefix: String,
    node_name_key: String,
    alerts_prefix: String,
}

impl EtcdNodeRegistry {
    pub fn new(client: EtcdClient, config: &EtcdConfig) -> Self {
        Self {
            client,
            nodes_prefix: config.nodes_prefix.trim_matches('/').to_string(),
            node_name_key: config.node_name_key.trim_matches('/').to_string(),
            alerts_prefix: config.alerts_prefix.trim_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl NodeRegistry for EtcdNodeRegistry {
    async fn node_ids(&self) -> RegistryResult<BTreeSet<String>> {
        match self.client.list(&self.nodes_prefix).await {
            Ok(ids) => Ok(ids.into_iter().collect()),
            Err(KvError::KeyNotFound { .. }) => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn node_name(&self, node_id: &str) -> RegistryResult<String> {
        let key = format!("{}/{}/{}", self.nodes_prefix, node_id, self.node_name_key);
        match self.client.get(&key).await {
            Ok(name) => Ok(name),
            Err(KvError::KeyNotFound { .. }) => Err(RegistryError::NodeNotFound {
                node_id: node_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn alert_ids(&self, node_id: &str) -> RegistryResult<Vec<String>> {
        let dir = format!("{}/{}", self.alerts_prefix, node_id);
        match self.client.list(&dir).await {
            Ok(ids) => Ok(ids),
            Err(KvError::KeyNotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

// ----------------------------------------------------------------------------
// 14.3 HTTP Stats Source
// ----------------------------------------------------------------------------

/// Time-series backend reached through a templated HTTP URL.
#[derive(Debug, Clone)]
pub struct HttpStatsSource {
    client: HttpClient,
    url_template: String,
}

impl HttpStatsSource {
    pub fn new(config: &TimeSeriesConfig) -> SummaryResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SummaryError::Internal(format!("Failed to build stats client: {}", e)))?;
        Ok(Self {
            client,
            url_template: config.stats_url_template.clone(),
        })
    }

    pub fn url_for(&self, node_name: &str, metric_path: &str, mode: &str) -> String {
        self.url_template
            .replace("{node}", node_name)
            .replace("{metric}", metric_path)
            .replace("{mode}", mode)
    }
}

#[async_trait]
impl StatsSource for HttpStatsSource {
    async fn query(&self, node_name: &str, metric_path: &str, mode: &str) -> StatsResult<String> {
        let url = self.url_for(node_name, metric_path, mode);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StatsError::query_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StatsError::query_failed(format!("{} returned {}", url, status)));
        }

        response
            .text()
            .await
            .map_err(|e| StatsError::query_failed(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// 14.4 In-Memory Key-Value Store
// ----------------------------------------------------------------------------

/// Process-local store. Backs the `memory` store backend.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, String>,
    writes: AtomicU64,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert without counting as a write.
    pub fn seed(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Number of writes accepted through `KvStore::write`.
    pub fn write_count(&self) -> u64 {
        self.writes.load(AtomicOrdering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn read(&self, key: &str) -> KvResult<String> {
        self.get(key).ok_or_else(|| KvError::key_not_found(key))
    }

    async fn write(&self, key: &str, value: String) -> KvResult<()> {
        self.entries.insert(key.to_string(), value);
        self.writes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 14.5 Static Node Registry
// ----------------------------------------------------------------------------

/// Node registry backed by the configuration file. Nodes may be added or
/// removed at runtime; the next tick picks the change up.
#[derive(Debug, Default)]
pub struct StaticNodeRegistry {
    nodes: RwLock<BTreeMap<String, StaticNodeConfig>>,
}

impl StaticNodeRegistry {
    pub fn new(nodes: impl IntoIterator<Item = StaticNodeConfig>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into_iter().map(|n| (n.id.clone(), n)).collect()),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.nodes.iter().cloned())
    }

    /// Add a node or replace its name and alerts.
    pub fn upsert(&self, node: StaticNodeConfig) {
        self.nodes.write().insert(node.id.clone(), node);
    }

    pub fn remove(&self, node_id: &str) -> Option<StaticNodeConfig> {
        self.nodes.write().remove(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn with_node<T>(&self, node_id: &str, f: impl FnOnce(&StaticNodeConfig) -> T) -> RegistryResult<T> {
        self.nodes
            .read()
            .get(node_id)
            .map(f)
            .ok_or_else(|| RegistryError::NodeNotFound {
                node_id: node_id.to_string(),
            })
    }
}

#[async_trait]
impl NodeRegistry for StaticNodeRegistry {
    async fn node_ids(&self) -> RegistryResult<BTreeSet<String>> {
        Ok(self.nodes.read().keys().cloned().collect())
    }

    async fn node_name(&self, node_id: &str) -> RegistryResult<String> {
        self.with_node(node_id, |node| node.name.clone())
    }

    async fn alert_ids(&self, node_id: &str) -> RegistryResult<Vec<String>> {
        self.with_node(node_id, |node| node.alert_ids.clone())
    }
}

// ============================================================================
// SECTION 15: CLI INTERFACE & ENGINE
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 CLI Argument Structures
// ----------------------------------------------------------------------------

/// Node Summary Engine - periodic per-node utilization summaries
#[derive(Parser, Debug)]
#[command(
    name = "node-summary",
    author = "Monitoring Team",
    version,
    about = "Periodic per-node utilization summary engine",
    long_about = "Samples CPU, memory and storage utilization of every known node \
                  from a time-series backend on a fixed interval and publishes one \
                  summary record per node to a shared key-value store."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "node-summary.toml", env = "NODE_SUMMARY_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "NODE_SUMMARY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "NODE_SUMMARY_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the aggregation loop (default)
    Run,

    /// Run a single aggregation cycle and exit
    Once,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 15.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> SummaryResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!("\nParsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\nConfiguration Summary:");
            println!("  - Instance name: {}", config.engine.instance_name);
            println!("  - Publisher id: {}", config.engine.publisher_id);
            println!(
                "  - Aggregation interval: {}",
                humantime::format_duration(config.aggregation.interval)
            );
            println!(
                "  - Node stagger: {}",
                humantime::format_duration(config.aggregation.stagger)
            );
            println!("  - Registry backend: {:?}", config.registry.backend);
            println!("  - Store backend: {:?}", config.store.backend);
            if config.registry.backend == RegistryBackend::Static {
                println!("  - Static nodes: {}", config.registry.nodes.len());
            }

            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed");
            println!("Error: {}", e);
            Err(SummaryError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> SummaryResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  - Target: {}", std::env::consts::ARCH);
    println!("  - OS: {}", std::env::consts::OS);
    println!("  - Family: {}", std::env::consts::FAMILY);
}

// ----------------------------------------------------------------------------
// 15.3 Engine
// ----------------------------------------------------------------------------

/// Wires collaborators together and owns the scheduler.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    scheduler: Arc<AggregationScheduler>,
    aggregator: Arc<NodeAggregator>,
    stats: Arc<AggregationStats>,
    start_time: Instant,
}

impl Engine {
    /// Build the configured backends and the engine on top of them.
    pub fn from_config(config: EngineConfig) -> SummaryResult<Self> {
        let needs_etcd = config.registry.backend == RegistryBackend::Etcd
            || config.store.backend == StoreBackend::Etcd;
        let etcd = if needs_etcd {
            Some(EtcdClient::new(&config.etcd)?)
        } else {
            None
        };

        let registry: Arc<dyn NodeRegistry> = match (config.registry.backend, &etcd) {
            (RegistryBackend::Etcd, Some(client)) => {
                Arc::new(EtcdNodeRegistry::new(client.clone(), &config.etcd))
            }
            _ => Arc::new(StaticNodeRegistry::from_config(&config.registry)),
        };
        let kv: Arc<dyn KvStore> = match (config.store.backend, etcd) {
            (StoreBackend::Etcd, Some(client)) => Arc::new(client),
            _ => Arc::new(MemoryKvStore::new()),
        };
        let source: Arc<dyn StatsSource> = Arc::new(HttpStatsSource::new(&config.timeseries)?);
        let sink: Arc<dyn EventSink> =
            Arc::new(TracingEventSink::new(config.engine.publisher_id.clone()));

        Ok(Self::with_collaborators(config, registry, source, kv, sink))
    }

    /// Build the engine on injected collaborators.
    pub fn with_collaborators(
        config: EngineConfig,
        registry: Arc<dyn NodeRegistry>,
        source: Arc<dyn StatsSource>,
        kv: Arc<dyn KvStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let stats = Arc::new(AggregationStats::new());
        let calculator = NodeUtilizationCalculator::new(
            Arc::clone(&registry),
            source,
            Arc::clone(&sink),
            config.metrics.clone(),
        );
        let store = NodeSummaryStore::new(kv, config.aggregation.summary_key_prefix.clone());
        let aggregator = Arc::new(NodeAggregator::new(
            calculator,
            Arc::clone(&registry),
            store,
            sink,
            Arc::clone(&stats),
        ));
        let scheduler = Arc::new(AggregationScheduler::new(
            &config.aggregation,
            registry,
            Arc::clone(&aggregator),
            Arc::clone(&stats),
        ));

        Self {
            config,
            scheduler,
            aggregator,
            stats,
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &AggregationScheduler {
        &self.scheduler
    }

    pub fn aggregator(&self) -> &NodeAggregator {
        &self.aggregator
    }

    /// Request shutdown. In-flight node tasks are allowed to finish.
    pub fn shutdown(&self) {
        self.scheduler.stop();
    }

    /// Run until a stop request or a termination signal, then drain.
    pub async fn run(&self) -> SummaryResult<()> {
        info!(
            target: "summary::engine",
            version = ENGINE_VERSION,
            instance = %self.config.engine.instance_name,
            publisher = %self.config.engine.publisher_id,
            registry = ?self.config.registry.backend,
            store = ?self.config.store.backend,
            "Starting node summary engine"
        );

        let scheduler = Arc::clone(&self.scheduler);
        let signals = tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            scheduler.stop();
        });

        self.scheduler.run().await;
        signals.abort();

        let grace = self.config.engine.shutdown_grace;
        let shutdown_start = Instant::now();
        if !self.scheduler.drain(grace).await {
            error!(
                target: "summary::engine",
                in_flight = self.scheduler.in_flight(),
                grace = %humantime::format_duration(grace),
                "Grace period elapsed with node tasks still running"
            );
        }

        let stats = self.stats.snapshot();
        info!(
            target: "summary::engine",
            ticks = stats.ticks,
            saved = stats.summaries_saved,
            load_failures = stats.load_failures,
            save_failures = stats.save_failures,
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Engine shutdown complete"
        );

        Ok(())
    }

    /// One full aggregation cycle, waiting for every node task.
    pub async fn run_once(&self) -> SummaryResult<AggregationStatsSnapshot> {
        let dispatched = self.scheduler.aggregate_once().await;
        let stats = self.stats.snapshot();
        info!(
            target: "summary::engine",
            nodes = dispatched,
            saved = stats.summaries_saved,
            "Single aggregation cycle complete"
        );
        Ok(stats)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            uptime: self.start_time.elapsed(),
            state: self.scheduler.state(),
            in_flight: self.scheduler.in_flight(),
            aggregation: self.stats.snapshot(),
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub uptime: Duration,
    pub state: SchedulerState,
    pub in_flight: usize,
    pub aggregation: AggregationStatsSnapshot,
}

/// Resolves on SIGINT or SIGTERM. Never resolves if no handler can be installed.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(target: "summary::engine", error = %e, "Failed to install SIGTERM handler");
                wait_for_ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!(target: "summary::engine", "Received SIGTERM");
            }
            _ = wait_for_ctrl_c() => {}
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!(target: "summary::engine", "Received SIGINT"),
        Err(e) => {
            warn!(target: "summary::engine", error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// SECTION 16: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    let engine = Engine::from_config(config).context("Failed to initialize engine")?;

    match cli.command {
        Some(Commands::Once) => {
            let stats = engine.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        _ => engine.run().await?,
    }

    Ok(())
}

// ============================================================================
// SECTION 17: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::sync::atomic::AtomicBool;
    use test_case::test_case;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    /// Stats source answering from a script. Unscripted metrics answer `[]`.
    #[derive(Debug, Default)]
    struct ScriptedStats {
        responses: DashMap<(String, String), StatsResult<String>>,
        queries: AtomicU64,
    }

    impl ScriptedStats {
        fn respond(&self, node_name: &str, metric: &str, body: impl Into<String>) {
            self.responses
                .insert((node_name.to_string(), metric.to_string()), Ok(body.into()));
        }

        fn fail(&self, node_name: &str, metric: &str, err: StatsError) {
            self.responses
                .insert((node_name.to_string(), metric.to_string()), Err(err));
        }

        fn healthy(&self, node_name: &str) {
            self.respond(node_name, METRIC_CPU_USER, series(&["10.5"]));
            self.respond(node_name, METRIC_CPU_SYSTEM, series(&["2.0"]));
            self.respond(node_name, METRIC_MEMORY_USED, series(&["2048.0"]));
            self.respond(node_name, METRIC_MEMORY_TOTAL, series(&["8192.0"]));
            self.respond(node_name, METRIC_MEMORY_PERCENT_USED, series(&["25.0"]));
            self.respond(node_name, METRIC_STORAGE_USED, series(&["30.0", "10.0"]));
            self.respond(node_name, METRIC_STORAGE_FREE, series(&["50.0", "10.0"]));
        }
    }

    #[async_trait]
    impl StatsSource for ScriptedStats {
        async fn query(&self, node_name: &str, metric_path: &str, mode: &str) -> StatsResult<String> {
            assert_eq!(mode, LATEST_MODE);
            self.queries.fetch_add(1, AtomicOrdering::Relaxed);
            self.responses
                .get(&(node_name.to_string(), metric_path.to_string()))
                .map(|entry| entry.value().clone())
                .unwrap_or_else(|| Ok(EMPTY_STATS_SENTINEL.to_string()))
        }
    }

    #[derive(Debug, Default)]
    struct RecordingSink {
        events: Mutex<Vec<(EventPriority, SummaryEvent)>>,
    }

    impl RecordingSink {
        fn with_message(&self, message: &str) -> Vec<(EventPriority, SummaryEvent)> {
            self.events
                .lock()
                .iter()
                .filter(|(_, event)| event.message == message)
                .cloned()
                .collect()
        }

        fn for_resource(&self, resource: &str) -> Vec<EventPriority> {
            self.events
                .lock()
                .iter()
                .filter(|(_, event)| event.resource.as_deref() == Some(resource))
                .map(|(priority, _)| *priority)
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, priority: EventPriority, event: SummaryEvent) {
            self.events.lock().push((priority, event));
        }
    }

    /// Memory store whose reads and writes can be switched to fail.
    #[derive(Debug, Default)]
    struct FlakyKv {
        inner: MemoryKvStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FlakyKv {
        fn unreachable() -> KvError {
            KvError::Connection {
                endpoint: "http://kv.test".into(),
                message: "connection refused".into(),
            }
        }
    }

    #[async_trait]
    impl KvStore for FlakyKv {
        async fn read(&self, key: &str) -> KvResult<String> {
            if self.fail_reads.load(AtomicOrdering::SeqCst) {
                return Err(Self::unreachable());
            }
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, value: String) -> KvResult<()> {
            if self.fail_writes.load(AtomicOrdering::SeqCst) {
                return Err(Self::unreachable());
            }
            self.inner.write(key, value).await
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn series(values: &[&str]) -> String {
        let entries: Vec<String> = values
            .iter()
            .map(|v| format!("{{\"target\":\"stat\",\"legend\":\"Current:{}Max:100.0Min:0.0\"}}", v))
            .collect();
        format!("[{}]", entries.join(","))
    }

    fn node(id: &str, name: &str, alerts: &[&str]) -> StaticNodeConfig {
        StaticNodeConfig {
            id: id.into(),
            name: name.into(),
            alert_ids: alerts.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn aggregation(interval: Duration, stagger: Duration) -> AggregationConfig {
        AggregationConfig {
            interval,
            stagger,
            ..AggregationConfig::default()
        }
    }

    fn previous_summary(node_id: &str, alert_count: u64) -> NodeSummary {
        NodeSummary {
            node_id: node_id.into(),
            cpu_usage: CpuUsage {
                percent_used: "50.0".into(),
                updated_at: "2020-01-01T00:00:00.000000Z".into(),
            },
            memory_usage: CapacityUsage {
                used: "1024.0".into(),
                total: "8192.0".into(),
                percent_used: "12.5".into(),
                updated_at: "2020-01-01T00:00:00.000000Z".into(),
            },
            storage_usage: CapacityUsage {
                used: "10.0".into(),
                total: "20.0".into(),
                percent_used: "50.0".into(),
                updated_at: "2020-01-01T00:00:00.000000Z".into(),
            },
            alert_count,
        }
    }

    struct Harness {
        registry: Arc<StaticNodeRegistry>,
        source: Arc<ScriptedStats>,
        kv: Arc<FlakyKv>,
        sink: Arc<RecordingSink>,
        stats: Arc<AggregationStats>,
        aggregator: Arc<NodeAggregator>,
    }

    impl Harness {
        fn new(nodes: Vec<StaticNodeConfig>) -> Self {
            let registry = Arc::new(StaticNodeRegistry::new(nodes));
            let source = Arc::new(ScriptedStats::default());
            let kv = Arc::new(FlakyKv::default());
            let sink = Arc::new(RecordingSink::default());
            let stats = Arc::new(AggregationStats::new());

            let calculator = NodeUtilizationCalculator::new(
                registry.clone(),
                source.clone(),
                sink.clone(),
                MetricPathsConfig::default(),
            );
            let store = NodeSummaryStore::new(kv.clone(), DEFAULT_SUMMARY_KEY_PREFIX);
            let aggregator = Arc::new(NodeAggregator::new(
                calculator,
                registry.clone(),
                store,
                sink.clone(),
                stats.clone(),
            ));

            Self {
                registry,
                source,
                kv,
                sink,
                stats,
                aggregator,
            }
        }

        fn scheduler(&self, config: &AggregationConfig) -> AggregationScheduler {
            AggregationScheduler::new(
                config,
                self.registry.clone(),
                self.aggregator.clone(),
                self.stats.clone(),
            )
        }

        fn key(&self, node_id: &str) -> String {
            self.aggregator.store().key_for(node_id)
        }

        fn seed(&self, summary: &NodeSummary) -> String {
            let record = summary.to_record().unwrap();
            self.kv.inner.seed(self.key(&summary.node_id), record.clone());
            record
        }

        fn raw(&self, node_id: &str) -> Option<String> {
            self.kv.inner.get(&self.key(node_id))
        }

        fn stored(&self, node_id: &str) -> Option<NodeSummary> {
            let key = self.key(node_id);
            self.raw(node_id)
                .map(|record| NodeSummary::from_record(&key, &record).unwrap())
        }
    }

    // ------------------------------------------------------------------------
    // Data model
    // ------------------------------------------------------------------------

    #[test_case(3.5, "3.5" ; "fractional")]
    #[test_case(75.0, "75.0" ; "integral keeps trailing zero")]
    #[test_case(0.1 + 0.2, "0.30000000000000004" ; "shortest round trip")]
    #[test_case(-1.25, "-1.25" ; "negative")]
    #[test_case(1e16, "10000000000000000.0" ; "large byte count stays positional")]
    #[test_case(2.5e20, "250000000000000000000.0" ; "aggregated storage total")]
    #[test_case(1.5e-7, "0.00000015" ; "small fraction stays positional")]
    fn test_format_decimal(value: f64, expected: &str) {
        assert_eq!(format_decimal(value), expected);
    }

    #[test]
    fn test_placeholder_is_blank() {
        let summary = NodeSummary::placeholder("n1");
        assert_eq!(summary.node_id, "n1");
        assert!(summary.cpu_usage.is_blank());
        assert!(summary.memory_usage.is_blank());
        assert!(summary.storage_usage.is_blank());
        assert_eq!(summary.alert_count, 0);
    }

    #[test]
    fn test_record_field_names() {
        let record = previous_summary("n1", 3).to_record().unwrap();
        let value: serde_json::Value = serde_json::from_str(&record).unwrap();

        assert_eq!(value["node_id"], "n1");
        assert_eq!(value["cpu_usage"]["percent_used"], "50.0");
        assert_eq!(value["memory_usage"]["total"], "8192.0");
        assert_eq!(value["storage_usage"]["updated_at"], "2020-01-01T00:00:00.000000Z");
        assert_eq!(value["alert_count"], 3);
    }

    #[test]
    fn test_corrupted_record() {
        let err = NodeSummary::from_record("k", "{not json").unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { ref key, .. } if key == "k"));
    }

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp_now();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    // ------------------------------------------------------------------------
    // Parser
    // ------------------------------------------------------------------------

    #[test_case("[]" ; "sentinel")]
    #[test_case("" ; "empty body")]
    #[test_case("  []\n" ; "padded sentinel")]
    fn test_unavailable_stats(body: &str) {
        assert_eq!(extract_current(body), Err(StatsError::StatsUnavailable));
        assert_eq!(extract_all_current(body), Err(StatsError::StatsUnavailable));
    }

    #[test_case("Current:3.5Max:9.0", 3.5 ; "bare fragment")]
    #[test_case("[{\"legend\":\"Current:75Max:80\"}]", 75.0 ; "json wrapped")]
    #[test_case("Current: -1.25 Max", -1.25 ; "padded negative")]
    #[test_case("Current:1.0Max Current:2.0Max", 1.0 ; "first series wins")]
    fn test_extract_current(body: &str, expected: f64) {
        assert_eq!(extract_current(body), Ok(expected));
    }

    #[test]
    fn test_malformed_stats() {
        assert_eq!(
            extract_current("{\"datapoints\": []}"),
            Err(StatsError::MalformedStatsResponse)
        );
    }

    #[test_case("Current:abcMax", "abc" ; "text")]
    #[test_case("Current:NaNMax", "NaN" ; "nan")]
    fn test_invalid_numeric(body: &str, value: &str) {
        assert_eq!(
            extract_current(body),
            Err(StatsError::InvalidNumericValue { value: value.into() })
        );
    }

    #[test]
    fn test_wildcard_values_and_sum() {
        let values = extract_all_current("[Current:1.0Max, Current:NaNMax, Current: 2.5 Max]").unwrap();
        assert_eq!(values, vec!["1.0", "NaN", "2.5"]);
        assert_eq!(sum_skipping_nan(&values), 3.5);
        assert_eq!(sum_skipping_nan(&["abc".to_string(), "nan".to_string()]), 0.0);
        assert_eq!(
            sum_skipping_nan(&["1.0".to_string(), "inf".to_string()]),
            f64::INFINITY
        );
    }

    #[test]
    fn test_parser_reports_with_priority() {
        let sink = Arc::new(RecordingSink::default());
        let parser = MetricStatParser::new(sink.clone());

        assert!(parser.current_value("n1", "cpu.a", "[]").is_err());
        assert!(parser.current_value("n1", "cpu.b", "garbage").is_err());
        assert!(parser.current_values("n1", "df-*.c", "no samples").is_err());
        assert_eq!(parser.current_values("n1", "df-*.e", "Current:xMax"), Ok(vec!["x".to_string()]));
        assert_eq!(parser.current_value("n1", "cpu.d", "Current:4Max"), Ok(4.0));

        assert_eq!(sink.for_resource("cpu.a"), vec![EventPriority::Debug]);
        assert_eq!(sink.for_resource("cpu.b"), vec![EventPriority::Warning]);
        assert_eq!(sink.for_resource("df-*.c"), vec![EventPriority::Warning]);
        assert!(sink.for_resource("cpu.d").is_empty());
        assert!(sink.for_resource("df-*.e").is_empty());
    }

    // ------------------------------------------------------------------------
    // Calculator & reconciler
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_storage_without_capacity_is_skipped() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        h.source.respond("node1", METRIC_STORAGE_USED, series(&["0.0"]));
        h.source.respond("node1", METRIC_STORAGE_FREE, series(&["0.0", "NaN"]));

        let node1 = NodeRef::new("n1", "node1");
        assert_eq!(h.aggregator.calculator.storage_utilization(&node1).await, None);
    }

    #[tokio::test]
    async fn test_category_is_all_or_nothing() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        h.source.healthy("node1");
        h.source.respond("node1", METRIC_MEMORY_TOTAL, "no samples here");

        let snapshots = h.aggregator.calculator.compute("n1").await;
        assert!(snapshots.cpu.is_some());
        assert!(snapshots.memory.is_none());
        assert!(snapshots.storage.is_some());
        assert_eq!(snapshots.missing_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_node_yields_no_snapshots() {
        let h = Harness::new(vec![]);
        let snapshots = h.aggregator.calculator.compute("ghost").await;

        assert_eq!(snapshots, UtilizationSnapshots::default());
        assert_eq!(h.source.queries.load(AtomicOrdering::Relaxed), 0);

        let events = h.sink.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, EventPriority::Warning);
        assert_eq!(events[0].1.message, "Failed to resolve node name for node summary");
    }

    #[tokio::test]
    async fn test_query_failure_is_reported() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        h.source.healthy("node1");
        h.source
            .fail("node1", METRIC_CPU_SYSTEM, StatsError::query_failed("timeout"));

        let node1 = NodeRef::new("n1", "node1");
        assert_eq!(h.aggregator.calculator.cpu_utilization(&node1).await, None);
        assert_eq!(h.sink.for_resource(METRIC_CPU_SYSTEM), vec![EventPriority::Warning]);
    }

    #[test]
    fn test_reconcile_carries_forward_missing_categories() {
        let previous = previous_summary("n1", 7);
        let fresh_memory = CapacityUsage::measured(1.0, 2.0, 50.0, "2024-05-01T00:00:00.000000Z");
        let fresh = UtilizationSnapshots {
            memory: Some(fresh_memory.clone()),
            ..UtilizationSnapshots::default()
        };

        let merged = SummaryReconciler::reconcile("n1", &previous, fresh, 2);

        assert_eq!(merged.node_id, "n1");
        assert_eq!(merged.cpu_usage, previous.cpu_usage);
        assert_eq!(merged.memory_usage, fresh_memory);
        assert_eq!(merged.storage_usage, previous.storage_usage);
        assert_eq!(merged.alert_count, 2);
    }

    #[test]
    fn test_reconcile_keeps_cycle_node_id() {
        let merged = SummaryReconciler::reconcile(
            "n1",
            &previous_summary("n2", 0),
            UtilizationSnapshots::default(),
            0,
        );
        assert_eq!(merged.node_id, "n1");
    }

    #[test]
    fn test_carry_forward() {
        assert_eq!(carry_forward(Some(1), &2), 1);
        assert_eq!(carry_forward(None, &2), 2);
    }

    // ------------------------------------------------------------------------
    // Per-node aggregation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_fresh_node_gets_full_summary() {
        let h = Harness::new(vec![node("n1", "node1", &["a1", "a2"])]);
        h.source.healthy("node1");

        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::Saved);

        let summary = h.stored("n1").unwrap();
        assert_eq!(summary.node_id, "n1");
        assert_eq!(summary.cpu_usage.percent_used, "12.5");
        assert_eq!(summary.memory_usage.used, "2048.0");
        assert_eq!(summary.memory_usage.total, "8192.0");
        assert_eq!(summary.memory_usage.percent_used, "25.0");
        assert_eq!(summary.storage_usage.used, "40.0");
        assert_eq!(summary.storage_usage.total, "100.0");
        assert_eq!(summary.storage_usage.percent_used, "40.0");
        assert_eq!(summary.alert_count, 2);
        assert!(!summary.cpu_usage.is_blank());
        assert!(chrono::DateTime::parse_from_rfc3339(&summary.storage_usage.updated_at).is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_category_is_carried_forward() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        let previous = previous_summary("n1", 4);
        h.seed(&previous);
        h.source.healthy("node1");
        h.source.respond("node1", METRIC_CPU_USER, EMPTY_STATS_SENTINEL);

        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::Saved);

        let summary = h.stored("n1").unwrap();
        assert_eq!(summary.cpu_usage, previous.cpu_usage);
        assert_eq!(summary.memory_usage.used, "2048.0");
        assert_ne!(summary.memory_usage.updated_at, previous.memory_usage.updated_at);
        assert_eq!(summary.alert_count, 0);
        assert_eq!(h.sink.for_resource(METRIC_CPU_USER), vec![EventPriority::Debug]);
        assert_eq!(h.stats.snapshot().categories_carried_forward, 1);
    }

    #[tokio::test]
    async fn test_unreadable_previous_summary_skips_write() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        let record = h.seed(&previous_summary("n1", 0));
        h.source.healthy("node1");
        h.kv.fail_reads.store(true, AtomicOrdering::SeqCst);

        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::LoadFailed);

        assert_eq!(h.kv.inner.write_count(), 0);
        assert_eq!(h.raw("n1"), Some(record));
        let events = h.sink.with_message("Failed to fetch previously computed summary from store");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, EventPriority::Warning);
        assert_eq!(events[0].1.node_id.as_deref(), Some("n1"));
        assert_eq!(h.stats.snapshot().load_failures, 1);
    }

    #[tokio::test]
    async fn test_record_naming_another_node_is_rejected() {
        let h = Harness::new(vec![node("n1", "node1", &[]), node("n2", "node2", &[])]);
        let foreign = previous_summary("n2", 0).to_record().unwrap();
        h.kv.inner.seed(h.key("n1"), foreign.clone());
        h.kv.inner.seed(h.key("n2"), foreign.clone());
        h.source.healthy("node1");

        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::LoadFailed);

        assert_eq!(h.kv.inner.write_count(), 0);
        assert_eq!(h.raw("n1"), Some(foreign.clone()));
        assert_eq!(h.raw("n2"), Some(foreign));
    }

    #[tokio::test]
    async fn test_store_load_checks_node_id() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = NodeSummaryStore::new(kv.clone(), DEFAULT_SUMMARY_KEY_PREFIX);
        kv.seed(store.key_for("n1"), previous_summary("n2", 0).to_record().unwrap());

        let err = store.load("n1").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { ref key, .. } if key == &store.key_for("n1")));

        let unnamed = NodeSummary::placeholder("").to_record().unwrap();
        kv.seed(store.key_for("n3"), unnamed);
        assert_eq!(store.load("n3").await.unwrap().node_id, "n3");
    }

    #[tokio::test]
    async fn test_store_save_writes_under_given_node() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = NodeSummaryStore::new(kv.clone(), DEFAULT_SUMMARY_KEY_PREFIX);

        store.save("n1", &previous_summary("n1", 0)).await.unwrap();
        assert!(kv.get(&store.key_for("n1")).is_some());
        assert!(kv.get(&store.key_for("n2")).is_none());
    }

    #[tokio::test]
    async fn test_corrupted_previous_summary_skips_write() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        h.kv.inner.seed(h.key("n1"), "{\"node_id\": 12");
        h.source.healthy("node1");

        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::LoadFailed);
        assert_eq!(h.kv.inner.write_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_save_is_retried_next_cycle() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        h.source.healthy("node1");
        h.kv.fail_writes.store(true, AtomicOrdering::SeqCst);

        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::SaveFailed);
        assert!(h.raw("n1").is_none());
        let events = h.sink.with_message("Failed to save node summary");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, EventPriority::Error);

        h.kv.fail_writes.store(false, AtomicOrdering::SeqCst);
        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::Saved);
        assert_eq!(h.stored("n1").unwrap().cpu_usage.percent_used, "12.5");

        let stats = h.stats.snapshot();
        assert_eq!(stats.save_failures, 1);
        assert_eq!(stats.summaries_saved, 1);
    }

    #[tokio::test]
    async fn test_all_categories_failing_rewrites_identical_record() {
        let h = Harness::new(vec![node("n1", "node1", &["a1"])]);
        let record = h.seed(&previous_summary("n1", 1));

        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::Saved);

        assert_eq!(h.raw("n1"), Some(record));
        assert_eq!(h.kv.inner.write_count(), 1);
        assert_eq!(h.stats.snapshot().categories_carried_forward, 3);
    }

    #[tokio::test]
    async fn test_nodes_are_isolated() {
        let h = Harness::new(vec![node("n1", "node1", &[]), node("n2", "node2", &["a"])]);
        h.source.healthy("node1");
        h.source.respond("node2", METRIC_CPU_USER, "garbage");

        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::Saved);
        assert_eq!(h.aggregator.aggregate("n2").await, AggregationOutcome::Saved);

        assert_eq!(h.stored("n1").unwrap().cpu_usage.percent_used, "12.5");
        let second = h.stored("n2").unwrap();
        assert!(second.cpu_usage.is_blank());
        assert!(second.memory_usage.is_blank());
        assert_eq!(second.alert_count, 1);
    }

    #[tokio::test]
    async fn test_scenario_cpu_only_on_fresh_node() {
        let h = Harness::new(vec![node("n1", "node1", &["a1", "a2", "a3"])]);
        h.source.respond("node1", METRIC_CPU_USER, series(&["2.0"]));
        h.source.respond("node1", METRIC_CPU_SYSTEM, series(&["1.5"]));

        assert_eq!(h.aggregator.aggregate("n1").await, AggregationOutcome::Saved);

        let summary = h.stored("n1").unwrap();
        assert_eq!(summary.cpu_usage.percent_used, "3.5");
        assert!(!summary.cpu_usage.updated_at.is_empty());
        assert_eq!(summary.memory_usage, CapacityUsage::default());
        assert_eq!(summary.storage_usage, CapacityUsage::default());
        assert_eq!(summary.alert_count, 3);
    }

    #[tokio::test]
    async fn test_scenario_memory_retained_with_original_timestamp() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        let mut previous = previous_summary("n1", 0);
        previous.memory_usage.percent_used = "40".into();
        h.seed(&previous);
        h.source.healthy("node1");
        h.source
            .fail("node1", METRIC_MEMORY_PERCENT_USED, StatsError::query_failed("reset"));

        h.aggregator.aggregate("n1").await;

        let summary = h.stored("n1").unwrap();
        assert_eq!(summary.memory_usage.percent_used, "40");
        assert_eq!(summary.memory_usage.updated_at, "2020-01-01T00:00:00.000000Z");
        assert_eq!(summary.memory_usage, previous.memory_usage);
    }

    #[tokio::test]
    async fn test_scenario_storage_skips_nan_filesystems() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        h.source.respond("node1", METRIC_STORAGE_USED, series(&["10", "nan", "5"]));
        h.source.respond("node1", METRIC_STORAGE_FREE, series(&["5"]));

        let node1 = NodeRef::new("n1", "node1");
        let storage = h.aggregator.calculator.storage_utilization(&node1).await.unwrap();
        assert_eq!(storage.used, "15.0");
        assert_eq!(storage.total, "20.0");
        assert_eq!(storage.percent_used, "75.0");
    }

    // ------------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------------

    #[test]
    fn test_stagger_policy() {
        let fixed = StaggerPolicy::new(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(fixed.delay_for("n1"), Duration::from_secs(1));

        let jittered = StaggerPolicy::new(Duration::from_secs(1), Duration::from_millis(500));
        let delay = jittered.delay_for("n1");
        assert!(delay >= Duration::from_secs(1));
        assert!(delay < Duration::from_millis(1500));
        assert_eq!(delay, jittered.delay_for("n1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_on_fixed_interval() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        h.source.healthy("node1");
        let scheduler = Arc::new(h.scheduler(&aggregation(Duration::from_secs(60), Duration::ZERO)));

        let runner = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run().await }
        });

        sleep(Duration::from_secs(130)).await;
        scheduler.stop();
        runner.await.unwrap();

        let stats = h.stats.snapshot();
        assert_eq!(stats.ticks, 3);
        assert_eq!(stats.tasks_dispatched, 3);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_run_prevents_ticks() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        let scheduler = h.scheduler(&aggregation(Duration::from_secs(60), Duration::ZERO));

        scheduler.stop();
        scheduler.run().await;

        assert_eq!(h.stats.snapshot().ticks, 0);
        assert_eq!(scheduler.dispatch_tick().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_do_not_wait_for_slow_tasks() {
        let h = Harness::new(vec![node("n1", "node1", &[])]);
        h.source.healthy("node1");
        let scheduler = Arc::new(h.scheduler(&aggregation(
            Duration::from_secs(60),
            Duration::from_secs(100),
        )));

        let runner = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run().await }
        });

        sleep(Duration::from_secs(61)).await;
        assert_eq!(scheduler.in_flight(), 2);
        assert_eq!(h.stats.snapshot().summaries_saved, 0);

        scheduler.stop();
        runner.await.unwrap();
        assert!(scheduler.drain(Duration::from_secs(200)).await);

        assert_eq!(h.stats.snapshot().summaries_saved, 2);
        assert_eq!(h.kv.inner.write_count(), 2);
    }

    #[tokio::test]
    async fn test_registry_changes_apply_next_tick() {
        let h = Harness::new(vec![node("n1", "node1", &[]), node("n2", "node2", &[])]);
        let scheduler = h.scheduler(&aggregation(Duration::from_secs(60), Duration::ZERO));

        assert_eq!(scheduler.aggregate_once().await, 2);
        assert_eq!(h.kv.inner.len(), 2);

        h.registry.remove("n2");
        h.registry.upsert(node("n3", "node3", &[]));
        assert_eq!(scheduler.aggregate_once().await, 2);
        assert!(h.raw("n3").is_some());
        assert_eq!(h.stats.snapshot().summaries_saved, 4);
    }

    // ------------------------------------------------------------------------
    // Adapters
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_memory_store_missing_key() {
        let kv = MemoryKvStore::new();
        assert!(kv.read("missing").await.unwrap_err().is_key_not_found());

        kv.write("k", "v".into()).await.unwrap();
        assert_eq!(kv.read("k").await.unwrap(), "v");
        assert_eq!(kv.write_count(), 1);
    }

    #[tokio::test]
    async fn test_static_registry_lookup() {
        let registry = StaticNodeRegistry::new(vec![node("n1", "node1", &["a"])]);

        assert_eq!(registry.node_name("n1").await.unwrap(), "node1");
        assert_eq!(registry.alert_ids("n1").await.unwrap(), vec!["a".to_string()]);
        assert_eq!(
            registry.node_name("n2").await,
            Err(RegistryError::NodeNotFound { node_id: "n2".into() })
        );
    }

    #[test]
    fn test_etcd_error_mapping() {
        let missing = r#"{"errorCode":100,"message":"Key not found","cause":"/nodes/x","index":7}"#;
        assert_eq!(
            EtcdClient::response_error("nodes/x", StatusCode::NOT_FOUND, missing),
            KvError::key_not_found("nodes/x")
        );

        let err = EtcdClient::response_error("k", StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(
            err,
            KvError::Backend {
                key: "k".into(),
                status: 500,
                message: "boom".into(),
            }
        );
    }

    #[test]
    fn test_etcd_directory_listing() {
        let body = r#"{"action":"get","node":{"key":"/nodes","dir":true,"nodes":[
            {"key":"/nodes/a","dir":true},{"key":"/nodes/b","dir":true}]}}"#;
        let parsed: EtcdResponse = serde_json::from_str(body).unwrap();
        let names: Vec<&str> = parsed.node.as_ref().unwrap().nodes.iter().map(EtcdNode::name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_stats_url_template() {
        let source = HttpStatsSource::new(&TimeSeriesConfig::default()).unwrap();
        assert_eq!(
            source.url_for("node1", METRIC_CPU_USER, LATEST_MODE),
            "http://127.0.0.1:10080/api/stats/node1/cpu.percent-user?mode=latest"
        );
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.aggregation.interval, Duration::from_secs(60));
        assert_eq!(config.aggregation.stagger, Duration::from_secs(1));
        assert_eq!(config.aggregation.summary_key_prefix, DEFAULT_SUMMARY_KEY_PREFIX);
        assert_eq!(config.engine.publisher_id, "performance_monitoring");
        assert_eq!(config.metrics.storage_used, METRIC_STORAGE_USED);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [aggregation]
            interval = "30s"
            stagger = "250ms"

            [registry]
            backend = "static"

            [[registry.nodes]]
            id = "n1"
            name = "node1.example.com"
            alert_ids = ["a1"]

            [store]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.aggregation.interval, Duration::from_secs(30));
        assert_eq!(config.aggregation.stagger, Duration::from_millis(250));
        assert_eq!(config.registry.backend, RegistryBackend::Static);
        assert_eq!(config.registry.nodes, vec![node("n1", "node1.example.com", &["a1"])]);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test_case("[aggregation]\ninterval = \"0s\"", "aggregation.interval" ; "zero interval")]
    #[test_case("[timeseries]\nstats_url_template = \"http://x/{node}\"", "timeseries.stats_url_template" ; "missing metric placeholder")]
    #[test_case("[metrics]\ncpu_user = \"\"", "metrics.cpu_user" ; "empty metric path")]
    #[test_case(
        "[[registry.nodes]]\nid = \"a\"\nname = \"x\"\n[[registry.nodes]]\nid = \"a\"\nname = \"y\"",
        "registry.nodes" ; "duplicate node"
    )]
    fn test_config_rejects(toml_str: &str, expected_field: &str) {
        match EngineConfig::from_toml_str(toml_str) {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\ninstance_name = \"edge-1\"\n[aggregation]\ninterval = \"2m\"").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.instance_name, "edge-1");
        assert_eq!(config.aggregation.interval, Duration::from_secs(120));

        let missing = EngineConfig::load("/nonexistent/node-summary.toml");
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = EngineConfig::generate_default_config();
        assert_eq!(EngineConfig::from_toml_str(&generated).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_error_classification() {
        let err = SummaryError::from(StoreError::Load {
            key: "k".into(),
            source: FlakyKv::unreachable(),
        });
        assert!(err.is_recoverable());
        assert_eq!(err.category(), "store");

        let err = SummaryError::from(ConfigError::invalid_value("x", "y"));
        assert!(!err.is_recoverable());
        assert!(StatsError::StatsUnavailable.is_expected());
    }

    // ------------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------------

    fn static_engine_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.aggregation.stagger = Duration::ZERO;
        config.registry.backend = RegistryBackend::Static;
        config.registry.nodes = vec![node("n1", "node1", &[])];
        config.store.backend = StoreBackend::Memory;
        config
    }

    #[tokio::test]
    async fn test_engine_run_once() {
        let config = static_engine_config();
        let source = Arc::new(ScriptedStats::default());
        source.healthy("node1");
        let kv = Arc::new(MemoryKvStore::new());

        let engine = Engine::with_collaborators(
            config.clone(),
            Arc::new(StaticNodeRegistry::from_config(&config.registry)),
            source,
            kv.clone(),
            Arc::new(RecordingSink::default()),
        );

        let stats = engine.run_once().await.unwrap();
        assert_eq!(stats.summaries_saved, 1);
        assert_eq!(stats.in_flight(), 0);
        assert!(kv.get("monitoring/summary/nodes/n1").is_some());
    }

    #[tokio::test]
    async fn test_engine_from_config_with_local_backends() {
        let engine = Engine::from_config(static_engine_config()).unwrap();
        assert_eq!(engine.stats().state, SchedulerState::Running);
        assert_eq!(engine.config().registry.nodes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_shutdown_drains() {
        let config = static_engine_config();
        let source = Arc::new(ScriptedStats::default());
        source.healthy("node1");

        let engine = Arc::new(Engine::with_collaborators(
            config.clone(),
            Arc::new(StaticNodeRegistry::from_config(&config.registry)),
            source,
            Arc::new(MemoryKvStore::new()),
            Arc::new(RecordingSink::default()),
        ));

        let runner = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });

        sleep(Duration::from_secs(1)).await;
        engine.shutdown();
        runner.await.unwrap().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.state, SchedulerState::Stopped);
        assert_eq!(stats.aggregation.ticks, 1);
        assert_eq!(stats.aggregation.summaries_saved, 1);
    }
}
