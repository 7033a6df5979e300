use anyhow::{anyhow, bail, Context, Result};
use binlog_pitr_core::LogPosition;
use binlog_pitr_storage::{
    BackendConfig, CloudBackend, CollectorConfig, LocalBackend, RecoveryTarget, RetryPolicy,
    DEFAULT_BACKEND_RETRIES,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::mysql_applier::MysqlSettings;

const DEFAULT_BINLOG_BASENAME: &str = "binlog";
const DEFAULT_MAX_SEGMENT_MB: u64 = 64;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

/// Configuration as written in the YAML file, before validation
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LoadConfiguration {
    /// Collection stream id, the key prefix of every segment
    pub(crate) stream_id: String,
    /// Object storage holding the segments
    pub(crate) storage: StorageNode,
    /// Required by `collect`
    pub(crate) collector: Option<CollectorNode>,
    /// Required by `recover`
    pub(crate) recoverer: Option<RecovererNode>,
    /// Prometheus exporter address, e.g. "0.0.0.0:9040"
    pub(crate) prom_exporter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct StorageNode {
    #[serde(flatten)]
    pub(crate) backend: StorageConfig,
    /// Provider-level retries of transient errors (defaults to 3)
    pub(crate) max_retries: Option<usize>,
}

/// Storage configuration enum (tagged by `backend`)
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "backend")]
pub(crate) enum StorageConfig {
    #[serde(rename = "memory")]
    Memory { root: String },
    #[serde(rename = "fs")]
    Fs { root: String },
    #[serde(rename = "s3")]
    S3 {
        /// `bucket` or `bucket/prefix`
        root: String,
        region: Option<String>,
        endpoint: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
        role_arn: Option<String>,
        session_token: Option<String>,
        anonymous: Option<bool>,
        /// Leave unset or false for MinIO, which expects path-style requests
        virtual_host_style: Option<bool>,
    },
    #[serde(rename = "azblob")]
    Azblob {
        /// `container` or `container/prefix`
        root: String,
        /// Azurite or account endpoint, defaults to the public account URL
        endpoint: Option<String>,
        account_name: Option<String>,
        account_key: Option<String>,
    },
}

impl StorageConfig {
    fn root(&self) -> &str {
        match self {
            StorageConfig::Memory { root }
            | StorageConfig::Fs { root }
            | StorageConfig::S3 { root, .. }
            | StorageConfig::Azblob { root, .. } => root,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct CollectorNode {
    /// Directory holding the source server's binlog files
    pub(crate) binlog_dir: String,
    /// File name stem, `binlog` for `binlog.000042` (defaults to "binlog")
    pub(crate) binlog_basename: Option<String>,
    /// Length of one cycle and pause between cycles, in seconds
    pub(crate) collect_span_sec: u64,
    /// Segment size cap in megabytes (defaults to 64)
    pub(crate) max_segment_mb: Option<u64>,
    /// Append attempts on transient storage errors (defaults to 4)
    pub(crate) append_retries: Option<u32>,
    /// Window to commit a partial capture on shutdown; 0 disables it
    pub(crate) shutdown_grace_ms: Option<u64>,
    /// Cold-start position, `<file_seq>:<offset>`; defaults to the oldest binlog file
    pub(crate) initial_position: Option<String>,
    /// How often an idle binlog file is polled for new events (defaults to 500)
    pub(crate) poll_interval_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct RecovererNode {
    /// Position the restored base backup is consistent up to
    pub(crate) base_position: Option<String>,
    /// RFC 3339 recovery time
    pub(crate) target_time: Option<String>,
    /// Recovery position, `<file_seq>:<offset>`
    pub(crate) target_position: Option<String>,
    pub(crate) allow_partial_target: Option<bool>,
    /// Read attempts on transient storage errors (defaults to 4)
    pub(crate) read_retries: Option<u32>,
    pub(crate) mysql: MysqlNode,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct MysqlNode {
    pub(crate) host: String,
    pub(crate) port: Option<u16>,
    pub(crate) user: String,
    pub(crate) password: Option<String>,
    pub(crate) mysqlbinlog_path: Option<String>,
    pub(crate) mysql_path: Option<String>,
    /// Directory for the temporary binlog files handed to mysqlbinlog
    pub(crate) work_dir: Option<String>,
}

/// Validated settings the commands run with.
#[derive(Debug)]
pub(crate) struct ServiceConfiguration {
    pub(crate) stream_id: String,
    pub(crate) backend: BackendConfig,
    pub(crate) storage_retries: usize,
    pub(crate) collector: Option<CollectorSettings>,
    pub(crate) recoverer: Option<RecovererSettings>,
    pub(crate) prom_exporter: Option<SocketAddr>,
}

#[derive(Debug)]
pub(crate) struct CollectorSettings {
    pub(crate) binlog_dir: PathBuf,
    pub(crate) binlog_basename: String,
    pub(crate) poll_interval: Duration,
    pub(crate) collector: CollectorConfig,
}

#[derive(Debug)]
pub(crate) struct RecovererSettings {
    pub(crate) base: LogPosition,
    pub(crate) target: Option<RecoveryTarget>,
    pub(crate) allow_partial_target: bool,
    pub(crate) read_retry: RetryPolicy,
    pub(crate) mysql: MysqlSettings,
}

/// Read and validate the YAML configuration file.
pub(crate) fn load_configuration(path: &Path) -> Result<ServiceConfiguration> {
    let content = read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    load_config.try_into()
}

/// Build the configuration from `PITR_*` environment variables alone.
pub(crate) fn load_configuration_from_env() -> Result<ServiceConfiguration> {
    configuration_from(|key| std::env::var(key).ok())?.try_into()
}

/// Configuration from a variable lookup, keyed like the process environment.
///
/// The `collector` section exists when `PITR_COLLECTOR_BINLOG_DIR` is set and
/// the `recoverer` section when `PITR_MYSQL_HOST` is set.
pub(crate) fn configuration_from<F>(lookup: F) -> Result<LoadConfiguration>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let required = |key: &str| var(key).ok_or_else(|| anyhow!("{} is required", key));

    let root = required("PITR_STORAGE_ROOT")?;
    let backend = match required("PITR_STORAGE_BACKEND")?.as_str() {
        "memory" => StorageConfig::Memory { root },
        "fs" => StorageConfig::Fs { root },
        "s3" => StorageConfig::S3 {
            root,
            region: var("PITR_S3_REGION"),
            endpoint: var("PITR_S3_ENDPOINT"),
            access_key: var("PITR_S3_ACCESS_KEY"),
            secret_key: var("PITR_S3_SECRET_KEY"),
            role_arn: var("PITR_S3_ROLE_ARN"),
            session_token: var("PITR_S3_SESSION_TOKEN"),
            anonymous: env_value(&var, "PITR_S3_ANONYMOUS")?,
            virtual_host_style: env_value(&var, "PITR_S3_VIRTUAL_HOST_STYLE")?,
        },
        "azblob" => StorageConfig::Azblob {
            root,
            endpoint: var("PITR_AZBLOB_ENDPOINT"),
            account_name: var("PITR_AZBLOB_ACCOUNT_NAME"),
            account_key: var("PITR_AZBLOB_ACCOUNT_KEY"),
        },
        other => bail!("PITR_STORAGE_BACKEND '{}' is not one of memory, fs, s3, azblob", other),
    };

    let collector = match var("PITR_COLLECTOR_BINLOG_DIR") {
        Some(binlog_dir) => Some(CollectorNode {
            binlog_dir,
            binlog_basename: var("PITR_COLLECTOR_BINLOG_BASENAME"),
            collect_span_sec: env_value(&var, "PITR_COLLECTOR_SPAN_SEC")?
                .ok_or_else(|| anyhow!("PITR_COLLECTOR_SPAN_SEC is required"))?,
            max_segment_mb: env_value(&var, "PITR_COLLECTOR_MAX_SEGMENT_MB")?,
            append_retries: env_value(&var, "PITR_COLLECTOR_APPEND_RETRIES")?,
            shutdown_grace_ms: env_value(&var, "PITR_COLLECTOR_SHUTDOWN_GRACE_MS")?,
            initial_position: var("PITR_COLLECTOR_INITIAL_POSITION"),
            poll_interval_ms: env_value(&var, "PITR_COLLECTOR_POLL_INTERVAL_MS")?,
        }),
        None => None,
    };

    // base and target come from PITR_BASE_POSITION and PITR_TARGET_* on the command line
    let recoverer = match var("PITR_MYSQL_HOST") {
        Some(host) => Some(RecovererNode {
            base_position: None,
            target_time: None,
            target_position: None,
            allow_partial_target: env_value(&var, "PITR_RECOVERER_ALLOW_PARTIAL_TARGET")?,
            read_retries: env_value(&var, "PITR_RECOVERER_READ_RETRIES")?,
            mysql: MysqlNode {
                host,
                port: env_value(&var, "PITR_MYSQL_PORT")?,
                user: required("PITR_MYSQL_USER")?,
                password: var("PITR_MYSQL_PASSWORD"),
                mysqlbinlog_path: var("PITR_MYSQLBINLOG_PATH"),
                mysql_path: var("PITR_MYSQL_PATH"),
                work_dir: var("PITR_MYSQL_WORK_DIR"),
            },
        }),
        None => None,
    };

    Ok(LoadConfiguration {
        stream_id: required("PITR_STREAM_ID")?,
        storage: StorageNode {
            backend,
            max_retries: env_value(&var, "PITR_STORAGE_MAX_RETRIES")?,
        },
        collector,
        recoverer,
        prom_exporter: var("PITR_PROM_EXPORTER"),
    })
}

fn env_value<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("invalid {} '{}': {}", key, v, e))
        })
        .transpose()
}

pub(crate) fn parse_position(field: &str, value: &str) -> Result<LogPosition> {
    value
        .parse::<LogPosition>()
        .map_err(|e| anyhow!("invalid {} '{}': {}", field, value, e))
}

pub(crate) fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid {} '{}', expected RFC 3339", field, value))
}

/// Exactly one of the two target forms, or none.
pub(crate) fn parse_target(
    target_time: Option<&str>,
    target_position: Option<&str>,
) -> Result<Option<RecoveryTarget>> {
    match (target_time, target_position) {
        (Some(_), Some(_)) => bail!("target_time and target_position are mutually exclusive"),
        (Some(t), None) => Ok(Some(RecoveryTarget::Timestamp(parse_time("target_time", t)?))),
        (None, Some(p)) => Ok(Some(RecoveryTarget::Position(parse_position(
            "target_position",
            p,
        )?))),
        (None, None) => Ok(None),
    }
}

fn retry_policy(attempts: Option<u32>) -> RetryPolicy {
    match attempts {
        Some(n) => RetryPolicy::new(n, Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS)),
        None => RetryPolicy::default(),
    }
}

impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let stream_id = config.stream_id.trim().to_string();
        if stream_id.is_empty() || stream_id.contains('/') {
            bail!("stream_id must be non-empty and must not contain '/'");
        }
        if config.storage.backend.root().trim().is_empty() {
            bail!("storage.root is required");
        }

        let prom_exporter = config
            .prom_exporter
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("Failed to parse into Socket address: {}", addr))
            })
            .transpose()?;

        let collector = config.collector.map(CollectorSettings::try_from).transpose()?;
        let recoverer = config.recoverer.map(RecovererSettings::try_from).transpose()?;

        Ok(ServiceConfiguration {
            stream_id,
            backend: BackendConfig::from(&config.storage.backend),
            storage_retries: config.storage.max_retries.unwrap_or(DEFAULT_BACKEND_RETRIES),
            collector,
            recoverer,
            prom_exporter,
        })
    }
}

impl TryFrom<CollectorNode> for CollectorSettings {
    type Error = anyhow::Error;

    fn try_from(node: CollectorNode) -> Result<Self> {
        if node.collect_span_sec == 0 {
            bail!("collector.collect_span_sec must be greater than 0");
        }
        if node.binlog_dir.trim().is_empty() {
            bail!("collector.binlog_dir is required");
        }
        let max_segment_mb = node.max_segment_mb.unwrap_or(DEFAULT_MAX_SEGMENT_MB);
        if max_segment_mb == 0 {
            bail!("collector.max_segment_mb must be greater than 0");
        }
        let Some(max_segment_bytes) = max_segment_mb
            .checked_mul(1024 * 1024)
            .and_then(|bytes| usize::try_from(bytes).ok())
        else {
            bail!("collector.max_segment_mb {} is too large", max_segment_mb);
        };
        let initial_position = match node.initial_position.as_deref() {
            Some(p) => parse_position("collector.initial_position", p)?,
            None => LogPosition::ORIGIN,
        };
        let span = Duration::from_secs(node.collect_span_sec);
        Ok(CollectorSettings {
            binlog_dir: PathBuf::from(node.binlog_dir),
            binlog_basename: node
                .binlog_basename
                .unwrap_or_else(|| DEFAULT_BINLOG_BASENAME.to_string()),
            poll_interval: Duration::from_millis(
                node.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS).max(1),
            ),
            collector: CollectorConfig {
                cycle_length: span,
                pause_between_cycles: span,
                max_segment_bytes,
                append_retry: retry_policy(node.append_retries),
                shutdown_grace: match node.shutdown_grace_ms {
                    Some(0) => None,
                    Some(ms) => Some(Duration::from_millis(ms)),
                    None => CollectorConfig::default().shutdown_grace,
                },
                initial_position,
            },
        })
    }
}

impl TryFrom<RecovererNode> for RecovererSettings {
    type Error = anyhow::Error;

    fn try_from(node: RecovererNode) -> Result<Self> {
        let base = match node.base_position.as_deref() {
            Some(p) => parse_position("recoverer.base_position", p)?,
            None => LogPosition::ORIGIN,
        };
        let target = parse_target(node.target_time.as_deref(), node.target_position.as_deref())?;
        Ok(RecovererSettings {
            base,
            target,
            allow_partial_target: node.allow_partial_target.unwrap_or(false),
            read_retry: retry_policy(node.read_retries),
            mysql: MysqlSettings::from(node.mysql),
        })
    }
}

fn provider_options(pairs: &[(&str, Option<String>)]) -> HashMap<String, String> {
    pairs
        .iter()
        .filter_map(|(key, value)| value.clone().map(|v| (key.to_string(), v)))
        .collect()
}

impl From<&StorageConfig> for BackendConfig {
    fn from(cfg: &StorageConfig) -> Self {
        match cfg {
            StorageConfig::Memory { root } => BackendConfig::Local {
                backend: LocalBackend::Memory,
                root: root.clone(),
            },
            StorageConfig::Fs { root } => BackendConfig::Local {
                backend: LocalBackend::Fs,
                root: root.clone(),
            },
            StorageConfig::S3 {
                root,
                region,
                endpoint,
                access_key,
                secret_key,
                role_arn,
                session_token,
                anonymous,
                virtual_host_style,
            } => BackendConfig::Cloud {
                backend: CloudBackend::S3,
                root: root.clone(),
                options: provider_options(&[
                    ("region", region.clone()),
                    ("endpoint", endpoint.clone()),
                    ("access_key", access_key.clone()),
                    ("secret_key", secret_key.clone()),
                    ("role_arn", role_arn.clone()),
                    ("session_token", session_token.clone()),
                    ("anonymous", anonymous.map(|v| v.to_string())),
                    ("virtual_host_style", virtual_host_style.map(|v| v.to_string())),
                ]),
            },
            StorageConfig::Azblob {
                root,
                endpoint,
                account_name,
                account_key,
            } => BackendConfig::Cloud {
                backend: CloudBackend::Azblob,
                root: root.clone(),
                options: provider_options(&[
                    ("endpoint", endpoint.clone()),
                    ("account_name", account_name.clone()),
                    ("account_key", account_key.clone()),
                ]),
            },
        }
    }
}
