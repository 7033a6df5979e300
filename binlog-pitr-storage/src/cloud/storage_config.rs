use binlog_pitr_core::PitrError;
use opendal::layers::RetryLayer;
use opendal::services::{Azblob, Fs, Memory, S3};
use opendal::Operator;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudBackend {
    S3,
    Azblob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalBackend {
    Fs,
    Memory,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Cloud backends hosted out of process (S3, Azure Blob)
    Cloud {
        backend: CloudBackend,
        /// A URI-like root, e.g. s3://bucket/prefix, azblob://container/prefix
        root: String,
        /// Optional backend-specific options (endpoint, region, credentials, etc.)
        options: HashMap<String, String>,
    },
    /// Local backends (fs, memory), used for single-host setups and tests
    Local {
        backend: LocalBackend,
        /// For fs: an absolute directory like file:///var/lib/pitr or /var/lib/pitr
        /// For memory: a logical namespace (prefix is used as a virtual root)
        root: String,
    },
}

const S3_OPTIONS: &[&str] = &[
    "endpoint",
    "region",
    "access_key",
    "secret_key",
    "session_token",
    "role_arn",
    "anonymous",
    "virtual_host_style",
];

const AZBLOB_OPTIONS: &[&str] = &["endpoint", "account_name", "account_key"];

fn warn_unknown_options(service: &str, options: &HashMap<String, String>, allowed: &[&str]) {
    for k in options.keys() {
        if !allowed.contains(&k.as_str()) {
            warn!(
                target: "object_store",
                "unknown {} option '{}'; accepted keys: {:?}",
                service,
                k,
                allowed
            );
        }
    }
}

fn builder_error(service: &str, e: opendal::Error) -> PitrError {
    PitrError::Fatal(format!("opendal {} builder: {}", service, e))
}

fn option_is_true(options: &HashMap<String, String>, key: &str) -> bool {
    options
        .get(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl BackendConfig {
    /// Provider label used in logs and metrics.
    pub fn provider(&self) -> &'static str {
        match self {
            BackendConfig::Cloud { backend, .. } => match backend {
                CloudBackend::S3 => "s3",
                CloudBackend::Azblob => "azblob",
            },
            BackendConfig::Local { backend, .. } => match backend {
                LocalBackend::Fs => "fs",
                LocalBackend::Memory => "memory",
            },
        }
    }

    /// Build the opendal operator and the extra key prefix applied on top of it.
    ///
    /// Every operator gets a `RetryLayer`: transient provider errors are retried
    /// inside the backend before they surface as `TransientIo`.
    pub(crate) fn build_operator(&self, max_retries: usize) -> Result<(Operator, String), PitrError> {
        let retry = RetryLayer::new().with_max_times(max_retries).with_jitter();
        match self {
            BackendConfig::Cloud {
                backend: CloudBackend::S3,
                root,
                options,
            } => {
                // Expect root like s3://bucket or s3://bucket/prefix
                let (bucket, prefix) = split_bucket_prefix(root).map_err(PitrError::Fatal)?;
                warn_unknown_options("s3", options, S3_OPTIONS);
                // Builders in opendal 0.54 consume self: use chaining/reassignment
                let mut builder = S3::default().bucket(&bucket);
                if !prefix.is_empty() {
                    // S3 root must be an absolute path
                    builder = builder.root(&format!("/{}", prefix));
                }
                if let Some(endpoint) = options.get("endpoint") {
                    builder = builder.endpoint(endpoint);
                }
                if let Some(region) = options.get("region") {
                    builder = builder.region(region);
                }
                if let Some(ak) = options.get("access_key") {
                    builder = builder.access_key_id(ak);
                }
                if let Some(sk) = options.get("secret_key") {
                    builder = builder.secret_access_key(sk);
                }
                if let Some(token) = options.get("session_token") {
                    builder = builder.session_token(token);
                }
                if let Some(role) = options.get("role_arn") {
                    builder = builder.role_arn(role);
                }
                if option_is_true(options, "anonymous") {
                    builder = builder.allow_anonymous();
                }
                if option_is_true(options, "virtual_host_style") {
                    builder = builder.enable_virtual_host_style();
                }
                let op = Operator::new(builder)
                    .map_err(|e| builder_error("s3", e))?
                    .layer(retry)
                    .finish();
                Ok((op, String::new()))
            }
            BackendConfig::Cloud {
                backend: CloudBackend::Azblob,
                root,
                options,
            } => {
                // Expect root like azblob://container/prefix or container/prefix
                let (container, prefix) = split_bucket_prefix(root).map_err(PitrError::Fatal)?;
                warn_unknown_options("azblob", options, AZBLOB_OPTIONS);
                let mut builder = Azblob::default().container(&container);
                if !prefix.is_empty() {
                    builder = builder.root(&format!("/{}", prefix));
                }
                if let Some(endpoint) = options.get("endpoint") {
                    builder = builder.endpoint(endpoint);
                }
                if let Some(name) = options.get("account_name") {
                    builder = builder.account_name(name);
                }
                if let Some(key) = options.get("account_key") {
                    builder = builder.account_key(key);
                }
                let op = Operator::new(builder)
                    .map_err(|e| builder_error("azblob", e))?
                    .layer(retry)
                    .finish();
                Ok((op, String::new()))
            }
            BackendConfig::Local {
                backend: LocalBackend::Fs,
                root,
            } => {
                // Accept either file:///abs/path or /abs/path
                let fs_root = split_fs_root(root);
                let op = Operator::new(Fs::default().root(&fs_root))
                    .map_err(|e| builder_error("fs", e))?
                    .layer(retry)
                    .finish();
                Ok((op, String::new()))
            }
            BackendConfig::Local {
                backend: LocalBackend::Memory,
                root,
            } => {
                // Memory service ignores root but we keep a logical prefix
                let op = Operator::new(Memory::default())
                    .map_err(|e| builder_error("memory", e))?
                    .layer(retry)
                    .finish();
                Ok((op, normalize_prefix(root)))
            }
        }
    }
}

pub(crate) fn split_bucket_prefix(uri: &str) -> Result<(String, String), String> {
    // Accept formats: s3://bucket, s3://bucket/prefix, azblob://container/prefix, bucket/prefix
    let rest = match uri.split_once("://") {
        Some((_, rest)) => rest,
        None => uri,
    };
    let rest = rest.trim_matches('/');
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(format!("invalid uri, missing bucket: {}", uri));
    }
    Ok((bucket.to_string(), normalize_prefix(prefix)))
}

pub(crate) fn split_fs_root(uri_or_path: &str) -> String {
    uri_or_path
        .strip_prefix("file://")
        .unwrap_or(uri_or_path)
        .to_string()
}

pub(crate) fn normalize_prefix(p: &str) -> String {
    p.trim_matches('/').to_string()
}
