//! # Upload Configuration
//!
//! Settings for the upload engine, built either programmatically through
//! [`UploadConfigBuilder`] or from the host's flat property map with
//! [`UploadConfig::from_properties`].
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::config::UploadConfig;
//! use std::time::Duration;
//!
//! let config = UploadConfig::builder()
//!     .storage_root("/srv/content")
//!     .bucket("recordings")
//!     .credentials("AKIA...", "secret")
//!     .prefix("live")
//!     .initial_delay(Duration::from_secs(5))
//!     .versioning(true)
//!     .build()
//!     .expect("valid config");
//!
//! assert!(config.naming.versioning);
//! ```
//!
//! ## Validation
//!
//! `build()` fails fast on values that can never work (empty storage root,
//! zero version ceiling, a prefix escaping with `..`). Missing credentials or
//! bucket are *not* build errors: the service starts with uploading disabled
//! and says why.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bridge_traits::object_store::{AccessControl, GroupGrantee, Permission};
use core_async::time::duration_from_millis;
use tracing::warn;

use crate::error::{Error, Result};

/// Default retry delay after a failed transfer.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Shortest retry delay the engine accepts; smaller values are raised to it.
pub const MIN_RETRY_TIMEOUT: Duration = Duration::from_secs(1);

/// Default ceiling for the version-suffix probe loop.
pub const DEFAULT_MAX_VERSIONS: u32 = 10_000;

/// Property names understood by [`UploadConfig::from_properties`].
pub mod properties {
    pub const ACCESS_KEY: &str = "s3UploadAccessKey";
    pub const SECRET_KEY: &str = "s3UploadSecretKey";
    pub const BUCKET: &str = "s3UploadBucketName";
    pub const REGION: &str = "s3UploadRegion";
    pub const ENDPOINT: &str = "s3UploadEndpoint";
    pub const PREFIX: &str = "s3FilePrefix";
    pub const RESUME_UPLOADS: &str = "s3UploadResumeUploads";
    pub const RESTART_FAILED: &str = "s3UploadRestartFailedUploads";
    pub const RESTART_FAILED_TIMEOUT: &str = "s3UploadRestartFailedUploadTimeout";
    pub const DELAY: &str = "s3UploadDelay";
    pub const DELETE_ORIGINAL: &str = "s3UploadDeleteOriginalFiles";
    /// Misspelled name shipped by older deployments; still honoured.
    pub const DELETE_ORIGINAL_LEGACY: &str = "s3UploadDeletOriginalFiles";
    pub const VERSION_FILES: &str = "s3UploadVersionFiles";
    pub const VERSION_STRIP_SUFFIX: &str = "s3UploadVersionStripSuffix";
    pub const MAX_VERSIONS: &str = "s3UploadMaxVersions";
    pub const ACL_GRANTEE_URI: &str = "s3UploadACLGroupGranteeUri";
    pub const ACL_PERMISSION: &str = "s3UploadACLPermissionRule";
    pub const DEBUG_LOG: &str = "s3UploadDebugLog";
}

/// Object-store credentials. `Debug` never prints the values.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    /// Returns `None` unless both halves are non-blank.
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Option<Self> {
        let access_key = access_key.into().trim().to_string();
        let secret_key = secret_key.into().trim().to_string();
        if access_key.is_empty() || secret_key.is_empty() {
            None
        } else {
            Some(Self {
                access_key,
                secret_key,
            })
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Retry behaviour after a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Added to the file's age at failure to form the next stability delay.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

/// How local media names map to object keys. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingPolicy {
    pub prefix: Option<String>,
    /// Pick `name_<n>.ext` instead of overwriting an existing object.
    pub versioning: bool,
    /// Strip a recorder-generated `_<digits>` suffix before versioning.
    pub strip_legacy_suffix: bool,
    /// Highest number of version slots probed before giving up.
    pub max_versions: u32,
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self {
            prefix: None,
            versioning: false,
            strip_legacy_suffix: true,
            max_versions: DEFAULT_MAX_VERSIONS,
        }
    }
}

/// Complete upload configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Directory media names are relative to.
    pub storage_root: PathBuf,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub credentials: Option<Credentials>,
    pub naming: NamingPolicy,
    /// Resume checkpointed transfers after restart. When off, pending markers
    /// are discarded at startup.
    pub resume_uploads: bool,
    pub retry: RetryPolicy,
    /// Minimum time a file must stay unmodified before it is uploaded.
    pub initial_delay: Duration,
    pub delete_original: bool,
    pub acl: Option<AccessControl>,
    pub debug_logging: bool,
}

impl fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadConfig")
            .field("storage_root", &self.storage_root)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials.as_ref().map(|_| "[REDACTED]"))
            .field("naming", &self.naming)
            .field("resume_uploads", &self.resume_uploads)
            .field("retry", &self.retry)
            .field("initial_delay", &self.initial_delay)
            .field("delete_original", &self.delete_original)
            .field("acl", &self.acl)
            .field("debug_logging", &self.debug_logging)
            .finish()
    }
}

impl UploadConfig {
    pub fn builder() -> UploadConfigBuilder {
        UploadConfigBuilder::default()
    }

    /// Loads configuration from the host's property map.
    ///
    /// Unknown keys are ignored. Booleans accept `true/false/yes/no/1/0`.
    /// Malformed numbers and booleans are configuration errors. An ACL is only
    /// attached when both the grantee URI and the permission parse.
    pub fn from_properties(
        storage_root: impl Into<PathBuf>,
        props: &HashMap<String, String>,
    ) -> Result<Self> {
        use properties as p;

        let get = |key: &str| {
            props
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let mut builder = Self::builder().storage_root(storage_root);

        if let (Some(access), Some(secret)) = (get(p::ACCESS_KEY), get(p::SECRET_KEY)) {
            builder = builder.credentials(access, secret);
        }
        if let Some(bucket) = get(p::BUCKET) {
            builder = builder.bucket(bucket);
        }
        if let Some(region) = get(p::REGION) {
            builder = builder.region(region);
        }
        if let Some(endpoint) = get(p::ENDPOINT) {
            builder = builder.endpoint(endpoint);
        }
        if let Some(prefix) = get(p::PREFIX) {
            builder = builder.prefix(prefix);
        }
        if let Some(value) = get(p::RESUME_UPLOADS) {
            builder = builder.resume_uploads(parse_bool(p::RESUME_UPLOADS, value)?);
        }
        if let Some(value) = get(p::RESTART_FAILED) {
            builder = builder.retry_enabled(parse_bool(p::RESTART_FAILED, value)?);
        }
        if let Some(value) = get(p::RESTART_FAILED_TIMEOUT) {
            builder = builder.retry_timeout(parse_millis(p::RESTART_FAILED_TIMEOUT, value)?);
        }
        if let Some(value) = get(p::DELAY) {
            builder = builder.initial_delay(parse_millis(p::DELAY, value)?);
        }
        // The correctly spelled key wins over the legacy one.
        let delete_original = get(p::DELETE_ORIGINAL)
            .map(|v| (p::DELETE_ORIGINAL, v))
            .or_else(|| get(p::DELETE_ORIGINAL_LEGACY).map(|v| (p::DELETE_ORIGINAL_LEGACY, v)));
        if let Some((key, value)) = delete_original {
            builder = builder.delete_original(parse_bool(key, value)?);
        }
        if let Some(value) = get(p::VERSION_FILES) {
            builder = builder.versioning(parse_bool(p::VERSION_FILES, value)?);
        }
        if let Some(value) = get(p::VERSION_STRIP_SUFFIX) {
            builder = builder.strip_legacy_suffix(parse_bool(p::VERSION_STRIP_SUFFIX, value)?);
        }
        if let Some(value) = get(p::MAX_VERSIONS) {
            let max = value.parse::<u32>().map_err(|e| {
                Error::Config(format!("{} must be a positive integer: {}", p::MAX_VERSIONS, e))
            })?;
            builder = builder.max_versions(max);
        }
        builder = builder.acl(parse_acl(get(p::ACL_GRANTEE_URI), get(p::ACL_PERMISSION)));
        if let Some(value) = get(p::DEBUG_LOG) {
            builder = builder.debug_logging(parse_bool(p::DEBUG_LOG, value)?);
        }

        builder.build()
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(Error::Config("storage root must not be empty".to_string()));
        }
        if self.naming.max_versions == 0 {
            return Err(Error::Config(
                "max_versions must be greater than zero".to_string(),
            ));
        }
        if let Some(prefix) = &self.naming.prefix {
            if prefix.split('/').any(|segment| segment == "..") {
                return Err(Error::Config(format!(
                    "prefix must not contain '..' segments: {prefix}"
                )));
            }
        }
        if let Some(bucket) = &self.bucket {
            if bucket.trim().is_empty() {
                return Err(Error::Config("bucket name must not be blank".to_string()));
            }
        }
        Ok(())
    }
}

/// Builder for [`UploadConfig`].
#[derive(Debug, Default)]
pub struct UploadConfigBuilder {
    storage_root: Option<PathBuf>,
    bucket: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    credentials: Option<Credentials>,
    naming: NamingPolicy,
    resume_uploads: Option<bool>,
    retry: RetryPolicy,
    initial_delay: Duration,
    delete_original: bool,
    acl: Option<AccessControl>,
    debug_logging: bool,
}

impl UploadConfigBuilder {
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Blank keys leave the config without credentials.
    pub fn credentials(mut self, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.credentials = Credentials::new(access_key, secret_key);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.naming.prefix = if prefix.trim_matches('/').is_empty() {
            None
        } else {
            Some(prefix)
        };
        self
    }

    pub fn versioning(mut self, enabled: bool) -> Self {
        self.naming.versioning = enabled;
        self
    }

    pub fn strip_legacy_suffix(mut self, enabled: bool) -> Self {
        self.naming.strip_legacy_suffix = enabled;
        self
    }

    pub fn max_versions(mut self, max: u32) -> Self {
        self.naming.max_versions = max;
        self
    }

    pub fn resume_uploads(mut self, enabled: bool) -> Self {
        self.resume_uploads = Some(enabled);
        self
    }

    pub fn retry_enabled(mut self, enabled: bool) -> Self {
        self.retry.enabled = enabled;
        self
    }

    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry.timeout = timeout;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn delete_original(mut self, enabled: bool) -> Self {
        self.delete_original = enabled;
        self
    }

    pub fn acl(mut self, acl: Option<AccessControl>) -> Self {
        self.acl = acl;
        self
    }

    pub fn debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    pub fn build(mut self) -> Result<UploadConfig> {
        let storage_root = self.storage_root.ok_or_else(|| {
            Error::Config("storage root is required".to_string())
        })?;

        if self.retry.timeout < MIN_RETRY_TIMEOUT {
            warn!(
                configured_ms = self.retry.timeout.as_millis() as u64,
                applied_ms = MIN_RETRY_TIMEOUT.as_millis() as u64,
                "Retry timeout below minimum; raising it"
            );
            self.retry.timeout = MIN_RETRY_TIMEOUT;
        }

        let config = UploadConfig {
            storage_root,
            bucket: self.bucket,
            region: self.region,
            endpoint: self.endpoint,
            credentials: self.credentials,
            naming: self.naming,
            resume_uploads: self.resume_uploads.unwrap_or(true),
            retry: self.retry,
            initial_delay: self.initial_delay,
            delete_original: self.delete_original,
            acl: self.acl,
            debug_logging: self.debug_logging,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .parse::<i64>()
        .map(duration_from_millis)
        .map_err(|e| Error::Config(format!("{key} must be milliseconds: {e}")))
}

fn parse_acl(grantee: Option<&str>, permission: Option<&str>) -> Option<AccessControl> {
    match (grantee, permission) {
        (None, None) => None,
        (Some(grantee), Some(permission)) => {
            let grantee = grantee.parse::<GroupGrantee>();
            let permission = permission.to_ascii_uppercase().parse::<Permission>();
            match (grantee, permission) {
                (Ok(grantee), Ok(permission)) => Some(AccessControl::new(grantee, permission)),
                (grantee, permission) => {
                    if let Err(e) = grantee {
                        warn!(error = %e, "Ignoring ACL: bad grantee");
                    }
                    if let Err(e) = permission {
                        warn!(error = %e, "Ignoring ACL: bad permission");
                    }
                    None
                }
            }
        }
        _ => {
            warn!(
                "Ignoring ACL: both {} and {} must be set",
                properties::ACL_GRANTEE_URI,
                properties::ACL_PERMISSION
            );
            None
        }
    }
}
