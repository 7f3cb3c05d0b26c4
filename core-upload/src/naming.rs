//! # Object Key Resolution
//!
//! Maps a media name to the object key a fresh upload will write to.
//!
//! With versioning off the key is simply `prefix/mediaName`. With versioning
//! on, the resolver refuses to overwrite: it probes the canonical key and
//! then `base_0.ext`, `base_1.ext`, ... until it finds a slot that is free
//! in all three places that could hold it:
//!
//! 1. the process-local in-flight ledger
//! 2. the bucket itself
//! 3. the bucket's incomplete multipart uploads
//!
//! The first free slot is reserved in the ledger before it is returned, so
//! two back-to-back uploads in one process never pick the same slot.
//! Resumed transfers never come through here; their key lives in the
//! checkpoint.

use std::sync::Arc;

use async_trait::async_trait;
use bridge_traits::ObjectStore;
use core_runtime::NamingPolicy;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument};

use crate::error::{Result, UploadError};
use crate::keep_alive::KeepAlive;

/// `name_<digits>.ext` as produced by recorders that version their own
/// output. Only matches within the last path segment.
static LEGACY_VERSION_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>.*[^/])_\d+(?P<ext>\.[^./]+)$")
        .expect("legacy version suffix regex is valid")
});

/// Keys currently claimed by this process.
#[async_trait]
pub trait KeyLedger: Send + Sync {
    async fn is_reserved(&self, key: &str) -> bool;

    /// Claims `key`. Returns `false` if it was already claimed.
    async fn try_reserve(&self, key: &str) -> bool;

    /// Holds `key` alongside any existing holder. Returns the holder count.
    async fn acquire(&self, key: &str) -> usize;
}

/// Joins `prefix` and `media_name` with exactly one `/`.
pub fn object_key(prefix: Option<&str>, media_name: &str) -> String {
    let name = media_name.trim_start_matches('/');
    match prefix.map(|p| p.trim_end_matches('/')) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}/{name}"),
        _ => name.to_string(),
    }
}

/// Strips a trailing `_<digits>` version suffix from the file name.
pub fn canonical_key(key: &str) -> String {
    LEGACY_VERSION_SUFFIX
        .replace(key, "${base}${ext}")
        .into_owned()
}

/// `base_<index>.ext`, where the extension is taken from the last segment.
pub fn versioned_key(key: &str, index: u32) -> String {
    let segment_start = key.rfind('/').map(|i| i + 1).unwrap_or(0);
    match key[segment_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = segment_start + dot;
            format!("{}_{}{}", &key[..dot], index, &key[dot..])
        }
        _ => format!("{key}_{index}"),
    }
}

pub struct NamingResolver {
    policy: NamingPolicy,
    store: Arc<dyn ObjectStore>,
    keep_alive: KeepAlive,
}

impl NamingResolver {
    pub fn new(policy: NamingPolicy, store: Arc<dyn ObjectStore>, keep_alive: KeepAlive) -> Self {
        Self {
            policy,
            store,
            keep_alive,
        }
    }

    pub fn policy(&self) -> &NamingPolicy {
        &self.policy
    }

    /// Resolves and reserves the key for a fresh upload of `media_name`.
    ///
    /// The caller owns the reservation and must release it when the attempt
    /// ends.
    #[instrument(skip(self, ledger), fields(versioning = self.policy.versioning))]
    pub async fn resolve(&self, media_name: &str, ledger: &dyn KeyLedger) -> Result<String> {
        let key = object_key(self.policy.prefix.as_deref(), media_name);

        if !self.policy.versioning {
            if ledger.acquire(&key).await > 1 {
                debug!(key = %key, "Key already in flight; versioning is off so sharing it");
            }
            return Ok(key);
        }

        let canonical = if self.policy.strip_legacy_suffix {
            canonical_key(&key)
        } else {
            key
        };

        if self.claim(&canonical, ledger).await? {
            return Ok(canonical);
        }

        for index in 0..self.policy.max_versions {
            self.keep_alive.touch();
            let candidate = versioned_key(&canonical, index);
            if self.claim(&candidate, ledger).await? {
                debug!(key = %candidate, index, "Resolved versioned key");
                return Ok(candidate);
            }
        }

        Err(UploadError::VersionsExhausted {
            key: canonical,
            attempts: self.policy.max_versions,
        })
    }

    /// Reserves `key` if no probe reports it taken.
    async fn claim(&self, key: &str, ledger: &dyn KeyLedger) -> Result<bool> {
        if ledger.is_reserved(key).await {
            return Ok(false);
        }
        if self.store.exists(key).await? {
            return Ok(false);
        }
        let incomplete = self.store.list_incomplete_by_prefix(key).await?;
        if incomplete.iter().any(|pending| pending == key) {
            return Ok(false);
        }
        Ok(ledger.try_reserve(key).await)
    }
}

impl std::fmt::Debug for NamingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamingResolver")
            .field("policy", &self.policy)
            .finish()
    }
}
