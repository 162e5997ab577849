//! Core publisher configuration (§6).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration consumed by [`crate::bootstrap::bootstrap_publisher`].
///
/// Mirrors a common CLI-facing/core-facing config split: the CLI
/// binary owns YAML file loading and environment overrides, then
/// converts into this plain struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Lexicon collection records are published into
    /// (e.g. `fm.teal.alpha.feed.play`).
    pub collection: String,

    /// Root directory under which this crate keeps its per-account
    /// state subdirectory (§3.A).
    pub state_root: PathBuf,

    /// PDS base URL for the authenticated account
    /// (e.g. `https://bsky.social`).
    pub pds_endpoint: String,

    /// Fixed clock id for the TID generator. `None` seeds a random one
    /// on first run and persists it thereafter.
    pub fixed_clock_id: Option<u64>,

    /// If `true`, records are built and deduplicated but never actually
    /// sent to the server — used for dry runs.
    pub dry_run: bool,

    /// Multiplier applied to the governor's advertised remaining quota
    /// (§4.B step 2). `None` uses [`crate::governor::DEFAULT_SAFETY_FACTOR`]
    /// unless `aggressive` is set.
    pub safety_factor: Option<f64>,

    /// Shortcut for a looser safety factor
    /// ([`crate::governor::AGGRESSIVE_SAFETY_FACTOR`]), overriding
    /// `safety_factor` when set.
    pub aggressive: bool,

    /// Fixes the adaptive sizer's initial batch size instead of
    /// estimating it from the backlog.
    pub batch_size_override: Option<u32>,

    /// Hours a populated remote record cache is trusted before the
    /// publisher re-enumerates the server from scratch.
    pub cache_ttl_hours: Option<i64>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            collection: "fm.teal.alpha.feed.play".to_string(),
            state_root: PathBuf::from("./state"),
            pds_endpoint: String::new(),
            fixed_clock_id: None,
            dry_run: false,
            safety_factor: None,
            aggressive: false,
            batch_size_override: None,
            cache_ttl_hours: None,
        }
    }
}

impl PublisherConfig {
    /// Returns the per-account state directory, namespaced by DID so
    /// two accounts never share a cache or clock file.
    pub fn account_state_dir(&self, account_did: &str) -> PathBuf {
        self.state_root.join(sanitize_did(account_did))
    }

    /// Resolves the effective governor safety factor: `aggressive` wins
    /// over an explicit `safety_factor`, which wins over the default.
    pub fn effective_safety_factor(&self) -> f64 {
        if self.aggressive {
            crate::governor::AGGRESSIVE_SAFETY_FACTOR
        } else {
            self.safety_factor.unwrap_or(crate::governor::DEFAULT_SAFETY_FACTOR)
        }
    }

    /// Resolves the effective cache TTL in hours.
    pub fn effective_cache_ttl_hours(&self) -> i64 {
        self.cache_ttl_hours.unwrap_or(crate::cache::DEFAULT_CACHE_TTL_HOURS)
    }
}

/// Sanitizes an account identifier into a safe path segment: keep
/// `[A-Za-z0-9.-]`, replace everything else (notably DIDs' `:`) with
/// `_`, matching the cache file naming rule in §4.E/§6.
fn sanitize_did(did: &str) -> String {
    did.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
