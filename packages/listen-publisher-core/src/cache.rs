//! Remote record cache (§4.E, component E).
//!
//! Avoids re-querying the PDS for already-published records on every
//! run by persisting the set of [`RecordKey`]s last observed there,
//! validated against a TTL, a schema version, and the account DID so a
//! stale or mismatched cache is never trusted silently.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PublisherResult;
use crate::model::RecordKey;
use crate::pds_client::RecordLister;
use crate::state_dir::StateDirProvider;

/// Current on-disk schema version. Bump whenever the cache file's shape
/// changes incompatibly, so old caches are discarded instead of
/// misread.
const CACHE_VERSION: u32 = 1;

/// Default TTL, in hours, before a populated cache is no longer trusted
/// and the publisher re-enumerates the server from scratch. Overridable
/// via `PublisherConfig::cache_ttl_hours`.
pub const DEFAULT_CACHE_TTL_HOURS: i64 = 24;

const CACHE_FILE: &str = "remote_record_cache.json";

/// Listing page size used when repopulating the cache from the server.
const LIST_RECORDS_PAGE_SIZE: u32 = 100;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    account_did: String,
    collection: String,
    populated_at: DateTime<Utc>,
    keys: HashSet<RecordKey>,
}

/// Local mirror of which [`RecordKey`]s already exist on the server.
pub struct RemoteRecordCache {
    state_dir: Arc<dyn StateDirProvider>,
    keys: HashSet<RecordKey>,
    populated_at: Option<DateTime<Utc>>,
    account_did: String,
    collection: String,
    ttl: chrono::Duration,
}

impl RemoteRecordCache {
    /// Loads a cache file, discarding it (starting empty) if the schema
    /// version, account, or collection don't match, or if `ttl_hours`
    /// has elapsed since it was populated.
    pub async fn load(
        state_dir: Arc<dyn StateDirProvider>,
        account_did: &str,
        collection: &str,
        ttl_hours: i64,
    ) -> PublisherResult<Self> {
        let ttl = chrono::Duration::hours(ttl_hours);
        let loaded = match state_dir.read(CACHE_FILE).await? {
            Some(bytes) => serde_json::from_slice::<CacheFile>(&bytes).ok(),
            None => None,
        };

        let valid = loaded.filter(|cache| {
            cache.version == CACHE_VERSION
                && cache.account_did == account_did
                && cache.collection == collection
                && Utc::now() - cache.populated_at < ttl
        });

        match valid {
            Some(cache) => Ok(Self {
                state_dir,
                keys: cache.keys,
                populated_at: Some(cache.populated_at),
                account_did: account_did.to_string(),
                collection: collection.to_string(),
                ttl,
            }),
            None => Ok(Self {
                state_dir,
                keys: HashSet::new(),
                populated_at: None,
                account_did: account_did.to_string(),
                collection: collection.to_string(),
                ttl,
            }),
        }
    }

    /// `true` if the cache has never been populated, or its TTL has
    /// lapsed since the in-memory copy was built.
    pub fn needs_population(&self) -> bool {
        match self.populated_at {
            None => true,
            Some(at) => Utc::now() - at >= self.ttl,
        }
    }

    /// Re-enumerates every record in `collection` via `lister`,
    /// replacing the cache's contents wholesale.
    pub async fn populate(&mut self, lister: &dyn RecordLister) -> PublisherResult<()> {
        let mut keys = HashSet::new();
        let mut cursor = None;

        loop {
            let page = lister
                .list_records(&self.collection, cursor.as_deref(), LIST_RECORDS_PAGE_SIZE)
                .await?;

            for record in &page.records {
                if let Some(key) = record_key_from_value(&record.value) {
                    keys.insert(key);
                }
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        self.keys = keys;
        self.populated_at = Some(Utc::now());
        self.persist().await
    }

    /// `true` if `key` is already known to exist on the server.
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.keys.contains(key)
    }

    /// Records a newly published key so subsequent calls within the same
    /// run see it as a duplicate without waiting for the next
    /// population.
    pub async fn insert(&mut self, key: RecordKey) -> PublisherResult<()> {
        self.keys.insert(key);
        self.persist().await
    }

    async fn persist(&self) -> PublisherResult<()> {
        let populated_at = self.populated_at.unwrap_or_else(Utc::now);
        let file = CacheFile {
            version: CACHE_VERSION,
            account_did: self.account_did.clone(),
            collection: self.collection.clone(),
            populated_at,
            keys: self.keys.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        self.state_dir.write(CACHE_FILE, &bytes).await
    }
}

fn record_key_from_value(value: &serde_json::Value) -> Option<RecordKey> {
    let artist = value
        .get("artists")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let track = value.get("trackName").and_then(|v| v.as_str())?;
    let played_time = value
        .get("playedTime")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
        .with_timezone(&Utc);
    Some(RecordKey::from_parts(artist, track, &played_time))
}
