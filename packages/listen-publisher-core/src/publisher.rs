//! Publisher loop (§4.F, component F).
//!
//! Orchestrates every other component: dedup against the remote cache,
//! pace batches through the governor, size them adaptively, send them
//! with retry, and fold the outcome back into the cache and sizer.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::RemoteRecordCache;
use crate::cancel::CancelSignal;
use crate::config::PublisherConfig;
use crate::error::{PublisherError, PublisherResult};
use crate::governor::{Governor, Permit};
use crate::model::{PlayRecord, RecordKey};
use crate::pds_client::PdsClient;
use crate::retry::with_retry;
use crate::session::AuthSession;
use crate::sizer::BatchSizer;
use crate::state_dir::StateDirProvider;
use crate::tid::TidClock;

/// Result of one [`Publisher::publish`] run. Never wrapped in a
/// `Result`: every failure mode, including authentication loss, is
/// folded into these counters instead of aborting the whole run — no
/// exceptions cross the publisher boundary (§7).
///
/// `success_count + error_count + skipped_duplicates + untried` always
/// equals the number of input records (§8, invariant 3). `untried` is
/// nonzero only when `cancelled` is `true`; an authentication failure
/// instead folds every record it didn't get to into `error_count` and
/// sets `auth_failed`, so `untried` stays zero in that case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub success_count: usize,
    pub error_count: usize,
    pub skipped_duplicates: usize,
    pub untried: usize,
    pub cancelled: bool,
    /// Set when the run stopped because the session's credentials were
    /// rejected (401), so the outer shell can distinguish "needs
    /// re-authentication" from an ordinary validation failure (§7).
    pub auth_failed: bool,
}

/// Wires components A–E together behind the orchestration loop.
pub struct Publisher {
    pds_client: PdsClient,
    tid_clock: TidClock,
    governor: Governor,
    sizer: BatchSizer,
    cache: RemoteRecordCache,
    collection: String,
    dry_run: bool,
}

impl Publisher {
    /// Loads or seeds every component's persisted state under
    /// `config.account_state_dir(&session.account_did)` and constructs a
    /// ready-to-run publisher.
    pub async fn load(
        session: AuthSession,
        config: &PublisherConfig,
        http: reqwest::Client,
        state_dir: Arc<dyn StateDirProvider>,
        pending_records: usize,
    ) -> PublisherResult<Self> {
        let tid_clock = match config.fixed_clock_id {
            Some(id) => TidClock::with_fixed_clock_id(id, state_dir.clone()),
            None => TidClock::load(state_dir.clone()).await?,
        };
        let governor = Governor::load(state_dir.clone(), config.effective_safety_factor()).await?;
        let cache = RemoteRecordCache::load(
            state_dir,
            &session.account_did,
            &config.collection,
            config.effective_cache_ttl_hours(),
        )
        .await?;
        let pds_client = PdsClient::new(http, session);

        Ok(Self {
            pds_client,
            tid_clock,
            governor,
            sizer: BatchSizer::seed_from_backlog(pending_records, config.batch_size_override),
            cache,
            collection: config.collection.clone(),
            dry_run: config.dry_run,
        })
    }

    /// Publishes `records` in adaptively-sized batches, deduplicating
    /// against the remote cache and repopulating it first if stale.
    pub async fn publish(
        &mut self,
        records: Vec<PlayRecord>,
        cancel: &CancelSignal,
    ) -> PublisherResult<PublishOutcome> {
        if self.cache.needs_population() {
            log::info!("remote record cache stale or empty, repopulating");
            self.cache.populate(&self.pds_client).await?;
        }

        let mut outcome = PublishOutcome::default();
        let mut seen_this_run: HashSet<RecordKey> = HashSet::new();
        let mut pending: Vec<PlayRecord> = Vec::with_capacity(records.len());

        for record in records {
            let key = RecordKey::from_play_record(&record);
            if self.cache.contains(&key) || seen_this_run.contains(&key) {
                outcome.skipped_duplicates += 1;
                continue;
            }
            seen_this_run.insert(key);
            pending.push(record);
        }

        let mut cursor = 0;
        while cursor < pending.len() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                outcome.untried = pending.len() - cursor;
                break;
            }

            let batch_size = (self.sizer.current() as usize).min(pending.len() - cursor);
            let batch = &pending[cursor..cursor + batch_size];

            if let Some(wait) = self.wait_for_permit(batch.len(), cancel).await {
                if wait {
                    outcome.cancelled = true;
                    outcome.untried = pending.len() - cursor;
                    break;
                }
            }

            let start = std::time::Instant::now();
            let result = self.send_batch(batch).await;
            let latency_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    self.sizer.record_outcome(latency_ms, true);
                    self.governor.record_pacing_outcome(false);
                    outcome.success_count += batch.len();
                    cursor += batch_size;
                }
                Err(PublisherError::RateLimited { retry_after_secs }) => {
                    self.governor.observe_rate_limited(retry_after_secs).await?;
                    // Batch not advanced: the same records are retried
                    // once the governor's next permit check passes. Not
                    // folded into the sizer, since a 429 reflects quota
                    // pressure, not slow/failing service.
                }
                Err(e) if e.is_authentication() => {
                    log::error!("authentication failed, stopping publisher: {e}");
                    outcome.auth_failed = true;
                    outcome.error_count += pending.len() - cursor;
                    break;
                }
                Err(e) => {
                    log::warn!("batch of {} records failed: {e}", batch.len());
                    self.sizer.record_outcome(latency_ms, false);
                    outcome.error_count += batch.len();
                    cursor += batch_size;
                }
            }
        }

        Ok(outcome)
    }

    /// Returns `Some(true)` if the caller should treat this as a
    /// cancellation, `Some(false)`/`None` if it's fine to proceed.
    async fn wait_for_permit(&self, batch_len: usize, cancel: &CancelSignal) -> Option<bool> {
        let cost = batch_len as u64 * crate::governor::CREATE_OP_COST;
        match self.governor.acquire(cost).await {
            Permit::Granted => None,
            Permit::Wait(duration) => {
                if cancel.is_forced() {
                    return Some(true);
                }
                tokio::select! {
                    _ = tokio::time::sleep(duration) => None,
                    _ = cancel.cancelled() => Some(cancel.is_forced()),
                }
            }
        }
    }

    async fn send_batch(&mut self, batch: &[PlayRecord]) -> PublisherResult<()> {
        if self.dry_run {
            log::info!("dry run: would publish {} records", batch.len());
            return Ok(());
        }

        let mut tids = Vec::with_capacity(batch.len());
        for record in batch {
            tids.push(self.tid_clock.next_from_time(record.played_time).await?.to_str());
        }

        let collection = self.collection.clone();
        let response = with_retry("applyWrites", || {
            self.pds_client.apply_writes(&collection, &tids, batch)
        })
        .await?;

        self.governor.observe_headers(&response.headers).await?;

        for record in batch {
            let key = RecordKey::from_play_record(record);
            self.cache.insert(key).await?;
        }

        Ok(())
    }
}
