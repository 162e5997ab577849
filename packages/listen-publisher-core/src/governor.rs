//! Rate-limit governor (§4.B, component B).
//!
//! Tracks the personal data server's advertised quota from
//! `ratelimit-*`/`x-ratelimit-*` response headers, generalizing the
//! pack's provider-quota-tracker shape (header parsing into a partial
//! state, merged into a `RwLock`-guarded current state) to a single PDS
//! target instead of multiple LLM providers.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::PublisherResult;
use crate::state_dir::StateDirProvider;

/// Default safety margin applied to the server-advertised remaining
/// quota before permits are handed out, so the governor never races the
/// server's own accounting to zero. Overridable via
/// `PublisherConfig::safety_factor`/`aggressive`.
pub const DEFAULT_SAFETY_FACTOR: f64 = 0.75;

/// Safety factor used when `PublisherConfig::aggressive` is set.
pub const AGGRESSIVE_SAFETY_FACTOR: f64 = 0.85;

/// Cost in quota units of a single `applyWrites` create operation, per
/// the PDS's published write-cost model.
pub const CREATE_OP_COST: u64 = 3;

/// Floor on the pacing-mode inter-batch delay (§4.B, "cost model").
const MIN_PACING_DELAY_MS: u64 = 100;

/// Ceiling the pacing-mode delay is doubled up to on repeated 429s.
const MAX_PACING_DELAY_MS: u64 = 60_000;

/// Starting pacing-mode delay before any 429 or success has adjusted it.
const DEFAULT_PACING_DELAY_MS: u64 = 2_000;

/// Consecutive pacing-mode successes required before the delay is halved.
const SPEEDUP_THRESHOLD: u32 = 5;

const QUOTA_STATE_FILE: &str = "governor_quota.json";

/// Snapshot of the server's advertised quota window, persisted so a
/// restarted importer doesn't immediately burst past a window the
/// previous process had already consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuotaState {
    limit: Option<u64>,
    remaining: Option<u64>,
    reset_at: Option<DateTime<Utc>>,
    /// Window length in seconds, parsed from `ratelimit-policy`'s
    /// `"<limit>;w=<windowSeconds>"` format (§4.B, §6). Needed to refresh
    /// the window once `reset_at` has elapsed (permit algorithm step 1).
    window_seconds: Option<u64>,
    updated_at: DateTime<Utc>,
    /// `true` once at least one real header has been observed; while
    /// `false` the governor stays in pacing mode.
    headers_seen: bool,
}

impl Default for QuotaState {
    fn default() -> Self {
        Self {
            limit: None,
            remaining: None,
            reset_at: None,
            window_seconds: None,
            updated_at: Utc::now(),
            headers_seen: false,
        }
    }
}

/// Decision returned by [`Governor::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum Permit {
    /// The caller may proceed immediately.
    Granted,
    /// The caller should wait this long before retrying the batch.
    Wait(std::time::Duration),
}

/// Header-driven rate-limit governor.
pub struct Governor {
    state: RwLock<QuotaState>,
    state_dir: Arc<dyn StateDirProvider>,
    safety_factor: f64,
    /// Wall-clock instant the last pacing-mode permit was granted. Not
    /// persisted: it only paces batches within a single run, and a fresh
    /// process should not wait out a stale interval from a previous one.
    last_pacing_grant: RwLock<Option<DateTime<Utc>>>,
    /// Current pacing-mode inter-batch delay, adjusted by
    /// [`Governor::record_pacing_outcome`] (§4.B, "cost model").
    pacing_delay_ms: AtomicU64,
    /// Consecutive pacing-mode successes since the last adjustment.
    pacing_success_streak: AtomicU32,
}

impl Governor {
    /// Loads persisted quota state, or starts fresh in pacing mode.
    pub async fn load(state_dir: Arc<dyn StateDirProvider>, safety_factor: f64) -> PublisherResult<Self> {
        let state = match state_dir.read(QUOTA_STATE_FILE).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => QuotaState::default(),
        };
        Ok(Self {
            state: RwLock::new(state),
            state_dir,
            safety_factor,
            last_pacing_grant: RwLock::new(None),
            pacing_delay_ms: AtomicU64::new(DEFAULT_PACING_DELAY_MS),
            pacing_success_streak: AtomicU32::new(0),
        })
    }

    /// Updates tracked quota from an HTTP response's headers. Call this
    /// immediately after every PDS response, success or failure.
    pub async fn observe_headers(&self, headers: &HeaderMap) -> PublisherResult<()> {
        let partial = parse_ratelimit_headers(headers);
        if !partial.has_data() {
            return Ok(());
        }
        let snapshot = {
            let mut state = self.state.write();
            if let Some(v) = partial.limit {
                state.limit = Some(v);
            }
            if let Some(v) = partial.remaining {
                state.remaining = Some(v);
            }
            if let Some(v) = partial.reset_at {
                state.reset_at = Some(v);
            }
            if let Some(v) = partial.window_seconds {
                state.window_seconds = Some(v);
            }
            state.headers_seen = true;
            state.updated_at = Utc::now();
            state.clone()
        };
        self.persist(&snapshot).await
    }

    /// Records a 429 response's `Retry-After` value, overriding whatever
    /// the governor currently believes about remaining quota.
    pub async fn observe_rate_limited(&self, retry_after_secs: u64) -> PublisherResult<()> {
        self.record_pacing_outcome(true);
        let snapshot = {
            let mut state = self.state.write();
            state.remaining = Some(0);
            state.reset_at = Some(Utc::now() + chrono::Duration::seconds(retry_after_secs as i64));
            state.headers_seen = true;
            state.updated_at = Utc::now();
            state.clone()
        };
        self.persist(&snapshot).await
    }

    /// Adjusts the pacing-mode inter-batch delay after a batch outcome,
    /// while the server has never advertised real quota headers:
    /// doubled (up to [`MAX_PACING_DELAY_MS`]) on a 429, halved (down to
    /// [`MIN_PACING_DELAY_MS`]) after [`SPEEDUP_THRESHOLD`] consecutive
    /// successes (§4.B). A no-op once real headers have been observed,
    /// since quota-based waits govern cadence from then on.
    pub fn record_pacing_outcome(&self, rate_limited: bool) {
        if self.state.read().headers_seen {
            return;
        }
        if rate_limited {
            self.pacing_success_streak.store(0, Ordering::SeqCst);
            self.pacing_delay_ms
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                    Some((d * 2).min(MAX_PACING_DELAY_MS))
                })
                .ok();
        } else {
            let streak = self.pacing_success_streak.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= SPEEDUP_THRESHOLD {
                self.pacing_success_streak.store(0, Ordering::SeqCst);
                self.pacing_delay_ms
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                        Some((d / 2).max(MIN_PACING_DELAY_MS))
                    })
                    .ok();
            }
        }
    }

    /// Decides whether a batch costing `cost` quota units may proceed
    /// right now (§4.B, "permit algorithm"). On a grant, pre-decrements
    /// `remaining` and persists the result immediately (step 3); if the
    /// window has elapsed, `remaining` is first refreshed to `limit` and
    /// `reset_at` pushed out by `window_seconds` (step 1).
    pub async fn acquire(&self, cost: u64) -> Permit {
        let now = Utc::now();
        let decision = {
            let mut state = self.state.write();

            if !state.headers_seen {
                None
            } else {
                if let Some(reset_at) = state.reset_at {
                    if now >= reset_at {
                        if let Some(limit) = state.limit {
                            state.remaining = Some(limit);
                        }
                        if let Some(window_seconds) = state.window_seconds {
                            state.reset_at = Some(now + chrono::Duration::seconds(window_seconds as i64));
                        }
                    }
                }

                match (state.remaining, state.reset_at) {
                    (Some(remaining), Some(reset_at)) => {
                        let safe_remaining = (remaining as f64 * self.safety_factor) as u64;
                        if cost <= safe_remaining {
                            state.remaining = Some(remaining - cost);
                            state.updated_at = now;
                            Some((Permit::Granted, Some(state.clone())))
                        } else {
                            let wait = (reset_at - now)
                                .to_std()
                                .unwrap_or(std::time::Duration::ZERO);
                            Some((Permit::Wait(wait), None))
                        }
                    }
                    _ => Some((Permit::Granted, None)),
                }
            }
        };

        match decision {
            Some((permit, Some(snapshot))) => {
                if let Err(e) = self.persist(&snapshot).await {
                    log::warn!("failed to persist quota state after acquire: {e}");
                }
                permit
            }
            Some((permit, None)) => permit,
            None => self.pacing_mode_permit(),
        }
    }

    /// No headers ever observed: space batches out by the adaptive
    /// pacing delay rather than bursting. The very first call always
    /// grants immediately — there is no prior batch to pace against.
    fn pacing_mode_permit(&self) -> Permit {
        let now = Utc::now();
        let delay = Duration::from_millis(self.pacing_delay_ms.load(Ordering::SeqCst));
        let mut last_grant = self.last_pacing_grant.write();
        match *last_grant {
            None => {
                *last_grant = Some(now);
                Permit::Granted
            }
            Some(prev) => {
                let elapsed = (now - prev).to_std().unwrap_or_default();
                if elapsed >= delay {
                    *last_grant = Some(now);
                    Permit::Granted
                } else {
                    Permit::Wait(delay - elapsed)
                }
            }
        }
    }

    async fn persist(&self, state: &QuotaState) -> PublisherResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        self.state_dir.write(QUOTA_STATE_FILE, &bytes).await
    }
}

#[derive(Debug, Default)]
struct PartialQuota {
    limit: Option<u64>,
    remaining: Option<u64>,
    reset_at: Option<DateTime<Utc>>,
    window_seconds: Option<u64>,
}

impl PartialQuota {
    fn has_data(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some() || self.reset_at.is_some() || self.window_seconds.is_some()
    }
}

/// Parses `ratelimit-limit` / `ratelimit-remaining` / `ratelimit-reset` /
/// `ratelimit-policy` headers, falling back to the `x-ratelimit-*`
/// variants, matching both case-insensitively (§4.B, §6).
fn parse_ratelimit_headers(headers: &HeaderMap) -> PartialQuota {
    PartialQuota {
        limit: header_u64(headers, "ratelimit-limit").or_else(|| header_u64(headers, "x-ratelimit-limit")),
        remaining: header_u64(headers, "ratelimit-remaining")
            .or_else(|| header_u64(headers, "x-ratelimit-remaining")),
        reset_at: header_reset(headers, "ratelimit-reset")
            .or_else(|| header_reset(headers, "x-ratelimit-reset")),
        window_seconds: header_policy_window(headers, "ratelimit-policy")
            .or_else(|| header_policy_window(headers, "x-ratelimit-policy")),
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok())
}

/// Parses the `w=<windowSeconds>` component of a `"<limit>;w=<windowSeconds>"`
/// policy header value (§4.B, §6).
fn header_policy_window(headers: &HeaderMap, name: &str) -> Option<u64> {
    let value = headers.get(name).and_then(|v| v.to_str().ok())?;
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("w="))
        .and_then(|w| w.parse().ok())
}

/// `ratelimit-reset` is specified as seconds-until-reset, not an
/// absolute timestamp, unlike the LLM-provider headers this module's
/// parsing style is grounded on.
fn header_reset(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    let seconds: i64 = headers.get(name).and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok())?;
    Some(Utc::now() + chrono::Duration::seconds(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_dir::InMemoryStateDir;
    use reqwest::header::{HeaderName, HeaderValue};
    use std::str::FromStr;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(HeaderName::from_str(k).unwrap(), HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    #[tokio::test]
    async fn grants_permit_before_any_headers_seen_within_pacing_interval() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        assert_eq!(governor.acquire(CREATE_OP_COST).await, Permit::Granted);
    }

    #[tokio::test]
    async fn second_pacing_acquire_within_the_delay_window_waits() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        assert_eq!(governor.acquire(CREATE_OP_COST).await, Permit::Granted);
        assert!(matches!(governor.acquire(CREATE_OP_COST).await, Permit::Wait(_)));
    }

    #[tokio::test]
    async fn pacing_delay_doubles_on_429_and_halves_after_speedup_threshold() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        assert_eq!(governor.pacing_delay_ms.load(Ordering::SeqCst), DEFAULT_PACING_DELAY_MS);

        governor.record_pacing_outcome(true);
        assert_eq!(governor.pacing_delay_ms.load(Ordering::SeqCst), DEFAULT_PACING_DELAY_MS * 2);

        for _ in 0..SPEEDUP_THRESHOLD {
            governor.record_pacing_outcome(false);
        }
        assert_eq!(governor.pacing_delay_ms.load(Ordering::SeqCst), DEFAULT_PACING_DELAY_MS);
    }

    #[tokio::test]
    async fn pacing_delay_never_exceeds_the_ceiling() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        for _ in 0..20 {
            governor.record_pacing_outcome(true);
        }
        assert_eq!(governor.pacing_delay_ms.load(Ordering::SeqCst), MAX_PACING_DELAY_MS);
    }

    #[tokio::test]
    async fn pacing_outcome_is_a_no_op_once_headers_have_been_observed() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        let headers = headers_with(&[
            ("ratelimit-limit", "3000"),
            ("ratelimit-remaining", "2000"),
            ("ratelimit-reset", "3600"),
        ]);
        governor.observe_headers(&headers).await.unwrap();
        governor.record_pacing_outcome(true);
        assert_eq!(governor.pacing_delay_ms.load(Ordering::SeqCst), DEFAULT_PACING_DELAY_MS);
    }

    #[tokio::test]
    async fn grants_permit_when_remaining_comfortably_above_cost() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        let headers = headers_with(&[
            ("ratelimit-limit", "3000"),
            ("ratelimit-remaining", "2000"),
            ("ratelimit-reset", "3600"),
        ]);
        governor.observe_headers(&headers).await.unwrap();
        assert_eq!(governor.acquire(CREATE_OP_COST).await, Permit::Granted);
    }

    #[tokio::test]
    async fn waits_when_remaining_below_safety_margin() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        let headers = headers_with(&[
            ("ratelimit-limit", "3000"),
            ("ratelimit-remaining", "1"),
            ("ratelimit-reset", "120"),
        ]);
        governor.observe_headers(&headers).await.unwrap();
        assert!(matches!(governor.acquire(CREATE_OP_COST).await, Permit::Wait(_)));
    }

    #[tokio::test]
    async fn x_prefixed_headers_are_recognized() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        let headers = headers_with(&[
            ("x-ratelimit-limit", "3000"),
            ("x-ratelimit-remaining", "2000"),
            ("x-ratelimit-reset", "3600"),
        ]);
        governor.observe_headers(&headers).await.unwrap();
        assert_eq!(governor.acquire(CREATE_OP_COST).await, Permit::Granted);
    }

    #[tokio::test]
    async fn rate_limited_response_forces_a_wait() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        governor.observe_rate_limited(30).await.unwrap();
        assert!(matches!(governor.acquire(CREATE_OP_COST).await, Permit::Wait(_)));
    }

    #[tokio::test]
    async fn quota_state_persists_across_governor_reload() {
        let state_dir = Arc::new(InMemoryStateDir::new());
        let first = Governor::load(state_dir.clone(), DEFAULT_SAFETY_FACTOR).await.unwrap();
        first.observe_rate_limited(600).await.unwrap();

        let second = Governor::load(state_dir, DEFAULT_SAFETY_FACTOR).await.unwrap();
        assert!(matches!(second.acquire(CREATE_OP_COST).await, Permit::Wait(_)));
    }

    #[test]
    fn parses_window_seconds_from_policy_header() {
        let headers = headers_with(&[("ratelimit-policy", "3000;w=3600")]);
        let partial = parse_ratelimit_headers(&headers);
        assert_eq!(partial.window_seconds, Some(3600));
    }

    #[test]
    fn parses_window_seconds_from_x_prefixed_policy_header() {
        let headers = headers_with(&[("x-ratelimit-policy", "3000;w=60")]);
        let partial = parse_ratelimit_headers(&headers);
        assert_eq!(partial.window_seconds, Some(60));
    }

    #[tokio::test]
    async fn acquire_pre_decrements_remaining_on_grant_and_persists_it() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        let headers = headers_with(&[
            ("ratelimit-limit", "3000"),
            ("ratelimit-remaining", "2000"),
            ("ratelimit-reset", "3600"),
        ]);
        governor.observe_headers(&headers).await.unwrap();

        assert_eq!(governor.acquire(CREATE_OP_COST).await, Permit::Granted);
        assert_eq!(governor.state.read().remaining, Some(2000 - CREATE_OP_COST));

        assert_eq!(governor.acquire(CREATE_OP_COST).await, Permit::Granted);
        assert_eq!(governor.state.read().remaining, Some(2000 - 2 * CREATE_OP_COST));
    }

    #[tokio::test]
    async fn window_refreshes_remaining_to_limit_once_reset_has_elapsed() {
        let governor = Governor::load(Arc::new(InMemoryStateDir::new()), DEFAULT_SAFETY_FACTOR).await.unwrap();
        let headers = headers_with(&[
            ("ratelimit-limit", "3000"),
            ("ratelimit-remaining", "0"),
            ("ratelimit-reset", "-5"),
            ("ratelimit-policy", "3000;w=3600"),
        ]);
        governor.observe_headers(&headers).await.unwrap();

        assert_eq!(governor.acquire(CREATE_OP_COST).await, Permit::Granted);
        let state = governor.state.read();
        assert_eq!(state.remaining, Some(3000 - CREATE_OP_COST));
        assert!(state.reset_at.unwrap() > Utc::now());
    }
}
