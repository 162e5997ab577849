//! Record identifier clock (§4.A, component A).
//!
//! Generates 13-character TIDs that encode a microsecond timestamp and a
//! clock identifier, strictly monotonic across process restarts and
//! robust against out-of-order input. The monotonicity guard lives behind
//! a `parking_lot::Mutex` critical section.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PublisherResult;
use crate::state_dir::StateDirProvider;

/// Custom base32 alphabet used by TIDs (no padding, sortable byte order).
const TID_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

/// TIDs are always exactly this many characters.
const TID_LEN: usize = 13;

/// Number of bits reserved for the clock identifier in the low end of the
/// 64-bit encoded value.
const CLOCK_ID_BITS: u32 = 10;
const CLOCK_ID_MASK: u64 = (1 << CLOCK_ID_BITS) - 1;

/// A parsed/generated Timestamp Identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(u64);

impl Tid {
    /// Encodes a microsecond timestamp and clock id into a `Tid`.
    fn encode(micros: u64, clock_id: u64) -> Self {
        Self((micros << CLOCK_ID_BITS) | (clock_id & CLOCK_ID_MASK))
    }

    /// Returns the 13-character base32 string form.
    pub fn to_str(self) -> String {
        let mut value = self.0;
        let mut chars = [0u8; TID_LEN];
        for slot in chars.iter_mut().rev() {
            *slot = TID_ALPHABET[(value & 0x1f) as usize];
            value >>= 5;
        }
        String::from_utf8(chars.to_vec()).expect("alphabet is ASCII")
    }

    /// Parses a 13-character base32 TID string.
    pub fn parse(s: &str) -> Result<Self, TidParseError> {
        if s.len() != TID_LEN {
            return Err(TidParseError::WrongLength(s.len()));
        }
        let mut value: u64 = 0;
        for ch in s.bytes() {
            let digit = TID_ALPHABET
                .iter()
                .position(|&c| c == ch)
                .ok_or(TidParseError::InvalidChar(ch as char))?;
            value = (value << 5) | digit as u64;
        }
        Ok(Self(value))
    }

    /// The microsecond timestamp component.
    pub fn micros(self) -> u64 {
        self.0 >> CLOCK_ID_BITS
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_str())
    }
}

/// Errors raised while parsing a TID string.
#[derive(Debug, thiserror::Error)]
pub enum TidParseError {
    #[error("TID must be {TID_LEN} characters, got {0}")]
    WrongLength(usize),
    #[error("invalid TID character: {0:?}")]
    InvalidChar(char),
}

/// Durable clock state persisted between runs so TIDs stay monotonic even
/// if the importer is killed and restarted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClockState {
    last_micros: u64,
    clock_id: u64,
}

const CLOCK_STATE_FILE: &str = "tid_clock.json";

/// Thread-safe, persistence-backed TID generator.
///
/// Holds the last-issued microsecond timestamp behind a
/// `parking_lot::Mutex` so concurrent callers never observe or emit a
/// non-monotonic TID, even when system time goes backwards.
pub struct TidClock {
    inner: Mutex<ClockState>,
    state_dir: Arc<dyn StateDirProvider>,
}

impl TidClock {
    /// Loads persisted clock state from `state_dir`, or seeds a fresh
    /// random clock id if none exists yet.
    pub async fn load(state_dir: Arc<dyn StateDirProvider>) -> PublisherResult<Self> {
        let state = match state_dir.read(CLOCK_STATE_FILE).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => ClockState {
                last_micros: 0,
                clock_id: random_clock_id(),
            },
        };
        Ok(Self {
            inner: Mutex::new(state),
            state_dir,
        })
    }

    /// Constructs a clock with a fixed clock id and no persistence,
    /// for deterministic tests and dry-run mode (§9, Open Question 1).
    pub fn with_fixed_clock_id(clock_id: u64, state_dir: Arc<dyn StateDirProvider>) -> Self {
        Self {
            inner: Mutex::new(ClockState {
                last_micros: 0,
                clock_id,
            }),
            state_dir,
        }
    }

    /// Returns the next TID for the current wall-clock instant.
    pub async fn next_now(&self) -> PublisherResult<Tid> {
        self.next_from_time(Utc::now()).await
    }

    /// Returns the next TID anchored to `time`, still guaranteed
    /// monotonic relative to every previously issued TID from this clock.
    pub async fn next_from_time(&self, time: DateTime<Utc>) -> PublisherResult<Tid> {
        let requested = time_to_micros(time);
        let (micros, clock_id, to_persist) = {
            let mut state = self.inner.lock();
            let micros = requested.max(state.last_micros + 1);
            state.last_micros = micros;
            (micros, state.clock_id, state.clone())
        };
        self.persist(&to_persist).await?;
        Ok(Tid::encode(micros, clock_id))
    }

    async fn persist(&self, state: &ClockState) -> PublisherResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        self.state_dir.write(CLOCK_STATE_FILE, &bytes).await
    }
}

fn random_clock_id() -> u64 {
    rand::thread_rng().gen_range(0..=CLOCK_ID_MASK)
}

fn time_to_micros(time: DateTime<Utc>) -> u64 {
    let unix_micros = time.timestamp_micros();
    unix_micros.max(0) as u64
}

/// Current wall-clock time in microseconds since the epoch, used as a
/// fallback when no `DateTime` is supplied.
#[allow(dead_code)]
fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_dir::InMemoryStateDir;

    fn fixed_clock() -> TidClock {
        TidClock::with_fixed_clock_id(7, Arc::new(InMemoryStateDir::new()))
    }

    #[test]
    fn tid_round_trips_through_string_form() {
        let tid = Tid::encode(1_700_000_000_000_000, 42);
        let s = tid.to_str();
        assert_eq!(s.len(), 13);
        let parsed = Tid::parse(&s).unwrap();
        assert_eq!(tid, parsed);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(matches!(Tid::parse("short"), Err(TidParseError::WrongLength(_))));
    }

    #[test]
    fn parse_rejects_invalid_characters() {
        assert!(matches!(
            Tid::parse("0000000000000"),
            Err(TidParseError::InvalidChar('0'))
        ));
    }

    #[tokio::test]
    async fn successive_tids_are_strictly_increasing() {
        let clock = fixed_clock();
        let t = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = clock.next_from_time(t).await.unwrap();
        let b = clock.next_from_time(t).await.unwrap();
        let c = clock.next_from_time(t).await.unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[tokio::test]
    async fn out_of_order_input_still_yields_monotonic_tids() {
        let clock = fixed_clock();
        let later = DateTime::parse_from_rfc3339("2024-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let earlier = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = clock.next_from_time(later).await.unwrap();
        let b = clock.next_from_time(earlier).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn clock_state_survives_reload_from_state_dir() {
        let state_dir = Arc::new(InMemoryStateDir::new());
        let t = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let first = TidClock::with_fixed_clock_id(3, state_dir.clone());
        let a = first.next_from_time(t).await.unwrap();

        let second = TidClock::load(state_dir).await.unwrap();
        let b = second.next_from_time(t).await.unwrap();
        assert!(b > a);
    }
}
