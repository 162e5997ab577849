//! Canonical data model shared by every component of the publisher.
//!
//! [`PlayRecord`] is the unit of work the publisher consumes; [`RecordKey`]
//! is the deduplication fingerprint derived from it. Both are intentionally
//! free of any transport or persistence concerns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved separator used when joining [`RecordKey`] components.
///
/// Chosen because it cannot appear in a lowercased-trimmed artist/track name
/// or an RFC 3339 timestamp, so the joined string round-trips unambiguously.
const RECORD_KEY_SEPARATOR: char = '\u{1f}';

/// A single artist credit on a [`PlayRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    /// Display name as provided by the source.
    pub name: String,
    /// Optional external music-database identifier (e.g. MusicBrainz artist ID).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_id: Option<String>,
}

impl Artist {
    /// Creates an artist credit with no external identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            external_id: None,
        }
    }
}

/// A canonicalized play event, already normalized from whatever source
/// format it came from (scrobble CSV export, streaming-service JSON dump).
///
/// Parsing those source formats is out of scope for this crate; callers are
/// expected to have already produced a `Vec<PlayRecord>`, sorted in the
/// order they want published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayRecord {
    /// Opaque schema tag identifying the target collection (e.g.
    /// `"fm.teal.alpha.feed.play"`).
    pub schema_tag: String,
    /// Track name. Substitute `"Unknown Track"` at canonicalization time if
    /// the source omitted it — this crate assumes the field is never empty.
    pub track_name: String,
    /// Ordered list of artist credits. The first entry is used as the
    /// dedup anchor in [`RecordKey::from_play_record`].
    pub artists: Vec<Artist>,
    /// The instant the track was played. This is the record's identity
    /// anchor: it drives both the TID and the dedup key.
    pub played_time: DateTime<Utc>,
    /// Client agent string (e.g. `"web (Spotify)"`).
    pub client_agent: String,
    /// Base domain of the originating music service (e.g. `"spotify.com"`).
    pub origin_domain: String,
    /// Full origin URL for the play, if the source provided one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub origin_url: Option<String>,
    /// Release (album) name, if known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub release_name: Option<String>,
    /// External release identifier, if known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub release_mbid: Option<String>,
    /// External recording identifier, if known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub recording_mbid: Option<String>,
}

impl PlayRecord {
    /// The name substituted by canonicalization when a source record had no
    /// track title. Exposed so callers performing their own canonicalization
    /// stay consistent with this crate's expectations.
    pub const UNKNOWN_TRACK: &'static str = "Unknown Track";

    /// Returns the first artist's name, or `None` if the record has no
    /// artist credits at all (malformed input; the publisher still assigns
    /// a `RecordKey`, just with an empty first-artist component).
    pub fn first_artist_name(&self) -> Option<&str> {
        self.artists.first().map(|a| a.name.as_str())
    }
}

/// The local deduplication fingerprint for a [`PlayRecord`] (§3, `RecordKey`).
///
/// Two records collide iff first-artist name, track name, and played-time
/// all match after normalization. This is deliberately lossy: two listens
/// at the exact same ISO timestamp are considered the same play.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(String);

impl RecordKey {
    /// Derives a `RecordKey` from a canonical [`PlayRecord`].
    pub fn from_play_record(record: &PlayRecord) -> Self {
        let artist = record.first_artist_name().unwrap_or_default();
        Self::from_parts(artist, &record.track_name, &record.played_time)
    }

    /// Derives a `RecordKey` from a remote record's own value (§4.E
    /// population), so cache keys computed from local and remote records
    /// are directly comparable.
    pub fn from_parts(artist_name: &str, track_name: &str, played_time: &DateTime<Utc>) -> Self {
        let artist = normalize(artist_name);
        let track = normalize(track_name);
        let played_time = played_time.to_rfc3339();
        Self(format!(
            "{artist}{sep}{track}{sep}{played_time}",
            sep = RECORD_KEY_SEPARATOR
        ))
    }

    /// Returns the key's raw string form, e.g. for use as a map key in
    /// serialized cache files.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn played_at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn sample_record(artist: &str, track: &str, played_time: DateTime<Utc>) -> PlayRecord {
        PlayRecord {
            schema_tag: "fm.teal.alpha.feed.play".to_string(),
            track_name: track.to_string(),
            artists: vec![Artist::new(artist)],
            played_time,
            client_agent: "test-agent".to_string(),
            origin_domain: "example.com".to_string(),
            origin_url: None,
            release_name: None,
            release_mbid: None,
            recording_mbid: None,
        }
    }

    #[test]
    fn record_key_is_stable_across_case_and_whitespace() {
        let t = played_at("2021-06-15T20:00:00Z");
        let a = sample_record("  Daft Punk ", "One More Time", t);
        let b = sample_record("daft punk", "one more time", t);
        assert_eq!(
            RecordKey::from_play_record(&a),
            RecordKey::from_play_record(&b)
        );
    }

    #[test]
    fn record_key_differs_on_played_time() {
        let a = sample_record("Daft Punk", "One More Time", played_at("2021-06-15T20:00:00Z"));
        let b = sample_record("Daft Punk", "One More Time", played_at("2021-06-15T20:00:01Z"));
        assert_ne!(
            RecordKey::from_play_record(&a),
            RecordKey::from_play_record(&b)
        );
    }

    #[test]
    fn record_key_from_parts_matches_from_play_record() {
        let t = played_at("2021-06-15T20:00:00Z");
        let record = sample_record("Daft Punk", "One More Time", t);
        let from_record = RecordKey::from_play_record(&record);
        let from_parts = RecordKey::from_parts("Daft Punk", "One More Time", &t);
        assert_eq!(from_record, from_parts);
    }

    #[test]
    fn missing_artist_still_produces_a_key() {
        let t = played_at("2021-06-15T20:00:00Z");
        let record = PlayRecord {
            artists: vec![],
            ..sample_record("unused", "Solo Track", t)
        };
        let key = RecordKey::from_play_record(&record);
        assert!(key.as_str().starts_with('\u{1f}'));
    }

    #[test]
    fn timezone_normalizes_to_same_instant() {
        let t1 = Utc.with_ymd_and_hms(2021, 6, 15, 20, 0, 0).unwrap();
        let t2 = DateTime::parse_from_rfc3339("2021-06-15T21:00:00+01:00")
            .unwrap()
            .with_timezone(&Utc);
        let a = sample_record("Daft Punk", "One More Time", t1);
        let b = sample_record("Daft Punk", "One More Time", t2);
        assert_eq!(
            RecordKey::from_play_record(&a),
            RecordKey::from_play_record(&b)
        );
    }
}
