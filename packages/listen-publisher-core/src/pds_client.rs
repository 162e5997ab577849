//! HTTP transport to a personal data server (§6.A, §4.E population).
//!
//! Same request lifecycle throughout: build request, time it, log
//! status, classify the response — applied to the PDS's two JSON
//! endpoints this crate needs: `com.atproto.repo.applyWrites` for
//! publishing and `com.atproto.repo.listRecords` for populating the
//! remote record cache.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::error::PublisherError;
use crate::model::PlayRecord;
use crate::session::AuthSession;

const APPLY_WRITES_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_RECORDS_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of a single `applyWrites` call: the headers the governor
/// needs to observe. The write-lexicon's `rkey` is already known to the
/// caller (it supplies it as the TID), so the response body carries
/// nothing further of interest (§9, Open Question 3).
pub struct ApplyWritesResponse {
    pub headers: reqwest::header::HeaderMap,
}

/// One page of a `listRecords` enumeration.
pub struct ListRecordsPage {
    pub records: Vec<RemoteRecord>,
    pub cursor: Option<String>,
    pub headers: reqwest::header::HeaderMap,
}

/// A record as returned by `listRecords`, with just enough shape to
/// compute a [`crate::model::RecordKey`] without deserializing the full
/// lexicon schema.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRecord {
    pub uri: String,
    pub cid: String,
    pub value: Value,
}

/// Seam over the two PDS calls the publisher needs, so tests can inject
/// an in-memory fake instead of driving `wiremock` for every scenario.
#[async_trait]
pub trait RecordLister: Send + Sync {
    async fn list_records(
        &self,
        collection: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ListRecordsPage, PublisherError>;
}

/// reqwest-backed client for one account's personal data server.
#[derive(Clone)]
pub struct PdsClient {
    http: Client,
    session: AuthSession,
}

impl PdsClient {
    pub fn new(http: Client, session: AuthSession) -> Self {
        Self { http, session }
    }

    /// Submits a batch of [`PlayRecord`]s as a single
    /// `com.atproto.repo.applyWrites` call, all-or-nothing (§9, Open
    /// Question 3: partial-batch success is not modeled).
    pub async fn apply_writes(
        &self,
        collection: &str,
        tids: &[String],
        records: &[PlayRecord],
    ) -> Result<ApplyWritesResponse, PublisherError> {
        debug_assert_eq!(tids.len(), records.len());

        let writes: Vec<Value> = tids
            .iter()
            .zip(records.iter())
            .map(|(tid, record)| {
                serde_json::json!({
                    "$type": "com.atproto.repo.applyWrites#create",
                    "collection": collection,
                    "rkey": tid,
                    "value": to_record_value(collection, record),
                })
            })
            .collect();

        let body = serde_json::json!({
            "repo": self.session.account_did,
            "validate": true,
            "writes": writes,
        });

        let url = format!(
            "{}/xrpc/com.atproto.repo.applyWrites",
            self.session.pds_endpoint
        );

        log::info!("applyWrites -> {url} ({} records)", records.len());
        let start = std::time::Instant::now();

        let res = self
            .http
            .post(&url)
            .bearer_auth(&self.session.access_token)
            .json(&body)
            .timeout(APPLY_WRITES_TIMEOUT)
            .send()
            .await
            .map_err(PublisherError::from_reqwest)?;

        log::info!("applyWrites completed in {:?}: {}", start.elapsed(), res.status());

        let status = res.status();
        let headers = res.headers().clone();

        if status.as_u16() == 429 {
            return Err(PublisherError::RateLimited {
                retry_after_secs: rate_limit_wait_secs(&headers),
            });
        }
        if !status.is_success() {
            let body_text = res.text().await.unwrap_or_default();
            return Err(PublisherError::from_status(status.as_u16(), body_text));
        }

        Ok(ApplyWritesResponse { headers })
    }
}

#[async_trait]
impl RecordLister for PdsClient {
    async fn list_records(
        &self,
        collection: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ListRecordsPage, PublisherError> {
        let mut url = format!(
            "{}/xrpc/com.atproto.repo.listRecords?repo={}&collection={collection}&limit={limit}",
            self.session.pds_endpoint, self.session.account_did
        );
        if let Some(cursor) = cursor {
            url.push_str(&format!("&cursor={cursor}"));
        }

        let res = self
            .http
            .get(&url)
            .timeout(LIST_RECORDS_TIMEOUT)
            .send()
            .await
            .map_err(PublisherError::from_reqwest)?;

        let status = res.status();
        let headers = res.headers().clone();

        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(PublisherError::from_status(status.as_u16(), body));
        }

        let parsed: ListRecordsBody = res.json().await.map_err(PublisherError::from_reqwest)?;
        Ok(ListRecordsPage {
            records: parsed.records,
            cursor: parsed.cursor,
            headers,
        })
    }
}

/// Computes how long to wait before retrying a batch rejected with 429,
/// from the `ratelimit-reset`/`x-ratelimit-reset` header (§4.B, "429
/// response"): the advertised seconds until the window resets, plus a
/// small safety buffer. Falls back to a conservative 60s when the
/// server sent no such header.
fn rate_limit_wait_secs(headers: &reqwest::header::HeaderMap) -> u64 {
    const FALLBACK_WAIT_SECS: u64 = 60;
    const SAFETY_BUFFER_SECS: u64 = 2;

    headers
        .get("ratelimit-reset")
        .or_else(|| headers.get("x-ratelimit-reset"))
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| secs + SAFETY_BUFFER_SECS)
        .unwrap_or(FALLBACK_WAIT_SECS)
}

fn to_record_value(collection: &str, record: &PlayRecord) -> Value {
    let artists: Vec<Value> = record
        .artists
        .iter()
        .map(|a| {
            serde_json::json!({
                "name": a.name,
                "externalId": a.external_id,
            })
        })
        .collect();

    serde_json::json!({
        "$type": collection,
        "trackName": record.track_name,
        "artists": artists,
        "playedTime": record.played_time.to_rfc3339(),
        "clientAgent": record.client_agent,
        "originDomain": record.origin_domain,
        "originUrl": record.origin_url,
        "releaseName": record.release_name,
        "releaseMbId": record.release_mbid,
        "recordingMbId": record.recording_mbid,
    })
}

#[derive(Deserialize)]
struct ListRecordsBody {
    records: Vec<RemoteRecord>,
    cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::model::Artist;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_record() -> PlayRecord {
        PlayRecord {
            schema_tag: "fm.teal.alpha.feed.play".to_string(),
            track_name: "One More Time".to_string(),
            artists: vec![Artist::new("Daft Punk")],
            played_time: Utc::now(),
            client_agent: "test".to_string(),
            origin_domain: "example.com".to_string(),
            origin_url: None,
            release_name: None,
            release_mbid: None,
            recording_mbid: None,
        }
    }

    #[tokio::test]
    async fn apply_writes_returns_response_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.applyWrites"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ratelimit-remaining", "99")
                    .set_body_json(serde_json::json!({
                        "results": [{"uri": "at://did:plc:abc/fm.teal.alpha.feed.play/3k2abcd"}]
                    })),
            )
            .mount(&server)
            .await;

        let session = AuthSession::new("did:plc:abc", server.uri(), "token");
        let client = PdsClient::new(Client::new(), session);
        let response = client
            .apply_writes("fm.teal.alpha.feed.play", &["3k2abcd".to_string()], &[sample_record()])
            .await
            .unwrap();

        assert_eq!(response.headers.get("ratelimit-remaining").unwrap(), "99");
    }

    #[tokio::test]
    async fn apply_writes_carries_each_artist_external_id_into_the_record_value() {
        let mut record = sample_record();
        record.artists = vec![
            Artist {
                name: "Daft Punk".to_string(),
                external_id: Some("mbid-056e4f3e".to_string()),
            },
            Artist::new("Uncredited Collaborator"),
        ];

        let value = to_record_value("fm.teal.alpha.feed.play", &record);
        let artists = value["artists"].as_array().unwrap();
        assert_eq!(artists[0]["name"], "Daft Punk");
        assert_eq!(artists[0]["externalId"], "mbid-056e4f3e");
        assert_eq!(artists[1]["name"], "Uncredited Collaborator");
        assert!(artists[1]["externalId"].is_null());
    }

    #[tokio::test]
    async fn apply_writes_classifies_429_as_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.applyWrites"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let session = AuthSession::new("did:plc:abc", server.uri(), "token");
        let client = PdsClient::new(Client::new(), session);
        let err = client
            .apply_writes("fm.teal.alpha.feed.play", &["3k2abcd".to_string()], &[sample_record()])
            .await
            .unwrap_err();
        assert!(matches!(err, PublisherError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn list_records_paginates_via_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.listRecords"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "records": [],
                "cursor": "next-page"
            })))
            .mount(&server)
            .await;

        let session = AuthSession::new("did:plc:abc", server.uri(), "token");
        let client = PdsClient::new(Client::new(), session);
        let page = client
            .list_records("fm.teal.alpha.feed.play", None, 100)
            .await
            .unwrap();
        assert_eq!(page.cursor.as_deref(), Some("next-page"));
    }
}
