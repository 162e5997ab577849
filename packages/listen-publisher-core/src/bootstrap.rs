//! Application bootstrap and dependency wiring.
//!
//! This module is the composition root — the single place where the
//! publisher and its collaborators are instantiated and wired together.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::cancel::CancelSignal;
use crate::config::PublisherConfig;
use crate::error::PublisherResult;
use crate::publisher::Publisher;
use crate::session::AuthSession;
use crate::state_dir::{FilesystemStateDir, StateDirProvider};

/// Default per-request HTTP timeout for the shared client. Individual
/// calls further narrow this via the retry engine's per-class timeouts.
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Container for the bootstrapped publisher and its shutdown handle.
pub struct BootstrappedPublisher {
    pub publisher: Publisher,
    pub cancel: CancelSignal,
}

/// Creates the shared HTTP client used for all PDS communication.
///
/// A single client is reused across the run for connection pooling.
fn create_http_client() -> Client {
    Client::builder()
        .timeout(HTTP_CLIENT_TIMEOUT)
        .build()
        .expect("failed to build HTTP client")
}

/// Bootstraps a [`Publisher`] ready to run against `session`'s account.
///
/// Wiring order:
/// 1. Shared HTTP client
/// 2. Filesystem-backed state directory, namespaced by account DID
/// 3. Cancellation signal
/// 4. The publisher itself, which loads components A–E from that state
///    directory
pub async fn bootstrap_publisher(
    session: AuthSession,
    config: &PublisherConfig,
    pending_records: usize,
) -> PublisherResult<BootstrappedPublisher> {
    let http_client = create_http_client();
    let state_dir: Arc<dyn StateDirProvider> = Arc::new(FilesystemStateDir::new(
        config.account_state_dir(&session.account_did),
    ));
    let cancel = CancelSignal::new();

    let publisher = Publisher::load(session, config, http_client, state_dir, pending_records).await?;

    Ok(BootstrappedPublisher { publisher, cancel })
}
