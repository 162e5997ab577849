//! Authenticated session against a personal data server (§6.A).
//!
//! Resolving an identity to a PDS endpoint and performing the OAuth or
//! app-password handshake are both out of scope for this crate; callers
//! hand in an [`AuthSession`] already populated with a working access
//! token, caller-supplied rather than discovered.

/// An authenticated session against one account's personal data server.
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// The account's decentralized identifier (e.g. `did:plc:abc123`).
    pub account_did: String,
    /// Base URL of the account's personal data server
    /// (e.g. `https://bsky.social`).
    pub pds_endpoint: String,
    /// Bearer token presented on every request.
    pub access_token: String,
}

impl AuthSession {
    /// Constructs a session from already-resolved credentials.
    pub fn new(
        account_did: impl Into<String>,
        pds_endpoint: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            account_did: account_did.into(),
            pds_endpoint: pds_endpoint.into(),
            access_token: access_token.into(),
        }
    }
}
