use std::{io::Cursor, sync::Arc};

use tracing::{debug, warn};

use crate::{
    ApiRequest, ApiResponse as _, CredentialStore, Error, HttpTransport, Profile, SessionManager,
    card::{Card, GetCard, QueryCard, Row},
};

/// How often a request is attempted when the API rejects the session.
///
/// Only authorization failures are retried, and only after the session has
/// been refreshed. There is no backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub const NONE: RetryPolicy = RetryPolicy { max_attempts: 1 };

    fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

/// A client for the BI tool's API that keeps itself authenticated.
pub struct ApiClient {
    profile: Arc<Profile>,
    transport: Arc<dyn HttpTransport>,
    session: SessionManager,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("profile", &self.profile)
            .field("session", &self.session)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a client. Session tokens are cached in `store`.
    pub fn new(
        profile: Profile,
        transport: impl HttpTransport + 'static,
        store: impl CredentialStore + 'static,
    ) -> Self {
        let profile = Arc::new(profile);
        let transport: Arc<dyn HttpTransport> = Arc::new(transport);
        let session = SessionManager::new(profile.clone(), transport.clone(), Arc::new(store));

        Self {
            profile,
            transport,
            session,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    /// The profile this client was created with.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// The session manager backing this client.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Send an authorized request and parse the response.
    ///
    /// If the API answers 401, the session is refreshed and the request is
    /// sent again, up to the limit of the retry policy. Any other error is
    /// returned as-is.
    pub fn request<R: ApiRequest>(&self, req: &R) -> Result<R::Response, Error> {
        let mut attempts = 0;
        loop {
            let token = self.session.acquire(attempts > 0)?;
            let http_req = req.build_request(&self.profile, Some(&token))?;
            debug!(
                method = %http_req.method(),
                uri = %http_req.uri(),
                attempt = attempts + 1,
                "api request"
            );

            let resp = self.transport.execute(http_req).map_err(Error::Transport)?;
            attempts += 1;

            if resp.status() == http::StatusCode::UNAUTHORIZED {
                if self.retry.allows_another(attempts) {
                    warn!(attempt = attempts, "session rejected, refreshing");
                    continue;
                }

                return Err(Error::UnauthorizedRetryExhausted { attempts });
            }

            return Ok(R::Response::from_response(resp.map(Cursor::new))?);
        }
    }

    /// Fetch a card's metadata.
    pub fn get_card(&self, card_id: u64) -> Result<Card, Error> {
        self.request(&GetCard { card_id })
    }

    /// Run a card and return its rows, keyed by column display name.
    /// `parameters` is the JSON-serialized parameter list, if any.
    pub fn query_card(&self, card_id: u64, parameters: Option<&str>) -> Result<Vec<Row>, Error> {
        self.request(&QueryCard {
            card_id,
            parameters,
        })
    }
}
