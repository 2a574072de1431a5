//! Acquisition and caching of session tokens.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time,
};

use tracing::{debug, info, warn};

use crate::{
    ApiResponse as _, CredentialStore, Error, HttpTransport, Profile,
    api::{
        ApiRequest as _,
        auth::{CreateSession, Session},
    },
};

/// How long a cached session token is trusted. The server may invalidate it
/// earlier, which is discovered through a 401.
pub const SESSION_TTL: time::Duration = time::Duration::from_secs(14 * 24 * 3600);

/// The cache key for the session of a given user on a given endpoint. The
/// password is deliberately not part of the key.
pub fn session_cache_key(username: &str, api_endpoint: &str) -> String {
    let id = format!("{username}-{api_endpoint}-sessionId");
    format!("{:x}", md5::compute(id.as_bytes()))
}

/// Owns the session token for one set of credentials.
///
/// The token is looked up in memory first, then in the credential store, and
/// only then exchanged for fresh credentials. There is no locking around the
/// exchange, so concurrent callers may each open a session; the last one
/// stored wins.
pub struct SessionManager {
    profile: Arc<Profile>,
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn CredentialStore>,
    token: Mutex<Option<String>>,
    ttl: time::Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("username", &self.profile.username)
            .field("has_token", &self.lock().is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SessionManager {
    /// Create a session manager with no in-memory token.
    pub fn new(
        profile: Arc<Profile>,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            profile,
            transport,
            store,
            token: Mutex::new(None),
            ttl: SESSION_TTL,
        }
    }

    /// Override the time-to-live of cached tokens.
    pub fn with_ttl(self, ttl: time::Duration) -> Self {
        Self { ttl, ..self }
    }

    /// The key this manager's token is cached under.
    pub fn cache_key(&self) -> String {
        session_cache_key(&self.profile.username, self.profile.api_endpoint.as_str())
    }

    /// The token currently held in memory, if any.
    pub fn token(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Adopt a token obtained elsewhere. It is not written to the store.
    pub fn set_token(&self, token: Option<String>) {
        *self.lock() = token;
    }

    /// Return a session token, opening a new session if necessary.
    ///
    /// With `force_refresh`, both the in-memory and the cached token are
    /// discarded first, so exactly one credential exchange is performed.
    pub fn acquire(&self, force_refresh: bool) -> Result<String, Error> {
        let key = self.cache_key();

        if force_refresh {
            debug!("discarding session token");
            self.set_token(None);
            if let Err(e) = self.store.remove(&key) {
                warn!("failed to clear session cache: {e}");
            }
        } else if let Some(token) = self.token() {
            return Ok(token);
        }

        if !force_refresh {
            match self.store.get(&key) {
                Ok(Some(token)) => {
                    debug!("using cached session token");
                    self.set_token(Some(token.clone()));
                    return Ok(token);
                }
                Ok(None) => (),
                Err(e) => warn!("failed to read session cache: {e}"),
            }
        }

        let token = match self.exchange() {
            Ok(token) => token,
            Err(e) => {
                if let Err(e) = self.store.remove(&key) {
                    warn!("failed to clear session cache: {e}");
                }
                return Err(e);
            }
        };

        self.set_token(Some(token.clone()));
        if let Err(e) = self.store.set(&key, &token, self.ttl) {
            warn!("failed to write session cache: {e}");
        }

        Ok(token)
    }

    fn exchange(&self) -> Result<String, Error> {
        let req = CreateSession {
            username: &self.profile.username,
            password: &self.profile.password,
        }
        .build_request(&self.profile, None)?;

        info!(username = %self.profile.username, "opening session");
        let resp = self
            .transport
            .execute(req)
            .map_err(|e| Error::Authentication(e.to_string()))?;

        let session = Session::from_response(resp.map(std::io::Cursor::new))
            .map_err(|e| Error::Authentication(e.to_string()))?;

        match session.id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(Error::Authentication("no session id returned".to_owned())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{MemoryStore, testutil::ScriptedTransport};

    const ENDPOINT: &str = "http://localhost:3000/api/";

    fn setup(
        transport: ScriptedTransport,
    ) -> (Arc<ScriptedTransport>, Arc<MemoryStore>, SessionManager) {
        let profile = Profile::new("test@test.com", "O2hqk582BJQ6lU", ENDPOINT).unwrap();
        let profile = Arc::new(profile);
        let transport = Arc::new(transport);
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(profile, transport.clone(), store.clone());
        (transport, store, manager)
    }

    fn session_ok() -> ScriptedTransport {
        ScriptedTransport::new(|req| {
            assert_eq!(req.uri(), "http://localhost:3000/api/session");
            ScriptedTransport::json(200, serde_json::json!({"id": "1234-5678-9012-3456"}))
        })
    }

    #[test]
    fn cache_key_is_deterministic() {
        let key = session_cache_key("test@test.com", ENDPOINT);
        assert_eq!(key, "b9cb05bc2a1fa1f41803c07be33dfd03");
        assert_eq!(key, session_cache_key("test@test.com", ENDPOINT));
        assert_ne!(key, session_cache_key("other@test.com", ENDPOINT));
        assert_ne!(key, session_cache_key("test@test.com", "http://example.com/api/"));
    }

    #[test]
    fn exchange_when_nothing_cached() -> anyhow::Result<()> {
        let (transport, store, manager) = setup(session_ok());

        assert_eq!(manager.acquire(false)?, "1234-5678-9012-3456");
        assert_eq!(manager.token().as_deref(), Some("1234-5678-9012-3456"));
        assert_eq!(
            store.get(&manager.cache_key())?.as_deref(),
            Some("1234-5678-9012-3456")
        );
        assert_eq!(transport.requests().len(), 1);

        let body: serde_json::Value = serde_json::from_str(transport.requests()[0].body())?;
        assert_eq!(
            body,
            serde_json::json!({"username": "test@test.com", "password": "O2hqk582BJQ6lU"})
        );
        Ok(())
    }

    #[test]
    fn cached_token_is_adopted() -> anyhow::Result<()> {
        let (transport, store, manager) = setup(session_ok());
        store.set(&manager.cache_key(), "1234", SESSION_TTL)?;

        assert_eq!(manager.acquire(false)?, "1234");
        assert_eq!(manager.token().as_deref(), Some("1234"));
        assert!(transport.requests().is_empty());
        Ok(())
    }

    #[test]
    fn memory_token_wins() -> anyhow::Result<()> {
        let (transport, store, manager) = setup(session_ok());
        store.set(&manager.cache_key(), "1234", SESSION_TTL)?;
        manager.set_token(Some("2222".into()));

        assert_eq!(manager.acquire(false)?, "2222");
        assert!(transport.requests().is_empty());
        Ok(())
    }

    #[test]
    fn forced_refresh_always_exchanges() -> anyhow::Result<()> {
        let (transport, store, manager) = setup(session_ok());
        store.set(&manager.cache_key(), "2222", SESSION_TTL)?;
        manager.set_token(Some("2222".into()));

        assert_eq!(manager.acquire(true)?, "1234-5678-9012-3456");
        assert_eq!(manager.token().as_deref(), Some("1234-5678-9012-3456"));
        assert_eq!(
            store.get(&manager.cache_key())?.as_deref(),
            Some("1234-5678-9012-3456")
        );
        assert_eq!(transport.requests().len(), 1);
        Ok(())
    }

    #[test]
    fn empty_id_is_an_authentication_error() -> anyhow::Result<()> {
        let (_, store, manager) = setup(ScriptedTransport::new(|_| {
            ScriptedTransport::json(200, serde_json::json!({"id": ""}))
        }));
        store.set(&manager.cache_key(), "stale", SESSION_TTL)?;

        assert_matches!(manager.acquire(true), Err(Error::Authentication(_)));
        assert_eq!(store.get(&manager.cache_key())?, None);
        assert_eq!(manager.token(), None);
        Ok(())
    }

    #[test]
    fn rejected_credentials() {
        let (_, _, manager) = setup(ScriptedTransport::new(|_| {
            let body = serde_json::json!({"errors": {"password": "did not match"}});
            ScriptedTransport::json(400, body)
        }));

        assert_matches!(
            manager.acquire(false),
            Err(Error::Authentication(msg)) if msg.contains("400")
        );
    }

    #[test]
    fn transport_failure() {
        let (_, _, manager) = setup(ScriptedTransport::failing("connection refused"));
        assert_matches!(
            manager.acquire(false),
            Err(Error::Authentication(msg)) if msg.contains("connection refused")
        );
    }
}
