//! API operations concerning authentication.

use serde::{Deserialize, Serialize};

use crate::api::{ApiRequest, JsonResponse};

/// Exchange a username and password for a session token.
#[derive(Clone, Copy)]
pub struct CreateSession<'a> {
    /// The login.
    pub username: &'a str,
    /// The password.
    pub password: &'a str,
}

impl std::fmt::Debug for CreateSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateSession")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    username: &'a str,
    password: &'a str,
}

/// A newly opened session.
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    /// The session token. Missing or empty means the exchange failed.
    #[serde(default)]
    pub id: Option<String>,
}

impl JsonResponse for Session {}

impl ApiRequest for CreateSession<'_> {
    type Response = Session;

    fn method(&self) -> http::Method {
        http::Method::POST
    }

    fn path(&self) -> String {
        "session".to_string()
    }

    fn body(&self) -> Option<impl Serialize> {
        Some(CreateSessionBody {
            username: self.username,
            password: self.password,
        })
    }
}
