use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::Profile;

pub mod auth;
pub mod card;
mod error;

pub use error::*;

/// The header carrying the session token on authorized calls.
pub const SESSION_HEADER: &str = "X-Metabase-Session";

/// Implemented by types that can be sent as requests to the BI tool's API.
pub trait ApiRequest {
    /// The corresponding response type.
    type Response: ApiResponse;

    /// The path of the endpoint, relative to the API base.
    fn path(&self) -> String;

    /// The method to use.
    fn method(&self) -> http::Method {
        http::Method::GET
    }

    /// The serializable JSON request body.
    fn body(&self) -> Option<impl Serialize> {
        None::<&()>
    }

    /// The serializable form-encoded request body. Takes precedence over
    /// [ApiRequest::body].
    fn form(&self) -> Option<impl Serialize> {
        None::<&()>
    }

    /// Build an [http::Request] suitable for passing to your favorite HTTP
    /// client. The session token, if any, is attached as a header.
    fn build_request(
        &self,
        profile: &Profile,
        session: Option<&str>,
    ) -> Result<http::Request<String>, crate::Error> {
        let url = profile.api_endpoint.join(&self.path())?;

        let mut req = http::Request::builder()
            .method(self.method())
            .uri(url.as_str())
            .header(http::header::USER_AGENT, &profile.user_agent);

        if let Some(token) = session {
            req = req.header(SESSION_HEADER, token);
        }

        let (content_type, body) = if let Some(form) = self.form() {
            let body = serde_qs::to_string(&form).map_err(std::io::Error::other)?;
            ("application/x-www-form-urlencoded", body)
        } else if let Some(body) = self.body() {
            ("application/json", serde_json::to_string(&body)?)
        } else {
            ("application/json", String::new())
        };

        Ok(req
            .header(http::header::CONTENT_TYPE, content_type)
            .header(http::header::CONTENT_LENGTH, body.len())
            .body(body)?)
    }
}

/// Implemented by types that can be read as responses from the API.
pub trait ApiResponse: Sized {
    /// Read the response from an [http::Response] object.
    fn from_response(resp: http::Response<impl Read>) -> Result<Self, ApiError> {
        let (parts, body) = resp.into_parts();
        Self::from_response_parts(parts, body)
    }

    /// Read the response from pre-parsed parts.
    fn from_response_parts(parts: http::response::Parts, body: impl Read)
    -> Result<Self, ApiError>;
}

/// A private trait for types that deserialize directly from a JSON response
/// body.
pub(crate) trait JsonResponse: for<'de> Deserialize<'de> {}

impl<T: JsonResponse> ApiResponse for T {
    fn from_response_parts(
        parts: http::response::Parts,
        mut body: impl Read,
    ) -> Result<Self, ApiError> {
        if !parts.status.is_success() {
            let mut buf = Vec::new();
            // The status alone is still a useful error if the body is unreadable.
            let _ = body.read_to_end(&mut buf);
            return Err(ApiError::from_body(parts.status, &buf));
        }

        serde_json::from_reader(body).map_err(|e| {
            tracing::error!("Failed to parse API response: {e:#?}");
            ApiError::InvalidResponse(parts.status, e)
        })
    }
}
