/// An error response from the API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The API responded with a non-success HTTP status.
    ErrorResponse {
        /// The HTTP status on the overall response.
        status: http::StatusCode,
        /// The response body, if it contained any text.
        message: Option<String>,
    },
    /// The API response could not be parsed.
    InvalidResponse(http::StatusCode, #[source] serde_json::Error),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::ErrorResponse { status, message } => {
                write!(f, "{status}")?;
                if let Some(message) = &message {
                    write!(f, ": {message}")?;
                }
            }
            ApiError::InvalidResponse(status, _) => {
                write!(f, "Invalid response ({status})")?;
            }
        }

        Ok(())
    }
}

impl ApiError {
    /// The HTTP status of the response that caused the error.
    pub fn status(&self) -> http::StatusCode {
        match self {
            ApiError::ErrorResponse { status, .. } | ApiError::InvalidResponse(status, _) => {
                *status
            }
        }
    }

    pub(crate) fn from_body(status: http::StatusCode, body: &[u8]) -> Self {
        let message = String::from_utf8_lossy(body).trim().to_owned();
        ApiError::ErrorResponse {
            status,
            message: (!message.is_empty()).then_some(message),
        }
    }
}
