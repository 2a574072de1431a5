use std::io;

use crate::ApiError;

/// A boxed error from the underlying HTTP client.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// An error encountered while exporting a card.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The credential exchange failed or returned no session token.
    #[error("Authentication failed: {0}")]
    Authentication(String),
    /// The API still rejected the session after it was refreshed.
    #[error("Request unauthorized after {attempts} attempts with a refreshed session")]
    UnauthorizedRetryExhausted {
        /// The number of requests made, including the retry.
        attempts: u32,
    },
    /// A column reports a base type that has no schema mapping.
    #[error("Type {0} is not supported")]
    UnsupportedType(String),
    /// A field or record name is not a legal identifier in the output format.
    #[error(
        "'{name}' cannot be used as a field name. Supply a rename mapping \
         (schema_field_name_index) that maps it to a name made of letters, digits and '_'"
    )]
    InvalidFieldName {
        /// The offending name.
        name: String,
    },
    /// The card has no column metadata, usually because it was never run.
    #[error("Card {0} has no result metadata")]
    MissingMetadata(u64),
    /// A timestamp value could not be read.
    #[error("Invalid timestamp for field '{field}': {value}")]
    InvalidTimestamp {
        /// The field being encoded.
        field: String,
        /// The raw value.
        value: String,
    },
    /// A raw value does not fit the type inferred for its field.
    #[error("Value for field '{field}' does not match type {expected}: {value}")]
    ValueMismatch {
        /// The field being encoded.
        field: String,
        /// The declared type of the field.
        expected: String,
        /// The raw value.
        value: String,
    },
    /// The API responded with an error status.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The HTTP client failed before a response was received.
    #[error("HTTP request failed")]
    Transport(#[source] TransportError),
    /// A request could not be constructed.
    #[error("Invalid request")]
    InvalidRequest(#[from] http::Error),
    /// An endpoint path did not resolve against the API base.
    #[error("Invalid request URL")]
    InvalidUrl(#[from] url::ParseError),
    /// Reading or writing a working file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A working file contained invalid JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The output encoder failed.
    #[error("Failed to encode output: {0}")]
    Avro(#[from] apache_avro::Error),
    /// A background task panicked or was cancelled.
    #[error("Background task failed")]
    Task(#[from] tokio::task::JoinError),
}
