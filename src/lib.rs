//! Export saved questions ("cards") from a BI tool into Avro files.
//!
//! The crate fetches a card's column metadata, infers a typed record schema
//! from it, runs the card, and encodes the rows into an Avro object container
//! file ready to be loaded into a warehouse.
//!
//! # HTTP Requests and Responses
//!
//! The API types are designed to work with any HTTP client that uses the
//! [`http`] crate. Use [`ApiRequest::build_request`] to create a request, and
//! [`ApiResponse::from_response`] to parse the response. [`ApiClient`] wraps
//! this with session handling, over any [`HttpTransport`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use card_export::{ApiClient, ExportOptions, ExportPipeline, FileStore, Profile, default_agent};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let profile = Profile::from_default_env()?;
//! let store = FileStore::new(&profile.cache_dir);
//! let client = ApiClient::new(profile, default_agent(None), store);
//!
//! let pipeline = ExportPipeline::new(Arc::new(client));
//! let artifact = pipeline.export(2, None, &ExportOptions::default()).await?;
//!
//! println!("{} rows in {}", artifact.row_count, artifact.output_path.display());
//! # Ok(())
//! # }
//! ```

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications,
    variant_size_differences
)]

mod api;
mod client;
mod config;
pub mod encode;
mod error;
mod export;
mod import;
mod schema;
mod session;
mod store;
mod transport;

#[cfg(test)]
mod testutil;

pub use api::*;
pub use client::{ApiClient, RetryPolicy};
pub use config::{Error as ConfigError, Profile};
pub use error::{Error, TransportError};
pub use export::{ExportArtifact, ExportOptions, ExportPipeline};
pub use import::{ImportError, ImportResult, WarehouseImporter};
pub use schema::{
    FieldType, Primitive, RecordSchema, SchemaField, SourceType, export_schema_name, infer_schema,
    sanitize_name, validate_names,
};
pub use session::{SESSION_TTL, SessionManager, session_cache_key};
pub use store::{CredentialStore, FileStore, MemoryStore};
pub use transport::{HttpTransport, default_agent};
