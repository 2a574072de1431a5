//! The seam between typed API requests and an actual HTTP client.

use std::{io::Read as _, time};

use crate::TransportError;

/// Sends a fully built request and returns the complete response.
///
/// Implementations must return error statuses (in particular 401) as
/// responses rather than errors, so the caller can react to them.
pub trait HttpTransport: Send + Sync {
    /// Execute a single request.
    fn execute(
        &self,
        req: http::Request<String>,
    ) -> Result<http::Response<Vec<u8>>, TransportError>;
}

impl HttpTransport for ureq::Agent {
    fn execute(
        &self,
        req: http::Request<String>,
    ) -> Result<http::Response<Vec<u8>>, TransportError> {
        let resp = self.run(req)?;
        let (parts, body) = resp.into_parts();

        // Row responses can be large; into_reader doesn't apply the default
        // body size limit.
        let mut buf = Vec::new();
        body.into_reader().read_to_end(&mut buf)?;
        Ok(http::Response::from_parts(parts, buf))
    }
}

impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    fn execute(
        &self,
        req: http::Request<String>,
    ) -> Result<http::Response<Vec<u8>>, TransportError> {
        (**self).execute(req)
    }
}

/// Build a [ureq::Agent] that surfaces error statuses as responses.
pub fn default_agent(timeout: Option<time::Duration>) -> ureq::Agent {
    let cfg = ureq::config::Config::builder()
        .http_status_as_error(false)
        .timeout_global(timeout)
        .build();

    ureq::Agent::new_with_config(cfg)
}
