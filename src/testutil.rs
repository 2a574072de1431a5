//! Test utilities for exercising the client without a network.

use std::sync::Mutex;

use crate::{HttpTransport, TransportError};

type Responder = Box<
    dyn Fn(&http::Request<String>) -> Result<http::Response<Vec<u8>>, TransportError>
        + Send
        + Sync,
>;

/// A transport that answers every request with a scripted response and
/// records what it was sent.
pub(crate) struct ScriptedTransport {
    respond: Responder,
    requests: Mutex<Vec<http::Request<String>>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        respond: impl Fn(&http::Request<String>) -> http::Response<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(move |req| Ok(respond(req))),
            requests: Mutex::default(),
        }
    }

    /// A transport where every request fails before reaching the server.
    pub(crate) fn failing(message: &'static str) -> Self {
        Self {
            respond: Box::new(move |_| Err(message.into())),
            requests: Mutex::default(),
        }
    }

    pub(crate) fn json(status: u16, body: serde_json::Value) -> http::Response<Vec<u8>> {
        http::Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body.to_string().into_bytes())
            .unwrap()
    }

    /// Every request received so far, oldest first.
    pub(crate) fn requests(&self) -> Vec<http::Request<String>> {
        self.requests.lock().unwrap().clone()
    }

    /// The paths of the requests received so far, with the method.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| format!("{} {}", r.method(), r.uri().path()))
            .collect()
    }
}

impl HttpTransport for ScriptedTransport {
    fn execute(
        &self,
        req: http::Request<String>,
    ) -> Result<http::Response<Vec<u8>>, TransportError> {
        let resp = (self.respond)(&req);
        self.requests.lock().unwrap().push(req);
        resp
    }
}
