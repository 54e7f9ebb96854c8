//! Per-request state shared by every pipeline stage.

use std::net::IpAddr;

use axum::body::Bytes;
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use uuid::Uuid;

/// A response committed by some stage of the pipeline.
#[derive(Debug, Clone)]
pub struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    /// Create a reply with a status and body.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Create a JSON reply.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string())
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    /// Add a header to the reply.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Split the reply into its parts.
    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }
}

/// The request as seen by middleware and handlers.
///
/// Holds the inputs admission policies need (peer address and headers)
/// and the single response slot. Once a reply is committed, or the
/// connection is marked aborted, later attempts to respond are ignored.
#[derive(Debug)]
pub struct RequestContext {
    id: Uuid,
    method: Method,
    path: String,
    peer_addr: IpAddr,
    headers: HeaderMap,
    body: Bytes,
    reply: Option<Reply>,
    aborted: bool,
}

impl RequestContext {
    /// Create a context for a request from `peer_addr`.
    pub fn new(method: Method, path: impl Into<String>, peer_addr: IpAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            peer_addr,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            reply: None,
            aborted: false,
        }
    }

    /// Attach request headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Attach a request body.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Unique identifier for this request.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Address of the directly connected peer.
    pub fn client_address(&self) -> IpAddr {
        self.peer_addr
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a header in arrival order, skipping non-UTF-8 values.
    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Commit a response. Returns `false` if one was already committed.
    pub fn respond(&mut self, status: StatusCode, body: impl Into<Bytes>) -> bool {
        self.respond_with(Reply::new(status, body))
    }

    /// Commit a prepared reply. Returns `false` if one was already committed.
    pub fn respond_with(&mut self, reply: Reply) -> bool {
        if self.is_committed() {
            return false;
        }
        self.reply = Some(reply);
        true
    }

    /// Terminate the request without a response body.
    pub fn abort_connection(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Whether a reply was committed or the connection aborted.
    pub fn is_committed(&self) -> bool {
        self.reply.is_some() || self.aborted
    }

    pub fn reply(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    /// Take the committed reply, if any.
    pub fn take_reply(&mut self) -> Option<Reply> {
        self.reply.take()
    }
}
