use std::fmt;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::{Error, TransportErrorKind};
use crate::request::Request;
use crate::util::is_redirect_status;

/// The body of one response: already materialized, a lazily-read stream, or
/// nothing. A stream is drained at most once, by [`Response::body_bytes`].
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    Stream(Box<dyn Read + Send + Sync>),
}

impl ResponseBody {
    pub fn len_hint(&self) -> Option<usize> {
        match self {
            Self::Empty => Some(0),
            Self::Full(bytes) => Some(bytes.len()),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Full(bytes) => formatter.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => formatter.write_str("Stream"),
        }
    }
}

/// The result of one attempt. Owns its body exclusively; the back-reference
/// to a prior response in a redirect/auth chain is body-stripped and shared.
#[derive(Debug)]
pub struct Response {
    request: Request,
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    body: ResponseBody,
    prior: Option<Arc<Response>>,
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::new()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Last value for a header name, as text. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The request that produced this response, possibly rewritten by the
    /// pipeline relative to what the caller built.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The response that triggered this one within the same call (redirect or
    /// auth challenge), body-stripped.
    pub fn prior_response(&self) -> Option<&Arc<Response>> {
        self.prior.as_ref()
    }

    pub fn is_redirect(&self) -> bool {
        is_redirect_status(self.status)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Materializes the body. A streaming body is read to its end exactly
    /// once; later calls return the buffered bytes.
    pub fn body_bytes(&mut self) -> Result<Bytes, Error> {
        match &mut self.body {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Full(bytes) => Ok(bytes.clone()),
            ResponseBody::Stream(reader) => {
                let mut buffer = Vec::new();
                reader.read_to_end(&mut buffer).map_err(|source| Error::Transport {
                    kind: TransportErrorKind::Read,
                    message: "failed to read response body".to_owned(),
                    source: Some(Box::new(source)),
                })?;
                let bytes = Bytes::from(buffer);
                self.body = ResponseBody::Full(bytes.clone());
                Ok(bytes)
            }
        }
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub(crate) fn replace_body(&mut self, body: ResponseBody) {
        self.body = body;
    }

    pub(crate) fn set_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    pub(crate) fn set_request(&mut self, request: Request) {
        self.request = request;
    }

    pub(crate) fn strip_body(mut self) -> Self {
        self.body = ResponseBody::Empty;
        self
    }

    pub(crate) fn with_prior(mut self, prior: Option<Arc<Response>>) -> Self {
        self.prior = prior;
        self
    }
}

pub struct ResponseBuilder {
    request: Option<Request>,
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: ResponseBody,
    prior: Option<Arc<Response>>,
}

impl ResponseBuilder {
    fn new() -> Self {
        Self {
            request: None,
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            prior: None,
        }
    }

    pub fn request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn header(mut self, name: http::header::HeaderName, value: http::header::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }

    pub fn prior(mut self, prior: Option<Arc<Response>>) -> Self {
        self.prior = prior;
        self
    }

    /// Builds the response. The request back-reference is mandatory; a stage
    /// constructing a response without one is a usage error.
    pub fn build(self) -> Response {
        let request = self
            .request
            .expect("a response must reference the request that produced it");
        let reason = self.reason.unwrap_or_else(|| {
            self.status
                .canonical_reason()
                .unwrap_or_default()
                .to_owned()
        });
        Response {
            request,
            status: self.status,
            reason,
            headers: self.headers,
            body: self.body,
            prior: self.prior,
        }
    }
}
