use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};

use crate::error::Error;
use crate::transport::Route;
use crate::util::{default_port, parse_header_name, parse_header_value, redact_uri_for_logs};

/// An immutable request description. Rewriting a request (redirect follow-up,
/// bridge header injection) goes through [`Request::to_builder`] and produces
/// a new value; a `Request` is never mutated in place.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<RequestBody>,
}

/// A replayable byte payload with an optional content type. The length is
/// always known, which is what makes retries and redirects safe to replay.
#[derive(Clone, Debug)]
pub struct RequestBody {
    payload: Bytes,
    content_type: Option<HeaderValue>,
}

impl RequestBody {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: HeaderValue) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn content_type(&self) -> Option<&HeaderValue> {
        self.content_type.as_ref()
    }

    pub fn content_length(&self) -> u64 {
        self.payload.len() as u64
    }
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    /// Shorthand for a body-less GET request.
    pub fn get(uri: &str) -> Result<Self, Error> {
        Self::builder().method(Method::GET).uri(uri).build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Last value for a header name, as text. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn is_https(&self) -> bool {
        self.uri.scheme_str() == Some("https")
    }

    /// Lowercased host, as admission control counts it.
    pub fn host(&self) -> String {
        self.uri.host().unwrap_or_default().to_ascii_lowercase()
    }

    pub fn port(&self) -> u16 {
        default_port(&self.uri).unwrap_or(80)
    }

    pub fn redacted_uri(&self) -> String {
        redact_uri_for_logs(&self.uri)
    }

    /// The connection target this request resolves to.
    pub fn route(&self) -> Route {
        Route::from_request(self)
    }

    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            method: self.method.clone(),
            uri: Some(self.uri.clone()),
            headers: self.headers.clone(),
            body: self.body.clone(),
            error: None,
        }
    }
}

/// Builder with deferred errors: invalid names, values, and URIs are recorded
/// and surfaced once at [`RequestBuilder::build`], so call sites can chain
/// setters without intermediate `?`.
pub struct RequestBuilder {
    method: Method,
    uri: Option<Uri>,
    headers: HeaderMap,
    body: Option<RequestBody>,
    error: Option<Error>,
}

impl RequestBuilder {
    fn new() -> Self {
        Self {
            method: Method::GET,
            uri: None,
            headers: HeaderMap::new(),
            body: None,
            error: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn uri(mut self, uri: &str) -> Self {
        match uri.parse::<Uri>() {
            Ok(parsed) => self.uri = Some(parsed),
            Err(_) => {
                self.record_error(Error::InvalidUri {
                    uri: uri.to_owned(),
                });
            }
        }
        self
    }

    pub(crate) fn uri_value(mut self, uri: Uri) -> Self {
        self.uri = Some(uri);
        self
    }

    /// Sets a header, replacing any previous value for the same name
    /// (last-write-wins).
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let name = match parse_header_name(name) {
            Ok(name) => name,
            Err(error) => {
                self.record_error(error);
                return self;
            }
        };
        let value = match parse_header_value(name.as_str(), value) {
            Ok(value) => value,
            Err(error) => {
                self.record_error(error);
                return self;
            }
        };
        self.headers.insert(name, value);
        self
    }

    pub(crate) fn header_value(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub(crate) fn remove_header(mut self, name: HeaderName) -> Self {
        self.headers.remove(name);
        self
    }

    pub(crate) fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub(crate) fn clear_body(mut self) -> Self {
        self.body = None;
        self
    }

    pub fn build(self) -> Result<Request, Error> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let Some(uri) = self.uri else {
            return Err(Error::InvalidUri { uri: String::new() });
        };
        let scheme_supported = matches!(uri.scheme_str(), Some("http") | Some("https"));
        if !scheme_supported || uri.host().is_none() {
            return Err(Error::InvalidUri {
                uri: uri.to_string(),
            });
        }
        Ok(Request {
            method: self.method,
            uri,
            headers: self.headers,
            body: self.body,
        })
    }

    fn record_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}
