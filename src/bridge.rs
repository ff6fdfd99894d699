use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST,
    RANGE, TRANSFER_ENCODING, USER_AGENT,
};
use http::{HeaderValue, Uri};

use crate::error::Error;
use crate::interceptor::{Chain, Interceptor};
use crate::response::{Response, ResponseBody};
use crate::util::parse_header_value;

/// Cookie storage consulted by the bridge stage: `load` supplies
/// `name=value` pairs for the outgoing request, `save` observes the response
/// so `Set-Cookie` headers can be recorded.
pub trait CookieJar: Send + Sync {
    fn load(&self, uri: &Uri) -> Vec<String>;
    fn save(&self, uri: &Uri, response: &Response);
}

/// Default jar: no cookies attached, none recorded.
pub struct NoCookies;

impl CookieJar for NoCookies {
    fn load(&self, _uri: &Uri) -> Vec<String> {
        Vec::new()
    }

    fn save(&self, _uri: &Uri, _response: &Response) {}
}

/// Bridges the user-facing request to wire requirements: default headers,
/// cookie-jar state, and transparent response decompression. Pure
/// transformation; no retries, no network access.
pub(crate) struct Bridge {
    cookie_jar: Arc<dyn CookieJar>,
    user_agent: HeaderValue,
}

impl Bridge {
    pub(crate) fn new(cookie_jar: Arc<dyn CookieJar>, user_agent: HeaderValue) -> Self {
        Self {
            cookie_jar,
            user_agent,
        }
    }
}

impl Interceptor for Bridge {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response, Error> {
        let user_request = chain.request().clone();
        let uri = user_request.uri().clone();
        let mut builder = user_request.to_builder();

        if let Some(body) = user_request.body() {
            if let Some(content_type) = body.content_type() {
                if user_request.headers().get(CONTENT_TYPE).is_none() {
                    builder = builder.header_value(CONTENT_TYPE, content_type.clone());
                }
            }
            // Payload length is always known, so the chunked marker never
            // applies to a bridge-built request.
            builder = builder
                .header_value(CONTENT_LENGTH, content_length_value(body.content_length()))
                .remove_header(TRANSFER_ENCODING);
        }

        if user_request.headers().get(HOST).is_none() {
            builder = builder.header_value(HOST, host_header_value(&user_request)?);
        }
        if user_request.headers().get(CONNECTION).is_none() {
            builder = builder.header_value(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        }

        // When the caller didn't pick an encoding themselves, ask for gzip and
        // undo it transparently on the way back out.
        let transparent_gzip = user_request.headers().get(ACCEPT_ENCODING).is_none()
            && user_request.headers().get(RANGE).is_none();
        if transparent_gzip {
            builder = builder.header_value(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let cookies = self.cookie_jar.load(&uri);
        if !cookies.is_empty() {
            let joined = cookies.join("; ");
            builder = builder.header_value(COOKIE, parse_header_value("cookie", &joined)?);
        }

        if user_request.headers().get(USER_AGENT).is_none() {
            builder = builder.header_value(USER_AGENT, self.user_agent.clone());
        }

        let network_request = builder.build()?;
        let mut response = chain.proceed(network_request)?;

        self.cookie_jar.save(&uri, &response);

        // Follow-ups derive from the response's request; hand back the
        // caller's form so bridge-added headers never leak into them.
        response.set_request(user_request);

        if transparent_gzip && response_is_gzipped(&response) {
            let compressed = response.body_bytes()?;
            let decoded = gunzip(&compressed)?;
            let mut headers = response.headers().clone();
            headers.remove(CONTENT_ENCODING);
            headers.remove(CONTENT_LENGTH);
            response.set_headers(headers);
            response.replace_body(ResponseBody::Full(decoded));
        }

        Ok(response)
    }
}

fn content_length_value(length: u64) -> HeaderValue {
    HeaderValue::from_str(&length.to_string()).unwrap_or(HeaderValue::from_static("0"))
}

fn host_header_value(request: &crate::request::Request) -> Result<HeaderValue, Error> {
    let host = request.host();
    let port = request.port();
    let default = if request.is_https() { 443 } else { 80 };
    let text = if port == default {
        host
    } else {
        format!("{host}:{port}")
    };
    parse_header_value("host", &text)
}

fn response_is_gzipped(response: &Response) -> bool {
    response
        .header("content-encoding")
        .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"))
}

fn gunzip(compressed: &[u8]) -> Result<Bytes, Error> {
    let mut decoder = GzDecoder::new(compressed);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|source| Error::ProtocolViolation {
            detail: format!("failed to decode gzip response body: {source}"),
        })?;
    Ok(Bytes::from(decoded))
}
