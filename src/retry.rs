use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, warn};

use crate::error::Error;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;
use crate::transport::StreamLease;
use crate::util::{
    is_redirect_status, redirect_location, redirect_method, resolve_redirect_uri, same_origin,
    sanitize_headers_for_redirect,
};

/// Upper bound on the follow-up chain for one logical call. Chrome follows
/// 21 redirects, Firefox and curl 20; we stop at 20.
pub(crate) const MAX_FOLLOW_UPS: u32 = 20;

/// Transparent retries of one request after recoverable transport failures.
const MAX_TRANSPORT_RETRIES: u32 = 2;

/// Reacts to challenge responses by producing a retried request carrying
/// credentials, or `None` to give up.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, response: &Response) -> Option<Request>;
}

/// Recovers from transient transport failures and handles follow-up
/// responses: redirects, auth challenges, and retryable server hints. Owns
/// the connection lease for the whole logical call, so follow-ups can reuse
/// or replace the underlying connection.
pub(crate) struct RetryAndFollowUp {
    lease: Arc<StreamLease>,
    authenticator: Option<Arc<dyn Authenticator>>,
    proxy_authenticator: Option<Arc<dyn Authenticator>>,
    follow_redirects: bool,
}

impl RetryAndFollowUp {
    pub(crate) fn new(
        lease: Arc<StreamLease>,
        authenticator: Option<Arc<dyn Authenticator>>,
        proxy_authenticator: Option<Arc<dyn Authenticator>>,
        follow_redirects: bool,
    ) -> Self {
        Self {
            lease,
            authenticator,
            proxy_authenticator,
            follow_redirects,
        }
    }

    /// The follow-up request implied by a response, or `None` when the
    /// response is terminal and should be handed to the caller.
    fn follow_up(
        &self,
        response: &Response,
        retried_408: bool,
        retried_503: bool,
    ) -> Result<Option<Request>, Error> {
        let status = response.status();
        let request = response.request();

        match status {
            StatusCode::UNAUTHORIZED => {
                Ok(self.challenge_follow_up(response, self.authenticator.as_ref(), "authorization"))
            }
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => Ok(self.challenge_follow_up(
                response,
                self.proxy_authenticator.as_ref(),
                "proxy-authorization",
            )),
            StatusCode::REQUEST_TIMEOUT => {
                // Retry once with the identical request, and only when we
                // have a replayable (or absent) body.
                if retried_408 || response.header("retry-after").is_some_and(|v| v != "0") {
                    return Ok(None);
                }
                Ok(Some(request.clone()))
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                // Only an explicit Retry-After: 0 invites an immediate retry.
                if retried_503 || response.header("retry-after") != Some("0") {
                    return Ok(None);
                }
                Ok(Some(request.clone()))
            }
            status if is_redirect_status(status) => self.redirect_follow_up(response),
            _ => Ok(None),
        }
    }

    fn challenge_follow_up(
        &self,
        response: &Response,
        authenticator: Option<&Arc<dyn Authenticator>>,
        credential_header: &str,
    ) -> Option<Request> {
        let authenticator = authenticator?;
        let retried = authenticator.authenticate(response)?;
        // If the retried request carries the same credentials the server
        // already rejected, trying again would loop forever.
        let previous = response.request().header(credential_header);
        if previous.is_some() && previous == retried.header(credential_header) {
            debug!("authenticator repeated rejected credentials, giving up");
            return None;
        }
        Some(retried)
    }

    fn redirect_follow_up(&self, response: &Response) -> Result<Option<Request>, Error> {
        if !self.follow_redirects {
            return Ok(None);
        }
        let Some(location) = redirect_location(response.headers()) else {
            return Ok(None);
        };
        let request = response.request();
        let Some(target) = resolve_redirect_uri(request.uri(), &location) else {
            return Err(Error::ProtocolViolation {
                detail: format!("unresolvable redirect location {location:?}"),
            });
        };
        match target.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Ok(None),
        }

        let method = redirect_method(request.method(), response.status());
        let downgraded = method != *request.method();
        let cross_origin = !same_origin(request.uri(), &target);

        let mut headers = request.headers().clone();
        sanitize_headers_for_redirect(&mut headers, downgraded, !cross_origin);

        let mut builder = Request::builder()
            .method(method)
            .uri_value(target)
            .headers(headers);
        if downgraded {
            builder = builder.clear_body();
        } else if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }
        Ok(Some(builder.build()?))
    }
}

impl Interceptor for RetryAndFollowUp {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response, Error> {
        let mut request = chain.request().clone();
        let mut prior: Option<Arc<Response>> = None;
        let mut follow_up_count: u32 = 0;
        let mut retried_408 = false;
        let mut retried_503 = false;
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.lease.is_canceled() {
                return Err(Error::Canceled);
            }

            let response = match chain.proceed(request.clone()) {
                Ok(response) => {
                    consecutive_failures = 0;
                    response
                }
                Err(error) => {
                    if self.lease.is_canceled() {
                        return Err(Error::Canceled);
                    }
                    consecutive_failures += 1;
                    if error.is_recoverable()
                        && request_is_replayable(&request)
                        && consecutive_failures <= MAX_TRANSPORT_RETRIES
                    {
                        warn!(
                            uri = %request.redacted_uri(),
                            error = %error,
                            "recovering from transport failure"
                        );
                        continue;
                    }
                    return Err(error);
                }
            };

            let response = response.with_prior(prior.take());

            match self.follow_up(&response, retried_408, retried_503)? {
                None => return Ok(response),
                Some(next) => {
                    let status = response.status();
                    retried_408 |= status == StatusCode::REQUEST_TIMEOUT;
                    retried_503 |= status == StatusCode::SERVICE_UNAVAILABLE;

                    follow_up_count += 1;
                    if follow_up_count > MAX_FOLLOW_UPS {
                        return Err(Error::TooManyFollowUps {
                            count: follow_up_count as usize,
                        });
                    }
                    debug!(
                        status = status.as_u16(),
                        count = follow_up_count,
                        uri = %next.redacted_uri(),
                        "following up"
                    );
                    prior = Some(Arc::new(response.strip_body()));
                    request = next;
                }
            }
        }
    }
}

/// A request is safe to transparently resend only when resending cannot
/// duplicate a visible effect and its body can be written again. Bodies here
/// are buffered, so replayability reduces to method semantics.
fn request_is_replayable(request: &Request) -> bool {
    matches!(
        *request.method(),
        http::Method::GET | http::Method::HEAD | http::Method::OPTIONS | http::Method::TRACE
    )
}
