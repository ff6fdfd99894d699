use tracing::debug;

use crate::error::Error;
use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

/// The terminal stage: drives the bound connection through one exchange.
/// Never calls `proceed`.
pub(crate) struct CallServer;

impl Interceptor for CallServer {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response, Error> {
        if chain.is_canceled() {
            return Err(Error::Canceled);
        }
        let request = chain.request().clone();
        let Some(connection) = chain.lease().connection() else {
            panic!("call-server stage requires a bound connection");
        };

        debug!(method = %request.method(), uri = %request.redacted_uri(), "writing request");
        connection.write_request(&request)?;
        connection.flush()?;
        let raw = connection.read_response()?;
        debug!(status = raw.status.as_u16(), "read response");

        let mut builder = Response::builder()
            .request(request)
            .status(raw.status)
            .headers(raw.headers)
            .body(raw.body);
        if let Some(reason) = raw.reason {
            builder = builder.reason(reason);
        }
        Ok(builder.build())
    }
}
