use tracing::debug;

use crate::error::Error;
use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

/// Binds a pooled connection for the attempt and releases it when the
/// attempt ends. Network interceptors and the call-server stage run with the
/// connection bound; by the time control returns to the retry stage the
/// lease is empty again, so a follow-up can bind a different route.
pub(crate) struct Connect;

impl Interceptor for Connect {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response, Error> {
        let request = chain.request().clone();
        let route = request.route();
        debug!(route = %route.pool_key(), "binding connection");
        chain.lease().bind(&route)?;

        let result = chain.proceed(request);
        chain.lease().finish_attempt(result.is_ok());
        result
    }
}
