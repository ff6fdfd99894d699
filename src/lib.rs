//! `callx` is a call-dispatch and interceptor-pipeline engine for HTTP
//! clients. It owns request admission (ceilings on total and per-host
//! concurrency), the once-only call lifecycle with cooperative cancellation,
//! and an ordered stage pipeline (retry/follow-up, protocol bridging,
//! response caching, connection binding, and the terminal exchange). The
//! actual socket work lives behind the [`ConnectionPool`] and [`Connection`]
//! traits supplied by the embedder.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use callx::prelude::{HttpClient, Request};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool: Arc<dyn callx::ConnectionPool> = make_pool();
//!     let client = HttpClient::builder()
//!         .connection_pool(pool)
//!         .user_agent("my-sdk/1.0")
//!         .try_build()?;
//!
//!     let request = Request::get("https://api.example.com/v1/items")?;
//!     let mut response = client.new_call(request).execute()?;
//!     println!("status={} bytes={}", response.status(), response.body_bytes()?.len());
//!     Ok(())
//! }
//! # fn make_pool() -> Arc<dyn callx::ConnectionPool> { unimplemented!() }
//! ```
//!
//! Asynchronous execution goes through the shared dispatcher:
//!
//! ```no_run
//! # use callx::prelude::*;
//! # fn demo(client: &HttpClient, request: Request) -> Result<(), callx::Error> {
//! client.new_call(request).enqueue(|result: Result<Response, Error>| {
//!     match result {
//!         Ok(response) => println!("got {}", response.status()),
//!         Err(error) => eprintln!("call failed: {error}"),
//!     }
//! })?;
//! # Ok(())
//! # }
//! ```

mod bridge;
mod cache;
mod call;
mod call_server;
mod client;
mod connect;
mod dispatcher;
mod error;
mod interceptor;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use bridge::{CookieJar, NoCookies};
pub use cache::{CacheKey, CachedEntry, MemoryCache, ResponseCache};
pub use call::{Call, Callback};
pub use client::{HttpClient, HttpClientBuilder};
pub use dispatcher::Dispatcher;
pub use error::{Error, ErrorCode, TransportErrorKind};
pub use interceptor::{Chain, Interceptor};
pub use request::{Request, RequestBody, RequestBuilder};
pub use response::{Response, ResponseBody, ResponseBuilder};
pub use retry::Authenticator;
pub use transport::{Connection, ConnectionPool, RawResponse, Route};

/// Convenience alias used throughout the crate's public API.
pub type CallxResult<T> = Result<T, Error>;

pub mod prelude {
    //! The handful of types almost every embedder touches.
    pub use crate::{
        Call, Callback, CallxResult, Error, HttpClient, Interceptor, Request, RequestBody,
        Response,
    };
}

#[cfg(test)]
mod tests;
