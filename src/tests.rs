use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::{Error, ErrorCode, TransportErrorKind};
use crate::request::{Request, RequestBody};
use crate::response::{Response, ResponseBody};
use crate::util::{
    default_port, is_redirect_status, redact_uri_for_logs, redirect_method, resolve_redirect_uri,
    same_origin, sanitize_headers_for_redirect,
};

fn uri(text: &str) -> Uri {
    text.parse().expect("uri should parse")
}

#[test]
fn default_port_fills_in_scheme_port() {
    assert_eq!(default_port(&uri("http://x.test/a")), Some(80));
    assert_eq!(default_port(&uri("https://x.test/a")), Some(443));
    assert_eq!(default_port(&uri("https://x.test:8443/a")), Some(8443));
}

#[test]
fn same_origin_ignores_case_and_explicit_default_port() {
    assert!(same_origin(&uri("http://X.test/a"), &uri("http://x.test:80/b")));
    assert!(!same_origin(&uri("http://x.test/a"), &uri("https://x.test/a")));
    assert!(!same_origin(&uri("http://x.test/a"), &uri("http://y.test/a")));
    assert!(!same_origin(&uri("http://x.test/a"), &uri("http://x.test:81/a")));
}

#[test]
fn redirect_method_downgrades_post_on_303_and_302() {
    assert_eq!(
        redirect_method(&Method::POST, StatusCode::SEE_OTHER),
        Method::GET
    );
    assert_eq!(redirect_method(&Method::POST, StatusCode::FOUND), Method::GET);
    assert_eq!(
        redirect_method(&Method::PUT, StatusCode::FOUND),
        Method::PUT
    );
    assert_eq!(
        redirect_method(&Method::POST, StatusCode::TEMPORARY_REDIRECT),
        Method::POST
    );
    assert_eq!(
        redirect_method(&Method::HEAD, StatusCode::SEE_OTHER),
        Method::GET
    );
}

#[test]
fn redirect_statuses_are_the_classic_five() {
    for code in [301u16, 302, 303, 307, 308] {
        assert!(is_redirect_status(
            StatusCode::from_u16(code).expect("status")
        ));
    }
    for code in [300u16, 304, 200, 401] {
        assert!(!is_redirect_status(
            StatusCode::from_u16(code).expect("status")
        ));
    }
}

#[test]
fn resolve_redirect_uri_handles_relative_locations() {
    let base = uri("https://x.test/v1/items?page=2");
    assert_eq!(
        resolve_redirect_uri(&base, "/login")
            .expect("resolved")
            .to_string(),
        "https://x.test/login"
    );
    assert_eq!(
        resolve_redirect_uri(&base, "details")
            .expect("resolved")
            .to_string(),
        "https://x.test/v1/details"
    );
    assert_eq!(
        resolve_redirect_uri(&base, "https://y.test/moved")
            .expect("resolved")
            .to_string(),
        "https://y.test/moved"
    );
}

#[test]
fn sanitize_strips_credentials_cross_origin_and_body_headers_on_downgrade() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer t".parse().expect("value"));
    headers.insert("cookie", "a=1".parse().expect("value"));
    headers.insert("content-type", "text/plain".parse().expect("value"));
    headers.insert("content-length", "4".parse().expect("value"));
    headers.insert("accept", "*/*".parse().expect("value"));

    let mut cross = headers.clone();
    sanitize_headers_for_redirect(&mut cross, false, false);
    assert!(cross.get("authorization").is_none());
    assert!(cross.get("cookie").is_none());
    assert!(cross.get("content-type").is_some());

    let mut downgraded = headers.clone();
    sanitize_headers_for_redirect(&mut downgraded, true, true);
    assert!(downgraded.get("content-type").is_none());
    assert!(downgraded.get("content-length").is_none());
    assert!(downgraded.get("authorization").is_some());
    assert!(downgraded.get("accept").is_some());
}

#[test]
fn redact_uri_drops_query_and_userinfo() {
    assert_eq!(
        redact_uri_for_logs(&uri("https://user:pw@x.test/v1/items?token=s3cret")),
        "https://x.test/v1/items"
    );
}

#[test]
fn request_builder_header_is_last_write_wins() {
    let request = Request::builder()
        .uri("http://x.test/a")
        .header("x-trace", "first")
        .header("X-Trace", "second")
        .build()
        .expect("request");
    assert_eq!(request.header("x-trace"), Some("second"));
    assert_eq!(request.headers().get_all("x-trace").iter().count(), 1);
}

#[test]
fn request_builder_defers_invalid_uri_to_build() {
    let error = Request::builder()
        .uri("http://exa mple.test/")
        .header("accept", "*/*")
        .build()
        .expect_err("invalid uri should fail at build");
    assert_eq!(error.code(), ErrorCode::InvalidUri);
}

#[test]
fn request_builder_rejects_non_http_scheme() {
    let error = Request::builder()
        .uri("ftp://x.test/a")
        .build()
        .expect_err("non-http scheme should be rejected");
    assert_eq!(error.code(), ErrorCode::InvalidUri);
}

#[test]
fn request_builder_first_recorded_error_wins() {
    let error = Request::builder()
        .uri("not a uri")
        .header("bad name", "v")
        .build()
        .expect_err("first error should surface");
    assert_eq!(error.code(), ErrorCode::InvalidUri);
}

#[test]
fn request_host_is_lowercased_and_port_defaulted() {
    let request = Request::get("HTTPS://API.X.Test/v1").expect("request");
    assert_eq!(request.host(), "api.x.test");
    assert_eq!(request.port(), 443);
    assert!(request.is_https());
}

#[test]
fn request_body_reports_length_and_content_type() {
    let body = RequestBody::new(&b"hello"[..])
        .with_content_type("text/plain".parse().expect("value"));
    assert_eq!(body.content_length(), 5);
    assert_eq!(
        body.content_type().map(|value| value.as_bytes()),
        Some(&b"text/plain"[..])
    );
}

fn response_with(status: StatusCode, body: ResponseBody) -> Response {
    Response::builder()
        .request(Request::get("http://x.test/a").expect("request"))
        .status(status)
        .body(body)
        .build()
}

#[test]
fn response_reason_defaults_to_canonical_phrase() {
    let response = response_with(StatusCode::NOT_FOUND, ResponseBody::Empty);
    assert_eq!(response.reason(), "Not Found");
}

#[test]
fn response_body_bytes_drains_stream_once_and_caches() {
    let stream: Box<dyn std::io::Read + Send + Sync> = Box::new(std::io::Cursor::new(b"abc".to_vec()));
    let mut response = response_with(StatusCode::OK, ResponseBody::Stream(stream));
    assert_eq!(&response.body_bytes().expect("bytes")[..], b"abc");
    // Second read must serve the cached copy, not the drained stream.
    assert_eq!(&response.body_bytes().expect("bytes")[..], b"abc");
}

#[test]
fn response_classification_helpers() {
    assert!(response_with(StatusCode::FOUND, ResponseBody::Empty).is_redirect());
    assert!(response_with(StatusCode::OK, ResponseBody::Empty).is_success());
    assert!(!response_with(StatusCode::BAD_GATEWAY, ResponseBody::Empty).is_success());
}

#[test]
fn error_codes_are_stable_strings() {
    let cases = [
        (Error::AlreadyExecuted, "already_executed"),
        (Error::Canceled, "canceled"),
        (
            Error::TooManyFollowUps { count: 21 },
            "too_many_follow_ups",
        ),
        (
            Error::ProtocolViolation {
                detail: "x".to_owned(),
            },
            "protocol_violation",
        ),
        (
            Error::transport(TransportErrorKind::Connect, "refused"),
            "transport",
        ),
    ];
    for (error, expected) in cases {
        assert_eq!(error.code().as_str(), expected);
    }
}

#[test]
fn transport_recoverability_follows_kind() {
    assert!(Error::transport(TransportErrorKind::Connect, "refused").is_recoverable());
    assert!(Error::transport(TransportErrorKind::Read, "reset").is_recoverable());
    assert!(!Error::transport(TransportErrorKind::Write, "broken pipe").is_recoverable());
    assert!(!Error::transport(TransportErrorKind::Interrupted, "canceled").is_recoverable());
    assert!(!Error::Canceled.is_recoverable());
}
