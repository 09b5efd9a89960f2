use strand::http::response::{Body, Response, ResponseBuilder, StatusCode};

#[test]
fn test_status_code_as_u16() {
    assert_eq!(StatusCode::SwitchingProtocols.as_u16(), 101);
    assert_eq!(StatusCode::Ok.as_u16(), 200);
    assert_eq!(StatusCode::NoContent.as_u16(), 204);
    assert_eq!(StatusCode::BadRequest.as_u16(), 400);
    assert_eq!(StatusCode::NotFound.as_u16(), 404);
    assert_eq!(StatusCode::InternalServerError.as_u16(), 500);
    assert_eq!(StatusCode::NotImplemented.as_u16(), 501);
    assert_eq!(StatusCode::GatewayTimeout.as_u16(), 504);
}

#[test]
fn test_status_code_reason_phrase() {
    assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    assert_eq!(StatusCode::SwitchingProtocols.reason_phrase(), "Switching Protocols");
    assert_eq!(StatusCode::NotImplemented.reason_phrase(), "Not Implemented");
    assert_eq!(StatusCode::GatewayTimeout.reason_phrase(), "Gateway Time-out");
}

#[test]
fn test_bodiless_statuses() {
    assert!(StatusCode::SwitchingProtocols.is_bodiless());
    assert!(StatusCode::NoContent.is_bodiless());
    assert!(StatusCode::NotModified.is_bodiless());
    assert!(!StatusCode::Ok.is_bodiless());
}

#[test]
fn test_response_builder_basic() {
    let response = ResponseBuilder::new(StatusCode::Ok).body("Hello, World!").build();

    assert_eq!(response.status, StatusCode::Ok);
    assert!(matches!(&response.body, Body::Bytes(b) if &b[..] == b"Hello, World!"));
    assert_eq!(response.body.len(), 13);
    assert!(!response.close);
}

#[test]
fn test_response_builder_empty_body() {
    let response = ResponseBuilder::new(StatusCode::NoContent).body("").build();
    assert!(matches!(response.body, Body::Empty));
    assert!(response.body.is_empty());
}

#[test]
fn test_response_builder_header_replaces_case_insensitively() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "text/plain")
        .header("X-Custom", "value")
        .header("content-type", "application/json")
        .build();

    assert_eq!(response.headers.len(), 2);
    assert_eq!(response.header("Content-Type"), Some("application/json"));
    assert_eq!(response.header("x-custom"), Some("value"));
}

#[test]
fn test_response_ok() {
    let response = Response::ok("done");
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body.len(), 4);
}

#[test]
fn test_not_found_keeps_connection() {
    let response = Response::not_found();
    assert_eq!(response.status, StatusCode::NotFound);
    assert!(!response.close);
}

#[test]
fn test_terminal_responses_close() {
    for (response, status) in [
        (Response::bad_request(), StatusCode::BadRequest),
        (Response::internal_error(), StatusCode::InternalServerError),
        (Response::not_implemented(), StatusCode::NotImplemented),
        (Response::gateway_timeout(), StatusCode::GatewayTimeout),
    ] {
        assert_eq!(response.status, status);
        assert!(response.close);
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
    }

    let timeout = Response::gateway_timeout();
    assert!(matches!(&timeout.body, Body::Bytes(b) if &b[..] == b"504 Gateway Time-out"));
}

#[test]
fn test_response_file_missing() {
    assert!(Response::file("/definitely/not/here.bin").is_err());
}
