//! HTTP/1.1 message types: the header multimap, the incremental request
//! parser and the response builder

pub mod headers;
pub mod request;
pub mod response;

pub use self::headers::HttpHeaders;
pub use self::request::{HttpRequest, ParseLimits, RequestState};
pub use self::response::HttpResponse;

/// Value of the `Server` header and the `SERVER_SOFTWARE` CGI variable
pub const SERVER_SOFTWARE: &str = concat!("reactor-httpd/", env!("CARGO_PKG_VERSION"));

/// Methods the server recognizes at all; anything else is a 501
pub const KNOWN_METHODS: [&str; 7] =
    ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"];

/// Protocol versions the server speaks
pub const SUPPORTED_VERSIONS: [&str; 2] = ["HTTP/1.0", "HTTP/1.1"];

/// The reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown"
    }
}

#[test]
fn reasons() {
    assert_eq!(reason_phrase(200), "OK");
    assert_eq!(reason_phrase(504), "Gateway Timeout");
    assert_eq!(reason_phrase(299), "Unknown");
}
