//! Head serialization for requests and responses.

use bytes::BytesMut;
use http::{
    HeaderMap, Method, StatusCode,
    header::{CONNECTION, CONTENT_LENGTH, DATE, HOST},
};

/// Write a response status line and headers. `Content-Length`, `Date` and
/// `Connection` are owned by the server; caller-provided copies are
/// skipped.
pub fn response_head(
    dst: &mut BytesMut,
    status: StatusCode,
    headers: &HeaderMap,
    content_length: u64,
    date: &str,
    close: bool,
) {
    let mut itoa_buf = itoa::Buffer::new();

    dst.extend_from_slice(b"HTTP/1.1 ");
    dst.extend_from_slice(status.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == DATE || name == CONNECTION {
            continue;
        }
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(b"content-length: ");
    dst.extend_from_slice(itoa_buf.format(content_length).as_bytes());
    dst.extend_from_slice(b"\r\ndate: ");
    dst.extend_from_slice(date.as_bytes());
    dst.extend_from_slice(b"\r\n");
    if close {
        dst.extend_from_slice(b"connection: close\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

/// Write a request line and headers. `Host` and `Content-Length` are
/// derived from the call; caller-provided copies are skipped.
pub fn request_head(
    dst: &mut BytesMut,
    method: &Method,
    path: &str,
    host: &str,
    headers: &HeaderMap,
    content_length: u64,
) {
    let mut itoa_buf = itoa::Buffer::new();

    dst.extend_from_slice(method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(path.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\nhost: ");
    dst.extend_from_slice(host.as_bytes());
    dst.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    if content_length > 0 || !matches!(*method, Method::GET | Method::HEAD) {
        dst.extend_from_slice(b"content-length: ");
        dst.extend_from_slice(itoa_buf.format(content_length).as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod test {
    use super::*;
    use http::header::HeaderValue;

    #[test]
    fn response_head_includes_managed_headers_once() {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("yes"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));

        let mut dst = BytesMut::new();
        response_head(
            &mut dst,
            StatusCode::OK,
            &headers,
            5,
            "Thu, 01 Jan 1970 00:00:00 GMT",
            true,
        );

        let head = std::str::from_utf8(&dst).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("x-custom: yes\r\n"));
        assert!(head.contains("content-length: 5\r\n"));
        assert!(!head.contains("999"));
        assert!(head.contains("connection: close\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_head_for_get_has_no_content_length() {
        let mut dst = BytesMut::new();
        request_head(&mut dst, &Method::GET, "/x", "example.com:8080", &HeaderMap::new(), 0);
        let head = std::str::from_utf8(&dst).unwrap();
        assert!(head.starts_with("GET /x HTTP/1.1\r\nhost: example.com:8080\r\n"));
        assert!(!head.contains("content-length"));
    }

    #[test]
    fn request_head_for_post_carries_length() {
        let mut dst = BytesMut::new();
        request_head(&mut dst, &Method::POST, "/submit", "h", &HeaderMap::new(), 11);
        let head = std::str::from_utf8(&dst).unwrap();
        assert!(head.contains("content-length: 11\r\n"));
    }
}
