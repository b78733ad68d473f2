// src/http.rs
//
// Minimal incremental HTTP/1.x request parser for the two methods the
// gateway accepts, plus response header emission and URL helpers.

pub const INBUF_SIZE: usize = 4096;

pub const CONTENT_MP2T: &str = "video/mp2t";
pub const CONTENT_M3U: &str = "audio/x-mpegurl";
pub const CONTENT_HTML: &str = "text/html";
pub const CONTENT_JSON: &str = "application/json";
pub const CONTENT_SSE: &str = "text/event-stream";

#[derive(Debug, Default, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub hostname: String,
    pub user_agent: String,
    pub accept: String,
    pub x_request_snapshot: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    NeedMore,
    Complete,
    Error,
}

/// Parse a request out of `buf[..len]`. Headers live entirely in the input
/// buffer; the request is complete at the first CRLF-CRLF. Request bodies
/// are not accepted.
pub fn parse_request(buf: &[u8], req: &mut HttpRequest) -> ParseResult {
    let end = match find_headers_end(buf) {
        Some(e) => e,
        None => return ParseResult::NeedMore,
    };
    let head = match std::str::from_utf8(&buf[..end]) {
        Ok(s) => s,
        Err(_) => return ParseResult::Error,
    };

    let mut lines = head.split("\r\n");
    let request_line = match lines.next() {
        Some(l) if !l.is_empty() => l,
        _ => return ParseResult::Error,
    };
    let mut parts = request_line.split_whitespace();
    let (method, url, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m, u, v),
        _ => return ParseResult::Error,
    };
    if !version.starts_with("HTTP/") {
        return ParseResult::Error;
    }
    if !method.eq_ignore_ascii_case("GET") && !method.eq_ignore_ascii_case("HEAD") {
        return ParseResult::Error;
    }

    req.method = method.to_string();
    req.url = url.to_string();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = match line.split_once(':') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => continue, // tolerate malformed header lines
        };
        if name.eq_ignore_ascii_case("Host") {
            req.hostname = value.to_string();
        } else if name.eq_ignore_ascii_case("User-Agent") {
            req.user_agent = value.to_string();
        } else if name.eq_ignore_ascii_case("Accept") {
            req.accept = value.to_string();
        } else if name.eq_ignore_ascii_case("X-Request-Snapshot") {
            req.x_request_snapshot = true;
        }
    }
    ParseResult::Complete
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Percent-decode a path component. Returns None on a truncated or non-hex
/// escape (the decoder itself passes those through, so they are rejected up
/// front). Idempotent on strings that contain no '%'.
pub fn url_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return None;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    percent_encoding::percent_decode_str(s)
        .decode_utf8()
        .ok()
        .map(|c| c.into_owned())
}

/// Extract one query parameter, decoded ('+' and percent escapes).
pub fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k.as_ref() == name)
        .map(|(_, v)| v.into_owned())
}

pub fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        401 => "401 Unauthorized",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        503 => "503 Service Unavailable",
        _ => "500 Internal Server Error",
    }
}

/// Render response headers. `extra` lines must be CRLF-terminated.
pub fn response_headers(status: u16, content_type: &str, extra: Option<&str>) -> String {
    let mut out = String::with_capacity(160);
    out.push_str("HTTP/1.1 ");
    out.push_str(status_line(status));
    out.push_str("\r\nServer: rtpgate\r\nConnection: close\r\nContent-Type: ");
    out.push_str(content_type);
    out.push_str("\r\n");
    if let Some(e) = extra {
        out.push_str(e);
    }
    out.push_str("\r\n");
    out
}

/// Short error page body for the non-media responses.
pub fn error_body(status: u16) -> String {
    format!("<html><body><h1>{}</h1></body></html>\n", status_line(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> (ParseResult, HttpRequest) {
        let mut req = HttpRequest::default();
        let r = parse_request(s.as_bytes(), &mut req);
        (r, req)
    }

    #[test]
    fn complete_request() {
        let (r, req) = parse("GET /ch1?a=1 HTTP/1.1\r\nHost: gw:8080\r\nUser-Agent: vlc\r\n\r\n");
        assert_eq!(r, ParseResult::Complete);
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/ch1?a=1");
        assert_eq!(req.hostname, "gw:8080");
        assert_eq!(req.user_agent, "vlc");
    }

    #[test]
    fn incomplete_needs_more() {
        let (r, _) = parse("GET /ch1 HTTP/1.1\r\nHost: gw\r\n");
        assert_eq!(r, ParseResult::NeedMore);
    }

    #[test]
    fn buffer_full_of_headers_without_terminator_is_need_more() {
        let mut s = String::from("GET /ch1 HTTP/1.1\r\n");
        while s.len() < INBUF_SIZE {
            s.push_str("X-Fill: yes\r\n");
        }
        s.truncate(INBUF_SIZE);
        let (r, _) = parse(&s);
        assert_eq!(r, ParseResult::NeedMore);
    }

    #[test]
    fn rejects_bad_method_and_version() {
        let (r, _) = parse("POST / HTTP/1.1\r\n\r\n");
        assert_eq!(r, ParseResult::Error);
        let (r, _) = parse("GET /\r\n\r\n");
        assert_eq!(r, ParseResult::Error);
    }

    #[test]
    fn snapshot_header_flag() {
        let (r, req) = parse("GET /ch1 HTTP/1.1\r\nX-Request-Snapshot: 1\r\n\r\n");
        assert_eq!(r, ParseResult::Complete);
        assert!(req.x_request_snapshot);
    }

    #[test]
    fn url_decode_basics() {
        assert_eq!(url_decode("a%20b").unwrap(), "a b");
        assert_eq!(url_decode("a+b").unwrap(), "a+b"); // '+' is literal in paths
        assert_eq!(url_decode("plain").unwrap(), "plain");
        assert!(url_decode("bad%2").is_none());
        assert!(url_decode("bad%zz").is_none());
    }

    #[test]
    fn url_decode_idempotent_without_percent() {
        let s = "already decoded path";
        assert_eq!(url_decode(s).unwrap(), s);
        assert_eq!(url_decode(&url_decode(s).unwrap()).unwrap(), s);
    }

    #[test]
    fn query_param_lookup_decodes_values() {
        let q = "fcc=10.0.0.1%3A8027&snapshot=1&r2h-token=abc";
        assert_eq!(query_param(q, "snapshot").as_deref(), Some("1"));
        assert_eq!(query_param(q, "fcc").as_deref(), Some("10.0.0.1:8027"));
        assert_eq!(query_param(q, "missing"), None);
        assert_eq!(query_param("name=a+b", "name").as_deref(), Some("a b"));
        assert_eq!(query_param("bare&x=1", "bare").as_deref(), Some(""));
    }

    #[test]
    fn response_header_shape() {
        let h = response_headers(200, CONTENT_MP2T, None);
        assert!(h.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(h.ends_with("\r\n\r\n"));
        assert!(h.contains("Content-Type: video/mp2t\r\n"));
    }
}
