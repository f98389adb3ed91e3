//! Raw-HTTP utilities (spec §4.9): capturing an in-flight request/response
//! as raw bytes for the interception UI, normalizing Content-Length after
//! an operator edits the raw bytes, and rebuilding typed requests/responses
//! from the edited bytes afterward.

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri, Version};

use crate::error::{ErrorContext, Kind, OpaqueError};

/// Raw bytes plus a human-readable rendering for the interception UI
/// (empty string when the body isn't a format worth prettifying).
pub struct RawDump {
    pub raw: Bytes,
    pub pretty: String,
}

/// The context needed to restore a request after it round-trips through
/// raw bytes (spec §4.9: "for requests, restore the original context and
/// URL scheme").
#[derive(Debug, Clone)]
pub struct OriginalRequestContext {
    pub scheme: String,
    pub authority: String,
}

/// Serialize `req` to raw HTTP/1.1 bytes and a prettified rendering,
/// leaving the body re-readable by whoever calls this next (spec §4.9:
/// "reinstall the body so downstream modifiers can re-read").
pub fn dump_request(req: &Request<Bytes>) -> Result<RawDump, OpaqueError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let request_line = format!("{} {} HTTP/1.1", req.method(), path);
    let raw = render(&request_line, req.headers(), req.body());
    let pretty = prettify(req.headers(), req.body());
    Ok(RawDump { raw, pretty })
}

/// Serialize `res` to raw HTTP/1.1 bytes and a prettified rendering.
pub fn dump_response(res: &Response<Bytes>) -> Result<RawDump, OpaqueError> {
    let status = res.status();
    let status_line = format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    let raw = render(&status_line, res.headers(), res.body());
    let pretty = prettify(res.headers(), res.body());
    Ok(RawDump { raw, pretty })
}

fn render(start_line: &str, headers: &HeaderMap, body: &Bytes) -> Bytes {
    let mut out = Vec::with_capacity(start_line.len() + body.len() + 128);
    out.extend_from_slice(start_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    Bytes::from(out)
}

fn prettify(headers: &HeaderMap, body: &Bytes) -> String {
    if body.is_empty() {
        return String::new();
    }
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.contains("json") {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            return serde_json::to_string_pretty(&value).unwrap_or_default();
        }
    }
    if content_type.contains("xml") || content_type.contains("html") {
        return String::from_utf8_lossy(body).into_owned();
    }
    String::new()
}

/// Normalize `raw`'s Content-Length header (spec §4.9):
/// - normalize line endings to CRLF
/// - split on the header/body boundary
/// - drop any existing `content-length:` header (case-insensitive)
/// - append a new one reflecting the body length (omitted if empty)
/// - rejoin with CRLF
///
/// Idempotent: running this twice on its own output is a no-op.
pub fn recalculate_content_length(raw: &[u8]) -> Result<Bytes, OpaqueError> {
    recalculate_content_length_inner(raw)
        .map_err(|e| OpaqueError::new(Kind::RebuildFailed(e)))
}

fn recalculate_content_length_inner(raw: &[u8]) -> Result<Bytes, OpaqueError> {
    let normalized = normalize_line_endings(raw);
    let boundary = find_header_body_boundary(&normalized)
        .ok_or_else(|| OpaqueError::new("no header/body boundary found"))?;

    let head = &normalized[..boundary];
    let body = &normalized[boundary + 2..];

    let mut lines: Vec<&[u8]> = head.split(|&b| b == b'\n').map(strip_trailing_cr).collect();
    let start_line = lines.remove(0);

    lines.retain(|line| !starts_with_ci(line, b"content-length:"));

    let mut out = Vec::with_capacity(normalized.len() + 32);
    out.extend_from_slice(start_line);
    out.extend_from_slice(b"\r\n");
    for line in lines {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);

    Ok(Bytes::from(out))
}

fn normalize_line_endings(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\r' {
            if raw.get(i + 1) == Some(&b'\n') {
                out.push(b'\n');
                i += 2;
                continue;
            }
            out.push(b'\n');
            i += 1;
            continue;
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

fn find_header_body_boundary(normalized: &[u8]) -> Option<usize> {
    // after normalize_line_endings, headers are separated from the body by
    // a blank line: "\n\n"
    normalized.windows(2).position(|w| w == b"\n\n")
}

fn strip_trailing_cr(line: &[u8]) -> &[u8] {
    if line.last() == Some(&b'\r') {
        &line[..line.len() - 1]
    } else {
        line
    }
}

fn starts_with_ci(haystack: &[u8], prefix: &[u8]) -> bool {
    haystack.len() >= prefix.len()
        && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Parse `raw` (already recalculated) into a typed request, restoring the
/// scheme and authority that raw HTTP/1.1 bytes don't carry (spec §4.9).
pub fn rebuild_request(
    raw: &[u8],
    original_ctx: &OriginalRequestContext,
) -> Result<Request<Bytes>, OpaqueError> {
    rebuild_request_inner(raw, original_ctx).map_err(|e| OpaqueError::new(Kind::RebuildFailed(e)))
}

fn rebuild_request_inner(
    raw: &[u8],
    original_ctx: &OriginalRequestContext,
) -> Result<Request<Bytes>, OpaqueError> {
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers_buf);
    let body_start = parsed
        .parse(raw)
        .context("parse raw request")?
        .unwrap()
        .max(0);

    let method = parsed
        .method
        .ok_or_else(|| OpaqueError::new("raw request missing method"))?;
    let path = parsed
        .path
        .ok_or_else(|| OpaqueError::new("raw request missing path"))?;

    let uri: Uri = format!("{}://{}{}", original_ctx.scheme, original_ctx.authority, path)
        .parse()
        .context("rebuild request uri")?;

    let mut builder = Request::builder()
        .method(Method::from_bytes(method.as_bytes()).context("rebuild request method")?)
        .uri(uri)
        .version(Version::HTTP_11);

    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    let body = Bytes::copy_from_slice(&raw[body_start..]);
    builder.body(body).context("build rebuilt request")
}

/// Parse `raw` (already recalculated) into a typed response.
pub fn rebuild_response(raw: &[u8], _req: &Request<Bytes>) -> Result<Response<Bytes>, OpaqueError> {
    rebuild_response_inner(raw).map_err(|e| OpaqueError::new(Kind::RebuildFailed(e)))
}

fn rebuild_response_inner(raw: &[u8]) -> Result<Response<Bytes>, OpaqueError> {
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers_buf);
    let body_start = parsed
        .parse(raw)
        .context("parse raw response")?
        .unwrap()
        .max(0);

    let status = parsed
        .code
        .ok_or_else(|| OpaqueError::new("raw response missing status code"))?;

    let mut builder = Response::builder()
        .status(status)
        .version(Version::HTTP_11);

    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    let body = Bytes::copy_from_slice(&raw[body_start..]);
    builder.body(body).context("build rebuilt response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recalculate_is_idempotent_and_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nHost: a.test\r\nContent-Length: 999\r\n\r\nhi";
        let once = recalculate_content_length(raw).unwrap();
        let twice = recalculate_content_length(&once).unwrap();
        assert_eq!(once, twice);
        assert!(String::from_utf8_lossy(&once).contains("content-length: 2"));
        assert!(!String::from_utf8_lossy(&once).contains("Content-Length: 999"));
    }

    #[test]
    fn recalculate_omits_header_for_empty_body() {
        let raw = b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n";
        let out = recalculate_content_length(raw).unwrap();
        assert!(!String::from_utf8_lossy(&out).to_lowercase().contains("content-length"));
    }

    #[test]
    fn malformed_raw_bytes_fail_as_rebuild_failed_kind() {
        let err = recalculate_content_length(b"not even close to http").unwrap_err();
        assert!(err.to_string().starts_with("rebuilding request/response from intercepted raw bytes failed"));
    }

    #[test]
    fn dump_and_rebuild_request_round_trips() {
        let req = Request::builder()
            .method("POST")
            .uri("https://a.test/path?x=1")
            .header("host", "a.test")
            .body(Bytes::from_static(b"{\"a\":1}"))
            .unwrap();

        let dump = dump_request(&req).unwrap();
        let recalculated = recalculate_content_length(&dump.raw).unwrap();
        let ctx = OriginalRequestContext {
            scheme: "https".into(),
            authority: "a.test".into(),
        };
        let rebuilt = rebuild_request(&recalculated, &ctx).unwrap();

        assert_eq!(rebuilt.method(), "POST");
        assert_eq!(rebuilt.uri().path(), "/path");
        assert_eq!(rebuilt.body(), &Bytes::from_static(b"{\"a\":1}"));
    }

    #[test]
    fn prettify_renders_json_bodies() {
        let req = Request::builder()
            .method("POST")
            .uri("https://a.test/")
            .header("content-type", "application/json")
            .body(Bytes::from_static(b"{\"a\":1}"))
            .unwrap();
        let dump = dump_request(&req).unwrap();
        assert!(dump.pretty.contains('\n'), "pretty-printed json should span multiple lines");
    }
}
