//! Launchpad replayer (spec §4.10): replay operator-edited raw HTTP text
//! through the engine's own client, tagged so the setup modifier can link
//! the resulting transaction back to the launchpad that sent it.

use bytes::Bytes;
use http::{HeaderValue, Request};

use crate::error::{ErrorContext, OpaqueError};
use crate::id::TxId;
use crate::raw_http::{self, OriginalRequestContext};

const LAUNCHPAD_HEADER: &str = "x-launchpad-id";
const DEFAULT_USER_AGENT: &str = "marasi";

/// Client the replayer sends through; implemented by whatever routes a
/// request back through the engine's own proxy pipeline (spec §4.10:
/// "send via the engine's own HTTP client, which is configured to proxy
/// back through the engine").
pub trait ReplayClient: Send + Sync + 'static {
    fn send(&self, req: Request<Bytes>) -> impl Future<Output = Result<http::Response<Bytes>, OpaqueError>> + Send + '_;
}

/// Parse `raw_text`, tag it with `launchpad_id`, and send it through
/// `client` (spec §4.10).
pub async fn launch(
    client: &impl ReplayClient,
    raw_text: &str,
    launchpad_id: TxId,
    use_tls: bool,
) -> Result<http::Response<Bytes>, OpaqueError> {
    let recalculated = raw_http::recalculate_content_length(raw_text.as_bytes())
        .context("launchpad: recalculate content length")?;

    let host = extract_host(&recalculated).context("launchpad: request has no Host header")?;
    let scheme = if use_tls || raw_text.contains("https://") {
        "https"
    } else {
        "http"
    };

    let ctx = OriginalRequestContext {
        scheme: scheme.to_owned(),
        authority: host,
    };

    // rebuild_request always derives an absolute URI from ctx + the parsed
    // path, which already discards whatever request-URI the raw text had.
    let mut req = raw_http::rebuild_request(&recalculated, &ctx)
        .context("launchpad: rebuild request from raw text")?;

    req.headers_mut().insert(
        LAUNCHPAD_HEADER,
        HeaderValue::from_str(&launchpad_id.to_string()).context("launchpad id header value")?,
    );

    if !req.headers().contains_key(http::header::USER_AGENT) {
        req.headers_mut().insert(
            http::header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_USER_AGENT),
        );
    }

    client.send(req).await
}

fn extract_host(raw: &[u8]) -> Option<String> {
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers_buf);
    parsed.parse(raw).ok()?;
    parsed
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingClient {
        last: Mutex<Option<Request<Bytes>>>,
    }

    impl ReplayClient for RecordingClient {
        async fn send(&self, req: Request<Bytes>) -> Result<http::Response<Bytes>, OpaqueError> {
            *self.last.lock().unwrap() = Some(req);
            Ok(http::Response::builder().status(200).body(Bytes::new()).unwrap())
        }
    }

    #[tokio::test]
    async fn tags_request_with_launchpad_id_and_default_user_agent() {
        let client = RecordingClient { last: Mutex::new(None) };
        let raw = "GET /ping HTTP/1.1\r\nHost: echo.test\r\n\r\n";
        let id = TxId::new();

        launch(&client, raw, id, false).await.unwrap();

        let sent = client.last.lock().unwrap().take().unwrap();
        assert_eq!(
            sent.headers().get(LAUNCHPAD_HEADER).unwrap(),
            &id.to_string()
        );
        assert_eq!(sent.headers().get(http::header::USER_AGENT).unwrap(), DEFAULT_USER_AGENT);
        assert_eq!(sent.uri().scheme_str(), Some("http"));
    }

    #[tokio::test]
    async fn preserves_explicit_user_agent() {
        let client = RecordingClient { last: Mutex::new(None) };
        let raw = "GET / HTTP/1.1\r\nHost: echo.test\r\nUser-Agent: curl/8\r\n\r\n";

        launch(&client, raw, TxId::new(), true).await.unwrap();

        let sent = client.last.lock().unwrap().take().unwrap();
        assert_eq!(sent.headers().get(http::header::USER_AGENT).unwrap(), "curl/8");
        assert_eq!(sent.uri().scheme_str(), Some("https"));
    }

    #[tokio::test]
    async fn missing_host_header_fails() {
        let client = RecordingClient { last: Mutex::new(None) };
        let raw = "GET / HTTP/1.1\r\n\r\n";
        assert!(launch(&client, raw, TxId::new(), false).await.is_err());
    }
}
