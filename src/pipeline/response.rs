//! The default response chain (spec §4.5): filter, buffer body,
//! decompress, scope, extensions, interception checkpoint, persist.

use std::time::SystemTime;

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder};
use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response};
use tokio::io::{AsyncReadExt, BufReader};

use crate::context::TxContext;
use crate::error::{ErrorContext, Kind, OpaqueError};
use crate::extension::Outcome as ExtOutcome;
use crate::intercept::ItemKind;
use crate::persistence::{PersistenceItem, ResponseRecord};
use crate::raw_http;

use super::{PipelineEnv, ResponseOutcome, StepOutcome};

/// Run the default response chain against `res`, returning what the
/// caller should do next.
pub async fn run_response_chain(
    env: &PipelineEnv,
    ctx: &mut TxContext,
    req: &Request<Bytes>,
    res: &mut Response<Bytes>,
) -> ResponseOutcome {
    if let Some(outcome) = apply(Ok(filter(ctx, req)), ctx) {
        return outcome;
    }
    if let Some(outcome) = apply(buffer_body(res), ctx) {
        return outcome;
    }
    if let Some(outcome) = apply(decompress(res).await, ctx) {
        return outcome;
    }
    if let Some(outcome) = apply(scope(env, ctx, res).await, ctx) {
        return outcome;
    }
    if let Some(outcome) = apply(extensions(env, ctx, res).await, ctx) {
        return outcome;
    }
    if let Some(outcome) = apply(interception(env, ctx, res).await, ctx) {
        return outcome;
    }

    persist(env, ctx, res).await;
    ResponseOutcome::Deliver
}

fn apply(outcome: Result<StepOutcome, OpaqueError>, ctx: &TxContext) -> Option<ResponseOutcome> {
    match outcome {
        Ok(StepOutcome::Continue) => None,
        Ok(StepOutcome::SkipRest) => Some(ResponseOutcome::Deliver),
        Ok(StepOutcome::Drop) => {
            if let Some(session) = ctx.session().and_then(|s| s.upgrade()) {
                session.hijack_and_close();
            }
            Some(ResponseOutcome::Dropped)
        }
        Err(err) => {
            tracing::warn!(error = %err, "response modifier failed, continuing (fail-open)");
            None
        }
    }
}

/// Step 1: CONNECT requests, skip-round-trip sessions, and transactions
/// carrying `skip` never run the response chain.
fn filter(ctx: &mut TxContext, req: &Request<Bytes>) -> StepOutcome {
    ctx.stamp_response_time();

    let skip_round_trip = ctx
        .session()
        .and_then(|s| s.upgrade())
        .map(|s| s.should_skip_round_trip())
        .unwrap_or(false);

    if req.method() == Method::CONNECT || skip_round_trip || ctx.flags().skip() {
        StepOutcome::SkipRest
    } else {
        StepOutcome::Continue
    }
}

/// Step 2: the body is already fully buffered by the time it reaches the
/// pipeline; this step only normalizes the framing headers to match.
fn buffer_body(res: &mut Response<Bytes>) -> Result<StepOutcome, OpaqueError> {
    res.headers_mut().remove(http::header::TRANSFER_ENCODING);
    let len = res.body().len();
    res.headers_mut().insert(
        http::header::CONTENT_LENGTH,
        HeaderValue::from_str(&len.to_string()).context("buffer body: content-length header")?,
    );
    Ok(StepOutcome::Continue)
}

/// Step 3: decode `gzip`/`br` bodies in place; unknown encodings are left
/// intact (spec §4.5 step 3).
async fn decompress(res: &mut Response<Bytes>) -> Result<StepOutcome, OpaqueError> {
    let Some(encoding) = res
        .headers()
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return Ok(StepOutcome::Continue);
    };

    let decoded = match encoding.as_str() {
        "gzip" => Some(decode(GzipDecoder::new(BufReader::new(res.body().as_ref()))).await?),
        "br" => Some(decode(BrotliDecoder::new(BufReader::new(res.body().as_ref()))).await?),
        _ => None,
    };

    if let Some(decoded) = decoded {
        res.headers_mut().remove(http::header::CONTENT_ENCODING);
        res.headers_mut().insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_str(&decoded.len().to_string())
                .context("decompress: content-length header")?,
        );
        *res.body_mut() = Bytes::from(decoded);
    }
    Ok(StepOutcome::Continue)
}

async fn decode<R>(mut decoder: R) -> Result<Vec<u8>, OpaqueError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .await
        .map_err(|e| OpaqueError::new(Kind::DecompressFailed(OpaqueError::new(e))))?;
    Ok(out)
}

/// Step 4: the compass (scope) extension's `processResponse`.
async fn scope(
    env: &PipelineEnv,
    ctx: &mut TxContext,
    res: &mut Response<Bytes>,
) -> Result<StepOutcome, OpaqueError> {
    let outcome = env.scope_extension.process_response(ctx, res).await?;
    Ok(map_extension_outcome(outcome))
}

fn map_extension_outcome(outcome: ExtOutcome) -> StepOutcome {
    match outcome {
        ExtOutcome::Continue => StepOutcome::Continue,
        ExtOutcome::Skip => StepOutcome::SkipRest,
        ExtOutcome::Drop => StepOutcome::Drop,
    }
}

/// Step 5: every loaded, non-core extension's `processResponse`.
async fn extensions(
    env: &PipelineEnv,
    ctx: &mut TxContext,
    res: &mut Response<Bytes>,
) -> Result<StepOutcome, OpaqueError> {
    for extension in &env.extensions {
        if extension.originated(ctx) {
            continue;
        }
        if !extension.capabilities().process_response {
            continue;
        }
        match extension.process_response(ctx, res).await {
            Ok(ExtOutcome::Continue) => {}
            Ok(ExtOutcome::Skip) => return Ok(StepOutcome::SkipRest),
            Ok(ExtOutcome::Drop) => return Ok(StepOutcome::Drop),
            Err(err) => {
                tracing::warn!(error = %err, extension = %extension.id(), "extension processResponse failed, continuing");
            }
        }
    }
    Ok(StepOutcome::Continue)
}

/// Step 6: analogous to the request chain's interception checkpoint, but
/// also forced when the request phase set `should-intercept-response`.
async fn interception(
    env: &PipelineEnv,
    ctx: &mut TxContext,
    res: &mut Response<Bytes>,
) -> Result<StepOutcome, OpaqueError> {
    let wants_intercept = ctx.flags().should_intercept_response()
        || env
            .checkpoint_extension
            .should_intercept_response(ctx, res)
            .await
            .unwrap_or(false);

    if !wants_intercept {
        return Ok(StepOutcome::Continue);
    }

    let id = ctx
        .id()
        .ok_or_else(|| OpaqueError::new(Kind::MissingIdentifier))?;
    let dump = raw_http::dump_response(res).context("dump response for interception")?;
    let decision = env.coordinator.intercept(id, ItemKind::Response, dump.raw).await;

    if !decision.resume {
        return Ok(StepOutcome::Drop);
    }

    let recalculated = raw_http::recalculate_content_length(&decision.raw)
        .context("recalculate content length after interception")?;
    *res = raw_http::rebuild_response(&recalculated, &Request::new(Bytes::new()))
        .context("rebuild response after interception")?;
    Ok(StepOutcome::Continue)
}

/// Step 7: enqueue a response record, with the canonical content-type
/// spec §4.5 step 7 requires: `text/plain` for redirects, the parsed media
/// type otherwise, defaulting to `application/octet-stream`.
async fn persist(env: &PipelineEnv, ctx: &TxContext, res: &Response<Bytes>) {
    if ctx.flags().do_not_persist() {
        return;
    }
    let Some(id) = ctx.id() else {
        tracing::warn!("persist response: transaction id missing, skipping");
        return;
    };

    let record = ResponseRecord {
        id,
        status: res.status().as_u16(),
        headers: header_pairs(res),
        body: res.body().clone(),
        content_type: canonical_content_type(res),
        at: ctx.response_time().unwrap_or_else(SystemTime::now),
    };
    if let Err(err) = env
        .persistence
        .enqueue(PersistenceItem::Response(record.clone()))
        .await
    {
        tracing::error!(error = %err, "persist response failed");
    } else {
        env.hooks.fire_response(&record);
    }
}

fn canonical_content_type(res: &Response<Bytes>) -> String {
    if res.status().is_redirection() {
        return "text/plain".to_owned();
    }
    res.headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<mime::Mime>().ok())
        .map(|m| m.essence_str().to_owned())
        .unwrap_or_else(|| "application/octet-stream".to_owned())
}

fn header_pairs(res: &Response<Bytes>) -> Vec<(String, String)> {
    res.headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
