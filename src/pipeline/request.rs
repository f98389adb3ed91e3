//! The default request chain (spec §4.5): prevent-loop, skip-CONNECT,
//! scope, setup, waypoint override, extensions, interception checkpoint,
//! persist.

use std::sync::atomic::Ordering;
use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Uri};

use crate::context::TxContext;
use crate::error::{ErrorContext, Kind, OpaqueError};
use crate::extension::Outcome as ExtOutcome;
use crate::id::TxId;
use crate::intercept::ItemKind;
use crate::persistence::{LaunchpadLink, PersistenceItem, RequestRecord};
use crate::raw_http::{self, OriginalRequestContext};

use super::{PipelineEnv, RequestOutcome, StepOutcome};

const LAUNCHPAD_HEADER: &str = "x-launchpad-id";

/// Run the default request chain against `req`, returning what the caller
/// should do next.
pub async fn run_request_chain(
    env: &PipelineEnv,
    ctx: &mut TxContext,
    req: &mut Request<Bytes>,
) -> RequestOutcome {
    if let Some(outcome) = apply(prevent_loop(env, ctx, req), ctx) {
        return outcome;
    }
    if let Some(outcome) = apply(Ok(skip_connect(req)), ctx) {
        return outcome;
    }
    if let Some(outcome) = apply(scope(env, ctx, req).await, ctx) {
        return outcome;
    }

    setup(ctx, req);

    if let Some(outcome) = apply(waypoint_override(env, ctx, req), ctx) {
        return outcome;
    }
    if let Some(outcome) = apply(extensions(env, ctx, req).await, ctx) {
        return outcome;
    }
    if let Some(outcome) = apply(interception(env, ctx, req).await, ctx) {
        return outcome;
    }

    persist(env, ctx, req).await;
    RequestOutcome::Proceed
}

/// Apply the return-value table's side effect for a single step's outcome,
/// returning `Some` only when the chain should stop here.
fn apply(outcome: Result<StepOutcome, OpaqueError>, ctx: &TxContext) -> Option<RequestOutcome> {
    match outcome {
        Ok(StepOutcome::Continue) => None,
        Ok(StepOutcome::SkipRest) => Some(RequestOutcome::Proceed),
        Ok(StepOutcome::Drop) => {
            if let Some(session) = ctx.session().and_then(|s| s.upgrade()) {
                session.mark_skip_round_trip();
            }
            Some(RequestOutcome::Dropped)
        }
        Err(err) => {
            tracing::warn!(error = %err, "request modifier failed, continuing (fail-open)");
            None
        }
    }
}

/// Step 1: if the target normalizes to the listener's own host:port, mark
/// skip-round-trip directly and stop (spec §4.5 step 1) -- this bypasses
/// the generic drop/skip-rest side-effect mapping above since the spec
/// pairs "mark skip-round-trip" with skip-rest here, not drop.
fn prevent_loop(
    env: &PipelineEnv,
    ctx: &TxContext,
    req: &Request<Bytes>,
) -> Result<StepOutcome, OpaqueError> {
    let Some(authority) = req.uri().authority() else {
        return Ok(StepOutcome::Continue);
    };
    let host = authority.host();
    let port = authority
        .port_u16()
        .unwrap_or_else(|| default_port(req.uri().scheme_str()));

    if hosts_equal(host, &env.listen_host) && port == env.listen_port {
        if let Some(session) = ctx.session().and_then(|s| s.upgrade()) {
            session.mark_skip_round_trip();
        }
        return Ok(StepOutcome::SkipRest);
    }
    Ok(StepOutcome::Continue)
}

fn default_port(scheme: Option<&str>) -> u16 {
    match scheme {
        Some("https") | Some("wss") => 443,
        _ => 80,
    }
}

fn normalize_host(host: &str) -> &str {
    if host.eq_ignore_ascii_case("localhost") {
        "127.0.0.1"
    } else {
        host
    }
}

fn hosts_equal(a: &str, b: &str) -> bool {
    normalize_host(a).eq_ignore_ascii_case(normalize_host(b))
}

/// Step 2: CONNECT tunnels are transparent above this layer.
fn skip_connect(req: &Request<Bytes>) -> StepOutcome {
    if req.method() == Method::CONNECT {
        StepOutcome::SkipRest
    } else {
        StepOutcome::Continue
    }
}

/// Step 3: the compass (scope) extension's `processRequest`.
async fn scope(
    env: &PipelineEnv,
    ctx: &mut TxContext,
    req: &mut Request<Bytes>,
) -> Result<StepOutcome, OpaqueError> {
    let outcome = env.scope_extension.process_request(ctx, req).await?;
    Ok(map_extension_outcome(outcome))
}

fn map_extension_outcome(outcome: ExtOutcome) -> StepOutcome {
    match outcome {
        ExtOutcome::Continue => StepOutcome::Continue,
        ExtOutcome::Skip => StepOutcome::SkipRest,
        ExtOutcome::Drop => StepOutcome::Drop,
    }
}

/// Step 4: assign the transaction identifier, stamp request-time, allocate
/// metadata, and pick up the launchpad correlation header if present.
fn setup(ctx: &mut TxContext, req: &mut Request<Bytes>) {
    if ctx.id().is_none() {
        ctx.set_id(TxId::new());
    }
    ctx.stamp_request_time();
    let _ = ctx.metadata_mut();

    if let Some(value) = req.headers_mut().remove(LAUNCHPAD_HEADER) {
        if let Ok(text) = value.to_str() {
            if let Ok(launchpad_id) = text.parse::<TxId>() {
                ctx.set_launchpad_id(launchpad_id);
                ctx.insert_metadata("launchpad_id", launchpad_id.to_string());
            }
        }
    }
}

/// Step 5: rewrite the dial target if the host:port has a waypoint
/// override registered.
fn waypoint_override(
    env: &PipelineEnv,
    ctx: &mut TxContext,
    req: &mut Request<Bytes>,
) -> Result<StepOutcome, OpaqueError> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return Ok(StepOutcome::Continue);
    };
    let Some(target) = env.waypoints.resolve(&authority) else {
        return Ok(StepOutcome::Continue);
    };

    ctx.insert_metadata("original_host", authority.clone());
    ctx.insert_metadata("override_host", target.clone());
    rewrite_authority(req, &target)?;
    Ok(StepOutcome::Continue)
}

fn rewrite_authority(req: &mut Request<Bytes>, target: &str) -> Result<(), OpaqueError> {
    let parts = req.uri().clone().into_parts();
    let mut builder = Uri::builder();
    if let Some(scheme) = parts.scheme {
        builder = builder.scheme(scheme);
    }
    builder = builder.authority(target.to_owned());
    if let Some(path_and_query) = parts.path_and_query {
        builder = builder.path_and_query(path_and_query);
    }
    let new_uri = builder.build().context("rewrite waypoint authority")?;
    *req.uri_mut() = new_uri;

    req.headers_mut().insert(
        http::header::HOST,
        HeaderValue::from_str(target).context("waypoint override host header")?,
    );
    Ok(())
}

/// Step 6: run every loaded, non-core extension's `processRequest` under
/// its own lock, skipping any extension the transaction itself originated
/// from (anti-recursion, spec §4.5 step 6).
async fn extensions(
    env: &PipelineEnv,
    ctx: &mut TxContext,
    req: &mut Request<Bytes>,
) -> Result<StepOutcome, OpaqueError> {
    for extension in &env.extensions {
        if extension.originated(ctx) {
            continue;
        }
        if !extension.capabilities().process_request {
            continue;
        }
        match extension.process_request(ctx, req).await {
            Ok(ExtOutcome::Continue) => {}
            Ok(ExtOutcome::Skip) => return Ok(StepOutcome::SkipRest),
            Ok(ExtOutcome::Drop) => return Ok(StepOutcome::Drop),
            Err(err) => {
                tracing::warn!(error = %err, extension = %extension.id(), "extension processRequest failed, continuing");
            }
        }
    }
    Ok(StepOutcome::Continue)
}

/// Step 7: ask the checkpoint extension (or the global intercept-all flag)
/// whether this request should be intercepted, and if so, wait for the
/// operator's decision.
async fn interception(
    env: &PipelineEnv,
    ctx: &mut TxContext,
    req: &mut Request<Bytes>,
) -> Result<StepOutcome, OpaqueError> {
    let wants_intercept = env
        .checkpoint_extension
        .should_intercept_request(ctx, req)
        .await
        .unwrap_or(false)
        || env.global_intercept_all.load(Ordering::SeqCst);

    if !wants_intercept {
        return Ok(StepOutcome::Continue);
    }

    let id = ctx
        .id()
        .ok_or_else(|| OpaqueError::new(Kind::MissingIdentifier))?;
    let dump = raw_http::dump_request(req).context("dump request for interception")?;
    let decision = env.coordinator.intercept(id, ItemKind::Request, dump.raw).await;

    if !decision.resume {
        return Ok(StepOutcome::Drop);
    }

    let recalculated = raw_http::recalculate_content_length(&decision.raw)
        .context("recalculate content length after interception")?;
    let original_ctx = OriginalRequestContext {
        scheme: req.uri().scheme_str().unwrap_or("http").to_owned(),
        authority: req
            .uri()
            .authority()
            .ok_or_else(|| {
                OpaqueError::new(Kind::RebuildFailed(OpaqueError::new(
                    "intercepted request missing authority",
                )))
            })?
            .to_string(),
    };
    *req = raw_http::rebuild_request(&recalculated, &original_ctx)
        .context("rebuild request after interception")?;

    if decision.also_intercept_response {
        ctx.flags_mut().set_should_intercept_response();
    }
    Ok(StepOutcome::Continue)
}

/// Step 8: enqueue a request record, plus a launchpad-link record if this
/// transaction correlates to a launchpad replay.
async fn persist(env: &PipelineEnv, ctx: &TxContext, req: &Request<Bytes>) {
    if ctx.flags().do_not_persist() {
        return;
    }
    let Some(id) = ctx.id() else {
        tracing::warn!("persist request: transaction id missing, skipping");
        return;
    };

    let record = RequestRecord {
        id,
        method: req.method().to_string(),
        url: req.uri().to_string(),
        headers: header_pairs(req),
        body: req.body().clone(),
        at: ctx.request_time().unwrap_or_else(SystemTime::now),
    };
    if let Err(err) = env
        .persistence
        .enqueue(PersistenceItem::Request(record.clone()))
        .await
    {
        tracing::error!(error = %err, "persist request failed");
    } else {
        env.hooks.fire_request(&record);
    }

    if let Some(launchpad_id) = ctx.launchpad_id() {
        let link = LaunchpadLink {
            request_id: id,
            launchpad_id,
        };
        if let Err(err) = env
            .persistence
            .enqueue(PersistenceItem::LaunchpadLink(link))
            .await
        {
            tracing::error!(error = %err, "persist launchpad link failed");
        }
    }
}

fn header_pairs(req: &Request<Bytes>) -> Vec<(String, String)> {
    req.headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{Capabilities, Extension, ExtensionKind, LoadedExtension};
    use crate::intercept::Coordinator;
    use crate::persistence::{
        LogEntry, LogRepository, Repositories, StatsRepository, TrafficRepository, spawn_writer,
    };
    use crate::waypoint::Waypoints;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    struct NoopCore(TxId, ExtensionKind);
    impl Extension for NoopCore {
        fn id(&self) -> TxId {
            self.0
        }
        fn kind(&self) -> ExtensionKind {
            self.1
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
    }

    #[derive(Default)]
    struct NullRepos;
    impl TrafficRepository for NullRepos {
        async fn insert_request(
            &self,
            _record: crate::persistence::RequestRecord,
        ) -> Result<(), OpaqueError> {
            Ok(())
        }
        async fn insert_response(
            &self,
            _record: crate::persistence::ResponseRecord,
        ) -> Result<(), OpaqueError> {
            Ok(())
        }
    }
    impl crate::persistence::LaunchpadRepository for NullRepos {
        async fn link(&self, _link: LaunchpadLink) -> Result<(), OpaqueError> {
            Ok(())
        }
    }
    impl LogRepository for NullRepos {
        async fn insert(&self, _entry: LogEntry) -> Result<(), OpaqueError> {
            Ok(())
        }
    }
    impl StatsRepository for NullRepos {
        async fn increment(&self, _counter: &'static str) -> Result<(), OpaqueError> {
            Ok(())
        }
    }
    impl Repositories for NullRepos {
        type Traffic = NullRepos;
        type Launchpad = NullRepos;
        type Log = NullRepos;
        type Stats = NullRepos;
        fn traffic(&self) -> &NullRepos {
            self
        }
        fn launchpad(&self) -> &NullRepos {
            self
        }
        fn log(&self) -> &NullRepos {
            self
        }
        fn stats(&self) -> &NullRepos {
            self
        }
    }

    fn test_env() -> PipelineEnv {
        PipelineEnv {
            listen_host: "127.0.0.1".into(),
            listen_port: 8080,
            scope_extension: LoadedExtension::new(NoopCore(TxId::new(), ExtensionKind::Scope)),
            checkpoint_extension: LoadedExtension::new(NoopCore(
                TxId::new(),
                ExtensionKind::Checkpoint,
            )),
            extensions: Vec::new(),
            waypoints: Waypoints::new(),
            coordinator: Coordinator::new(),
            persistence: spawn_writer(NullRepos),
            global_intercept_all: Arc::new(AtomicBool::new(false)),
            hooks: crate::hooks::Hooks::new(),
        }
    }

    #[tokio::test]
    async fn prevent_loop_marks_skip_round_trip_for_self_targeted_requests() {
        let env = test_env();
        let mut ctx = TxContext::new();
        let mut req = Request::builder()
            .uri("http://127.0.0.1:8080/")
            .body(Bytes::new())
            .unwrap();

        let outcome = run_request_chain(&env, &mut ctx, &mut req).await;
        assert_eq!(outcome, RequestOutcome::Proceed);
    }

    #[tokio::test]
    async fn connect_requests_skip_the_rest_of_the_chain() {
        let env = test_env();
        let mut ctx = TxContext::new();
        let mut req = Request::builder()
            .method(Method::CONNECT)
            .uri("a.test:443")
            .body(Bytes::new())
            .unwrap();

        let outcome = run_request_chain(&env, &mut ctx, &mut req).await;
        assert_eq!(outcome, RequestOutcome::Proceed);
        // setup never ran past skip-connect, so no transaction id was assigned
        assert!(ctx.id().is_none());
    }

    #[tokio::test]
    async fn setup_assigns_identifier_and_strips_launchpad_header() {
        let env = test_env();
        let mut ctx = TxContext::new();
        let launchpad_id = TxId::new();
        let mut req = Request::builder()
            .uri("http://a.test/")
            .header(LAUNCHPAD_HEADER, launchpad_id.to_string())
            .body(Bytes::new())
            .unwrap();

        let outcome = run_request_chain(&env, &mut ctx, &mut req).await;
        assert_eq!(outcome, RequestOutcome::Proceed);
        assert!(ctx.id().is_some());
        assert_eq!(ctx.launchpad_id(), Some(launchpad_id));
        assert!(!req.headers().contains_key(LAUNCHPAD_HEADER));
    }

    #[tokio::test]
    async fn waypoint_override_rewrites_authority_and_host_header() {
        let env = test_env();
        env.waypoints
            .sync(&StaticWaypoints(vec![("a.test:80".into(), "b.test:80".into())]))
            .await
            .unwrap();

        let mut ctx = TxContext::new();
        let mut req = Request::builder()
            .uri("http://a.test/path")
            .header(http::header::HOST, "a.test")
            .body(Bytes::new())
            .unwrap();

        run_request_chain(&env, &mut ctx, &mut req).await;

        assert_eq!(req.uri().authority().unwrap().as_str(), "b.test:80");
        assert_eq!(req.headers().get(http::header::HOST).unwrap(), "b.test:80");
        assert_eq!(
            ctx.metadata().unwrap().get("original_host"),
            Some(&crate::context::MetaValue::Str("a.test:80".into()))
        );
    }

    struct StaticWaypoints(Vec<(String, String)>);
    impl crate::persistence::WaypointRepository for StaticWaypoints {
        async fn load_all(&self) -> Result<Vec<(String, String)>, OpaqueError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn interception_step_surfaces_missing_identifier_kind() {
        let env = test_env();
        env.global_intercept_all.store(true, Ordering::SeqCst);
        let mut ctx = TxContext::new();
        let mut req = Request::builder()
            .uri("http://a.test/")
            .body(Bytes::new())
            .unwrap();

        let err = interception(&env, &mut ctx, &mut req).await.unwrap_err();
        assert_eq!(err.to_string(), crate::error::Kind::MissingIdentifier.to_string());
    }
}
