//! Scripted-extension adapter (spec §4.5 steps 3/6, Design Notes
//! "Extension polymorphism"): marshals requests/responses into the
//! scripting runtime (an external collaborator, contract only -- spec §1)
//! and interprets the returned flags.
//!
//! Extensions are variants over one capability set rather than three
//! separate traits, so the loader can hold a single heterogeneous list and
//! the pipeline can discover at runtime which hooks a given extension
//! actually implements. `dyn Extension` needs dynamic dispatch over async
//! methods, which native `async fn` in traits doesn't support directly; the
//! internal boxing-trait split below mirrors `rama-core`'s own `BoxService`
//! (`rama-core/src/service/svc.rs`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use tokio::sync::Mutex as AsyncMutex;

use crate::context::TxContext;
use crate::error::OpaqueError;
use crate::id::TxId;

/// Which of the extension variants this is (Design Notes "Extension
/// polymorphism"). `Scope` and `Checkpoint` are the two core extensions
/// the pipeline looks up by kind; `User` extensions are operator-loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    Scope,
    Checkpoint,
    User,
}

/// Which hooks an extension actually implements, discoverable before
/// calling them (Design Notes: "presence of each is discoverable").
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub process_request: bool,
    pub process_response: bool,
    pub should_intercept_request: bool,
    pub should_intercept_response: bool,
}

/// The outcome a hook hands back to the pipeline, mirroring the modifier
/// return values (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Skip,
    Drop,
}

/// A loaded scripted extension. Implementors provide whichever hooks their
/// `capabilities()` advertises; the default bodies below are never called
/// for a capability that's advertised `false`.
pub trait Extension: Send + Sync + 'static {
    fn id(&self) -> TxId;
    fn kind(&self) -> ExtensionKind;
    fn capabilities(&self) -> Capabilities;

    fn process_request(
        &self,
        _ctx: &mut TxContext,
        _req: &mut Request<Bytes>,
    ) -> impl Future<Output = Result<Outcome, OpaqueError>> + Send + '_ {
        async { Ok(Outcome::Continue) }
    }

    fn process_response(
        &self,
        _ctx: &mut TxContext,
        _res: &mut Response<Bytes>,
    ) -> impl Future<Output = Result<Outcome, OpaqueError>> + Send + '_ {
        async { Ok(Outcome::Continue) }
    }

    fn should_intercept_request(
        &self,
        _ctx: &TxContext,
        _req: &Request<Bytes>,
    ) -> impl Future<Output = Result<bool, OpaqueError>> + Send + '_ {
        async { Ok(false) }
    }

    fn should_intercept_response(
        &self,
        _ctx: &TxContext,
        _res: &Response<Bytes>,
    ) -> impl Future<Output = Result<bool, OpaqueError>> + Send + '_ {
        async { Ok(false) }
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, OpaqueError>> + Send + 'a>>;

trait DynExtension: Send + Sync {
    fn id(&self) -> TxId;
    fn kind(&self) -> ExtensionKind;
    fn capabilities(&self) -> Capabilities;
    fn process_request_box<'a>(
        &'a self,
        ctx: &'a mut TxContext,
        req: &'a mut Request<Bytes>,
    ) -> BoxFut<'a, Outcome>;
    fn process_response_box<'a>(
        &'a self,
        ctx: &'a mut TxContext,
        res: &'a mut Response<Bytes>,
    ) -> BoxFut<'a, Outcome>;
    fn should_intercept_request_box<'a>(
        &'a self,
        ctx: &'a TxContext,
        req: &'a Request<Bytes>,
    ) -> BoxFut<'a, bool>;
    fn should_intercept_response_box<'a>(
        &'a self,
        ctx: &'a TxContext,
        res: &'a Response<Bytes>,
    ) -> BoxFut<'a, bool>;
}

impl<T: Extension> DynExtension for T {
    fn id(&self) -> TxId {
        Extension::id(self)
    }
    fn kind(&self) -> ExtensionKind {
        Extension::kind(self)
    }
    fn capabilities(&self) -> Capabilities {
        Extension::capabilities(self)
    }
    fn process_request_box<'a>(
        &'a self,
        ctx: &'a mut TxContext,
        req: &'a mut Request<Bytes>,
    ) -> BoxFut<'a, Outcome> {
        Box::pin(self.process_request(ctx, req))
    }
    fn process_response_box<'a>(
        &'a self,
        ctx: &'a mut TxContext,
        res: &'a mut Response<Bytes>,
    ) -> BoxFut<'a, Outcome> {
        Box::pin(self.process_response(ctx, res))
    }
    fn should_intercept_request_box<'a>(
        &'a self,
        ctx: &'a TxContext,
        req: &'a Request<Bytes>,
    ) -> BoxFut<'a, bool> {
        Box::pin(self.should_intercept_request(ctx, req))
    }
    fn should_intercept_response_box<'a>(
        &'a self,
        ctx: &'a TxContext,
        res: &'a Response<Bytes>,
    ) -> BoxFut<'a, bool> {
        Box::pin(self.should_intercept_response(ctx, res))
    }
}

/// A loaded extension, owned uniquely by the loader, borrowed under its own
/// lock by the pipeline (spec §5: "each loaded extension owns a mutex...
/// Distinct extensions may run concurrently").
#[derive(Clone)]
pub struct LoadedExtension {
    inner: Arc<dyn DynExtension>,
    lock: Arc<AsyncMutex<()>>,
}

impl LoadedExtension {
    pub fn new(extension: impl Extension) -> Self {
        Self {
            inner: Arc::new(extension),
            lock: Arc::new(AsyncMutex::new(())),
        }
    }

    #[must_use]
    pub fn id(&self) -> TxId {
        self.inner.id()
    }

    #[must_use]
    pub fn kind(&self) -> ExtensionKind {
        self.inner.kind()
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    /// Anti-recursion guard (spec §4.5 step 6): an extension never
    /// re-processes traffic it originated itself.
    #[must_use]
    pub fn originated(&self, ctx: &TxContext) -> bool {
        ctx.originating_extension_id() == Some(self.id())
    }

    pub async fn process_request(
        &self,
        ctx: &mut TxContext,
        req: &mut Request<Bytes>,
    ) -> Result<Outcome, OpaqueError> {
        let _guard = self.lock.lock().await;
        self.inner.process_request_box(ctx, req).await
    }

    pub async fn process_response(
        &self,
        ctx: &mut TxContext,
        res: &mut Response<Bytes>,
    ) -> Result<Outcome, OpaqueError> {
        let _guard = self.lock.lock().await;
        self.inner.process_response_box(ctx, res).await
    }

    pub async fn should_intercept_request(
        &self,
        ctx: &TxContext,
        req: &Request<Bytes>,
    ) -> Result<bool, OpaqueError> {
        let _guard = self.lock.lock().await;
        self.inner.should_intercept_request_box(ctx, req).await
    }

    pub async fn should_intercept_response(
        &self,
        ctx: &TxContext,
        res: &Response<Bytes>,
    ) -> Result<bool, OpaqueError> {
        let _guard = self.lock.lock().await;
        self.inner.should_intercept_response_box(ctx, res).await
    }
}
