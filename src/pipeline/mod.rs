//! Modifier pipeline (spec §4.5): the two ordered chains every request and
//! response pass through. Each step returns one of {continue, skip-rest,
//! drop, error}; the engine interprets those per the return-value table,
//! applying the right session-level side effect (mark skip-round-trip or
//! hijack-and-close) and logging any "error (other)" as fail-open.

pub mod request;
pub mod response;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::extension::LoadedExtension;
use crate::hooks::Hooks;
use crate::intercept::Coordinator;
use crate::persistence::PersistenceHandle;
use crate::waypoint::Waypoints;

/// What a single modifier decided, before the chain runner applies the
/// session-level side effects the return-value table assigns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Continue,
    SkipRest,
    Drop,
}

/// What the request chain, as a whole, decided for its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Proceed (to origin, or straight to the response chain if a step
    /// already short-circuited with skip-rest -- the caller doesn't need to
    /// distinguish the two).
    Proceed,
    /// The transaction was dropped; the session has been marked
    /// skip-round-trip.
    Dropped,
}

/// What the response chain, as a whole, decided for its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Deliver the response to the client.
    Deliver,
    /// The transaction was dropped; the session has been hijacked and
    /// closed.
    Dropped,
}

/// Everything the default chains need, gathered from the engine (spec §4.5,
/// §5). Core extensions (scope, checkpoint) are addressed directly;
/// operator-loaded extensions are an ordered list run in registration
/// order.
#[derive(Clone)]
pub struct PipelineEnv {
    pub listen_host: String,
    pub listen_port: u16,
    pub scope_extension: LoadedExtension,
    pub checkpoint_extension: LoadedExtension,
    pub extensions: Vec<LoadedExtension>,
    pub waypoints: Waypoints,
    pub coordinator: Coordinator,
    pub persistence: PersistenceHandle,
    pub global_intercept_all: Arc<AtomicBool>,
    pub hooks: Hooks,
}

pub use request::run_request_chain;
pub use response::run_response_chain;
