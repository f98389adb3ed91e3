//! The transaction context: a strongly-typed, per-transaction record
//! (spec §4.4 / Design Notes "Transaction context bag").
//!
//! The distilled description calls this a "key/value bag", but the Design
//! Notes are explicit: re-implement it as a typed record with optional
//! fields rather than a dynamic map, so each modifier only reads and
//! mutates the fields it declares. A getter on a typed `Option<T>` field
//! already carries "(value, present)" -- `None` *is* "not present".

use std::collections::BTreeMap;
use std::sync::Weak;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::id::TxId;

/// A scalar or nested map value carried in transaction metadata.
///
/// Spec §3: "a metadata map (string → arbitrary scalar/map)".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Map(Metadata),
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

/// `string -> MetaValue` transaction metadata map.
pub type Metadata = BTreeMap<String, MetaValue>;

/// A handle to the live MITM connection a transaction belongs to.
///
/// Design Notes "Cyclic references": the session is owned by the
/// connection task; a transaction only ever holds a non-owning [`Weak`]
/// reference to it, so dropping the connection never has to race a
/// transaction that outlives it.
pub trait SessionControl: Send + Sync + 'static {
    /// Mark the live session so the round-trip to origin is skipped for the
    /// current request (set by the request-chain `drop` outcome).
    fn mark_skip_round_trip(&self);

    /// Whether the round-trip has been marked to be skipped.
    fn should_skip_round_trip(&self) -> bool;

    /// Hijack the underlying socket and close it immediately, bypassing any
    /// in-flight response write (set by the response-chain `drop` outcome).
    fn hijack_and_close(&self);
}

pub type SessionHandle = Weak<dyn SessionControl>;

/// The present-or-absent flags threaded through a transaction (spec §3).
///
/// Invariant: flag values never decrease in restrictiveness once set -- no
/// modifier clears `drop` or `skip` once another has set it. Setters here
/// are therefore one-directional; there is deliberately no `clear_*`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    skip: bool,
    drop: bool,
    should_intercept_response: bool,
    do_not_persist: bool,
}

impl Flags {
    #[must_use]
    pub fn skip(&self) -> bool {
        self.skip
    }

    pub fn set_skip(&mut self) {
        self.skip = true;
    }

    #[must_use]
    pub fn drop(&self) -> bool {
        self.drop
    }

    pub fn set_drop(&mut self) {
        self.drop = true;
    }

    #[must_use]
    pub fn should_intercept_response(&self) -> bool {
        self.should_intercept_response
    }

    pub fn set_should_intercept_response(&mut self) {
        self.should_intercept_response = true;
    }

    #[must_use]
    pub fn do_not_persist(&self) -> bool {
        self.do_not_persist
    }

    pub fn set_do_not_persist(&mut self) {
        self.do_not_persist = true;
    }

    /// Open Question resolution (spec §9): when both `skip` and `drop` are
    /// set, `drop` takes precedence.
    #[must_use]
    pub fn effective(&self) -> FlagOutcome {
        if self.drop {
            FlagOutcome::Drop
        } else if self.skip {
            FlagOutcome::Skip
        } else {
            FlagOutcome::Continue
        }
    }
}

/// The resolved, mutually-exclusive outcome of the current flag state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOutcome {
    Continue,
    Skip,
    Drop,
}

/// The per-transaction context threaded through the modifier pipeline.
///
/// Lifecycle (spec §3): created by the first request modifier to touch it
/// (the `setup` step, §4.5), sealed after the response chain completes or
/// the connection is terminated.
#[derive(Default, Clone)]
pub struct TxContext {
    id: Option<TxId>,
    launchpad_id: Option<TxId>,
    originating_extension_id: Option<TxId>,
    metadata: Option<Metadata>,
    flags: Flags,
    request_time: Option<SystemTime>,
    response_time: Option<SystemTime>,
    session: Option<SessionHandle>,
}

impl std::fmt::Debug for TxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxContext")
            .field("id", &self.id)
            .field("launchpad_id", &self.launchpad_id)
            .field("originating_extension_id", &self.originating_extension_id)
            .field("metadata", &self.metadata)
            .field("flags", &self.flags)
            .field("request_time", &self.request_time)
            .field("response_time", &self.response_time)
            .finish_non_exhaustive()
    }
}

impl TxContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- identifier ---------------------------------------------------

    #[must_use]
    pub fn id(&self) -> Option<TxId> {
        self.id
    }

    pub fn set_id(&mut self, id: TxId) {
        self.id = Some(id);
    }

    // -- launchpad correlation -----------------------------------------

    #[must_use]
    pub fn launchpad_id(&self) -> Option<TxId> {
        self.launchpad_id
    }

    pub fn set_launchpad_id(&mut self, id: TxId) {
        self.launchpad_id = Some(id);
    }

    // -- originating extension (anti-recursion) -------------------------

    #[must_use]
    pub fn originating_extension_id(&self) -> Option<TxId> {
        self.originating_extension_id
    }

    pub fn set_originating_extension_id(&mut self, id: TxId) {
        self.originating_extension_id = Some(id);
    }

    // -- metadata --------------------------------------------------------

    #[must_use]
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Allocate the metadata map if absent and return a mutable handle.
    ///
    /// Spec §4.5 step 4 ("setup"): "allocate the metadata map".
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        self.metadata.get_or_insert_with(Metadata::new)
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.metadata_mut().insert(key.into(), value.into());
    }

    // -- flags -------------------------------------------------------------

    #[must_use]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut Flags {
        &mut self.flags
    }

    // -- timestamps ----------------------------------------------------

    #[must_use]
    pub fn request_time(&self) -> Option<SystemTime> {
        self.request_time
    }

    pub fn stamp_request_time(&mut self) {
        self.request_time = Some(SystemTime::now());
    }

    #[must_use]
    pub fn response_time(&self) -> Option<SystemTime> {
        self.response_time
    }

    pub fn stamp_response_time(&mut self) {
        self.response_time = Some(SystemTime::now());
    }

    // -- session handle --------------------------------------------------

    #[must_use]
    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: SessionHandle) {
        self.session = Some(session);
    }
}
