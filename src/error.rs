//! Error types shared across the engine.
//!
//! Mirrors the split used by `rama-error`: a [`BoxError`] type alias for
//! "any error" boundaries, an [`OpaqueError`] wrapper with `.context(..)`
//! ergonomics for ad-hoc failures, and a closed [`Kind`] enum for the error
//! kinds the pipeline has to distinguish *by value* (see spec §7).

use std::fmt;

/// A type erased error, the same shape used at `rama`'s own service boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error which no longer carries a concrete type, only a display chain.
///
/// Used at the boundary of components (CA, raw-http utilities, transport)
/// whose callers only care about "it failed, and why".
pub struct OpaqueError(BoxError);

impl OpaqueError {
    /// Erase the concrete type of any boxable error.
    pub fn new(e: impl Into<BoxError>) -> Self {
        Self(e.into())
    }

    /// Wrap `self` with an additional context message, innermost-first.
    #[must_use]
    pub fn context(self, msg: impl Into<String>) -> Self {
        Self(Box::new(Context {
            msg: msg.into(),
            source: self.0,
        }))
    }
}

struct Context {
    msg: String,
    source: BoxError,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.msg, self.source)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.msg, self.source)
    }
}

impl std::error::Error for Context {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl fmt::Debug for OpaqueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for OpaqueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for OpaqueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Extension trait mirroring `rama-error`'s `ErrorContext`, letting any
/// `Result<T, E: Into<BoxError>>` be turned into `Result<T, OpaqueError>`
/// with a message attached at the call site.
pub trait ErrorContext<T> {
    /// Attach `msg` as context and erase the concrete error type.
    fn context(self, msg: impl Into<String>) -> Result<T, OpaqueError>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn context(self, msg: impl Into<String>) -> Result<T, OpaqueError> {
        self.map_err(|e| OpaqueError::new(e).context(msg))
    }
}

/// The closed set of error kinds the modifier pipeline distinguishes by
/// value (spec §7). `Drop` and `SkipRest` are caller intent, not failures --
/// the engine interprets them and never logs them as errors.
#[derive(Debug, thiserror::Error)]
pub enum Kind {
    /// Terminate the round-trip / connection. Not logged as a failure.
    #[error("drop")]
    Drop,
    /// Stop running modifiers, proceed with what we have. Not logged as a failure.
    #[error("skip-rest")]
    SkipRest,
    /// A core extension (scope or checkpoint) was expected but isn't loaded.
    #[error("core extension not found: {0}")]
    ExtensionNotFound(&'static str),
    /// The operator-edited raw bytes of an intercepted item failed to parse.
    #[error("rebuilding request/response from intercepted raw bytes failed: {0}")]
    RebuildFailed(OpaqueError),
    /// A transaction reached a step that required an identifier that was
    /// never assigned.
    #[error("transaction identifier missing")]
    MissingIdentifier,
    /// A transaction reached a step that required the metadata map that was
    /// never allocated.
    #[error("transaction metadata missing")]
    MissingMetadata,
    /// A transaction reached a step that required a timestamp that was
    /// never stamped.
    #[error("transaction timestamp missing")]
    MissingTimestamp,
    /// Reading a request/response body failed.
    #[error("reading body failed: {0}")]
    BodyRead(OpaqueError),
    /// Decompressing a response body failed.
    #[error("decompressing body failed: {0}")]
    DecompressFailed(OpaqueError),
    /// The host never registered a callback/hook this step needed.
    #[error("required handler not registered: {0}")]
    HandlerUndefined(&'static str),
}

impl Kind {
    /// `true` for the two control-flow variants the pipeline interprets
    /// rather than logs as failures.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Kind::Drop | Kind::SkipRest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_chains_messages_innermost_first() {
        let res: Result<(), std::io::Error> =
            Err(std::io::Error::other("disk full"));
        let err = res.context("writing root cert").unwrap_err();
        assert_eq!(err.to_string(), "writing root cert: disk full");
    }

    #[test]
    fn control_flow_kinds_are_flagged() {
        assert!(Kind::Drop.is_control_flow());
        assert!(Kind::SkipRest.is_control_flow());
        assert!(!Kind::MissingIdentifier.is_control_flow());
    }
}
