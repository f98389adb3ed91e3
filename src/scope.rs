//! Scope engine (spec §4.6): which hosts/URLs the engine is allowed to
//! intercept and forward, expressed as include/exclude regex rules plus a
//! default-allow fallback.
//!
//! Grounded on `rama-http`'s `matcher/domain.rs`: a small, focused matcher
//! type with a `matches` entry point, evaluated under a lock shared by
//! every connection (spec §5: "a single scope instance is mutated under
//! its own lock; reads during `matches` take the lock briefly").

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use parking_lot::RwLock;
use regex::Regex;

use crate::context::TxContext;
use crate::error::OpaqueError;
use crate::extension::{Capabilities, Extension, ExtensionKind, Outcome};
use crate::id::TxId;

/// Whether a rule allows or excludes what it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Include,
    Exclude,
}

/// Outcome of [`Scope::add`].
#[derive(Debug)]
pub enum AddOutcome {
    Ok,
    Duplicate,
    CompileError(OpaqueError),
}

/// Outcome of [`Scope::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Ok,
    NotFound,
}

struct Rule {
    pattern: Regex,
    target: Regex,
    polarity: Polarity,
}

#[derive(Default)]
struct Inner {
    rules: BTreeMap<String, Rule>,
    default_allow: bool,
}

/// A shared, lockable scope instance (spec §4.6). Cheap to clone.
#[derive(Clone, Default)]
pub struct Scope(Arc<RwLock<Inner>>);

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a rule, keyed by `"{pattern}|{target}"` (spec
    /// §4.6), deduplicating identical rules regardless of polarity.
    pub fn add(&self, pattern: &str, target: &str, polarity: Polarity) -> AddOutcome {
        let key = rule_key(pattern, target);

        let mut inner = self.0.write();
        if inner.rules.contains_key(&key) {
            return AddOutcome::Duplicate;
        }

        let pattern_re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(err) => return AddOutcome::CompileError(OpaqueError::new(err)),
        };
        let target_re = match Regex::new(target) {
            Ok(re) => re,
            Err(err) => return AddOutcome::CompileError(OpaqueError::new(err)),
        };

        inner.rules.insert(
            key,
            Rule {
                pattern: pattern_re,
                target: target_re,
                polarity,
            },
        );
        AddOutcome::Ok
    }

    /// Remove a previously added rule by its exact `(pattern, target,
    /// polarity)` triple.
    pub fn remove(&self, pattern: &str, target: &str, polarity: Polarity) -> RemoveOutcome {
        let key = rule_key(pattern, target);
        let mut inner = self.0.write();
        match inner.rules.get(&key) {
            Some(rule) if rule.polarity == polarity => {
                inner.rules.remove(&key);
                RemoveOutcome::Ok
            }
            _ => RemoveOutcome::NotFound,
        }
    }

    /// Drop every rule, leaving only the default-allow fallback.
    pub fn clear(&self) {
        self.0.write().rules.clear();
    }

    /// Set the fallback decision used when no rule matches.
    pub fn set_default_allow(&self, allow: bool) {
        self.0.write().default_allow = allow;
    }

    /// Evaluate a host/URL pair against the registered rules (spec §4.6):
    /// exclude rules first (any match -> false), then include rules (any
    /// match -> true), otherwise the default-allow fallback.
    #[must_use]
    pub fn matches(&self, host: &str, url: &str) -> bool {
        let inner = self.0.read();

        let hits = |polarity: Polarity| {
            inner
                .rules
                .values()
                .filter(|r| r.polarity == polarity)
                .any(|r| r.target.is_match(host) && r.pattern.is_match(url))
        };

        if hits(Polarity::Exclude) {
            return false;
        }
        if hits(Polarity::Include) {
            return true;
        }
        inner.default_allow
    }
}

fn rule_key(pattern: &str, target: &str) -> String {
    format!("{pattern}|{target}")
}

/// Adapts the [`Scope`] engine to the pipeline's extension contract (spec
/// §4.5 steps 3/5: "invoke the scripted scope extension's processRequest").
/// The compass extension's own logic is native, not scripted -- wrapping it
/// this way just lets the pipeline call it the same way it calls every
/// other extension.
pub struct ScopeExtension {
    id: TxId,
    scope: Scope,
}

impl ScopeExtension {
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self { id: TxId::new(), scope }
    }
}

impl Extension for ScopeExtension {
    fn id(&self) -> TxId {
        self.id
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Scope
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            process_request: true,
            process_response: true,
            ..Default::default()
        }
    }

    async fn process_request(
        &self,
        _ctx: &mut TxContext,
        req: &mut Request<Bytes>,
    ) -> Result<Outcome, OpaqueError> {
        let host = req.uri().host().unwrap_or_default();
        if self.scope.matches(host, &req.uri().to_string()) {
            Ok(Outcome::Continue)
        } else {
            Ok(Outcome::Skip)
        }
    }

    async fn process_response(
        &self,
        _ctx: &mut TxContext,
        _res: &mut Response<Bytes>,
    ) -> Result<Outcome, OpaqueError> {
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod scope_extension_tests {
    use super::*;

    #[tokio::test]
    async fn out_of_scope_requests_are_skipped() {
        let scope = Scope::new();
        scope.set_default_allow(false);
        scope.add(".*", "allowed\\.test", Polarity::Include);
        let extension = ScopeExtension::new(scope);

        let mut ctx = TxContext::new();
        let mut in_scope = Request::builder()
            .uri("http://allowed.test/")
            .body(Bytes::new())
            .unwrap();
        let mut out_of_scope = Request::builder()
            .uri("http://other.test/")
            .body(Bytes::new())
            .unwrap();

        assert_eq!(
            extension.process_request(&mut ctx, &mut in_scope).await.unwrap(),
            Outcome::Continue
        );
        assert_eq!(
            extension.process_request(&mut ctx, &mut out_of_scope).await.unwrap(),
            Outcome::Skip
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_wins_over_include() {
        let scope = Scope::new();
        scope.set_default_allow(false);
        scope.add(".*", "evil\\.test", Polarity::Include);
        scope.add(".*", "evil\\.test", Polarity::Include); // no-op duplicate
        scope.add("/admin.*", "evil\\.test", Polarity::Exclude);

        assert!(scope.matches("evil.test", "/index"));
        assert!(!scope.matches("evil.test", "/admin/panel"));
    }

    #[test]
    fn default_allow_governs_unmatched_hosts() {
        let scope = Scope::new();
        scope.set_default_allow(true);
        assert!(scope.matches("anything.test", "/"));

        scope.set_default_allow(false);
        assert!(!scope.matches("anything.test", "/"));
    }

    #[test]
    fn duplicate_rules_are_rejected() {
        let scope = Scope::new();
        assert!(matches!(
            scope.add(".*", "a\\.test", Polarity::Include),
            AddOutcome::Ok
        ));
        assert!(matches!(
            scope.add(".*", "a\\.test", Polarity::Include),
            AddOutcome::Duplicate
        ));
    }

    #[test]
    fn remove_requires_matching_polarity() {
        let scope = Scope::new();
        scope.add(".*", "a\\.test", Polarity::Include);
        assert_eq!(
            scope.remove(".*", "a\\.test", Polarity::Exclude),
            RemoveOutcome::NotFound
        );
        assert_eq!(
            scope.remove(".*", "a\\.test", Polarity::Include),
            RemoveOutcome::Ok
        );
    }

    #[test]
    fn compile_error_is_surfaced_for_bad_pattern() {
        let scope = Scope::new();
        assert!(matches!(
            scope.add("(unterminated", "a\\.test", Polarity::Include),
            AddOutcome::CompileError(_)
        ));
    }
}
