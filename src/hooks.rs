//! Handler hooks (spec §6): per-event callbacks the host may register for
//! request, response, and log records, each invoked after the matching
//! record has been enqueued for persistence. Registering the same hook
//! twice is an error rather than a silent overwrite (SPEC_FULL §11).

use std::sync::Arc;

use parking_lot::RwLock;

use crate::persistence::{LogEntry, RequestRecord, ResponseRecord};

/// A hook slot was already occupied.
#[derive(Debug, thiserror::Error)]
#[error("handler hook already registered: {0}")]
pub struct HookAlreadyRegistered(pub &'static str);

type RequestHook = Arc<dyn Fn(&RequestRecord) + Send + Sync>;
type ResponseHook = Arc<dyn Fn(&ResponseRecord) + Send + Sync>;
type LogHook = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// The three hook slots the host may fill. Cheap to clone: each slot is an
/// `Arc`-backed lock shared with every clone.
#[derive(Clone, Default)]
pub struct Hooks {
    request: Arc<RwLock<Option<RequestHook>>>,
    response: Arc<RwLock<Option<ResponseHook>>>,
    log: Arc<RwLock<Option<LogHook>>>,
}

impl Hooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request(
        &self,
        hook: impl Fn(&RequestRecord) + Send + Sync + 'static,
    ) -> Result<(), HookAlreadyRegistered> {
        let mut slot = self.request.write();
        if slot.is_some() {
            return Err(HookAlreadyRegistered("request"));
        }
        *slot = Some(Arc::new(hook));
        Ok(())
    }

    pub fn register_response(
        &self,
        hook: impl Fn(&ResponseRecord) + Send + Sync + 'static,
    ) -> Result<(), HookAlreadyRegistered> {
        let mut slot = self.response.write();
        if slot.is_some() {
            return Err(HookAlreadyRegistered("response"));
        }
        *slot = Some(Arc::new(hook));
        Ok(())
    }

    pub fn register_log(
        &self,
        hook: impl Fn(&LogEntry) + Send + Sync + 'static,
    ) -> Result<(), HookAlreadyRegistered> {
        let mut slot = self.log.write();
        if slot.is_some() {
            return Err(HookAlreadyRegistered("log"));
        }
        *slot = Some(Arc::new(hook));
        Ok(())
    }

    pub(crate) fn fire_request(&self, record: &RequestRecord) {
        if let Some(hook) = self.request.read().as_ref() {
            hook(record);
        }
    }

    pub(crate) fn fire_response(&self, record: &ResponseRecord) {
        if let Some(hook) = self.response.read().as_ref() {
            hook(record);
        }
    }

    pub(crate) fn fire_log(&self, entry: &LogEntry) {
        if let Some(hook) = self.log.read().as_ref() {
            hook(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    #[test]
    fn second_registration_of_the_same_hook_is_rejected() {
        let hooks = Hooks::new();
        assert!(hooks.register_request(|_| {}).is_ok());
        assert!(hooks.register_request(|_| {}).is_err());
    }

    #[test]
    fn distinct_hook_kinds_register_independently() {
        let hooks = Hooks::new();
        assert!(hooks.register_request(|_| {}).is_ok());
        assert!(hooks.register_response(|_| {}).is_ok());
        assert!(hooks.register_log(|_| {}).is_ok());
    }

    #[test]
    fn fired_hook_observes_the_record() {
        let hooks = Hooks::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        hooks
            .register_log(move |entry| {
                assert_eq!(entry.message, "hi");
                seen2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        hooks.fire_log(&LogEntry {
            level: crate::persistence::LogLevel::Info,
            message: "hi".into(),
            at: SystemTime::now(),
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
