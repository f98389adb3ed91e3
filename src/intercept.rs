//! Interception coordinator (spec §4.8): a FIFO queue of intercepted
//! request/response items plus a registered callback that hands each item
//! to the external operator UI, while the modifier that enqueued it blocks
//! on a single-shot reply channel.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::id::TxId;

/// What kind of traffic is being intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Request,
    Response,
}

/// An item awaiting an operator decision.
pub struct InterceptedItem {
    pub id: TxId,
    pub kind: ItemKind,
    pub raw: Bytes,
    reply: Mutex<Option<oneshot::Sender<Decision>>>,
}

impl InterceptedItem {
    /// Resolve this item. A second call is a no-op (spec §4.8: "exactly one
    /// reply per item").
    pub fn resolve(&self, decision: Decision) {
        if let Some(tx) = self.reply.lock().take() {
            let _ = tx.send(decision);
        }
    }
}

/// The operator's decision for an intercepted item.
#[derive(Debug, Clone)]
pub struct Decision {
    pub resume: bool,
    pub raw: Bytes,
    pub also_intercept_response: bool,
}

impl Decision {
    /// Cancel the item: treated as a drop by the calling modifier.
    #[must_use]
    pub fn cancel() -> Self {
        Self {
            resume: false,
            raw: Bytes::new(),
            also_intercept_response: false,
        }
    }
}

/// Callback the host registers to be told about new intercepted items.
/// Must not block: it only hands the item off to the operator UI (spec
/// §4.8: "the callback is non-blocking").
pub trait InterceptCallback: Send + Sync + 'static {
    fn on_intercept(&self, item: Arc<InterceptedItem>);
}

impl<F> InterceptCallback for F
where
    F: Fn(Arc<InterceptedItem>) + Send + Sync + 'static,
{
    fn on_intercept(&self, item: Arc<InterceptedItem>) {
        self(item)
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Arc<InterceptedItem>>,
    callback: Option<Arc<dyn InterceptCallback>>,
}

/// The shared coordinator. Cheap to clone.
#[derive(Clone, Default)]
pub struct Coordinator(Arc<Mutex<Inner>>);

impl Coordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the operator callback, replacing any previous one.
    pub fn register_callback(&self, callback: impl InterceptCallback) {
        self.0.lock().callback = Some(Arc::new(callback));
    }

    /// Enqueue `raw` for interception and wait for the operator's decision.
    ///
    /// Fail-safe per spec §4.8: if no callback is registered, the item is
    /// never queued and a cancelling decision is returned immediately
    /// rather than hanging forever.
    pub async fn intercept(&self, id: TxId, kind: ItemKind, raw: Bytes) -> Decision {
        let (tx, rx) = oneshot::channel();
        let item = Arc::new(InterceptedItem {
            id,
            kind,
            raw,
            reply: Mutex::new(Some(tx)),
        });

        let callback = {
            let mut inner = self.0.lock();
            match inner.callback.clone() {
                Some(cb) => {
                    inner.queue.push_back(item.clone());
                    Some(cb)
                }
                None => None,
            }
        };

        let Some(callback) = callback else {
            tracing::warn!(id = %id, "interception requested with no callback registered, dropping");
            return Decision::cancel();
        };

        callback.on_intercept(item.clone());

        let result = rx.await;

        {
            let mut inner = self.0.lock();
            inner.queue.retain(|queued| !Arc::ptr_eq(queued, &item));
        }

        match result {
            Ok(decision) => decision,
            Err(_) => {
                tracing::warn!(id = %id, "interception reply channel dropped without a decision");
                Decision::cancel()
            }
        }
    }

    /// Number of items currently awaiting a decision (SPEC_FULL §11).
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every outstanding item with `resume=false` (spec §5:
    /// "Operators cancelling a session resolve all outstanding items with
    /// resume=false"; SPEC_FULL §11).
    pub fn cancel_all(&self) {
        let items: Vec<_> = {
            let mut inner = self.0.lock();
            inner.queue.drain(..).collect()
        };
        for item in items {
            item.resolve(Decision::cancel());
        }
    }
}
