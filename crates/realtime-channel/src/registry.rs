//! Subscriber registry and fan-out dispatch.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::types::{Envelope, TypeFilter};

/// Subscriber callback. Invoked synchronously, once per matching envelope.
pub(crate) type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct Entry {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    typed: HashMap<String, Vec<Entry>>,
    wildcard: Vec<Entry>,
}

/// Interest-based registry: type tag -> listeners, plus wildcard listeners.
///
/// Registrations are keyed by an id, never by callback identity, so the same
/// callback may be registered any number of times.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Callbacks never run under the lock, so poisoning carries no torn state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        filter: TypeFilter,
        callback: Callback,
    ) -> Subscription {
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            let entry = Entry { id, callback };
            match &filter {
                TypeFilter::Type(kind) => inner.typed.entry(kind.clone()).or_default().push(entry),
                TypeFilter::Any => inner.wildcard.push(entry),
            }
            id
        };
        tracing::trace!(%filter, id, "subscriber registered");
        Subscription {
            registry: Arc::downgrade(self),
            filter,
            id,
            active: AtomicBool::new(true),
        }
    }

    fn remove(&self, filter: &TypeFilter, id: u64) {
        let mut inner = self.lock();
        match filter {
            TypeFilter::Type(kind) => {
                let now_empty = match inner.typed.get_mut(kind) {
                    Some(entries) => {
                        entries.retain(|e| e.id != id);
                        entries.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    inner.typed.remove(kind);
                }
            }
            TypeFilter::Any => inner.wildcard.retain(|e| e.id != id),
        }
    }

    pub(crate) fn len(&self) -> usize {
        let inner = self.lock();
        inner.typed.values().map(Vec::len).sum::<usize>() + inner.wildcard.len()
    }

    /// Deliver one envelope to its type-specific subscribers, then to the
    /// wildcard subscribers, each group in registration order.
    ///
    /// Iterates over a snapshot taken before the first callback runs, so
    /// callbacks may subscribe or unsubscribe freely. Returns the number of
    /// callbacks invoked.
    pub(crate) fn dispatch(&self, envelope: &Envelope) -> usize {
        let snapshot: Vec<Callback> = {
            let inner = self.lock();
            inner
                .typed
                .get(envelope.kind.as_str())
                .into_iter()
                .flatten()
                .chain(inner.wildcard.iter())
                .map(|e| Arc::clone(&e.callback))
                .collect()
        };

        for callback in &snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(envelope))).is_err() {
                tracing::warn!(kind = %envelope.kind, "subscriber callback panicked");
            }
        }
        snapshot.len()
    }

    /// Parse a raw frame and dispatch it. Malformed frames are logged and
    /// dropped without invoking anyone.
    pub(crate) fn dispatch_frame(&self, frame: &str) -> Option<usize> {
        match Envelope::from_json(frame) {
            Ok(envelope) => Some(self.dispatch(&envelope)),
            Err(e) => {
                tracing::warn!(len = frame.len(), "discarding malformed frame: {e}");
                None
            }
        }
    }
}

/// Handle to one registration, returned by
/// [`RealtimeChannel::subscribe`](crate::RealtimeChannel::subscribe).
///
/// The registration lives until [`unsubscribe`](Subscription::unsubscribe) is
/// called; dropping the handle does not remove it.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Registry>,
    filter: TypeFilter,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Remove exactly this registration. Further calls are no-ops.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.filter, self.id);
            tracing::trace!(filter = %self.filter, id = self.id, "subscriber removed");
        }
    }

    pub fn filter(&self) -> &TypeFilter {
        &self.filter
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn explode(_: &Envelope) {
        panic!("subscriber bug");
    }

    fn envelope(kind: &str) -> Envelope {
        Envelope::new(kind, serde_json::json!({}))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Callback {
        let log = Arc::clone(log);
        let name = name.to_string();
        Arc::new(move |env: &Envelope| log.lock().unwrap().push(format!("{name}:{}", env.kind)))
    }

    #[test]
    fn fan_out_in_registration_order() {
        let registry = Arc::new(Registry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let _subs: Vec<Subscription> = ["a", "b", "c"]
            .iter()
            .map(|n| registry.subscribe("x".into(), recorder(&log, n)))
            .collect();

        assert_eq!(registry.dispatch(&envelope("x")), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a:x", "b:x", "c:x"]);
    }

    #[test]
    fn wildcard_receives_everything_typed_only_its_type() {
        let registry = Arc::new(Registry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let _typed = registry.subscribe("prospect_found".into(), recorder(&log, "typed"));
        let _any = registry.subscribe("*".into(), recorder(&log, "any"));

        registry.dispatch(&envelope("prospect_found"));
        registry.dispatch(&envelope("campaign_update"));
        registry.dispatch(&envelope("never_seen_before"));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "typed:prospect_found",
                "any:prospect_found",
                "any:campaign_update",
                "any:never_seen_before",
            ]
        );
    }

    #[test]
    fn disposer_removes_only_its_registration() {
        let registry = Arc::new(Registry::default());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let cb: Callback = Arc::new(move |_: &Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = registry.subscribe("x".into(), Arc::clone(&cb));
        let _second = registry.subscribe("x".into(), Arc::clone(&cb));
        let _other = registry.subscribe("*".into(), Arc::clone(&cb));
        first.unsubscribe();

        registry.dispatch(&envelope("x"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn disposer_is_idempotent() {
        let registry = Arc::new(Registry::default());
        let sub = registry.subscribe("x".into(), Arc::new(|_: &Envelope| {}));
        let _keep = registry.subscribe("x".into(), Arc::new(|_: &Envelope| {}));
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn disposer_after_registry_dropped_is_harmless() {
        let registry = Arc::new(Registry::default());
        let sub = registry.subscribe("x".into(), Arc::new(|_: &Envelope| {}));
        drop(registry);
        sub.unsubscribe();
        assert!(!sub.is_active());
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let registry = Arc::new(Registry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let _one = registry.subscribe("x".into(), recorder(&log, "one"));
        let _two = registry.subscribe("x".into(), Arc::new(explode));
        let _three = registry.subscribe("x".into(), recorder(&log, "three"));

        assert_eq!(registry.dispatch(&envelope("x")), 3);
        assert_eq!(*log.lock().unwrap(), vec!["one:x", "three:x"]);
    }

    #[test]
    fn unsubscribe_during_dispatch_uses_snapshot() {
        let registry = Arc::new(Registry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&victim);
        let first_log = Arc::clone(&log);
        let _first = registry.subscribe(
            "x".into(),
            Arc::new(move |_: &Envelope| {
                first_log.lock().unwrap().push("first".to_string());
                if let Some(sub) = slot.lock().unwrap().as_ref() {
                    sub.unsubscribe();
                }
            }),
        );
        let second = registry.subscribe("x".into(), recorder(&log, "second"));
        *victim.lock().unwrap() = Some(second);

        registry.dispatch(&envelope("x"));
        registry.dispatch(&envelope("x"));

        assert_eq!(*log.lock().unwrap(), vec!["first", "second:x", "first"]);
    }

    #[test]
    fn malformed_frame_invokes_nobody() {
        let registry = Arc::new(Registry::default());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _any = registry.subscribe(
            TypeFilter::Any,
            Arc::new(move |_: &Envelope| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(registry.dispatch_frame("{not json"), None);
        assert_eq!(registry.dispatch_frame(r#"{"data":{}}"#), None);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert_eq!(registry.dispatch_frame(r#"{"type":"pong","data":{}}"#), Some(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
