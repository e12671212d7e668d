//! Subscription ids and the consumers inbound frames are routed to.
//!
//! The registry holds shared references to caller-owned consumers; it never
//! clones consumer state, so anything a consumer captures stays visible to
//! the caller while frames are being dispatched.
//!
//! Ids are random v4 UUIDs. The registry only remembers live entries, so a
//! long-lived client that keeps subscribing and unsubscribing holds memory
//! proportional to its open subscriptions. A fresh id is checked against
//! live entries only; reuse of a released id would need a 122-bit random
//! collision.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Client-generated token correlating a start frame with its responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SubscriptionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SubscriptionId)
    }
}

/// Error reported by the server for one subscription.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("subscription {id} failed: {errors}")]
pub struct SubscriptionError {
    /// Subscription the error frame was addressed to.
    pub id: SubscriptionId,
    /// Error details, usually the GraphQL `errors` array.
    pub errors: Value,
}

/// Receives payloads for one subscription.
///
/// `on_data` is required; the error and completion hooks default to no-ops.
/// Hooks run on the connection worker in frame order, so they should hand
/// heavy work off rather than block.
pub trait Consumer: Send + Sync + 'static {
    fn on_data(&self, data: Value);

    fn on_error(&self, error: SubscriptionError) {
        let _ = error;
    }

    fn on_complete(&self) {}
}

type DataFn = Box<dyn Fn(Value) + Send + Sync>;
type ErrorFn = Box<dyn Fn(SubscriptionError) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

/// Closure-backed [`Consumer`] with optional error and completion hooks.
pub struct FnSink {
    next: DataFn,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl FnSink {
    pub fn new(next: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self {
            next: Box::new(next),
            error: None,
            complete: None,
        }
    }

    pub fn with_error(mut self, error: impl Fn(SubscriptionError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(error));
        self
    }

    pub fn with_complete(mut self, complete: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(complete));
        self
    }
}

impl fmt::Debug for FnSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSink")
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .finish_non_exhaustive()
    }
}

impl Consumer for FnSink {
    fn on_data(&self, data: Value) {
        (self.next)(data);
    }

    fn on_error(&self, error: SubscriptionError) {
        if let Some(hook) = self.error.as_ref() {
            hook(error);
        }
    }

    fn on_complete(&self) {
        if let Some(hook) = self.complete.as_ref() {
            hook();
        }
    }
}

/// Maps subscription ids to the consumers their frames belong to.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<SubscriptionId, Arc<dyn Consumer>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `consumer` under a fresh id and returns the id.
    pub fn register(&self, consumer: Arc<dyn Consumer>) -> SubscriptionId {
        let mut entries = self.write();
        let id = loop {
            let candidate = SubscriptionId(Uuid::new_v4());
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(id, consumer);
        id
    }

    pub fn lookup(&self, id: &SubscriptionId) -> Option<Arc<dyn Consumer>> {
        self.read().get(id).cloned()
    }

    /// Removes the entry for `id`. Returns whether an entry was present.
    pub fn unregister(&self, id: &SubscriptionId) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<SubscriptionId> {
        self.read().keys().copied().collect()
    }

    // A consumer that panicked mid-dispatch must not wedge the registry.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionId, Arc<dyn Consumer>>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionId, Arc<dyn Consumer>>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("active", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{Consumer, FnSink, SubscriptionError, SubscriptionId, SubscriptionRegistry};

    fn noop() -> Arc<dyn Consumer> {
        Arc::new(FnSink::new(|_| {}))
    }

    #[test]
    fn register_issues_distinct_ids() {
        let registry = SubscriptionRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            assert!(seen.insert(registry.register(noop())));
        }
        assert_eq!(registry.len(), 256);
    }

    #[test]
    fn churn_keeps_only_live_entries() {
        let registry = SubscriptionRegistry::new();
        let keep = registry.register(noop());
        let mut released = std::collections::HashSet::new();
        for _ in 0..1_000 {
            let id = registry.register(noop());
            assert_ne!(id, keep);
            assert!(released.insert(id));
            assert!(registry.unregister(&id));
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids(), vec![keep]);
        assert!(registry.read().capacity() < 1_000);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let id = registry.register(noop());
        assert!(registry.contains(&id));
        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        assert!(registry.lookup(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn lookup_returns_shared_consumer() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = registry.register(Arc::new(FnSink::new({
            let seen = Arc::clone(&seen);
            move |value| seen.lock().expect("lock").push(value)
        })));

        registry.lookup(&id).expect("entry").on_data(json!({"x": 1}));
        assert_eq!(*seen.lock().expect("lock"), vec![json!({"x": 1})]);
    }

    #[test]
    fn subscription_id_round_trips_through_text() {
        let registry = SubscriptionRegistry::new();
        let id = registry.register(noop());
        let parsed: SubscriptionId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SubscriptionId>().is_err());
    }

    #[test]
    fn fn_sink_skips_missing_hooks() {
        let registry = SubscriptionRegistry::new();
        let id = registry.register(noop());
        let sink = FnSink::new(|_| {});
        sink.on_error(SubscriptionError {
            id,
            errors: json!([]),
        });
        sink.on_complete();
    }

    #[test]
    fn fn_sink_invokes_present_hooks() {
        let registry = SubscriptionRegistry::new();
        let id = registry.register(noop());
        let errors = Arc::new(AtomicUsize::new(0));
        let completes = Arc::new(AtomicUsize::new(0));
        let sink = FnSink::new(|_| {})
            .with_error({
                let errors = Arc::clone(&errors);
                move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                }
            })
            .with_complete({
                let completes = Arc::clone(&completes);
                move || {
                    completes.fetch_add(1, Ordering::SeqCst);
                }
            });

        sink.on_error(SubscriptionError {
            id,
            errors: json!([{"message": "bad"}]),
        });
        sink.on_complete();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }
}
