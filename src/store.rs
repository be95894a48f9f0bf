//! Request-scoped key/value store.
//!
//! Units that need to hand data to later units (an authenticated user, a
//! parsed body, a trace id) stash it in a [`Store`] keyed by the request's
//! [`RequestId`]. The store is an ordinary value: build one, share it through
//! an `Arc`, and hand it to the units that need it.
//!
//! Bags must be cleared when their request completes or the store grows
//! without bound. Put [`ClearOnExit`] at the head of the chain, or wrap the
//! whole endpoint with [`Store::wrap_with_cleanup`]; [`Store::purge`] reaps
//! whatever slips through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::chain::Next;
use crate::error::Outcome;
use crate::handler::{Endpoint, Handler};
use crate::request::{Request, RequestId};
use crate::sink::ResponseSink;
use crate::writer::ResponseWriter;

/// The kinds of value the default store holds.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Floats, and integers widened to `f64`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(n) => Some(*n),
            Self::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Self::Bool(b) }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self { Self::Int(n.into()) }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self { Self::Int(n) }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self { Self::Int(n.into()) }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self { Self::Float(n) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Self::Text(s.to_owned()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Self::Text(s) }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self { Self::Bytes(b) }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self { Self::Bytes(b.into()) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

struct Bag<V> {
    values: HashMap<String, V>,
    created: Instant,
}

/// Per-request key/value bags behind one reader/writer lock.
///
/// Reads (`get`, `contains`, `get_all`) share the lock; writes take it
/// exclusively. The store never calls back into user code while locked.
pub struct Store<V = Value> {
    bags: RwLock<HashMap<RequestId, Bag<V>>>,
}

impl<V> Store<V> {
    pub fn new() -> Self {
        Self { bags: RwLock::new(HashMap::new()) }
    }

    /// Stores `value` under `key`, creating the request's bag on first use.
    pub fn set(&self, id: RequestId, key: impl Into<String>, value: impl Into<V>) {
        let mut bags = self.bags.write();
        let bag = bags.entry(id).or_insert_with(|| Bag {
            values: HashMap::new(),
            created: Instant::now(),
        });
        bag.values.insert(key.into(), value.into());
    }

    pub fn contains(&self, id: RequestId, key: &str) -> bool {
        self.bags.read().get(&id).is_some_and(|bag| bag.values.contains_key(key))
    }

    pub fn delete(&self, id: RequestId, key: &str) {
        if let Some(bag) = self.bags.write().get_mut(&id) {
            bag.values.remove(key);
        }
    }

    /// Drops the request's whole bag.
    pub fn clear(&self, id: RequestId) {
        self.bags.write().remove(&id);
    }

    /// Removes bags created longer than `max_age` ago and returns how many
    /// went. `Duration::ZERO` removes every bag.
    pub fn purge(&self, max_age: Duration) -> usize {
        let mut bags = self.bags.write();
        let before = bags.len();
        if max_age.is_zero() {
            bags.clear();
        } else {
            bags.retain(|_, bag| bag.created.elapsed() <= max_age);
        }
        before - bags.len()
    }

    /// Number of requests with a bag.
    pub fn len(&self) -> usize {
        self.bags.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn backdate(&self, id: RequestId, by: Duration) {
        if let Some(bag) = self.bags.write().get_mut(&id) {
            bag.created = bag.created.checked_sub(by).unwrap_or(bag.created);
        }
    }
}

impl<V: Clone> Store<V> {
    /// The value under `key`. `None` means the key is unset; a stored
    /// [`Value::Null`] comes back as `Some(Value::Null)`.
    pub fn get(&self, id: RequestId, key: &str) -> Option<V> {
        self.bags.read().get(&id)?.values.get(key).cloned()
    }

    /// A copy of the request's bag, or `None` if nothing was ever stored for it.
    pub fn get_all(&self, id: RequestId) -> Option<HashMap<String, V>> {
        self.bags.read().get(&id).map(|bag| bag.values.clone())
    }

    /// A copy of the bag (empty if absent) and whether the request has one.
    pub fn get_all_ok(&self, id: RequestId) -> (HashMap<String, V>, bool) {
        match self.get_all(id) {
            Some(values) => (values, true),
            None => (HashMap::new(), false),
        }
    }
}

impl<V: Send + Sync + 'static> Store<V> {
    /// Wraps `endpoint` so the request's bag is cleared once it returns,
    /// faults, or unwinds.
    pub fn wrap_with_cleanup<E: Endpoint>(self: &Arc<Self>, endpoint: E) -> Cleanup<E, V> {
        Cleanup { inner: endpoint, store: Arc::clone(self) }
    }
}

impl<V> Default for Store<V> {
    fn default() -> Self { Self::new() }
}

/// Clears a bag when dropped.
struct ClearGuard<'a, V> {
    store: &'a Store<V>,
    id: RequestId,
}

impl<V> Drop for ClearGuard<'_, V> {
    fn drop(&mut self) {
        self.store.clear(self.id);
    }
}

/// An endpoint whose requests never leave a bag behind.
pub struct Cleanup<E, V = Value> {
    inner: E,
    store: Arc<Store<V>>,
}

impl<E: Endpoint, V: Send + Sync + 'static> Endpoint for Cleanup<E, V> {
    fn serve(&self, sink: &mut dyn ResponseSink, req: &Request) -> Outcome {
        let _guard = ClearGuard { store: &self.store, id: req.id() };
        self.inner.serve(sink, req)
    }
}

/// Chain unit that clears the request's bag after the rest of the chain ran.
pub struct ClearOnExit<V = Value> {
    store: Arc<Store<V>>,
}

impl<V> ClearOnExit<V> {
    pub fn new(store: Arc<Store<V>>) -> Self {
        Self { store }
    }
}

impl<V: Send + Sync + 'static> Handler for ClearOnExit<V> {
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        let _guard = ClearGuard { store: &self.store, id: req.id() };
        next.run(rw, req)
    }

    fn name(&self) -> &'static str {
        "ClearOnExit"
    }
}
