//! Registry of subscriptions mirrored on the server.
//!
//! DESIGN
//! ======
//! The table exists only once the session is authenticated; its capacity is
//! whatever the server declared in the auth response. Ids are allocated from
//! a process-wide counter so they stay unique across reconnects.
//!
//! Removal is local-first: entries are deleted immediately and the caller
//! tells the server afterwards. A publish for an id that is already gone is
//! expected (the server may push before it processes our unsubscribe) and is
//! dropped without complaint.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::{BoxError, ClientError};
use crate::topic::Topic;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(0);

/// Application callback for a server subscription.
pub type ServerHandler = Arc<dyn Fn(&Value, &SubscriptionDelivery<'_>) -> Result<(), BoxError> + Send + Sync>;

/// Payload transform applied before the callback runs.
pub type Transform = Arc<dyn Fn(&Value) -> Result<Value, BoxError> + Send + Sync>;

/// Wrap a closure as a [`ServerHandler`].
pub fn server_handler<F>(f: F) -> ServerHandler
where
    F: Fn(&Value, &SubscriptionDelivery<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`Transform`].
pub fn transform<F>(f: F) -> Transform
where
    F: Fn(&Value) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_server_handler(a: &ServerHandler, b: &ServerHandler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// What a server-subscription callback sees besides the payload.
#[derive(Clone, Copy, Debug)]
pub struct SubscriptionDelivery<'a> {
    pub id: u64,
    pub path: &'a str,
    /// Invocation context; defaults to the path.
    pub context: &'a Value,
}

/// Registration request.
#[derive(Clone, Default)]
pub struct NewSubscription {
    pub path: String,
    pub callback: Option<ServerHandler>,
    pub context: Option<Value>,
    pub transform: Option<Transform>,
    /// Extra local topics the transformed payload is republished on.
    pub topics: Vec<Topic>,
}

impl NewSubscription {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    #[must_use]
    pub fn callback(mut self, callback: ServerHandler) -> Self {
        self.callback = Some(callback);
        self
    }

    #[must_use]
    pub fn context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    #[must_use]
    pub fn topic(mut self, topic: impl Into<Topic>) -> Self {
        self.topics.push(topic.into());
        self
    }
}

impl fmt::Debug for NewSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSubscription")
            .field("path", &self.path)
            .field("context", &self.context)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

/// Selector for [`SubscriptionTable::remove`].
#[derive(Clone)]
pub enum Removal {
    All,
    Id(u64),
    Path(String),
    Callback(ServerHandler),
}

impl From<u64> for Removal {
    fn from(id: u64) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for Removal {
    fn from(path: &str) -> Self {
        Self::Path(path.to_owned())
    }
}

impl From<String> for Removal {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}

impl From<ServerHandler> for Removal {
    fn from(callback: ServerHandler) -> Self {
        Self::Callback(callback)
    }
}

struct ServerSubscription {
    id: u64,
    path: String,
    callback: Option<ServerHandler>,
    context: Value,
    transform: Option<Transform>,
    topics: Vec<Topic>,
}

/// A callback failure during [`SubscriptionTable::trigger`].
pub struct SubscriptionFailure {
    pub id: u64,
    pub path: String,
    pub context: Value,
    pub error: BoxError,
}

impl SubscriptionFailure {
    #[must_use]
    pub fn detail(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "path": self.path,
            "context": self.context,
            "exception": self.error.to_string(),
        })
    }
}

impl fmt::Debug for SubscriptionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionFailure")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Outcome of delivering a publish to a live subscription.
#[derive(Debug)]
pub struct Triggered {
    /// Payload after the transform (or the raw payload if it failed).
    pub payload: Value,
    /// Extra local topics to republish on.
    pub topics: Vec<Topic>,
    pub failure: Option<SubscriptionFailure>,
}

pub struct SubscriptionTable {
    max: Option<usize>,
    entries: BTreeMap<u64, ServerSubscription>,
}

impl SubscriptionTable {
    /// `max` is the server-declared limit; `None` means the server declared none.
    #[must_use]
    pub fn new(max: Option<usize>) -> Self {
        Self { max, entries: BTreeMap::new() }
    }

    /// Register a subscription and return its id.
    ///
    /// # Errors
    ///
    /// [`ClientError::Argument`] for an empty path or a reserved extra topic,
    /// [`ClientError::Capacity`] when full, [`ClientError::DuplicatePath`]
    /// when the path is already registered.
    pub fn add(&mut self, request: NewSubscription) -> Result<u64, ClientError> {
        let NewSubscription { path, callback, context, transform, topics } = request;

        if path.is_empty() {
            return Err(ClientError::Argument("subscription path must not be empty".into()));
        }
        if let Some(reserved) = topics.iter().find(|t| t.is_reserved()) {
            return Err(ClientError::Argument(format!("topic '{reserved}' is reserved")));
        }
        if let Some(max) = self.max {
            if self.entries.len() >= max {
                return Err(ClientError::Capacity { max });
            }
        }
        if self.entries.values().any(|s| s.path == path) {
            return Err(ClientError::DuplicatePath(path));
        }

        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let context = context.unwrap_or_else(|| Value::String(path.clone()));
        self.entries.insert(id, ServerSubscription { id, path, callback, context, transform, topics });
        Ok(id)
    }

    /// Delete every matching entry and return their ids, ascending.
    pub fn remove(&mut self, target: &Removal) -> Vec<u64> {
        let matched: Vec<u64> = self
            .entries
            .values()
            .filter(|s| match target {
                Removal::All => true,
                Removal::Id(id) => s.id == *id,
                Removal::Path(path) => s.path == *path,
                Removal::Callback(cb) => s.callback.as_ref().is_some_and(|own| same_server_handler(own, cb)),
            })
            .map(|s| s.id)
            .collect();

        for id in &matched {
            self.entries.remove(id);
        }
        matched
    }

    /// Deliver a raw payload to subscription `id`.
    ///
    /// Returns `None` when the id is unknown; that is not an error.
    #[must_use]
    pub fn trigger(&self, id: u64, raw: &Value) -> Option<Triggered> {
        let sub = self.entries.get(&id)?;

        let payload = match &sub.transform {
            Some(transform) => transform(raw).unwrap_or_else(|_| raw.clone()),
            None => raw.clone(),
        };

        let failure = sub.callback.as_ref().and_then(|callback| {
            let delivery = SubscriptionDelivery { id, path: &sub.path, context: &sub.context };
            callback(&payload, &delivery).err().map(|error| SubscriptionFailure {
                id,
                path: sub.path.clone(),
                context: sub.context.clone(),
                error,
            })
        });

        Some(Triggered { payload, topics: sub.topics.clone(), failure })
    }

    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    #[must_use]
    pub fn path_of(&self, id: u64) -> Option<&str> {
        self.entries.get(&id).map(|s| s.path.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.max
    }
}

#[cfg(test)]
#[path = "subscriptions_test.rs"]
mod tests;
