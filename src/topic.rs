//! Hierarchical local publish/subscribe.
//!
//! DESIGN
//! ======
//! A topic is a dot-delimited path of fragments. Each fragment escapes `\`
//! and `.` with a backslash before joining, so the canonical string is the
//! unit of equality: subscribing to the single fragment `x.y` is the same as
//! subscribing to `x\.y`.
//!
//! Publishing on `a.b.c` notifies subscribers of `a`, `a.b` and `a.b.c`, in
//! that order. Registration is on exact canonical topics only.
//!
//! ERROR HANDLING
//! ==============
//! A failing subscriber never stops delivery to its siblings or to deeper
//! prefixes. Each failure is wrapped in a [`DeliveryFailure`] and handed to
//! the sink supplied by the publisher.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{BoxError, ClientError};

/// Fragment separator.
pub const SEPARATOR: char = '.';

const ESCAPE: char = '\\';

/// Reserved for protocol and runtime failure notification.
pub const ERROR_TOPIC: &str = "error";

// =============================================================================
// TOPIC
// =============================================================================

/// A topic in canonical (escaped) form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    /// Canonicalize a dot-delimited topic string.
    ///
    /// Escapes in `raw` are honoured, so `x\.y` is one fragment.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let fragments = explode_fragments(raw);
        Self(join_fragments(&fragments))
    }

    /// Build a topic from unescaped fragments.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] for an empty fragment list.
    pub fn from_fragments<S: AsRef<str>>(fragments: &[S]) -> Result<Self, ClientError> {
        if fragments.is_empty() {
            return Err(ClientError::Argument("topic fragment list is empty".into()));
        }
        Ok(Self(join_fragments(fragments)))
    }

    /// Canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unescaped fragments.
    #[must_use]
    pub fn fragments(&self) -> Vec<String> {
        explode_fragments(&self.0)
    }

    /// Every ancestor prefix, most general first, ending with `self`.
    #[must_use]
    pub fn hierarchy(&self) -> Vec<Topic> {
        let fragments = self.fragments();
        let mut out: Vec<Topic> = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            let escaped = escape_fragment(fragment);
            let next = match out.last() {
                Some(prev) => format!("{}{SEPARATOR}{escaped}", prev.0),
                None => escaped,
            };
            out.push(Topic(next));
        }
        out
    }

    /// True for the reserved `error` topic.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.0 == ERROR_TOPIC
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for Topic {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&String> for Topic {
    fn from(raw: &String) -> Self {
        Self::parse(raw)
    }
}

impl From<&Topic> for Topic {
    fn from(topic: &Topic) -> Self {
        topic.clone()
    }
}

/// Escape backslash and separator in one fragment.
#[must_use]
pub fn escape_fragment(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if c == ESCAPE || c == SEPARATOR {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Split an escaped topic string into unescaped fragments.
///
/// A trailing lone escape character is dropped.
#[must_use]
pub fn explode_fragments(raw: &str) -> Vec<String> {
    let mut out = vec![String::new()];
    let mut escaped = false;
    for c in raw.chars() {
        if escaped {
            push_char(&mut out, c);
            escaped = false;
        } else if c == ESCAPE {
            escaped = true;
        } else if c == SEPARATOR {
            out.push(String::new());
        } else {
            push_char(&mut out, c);
        }
    }
    out
}

fn push_char(out: &mut [String], c: char) {
    if let Some(last) = out.last_mut() {
        last.push(c);
    }
}

fn join_fragments<S: AsRef<str>>(fragments: &[S]) -> String {
    fragments
        .iter()
        .map(|f| escape_fragment(f.as_ref()))
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

// =============================================================================
// SUBSCRIBERS
// =============================================================================

/// Local subscriber callback.
pub type Handler = Arc<dyn Fn(&Value, &Delivery<'_>) -> Result<(), BoxError> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Value, &Delivery<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identity comparison for handlers.
#[must_use]
pub fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Per-subscription options.
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    /// Invocation context handed back on every delivery.
    pub context: Option<Value>,
    /// Opaque user data handed back on every delivery.
    pub data: Option<Value>,
}

/// What a subscriber sees besides the payload.
#[derive(Clone, Copy, Debug)]
pub struct Delivery<'a> {
    /// Topic that was published.
    pub topic: &'a Topic,
    /// Prefix the subscriber registered on.
    pub subscription: &'a Topic,
    pub context: Option<&'a Value>,
    pub data: Option<&'a Value>,
}

/// A subscriber failure, with enough detail to identify the offender.
pub struct DeliveryFailure {
    pub topic: Topic,
    pub subscription: Topic,
    pub payload: Value,
    pub context: Option<Value>,
    pub data: Option<Value>,
    pub handler: Handler,
    pub error: BoxError,
}

impl DeliveryFailure {
    /// JSON detail for error reporting.
    #[must_use]
    pub fn detail(&self) -> Value {
        serde_json::json!({
            "topic": self.topic.as_str(),
            "subscription": self.subscription.as_str(),
            "payload": self.payload,
            "context": self.context,
            "data": self.data,
            "exception": self.error.to_string(),
        })
    }
}

impl fmt::Debug for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryFailure")
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("payload", &self.payload)
            .field("context", &self.context)
            .field("data", &self.data)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Target of [`TopicRouter::unsubscribe`].
#[derive(Clone)]
pub enum Unsubscribe {
    /// Drop every subscriber of this exact topic.
    Topic(Topic),
    /// Drop this handler wherever it is registered.
    Handler(Handler),
}

struct Subscriber {
    handler: Handler,
    options: SubscribeOptions,
}

// =============================================================================
// ROUTER
// =============================================================================

/// Local hierarchical publish/subscribe registry.
#[derive(Default)]
pub struct TopicRouter {
    subscribers: HashMap<Topic, Vec<Subscriber>>,
}

impl TopicRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on the exact canonical `topic`.
    pub fn subscribe(&mut self, topic: impl Into<Topic>, handler: Handler, options: SubscribeOptions) {
        self.subscribers
            .entry(topic.into())
            .or_default()
            .push(Subscriber { handler, options });
    }

    /// Remove subscribers; returns how many were removed.
    pub fn unsubscribe(&mut self, target: &Unsubscribe) -> usize {
        match target {
            Unsubscribe::Topic(topic) => self.subscribers.remove(topic).map_or(0, |subs| subs.len()),
            Unsubscribe::Handler(handler) => {
                let mut removed = 0;
                self.subscribers.retain(|_, subs| {
                    let before = subs.len();
                    subs.retain(|s| !same_handler(&s.handler, handler));
                    removed += before - subs.len();
                    !subs.is_empty()
                });
                removed
            }
        }
    }

    /// Deliver `payload` to every subscriber of every prefix of `topic`.
    ///
    /// Returns the number of subscribers invoked, failed or not.
    pub fn publish(
        &self,
        topic: impl Into<Topic>,
        payload: &Value,
        on_error: &mut dyn FnMut(DeliveryFailure),
    ) -> usize {
        let topic = topic.into();
        let mut invoked = 0;
        for prefix in topic.hierarchy() {
            let Some(subs) = self.subscribers.get(&prefix) else {
                continue;
            };
            for sub in subs {
                invoked += 1;
                let delivery = Delivery {
                    topic: &topic,
                    subscription: &prefix,
                    context: sub.options.context.as_ref(),
                    data: sub.options.data.as_ref(),
                };
                if let Err(error) = (sub.handler)(payload, &delivery) {
                    on_error(DeliveryFailure {
                        topic: topic.clone(),
                        subscription: prefix.clone(),
                        payload: payload.clone(),
                        context: sub.options.context.clone(),
                        data: sub.options.data.clone(),
                        handler: Arc::clone(&sub.handler),
                        error,
                    });
                }
            }
        }
        invoked
    }

    /// Subscribers registered on exactly `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: impl Into<Topic>) -> usize {
        self.subscribers.get(&topic.into()).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
#[path = "topic_test.rs"]
mod tests;
