use crate::handler::{HandlerId, HandlerRef};
use crate::topic::{Topic, TopicFilter, WILDCARD};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{error, trace, warn};

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    handlers: BTreeMap<HandlerId, HandlerRef>,
}

struct Removal {
    removed: bool,
    empty: bool,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.children.is_empty()
    }

    fn insert(&mut self, segments: &[&str], handler: &HandlerRef) -> bool {
        match segments.split_first() {
            None => {
                if self.handlers.contains_key(&handler.id()) {
                    return false;
                }
                self.handlers.insert(handler.id(), handler.clone());
                true
            }
            Some((head, rest)) => self
                .children
                .entry((*head).to_string())
                .or_default()
                .insert(rest, handler),
        }
    }

    // Emptiness is reported after the recursive edit so the parent prunes on fresh state.
    fn remove(&mut self, segments: &[&str], handler: Option<HandlerId>) -> Removal {
        let removed = match segments.split_first() {
            None => match handler {
                Some(id) => self.handlers.remove(&id).is_some(),
                None => {
                    let removed = !self.handlers.is_empty();
                    self.handlers.clear();
                    removed
                }
            },
            Some((head, rest)) => match self.children.get_mut(*head) {
                Some(child) => {
                    let outcome = child.remove(rest, handler);
                    if outcome.empty {
                        self.children.remove(*head);
                    }
                    outcome.removed
                }
                None => false,
            },
        };

        Removal {
            removed,
            empty: self.is_empty(),
        }
    }

    fn collect(&self, segments: &[&str], out: &mut Vec<HandlerRef>) {
        match segments.split_first() {
            None => out.extend(self.handlers.values().cloned()),
            Some((head, rest)) => {
                if let Some(child) = self.children.get(*head) {
                    child.collect(rest, out);
                }
                if let Some(child) = self.children.get(WILDCARD) {
                    child.collect(rest, out);
                }
            }
        }
    }

    fn routes(&self, segments: &[&str], id: HandlerId) -> bool {
        match segments.split_first() {
            None => self.handlers.contains_key(&id),
            Some((head, rest)) => {
                self.children
                    .get(*head)
                    .is_some_and(|child| child.routes(rest, id))
                    || self
                        .children
                        .get(WILDCARD)
                        .is_some_and(|child| child.routes(rest, id))
            }
        }
    }

    fn find(&self, segments: &[&str]) -> Option<&Self> {
        match segments.split_first() {
            None => Some(self),
            Some((head, rest)) => self.children.get(*head)?.find(rest),
        }
    }
}

/// Routes published topics to the handlers whose filters match them.
///
/// The dispatcher is a trie keyed by topic segment, with the wildcard `+`
/// stored as an ordinary child key. Empty nodes are pruned as part of the
/// removal that emptied them, so the structure never holds dead paths and
/// [`Dispatcher::has_subscribers`] can be used to decide whether a broker
/// subscription is still needed.
#[derive(Default)]
pub struct Dispatcher {
    root: Mutex<Node>,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler under a filter. Returns `false` if it was already there.
    pub fn subscribe(&self, filter: &TopicFilter, handler: &HandlerRef) -> bool {
        let segments: Vec<&str> = filter.segments().collect();
        self.root.lock().insert(&segments, handler)
    }

    /// Removes one handler, or every handler when `handler` is `None`, at the
    /// exact path of `filter`. Returns whether anything was removed.
    pub fn unsubscribe(&self, filter: &TopicFilter, handler: Option<HandlerId>) -> bool {
        let segments: Vec<&str> = filter.segments().collect();
        self.root.lock().remove(&segments, handler).removed
    }

    /// Whether any handler is registered at the exact path of `filter`.
    pub fn has_subscribers(&self, filter: &TopicFilter) -> bool {
        let segments: Vec<&str> = filter.segments().collect();
        self.root
            .lock()
            .find(&segments)
            .is_some_and(|node| !node.handlers.is_empty())
    }

    /// Whether no handler is registered at all.
    pub fn is_empty(&self) -> bool {
        self.root.lock().is_empty()
    }

    /// Returns the handlers matching `topic`.
    ///
    /// Handlers reached through literal segments come before those reached
    /// through wildcards; a handler matched by several filters appears once.
    pub fn matches(&self, topic: &Topic) -> Vec<HandlerRef> {
        let segments: Vec<&str> = topic.segments().collect();
        let mut matched = Vec::new();
        self.root.lock().collect(&segments, &mut matched);

        let mut seen = HashSet::with_capacity(matched.len());
        matched.retain(|handler| seen.insert(handler.id()));
        matched
    }

    /// Invokes every handler matching `topic` concurrently.
    ///
    /// A handler is started only if it still matches at that moment, so once
    /// [`Dispatcher::unsubscribe`] returns no new invocation of the removed
    /// handler begins. A handler that fails or panics is logged and does not
    /// affect the others. Returns the number of handlers invoked.
    pub async fn dispatch(&self, topic: &Topic, payload: Bytes) -> usize {
        let handlers = self.matches(topic);
        if handlers.is_empty() {
            trace!(%topic, "no handlers for topic");
            return 0;
        }

        let invocations = handlers.iter().map(|handler| {
            let payload = payload.clone();
            async move {
                if !self.routes(topic, handler.id()) {
                    trace!(%topic, handler = ?handler.id(), "handler removed before dispatch");
                    return false;
                }

                let invocation = handler.handle(topic.clone(), payload);
                match AssertUnwindSafe(invocation).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(%topic, handler = ?handler.id(), "handler failed: {e}"),
                    Err(_) => error!(%topic, handler = ?handler.id(), "handler panicked"),
                }
                true
            }
        });

        join_all(invocations)
            .await
            .into_iter()
            .filter(|invoked| *invoked)
            .count()
    }

    fn routes(&self, topic: &Topic, id: HandlerId) -> bool {
        let segments: Vec<&str> = topic.segments().collect();
        self.root.lock().routes(&segments, id)
    }
}
