//! Topic handler registry.
//!
//! Handlers live as long as the channel that owns the registry, or until
//! removed by id or by [`HandlerRegistry::unsubscribe_all`]. Reconnects never
//! touch the registry, so a handler registered once fires once per message.

use std::collections::BTreeMap;
use std::fmt;

use story_core::PushMessage;

pub type Handler = Box<dyn FnMut(&PushMessage) + Send>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct HandlerRegistry {
    next_id: u64,
    by_topic: BTreeMap<String, Vec<(SubscriptionId, Handler)>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.by_topic.iter().map(|(topic, handlers)| (topic, handlers.len())))
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: &str, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.by_topic
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.by_topic.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    /// Drop every handler. Returns how many were dropped.
    pub fn unsubscribe_all(&mut self) -> usize {
        let count = self.len();
        self.by_topic.clear();
        count
    }

    /// Invoke every handler registered for the message's topic, in
    /// registration order. Returns how many ran.
    pub fn dispatch(&mut self, message: &PushMessage) -> usize {
        match self.by_topic.get_mut(message.topic()) {
            Some(handlers) => {
                for (_, handler) in handlers.iter_mut() {
                    handler(message);
                }
                handlers.len()
            }
            None => 0,
        }
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.by_topic.get(topic).map(Vec::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_topic.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }
}
