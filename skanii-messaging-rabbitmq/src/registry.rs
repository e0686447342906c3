use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use skanii_messaging_core::Subscription;

/// Local record of active subscriptions, keyed by queue name.
///
/// Reflects what this client asked for; it is cleared on a transport drop
/// without checking what the broker still holds.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    tags: RwLock<HashMap<String, String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tag previously registered for `queue`, if any.
    pub fn insert(&self, queue: &str, consumer_tag: &str) -> Option<String> {
        self.tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string(), consumer_tag.to_string())
    }

    pub fn get(&self, queue: &str) -> Option<String> {
        self.tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
    }

    /// Removes the entry only if it still points at `consumer_tag`.
    pub fn remove_if(&self, queue: &str, consumer_tag: &str) -> bool {
        let mut tags = self.tags.write().unwrap_or_else(PoisonError::into_inner);
        if tags.get(queue).map(String::as_str) == Some(consumer_tag) {
            tags.remove(queue);
            true
        } else {
            false
        }
    }

    /// Drops every entry and returns how many there were.
    pub fn clear(&self) -> usize {
        let mut tags = self.tags.write().unwrap_or_else(PoisonError::into_inner);
        let n = tags.len();
        tags.clear();
        n
    }

    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        queues.sort();
        queues
    }

    /// Snapshot ordered by queue name.
    pub fn snapshot(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(queue, tag)| Subscription {
                queue: queue.clone(),
                consumer_tag: tag.clone(),
            })
            .collect();
        subs.sort_by(|a, b| a.queue.cmp(&b.queue));
        subs
    }

    pub fn len(&self) -> usize {
        self.tags.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_overwrites_and_returns_previous_tag() {
        let reg = SubscriptionRegistry::new();
        assert_eq!(reg.insert("uploads", "ctag-1"), None);
        assert_eq!(reg.insert("uploads", "ctag-2"), Some("ctag-1".to_string()));
        assert_eq!(reg.get("uploads").as_deref(), Some("ctag-2"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_if_ignores_replaced_tags() {
        let reg = SubscriptionRegistry::new();
        reg.insert("results", "ctag-2");
        assert!(!reg.remove_if("results", "ctag-1"));
        assert!(reg.remove_if("results", "ctag-2"));
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_and_clear_empties() {
        let reg = SubscriptionRegistry::new();
        reg.insert("b", "t-b");
        reg.insert("a", "t-a");

        let snap = reg.snapshot();
        assert_eq!(snap[0].queue, "a");
        assert_eq!(snap[1].consumer_tag, "t-b");
        assert_eq!(reg.queues(), vec!["a".to_string(), "b".to_string()]);

        assert_eq!(reg.clear(), 2);
        assert!(reg.is_empty());
    }
}
