//! Tracks which topics carry user-declared actions.
//!
//! Literal topics live in the normal set; patterns with a trailing `+` live
//! in the wildcard set and are resolved against the observed topic list as
//! traffic arrives. Every normal marker records its provenance: added
//! directly by the user, derived from a wildcard pattern, or both. Removing
//! a wildcard pattern therefore never strips a topic the user also marked
//! directly.

use std::collections::{HashMap, HashSet};

use crate::topic_matcher;

#[derive(Debug, Default, Clone, Copy)]
struct Marker {
    direct: bool,
    from_wildcard: bool,
}

#[derive(Debug, Default)]
struct ConnectionActions {
    normal: HashMap<String, Marker>,
    wildcard: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct ActionTopicCache {
    connections: HashMap<String, ConnectionActions>,
}

impl ActionTopicCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// O(1) membership test used on every tree-view row.
    pub fn has_action(&self, client_key: &str, topic: &str) -> bool {
        self.connections
            .get(client_key)
            .is_some_and(|conn| conn.normal.contains_key(topic))
    }

    pub fn normal_topics(&self, client_key: &str) -> Vec<String> {
        self.connections
            .get(client_key)
            .map(|conn| conn.normal.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn wildcard_patterns(&self, client_key: &str) -> Vec<String> {
        self.connections
            .get(client_key)
            .map(|conn| conn.wildcard.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn mark_direct(&mut self, client_key: &str, topic: &str) {
        self.connections
            .entry(client_key.to_string())
            .or_default()
            .normal
            .entry(topic.to_string())
            .or_default()
            .direct = true;
    }

    pub fn mark_from_wildcard(&mut self, client_key: &str, topic: &str) {
        self.connections
            .entry(client_key.to_string())
            .or_default()
            .normal
            .entry(topic.to_string())
            .or_default()
            .from_wildcard = true;
    }

    pub fn add_wildcard_pattern(&mut self, client_key: &str, pattern: &str) {
        self.connections
            .entry(client_key.to_string())
            .or_default()
            .wildcard
            .insert(pattern.to_string());
    }

    /// Removes a directly-added marker. The topic stays marked when a
    /// wildcard pattern still covers it.
    pub fn unmark_direct(&mut self, client_key: &str, topic: &str) {
        let Some(conn) = self.connections.get_mut(client_key) else {
            return;
        };

        if let Some(marker) = conn.normal.get_mut(topic) {
            marker.direct = false;
            if !marker.from_wildcard {
                conn.normal.remove(topic);
            }
        }
    }

    /// Removes a wildcard pattern and unmarks every strictly-matching topic
    /// that was not also added directly. The caller re-resolves the remaining
    /// patterns afterwards, so overlapping wildcards keep their topics.
    pub fn remove_wildcard_pattern(&mut self, client_key: &str, pattern: &str) {
        let Some(conn) = self.connections.get_mut(client_key) else {
            return;
        };

        conn.wildcard.remove(pattern);

        conn.normal.retain(|topic, marker| {
            if !topic_matcher::matches(pattern, topic) {
                return true;
            }
            marker.from_wildcard = false;
            marker.direct
        });
    }

    pub fn clear_connection(&mut self, client_key: &str) {
        self.connections.remove(client_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_marker_is_a_membership_test() {
        let mut cache = ActionTopicCache::new();
        cache.mark_direct("c1", "home/light");

        assert!(cache.has_action("c1", "home/light"));
        assert!(!cache.has_action("c1", "home/other"));
        assert!(!cache.has_action("c2", "home/light"));
    }

    #[test]
    fn removing_a_wildcard_strips_derived_markers() {
        let mut cache = ActionTopicCache::new();
        cache.add_wildcard_pattern("c1", "home/+");
        cache.mark_from_wildcard("c1", "home/kitchen");
        cache.mark_from_wildcard("c1", "home/garage");

        cache.remove_wildcard_pattern("c1", "home/+");

        assert!(!cache.has_action("c1", "home/kitchen"));
        assert!(!cache.has_action("c1", "home/garage"));
        assert!(cache.wildcard_patterns("c1").is_empty());
    }

    #[test]
    fn removing_a_wildcard_keeps_directly_added_markers() {
        let mut cache = ActionTopicCache::new();
        cache.mark_direct("c1", "home/kitchen");
        cache.add_wildcard_pattern("c1", "home/+");
        cache.mark_from_wildcard("c1", "home/kitchen");
        cache.mark_from_wildcard("c1", "home/garage");

        cache.remove_wildcard_pattern("c1", "home/+");

        assert!(cache.has_action("c1", "home/kitchen"));
        assert!(!cache.has_action("c1", "home/garage"));
    }

    #[test]
    fn unmark_direct_keeps_wildcard_covered_topics() {
        let mut cache = ActionTopicCache::new();
        cache.mark_direct("c1", "home/kitchen");
        cache.mark_from_wildcard("c1", "home/kitchen");

        cache.unmark_direct("c1", "home/kitchen");
        assert!(cache.has_action("c1", "home/kitchen"));

        cache.remove_wildcard_pattern("c1", "home/+");
        assert!(!cache.has_action("c1", "home/kitchen"));
    }

    #[test]
    fn unmark_direct_drops_purely_direct_topics() {
        let mut cache = ActionTopicCache::new();
        cache.mark_direct("c1", "home/kitchen");
        cache.unmark_direct("c1", "home/kitchen");

        assert!(!cache.has_action("c1", "home/kitchen"));
    }

    #[test]
    fn operations_on_unknown_connections_are_noops() {
        let mut cache = ActionTopicCache::new();
        cache.unmark_direct("nope", "a");
        cache.remove_wildcard_pattern("nope", "a/+");
        assert!(cache.normal_topics("nope").is_empty());
    }
}
