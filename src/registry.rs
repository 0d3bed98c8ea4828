//! Application-owned registry of everything observed and declared.
//!
//! Owns the topic index, the action cache and the publish history behind one
//! lock, so that each cross-component operation (ingest plus wildcard
//! reconciliation, action add plus topic materialization) is atomic with
//! respect to concurrent queries. Constructed once at the application root
//! and injected into every consumer, which keeps unit tests free of global
//! state.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::actions_cache::ActionTopicCache;
use crate::models::Message;
use crate::topic_index::{TopicIndex, TopicNode};
use crate::topic_matcher;

#[derive(Default)]
struct PublishHistory {
    messages: HashMap<String, HashMap<String, Vec<Message>>>,
}

struct Inner {
    topics: TopicIndex,
    actions: ActionTopicCache,
    publishes: PublishHistory,
}

pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(max_messages: usize) -> Self {
        Registry {
            inner: Mutex::new(Inner {
                topics: TopicIndex::new(max_messages),
                actions: ActionTopicCache::new(),
                publishes: PublishHistory::default(),
            }),
        }
    }

    /// Ingests one received message and reconciles wildcard actions: when the
    /// topic is new, every registered pattern now matching it marks the
    /// concrete topic it addresses.
    pub async fn record_message(&self, client_key: &str, topic: &str, message: Message) {
        let mut inner = self.inner.lock().await;

        let first_seen = inner.topics.add_message(client_key, topic, message);
        if !first_seen {
            return;
        }

        let patterns = inner.actions.wildcard_patterns(client_key);
        for concrete in topic_matcher::topic_matches_sliced_patterns(topic, &patterns) {
            debug!(client_key, topic = %concrete, "wildcard action now covers topic");
            inner.actions.mark_from_wildcard(client_key, &concrete);
            inner.topics.materialize_topic(client_key, &concrete);
        }
    }

    /// Records a message the user published themselves. Kept apart from the
    /// observed history and not subject to the retention cap.
    pub async fn record_publish(&self, client_key: &str, topic: &str, message: Message) {
        let mut inner = self.inner.lock().await;
        inner
            .publishes
            .messages
            .entry(client_key.to_string())
            .or_default()
            .entry(topic.to_string())
            .or_default()
            .push(message);
    }

    /// Attaches an action to a topic. A literal topic is marked and
    /// materialized immediately; a wildcard pattern is resolved against all
    /// currently known topics (retroactive marking) and stored for future
    /// reconciliation.
    pub async fn add_action_topic(&self, client_key: &str, topic: &str) {
        let mut inner = self.inner.lock().await;

        if topic.contains('+') {
            let known = inner.topics.topics_with_messages(client_key);
            for concrete in topic_matcher::filter_by_sliced_pattern(topic, &known) {
                inner.actions.mark_from_wildcard(client_key, &concrete);
                inner.topics.materialize_topic(client_key, &concrete);
            }
            inner.actions.add_wildcard_pattern(client_key, topic);
        } else {
            inner.actions.mark_direct(client_key, topic);
            inner.topics.materialize_topic(client_key, topic);
        }
    }

    /// Detaches an action. Removing a wildcard unmarks its derived topics,
    /// then re-resolves the remaining patterns so overlapping wildcards keep
    /// their markers.
    pub async fn remove_action_topic(&self, client_key: &str, topic: &str) {
        let mut inner = self.inner.lock().await;

        if topic.contains('+') {
            inner.actions.remove_wildcard_pattern(client_key, topic);

            let known = inner.topics.topics_with_messages(client_key);
            for pattern in inner.actions.wildcard_patterns(client_key) {
                for concrete in topic_matcher::filter_by_sliced_pattern(&pattern, &known) {
                    inner.actions.mark_from_wildcard(client_key, &concrete);
                }
            }
        } else {
            inner.actions.unmark_direct(client_key, topic);
        }
    }

    pub async fn has_action(&self, client_key: &str, topic: &str) -> bool {
        self.inner.lock().await.actions.has_action(client_key, topic)
    }

    pub async fn action_topics(&self, client_key: &str) -> Vec<String> {
        self.inner.lock().await.actions.normal_topics(client_key)
    }

    pub async fn last_message(&self, client_key: &str, topic: &str) -> Option<Message> {
        self.inner
            .lock()
            .await
            .topics
            .last_message(client_key, topic)
            .cloned()
    }

    pub async fn messages(&self, client_key: &str, topic: &str) -> Vec<Message> {
        self.inner.lock().await.topics.messages(client_key, topic).to_vec()
    }

    pub async fn all_topics(&self, client_key: &str) -> Vec<String> {
        self.inner.lock().await.topics.all_topics(client_key)
    }

    pub async fn has_descendants(&self, client_key: &str, topic: &str) -> bool {
        self.inner.lock().await.topics.has_descendants(client_key, topic)
    }

    pub async fn subtree_topic_count(&self, client_key: &str, prefix: &str) -> u64 {
        self.inner.lock().await.topics.subtree_topic_count(client_key, prefix)
    }

    pub async fn subtree_message_count(&self, client_key: &str, prefix: &str) -> u64 {
        self.inner
            .lock()
            .await
            .topics
            .subtree_message_count(client_key, prefix)
    }

    pub async fn filtered_tree(&self, client_key: &str, search: &str) -> TopicNode {
        self.inner.lock().await.topics.filtered_tree(client_key, search)
    }

    /// Free-text topic search for the autocomplete box; loose `+` semantics,
    /// see `topic_matcher::filter_by_loose_pattern`.
    pub async fn search_topics(&self, client_key: &str, pattern: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let known = inner.topics.all_topics(client_key);
        topic_matcher::filter_by_loose_pattern(pattern, &known)
    }

    pub async fn publish_history(&self, client_key: &str, topic: &str) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .publishes
            .messages
            .get(client_key)
            .and_then(|topics| topics.get(topic))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn remove_subtree(&self, client_key: &str, prefix: &str) {
        self.inner.lock().await.topics.remove_subtree(client_key, prefix);
    }

    pub async fn clear_connection(&self, client_key: &str) {
        let mut inner = self.inner.lock().await;
        inner.topics.clear_connection(client_key);
        inner.actions.clear_connection(client_key);
        inner.publishes.messages.remove(client_key);
    }
}
