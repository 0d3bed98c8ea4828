//! Per-connection store of observed topics: bounded message history, a
//! hierarchical topic tree for the tree view, and subtree counters for the
//! badges next to each branch.
//!
//! All reads of absent connections or topics yield empty results; writes
//! create entries on demand. Nothing on the ingestion path returns an error.

use serde::Serialize;
use std::collections::HashMap;

use crate::models::Message;

/// One node of the topic hierarchy. Forms a forest with one root per
/// connection; every segment of every observed topic path maps to exactly one
/// node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopicNode {
    children: HashMap<String, TopicNode>,
}

impl TopicNode {
    /// Get-or-insert the child for one path segment. The only mutation
    /// primitive of the tree.
    fn child_mut(&mut self, segment: &str) -> &mut TopicNode {
        self.children.entry(segment.to_string()).or_default()
    }

    pub fn child(&self, segment: &str) -> Option<&TopicNode> {
        self.children.get(segment)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &TopicNode)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn insert_path<'a>(&mut self, segments: impl IntoIterator<Item = &'a str>) {
        let mut node = self;
        for segment in segments {
            node = node.child_mut(segment);
        }
    }

    /// Excises the leaf at `segments`, preserving sibling branches.
    fn remove_path(&mut self, segments: &[&str]) {
        match segments {
            [] => {}
            [leaf] => {
                self.children.remove(*leaf);
            }
            [head, rest @ ..] => {
                if let Some(child) = self.children.get_mut(*head) {
                    child.remove_path(rest);
                }
            }
        }
    }

    fn filtered(&self, terms: &[String]) -> TopicNode {
        let mut filtered = TopicNode::default();

        for (segment, child) in &self.children {
            if segment_matches(segment, terms) {
                filtered.children.insert(segment.clone(), child.clone());
                continue;
            }

            let pruned = child.filtered(terms);
            if !pruned.is_empty() {
                filtered.children.insert(segment.clone(), pruned);
            }
        }

        filtered
    }
}

fn segment_matches(segment: &str, terms: &[String]) -> bool {
    let lowered = segment.to_lowercase();
    terms.iter().any(|term| lowered.contains(term))
}

/// Yields every prefix path of a topic, shortest first: `a`, `a/b`, `a/b/c`.
fn prefixes(topic: &str) -> impl Iterator<Item = &str> {
    topic
        .char_indices()
        .filter_map(|(i, c)| (c == '/').then(|| &topic[..i]))
        .chain(std::iter::once(topic))
}

#[derive(Debug, Default)]
struct ConnectionTopics {
    messages: HashMap<String, Vec<Message>>,
    last_message: HashMap<String, Message>,
    /// Distinct-topic count per path prefix; bumped only the first time a
    /// full topic path is observed.
    topic_counts: HashMap<String, u64>,
    /// Message count per path prefix; bumped on every message.
    message_counts: HashMap<String, u64>,
    root: TopicNode,
}

/// Hierarchical store of everything observed on every connection.
#[derive(Debug)]
pub struct TopicIndex {
    connections: HashMap<String, ConnectionTopics>,
    max_messages: usize,
}

impl TopicIndex {
    pub fn new(max_messages: usize) -> Self {
        TopicIndex {
            connections: HashMap::new(),
            max_messages,
        }
    }

    /// Ingests one message. Returns `true` when this is the first message
    /// ever seen on `topic`, which is the trigger for wildcard-action
    /// reconciliation.
    pub fn add_message(&mut self, client_key: &str, topic: &str, mut message: Message) -> bool {
        let conn = self.connections.entry(client_key.to_string()).or_default();
        let first_seen = !conn.messages.contains_key(topic);

        if let Some(last) = conn.last_message.get(topic) {
            message.created_diff_ms =
                Some((message.created_at - last.created_at).num_milliseconds());
        }
        conn.last_message.insert(topic.to_string(), message.clone());

        let bucket = conn.messages.entry(topic.to_string()).or_default();
        bucket.push(message);

        if bucket.len() > self.max_messages {
            bucket.sort_by_key(|m| m.created_at);
            let excess = bucket.len() - self.max_messages;
            bucket.drain(..excess);
        }

        for prefix in prefixes(topic) {
            *conn.message_counts.entry(prefix.to_string()).or_insert(0) += 1;
            if first_seen {
                *conn.topic_counts.entry(prefix.to_string()).or_insert(0) += 1;
            }
        }

        if first_seen {
            conn.root.insert_path(topic.split('/'));
        }

        first_seen
    }

    /// Creates the tree path for a topic without any traffic, so that an
    /// attached action is visible before the first message arrives. Counters
    /// and history stay untouched.
    pub fn materialize_topic(&mut self, client_key: &str, topic: &str) {
        self.connections
            .entry(client_key.to_string())
            .or_default()
            .root
            .insert_path(topic.split('/'));
    }

    /// Deletes messages, last-message cache and counters for `prefix` and
    /// everything below it, and excises the corresponding branch from the
    /// tree while preserving siblings.
    pub fn remove_subtree(&mut self, client_key: &str, prefix: &str) {
        let Some(conn) = self.connections.get_mut(client_key) else {
            return;
        };

        let subtree = format!("{prefix}/");
        let doomed: Vec<String> = conn
            .topic_counts
            .keys()
            .filter(|topic| *topic == prefix || topic.starts_with(&subtree))
            .cloned()
            .collect();

        for topic in doomed {
            conn.messages.remove(&topic);
            conn.last_message.remove(&topic);
            conn.topic_counts.remove(&topic);
            conn.message_counts.remove(&topic);
        }

        let segments: Vec<&str> = prefix.split('/').collect();
        conn.root.remove_path(&segments);
    }

    pub fn clear_connection(&mut self, client_key: &str) {
        self.connections.remove(client_key);
    }

    pub fn last_message(&self, client_key: &str, topic: &str) -> Option<&Message> {
        self.connections.get(client_key)?.last_message.get(topic)
    }

    pub fn messages(&self, client_key: &str, topic: &str) -> &[Message] {
        self.connections
            .get(client_key)
            .and_then(|conn| conn.messages.get(topic))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Topics that have carried at least one message.
    pub fn topics_with_messages(&self, client_key: &str) -> Vec<String> {
        let Some(conn) = self.connections.get(client_key) else {
            return Vec::new();
        };

        let mut topics: Vec<String> = conn.messages.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// All topic paths including implicit parents: observing `a/b/c` makes
    /// `a` and `a/b` part of the list as well.
    pub fn all_topics(&self, client_key: &str) -> Vec<String> {
        let Some(conn) = self.connections.get(client_key) else {
            return Vec::new();
        };

        let mut topics: Vec<String> = conn
            .messages
            .keys()
            .flat_map(|topic| prefixes(topic).map(str::to_string))
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub fn has_descendants(&self, client_key: &str, topic: &str) -> bool {
        let Some(conn) = self.connections.get(client_key) else {
            return false;
        };

        let subtree = format!("{topic}/");
        conn.messages.keys().any(|t| t.starts_with(&subtree))
    }

    pub fn subtree_topic_count(&self, client_key: &str, prefix: &str) -> u64 {
        self.connections
            .get(client_key)
            .and_then(|conn| conn.topic_counts.get(prefix))
            .copied()
            .unwrap_or(0)
    }

    pub fn subtree_message_count(&self, client_key: &str, prefix: &str) -> u64 {
        self.connections
            .get(client_key)
            .and_then(|conn| conn.message_counts.get(prefix))
            .copied()
            .unwrap_or(0)
    }

    pub fn tree(&self, client_key: &str) -> Option<&TopicNode> {
        self.connections.get(client_key).map(|conn| &conn.root)
    }

    /// Recursive prune of the topic tree: a branch survives when any segment
    /// in it matches any whitespace-separated search term, case-insensitive.
    /// An empty search returns the whole tree.
    pub fn filtered_tree(&self, client_key: &str, search: &str) -> TopicNode {
        let Some(conn) = self.connections.get(client_key) else {
            return TopicNode::default();
        };

        let terms: Vec<String> = search
            .trim()
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        if terms.is_empty() {
            return conn.root.clone();
        }

        conn.root.filtered(&terms)
    }
}
