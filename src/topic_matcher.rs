//! MQTT-style wildcard matching and pattern translation.
//!
//! Two different semantics live here on purpose. `matches` and the sliced
//! filters treat `+` as exactly one topic level, as MQTT defines it.
//! `filter_by_loose_pattern` treats `+` as one-or-more of *any* character,
//! crossing level boundaries; it backs free-text topic search and is
//! deliberately more permissive than MQTT subscription matching.

use regex::Regex;
use std::collections::HashSet;

/// Positional comparison of two topic strings, either of which may contain
/// wildcards. A `#` at a differing position matches the whole remainder; a
/// `+` matches exactly one level. Empty segments from consecutive slashes are
/// literal: they match an empty segment on the other side and nothing else.
pub fn matches(left: &str, right: &str) -> bool {
    let left_parts: Vec<&str> = left.split('/').collect();
    let right_parts: Vec<&str> = right.split('/').collect();

    for i in 0..left_parts.len().max(right_parts.len()) {
        match (left_parts.get(i), right_parts.get(i)) {
            (Some(a), Some(b)) => {
                if a == b {
                    continue;
                }
                if *a == "#" || *b == "#" {
                    return true;
                }
                if *a == "+" || *b == "+" {
                    continue;
                }
                return false;
            }
            // Length mismatch without a '#' to absorb it.
            _ => return false,
        }
    }

    true
}

/// Compiles the leading part of a wildcard action pattern, up to and
/// including its single `+`, into an anchored regex where `+` matches one
/// topic level. Returns `None` when the pattern has no `+`.
fn sliced_regex(pattern: &str) -> Option<Regex> {
    let plus = pattern.find('+')?;
    let body = regex::escape(&pattern[..=plus]).replace("\\+", "[^/]+");

    Regex::new(&format!("^{body}")).ok()
}

/// Substitutes the `+` positions of `pattern` with the corresponding literal
/// segments of `topic`, producing a concrete topic string.
fn substitute(pattern: &str, topic: &str) -> String {
    let topic_parts: Vec<&str> = topic.split('/').collect();

    pattern
        .split('/')
        .enumerate()
        .map(|(i, part)| {
            if part == "+" {
                topic_parts.get(i).copied().unwrap_or_default()
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolves a wildcard action pattern against a set of known topics. Each
/// matching topic is turned into the concrete topic the pattern addresses;
/// the result is de-duplicated, preserving first-seen order. A pattern
/// without `+` resolves to nothing.
pub fn filter_by_sliced_pattern(pattern: &str, topics: &[String]) -> Vec<String> {
    let Some(regex) = sliced_regex(pattern) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for topic in topics {
        if !regex.is_match(topic) {
            continue;
        }

        let concrete = substitute(pattern, topic);
        if seen.insert(concrete.clone()) {
            resolved.push(concrete);
        }
    }

    resolved
}

/// The reconciliation direction: one freshly observed topic against all
/// registered wildcard patterns. Returns the concrete topics that should now
/// carry an action marker.
pub fn topic_matches_sliced_patterns(topic: &str, patterns: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for pattern in patterns {
        let Some(regex) = sliced_regex(pattern) else {
            continue;
        };

        if !regex.is_match(topic) {
            continue;
        }

        let concrete = substitute(pattern, topic);
        if seen.insert(concrete.clone()) {
            resolved.push(concrete);
        }
    }

    resolved
}

/// Free-text topic search. The whole pattern becomes a regex where `+`
/// matches one-or-more of any character, so `ho+/temp` finds both
/// `home/temp` and `house/kitchen/temp`. Looser than MQTT semantics by
/// design.
pub fn filter_by_loose_pattern(pattern: &str, topics: &[String]) -> Vec<String> {
    let body = regex::escape(pattern).replace("\\+", ".+");
    let Ok(regex) = Regex::new(&body) else {
        return Vec::new();
    };

    topics
        .iter()
        .filter(|topic| regex.is_match(topic))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(topics: &[&str]) -> Vec<String> {
        topics.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn exact_topics_match() {
        assert!(matches("sensors/room1/temp", "sensors/room1/temp"));
        assert!(!matches("sensors/room1/temp", "sensors/room1/humidity"));
    }

    #[test]
    fn hash_matches_any_remainder() {
        assert!(matches("sensors/#", "sensors/room1/temp"));
        assert!(matches("sensors/room1/temp/raw/extra", "sensors/#"));
        assert!(matches("#", "anything/at/all"));
    }

    #[test]
    fn plus_matches_exactly_one_level() {
        assert!(matches("sensors/+/temp", "sensors/room1/temp"));
        assert!(!matches("sensors/+/temp", "sensors/room1/room2/temp"));
        assert!(!matches("sensors/+", "sensors/room1/temp"));
    }

    #[test]
    fn length_mismatch_without_hash_fails() {
        assert!(!matches("sensors/room1", "sensors/room1/temp"));
        assert!(!matches("sensors/room1/temp", "sensors/room1"));
    }

    #[test]
    fn empty_segments_are_literal() {
        assert!(matches("a//b", "a//b"));
        assert!(!matches("a//b", "a/b"));
        assert!(matches("a/+/b", "a//b"));
    }

    #[test]
    fn sliced_pattern_resolves_and_substitutes() {
        let topics = owned(&[
            "home/livingroom/temp",
            "home/kitchen/temp",
            "garden/soil/moisture",
        ]);

        let resolved = filter_by_sliced_pattern("home/+", &topics);
        assert_eq!(resolved, owned(&["home/livingroom", "home/kitchen"]));
    }

    #[test]
    fn sliced_pattern_deduplicates_collapsing_topics() {
        let topics = owned(&[
            "home/kitchen/temp",
            "home/kitchen/humidity",
            "home/kitchen/co2",
        ]);

        let resolved = filter_by_sliced_pattern("home/+", &topics);
        assert_eq!(resolved, owned(&["home/kitchen"]));
    }

    #[test]
    fn sliced_pattern_without_plus_is_empty() {
        let topics = owned(&["home/kitchen/temp"]);
        assert!(filter_by_sliced_pattern("home/kitchen/temp", &topics).is_empty());
    }

    #[test]
    fn sliced_pattern_ignores_regex_metacharacters() {
        let topics = owned(&["data.(raw)/a/x", "dataXraw)/a/x"]);
        let resolved = filter_by_sliced_pattern("data.(raw)/+", &topics);
        assert_eq!(resolved, owned(&["data.(raw)/a"]));
    }

    #[test]
    fn topic_against_patterns_resolves_each_match() {
        let patterns = owned(&["a/+", "a/b/+", "x/+"]);
        let resolved = topic_matches_sliced_patterns("a/b/c", &patterns);
        assert_eq!(resolved, owned(&["a/b", "a/b/c"]));
    }

    #[test]
    fn loose_pattern_crosses_level_boundaries() {
        let topics = owned(&["home/temp", "house/kitchen/temp", "garden/temp"]);
        let found = filter_by_loose_pattern("ho+/temp", &topics);
        assert_eq!(found, owned(&["home/temp", "house/kitchen/temp"]));
    }

    #[test]
    fn loose_pattern_is_substring_based() {
        let topics = owned(&["deep/home/temp/raw"]);
        assert_eq!(filter_by_loose_pattern("home/+", &topics).len(), 1);
    }
}
