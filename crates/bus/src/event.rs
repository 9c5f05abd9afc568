//! Event identity and the names derived from it.
//!
//! An event is addressed by a `{topic, category, action}` triple. The same
//! triple yields a routing key shared by every consumer of that event and a
//! queue name that is unique per consuming service, which gives fan-out
//! across services and competing consumers within one service.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix appended to the topic for request/reply traffic.
const RPC_SUFFIX: &str = "rpc";

/// Routing placeholder for a missing part.
const ROUTING_WILDCARD: &str = "*";

/// Queue-name placeholder for a missing part.
const QUEUE_WILDCARD: &str = "ALL";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EventKey {
    pub topic: Option<String>,
    pub category: Option<String>,
    pub action: Option<String>,
}

impl EventKey {
    pub fn new(topic: impl Into<String>, category: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            category: Some(category.into()),
            action: Some(action.into()),
        }
    }

    /// Every event of a topic, regardless of category and action.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            category: None,
            action: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// `topic.category.action`, lower-cased, `*` for missing parts.
    pub fn routing_key(&self) -> String {
        self.routing_key_with(None)
    }

    /// Routing key for request/reply traffic: `topicrpc.category.action`.
    pub fn rpc_routing_key(&self) -> String {
        self.routing_key_with(Some(RPC_SUFFIX))
    }

    /// Durable queue owned by `service` for this event.
    pub fn queue_name(&self, service: &str) -> String {
        self.queue_name_with(None, service)
    }

    /// Durable queue owned by `service` for requests of this event.
    pub fn rpc_queue_name(&self, service: &str) -> String {
        self.queue_name_with(Some(RPC_SUFFIX), service)
    }

    fn routing_key_with(&self, suffix: Option<&str>) -> String {
        let topic = match (&self.topic, suffix) {
            (Some(t), Some(s)) => format!("{}{}", t.to_lowercase(), s),
            (Some(t), None) => t.to_lowercase(),
            (None, _) => ROUTING_WILDCARD.to_string(),
        };
        let part = |p: &Option<String>| {
            p.as_deref()
                .map(str::to_lowercase)
                .unwrap_or_else(|| ROUTING_WILDCARD.to_string())
        };
        format!("{}.{}.{}", topic, part(&self.category), part(&self.action))
    }

    fn queue_name_with(&self, suffix: Option<&str>, service: &str) -> String {
        let topic = match (&self.topic, suffix) {
            (Some(t), Some(s)) => pascal(&format!("{t}{s}")),
            (Some(t), None) => pascal(t),
            (None, _) => QUEUE_WILDCARD.to_string(),
        };
        let part = |p: &Option<String>| {
            p.as_deref()
                .map(pascal)
                .unwrap_or_else(|| QUEUE_WILDCARD.to_string())
        };
        format!("{}{}{}{}", topic, part(&self.category), part(&self.action), service)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.routing_key())
    }
}

/// Upper-case the first letter, lower-case the rest.
fn pascal(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Topic-exchange matching: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key
            .split_first()
            .is_some_and(|(k, key_rest)| k == word && match_words(rest, key_rest)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_is_lower_case() {
        let e = EventKey::new("Renderjob", "Status", "Update");
        assert_eq!(e.routing_key(), "renderjob.status.update");
    }

    #[test]
    fn rpc_routing_key_suffixes_topic() {
        let e = EventKey::new("Renderjob", "upload", "requested");
        assert_eq!(e.rpc_routing_key(), "renderjobrpc.upload.requested");
    }

    #[test]
    fn missing_parts_are_wildcards() {
        let e = EventKey::topic("Renderjob");
        assert_eq!(e.routing_key(), "renderjob.*.*");
        assert_eq!(e.queue_name("Files"), "RenderjobALLALLFiles");

        let e = EventKey::topic("Renderjob").with_action("update");
        assert_eq!(e.routing_key(), "renderjob.*.update");
        assert_eq!(e.queue_name("Jobs"), "RenderjobALLUpdateJobs");
    }

    #[test]
    fn queue_name_is_pascal_case_plus_service() {
        let e = EventKey::new("Renderjob", "upload", "requested");
        assert_eq!(e.queue_name("Files"), "RenderjobUploadRequestedFiles");
        assert_eq!(e.rpc_queue_name("Files"), "RenderjobrpcUploadRequestedFiles");
    }

    #[test]
    fn fan_out_keys_differ_only_in_queue() {
        let e = EventKey::new("Renderjob", "status", "update");
        assert_ne!(e.queue_name("Files"), e.queue_name("Jobs"));
        assert_eq!(e.routing_key(), EventKey::new("renderjob", "STATUS", "update").routing_key());
    }

    #[test]
    fn star_matches_one_word() {
        assert!(topic_matches("renderjob.*.update", "renderjob.status.update"));
        assert!(!topic_matches("renderjob.*", "renderjob.status.update"));
        assert!(!topic_matches("renderjob.*.*", "renderjob.status"));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(topic_matches("renderjob.#", "renderjob.status.update"));
        assert!(topic_matches("renderjob.#", "renderjob"));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("#.update", "renderjob.status.update"));
        assert!(!topic_matches("files.#", "renderjob.status.update"));
    }

    #[test]
    fn exact_patterns() {
        assert!(topic_matches("renderjob.status.update", "renderjob.status.update"));
        assert!(!topic_matches("renderjob.status.update", "renderjobrpc.status.update"));
    }
}
