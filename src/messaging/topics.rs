//! MQTT topic matching and queue-group member selection.
//!
//! - `+` matches exactly one level
//! - `#` matches zero or more trailing levels (must be the last level)
//! - topics starting with `$` are not matched by filters starting with a wildcard

use std::collections::HashMap;
use thiserror::Error;

/// Prefix marking an MQTT shared (queue-group) subscription: `$share/<group>/<filter>`.
pub const SHARED_PREFIX: &str = "$share/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic contains a NUL character")]
    NulCharacter,
    #[error("wildcards are not allowed in a publish topic")]
    WildcardInTopic,
    #[error("'#' must occupy a whole level and be the last level")]
    MisplacedMultiLevel,
    #[error("'+' must occupy a whole level")]
    MisplacedSingleLevel,
    #[error("shared subscription is missing its group or filter")]
    MalformedShare,
}

/// Topic matcher consulted by the subscription registry.
pub trait TopicMatcher: Send + Sync {
    /// Check if a filter matches a concrete topic.
    fn matches(&self, filter: &str, topic: &str) -> bool;
}

/// MQTT topic matching with + and # wildcards.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttTopicMatcher;

impl TopicMatcher for MqttTopicMatcher {
    fn matches(&self, filter: &str, topic: &str) -> bool {
        mqtt_topic_matches(filter, topic)
    }
}

/// Check if an MQTT topic filter matches a topic.
pub fn mqtt_topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a concrete topic name used in PUBLISH.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopic);
    }
    Ok(())
}

/// Validate a subscription filter (without any `$share/` prefix).
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || idx != last) {
            return Err(TopicError::MisplacedMultiLevel);
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedSingleLevel);
        }
    }
    Ok(())
}

/// Split `$share/<group>/<filter>` into `(filter, Some(group))`; plain filters pass through.
pub fn parse_shared_filter(raw: &str) -> Result<(String, Option<String>), TopicError> {
    let Some(rest) = raw.strip_prefix(SHARED_PREFIX) else {
        return Ok((raw.to_string(), None));
    };
    match rest.split_once('/') {
        Some((group, filter)) if !group.is_empty() && !filter.is_empty() => {
            if group.contains(['+', '#']) {
                return Err(TopicError::MalformedShare);
            }
            Ok((filter.to_string(), Some(group.to_string())))
        }
        _ => Err(TopicError::MalformedShare),
    }
}

/// Round-robin selection among the members of a queue group.
///
/// Candidates must be passed in a stable order (the registry uses insertion order) so the
/// cursor walks members fairly.
#[derive(Debug, Default, Clone)]
pub struct QueueSelector {
    next: HashMap<String, usize>,
}

impl QueueSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the index of the member that receives the next message for `group_key`.
    pub fn select(&mut self, group_key: &str, candidates: usize) -> Option<usize> {
        if candidates == 0 {
            return None;
        }
        let cursor = self.next.entry(group_key.to_string()).or_insert(0);
        let idx = *cursor % candidates;
        *cursor = (idx + 1) % candidates;
        Some(idx)
    }

    /// Drop the cursor of a group that no longer has members.
    pub fn forget(&mut self, group_key: &str) {
        self.next.remove(group_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_level_wildcard_matches_one_level() {
        assert!(mqtt_topic_matches("sensors/+/temp", "sensors/a/temp"));
        assert!(!mqtt_topic_matches("sensors/+/temp", "sensors/a/b/temp"));
        assert!(!mqtt_topic_matches("sensors/+/temp", "sensors/temp"));
        assert!(mqtt_topic_matches("+", "a"));
        assert!(!mqtt_topic_matches("+", "a/b"));
    }

    #[test]
    fn multi_level_wildcard_matches_parent_and_descendants() {
        assert!(mqtt_topic_matches("sensors/#", "sensors"));
        assert!(mqtt_topic_matches("sensors/#", "sensors/a/b"));
        assert!(mqtt_topic_matches("#", "anything/at/all"));
        assert!(!mqtt_topic_matches("sensors/#", "other/a"));
    }

    #[test]
    fn system_topics_hidden_from_leading_wildcards() {
        assert!(!mqtt_topic_matches("#", "$SYS/broker/info"));
        assert!(!mqtt_topic_matches("+/broker/info", "$SYS/broker/info"));
        assert!(mqtt_topic_matches("$SYS/#", "$SYS/broker/info"));
    }

    #[test]
    fn filter_validation_rejects_misplaced_wildcards() {
        assert!(validate_filter("a/#").is_ok());
        assert!(validate_filter("a/+/c").is_ok());
        assert_eq!(validate_filter("a/#/c"), Err(TopicError::MisplacedMultiLevel));
        assert_eq!(validate_filter("a/b#"), Err(TopicError::MisplacedMultiLevel));
        assert_eq!(validate_filter("a/b+"), Err(TopicError::MisplacedSingleLevel));
        assert_eq!(validate_filter(""), Err(TopicError::Empty));
    }

    #[test]
    fn publish_topics_cannot_carry_wildcards() {
        assert!(validate_topic("a/b").is_ok());
        assert_eq!(validate_topic("a/+"), Err(TopicError::WildcardInTopic));
    }

    #[test]
    fn shared_filters_split_group_and_filter() {
        assert_eq!(
            parse_shared_filter("$share/g1/sensors/+/temp").unwrap(),
            ("sensors/+/temp".to_string(), Some("g1".to_string()))
        );
        assert_eq!(parse_shared_filter("a/b").unwrap(), ("a/b".to_string(), None));
        assert_eq!(
            parse_shared_filter("$share/g1"),
            Err(TopicError::MalformedShare)
        );
    }

    #[test]
    fn queue_selector_round_robins() {
        let mut selector = QueueSelector::new();
        let picks: Vec<_> = (0..4).filter_map(|_| selector.select("g", 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
        assert_eq!(selector.select("empty", 0), None);
    }
}
