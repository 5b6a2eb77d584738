//! Topic matching
//!
//! Hierarchical topics are `/`-separated levels. Subscription patterns may
//! use `+` (exactly one level) and `#` (the rest of the topic, final level
//! only). Matching is pure and total: a malformed pattern simply fails to
//! match.

pub mod validation;

pub use validation::{validate_device_id, validate_topic_filter, validate_topic_name};

/// Check whether `topic` matches the subscription `pattern`.
///
/// Matching rules:
/// - `+` consumes exactly one topic level of any content
/// - `#` consumes the current level and everything after it; it is only
///   meaningful as the final pattern level
/// - any other level must equal the topic level exactly
/// - without a trailing `#`, both sides must run out together
pub fn matches(pattern: &str, topic: &str) -> bool {
    let pattern_levels: Vec<&str> = pattern.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    let mut ti = 0;
    let mut pi = 0;

    while pi < pattern_levels.len() {
        let level = pattern_levels[pi];

        if level == "#" {
            // Only valid as the last level
            return pi == pattern_levels.len() - 1;
        }

        if ti >= topic_levels.len() {
            return false;
        }

        if level == "+" || level == topic_levels[ti] {
            ti += 1;
            pi += 1;
        } else {
            return false;
        }
    }

    ti == topic_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_matches() {
        assert!(matches("devices/d1/status", "devices/d1/status"));
        assert!(!matches("devices/d1/status", "devices/d2/status"));
        assert!(!matches("devices/d1", "devices/d1/status"));
        assert!(!matches("devices/d1/status", "devices/d1"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("devices/+/telemetry", "devices/d1/telemetry"));
        assert!(!matches("devices/+/telemetry", "devices/d1/x/telemetry"));
        assert!(!matches("devices/+/telemetry", "devices/telemetry"));
        assert!(matches("+/+/+", "a/b/c"));
        assert!(matches("devices/+", "devices/"));
        assert!(!matches("+/+", "a"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("devices/#", "devices/d1/status"));
        assert!(matches("devices/#", "devices/d1"));
        assert!(matches("devices/#", "devices"));
        assert!(matches("#", "anything/at/all"));
        assert!(matches("devices/+/#", "devices/d1/telemetry/soil"));
        assert!(!matches("devices/#", "gateway/ping"));
    }

    #[test]
    fn test_malformed_patterns_never_match() {
        assert!(!matches("devices/#/status", "devices/d1/status"));
        assert!(!matches("#/status", "devices/status"));
        assert!(!matches("a/b/c", "a"));
        assert!(!matches("", "devices"));
    }

    proptest! {
        #[test]
        fn prop_topic_matches_itself(levels in proptest::collection::vec("[a-z0-9_-]{0,8}", 1..6)) {
            let topic = levels.join("/");
            prop_assert!(matches(&topic, &topic));
        }

        #[test]
        fn prop_hash_matches_everything(levels in proptest::collection::vec("[a-z0-9_-]{0,8}", 1..6)) {
            let topic = levels.join("/");
            prop_assert!(matches("#", &topic));
        }

        #[test]
        fn prop_plus_replaces_any_level(
            levels in proptest::collection::vec("[a-z0-9_-]{0,8}", 1..6),
            idx in 0usize..6,
        ) {
            let topic = levels.join("/");
            let mut pattern_levels = levels.clone();
            let idx = idx % pattern_levels.len();
            pattern_levels[idx] = "+".to_string();
            prop_assert!(matches(&pattern_levels.join("/"), &topic));
        }

        #[test]
        fn prop_level_count_mismatch_never_matches(
            levels in proptest::collection::vec("[a-z0-9_-]{1,8}", 1..6),
        ) {
            let topic = levels.join("/");
            let pattern = vec!["+"; levels.len() + 1].join("/");
            prop_assert!(!matches(&pattern, &topic));
        }
    }
}
