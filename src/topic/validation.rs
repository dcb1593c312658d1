//! Topic name and filter validation
//!
//! Key rules from MQTT 3.1.1 section 4.7:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Multi-level wildcard (#) must occupy an entire level and be last
//! - Single-level wildcard (+) must occupy an entire level

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let levels: Vec<&str> = filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            // # must be the entire level and the last level
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// - `/` separates levels
/// - `+` matches exactly one level
/// - `#` matches zero or more remaining levels (must be last)
/// - `$`-topics don't match filters starting with `+` or `#`
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    let mut ti = 0;
    let mut fi = 0;

    while fi < filter_levels.len() {
        let filter_level = filter_levels[fi];

        if filter_level == "#" {
            return true;
        }

        if ti >= topic_levels.len() {
            return false;
        }

        if filter_level == "+" || filter_level == topic_levels[ti] {
            ti += 1;
            fi += 1;
        } else {
            return false;
        }
    }

    ti == topic_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test#topic").is_err());
        assert!(validate_topic_name("test/+/topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("test").is_ok());
        assert!(validate_topic_filter("test/topic").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("test/+").is_ok());
        assert!(validate_topic_filter("test/#").is_ok());
        assert!(validate_topic_filter("+/test").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("test/+/topic").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("test+").is_err());
        assert!(validate_topic_filter("test#").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("+test").is_err());
    }

    #[test]
    fn test_topic_matches() {
        // Exact matches
        assert!(topic_matches_filter("test", "test"));
        assert!(topic_matches_filter("test/topic", "test/topic"));
        assert!(!topic_matches_filter("test", "test/topic"));
        assert!(!topic_matches_filter("test/topic", "test"));

        // Single-level wildcard
        assert!(topic_matches_filter("test/topic", "test/+"));
        assert!(topic_matches_filter("test/topic", "+/topic"));
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(!topic_matches_filter("a/b/d/c", "a/+/c"));
        assert!(!topic_matches_filter("test", "+/+"));
        assert!(!topic_matches_filter("test/topic/extra", "test/+"));

        // Multi-level wildcard
        assert!(topic_matches_filter("test", "#"));
        assert!(topic_matches_filter("test/topic", "#"));
        assert!(topic_matches_filter("test/topic/more", "#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b", "a/#"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(!topic_matches_filter("other/topic", "test/#"));

        // $-topics
        assert!(!topic_matches_filter("$SYS/test", "+/test"));
        assert!(!topic_matches_filter("$SYS/test", "#"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/+"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/#"));
    }
}
