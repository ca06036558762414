//! Well-known topics and topic/identity validation
//!
//! Data topics are flat names (`bridge`, `logger`, ...). Event frames travel
//! on [`METADATA_TOPIC`], remote commands on [`CONTROL_TOPIC`], and the
//! settings sub-protocol uses a request topic plus one reply topic per client.

use thiserror::Error;

/// Topic carrying event frames
pub const METADATA_TOPIC: &str = "metadata";

/// Topic carrying remote control commands
pub const CONTROL_TOPIC: &str = "control";

/// Topic on which settings requests are published
pub const SETTINGS_REQUEST_TOPIC: &str = "mads/settings/request";

const SETTINGS_REPLY_PREFIX: &str = "mads/settings/reply";

/// Reply topic on which a client receives its settings document
pub fn settings_reply_topic(client_id: &str) -> String {
    format!("{SETTINGS_REPLY_PREFIX}/{client_id}")
}

/// Check that a topic can be published to
pub fn validate_publish_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    for ch in topic.chars() {
        if ch == '+' || ch == '#' || ch == '\0' {
            return Err(ValidationError::InvalidTopicChar(ch));
        }
    }

    Ok(())
}

/// Check that a subscription filter is well formed
///
/// `+` must fill a whole level and `#` may only appear as the last level.
pub fn validate_subscribe_topic(filter: &str) -> Result<(), ValidationError> {
    if filter.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if filter.contains('\0') {
        return Err(ValidationError::InvalidTopicChar('\0'));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(ValidationError::InvalidWildcard(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(ValidationError::InvalidWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Agent names and ids share the `[A-Za-z0-9._-]+` character set
pub fn validate_identity(identity: &str) -> Result<(), ValidationError> {
    if identity.is_empty() {
        return Err(ValidationError::EmptyIdentity);
    }

    for ch in identity.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidIdentityChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for topics and identities
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic contains invalid character: '{0}'")]
    InvalidTopicChar(char),
    #[error("Invalid wildcard in topic filter: {0}")]
    InvalidWildcard(String),
    #[error("Identity cannot be empty")]
    EmptyIdentity,
    #[error("Identity contains invalid character: '{0}'")]
    InvalidIdentityChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn valid_identities_pass(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_identity(&id).is_ok(), "Valid identity should pass: {}", id);
        }

        #[test]
        fn invalid_identity_chars_fail(id in "[^a-zA-Z0-9._-]{1}[a-zA-Z0-9._-]*") {
            prop_assert!(validate_identity(&id).is_err(), "Invalid identity should fail: {}", id);
        }

        #[test]
        fn plain_topics_are_publishable(topic in "[a-zA-Z0-9_/-]{1,32}") {
            prop_assert!(validate_publish_topic(&topic).is_ok());
            prop_assert!(validate_subscribe_topic(&topic).is_ok());
        }
    }

    #[test]
    fn test_publish_topic_rules() {
        assert!(validate_publish_topic("bridge").is_ok());
        assert!(validate_publish_topic("sensors/temperature").is_ok());
        assert_eq!(validate_publish_topic(""), Err(ValidationError::EmptyTopic));
        assert_eq!(
            validate_publish_topic("sensors/+"),
            Err(ValidationError::InvalidTopicChar('+'))
        );
        assert_eq!(
            validate_publish_topic("sensors/#"),
            Err(ValidationError::InvalidTopicChar('#'))
        );
    }

    #[test]
    fn test_subscribe_filter_rules() {
        assert!(validate_subscribe_topic("sensors/+/temperature").is_ok());
        assert!(validate_subscribe_topic("sensors/#").is_ok());
        assert!(validate_subscribe_topic("#").is_ok());
        assert!(validate_subscribe_topic("sensors/#/x").is_err());
        assert!(validate_subscribe_topic("sensors/temp+").is_err());
        assert!(validate_subscribe_topic("").is_err());
    }

    #[test]
    fn test_identity_examples() {
        assert!(validate_identity("feedback").is_ok());
        assert!(validate_identity("feedback-1a2b3c4d").is_ok());
        assert!(validate_identity("agent.test_01").is_ok());
        assert_eq!(validate_identity(""), Err(ValidationError::EmptyIdentity));
        assert_eq!(
            validate_identity("agent@host"),
            Err(ValidationError::InvalidIdentityChar('@'))
        );
        assert!(validate_identity("agent/path").is_err());
        assert!(validate_identity("agent host").is_err());
    }

    #[test]
    fn test_settings_reply_topic() {
        assert_eq!(
            settings_reply_topic("feedback-1234abcd"),
            "mads/settings/reply/feedback-1234abcd"
        );
        assert!(validate_publish_topic(&settings_reply_topic("x")).is_ok());
    }
}
