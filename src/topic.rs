//! Topic scheme derivation and validation: a small struct so the three
//! derived topics are computed once per client and re-used across
//! subscribe/publish calls.

use crate::error::{Error, Result};

const MAX_TOPIC_BYTES: usize = 512;

/// Derives and validates the three topics a node needs: its own commands
/// and responses topics, and the shared replication events topic.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    prefix: String,
    client_id: String,
}

impl TopicScheme {
    pub fn new<P: Into<String>, C: Into<String>>(prefix: P, client_id: C) -> Result<Self> {
        let prefix = prefix.into();
        let client_id = client_id.into();
        validate_segment(&prefix, "prefix")?;
        validate_segment(&client_id, "client_id")?;
        Ok(Self { prefix, client_id })
    }

    pub fn commands(&self) -> String {
        format!("{}/commands/{}", self.prefix, self.client_id)
    }

    pub fn responses(&self) -> String {
        format!("{}/responses/{}", self.prefix, self.client_id)
    }

    pub fn replication_events(&self) -> String {
        format!("{}/replication/events", self.prefix)
    }

    /// Validates a topic string arriving from the broker before it is
    /// trusted as a routing key: rejects wildcards, non-UTF-8 (impossible
    /// once it is a `&str`, but kept explicit for clarity),
    /// leading/trailing slashes, and overlength topics.
    pub fn validate_inbound(topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::validation("topic must not be empty"));
        }
        if topic.len() > MAX_TOPIC_BYTES {
            return Err(Error::validation(format!(
                "topic exceeds {} bytes",
                MAX_TOPIC_BYTES
            )));
        }
        if topic.starts_with('/') || topic.ends_with('/') {
            return Err(Error::validation("topic must not have leading/trailing slash"));
        }
        if topic.contains('+') || topic.contains('#') {
            return Err(Error::validation("topic must not contain MQTT wildcards"));
        }
        Ok(())
    }
}

fn validate_segment(s: &str, field: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::validation(format!("{} must not be empty", field)));
    }
    if s.len() > MAX_TOPIC_BYTES {
        return Err(Error::validation(format!("{} exceeds {} bytes", field, MAX_TOPIC_BYTES)));
    }
    if s.starts_with('/') || s.ends_with('/') {
        return Err(Error::validation(format!("{} must not have leading/trailing slash", field)));
    }
    if s.contains('+') || s.contains('#') {
        return Err(Error::validation(format!("{} must not contain MQTT wildcards", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_expected_topics() {
        let t = TopicScheme::new("fleet1", "node-a").unwrap();
        assert_eq!(t.commands(), "fleet1/commands/node-a");
        assert_eq!(t.responses(), "fleet1/responses/node-a");
        assert_eq!(t.replication_events(), "fleet1/replication/events");
    }

    #[test]
    fn rejects_wildcard_prefix() {
        assert!(TopicScheme::new("fleet/+", "node-a").is_err());
        assert!(TopicScheme::new("fleet/#", "node-a").is_err());
    }

    #[test]
    fn rejects_leading_trailing_slash() {
        assert!(TopicScheme::new("/fleet1", "node-a").is_err());
        assert!(TopicScheme::new("fleet1/", "node-a").is_err());
    }

    #[test]
    fn validate_inbound_rejects_wildcards_and_overlength() {
        assert!(TopicScheme::validate_inbound("fleet1/commands/+").is_err());
        assert!(TopicScheme::validate_inbound("fleet1/commands/#").is_err());
        assert!(TopicScheme::validate_inbound("").is_err());
        let long = "a".repeat(600);
        assert!(TopicScheme::validate_inbound(&long).is_err());
    }

    #[test]
    fn validate_inbound_accepts_well_formed_topic() {
        assert!(TopicScheme::validate_inbound("fleet1/commands/node-a").is_ok());
    }
}
