use core_types::GatewayAddress;
use core_types::config::GATEWAY_PLACEHOLDER;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicPatternError {
    #[error("topic pattern '{0}' must contain exactly one {{gateway}} placeholder")]
    Placeholder(String),
}

/// Topic template such as `gw/{gateway}/status`, split around the gateway segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    prefix: String,
    suffix: String,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, TopicPatternError> {
        let mut parts = pattern.split(GATEWAY_PLACEHOLDER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(prefix), Some(suffix), None) => Ok(Self {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            }),
            _ => Err(TopicPatternError::Placeholder(pattern.to_string())),
        }
    }

    /// Filter covering every gateway, with the placeholder replaced by a `+` wildcard.
    pub fn subscription_filter(&self) -> String {
        format!("{}+{}", self.prefix, self.suffix)
    }

    pub fn topic_for(&self, gateway: &str) -> String {
        format!("{}{}{}", self.prefix, gateway, self.suffix)
    }

    /// Gateway address carried by a concrete topic, if the topic matches the pattern.
    pub fn gateway_from(&self, topic: &str) -> Option<GatewayAddress> {
        let segment = topic
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        if segment.is_empty() || segment.contains('/') {
            return None;
        }
        let address = GatewayAddress::new(segment);
        (!address.is_empty()).then_some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_gateway_and_builds_filter() {
        let pattern = TopicPattern::parse("gw/{gateway}/status").unwrap();
        assert_eq!(pattern.subscription_filter(), "gw/+/status");
        assert_eq!(
            pattern.gateway_from("gw/ac:23:3f:a2:4d:3b/status"),
            Some(GatewayAddress::new("AC233FA24D3B"))
        );
        assert_eq!(pattern.topic_for("GW1"), "gw/GW1/status");
    }

    #[test]
    fn rejects_foreign_topics() {
        let pattern = TopicPattern::parse("gw/{gateway}/status").unwrap();
        assert_eq!(pattern.gateway_from("gw//status"), None);
        assert_eq!(pattern.gateway_from("gw/a/b/status"), None);
        assert_eq!(pattern.gateway_from("other/a/status"), None);
        assert_eq!(pattern.gateway_from("gw/a/config"), None);
    }

    #[test]
    fn trailing_placeholder() {
        let pattern = TopicPattern::parse("{gateway}").unwrap();
        assert_eq!(pattern.subscription_filter(), "+");
        assert_eq!(pattern.gateway_from("GW9"), Some(GatewayAddress::new("GW9")));
    }

    #[test]
    fn placeholder_count_must_be_one() {
        assert!(TopicPattern::parse("gw/status").is_err());
        assert!(TopicPattern::parse("{gateway}/{gateway}").is_err());
    }
}
