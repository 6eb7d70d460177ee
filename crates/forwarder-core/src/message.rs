//! Forwarded message model and destination derivation.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Property consulted for the per-message destination suffix unless configured otherwise.
pub const DEFAULT_SUFFIX_PROPERTY: &str = "topicSuffix";

/// Delivery guarantee requested for every publish to the sink.
///
/// Serialized as the MQTT QoS integer (0, 1, 2). `ExactlyOnceHop` only covers
/// the broker hop; end to end the bridge is at-least-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QualityLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnceHop,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("quality level must be 0, 1 or 2, got {0}")]
pub struct InvalidQualityLevel(pub u8);

impl TryFrom<u8> for QualityLevel {
    type Error = InvalidQualityLevel;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnceHop),
            other => Err(InvalidQualityLevel(other)),
        }
    }
}

impl From<QualityLevel> for u8 {
    fn from(level: QualityLevel) -> Self {
        match level {
            QualityLevel::AtMostOnce => 0,
            QualityLevel::AtLeastOnce => 1,
            QualityLevel::ExactlyOnceHop => 2,
        }
    }
}

/// A message received from the source.
///
/// `handle` is whatever the source needs to acknowledge the message. It is
/// moved into [`Source::acknowledge`](crate::Source::acknowledge), so a
/// message can be acknowledged at most once.
#[derive(Debug, Clone)]
pub struct Message<H> {
    pub payload: Bytes,
    pub properties: HashMap<String, String>,
    pub handle: H,
}

impl<H> Message<H> {
    pub fn destination(&self, base_topic: &str, suffix_property: &str) -> String {
        destination(base_topic, &self.properties, suffix_property)
    }
}

/// Publish target: the base topic followed by the suffix property, if present.
pub fn destination(
    base_topic: &str,
    properties: &HashMap<String, String>,
    suffix_property: &str,
) -> String {
    match properties.get(suffix_property) {
        Some(suffix) => format!("{base_topic}{suffix}"),
        None => base_topic.to_string(),
    }
}
