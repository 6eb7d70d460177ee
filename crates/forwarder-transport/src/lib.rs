//! The concrete source and sink the daemon runs with:
//! a Pulsar subscription on one side, an MQTT connection on the other.

pub mod sink;
pub mod source;

pub use sink::MqttSink;
pub use source::PulsarSource;
