//! Errors raised along the forwarding path.
//!
//! Every variant is fatal to the process; none of them is retried.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to connect to {transport}: {reason}")]
    Connect {
        transport: &'static str,
        reason: String,
    },
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("source stream ended")]
    SourceEnded,
    #[error("publish to {destination} failed: {reason}")]
    Publish { destination: String, reason: String },
    #[error("acknowledge failed: {0}")]
    Acknowledge(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("close failed: {0}")]
    Close(String),
}
