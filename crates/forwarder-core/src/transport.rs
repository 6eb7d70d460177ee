//! Transport contracts between the forwarding core and the outside world.
//!
//! The pipeline only ever talks to a [`Source`] and a [`Sink`]; the shutdown
//! orchestrator additionally closes a [`HealthEndpoint`]. Concrete adapters
//! live in `forwarder-transport` and `forwarder-api`.

use std::future::Future;

use bytes::Bytes;

use crate::error::ForwardError;
use crate::message::{Message, QualityLevel};

/// Upstream subscription the bridge consumes from.
pub trait Source: Send {
    /// Whatever the source needs to acknowledge a message.
    type Handle: Send + 'static;

    /// Resolves once the source has handled an acknowledgment.
    type Acknowledgment: Future<Output = Result<(), ForwardError>> + Send + 'static;

    /// Suspend until the next message is available.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a message.
    fn receive(
        &mut self,
    ) -> impl Future<Output = Result<Message<Self::Handle>, ForwardError>> + Send;

    /// Confirm the message has been handled and may be discarded upstream.
    ///
    /// Issues the acknowledgment without waiting for it. Acknowledgments are
    /// handled in call order.
    fn acknowledge(&mut self, handle: Self::Handle) -> Self::Acknowledgment;

    /// Close the subscription. No further messages are delivered.
    fn close_subscription(&mut self) -> impl Future<Output = Result<(), ForwardError>> + Send;

    /// Close the connection the subscription was running on.
    fn close_connection(&mut self) -> impl Future<Output = Result<(), ForwardError>> + Send;
}

/// Downstream broker connection the bridge publishes to.
pub trait Sink: Send + Sync {
    /// Resolves once the broker has confirmed the publish at the requested
    /// quality level.
    type Confirmation: Future<Output = Result<(), ForwardError>> + Send + 'static;

    /// Hand a payload to the transport.
    ///
    /// Returns once the publish is queued on the connection, not once it is
    /// confirmed. Publishes are written to the wire in call order.
    fn publish(
        &self,
        destination: &str,
        payload: Bytes,
        quality: QualityLevel,
    ) -> impl Future<Output = Result<Self::Confirmation, ForwardError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), ForwardError>> + Send;
}

/// Externally polled readiness listener.
pub trait HealthEndpoint: Send {
    fn close(&mut self) -> impl Future<Output = Result<(), ForwardError>> + Send;
}
