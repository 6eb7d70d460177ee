//! In-memory transports.
//!
//! Stand-ins for the Pulsar source, the MQTT sink and the health listener,
//! used by tests and for local dry runs. All three report into one shared
//! [`Recorder`] so the global order of publishes, acknowledgments and teardown
//! steps can be asserted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::ForwardError;
use crate::message::{Message, QualityLevel};
use crate::transport::{HealthEndpoint, Sink, Source};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Published {
        destination: String,
        payload: Bytes,
        quality: QualityLevel,
    },
    Acknowledged(u64),
    ClosedSubscription,
    ClosedConnection,
    Disconnected,
    ClosedEndpoint,
}

impl Event {
    fn is_teardown(&self) -> bool {
        matches!(
            self,
            Event::ClosedSubscription
                | Event::ClosedConnection
                | Event::Disconnected
                | Event::ClosedEndpoint
        )
    }
}

/// Ordered log of everything the in-memory transports did.
#[derive(Clone)]
pub struct Recorder {
    events: Arc<watch::Sender<Vec<Event>>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        let (events, _) = watch::channel(Vec::new());
        Self {
            events: Arc::new(events),
        }
    }

    fn push(&self, event: Event) {
        self.events.send_modify(|events| events.push(event));
    }

    /// `(destination, payload)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Published {
                    destination,
                    payload,
                    ..
                } => Some((destination.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// Message ids in acknowledgment order.
    pub fn acknowledged(&self) -> Vec<u64> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Acknowledged(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn teardown(&self) -> Vec<Event> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.is_teardown())
            .cloned()
            .collect()
    }

    /// Wait until the log satisfies `done`.
    pub async fn wait_until(&self, done: impl FnMut(&Vec<Event>) -> bool) {
        let mut rx = self.events.subscribe();
        let _ = rx.wait_for(done).await;
    }

    pub async fn wait_for_publishes(&self, n: usize) {
        self.wait_until(|events| {
            events
                .iter()
                .filter(|e| matches!(e, Event::Published { .. }))
                .count()
                >= n
        })
        .await
    }

    pub async fn wait_for_acknowledgments(&self, n: usize) {
        self.wait_until(|events| {
            events
                .iter()
                .filter(|e| matches!(e, Event::Acknowledged(_)))
                .count()
                >= n
        })
        .await
    }
}

type Responder = oneshot::Sender<Result<(), ForwardError>>;
type Responders = Arc<Mutex<Vec<Option<Responder>>>>;

fn respond(responders: &Responders, index: usize, result: Result<(), ForwardError>) {
    let responder = responders
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_mut(index)
        .and_then(Option::take);
    if let Some(responder) = responder {
        let _ = responder.send(result);
    }
}

// ── Source ────────────────────────────────────────────────────────────────────

/// Source fed through a [`MemoryFeed`]. Message handles are sequence ids
/// starting at 0.
pub struct MemorySource {
    incoming: mpsc::UnboundedReceiver<Message<u64>>,
    recorder: Recorder,
    fail_acknowledge: Option<u64>,
    fail_close_subscription: bool,
    held: Option<Responders>,
}

/// Completes acknowledgments of a source built with
/// [`MemorySource::hold_acknowledgments`], addressed by message id.
#[derive(Clone)]
pub struct AcknowledgmentGate {
    responders: Responders,
}

impl AcknowledgmentGate {
    pub fn complete(&self, id: u64) {
        respond(&self.responders, id as usize, Ok(()));
    }

    pub fn fail(&self, id: u64, reason: &str) {
        respond(
            &self.responders,
            id as usize,
            Err(ForwardError::Acknowledge(reason.to_string())),
        );
    }
}

/// Producer side of a [`MemorySource`]. Dropping every feed ends the stream.
#[derive(Clone)]
pub struct MemoryFeed {
    tx: mpsc::UnboundedSender<Message<u64>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryFeed {
    /// Queue a message; returns its id.
    pub fn push(&self, payload: impl Into<Bytes>, properties: &[(&str, &str)]) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let properties: HashMap<String, String> = properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let _ = self.tx.send(Message {
            payload: payload.into(),
            properties,
            handle: id,
        });
        id
    }
}

impl MemorySource {
    pub fn new(recorder: Recorder) -> (Self, MemoryFeed) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let source = Self {
            incoming,
            recorder,
            fail_acknowledge: None,
            fail_close_subscription: false,
            held: None,
        };
        let feed = MemoryFeed {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
        };
        (source, feed)
    }

    /// Make acknowledging message `id` fail.
    pub fn fail_acknowledge(mut self, id: u64) -> Self {
        self.fail_acknowledge = Some(id);
        self
    }

    pub fn fail_close_subscription(mut self) -> Self {
        self.fail_close_subscription = true;
        self
    }

    /// Keep every acknowledgment pending until the gate completes it.
    pub fn hold_acknowledgments(mut self) -> (Self, AcknowledgmentGate) {
        let responders = Responders::default();
        self.held = Some(responders.clone());
        (self, AcknowledgmentGate { responders })
    }
}

impl Source for MemorySource {
    type Handle = u64;
    type Acknowledgment = BoxFuture<'static, Result<(), ForwardError>>;

    async fn receive(&mut self) -> Result<Message<u64>, ForwardError> {
        self.incoming.recv().await.ok_or(ForwardError::SourceEnded)
    }

    fn acknowledge(&mut self, handle: u64) -> Self::Acknowledgment {
        if self.fail_acknowledge == Some(handle) {
            return future::ready(Err(ForwardError::Acknowledge(format!(
                "message {handle} rejected"
            ))))
            .boxed();
        }
        self.recorder.push(Event::Acknowledged(handle));
        match &self.held {
            None => future::ready(Ok(())).boxed(),
            Some(responders) => {
                let (tx, rx) = oneshot::channel();
                let mut responders = responders.lock().unwrap_or_else(PoisonError::into_inner);
                let index = handle as usize;
                if responders.len() <= index {
                    responders.resize_with(index + 1, || None);
                }
                responders[index] = Some(tx);
                async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(ForwardError::Acknowledge("acknowledgment dropped".into()))
                    })
                }
                .boxed()
            }
        }
    }

    async fn close_subscription(&mut self) -> Result<(), ForwardError> {
        self.recorder.push(Event::ClosedSubscription);
        self.incoming.close();
        if self.fail_close_subscription {
            return Err(ForwardError::Close("subscription close rejected".into()));
        }
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), ForwardError> {
        self.recorder.push(Event::ClosedConnection);
        Ok(())
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Every publish is confirmed as soon as it is queued.
    Immediate,
    /// Confirmations are released one by one through [`SinkControl`].
    Manual,
}

pub struct MemorySink {
    recorder: Recorder,
    mode: ConfirmMode,
    responders: Responders,
    fail_disconnect: bool,
}

/// Releases confirmations of a [`ConfirmMode::Manual`] sink, addressed by
/// publish index (0-based, in publish order).
#[derive(Clone)]
pub struct SinkControl {
    responders: Responders,
}

impl SinkControl {
    pub fn confirm(&self, index: usize) {
        self.respond(index, Ok(()));
    }

    pub fn fail(&self, index: usize, reason: &str) {
        self.respond(
            index,
            Err(ForwardError::Publish {
                destination: format!("publish #{index}"),
                reason: reason.to_string(),
            }),
        );
    }

    fn respond(&self, index: usize, result: Result<(), ForwardError>) {
        respond(&self.responders, index, result);
    }
}

impl MemorySink {
    pub fn new(recorder: Recorder, mode: ConfirmMode) -> (Self, SinkControl) {
        let responders = Arc::new(Mutex::new(Vec::new()));
        let sink = Self {
            recorder,
            mode,
            responders: responders.clone(),
            fail_disconnect: false,
        };
        (sink, SinkControl { responders })
    }

    pub fn fail_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }
}

impl Sink for MemorySink {
    type Confirmation = BoxFuture<'static, Result<(), ForwardError>>;

    async fn publish(
        &self,
        destination: &str,
        payload: Bytes,
        quality: QualityLevel,
    ) -> Result<Self::Confirmation, ForwardError> {
        let confirmation = match self.mode {
            ConfirmMode::Immediate => future::ready(Ok(())).boxed(),
            ConfirmMode::Manual => {
                let (tx, rx) = oneshot::channel();
                self.responders
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Some(tx));
                async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(ForwardError::ConnectionLost("confirmation dropped".into()))
                    })
                }
                .boxed()
            }
        };
        self.recorder.push(Event::Published {
            destination: destination.to_string(),
            payload,
            quality,
        });
        Ok(confirmation)
    }

    async fn disconnect(&mut self) -> Result<(), ForwardError> {
        self.recorder.push(Event::Disconnected);
        if self.fail_disconnect {
            return Err(ForwardError::Close("disconnect rejected".into()));
        }
        Ok(())
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

pub struct MemoryEndpoint {
    recorder: Recorder,
}

impl MemoryEndpoint {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl HealthEndpoint for MemoryEndpoint {
    async fn close(&mut self) -> Result<(), ForwardError> {
        self.recorder.push(Event::ClosedEndpoint);
        Ok(())
    }
}
