//! MQTT sink over rumqttc.
//!
//! The client connects eagerly (waits for CONNACK), then hands its event loop
//! to a background task. That task matches broker acknowledgments back to
//! publishes and resolves each confirmation at the point its quality level
//! asks for: QoS 0 once written, QoS 1 on PUBACK, QoS 2 on PUBCOMP.
//!
//! If the event loop fails every outstanding confirmation fails with it and a
//! fatal shutdown is requested. There is no reconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use forwarder_core::config::MqttConfig;
use forwarder_core::{ExitReason, ForwardError, QualityLevel, Shutdown, Sink};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Responder = oneshot::Sender<Result<(), ForwardError>>;

fn connect_error(reason: impl ToString) -> ForwardError {
    ForwardError::Connect {
        transport: "mqtt",
        reason: reason.to_string(),
    }
}

/// Prefix followed by `suffix_length` random alphanumeric characters.
pub fn client_id(prefix: &str, suffix_length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(suffix_length)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

pub fn qos(quality: QualityLevel) -> QoS {
    match quality {
        QualityLevel::AtMostOnce => QoS::AtMostOnce,
        QualityLevel::AtLeastOnce => QoS::AtLeastOnce,
        QualityLevel::ExactlyOnceHop => QoS::ExactlyOnce,
    }
}

fn options(config: &MqttConfig, client_id: &str) -> Result<MqttOptions, ForwardError> {
    let separator = if config.url.contains('?') { '&' } else { '?' };
    let url = format!("{}{separator}client_id={client_id}", config.url);
    let mut options = MqttOptions::parse_url(url).map_err(connect_error)?;
    options.set_clean_session(config.clean_session);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if let Some((username, password)) = config.credentials().map_err(connect_error)? {
        options.set_credentials(username, password);
    }
    Ok(options)
}

// ── Pending confirmations ─────────────────────────────────────────────────────

/// Publishes the broker has not finished with yet.
#[derive(Default)]
struct Pending {
    /// Handed to the client, not yet written. The event loop writes publishes
    /// in request order, so these are matched to packet ids front to back.
    unwritten: VecDeque<(QoS, Responder)>,
    /// Written, waiting for PUBACK (QoS 1) or PUBCOMP (QoS 2).
    unacknowledged: HashMap<u16, Responder>,
    /// Written on a packet id that was still unacknowledged. The client parks
    /// such a publish and re-sends it once the id frees up, reporting the write
    /// just before the acknowledgment of the earlier publish.
    collided: HashMap<u16, Responder>,
}

impl Pending {
    fn queue(&mut self, qos: QoS, responder: Responder) {
        self.unwritten.push_back((qos, responder));
    }

    /// Undo the last `queue` after the client refused the request.
    fn unqueue_last(&mut self) {
        self.unwritten.pop_back();
    }

    fn written(&mut self, pkid: u16) {
        let Some((qos, responder)) = self.unwritten.pop_front() else {
            tracing::warn!(pkid, "publish written without a pending confirmation");
            return;
        };
        match qos {
            QoS::AtMostOnce => {
                let _ = responder.send(Ok(()));
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                if self.unacknowledged.contains_key(&pkid) {
                    tracing::debug!(pkid, "publish written on a packet id still in use");
                    self.collided.insert(pkid, responder);
                } else {
                    self.unacknowledged.insert(pkid, responder);
                }
            }
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        match self.unacknowledged.remove(&pkid) {
            Some(responder) => {
                let _ = responder.send(Ok(()));
            }
            None => tracing::debug!(pkid, "acknowledgment for unknown packet id"),
        }
        if let Some(responder) = self.collided.remove(&pkid) {
            self.unacknowledged.insert(pkid, responder);
        }
    }

    fn fail_all(&mut self, error: &ForwardError) {
        for (_, responder) in self.unwritten.drain(..) {
            let _ = responder.send(Err(error.clone()));
        }
        for (_, responder) in self.unacknowledged.drain().chain(self.collided.drain()) {
            let _ = responder.send(Err(error.clone()));
        }
    }

    fn len(&self) -> usize {
        self.unwritten.len() + self.unacknowledged.len() + self.collided.len()
    }
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Sink ──────────────────────────────────────────────────────────────────────

pub struct MqttSink {
    client: AsyncClient,
    pending: Arc<Mutex<Pending>>,
    /// Held from queueing a confirmation until the client has the request,
    /// so confirmations and requests line up.
    publish_order: tokio::sync::Mutex<()>,
    disconnecting: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttSink {
    /// Connect and start the event loop task. Fails if the broker does not
    /// accept the connection.
    pub async fn connect(config: &MqttConfig, shutdown: Shutdown) -> Result<Self, ForwardError> {
        let client_id = client_id(&config.client_id_prefix, config.client_id_suffix_length);
        let options = options(config, &client_id)?;
        let (client, mut event_loop) = AsyncClient::new(options, config.request_capacity);

        wait_for_connack(&mut event_loop).await?;
        tracing::info!(
            %client_id,
            clean_session = config.clean_session,
            "connected to mqtt broker"
        );

        let pending = Arc::new(Mutex::new(Pending::default()));
        let disconnecting = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(drive(
            event_loop,
            pending.clone(),
            disconnecting.clone(),
            shutdown,
        ));

        Ok(Self {
            client,
            pending,
            publish_order: tokio::sync::Mutex::new(()),
            disconnecting,
            event_loop: Some(task),
        })
    }

    /// Publishes handed to the client and not yet confirmed.
    pub fn unconfirmed(&self) -> usize {
        lock(&self.pending).len()
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ForwardError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::debug!(session_present = ack.session_present, "connack received");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(connect_error(e)),
        }
    }
}

async fn drive(
    mut event_loop: EventLoop,
    pending: Arc<Mutex<Pending>>,
    disconnecting: Arc<AtomicBool>,
    shutdown: Shutdown,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => lock(&pending).written(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => lock(&pending).acknowledged(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => lock(&pending).acknowledged(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("mqtt disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) if disconnecting.load(Ordering::Acquire) => {
                tracing::debug!(error = %e, "mqtt event loop stopped while disconnecting");
                break;
            }
            Err(e) => {
                let error = ForwardError::ConnectionLost(e.to_string());
                lock(&pending).fail_all(&error);
                shutdown.trigger(ExitReason::fatal(&error));
                return;
            }
        }
    }
    lock(&pending).fail_all(&ForwardError::ConnectionLost("disconnected".to_string()));
}

impl Sink for MqttSink {
    type Confirmation = BoxFuture<'static, Result<(), ForwardError>>;

    async fn publish(
        &self,
        destination: &str,
        payload: Bytes,
        quality: QualityLevel,
    ) -> Result<Self::Confirmation, ForwardError> {
        let qos = qos(quality);
        let (tx, rx) = oneshot::channel();

        let _order = self.publish_order.lock().await;
        lock(&self.pending).queue(qos, tx);
        if let Err(e) = self
            .client
            .publish_bytes(destination, qos, false, payload)
            .await
        {
            lock(&self.pending).unqueue_last();
            return Err(ForwardError::Publish {
                destination: destination.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(async move {
            rx.await.unwrap_or_else(|_| {
                Err(ForwardError::ConnectionLost(
                    "mqtt event loop stopped".to_string(),
                ))
            })
        }
        .boxed())
    }

    async fn disconnect(&mut self) -> Result<(), ForwardError> {
        let Some(mut task) = self.event_loop.take() else {
            return Ok(());
        };
        if task.is_finished() {
            return Ok(());
        }

        self.disconnecting.store(true, Ordering::Release);
        self.client
            .disconnect()
            .await
            .map_err(|e| ForwardError::Close(e.to_string()))?;

        if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            task.abort();
            return Err(ForwardError::Close(
                "mqtt event loop did not stop".to_string(),
            ));
        }
        tracing::info!("disconnected from mqtt broker");
        Ok(())
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.take() {
            task.abort();
        }
    }
}
