//! Pulsar source over the `pulsar` crate.
//!
//! One Exclusive subscription across every topic matching the configured
//! pattern, starting from the earliest unacknowledged message. The message
//! itself is the acknowledgment handle.
//!
//! The consumer lives on its own task. Messages come out of it through a
//! one-slot channel; acknowledgments and the close request go in through a
//! command queue and are handled in the order they were issued.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use futures::TryStreamExt;
use pulsar::authentication::oauth2::{OAuth2Authentication, OAuth2Params};
use pulsar::consumer::{ConsumerOptions, InitialPosition};
use pulsar::proto::KeyValue;
use pulsar::{Consumer, Pulsar, SubType, TokioExecutor};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use forwarder_core::config::PulsarConfig;
use forwarder_core::{ForwardError, Message, Source};

pub type PulsarMessage = pulsar::consumer::Message<Vec<u8>>;

fn connect_error(reason: impl ToString) -> ForwardError {
    ForwardError::Connect {
        transport: "pulsar",
        reason: reason.to_string(),
    }
}

fn credentials_url(key_path: &Path) -> String {
    format!("file://{}", key_path.display())
}

fn properties(pairs: &[KeyValue]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.clone()))
        .collect()
}

type Reply = oneshot::Sender<Result<(), ForwardError>>;

enum Command {
    Acknowledge(PulsarMessage, Reply),
    Close(Reply),
}

/// Owns the consumer. Stops after closing it, or once the source is dropped.
async fn consume(
    mut consumer: Consumer<Vec<u8>, TokioExecutor>,
    messages: mpsc::Sender<Result<PulsarMessage, ForwardError>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut slot: Option<mpsc::Permit<'_, Result<PulsarMessage, ForwardError>>> = None;
    let mut ended = false;
    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(Command::Acknowledge(message, reply)) => {
                    let result = consumer
                        .ack(&message)
                        .await
                        .map_err(|e| ForwardError::Acknowledge(e.to_string()));
                    let _ = reply.send(result);
                }
                Some(Command::Close(reply)) => {
                    let result = consumer
                        .close()
                        .await
                        .map_err(|e| ForwardError::Close(e.to_string()));
                    let _ = reply.send(result);
                    return;
                }
                None => return,
            },

            reserved = messages.reserve(), if slot.is_none() && !ended => match reserved {
                Ok(permit) => slot = Some(permit),
                Err(_) => return,
            },

            received = consumer.try_next(), if slot.is_some() => {
                let received = match received {
                    Ok(Some(message)) => Ok(message),
                    Ok(None) => Err(ForwardError::SourceEnded),
                    Err(e) => Err(ForwardError::Receive(e.to_string())),
                };
                ended = received.is_err();
                if let Some(permit) = slot.take() {
                    permit.send(received);
                }
            }
        }
    }
}

fn consumer_stopped() -> ForwardError {
    ForwardError::Acknowledge("pulsar consumer stopped".to_string())
}

pub struct PulsarSource {
    messages: mpsc::Receiver<Result<PulsarMessage, ForwardError>>,
    commands: mpsc::UnboundedSender<Command>,
    consumer: Option<JoinHandle<()>>,
    client: Option<Pulsar<TokioExecutor>>,
}

impl PulsarSource {
    /// Connect to the cluster and subscribe.
    pub async fn connect(config: &PulsarConfig) -> Result<Self, ForwardError> {
        let pattern = Regex::new(&config.topics_pattern).map_err(connect_error)?;

        let mut builder = Pulsar::builder(config.service_url.as_str(), TokioExecutor)
            .with_tls_hostname_verification_enabled(config.tls_validate_hostname);
        if let Some(oauth2) = &config.oauth2 {
            builder = builder.with_auth_provider(OAuth2Authentication::client_credentials(
                OAuth2Params {
                    issuer_url: oauth2.issuer_url.clone(),
                    credentials_url: credentials_url(&oauth2.key_path),
                    audience: Some(oauth2.audience.clone()),
                    scope: None,
                },
            ));
        }
        let client: Pulsar<TokioExecutor> = builder.build().await.map_err(connect_error)?;

        let consumer: Consumer<Vec<u8>, TokioExecutor> = client
            .consumer()
            .with_topic_regex(pattern)
            .with_subscription_type(SubType::Exclusive)
            .with_subscription(&config.subscription)
            .with_options(ConsumerOptions::default().with_initial_position(InitialPosition::Earliest))
            .build()
            .await
            .map_err(connect_error)?;

        tracing::info!(
            topics_pattern = %config.topics_pattern,
            subscription = %config.subscription,
            "subscribed to pulsar"
        );

        let (messages_tx, messages) = mpsc::channel(1);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(consume(consumer, messages_tx, commands_rx));

        Ok(Self {
            messages,
            commands,
            consumer: Some(task),
            client: Some(client),
        })
    }
}

impl Source for PulsarSource {
    type Handle = PulsarMessage;
    type Acknowledgment = BoxFuture<'static, Result<(), ForwardError>>;

    async fn receive(&mut self) -> Result<Message<PulsarMessage>, ForwardError> {
        let message = self
            .messages
            .recv()
            .await
            .unwrap_or(Err(ForwardError::SourceEnded))?;

        tracing::trace!(topic = %message.topic, "message received");
        Ok(Message {
            payload: Bytes::copy_from_slice(&message.payload.data),
            properties: properties(&message.payload.metadata.properties),
            handle: message,
        })
    }

    fn acknowledge(&mut self, handle: PulsarMessage) -> Self::Acknowledgment {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(Command::Acknowledge(handle, reply))
            .is_err()
        {
            return future::ready(Err(consumer_stopped())).boxed();
        }
        async move { done.await.unwrap_or_else(|_| Err(consumer_stopped())) }.boxed()
    }

    async fn close_subscription(&mut self) -> Result<(), ForwardError> {
        let closed = || ForwardError::Close("pulsar consumer already stopped".to_string());
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Close(reply))
            .map_err(|_| closed())?;
        done.await.unwrap_or_else(|_| Err(closed()))
    }

    async fn close_connection(&mut self) -> Result<(), ForwardError> {
        if let Some(task) = self.consumer.take() {
            task.abort();
        }
        // Dropping the last client handle closes its connections.
        drop(self.client.take());
        Ok(())
    }
}

impl Drop for PulsarSource {
    fn drop(&mut self) {
        if let Some(task) = self.consumer.take() {
            task.abort();
        }
    }
}
