//! Forwarding pipeline: receive from the source, publish to the sink,
//! acknowledge upstream once the sink has confirmed.
//!
//! Publishes are not awaited before the next receive. Their confirmations go
//! into a FIFO sequencing queue that yields in submission order, so the source
//! sees acknowledgments in exactly the order it delivered the messages, no
//! matter in which order the broker confirms. Acknowledgments are issued
//! without waiting for them; their results are collected alongside. Any
//! failure stops the loop and is returned to the caller; nothing is retried
//! or skipped.

use std::time::Duration;

use futures::future::{self, Join, Ready};
use futures::stream::{FuturesOrdered, FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;

use crate::config::ForwarderConfig;
use crate::error::ForwardError;
use crate::message::QualityLevel;
use crate::shutdown::{ExitReason, Shutdown};
use crate::stats::ForwardStats;
use crate::transport::{Sink, Source};

#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub base_topic: String,
    pub suffix_property: String,
    pub quality: QualityLevel,
    /// Upper bound on unconfirmed publishes. 0 = unbounded.
    pub max_in_flight: usize,
    pub stats_interval: Duration,
}

impl ForwardSettings {
    pub fn from_config(config: &ForwarderConfig) -> Self {
        Self {
            base_topic: config.mqtt.topic.clone(),
            suffix_property: config.forwarding.suffix_property.clone(),
            quality: config.mqtt.qos,
            max_in_flight: config.forwarding.max_in_flight,
            stats_interval: Duration::from_secs(config.forwarding.stats_interval_secs),
        }
    }
}

pub struct Pipeline {
    settings: ForwardSettings,
    stats: ForwardStats,
    shutdown: Shutdown,
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Pipeline {
    pub fn new(settings: ForwardSettings, stats: ForwardStats, shutdown: Shutdown) -> Self {
        Self {
            settings,
            stats,
            shutdown,
        }
    }

    /// Run the pipeline on its own task and route how it ended into shutdown.
    ///
    /// Returns the transports for teardown. A panic on the forwarding task is
    /// turned into a fatal trigger; the transports it owned are dropped.
    pub async fn spawn<S, P>(self, mut source: S, sink: P) -> Option<(S, P)>
    where
        S: Source + 'static,
        P: Sink + 'static,
    {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let result = self.run(&mut source, &sink).await;
            (result, source, sink)
        });
        match task.await {
            Ok((result, source, sink)) => {
                if let Err(e) = result {
                    shutdown.trigger(ExitReason::fatal(&e));
                }
                Some((source, sink))
            }
            Err(e) => {
                tracing::error!(error = %e, "forwarding task failed");
                shutdown.trigger(ExitReason::fatal(format!("forwarding task failed: {e}")));
                None
            }
        }
    }

    /// Forward until shutdown is requested (`Ok`) or something breaks (`Err`).
    ///
    /// Publishes still unconfirmed when the loop stops are left unacknowledged;
    /// the source redelivers them to the next subscriber.
    pub async fn run<S, P>(&self, source: &mut S, sink: &P) -> Result<(), ForwardError>
    where
        S: Source,
        P: Sink,
    {
        let _reporter = AbortOnDrop(tokio::spawn(
            self.stats.clone().report_every(self.settings.stats_interval),
        ));
        let mut in_flight: FuturesOrdered<Join<Ready<S::Handle>, P::Confirmation>> =
            FuturesOrdered::new();
        let mut acknowledging: FuturesUnordered<S::Acknowledgment> = FuturesUnordered::new();

        tracing::info!(
            base_topic = %self.settings.base_topic,
            quality = u8::from(self.settings.quality),
            max_in_flight = self.settings.max_in_flight,
            "keep processing messages"
        );

        loop {
            let accepting =
                self.settings.max_in_flight == 0 || in_flight.len() < self.settings.max_in_flight;

            tokio::select! {
                biased;

                _ = self.shutdown.triggered() => {
                    tracing::info!(
                        unconfirmed = in_flight.len(),
                        acknowledging = acknowledging.len(),
                        "forwarding stopped"
                    );
                    return Ok(());
                }

                Some(acknowledged) = acknowledging.next(), if !acknowledging.is_empty() => {
                    acknowledged?;
                }

                Some((handle, confirmed)) = in_flight.next(), if !in_flight.is_empty() => {
                    confirmed?;
                    self.stats.record();
                    acknowledging.push(source.acknowledge(handle));
                }

                received = source.receive(), if accepting => {
                    let message = received?;
                    let destination = message
                        .destination(&self.settings.base_topic, &self.settings.suffix_property);
                    tracing::debug!(
                        %destination,
                        bytes = message.payload.len(),
                        "forwarding message"
                    );
                    let handle = message.handle;
                    let confirmation = sink
                        .publish(&destination, message.payload, self.settings.quality)
                        .await?;
                    in_flight.push_back(future::join(future::ready(handle), confirmation));
                }
            }
        }
    }
}
