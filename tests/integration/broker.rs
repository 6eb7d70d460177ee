use crate::*;

use bytes::Bytes;
use forwarder_core::config::MqttConfig;
use forwarder_core::memory::{Event, MemoryEndpoint, MemorySource, Recorder};
use forwarder_core::{
    ExitReason, ForwardError, ForwardSettings, ForwardStats, HealthState, Pipeline, QualityLevel,
    Resources, Shutdown, Signal, Sink,
};
use forwarder_transport::MqttSink;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn skip_unless_broker() -> Option<String> {
    let url = mqtt_url();
    if url.is_none() {
        eprintln!("SKIP: FORWARDER_TEST_MQTT_URL not set");
    }
    url
}

fn with_client_id(url: &str, client_id: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}client_id={client_id}")
}

/// Per-test topic root so parallel runs against one broker do not collide.
fn topic_root(test: &str) -> String {
    format!("forwarder-it/{}/{test}", std::process::id())
}

fn sink_config(url: &str, topic: &str) -> MqttConfig {
    MqttConfig {
        url: url.to_string(),
        topic: topic.to_string(),
        client_id_prefix: "forwarder-it-".to_string(),
        client_id_suffix_length: 8,
        clean_session: true,
        ..MqttConfig::default()
    }
}

/// Subscribe to `root` and everything below it. Returns `(topic, payload)`
/// for each message the broker delivers.
async fn subscribe(url: &str, root: &str) -> Result<mpsc::UnboundedReceiver<(String, Bytes)>> {
    let client_id = format!("forwarder-it-sub-{}", std::process::id());
    let options = MqttOptions::parse_url(with_client_id(url, &client_id))?;
    let (client, mut event_loop) = AsyncClient::new(options, 16);
    client
        .subscribe(format!("{root}/#"), QoS::AtLeastOnce)
        .await?;

    loop {
        if let MqttEvent::Incoming(Packet::SubAck(_)) = timeout(WAIT, event_loop.poll()).await?? {
            break;
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let _client = client;
        while let Ok(event) = event_loop.poll().await {
            if let MqttEvent::Incoming(Packet::Publish(publish)) = event {
                if tx.send((publish.topic, publish.payload)).is_err() {
                    break;
                }
            }
        }
    });
    Ok(rx)
}

#[tokio::test]
async fn every_quality_level_confirms() {
    let Some(url) = skip_unless_broker() else { return };
    let root = topic_root("quality");
    let mut sink = MqttSink::connect(&sink_config(&url, &root), Shutdown::new())
        .await
        .unwrap();

    for quality in [
        QualityLevel::AtMostOnce,
        QualityLevel::AtLeastOnce,
        QualityLevel::ExactlyOnceHop,
    ] {
        let confirmation = sink
            .publish(&root, Bytes::from("ping"), quality)
            .await
            .unwrap();
        timeout(WAIT, confirmation)
            .await
            .expect("confirmation timed out")
            .unwrap();
    }
    assert_eq!(sink.unconfirmed(), 0);
    sink.disconnect().await.unwrap();
}

#[tokio::test]
async fn publish_after_disconnect_fails() {
    let Some(url) = skip_unless_broker() else { return };
    let root = topic_root("disconnected");
    let mut sink = MqttSink::connect(&sink_config(&url, &root), Shutdown::new())
        .await
        .unwrap();
    sink.disconnect().await.unwrap();

    let result = sink
        .publish(&root, Bytes::from("late"), QualityLevel::AtLeastOnce)
        .await;
    assert!(matches!(result, Err(ForwardError::Publish { .. })));
}

#[tokio::test]
async fn forwards_to_live_broker() {
    let Some(url) = skip_unless_broker() else { return };
    let root = topic_root("forward");
    let mut received = subscribe(&url, &root).await.unwrap();

    let shutdown = Shutdown::new();
    let sink = MqttSink::connect(&sink_config(&url, &root), shutdown.clone())
        .await
        .unwrap();
    let recorder = Recorder::new();
    let (source, feed) = MemorySource::new(recorder.clone());
    let settings = ForwardSettings {
        base_topic: root.clone(),
        suffix_property: "topicSuffix".to_string(),
        quality: QualityLevel::ExactlyOnceHop,
        max_in_flight: 16,
        stats_interval: Duration::from_secs(60),
    };
    let pipeline = Pipeline::new(settings, ForwardStats::new(), shutdown.clone());
    let task = tokio::spawn(async move {
        let mut source = source;
        let result = pipeline.run(&mut source, &sink).await;
        (result, source, sink)
    });

    feed.push("first", &[]);
    feed.push("second", &[("topicSuffix", "/line/9")]);
    feed.push("third", &[]);
    timeout(WAIT, recorder.wait_for_acknowledgments(3))
        .await
        .expect("acknowledgments timed out");
    assert_eq!(recorder.acknowledged(), vec![0, 1, 2]);

    let mut delivered = Vec::new();
    for _ in 0..3 {
        let message = timeout(WAIT, received.recv())
            .await
            .expect("delivery timed out")
            .expect("subscriber stopped");
        delivered.push(message);
    }
    let on_root: Vec<_> = delivered
        .iter()
        .filter(|(topic, _)| *topic == root)
        .map(|(_, payload)| payload.clone())
        .collect();
    assert_eq!(on_root, vec![Bytes::from("first"), Bytes::from("third")]);
    assert!(delivered.contains(&(format!("{root}/line/9"), Bytes::from("second"))));

    shutdown.trigger(ExitReason::Signal(Signal::Terminate));
    let (result, source, sink) = task.await.unwrap();
    assert_eq!(result, Ok(()));

    let mut resources: Resources<MemorySource, MqttSink, MemoryEndpoint> = Resources {
        source: Some(source),
        sink: Some(sink),
        endpoint: None,
    };
    assert_eq!(
        shutdown.drain(&HealthState::new(), &mut resources).await,
        Some(143)
    );
    assert_eq!(
        recorder.teardown(),
        vec![Event::ClosedSubscription, Event::ClosedConnection]
    );
}
