use crate::*;

use bytes::Bytes;
use forwarder_core::memory::{
    ConfirmMode, Event, MemoryEndpoint, MemoryFeed, MemorySink, MemorySource, Recorder,
    SinkControl,
};
use forwarder_core::{
    ExitReason, ForwardError, ForwardSettings, ForwardStats, HealthState, Lifecycle, Pipeline,
    QualityLevel, Resources, Shutdown, Signal,
};
use tokio::task::JoinHandle;

type Outcome = (Result<(), ForwardError>, MemorySource, MemorySink);

/// A running pipeline over in-memory transports. The transports come back
/// out of the task when it ends so they can be drained.
struct Bridge {
    recorder: Recorder,
    feed: Option<MemoryFeed>,
    control: SinkControl,
    shutdown: Shutdown,
    health: HealthState,
    task: JoinHandle<Outcome>,
}

impl Bridge {
    fn start(
        source: MemorySource,
        sink: MemorySink,
        recorder: Recorder,
        feed: MemoryFeed,
        control: SinkControl,
    ) -> Self {
        let shutdown = Shutdown::with_step_timeout(Duration::from_secs(1));
        let health = HealthState::new();
        health.set_ready(true);

        let settings = ForwardSettings {
            base_topic: "transit/vehicles".to_string(),
            suffix_property: "topicSuffix".to_string(),
            quality: QualityLevel::ExactlyOnceHop,
            max_in_flight: 0,
            stats_interval: Duration::from_secs(60),
        };
        let pipeline = Pipeline::new(settings, ForwardStats::new(), shutdown.clone());
        let task = tokio::spawn(async move {
            let mut source = source;
            let result = pipeline.run(&mut source, &sink).await;
            (result, source, sink)
        });

        Self {
            recorder,
            feed: Some(feed),
            control,
            shutdown,
            health,
            task,
        }
    }

    fn push(&self, payload: &'static str, properties: &[(&str, &str)]) -> u64 {
        self.feed
            .as_ref()
            .expect("feed already closed")
            .push(payload, properties)
    }

    /// Drop the producer side; the source reports its end once drained.
    fn close_feed(&mut self) {
        self.feed = None;
    }

    fn memory(mode: ConfirmMode) -> Self {
        let recorder = Recorder::new();
        let (source, feed) = MemorySource::new(recorder.clone());
        let (sink, control) = MemorySink::new(recorder.clone(), mode);
        Self::start(source, sink, recorder, feed, control)
    }

    /// Wait for the pipeline, route its error (if any) into shutdown, and
    /// drain. Returns the exit code.
    async fn finish(self) -> (i32, Recorder, HealthState, Shutdown) {
        let (result, source, sink) = self.task.await.unwrap();
        if let Err(e) = result {
            self.shutdown.trigger(ExitReason::fatal(&e));
        }
        let mut resources = Resources {
            source: Some(source),
            sink: Some(sink),
            endpoint: Some(MemoryEndpoint::new(self.recorder.clone())),
        };
        let code = self
            .shutdown
            .drain(&self.health, &mut resources)
            .await
            .unwrap();
        (code, self.recorder, self.health, self.shutdown)
    }
}

const TEARDOWN: [Event; 4] = [
    Event::ClosedSubscription,
    Event::ClosedConnection,
    Event::Disconnected,
    Event::ClosedEndpoint,
];

#[tokio::test]
async fn forwards_in_order_then_exits_on_sigterm() {
    let bridge = Bridge::memory(ConfirmMode::Manual);
    let a = bridge.push("a", &[]);
    let b = bridge.push("b", &[("topicSuffix", "/bus/17")]);
    let c = bridge.push("c", &[]);
    bridge.recorder.wait_for_publishes(3).await;

    assert_eq!(
        bridge.recorder.published(),
        vec![
            ("transit/vehicles".to_string(), Bytes::from("a")),
            ("transit/vehicles/bus/17".to_string(), Bytes::from("b")),
            ("transit/vehicles".to_string(), Bytes::from("c")),
        ]
    );

    bridge.control.confirm(2);
    bridge.control.confirm(1);
    tokio::task::yield_now().await;
    assert!(bridge.recorder.acknowledged().is_empty());
    bridge.control.confirm(0);
    bridge.recorder.wait_for_acknowledgments(3).await;
    assert_eq!(bridge.recorder.acknowledged(), vec![a, b, c]);

    bridge
        .shutdown
        .trigger(ExitReason::Signal(Signal::Terminate));
    let (code, recorder, health, shutdown) = bridge.finish().await;

    assert_eq!(code, 143);
    assert_eq!(recorder.teardown(), TEARDOWN.to_vec());
    assert!(!health.is_ready());
    assert_eq!(shutdown.lifecycle(), Lifecycle::Terminated);
}

#[tokio::test]
async fn publish_failure_exits_1_without_acknowledging() {
    let bridge = Bridge::memory(ConfirmMode::Manual);
    let a = bridge.push("a", &[]);
    bridge.push("b", &[]);
    bridge.push("c", &[]);
    bridge.recorder.wait_for_publishes(3).await;

    bridge.control.confirm(0);
    bridge.control.fail(1, "not authorized");
    bridge.control.confirm(2);
    let (code, recorder, _, shutdown) = bridge.finish().await;

    assert_eq!(code, 1);
    assert_eq!(recorder.acknowledged(), vec![a]);
    assert!(matches!(
        shutdown.reason(),
        Some(ExitReason::Fatal { cause: Some(_) })
    ));
    assert_eq!(recorder.teardown(), TEARDOWN.to_vec());
}

#[tokio::test]
async fn first_reason_wins_over_later_signals() {
    let bridge = Bridge::memory(ConfirmMode::Immediate);
    bridge.push("a", &[]);
    bridge.recorder.wait_for_acknowledgments(1).await;

    bridge.shutdown.trigger(ExitReason::Signal(Signal::Interrupt));
    bridge.shutdown.trigger(ExitReason::Signal(Signal::Terminate));
    bridge.shutdown.trigger(ExitReason::fatal("late"));
    let (code, ..) = bridge.finish().await;
    assert_eq!(code, 130);
}

#[tokio::test]
async fn sigquit_exits_131() {
    let bridge = Bridge::memory(ConfirmMode::Immediate);
    bridge.shutdown.trigger(ExitReason::Signal(Signal::Quit));
    let (code, recorder, ..) = bridge.finish().await;
    assert_eq!(code, 131);
    assert!(recorder.published().is_empty());
}

#[tokio::test]
async fn teardown_failures_do_not_stop_later_steps() {
    let recorder = Recorder::new();
    let (source, feed) = MemorySource::new(recorder.clone());
    let (sink, control) = MemorySink::new(recorder.clone(), ConfirmMode::Immediate);
    let bridge = Bridge::start(
        source.fail_close_subscription(),
        sink.fail_disconnect(),
        recorder,
        feed,
        control,
    );

    bridge
        .shutdown
        .trigger(ExitReason::Signal(Signal::Terminate));
    let (code, recorder, ..) = bridge.finish().await;
    assert_eq!(code, 143);
    assert_eq!(recorder.teardown(), TEARDOWN.to_vec());
}

#[tokio::test]
async fn source_end_is_fatal() {
    let mut bridge = Bridge::memory(ConfirmMode::Immediate);
    bridge.push("a", &[]);
    bridge.close_feed();

    let (code, recorder, _, shutdown) = bridge.finish().await;
    assert_eq!(code, 1);
    assert_eq!(recorder.acknowledged(), vec![0]);
    assert_eq!(
        shutdown.reason(),
        Some(ExitReason::fatal(ForwardError::SourceEnded))
    );
}
