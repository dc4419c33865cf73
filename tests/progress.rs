//! Progress channel tests: ordering, coalescing and forwarding.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use castwright::core::{spawn_forwarder, ProgressEvent, ProgressHub, ProgressSink};

/// Records what it is given; optionally fails every delivery
#[derive(Clone, Default)]
struct RecordingSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
    broken: bool,
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn deliver(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        if self.broken {
            anyhow::bail!("transport closed");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_stream_is_monotonic_and_ends_at_100() {
    let (hub, receiver) = ProgressHub::channel(Duration::from_secs(60));
    let sink = RecordingSink::default();
    let forwarder = spawn_forwarder(receiver, sink.clone());

    for pct in [0u8, 3, 10, 7, 12, 40, 38, 41, 90] {
        hub.report("podcast://p1", pct, "working");
    }
    hub.finish("podcast://p1", "done");
    drop(hub);
    forwarder.await.unwrap();

    let events = sink.events.lock().unwrap().clone();
    let percentages: Vec<u8> = events.iter().map(|e| e.percentage).collect();
    assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percentages.last(), Some(&100));
    assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);

    // Small steps inside the interval were coalesced
    assert!(!percentages.contains(&3));
    assert!(!percentages.contains(&41));
}

#[tokio::test]
async fn test_jobs_are_tracked_independently() {
    let (hub, receiver) = ProgressHub::channel(Duration::ZERO);
    let sink = RecordingSink::default();
    let forwarder = spawn_forwarder(receiver, sink.clone());

    hub.report("document://a", 50, "half");
    hub.report("document://b", 10, "started");
    hub.finish("document://a", "done");
    hub.report("document://b", 20, "more");
    drop(hub);
    forwarder.await.unwrap();

    let events = sink.events.lock().unwrap().clone();
    let b: Vec<u8> = events
        .iter()
        .filter(|e| e.job_id == "document://b")
        .map(|e| e.percentage)
        .collect();
    assert_eq!(b, vec![10, 20]);
}

#[tokio::test]
async fn test_delivery_failures_do_not_stop_the_stream() {
    let (hub, receiver) = ProgressHub::channel(Duration::ZERO);
    let sink = RecordingSink {
        broken: true,
        ..Default::default()
    };
    let forwarder = spawn_forwarder(receiver, sink.clone());

    hub.report("audio://x", 10, "a");
    hub.report("audio://x", 60, "b");
    hub.finish("audio://x", "c");
    drop(hub);
    forwarder.await.unwrap();

    assert_eq!(sink.events.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_envelope_shape() {
    let (hub, mut receiver) = ProgressHub::channel(Duration::ZERO);
    hub.finish("podcast://p1", "Composing podcast complete");

    let event = receiver.recv().await.unwrap();
    let json = serde_json::to_value(event.envelope()).unwrap();
    assert_eq!(json["progress"]["percentage"], 100);
    assert_eq!(json["progress"]["status"], "Composing podcast complete");
}
