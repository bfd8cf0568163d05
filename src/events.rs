//! Monitor event fan-out.
//!
//! Events are serialized as `{"event": <name>, "data": <payload>}` so a
//! socket layer can forward them unchanged.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::PublishError;
use crate::host::HostSample;
use crate::logging::TARGET_MONITOR;
use crate::query::QueryAnalysis;
use crate::types::{Bottleneck, BufferedMetric, Profile, Regression};

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum MonitorEvent {
    #[serde(rename = "metric:update")]
    MetricUpdate(BufferedMetric),
    #[serde(rename = "bottleneck:detected")]
    BottleneckDetected(Bottleneck),
    #[serde(rename = "query:analyzed")]
    QueryAnalyzed(QueryAnalysis),
    #[serde(rename = "system:metrics")]
    SystemMetrics(HostSample),
    #[serde(rename = "profile:created")]
    ProfileCreated(Profile),
    #[serde(rename = "regression:detected")]
    RegressionDetected(Regression),
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::MetricUpdate(_) => "metric:update",
            MonitorEvent::BottleneckDetected(_) => "bottleneck:detected",
            MonitorEvent::QueryAnalyzed(_) => "query:analyzed",
            MonitorEvent::SystemMetrics(_) => "system:metrics",
            MonitorEvent::ProfileCreated(_) => "profile:created",
            MonitorEvent::RegressionDetected(_) => "regression:detected",
        }
    }
}

// ----------------------------------------------------------------------------
// Publisher
// ----------------------------------------------------------------------------

/// Delivers monitor events to whoever is listening.
pub trait EventPublisher: Send + Sync {
    /// Returns the number of subscribers the event reached
    fn publish(&self, event: MonitorEvent) -> Result<usize, PublishError>;
}

#[derive(Debug, Default)]
struct PublisherStats {
    published: AtomicU64,
    undelivered: AtomicU64,
    lagged: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStatsSnapshot {
    pub published: u64,
    /// Events sent while nobody was subscribed
    pub undelivered: u64,
    /// Events skipped by slow subscribers
    pub lagged: u64,
}

/// One-to-many in-process publisher over a tokio broadcast channel.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Arc<MonitorEvent>>,
    capacity: usize,
    stats: Arc<PublisherStats>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: Arc::new(PublisherStats::default()),
        }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            published: self.stats.published.load(AtomicOrdering::Relaxed),
            undelivered: self.stats.undelivered.load(AtomicOrdering::Relaxed),
            lagged: self.stats.lagged.load(AtomicOrdering::Relaxed),
        }
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: MonitorEvent) -> Result<usize, PublishError> {
        let name = event.name();
        match self.sender.send(Arc::new(event)) {
            Ok(count) => {
                self.stats.published.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(count)
            }
            Err(_) => {
                self.stats.undelivered.fetch_add(1, AtomicOrdering::Relaxed);
                Err(PublishError::NoSubscribers { event: name })
            }
        }
    }
}

impl std::fmt::Debug for BroadcastPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastPublisher")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receiving end of a [`BroadcastPublisher`]
pub struct EventSubscriber {
    receiver: broadcast::Receiver<Arc<MonitorEvent>>,
    stats: Arc<PublisherStats>,
}

impl EventSubscriber {
    /// Next event, or `None` once the publisher is gone.
    /// A subscriber that fell behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<Arc<MonitorEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.stats.lagged.fetch_add(skipped, AtomicOrdering::Relaxed);
                    warn!(target: TARGET_MONITOR, skipped, "Event subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Arc<MonitorEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.stats.lagged.fetch_add(skipped, AtomicOrdering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope() {
        let event = MonitorEvent::MetricUpdate(BufferedMetric::new("api-gateway", "/api/users", 12.0));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "metric:update");
        assert_eq!(json["data"]["endpoint"], "/api/users");
        assert_eq!(json["data"]["metrics"]["responseTime"], 12.0);

        let back: MonitorEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.name(), "metric:update");
    }

    #[test]
    fn test_added_event_names_match_envelope() {
        use crate::types::{MetricPoint, RequestObservation};

        let request = RequestObservation::new("GET", "/api/a", 200, 60.0);
        let events = [
            MonitorEvent::SystemMetrics(HostSample::new(10.0, 20.0, 30.0)),
            MonitorEvent::ProfileCreated(Profile::segmented("svc", &request)),
            MonitorEvent::RegressionDetected(Regression::new(
                "svc",
                "responseTime",
                MetricPoint::now(100.0),
                MetricPoint::now(150.0),
            )),
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
            let back: MonitorEvent = serde_json::from_value(json).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let event = MonitorEvent::MetricUpdate(BufferedMetric::new("s", "/a", 1.0));

        assert_eq!(
            publisher.publish(event),
            Err(PublishError::NoSubscribers { event: "metric:update" })
        );
        assert_eq!(publisher.stats().undelivered, 1);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        let delivered = publisher
            .publish(MonitorEvent::MetricUpdate(BufferedMetric::new("s", "/a", 1.0)))
            .unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(first.recv().await.unwrap().name(), "metric:update");
        assert_eq!(second.recv().await.unwrap().name(), "metric:update");
        assert!(first.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_missed_events() {
        let publisher = BroadcastPublisher::new(2);
        let mut subscriber = publisher.subscribe();

        for i in 0..5 {
            publisher
                .publish(MonitorEvent::MetricUpdate(BufferedMetric::new("s", format!("/{}", i), 1.0)))
                .unwrap();
        }

        match subscriber.recv().await.as_deref() {
            Some(MonitorEvent::MetricUpdate(metric)) => assert_eq!(metric.endpoint, "/3"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(publisher.stats().lagged, 3);
    }

    #[tokio::test]
    async fn test_recv_ends_when_publisher_dropped() {
        let publisher = BroadcastPublisher::new(4);
        let mut subscriber = publisher.subscribe();
        drop(publisher);
        assert!(subscriber.recv().await.is_none());
    }
}
