//! In-process fan-out of `WorkflowEvent`s.
//!
//! The engine and the cleanup worker publish; the CLI's event logger and
//! tests listen. Listeners usually care about one execution or one family
//! of topics, so subscriptions carry an `EventFilter` and skip the rest.
//! A slow listener loses the oldest events rather than blocking publishers.

use flowgate_types::event::WorkflowEvent;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

/// Which events a subscription yields. The default matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    execution_id: Option<Uuid>,
    /// Topic prefixes, e.g. `workflow.node.`. Empty means any topic.
    topics: Vec<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Only events of one execution.
    pub fn execution(id: Uuid) -> Self {
        Self {
            execution_id: Some(id),
            topics: Vec::new(),
        }
    }

    /// Also accept topics starting with `prefix`.
    pub fn topic(mut self, prefix: impl Into<String>) -> Self {
        self.topics.push(prefix.into());
        self
    }

    pub fn matches(&self, event: &WorkflowEvent) -> bool {
        if self.execution_id.is_some_and(|id| id != event.execution_id()) {
            return false;
        }
        self.topics.is_empty() || self.topics.iter().any(|p| event.topic().starts_with(p.as_str()))
    }
}

/// Publisher handle. Clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Everything published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_to(EventFilter::all())
    }

    pub fn subscribe_to(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.sender.subscribe(),
            filter,
            missed: 0,
        }
    }

    /// Returns how many subscriptions the event reached. Zero is fine.
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        tracing::trace!(topic = event.topic(), execution_id = %event.execution_id(), "publish");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A filtered listener on an `EventBus`.
pub struct Subscription {
    rx: broadcast::Receiver<WorkflowEvent>,
    filter: EventFilter,
    missed: u64,
}

impl Subscription {
    /// Next matching event, or `None` once every publisher is gone.
    ///
    /// Lag is not an error here: the skipped count is added to `missed`
    /// and reading continues with the oldest retained event.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`: `None` when nothing matching is
    /// buffered right now.
    pub fn try_recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events dropped because this subscription fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn record_lag(&mut self, skipped: u64) {
        self.missed += skipped;
        tracing::warn!(skipped, total = self.missed, "event subscription lagged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(execution_id: Uuid) -> WorkflowEvent {
        WorkflowEvent::ExecutionStarted {
            execution_id,
            workflow_id: Uuid::now_v7(),
            triggered_by: "test".to_string(),
        }
    }

    fn node_done(execution_id: Uuid, node_id: &str) -> WorkflowEvent {
        WorkflowEvent::NodeCompleted {
            execution_id,
            node_id: node_id.to_string(),
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_the_event() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.clone().subscribe();

        assert_eq!(bus.publish(started(Uuid::now_v7())), 2);
        assert_eq!(a.recv().await.unwrap().topic(), "workflow.started");
        assert_eq!(b.recv().await.unwrap().topic(), "workflow.started");
    }

    #[test]
    fn publish_without_subscribers_reaches_nobody() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(started(Uuid::now_v7())), 0);
    }

    #[test]
    fn execution_filter_skips_other_runs() {
        let bus = EventBus::new(16);
        let mine = Uuid::now_v7();
        let mut sub = bus.subscribe_to(EventFilter::execution(mine));

        bus.publish(started(Uuid::now_v7()));
        bus.publish(node_done(mine, "a"));

        let event = sub.try_recv().unwrap();
        assert_eq!(event.execution_id(), mine);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn topic_filter_matches_prefixes() {
        let bus = EventBus::new(16);
        let id = Uuid::now_v7();
        let mut nodes = bus.subscribe_to(EventFilter::all().topic("workflow.node."));

        bus.publish(started(id));
        bus.publish(node_done(id, "a"));
        bus.publish(WorkflowEvent::ExecutionCancelled { execution_id: id });

        assert!(matches!(nodes.try_recv(), Some(WorkflowEvent::NodeCompleted { .. })));
        assert!(nodes.try_recv().is_none());
    }

    #[test]
    fn lagging_subscription_counts_missed_events() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        for _ in 0..10 {
            bus.publish(WorkflowEvent::ExecutionCancelled {
                execution_id: Uuid::now_v7(),
            });
        }

        let mut seen = 0;
        while sub.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert_eq!(sub.missed(), 6);
    }

    #[tokio::test]
    async fn recv_ends_when_bus_is_dropped() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
