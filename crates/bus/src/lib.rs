//! In-process typed pub/sub for Switchboard.
//!
//! The bus owns nothing — it fans published events out to subscribers.
//! Each subscriber has its own queue, so events destined for one subscriber
//! arrive in publish order and a subscriber doing slow I/O never delays the
//! others. Handler errors are caught and logged; they never propagate to the
//! publisher. The bus applies no backpressure: bounded (channel) subscribers
//! that fall behind are dropped, which is the SSE adapter's disconnect
//! policy, not the bus's.

pub mod event;

pub use event::{Event, EventKind, EventMetadata, EventPayload};

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a subscriber wants to see. `kinds: None` means every kind;
/// `session_id: Some(..)` restricts to events tagged with exactly that
/// session (unscoped events are not delivered to scoped subscribers).
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub kinds: Option<Vec<EventKind>>,
    pub session_id: Option<String>,
}

impl Filter {
    pub fn kinds(kinds: &[EventKind]) -> Self {
        Self {
            kinds: Some(kinds.to_vec()),
            session_id: None,
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            kinds: None,
            session_id: Some(session_id.into()),
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if event.session_id() != Some(session_id.as_str()) {
                return false;
            }
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Queue {
    Unbounded(mpsc::UnboundedSender<Event>),
    Bounded(mpsc::Sender<Event>),
}

struct Subscriber {
    id: u64,
    filter: Filter,
    queue: Queue,
    /// Set for `once` subscriptions; the swap makes consumption atomic so
    /// exactly one event is ever delivered, even under concurrent publishes.
    once: Option<Arc<AtomicBool>>,
}

pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish an event: construct the record, dispatch to every matching
    /// subscriber queue, and return the published event. Handlers for this
    /// event are queued (started) before `publish` returns.
    pub fn publish(&self, payload: EventPayload, metadata: EventMetadata) -> Event {
        let event = Event::new(payload, metadata);

        let mut remove = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                if !sub.filter.matches(&event) {
                    continue;
                }
                if let Some(flag) = &sub.once {
                    // Claim the one delivery; losers skip.
                    if flag.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                }
                let delivered = match &sub.queue {
                    Queue::Unbounded(tx) => tx.send(event.clone()).is_ok(),
                    Queue::Bounded(tx) => match tx.try_send(event.clone()) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(
                                subscriber = sub.id,
                                kind = %event.kind(),
                                "subscriber queue full, dropping subscriber"
                            );
                            false
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    },
                };
                if !delivered || sub.once.is_some() {
                    remove.push(sub.id);
                }
            }
        }
        if !remove.is_empty() {
            self.subscribers
                .write()
                .retain(|s| !remove.contains(&s.id));
        }
        event
    }

    // ── Handler subscriptions ───────────────────────────────────────

    /// Subscribe a handler to one or more event kinds.
    pub fn subscribe<F, Fut>(self: &Arc<Self>, kinds: &[EventKind], handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = sb_domain::Result<()>> + Send + 'static,
    {
        self.subscribe_filtered(Filter::kinds(kinds), handler, false)
    }

    /// Subscribe a handler to kinds within one session's scope.
    pub fn subscribe_session<F, Fut>(
        self: &Arc<Self>,
        kinds: Option<&[EventKind]>,
        session_id: &str,
        handler: F,
    ) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = sb_domain::Result<()>> + Send + 'static,
    {
        let filter = Filter {
            kinds: kinds.map(<[EventKind]>::to_vec),
            session_id: Some(session_id.to_owned()),
        };
        self.subscribe_filtered(filter, handler, false)
    }

    /// Subscribe a handler to every event.
    pub fn subscribe_all<F, Fut>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = sb_domain::Result<()>> + Send + 'static,
    {
        self.subscribe_filtered(Filter::default(), handler, false)
    }

    /// Subscribe a handler that fires for exactly one matching event. The
    /// subscription is consumed at publish time, so publishing a burst of
    /// matching events still yields a single invocation.
    pub fn once<F, Fut>(self: &Arc<Self>, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = sb_domain::Result<()>> + Send + 'static,
    {
        self.subscribe_filtered(Filter::kinds(&[kind]), handler, true)
    }

    fn subscribe_filtered<F, Fut>(
        self: &Arc<Self>,
        filter: Filter,
        handler: F,
        once: bool,
    ) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = sb_domain::Result<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let id = self.register(filter, Queue::Unbounded(tx), once);

        // Per-subscriber drain task: handlers that suspend never block other
        // subscribers, and their errors stop with a log line.
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.kind();
                if let Err(e) = handler(event).await {
                    tracing::warn!(subscriber = id, kind = %kind, error = %e, "event handler failed");
                }
            }
        });

        Subscription {
            id,
            bus: self.clone(),
        }
    }

    // ── Channel subscriptions (SSE adapter) ─────────────────────────

    /// Subscribe with a bounded queue, receiving raw events. When the queue
    /// overflows the subscription is dropped and the receiver ends — the SSE
    /// adapter treats that as "client too slow, disconnect".
    pub fn subscribe_channel(
        self: &Arc<Self>,
        filter: Filter,
        capacity: usize,
    ) -> (Subscription, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.register(filter, Queue::Bounded(tx), false);
        (
            Subscription {
                id,
                bus: self.clone(),
            },
            rx,
        )
    }

    fn register(&self, filter: Filter, queue: Queue, once: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber {
            id,
            filter,
            queue,
            once: once.then(|| Arc::new(AtomicBool::new(false))),
        });
        id
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Live subscription handle; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    bus: Arc<EventBus>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn heartbeat() -> EventPayload {
        EventPayload::ServerHeartbeat {}
    }

    fn text(session: &str, delta: &str) -> EventPayload {
        EventPayload::StreamText {
            session_id: session.into(),
            message_id: "msg_1".into(),
            content: delta.into(),
            delta: delta.into(),
        }
    }

    async fn settle() {
        // Let drain tasks run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn kind_subscription_receives_matching_only() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = bus.subscribe(&[EventKind::StreamText], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(text("ses_1", "a"), EventMetadata::default());
        bus.publish(heartbeat(), EventMetadata::default());
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_scope_filters_other_sessions() {
        let bus = Arc::new(EventBus::new());
        let (_sub, mut rx) = bus.subscribe_channel(Filter::session("ses_a"), 16);

        bus.publish(text("ses_a", "mine"), EventMetadata::default());
        bus.publish(text("ses_b", "other"), EventMetadata::default());
        bus.publish(heartbeat(), EventMetadata::default()); // unscoped

        let got = rx.recv().await.unwrap();
        assert_eq!(got.session_id(), Some("ses_a"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscription_to_unknown_session_simply_never_fires() {
        let bus = Arc::new(EventBus::new());
        let (_sub, mut rx) = bus.subscribe_channel(Filter::session("ses_ghost"), 16);
        for _ in 0..20 {
            bus.publish(text("ses_real", "x"), EventMetadata::default());
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_subscriber_delivery_preserves_publish_order() {
        let bus = Arc::new(EventBus::new());
        let (_sub, mut rx) = bus.subscribe_channel(Filter::session("ses_1"), 256);

        for i in 0..100 {
            bus.publish(text("ses_1", &i.to_string()), EventMetadata::default());
        }

        for i in 0..100 {
            let event = rx.recv().await.unwrap();
            match event.payload {
                EventPayload::StreamText { delta, .. } => assert_eq!(delta, i.to_string()),
                _ => panic!("unexpected payload"),
            }
        }
    }

    #[tokio::test]
    async fn once_fires_exactly_once_for_a_burst() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = bus.once(EventKind::StreamText, move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        // 100 matching events before the drain task gets a chance to run.
        for _ in 0..100 {
            bus.publish(text("ses_1", "x"), EventMetadata::default());
        }
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn handler_errors_do_not_disturb_other_subscribers() {
        let bus = Arc::new(EventBus::new());
        let _bad = bus.subscribe(&[EventKind::StreamText], |_| async {
            Err(sb_domain::Error::Other("handler exploded".into()))
        });
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _good = bus.subscribe(&[EventKind::StreamText], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for _ in 0..5 {
            bus.publish(text("ses_1", "x"), EventMetadata::default());
        }
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn slow_bounded_subscriber_is_dropped_fast_one_unaffected() {
        let bus = Arc::new(EventBus::new());
        let (_fast_sub, mut fast) = bus.subscribe_channel(Filter::session("ses_1"), 256);
        let (_slow_sub, mut slow) = bus.subscribe_channel(Filter::session("ses_1"), 4);

        // Nobody reads while 100 events land.
        for i in 0..100 {
            bus.publish(text("ses_1", &i.to_string()), EventMetadata::default());
        }

        // The fast subscriber sees all 100, in order.
        for i in 0..100 {
            let event = fast.recv().await.unwrap();
            match event.payload {
                EventPayload::StreamText { delta, .. } => assert_eq!(delta, i.to_string()),
                _ => panic!("unexpected payload"),
            }
        }

        // The slow one got its buffered 4, then its stream ends: dropped.
        let mut received = 0;
        while slow.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 4);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let (sub, _rx) = bus.subscribe_channel(Filter::default(), 4);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_session_handler_scopes_by_kind_and_session() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = bus.subscribe_session(
            Some(&[EventKind::StreamText]),
            "ses_a",
            move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        bus.publish(text("ses_a", "mine"), EventMetadata::default());
        bus.publish(text("ses_b", "other session"), EventMetadata::default());
        bus.publish(
            EventPayload::StreamCompleted {
                session_id: "ses_a".into(),
                message_id: "msg_1".into(),
                usage: None,
            },
            EventMetadata::default(),
        ); // right session, wrong kind
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_all_sees_unscoped_events() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = bus.subscribe_all(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(heartbeat(), EventMetadata::default());
        bus.publish(text("ses_1", "x"), EventMetadata::default());
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
