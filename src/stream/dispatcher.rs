//! Fan-out of canonical events to channel subscribers.
//!
//! Workers push events into one inbound queue, tagged with the connection
//! that produced them. A router task hands each event to a per-channel lane
//! task, so delivery is ordered within a channel and independent across
//! channels. A subscription only sees events from the connection it is bound
//! to. Lanes whose channel has no subscribers and no queued events are
//! reaped.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::stream::channel::{Channel, SubscriptionId};
use crate::stream::event::CanonicalEvent;

/// Subscriber callback. Invoked on the channel's delivery task.
pub type EventCallback = Arc<dyn Fn(CanonicalEvent) + Send + Sync>;

/// Event tagged with the connection that produced it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Dispatch {
    pub(crate) connection: u64,
    pub(crate) event: CanonicalEvent,
}

/// Producer side of the dispatcher queue, held by connection workers.
#[derive(Clone, Debug)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<Dispatch>,
    connection: u64,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Dispatch>) -> Self {
        Self { tx, connection: 0 }
    }

    /// A sink whose events are attributed to `connection`.
    pub(crate) fn bound_to(&self, connection: u64) -> Self {
        Self {
            tx: self.tx.clone(),
            connection,
        }
    }

    pub(crate) fn send(&self, event: CanonicalEvent) {
        let dispatch = Dispatch {
            connection: self.connection,
            event,
        };
        if self.tx.send(dispatch).is_err() {
            debug!(event = "dispatcher_queue_closed");
        }
    }
}

/// Connection currently serving a subscription. Zero while unbound.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionBinding(Arc<AtomicU64>);

impl ConnectionBinding {
    pub(crate) fn bind(&self, connection: u64) {
        self.0.store(connection, Ordering::SeqCst);
    }

    pub(crate) fn connection(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    binding: ConnectionBinding,
    callback: EventCallback,
}

struct Registration {
    channel: Channel,
    active: Arc<AtomicBool>,
    binding: ConnectionBinding,
}

#[derive(Default)]
struct Registry {
    by_channel: DashMap<Channel, Vec<Subscriber>>,
    by_id: DashMap<SubscriptionId, Registration>,
    next_id: AtomicU64,
}

impl Registry {
    fn snapshot(&self, channel: &Channel) -> Vec<Subscriber> {
        self.by_channel
            .get(channel)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn is_idle(&self, channel: &Channel) -> bool {
        !self.by_channel.contains_key(channel)
    }

    /// Drops the given subscriptions after a terminal event.
    fn end(&self, channel: &Channel, ended: &[SubscriptionId]) {
        for id in ended {
            if let Some((_, registration)) = self.by_id.remove(id) {
                registration.active.store(false, Ordering::SeqCst);
            }
        }
        self.by_channel
            .remove_if_mut(channel, |_, subscribers| {
                subscribers.retain(|subscriber| !ended.contains(&subscriber.id));
                subscribers.is_empty()
            });
    }
}

pub(crate) struct Dispatcher {
    registry: Arc<Registry>,
    sink: EventSink,
    reap: mpsc::UnboundedSender<Channel>,
    #[cfg(test)]
    live_lanes: Arc<AtomicUsize>,
    router: JoinHandle<()>,
}

impl Dispatcher {
    pub(crate) fn spawn() -> Self {
        let registry = Arc::new(Registry::default());
        let live_lanes = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        let router = Router {
            registry: Arc::clone(&registry),
            lanes: HashMap::new(),
            reap: reap_tx.clone(),
            live_lanes: Arc::clone(&live_lanes),
        };
        let router = tokio::spawn(router.run(rx, reap_rx));
        Self {
            registry,
            sink: EventSink::new(tx),
            reap: reap_tx,
            #[cfg(test)]
            live_lanes,
            router,
        }
    }

    pub(crate) fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Registers an unbound subscription. Its binding decides which
    /// connection's events it receives.
    pub(crate) fn register(
        &self,
        channel: Channel,
        callback: EventCallback,
    ) -> (SubscriptionId, ConnectionBinding) {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let active = Arc::new(AtomicBool::new(true));
        let binding = ConnectionBinding::default();
        self.registry.by_id.insert(
            id,
            Registration {
                channel: channel.clone(),
                active: Arc::clone(&active),
                binding: binding.clone(),
            },
        );
        self.registry
            .by_channel
            .entry(channel)
            .or_default()
            .push(Subscriber {
                id,
                active,
                binding: binding.clone(),
                callback,
            });
        (id, binding)
    }

    /// Removes a subscription and returns its channel and bound connection.
    /// No event is delivered to it afterwards; a callback already running is
    /// allowed to finish.
    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<(Channel, u64)> {
        let (_, registration) = self.registry.by_id.remove(&id)?;
        registration.active.store(false, Ordering::SeqCst);
        self.registry
            .by_channel
            .remove_if_mut(&registration.channel, |_, subscribers| {
                subscribers.retain(|subscriber| subscriber.id != id);
                subscribers.is_empty()
            });
        let _ = self.reap.send(registration.channel.clone());
        Some((registration.channel, registration.binding.connection()))
    }

    #[cfg(test)]
    pub(crate) fn channel_of(&self, id: SubscriptionId) -> Option<Channel> {
        self.registry
            .by_id
            .get(&id)
            .map(|entry| entry.value().channel.clone())
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, channel: &Channel) -> usize {
        self.registry
            .by_channel
            .get(channel)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn live_lanes(&self) -> usize {
        self.live_lanes.load(Ordering::SeqCst)
    }

    /// Deactivates every subscription.
    pub(crate) fn clear(&self) {
        for entry in self.registry.by_id.iter() {
            entry.value().active.store(false, Ordering::SeqCst);
        }
        self.registry.by_id.clear();
        let channels: Vec<Channel> = self
            .registry
            .by_channel
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.registry.by_channel.clear();
        for channel in channels {
            let _ = self.reap.send(channel);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.router.abort();
    }
}

struct Lane {
    tx: mpsc::UnboundedSender<Dispatch>,
    /// Events sent to the lane and not yet delivered.
    pending: Arc<AtomicUsize>,
}

struct Router {
    registry: Arc<Registry>,
    lanes: HashMap<Channel, Lane>,
    reap: mpsc::UnboundedSender<Channel>,
    live_lanes: Arc<AtomicUsize>,
}

impl Router {
    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Dispatch>,
        mut reaps: mpsc::UnboundedReceiver<Channel>,
    ) {
        loop {
            tokio::select! {
                dispatch = inbound.recv() => {
                    let Some(dispatch) = dispatch else {
                        break;
                    };
                    self.route(dispatch);
                }
                Some(channel) = reaps.recv() => self.reap_idle(&channel),
            }
            self.live_lanes.store(self.lanes.len(), Ordering::SeqCst);
        }
    }

    fn route(&mut self, dispatch: Dispatch) {
        let channel = dispatch.event.channel.clone();
        let lane = self
            .lanes
            .entry(channel.clone())
            .or_insert_with(|| spawn_lane(channel.clone(), &self.registry, &self.reap));
        lane.pending.fetch_add(1, Ordering::SeqCst);
        if lane.tx.send(dispatch).is_err() {
            warn!(event = "dispatch_lane_lost", channel = %channel);
            self.lanes.remove(&channel);
        }
    }

    /// Drops a lane once nothing is queued on it and nobody listens.
    fn reap_idle(&mut self, channel: &Channel) {
        let idle = self.lanes.get(channel).is_some_and(|lane| {
            lane.pending.load(Ordering::SeqCst) == 0 && self.registry.is_idle(channel)
        });
        if idle {
            self.lanes.remove(channel);
            debug!(event = "dispatch_lane_reaped", channel = %channel);
        }
    }
}

fn spawn_lane(
    channel: Channel,
    registry: &Arc<Registry>,
    reap: &mpsc::UnboundedSender<Channel>,
) -> Lane {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    tokio::spawn(deliver(
        channel,
        rx,
        Arc::clone(registry),
        Arc::clone(&pending),
        reap.clone(),
    ));
    Lane { tx, pending }
}

/// Delivers one channel's events in order.
async fn deliver(
    channel: Channel,
    mut events: mpsc::UnboundedReceiver<Dispatch>,
    registry: Arc<Registry>,
    pending: Arc<AtomicUsize>,
    reap: mpsc::UnboundedSender<Channel>,
) {
    while let Some(dispatch) = events.recv().await {
        deliver_one(&channel, &registry, dispatch);
        if pending.fetch_sub(1, Ordering::SeqCst) == 1 && registry.is_idle(&channel) {
            let _ = reap.send(channel.clone());
        }
    }
}

fn deliver_one(channel: &Channel, registry: &Registry, dispatch: Dispatch) {
    let Dispatch { connection, event } = dispatch;
    let subscribers: Vec<Subscriber> = registry
        .snapshot(channel)
        .into_iter()
        .filter(|subscriber| subscriber.binding.connection() == connection)
        .collect();

    for subscriber in &subscribers {
        if !subscriber.active.load(Ordering::SeqCst) {
            continue;
        }
        let callback = Arc::clone(&subscriber.callback);
        let delivered = event.clone();
        if catch_unwind(AssertUnwindSafe(move || callback(delivered))).is_err() {
            warn!(
                event = "subscriber_callback_panicked",
                channel = %channel,
                subscription = %subscriber.id
            );
        }
    }

    if event.is_terminal() {
        let ended: Vec<_> = subscribers.iter().map(|subscriber| subscriber.id).collect();
        registry.end(channel, &ended);
        debug!(
            event = "channel_subscriptions_ended",
            channel = %channel,
            connection_id = connection,
            subscriptions = ended.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc as std_mpsc, Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use super::{Dispatcher, EventCallback, EventSink};
    use crate::stream::channel::{Channel, SubscriptionId};
    use crate::stream::event::{CanonicalEvent, EventType};

    const CONNECTION: u64 = 7;

    fn recorder() -> (EventCallback, Arc<Mutex<Vec<CanonicalEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: EventCallback = Arc::new(move |event| {
            sink.lock().expect("lock").push(event);
        });
        (callback, seen)
    }

    fn update(channel: &Channel, id: &str) -> CanonicalEvent {
        CanonicalEvent::new(channel.clone(), EventType::Update, json!({ "id": id }))
    }

    fn terminal(channel: &Channel) -> CanonicalEvent {
        CanonicalEvent::new(
            channel.clone(),
            EventType::Error,
            json!({"kind": "auth", "message": "revoked"}),
        )
    }

    fn bound(dispatcher: &Dispatcher, channel: &Channel, callback: EventCallback) -> SubscriptionId {
        let (id, binding) = dispatcher.register(channel.clone(), callback);
        binding.bind(CONNECTION);
        id
    }

    fn sink(dispatcher: &Dispatcher) -> EventSink {
        dispatcher.sink().bound_to(CONNECTION)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn delivers_in_order_to_every_subscriber() {
        let dispatcher = Dispatcher::spawn();
        let channel = Channel::public("m1");
        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();
        bound(&dispatcher, &channel, first);
        bound(&dispatcher, &channel, second);

        let sink = sink(&dispatcher);
        for id in ["1", "2", "3"] {
            sink.send(update(&channel, id));
        }
        settle().await;

        for seen in [first_seen, second_seen] {
            let ids: Vec<_> = seen
                .lock()
                .expect("lock")
                .iter()
                .map(|event| event.payload["id"].clone())
                .collect();
            assert_eq!(ids, vec![json!("1"), json!("2"), json!("3")]);
        }
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_block_others() {
        let dispatcher = Dispatcher::spawn();
        let channel = Channel::user("m1");
        bound(&dispatcher, &channel, Arc::new(|_| panic!("subscriber bug")));
        let (callback, seen) = recorder();
        bound(&dispatcher, &channel, callback);

        sink(&dispatcher).send(update(&channel, "1"));
        sink(&dispatcher).send(update(&channel, "2"));
        settle().await;

        assert_eq!(seen.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn removed_subscriber_receives_nothing_further() {
        let dispatcher = Dispatcher::spawn();
        let channel = Channel::hashtag("m1", "rust");
        let (callback, seen) = recorder();
        let id = bound(&dispatcher, &channel, callback);

        sink(&dispatcher).send(update(&channel, "1"));
        settle().await;
        assert_eq!(dispatcher.remove(id), Some((channel.clone(), CONNECTION)));
        assert_eq!(dispatcher.remove(id), None);
        sink(&dispatcher).send(update(&channel, "2"));
        settle().await;

        assert_eq!(seen.lock().expect("lock").len(), 1);
        assert_eq!(dispatcher.subscriber_count(&channel), 0);
    }

    #[tokio::test]
    async fn terminal_event_ends_channel_subscriptions() {
        let dispatcher = Dispatcher::spawn();
        let channel = Channel::user("m1");
        let other = Channel::public("m1");
        let (callback, seen) = recorder();
        let id = bound(&dispatcher, &channel, callback);
        let (other_callback, other_seen) = recorder();
        bound(&dispatcher, &other, other_callback);

        sink(&dispatcher).send(terminal(&channel));
        sink(&dispatcher).send(update(&other, "5"));
        settle().await;

        assert_eq!(seen.lock().expect("lock").len(), 1);
        assert!(seen.lock().expect("lock")[0].is_terminal());
        assert_eq!(dispatcher.channel_of(id), None);
        assert_eq!(dispatcher.subscriber_count(&channel), 0);
        assert_eq!(other_seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn events_reach_only_subscriptions_bound_to_their_connection() {
        let dispatcher = Dispatcher::spawn();
        let channel = Channel::user("m1");
        let (old_callback, old_seen) = recorder();
        let (old_id, old_binding) = dispatcher.register(channel.clone(), old_callback);
        old_binding.bind(1);
        let (new_callback, new_seen) = recorder();
        let (new_id, new_binding) = dispatcher.register(channel.clone(), new_callback);
        new_binding.bind(2);

        dispatcher.sink().bound_to(1).send(terminal(&channel));
        dispatcher.sink().bound_to(2).send(update(&channel, "9"));
        settle().await;

        assert_eq!(old_seen.lock().expect("lock").len(), 1);
        assert!(old_seen.lock().expect("lock")[0].is_terminal());
        assert_eq!(dispatcher.channel_of(old_id), None);

        let new_seen = new_seen.lock().expect("lock");
        assert_eq!(new_seen.len(), 1);
        assert_eq!(new_seen[0].event_type, EventType::Update);
        assert_eq!(dispatcher.channel_of(new_id), Some(channel));
    }

    #[tokio::test]
    async fn lanes_are_reaped_once_channel_has_no_subscribers() {
        let dispatcher = Dispatcher::spawn();
        let tag = Channel::hashtag("m1", "rust");
        let user = Channel::user("m1");
        let (callback, _) = recorder();
        let tag_id = bound(&dispatcher, &tag, callback);
        let (callback, user_seen) = recorder();
        bound(&dispatcher, &user, callback);

        sink(&dispatcher).send(update(&tag, "1"));
        sink(&dispatcher).send(update(&user, "2"));
        settle().await;
        assert_eq!(dispatcher.live_lanes(), 2);

        dispatcher.remove(tag_id);
        settle().await;
        assert_eq!(dispatcher.live_lanes(), 1);

        sink(&dispatcher).send(terminal(&user));
        settle().await;
        assert_eq!(dispatcher.live_lanes(), 0);
        assert_eq!(user_seen.lock().expect("lock").len(), 2);

        let (callback, seen) = recorder();
        bound(&dispatcher, &tag, callback);
        sink(&dispatcher).send(update(&tag, "3"));
        settle().await;
        assert_eq!(dispatcher.live_lanes(), 1);
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsubscribe_during_callback_lets_it_finish_and_stops_delivery() {
        let dispatcher = Dispatcher::spawn();
        let channel = Channel::public("m1");
        let (started_tx, started_rx) = std_mpsc::channel::<()>();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);
        let finished = Arc::new(Mutex::new(Vec::new()));
        let finished_by_callback = Arc::clone(&finished);
        let id = bound(
            &dispatcher,
            &channel,
            Arc::new(move |event: CanonicalEvent| {
                let _ = started_tx.lock().expect("lock").send(());
                let _ = release_rx
                    .lock()
                    .expect("lock")
                    .recv_timeout(Duration::from_secs(5));
                finished_by_callback
                    .lock()
                    .expect("lock")
                    .push(event.payload["id"].clone());
            }),
        );

        sink(&dispatcher).send(update(&channel, "1"));
        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .expect("join")
            .expect("callback started");

        assert!(dispatcher.remove(id).is_some());
        sink(&dispatcher).send(update(&channel, "2"));
        release_tx.send(()).expect("release");
        settle().await;

        assert_eq!(*finished.lock().expect("lock"), vec![json!("1")]);
    }
}
