use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

/// An event that can be routed to listeners by its kind.
pub trait Event: Clone + Send + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("listener lagged behind, {0} events dropped")]
    Lagged(u64),
}

pub type BusResult<T> = Result<T, BusError>;

struct Topics<E: Event> {
    by_kind: HashMap<E::Kind, broadcast::Sender<E>>,
    all: Option<broadcast::Sender<E>>,
    closed: bool,
}

/// Typed fan-out bus. Each kind keeps its own broadcast channel so any number
/// of listeners can watch one kind, and every listener is removed on its own
/// by dropping its [`Subscription`].
pub struct EventBus<E: Event> {
    topics: RwLock<Topics<E>>,
    capacity: usize,
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            topics: RwLock::new(Topics {
                by_kind: HashMap::new(),
                all: Some(broadcast::channel(capacity).0),
                closed: false,
            }),
            capacity,
        }
    }

    /// Listen to a single kind of event.
    pub fn subscribe(&self, kind: E::Kind) -> Subscription<E> {
        let mut guard = self.topics.write();
        if guard.closed {
            return Subscription::closed(Some(kind));
        }
        let capacity = self.capacity;
        let rx = guard
            .by_kind
            .entry(kind)
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();
        Subscription {
            rx,
            kind: Some(kind),
        }
    }

    /// Listen to every event published on the bus.
    pub fn subscribe_all(&self) -> Subscription<E> {
        let guard = self.topics.read();
        match guard.all.as_ref() {
            Some(sender) => Subscription {
                rx: sender.subscribe(),
                kind: None,
            },
            None => Subscription::closed(None),
        }
    }

    /// Deliver an event to the listeners of its kind and to catch-all
    /// listeners. Returns the number of listeners reached.
    pub fn publish(&self, event: E) -> usize {
        let guard = self.topics.read();
        if guard.closed {
            return 0;
        }
        let mut delivered = 0;
        if let Some(sender) = guard.by_kind.get(&event.kind()) {
            delivered += sender.send(event.clone()).unwrap_or(0);
        }
        if let Some(all) = guard.all.as_ref() {
            delivered += all.send(event).unwrap_or(0);
        }
        delivered
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        let guard = self.topics.read();
        guard
            .by_kind
            .get(&kind)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop every sender. Listeners drain what is buffered and then observe
    /// [`BusError::Closed`].
    pub fn close(&self) {
        let mut guard = self.topics.write();
        guard.closed = true;
        guard.by_kind.clear();
        guard.all = None;
    }

    pub fn is_closed(&self) -> bool {
        self.topics.read().closed
    }
}

/// A single listener. Dropping it unsubscribes.
pub struct Subscription<E: Event> {
    rx: broadcast::Receiver<E>,
    kind: Option<E::Kind>,
}

impl<E: Event> Subscription<E> {
    fn closed(kind: Option<E::Kind>) -> Self {
        let (_, rx) = broadcast::channel(1);
        Self { rx, kind }
    }

    /// `None` for catch-all listeners.
    pub fn kind(&self) -> Option<E::Kind> {
        self.kind
    }

    pub async fn recv(&mut self) -> BusResult<E> {
        match self.rx.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
        }
    }

    /// Next event, skipping over lag gaps. `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<E> {
        loop {
            match self.recv().await {
                Ok(event) => return Some(event),
                Err(BusError::Lagged(_)) => continue,
                Err(BusError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> BusResult<Option<E>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ping {
        Hello(u32),
        Bye,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum PingKind {
        Hello,
        Bye,
    }

    impl Event for Ping {
        type Kind = PingKind;

        fn kind(&self) -> PingKind {
            match self {
                Ping::Hello(_) => PingKind::Hello,
                Ping::Bye => PingKind::Bye,
            }
        }
    }

    #[tokio::test]
    async fn routes_by_kind() {
        let bus = EventBus::<Ping>::new();
        let mut hello = bus.subscribe(PingKind::Hello);
        let mut bye = bus.subscribe(PingKind::Bye);

        bus.publish(Ping::Hello(1));
        bus.publish(Ping::Bye);

        assert_eq!(hello.recv().await, Ok(Ping::Hello(1)));
        assert_eq!(hello.try_recv(), Ok(None));
        assert_eq!(bye.recv().await, Ok(Ping::Bye));
    }

    #[tokio::test]
    async fn listeners_are_removed_individually() {
        let bus = EventBus::<Ping>::new();
        let first = bus.subscribe(PingKind::Hello);
        let mut second = bus.subscribe(PingKind::Hello);
        assert_eq!(bus.listener_count(PingKind::Hello), 2);

        drop(first);
        assert_eq!(bus.listener_count(PingKind::Hello), 1);

        assert_eq!(bus.publish(Ping::Hello(7)), 1);
        assert_eq!(second.recv().await, Ok(Ping::Hello(7)));
    }

    #[tokio::test]
    async fn catch_all_sees_every_kind() {
        let bus = EventBus::<Ping>::new();
        let mut all = bus.subscribe_all();
        bus.publish(Ping::Hello(2));
        bus.publish(Ping::Bye);
        assert_eq!(all.next().await, Some(Ping::Hello(2)));
        assert_eq!(all.next().await, Some(Ping::Bye));
        assert_eq!(all.kind(), None);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = EventBus::<Ping>::new();
        let mut hello = bus.subscribe(PingKind::Hello);
        bus.publish(Ping::Hello(3));
        bus.close();
        assert_eq!(hello.next().await, Some(Ping::Hello(3)));
        assert_eq!(hello.next().await, None);
        assert_eq!(bus.publish(Ping::Bye), 0);

        let mut late = bus.subscribe(PingKind::Bye);
        assert_eq!(late.recv().await, Err(BusError::Closed));
    }
}
