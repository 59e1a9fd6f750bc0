use std::sync::Arc;

use tokio::sync::broadcast;

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

/// In-memory broadcast bus backing the engine's observer stream.
///
/// Events are delivered in emit order to every subscriber; a subscriber that
/// lags past the channel capacity observes a `Lagged` gap rather than
/// blocking the engine. An event emitted with no subscribers attached is
/// dropped, not an error.
pub struct InMemoryBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_subscriber_in_order() {
        let bus: Arc<InMemoryBus<u32>> = InMemoryBus::new(16);
        let mut rx = bus.subscribe();
        for n in 0..4u32 {
            bus.emit(n);
        }
        for n in 0..4u32 {
            assert_eq!(rx.recv().await.unwrap(), n);
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let bus: Arc<InMemoryBus<&'static str>> = InMemoryBus::new(4);
        bus.emit("dropped");
        let mut rx = bus.subscribe();
        bus.emit("seen");
        assert_eq!(rx.recv().await.unwrap(), "seen");
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_event() {
        let bus: Arc<InMemoryBus<u32>> = InMemoryBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.emit(9);
        assert_eq!(first.recv().await.unwrap(), 9);
        assert_eq!(second.recv().await.unwrap(), 9);
    }
}
