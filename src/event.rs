//! Event-driven communication between services.

use anyhow::Result;
use tokio::sync::broadcast;

/// Application events.
///
/// Events are published through the EventBus and consumed by interested services.
#[derive(Debug, Clone)]
pub enum Event {
    /// A fan controller returned and will not be restarted.
    FanControllerExited {
        fan: String,
        /// Error message when the controller failed.
        error: Option<String>,
    },
    SystemShutdown,
}

/// Event bus for publish-subscribe messaging between services.
///
/// # Example
///
/// ```no_run
/// use fanwarden::event::{Event, EventBus};
///
/// let event_bus = EventBus::new();
/// let mut subscriber = event_bus.subscribe();
///
/// event_bus.publish(Event::SystemShutdown).ok();
///
/// // In async context, receive events:
/// // let event = subscriber.recv().await;
/// ```
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new EventBus with default capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns an error if there are no active subscribers.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    /// Creates a new subscriber receiving every event published afterwards.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
