//! Per-world log fan-out.
//!
//! Each world owns one [`LogHub`]. The world's monitor task is the only
//! publisher; any number of [`LogSubscription`]s read from it. Publishing and
//! subscribing take the same lock, so a new subscriber's tail and its live
//! stream meet without gaps or duplicates.

mod buffer;
mod classifier;
mod event;

pub use buffer::LogBuffer;
pub use classifier::{Milestone, StatusClassifier, SubstringClassifier};
pub use event::{LogEvent, StreamTag};

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast;

use crate::metrics;

/// Capacity of the live channel. Subscribers further behind than this lag.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum HubMessage {
    Log(LogEvent),
    Closed(LogEvent),
}

#[derive(Debug)]
struct HubState {
    buffer: LogBuffer,
    open: bool,
}

/// Bounded log buffer plus live fan-out for one world.
#[derive(Debug)]
pub struct LogHub {
    state: Mutex<HubState>,
    sender: broadcast::Sender<HubMessage>,
}

impl LogHub {
    /// Create a closed hub keeping `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(HubState {
                buffer: LogBuffer::new(capacity),
                open: false,
            }),
            sender,
        }
    }

    /// Mark the world live again after a (re)start.
    pub fn open(&self) {
        self.state.lock().open = true;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Append an event to the buffer and deliver it to every subscriber.
    pub fn publish(&self, event: LogEvent) {
        let mut state = self.state.lock();
        state.buffer.push(event.clone());
        // No receivers is not an error.
        let _ = self.sender.send(HubMessage::Log(event));
    }

    /// Emit a terminal event and release all current subscribers.
    ///
    /// Closing an already closed hub does nothing.
    pub fn close(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if !state.open {
            return;
        }
        state.open = false;
        let event = LogEvent::info(reason);
        state.buffer.push(event.clone());
        let _ = self.sender.send(HubMessage::Closed(event));
    }

    /// Release every subscriber, including those waiting for a run that has
    /// not started yet. The hub stays usable and reopens on the next start.
    pub fn release(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        let event = LogEvent::info(reason);
        if state.open {
            state.open = false;
            state.buffer.push(event.clone());
        }
        let _ = self.sender.send(HubMessage::Closed(event));
    }

    /// The most recent `n` buffered events, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEvent> {
        self.state.lock().buffer.tail(n)
    }

    /// Register a subscriber that first receives the last `tail` events.
    ///
    /// Subscribing to a closed hub yields the tail followed by a terminal
    /// event.
    pub fn subscribe(&self, tail: usize) -> LogSubscription {
        let state = self.state.lock();
        let backlog: VecDeque<LogEvent> = state.buffer.tail(tail).into();
        let receiver = self.sender.subscribe();
        let open = state.open;
        drop(state);

        metrics::subscriber_added();
        LogSubscription {
            backlog,
            receiver,
            pending_close: (!open).then(|| LogEvent::info("world is not running")),
            finished: false,
        }
    }

    /// Register a subscriber for events published from now on only.
    ///
    /// Used ahead of a start so the subscriber sees the whole new run even
    /// while the hub is still closed.
    pub fn subscribe_upcoming(&self) -> LogSubscription {
        let receiver = {
            let _state = self.state.lock();
            self.sender.subscribe()
        };

        metrics::subscriber_added();
        LogSubscription {
            backlog: VecDeque::new(),
            receiver,
            pending_close: None,
            finished: false,
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// What a subscriber receives next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(LogEvent),
    /// The subscriber fell behind and missed this many events.
    Lagged(u64),
    /// The world stopped; no more events follow.
    Closed(LogEvent),
}

/// A live, independently cancellable log subscriber. Dropping it cancels.
#[derive(Debug)]
pub struct LogSubscription {
    backlog: VecDeque<LogEvent>,
    receiver: broadcast::Receiver<HubMessage>,
    pending_close: Option<LogEvent>,
    finished: bool,
}

impl LogSubscription {
    /// Wait for the next delivery. Returns `None` once the stream ended.
    pub async fn next(&mut self) -> Option<Delivery> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(Delivery::Event(event));
        }
        if self.finished {
            return None;
        }
        if let Some(event) = self.pending_close.take() {
            self.finished = true;
            return Some(Delivery::Closed(event));
        }

        match self.receiver.recv().await {
            Ok(HubMessage::Log(event)) => Some(Delivery::Event(event)),
            Ok(HubMessage::Closed(event)) => {
                self.finished = true;
                Some(Delivery::Closed(event))
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(Delivery::Lagged(missed)),
            Err(broadcast::error::RecvError::Closed) => {
                self.finished = true;
                None
            },
        }
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        metrics::subscriber_removed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(text: &str) -> LogEvent {
        LogEvent::new(StreamTag::Stdout, text)
    }

    async fn text_of(sub: &mut LogSubscription) -> String {
        match sub.next().await {
            Some(Delivery::Event(e) | Delivery::Closed(e)) => e.text,
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tail_then_live() {
        let hub = LogHub::new(100);
        hub.open();
        hub.publish(stdout("one"));
        hub.publish(stdout("two"));
        hub.publish(stdout("three"));

        let mut sub = hub.subscribe(2);
        hub.publish(stdout("four"));

        assert_eq!(text_of(&mut sub).await, "two");
        assert_eq!(text_of(&mut sub).await, "three");
        assert_eq!(text_of(&mut sub).await, "four");
    }

    #[tokio::test]
    async fn test_close_releases_subscribers() {
        let hub = LogHub::new(100);
        hub.open();
        let mut sub = hub.subscribe(0);
        hub.close("world stopped");

        assert!(matches!(sub.next().await, Some(Delivery::Closed(_))));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_to_closed_hub() {
        let hub = LogHub::new(100);
        hub.publish(stdout("old"));

        let mut sub = hub.subscribe(10);
        assert_eq!(text_of(&mut sub).await, "old");
        assert!(matches!(sub.next().await, Some(Delivery::Closed(_))));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscriber_is_local() {
        let hub = LogHub::new(100);
        hub.open();
        let first = hub.subscribe(0);
        let mut second = hub.subscribe(0);
        assert_eq!(hub.subscriber_count(), 2);

        drop(first);
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish(stdout("still here"));
        assert_eq!(text_of(&mut second).await, "still here");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let hub = LogHub::new(10);
        hub.open();
        let mut sub = hub.subscribe(0);
        for i in 0..(CHANNEL_CAPACITY + 5) {
            hub.publish(stdout(&format!("line {i}")));
        }

        assert_eq!(sub.next().await, Some(Delivery::Lagged(5)));
        assert_eq!(text_of(&mut sub).await, "line 5");
    }

    #[tokio::test]
    async fn test_upcoming_skips_history_and_closed_state() {
        let hub = LogHub::new(100);
        hub.publish(stdout("previous run"));

        let mut sub = hub.subscribe_upcoming();
        hub.open();
        hub.publish(stdout("new run"));

        assert_eq!(text_of(&mut sub).await, "new run");
    }

    #[tokio::test]
    async fn test_release_ends_open_and_upcoming_subscribers() {
        let hub = LogHub::new(10);
        let mut upcoming = hub.subscribe_upcoming();
        hub.open();
        let mut live = hub.subscribe(0);

        hub.release("shutting down");

        assert!(matches!(live.next().await, Some(Delivery::Closed(_))));
        assert!(live.next().await.is_none());
        assert!(matches!(upcoming.next().await, Some(Delivery::Closed(_))));
        assert!(!hub.is_open());
        assert_eq!(hub.tail(10).len(), 1);
    }

    #[tokio::test]
    async fn test_release_of_closed_hub_still_ends_upcoming() {
        let hub = LogHub::new(10);
        let mut upcoming = hub.subscribe_upcoming();

        hub.release("shutting down");

        assert!(matches!(upcoming.next().await, Some(Delivery::Closed(_))));
        assert!(hub.tail(10).is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let hub = LogHub::new(10);
        hub.open();
        hub.close("stopped");
        hub.close("stopped again");
        assert_eq!(hub.tail(10).len(), 1);
        assert!(!hub.is_open());
    }
}
