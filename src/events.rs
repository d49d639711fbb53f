//! Stream notifications delivered to subscribers over `smol` channels.

use crate::resolution::SubImageRequest;
use parking_lot::Mutex;
use smol::channel::{self, Receiver, Sender};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The renderer put a tile on screen.
    TileAccepted { request: SubImageRequest, coverage: f32 },
    /// Retries for a frame were exhausted; the previous image stays up.
    FrameUnavailable { frame: usize, reason: String },
    /// A frame's data was malformed. Reported once per frame.
    DecodeFailed { frame: usize, reason: String },
    /// Last event on every channel.
    Abolished,
}

/// Handle returned by [`EventHub::subscribe`].
pub struct Subscription {
    pub id: u64,
    pub events: Receiver<StreamEvent>,
}

struct Subscribers {
    next_id: u64,
    senders: Vec<(u64, Sender<StreamEvent>)>,
    closed: bool,
}

/// Fans events out to subscribers in registration order.
pub struct EventHub {
    inner: Mutex<Subscribers>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Subscribers {
                next_id: 0,
                senders: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Registers a new subscriber. After [`EventHub::close`] the returned
    /// channel is already closed.
    pub fn subscribe(&self) -> Subscription {
        let (sender, events) = channel::unbounded();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.senders.push((id, sender));
        }
        Subscription { id, events }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.senders.len();
        inner.senders.retain(|(sid, _)| *sid != id);
        inner.senders.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().senders.len()
    }

    pub fn emit(&self, event: StreamEvent) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        log::debug!("Event: {:?}", event);
        // Receivers that were dropped are unsubscribed implicitly.
        inner
            .senders
            .retain(|(_, sender)| sender.try_send(event.clone()).is_ok());
    }

    /// Sends [`StreamEvent::Abolished`] and closes every channel.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for (_, sender) in inner.senders.drain(..) {
            let _ = sender.try_send(StreamEvent::Abolished);
            sender.close();
        }
    }
}
