//! Outbound buffering of the relay connection.

use std::collections::VecDeque;

use super::message::SignalMessage;

/// Holds messages while the relay is unreachable.
///
/// On every open the `join` goes out first, then the backlog in order.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<SignalMessage>,
    connected: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns the message if it can go out now, otherwise queues it.
    pub fn send(&mut self, msg: SignalMessage) -> Option<SignalMessage> {
        if self.connected {
            Some(msg)
        } else {
            self.queue.push_back(msg);
            None
        }
    }

    /// Put back a message whose transmission failed, ahead of the backlog.
    pub fn requeue_front(&mut self, msg: SignalMessage) {
        self.queue.push_front(msg);
    }

    /// The connection opened: everything to transmit, in order.
    pub fn on_open(&mut self, join: SignalMessage) -> Vec<SignalMessage> {
        self.connected = true;
        std::iter::once(join).chain(self.queue.drain(..)).collect()
    }

    pub fn on_close(&mut self) {
        self.connected = false;
    }
}
