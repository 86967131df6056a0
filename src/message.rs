//! The message queue: asynchronous notifications a client polls instead of
//! blocking on a trace. A collection cycle's stats arrive as a queue of
//! discrete, `Instant`-timestamped events rather than a live struct, since
//! the client here polls rather than reads in place.

use std::time::Instant;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum MessageKind {
    FinalizationPosted,
    GcStart,
    GcEnd,
}

#[derive(Clone, Debug)]
pub enum Message {
    FinalizationPosted { obj: crate::addr::Addr },
    GcStart { timestamp: Instant, reason: String },
    GcEnd { timestamp: Instant, start_reason: String, condemned: usize, live: usize },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::FinalizationPosted { .. } => MessageKind::FinalizationPosted,
            Message::GcStart { .. } => MessageKind::GcStart,
            Message::GcEnd { .. } => MessageKind::GcEnd,
        }
    }
}

pub struct MessageQueue {
    enabled: [bool; 3],
    queue: Vec<Message>,
}

fn kind_index(kind: MessageKind) -> usize {
    match kind {
        MessageKind::FinalizationPosted => 0,
        MessageKind::GcStart => 1,
        MessageKind::GcEnd => 2,
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        MessageQueue { enabled: [false; 3], queue: Vec::new() }
    }

    pub fn set_enabled(&mut self, kind: MessageKind, enabled: bool) {
        self.enabled[kind_index(kind)] = enabled;
    }

    pub fn is_enabled(&self, kind: MessageKind) -> bool {
        self.enabled[kind_index(kind)]
    }

    /// Post a message; dropped silently if its kind is disabled, matching
    /// the "messages of a disabled type are never queued" rule.
    pub fn post(&mut self, message: Message) {
        if self.is_enabled(message.kind()) {
            self.queue.push(message);
        }
    }

    pub fn poll(&self) -> Option<&Message> {
        self.queue.first()
    }

    pub fn get(&mut self) -> Option<Message> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.queue.remove(0))
        }
    }

    pub fn discard(&mut self) {
        if !self.queue.is_empty() {
            self.queue.remove(0);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
