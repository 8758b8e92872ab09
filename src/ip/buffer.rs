//! Holding area for messages read from a shared TCP connection that belong to another session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::ServerId;

/// Key of one logical session: the tool side (client) and the ECU side (server).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BufferIdentifier {
    pub client_bus: u8,
    pub client_node: u8,
    pub server_bus: u8,
    pub server_node: u8,
}

impl BufferIdentifier {
    pub fn new(client: ServerId, server: ServerId) -> Self {
        Self {
            client_bus: client.bus,
            client_node: client.node,
            server_bus: server.bus,
            server_node: server.node,
        }
    }
}

/// FIFO queue per session key, shared by every dispatcher and session that was handed a clone.
/// Queues are created on first use and live as long as the buffer.
#[derive(Debug, Clone, Default)]
pub struct RoutingBuffer {
    queues: Arc<Mutex<HashMap<BufferIdentifier, VecDeque<Vec<u8>>>>>,
}

impl RoutingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: BufferIdentifier, message: Vec<u8>) {
        self.queues.lock().entry(id).or_default().push_back(message);
    }

    /// Oldest message queued for `id`, if any.
    pub fn pop(&self, id: &BufferIdentifier) -> Option<Vec<u8>> {
        self.queues.lock().get_mut(id)?.pop_front()
    }

    pub fn len(&self, id: &BufferIdentifier) -> usize {
        self.queues.lock().get(id).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self, id: &BufferIdentifier) -> bool {
        self.len(id) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(node: u8) -> BufferIdentifier {
        BufferIdentifier::new(ServerId { bus: 0, node: 126 }, ServerId { bus: 1, node })
    }

    #[test]
    fn fifo_per_key() {
        let buffer = RoutingBuffer::new();
        buffer.push(key(5), vec![1]);
        buffer.push(key(6), vec![9]);
        buffer.push(key(5), vec![2]);
        buffer.push(key(5), vec![3]);

        assert_eq!(buffer.pop(&key(5)), Some(vec![1]));
        assert_eq!(buffer.pop(&key(5)), Some(vec![2]));
        assert_eq!(buffer.pop(&key(5)), Some(vec![3]));
        assert_eq!(buffer.pop(&key(5)), None);
        assert_eq!(buffer.len(&key(6)), 1);
    }

    #[test]
    fn clones_share_queues() {
        let buffer = RoutingBuffer::new();
        let other = buffer.clone();
        buffer.push(key(5), vec![1]);
        assert_eq!(other.pop(&key(5)), Some(vec![1]));
        assert!(buffer.is_empty(&key(5)));
    }
}
