//! # Outbound Packet Queue
//!
//! Bounded FIFO between the capture pipeline and the remote transport.
//!
//! ## Key Features:
//! - **Bounded**: never holds more than `capacity` packets, so a stalled
//!   connection cannot grow memory without limit
//! - **Drop-oldest overflow**: when full, the oldest packet is discarded; for
//!   live speech the most recent audio is the most useful
//! - **Single owner**: lives inside the session manager's event loop, no locking

use crate::audio::codec::EncodedPacket;
use std::collections::VecDeque;

pub struct OutboundQueue {
    /// Packets waiting for the transport, oldest first
    packets: VecDeque<EncodedPacket>,

    /// Maximum number of packets kept
    capacity: usize,

    /// Packets discarded because the queue was full
    dropped: u64,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` packets (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append a packet, evicting and returning the oldest one when full.
    pub fn push(&mut self, packet: EncodedPacket) -> Option<EncodedPacket> {
        let evicted = if self.packets.len() >= self.capacity {
            self.dropped += 1;
            self.packets.pop_front()
        } else {
            None
        };

        self.packets.push_back(packet);
        evicted
    }

    /// Take the oldest packet.
    pub fn pop(&mut self) -> Option<EncodedPacket> {
        self.packets.pop_front()
    }

    /// Put a packet back at the head, used when the transport refused it.
    ///
    /// If the queue filled up in the meantime, the returned packet is the
    /// one that did not fit.
    pub fn requeue(&mut self, packet: EncodedPacket) -> Option<EncodedPacket> {
        if self.packets.len() >= self.capacity {
            self.dropped += 1;
            return Some(packet);
        }
        self.packets.push_front(packet);
        None
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total packets dropped by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Discard everything still queued (session ended).
    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_pcm;

    fn packet(marker: i16) -> EncodedPacket {
        encode_pcm(&[marker], 16000)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::new(4);
        queue.push(packet(1));
        queue.push(packet(2));
        assert_eq!(queue.pop(), Some(packet(1)));
        assert_eq!(queue.pop(), Some(packet(2)));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let mut queue = OutboundQueue::new(2);
        assert!(queue.push(packet(1)).is_none());
        assert!(queue.push(packet(2)).is_none());
        assert_eq!(queue.push(packet(3)), Some(packet(1)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop(), Some(packet(2)));
        assert_eq!(queue.pop(), Some(packet(3)));
    }

    #[test]
    fn test_requeue_keeps_head_position() {
        let mut queue = OutboundQueue::new(2);
        queue.push(packet(1));
        queue.push(packet(2));
        let head = queue.pop().unwrap();
        assert!(queue.requeue(head).is_none());
        assert_eq!(queue.pop(), Some(packet(1)));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut queue = OutboundQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(packet(1));
        queue.push(packet(2));
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.is_empty());
    }
}
