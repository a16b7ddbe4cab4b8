//! In-process publish/subscribe for captured packets
//!
//! Single producer, many consumers. Each subscriber sees packets in capture
//! order. A subscriber that falls more than `capacity` events behind loses
//! the oldest ones; the loss is counted on its [`Subscription`] and the
//! producer is never blocked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, Stream};
use netwarden_core::PacketInfo;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::trace;

/// Packet event bus
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PacketInfo>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    /// `capacity` is the per-subscriber lag window
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish one packet. Never blocks; with no subscribers the packet is
    /// discarded.
    pub fn publish(&self, packet: PacketInfo) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(packet).is_err() {
            trace!("Packet published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            dropped: 0,
        }
    }

    /// Packets published since creation
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A subscriber handle. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<PacketInfo>,
    dropped: u64,
}

impl Subscription {
    /// Next packet in capture order, or `None` once the bus is gone
    pub async fn next(&mut self) -> Option<PacketInfo> {
        loop {
            match self.receiver.recv().await {
                Ok(packet) => return Some(packet),
                Err(RecvError::Lagged(n)) => self.dropped += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next packet if one is already queued
    pub fn try_next(&mut self) -> Option<PacketInfo> {
        loop {
            match self.receiver.try_recv() {
                Ok(packet) => return Some(packet),
                Err(TryRecvError::Lagged(n)) => self.dropped += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Packets this subscriber lost by lagging behind
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Consume the subscription as a stream of packets
    pub fn into_stream(self) -> impl Stream<Item = PacketInfo> {
        stream::unfold(self, |mut sub| async move {
            let packet = sub.next().await?;
            Some((packet, sub))
        })
    }
}
