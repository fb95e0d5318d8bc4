//! Per-session fan-out with backpressure.
//!
//! Uses a tokio broadcast channel for O(1) send to every subscriber. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! messages; a receiver that falls further behind lags (and resyncs) rather
//! than stalling the session.
//!
//! Messages are shared as `Arc<Outbound>`. Dropping the sender's own copy is
//! the receiving side's job, via [`Outbound::is_for`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ClientId, ServerMessage};

/// One message on a session channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Client that must not receive this message (usually its originator).
    pub exclude: Option<ClientId>,
    pub message: ServerMessage,
}

impl Outbound {
    pub fn is_for(&self, client_id: ClientId) -> bool {
        self.exclude != Some(client_id)
    }
}

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub messages_sent: u64,
    /// Sends that found no subscriber.
    pub messages_dropped: u64,
    /// Messages skipped by lagging receivers.
    pub messages_lagged: u64,
    pub receivers: usize,
}

/// Outbound channel of one collaboration session.
pub struct SessionChannel {
    sender: broadcast::Sender<Arc<Outbound>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    messages_lagged: AtomicU64,
}

impl SessionChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Outbound>> {
        self.sender.subscribe()
    }

    /// Send to every subscriber. Returns the number of receivers.
    pub fn send_to_all(&self, message: ServerMessage) -> usize {
        self.send(Outbound { exclude: None, message })
    }

    /// Send to every subscriber except `client_id`.
    pub fn send_except(&self, client_id: ClientId, message: ServerMessage) -> usize {
        self.send(Outbound { exclude: Some(client_id), message })
    }

    fn send(&self, outbound: Outbound) -> usize {
        let kind = outbound.message.kind();
        match self.sender.send(Arc::new(outbound)) {
            Ok(receivers) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                log::debug!("Broadcast {kind} to {receivers} receivers");
                receivers
            }
            Err(_) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Record messages a receiver skipped after lagging.
    pub fn record_lag(&self, skipped: u64) {
        self.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            receivers: self.receiver_count(),
        }
    }
}
