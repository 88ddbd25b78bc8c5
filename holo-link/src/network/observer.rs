//! Observer interface between transports and the node

use std::net::SocketAddr;
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::error::LinkError;
use crate::network::stream::StreamHandle;
use crate::types::SessionId;

/// Identifies which channel an observer notification comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    /// Client-side stream connection to the server
    StreamClient,
    /// Server-side stream listener
    StreamListener,
    /// Server-side accepted stream connection
    StreamSession(SessionId),
    /// Datagram listener (one per node)
    DatagramListener,
    /// Datagram sender, tied to a session on the server
    DatagramSender(Option<SessionId>),
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelId::StreamClient => write!(f, "stream client"),
            ChannelId::StreamListener => write!(f, "stream listener"),
            ChannelId::StreamSession(session) => write!(f, "stream session {}", session),
            ChannelId::DatagramListener => write!(f, "datagram listener"),
            ChannelId::DatagramSender(Some(session)) => write!(f, "datagram sender {}", session),
            ChannelId::DatagramSender(None) => write!(f, "datagram sender"),
        }
    }
}

/// Receives lifecycle and data notifications from transport channels
///
/// Notifications arrive on transport tasks, never on the node's processing
/// context. Implementations must not block.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// Channel reached `Opened`; `local_addr` is the bound local address
    fn on_open(&self, channel: ChannelId, local_addr: Option<SocketAddr>);

    /// Channel failed, either while opening or while open
    fn on_error(&self, channel: ChannelId, error: &LinkError);

    /// Channel left `Opened`; fires at most once per channel
    fn on_close(&self, channel: ChannelId);

    /// One envelope arrived; `from` is the sender for datagrams
    fn on_event(&self, channel: ChannelId, envelope: Envelope, from: Option<SocketAddr>);

    /// Stream listener accepted a connection
    fn on_accept(&self, _session: SessionId, _peer: SocketAddr, _handle: StreamHandle) {}
}

/// Shared observer handed to every channel of a node
pub type SharedObserver = Arc<dyn ConnectionObserver>;

/// Observer notification captured for later processing
#[derive(Debug)]
pub enum TransportEvent {
    Opened {
        channel: ChannelId,
        local_addr: Option<SocketAddr>,
    },
    Error {
        channel: ChannelId,
        error: String,
    },
    Closed {
        channel: ChannelId,
    },
    Received {
        channel: ChannelId,
        envelope: Envelope,
        from: Option<SocketAddr>,
    },
    Accepted {
        session: SessionId,
        peer: SocketAddr,
        handle: StreamHandle,
    },
}

/// Observer that queues every notification into a `flume` channel
///
/// The node drains the receiving end from its `step()` loop, so all state
/// changes happen on a single context.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: flume::Sender<TransportEvent>,
}

impl Mailbox {
    /// Create a mailbox and the receiver that drains it
    pub fn new() -> (Self, flume::Receiver<TransportEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    fn push(&self, event: TransportEvent) {
        // The node has gone away; nothing left to notify
        if self.tx.send(event).is_err() {
            tracing::trace!("Mailbox receiver dropped, discarding transport event");
        }
    }
}

impl ConnectionObserver for Mailbox {
    fn on_open(&self, channel: ChannelId, local_addr: Option<SocketAddr>) {
        self.push(TransportEvent::Opened { channel, local_addr });
    }

    fn on_error(&self, channel: ChannelId, error: &LinkError) {
        self.push(TransportEvent::Error {
            channel,
            error: error.to_string(),
        });
    }

    fn on_close(&self, channel: ChannelId) {
        self.push(TransportEvent::Closed { channel });
    }

    fn on_event(&self, channel: ChannelId, envelope: Envelope, from: Option<SocketAddr>) {
        self.push(TransportEvent::Received {
            channel,
            envelope,
            from,
        });
    }

    fn on_accept(&self, session: SessionId, peer: SocketAddr, handle: StreamHandle) {
        self.push(TransportEvent::Accepted {
            session,
            peer,
            handle,
        });
    }
}
