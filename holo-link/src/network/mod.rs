//! Network layer for holo-link
//!
//! Two transports run side by side: a framed TCP stream for control traffic
//! and UDP datagrams for transform streaming. Both report to a
//! [`ConnectionObserver`]; the node uses a [`Mailbox`].

pub mod datagram;
pub mod framing;
pub mod lifecycle;
pub mod observer;
pub mod stream;

pub use datagram::DatagramHandle;
pub use lifecycle::{ChannelState, Lifecycle};
pub use observer::{ChannelId, ConnectionObserver, Mailbox, SharedObserver, TransportEvent};
pub use stream::{ListenerHandle, StreamHandle, StreamOptions};
