//! Best-effort datagram channel over UDP

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};

use tokio::net::UdpSocket;

use crate::envelope::Envelope;
use crate::error::{LinkError, Result};
use crate::network::lifecycle::{ChannelCore, ChannelState};
use crate::network::observer::{ChannelId, SharedObserver};
use crate::node::stats::SharedStats;
use crate::types::SessionId;

/// Largest UDP payload
const MAX_DATAGRAM_LEN: usize = 65_507;

/// Handle to a UDP socket, either receiving (listener) or sending to a
/// fixed target (sender)
#[derive(Clone)]
pub struct DatagramHandle {
    core: Arc<ChannelCore>,
    socket: Arc<OnceLock<Arc<UdpSocket>>>,
    target: Option<SocketAddr>,
    stats: Option<SharedStats>,
}

impl std::fmt::Debug for DatagramHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramHandle")
            .field("channel", &self.core.id)
            .field("state", &self.core.lifecycle.state())
            .field("target", &self.target)
            .finish()
    }
}

impl DatagramHandle {
    fn opening(
        channel: ChannelId,
        observer: SharedObserver,
        target: Option<SocketAddr>,
        stats: Option<SharedStats>,
    ) -> Self {
        Self {
            core: Arc::new(ChannelCore::opening(channel, observer)),
            socket: Arc::new(OnceLock::new()),
            target,
            stats,
        }
    }

    /// Bind a receiving socket without blocking the caller
    ///
    /// `on_open` reports the bound address, which is how callers learn an
    /// ephemeral port. Every decodable datagram is delivered with its sender.
    pub fn listen(addr: SocketAddr, observer: SharedObserver, stats: Option<SharedStats>) -> Self {
        let handle = Self::opening(ChannelId::DatagramListener, observer, None, stats);
        let task = handle.clone();
        handle.core.spawn(async move {
            let socket = match UdpSocket::bind(addr).await {
                Ok(socket) => socket,
                Err(e) => {
                    task.core.fail_open(e.into());
                    return;
                }
            };
            let local = match socket.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    task.core.fail_open(e.into());
                    return;
                }
            };
            let socket = Arc::new(socket);
            let _ = task.socket.set(socket.clone());
            if !task.core.opened(Some(local)) {
                return;
            }
            tracing::debug!("Channel '{}' bound on {}", task.core.id, local);
            task.receive_loop(socket).await;
        });
        handle
    }

    async fn receive_loop(&self, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    if let Some(stats) = &self.stats {
                        stats.record_datagram_in(len);
                    }
                    match Envelope::decode(&buf[..len]) {
                        Ok(envelope) => self.core.observer().on_event(self.core.id, envelope, Some(from)),
                        Err(e) => tracing::debug!(
                            "Channel '{}' discarding datagram from {}: {}",
                            self.core.id,
                            from,
                            e
                        ),
                    }
                }
                // ICMP unreachable from an earlier send surfaces here on some platforms
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    self.core.shutdown(Some(e.into()));
                    break;
                }
            }
        }
    }

    /// Open a socket that sends to `target`, without blocking the caller
    ///
    /// The socket binds an ephemeral local port of the target's address
    /// family and is connected to the target.
    pub fn sender(
        target: SocketAddr,
        observer: SharedObserver,
        session: Option<SessionId>,
        stats: Option<SharedStats>,
    ) -> Self {
        let handle = Self::opening(ChannelId::DatagramSender(session), observer, Some(target), stats);
        let task = handle.clone();
        handle.core.spawn(async move {
            let any: IpAddr = match target {
                SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
                SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
            };
            let opened = async {
                let socket = UdpSocket::bind((any, 0)).await?;
                socket.connect(target).await?;
                let local = socket.local_addr()?;
                Ok::<_, std::io::Error>((socket, local))
            };
            match opened.await {
                Ok((socket, local)) => {
                    let _ = task.socket.set(Arc::new(socket));
                    if task.core.opened(Some(local)) {
                        tracing::debug!("Channel '{}' sending {} -> {}", task.core.id, local, target);
                    }
                }
                Err(e) => task.core.fail_open(e.into()),
            }
        });
        handle
    }

    pub fn channel(&self) -> ChannelId {
        self.core.id
    }

    pub fn state(&self) -> ChannelState {
        self.core.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.core.lifecycle.is_open()
    }

    /// Fixed target of a sender
    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    /// Bound local address, once opened
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.get().and_then(|s| s.local_addr().ok())
    }

    /// Send one envelope as one datagram
    ///
    /// Best effort: a full socket buffer drops the datagram and still
    /// returns `Ok`.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.is_open() {
            return Err(LinkError::ChannelNotOpen(self.channel().to_string()));
        }
        let socket = self
            .socket
            .get()
            .ok_or_else(|| LinkError::ChannelNotOpen(self.channel().to_string()))?;
        let bytes = envelope.encode()?;
        match socket.try_send(&bytes) {
            Ok(len) => {
                if let Some(stats) = &self.stats {
                    stats.record_datagram_out(len);
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(stats) = &self.stats {
                    stats.record_datagram_dropped();
                }
                tracing::trace!("Channel '{}' dropped a datagram", self.core.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn close(&self) {
        self.core.shutdown(None);
    }
}
