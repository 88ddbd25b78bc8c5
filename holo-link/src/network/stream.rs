//! Reliable stream channel over TCP

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::envelope::Envelope;
use crate::error::{LinkError, Result};
use crate::network::framing::{encode_frame, read_frame};
use crate::network::lifecycle::{ChannelCore, ChannelState};
use crate::network::observer::{ChannelId, SharedObserver};
use crate::node::stats::SharedStats;
use crate::types::SessionId;

/// Stream options shared by clients and listeners
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Largest accepted incoming frame
    pub max_frame_len: usize,
    /// Traffic counters, if the owner keeps any
    pub stats: Option<SharedStats>,
}

/// How long queued frames may take to go out once the channel is closed
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Work item for the writer task
enum Outgoing {
    Frame(Vec<u8>),
    /// Everything queued before this is written, then the socket shuts down
    Close,
}

struct StreamInner {
    core: ChannelCore,
    frame_tx: flume::Sender<Outgoing>,
    local_addr: OnceLock<SocketAddr>,
    peer_addr: OnceLock<SocketAddr>,
    stats: Option<SharedStats>,
    /// Dropped by the writer when it exits
    writer_done: tokio::sync::watch::Receiver<()>,
}

/// Receiving side of the writer queue, handed to the writer task on open
struct WriterQueue {
    frame_rx: flume::Receiver<Outgoing>,
    done_tx: tokio::sync::watch::Sender<()>,
}

impl StreamInner {
    /// Close the channel; the writer still flushes frames queued before this
    fn shutdown(&self, error: Option<LinkError>) {
        self.core.shutdown(error);
        let _ = self.frame_tx.send(Outgoing::Close);
    }
}

/// Handle to one TCP connection
///
/// Cloning the handle shares the connection. Incoming envelopes are
/// delivered through the observer, outgoing ones are queued to a writer
/// task so that `send` never blocks.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("channel", &self.inner.core.id)
            .field("state", &self.inner.core.lifecycle.state())
            .field("local_addr", &self.inner.local_addr.get())
            .field("peer_addr", &self.inner.peer_addr.get())
            .finish()
    }
}

impl StreamHandle {
    fn opening(
        channel: ChannelId,
        observer: SharedObserver,
        stats: Option<SharedStats>,
    ) -> (Self, WriterQueue) {
        let (frame_tx, frame_rx) = flume::unbounded();
        let (done_tx, writer_done) = tokio::sync::watch::channel(());
        let handle = Self {
            inner: Arc::new(StreamInner {
                core: ChannelCore::opening(channel, observer),
                frame_tx,
                local_addr: OnceLock::new(),
                peer_addr: OnceLock::new(),
                stats,
                writer_done,
            }),
        };
        (handle, WriterQueue { frame_rx, done_tx })
    }

    /// Connect to a server without blocking the caller
    ///
    /// The outcome is reported to the observer: `on_open` with the local
    /// address once connected, or `on_error` if the connection fails.
    pub fn connect(addr: SocketAddr, observer: SharedObserver, options: StreamOptions) -> Self {
        let (handle, queue) =
            Self::opening(ChannelId::StreamClient, observer, options.stats.clone());
        let task_handle = handle.clone();
        handle.inner.core.spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => task_handle.start(stream, queue, options.max_frame_len),
                Err(e) => task_handle.inner.core.fail_open(e.into()),
            }
        });
        handle
    }

    /// Run reader and writer tasks on an established connection
    fn start(&self, stream: TcpStream, queue: WriterQueue, max_frame_len: usize) {
        let core = &self.inner.core;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Channel '{}' could not set TCP_NODELAY: {}", core.id, e);
        }
        let (local, peer) = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(peer)) => (local, peer),
            (Err(e), _) | (_, Err(e)) => {
                core.fail_open(e.into());
                return;
            }
        };
        let _ = self.inner.local_addr.set(local);
        let _ = self.inner.peer_addr.set(peer);

        // on_open is queued before the reader can deliver anything
        if !core.opened(Some(local)) {
            return;
        }
        tracing::debug!("Channel '{}' opened {} -> {}", core.id, local, peer);

        let (mut reader, mut writer) = stream.into_split();

        let inner = self.inner.clone();
        core.spawn(async move {
            loop {
                match read_frame(&mut reader, max_frame_len).await {
                    Ok(Some(body)) => {
                        if let Some(stats) = &inner.stats {
                            stats.record_stream_in(body.len() + 4);
                        }
                        match Envelope::decode(&body) {
                            Ok(envelope) => {
                                inner.core.observer().on_event(inner.core.id, envelope, Some(peer))
                            }
                            Err(e) => tracing::debug!(
                                "Channel '{}' discarding undecodable frame: {}",
                                inner.core.id,
                                e
                            ),
                        }
                    }
                    Ok(None) => {
                        inner.shutdown(None);
                        break;
                    }
                    Err(e) => {
                        inner.shutdown(Some(e));
                        break;
                    }
                }
            }
        });

        // Not owned by the core: a close must not cut off queued frames
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(write_frames(inner, writer, queue));
    }

    /// Channel this handle reports as
    pub fn channel(&self) -> ChannelId {
        self.inner.core.id
    }

    pub fn state(&self) -> ChannelState {
        self.inner.core.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.core.lifecycle.is_open()
    }

    /// Local address of the connection, once opened
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Remote address of the connection, once opened
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr.get().copied()
    }

    /// Queue an envelope for sending
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.is_open() {
            return Err(LinkError::ChannelNotOpen(self.channel().to_string()));
        }
        let frame = encode_frame(envelope)?;
        let len = frame.len();
        self.inner
            .frame_tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| LinkError::ChannelNotOpen(self.channel().to_string()))?;
        if let Some(stats) = &self.inner.stats {
            stats.record_stream_out(len);
        }
        Ok(())
    }

    /// Close the connection
    ///
    /// Frames already accepted by `send` are still written, within
    /// a short linger, before the socket shuts down. The observer sees
    /// `on_close` if the channel was open.
    pub fn close(&self) {
        self.inner.shutdown(None);
    }

    /// Wait until the writer task is gone
    ///
    /// After `close` this resolves once queued frames are written and the
    /// socket is shut down, or the linger ran out. Resolves at once for a
    /// connection that never opened.
    pub async fn flushed(&self) {
        let mut done = self.inner.writer_done.clone();
        while done.changed().await.is_ok() {}
    }
}

/// Writer task of one connection
async fn write_frames(
    inner: Weak<StreamInner>,
    mut writer: OwnedWriteHalf,
    queue: WriterQueue,
) {
    let WriterQueue { frame_rx, done_tx } = queue;
    while let Ok(outgoing) = frame_rx.recv_async().await {
        let frame = match outgoing {
            Outgoing::Frame(frame) => frame,
            Outgoing::Close => break,
        };
        let closing = inner.upgrade().map_or(true, |i| !i.core.lifecycle.is_open());
        let result = if closing {
            match tokio::time::timeout(CLOSE_LINGER, writer.write_all(&frame)).await {
                Ok(result) => result,
                Err(_) => break,
            }
        } else {
            writer.write_all(&frame).await
        };
        if let Err(e) = result {
            if let Some(inner) = inner.upgrade() {
                inner.shutdown(Some(e.into()));
            }
            break;
        }
    }
    let _ = tokio::time::timeout(CLOSE_LINGER, writer.shutdown()).await;
    drop(done_tx);
}

/// Handle to a TCP listener accepting any number of sessions
#[derive(Clone)]
pub struct ListenerHandle {
    core: Arc<ChannelCore>,
    local_addr: Arc<OnceLock<SocketAddr>>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("state", &self.core.lifecycle.state())
            .field("local_addr", &self.local_addr.get())
            .finish()
    }
}

impl ListenerHandle {
    /// Bind without blocking the caller
    ///
    /// Each accepted connection gets a fresh [`SessionId`] and is reported
    /// through `on_accept`, followed by `on_open` on its own channel.
    pub fn bind(addr: SocketAddr, observer: SharedObserver, options: StreamOptions) -> Self {
        let handle = Self {
            core: Arc::new(ChannelCore::opening(ChannelId::StreamListener, observer)),
            local_addr: Arc::new(OnceLock::new()),
        };
        let core = handle.core.clone();
        let local_addr = handle.local_addr.clone();
        handle.core.spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    core.fail_open(e.into());
                    return;
                }
            };
            let bound = match listener.local_addr() {
                Ok(bound) => bound,
                Err(e) => {
                    core.fail_open(e.into());
                    return;
                }
            };
            let _ = local_addr.set(bound);
            if !core.opened(Some(bound)) {
                return;
            }
            tracing::info!("Listening for stream connections on {}", bound);

            let next_session = AtomicU64::new(1);
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let session = SessionId(next_session.fetch_add(1, Ordering::Relaxed));
                        let (session_handle, queue) = StreamHandle::opening(
                            ChannelId::StreamSession(session),
                            core.observer().clone(),
                            options.stats.clone(),
                        );
                        core.observer()
                            .on_accept(session, peer, session_handle.clone());
                        session_handle.start(stream, queue, options.max_frame_len);
                    }
                    Err(e) => {
                        tracing::warn!("Stream listener failed to accept: {}", e);
                    }
                }
            }
        });
        handle
    }

    pub fn state(&self) -> ChannelState {
        self.core.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.core.lifecycle.is_open()
    }

    /// Bound address, once opened
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Stop accepting; accepted sessions stay open
    pub fn close(&self) {
        self.core.shutdown(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::framing::DEFAULT_MAX_FRAME_LEN;
    use crate::network::observer::{Mailbox, TransportEvent};
    use std::time::Duration;

    fn options() -> StreamOptions {
        StreamOptions {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            stats: None,
        }
    }

    async fn next(rx: &flume::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("timed out waiting for transport event")
            .expect("mailbox closed")
    }

    async fn bound_listener(
        observer: SharedObserver,
        rx: &flume::Receiver<TransportEvent>,
    ) -> (ListenerHandle, SocketAddr) {
        let listener = ListenerHandle::bind("127.0.0.1:0".parse().unwrap(), observer, options());
        match next(rx).await {
            TransportEvent::Opened {
                channel: ChannelId::StreamListener,
                local_addr: Some(addr),
            } => (listener, addr),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_and_session_exchange_envelopes() {
        let (server_mailbox, server_rx) = Mailbox::new();
        let (listener, addr) = bound_listener(Arc::new(server_mailbox), &server_rx).await;

        let (client_mailbox, client_rx) = Mailbox::new();
        let client = StreamHandle::connect(addr, Arc::new(client_mailbox), options());
        assert!(matches!(
            next(&client_rx).await,
            TransportEvent::Opened { channel: ChannelId::StreamClient, local_addr: Some(_) }
        ));
        assert!(client.is_open());

        let session = match next(&server_rx).await {
            TransportEvent::Accepted { session, handle, .. } => {
                assert_eq!(handle.channel(), ChannelId::StreamSession(session));
                handle
            }
            other => panic!("unexpected event {:?}", other),
        };
        assert!(matches!(
            next(&server_rx).await,
            TransportEvent::Opened { channel: ChannelId::StreamSession(_), .. }
        ));

        client.send(&Envelope::new("Action", vec![1, 2])).unwrap();
        match next(&server_rx).await {
            TransportEvent::Received { envelope, from, .. } => {
                assert_eq!(envelope, Envelope::new("Action", vec![1, 2]));
                assert_eq!(from, client.local_addr());
            }
            other => panic!("unexpected event {:?}", other),
        }

        session.send(&Envelope::new("ReplyUdpHost", vec![])).unwrap();
        assert!(matches!(
            next(&client_rx).await,
            TransportEvent::Received { envelope, .. } if envelope.tag == "ReplyUdpHost"
        ));

        // Closing the session ends the client's connection too
        session.close();
        assert!(matches!(
            next(&server_rx).await,
            TransportEvent::Closed { channel: ChannelId::StreamSession(_) }
        ));
        assert!(matches!(
            next(&client_rx).await,
            TransportEvent::Closed { channel: ChannelId::StreamClient }
        ));
        assert!(client.send(&Envelope::new("Action", vec![])).is_err());

        listener.close();
        assert!(matches!(
            next(&server_rx).await,
            TransportEvent::Closed { channel: ChannelId::StreamListener }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_writes_queued_frames_first() {
        let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = raw.local_addr().unwrap();

        let (mailbox, rx) = Mailbox::new();
        let client = StreamHandle::connect(addr, Arc::new(mailbox), options());
        let (mut peer, _) = raw.accept().await.unwrap();
        assert!(matches!(next(&rx).await, TransportEvent::Opened { .. }));

        for i in 0..3u8 {
            client.send(&Envelope::new("QuitApp", vec![i])).unwrap();
        }
        client.close();
        assert!(matches!(
            next(&rx).await,
            TransportEvent::Closed { channel: ChannelId::StreamClient }
        ));
        tokio::time::timeout(Duration::from_secs(5), client.flushed())
            .await
            .unwrap();

        for i in 0..3u8 {
            let body = tokio::time::timeout(
                Duration::from_secs(5),
                read_frame(&mut peer, DEFAULT_MAX_FRAME_LEN),
            )
            .await
            .unwrap()
            .unwrap()
            .expect("frame before end of stream");
            assert_eq!(Envelope::decode(&body).unwrap(), Envelope::new("QuitApp", vec![i]));
        }
        let end = tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(&mut peer, DEFAULT_MAX_FRAME_LEN),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_failure_reports_error_without_close() {
        // Grab a free port, then release it so nothing listens there
        let addr = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap()
        };
        let (mailbox, rx) = Mailbox::new();
        let client = StreamHandle::connect(addr, Arc::new(mailbox), options());
        assert!(matches!(
            next(&rx).await,
            TransportEvent::Error { channel: ChannelId::StreamClient, .. }
        ));
        assert_eq!(client.state(), ChannelState::Closed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_frame_closes_connection() {
        let (server_mailbox, server_rx) = Mailbox::new();
        let small = StreamOptions {
            max_frame_len: 32,
            stats: None,
        };
        let listener =
            ListenerHandle::bind("127.0.0.1:0".parse().unwrap(), Arc::new(server_mailbox), small);
        let addr = match next(&server_rx).await {
            TransportEvent::Opened { local_addr: Some(addr), .. } => addr,
            other => panic!("unexpected event {:?}", other),
        };

        let (client_mailbox, client_rx) = Mailbox::new();
        let client = StreamHandle::connect(addr, Arc::new(client_mailbox), options());
        assert!(matches!(next(&client_rx).await, TransportEvent::Opened { .. }));
        assert!(matches!(next(&server_rx).await, TransportEvent::Accepted { .. }));
        assert!(matches!(next(&server_rx).await, TransportEvent::Opened { .. }));

        client.send(&Envelope::new("Data", vec![0; 128])).unwrap();
        assert!(matches!(
            next(&server_rx).await,
            TransportEvent::Error { channel: ChannelId::StreamSession(_), error } if error.contains("too large")
        ));
        assert!(matches!(
            next(&server_rx).await,
            TransportEvent::Closed { channel: ChannelId::StreamSession(_) }
        ));
        listener.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_before_open_fails() {
        let (mailbox, _rx) = Mailbox::new();
        let addr = "127.0.0.1:9".parse().unwrap();
        let client = StreamHandle::connect(addr, Arc::new(mailbox), options());
        client.close();
        assert!(matches!(
            client.send(&Envelope::new("Action", vec![])),
            Err(LinkError::ChannelNotOpen(_))
        ));
    }
}
