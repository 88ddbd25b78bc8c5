/// Node management module
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::builder::NodeMode;
use super::client_state::ClientState;
use super::server_state::ServerState;
use super::stats::{NodeStats, StatsTracker};
use super::types::{LinkEvent, NodeContext, NodeState, NodeStateInternal, StepResult};
use crate::config::LinkConfig;
use crate::error::Result;
use crate::network::{Mailbox, SharedObserver, TransportEvent};
use crate::protocol::{ActionCommand, ActionRecording, Registration, SimulatedAction};
use crate::registry::Registry;
use crate::types::{Role, Session, SessionId, SyncDirection, Transform, UserIdentity, Vec3};

/// Commands that can be sent to the node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    /// Log in with a role (client only)
    LoginAs(Role),
    /// Take or hand over transform authority
    RequestDirection(SyncDirection),
    /// Send a control action
    SendAction(ActionCommand),
    /// Drive the peer's UI remotely
    SendSimulation(SimulatedAction),
    /// Send an object name with a flag
    SendHeadsetHeader { name: String, flag: bool },
    /// Send a tagged vector
    SendData { tag: String, value: Vec3 },
    /// Send a registration result
    SendRegistration(Registration),
    /// Send a recorded trajectory
    SendActionRecord(ActionRecording),
    /// Pause or resume transform streaming
    SetStreaming(bool),
    /// Write a local pose into the registry
    UpdateTransform { id: i32, transform: Transform },
    /// Stop the node's run loop
    Stop,
}

/// A peer of a coach/trainee link
///
/// All state lives on the task that calls [`LinkNode::step`]. Transport
/// tasks only queue notifications into the node's mailbox, and application
/// commands arrive through the channel returned by [`LinkNode::sender`].
pub struct LinkNode {
    /// Shared with the current state
    ctx: NodeContext,

    /// Current node state
    state: NodeStateInternal,

    /// Receiver for commands from the application
    command_rx: flume::Receiver<NodeCommand>,

    /// Sender for commands from the application
    command_tx: flume::Sender<NodeCommand>,

    /// Receiver for transport notifications
    mailbox_rx: flume::Receiver<TransportEvent>,

    /// Drives the sync engine
    ticker: Interval,
    last_tick: Instant,
}

impl std::fmt::Debug for LinkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkNode")
            .field("label", &self.ctx.label)
            .field("state", &self.state)
            .finish()
    }
}

impl LinkNode {
    /// Create a new LinkNode (internal use only - use the builder via
    /// [`LinkNode::connect`] or [`LinkNode::listen`])
    pub(crate) fn new_internal(config: LinkConfig, mode: NodeMode, registry: Registry) -> Result<Self> {
        config.validate()?;
        let identity = config.resolve_identity();
        let label = identity.name.clone();

        let (mailbox, mailbox_rx) = Mailbox::new();
        let observer: SharedObserver = Arc::new(mailbox);
        let (command_tx, command_rx) = flume::unbounded();

        // The first tick fires immediately; measure it from here
        let last_tick = Instant::now();
        let mut ticker = tokio::time::interval(config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ctx = NodeContext {
            label,
            identity,
            config,
            registry,
            observer,
            stats: Arc::new(StatsTracker::new()),
            events: VecDeque::new(),
            closing: Vec::new(),
        };

        tracing::info!(
            "Node '{}' initialized as user {} with {} object(s)",
            ctx.label,
            ctx.identity,
            ctx.registry.len()
        );

        let state = match mode {
            NodeMode::Client { server } => {
                NodeStateInternal::Client(ClientState::connect(&ctx, server))
            }
            NodeMode::Server { bind } => NodeStateInternal::Server(ServerState::listen(&ctx, bind)),
        };

        Ok(Self {
            ctx,
            state,
            command_rx,
            command_tx,
            mailbox_rx,
            ticker,
            last_tick,
        })
    }

    /// Identity this node announces
    pub fn identity(&self) -> &UserIdentity {
        &self.ctx.identity
    }

    /// Get a sender for sending commands to this node
    pub fn sender(&self) -> flume::Sender<NodeCommand> {
        self.command_tx.clone()
    }

    /// Entities as currently known to this node
    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    /// Get the current node state
    pub fn node_state(&self) -> NodeState {
        self.state.to_node_state()
    }

    pub fn is_client(&self) -> bool {
        matches!(self.state, NodeStateInternal::Client(_))
    }

    pub fn is_server(&self) -> bool {
        matches!(self.state, NodeStateInternal::Server(_))
    }

    /// Session of a client node
    pub fn session(&self) -> Option<&Session> {
        match &self.state {
            NodeStateInternal::Client(client) => Some(client.session()),
            _ => None,
        }
    }

    /// Sessions of a server node, ordered by id
    pub fn sessions(&self) -> Vec<(SessionId, &Session)> {
        match &self.state {
            NodeStateInternal::Server(server) => server
                .sessions
                .iter()
                .map(|(id, entry)| (*id, &entry.session))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Where a client streams its transforms
    pub fn datagram_target(&self) -> Option<SocketAddr> {
        match &self.state {
            NodeStateInternal::Client(client) => client.datagram_target(),
            _ => None,
        }
    }

    /// Bound address of this node's datagram listener
    pub fn datagram_local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            NodeStateInternal::Client(client) => client.datagram_local_addr(),
            NodeStateInternal::Server(server) => server.datagram_local_addr(),
            NodeStateInternal::Stop => None,
        }
    }

    /// Bound stream address of a server node
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            NodeStateInternal::Server(server) => server.listen_addr(),
            _ => None,
        }
    }

    /// Whether this node currently streams transforms
    pub fn is_transmitting(&self) -> bool {
        match &self.state {
            NodeStateInternal::Client(client) => client.engine().is_transmitting(),
            NodeStateInternal::Server(server) => server.is_transmitting(),
            NodeStateInternal::Stop => false,
        }
    }

    /// Get current node statistics
    pub fn stats(&self) -> NodeStats {
        self.ctx.stats.get_stats()
    }

    /// Reset node statistics
    pub fn reset_stats(&self) {
        self.ctx.stats.reset();
    }

    /// Wait for streams closed by `Stop` to write out what was queued
    ///
    /// Call before leaving the runtime so that a final action sent right
    /// before stopping still reaches the peer.
    pub async fn flushed(&mut self) {
        for stream in self.ctx.closing.drain(..) {
            stream.flushed().await;
        }
    }

    /// Execute one step of the node
    ///
    /// Drains transport notifications, application commands and sync ticks
    /// until something is worth reporting. Returns when either:
    /// - An event is produced (returns Event)
    /// - The step timeout elapses (returns Timeout)
    /// - A Stop command is received or the node already stopped (returns Stop)
    ///
    /// Every handler runs to completion without awaiting, so dropping the
    /// returned future (e.g. inside `tokio::select!`) loses nothing.
    pub async fn step(&mut self) -> Result<StepResult> {
        if let Some(event) = self.ctx.events.pop_front() {
            return Ok(StepResult::Event(event));
        }
        if matches!(self.state, NodeStateInternal::Stop) {
            return Ok(StepResult::Stop);
        }

        let sleep = tokio::time::sleep(self.ctx.config.step_timeout());
        tokio::pin!(sleep);

        loop {
            let deadline = match &self.state {
                NodeStateInternal::Client(client) => client.handshake_deadline(),
                _ => None,
            };

            tokio::select! {
                // Timeout elapsed
                () = &mut sleep => {
                    return Ok(StepResult::Timeout);
                }
                // Command received
                result = self.command_rx.recv_async() => match result {
                    Err(_) => {
                        tracing::info!("Node '{}' command channel closed", self.ctx.label);
                        self.stop();
                    }
                    Ok(NodeCommand::Stop) => {
                        tracing::info!("Node '{}' received Stop command, exiting", self.ctx.label);
                        self.stop();
                    }
                    Ok(command) => self.handle_command(command),
                },
                // Transport notification
                Ok(event) = self.mailbox_rx.recv_async() => {
                    self.handle_transport(event);
                }
                // Sync tick
                now = self.ticker.tick() => {
                    let dt = now.saturating_duration_since(self.last_tick);
                    self.last_tick = now;
                    self.tick(dt);
                }
                // Handshake deadline
                () = wait_until(deadline) => {
                    if let NodeStateInternal::Client(client) = &mut self.state {
                        client.on_handshake_timeout(&mut self.ctx);
                    }
                }
            }

            if let Some(event) = self.ctx.events.pop_front() {
                return Ok(StepResult::Event(event));
            }
            if matches!(self.state, NodeStateInternal::Stop) {
                return Ok(StepResult::Stop);
            }
        }
    }

    fn handle_command(&mut self, command: NodeCommand) {
        tracing::debug!("Node '{}' command {:?}", self.ctx.label, command);
        match &mut self.state {
            NodeStateInternal::Client(client) => client.handle_command(&mut self.ctx, command),
            NodeStateInternal::Server(server) => server.handle_command(&mut self.ctx, command),
            NodeStateInternal::Stop => {}
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match &mut self.state {
            NodeStateInternal::Client(client) => client.handle_transport(&mut self.ctx, event),
            NodeStateInternal::Server(server) => server.handle_transport(&mut self.ctx, event),
            NodeStateInternal::Stop => {}
        }
    }

    fn tick(&mut self, dt: std::time::Duration) {
        match &mut self.state {
            NodeStateInternal::Client(client) => client.tick(&mut self.ctx, dt),
            NodeStateInternal::Server(server) => server.tick(&mut self.ctx, dt),
            NodeStateInternal::Stop => {}
        }
    }

    /// Close every channel and move to Stop
    ///
    /// Session-ended events raised while closing are still returned by
    /// subsequent `step` calls before `Stop`.
    fn stop(&mut self) {
        match std::mem::replace(&mut self.state, NodeStateInternal::Stop) {
            NodeStateInternal::Client(mut client) => client.shutdown(&mut self.ctx),
            NodeStateInternal::Server(mut server) => server.shutdown(&mut self.ctx),
            NodeStateInternal::Stop => {}
        }
    }
}

impl Drop for LinkNode {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::error::LinkError;
    use crate::network::framing::{encode_frame, read_frame, DEFAULT_MAX_FRAME_LEN};
    use crate::protocol::{Message, MessageTag};
    use crate::registry::Entity;
    use crate::types::PeerSide;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    fn kitchen() -> Registry {
        Registry::from_entities([Entity::new(1, "Bowl"), Entity::new(2, "Whisk")]).unwrap()
    }

    async fn read_message(stream: &mut TcpStream) -> Message {
        let body = tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(stream, DEFAULT_MAX_FRAME_LEN),
        )
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .expect("connection closed");
        Message::decode(&Envelope::decode(&body).unwrap()).unwrap()
    }

    async fn write_message(stream: &mut TcpStream, message: &Message) {
        stream
            .write_all(&encode_frame(&message.encode().unwrap()).unwrap())
            .await
            .unwrap();
    }

    /// Step a single node until `done` holds
    async fn step_until<F>(node: &mut LinkNode, events: &mut Vec<LinkEvent>, mut done: F)
    where
        F: FnMut(&LinkNode, &[LinkEvent]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(node, events) {
            assert!(Instant::now() < deadline, "timed out, events: {:?}", events);
            if let StepResult::Event(event) = node.step().await.unwrap() {
                events.push(event);
            }
        }
    }

    /// Step two nodes concurrently until `done` holds
    async fn drive<F>(
        server: &mut LinkNode,
        client: &mut LinkNode,
        events: &mut Vec<(PeerSide, LinkEvent)>,
        mut done: F,
    ) where
        F: FnMut(&LinkNode, &LinkNode, &[(PeerSide, LinkEvent)]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(server, client, events) {
            assert!(Instant::now() < deadline, "timed out, events: {:?}", events);
            tokio::select! {
                result = server.step() => {
                    if let StepResult::Event(event) = result.unwrap() {
                        events.push((PeerSide::Server, event));
                    }
                }
                result = client.step() => {
                    if let StepResult::Event(event) = result.unwrap() {
                        events.push((PeerSide::Client, event));
                    }
                }
            }
        }
    }

    fn seen(events: &[(PeerSide, LinkEvent)], side: PeerSide, f: impl Fn(&LinkEvent) -> bool) -> bool {
        events.iter().any(|(s, e)| *s == side && f(e))
    }

    /// Server and client nodes with a completed handshake on both sides
    async fn linked_pair() -> (LinkNode, LinkNode, Vec<(PeerSide, LinkEvent)>) {
        let mut server = LinkNode::listen("127.0.0.1:0".parse().unwrap())
            .user_name("Coach".to_string())
            .step_timeout_ms(50)
            .registry(kitchen())
            .await
            .unwrap();
        let mut events = Vec::new();
        step_until(&mut server, &mut events, |n, _| n.listen_addr().is_some()).await;
        let addr = server.listen_addr().unwrap();

        let mut client = LinkNode::connect(addr)
            .user_id(7)
            .user_name("Alice".to_string())
            .step_timeout_ms(50)
            .registry(kitchen())
            .await
            .unwrap();

        let mut events = Vec::new();
        drive(&mut server, &mut client, &mut events, |s, c, ev| {
            seen(ev, PeerSide::Client, |e| matches!(e, LinkEvent::HandshakeComplete { .. }))
                && seen(ev, PeerSide::Server, |e| {
                    matches!(e, LinkEvent::HandshakeComplete { session: Some(_), .. })
                })
                && s.datagram_local_addr().is_some()
                && c.datagram_local_addr().is_some()
        })
        .await;
        (server, client, events)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_handshake_with_scripted_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_message(&mut stream).await;
            assert_eq!(request, Message::RequestUdpHost(UserIdentity::new(7, "Alice")));
            write_message(
                &mut stream,
                &Message::ReplyUdpHost {
                    ip: "127.0.0.1".to_string(),
                    port: 41000,
                },
            )
            .await;
            // The client announces its own datagram listener
            let announce = read_message(&mut stream).await;
            (stream, announce)
        });

        let mut node = LinkNode::connect(addr)
            .user_id(7)
            .user_name("Alice".to_string())
            .step_timeout_ms(50)
            .await
            .unwrap();
        let mut events = Vec::new();
        step_until(&mut node, &mut events, |_, ev| {
            ev.iter().any(|e| matches!(e, LinkEvent::HandshakeComplete { .. }))
        })
        .await;
        assert!(matches!(events[0], LinkEvent::Connected { .. }));
        let target: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        assert_eq!(node.datagram_target(), Some(target));
        assert_eq!(node.session().unwrap().udp_peer, Some(target));

        // Keep the node running until the fake server has read the announcement
        let mut server = server;
        let (_stream, announce) = loop {
            tokio::select! {
                result = &mut server => break result.unwrap(),
                result = node.step() => {
                    result.unwrap();
                }
            }
        };
        let local = node.datagram_local_addr().unwrap();
        assert_ne!(local.port(), 0);

        assert_eq!(
            announce,
            Message::ReplyUdpHost {
                ip: local.ip().to_string(),
                port: i32::from(local.port()),
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handshake_timeout_fails_and_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            // never reply, keep the connection until the client gives up
            let mut buf = [0u8; 16];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
        });

        let mut node = LinkNode::connect(addr)
            .handshake_timeout_ms(200)
            .step_timeout_ms(50)
            .await
            .unwrap();
        let mut events = Vec::new();
        step_until(&mut node, &mut events, |_, ev| {
            ev.iter().any(|e| matches!(e, LinkEvent::SessionEnded { .. }))
        })
        .await;

        let failed = events
            .iter()
            .position(|e| matches!(e, LinkEvent::HandshakeFailed { .. }))
            .expect("handshake should fail");
        let ended = events
            .iter()
            .position(|e| matches!(e, LinkEvent::SessionEnded { .. }))
            .unwrap();
        assert!(failed < ended);
        assert_eq!(node.datagram_target(), None);

        // SessionEnded is not repeated
        for _ in 0..3 {
            if let StepResult::Event(event) = node.step().await.unwrap() {
                assert!(!matches!(event, LinkEvent::SessionEnded { .. }));
            }
        }
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_reply_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            write_message(
                &mut stream,
                &Message::ReplyUdpHost {
                    ip: "kitchen-pc".to_string(),
                    port: 41000,
                },
            )
            .await;
            stream
        });

        let mut node = LinkNode::connect(addr).step_timeout_ms(50).await.unwrap();
        let mut events = Vec::new();
        step_until(&mut node, &mut events, |_, ev| {
            ev.iter().any(|e| matches!(e, LinkEvent::SessionEnded { .. }))
        })
        .await;
        assert!(events.iter().any(
            |e| matches!(e, LinkEvent::HandshakeFailed { reason } if reason.contains("kitchen-pc"))
        ));
        assert!(!events.iter().any(|e| matches!(e, LinkEvent::HandshakeComplete { .. })));
        let _stream = server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_truncated_reply_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            // String length prefix cut short
            let reply = Envelope::new(MessageTag::ReplyUdpHost.as_str(), vec![9, 0]);
            stream.write_all(&encode_frame(&reply).unwrap()).await.unwrap();
            stream
        });

        let mut node = LinkNode::connect(addr).step_timeout_ms(50).await.unwrap();
        let mut events = Vec::new();
        step_until(&mut node, &mut events, |_, ev| {
            ev.iter().any(|e| matches!(e, LinkEvent::SessionEnded { .. }))
        })
        .await;
        assert!(events.iter().any(
            |e| matches!(e, LinkEvent::HandshakeFailed { reason } if reason.contains("malformed"))
        ));
        let _stream = server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_login_and_client_stream_reach_server() {
        let (mut server, mut client, mut events) = linked_pair().await;

        let tx = client.sender();
        tx.send(NodeCommand::LoginAs(Role::Trainee)).unwrap();
        drive(&mut server, &mut client, &mut events, |_, _, ev| {
            seen(ev, PeerSide::Server, |e| {
                matches!(e, LinkEvent::RoleChanged { role: Role::Trainee, .. })
            })
        })
        .await;
        let sessions = server.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].1.role, Role::Trainee);
        assert_eq!(sessions[0].1.direction, SyncDirection::ClientToServer);

        // A second login on the same session is ignored
        tx.send(NodeCommand::LoginAs(Role::Coach)).unwrap();
        tx.send(NodeCommand::RequestDirection(SyncDirection::ClientToServer))
            .unwrap();
        let moved = Transform {
            position: Vec3::new(0.25, 1.0, -0.5),
            ..Transform::default()
        };
        tx.send(NodeCommand::UpdateTransform { id: 2, transform: moved })
            .unwrap();
        drive(&mut server, &mut client, &mut events, |s, _, _| {
            s.registry().get(2).map(|e| e.transform) == Some(moved)
        })
        .await;
        assert_eq!(server.sessions()[0].1.role, Role::Trainee);
        assert!(client.is_transmitting());
        assert!(!server.is_transmitting());
        assert!(client.stats().datagram_out_bytes > 0);
        assert!(server.stats().datagram_in_bytes > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_streams_after_pc_to_headset() {
        let (mut server, mut client, mut events) = linked_pair().await;

        // The server asks the headset to hand over; the client flips to receiving
        server
            .sender()
            .send(NodeCommand::SendAction(ActionCommand::PcToHeadset))
            .unwrap();
        drive(&mut server, &mut client, &mut events, |s, _, _| s.is_transmitting())
            .await;
        assert!(seen(&events, PeerSide::Client, |e| matches!(
            e,
            LinkEvent::Action { command: ActionCommand::PcToHeadset, .. }
        )));
        assert_eq!(
            client.session().unwrap().direction,
            SyncDirection::ServerToClient
        );

        let moved = Transform {
            position: Vec3::new(3.0, 0.0, 0.0),
            ..Transform::default()
        };
        server
            .sender()
            .send(NodeCommand::UpdateTransform { id: 1, transform: moved })
            .unwrap();
        drive(&mut server, &mut client, &mut events, |_, c, _| {
            c.registry().get(1).map(|e| e.transform) == Some(moved)
        })
        .await;
        assert!(!client.is_transmitting());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simultaneous_direction_requests() {
        let (mut server, mut client, mut events) = linked_pair().await;

        client
            .sender()
            .send(NodeCommand::RequestDirection(SyncDirection::ClientToServer))
            .unwrap();
        server
            .sender()
            .send(NodeCommand::RequestDirection(SyncDirection::ClientToServer))
            .unwrap();

        let before = client.registry().len();
        let start = Instant::now();
        drive(&mut server, &mut client, &mut events, |_, _, _| {
            start.elapsed() > Duration::from_millis(500)
        })
        .await;

        assert!(!events
            .iter()
            .any(|(_, e)| matches!(e, LinkEvent::SessionEnded { .. })));
        assert!(client.is_transmitting());
        assert!(!server.is_transmitting());
        assert_eq!(client.registry().len(), before);
        assert_eq!(server.registry().len(), before);
        assert_eq!(
            server.sessions()[0].1.direction,
            SyncDirection::ClientToServer
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registration_forwarded_to_streaming_client() {
        let (mut server, mut client, mut events) = linked_pair().await;

        let registration = Registration {
            object_id: 2,
            object_name: "Whisk".to_string(),
            position: Vec3::new(0.1, 0.2, 0.3),
        };
        client
            .sender()
            .send(NodeCommand::SendRegistration(registration.clone()))
            .unwrap();
        drive(&mut server, &mut client, &mut events, |_, _, ev| {
            seen(ev, PeerSide::Client, |e| {
                matches!(e, LinkEvent::RegistrationApplied { object_id: 2, .. })
            })
        })
        .await;
        assert!(seen(&events, PeerSide::Server, |e| matches!(
            e,
            LinkEvent::RegistrationForwarded { registration: r, .. } if *r == registration
        )));
        assert_eq!(
            client.registry().get(2).unwrap().transform.position,
            registration.position
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_ends_sessions_on_both_sides() {
        let (mut server, mut client, mut events) = linked_pair().await;

        client.sender().send(NodeCommand::Stop).unwrap();
        drive(&mut server, &mut client, &mut events, |_, _, ev| {
            seen(ev, PeerSide::Server, |e| {
                matches!(e, LinkEvent::SessionEnded { session: Some(_) })
            })
        })
        .await;
        assert!(seen(&events, PeerSide::Client, |e| matches!(
            e,
            LinkEvent::SessionEnded { session: None }
        )));
        assert_eq!(client.step().await.unwrap(), StepResult::Stop);
        assert!(server.sessions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_action_sent_before_stop_reaches_peer() {
        let (mut server, mut client, _) = linked_pair().await;

        server
            .sender()
            .send(NodeCommand::SendAction(ActionCommand::QuitApp))
            .unwrap();
        server.sender().send(NodeCommand::Stop).unwrap();
        while server.step().await.unwrap() != StepResult::Stop {}
        tokio::time::timeout(Duration::from_secs(5), server.flushed())
            .await
            .unwrap();

        let mut events = Vec::new();
        step_until(&mut client, &mut events, |_, ev| {
            ev.iter().any(|e| matches!(e, LinkEvent::SessionEnded { .. }))
        })
        .await;
        let quit = events.iter().position(|e| {
            matches!(e, LinkEvent::Action { command: ActionCommand::QuitApp, .. })
        });
        let ended = events
            .iter()
            .position(|e| matches!(e, LinkEvent::SessionEnded { .. }));
        assert!(quit.is_some(), "events: {:?}", events);
        assert!(quit < ended);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_first_tick_is_measured_from_node_start() {
        let mut node = LinkNode::listen("127.0.0.1:0".parse().unwrap())
            .sync_interval_ms(20)
            .await
            .unwrap();
        // The interval's first tick reports its own start instant
        let first = node.ticker.tick().await;
        assert!(node.last_tick <= first);
        let second = node.ticker.tick().await;
        assert!(second.saturating_duration_since(node.last_tick) >= Duration::from_millis(20));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_invalid_config_is_rejected() {
        let result = LinkNode::listen("127.0.0.1:0".parse().unwrap())
            .sync_interval_ms(0)
            .await;
        assert!(matches!(result, Err(LinkError::InvalidConfig(_))));
    }
}
