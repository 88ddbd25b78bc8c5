/// Client state implementation
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::time::Instant;

use crate::network::{ChannelId, DatagramHandle, StreamHandle, TransportEvent};
use crate::node::link_node::NodeCommand;
use crate::node::sync_engine::SyncEngine;
use crate::node::types::{LinkEvent, NodeContext, NodeState};
use crate::protocol::{ActionCommand, Message, MessageTag};
use crate::types::{PeerSide, Role, Session, SyncDirection};

/// State of a node connected (or connecting) to a server
pub(crate) struct ClientState {
    /// Server stream address
    pub(crate) server_addr: SocketAddr,
    /// Stream connection to the server
    stream: StreamHandle,
    /// The single session of a client
    session: Session,
    engine: SyncEngine,
    /// Sends transforms to the server's datagram listener
    udp_sender: Option<DatagramHandle>,
    /// Receives transforms from the server
    udp_listener: Option<DatagramHandle>,
    /// Armed while waiting for `ReplyUdpHost`
    handshake_deadline: Option<Instant>,
    ended: bool,
}

impl ClientState {
    /// Start connecting; the outcome arrives through the mailbox
    pub(crate) fn connect(ctx: &NodeContext, server_addr: SocketAddr) -> Self {
        tracing::info!("Node '{}' connecting to {}", ctx.label, server_addr);
        let stream = StreamHandle::connect(server_addr, ctx.observer.clone(), ctx.stream_options());
        Self {
            server_addr,
            stream,
            session: Session::default(),
            engine: SyncEngine::new(PeerSide::Client, ctx.config.sync_interval()),
            udp_sender: None,
            udp_listener: None,
            handshake_deadline: None,
            ended: false,
        }
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub(crate) fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
    }

    pub(crate) fn datagram_target(&self) -> Option<SocketAddr> {
        self.session.udp_peer
    }

    pub(crate) fn datagram_local_addr(&self) -> Option<SocketAddr> {
        self.udp_listener
            .as_ref()
            .filter(|l| l.is_open())
            .and_then(DatagramHandle::local_addr)
    }

    pub(crate) fn to_node_state(&self) -> NodeState {
        NodeState::Client {
            connected: self.stream.is_open(),
            handshake_complete: self.session.udp_peer.is_some(),
            role: self.session.role,
            direction: self.session.direction,
            transmitting: self.engine.is_transmitting(),
        }
    }

    fn send(&self, ctx: &NodeContext, message: &Message) {
        if let Err(e) = message.encode().and_then(|envelope| self.stream.send(&envelope)) {
            tracing::warn!(
                "Node '{}' failed to send {} to server: {}",
                ctx.label,
                message.tag(),
                e
            );
        }
    }

    fn set_direction(&mut self, ctx: &mut NodeContext, direction: SyncDirection) {
        self.session.direction = direction;
        self.engine.set_direction(direction);
        tracing::info!(
            "Node '{}' sync direction is now {} ({})",
            ctx.label,
            direction,
            if self.engine.is_transmitting() { "transmitting" } else { "receiving" }
        );
        ctx.emit(LinkEvent::DirectionChanged {
            session: None,
            direction,
        });
    }

    fn login(&mut self, ctx: &mut NodeContext, role: Role) {
        if let Err(e) = self.session.set_role(role) {
            tracing::debug!("Node '{}' keeps local role: {}", ctx.label, e);
        }
        self.send(
            ctx,
            &Message::LoginRole {
                user: ctx.identity.clone(),
                role,
            },
        );
    }

    fn request_direction(&mut self, ctx: &mut NodeContext, direction: SyncDirection) {
        self.set_direction(ctx, direction);
        self.send(
            ctx,
            &Message::ChangeDirection {
                user: ctx.identity.clone(),
                direction,
            },
        );
    }

    /// Fail the handshake and close the stream
    ///
    /// The close comes back as a transport event and ends the session.
    fn fail_handshake(&mut self, ctx: &mut NodeContext, reason: String) {
        tracing::warn!("Node '{}' handshake failed: {}", ctx.label, reason);
        self.handshake_deadline = None;
        ctx.emit(LinkEvent::HandshakeFailed { reason });
        self.stream.close();
    }

    pub(crate) fn on_handshake_timeout(&mut self, ctx: &mut NodeContext) {
        let reason = crate::error::LinkError::HandshakeTimeout(ctx.config.handshake_timeout_ms);
        self.fail_handshake(ctx, reason.to_string());
    }

    fn end_session(&mut self, ctx: &mut NodeContext) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.handshake_deadline = None;
        self.engine.set_streaming(false);
        for handle in [self.udp_sender.take(), self.udp_listener.take()]
            .into_iter()
            .flatten()
        {
            handle.close();
        }
        tracing::info!("Node '{}' session with {} ended", ctx.label, self.server_addr);
        ctx.emit(LinkEvent::SessionEnded { session: None });
    }

    /// Close every channel
    pub(crate) fn shutdown(&mut self, ctx: &mut NodeContext) {
        self.stream.close();
        ctx.closing.push(self.stream.clone());
        self.end_session(ctx);
    }

    pub(crate) fn handle_transport(&mut self, ctx: &mut NodeContext, event: TransportEvent) {
        match event {
            TransportEvent::Opened {
                channel: ChannelId::StreamClient,
                local_addr,
            } => {
                let local_addr = local_addr
                    .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
                tracing::info!(
                    "Node '{}' connected to {} from {}",
                    ctx.label,
                    self.server_addr,
                    local_addr
                );
                ctx.emit(LinkEvent::Connected { local_addr });
                self.send(ctx, &Message::RequestUdpHost(ctx.identity.clone()));
                self.handshake_deadline = Some(Instant::now() + ctx.config.handshake_timeout());
            }
            TransportEvent::Opened {
                channel: ChannelId::DatagramListener,
                local_addr: Some(addr),
            } => {
                tracing::info!("Node '{}' receiving datagrams on {}", ctx.label, addr);
                // Tell the server where to send its transforms
                self.send(
                    ctx,
                    &Message::ReplyUdpHost {
                        ip: addr.ip().to_string(),
                        port: i32::from(addr.port()),
                    },
                );
            }
            TransportEvent::Opened { channel, local_addr } => {
                tracing::debug!("Node '{}' channel '{}' open on {:?}", ctx.label, channel, local_addr);
            }
            TransportEvent::Error { channel, error } => {
                tracing::warn!("Node '{}' channel '{}' error: {}", ctx.label, channel, error);
                ctx.emit(LinkEvent::TransportError { channel, error });
                if channel == ChannelId::StreamClient {
                    self.end_session(ctx);
                }
            }
            TransportEvent::Closed {
                channel: ChannelId::StreamClient,
            } => self.end_session(ctx),
            TransportEvent::Closed { channel } => {
                tracing::debug!("Node '{}' channel '{}' closed", ctx.label, channel);
            }
            TransportEvent::Received {
                channel,
                envelope,
                from: _,
            } => {
                let waiting = self.handshake_deadline.is_some();
                match ctx.decode(channel, &envelope) {
                    Some(message) => self.handle_message(ctx, message),
                    None if waiting && envelope.tag == MessageTag::ReplyUdpHost.as_str() => {
                        self.fail_handshake(ctx, "malformed ReplyUdpHost".to_string())
                    }
                    None => {}
                }
            }
            TransportEvent::Accepted { session, handle, .. } => {
                tracing::warn!(
                    "Node '{}' is a client, dropping accepted session {}",
                    ctx.label,
                    session
                );
                handle.close();
            }
        }
    }

    fn handle_message(&mut self, ctx: &mut NodeContext, message: Message) {
        match message {
            Message::ReplyUdpHost { ip, port } => self.on_reply_udp_host(ctx, &ip, port),
            Message::ChangeDirection { user, direction } => {
                tracing::debug!("Node '{}' direction change from {}", ctx.label, user);
                self.set_direction(ctx, direction);
            }
            Message::SyncTransform(update) => {
                if !self.engine.receive(&update, &mut ctx.registry) {
                    tracing::trace!("Node '{}' dropped transform for {}", ctx.label, update.id);
                }
            }
            Message::SyncRegistration(registration) => {
                if ctx
                    .registry
                    .set_position(registration.object_id, registration.position)
                {
                    ctx.emit(LinkEvent::RegistrationApplied {
                        object_id: registration.object_id,
                        position: registration.position,
                    });
                } else {
                    tracing::debug!(
                        "Node '{}' has no object {} to register",
                        ctx.label,
                        registration.object_id
                    );
                }
            }
            Message::Action(command) => {
                match command {
                    ActionCommand::Start => {
                        self.login(ctx, Role::Coach);
                        self.request_direction(ctx, SyncDirection::ClientToServer);
                    }
                    ActionCommand::HeadsetToPc => {
                        self.request_direction(ctx, SyncDirection::ClientToServer)
                    }
                    ActionCommand::PcToHeadset => {
                        self.request_direction(ctx, SyncDirection::ServerToClient)
                    }
                    _ => {}
                }
                ctx.emit(LinkEvent::Action {
                    session: None,
                    command,
                });
            }
            Message::ActionSimulation(action) => ctx.emit(LinkEvent::Simulation {
                session: None,
                action,
            }),
            Message::HeadsetHeader { name, flag } => ctx.emit(LinkEvent::HeadsetHeader {
                session: None,
                name,
                flag,
            }),
            Message::Data { tag, value } => ctx.emit(LinkEvent::Data {
                session: None,
                tag,
                value,
            }),
            Message::ActionRecord(recording) => ctx.emit(LinkEvent::ActionRecorded {
                session: None,
                recording,
            }),
            other => {
                tracing::debug!(
                    "Node '{}' ignoring {} on client side",
                    ctx.label,
                    other.tag()
                );
            }
        }
    }

    fn on_reply_udp_host(&mut self, ctx: &mut NodeContext, ip: &str, port: i32) {
        if self.handshake_deadline.is_none() {
            tracing::debug!("Node '{}' ignoring unsolicited ReplyUdpHost", ctx.label);
            return;
        }
        let ip: IpAddr = match ip.parse() {
            Ok(ip) => ip,
            Err(_) => return self.fail_handshake(ctx, format!("invalid address '{}'", ip)),
        };
        let port = match u16::try_from(port) {
            Ok(port) if port != 0 => port,
            _ => return self.fail_handshake(ctx, format!("invalid port {}", port)),
        };
        let target = SocketAddr::new(ip, port);
        self.handshake_deadline = None;
        self.session.set_udp_peer(target);

        self.udp_sender = Some(DatagramHandle::sender(
            target,
            ctx.observer.clone(),
            None,
            Some(ctx.stats.clone()),
        ));
        let local_ip = self
            .stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        self.udp_listener = Some(DatagramHandle::listen(
            SocketAddr::new(local_ip, 0),
            ctx.observer.clone(),
            Some(ctx.stats.clone()),
        ));

        tracing::info!("Node '{}' handshake complete, datagrams to {}", ctx.label, target);
        ctx.emit(LinkEvent::HandshakeComplete {
            session: None,
            udp_peer: target,
        });
    }

    pub(crate) fn handle_command(&mut self, ctx: &mut NodeContext, command: NodeCommand) {
        match command {
            NodeCommand::LoginAs(role) => self.login(ctx, role),
            NodeCommand::RequestDirection(direction) => self.request_direction(ctx, direction),
            NodeCommand::SendAction(command) => self.send(ctx, &Message::Action(command)),
            NodeCommand::SendSimulation(action) => {
                self.send(ctx, &Message::ActionSimulation(action))
            }
            NodeCommand::SendHeadsetHeader { name, flag } => {
                self.send(ctx, &Message::HeadsetHeader { name, flag })
            }
            NodeCommand::SendData { tag, value } => self.send(ctx, &Message::Data { tag, value }),
            NodeCommand::SendRegistration(registration) => {
                self.send(ctx, &Message::Registration(registration))
            }
            NodeCommand::SendActionRecord(recording) => {
                self.send(ctx, &Message::ActionRecord(recording))
            }
            NodeCommand::SetStreaming(on) => {
                self.engine.set_streaming(on);
                tracing::info!(
                    "Node '{}' streaming {}",
                    ctx.label,
                    if on { "enabled" } else { "disabled" }
                );
            }
            NodeCommand::UpdateTransform { id, transform } => {
                if !ctx.registry.apply(id, transform) {
                    tracing::warn!("Node '{}' has no object {}", ctx.label, id);
                }
            }
            NodeCommand::Stop => {}
        }
    }

    /// Advance the sync engine and stream transforms if due
    pub(crate) fn tick(&mut self, ctx: &mut NodeContext, dt: Duration) {
        let updates = self.engine.advance(dt, &ctx.registry);
        if updates.is_empty() {
            return;
        }
        let Some(sender) = self.udp_sender.as_ref().filter(|s| s.is_open()) else {
            return;
        };
        for update in updates {
            let sent = Message::SyncTransform(update)
                .encode()
                .and_then(|envelope| sender.send(&envelope));
            if let Err(e) = sent {
                tracing::debug!("Node '{}' failed to stream transform: {}", ctx.label, e);
            }
        }
    }
}
