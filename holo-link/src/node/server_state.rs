/// Server state implementation
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::network::{ChannelId, DatagramHandle, ListenerHandle, StreamHandle, TransportEvent};
use crate::node::link_node::NodeCommand;
use crate::node::sync_engine::SyncEngine;
use crate::node::types::{LinkEvent, NodeContext, NodeState};
use crate::protocol::{Message, TransformUpdate};
use crate::types::{PeerSide, Session, SessionId, SyncDirection, UserIdentity};

/// One accepted client
pub(crate) struct ServerSession {
    pub(crate) session: Session,
    pub(crate) peer: SocketAddr,
    stream: StreamHandle,
    pub(crate) engine: SyncEngine,
    /// Sends transforms to the client's datagram listener
    udp_sender: Option<DatagramHandle>,
}

impl ServerSession {
    fn close(&mut self) {
        self.stream.close();
        if let Some(sender) = self.udp_sender.take() {
            sender.close();
        }
    }
}

/// State of a node accepting clients
pub(crate) struct ServerState {
    listener: ListenerHandle,
    pub(crate) sessions: BTreeMap<SessionId, ServerSession>,
    /// Shared datagram listener, opened on the first `RequestUdpHost`
    udp_listener: Option<DatagramHandle>,
    /// Address of the datagram listener, once bound
    udp_addr: Option<SocketAddr>,
    /// Sessions waiting for the datagram listener address
    pending_replies: Vec<SessionId>,
    /// Node-level guard for inbound transforms
    inbound_enabled: bool,
}

impl ServerState {
    /// Start listening; the outcome arrives through the mailbox
    pub(crate) fn listen(ctx: &NodeContext, bind_addr: SocketAddr) -> Self {
        tracing::info!("Node '{}' binding {}", ctx.label, bind_addr);
        let listener = ListenerHandle::bind(bind_addr, ctx.observer.clone(), ctx.stream_options());
        Self {
            listener,
            sessions: BTreeMap::new(),
            udp_listener: None,
            udp_addr: None,
            pending_replies: Vec::new(),
            inbound_enabled: true,
        }
    }

    pub(crate) fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub(crate) fn datagram_local_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub(crate) fn is_transmitting(&self) -> bool {
        self.sessions.values().any(|s| s.engine.is_transmitting())
    }

    pub(crate) fn to_node_state(&self) -> NodeState {
        NodeState::Server {
            listen_addr: self.listen_addr(),
            sessions: self.sessions.len(),
            inbound_enabled: self.inbound_enabled,
        }
    }

    fn send_to(&self, ctx: &NodeContext, id: SessionId, message: &Message) {
        let Some(entry) = self.sessions.get(&id) else {
            return;
        };
        if let Err(e) = message.encode().and_then(|envelope| entry.stream.send(&envelope)) {
            tracing::warn!(
                "Node '{}' failed to send {} to session {}: {}",
                ctx.label,
                message.tag(),
                id,
                e
            );
        }
    }

    fn broadcast(&self, ctx: &NodeContext, message: &Message) {
        if self.sessions.is_empty() {
            tracing::debug!("Node '{}' has no session for {}", ctx.label, message.tag());
        }
        for id in self.sessions.keys() {
            self.send_to(ctx, *id, message);
        }
    }

    fn reply_udp_host(&self, ctx: &NodeContext, id: SessionId, addr: SocketAddr) {
        self.send_to(
            ctx,
            id,
            &Message::ReplyUdpHost {
                ip: addr.ip().to_string(),
                port: i32::from(addr.port()),
            },
        );
    }

    fn set_direction(&mut self, ctx: &mut NodeContext, id: SessionId, direction: SyncDirection) {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return;
        };
        entry.session.direction = direction;
        entry.engine.set_direction(direction);
        tracing::info!(
            "Node '{}' session {} sync direction is now {}",
            ctx.label,
            id,
            direction
        );
        ctx.emit(LinkEvent::DirectionChanged {
            session: Some(id),
            direction,
        });
    }

    fn end_session(&mut self, ctx: &mut NodeContext, id: SessionId) {
        let Some(mut entry) = self.sessions.remove(&id) else {
            return;
        };
        entry.close();
        self.pending_replies.retain(|pending| *pending != id);
        tracing::info!("Node '{}' session {} from {} ended", ctx.label, id, entry.peer);
        ctx.emit(LinkEvent::SessionEnded { session: Some(id) });
    }

    /// Close every channel
    pub(crate) fn shutdown(&mut self, ctx: &mut NodeContext) {
        self.listener.close();
        if let Some(listener) = self.udp_listener.take() {
            listener.close();
        }
        ctx.closing
            .extend(self.sessions.values().map(|entry| entry.stream.clone()));
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.end_session(ctx, id);
        }
    }

    pub(crate) fn handle_transport(&mut self, ctx: &mut NodeContext, event: TransportEvent) {
        match event {
            TransportEvent::Opened {
                channel: ChannelId::StreamListener,
                local_addr: Some(addr),
            } => {
                tracing::info!("Node '{}' listening on {}", ctx.label, addr);
                ctx.emit(LinkEvent::Listening { addr });
            }
            TransportEvent::Accepted {
                session,
                peer,
                handle,
            } => {
                let mut engine = SyncEngine::new(PeerSide::Server, ctx.config.sync_interval());
                engine.set_direction(SyncDirection::default());
                self.sessions.insert(
                    session,
                    ServerSession {
                        session: Session::default(),
                        peer,
                        stream: handle,
                        engine,
                        udp_sender: None,
                    },
                );
            }
            TransportEvent::Opened {
                channel: ChannelId::StreamSession(id),
                ..
            } => {
                if let Some(entry) = self.sessions.get(&id) {
                    tracing::info!("Node '{}' session {} opened from {}", ctx.label, id, entry.peer);
                    ctx.emit(LinkEvent::SessionOpened {
                        session: id,
                        peer: entry.peer,
                    });
                }
            }
            TransportEvent::Opened {
                channel: ChannelId::DatagramListener,
                local_addr: Some(addr),
            } => {
                tracing::info!("Node '{}' receiving datagrams on {}", ctx.label, addr);
                self.udp_addr = Some(addr);
                for id in std::mem::take(&mut self.pending_replies) {
                    self.reply_udp_host(ctx, id, addr);
                }
            }
            TransportEvent::Opened { channel, local_addr } => {
                tracing::debug!("Node '{}' channel '{}' open on {:?}", ctx.label, channel, local_addr);
            }
            TransportEvent::Error { channel, error } => {
                tracing::warn!("Node '{}' channel '{}' error: {}", ctx.label, channel, error);
                match channel {
                    ChannelId::StreamSession(id) => self.end_session(ctx, id),
                    // Retry on the next request
                    ChannelId::DatagramListener => {
                        self.udp_listener = None;
                        self.udp_addr = None;
                    }
                    _ => {}
                }
                ctx.emit(LinkEvent::TransportError { channel, error });
            }
            TransportEvent::Closed {
                channel: ChannelId::StreamSession(id),
            } => self.end_session(ctx, id),
            TransportEvent::Closed { channel } => {
                tracing::debug!("Node '{}' channel '{}' closed", ctx.label, channel);
            }
            TransportEvent::Received {
                channel: ChannelId::StreamSession(id),
                envelope,
                ..
            } => {
                let channel = ChannelId::StreamSession(id);
                if let Some(message) = ctx.decode(channel, &envelope) {
                    self.handle_message(ctx, id, message);
                }
            }
            TransportEvent::Received {
                channel: ChannelId::DatagramListener,
                envelope,
                from,
            } => match ctx.decode(ChannelId::DatagramListener, &envelope) {
                Some(Message::SyncTransform(update)) => self.receive_transform(ctx, &update),
                Some(other) => tracing::debug!(
                    "Node '{}' ignoring {} datagram from {:?}",
                    ctx.label,
                    other.tag(),
                    from
                ),
                None => {}
            },
            TransportEvent::Received { channel, .. } => {
                tracing::debug!("Node '{}' ignoring data on '{}'", ctx.label, channel);
            }
        }
    }

    /// Apply an inbound transform if some session streams towards us
    fn receive_transform(&self, ctx: &mut NodeContext, update: &TransformUpdate) {
        if !self.inbound_enabled {
            return;
        }
        // Datagram sources are ephemeral sockets, so the update cannot be
        // tied to a session; any receiving session admits it
        let Some(entry) = self
            .sessions
            .values()
            .find(|s| !s.engine.is_authority() && s.engine.accepts_inbound())
        else {
            tracing::trace!("Node '{}' no session streams to us, dropping transform", ctx.label);
            return;
        };
        if !entry.engine.receive(update, &mut ctx.registry) {
            tracing::trace!("Node '{}' dropped transform for {}", ctx.label, update.id);
        }
    }

    fn handle_message(&mut self, ctx: &mut NodeContext, id: SessionId, message: Message) {
        let session = Some(id);
        match message {
            Message::RequestUdpHost(user) => self.on_request_udp_host(ctx, id, user),
            Message::ReplyUdpHost { ip, port } => self.on_reply_udp_host(ctx, id, &ip, port),
            Message::LoginRole { user, role } => {
                let Some(entry) = self.sessions.get_mut(&id) else {
                    return;
                };
                if let Err(e) = entry.session.set_role(role) {
                    tracing::info!("Node '{}' ignoring login from {}: {}", ctx.label, user, e);
                    return;
                }
                entry.session.user.get_or_insert_with(|| user.clone());
                tracing::info!("Node '{}' session {} logged in as {} ({})", ctx.label, id, role, user);
                ctx.emit(LinkEvent::RoleChanged { session, user, role });
                let direction = ctx.config.default_direction();
                self.set_direction(ctx, id, direction);
            }
            Message::ChangeDirection { user, direction } => {
                tracing::debug!("Node '{}' direction change from {}", ctx.label, user);
                self.set_direction(ctx, id, direction);
            }
            Message::SyncTransform(update) => self.receive_transform(ctx, &update),
            Message::Registration(registration) => {
                let streams_to_client = self
                    .sessions
                    .get(&id)
                    .is_some_and(|s| s.session.direction == SyncDirection::ServerToClient);
                if streams_to_client {
                    if ctx
                        .registry
                        .set_position(registration.object_id, registration.position)
                    {
                        ctx.emit(LinkEvent::RegistrationApplied {
                            object_id: registration.object_id,
                            position: registration.position,
                        });
                    }
                } else {
                    self.send_to(ctx, id, &Message::SyncRegistration(registration.clone()));
                    ctx.emit(LinkEvent::RegistrationForwarded {
                        session: id,
                        registration,
                    });
                }
            }
            Message::Action(command) => ctx.emit(LinkEvent::Action { session, command }),
            Message::ActionSimulation(action) => ctx.emit(LinkEvent::Simulation { session, action }),
            Message::HeadsetHeader { name, flag } => {
                ctx.emit(LinkEvent::HeadsetHeader { session, name, flag })
            }
            Message::Data { tag, value } => ctx.emit(LinkEvent::Data { session, tag, value }),
            Message::ActionRecord(recording) => {
                ctx.emit(LinkEvent::ActionRecorded { session, recording })
            }
            Message::SyncRegistration(_) => {
                tracing::debug!("Node '{}' ignoring SyncRegistration on server side", ctx.label);
            }
        }
    }

    fn on_request_udp_host(&mut self, ctx: &mut NodeContext, id: SessionId, user: UserIdentity) {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return;
        };
        tracing::info!("Node '{}' session {} is {}", ctx.label, id, user);
        entry.session.user = Some(user);

        if let Some(addr) = self.udp_addr {
            self.reply_udp_host(ctx, id, addr);
            return;
        }
        if !self.pending_replies.contains(&id) {
            self.pending_replies.push(id);
        }
        if self.udp_listener.is_none() {
            // Bind where the client reached us so the reply is routable
            let ip = entry
                .stream
                .local_addr()
                .map(|a| a.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            self.udp_listener = Some(DatagramHandle::listen(
                SocketAddr::new(ip, 0),
                ctx.observer.clone(),
                Some(ctx.stats.clone()),
            ));
        }
    }

    fn on_reply_udp_host(&mut self, ctx: &mut NodeContext, id: SessionId, ip: &str, port: i32) {
        let target = match (ip.parse::<IpAddr>(), u16::try_from(port)) {
            (Ok(ip), Ok(port)) if port != 0 => SocketAddr::new(ip, port),
            _ => {
                tracing::debug!(
                    "Node '{}' discarding ReplyUdpHost {}:{} from session {}",
                    ctx.label,
                    ip,
                    port,
                    id
                );
                return;
            }
        };
        let Some(entry) = self.sessions.get_mut(&id) else {
            return;
        };
        if !entry.session.set_udp_peer(target) {
            tracing::debug!("Node '{}' session {} datagram peer already set", ctx.label, id);
            return;
        }
        entry.udp_sender = Some(DatagramHandle::sender(
            target,
            ctx.observer.clone(),
            Some(id),
            Some(ctx.stats.clone()),
        ));
        tracing::info!(
            "Node '{}' session {} handshake complete, datagrams to {}",
            ctx.label,
            id,
            target
        );
        ctx.emit(LinkEvent::HandshakeComplete {
            session: Some(id),
            udp_peer: target,
        });
    }

    pub(crate) fn handle_command(&mut self, ctx: &mut NodeContext, command: NodeCommand) {
        match command {
            NodeCommand::LoginAs(role) => {
                tracing::warn!(
                    "Node '{}' cannot log in as {}: {}",
                    ctx.label,
                    role,
                    crate::error::LinkError::NotClient
                );
            }
            NodeCommand::RequestDirection(direction) => {
                let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
                for id in ids {
                    self.set_direction(ctx, id, direction);
                    self.send_to(
                        ctx,
                        id,
                        &Message::ChangeDirection {
                            user: ctx.identity.clone(),
                            direction,
                        },
                    );
                }
            }
            NodeCommand::SendAction(command) => self.broadcast(ctx, &Message::Action(command)),
            NodeCommand::SendSimulation(action) => {
                self.broadcast(ctx, &Message::ActionSimulation(action))
            }
            NodeCommand::SendHeadsetHeader { name, flag } => {
                self.broadcast(ctx, &Message::HeadsetHeader { name, flag })
            }
            NodeCommand::SendData { tag, value } => {
                self.broadcast(ctx, &Message::Data { tag, value })
            }
            NodeCommand::SendRegistration(registration) => {
                if ctx
                    .registry
                    .set_position(registration.object_id, registration.position)
                {
                    ctx.emit(LinkEvent::RegistrationApplied {
                        object_id: registration.object_id,
                        position: registration.position,
                    });
                }
                self.broadcast(ctx, &Message::SyncRegistration(registration));
            }
            NodeCommand::SendActionRecord(recording) => {
                self.broadcast(ctx, &Message::ActionRecord(recording))
            }
            NodeCommand::SetStreaming(on) => {
                self.inbound_enabled = on;
                for entry in self.sessions.values_mut() {
                    entry.engine.set_streaming(on);
                }
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

    /// Advance every session engine and stream to the sessions that are due
    pub(crate) fn tick(&mut self, ctx: &mut NodeContext, dt: Duration) {
        for (id, entry) in self.sessions.iter_mut() {
            let updates = entry.engine.advance(dt, &ctx.registry);
            if updates.is_empty() {
                continue;
            }
            let Some(sender) = entry.udp_sender.as_ref().filter(|s| s.is_open()) else {
                continue;
            };
            for update in updates {
                let sent = Message::SyncTransform(update)
                    .encode()
                    .and_then(|envelope| sender.send(&envelope));
                if let Err(e) = sent {
                    tracing::debug!(
                        "Node '{}' failed to stream transform to {}: {}",
                        ctx.label,
                        id,
                        e
                    );
                }
            }
        }
    }
}
