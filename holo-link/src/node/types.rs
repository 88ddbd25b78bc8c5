/// Node-level types returned to the application
use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::config::LinkConfig;
use crate::envelope::Envelope;
use crate::network::{ChannelId, SharedObserver, StreamHandle, StreamOptions};
use crate::node::client_state::ClientState;
use crate::node::server_state::ServerState;
use crate::node::stats::SharedStats;
use crate::protocol::{ActionCommand, ActionRecording, Message, Registration, SimulatedAction};
use crate::registry::Registry;
use crate::types::{Role, SessionId, SyncDirection, UserIdentity, Vec3};

/// Something the application should know about
///
/// `session` is `None` on a client, which has a single implicit session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Server stream listener is bound
    Listening { addr: SocketAddr },
    /// Server accepted a stream connection
    SessionOpened { session: SessionId, peer: SocketAddr },
    /// Client stream connection is open
    Connected { local_addr: SocketAddr },
    /// Datagram peer of a session is known and a sender is opening
    HandshakeComplete {
        session: Option<SessionId>,
        udp_peer: SocketAddr,
    },
    /// Client handshake failed; the stream is being closed
    HandshakeFailed { reason: String },
    /// Session logged in with a role
    RoleChanged {
        session: Option<SessionId>,
        user: UserIdentity,
        role: Role,
    },
    /// Transform authority changed for a session
    DirectionChanged {
        session: Option<SessionId>,
        direction: SyncDirection,
    },
    /// Control action received
    Action {
        session: Option<SessionId>,
        command: ActionCommand,
    },
    /// Remote UI action received
    Simulation {
        session: Option<SessionId>,
        action: SimulatedAction,
    },
    /// `MsgHL2Header` received
    HeadsetHeader {
        session: Option<SessionId>,
        name: String,
        flag: bool,
    },
    /// Tagged vector received
    Data {
        session: Option<SessionId>,
        tag: String,
        value: Vec3,
    },
    /// Recorded trajectory received
    ActionRecorded {
        session: Option<SessionId>,
        recording: ActionRecording,
    },
    /// Registration result written into the local registry
    RegistrationApplied { object_id: i32, position: Vec3 },
    /// Registration result relayed to the client that streams
    RegistrationForwarded {
        session: SessionId,
        registration: Registration,
    },
    /// A channel failed
    TransportError { channel: ChannelId, error: String },
    /// A session ended; fires once per session
    SessionEnded { session: Option<SessionId> },
}

impl std::fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let who = |s: &Option<SessionId>| s.map(|s| format!(" [{}]", s)).unwrap_or_default();
        match self {
            LinkEvent::Listening { addr } => write!(f, "Listening on {}", addr),
            LinkEvent::SessionOpened { session, peer } => {
                write!(f, "Session {} opened from {}", session, peer)
            }
            LinkEvent::Connected { local_addr } => write!(f, "Connected from {}", local_addr),
            LinkEvent::HandshakeComplete { session, udp_peer } => {
                write!(f, "Handshake complete{}, datagrams to {}", who(session), udp_peer)
            }
            LinkEvent::HandshakeFailed { reason } => write!(f, "Handshake failed: {}", reason),
            LinkEvent::RoleChanged { session, user, role } => {
                write!(f, "User {} logged in as {}{}", user, role, who(session))
            }
            LinkEvent::DirectionChanged { session, direction } => {
                write!(f, "Sync direction: {}{}", direction, who(session))
            }
            LinkEvent::Action { session, command } => write!(f, "Action {}{}", command, who(session)),
            LinkEvent::Simulation { session, action } => {
                write!(f, "Simulated {:?}{}", action, who(session))
            }
            LinkEvent::HeadsetHeader { session, name, flag } => {
                write!(f, "Header {} = {}{}", name, flag, who(session))
            }
            LinkEvent::Data { session, tag, value } => {
                write!(f, "Data {} {}{}", tag, value, who(session))
            }
            LinkEvent::ActionRecorded { session, recording } => write!(
                f,
                "Recorded {} -> {} ({} samples){}",
                recording.source_name,
                recording.target_name,
                recording.samples.len(),
                who(session)
            ),
            LinkEvent::RegistrationApplied { object_id, position } => {
                write!(f, "Object {} registered at {}", object_id, position)
            }
            LinkEvent::RegistrationForwarded { session, registration } => write!(
                f,
                "Registration of {} forwarded to {}",
                registration.object_name, session
            ),
            LinkEvent::TransportError { channel, error } => {
                write!(f, "Channel '{}' error: {}", channel, error)
            }
            LinkEvent::SessionEnded { session } => write!(f, "Session ended{}", who(session)),
        }
    }
}

/// Result of one call to `LinkNode::step`
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// An event was produced
    Event(LinkEvent),
    /// The step timeout elapsed without events
    Timeout,
    /// The node has stopped
    Stop,
}

/// Public node state
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    /// Client side of a link
    Client {
        /// Stream connection is open
        connected: bool,
        /// Datagram peer is known
        handshake_complete: bool,
        /// Role this client logged in with
        role: Role,
        /// Current transform authority
        direction: SyncDirection,
        /// Whether this node is streaming transforms
        transmitting: bool,
    },
    /// Server side of a link
    Server {
        /// Bound stream address
        listen_addr: Option<SocketAddr>,
        /// Number of live sessions
        sessions: usize,
        /// Whether inbound transforms are applied
        inbound_enabled: bool,
    },
    /// Node has stopped
    Stop,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Client {
                connected,
                handshake_complete,
                role,
                direction,
                transmitting,
            } => {
                if !connected {
                    return write!(f, "Client (connecting...)");
                }
                let udp = if *handshake_complete { "udp ready" } else { "udp pending" };
                let tx = if *transmitting { "streaming" } else { "receiving" };
                write!(f, "Client ({}, {}, {}, {})", role, udp, direction, tx)
            }
            NodeState::Server {
                listen_addr,
                sessions,
                inbound_enabled,
            } => {
                let addr = listen_addr
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "binding...".to_string());
                let inbound = if *inbound_enabled { "inbound on" } else { "inbound muted" };
                write!(f, "Server ({}, {} session(s), {})", addr, sessions, inbound)
            }
            NodeState::Stop => write!(f, "Node stopped"),
        }
    }
}

/// What a node shares with its current state
pub(crate) struct NodeContext {
    /// Label used in log lines
    pub label: String,
    pub identity: UserIdentity,
    pub config: LinkConfig,
    pub registry: Registry,
    pub observer: SharedObserver,
    pub stats: SharedStats,
    pub events: VecDeque<LinkEvent>,
    /// Streams closed on shutdown whose writers may still be flushing
    pub closing: Vec<StreamHandle>,
}

impl NodeContext {
    pub fn emit(&mut self, event: LinkEvent) {
        tracing::debug!("Node '{}' event: {}", self.label, event);
        self.events.push_back(event);
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            max_frame_len: self.config.max_frame_len,
            stats: Some(self.stats.clone()),
        }
    }

    /// Decode an envelope, logging and dropping anything unusable
    pub fn decode(&self, channel: ChannelId, envelope: &Envelope) -> Option<Message> {
        match Message::decode(envelope) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::debug!(
                    "Node '{}' discarding '{}' from {}: {}",
                    self.label,
                    envelope.tag,
                    channel,
                    e
                );
                None
            }
        }
    }
}

/// Current state of a LinkNode (internal)
pub(crate) enum NodeStateInternal {
    /// Connected (or connecting) to a server
    Client(ClientState),
    /// Accepting clients
    Server(ServerState),
    /// Node has stopped
    Stop,
}

impl std::fmt::Debug for NodeStateInternal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStateInternal::Client(client) => f
                .debug_struct("Client")
                .field("server", &client.server_addr)
                .finish(),
            NodeStateInternal::Server(server) => f
                .debug_struct("Server")
                .field("sessions", &server.sessions.len())
                .finish(),
            NodeStateInternal::Stop => f.debug_tuple("Stop").finish(),
        }
    }
}

impl NodeStateInternal {
    pub fn to_node_state(&self) -> NodeState {
        match self {
            NodeStateInternal::Client(client) => client.to_node_state(),
            NodeStateInternal::Server(server) => server.to_node_state(),
            NodeStateInternal::Stop => NodeState::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = LinkEvent::RoleChanged {
            session: Some(SessionId(2)),
            user: UserIdentity::new(7, "Alice"),
            role: Role::Trainee,
        };
        assert_eq!(event.to_string(), "User 7 - Alice logged in as Trainee [#2]");
        let event = LinkEvent::SessionEnded { session: None };
        assert_eq!(event.to_string(), "Session ended");
    }

    #[test]
    fn test_node_state_display() {
        let state = NodeState::Client {
            connected: true,
            handshake_complete: true,
            role: Role::Coach,
            direction: SyncDirection::ServerToClient,
            transmitting: false,
        };
        assert_eq!(
            state.to_string(),
            "Client (Coach, udp ready, server to client, receiving)"
        );
        let state = NodeState::Server {
            listen_addr: None,
            sessions: 0,
            inbound_enabled: true,
        };
        assert_eq!(state.to_string(), "Server (binding..., 0 session(s), inbound on)");
    }
}
