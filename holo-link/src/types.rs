/// Core types for the holo-link library
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Three-component float vector (position, Euler rotation in degrees, scale)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);
    pub const ONE: Vec3 = Vec3::new(1.0, 1.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Quaternion rotation, only used by recorded trajectories
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

/// Pose of a synchronized entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    /// Euler angles in degrees
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

/// Role a user logs in with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Drives and demonstrates
    Coach,
    /// Receives guidance
    Trainee,
    /// Not logged in yet
    #[default]
    Unknown,
}

impl Role {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coach => "Coach",
            Role::Trainee => "Trainee",
            Role::Unknown => "Unknown",
        }
    }

    /// Parse a wire string; anything unrecognized is `Unknown`
    pub fn from_wire(s: &str) -> Self {
        match s {
            "Coach" => Role::Coach,
            "Trainee" => Role::Trainee,
            _ => Role::Unknown,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which end of the link a node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSide {
    /// Connects to the server (headset)
    Client,
    /// Listens for clients (PC)
    Server,
}

/// Which side is authoritative for entity transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncDirection {
    /// Client streams, server applies
    #[default]
    ClientToServer,
    /// Server streams, client applies
    ServerToClient,
}

impl SyncDirection {
    /// The side allowed to transmit transforms
    pub fn authority(&self) -> PeerSide {
        match self {
            SyncDirection::ClientToServer => PeerSide::Client,
            SyncDirection::ServerToClient => PeerSide::Server,
        }
    }

    /// Wire flags `(clientToServer, serverToClient)`
    pub fn flags(&self) -> (bool, bool) {
        match self {
            SyncDirection::ClientToServer => (true, false),
            SyncDirection::ServerToClient => (false, true),
        }
    }

    /// Build from wire flags; exactly one flag must be set
    pub fn from_flags(client_to_server: bool, server_to_client: bool) -> Option<Self> {
        match (client_to_server, server_to_client) {
            (true, false) => Some(SyncDirection::ClientToServer),
            (false, true) => Some(SyncDirection::ServerToClient),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::ClientToServer => write!(f, "client to server"),
            SyncDirection::ServerToClient => write!(f, "server to client"),
        }
    }
}

/// User identity carried in handshake, login and direction messages
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity {
    pub id: i32,
    pub name: String,
}

impl UserIdentity {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.id, self.name)
    }
}

/// Identifier of an accepted stream connection on a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-connection session state
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Remote user, known once RequestUdpHost arrived
    pub user: Option<UserIdentity>,
    /// Set once by LoginRole
    pub role: Role,
    /// Current transform authority
    pub direction: SyncDirection,
    /// Datagram target, fixed once resolved
    pub udp_peer: Option<SocketAddr>,
}

impl Session {
    /// Record the role; a session logs in only once
    pub fn set_role(&mut self, role: Role) -> Result<()> {
        if self.role != Role::Unknown {
            return Err(LinkError::RoleAlreadySet(self.role.to_string()));
        }
        self.role = role;
        Ok(())
    }

    /// Record the datagram peer; the first resolved address wins
    pub fn set_udp_peer(&mut self, addr: SocketAddr) -> bool {
        if self.udp_peer.is_some() {
            return false;
        }
        self.udp_peer = Some(addr);
        true
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}", user)?,
            None => write!(f, "(anonymous)")?,
        }
        write!(f, ", {}, {}", self.role, self.direction)?;
        if let Some(peer) = self.udp_peer {
            write!(f, ", udp {}", peer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_flags() {
        assert_eq!(
            SyncDirection::from_flags(true, false),
            Some(SyncDirection::ClientToServer)
        );
        assert_eq!(
            SyncDirection::from_flags(false, true),
            Some(SyncDirection::ServerToClient)
        );
        assert_eq!(SyncDirection::from_flags(true, true), None);
        assert_eq!(SyncDirection::from_flags(false, false), None);
        assert_eq!(SyncDirection::ServerToClient.flags(), (false, true));
        assert_eq!(SyncDirection::ClientToServer.authority(), PeerSide::Client);
    }

    #[test]
    fn test_role_wire_strings() {
        assert_eq!(Role::from_wire("Coach"), Role::Coach);
        assert_eq!(Role::from_wire("Trainee"), Role::Trainee);
        assert_eq!(Role::from_wire("coach"), Role::Unknown);
        assert_eq!(Role::Trainee.to_string(), "Trainee");
    }

    #[test]
    fn test_session_role_is_set_once() {
        let mut session = Session::default();
        assert!(session.set_role(Role::Trainee).is_ok());
        assert!(matches!(
            session.set_role(Role::Coach),
            Err(LinkError::RoleAlreadySet(_))
        ));
        assert_eq!(session.role, Role::Trainee);
    }

    #[test]
    fn test_session_udp_peer_is_fixed() {
        let mut session = Session::default();
        let a: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert!(session.set_udp_peer(a));
        assert!(!session.set_udp_peer(b));
        assert_eq!(session.udp_peer, Some(a));
    }
}
