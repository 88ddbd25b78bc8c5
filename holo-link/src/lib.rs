//! # holo-link
//!
//! Coach/trainee link between a PC and a mixed-reality headset.
//!
//! ## Overview
//!
//! The `holo-link` library connects a PC application (server) with a headset
//! (client). Control traffic such as logins, sync-direction changes and
//! actions travels as named events over a framed TCP stream, while entity
//! poses are streamed over UDP datagrams by whichever side currently holds
//! transform authority.
//!
//! ## Key Features
//!
//! - Positional little-endian binary codec and tagged envelopes
//! - Non-blocking TCP and UDP channels reporting to an observer
//! - Datagram handshake (`RequestUdpHost` / `ReplyUdpHost`) with a deadline
//! - Per-session roles and transform authority
//! - Entity registry loaded from JSON
//!
//! ## Example
//!
//! ```rust,no_run
//! use holo_link::{LinkNode, NodeCommand, Role, StepResult};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut node = LinkNode::connect("127.0.0.1:8888".parse()?)
//!         .user_id(1)
//!         .user_name("Alice".to_string())
//!         .await?;
//!     node.sender().send(NodeCommand::LoginAs(Role::Trainee))?;
//!
//!     loop {
//!         match node.step().await? {
//!             StepResult::Event(event) => println!("{}", event),
//!             StepResult::Timeout => println!("{}", node.node_state()),
//!             StepResult::Stop => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod network;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod types;

// Re-exports for convenience
pub use config::LinkConfig;
pub use envelope::Envelope;
pub use error::{LinkError, Result};
pub use node::{LinkEvent, LinkNode, NodeBuilder, NodeCommand, NodeState, NodeStats, StepResult};
pub use protocol::{ActionCommand, ActionRecording, Message, Registration, SimulatedAction};
pub use registry::{Entity, Registry};
pub use types::{PeerSide, Quat, Role, Session, SessionId, SyncDirection, Transform, UserIdentity, Vec3};
