// Module declarations
pub mod builder;
pub(crate) mod client_state;
pub mod link_node;
pub(crate) mod name_generator;
pub(crate) mod server_state;
pub mod stats;
pub mod sync_engine;
pub mod types;

pub use builder::NodeBuilder;
pub use link_node::{LinkNode, NodeCommand};
pub use stats::{NodeStats, SharedStats, StatsTracker};
pub use sync_engine::SyncEngine;
pub use types::{LinkEvent, NodeState, StepResult};
