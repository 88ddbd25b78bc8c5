use std::net::SocketAddr;

use crate::config::LinkConfig;
use crate::error::Result;
use crate::node::link_node::LinkNode;
use crate::registry::Registry;

/// Which side of the link a node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeMode {
    /// Connect to a server
    Client { server: SocketAddr },
    /// Accept clients
    Server { bind: SocketAddr },
}

impl LinkNode {
    /// Build a client node that connects to `server`
    ///
    /// # Example
    /// ```no_run
    /// use holo_link::{LinkNode, StepResult};
    ///
    /// # async fn example() -> holo_link::Result<()> {
    /// let mut node = LinkNode::connect("192.168.0.221:8888".parse().unwrap())
    ///     .user_id(7)
    ///     .user_name("Alice".to_string())
    ///     .await?;
    /// while let StepResult::Event(event) = node.step().await? {
    ///     println!("{}", event);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn connect(server: SocketAddr) -> NodeBuilder {
        NodeBuilder::new(NodeMode::Client { server })
    }

    /// Build a server node listening on `bind`
    pub fn listen(bind: SocketAddr) -> NodeBuilder {
        NodeBuilder::new(NodeMode::Server { bind })
    }
}

/// Builder for link nodes
///
/// Allows configuring the node before creating it. Awaiting the builder
/// starts the node; connection progress is then reported by `step`.
#[must_use = "NodeBuilder does nothing unless you `.await` it"]
#[derive(Debug)]
pub struct NodeBuilder {
    mode: NodeMode,
    config: LinkConfig,
    registry: Registry,
}

impl NodeBuilder {
    fn new(mode: NodeMode) -> Self {
        Self {
            mode,
            config: LinkConfig::default(),
            registry: Registry::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the user id announced to the peer
    pub fn user_id(mut self, id: i32) -> Self {
        self.config.user_id = id;
        self
    }

    /// Set the user name; a random one is generated otherwise
    pub fn user_name(mut self, name: String) -> Self {
        self.config.user_name = Some(name);
        self
    }

    /// Set the transform streaming period in milliseconds
    pub fn sync_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.sync_interval_ms = interval_ms;
        self
    }

    /// Set how long a client waits for `ReplyUdpHost`
    pub fn handshake_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.handshake_timeout_ms = timeout_ms;
        self
    }

    /// Set the step timeout in milliseconds
    pub fn step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.step_timeout_ms = timeout_ms;
        self
    }

    /// Set the largest accepted stream frame
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.config.max_frame_len = len;
        self
    }

    /// Make the server the transform authority for new sessions
    pub fn server_to_client(mut self, server_to_client: bool) -> Self {
        self.config.server_to_client = server_to_client;
        self
    }

    /// Entities this node synchronizes
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }
}

impl std::future::IntoFuture for NodeBuilder {
    type Output = Result<LinkNode>;
    type IntoFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { LinkNode::new_internal(self.config, self.mode, self.registry) })
    }
}
