//! Directional transform streaming

use std::time::Duration;

use crate::protocol::TransformUpdate;
use crate::registry::Registry;
use crate::types::{PeerSide, SyncDirection};

/// Default period between two full registry broadcasts
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(100);

/// Decides when this peer streams the registry and whether it accepts
/// inbound transforms
///
/// Exactly one side of a link is the authority for a given direction; the
/// engine on the other side never transmits.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    side: PeerSide,
    direction: SyncDirection,
    running: bool,
    muted: bool,
    interval: Duration,
    elapsed: Duration,
}

impl SyncEngine {
    /// New engine, idle until a direction is set
    pub fn new(side: PeerSide, interval: Duration) -> Self {
        Self {
            side,
            direction: SyncDirection::default(),
            running: false,
            muted: false,
            interval,
            elapsed: Duration::ZERO,
        }
    }

    pub fn side(&self) -> PeerSide {
        self.side
    }

    pub fn direction(&self) -> SyncDirection {
        self.direction
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether this side is the authority for the current direction
    pub fn is_authority(&self) -> bool {
        self.direction.authority() == self.side
    }

    /// Whether `advance` currently produces updates
    pub fn is_transmitting(&self) -> bool {
        self.running && self.is_authority()
    }

    /// Adopt a direction; arms the authority side and disarms the other
    pub fn set_direction(&mut self, direction: SyncDirection) {
        self.direction = direction;
        self.running = self.is_authority();
        self.elapsed = Duration::ZERO;
    }

    /// Pause or resume streaming
    ///
    /// On the authority side this starts or stops transmission; on the
    /// receiving side it mutes or unmutes inbound transforms.
    pub fn set_streaming(&mut self, on: bool) {
        if self.is_authority() {
            self.running = on;
            self.elapsed = Duration::ZERO;
        } else {
            self.muted = !on;
        }
    }

    /// Whether inbound transforms should be applied
    pub fn accepts_inbound(&self) -> bool {
        !self.muted
    }

    /// Account for `dt` and emit one update per entity when the interval has
    /// elapsed
    ///
    /// Returns an empty list while not transmitting.
    pub fn advance(&mut self, dt: Duration, registry: &Registry) -> Vec<TransformUpdate> {
        if !self.is_transmitting() {
            self.elapsed = Duration::ZERO;
            return Vec::new();
        }
        self.elapsed += dt;
        if self.elapsed < self.interval {
            return Vec::new();
        }
        self.elapsed = Duration::ZERO;
        registry.snapshot()
    }

    /// Apply an inbound update to the registry
    ///
    /// Returns false when the update was dropped: this side is the
    /// authority, inbound is muted, or the entity is unknown. Later
    /// deliveries overwrite earlier ones regardless of send order.
    pub fn receive(&self, update: &TransformUpdate, registry: &mut Registry) -> bool {
        if self.is_authority() || !self.accepts_inbound() {
            return false;
        }
        registry.apply(update.id, update.transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Entity;
    use crate::types::{Transform, Vec3};

    const TICK: Duration = Duration::from_millis(100);

    fn registry() -> Registry {
        Registry::from_entities([Entity::new(1, "Bowl"), Entity::new(2, "Whisk")]).unwrap()
    }

    fn at(x: f32) -> Transform {
        Transform {
            position: Vec3::new(x, 0.0, 0.0),
            ..Transform::default()
        }
    }

    #[test]
    fn test_tick_emits_one_update_per_entity() {
        let registry = registry();
        let mut engine = SyncEngine::new(PeerSide::Client, TICK);
        engine.set_direction(SyncDirection::ClientToServer);

        assert!(engine.advance(Duration::from_millis(60), &registry).is_empty());
        let updates = engine.advance(Duration::from_millis(60), &registry);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].id, 1);
        assert_eq!(updates[1].id, 2);
        // accumulator restarted
        assert!(engine.advance(Duration::from_millis(10), &registry).is_empty());
    }

    #[test]
    fn test_only_the_authority_transmits() {
        let registry = registry();
        let mut client = SyncEngine::new(PeerSide::Client, TICK);
        let mut server = SyncEngine::new(PeerSide::Server, TICK);

        for direction in [SyncDirection::ClientToServer, SyncDirection::ServerToClient] {
            client.set_direction(direction);
            server.set_direction(direction);
            let mut transmitting = 0;
            for engine in [&mut client, &mut server] {
                if !engine.advance(TICK, &registry).is_empty() {
                    transmitting += 1;
                }
            }
            assert_eq!(transmitting, 1, "direction {}", direction);
        }
        assert!(server.is_transmitting());
        assert!(!client.is_transmitting());
    }

    #[test]
    fn test_streaming_toggle() {
        let registry = registry();
        let mut engine = SyncEngine::new(PeerSide::Server, TICK);
        engine.set_direction(SyncDirection::ServerToClient);
        engine.set_streaming(false);
        assert!(engine.advance(TICK, &registry).is_empty());
        engine.set_streaming(true);
        assert_eq!(engine.advance(TICK, &registry).len(), 2);

        // receiving side: the toggle mutes inbound instead
        engine.set_direction(SyncDirection::ClientToServer);
        engine.set_streaming(false);
        assert!(!engine.accepts_inbound());
        assert!(!engine.is_transmitting());
        engine.set_streaming(true);
        assert!(engine.accepts_inbound());
    }

    #[test]
    fn test_last_delivered_update_wins() {
        let mut registry = registry();
        let mut engine = SyncEngine::new(PeerSide::Server, TICK);
        engine.set_direction(SyncDirection::ClientToServer);

        // Sent as A then B, delivered B then A
        let a = TransformUpdate { id: 1, transform: at(1.0) };
        let b = TransformUpdate { id: 1, transform: at(2.0) };
        assert!(engine.receive(&b, &mut registry));
        assert!(engine.receive(&a, &mut registry));
        assert_eq!(registry.get(1).unwrap().transform, at(1.0));
    }

    #[test]
    fn test_unknown_entity_is_ignored() {
        let mut registry = registry();
        let before = registry.snapshot();
        let mut engine = SyncEngine::new(PeerSide::Client, TICK);
        engine.set_direction(SyncDirection::ServerToClient);

        let update = TransformUpdate { id: 99, transform: at(5.0) };
        assert!(!engine.receive(&update, &mut registry));
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn test_authority_ignores_inbound() {
        let mut registry = registry();
        let mut engine = SyncEngine::new(PeerSide::Client, TICK);
        engine.set_direction(SyncDirection::ClientToServer);
        let update = TransformUpdate { id: 1, transform: at(3.0) };
        assert!(!engine.receive(&update, &mut registry));
        assert_eq!(registry.get(1).unwrap().transform, Transform::default());
    }
}
