//! Registry of synchronized entities

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::protocol::TransformUpdate;
use crate::types::{Transform, Vec3};

/// A synchronized scene object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Entity {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            transform: Transform::default(),
            enabled: true,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }
}

/// Fixed set of entities with O(1) lookup by id
///
/// Entities are created at configuration time and never removed. Iteration
/// follows insertion order so every sync tick walks the registry the same way.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entities: Vec<Entity>,
    index: HashMap<i32, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry, rejecting duplicate ids
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Result<Self> {
        let mut registry = Self::new();
        for entity in entities {
            registry.insert(entity)?;
        }
        Ok(registry)
    }

    /// Load a JSON array of entities
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a JSON array of entities
    pub fn from_json(text: &str) -> Result<Self> {
        let entities: Vec<Entity> = serde_json::from_str(text)?;
        Self::from_entities(entities)
    }

    /// Add an entity; its id must be unused
    pub fn insert(&mut self, entity: Entity) -> Result<()> {
        if self.index.contains_key(&entity.id) {
            return Err(LinkError::DuplicateEntity(entity.id));
        }
        self.index.insert(entity.id, self.entities.len());
        self.entities.push(entity);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: i32) -> Option<&Entity> {
        self.index.get(&id).map(|&i| &self.entities[i])
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut Entity> {
        self.index.get(&id).map(|&i| &mut self.entities[i])
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    /// Overwrite the transform of the entity with `id`
    ///
    /// Returns false when no such entity exists.
    pub fn apply(&mut self, id: i32, transform: Transform) -> bool {
        match self.get_mut(id) {
            Some(entity) => {
                entity.transform = transform;
                true
            }
            None => false,
        }
    }

    /// Overwrite only the position, as a registration result does
    pub fn set_position(&mut self, id: i32, position: Vec3) -> bool {
        match self.get_mut(id) {
            Some(entity) => {
                entity.transform.position = position;
                true
            }
            None => false,
        }
    }

    /// One update per entity, in registry order
    pub fn snapshot(&self) -> Vec<TransformUpdate> {
        self.entities
            .iter()
            .map(|e| TransformUpdate {
                id: e.id,
                transform: e.transform,
            })
            .collect()
    }
}
