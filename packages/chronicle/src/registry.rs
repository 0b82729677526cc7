//! Explicit registry of known entity types.
//!
//! Applications list their command and event type names once, at startup.
//! The repository refuses commands it does not know, and the pipeline
//! refuses to journal events of unknown types.
//!
//! ```ignore
//! let registry = EntityRegistry::builder()
//!     .with_command("OpenAccount")
//!     .with_command("Deposit")
//!     .with_event("AccountOpened")
//!     .with_event("Deposited")
//!     .build();
//! ```

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Whether a registered type is a command or an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Command,
    Event,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Command => f.write_str("command"),
            EntityKind::Event => f.write_str("event"),
        }
    }
}

/// One registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub name: &'static str,
    pub kind: EntityKind,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{name} is already registered as a {existing}")]
    Duplicate {
        name: &'static str,
        existing: EntityKind,
    },
}

/// Immutable set of known command and event types.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    types: BTreeMap<&'static str, EntityKind>,
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::default()
    }

    pub fn knows_command(&self, name: &str) -> bool {
        self.types.get(name) == Some(&EntityKind::Command)
    }

    pub fn knows_event(&self, name: &str) -> bool {
        self.types.get(name) == Some(&EntityKind::Event)
    }

    /// Whether `name` is registered as either kind.
    pub fn knows(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// All registered types, sorted by name.
    pub fn descriptors(&self) -> impl Iterator<Item = EntityDescriptor> + '_ {
        self.types
            .iter()
            .map(|(&name, &kind)| EntityDescriptor { name, kind })
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Builder for [`EntityRegistry`].
#[derive(Debug, Default)]
pub struct EntityRegistryBuilder {
    types: BTreeMap<&'static str, EntityKind>,
}

impl EntityRegistryBuilder {
    /// Register a command type.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered. Use `try_with_command` for a
    /// non-panicking version.
    pub fn with_command(self, name: &'static str) -> Self {
        self.try_with_command(name).unwrap_or_else(|e| panic!("{}", e))
    }

    /// Register an event type.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered. Use `try_with_event` for a
    /// non-panicking version.
    pub fn with_event(self, name: &'static str) -> Self {
        self.try_with_event(name).unwrap_or_else(|e| panic!("{}", e))
    }

    pub fn try_with_command(self, name: &'static str) -> Result<Self, RegistryError> {
        self.insert(name, EntityKind::Command)
    }

    pub fn try_with_event(self, name: &'static str) -> Result<Self, RegistryError> {
        self.insert(name, EntityKind::Event)
    }

    pub fn build(self) -> EntityRegistry {
        EntityRegistry { types: self.types }
    }

    fn insert(mut self, name: &'static str, kind: EntityKind) -> Result<Self, RegistryError> {
        if let Some(&existing) = self.types.get(name) {
            return Err(RegistryError::Duplicate { name, existing });
        }
        self.types.insert(name, kind);
        Ok(self)
    }
}
