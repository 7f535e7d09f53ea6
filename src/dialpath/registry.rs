//! Dial-path registry
//!
//! Maps network names to dialers. Entries are weak: the registry resolves a
//! name but never keeps a session alive. Resolving a name whose session has
//! gone away is a reported [`DialError::SessionClosed`], not a failed dial.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DialError, DialStream, Dialer};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Dial path already registered: {0}")]
    Duplicate(String),
}

impl serde::Serialize for RegistryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Name-to-dialer lookup shared with the database driver layer
pub trait DialRegistry: Send + Sync {
    /// Fails if `name` is taken; an existing entry is never replaced
    fn register(&self, name: &str, dialer: Weak<dyn Dialer>) -> Result<(), RegistryError>;

    /// Returns false if nothing was registered under `name`
    fn unregister(&self, name: &str) -> bool;

    fn resolve(&self, name: &str) -> Result<Arc<dyn Dialer>, DialError>;

    fn names(&self) -> Vec<String>;
}

/// Resolve `name` and dial `addr` through it
pub async fn dial(
    registry: &dyn DialRegistry,
    name: &str,
    addr: &str,
    cancel: &CancellationToken,
) -> Result<DialStream, DialError> {
    let dialer = registry.resolve(name)?;
    debug!("Dialing {} via {}", addr, name);
    dialer.dial(addr, cancel).await
}

#[derive(Default)]
pub struct InMemoryDialRegistry {
    entries: DashMap<String, Weak<dyn Dialer>>,
}

impl InMemoryDialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DialRegistry for InMemoryDialRegistry {
    fn register(&self, name: &str, dialer: Weak<dyn Dialer>) -> Result<(), RegistryError> {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(_) => {
                warn!("Refusing to overwrite dial path {}", name);
                Err(RegistryError::Duplicate(name.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(dialer);
                debug!("Registered dial path {}", name);
                Ok(())
            }
        }
    }

    fn unregister(&self, name: &str) -> bool {
        let removed = self.entries.remove(name).is_some();
        if removed {
            debug!("Unregistered dial path {}", name);
        }
        removed
    }

    fn resolve(&self, name: &str) -> Result<Arc<dyn Dialer>, DialError> {
        let weak = self
            .entries
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DialError::UnknownPath(name.to_string()))?;

        match weak.upgrade() {
            Some(dialer) if dialer.is_open() => Ok(dialer),
            _ => Err(DialError::SessionClosed(name.to_string())),
        }
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<InMemoryDialRegistry>> = OnceLock::new();

/// Process-wide registry for drivers that look dial paths up by name
pub fn global_registry() -> Arc<InMemoryDialRegistry> {
    GLOBAL_REGISTRY
        .get_or_init(|| Arc::new(InMemoryDialRegistry::new()))
        .clone()
}
