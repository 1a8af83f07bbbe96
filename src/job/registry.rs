//! Factory registry
//!
//! Maps a wire descriptor tag to factory/job constructors at
//! registration time, replacing the reflective class lookup of the
//! legacy protocol. A descriptor naming an unregistered tag is
//! rejected; it never crashes the caller.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::decode_descriptor;

use super::traits::{Job, JobFactory};

/// Constructor for an empty factory, populated via `set`
pub type FactoryCtor = fn() -> Box<dyn JobFactory>;

/// Constructor for an empty job, populated via `set`
pub type JobCtor = fn() -> Box<dyn Job>;

struct RegistryEntry {
    factory_ctor: FactoryCtor,
    job_ctor: JobCtor,
}

/// Compile-time registry of descriptor tags
pub struct FactoryRegistry {
    entries: RwLock<HashMap<&'static str, RegistryEntry>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tag. Duplicate registration is a hard error so
    /// wiring mistakes surface at startup.
    pub fn register(
        &self,
        tag: &'static str,
        factory_ctor: FactoryCtor,
        job_ctor: JobCtor,
    ) -> Result<()> {
        if tag.is_empty() {
            return Err(Error::Internal("empty factory tag".to_string()));
        }
        let mut entries = self.entries.write();
        if entries.contains_key(tag) {
            return Err(Error::Internal(format!(
                "factory tag already registered: {tag}"
            )));
        }
        entries.insert(
            tag,
            RegistryEntry {
                factory_ctor,
                job_ctor,
            },
        );
        debug!(tag, "Factory registered");
        Ok(())
    }

    /// Whether a tag is known
    pub fn contains(&self, tag: &str) -> bool {
        self.entries.read().contains_key(tag)
    }

    /// Registered tags, for diagnostics
    pub fn tags(&self) -> Vec<&'static str> {
        self.entries.read().keys().copied().collect()
    }

    /// Decode a task descriptor into a configured factory
    pub fn decode_factory(&self, descriptor: &str) -> Result<Box<dyn JobFactory>> {
        let (tag, pairs) = decode_descriptor(descriptor)?;
        let ctor = {
            let entries = self.entries.read();
            let entry = entries.get(tag.as_str()).ok_or(Error::UnknownFactory {
                tag: tag.clone(),
            })?;
            entry.factory_ctor
        };

        let mut factory = ctor();
        for (key, value) in &pairs {
            factory.set(key, value)?;
        }
        Ok(factory)
    }

    /// Decode an encoded job back into a runnable job
    pub fn decode_job(&self, encoded: &str) -> Result<Box<dyn Job>> {
        let (tag, pairs) = decode_descriptor(encoded)?;
        let ctor = {
            let entries = self.entries.read();
            let entry = entries.get(tag.as_str()).ok_or(Error::UnknownFactory {
                tag: tag.clone(),
            })?;
            entry.job_ctor
        };

        let mut job = ctor();
        for (key, value) in &pairs {
            job.set(key, value)?;
        }
        Ok(job)
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
