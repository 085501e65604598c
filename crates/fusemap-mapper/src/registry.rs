//! [`MapRegistry`] – the set of active mappers and the frame dispatcher.
//!
//! Mappers are built explicitly from a [`SessionConfig`]; there is no plugin
//! discovery.  Every incoming [`DataItem`] is offered to each registered
//! mapper and processed by all that accept it, so one point cloud can feed
//! an occupancy volume and an NDT grid at the same time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use fusemap_perception::TransformResolver;
use fusemap_types::{DataItem, MapError};
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::mapper::{FusionMapper, SaveOutcome};

/// Registered mappers, keyed by name.
#[derive(Debug, Default)]
pub struct MapRegistry {
    mappers: HashMap<String, Arc<FusionMapper>>,
}

impl MapRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one mapper per `[[mappers]]` entry, all sharing `resolver`.
    ///
    /// # Errors
    ///
    /// [`MapError::Config`] when the session fails structural validation.
    /// Backend parameters are only checked by [`setup_all`][Self::setup_all].
    pub fn from_config(config: &SessionConfig, resolver: Arc<dyn TransformResolver>) -> Result<Self, MapError> {
        config.validate()?;
        let mut registry = Self::new();
        for entry in &config.mappers {
            registry.register(FusionMapper::new(entry.settings(config), Arc::clone(&resolver)));
        }
        Ok(registry)
    }

    /// Register a mapper.  A previously registered mapper with the same name
    /// is replaced and returned.
    pub fn register(&mut self, mapper: FusionMapper) -> Option<Arc<FusionMapper>> {
        let name = mapper.name().to_string();
        let previous = self.mappers.insert(name.clone(), Arc::new(mapper));
        if previous.is_some() {
            warn!(mapper = %name, "replacing registered mapper");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<Arc<FusionMapper>> {
        self.mappers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mappers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// Mappers in name order.
    pub fn mappers(&self) -> Vec<Arc<FusionMapper>> {
        self.names().iter().filter_map(|n| self.get(n)).collect()
    }

    /// Feed `item` to every mapper that accepts it.  Returns how many did.
    pub fn dispatch(&self, item: &DataItem) -> usize {
        let mut taken = 0;
        for mapper in self.mappers.values().filter(|m| m.accepts(item)) {
            mapper.process(item);
            taken += 1;
        }
        taken
    }

    /// Build every backend.  Failures are collected per mapper; one bad
    /// entry does not stop the others.
    pub fn setup_all(&self) -> Vec<(String, MapError)> {
        let mut failures = Vec::new();
        for mapper in self.mappers() {
            if let Err(e) = mapper.setup() {
                warn!(mapper = %mapper.name(), error = %e, "mapper setup failed");
                failures.push((mapper.name().to_string(), e));
            }
        }
        failures
    }

    /// Save every mapper into `root/<name>/`.
    pub fn save_all(&self, root: &Path) -> Vec<(String, Result<SaveOutcome, MapError>)> {
        let results: Vec<_> = self
            .mappers()
            .into_iter()
            .map(|m| (m.name().to_string(), m.save(root.join(m.name()))))
            .collect();
        let saved = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(SaveOutcome::Saved { .. })))
            .count();
        info!(root = %root.display(), saved, total = results.len(), "save pass complete");
        results
    }
}
