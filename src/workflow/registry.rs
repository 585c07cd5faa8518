/// Workflow definition registry using ArcSwap
///
/// Definitions are compiled in code and registered by name at startup. Reads
/// are lock-free; a registration swaps in a new map while concurrent lookups
/// keep the snapshot they loaded.

use crate::workflow::{definitions, types::Definition};
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free registry of workflow definitions keyed by name
#[derive(Debug)]
pub struct DefinitionHolder {
    definitions: ArcSwap<HashMap<String, Arc<Definition>>>,
}

impl Default for DefinitionHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionHolder {
    /// Registry pre-loaded with the built-in definitions
    pub fn new() -> Self {
        let holder = Self::empty();
        holder.register_definition(definitions::ECHO, definitions::echo());
        holder
    }

    pub fn empty() -> Self {
        Self {
            definitions: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Add a definition under `name`
    ///
    /// Registering the same name twice is a programming error and panics.
    pub fn register_definition(&self, name: &str, definition: Definition) {
        let definition = Arc::new(definition);
        let previous = self.definitions.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(name.to_string(), Arc::clone(&definition));
            next
        });
        if previous.contains_key(name) {
            panic!("workflow definition {:?} registered twice", name);
        }
        tracing::debug!("📝 Registered workflow definition: {}", name);
    }

    pub fn definition(&self, name: &str) -> Option<Arc<Definition>> {
        self.definitions.load().get(name).cloned()
    }

    /// Snapshot of every registered definition
    pub fn definitions(&self) -> HashMap<String, Arc<Definition>> {
        HashMap::clone(&self.definitions.load())
    }
}
