//! Handler Registry
//!
//! Maps block type tags to handlers. A process-wide default registry holding
//! the built-in blocks is created on first use and never mutated afterwards;
//! callers that need external tool blocks build their own registry.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use once_cell::sync::Lazy;

use super::builtin;
use super::BlockHandler;

/// Lazily-initialized registry with only the built-in handlers.
static DEFAULT_REGISTRY: Lazy<Arc<HandlerRegistry>> =
    Lazy::new(|| Arc::new(HandlerRegistry::with_builtins()));

/// Returns the shared registry with the built-in handlers.
pub fn default_registry() -> Arc<HandlerRegistry> {
    Arc::clone(&DEFAULT_REGISTRY)
}

/// Block type tag to handler mapping.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn BlockHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Registers a handler under its own type tag, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn BlockHandler>) {
        let block_type = handler.block_type().to_string();
        self.register_as(block_type, handler);
    }

    /// Registers a handler under an explicit type tag (aliases).
    pub fn register_as(&mut self, block_type: impl Into<String>, handler: Arc<dyn BlockHandler>) {
        let block_type = block_type.into();
        debug!("Registering handler for block type '{}'", block_type);
        self.handlers.insert(block_type, handler);
    }

    /// Gets the handler for a type tag.
    pub fn get(&self, block_type: &str) -> Option<Arc<dyn BlockHandler>> {
        self.handlers.get(block_type).cloned()
    }

    pub fn contains(&self, block_type: &str) -> bool {
        self.handlers.contains_key(block_type)
    }

    /// Sorted list of registered type tags.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
