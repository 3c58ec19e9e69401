use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use reach_core::config::AdaptersConfig;
use reach_core::error::{ReachError, Result};
use reach_core::traits::ToolAdapter;

use crate::adapters::fallback::SmallDeterministicFallback;
use crate::adapters::hosted::HostedAdapter;
use crate::adapters::local::LocalAdapter;

#[derive(Default, Clone)]
struct Bindings {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
    /// tool name -> adapter name
    tools: BTreeMap<String, String>,
    fallback: Option<Arc<dyn ToolAdapter>>,
}

/// Registry mapping tool names to adapters.
///
/// Writers clone the current bindings, modify the clone, and swap it in under
/// the write lock. Runs take a [`AdapterSet`] snapshot at start and never
/// touch the lock again.
pub struct AdapterRegistry {
    inner: RwLock<Arc<Bindings>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Bindings::default())),
        }
    }

    /// Build from the `[adapters]` config section.
    pub fn from_config(config: &AdaptersConfig) -> Result<Self> {
        let registry = Self::new();
        for hosted in &config.hosted {
            registry.register(HostedAdapter::from_config(hosted)?)?;
            for tool in &hosted.tools {
                registry.bind(tool, &hosted.name)?;
            }
        }
        for local in &config.local {
            registry.register(LocalAdapter::from_config(local))?;
            for tool in &local.tools {
                registry.bind(tool, &local.name)?;
            }
        }
        if config.fallback {
            registry.set_fallback(SmallDeterministicFallback::new())?;
        }
        info!(
            hosted = config.hosted.len(),
            local = config.local.len(),
            fallback = config.fallback,
            "Adapter registry built"
        );
        Ok(registry)
    }

    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Bindings) -> Result<()>,
    {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| ReachError::Internal("adapter registry lock poisoned".into()))?;
        let mut next = (**guard).clone();
        f(&mut next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Register an adapter under its own name. Names are unique.
    pub fn register(&self, adapter: impl ToolAdapter) -> Result<()> {
        self.register_arc(Arc::new(adapter))
    }

    pub fn register_arc(&self, adapter: Arc<dyn ToolAdapter>) -> Result<()> {
        let name = adapter.name().to_string();
        self.update(|b| {
            if b.adapters.contains_key(&name) {
                return Err(ReachError::InvalidInput(format!(
                    "adapter already registered: {}",
                    name
                )));
            }
            debug!(adapter = %name, kind = %adapter.kind(), "Adapter registered");
            b.adapters.insert(name.clone(), adapter);
            Ok(())
        })
    }

    /// Route `tool` to the adapter called `adapter`.
    pub fn bind(&self, tool: &str, adapter: &str) -> Result<()> {
        self.update(|b| {
            if !b.adapters.contains_key(adapter) {
                return Err(ReachError::AdapterNotFound(adapter.to_string()));
            }
            b.tools.insert(tool.to_string(), adapter.to_string());
            Ok(())
        })
    }

    /// Adapter used for tools with no explicit binding.
    pub fn set_fallback(&self, adapter: impl ToolAdapter) -> Result<()> {
        let adapter: Arc<dyn ToolAdapter> = Arc::new(adapter);
        self.update(|b| {
            b.fallback = Some(adapter);
            Ok(())
        })
    }

    /// Immutable view for one run.
    pub fn snapshot(&self) -> Result<AdapterSet> {
        let guard = self
            .inner
            .read()
            .map_err(|_| ReachError::Internal("adapter registry lock poisoned".into()))?;
        Ok(AdapterSet {
            bindings: Arc::clone(&guard),
        })
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen adapter bindings. Cheap to clone; lookups take no lock.
#[derive(Clone, Default)]
pub struct AdapterSet {
    bindings: Arc<Bindings>,
}

impl AdapterSet {
    /// Resolve the adapter serving `tool`.
    pub fn resolve(&self, tool: &str) -> Result<Arc<dyn ToolAdapter>> {
        if let Some(adapter) = self
            .bindings
            .tools
            .get(tool)
            .and_then(|name| self.bindings.adapters.get(name))
        {
            return Ok(Arc::clone(adapter));
        }
        self.bindings
            .fallback
            .clone()
            .ok_or_else(|| ReachError::AdapterNotFound(tool.to_string()))
    }

    /// Bound tool names, sorted.
    pub fn tools(&self) -> Vec<&str> {
        self.bindings.tools.keys().map(String::as_str).collect()
    }

    pub fn has_fallback(&self) -> bool {
        self.bindings.fallback.is_some()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet")
            .field("tools", &self.bindings.tools)
            .field("fallback", &self.has_fallback())
            .finish()
    }
}
