//! Module system for the device mapper
//!
//! Modules customize how mappings behave. Each one exposes the six-hook
//! operation vector of [`MapperModule`] and is loaded by name, either from
//! the built-in set or from a `dm_<name>` library in the module directory.
//!
//! Mappings hold a [`ModuleRef`] for as long as they use a module, and a
//! module with live references refuses to unload.

use crate::error::{Error, Result};
use crate::names::check_module_name;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

pub mod debug;
pub mod loader;
pub mod traits;

pub use debug::DebugModule;
pub use loader::{ModuleHandle, ModuleLoader, StandardLoader};
pub use traits::{IoDirection, IoRequest, MapperModule, MappingContext, OPS_REVISION, OPS_SYMBOL};

/// A loaded module
///
/// `module` is declared before `handle` so that the instance is always
/// dropped before the code it came from.
struct ModuleEntry {
    name: String,
    module: Box<dyn MapperModule>,
    handle: ModuleHandle,
}

/// Counted reference to a loaded module
///
/// The registry counts outstanding `ModuleRef`s and refuses to unload a
/// module while any exist. Dropping the reference releases it.
pub struct ModuleRef {
    entry: Arc<ModuleEntry>,
}

impl ModuleRef {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn ops(&self) -> &dyn MapperModule {
        self.entry.module.as_ref()
    }
}

impl std::fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRef").field("name", &self.entry.name).finish()
    }
}

/// Snapshot of a loaded module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub refcount: usize,
    pub revision: u32,
    pub builtin: bool,
}

impl ModuleInfo {
    fn of(entry: &Arc<ModuleEntry>) -> Self {
        Self {
            name: entry.name.clone(),
            refcount: references(entry),
            revision: entry.module.revision(),
            builtin: entry.handle.is_builtin(),
        }
    }
}

/// The registry's own `Arc` is not a reference
fn references(entry: &Arc<ModuleEntry>) -> usize {
    Arc::strong_count(entry) - 1
}

/// Module registry - tracks loaded modules
///
/// Load and unload take the write lock; lookups and reference acquisition
/// share the read lock, so a reference can never appear while an unload is
/// deciding whether the module is busy.
pub struct ModuleRegistry {
    loader: Box<dyn ModuleLoader>,
    modules: RwLock<Vec<Arc<ModuleEntry>>>,
}

impl ModuleRegistry {
    /// Create a registry backed by `loader`
    pub fn new(loader: Box<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            modules: RwLock::new(Vec::new()),
        }
    }

    /// Registry that only knows the built-in modules
    pub fn with_builtins() -> Self {
        Self::new(Box::new(StandardLoader::default()))
    }

    /// Load a module by name
    pub fn load(&self, name: &str) -> Result<()> {
        check_module_name(name)?;

        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name == name) {
            return Err(Error::AlreadyLoaded(name.to_string()));
        }

        let handle = self.loader.open_module(name)?;
        let module = match self.loader.resolve_ops(&handle) {
            Ok(module) => module,
            Err(e) => {
                self.loader.close_module(handle);
                return Err(e);
            }
        };

        let rejected = if module.revision() != OPS_REVISION {
            Some(Error::InvalidModule(format!(
                "module '{}' implements revision {} (expected {})",
                name,
                module.revision(),
                OPS_REVISION
            )))
        } else if module.name() != name {
            Some(Error::InvalidModule(format!(
                "module loaded as '{}' calls itself '{}'",
                name,
                module.name()
            )))
        } else {
            module.initialize().err()
        };

        if let Some(e) = rejected {
            drop(module);
            self.loader.close_module(handle);
            return Err(e);
        }

        tracing::info!(
            module = %name,
            builtin = handle.is_builtin(),
            "Module loaded"
        );

        modules.push(Arc::new(ModuleEntry {
            name: name.to_string(),
            module,
            handle,
        }));
        metrics::gauge!("dm_modules_loaded").set(modules.len() as f64);
        Ok(())
    }

    /// Unload a module by name
    pub fn unload(&self, name: &str) -> Result<()> {
        let mut modules = self.modules.write();

        let pos = modules
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| Error::NotLoaded(name.to_string()))?;

        let refs = references(&modules[pos]);
        if refs > 0 {
            return Err(Error::Busy {
                name: name.to_string(),
                refs,
            });
        }

        let entry = modules.swap_remove(pos);
        let entry = match Arc::try_unwrap(entry) {
            Ok(entry) => entry,
            Err(entry) => {
                // A reference was still being released
                let refs = references(&entry);
                modules.push(entry);
                return Err(Error::Busy {
                    name: name.to_string(),
                    refs,
                });
            }
        };

        entry.module.finalize();
        let ModuleEntry { module, handle, .. } = entry;
        drop(module);
        self.loader.close_module(handle);

        metrics::gauge!("dm_modules_loaded").set(modules.len() as f64);
        tracing::info!(module = %name, "Module unloaded");
        Ok(())
    }

    /// Get a snapshot of a loaded module
    pub fn lookup(&self, name: &str) -> Option<ModuleInfo> {
        let modules = self.modules.read();
        modules.iter().find(|m| m.name == name).map(ModuleInfo::of)
    }

    /// Take a counted reference to a loaded module
    pub fn acquire(&self, name: &str) -> Option<ModuleRef> {
        let modules = self.modules.read();
        modules
            .iter()
            .find(|m| m.name == name)
            .map(|entry| ModuleRef {
                entry: Arc::clone(entry),
            })
    }

    /// List all loaded modules, in name order
    pub fn list(&self) -> Vec<ModuleInfo> {
        let mut list: Vec<ModuleInfo> = self.modules.read().iter().map(ModuleInfo::of).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    /// Unload every module that is not in use
    pub fn unload_all(&self) {
        let names: Vec<String> = self.modules.read().iter().map(|m| m.name.clone()).collect();
        for name in names {
            if let Err(e) = self.unload(&name) {
                tracing::warn!(module = %name, error = %e, "Module left loaded at shutdown");
            }
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
