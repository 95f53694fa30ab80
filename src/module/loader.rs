//! Module loader - resolves module names to operation vectors

use super::debug::{DebugModule, DEBUG_MODULE_NAME};
use super::traits::{LibraryConstructor, MapperModule, ModuleConstructor, OPS_SYMBOL};
use crate::error::{Error, Result};
use crate::names::check_module_name;
use libloading::Library;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Opened module code
pub enum ModuleHandle {
    /// Compiled into this binary
    Builtin { name: String, ctor: ModuleConstructor },
    /// Dynamic library opened from the module directory
    Library { name: String, path: PathBuf, library: Library },
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        match self {
            ModuleHandle::Builtin { name, .. } => name,
            ModuleHandle::Library { name, .. } => name,
        }
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, ModuleHandle::Builtin { .. })
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleHandle::Builtin { name, .. } => {
                f.debug_struct("Builtin").field("name", name).finish()
            }
            ModuleHandle::Library { name, path, .. } => f
                .debug_struct("Library")
                .field("name", name)
                .field("path", path)
                .finish(),
        }
    }
}

/// Opens module code and resolves its operation vector
pub trait ModuleLoader: Send + Sync {
    /// Locate and open the module called `name`
    fn open_module(&self, name: &str) -> Result<ModuleHandle>;

    /// Resolve the operation vector of an opened module
    fn resolve_ops(&self, handle: &ModuleHandle) -> Result<Box<dyn MapperModule>>;

    /// Release the module code. Every instance obtained from
    /// [`ModuleLoader::resolve_ops`] must be dropped first.
    fn close_module(&self, handle: ModuleHandle);
}

/// Loader that knows the built-in modules and, optionally, a directory of
/// module libraries named `dm_<name>` (`libdm_<name>.so` on Linux).
pub struct StandardLoader {
    search_dir: Option<PathBuf>,
    builtins: HashMap<String, ModuleConstructor>,
}

impl StandardLoader {
    pub fn new(search_dir: Option<PathBuf>) -> Self {
        let mut builtins: HashMap<String, ModuleConstructor> = HashMap::new();
        builtins.insert(DEBUG_MODULE_NAME.to_string(), DebugModule::boxed);
        Self {
            search_dir,
            builtins,
        }
    }

    /// Register an additional built-in module
    pub fn with_builtin(mut self, name: &str, ctor: ModuleConstructor) -> Self {
        self.builtins.insert(name.to_string(), ctor);
        self
    }

    /// Library path a module name resolves to, if a module directory is set
    /// and the name cannot escape it
    pub fn module_path(&self, name: &str) -> Option<PathBuf> {
        check_module_name(name).ok()?;
        self.search_dir
            .as_ref()
            .map(|dir| dir.join(libloading::library_filename(format!("dm_{}", name))))
    }

    pub fn search_dir(&self) -> Option<&Path> {
        self.search_dir.as_deref()
    }
}

impl Default for StandardLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModuleLoader for StandardLoader {
    fn open_module(&self, name: &str) -> Result<ModuleHandle> {
        if let Some(ctor) = self.builtins.get(name) {
            return Ok(ModuleHandle::Builtin {
                name: name.to_string(),
                ctor: *ctor,
            });
        }

        let path = self
            .module_path(name)
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))?;

        if !path.exists() {
            debug!(module = %name, path = %path.display(), "No module library");
            return Err(Error::ModuleNotFound(name.to_string()));
        }

        // SAFETY: module libraries come from the administrator-controlled
        // module directory and run their initializers here.
        let library = unsafe { Library::new(&path) }.map_err(|e| {
            warn!(module = %name, path = %path.display(), error = %e, "Failed to open module library");
            Error::ModuleNotFound(name.to_string())
        })?;

        debug!(module = %name, path = %path.display(), "Opened module library");
        Ok(ModuleHandle::Library {
            name: name.to_string(),
            path,
            library,
        })
    }

    fn resolve_ops(&self, handle: &ModuleHandle) -> Result<Box<dyn MapperModule>> {
        match handle {
            ModuleHandle::Builtin { ctor, .. } => Ok(ctor()),
            ModuleHandle::Library { name, library, .. } => {
                // SAFETY: `dm_ops` is declared through `declare_module!`,
                // which fixes its signature to `LibraryConstructor`.
                let ctor = unsafe { library.get::<LibraryConstructor>(OPS_SYMBOL.as_bytes()) }
                    .map_err(|_| Error::SymbolMissing {
                        module: name.clone(),
                        symbol: OPS_SYMBOL.to_string(),
                    })?;
                Ok(unsafe { ctor() })
            }
        }
    }

    fn close_module(&self, handle: ModuleHandle) {
        match handle {
            ModuleHandle::Builtin { name, .. } => {
                debug!(module = %name, "Released built-in module");
            }
            ModuleHandle::Library { name, library, .. } => {
                if let Err(e) = library.close() {
                    warn!(module = %name, error = %e, "Failed to close module library");
                } else {
                    debug!(module = %name, "Closed module library");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_debug_module() -> Result<()> {
        let loader = StandardLoader::default();
        let handle = loader.open_module("debug")?;
        assert!(handle.is_builtin());

        let module = loader.resolve_ops(&handle)?;
        assert_eq!(module.name(), "debug");
        drop(module);
        loader.close_module(handle);
        Ok(())
    }

    #[test]
    fn test_missing_module() {
        let loader = StandardLoader::default();
        assert!(matches!(
            loader.open_module("missing"),
            Err(Error::ModuleNotFound(name)) if name == "missing"
        ));

        let dir = std::env::temp_dir().join(format!("dm_modules_{}", std::process::id()));
        let loader = StandardLoader::new(Some(dir));
        assert!(matches!(
            loader.open_module("missing"),
            Err(Error::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_module_path_naming() {
        let loader = StandardLoader::new(Some(PathBuf::from("/usr/lib/dm")));
        let path = loader.module_path("striped").unwrap();
        let file = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file.contains("dm_striped"));
        assert!(path.starts_with("/usr/lib/dm"));

        assert!(StandardLoader::default().module_path("striped").is_none());

        assert!(loader.module_path("../x").is_none());
        assert!(loader.module_path("a/b").is_none());
        assert!(matches!(loader.open_module("../x"), Err(Error::ModuleNotFound(_))));
    }

    #[test]
    fn test_unloadable_library_is_not_found() -> std::io::Result<()> {
        let dir = std::env::temp_dir().join(format!("dm_modules_bad_{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let loader = StandardLoader::new(Some(dir.clone()));
        std::fs::write(loader.module_path("junk").unwrap(), b"not a shared object")?;

        assert!(matches!(
            loader.open_module("junk"),
            Err(Error::ModuleNotFound(_))
        ));

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }
}
