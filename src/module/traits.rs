//! Module trait definitions

use crate::error::Result;
use crate::slot::SlotId;
use crate::table::MappingStats;

/// Operation-vector revision this registry understands
pub const OPS_REVISION: u32 = 0;

/// Symbol a module library exports to hand out its operation vector
pub const OPS_SYMBOL: &str = "dm_ops";

/// Constructor for a built-in module
pub type ModuleConstructor = fn() -> Box<dyn MapperModule>;

/// Signature of the [`OPS_SYMBOL`] export in a module library
pub type LibraryConstructor = unsafe extern "Rust" fn() -> Box<dyn MapperModule>;

/// The mapping a hook is invoked for
#[derive(Debug, Clone, Copy)]
pub struct MappingContext<'a> {
    pub name: &'a str,
    pub slot: SlotId,
    /// Device path with the module scheme stripped
    pub device_path: &'a str,
}

/// Direction of a passthrough transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// A passthrough transfer about to be forwarded to the backing device
#[derive(Debug, Clone, Copy)]
pub struct IoRequest<'a> {
    pub mapping: MappingContext<'a>,
    pub direction: IoDirection,
    pub offset: u64,
    pub len: usize,
}

/// Mapper module trait
///
/// The six hooks form the module's operation vector. Every hook has a
/// no-op default so a module only overrides what it customizes.
pub trait MapperModule: Send + Sync {
    /// Name the module registers under
    fn name(&self) -> &str;

    /// Operation-vector revision implemented by the module
    fn revision(&self) -> u32 {
        OPS_REVISION
    }

    /// Called once after the module is loaded. An error aborts the load.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Called once before the module is unloaded
    fn finalize(&self) {}

    /// Called before a mapping using this module is published.
    /// An error aborts the attach.
    fn create_mapping(&self, _mapping: &MappingContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called while a mapping using this module is torn down
    fn destroy_mapping(&self, _mapping: &MappingContext<'_>) {}

    /// Called before each passthrough transfer. An error fails the transfer.
    fn map_io(&self, _io: &IoRequest<'_>) -> Result<()> {
        Ok(())
    }

    /// Called whenever statistics for a mapping are collected
    fn update_stats(&self, _mapping: &MappingContext<'_>, _stats: &MappingStats) {}
}

/// Export a module from a `cdylib` so the registry can load it.
///
/// ```ignore
/// devmapper::declare_module!(MyModule::new());
/// ```
#[macro_export]
macro_rules! declare_module {
    ($ctor:expr) => {
        #[no_mangle]
        pub extern "Rust" fn dm_ops() -> Box<dyn $crate::module::MapperModule> {
            Box::new($ctor)
        }
    };
}
