// Device Mapper - Rust Implementation
// Named mappings over backing devices with a pluggable module registry

#![warn(rust_2018_idioms)]

pub mod config;
pub mod control;
pub mod device;
pub mod endpoint;
pub mod mapper;
pub mod module;
pub mod names;
pub mod slot;
pub mod table;

// Re-exports for convenience
pub use crate::config::MapperConfig;
pub use mapper::DeviceMapper;
pub use module::{MapperModule, ModuleRegistry};
pub use slot::{SlotAllocator, SlotId};
pub use table::{MappingEntry, MappingTable};

/// Device mapper error types
pub mod error {
    use crate::control::Status;
    use crate::slot::SlotId;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("All {capacity} mapping slots are in use")]
        Exhausted { capacity: usize },

        #[error("Mapping '{0}' already exists")]
        NameInUse(String),

        #[error("Mapping '{0}' not found")]
        NotFound(String),

        #[error("Invalid name: {0}")]
        InvalidName(String),

        #[error("Failed to open backing device '{path}': {source}")]
        OpenFailed {
            path: String,
            #[source]
            source: std::io::Error,
        },

        #[error("Failed to create endpoints for '{name}': {source}")]
        Endpoint {
            name: String,
            #[source]
            source: std::io::Error,
        },

        #[error("I/O is not supported on the control endpoint")]
        ControlEndpoint,

        #[error("No mapping attached at {0}")]
        NoSuchMapping(SlotId),

        #[error("Module '{0}' not found")]
        ModuleNotFound(String),

        #[error("Module '{module}' does not export symbol '{symbol}'")]
        SymbolMissing { module: String, symbol: String },

        #[error("Module '{0}' is already loaded")]
        AlreadyLoaded(String),

        #[error("Module '{0}' is not loaded")]
        NotLoaded(String),

        #[error("Module '{name}' is busy ({refs} active references)")]
        Busy { name: String, refs: usize },

        #[error("Invalid module: {0}")]
        InvalidModule(String),

        #[error("Module '{module}' hook failed: {reason}")]
        Hook { module: String, reason: String },

        #[error("Malformed control record: {0}")]
        Decode(String),

        #[error("Invalid control command: {0}")]
        InvalidCommand(u32),

        #[error("{0}")]
        Remote(Status),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }

    impl Error {
        /// Short stable label, used for metrics
        pub fn kind(&self) -> &'static str {
            match self {
                Error::Exhausted { .. } => "exhausted",
                Error::NameInUse(_) => "name_in_use",
                Error::NotFound(_) => "not_found",
                Error::InvalidName(_) => "invalid_name",
                Error::OpenFailed { .. } => "open_failed",
                Error::Endpoint { .. } => "endpoint",
                Error::ControlEndpoint => "control_endpoint",
                Error::NoSuchMapping(_) => "no_such_mapping",
                Error::ModuleNotFound(_) => "module_not_found",
                Error::SymbolMissing { .. } => "symbol_missing",
                Error::AlreadyLoaded(_) => "already_loaded",
                Error::NotLoaded(_) => "not_loaded",
                Error::Busy { .. } => "busy",
                Error::InvalidModule(_) => "invalid_module",
                Error::Hook { .. } => "hook",
                Error::Decode(_) => "decode",
                Error::InvalidCommand(_) => "invalid_command",
                Error::Remote(_) => "remote",
                Error::Config(_) => "config",
                Error::Io(_) => "io",
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Control ABI version shared by the daemon and the administration tool
pub const ABI_VERSION: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
        assert_eq!(ABI_VERSION, 0);
    }

    #[test]
    fn test_error_messages() {
        let err = Error::Busy {
            name: "debug".to_string(),
            refs: 2,
        };
        assert_eq!(err.to_string(), "Module 'debug' is busy (2 active references)");

        let err = Error::Exhausted { capacity: 4 };
        assert_eq!(err.to_string(), "All 4 mapping slots are in use");
    }
}
