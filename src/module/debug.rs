//! Built-in `debug` module
//!
//! Implements every hook as a no-op that only traces the call.

use super::traits::{IoRequest, MapperModule, MappingContext};
use crate::error::Result;
use crate::table::MappingStats;
use tracing::debug;

pub const DEBUG_MODULE_NAME: &str = "debug";

#[derive(Debug, Default)]
pub struct DebugModule;

impl DebugModule {
    pub fn new() -> Self {
        Self
    }

    pub fn boxed() -> Box<dyn MapperModule> {
        Box::new(Self)
    }
}

impl MapperModule for DebugModule {
    fn name(&self) -> &str {
        DEBUG_MODULE_NAME
    }

    fn initialize(&self) -> Result<()> {
        debug!(module = DEBUG_MODULE_NAME, "init");
        Ok(())
    }

    fn finalize(&self) {
        debug!(module = DEBUG_MODULE_NAME, "fini");
    }

    fn create_mapping(&self, mapping: &MappingContext<'_>) -> Result<()> {
        debug!(module = DEBUG_MODULE_NAME, name = %mapping.name, slot = %mapping.slot, "create");
        Ok(())
    }

    fn destroy_mapping(&self, mapping: &MappingContext<'_>) {
        debug!(module = DEBUG_MODULE_NAME, name = %mapping.name, slot = %mapping.slot, "destroy");
    }

    fn map_io(&self, io: &IoRequest<'_>) -> Result<()> {
        debug!(
            module = DEBUG_MODULE_NAME,
            name = %io.mapping.name,
            direction = ?io.direction,
            offset = io.offset,
            len = io.len,
            "mapio"
        );
        Ok(())
    }

    fn update_stats(&self, mapping: &MappingContext<'_>, stats: &MappingStats) {
        debug!(
            module = DEBUG_MODULE_NAME,
            name = %mapping.name,
            reads = stats.reads,
            writes = stats.writes,
            "stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::traits::{IoDirection, OPS_REVISION};
    use crate::slot::SlotId;

    #[test]
    fn test_debug_hooks_accept_everything() -> Result<()> {
        let module = DebugModule::boxed();
        assert_eq!(module.name(), DEBUG_MODULE_NAME);
        assert_eq!(module.revision(), OPS_REVISION);

        let mapping = MappingContext {
            name: "data1",
            slot: SlotId::new(1),
            device_path: "/dev/backing0",
        };
        module.initialize()?;
        module.create_mapping(&mapping)?;
        module.map_io(&IoRequest {
            mapping,
            direction: IoDirection::Write,
            offset: 512,
            len: 16,
        })?;
        module.update_stats(&mapping, &MappingStats::default());
        module.destroy_mapping(&mapping);
        module.finalize();
        Ok(())
    }
}
