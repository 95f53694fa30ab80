//! Device mapper context
//!
//! Owns the mapping table and module registry of one mapper instance and
//! wires them to their collaborators according to a [`MapperConfig`].

use crate::config::MapperConfig;
use crate::control::{ControlServer, Dispatcher};
use crate::device::{DeviceLayer, FileDevices};
use crate::endpoint::{EndpointNamer, LinkEndpoints, NullEndpoints};
use crate::error::Result;
use crate::module::{ModuleRegistry, StandardLoader};
use crate::table::MappingTable;
use std::sync::Arc;
use tracing::{info, warn};

/// A running device mapper
pub struct DeviceMapper {
    config: MapperConfig,
    table: Arc<MappingTable>,
    modules: Arc<ModuleRegistry>,
    links: Option<LinkEndpoints>,
}

impl DeviceMapper {
    /// Build a mapper over real files and, if configured, an endpoint link tree
    pub fn from_config(config: MapperConfig) -> Result<Self> {
        config.validate()?;

        let links = config.endpoint_root.as_ref().map(LinkEndpoints::new);
        let endpoints: Arc<dyn EndpointNamer> = match &links {
            Some(links) => Arc::new(links.clone()),
            None => Arc::new(NullEndpoints),
        };

        let loader = StandardLoader::new(config.module_dir.clone());
        let modules = Arc::new(ModuleRegistry::new(Box::new(loader)));

        Self::with_parts(config, Arc::new(FileDevices), endpoints, modules, links)
    }

    /// Build a mapper over caller-supplied collaborators
    pub fn with_layers(
        config: MapperConfig,
        devices: Arc<dyn DeviceLayer>,
        endpoints: Arc<dyn EndpointNamer>,
        modules: Arc<ModuleRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Self::with_parts(config, devices, endpoints, modules, None)
    }

    fn with_parts(
        config: MapperConfig,
        devices: Arc<dyn DeviceLayer>,
        endpoints: Arc<dyn EndpointNamer>,
        modules: Arc<ModuleRegistry>,
        links: Option<LinkEndpoints>,
    ) -> Result<Self> {
        let table = Arc::new(MappingTable::new(
            config.capacity,
            devices,
            endpoints,
            Arc::clone(&modules),
        )?);

        for name in &config.preload_modules {
            modules.load(name)?;
        }

        info!(
            capacity = config.capacity,
            modules = modules.len(),
            "Device mapper initialized"
        );

        Ok(Self {
            config,
            table,
            modules,
            links,
        })
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<MappingTable> {
        &self.table
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Dispatcher bound to this mapper's table and registry
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.table), Arc::clone(&self.modules))
    }

    /// Control server on the configured socket. Also publishes the control
    /// endpoint link when an endpoint root is configured.
    pub fn control_server(&self) -> Result<ControlServer> {
        if let Some(links) = &self.links {
            links.create_control_endpoint(&self.config.control_socket)?;
        }
        Ok(ControlServer::new(
            Arc::new(self.dispatcher()),
            &self.config.control_socket,
            self.config.max_connections,
        ))
    }

    /// Detach every mapping, then unload every module
    pub fn shutdown(&self) {
        info!(mappings = self.table.len(), "Shutting down device mapper");
        self.table.detach_all();
        self.modules.unload_all();

        if let Some(links) = &self.links {
            if let Err(e) = links.remove_control_endpoint() {
                warn!(error = %e, "Failed to remove control endpoint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevices;
    use crate::endpoint::MockEndpoints;

    fn mock_mapper(config: MapperConfig) -> Result<(DeviceMapper, MockDevices)> {
        let devices = MockDevices::new();
        devices.add_device("/dev/backing0", 256);
        let mapper = DeviceMapper::with_layers(
            config,
            Arc::new(devices.clone()),
            Arc::new(MockEndpoints::new()),
            Arc::new(ModuleRegistry::with_builtins()),
        )?;
        Ok((mapper, devices))
    }

    #[test]
    fn test_preload_and_shutdown() -> Result<()> {
        let config = MapperConfig {
            capacity: 8,
            preload_modules: vec!["debug".to_string()],
            ..Default::default()
        };
        let (mapper, devices) = mock_mapper(config)?;
        assert!(mapper.modules().lookup("debug").is_some());

        mapper.table().attach("data1", "debug:/dev/backing0")?;
        mapper.shutdown();

        assert!(mapper.table().is_empty());
        assert!(mapper.modules().is_empty());
        assert_eq!(devices.live_handles(), 0);
        Ok(())
    }

    #[test]
    fn test_bad_preload_fails() {
        let config = MapperConfig {
            preload_modules: vec!["nosuch".to_string()],
            ..Default::default()
        };
        assert!(mock_mapper(config).is_err());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = MapperConfig {
            capacity: 1,
            ..Default::default()
        };
        assert!(DeviceMapper::from_config(config).is_err());
    }

    #[test]
    fn test_file_backed_mapper() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("dm_mapper_{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir)?;
        let backing = dir.join("disk0.img");
        std::fs::write(&backing, vec![0u8; 4096])?;

        let config = MapperConfig {
            capacity: 4,
            control_socket: dir.join("dm.sock"),
            endpoint_root: Some(dir.join("dev")),
            ..Default::default()
        };
        let mapper = DeviceMapper::from_config(config)?;
        let slot = mapper.table().attach("disk0", backing.to_str().unwrap())?;

        assert_eq!(mapper.table().write_at(slot, b"dm", 10)?, 2);
        assert!(std::fs::symlink_metadata(dir.join("dev").join("mapper").join("disk0")).is_ok());

        let server = mapper.control_server()?;
        assert_eq!(server.socket_path(), dir.join("dm.sock").as_path());
        assert!(std::fs::symlink_metadata(dir.join("dev").join("dmctl")).is_ok());

        mapper.shutdown();
        assert!(std::fs::symlink_metadata(dir.join("dev").join("mapper").join("disk0")).is_err());
        assert!(std::fs::symlink_metadata(dir.join("dev").join("dmctl")).is_err());
        assert_eq!(&std::fs::read(&backing)?[10..12], b"dm");

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }
}
