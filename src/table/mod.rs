//! Mapping table
//!
//! Slot-indexed store of mapping records. The table owns every record from
//! the moment attach publishes it until detach tears it down.
//!
//! # Architecture
//!
//! ```text
//! MappingTable ── RwLock ──┬─→ SlotAllocator   [ctl][1][2][ ][4][ ] ...
//!                          ├─→ records         [ - ][r][r][-][r][-] ...
//!                          └─→ index           name → slot
//!
//! attach:  allocate → open → module create → endpoints → publish
//! detach:  unpublish → endpoints → module destroy → close → free slot
//! ```
//!
//! Both sequences run under the write lock, so readers (`list`, lookups,
//! passthrough I/O) only ever see fully built records.

use crate::device::{DeviceLayer, OpenMode};
use crate::endpoint::EndpointNamer;
use crate::error::{Error, Result};
use crate::module::{IoDirection, MappingContext, ModuleRef, ModuleRegistry};
use crate::names::{BackingPath, MapName};
use crate::slot::{SlotAllocator, SlotId, SlotStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod record;

use record::MappingRecord;
pub use record::{MappingEntry, MappingInfo, MappingStats, TargetKind};

struct TableInner {
    slots: SlotAllocator,
    records: Vec<Option<MappingRecord>>,
    index: HashMap<MapName, SlotId>,
}

impl TableInner {
    fn record(&self, slot: SlotId) -> Option<&MappingRecord> {
        self.records.get(slot.index()).and_then(Option::as_ref)
    }

    fn entries(&self) -> Vec<MappingEntry> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, record)| match record {
                Some(record) => record.entry(),
                None => MappingEntry::empty(SlotId::new(i as u32)),
            })
            .collect()
    }
}

/// Mapping table
pub struct MappingTable {
    inner: RwLock<TableInner>,
    devices: Arc<dyn DeviceLayer>,
    endpoints: Arc<dyn EndpointNamer>,
    modules: Arc<ModuleRegistry>,
}

impl MappingTable {
    /// Create a new mapping table
    ///
    /// # Arguments
    /// * `capacity` - Number of slots including the control slot
    /// * `devices` - Opens backing devices on attach
    /// * `endpoints` - Publishes the endpoints of each mapping
    /// * `modules` - Registry consulted for `scheme:` backing paths
    pub fn new(
        capacity: usize,
        devices: Arc<dyn DeviceLayer>,
        endpoints: Arc<dyn EndpointNamer>,
        modules: Arc<ModuleRegistry>,
    ) -> Result<Self> {
        let slots = SlotAllocator::new(capacity)?;
        let mut records = Vec::with_capacity(capacity);
        records.resize_with(capacity, || None);

        Ok(Self {
            inner: RwLock::new(TableInner {
                slots,
                records,
                index: HashMap::new(),
            }),
            devices,
            endpoints,
            modules,
        })
    }

    /// Bind `name` to the device at `backing_path`
    ///
    /// Returns the slot of the new mapping. Nothing is visible to other
    /// callers unless every step succeeds.
    pub fn attach(&self, name: &str, backing_path: &str) -> Result<SlotId> {
        let result = self.try_attach(name, backing_path);
        match &result {
            Ok(_) => metrics::counter!("dm_attach_total").increment(1),
            Err(e) => metrics::counter!("dm_attach_failures_total", "reason" => e.kind()).increment(1),
        }
        result
    }

    fn try_attach(&self, name: &str, backing_path: &str) -> Result<SlotId> {
        let name = MapName::new(name)?;
        let backing = BackingPath::new(backing_path)?;

        info!(name = %name, backing = %backing, "Attaching mapping");

        let mut inner = self.inner.write();
        if inner.index.contains_key(name.as_str()) {
            return Err(Error::NameInUse(name.to_string()));
        }

        let (module, device_path) = self.resolve_module(&backing);
        let slot = inner.slots.allocate()?;

        match self.build_record(name.clone(), backing, device_path, slot, module) {
            Ok(record) => {
                inner.records[slot.index()] = Some(record);
                inner.index.insert(name.clone(), slot);
                metrics::gauge!("dm_mappings_active").set(inner.index.len() as f64);
                info!(name = %name, %slot, "Mapping attached");
                Ok(slot)
            }
            Err(e) => {
                inner.slots.free(slot);
                warn!(name = %name, %slot, error = %e, "Attach rolled back");
                Err(e)
            }
        }
    }

    /// Pick the module named by a `scheme:` prefix, if one is loaded
    fn resolve_module(&self, backing: &BackingPath) -> (Option<ModuleRef>, String) {
        if let Some((scheme, rest)) = backing.split_scheme() {
            if let Some(module) = self.modules.acquire(scheme) {
                debug!(module = %scheme, device = %rest, "Mapping uses module");
                return (Some(module), rest.to_string());
            }
        }
        (None, backing.to_string())
    }

    /// Open the device and run every fallible step short of publishing.
    /// On error everything acquired here has been released again.
    fn build_record(
        &self,
        name: MapName,
        backing: BackingPath,
        device_path: String,
        slot: SlotId,
        module: Option<ModuleRef>,
    ) -> Result<MappingRecord> {
        let handle = self
            .devices
            .open(&device_path, OpenMode::ReadWrite)
            .map_err(|source| Error::OpenFailed {
                path: backing.to_string(),
                source,
            })?;

        let ctx = MappingContext {
            name: &name,
            slot,
            device_path: &device_path,
        };

        if let Some(module) = &module {
            if let Err(e) = module.ops().create_mapping(&ctx) {
                close_handle(&name, handle);
                return Err(e);
            }
        }

        if let Err(source) = self.endpoints.create_endpoints(&name, slot) {
            if let Some(module) = &module {
                module.ops().destroy_mapping(&ctx);
            }
            close_handle(&name, handle);
            return Err(Error::Endpoint {
                name: name.to_string(),
                source,
            });
        }

        Ok(MappingRecord::new(name, backing, device_path, slot, handle, module))
    }

    /// Unbind the mapping called `name`
    pub fn detach(&self, name: &str) -> Result<()> {
        let result = self.try_detach(name);
        match &result {
            Ok(()) => metrics::counter!("dm_detach_total").increment(1),
            Err(e) => metrics::counter!("dm_detach_failures_total", "reason" => e.kind()).increment(1),
        }
        result
    }

    fn try_detach(&self, name: &str) -> Result<()> {
        info!(name = %name, "Detaching mapping");

        let mut inner = self.inner.write();
        let slot = inner
            .index
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let Some(record) = inner.records[slot.index()].take() else {
            panic!("mapping index points at empty {}", slot);
        };

        self.teardown(record);

        // Only now is nothing left referring to the slot
        inner.slots.free(slot);
        metrics::gauge!("dm_mappings_active").set(inner.index.len() as f64);
        info!(name = %name, %slot, "Mapping detached");
        Ok(())
    }

    fn teardown(&self, record: MappingRecord) {
        if let Err(e) = self.endpoints.remove_endpoints(&record.name) {
            warn!(name = %record.name, error = %e, "Failed to remove endpoints");
        }

        if let Some(module) = &record.module {
            module.ops().destroy_mapping(&record.context());
        }

        let MappingRecord {
            name, handle, module, ..
        } = record;
        close_handle(&name, handle);
        drop(module);
    }

    /// Slot of the mapping called `name`
    pub fn lookup_by_name(&self, name: &str) -> Option<SlotId> {
        self.inner.read().index.get(name).copied()
    }

    /// Snapshot of every slot, in slot order
    ///
    /// The result always has `capacity` entries; entry `i` describes slot
    /// `i`, and free slots (including the control slot) are empty entries.
    pub fn list(&self) -> Vec<MappingEntry> {
        self.inner.read().entries()
    }

    /// Listing plus the allocator's view of each slot, under one read guard
    #[cfg(test)]
    fn list_with_allocation(&self) -> (Vec<(MappingEntry, bool)>, SlotStats) {
        let inner = self.inner.read();
        let entries = inner
            .entries()
            .into_iter()
            .map(|entry| {
                let allocated = inner.slots.is_allocated(entry.slot);
                (entry, allocated)
            })
            .collect();
        (entries, inner.slots.stats())
    }

    /// Detailed view of one mapping; runs the module's stats hook
    pub fn get(&self, name: &str) -> Option<MappingInfo> {
        let inner = self.inner.read();
        let slot = *inner.index.get(name)?;
        let record = inner.record(slot)?;
        let stats = record.stats();

        if let Some(module) = &record.module {
            module.ops().update_stats(&record.context(), &stats);
        }

        Some(MappingInfo {
            slot,
            name: record.name.to_string(),
            backing_path: record.backing_path.to_string(),
            device_path: record.device_path.clone(),
            target: record.target,
            module: record.module.as_ref().map(|m| m.name().to_string()),
            size: record.handle.size().ok(),
            stats,
        })
    }

    /// Read from the mapping at `slot`, forwarding to its backing device
    pub fn read_at(&self, slot: SlotId, buf: &mut [u8], offset: u64) -> Result<usize> {
        if slot.is_control() {
            return Err(Error::ControlEndpoint);
        }

        let inner = self.inner.read();
        let record = inner.record(slot).ok_or(Error::NoSuchMapping(slot))?;
        record.map_io(IoDirection::Read, offset, buf.len())?;

        let n = record.handle.read_at(buf, offset)?;
        record.record_read(n);
        Ok(n)
    }

    /// Write to the mapping at `slot`, forwarding to its backing device
    pub fn write_at(&self, slot: SlotId, buf: &[u8], offset: u64) -> Result<usize> {
        if slot.is_control() {
            return Err(Error::ControlEndpoint);
        }

        let inner = self.inner.read();
        let record = inner.record(slot).ok_or(Error::NoSuchMapping(slot))?;
        record.map_io(IoDirection::Write, offset, buf.len())?;

        let n = record.handle.write_at(buf, offset)?;
        record.record_write(n);
        Ok(n)
    }

    /// Detach every mapping
    pub fn detach_all(&self) {
        let names: Vec<String> = self
            .inner
            .read()
            .index
            .keys()
            .map(|name| name.to_string())
            .collect();

        for name in names {
            if let Err(e) = self.detach(&name) {
                warn!(name = %name, error = %e, "Failed to detach mapping at shutdown");
            }
        }
    }

    /// Number of live mappings
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots including the control slot
    pub fn capacity(&self) -> usize {
        self.inner.read().slots.capacity()
    }

    pub fn slot_stats(&self) -> SlotStats {
        self.inner.read().slots.stats()
    }

    /// Whether `slot` is handed out by the allocator
    pub fn is_slot_allocated(&self, slot: SlotId) -> bool {
        self.inner.read().slots.is_allocated(slot)
    }
}

impl Drop for MappingTable {
    fn drop(&mut self) {
        if !self.is_empty() {
            self.detach_all();
        }
    }
}

fn close_handle(name: &str, handle: Box<dyn crate::device::BackingDevice>) {
    if let Err(e) = handle.close() {
        warn!(name = %name, error = %e, "Failed to close backing device");
    }
}
