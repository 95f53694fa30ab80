//! Mapping records and the snapshots handed out to callers

use crate::device::BackingDevice;
use crate::module::{IoDirection, IoRequest, MappingContext, ModuleRef};
use crate::names::{BackingPath, MapName};
use crate::slot::SlotId;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a mapping translates I/O onto its backing device
///
/// Only `Passthrough` is implemented; the others are reserved codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Passthrough,
    Linear,
    Striped,
    Error,
}

impl TargetKind {
    pub fn code(self) -> u64 {
        match self {
            TargetKind::Passthrough => 0,
            TargetKind::Linear => 1,
            TargetKind::Striped => 2,
            TargetKind::Error => 3,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(TargetKind::Passthrough),
            1 => Some(TargetKind::Linear),
            2 => Some(TargetKind::Striped),
            3 => Some(TargetKind::Error),
            _ => None,
        }
    }
}

/// Passthrough counters for one mapping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MappingStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
struct IoCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// One bound device, owned by the mapping table
pub(crate) struct MappingRecord {
    pub(crate) name: MapName,
    pub(crate) backing_path: BackingPath,
    /// Path handed to the device layer (module scheme stripped)
    pub(crate) device_path: String,
    pub(crate) slot: SlotId,
    pub(crate) target: TargetKind,
    pub(crate) handle: Box<dyn BackingDevice>,
    pub(crate) module: Option<ModuleRef>,
    counters: IoCounters,
}

impl MappingRecord {
    pub(crate) fn new(
        name: MapName,
        backing_path: BackingPath,
        device_path: String,
        slot: SlotId,
        handle: Box<dyn BackingDevice>,
        module: Option<ModuleRef>,
    ) -> Self {
        Self {
            name,
            backing_path,
            device_path,
            slot,
            target: TargetKind::Passthrough,
            handle,
            module,
            counters: IoCounters::default(),
        }
    }

    pub(crate) fn context(&self) -> MappingContext<'_> {
        MappingContext {
            name: &self.name,
            slot: self.slot,
            device_path: &self.device_path,
        }
    }

    /// Run the module I/O hook, if any, ahead of a transfer
    pub(crate) fn map_io(&self, direction: IoDirection, offset: u64, len: usize) -> crate::error::Result<()> {
        match &self.module {
            Some(module) => module.ops().map_io(&IoRequest {
                mapping: self.context(),
                direction,
                offset,
                len,
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> MappingStats {
        MappingStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn entry(&self) -> MappingEntry {
        MappingEntry {
            slot: self.slot,
            name: self.name.to_string(),
            backing_path: self.backing_path.to_string(),
            target: self.target,
        }
    }
}

/// One position of a table listing
///
/// Unpopulated slots are listed as entries with an empty name and path so
/// that an entry's position always equals its slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    pub slot: SlotId,
    pub name: String,
    pub backing_path: String,
    pub target: TargetKind,
}

impl MappingEntry {
    pub fn empty(slot: SlotId) -> Self {
        Self {
            slot,
            name: String::new(),
            backing_path: String::new(),
            target: TargetKind::Passthrough,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// Detailed view of one live mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingInfo {
    pub slot: SlotId,
    pub name: String,
    pub backing_path: String,
    pub device_path: String,
    pub target: TargetKind,
    pub module: Option<String>,
    pub size: Option<u64>,
    pub stats: MappingStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_kind_codes() {
        for kind in [
            TargetKind::Passthrough,
            TargetKind::Linear,
            TargetKind::Striped,
            TargetKind::Error,
        ] {
            assert_eq!(TargetKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(TargetKind::from_code(99), None);
    }

    #[test]
    fn test_empty_entry() {
        let entry = MappingEntry::empty(SlotId::new(7));
        assert!(entry.is_empty());
        assert_eq!(entry.slot, SlotId::new(7));
        assert!(entry.backing_path.is_empty());
    }
}
