//! Mock device layer for testing
//!
//! This module provides an in-memory device layer that records how often
//! devices are opened and closed and can be told to fail specific opens.

use super::{BackingDevice, DeviceLayer, OpenMode};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    disks: HashMap<String, Arc<Mutex<Vec<u8>>>>,
    failing: HashSet<String>,
    opens: u64,
    closes: u64,
    live: usize,
}

/// In-memory device layer for testing
#[derive(Clone, Default)]
pub struct MockDevices {
    state: Arc<Mutex<MockState>>,
}

impl MockDevices {
    /// Create a new mock device layer with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zero-filled device of `size` bytes
    pub fn add_device(&self, path: &str, size: usize) -> &Self {
        self.state
            .lock()
            .disks
            .insert(path.to_string(), Arc::new(Mutex::new(vec![0u8; size])));
        self
    }

    /// Make every future open of `path` fail
    pub fn fail_open(&self, path: &str) -> &Self {
        self.state.lock().failing.insert(path.to_string());
        self
    }

    /// Total successful opens
    pub fn opens(&self) -> u64 {
        self.state.lock().opens
    }

    /// Total closes
    pub fn closes(&self) -> u64 {
        self.state.lock().closes
    }

    /// Handles that are opened and not yet dropped
    pub fn live_handles(&self) -> usize {
        self.state.lock().live
    }

    /// Snapshot of a device's contents
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let disk = self.state.lock().disks.get(path).cloned()?;
        let data = disk.lock().clone();
        Some(data)
    }
}

impl DeviceLayer for MockDevices {
    fn open(&self, path: &str, mode: OpenMode) -> io::Result<Box<dyn BackingDevice>> {
        let mut state = self.state.lock();

        if state.failing.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("mock open of {} refused", path),
            ));
        }

        let data = state
            .disks
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;

        state.opens += 1;
        state.live += 1;

        Ok(Box::new(MockDevice {
            data,
            writable: mode == OpenMode::ReadWrite,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockDevice {
    data: Arc<Mutex<Vec<u8>>>,
    writable: bool,
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("writable", &self.writable)
            .finish()
    }
}

impl BackingDevice for MockDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "device opened read-only",
            ));
        }
        let mut data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.state.lock().closes += 1;
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.state.lock().live -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_open_close_accounting() -> io::Result<()> {
        let devices = MockDevices::new();
        devices.add_device("/dev/backing0", 64);

        let dev = devices.open("/dev/backing0", OpenMode::ReadWrite)?;
        assert_eq!(devices.opens(), 1);
        assert_eq!(devices.live_handles(), 1);

        dev.write_at(b"abc", 10)?;
        dev.close()?;

        assert_eq!(devices.closes(), 1);
        assert_eq!(devices.live_handles(), 0);
        assert_eq!(&devices.contents("/dev/backing0").unwrap()[10..13], b"abc");
        Ok(())
    }

    #[test]
    fn test_mock_failures() {
        let devices = MockDevices::new();
        devices.add_device("/dev/bad", 8).fail_open("/dev/bad");

        assert!(devices.open("/dev/bad", OpenMode::ReadWrite).is_err());
        assert!(devices.open("/dev/missing", OpenMode::ReadOnly).is_err());
        assert_eq!(devices.opens(), 0);
    }

    #[test]
    fn test_mock_short_read_at_end() -> io::Result<()> {
        let devices = MockDevices::new();
        devices.add_device("/dev/small", 4);
        let dev = devices.open("/dev/small", OpenMode::ReadOnly)?;

        let mut buf = [0u8; 8];
        assert_eq!(dev.read_at(&mut buf, 2)?, 2);
        assert_eq!(dev.read_at(&mut buf, 10)?, 0);
        assert!(dev.write_at(b"x", 0).is_err());
        Ok(())
    }
}
