//! Backing device layer
//!
//! The mapping table never touches files directly. It opens backing devices
//! through a [`DeviceLayer`] and keeps the resulting [`BackingDevice`]
//! handle inside the mapping record until detach closes it.

use std::fmt;
use std::io;

pub mod file;
pub mod mock;

pub use file::FileDevices;
pub use mock::MockDevices;

/// Access mode requested when opening a backing device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// An opened backing device
///
/// All transfers are positional so that concurrent readers never share a
/// file cursor. `close` consumes the handle, so a handle can be closed at
/// most once and cannot be used afterwards.
pub trait BackingDevice: Send + Sync + fmt::Debug {
    /// Read into `buf` starting at byte `offset`
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write `buf` starting at byte `offset`
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Size of the device in bytes
    fn size(&self) -> io::Result<u64>;

    /// Flush and release the device
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Opens backing devices by path
pub trait DeviceLayer: Send + Sync {
    fn open(&self, path: &str, mode: OpenMode) -> io::Result<Box<dyn BackingDevice>>;
}
