//! Backing devices on the local filesystem
//!
//! Works for block/character device nodes as well as plain image files.

use super::{BackingDevice, DeviceLayer, OpenMode};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tracing::debug;

/// Device layer that opens paths with `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDevices;

impl FileDevices {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceLayer for FileDevices {
    fn open(&self, path: &str, mode: OpenMode) -> io::Result<Box<dyn BackingDevice>> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(path)?;

        debug!(path = %path, ?mode, "Opened backing device");

        Ok(Box::new(FileDevice {
            path: PathBuf::from(path),
            file,
            writable: mode == OpenMode::ReadWrite,
        }))
    }
}

/// Handle to an opened file or device node
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: File,
    writable: bool,
}

impl BackingDevice for FileDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        debug!(path = %self.path.display(), "Closed backing device");
        Ok(())
    }
}
