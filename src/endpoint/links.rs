//! Symlink-based endpoints
//!
//! Layout under the endpoint root:
//!
//! ```text
//! dmctl             -> <control socket>
//! mapper/control    -> ../dmctl
//! dm/dsk/<name>     -> <devices>/dm@0:<slot>,blk
//! dm/rdsk/<name>    -> <devices>/dm@0:<slot>,raw
//! mapper/<name>     -> ../dm/dsk/<name>
//! ```

use super::EndpointNamer;
use crate::slot::SlotId;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CONTROL_LINK: &str = "dmctl";
const CONTROL_ALIAS: &str = "control";

/// Default directory the mapping links point into
pub const DEFAULT_DEVICES_DIR: &str = "/devices/pseudo";

/// Endpoint namer that maintains a tree of symlinks
#[derive(Debug, Clone)]
pub struct LinkEndpoints {
    root: PathBuf,
    devices_dir: PathBuf,
}

impl LinkEndpoints {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            devices_dir: PathBuf::from(DEFAULT_DEVICES_DIR),
        }
    }

    /// Point mapping links at a different device directory
    pub fn with_devices_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.devices_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Block endpoint path for `name`
    pub fn block_path(&self, name: &str) -> PathBuf {
        self.root.join("dm").join("dsk").join(name)
    }

    /// Raw endpoint path for `name`
    pub fn raw_path(&self, name: &str) -> PathBuf {
        self.root.join("dm").join("rdsk").join(name)
    }

    /// Linux-style alias for `name`
    pub fn alias_path(&self, name: &str) -> PathBuf {
        self.root.join("mapper").join(name)
    }

    /// Link the control endpoint to the control socket
    pub fn create_control_endpoint(&self, socket: &Path) -> io::Result<()> {
        std::fs::create_dir_all(self.root.join("mapper"))?;

        let link = self.root.join(CONTROL_LINK);
        replace_link(socket, &link)?;
        replace_link(
            Path::new("..").join(CONTROL_LINK).as_path(),
            &self.root.join("mapper").join(CONTROL_ALIAS),
        )?;

        debug!(link = %link.display(), socket = %socket.display(), "Created control endpoint");
        Ok(())
    }

    /// Remove the control endpoint links
    pub fn remove_control_endpoint(&self) -> io::Result<()> {
        remove_link(&self.root.join("mapper").join(CONTROL_ALIAS))?;
        remove_link(&self.root.join(CONTROL_LINK))
    }

    fn links_for(&self, name: &str, slot: SlotId) -> [(PathBuf, PathBuf); 3] {
        let minor = slot.get();
        [
            (
                self.devices_dir.join(format!("dm@0:{},blk", minor)),
                self.block_path(name),
            ),
            (
                self.devices_dir.join(format!("dm@0:{},raw", minor)),
                self.raw_path(name),
            ),
            (
                Path::new("..").join("dm").join("dsk").join(name),
                self.alias_path(name),
            ),
        ]
    }
}

impl EndpointNamer for LinkEndpoints {
    fn create_endpoints(&self, name: &str, slot: SlotId) -> io::Result<()> {
        if name == CONTROL_ALIAS {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "'control' is reserved for the control endpoint",
            ));
        }

        for dir in [
            self.root.join("dm").join("dsk"),
            self.root.join("dm").join("rdsk"),
            self.root.join("mapper"),
        ] {
            std::fs::create_dir_all(dir)?;
        }

        let mut created: Vec<PathBuf> = Vec::with_capacity(3);
        for (target, link) in self.links_for(name, slot) {
            if let Err(e) = symlink(&target, &link) {
                for path in &created {
                    if let Err(undo) = remove_link(path) {
                        warn!(link = %path.display(), error = %undo, "Failed to undo endpoint");
                    }
                }
                return Err(e);
            }
            created.push(link);
        }

        debug!(name = %name, %slot, "Created endpoints");
        Ok(())
    }

    fn remove_endpoints(&self, name: &str) -> io::Result<()> {
        // Keep going past a failure; the slot is freed regardless
        let mut first_error = None;
        for link in [self.alias_path(name), self.raw_path(name), self.block_path(name)] {
            if let Err(e) = remove_link(&link) {
                warn!(link = %link.display(), error = %e, "Failed to remove endpoint");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(name = %name, "Removed endpoints");
                Ok(())
            }
        }
    }
}

fn remove_link(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn replace_link(target: &Path, link: &Path) -> io::Result<()> {
    remove_link(link)?;
    symlink(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("dm_links_{}_{}", tag, std::process::id()));
        std::fs::remove_dir_all(&root).ok();
        root
    }

    #[test]
    fn test_create_and_remove_endpoints() -> io::Result<()> {
        let root = temp_root("basic");
        let links = LinkEndpoints::new(&root).with_devices_dir("/devices/test");

        links.create_endpoints("data1", SlotId::new(3))?;
        assert_eq!(
            std::fs::read_link(links.block_path("data1"))?,
            PathBuf::from("/devices/test/dm@0:3,blk")
        );
        assert_eq!(
            std::fs::read_link(links.raw_path("data1"))?,
            PathBuf::from("/devices/test/dm@0:3,raw")
        );
        assert_eq!(
            std::fs::read_link(links.alias_path("data1"))?,
            PathBuf::from("../dm/dsk/data1")
        );

        links.remove_endpoints("data1")?;
        assert!(std::fs::symlink_metadata(links.block_path("data1")).is_err());
        assert!(std::fs::symlink_metadata(links.alias_path("data1")).is_err());

        // Removing twice is fine
        links.remove_endpoints("data1")?;

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_failed_create_leaves_nothing_behind() -> io::Result<()> {
        let root = temp_root("partial");
        let links = LinkEndpoints::new(&root);

        // A stray alias makes the last link fail
        std::fs::create_dir_all(root.join("mapper"))?;
        std::fs::write(links.alias_path("data1"), b"stray")?;

        assert!(links.create_endpoints("data1", SlotId::new(1)).is_err());
        assert!(std::fs::symlink_metadata(links.block_path("data1")).is_err());
        assert!(std::fs::symlink_metadata(links.raw_path("data1")).is_err());
        // The pre-existing entry is untouched
        assert_eq!(std::fs::read(links.alias_path("data1"))?, b"stray");

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_remove_attempts_every_link() -> io::Result<()> {
        let root = temp_root("stuck");
        let links = LinkEndpoints::new(&root);
        links.create_endpoints("data1", SlotId::new(2))?;

        // Swap the alias for a directory that remove_file cannot delete
        std::fs::remove_file(links.alias_path("data1"))?;
        std::fs::create_dir_all(links.alias_path("data1").join("busy"))?;

        assert!(links.remove_endpoints("data1").is_err());
        assert!(std::fs::symlink_metadata(links.block_path("data1")).is_err());
        assert!(std::fs::symlink_metadata(links.raw_path("data1")).is_err());

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_control_endpoint() -> io::Result<()> {
        let root = temp_root("ctl");
        let links = LinkEndpoints::new(&root);
        let socket = root.join("run").join("dm.sock");

        links.create_control_endpoint(&socket)?;
        assert_eq!(std::fs::read_link(root.join("dmctl"))?, socket);
        assert_eq!(
            std::fs::read_link(root.join("mapper").join("control"))?,
            PathBuf::from("../dmctl")
        );

        // The alias name is reserved
        assert!(links.create_endpoints("control", SlotId::new(1)).is_err());

        links.remove_control_endpoint()?;
        assert!(std::fs::symlink_metadata(root.join("dmctl")).is_err());

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }
}
