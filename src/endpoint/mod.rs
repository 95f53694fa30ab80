//! Endpoint naming
//!
//! Turns a mapping into user-visible filesystem entries. The mapping table
//! calls [`EndpointNamer::create_endpoints`] right before publishing a new
//! record and [`EndpointNamer::remove_endpoints`] while tearing one down.

use crate::slot::SlotId;
use std::io;

pub mod links;
pub mod mock;

pub use links::LinkEndpoints;
pub use mock::MockEndpoints;

/// Creates and removes the endpoints of a mapping
pub trait EndpointNamer: Send + Sync {
    /// Create all endpoints for `name`.
    ///
    /// On error nothing created by this call may remain.
    fn create_endpoints(&self, name: &str, slot: SlotId) -> io::Result<()>;

    /// Remove all endpoints for `name`. Missing entries are not an error.
    fn remove_endpoints(&self, name: &str) -> io::Result<()>;
}

/// Endpoint namer that exposes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEndpoints;

impl EndpointNamer for NullEndpoints {
    fn create_endpoints(&self, _name: &str, _slot: SlotId) -> io::Result<()> {
        Ok(())
    }

    fn remove_endpoints(&self, _name: &str) -> io::Result<()> {
        Ok(())
    }
}
