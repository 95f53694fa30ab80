//! Control endpoint
//!
//! Administration requests reach the mapper as framed commands on a Unix
//! socket. Each request is decoded, executed against the mapping table or
//! module registry, and answered with a status code plus an optional body.
//!
//! # Architecture
//!
//! ```text
//! dmadm ── ControlClient ── unix socket ── ControlServer ── Dispatcher ─┬─→ MappingTable
//!                                                                      └─→ ModuleRegistry
//! ```

use crate::error::Error;
use std::fmt;

pub mod client;
pub mod dispatcher;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use dispatcher::Dispatcher;
pub use protocol::{Command, ControlReply, ControlRequest, EntryRecord, ModuleRecord};
pub use server::ControlServer;

/// Reply status, numbered after the matching errno values
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    NotFound,
    Io,
    NoDevice,
    BadModule,
    Fault,
    Busy,
    Exists,
    Invalid,
    NoSpace,
}

impl Status {
    pub fn code(self) -> u32 {
        match self {
            Status::Ok => 0,
            Status::NotFound => 2,
            Status::Io => 5,
            Status::NoDevice => 6,
            Status::BadModule => 8,
            Status::Fault => 14,
            Status::Busy => 16,
            Status::Exists => 17,
            Status::Invalid => 22,
            Status::NoSpace => 28,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Status::Ok,
            2 => Status::NotFound,
            5 => Status::Io,
            6 => Status::NoDevice,
            8 => Status::BadModule,
            14 => Status::Fault,
            16 => Status::Busy,
            17 => Status::Exists,
            22 => Status::Invalid,
            28 => Status::NoSpace,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    fn symbol(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "ENOENT",
            Status::Io => "EIO",
            Status::NoDevice => "ENXIO",
            Status::BadModule => "ENOEXEC",
            Status::Fault => "EFAULT",
            Status::Busy => "EBUSY",
            Status::Exists => "EEXIST",
            Status::Invalid => "EINVAL",
            Status::NoSpace => "ENOSPC",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Status::Ok => "success",
            Status::NotFound => "no such mapping or module",
            Status::Io => "I/O error",
            Status::NoDevice => "no such device",
            Status::BadModule => "bad module",
            Status::Fault => "malformed request",
            Status::Busy => "resource busy",
            Status::Exists => "already exists",
            Status::Invalid => "invalid argument",
            Status::NoSpace => "no free mapping slots",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(), self.symbol())
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.symbol(), self.code())
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        match err {
            Error::Exhausted { .. } => Status::NoSpace,
            Error::NameInUse(_) | Error::AlreadyLoaded(_) => Status::Exists,
            Error::NotFound(_) | Error::NotLoaded(_) | Error::ModuleNotFound(_) => Status::NotFound,
            Error::InvalidName(_) | Error::InvalidCommand(_) | Error::Config(_) => Status::Invalid,
            Error::OpenFailed { .. } | Error::NoSuchMapping(_) => Status::NoDevice,
            Error::SymbolMissing { .. } | Error::InvalidModule(_) => Status::BadModule,
            Error::Busy { .. } => Status::Busy,
            Error::Decode(_) => Status::Fault,
            Error::Endpoint { .. } | Error::Hook { .. } | Error::ControlEndpoint | Error::Io(_) => {
                Status::Io
            }
            Error::Remote(status) => *status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [
            Status::Ok,
            Status::NotFound,
            Status::Io,
            Status::NoDevice,
            Status::BadModule,
            Status::Fault,
            Status::Busy,
            Status::Exists,
            Status::Invalid,
            Status::NoSpace,
        ] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(1), None);
        assert_eq!(Status::Busy.code(), 16);
    }

    #[test]
    fn test_error_to_status() {
        assert_eq!(Status::from(&Error::Exhausted { capacity: 3 }), Status::NoSpace);
        assert_eq!(Status::from(&Error::NameInUse("a".into())), Status::Exists);
        assert_eq!(Status::from(&Error::NotFound("a".into())), Status::NotFound);
        assert_eq!(Status::from(&Error::InvalidCommand(7)), Status::Invalid);
        assert_eq!(Status::from(&Error::Decode("short".into())), Status::Fault);
        assert_eq!(
            Status::from(&Error::Busy {
                name: "debug".into(),
                refs: 1
            }),
            Status::Busy
        );
        assert_eq!(Status::from(&Error::Remote(Status::Exists)), Status::Exists);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Busy.to_string(), "resource busy (EBUSY)");
        assert_eq!(format!("{:?}", Status::NotFound), "ENOENT(2)");
    }
}
