//! Bounded, shareable mapping names and backing paths
//!
//! Names and paths are validated once on the way in and then stored as
//! `Arc<str>`, so the mapping record and the name index share one
//! allocation instead of copying the string.

use crate::error::{Error, Result};
use serde::{Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Size of the fixed name field on the wire, including the NUL terminator
pub const NAME_FIELD_LEN: usize = 256;

/// Size of the fixed backing-path field on the wire, including the NUL terminator
pub const PATH_FIELD_LEN: usize = 1024;

/// Size of the fixed module-name field on the wire, including the NUL terminator
pub const MODULE_NAME_FIELD_LEN: usize = 80;

/// Longest mapping name accepted
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

/// Longest backing path accepted
pub const MAX_PATH_LEN: usize = PATH_FIELD_LEN - 1;

/// Longest module name accepted
pub const MAX_MODULE_NAME_LEN: usize = MODULE_NAME_FIELD_LEN - 1;

/// Mapping name
///
/// Non-empty, at most [`MAX_NAME_LEN`] bytes, no NUL and no `/` since the
/// name becomes a filesystem entry under the endpoint root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapName(Arc<str>);

impl MapName {
    pub fn new(name: &str) -> Result<Self> {
        check_bounded("mapping name", name, MAX_NAME_LEN)?;
        if name.contains('/') || name == "." || name == ".." {
            return Err(Error::InvalidName(format!(
                "mapping name '{}' is not a valid file name",
                name
            )));
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Backing device path, at most [`MAX_PATH_LEN`] bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackingPath(Arc<str>);

impl BackingPath {
    pub fn new(path: &str) -> Result<Self> {
        check_bounded("backing path", path, MAX_PATH_LEN)?;
        Ok(Self(Arc::from(path)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a `scheme:rest` path into its scheme and remainder.
    ///
    /// Only lowercase alphanumerics and `_` count as a scheme, so absolute
    /// paths and paths with a colon further in are left alone.
    pub fn split_scheme(&self) -> Option<(&str, &str)> {
        let (scheme, rest) = self.0.split_once(':')?;
        let valid = !scheme.is_empty()
            && scheme
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if valid && !rest.is_empty() {
            Some((scheme, rest))
        } else {
            None
        }
    }
}

/// Validate a module name against the module-name field bound
///
/// The name is spliced into a library file name, so it may not contain a
/// path separator or be a relative directory.
pub fn check_module_name(name: &str) -> Result<()> {
    check_bounded("module name", name, MAX_MODULE_NAME_LEN)?;
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(Error::InvalidName(format!(
            "module name '{}' is not a valid file name",
            name
        )));
    }
    Ok(())
}

fn check_bounded(what: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidName(format!("{} must not be empty", what)));
    }
    if value.len() > max {
        return Err(Error::InvalidName(format!(
            "{} is {} bytes (max: {})",
            what,
            value.len(),
            max
        )));
    }
    if value.contains('\0') {
        return Err(Error::InvalidName(format!("{} contains a NUL byte", what)));
    }
    Ok(())
}

macro_rules! impl_str_traits {
    ($ty:ty) => {
        impl Deref for $ty {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }
    };
}

impl_str_traits!(MapName);
impl_str_traits!(BackingPath);
