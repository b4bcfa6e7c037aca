//! Error types for the rebind transformation core.
//!
//! Configuration errors are fatal and surface before mounting. Transform
//! errors are per-request and map to the errno the FUSE layer replies with.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Which identity namespace an id belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IdKind {
    User,
    Group,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Group => f.write_str("group"),
        }
    }
}

/// Startup configuration errors. Never produced while serving requests.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Malformed `--perms`, `--create-with-perms` or `--chmod-filter` value.
    #[error("invalid permission specification '{spec}': {reason}")]
    InvalidPermSpec { spec: String, reason: String },

    /// Malformed `--map` entry.
    #[error("invalid user/group map '{0}'")]
    InvalidMapSpec(String),

    /// The same source id was mapped twice in one direction.
    #[error("{kind} {from} mapped twice")]
    DuplicateMapping { kind: IdKind, from: u32 },

    #[error("not a valid user ID: {0}")]
    UnknownUser(String),

    #[error("not a valid group ID: {0}")]
    UnknownGroup(String),

    #[error("invalid {kind} offset '{value}'")]
    InvalidOffset { kind: IdKind, value: String },

    #[error("cannot specify both {0} and {1}")]
    Conflict(&'static str, &'static str),

    #[error("you need to be root to use {0}")]
    RequiresRoot(&'static str),

    #[error("failed to read {path}: {source}")]
    MapFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: expected at least three ':'-separated fields")]
    MapFileLine { path: PathBuf, line: usize },

    /// Identity database lookup failed while resolving a name.
    #[error("identity lookup for '{name}' failed: {source}")]
    Lookup {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Per-request transformation errors with errno mapping.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Offset arithmetic left the representable id range.
    #[error("{kind} {id} with offset {offset} is out of range")]
    IdOutOfRange { kind: IdKind, id: u32, offset: i64 },

    /// A chown/chgrp/chmod/delete/rename policy refused the request.
    #[error("{0} denied by policy")]
    PolicyDenied(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransformError {
    /// Map error to the errno returned to the kernel.
    ///
    /// - EIO: identity overflow (never clamped)
    /// - EPERM: policy denial
    /// - underlying errno for I/O errors, EIO if there is none
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::IdOutOfRange { .. } => libc::EIO,
            Self::PolicyDenied(_) => libc::EPERM,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Expected outcomes that should not be logged as anomalies.
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::PolicyDenied(_))
    }
}

pub type Result<T> = std::result::Result<T, TransformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_maps_to_eio() {
        let err = TransformError::IdOutOfRange {
            kind: IdKind::User,
            id: 10,
            offset: -20,
        };
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(!err.is_policy());
        assert_eq!(err.to_string(), "user 10 with offset -20 is out of range");
    }

    #[test]
    fn test_policy_denied_maps_to_eperm() {
        let err = TransformError::PolicyDenied("chown");
        assert_eq!(err.to_errno(), libc::EPERM);
        assert!(err.is_policy());
    }

    #[test]
    fn test_io_error_keeps_errno() {
        let err = TransformError::from(io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.to_errno(), libc::ENOENT);

        let err = TransformError::from(io::Error::new(io::ErrorKind::Other, "no errno"));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_duplicate_mapping_message() {
        let err = ConfigError::DuplicateMapping {
            kind: IdKind::Group,
            from: 100,
        };
        assert_eq!(err.to_string(), "group 100 mapped twice");
    }
}
