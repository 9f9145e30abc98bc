//! The error taxonomy every façade operation that can fail reports through.
//!
//! Modeled as a `thiserror`-derived enum whose variants carry a name and
//! message destined to become a JS error. Every variant here round-trips
//! into a JS error value and back through
//! [`crate::class::exception_from_error`].

use std::io;

/// The OS-failure family an `io::ErrorKind` maps onto, named after the
/// POSIX errno families the host's filesystem and process calls surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsErrorFamily {
    PermissionError,
    FileNotFoundError,
    NotADirectoryError,
    Other,
}

impl OsErrorFamily {
    pub fn from_io_kind(kind: io::ErrorKind) -> OsErrorFamily {
        match kind {
            io::ErrorKind::PermissionDenied => OsErrorFamily::PermissionError,
            io::ErrorKind::NotFound => OsErrorFamily::FileNotFoundError,
            _ => OsErrorFamily::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OsErrorFamily::PermissionError => "PermissionError",
            OsErrorFamily::FileNotFoundError => "FileNotFoundError",
            OsErrorFamily::NotADirectoryError => "NotADirectoryError",
            OsErrorFamily::Other => "OSError",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NatusError {
    /// Invalid `ensure_arguments`/`convert_arguments` format string — a
    /// programmer bug in the native module, not a JS-level mistake.
    #[error("{msg}")]
    Logic { msg: String },

    /// Argument-shape mismatch or an operation applied to the wrong type.
    #[error("{msg}")]
    Type { msg: String },

    /// `require` called with a name outside the active whitelist.
    #[error("{msg}")]
    Security { msg: String },

    /// A module name did not resolve, its init symbol was missing, or its
    /// loader hook returned failure.
    #[error("{msg}")]
    Import { msg: String },

    /// A host I/O failure, mapped from `io::ErrorKind` to a family name.
    #[error("{msg}")]
    Os {
        family: OsErrorFamily,
        errno: i32,
        msg: String,
    },

    /// A JS exception raised by user script or a native hook, carried
    /// through unchanged, just labeled for CLI/log output.
    #[error("{msg}")]
    Script { msg: String },

    #[error(transparent)]
    Backend(#[from] natus_backend::BackendError),
}

impl NatusError {
    pub fn logic(msg: impl Into<String>) -> NatusError {
        NatusError::Logic { msg: msg.into() }
    }

    pub fn type_error(msg: impl Into<String>) -> NatusError {
        NatusError::Type { msg: msg.into() }
    }

    pub fn security(msg: impl Into<String>) -> NatusError {
        NatusError::Security { msg: msg.into() }
    }

    pub fn import(msg: impl Into<String>) -> NatusError {
        NatusError::Import { msg: msg.into() }
    }

    pub fn script(msg: impl Into<String>) -> NatusError {
        NatusError::Script { msg: msg.into() }
    }

    pub fn os(source: io::Error) -> NatusError {
        let family = OsErrorFamily::from_io_kind(source.kind());
        let errno = source.raw_os_error().unwrap_or(-1);
        NatusError::Os {
            family,
            errno,
            msg: source.to_string(),
        }
    }

    /// The taxonomy name this error surfaces as on the JS side.
    pub fn type_name(&self) -> &'static str {
        match self {
            NatusError::Logic { .. } => "LogicError",
            NatusError::Type { .. } => "TypeError",
            NatusError::Security { .. } => "SecurityError",
            NatusError::Import { .. } => "ImportError",
            NatusError::Os { family, .. } => family.name(),
            NatusError::Script { .. } => "Error",
            NatusError::Backend(_) => "EngineError",
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            NatusError::Os { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// The CLI's one-line failure format: `type[: code]: msg`.
    pub fn cli_line(&self) -> String {
        match self.code() {
            Some(code) => format!("{}: {}: {}", self.type_name(), code, self),
            None => format!("{}: {}", self.type_name(), self),
        }
    }
}

pub type NatusResult<T> = Result<T, NatusError>;
