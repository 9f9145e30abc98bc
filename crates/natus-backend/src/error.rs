use std::path::PathBuf;

/// Failures that can occur while discovering, opening, and verifying an
/// engine plugin (component C). Distinct from JS-level exceptions, which are
/// carried as an [`crate::backend::Outcome::Exception`] instead of an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no engine plugin found for {0:?}")]
    NotFound(String),

    #[error("failed to open plugin at {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("plugin at {path:?} does not export the natus backend descriptor symbol")]
    SymbolMissing { path: PathBuf },

    #[error("plugin at {path:?} reports ABI version {found}, host expects {expected}")]
    VersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("plugin at {path:?} requires process symbol {symbol:?}, which is not linked")]
    RequiredSymbolMissing { path: PathBuf, symbol: String },

    #[error("engine allocation failed (out of memory)")]
    OutOfMemory,
}
