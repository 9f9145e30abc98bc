//! Low-level engine-plugin ABI and the [`Backend`] protocol every embedded
//! JavaScript engine implements.
//!
//! This crate is the unsafe foundation beneath `natus`: it defines the
//! plugin wire format, the loader that discovers and verifies a plugin, and
//! the `Backend` trait that the safe façade in the `natus` crate calls into.
//! It does not implement a JavaScript engine; it bundles a `mock` reference
//! backend (feature-gated) used for the façade's own test suite and as a
//! worked example for plugin authors.

pub mod abi;
pub mod backend;
pub mod error;
pub mod loader;

#[cfg(feature = "mock")]
pub mod mock;

pub use backend::{
    Backend, BackendResult, CtxId, Flags, Outcome, PropertyAction, PropertyAttrs, PropertyId,
    RawHandle, RawPriv, TypeTag,
};
pub use error::BackendError;
pub use loader::{EngineHandle, EngineLoader};
