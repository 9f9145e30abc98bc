//! A safe façade over pluggable embedded JavaScript engine backends.
//!
//! `natus` never implements a JavaScript engine itself — that's the job of
//! a [`natus_backend::Backend`] plugin, loaded by [`natus_backend::EngineLoader`]
//! or wrapped directly via [`natus_backend::EngineHandle::from_builtin`].
//! What this crate provides is everything a host embedding one of those
//! engines needs regardless of which it picked: a reference-counted value
//! handle ([`Value`]), an execution scope ([`Context`]), native classes
//! that intercept property/call operations ([`class::Class`]), a
//! `require`-style module system (`require`), argument validation
//! (`args`), and a JSON bridge (`json`).

pub mod args;
pub mod class;
pub mod context;
pub mod error;
pub mod json;
pub mod mem;
pub mod private;
pub mod require;
pub mod value;

pub use context::Context;
pub use error::{NatusError, NatusResult, OsErrorFamily};
pub use value::Value;

pub use natus_backend::{Backend, BackendError, EngineHandle, EngineLoader};
