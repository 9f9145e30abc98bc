//! The on-disk plugin ABI: the fixed `#[repr(C)]` shape a dynamic-library
//! backend plugin exports under a single symbol.
//!
//! This module only documents and verifies the wire format; the actual
//! `Backend` trait implementation for a loaded plugin lives in
//! [`crate::loader::FfiBackend`]. No shipped engine plugin exists in this
//! repo (writing one means binding a real SpiderMonkey/V8/JavaScriptCore,
//! which is out of scope) — this module exists so third-party plugin
//! authors have a concrete target to implement against.

use std::os::raw::{c_char, c_void};

/// The host's expected ABI version. A plugin's `version` field must match
/// this exactly; there is no forward/backward compatibility story.
pub const ABI_VERSION: u32 = 1;

/// The fixed symbol name every plugin must export, holding a
/// `*const BackendDescriptor`.
pub const ENTRY_SYMBOL: &[u8] = b"NATUS_BACKEND\0";

/// The plugin's self-description, exported as `NATUS_BACKEND`.
///
/// `required_symbol`, when non-null, names a symbol the loader probes for in
/// the process's global symbol table (not in the plugin itself) before
/// accepting the plugin — e.g. a SpiderMonkey plugin might require
/// `JS_Init` to already be resolvable, proving libmozjs is actually linked
/// into the host process.
#[repr(C)]
pub struct BackendDescriptor {
    pub version: u32,
    pub name: *const c_char,
    pub required_symbol: *const c_char,
    pub vtable: *const BackendVTable,
}

/// The raw, `extern "C"` vtable a plugin fills in. Each slot corresponds to
/// one operation of the [`crate::backend::Backend`] trait; the loader
/// wraps a successfully verified `BackendDescriptor` in
/// [`crate::loader::FfiBackend`], which adapts these raw calls into the safe
/// trait so `natus` never touches `unsafe extern "C" fn` pointers directly.
///
/// Signatures are intentionally minimal (`c_void` pointers and length-
/// prefixed buffers) since the concrete calling convention is dictated by
/// whichever engine a real plugin binds, not by natus.
#[repr(C)]
pub struct BackendVTable {
    pub ctx_free: unsafe extern "C" fn(ctx: u64),
    pub val_unlock: unsafe extern "C" fn(ctx: u64, raw: usize),
    pub val_duplicate: unsafe extern "C" fn(ctx: u64, raw: usize) -> usize,
    pub val_free: unsafe extern "C" fn(ctx: u64, raw: usize),

    pub new_global: unsafe extern "C" fn(
        parent_ctx: u64,
        parent_val: usize,
        has_parent: bool,
        priv_map: *mut c_void,
        out_ctx: *mut u64,
        out_val: *mut usize,
    ) -> bool,
    pub new_bool: unsafe extern "C" fn(ctx: u64, b: bool) -> usize,
    pub new_number: unsafe extern "C" fn(ctx: u64, n: f64) -> usize,
    pub new_string_utf8: unsafe extern "C" fn(ctx: u64, data: *const u8, len: usize) -> usize,
    pub new_null: unsafe extern "C" fn(ctx: u64) -> usize,
    pub new_undefined: unsafe extern "C" fn(ctx: u64) -> usize,

    pub to_bool: unsafe extern "C" fn(ctx: u64, raw: usize) -> bool,
    pub to_double: unsafe extern "C" fn(ctx: u64, raw: usize) -> f64,

    pub get_private: unsafe extern "C" fn(ctx: u64, obj: usize) -> *mut c_void,
    pub get_type: unsafe extern "C" fn(ctx: u64, raw: usize) -> u32,
    pub equal: unsafe extern "C" fn(ctx: u64, a: usize, b: usize, strict: bool) -> bool,
}
