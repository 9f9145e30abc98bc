//! The engine loader: discovers, opens, and verifies a backend plugin,
//! producing an [`EngineHandle`] the safe façade can build a `Context` from.
//!
//! Three candidate shapes are tried in order: a direct path, a named file
//! in the engines directory, then enumeration of the engines directory for
//! the first plugin that opens and verifies cleanly. The dynamic-library
//! mechanics (open, symbol lookup, required-symbol probe) follow the same
//! `libloading`-based dynamic symbol resolution used elsewhere for loading
//! native runtime components.

use std::{
    ffi::CStr,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    abi::{BackendDescriptor, ABI_VERSION, ENTRY_SYMBOL},
    backend::Backend,
    error::BackendError,
};

/// A loaded engine plugin: the library handle (if the plugin came from a
/// dynamic library) and the backend it exposes.
///
/// `Arc`-shared so the backing library is only unloaded once no context
/// references it anymore. Each `natus::Context` holds one clone of this
/// handle for as long as it's alive.
pub struct EngineHandle {
    name: String,
    backend: Arc<dyn Backend>,
    // Kept alive only to outlive every raw function pointer we resolved
    // from it; dropped (unloading the library) only when the last
    // `EngineHandle` clone goes away.
    _library: Option<Arc<libloading::Library>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").field("name", &self.name).finish()
    }
}

impl EngineHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Wraps an already-constructed backend with no backing dynamic
    /// library. Used for statically-linked backends (the bundled `mock`
    /// reference backend, or a host that links a real engine directly
    /// instead of loading it as a plugin).
    pub fn from_builtin(name: impl Into<String>, backend: Arc<dyn Backend>) -> EngineHandle {
        EngineHandle {
            name: name.into(),
            backend,
            _library: None,
        }
    }
}

impl Clone for EngineHandle {
    fn clone(&self) -> Self {
        EngineHandle {
            name: self.name.clone(),
            backend: Arc::clone(&self.backend),
            _library: self._library.clone(),
        }
    }
}

/// Discovers and loads backend plugins.
pub struct EngineLoader {
    engines_dir: PathBuf,
    platform_suffix: &'static str,
}

impl EngineLoader {
    pub fn new(engines_dir: impl Into<PathBuf>) -> EngineLoader {
        EngineLoader {
            engines_dir: engines_dir.into(),
            platform_suffix: platform_module_suffix(),
        }
    }

    /// Loads a named or path-given backend:
    /// 1. If given, try it as a direct path, then `<engines-dir>/<name>.<suffix>`.
    /// 2. Else enumerate `<engines-dir>` for the platform suffix.
    pub fn load(&self, name_or_path: Option<&str>) -> Result<EngineHandle, BackendError> {
        match name_or_path {
            Some(n) => self.load_named(n),
            None => self.load_first_available(),
        }
    }

    fn load_named(&self, name_or_path: &str) -> Result<EngineHandle, BackendError> {
        let direct = Path::new(name_or_path);
        if direct.exists() {
            debug!(path = %direct.display(), "probing engine plugin (direct path)");
            if let Ok(handle) = self.try_candidate(direct) {
                return Ok(handle);
            }
        }

        let candidate = self
            .engines_dir
            .join(format!("{name_or_path}.{}", self.platform_suffix));
        debug!(path = %candidate.display(), "probing engine plugin (engines-dir)");
        self.try_candidate(&candidate)
    }

    fn load_first_available(&self) -> Result<EngineHandle, BackendError> {
        let entries = std::fs::read_dir(&self.engines_dir).map_err(|_| {
            BackendError::NotFound(self.engines_dir.display().to_string())
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let matches_suffix = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == self.platform_suffix)
                .unwrap_or(false);
            if !matches_suffix {
                continue;
            }
            debug!(path = %path.display(), "probing engine plugin (enumeration)");
            match self.try_candidate(&path) {
                Ok(handle) => return Ok(handle),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "engine plugin candidate rejected");
                }
            }
        }

        Err(BackendError::NotFound(self.engines_dir.display().to_string()))
    }

    fn try_candidate(&self, path: &Path) -> Result<EngineHandle, BackendError> {
        // Once a library opens, rejection is a hard error rather than a
        // fallthrough to the next candidate: only the *absence* of a
        // candidate (file not found) continues the search, which
        // `load_first_available` handles by matching on `Err` before trying
        // the next entry in that caller, not here.
        let library = unsafe {
            libloading::Library::new(path).map_err(|source| BackendError::Open {
                path: path.to_owned(),
                source,
            })?
        };

        let descriptor: libloading::Symbol<*const BackendDescriptor> =
            unsafe { library.get(ENTRY_SYMBOL) }.map_err(|_| BackendError::SymbolMissing {
                path: path.to_owned(),
            })?;

        let descriptor = unsafe { &**descriptor };

        if descriptor.version != ABI_VERSION {
            return Err(BackendError::VersionMismatch {
                path: path.to_owned(),
                found: descriptor.version,
                expected: ABI_VERSION,
            });
        }

        if !descriptor.required_symbol.is_null() {
            let symbol = unsafe { CStr::from_ptr(descriptor.required_symbol) }
                .to_string_lossy()
                .into_owned();
            if !process_symbol_resolves(&symbol) {
                return Err(BackendError::RequiredSymbolMissing {
                    path: path.to_owned(),
                    symbol,
                });
            }
        }

        let name = unsafe { CStr::from_ptr(descriptor.name) }
            .to_string_lossy()
            .into_owned();

        let backend: Arc<dyn Backend> = Arc::new(FfiBackend::new(name.clone(), descriptor.vtable));

        Ok(EngineHandle {
            name,
            backend,
            _library: Some(Arc::new(library)),
        })
    }
}

/// Adapts a raw [`crate::abi::BackendVTable`] into the safe [`Backend`]
/// trait. No shipped plugin exercises this path (see module docs); it
/// exists so the ABI in `abi.rs` is not merely decorative.
pub struct FfiBackend {
    name: String,
    vtable: *const crate::abi::BackendVTable,
}

// SAFETY: a loaded plugin's vtable is immutable for the life of the
// library, and natus never shares a single `Context`/backend across
// threads, so the raw pointer is only ever dereferenced from the one
// thread that owns the owning `Context`.
unsafe impl Send for FfiBackend {}
unsafe impl Sync for FfiBackend {}

impl FfiBackend {
    fn new(name: String, vtable: *const crate::abi::BackendVTable) -> FfiBackend {
        FfiBackend { name, vtable }
    }

    fn vtable(&self) -> &crate::abi::BackendVTable {
        unsafe { &*self.vtable }
    }
}

impl Backend for FfiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn ctx_free(&self, ctx: crate::backend::CtxId) {
        unsafe { (self.vtable().ctx_free)(ctx.0) }
    }

    fn val_unlock(&self, ctx: crate::backend::CtxId, raw: crate::backend::RawHandle) {
        unsafe { (self.vtable().val_unlock)(ctx.0, raw.0) }
    }

    fn val_duplicate(
        &self,
        ctx: crate::backend::CtxId,
        raw: crate::backend::RawHandle,
    ) -> crate::backend::RawHandle {
        crate::backend::RawHandle(unsafe { (self.vtable().val_duplicate)(ctx.0, raw.0) })
    }

    fn val_free(&self, ctx: crate::backend::CtxId, raw: crate::backend::RawHandle) {
        unsafe { (self.vtable().val_free)(ctx.0, raw.0) }
    }

    fn new_global(
        &self,
        parent: Option<(crate::backend::CtxId, crate::backend::RawHandle)>,
        priv_map: crate::backend::RawPriv,
    ) -> crate::backend::BackendResult<(crate::backend::CtxId, crate::backend::RawHandle, crate::backend::Flags)>
    {
        let (parent_ctx, parent_val, has_parent) = match parent {
            Some((c, v)) => (c.0, v.0, true),
            None => (0, 0, false),
        };
        let mut out_ctx = 0u64;
        let mut out_val = 0usize;
        let ok = unsafe {
            (self.vtable().new_global)(
                parent_ctx,
                parent_val,
                has_parent,
                priv_map,
                &mut out_ctx,
                &mut out_val,
            )
        };
        if !ok {
            return Err(BackendError::OutOfMemory);
        }
        Ok((
            crate::backend::CtxId(out_ctx),
            crate::backend::RawHandle(out_val),
            crate::backend::Flags::ROOTED,
        ))
    }

    fn new_bool(&self, ctx: crate::backend::CtxId, b: bool) -> crate::backend::RawHandle {
        crate::backend::RawHandle(unsafe { (self.vtable().new_bool)(ctx.0, b) })
    }

    fn new_number(&self, ctx: crate::backend::CtxId, n: f64) -> crate::backend::RawHandle {
        crate::backend::RawHandle(unsafe { (self.vtable().new_number)(ctx.0, n) })
    }

    fn new_string_utf8(&self, ctx: crate::backend::CtxId, s: &str) -> crate::backend::RawHandle {
        crate::backend::RawHandle(unsafe {
            (self.vtable().new_string_utf8)(ctx.0, s.as_ptr(), s.len())
        })
    }

    fn new_string_utf16(&self, _ctx: crate::backend::CtxId, _s: &[u16]) -> crate::backend::RawHandle {
        unimplemented!("no shipped FFI plugin exercises UTF-16 string creation")
    }

    fn new_array(
        &self,
        _ctx: crate::backend::CtxId,
        _items: &[crate::backend::RawHandle],
    ) -> crate::backend::RawHandle {
        unimplemented!("no shipped FFI plugin exercises array creation")
    }

    fn new_function(
        &self,
        _ctx: crate::backend::CtxId,
        _name: &str,
        _priv_map: crate::backend::RawPriv,
    ) -> crate::backend::RawHandle {
        unimplemented!("no shipped FFI plugin exercises function creation")
    }

    fn new_object(
        &self,
        _ctx: crate::backend::CtxId,
        _priv_map: crate::backend::RawPriv,
    ) -> crate::backend::RawHandle {
        unimplemented!("no shipped FFI plugin exercises object creation")
    }

    fn new_null(&self, ctx: crate::backend::CtxId) -> crate::backend::RawHandle {
        crate::backend::RawHandle(unsafe { (self.vtable().new_null)(ctx.0) })
    }

    fn new_undefined(&self, ctx: crate::backend::CtxId) -> crate::backend::RawHandle {
        crate::backend::RawHandle(unsafe { (self.vtable().new_undefined)(ctx.0) })
    }

    fn to_bool(&self, ctx: crate::backend::CtxId, raw: crate::backend::RawHandle) -> bool {
        unsafe { (self.vtable().to_bool)(ctx.0, raw.0) }
    }

    fn to_double(&self, ctx: crate::backend::CtxId, raw: crate::backend::RawHandle) -> f64 {
        unsafe { (self.vtable().to_double)(ctx.0, raw.0) }
    }

    fn to_string_utf8(&self, _ctx: crate::backend::CtxId, _raw: crate::backend::RawHandle) -> String {
        unimplemented!("no shipped FFI plugin exercises string coercion")
    }

    fn to_string_utf16(&self, _ctx: crate::backend::CtxId, _raw: crate::backend::RawHandle) -> Vec<u16> {
        unimplemented!("no shipped FFI plugin exercises string coercion")
    }

    fn del(
        &self,
        _ctx: crate::backend::CtxId,
        _obj: crate::backend::RawHandle,
        _id: &crate::backend::PropertyId,
    ) -> crate::backend::BackendResult<bool> {
        unimplemented!("no shipped FFI plugin exercises property access")
    }

    fn get(
        &self,
        _ctx: crate::backend::CtxId,
        _obj: crate::backend::RawHandle,
        _id: &crate::backend::PropertyId,
    ) -> crate::backend::BackendResult<crate::backend::Outcome> {
        unimplemented!("no shipped FFI plugin exercises property access")
    }

    fn set(
        &self,
        _ctx: crate::backend::CtxId,
        _obj: crate::backend::RawHandle,
        _id: &crate::backend::PropertyId,
        _value: crate::backend::RawHandle,
        _attrs: crate::backend::PropertyAttrs,
    ) -> crate::backend::BackendResult<crate::backend::Outcome> {
        unimplemented!("no shipped FFI plugin exercises property access")
    }

    fn enumerate(
        &self,
        _ctx: crate::backend::CtxId,
        _obj: crate::backend::RawHandle,
    ) -> crate::backend::BackendResult<crate::backend::RawHandle> {
        unimplemented!("no shipped FFI plugin exercises enumeration")
    }

    fn call(
        &self,
        _ctx: crate::backend::CtxId,
        _func: crate::backend::RawHandle,
        _this: crate::backend::RawHandle,
        _args: &[crate::backend::RawHandle],
    ) -> crate::backend::BackendResult<crate::backend::Outcome> {
        unimplemented!("no shipped FFI plugin exercises calls")
    }

    fn evaluate(
        &self,
        _ctx: crate::backend::CtxId,
        _this: crate::backend::RawHandle,
        _source: &str,
        _filename: &str,
        _line: u32,
    ) -> crate::backend::BackendResult<crate::backend::Outcome> {
        unimplemented!("no shipped FFI plugin evaluates script text")
    }

    fn get_private(
        &self,
        ctx: crate::backend::CtxId,
        obj: crate::backend::RawHandle,
    ) -> Option<crate::backend::RawPriv> {
        let p = unsafe { (self.vtable().get_private)(ctx.0, obj.0) };
        if p.is_null() {
            None
        } else {
            Some(p)
        }
    }

    fn get_global(&self, _ctx: crate::backend::CtxId, _obj: crate::backend::RawHandle) -> crate::backend::RawHandle {
        unimplemented!("no shipped FFI plugin exercises get_global")
    }

    fn get_type(&self, ctx: crate::backend::CtxId, raw: crate::backend::RawHandle) -> crate::backend::TypeTag {
        match unsafe { (self.vtable().get_type)(ctx.0, raw.0) } {
            0 => crate::backend::TypeTag::Array,
            1 => crate::backend::TypeTag::Boolean,
            2 => crate::backend::TypeTag::Function,
            3 => crate::backend::TypeTag::Null,
            4 => crate::backend::TypeTag::Number,
            5 => crate::backend::TypeTag::Object,
            6 => crate::backend::TypeTag::String,
            7 => crate::backend::TypeTag::Undefined,
            _ => crate::backend::TypeTag::Unknown,
        }
    }

    fn equal(
        &self,
        ctx: crate::backend::CtxId,
        a: crate::backend::RawHandle,
        b: crate::backend::RawHandle,
        strict: bool,
    ) -> bool {
        unsafe { (self.vtable().equal)(ctx.0, a.0, b.0, strict) }
    }
}

#[cfg(unix)]
fn process_symbol_resolves(symbol: &str) -> bool {
    use libloading::os::unix::Library;
    // `Library::this()` opens a handle to the main program, whose symbol
    // table includes every shared object already loaded into the process,
    // which is what lets a plugin require "already linked into the host"
    // instead of shipping its own copy of the engine.
    match unsafe { Library::this() } {
        lib => {
            let cname = match std::ffi::CString::new(symbol) {
                Ok(c) => c,
                Err(_) => return false,
            };
            unsafe { lib.get::<*const ()>(cname.as_bytes_with_nul()).is_ok() }
        }
    }
}

#[cfg(not(unix))]
fn process_symbol_resolves(_symbol: &str) -> bool {
    // Non-unix process-wide symbol probing isn't implemented; treat any
    // required-symbol plugin as unloadable rather than silently accepting
    // an unverified one.
    false
}

pub(crate) fn platform_module_suffix() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_first_available_reports_not_found_for_missing_dir() {
        let loader = EngineLoader::new("/nonexistent/engines/dir/for/natus/tests");
        let err = loader.load(None).unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[test]
    fn builtin_handle_has_no_backing_library() {
        struct Dummy;
        impl Backend for Dummy {
            fn name(&self) -> &str {
                "dummy"
            }
            fn ctx_free(&self, _ctx: crate::backend::CtxId) {}
            fn val_unlock(&self, _ctx: crate::backend::CtxId, _raw: crate::backend::RawHandle) {}
            fn val_duplicate(
                &self,
                _ctx: crate::backend::CtxId,
                raw: crate::backend::RawHandle,
            ) -> crate::backend::RawHandle {
                raw
            }
            fn val_free(&self, _ctx: crate::backend::CtxId, _raw: crate::backend::RawHandle) {}
            fn new_global(
                &self,
                _parent: Option<(crate::backend::CtxId, crate::backend::RawHandle)>,
                _priv_map: crate::backend::RawPriv,
            ) -> crate::backend::BackendResult<(
                crate::backend::CtxId,
                crate::backend::RawHandle,
                crate::backend::Flags,
            )> {
                Ok((
                    crate::backend::CtxId(0),
                    crate::backend::RawHandle(0),
                    crate::backend::Flags::ROOTED,
                ))
            }
            fn new_bool(&self, _ctx: crate::backend::CtxId, _b: bool) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn new_number(&self, _ctx: crate::backend::CtxId, _n: f64) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn new_string_utf8(&self, _ctx: crate::backend::CtxId, _s: &str) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn new_string_utf16(&self, _ctx: crate::backend::CtxId, _s: &[u16]) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn new_array(
                &self,
                _ctx: crate::backend::CtxId,
                _items: &[crate::backend::RawHandle],
            ) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn new_function(
                &self,
                _ctx: crate::backend::CtxId,
                _name: &str,
                _priv_map: crate::backend::RawPriv,
            ) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn new_object(
                &self,
                _ctx: crate::backend::CtxId,
                _priv_map: crate::backend::RawPriv,
            ) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn new_null(&self, _ctx: crate::backend::CtxId) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn new_undefined(&self, _ctx: crate::backend::CtxId) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn to_bool(&self, _ctx: crate::backend::CtxId, _raw: crate::backend::RawHandle) -> bool {
                false
            }
            fn to_double(&self, _ctx: crate::backend::CtxId, _raw: crate::backend::RawHandle) -> f64 {
                0.0
            }
            fn to_string_utf8(&self, _ctx: crate::backend::CtxId, _raw: crate::backend::RawHandle) -> String {
                String::new()
            }
            fn to_string_utf16(&self, _ctx: crate::backend::CtxId, _raw: crate::backend::RawHandle) -> Vec<u16> {
                Vec::new()
            }
            fn del(
                &self,
                _ctx: crate::backend::CtxId,
                _obj: crate::backend::RawHandle,
                _id: &crate::backend::PropertyId,
            ) -> crate::backend::BackendResult<bool> {
                Ok(false)
            }
            fn get(
                &self,
                _ctx: crate::backend::CtxId,
                _obj: crate::backend::RawHandle,
                _id: &crate::backend::PropertyId,
            ) -> crate::backend::BackendResult<crate::backend::Outcome> {
                Ok(crate::backend::ok_outcome(
                    crate::backend::RawHandle(0),
                    crate::backend::Flags::NONE,
                ))
            }
            fn set(
                &self,
                _ctx: crate::backend::CtxId,
                _obj: crate::backend::RawHandle,
                _id: &crate::backend::PropertyId,
                _value: crate::backend::RawHandle,
                _attrs: crate::backend::PropertyAttrs,
            ) -> crate::backend::BackendResult<crate::backend::Outcome> {
                Ok(crate::backend::ok_outcome(
                    crate::backend::RawHandle(0),
                    crate::backend::Flags::NONE,
                ))
            }
            fn enumerate(
                &self,
                _ctx: crate::backend::CtxId,
                _obj: crate::backend::RawHandle,
            ) -> crate::backend::BackendResult<crate::backend::RawHandle> {
                Ok(crate::backend::RawHandle(0))
            }
            fn call(
                &self,
                _ctx: crate::backend::CtxId,
                _func: crate::backend::RawHandle,
                _this: crate::backend::RawHandle,
                _args: &[crate::backend::RawHandle],
            ) -> crate::backend::BackendResult<crate::backend::Outcome> {
                Ok(crate::backend::ok_outcome(
                    crate::backend::RawHandle(0),
                    crate::backend::Flags::NONE,
                ))
            }
            fn evaluate(
                &self,
                _ctx: crate::backend::CtxId,
                _this: crate::backend::RawHandle,
                _source: &str,
                _filename: &str,
                _line: u32,
            ) -> crate::backend::BackendResult<crate::backend::Outcome> {
                Ok(crate::backend::ok_outcome(
                    crate::backend::RawHandle(0),
                    crate::backend::Flags::NONE,
                ))
            }
            fn get_private(
                &self,
                _ctx: crate::backend::CtxId,
                _obj: crate::backend::RawHandle,
            ) -> Option<crate::backend::RawPriv> {
                None
            }
            fn get_global(
                &self,
                _ctx: crate::backend::CtxId,
                _obj: crate::backend::RawHandle,
            ) -> crate::backend::RawHandle {
                crate::backend::RawHandle(0)
            }
            fn get_type(
                &self,
                _ctx: crate::backend::CtxId,
                _raw: crate::backend::RawHandle,
            ) -> crate::backend::TypeTag {
                crate::backend::TypeTag::Undefined
            }
            fn equal(
                &self,
                _ctx: crate::backend::CtxId,
                _a: crate::backend::RawHandle,
                _b: crate::backend::RawHandle,
                _strict: bool,
            ) -> bool {
                false
            }
        }

        let handle = EngineHandle::from_builtin("dummy", Arc::new(Dummy));
        assert_eq!(handle.name(), "dummy");
        assert!(handle._library.is_none());
    }
}
