//! The default module loader hook: resolves bare and relative module names
//! against the configured search path, handles `.js` script files and
//! `__init__.js` package directories, and loads compiled native modules as
//! dynamic libraries.
//!
//! Grounded on `natus_backend::loader`'s open-then-symbol-lookup shape: a
//! native module exports one well-known symbol, `natus_module_init`, and
//! is expected to have linked against the same backend the host process
//! already has loaded — exactly the "already resolves in this process"
//! assumption `natus_backend::loader::process_symbol_resolves` checks for
//! engine plugins, reused here for modules instead of engines.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use libloading::{Library, Symbol};
use natus_backend::{CtxId, RawHandle};

use crate::context::Context;
use crate::error::NatusError;
use crate::require::{LoadHook, ModuleHook, ProcessHook, RequireState, ResolveHook};
use crate::value::Value;

pub const NATIVE_INIT_SYMBOL: &[u8] = b"natus_module_init\0";

/// The native module entry point: given the context id and exports handle
/// of the scope it's being loaded into, populates `exports` and returns 0
/// on success, any other value on failure. Declared `extern "C"` so a
/// module can be built and shipped independently of this crate's Rust ABI.
pub type NativeInitFn = unsafe extern "C" fn(ctx: CtxId, exports: RawHandle) -> i32;

fn platform_native_suffix() -> &'static str {
    if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}

fn candidate_paths(search_paths: &[PathBuf], name: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for dir in search_paths {
        out.push(dir.join(format!("{name}.{}", platform_native_suffix())));
        out.push(dir.join(format!("{name}.js")));
        out.push(dir.join(name).join("__init__.js"));
    }
    out
}

/// Strips a leading UTF-8 BOM, then a `#!` shebang line if one follows —
/// a `.js` module meant to double as a standalone script needs both gone
/// before an engine's parser ever sees the source.
pub fn strip_shebang_and_bom(source: &str) -> &str {
    let without_bom = source.strip_prefix('\u{feff}').unwrap_or(source);
    if let Some(rest) = without_bom.strip_prefix("#!") {
        match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    } else {
        without_bom
    }
}

fn is_native(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(platform_native_suffix())
}

/// Registers the default loader hook on `state`. `search_paths` is usually
/// built from `NATUS_PATH` plus the engine's own default module directory.
pub fn install(state: &RequireState, search_paths: Vec<PathBuf>) {
    let resolve_paths = Rc::new(search_paths);
    let resolve_paths_for_resolve = Rc::clone(&resolve_paths);

    let resolve: ResolveHook = Rc::new(move |_state, name, current| {
        if let Some(relative) = name.strip_prefix("./").or_else(|| name.strip_prefix("../")) {
            let base = current
                .and_then(|c| Path::new(c).parent())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let full = if name.starts_with("./") {
                base.join(relative)
            } else {
                base.join(name)
            };
            return Some(full.to_string_lossy().into_owned());
        }
        candidate_paths(&resolve_paths_for_resolve, name)
            .into_iter()
            .find(|p| p.exists())
            .map(|p| p.to_string_lossy().into_owned())
    });

    let load: LoadHook = Rc::new(|_state, resolved| {
        let path = Path::new(resolved);
        if !path.exists() {
            return Ok(None);
        }
        if is_native(path) {
            // The library itself is opened in `process`; `load` only needs
            // to confirm the candidate is real.
            return Ok(Some(String::new()));
        }
        let text = fs::read_to_string(path).map_err(NatusError::os)?;
        Ok(Some(strip_shebang_and_bom(&text).to_string()))
    });

    let process: ProcessHook = Rc::new(|ctx, exports, resolved, source| {
        let path = Path::new(resolved);
        if is_native(path) {
            load_native_module(ctx, exports, path)
        } else {
            let result = ctx.evaluate(exports, source, resolved, 1)?;
            if result.is_exception() {
                return Err(NatusError::script(
                    result.to_rust_string().unwrap_or_else(|_| "module evaluation threw".to_string()),
                ));
            }
            Ok(())
        }
    });

    state.add_hook(ModuleHook {
        id: "native".to_string(),
        resolve,
        load,
        process,
    });
}

fn load_native_module(ctx: &Context, exports: &Value, path: &Path) -> crate::error::NatusResult<()> {
    // SAFETY: `path` came from the configured module search path, and
    // loading it runs its static initializers immediately — the same
    // trust boundary as dlopen-ing any other native extension.
    let lib = unsafe { Library::new(path) }.map_err(|e| NatusError::import(format!("{}: {e}", path.display())))?;
    // SAFETY: `NATIVE_INIT_SYMBOL` is a NUL-terminated byte string and
    // `NativeInitFn`'s signature matches what every native module is
    // documented to export.
    let init: Symbol<NativeInitFn> = unsafe {
        lib.get(NATIVE_INIT_SYMBOL)
            .map_err(|_| NatusError::import(format!("{}: missing natus_module_init symbol", path.display())))?
    };
    // SAFETY: `ctx`/`exports` are a live context id and a live handle in
    // that context for as long as this call runs; the module is expected
    // to have linked against the same backend already loaded in this
    // process, the same assumption engine plugins make about the host.
    let status = unsafe { init(ctx.ctx_id(), exports.raw()) };
    // Keep the library mapped for as long as the context lives: any
    // function pointers or statics it registered must stay valid, and
    // natus has no notion of unloading a module once required. Parented
    // to nothing, so it is only reclaimed (and the library unloaded) when
    // the whole graph drops with the context.
    ctx.graph().new_node(None, lib);
    if status != 0 {
        return Err(NatusError::import(format!(
            "{}: natus_module_init returned {status}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_shebang_and_bom_removes_both_in_order() {
        let source = "\u{feff}#!/usr/bin/env natus\nconsole.log(1);";
        assert_eq!(strip_shebang_and_bom(source), "console.log(1);");
    }

    #[test]
    fn strip_shebang_and_bom_is_noop_on_plain_source() {
        let source = "console.log(1);";
        assert_eq!(strip_shebang_and_bom(source), source);
    }

    #[test]
    fn candidate_paths_cover_dylib_script_and_package_shapes() {
        let dirs = vec![PathBuf::from("/opt/modules")];
        let candidates = candidate_paths(&dirs, "widgets");
        assert!(candidates.iter().any(|p| p.ends_with(format!("widgets.{}", platform_native_suffix()))));
        assert!(candidates.iter().any(|p| p.ends_with("widgets.js")));
        assert!(candidates.iter().any(|p| p.ends_with("widgets/__init__.js")));
    }
}
