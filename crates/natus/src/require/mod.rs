//! The `require` subsystem: a pluggable pipeline of module loader hooks
//! (resolve → load → process), a per-module `module`/`exports` scope, a
//! module cache keyed by resolved name, a name whitelist and origin
//! whitelist/blacklist restricting which modules may be required at all in
//! sandbox mode, and an evaluation stack so a relative `require("./sibling")`
//! can be resolved against whichever module is currently executing.
//!
//! Hooks are registered, not hard-coded, the same pluggable-backend shape
//! the rest of natus uses: [`native_loader`] installs the one hook every
//! embedder gets by default (filesystem `.js`/native-dylib resolution),
//! but a host can register its own (an in-memory bundle, say) ahead of or
//! instead of it.

pub mod native_loader;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{NatusError, NatusResult};
use crate::value::Value;

pub type ResolveHook = Rc<dyn Fn(&RequireState, &str, Option<&str>) -> Option<String>>;
pub type LoadHook = Rc<dyn Fn(&RequireState, &str) -> NatusResult<Option<String>>>;
pub type ProcessHook = Rc<dyn Fn(&Context, &Value, &str, &str) -> NatusResult<()>>;
pub type OriginMatcher = Rc<dyn Fn(&str) -> bool>;

/// One registered module loader: given a bare or relative name, decides
/// whether it applies (`resolve`), reads its source or marks it as a
/// native module (`load`), then populates `exports` (`process`).
#[derive(Clone)]
pub struct ModuleHook {
    pub id: String,
    pub resolve: ResolveHook,
    pub load: LoadHook,
    pub process: ProcessHook,
}

/// `require` configuration, mirroring the `{natus: {require, origins}}`
/// config shape: `whitelist` is `natus.require.whitelist` (presence means
/// sandbox mode — only listed names may be required, `module.uri` and the
/// `require` function's `paths` property are both suppressed);
/// `origins_whitelist`/`origins_blacklist` are `natus.origins.whitelist`/
/// `.blacklist`, plain name-list matchers registered automatically by
/// [`RequireState::new`]. A host wanting a non-literal matcher (a glob, a
/// signature check) registers one directly with `add_origin_matcher`/
/// `add_origin_blacklist_matcher` instead of going through config.
#[derive(Default)]
pub struct RequireConfig {
    pub search_paths: Vec<std::path::PathBuf>,
    pub whitelist: Option<Vec<String>>,
    pub origins_whitelist: Option<Vec<String>>,
    pub origins_blacklist: Option<Vec<String>>,
}

pub struct RequireState {
    config: RequireConfig,
    hooks: RefCell<Vec<ModuleHook>>,
    origin_matchers: RefCell<Vec<(String, OriginMatcher)>>,
    origin_blacklist: RefCell<Vec<(String, OriginMatcher)>>,
    cache: RefCell<HashMap<String, Value>>,
    eval_stack: RefCell<Vec<String>>,
}

impl RequireState {
    pub fn new(config: RequireConfig) -> RequireState {
        let origins_whitelist = config.origins_whitelist.clone();
        let origins_blacklist = config.origins_blacklist.clone();

        let state = RequireState {
            config,
            hooks: RefCell::new(Vec::new()),
            origin_matchers: RefCell::new(Vec::new()),
            origin_blacklist: RefCell::new(Vec::new()),
            cache: RefCell::new(HashMap::new()),
            eval_stack: RefCell::new(Vec::new()),
        };

        if let Some(list) = origins_whitelist {
            state.add_origin_matcher("natus.origins.whitelist", Rc::new(move |uri: &str| list.iter().any(|w| w == uri)));
        }
        if let Some(list) = origins_blacklist {
            state.add_origin_blacklist_matcher("natus.origins.blacklist", Rc::new(move |uri: &str| list.iter().any(|b| b == uri)));
        }

        state
    }

    pub fn config(&self) -> &RequireConfig {
        &self.config
    }

    pub fn add_hook(&self, hook: ModuleHook) {
        self.hooks.borrow_mut().push(hook);
    }

    /// Removes a previously registered hook by id. Returns whether one was
    /// found.
    pub fn remove_hook(&self, id: &str) -> bool {
        let mut hooks = self.hooks.borrow_mut();
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    pub fn add_origin_matcher(&self, id: impl Into<String>, matcher: OriginMatcher) {
        self.origin_matchers.borrow_mut().push((id.into(), matcher));
    }

    pub fn remove_origin_matcher(&self, id: &str) -> bool {
        let mut matchers = self.origin_matchers.borrow_mut();
        let before = matchers.len();
        matchers.retain(|(matcher_id, _)| matcher_id != id);
        matchers.len() != before
    }

    pub fn add_origin_blacklist_matcher(&self, id: impl Into<String>, matcher: OriginMatcher) {
        self.origin_blacklist.borrow_mut().push((id.into(), matcher));
    }

    pub fn remove_origin_blacklist_matcher(&self, id: &str) -> bool {
        let mut matchers = self.origin_blacklist.borrow_mut();
        let before = matchers.len();
        matchers.retain(|(matcher_id, _)| matcher_id != id);
        matchers.len() != before
    }

    /// `natus.require.whitelist` name gate: `None` is permissive, `Some`
    /// means sandbox mode and the name must appear in the list verbatim.
    fn name_whitelisted(&self, name: &str) -> bool {
        match &self.config.whitelist {
            None => true,
            Some(whitelist) => whitelist.iter().any(|w| w == name),
        }
    }

    /// `origin_permitted(uri)`: true iff the origin whitelist is absent, or
    /// some whitelist matcher accepts `uri` *and* no blacklist matcher
    /// does. The blacklist leg only applies once the whitelist leg already
    /// passed — an absent whitelist is unconditionally permissive and
    /// never consults the blacklist at all.
    fn origin_permitted(&self, uri: &str) -> bool {
        let whitelist = self.origin_matchers.borrow();
        if whitelist.is_empty() {
            return true;
        }
        if !whitelist.iter().any(|(_, matches)| matches(uri)) {
            return false;
        }
        let blacklist = self.origin_blacklist.borrow();
        !blacklist.iter().any(|(_, matches)| matches(uri))
    }

    fn currently_evaluating(&self) -> Option<String> {
        self.eval_stack.borrow().last().cloned()
    }

    /// Runs the full pipeline for `name` and returns the `module` object
    /// (`{id, exports, uri?}`), not its exports directly — used by
    /// [`RequireState::require`] and by hosts that need to inspect
    /// `module.id`/`module.uri` rather than only its exports.
    pub fn require_module(&self, ctx: &Context, name: &str) -> NatusResult<Value> {
        if !self.name_whitelisted(name) {
            return Err(NatusError::security(format!(
                "module '{name}' is not in the require whitelist"
            )));
        }
        if !self.origin_permitted(name) {
            return Err(NatusError::security(format!(
                "module '{name}' is not permitted by the active origin matchers"
            )));
        }

        let current = self.currently_evaluating();
        let hooks = self.hooks.borrow().clone();
        for hook in &hooks {
            let Some(resolved) = (hook.resolve)(self, name, current.as_deref()) else {
                continue;
            };
            if let Some(cached) = self.cache.borrow().get(&resolved) {
                return Ok(cached.clone());
            }
            let Some(source) = (hook.load)(self, &resolved)? else {
                continue;
            };

            let module_ctx = ctx.new_child()?;
            let exports = module_ctx.object();
            let module_obj = module_ctx.object();
            module_obj.set("id", &module_ctx.string(&resolved))?;
            module_obj.set("exports", &exports)?;
            module_ctx.global().set("exports", &exports)?;
            module_ctx.global().set("module", &module_obj)?;
            module_ctx.global().set("require", &require_function(&module_ctx, ctx, self)?)?;

            // Cache before Process runs: a hook that reassigns
            // `module.exports` (rather than mutating the original object
            // in place) does not retroactively update what this cache
            // entry resolves to.
            self.cache.borrow_mut().insert(resolved.clone(), module_obj.clone());
            if self.config.whitelist.is_none() {
                module_obj.set("uri", &module_ctx.string(&format!("file://{resolved}")))?;
            }

            self.eval_stack.borrow_mut().push(resolved.clone());
            let outcome = (hook.process)(&module_ctx, &exports, &resolved, &source);
            self.eval_stack.borrow_mut().pop();
            outcome?;

            return Ok(module_obj);
        }

        Err(NatusError::import(format!(
            "module '{name}' could not be resolved by any registered loader"
        )))
    }

    /// Runs the full pipeline for `name`, returning `module.exports` (which
    /// may differ from the `exports` object `process` hooks were handed, if
    /// one of them reassigned `module.exports` outright).
    pub fn require(&self, ctx: &Context, name: &str) -> NatusResult<Value> {
        let module = self.require_module(ctx, name)?;
        module.get("exports")
    }
}

/// Builds the `require` function a loaded module's scope sees, closing over
/// the root context (so nested requires share the same cache and hooks)
/// rather than the module's own short-lived child context. Exposes a
/// `paths` property listing the configured search path unless `state` is
/// in sandbox mode (`natus.require.whitelist` present), in which case
/// `require.paths` stays undefined.
fn require_function(module_ctx: &Context, root_ctx: &Context, state: &RequireState) -> NatusResult<Value> {
    let root_ctx_for_call = root_ctx.clone();
    let func = module_ctx.function(
        "require",
        Rc::new(move |call_ctx, _this, args| {
            let Some(name) = args.first() else {
                return crate::class::exception_from_error(call_ctx, &NatusError::logic("require() needs a module name"));
            };
            let name = match name.to_rust_string() {
                Ok(s) => s,
                Err(e) => return crate::class::exception_from_error(call_ctx, &e),
            };
            let Some(state) = root_ctx_for_call.require_state() else {
                return crate::class::exception_from_error(call_ctx, &NatusError::logic("require() used before Context::init_require"));
            };
            match state.require(&root_ctx_for_call, &name) {
                Ok(v) => v,
                Err(e) => crate::class::exception_from_error(call_ctx, &e),
            }
        }),
    );

    if state.config.whitelist.is_none() {
        let paths: Vec<Value> = state
            .config
            .search_paths
            .iter()
            .map(|p| module_ctx.string(&p.to_string_lossy()))
            .collect();
        let paths_array = module_ctx.array(&paths);
        func.set("paths", &paths_array)?;
    }

    Ok(func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use natus_backend::mock::MockBackend;
    use natus_backend::EngineHandle;

    fn test_ctx() -> Context {
        Context::new(EngineHandle::from_builtin("mock", MockBackend::new())).unwrap()
    }

    fn install_memory_hook(state: &RequireState, name: &'static str, make_exports: impl Fn(&Value) + 'static) {
        let resolve: ResolveHook = Rc::new(move |_state, requested, _current| {
            if requested == name {
                Some(requested.to_string())
            } else {
                None
            }
        });
        let load: LoadHook = Rc::new(|_state, _resolved| Ok(Some(String::new())));
        let process: ProcessHook = Rc::new(move |_ctx, exports, _resolved, _source| {
            make_exports(exports);
            Ok(())
        });
        state.add_hook(ModuleHook {
            id: name.to_string(),
            resolve,
            load,
            process,
        });
    }

    #[test]
    fn require_caches_exports_across_calls() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig::default());
        install_memory_hook(&state, "widgets", |exports| {
            let inner_ctx = exports.ctx().clone();
            let _ = exports.set("count", &inner_ctx.number(1.0));
        });

        let first = state.require(&ctx, "widgets").unwrap();
        first.set("count", &ctx.number(99.0)).unwrap();
        let second = state.require(&ctx, "widgets").unwrap();
        assert_eq!(second.get("count").unwrap().to_number(), 99.0);
    }

    #[test]
    fn require_rejects_names_outside_origin_whitelist() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig::default());
        install_memory_hook(&state, "widgets", |_exports| {});
        state.add_origin_matcher("only-fs", Rc::new(|name: &str| name.starts_with("fs:")));

        let err = state.require(&ctx, "widgets").unwrap_err();
        assert!(matches!(err, NatusError::Security { .. }));
    }

    #[test]
    fn require_rejects_names_outside_config_whitelist() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig {
            whitelist: Some(vec!["widgets".to_string()]),
            ..Default::default()
        });
        install_memory_hook(&state, "widgets", |_exports| {});
        install_memory_hook(&state, "gadgets", |_exports| {});

        assert!(state.require(&ctx, "widgets").is_ok());
        let err = state.require(&ctx, "gadgets").unwrap_err();
        assert!(matches!(err, NatusError::Security { .. }));
    }

    #[test]
    fn origin_blacklist_overrides_a_matching_whitelist_entry() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig::default());
        install_memory_hook(&state, "widgets", |_exports| {});
        state.add_origin_matcher("allow-all", Rc::new(|_name: &str| true));
        state.add_origin_blacklist_matcher("deny-widgets", Rc::new(|name: &str| name == "widgets"));

        let err = state.require(&ctx, "widgets").unwrap_err();
        assert!(matches!(err, NatusError::Security { .. }));
    }

    #[test]
    fn absent_origin_whitelist_ignores_blacklist_entirely() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig::default());
        install_memory_hook(&state, "widgets", |_exports| {});
        // No whitelist matcher registered at all: origin_permitted must be
        // unconditionally true, even though a blacklist entry matches.
        state.add_origin_blacklist_matcher("deny-widgets", Rc::new(|name: &str| name == "widgets"));

        assert!(state.require(&ctx, "widgets").is_ok());
    }

    #[test]
    fn unresolved_module_is_an_import_error() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig::default());
        let err = state.require(&ctx, "nonexistent").unwrap_err();
        assert!(matches!(err, NatusError::Import { .. }));
    }

    #[test]
    fn module_object_carries_id_and_uri_outside_sandbox() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig::default());
        install_memory_hook(&state, "widgets", |_exports| {});

        let module = state.require_module(&ctx, "widgets").unwrap();
        assert_eq!(module.get("id").unwrap().to_rust_string().unwrap(), "widgets");
        assert_eq!(module.get("uri").unwrap().to_rust_string().unwrap(), "file://widgets");
    }

    #[test]
    fn module_uri_is_suppressed_in_sandbox_mode() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig {
            whitelist: Some(vec!["widgets".to_string()]),
            ..Default::default()
        });
        install_memory_hook(&state, "widgets", |_exports| {});

        let module = state.require_module(&ctx, "widgets").unwrap();
        assert!(module.get("uri").unwrap().is_undefined());
    }

    #[test]
    fn require_function_exposes_paths_unless_sandboxed() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig {
            search_paths: vec![std::path::PathBuf::from("/mods")],
            ..Default::default()
        });
        let func = require_function(&ctx, &ctx, &state).unwrap();
        assert!(func.get("paths").unwrap().is_array());
    }

    #[test]
    fn require_function_hides_paths_when_sandboxed() {
        let ctx = test_ctx();
        let state = RequireState::new(RequireConfig {
            search_paths: vec![std::path::PathBuf::from("/mods")],
            whitelist: Some(vec!["ok".to_string()]),
            ..Default::default()
        });
        let func = require_function(&ctx, &ctx, &state).unwrap();
        assert!(func.get("paths").unwrap().is_undefined());
    }
}
