//! The execution context: one global object, one backend context id, and
//! the per-context state (the object graph, the require subsystem) hung
//! off it.
//!
//! `Context` is `Rc<ContextInner>` rather than a bare struct so that every
//! `Value` can hold a cheap clone of it without natus having to thread a
//! `&Context` through every call in the public API. A scoped handle
//! borrowing a lifetime would avoid the refcounting, but natus values can
//! genuinely outlive the call that produced them, so ownership wins here.

use std::cell::RefCell;
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;

use natus_backend::{Backend, CtxId, Flags, RawPriv};

use crate::class::{CallHook, Class};
use crate::error::NatusResult;
use crate::mem::Graph;
use crate::private::{self, PrivateMap};
use crate::require::{RequireConfig, RequireState};
use crate::value::{self, Value};

struct ContextInner {
    engine: natus_backend::EngineHandle,
    ctx_id: CtxId,
    global: RefCell<Option<Value>>,
    require: RefCell<Option<Rc<RequireState>>>,
    graph: Graph,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // Drop the global (and, through it, everything still rooted by
        // natus) while the context id is still valid, then free the
        // context itself. Order matters: `Value::drop` calls back into
        // this same context id.
        self.global.borrow_mut().take();
        self.require.borrow_mut().take();
        self.engine.backend().ctx_free(self.ctx_id);
    }
}

/// The JavaScript execution context façade. Cheaply `Clone`-able; every
/// clone refers to the same underlying backend context.
#[derive(Clone)]
pub struct Context(Rc<ContextInner>);

fn install_finalizer(backend: &Arc<dyn Backend>) {
    backend.set_finalizer(Box::new(|raw_priv: RawPriv| {
        // SAFETY: every pointer the backend hands to a finalizer came from
        // `private::into_raw` in `Context::new`/`Value`'s object/function
        // constructors, and the backend promises to call this at most once
        // per pointer, exactly when it is done with the object.
        unsafe {
            drop(private::raw_into_box(raw_priv));
        }
    }));
}

impl Context {
    /// Creates a fresh top-level context (and global object) on `engine`.
    pub fn new(engine: natus_backend::EngineHandle) -> NatusResult<Context> {
        install_finalizer(engine.backend());
        let (ctx_id, global_raw, flags) = engine.backend().new_global(None, ptr::null_mut())?;

        let inner = Rc::new(ContextInner {
            engine,
            ctx_id,
            global: RefCell::new(None),
            require: RefCell::new(None),
            graph: Graph::new(),
        });
        let ctx = Context(inner);
        let global_value = Value::from_raw(ctx.clone(), global_raw, flags);
        *ctx.0.global.borrow_mut() = Some(global_value);
        Ok(ctx)
    }

    /// Creates a child context sharing `self`'s engine, the way the require
    /// subsystem builds a fresh scope for each loaded module.
    pub fn new_child(&self) -> NatusResult<Context> {
        let parent_global = self.global();
        let (ctx_id, global_raw, flags) =
            self.backend()
                .new_global(Some((self.ctx_id(), parent_global.raw())), ptr::null_mut())?;
        let inner = Rc::new(ContextInner {
            engine: self.0.engine.clone(),
            ctx_id,
            global: RefCell::new(None),
            require: RefCell::new(None),
            graph: Graph::new(),
        });
        let child = Context(inner);
        let global_value = Value::from_raw(child.clone(), global_raw, flags);
        *child.0.global.borrow_mut() = Some(global_value);
        Ok(child)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        self.0.engine.backend()
    }

    pub fn engine(&self) -> &natus_backend::EngineHandle {
        &self.0.engine
    }

    pub fn ctx_id(&self) -> CtxId {
        self.0.ctx_id
    }

    pub fn global(&self) -> Value {
        self.0
            .global
            .borrow()
            .clone()
            .expect("Context::global accessed before construction completed")
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.0.graph
    }

    /// Returns the installed `require` state, if any, so a host can
    /// register additional loader hooks or origin matchers on it directly.
    ///
    /// Clones the handle out of its `RefCell` and returns it immediately,
    /// rather than handing back a borrow guard — a nested `require()` call
    /// from inside a loading module must not find this cell still borrowed
    /// from the outer call.
    pub fn require_state(&self) -> Option<Rc<RequireState>> {
        self.0.require.borrow().clone()
    }

    // -- Value construction -------------------------------------------------------

    pub fn undefined(&self) -> Value {
        let raw = self.backend().new_undefined(self.ctx_id());
        Value::from_raw(self.clone(), raw, Flags::NONE)
    }

    pub fn null(&self) -> Value {
        let raw = self.backend().new_null(self.ctx_id());
        Value::from_raw(self.clone(), raw, Flags::NONE)
    }

    pub fn boolean(&self, b: bool) -> Value {
        let raw = self.backend().new_bool(self.ctx_id(), b);
        Value::from_raw(self.clone(), raw, Flags::NONE)
    }

    pub fn number(&self, n: f64) -> Value {
        let raw = self.backend().new_number(self.ctx_id(), n);
        Value::from_raw(self.clone(), raw, Flags::NONE)
    }

    pub fn string(&self, s: &str) -> Value {
        let raw = self.backend().new_string_utf8(self.ctx_id(), s);
        Value::from_raw(self.clone(), raw, Flags::NONE)
    }

    pub fn string_utf16(&self, s: &[u16]) -> Value {
        let raw = self.backend().new_string_utf16(self.ctx_id(), s);
        Value::from_raw(self.clone(), raw, Flags::NONE)
    }

    pub fn array(&self, items: &[Value]) -> Value {
        let raws: Vec<_> = items.iter().map(Value::raw).collect();
        let raw = self.backend().new_array(self.ctx_id(), &raws);
        Value::from_raw(self.clone(), raw, Flags::NONE)
    }

    /// A plain object with an (empty) private map always attached — every
    /// object gets one at creation time since the backend protocol has no
    /// "attach private data later" operation.
    pub fn object(&self) -> Value {
        let raw_priv = private::into_raw(PrivateMap::new());
        let raw = self.backend().new_object(self.ctx_id(), raw_priv);
        Value::from_raw(self.clone(), raw, Flags::NONE)
    }

    /// A plain object whose get/set/delete/enumerate are intercepted by
    /// `class`'s hooks before falling through to ordinary property storage.
    pub fn object_with_class(&self, class: Class) -> Value {
        value::new_object_with_class(self, class)
    }

    /// A native function: calling it invokes `hook` directly, never
    /// reaching the backend's own (nonexistent, for most backends) notion
    /// of a callable.
    pub fn function(&self, name: &str, hook: CallHook) -> Value {
        value::new_function_with_hook(self, name, hook)
    }

    pub fn evaluate(&self, this: &Value, source: &str, filename: &str, line: u32) -> NatusResult<Value> {
        let outcome = self.backend().evaluate(self.ctx_id(), this.raw(), source, filename, line)?;
        Value::from_outcome(self.clone(), outcome)
    }

    // -- require --------------------------------------------------------------

    /// Installs the `require` subsystem, including the default native
    /// loader hook, on this context. Calling this more than once replaces
    /// the prior state (and its cache).
    pub fn init_require(&self, config: RequireConfig) {
        let search_paths = config.search_paths.clone();
        let state = RequireState::new(config);
        crate::require::native_loader::install(&state, search_paths);
        *self.0.require.borrow_mut() = Some(Rc::new(state));
    }

    /// Requires `name` through this context's require state.
    ///
    /// # Errors
    /// Returns a [`crate::error::NatusError::Logic`] if [`Context::init_require`]
    /// was never called.
    pub fn require(&self, name: &str) -> NatusResult<Value> {
        let state = self
            .require_state()
            .ok_or_else(|| crate::error::NatusError::logic("require() used before Context::init_require"))?;
        state.require(self, name)
    }
}
