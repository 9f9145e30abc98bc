//! Native classes: Rust closures that intercept property and call
//! operations on an object before they reach the backend, the façade's
//! equivalent of a C extension registering get/set/call/delete/enumerate
//! trampolines on a `JSClass`.
//!
//! Hooks are stored as `Rc<dyn Fn(...)>` rather than `Box<dyn Fn(...)>` for
//! one reason: a hook body can itself touch the same object's private data
//! (a getter that lazily computes and caches a value, say), which means the
//! call site must be able to clone the hook out of the `RefCell<PrivateMap>`
//! borrow and drop that borrow *before* invoking it — otherwise a
//! reentrant access panics on an already-borrowed `RefCell`. `Rc::clone` is
//! cheap; `Box` cannot be cloned at all.
//!
//! Every hook returns a plain [`Value`], never `Option<Value>`: "not
//! intercepted, fall through to the backend" is spelled the same way a
//! native property handler spells it at the wire level — an undefined,
//! non-exceptional result — rather than inventing a more idiomatic-looking
//! `Option` that the backend protocol itself has no equivalent for.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use natus_backend::PropertyId;

use crate::context::Context;
use crate::error::NatusError;
use crate::value::Value;

/// The reserved private-map key a class's hook set is stored under. Kept
/// out of the way of [`crate::value::Value::set_private`]'s user-facing
/// unnamed and named slots.
pub(crate) const CLASS_SLOT: &str = "__natus_class__";

pub type DelHook = Rc<dyn Fn(&Context, &Value, &PropertyId) -> bool>;
pub type GetHook = Rc<dyn Fn(&Context, &Value, &PropertyId) -> Value>;
pub type SetHook = Rc<dyn Fn(&Context, &Value, &PropertyId, &Value) -> Value>;
pub type EnumerateHook = Rc<dyn Fn(&Context, &Value) -> Vec<String>>;
pub type CallHook = Rc<dyn Fn(&Context, &Value, &[Value]) -> Value>;

/// A set of hooks attached to an object's private data. Any field left
/// `None` falls straight through to the backend's own semantics.
#[derive(Clone, Default)]
pub struct Class {
    pub name: String,
    pub del: Option<DelHook>,
    pub get: Option<GetHook>,
    pub set: Option<SetHook>,
    pub enumerate: Option<EnumerateHook>,
    pub call: Option<CallHook>,
}

impl Class {
    pub fn named(name: impl Into<String>) -> Class {
        Class {
            name: name.into(),
            ..Class::default()
        }
    }

    pub fn with_call(mut self, hook: CallHook) -> Class {
        self.call = Some(hook);
        self
    }

    pub fn with_get(mut self, hook: GetHook) -> Class {
        self.get = Some(hook);
        self
    }

    pub fn with_set(mut self, hook: SetHook) -> Class {
        self.set = Some(hook);
        self
    }

    pub fn with_del(mut self, hook: DelHook) -> Class {
        self.del = Some(hook);
        self
    }

    pub fn with_enumerate(mut self, hook: EnumerateHook) -> Class {
        self.enumerate = Some(hook);
        self
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "native hook panicked".to_string()
    }
}

/// Runs a call hook, catching panics the same way every native callback
/// boundary does: a Rust panic inside user code must never unwind across
/// the FFI boundary into the backend, so it is converted into a JS
/// exception instead.
pub fn invoke_call(ctx: &Context, hook: &CallHook, this: &Value, args: &[Value]) -> Value {
    match panic::catch_unwind(AssertUnwindSafe(|| hook(ctx, this, args))) {
        Ok(v) => v,
        Err(payload) => exception_from_error(ctx, &NatusError::logic(panic_message(payload))),
    }
}

pub fn invoke_get(ctx: &Context, hook: &GetHook, this: &Value, id: &PropertyId) -> Value {
    match panic::catch_unwind(AssertUnwindSafe(|| hook(ctx, this, id))) {
        Ok(v) => v,
        Err(payload) => exception_from_error(ctx, &NatusError::logic(panic_message(payload))),
    }
}

pub fn invoke_set(ctx: &Context, hook: &SetHook, this: &Value, id: &PropertyId, value: &Value) -> Value {
    match panic::catch_unwind(AssertUnwindSafe(|| hook(ctx, this, id, value))) {
        Ok(v) => v,
        Err(payload) => exception_from_error(ctx, &NatusError::logic(panic_message(payload))),
    }
}

pub fn invoke_del(ctx: &Context, hook: &DelHook, this: &Value, id: &PropertyId) -> Option<bool> {
    match panic::catch_unwind(AssertUnwindSafe(|| hook(ctx, this, id))) {
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

pub fn invoke_enumerate(ctx: &Context, hook: &EnumerateHook, this: &Value) -> Option<Vec<String>> {
    match panic::catch_unwind(AssertUnwindSafe(|| hook(ctx, this))) {
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

/// Builds a JS-side exception value from a [`NatusError`]: a plain object
/// carrying `name` (the taxonomy name) and `message`, flagged as an active
/// exception. Scripts see exactly what they would from a backend-raised
/// `throw new TypeError(...)`.
pub fn exception_from_error(ctx: &Context, err: &NatusError) -> Value {
    let obj = ctx.object();
    let name = ctx.string(err.type_name());
    let message = ctx.string(&err.to_string());
    let _ = obj.set("name", &name);
    let _ = obj.set("message", &message);
    obj.to_exception()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use natus_backend::mock::MockBackend;
    use natus_backend::EngineHandle;

    fn test_ctx() -> Context {
        Context::new(EngineHandle::from_builtin("mock", MockBackend::new())).unwrap()
    }

    #[test]
    fn call_hook_panic_becomes_exception() {
        let ctx = test_ctx();
        let hook: CallHook = Rc::new(|_ctx, _this, _args| panic!("boom"));
        let this = ctx.undefined();
        let result = invoke_call(&ctx, &hook, &this, &[]);
        assert!(result.is_exception());
    }

    #[test]
    fn call_hook_returns_value_normally() {
        let ctx = test_ctx();
        let hook: CallHook = Rc::new(|ctx, _this, _args| ctx.number(42.0));
        let this = ctx.undefined();
        let result = invoke_call(&ctx, &hook, &this, &[]);
        assert!(!result.is_exception());
        assert_eq!(result.to_number(), 42.0);
    }
}
