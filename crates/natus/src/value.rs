//! The value façade: a reference-counted handle to one backend value, plus
//! the fast-path dispatch that lets a native class intercept property and
//! call operations before they ever reach the backend.
//!
//! `Value` is deliberately `!Send`/`!Sync` (it holds a [`Context`], which
//! holds an `Rc`): every engine backend is documented as single-threaded
//! per context, and requiring `Send` here would be a promise natus cannot
//! keep.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use either::Either;
use natus_backend::{Flags, Outcome, PropertyAttrs, PropertyId, RawHandle, TypeTag};

use crate::class::{self, Class, CallHook, CLASS_SLOT};
use crate::context::Context;
use crate::error::NatusResult;
use crate::private;

pub struct Value {
    ctx: Context,
    raw: RawHandle,
    flags: Cell<Flags>,
    cached_type: Cell<Option<TypeTag>>,
}

impl Value {
    pub(crate) fn from_raw(ctx: Context, raw: RawHandle, flags: Flags) -> Value {
        Value {
            ctx,
            raw,
            flags: Cell::new(flags),
            cached_type: Cell::new(None),
        }
    }

    pub(crate) fn from_outcome(ctx: Context, outcome: Outcome) -> NatusResult<Value> {
        match outcome {
            Either::Left((raw, flags)) | Either::Right((raw, flags)) => Ok(Value::from_raw(ctx, raw, flags)),
        }
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    // -- Type introspection --------------------------------------------------

    pub fn get_type(&self) -> TypeTag {
        if let Some(t) = self.cached_type.get() {
            return t;
        }
        let t = self.ctx.backend().get_type(self.ctx.ctx_id(), self.raw);
        self.cached_type.set(Some(t));
        t
    }

    pub fn type_name(&self) -> &'static str {
        match self.get_type() {
            TypeTag::Array => "array",
            TypeTag::Boolean => "boolean",
            TypeTag::Function => "function",
            TypeTag::Null => "null",
            TypeTag::Number => "number",
            TypeTag::Object => "object",
            TypeTag::String => "string",
            TypeTag::Undefined => "undefined",
            TypeTag::Unknown => "unknown",
        }
    }

    pub fn is_undefined(&self) -> bool {
        self.get_type() == TypeTag::Undefined
    }

    pub fn is_null(&self) -> bool {
        self.get_type() == TypeTag::Null
    }

    pub fn is_function(&self) -> bool {
        self.get_type() == TypeTag::Function
    }

    pub fn is_object(&self) -> bool {
        matches!(self.get_type(), TypeTag::Object | TypeTag::Array | TypeTag::Function)
    }

    pub fn is_array(&self) -> bool {
        self.get_type() == TypeTag::Array
    }

    /// Whether this value is carrying an active exception, set by a
    /// backend-raised throw or by [`Value::to_exception`].
    pub fn is_exception(&self) -> bool {
        self.flags.get().exception
    }

    /// Flags a value as an active exception, the way a native hook signals
    /// "throw this" without unwinding the Rust call stack.
    pub fn to_exception(mut self) -> Value {
        let mut flags = self.flags.get();
        flags.exception = true;
        self.flags = Cell::new(flags);
        self
    }

    // -- Coercion -------------------------------------------------------------

    pub fn to_bool(&self) -> bool {
        self.ctx.backend().to_bool(self.ctx.ctx_id(), self.raw)
    }

    pub fn to_number(&self) -> f64 {
        self.ctx.backend().to_double(self.ctx.ctx_id(), self.raw)
    }

    fn backend_to_string(&self) -> String {
        self.ctx.backend().to_string_utf8(self.ctx.ctx_id(), self.raw)
    }

    /// Stringifies this value, preferring a user-defined `toString` method
    /// on objects the way JS's own `ToString` abstract operation does,
    /// falling back to the backend's native stringification otherwise.
    pub fn to_rust_string(&self) -> NatusResult<String> {
        if self.is_object() {
            let to_string = self.get("toString")?;
            if to_string.is_function() && !to_string.is_exception() {
                let result = to_string.call(self, &[])?;
                if !result.is_exception() {
                    return Ok(result.backend_to_string());
                }
            }
        }
        Ok(self.backend_to_string())
    }

    // -- Properties -------------------------------------------------------------

    fn class_hook(&self) -> Option<Rc<Class>> {
        let priv_ptr = self.ctx.backend().get_private(self.ctx.ctx_id(), self.raw)?;
        // SAFETY: every private pointer the backend hands back came from
        // `private::into_raw` and is kept alive for as long as the object
        // that owns it, which this `&self` borrow is itself proof of.
        let cell = unsafe { private::raw_as_ref(priv_ptr) };
        let map = cell.borrow();
        map.get_named::<Rc<Class>>(Some(CLASS_SLOT)).cloned()
    }

    pub fn get(&self, key: impl Into<PropertyId>) -> NatusResult<Value> {
        let id = key.into();
        if let Some(class) = self.class_hook() {
            if let Some(hook) = class.get.clone() {
                let result = class::invoke_get(&self.ctx, &hook, self, &id);
                if !(result.is_undefined() && !result.is_exception()) {
                    return Ok(result);
                }
            }
        }
        let outcome = self.ctx.backend().get(self.ctx.ctx_id(), self.raw, &id)?;
        Value::from_outcome(self.ctx.clone(), outcome)
    }

    pub fn set(&self, key: impl Into<PropertyId>, value: &Value) -> NatusResult<Value> {
        let id = key.into();
        if let Some(class) = self.class_hook() {
            if let Some(hook) = class.set.clone() {
                let result = class::invoke_set(&self.ctx, &hook, self, &id, value);
                if !(result.is_undefined() && !result.is_exception()) {
                    return Ok(result);
                }
            }
        }
        let outcome = self
            .ctx
            .backend()
            .set(self.ctx.ctx_id(), self.raw, &id, value.raw, PropertyAttrs::default())?;
        Value::from_outcome(self.ctx.clone(), outcome)
    }

    pub fn delete(&self, key: impl Into<PropertyId>) -> NatusResult<bool> {
        let id = key.into();
        if let Some(class) = self.class_hook() {
            if let Some(hook) = class.del.clone() {
                if let Some(handled) = class::invoke_del(&self.ctx, &hook, self, &id) {
                    return Ok(handled);
                }
            }
        }
        Ok(self.ctx.backend().del(self.ctx.ctx_id(), self.raw, &id)?)
    }

    pub fn enumerate(&self) -> NatusResult<Vec<String>> {
        if let Some(class) = self.class_hook() {
            if let Some(hook) = class.enumerate.clone() {
                if let Some(names) = class::invoke_enumerate(&self.ctx, &hook, self) {
                    return Ok(names);
                }
            }
        }
        let raw = self.ctx.backend().enumerate(self.ctx.ctx_id(), self.raw)?;
        Value::from_raw(self.ctx.clone(), raw, Flags::NONE).to_string_vec()
    }

    fn to_string_vec(&self) -> NatusResult<Vec<String>> {
        let len = self.get("length")?.to_number() as usize;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(self.get(i as u32)?.backend_to_string());
        }
        Ok(out)
    }

    /// Walks a dotted path (`"a.b.c"`), returning undefined at the first
    /// missing segment rather than erroring — the same short-circuit a
    /// chained `?.` access gives in script.
    pub fn get_path(&self, path: &str) -> NatusResult<Value> {
        let mut current = self.get(path.split('.').next().unwrap_or(path))?;
        for segment in path.split('.').skip(1) {
            if current.is_undefined() || current.is_null() {
                return Ok(current);
            }
            current = current.get(segment)?;
        }
        Ok(current)
    }

    /// Walks a dotted path, creating intermediate plain objects as needed,
    /// then sets the final segment.
    pub fn set_path(&self, path: &str, value: &Value) -> NatusResult<()> {
        let mut segments = path.split('.').peekable();
        let mut current = self.clone_handle();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                current.set(segment, value)?;
                return Ok(());
            }
            let next = current.get(segment)?;
            current = if next.is_undefined() || next.is_null() {
                let fresh = self.ctx.object();
                current.set(segment, &fresh)?;
                fresh
            } else {
                next
            };
        }
        Ok(())
    }

    fn clone_handle(&self) -> Value {
        self.clone()
    }

    // -- Execution -------------------------------------------------------------

    pub fn call(&self, this: &Value, args: &[Value]) -> NatusResult<Value> {
        if let Some(class) = self.class_hook() {
            if let Some(hook) = class.call.clone() {
                return Ok(class::invoke_call(&self.ctx, &hook, this, args));
            }
        }
        let raws: Vec<RawHandle> = args.iter().map(Value::raw).collect();
        let outcome = self.ctx.backend().call(self.ctx.ctx_id(), self.raw, this.raw, &raws)?;
        Value::from_outcome(self.ctx.clone(), outcome)
    }

    /// `new this(...)`: calls with a fresh plain object as `this`, returning
    /// that object unless the constructor itself returned an object.
    pub fn construct(&self, args: &[Value]) -> NatusResult<Value> {
        let this = self.ctx.object();
        let result = self.call(&this, args)?;
        if result.is_object() && !result.is_exception() {
            Ok(result)
        } else {
            Ok(this)
        }
    }

    // -- Arrays -------------------------------------------------------------

    pub fn push(&self, value: &Value) -> NatusResult<()> {
        let len = self.get("length")?.to_number() as u32;
        self.set(len, value)?;
        Ok(())
    }

    pub fn pop(&self) -> NatusResult<Value> {
        let pop_fn = self.get("pop")?;
        pop_fn.call(self, &[])
    }

    // -- Private data -------------------------------------------------------------

    pub fn set_private<T: Any + 'static>(&self, value: T) -> NatusResult<()> {
        self.set_private_named::<T>(None, value)
    }

    pub fn set_private_named<T: Any + 'static>(&self, name: Option<&str>, value: T) -> NatusResult<()> {
        let ptr = self
            .ctx
            .backend()
            .get_private(self.ctx.ctx_id(), self.raw)
            .ok_or_else(|| crate::error::NatusError::type_error("value has no private data slot"))?;
        let cell = unsafe { private::raw_as_ref(ptr) };
        cell.borrow_mut().set_named(name, value);
        Ok(())
    }

    pub fn with_private<T: Any + 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.with_private_named(None, f)
    }

    pub fn with_private_named<T: Any + 'static, R>(&self, name: Option<&str>, f: impl FnOnce(&T) -> R) -> Option<R> {
        let ptr = self.ctx.backend().get_private(self.ctx.ctx_id(), self.raw)?;
        let cell = unsafe { private::raw_as_ref(ptr) };
        let map = cell.borrow();
        map.get_named::<T>(name).map(f)
    }

    /// Whether a private slot named `name` has been attached, regardless of
    /// its type — used by `args::convert_arguments`'s `%[privname]`
    /// directive to validate presence before the caller does a typed fetch.
    pub fn has_private_named(&self, name: Option<&str>) -> bool {
        let Some(ptr) = self.ctx.backend().get_private(self.ctx.ctx_id(), self.raw) else {
            return false;
        };
        let cell = unsafe { private::raw_as_ref(ptr) };
        cell.borrow().contains_named(name)
    }

    // -- Identity -------------------------------------------------------------

    pub fn equal(&self, other: &Value, strict: bool) -> bool {
        self.ctx.backend().equal(self.ctx.ctx_id(), self.raw, other.raw, strict)
    }

    pub fn global_object(&self) -> Value {
        let raw = self.ctx.backend().get_global(self.ctx.ctx_id(), self.raw);
        Value::from_raw(self.ctx.clone(), raw, Flags::NONE)
    }
}

impl Clone for Value {
    fn clone(&self) -> Value {
        let raw = self.ctx.backend().val_duplicate(self.ctx.ctx_id(), self.raw);
        Value {
            ctx: self.ctx.clone(),
            raw,
            flags: Cell::new(self.flags.get()),
            cached_type: Cell::new(self.cached_type.get()),
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        let flags = self.flags.get();
        let backend = self.ctx.backend();
        let ctx_id = self.ctx.ctx_id();
        if flags.unlock_on_drop {
            backend.val_unlock(ctx_id, self.raw);
        }
        if flags.free_on_drop {
            backend.val_free(ctx_id, self.raw);
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value").field("type", &self.type_name()).field("raw", &self.raw).finish()
    }
}

pub(crate) fn new_object_with_class(ctx: &Context, class: Class) -> Value {
    let mut map = crate::private::PrivateMap::new();
    map.set_named(Some(CLASS_SLOT), Rc::new(class));
    let raw_priv = private::into_raw(map);
    let raw = ctx.backend().new_object(ctx.ctx_id(), raw_priv);
    Value::from_raw(ctx.clone(), raw, Flags::NONE)
}

pub(crate) fn new_function_with_hook(ctx: &Context, name: &str, hook: CallHook) -> Value {
    let class = Class {
        name: name.to_string(),
        call: Some(hook),
        ..Class::default()
    };
    let mut map = crate::private::PrivateMap::new();
    map.set_named(Some(CLASS_SLOT), Rc::new(class));
    let raw_priv = private::into_raw(map);
    let raw = ctx.backend().new_function(ctx.ctx_id(), name, raw_priv);
    Value::from_raw(ctx.clone(), raw, Flags::NONE)
}
