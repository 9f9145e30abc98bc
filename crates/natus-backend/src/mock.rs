//! A reference [`Backend`] implementation used by `natus`'s own test suite
//! and as a worked example for plugin authors.
//!
//! This is deliberately **not** a JavaScript engine: it does not parse or
//! evaluate JavaScript source text (`evaluate` only accepts the empty
//! string). It implements plain object/array/property semantics and two
//! native built-ins — `Array.prototype.pop` and a `JSON.parse`/
//! `JSON.stringify` pair backed by `serde_json` — because real engines
//! implement exactly those as native code too, not as authored script. Every
//! other piece of behavior natus's own tests exercise (native function
//! calls, class property interception, `require`) is intercepted by the
//! façade before it would ever reach a backend at all, so a backend this
//! simple is sufficient to validate the whole façade contract.

use std::{cell::RefCell, collections::HashMap, sync::Arc};

use crate::backend::{
    exception_outcome, ok_outcome, Backend, BackendResult, CtxId, Flags, Outcome, PropertyAttrs,
    PropertyId, RawHandle, RawPriv, TypeTag,
};
use crate::error::BackendError;

#[derive(Clone)]
enum Builtin {
    ArrayPop(RawHandle),
    JsonParse,
    JsonStringify,
}

enum Slot {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<RawHandle>),
    Object {
        props: Vec<(String, RawHandle)>,
        priv_: Option<RawPriv>,
    },
    Function {
        #[allow(dead_code)]
        name: String,
        builtin: Option<Builtin>,
        priv_: Option<RawPriv>,
    },
}

struct MockContext {
    slab: Vec<Slot>,
    global: RawHandle,
    undefined: RawHandle,
    null: RawHandle,
}

impl MockContext {
    fn alloc(&mut self, slot: Slot) -> RawHandle {
        self.slab.push(slot);
        RawHandle(self.slab.len() - 1)
    }

    fn slot(&self, raw: RawHandle) -> &Slot {
        &self.slab[raw.0]
    }

    fn slot_mut(&mut self, raw: RawHandle) -> &mut Slot {
        &mut self.slab[raw.0]
    }

    fn object_get(&mut self, obj: RawHandle, id: &PropertyId) -> RawHandle {
        match id {
            PropertyId::Index(i) => self.array_or_object_index_get(obj, *i),
            PropertyId::Name(name) if name == "length" => {
                if let Slot::Array(items) = self.slot(obj) {
                    let len = items.len() as f64;
                    return self.alloc(Slot::Number(len));
                }
                self.undefined
            }
            PropertyId::Name(name) if name == "pop" => {
                if matches!(self.slot(obj), Slot::Array(_)) {
                    return self.alloc(Slot::Function {
                        name: "pop".into(),
                        builtin: Some(Builtin::ArrayPop(obj)),
                        priv_: None,
                    });
                }
                self.undefined
            }
            PropertyId::Name(name) => {
                if let Slot::Object { props, .. } = self.slot(obj) {
                    return props
                        .iter()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| *v)
                        .unwrap_or(self.undefined);
                }
                self.undefined
            }
        }
    }

    fn array_or_object_index_get(&mut self, obj: RawHandle, index: u32) -> RawHandle {
        match self.slot(obj) {
            Slot::Array(items) => items.get(index as usize).copied().unwrap_or(self.undefined),
            Slot::Object { .. } => self.object_get(obj, &PropertyId::Name(index.to_string())),
            _ => self.undefined,
        }
    }

    fn object_set(&mut self, obj: RawHandle, id: &PropertyId, value: RawHandle) {
        match id {
            PropertyId::Index(i) => {
                let i = *i as usize;
                let undef = self.undefined;
                if let Slot::Array(items) = self.slot_mut(obj) {
                    if i >= items.len() {
                        items.resize(i + 1, undef);
                    }
                    items[i] = value;
                } else {
                    let key = i.to_string();
                    self.object_set_named(obj, key, value);
                }
            }
            PropertyId::Name(name) => self.object_set_named(obj, name.clone(), value),
        }
    }

    fn object_set_named(&mut self, obj: RawHandle, name: String, value: RawHandle) {
        if let Slot::Object { props, .. } = self.slot_mut(obj) {
            if let Some(slot) = props.iter_mut().find(|(k, _)| *k == name) {
                slot.1 = value;
            } else {
                props.push((name, value));
            }
        }
    }

    fn object_del(&mut self, obj: RawHandle, id: &PropertyId) -> bool {
        let name = match id {
            PropertyId::Name(n) => n.clone(),
            PropertyId::Index(i) => i.to_string(),
        };
        if let Slot::Object { props, .. } = self.slot_mut(obj) {
            let before = props.len();
            props.retain(|(k, _)| *k != name);
            return props.len() != before;
        }
        false
    }

    fn to_json(&self, raw: RawHandle) -> serde_json::Value {
        use serde_json::Value as J;
        match self.slot(raw) {
            Slot::Undefined => J::Null,
            Slot::Null => J::Null,
            Slot::Bool(b) => J::Bool(*b),
            Slot::Number(n) => serde_json::Number::from_f64(*n).map(J::Number).unwrap_or(J::Null),
            Slot::String(s) => J::String(s.clone()),
            Slot::Array(items) => J::Array(items.iter().map(|r| self.to_json(*r)).collect()),
            Slot::Object { props, .. } => {
                let mut map = serde_json::Map::new();
                for (k, v) in props {
                    map.insert(k.clone(), self.to_json(*v));
                }
                J::Object(map)
            }
            Slot::Function { .. } => J::Null,
        }
    }

    fn from_json(&mut self, value: &serde_json::Value) -> RawHandle {
        use serde_json::Value as J;
        match value {
            J::Null => self.null,
            J::Bool(b) => self.alloc(Slot::Bool(*b)),
            J::Number(n) => self.alloc(Slot::Number(n.as_f64().unwrap_or(f64::NAN))),
            J::String(s) => self.alloc(Slot::String(s.clone())),
            J::Array(items) => {
                let raws: Vec<RawHandle> = items.iter().map(|v| self.from_json(v)).collect();
                self.alloc(Slot::Array(raws))
            }
            J::Object(map) => {
                let mut props = Vec::with_capacity(map.len());
                for (k, v) in map {
                    let raw = self.from_json(v);
                    props.push((k.clone(), raw));
                }
                self.alloc(Slot::Object { props, priv_: None })
            }
        }
    }
}

type Finalizer = Box<dyn Fn(RawPriv)>;

/// The bundled reference backend. See module docs for what it does and does
/// not implement.
pub struct MockBackend {
    contexts: RefCell<HashMap<u64, MockContext>>,
    next_ctx: RefCell<u64>,
    finalizer: RefCell<Option<Finalizer>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        MockBackend {
            contexts: RefCell::new(HashMap::new()),
            next_ctx: RefCell::new(1),
            finalizer: RefCell::new(None),
        }
    }
}

impl MockBackend {
    pub fn new() -> Arc<MockBackend> {
        Arc::new(MockBackend {
            contexts: RefCell::new(HashMap::new()),
            next_ctx: RefCell::new(1),
            finalizer: RefCell::new(None),
        })
    }

    fn with_ctx<T>(&self, ctx: CtxId, f: impl FnOnce(&mut MockContext) -> T) -> T {
        let mut contexts = self.contexts.borrow_mut();
        let cx = contexts
            .get_mut(&ctx.0)
            .expect("backend operation on a freed or unknown context");
        f(cx)
    }

    fn install_json_global(cx: &mut MockContext) {
        let parse = cx.alloc(Slot::Function {
            name: "parse".into(),
            builtin: Some(Builtin::JsonParse),
            priv_: None,
        });
        let stringify = cx.alloc(Slot::Function {
            name: "stringify".into(),
            builtin: Some(Builtin::JsonStringify),
            priv_: None,
        });
        let json_props = vec![("parse".to_string(), parse), ("stringify".to_string(), stringify)];
        let json_obj = cx.alloc(Slot::Object {
            props: json_props,
            priv_: None,
        });
        cx.object_set_named(cx.global, "JSON".to_string(), json_obj);
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn set_finalizer(&self, f: Box<dyn Fn(RawPriv)>) {
        *self.finalizer.borrow_mut() = Some(f);
    }

    fn ctx_free(&self, ctx: CtxId) {
        let removed = self.contexts.borrow_mut().remove(&ctx.0);
        if let Some(cx) = removed {
            let finalizer = self.finalizer.borrow();
            if let Some(finalizer) = finalizer.as_ref() {
                for slot in &cx.slab {
                    let priv_ = match slot {
                        Slot::Object { priv_, .. } => *priv_,
                        Slot::Function { priv_, .. } => *priv_,
                        _ => None,
                    };
                    if let Some(p) = priv_ {
                        finalizer(p);
                    }
                }
            }
        }
    }

    fn val_unlock(&self, _ctx: CtxId, _raw: RawHandle) {}

    fn val_duplicate(&self, _ctx: CtxId, raw: RawHandle) -> RawHandle {
        raw
    }

    fn val_free(&self, _ctx: CtxId, _raw: RawHandle) {}

    fn new_global(
        &self,
        parent: Option<(CtxId, RawHandle)>,
        priv_map: RawPriv,
    ) -> BackendResult<(CtxId, RawHandle, Flags)> {
        let mut ctx_id = self.next_ctx.borrow_mut();
        let id = *ctx_id;
        *ctx_id += 1;
        drop(ctx_id);

        let mut cx = MockContext {
            slab: vec![Slot::Undefined, Slot::Null],
            global: RawHandle(0),
            undefined: RawHandle(0),
            null: RawHandle(1),
        };
        let global = cx.alloc(Slot::Object {
            props: Vec::new(),
            priv_: if priv_map.is_null() { None } else { Some(priv_map) },
        });
        cx.global = global;
        Self::install_json_global(&mut cx);

        // A child global inherits nothing from the parent automatically;
        // callers (the require subsystem) copy over what they need through
        // ordinary `set` calls.
        let _ = parent;

        self.contexts.borrow_mut().insert(id, cx);
        Ok((CtxId(id), global, Flags::ROOTED))
    }

    fn new_bool(&self, ctx: CtxId, b: bool) -> RawHandle {
        self.with_ctx(ctx, |cx| cx.alloc(Slot::Bool(b)))
    }

    fn new_number(&self, ctx: CtxId, n: f64) -> RawHandle {
        self.with_ctx(ctx, |cx| cx.alloc(Slot::Number(n)))
    }

    fn new_string_utf8(&self, ctx: CtxId, s: &str) -> RawHandle {
        self.with_ctx(ctx, |cx| cx.alloc(Slot::String(s.to_owned())))
    }

    fn new_string_utf16(&self, ctx: CtxId, s: &[u16]) -> RawHandle {
        let s = String::from_utf16_lossy(s);
        self.with_ctx(ctx, |cx| cx.alloc(Slot::String(s)))
    }

    fn new_array(&self, ctx: CtxId, items: &[RawHandle]) -> RawHandle {
        self.with_ctx(ctx, |cx| cx.alloc(Slot::Array(items.to_vec())))
    }

    fn new_function(&self, ctx: CtxId, name: &str, priv_map: RawPriv) -> RawHandle {
        self.with_ctx(ctx, |cx| {
            cx.alloc(Slot::Function {
                name: name.to_owned(),
                builtin: None,
                priv_: if priv_map.is_null() { None } else { Some(priv_map) },
            })
        })
    }

    fn new_object(&self, ctx: CtxId, priv_map: RawPriv) -> RawHandle {
        self.with_ctx(ctx, |cx| {
            cx.alloc(Slot::Object {
                props: Vec::new(),
                priv_: if priv_map.is_null() { None } else { Some(priv_map) },
            })
        })
    }

    fn new_null(&self, ctx: CtxId) -> RawHandle {
        self.with_ctx(ctx, |cx| cx.null)
    }

    fn new_undefined(&self, ctx: CtxId) -> RawHandle {
        self.with_ctx(ctx, |cx| cx.undefined)
    }

    fn to_bool(&self, ctx: CtxId, raw: RawHandle) -> bool {
        self.with_ctx(ctx, |cx| match cx.slot(raw) {
            Slot::Undefined | Slot::Null => false,
            Slot::Bool(b) => *b,
            Slot::Number(n) => *n != 0.0 && !n.is_nan(),
            Slot::String(s) => !s.is_empty(),
            Slot::Array(_) | Slot::Object { .. } | Slot::Function { .. } => true,
        })
    }

    fn to_double(&self, ctx: CtxId, raw: RawHandle) -> f64 {
        self.with_ctx(ctx, |cx| match cx.slot(raw) {
            Slot::Number(n) => *n,
            Slot::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Slot::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            Slot::Null => 0.0,
            _ => f64::NAN,
        })
    }

    fn to_string_utf8(&self, ctx: CtxId, raw: RawHandle) -> String {
        self.with_ctx(ctx, |cx| match cx.slot(raw) {
            Slot::Undefined => "undefined".to_string(),
            Slot::Null => "null".to_string(),
            Slot::Bool(b) => b.to_string(),
            Slot::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Slot::String(s) => s.clone(),
            Slot::Array(items) => items
                .iter()
                .map(|r| cx.slot(*r))
                .map(|s| match s {
                    Slot::String(v) => v.clone(),
                    Slot::Number(n) => n.to_string(),
                    _ => String::new(),
                })
                .collect::<Vec<_>>()
                .join(","),
            Slot::Object { .. } => "[object Object]".to_string(),
            Slot::Function { name, .. } => format!("function {name}() {{ [native code] }}"),
        })
    }

    fn to_string_utf16(&self, ctx: CtxId, raw: RawHandle) -> Vec<u16> {
        self.to_string_utf8(ctx, raw).encode_utf16().collect()
    }

    fn del(&self, ctx: CtxId, obj: RawHandle, id: &PropertyId) -> BackendResult<bool> {
        Ok(self.with_ctx(ctx, |cx| cx.object_del(obj, id)))
    }

    fn get(&self, ctx: CtxId, obj: RawHandle, id: &PropertyId) -> BackendResult<Outcome> {
        let raw = self.with_ctx(ctx, |cx| cx.object_get(obj, id));
        Ok(ok_outcome(raw, Flags::NONE))
    }

    fn set(
        &self,
        ctx: CtxId,
        obj: RawHandle,
        id: &PropertyId,
        value: RawHandle,
        _attrs: PropertyAttrs,
    ) -> BackendResult<Outcome> {
        self.with_ctx(ctx, |cx| cx.object_set(obj, id, value));
        let undef = self.with_ctx(ctx, |cx| cx.undefined);
        Ok(ok_outcome(undef, Flags::NONE))
    }

    fn enumerate(&self, ctx: CtxId, obj: RawHandle) -> BackendResult<RawHandle> {
        let names = self.with_ctx(ctx, |cx| match cx.slot(obj) {
            Slot::Object { props, .. } => props.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            Slot::Array(items) => (0..items.len()).map(|i| i.to_string()).collect(),
            _ => Vec::new(),
        });
        let raws = self.with_ctx(ctx, |cx| {
            names
                .into_iter()
                .map(|n| cx.alloc(Slot::String(n)))
                .collect::<Vec<_>>()
        });
        Ok(self.with_ctx(ctx, |cx| cx.alloc(Slot::Array(raws))))
    }

    fn call(
        &self,
        ctx: CtxId,
        func: RawHandle,
        _this: RawHandle,
        args: &[RawHandle],
    ) -> BackendResult<Outcome> {
        let builtin = self.with_ctx(ctx, |cx| match cx.slot(func) {
            Slot::Function { builtin, .. } => builtin.clone(),
            _ => None,
        });

        match builtin {
            Some(Builtin::ArrayPop(target)) => {
                let popped = self.with_ctx(ctx, |cx| {
                    if let Slot::Array(items) = cx.slot_mut(target) {
                        items.pop()
                    } else {
                        None
                    }
                });
                let raw = popped.unwrap_or_else(|| self.with_ctx(ctx, |cx| cx.undefined));
                Ok(ok_outcome(raw, Flags::NONE))
            }
            Some(Builtin::JsonParse) => {
                let text = match args.first() {
                    Some(r) => self.to_string_utf8(ctx, *r),
                    None => return Ok(exception_outcome(
                        self.with_ctx(ctx, |cx| cx.alloc(Slot::String("SyntaxError: Unexpected end of JSON input".into()))),
                        Flags::NONE,
                    )),
                };
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(value) => {
                        let raw = self.with_ctx(ctx, |cx| cx.from_json(&value));
                        Ok(ok_outcome(raw, Flags::NONE))
                    }
                    Err(e) => {
                        let msg = format!("SyntaxError: {e}");
                        let raw = self.with_ctx(ctx, |cx| cx.alloc(Slot::String(msg)));
                        Ok(exception_outcome(raw, Flags::NONE))
                    }
                }
            }
            Some(Builtin::JsonStringify) => {
                let value = match args.first() {
                    Some(r) => self.with_ctx(ctx, |cx| cx.to_json(*r)),
                    None => serde_json::Value::Null,
                };
                let text = serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string());
                let raw = self.with_ctx(ctx, |cx| cx.alloc(Slot::String(text)));
                Ok(ok_outcome(raw, Flags::NONE))
            }
            None => {
                let msg = self.with_ctx(ctx, |cx| {
                    cx.alloc(Slot::String("TypeError: value is not a function".into()))
                });
                Ok(exception_outcome(msg, Flags::NONE))
            }
        }
    }

    fn evaluate(
        &self,
        ctx: CtxId,
        this: RawHandle,
        source: &str,
        _filename: &str,
        _line: u32,
    ) -> BackendResult<Outcome> {
        if source.is_empty() {
            return Ok(ok_outcome(self.with_ctx(ctx, |cx| cx.undefined), Flags::NONE));
        }
        let _ = this;
        Err(BackendError::NotFound(
            "the mock backend does not parse JavaScript; drive behavior through the Value API instead".into(),
        ))
    }

    fn get_private(&self, ctx: CtxId, obj: RawHandle) -> Option<RawPriv> {
        self.with_ctx(ctx, |cx| match cx.slot(obj) {
            Slot::Object { priv_, .. } => *priv_,
            Slot::Function { priv_, .. } => *priv_,
            _ => None,
        })
    }

    fn get_global(&self, ctx: CtxId, _obj: RawHandle) -> RawHandle {
        self.with_ctx(ctx, |cx| cx.global)
    }

    fn get_type(&self, ctx: CtxId, raw: RawHandle) -> TypeTag {
        self.with_ctx(ctx, |cx| match cx.slot(raw) {
            Slot::Undefined => TypeTag::Undefined,
            Slot::Null => TypeTag::Null,
            Slot::Bool(_) => TypeTag::Boolean,
            Slot::Number(_) => TypeTag::Number,
            Slot::String(_) => TypeTag::String,
            Slot::Array(_) => TypeTag::Array,
            Slot::Object { .. } => TypeTag::Object,
            Slot::Function { .. } => TypeTag::Function,
        })
    }

    fn equal(&self, ctx: CtxId, a: RawHandle, b: RawHandle, strict: bool) -> bool {
        self.with_ctx(ctx, |cx| match (cx.slot(a), cx.slot(b)) {
            (Slot::Undefined, Slot::Undefined) => true,
            (Slot::Null, Slot::Null) => true,
            (Slot::Bool(x), Slot::Bool(y)) => x == y,
            (Slot::Number(x), Slot::Number(y)) => x == y,
            (Slot::String(x), Slot::String(y)) => x == y,
            (Slot::Null, Slot::Undefined) | (Slot::Undefined, Slot::Null) => !strict,
            _ => a == b,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn globals_get_set_roundtrip() {
        let backend = MockBackend::new();
        let (ctx, global, _) = backend.new_global(None, ptr::null_mut()).unwrap();
        let value = backend.new_number(ctx, 42.0);
        backend
            .set(ctx, global, &PropertyId::from("x"), value, PropertyAttrs::default())
            .unwrap();
        let got = backend.get(ctx, global, &PropertyId::from("x")).unwrap();
        let (raw, _) = got.left().unwrap();
        assert_eq!(backend.to_double(ctx, raw), 42.0);
    }

    #[test]
    fn array_push_pop_via_length_and_builtin() {
        let backend = MockBackend::new();
        let (ctx, _global, _) = backend.new_global(None, ptr::null_mut()).unwrap();
        let a = backend.new_number(ctx, 123.0);
        let b = backend.new_number(ctx, 456.0);
        let arr = backend.new_array(ctx, &[a, b]);

        // push("foo"): read length, write at that index.
        let len_outcome = backend.get(ctx, arr, &PropertyId::from("length")).unwrap();
        let (len_raw, _) = len_outcome.left().unwrap();
        let len = backend.to_double(ctx, len_raw) as u32;
        let s = backend.new_string_utf8(ctx, "foo");
        backend
            .set(ctx, arr, &PropertyId::Index(len), s, PropertyAttrs::default())
            .unwrap();

        let len_outcome = backend.get(ctx, arr, &PropertyId::from("length")).unwrap();
        assert_eq!(backend.to_double(ctx, len_outcome.left().unwrap().0), 3.0);

        // pop()
        let pop_fn = backend.get(ctx, arr, &PropertyId::from("pop")).unwrap().left().unwrap().0;
        let popped = backend.call(ctx, pop_fn, arr, &[]).unwrap();
        let (popped_raw, _) = popped.left().unwrap();
        assert_eq!(backend.to_string_utf8(ctx, popped_raw), "foo");

        let len_outcome = backend.get(ctx, arr, &PropertyId::from("length")).unwrap();
        assert_eq!(backend.to_double(ctx, len_outcome.left().unwrap().0), 2.0);
    }

    #[test]
    fn json_round_trips_through_builtins() {
        let backend = MockBackend::new();
        let (ctx, global, _) = backend.new_global(None, ptr::null_mut()).unwrap();
        let json = backend.get(ctx, global, &PropertyId::from("JSON")).unwrap().left().unwrap().0;
        let stringify = backend.get(ctx, json, &PropertyId::from("stringify")).unwrap().left().unwrap().0;
        let parse = backend.get(ctx, json, &PropertyId::from("parse")).unwrap().left().unwrap().0;

        let n = backend.new_number(ctx, 7.0);
        let text_outcome = backend.call(ctx, stringify, global, &[n]).unwrap();
        let text_raw = text_outcome.left().unwrap().0;
        assert_eq!(backend.to_string_utf8(ctx, text_raw), "7");

        let parsed = backend.call(ctx, parse, global, &[text_raw]).unwrap();
        let parsed_raw = parsed.left().unwrap().0;
        assert_eq!(backend.to_double(ctx, parsed_raw), 7.0);
    }

    #[test]
    fn finalizer_runs_exactly_once_per_private_pointer() {
        use std::cell::Cell;
        use std::rc::Rc;

        let backend = MockBackend::new();
        let calls = Rc::new(Cell::new(0));
        let calls_clone = Rc::clone(&calls);
        backend.set_finalizer(Box::new(move |_p| calls_clone.set(calls_clone.get() + 1)));

        let marker: Box<u8> = Box::new(7);
        let raw_priv = Box::into_raw(marker) as RawPriv;
        let (ctx, _global, _) = backend.new_global(None, ptr::null_mut()).unwrap();
        let _obj = backend.new_object(ctx, raw_priv);

        backend.ctx_free(ctx);
        assert_eq!(calls.get(), 1);

        // SAFETY: reclaim the box we leaked above so this test doesn't leak.
        unsafe {
            drop(Box::from_raw(raw_priv as *mut u8));
        }
    }
}
