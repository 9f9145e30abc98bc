//! End-to-end scenarios exercised against the bundled mock backend. The
//! mock backend deliberately doesn't parse JavaScript source (see its
//! module docs), so each scenario drives the façade the way a native
//! embedder would: building values and calling through the `Value` API
//! directly rather than handing it script text.

use std::rc::Rc;

use natus::require::{ModuleHook, RequireConfig};
use natus::{Context, NatusError};
use natus_backend::mock::MockBackend;
use natus_backend::EngineHandle;

fn new_ctx() -> Context {
    Context::new(EngineHandle::from_builtin("mock", MockBackend::new())).unwrap()
}

/// S1 — array round-trip: push then pop preserves the expected length and
/// element values.
#[test]
fn s1_array_round_trip() {
    let ctx = new_ctx();
    let global = ctx.global();
    let a = ctx.number(123.0);
    let b = ctx.number(456.0);
    let array = ctx.array(&[a, b]);
    global.set("x", &array).unwrap();

    let x = global.get("x").unwrap();
    x.push(&ctx.string("foo")).unwrap();
    assert_eq!(x.get("length").unwrap().to_number(), 3.0);

    let popped = x.pop().unwrap();
    assert_eq!(popped.to_rust_string().unwrap(), "foo");
    assert_eq!(x.get("length").unwrap().to_number(), 2.0);
    assert_eq!(global.get("x").unwrap().get(0).unwrap().to_number(), 123.0);
}

/// S2 — a native function that raises an exception value is catchable:
/// the exceptional value returned by `call` carries the thrown payload
/// without poisoning values built around it.
#[test]
fn s2_native_function_exception() {
    let ctx = new_ctx();
    let bomb = ctx.function(
        "bomb",
        Rc::new(|call_ctx, _this, _args| call_ctx.string("fail").to_exception()),
    );

    let result = bomb.call(&ctx.global(), &[]).unwrap();
    assert!(result.is_exception());
    assert_eq!(result.to_rust_string().unwrap(), "fail");
}

/// S3 — a class Get hook intercepts numeric property access and can
/// answer before the backend's own property lookup ever runs.
#[test]
fn s3_class_property_interception() {
    let ctx = new_ctx();
    let class = natus::class::Class::named("Echo").with_get(Rc::new(|call_ctx, _this, id| {
        if let natus_backend::PropertyId::Index(i) = id {
            call_ctx.number(*i as f64)
        } else {
            call_ctx.undefined()
        }
    }));
    let o = ctx.object_with_class(class);
    assert_eq!(o.get(7u32).unwrap().to_number(), 7.0);
}

fn whitelist_hook(name: &'static str) -> ModuleHook {
    let resolve: natus::require::ResolveHook = Rc::new(move |_state, requested, _current| {
        if requested == name {
            Some(requested.to_string())
        } else {
            None
        }
    });
    let load: natus::require::LoadHook = Rc::new(|_state, _resolved| Ok(Some(String::new())));
    let process: natus::require::ProcessHook = Rc::new(|_ctx, _exports, _resolved, _source| Ok(()));
    ModuleHook {
        id: name.to_string(),
        resolve,
        load,
        process,
    }
}

/// S4 — sandbox whitelist: a permitted module resolves normally and hides
/// `module.uri`/`require.paths`; a name outside the whitelist raises a
/// SecurityError instead.
#[test]
fn s4_sandbox_whitelist() {
    let ctx = new_ctx();
    ctx.init_require(RequireConfig {
        search_paths: vec!["./".into()],
        whitelist: Some(vec!["ok".to_string()]),
        ..Default::default()
    });
    let state = ctx.require_state().unwrap();
    state.add_hook(whitelist_hook("ok"));
    state.add_hook(whitelist_hook("bad"));

    let ok_module = state.require_module(&ctx, "ok").unwrap();
    assert!(ok_module.get("exports").unwrap().is_object());
    assert!(ok_module.get("uri").unwrap().is_undefined());

    let bad = state.require(&ctx, "bad");
    assert!(matches!(bad.unwrap_err(), NatusError::Security { .. }));
}

/// S5 — requiring the same module name twice returns the same cached
/// exports object, so mutations through one handle are visible via the
/// other.
#[test]
fn s5_module_cache_identity() {
    let ctx = new_ctx();
    ctx.init_require(RequireConfig::default());
    let state = ctx.require_state().unwrap();

    let resolve: natus::require::ResolveHook =
        Rc::new(|_state, requested, _current| if requested == "m" { Some("m".to_string()) } else { None });
    let load: natus::require::LoadHook = Rc::new(|_state, _resolved| Ok(Some(String::new())));
    let process: natus::require::ProcessHook = Rc::new(|module_ctx, exports, _resolved, _source| {
        exports.set("n", &module_ctx.number(1.0))?;
        Ok(())
    });
    state.add_hook(ModuleHook {
        id: "m".to_string(),
        resolve,
        load,
        process,
    });

    let a = state.require(&ctx, "m").unwrap();
    a.set("n", &ctx.number(99.0)).unwrap();
    let b = state.require(&ctx, "m").unwrap();
    assert_eq!(b.get("n").unwrap().to_number(), 99.0);
}

/// S6 — `set_path` creates missing intermediate objects, and `get_path`
/// walks back down to the value they hold.
#[test]
fn s6_recursive_path_set_with_make_path() {
    let ctx = new_ctx();
    let global = ctx.global();
    global.set_path("a.b.c", &ctx.number(3.0)).unwrap();

    assert_eq!(global.get_path("a.b.c").unwrap().to_number(), 3.0);
    assert!(global.get_path("a").unwrap().is_object());
    assert!(global.get_path("a.b").unwrap().is_object());
}

/// Invariant 1 — a value's type tag is stable across repeated reads.
#[test]
fn invariant_type_tag_is_stable() {
    let ctx = new_ctx();
    let n = ctx.number(1.0);
    assert_eq!(n.get_type(), n.get_type());
    assert_eq!(n.type_name(), "number");
}

/// Invariant 2 — setting a key then getting it back returns the same
/// value, for plain (non-trapped) objects.
#[test]
fn invariant_set_then_get_round_trips() {
    let ctx = new_ctx();
    let o = ctx.object();
    let v = ctx.string("hello");
    o.set("k", &v).unwrap();
    assert!(o.get("k").unwrap().equal(&v, true));
}

/// Invariant 3 — requiring the same name twice returns values that
/// compare strictly equal (the backend's own identity, since the mock
/// backend never duplicates handles).
#[test]
fn invariant_require_twice_is_strict_equal() {
    let ctx = new_ctx();
    ctx.init_require(RequireConfig::default());
    let state = ctx.require_state().unwrap();
    state.add_hook(whitelist_hook("widgets"));

    let a = state.require(&ctx, "widgets").unwrap();
    let b = state.require(&ctx, "widgets").unwrap();
    assert!(a.equal(&b, true));
}

/// Invariant 4 — a class destructor (modeled here as private-data drop)
/// runs exactly once when the owning context is freed.
#[test]
fn invariant_private_data_dropped_exactly_once() {
    use std::cell::Cell;

    struct DropCounter(Rc<Cell<u32>>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    let count = Rc::new(Cell::new(0));
    {
        let ctx = new_ctx();
        let o = ctx.object();
        o.set_private(DropCounter(Rc::clone(&count))).unwrap();
    }
    assert_eq!(count.get(), 1);
}

/// Invariant 5 — a value round-tripped through `to_serde`/`from_serde` is
/// structurally equal to the original JSON tree.
#[test]
fn invariant_json_round_trip_is_structurally_equal() {
    let ctx = new_ctx();
    let original = serde_json::json!({"a": 1, "b": [true, "x", null]});
    let value = natus::json::from_serde(&ctx, &original);
    let round_tripped = natus::json::to_serde(&value).unwrap();
    assert_eq!(original, round_tripped);
}

/// Invariant 7 — a Get hook returning undefined-without-exception is
/// "not intercepted" and falls through to ordinary property storage.
#[test]
fn invariant_get_hook_fallthrough_on_plain_undefined() {
    let ctx = new_ctx();
    let class = natus::class::Class::named("PassThrough").with_get(Rc::new(|call_ctx, _this, _id| call_ctx.undefined()));
    let o = ctx.object_with_class(class);
    o.set("stored", &ctx.number(5.0)).unwrap();
    assert_eq!(o.get("stored").unwrap().to_number(), 5.0);
}
