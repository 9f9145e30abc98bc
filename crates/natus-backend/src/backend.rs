//! The backend protocol: an abstract vtable every embedded engine implements,
//! expressed as a Rust trait rather than a literal C vtable.
//!
//! This is the same shape a single N-API/V8 binding layer would expose for
//! its one engine — a bag of raw operations the safe layer calls through —
//! generalized into a trait object so the safe layer (`natus::Context`/
//! `natus::Value`) can hold any one of several interchangeable engines
//! behind `Arc<dyn Backend>`: each backend is a module that returns a boxed
//! trait object.

use std::fmt;

/// An opaque handle into a backend's heap. For a real FFI-backed engine this
/// is a tagged pointer; the bundled `mock` backend uses it as a slab index.
/// Either way it is only ever round-tripped back into the backend that
/// produced it — natus never dereferences it directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawHandle(pub usize);

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

/// An opaque pointer to host-owned (natus-owned) data that the backend
/// stores verbatim on an object/function/global and returns unchanged from
/// [`Backend::get_private`]. The backend never interprets its contents; it
/// is natus's [`PrivateMap`](https://docs.rs/natus) boxed into a raw pointer.
pub type RawPriv = *mut std::ffi::c_void;

/// Identifies one backend execution context. Backends that multiplex several
/// contexts per engine (e.g. SpiderMonkey compartments sharing one runtime)
/// key their internal state by this id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CtxId(pub u64);

/// The engine's dynamic type tag for a value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeTag {
    Array,
    Boolean,
    Function,
    Null,
    Number,
    Object,
    String,
    Undefined,
    Unknown,
}

/// Ownership flags a creation/execution operation returns alongside a value:
/// whether the façade must `val_unlock` and/or `val_free` on drop, and
/// whether the returned value is an exception.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Flags {
    pub unlock_on_drop: bool,
    pub free_on_drop: bool,
    pub exception: bool,
}

impl Flags {
    pub const NONE: Flags = Flags {
        unlock_on_drop: false,
        free_on_drop: false,
        exception: false,
    };

    pub const ROOTED: Flags = Flags {
        unlock_on_drop: true,
        free_on_drop: true,
        exception: false,
    };
}

/// An operation's outcome: either a plain value or one flagged as an active
/// JS exception. Kept orthogonal to allocation failure, which is a distinct
/// `Err(BackendError::OutOfMemory)` — a null-returned value from an
/// allocating API signals OOM, distinct from an exceptional value.
///
/// Modeled with `either::Either`, the same two-armed-result shape the
/// dependency stack already favors for this kind of outcome.
pub type Outcome = either::Either<(RawHandle, Flags), (RawHandle, Flags)>;

/// Constructs a non-exceptional outcome.
pub fn ok_outcome(raw: RawHandle, flags: Flags) -> Outcome {
    either::Left((raw, flags))
}

/// Constructs an outcome flagged as a pending exception.
pub fn exception_outcome(raw: RawHandle, mut flags: Flags) -> Outcome {
    flags.exception = true;
    either::Right((raw, flags))
}

pub type BackendResult<T> = Result<T, crate::error::BackendError>;

/// A key used for property get/set/delete/enumerate.
#[derive(Clone, Debug)]
pub enum PropertyId {
    Name(String),
    Index(u32),
}

impl From<&str> for PropertyId {
    fn from(s: &str) -> Self {
        PropertyId::Name(s.to_owned())
    }
}

impl From<u32> for PropertyId {
    fn from(i: u32) -> Self {
        PropertyId::Index(i)
    }
}

/// Property attribute bits applied by `set` (writable/enumerable/configurable
/// are left to the backend's native semantics; natus only distinguishes
/// read-only vs normal, which is all a recursive-set attrs parameter needs).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PropertyAttrs {
    pub read_only: bool,
    pub dont_enum: bool,
}

/// The action a class/property trampoline is handling.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PropertyAction {
    Delete,
    Get,
    Set,
    Enumerate,
}

/// The abstract backend protocol. One implementor per engine; the `mock`
/// module in this crate is the only one shipped, since implementing a real
/// JavaScript engine is out of scope for natus itself.
///
/// All methods take `&self`: a backend is free to use interior mutability,
/// but it must never be driven from more than one OS thread concurrently —
/// natus enforces that one level up by never sharing a `Context` across
/// threads.
pub trait Backend {
    fn name(&self) -> &str;

    // -- Lifetime --------------------------------------------------------
    fn ctx_free(&self, ctx: CtxId);
    fn val_unlock(&self, ctx: CtxId, raw: RawHandle);
    fn val_duplicate(&self, ctx: CtxId, raw: RawHandle) -> RawHandle;
    fn val_free(&self, ctx: CtxId, raw: RawHandle);

    // -- Creation ---------------------------------------------------------
    /// Creates a new global. `parent` is `Some((ctx, global))` when this is
    /// a child scope sharing the parent's engine (used by the require
    /// subsystem to build per-module scopes); `None` for the first global.
    fn new_global(
        &self,
        parent: Option<(CtxId, RawHandle)>,
        priv_map: RawPriv,
    ) -> BackendResult<(CtxId, RawHandle, Flags)>;
    fn new_bool(&self, ctx: CtxId, b: bool) -> RawHandle;
    fn new_number(&self, ctx: CtxId, n: f64) -> RawHandle;
    fn new_string_utf8(&self, ctx: CtxId, s: &str) -> RawHandle;
    fn new_string_utf16(&self, ctx: CtxId, s: &[u16]) -> RawHandle;
    fn new_array(&self, ctx: CtxId, items: &[RawHandle]) -> RawHandle;
    fn new_function(&self, ctx: CtxId, name: &str, priv_map: RawPriv) -> RawHandle;
    fn new_object(&self, ctx: CtxId, priv_map: RawPriv) -> RawHandle;
    fn new_null(&self, ctx: CtxId) -> RawHandle;
    fn new_undefined(&self, ctx: CtxId) -> RawHandle;

    // -- Coercion ----------------------------------------------------------
    fn to_bool(&self, ctx: CtxId, raw: RawHandle) -> bool;
    fn to_double(&self, ctx: CtxId, raw: RawHandle) -> f64;
    fn to_string_utf8(&self, ctx: CtxId, raw: RawHandle) -> String;
    fn to_string_utf16(&self, ctx: CtxId, raw: RawHandle) -> Vec<u16>;

    // -- Property -----------------------------------------------------------
    fn del(&self, ctx: CtxId, obj: RawHandle, id: &PropertyId) -> BackendResult<bool>;
    fn get(&self, ctx: CtxId, obj: RawHandle, id: &PropertyId) -> BackendResult<Outcome>;
    fn set(
        &self,
        ctx: CtxId,
        obj: RawHandle,
        id: &PropertyId,
        value: RawHandle,
        attrs: PropertyAttrs,
    ) -> BackendResult<Outcome>;
    fn enumerate(&self, ctx: CtxId, obj: RawHandle) -> BackendResult<RawHandle>;

    // -- Execution ----------------------------------------------------------
    fn call(
        &self,
        ctx: CtxId,
        func: RawHandle,
        this: RawHandle,
        args: &[RawHandle],
    ) -> BackendResult<Outcome>;
    fn evaluate(
        &self,
        ctx: CtxId,
        this: RawHandle,
        source: &str,
        filename: &str,
        line: u32,
    ) -> BackendResult<Outcome>;

    // -- Introspection -------------------------------------------------------
    fn get_private(&self, ctx: CtxId, obj: RawHandle) -> Option<RawPriv>;
    fn get_global(&self, ctx: CtxId, obj: RawHandle) -> RawHandle;
    fn get_type(&self, ctx: CtxId, raw: RawHandle) -> TypeTag;
    fn equal(&self, ctx: CtxId, a: RawHandle, b: RawHandle, strict: bool) -> bool;

    /// Optional engine-specific diagnostic payload (e.g. a `JSRuntime*`
    /// address). Used only by tracing/debug output, never by core logic.
    fn engine_data(&self, _ctx: CtxId) -> Option<String> {
        None
    }

    /// Registers the finalize trampoline: called with a private-map pointer
    /// exactly once, whenever the backend is about to reclaim the object
    /// that pointer was attached to. A real FFI plugin wires this into its
    /// engine's native GC callback; `mock` approximates GC by sweeping every
    /// live pointer when its owning context is freed. Default is a no-op,
    /// since a backend with no live objects carrying private data has
    /// nothing to finalize.
    fn set_finalizer(&self, _f: Box<dyn Fn(RawPriv)>) {}
}
