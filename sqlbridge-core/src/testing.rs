// sqlbridge-core/src/testing.rs
//! In-memory backends for the two runtime seams
//!
//! [`MockRuntime`] implements [`ManagedEnv`] over a small object heap with
//! JNI reference semantics (local and global handles, pending exceptions,
//! reflective lookups). [`MockEngine`] implements [`NativeEngine`] as a
//! scripted stand-in for the C library and routes its events through a
//! [`MockDispatch`], the way the JNI trampolines route real ones.
//!
//! [`Fixture`] wires the two into a [`Bridge`].

use std::collections::{HashMap, HashSet};
use std::ffi::CStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::engine::{
    ContextPtr, DbPtr, NativeEngine, Prepared, StmtPtr, TraceEvent, ValuePtr, SQLITE_UTF8,
};
use crate::error::{codes, Result};
use crate::hooks::{HookKind, HookSlot};
use crate::metadata::{HandleKind, NATIVE_POINTER_FIELD};
use crate::runtime::{
    EnvId, FieldId, ManagedEnv, ManagedError, ManagedResult, MethodId, ObjRef, RefReleaser, Ret,
    RetKind, Value,
};
use crate::udf::{UdfBinding, UdfMethod};

// ============================================================================
// MANAGED RUNTIME
// ============================================================================

/// Body of a mock method: receives the calling env and the call arguments
pub type MockMethod = Arc<dyn Fn(&MockEnv, &[Value]) -> std::result::Result<Ret, String> + Send + Sync>;

#[derive(Debug, Clone)]
enum Obj {
    Instance { class: String, fields: HashMap<usize, Slot> },
    Class(String),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Option<usize>>),
    Throwable(String),
    Charset,
    Long(i64),
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Int(i32),
    Long(i64),
    Bool(bool),
    Obj(Option<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefKind {
    Local,
    Global,
}

struct ClassDef {
    object: usize,
    fields: Vec<(String, String)>,
    statics: Vec<(String, String)>,
    methods: Vec<(String, String)>,
}

#[derive(Default)]
struct Heap {
    next: usize,
    objects: HashMap<usize, Obj>,
    refs: HashMap<usize, (usize, RefKind)>,
    classes: HashMap<String, ClassDef>,
    field_ids: Vec<(String, String, String)>,
    method_ids: Vec<(String, String, String)>,
    bodies: HashMap<(String, String, String), MockMethod>,
    calls: HashMap<(String, String), usize>,
    pending: HashMap<usize, usize>,
    utf8: usize,
}

impl Heap {
    fn alloc(&mut self, obj: Obj) -> usize {
        self.next += 1;
        self.objects.insert(self.next, obj);
        self.next
    }

    fn handle(&mut self, obj: usize, kind: RefKind) -> ObjRef {
        self.next += 1;
        self.refs.insert(self.next, (obj, kind));
        match ObjRef::from_raw(self.next) {
            Some(r) => r,
            None => unreachable!("handle ids start at 1"),
        }
    }

    fn deref(&self, r: ObjRef) -> Option<usize> {
        self.refs.get(&r.as_raw()).map(|(obj, _)| *obj)
    }

    fn class_of(&self, obj: usize) -> String {
        match self.objects.get(&obj) {
            Some(Obj::Instance { class, .. }) => class.clone(),
            Some(Obj::Class(_)) => "java/lang/Class".into(),
            Some(Obj::Str(_)) => "java/lang/String".into(),
            Some(Obj::Bytes(_)) => "[B".into(),
            Some(Obj::Array(_)) => "[Ljava/lang/Object;".into(),
            Some(Obj::Throwable(_)) => "java/lang/Throwable".into(),
            Some(Obj::Charset) => "java/nio/charset/Charset".into(),
            Some(Obj::Long(_)) => "java/lang/Long".into(),
            None => "<dead>".into(),
        }
    }

    fn class_name(&self, class: ObjRef) -> Option<String> {
        match self.objects.get(&self.deref(class)?) {
            Some(Obj::Class(name)) => Some(name.clone()),
            _ => None,
        }
    }

    fn define(&mut self, name: &str) {
        if self.classes.contains_key(name) {
            return;
        }
        let object = self.alloc(Obj::Class(name.to_string()));
        self.classes.insert(
            name.to_string(),
            ClassDef {
                object,
                fields: Vec::new(),
                statics: Vec::new(),
                methods: vec![("<init>".into(), "()V".into())],
            },
        );
    }

    fn has_method(&self, class: &str, name: &str, sig: &str) -> bool {
        let declared = |c: &str| {
            self.classes
                .get(c)
                .map(|d| d.methods.iter().any(|(n, s)| n == name && s == sig))
                .unwrap_or(false)
        };
        declared(class) || (name != "<init>" && declared("java/lang/Object"))
    }

    fn intern(table: &mut Vec<(String, String, String)>, key: (String, String, String)) -> usize {
        match table.iter().position(|k| *k == key) {
            Some(i) => i + 1,
            None => {
                table.push(key);
                table.len()
            }
        }
    }

    fn ret(&mut self, slot: Option<Slot>, kind: RetKind) -> Ret {
        match (kind, slot) {
            (RetKind::Void, _) => Ret::Void,
            (RetKind::Int, Some(Slot::Int(v))) => Ret::Int(v),
            (RetKind::Int, _) => Ret::Int(0),
            (RetKind::Long, Some(Slot::Long(v))) => Ret::Long(v),
            (RetKind::Long, _) => Ret::Long(0),
            (RetKind::Bool, Some(Slot::Bool(v))) => Ret::Bool(v),
            (RetKind::Bool, _) => Ret::Bool(false),
            (RetKind::Object, Some(Slot::Obj(Some(obj)))) => {
                Ret::Object(Some(self.handle(obj, RefKind::Local)))
            }
            (RetKind::Object, _) => Ret::Object(None),
        }
    }

    fn slot(&self, value: Value) -> Slot {
        match value {
            Value::Bool(b) => Slot::Bool(b),
            Value::Int(i) => Slot::Int(i),
            Value::Long(l) => Slot::Long(l),
            Value::Object(o) => Slot::Obj(o.and_then(|o| self.deref(o))),
        }
    }

    fn throw(&mut self, env: usize, msg: &str) {
        let ex = self.alloc(Obj::Throwable(msg.to_string()));
        self.pending.insert(env, ex);
    }
}

struct Inner {
    heap: Mutex<Heap>,
    class_lookups: AtomicUsize,
    alloc_budget: AtomicUsize,
}

impl RefReleaser for Inner {
    fn delete_global_ref(&self, obj: ObjRef) {
        self.heap.lock().refs.remove(&obj.as_raw());
    }
}

const NPE: &str = "java.lang.NullPointerException";
const OUT_OF_BOUNDS: &str = "java.lang.ArrayIndexOutOfBoundsException";

static NEXT_ENV: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_ENV: usize = NEXT_ENV.fetch_add(1, Ordering::Relaxed);
}

/// Shared in-memory managed runtime
#[derive(Clone)]
pub struct MockRuntime {
    inner: Arc<Inner>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Runtime with the standard library types and every wrapper class of
    /// the default package already defined
    pub fn new() -> Self {
        let mut heap = Heap::default();
        heap.define("java/lang/Object");
        heap.define("java/lang/Throwable");
        heap.define("java/nio/charset/Charset");
        heap.define("java/lang/String");
        heap.define("java/lang/Long");
        heap.define("java/nio/charset/StandardCharsets");
        let add = |heap: &mut Heap, class: &str, name: &str, sig: &str| {
            if let Some(def) = heap.classes.get_mut(class) {
                def.methods.push((name.into(), sig.into()));
            }
        };
        add(&mut heap, "java/lang/Object", "toString", "()Ljava/lang/String;");
        add(&mut heap, "java/lang/String", "<init>", "([BLjava/nio/charset/Charset;)V");
        add(&mut heap, "java/lang/String", "getBytes", "(Ljava/nio/charset/Charset;)[B");
        add(&mut heap, "java/lang/Long", "<init>", "(J)V");
        if let Some(def) = heap.classes.get_mut("java/nio/charset/StandardCharsets") {
            def.statics
                .push(("UTF_8".into(), "Ljava/nio/charset/Charset;".into()));
        }
        heap.utf8 = heap.alloc(Obj::Charset);

        let config = BridgeConfig::default();
        for kind in HandleKind::ALL {
            let name = config.class_name(kind.simple_name());
            heap.define(&name);
            if let Some(def) = heap.classes.get_mut(&name) {
                if kind.is_wrapper() {
                    def.fields.push((NATIVE_POINTER_FIELD.into(), "J".into()));
                }
                if kind == HandleKind::Context {
                    def.fields.push(("aggregateContext".into(), "J".into()));
                }
                if let Some((_, sig)) = kind.value_field(&config) {
                    def.fields.push(("value".into(), sig));
                }
            }
        }

        MockRuntime {
            inner: Arc::new(Inner {
                heap: Mutex::new(heap),
                class_lookups: AtomicUsize::new(0),
                alloc_budget: AtomicUsize::new(usize::MAX),
            }),
        }
    }

    /// Environment of the calling thread
    pub fn attach(&self) -> MockEnv {
        MockEnv {
            rt: self.clone(),
            id: EnvId(THREAD_ENV.with(|id| *id)),
        }
    }

    /// Define an empty class with a no-arg constructor; returns its name
    pub fn define_class(&self, name: &str) -> String {
        self.inner.heap.lock().define(name);
        name.to_string()
    }

    /// Give `class` a method with the given body
    pub fn add_method<F>(&self, class: &str, name: &str, sig: &str, body: F)
    where
        F: Fn(&MockEnv, &[Value]) -> std::result::Result<Ret, String> + Send + Sync + 'static,
    {
        let mut heap = self.inner.heap.lock();
        heap.define(class);
        if let Some(def) = heap.classes.get_mut(class) {
            def.methods.push((name.into(), sig.into()));
        }
        heap.bodies
            .insert((class.into(), name.into(), sig.into()), Arc::new(body));
    }

    /// Class implementing a single-method callback interface `call(sig)`
    pub fn callback_class<F>(&self, name: &str, sig: &str, body: F) -> String
    where
        F: Fn(&MockEnv, &[Value]) -> std::result::Result<Ret, String> + Send + Sync + 'static,
    {
        self.define_class(name);
        self.add_method(name, "call", sig, body);
        name.to_string()
    }

    /// Invocations of `class.method` so far
    pub fn calls_to(&self, class: &str, method: &str) -> usize {
        self.inner
            .heap
            .lock()
            .calls
            .get(&(class.to_string(), method.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn global_ref_count(&self) -> usize {
        self.ref_count(RefKind::Global)
    }

    pub fn local_ref_count(&self) -> usize {
        self.ref_count(RefKind::Local)
    }

    fn ref_count(&self, kind: RefKind) -> usize {
        self.inner
            .heap
            .lock()
            .refs
            .values()
            .filter(|(_, k)| *k == kind)
            .count()
    }

    /// Number of `find_class` calls made so far
    pub fn class_lookups(&self) -> usize {
        self.inner.class_lookups.load(Ordering::SeqCst)
    }

    /// Let `n` more object/array allocations succeed, then fail them all
    ///
    /// `usize::MAX` removes the limit.
    pub fn fail_allocations_after(&self, n: usize) {
        self.inner.alloc_budget.store(n, Ordering::SeqCst);
    }

    fn take_budget(&self) -> bool {
        self.inner
            .alloc_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| match b {
                usize::MAX => Some(b),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }
}

/// One thread's view of a [`MockRuntime`]
pub struct MockEnv {
    rt: MockRuntime,
    id: EnvId,
}

impl MockEnv {
    fn heap(&self) -> parking_lot::MutexGuard<'_, Heap> {
        self.rt.inner.heap.lock()
    }

    pub fn runtime(&self) -> &MockRuntime {
        &self.rt
    }

    /// Instance of `class` (defined on the fly if unknown), as a local ref
    pub fn alloc_plain(&self, class: &str) -> ObjRef {
        let mut heap = self.heap();
        heap.define(class);
        let obj = heap.alloc(Obj::Instance {
            class: class.to_string(),
            fields: HashMap::new(),
        });
        heap.handle(obj, RefKind::Local)
    }

    pub fn new_string(&self, s: &str) -> ObjRef {
        let mut heap = self.heap();
        let obj = heap.alloc(Obj::Str(s.to_string()));
        heap.handle(obj, RefKind::Local)
    }

    pub fn string_value(&self, s: ObjRef) -> Option<String> {
        let heap = self.heap();
        match heap.objects.get(&heap.deref(s)?) {
            Some(Obj::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn long_value(&self, obj: ObjRef) -> Option<i64> {
        let heap = self.heap();
        match heap.objects.get(&heap.deref(obj)?) {
            Some(Obj::Long(v)) => Some(*v),
            _ => None,
        }
    }

    /// Raise a throwable whose `toString()` is `msg`
    pub fn throw(&self, msg: &str) {
        self.heap().throw(self.id.0, msg);
    }

    /// Raise `ex` itself as the pending exception
    pub fn throw_object(&self, ex: ObjRef) {
        let mut heap = self.heap();
        if let Some(obj) = heap.deref(ex) {
            heap.pending.insert(self.id.0, obj);
        }
    }

    fn fail<T>(&self, err: ManagedError, throwable: &str) -> ManagedResult<T> {
        let msg = match &err {
            ManagedError::NotFound { name, .. } => format!("{}: {}", throwable, name),
            _ => throwable.to_string(),
        };
        self.throw(&msg);
        Err(err)
    }

    /// Run `f` under the heap lock; `None` raises `throwable` after unlocking
    fn on_heap<R>(&self, throwable: &str, f: impl FnOnce(&mut Heap) -> Option<R>) -> ManagedResult<R> {
        let out = f(&mut self.heap());
        match out {
            Some(r) => Ok(r),
            None => self.fail(ManagedError::Exception, throwable),
        }
    }

    fn oom<T>(&self) -> ManagedResult<T> {
        self.fail(ManagedError::OutOfMemory, "java.lang.OutOfMemoryError")
    }

    fn dead<T>(&self) -> ManagedResult<T> {
        self.fail(ManagedError::Exception, NPE)
    }
}

impl ManagedEnv for MockEnv {
    fn id(&self) -> EnvId {
        self.id
    }

    fn releaser(&self) -> Arc<dyn RefReleaser> {
        self.rt.inner.clone()
    }

    fn find_class(&self, name: &str) -> ManagedResult<ObjRef> {
        self.rt.inner.class_lookups.fetch_add(1, Ordering::SeqCst);
        let mut heap = self.heap();
        match heap.classes.get(name).map(|d| d.object) {
            Some(obj) => Ok(heap.handle(obj, RefKind::Local)),
            None => {
                drop(heap);
                self.fail(
                    ManagedError::NotFound {
                        kind: "class",
                        name: name.to_string(),
                    },
                    "java.lang.NoClassDefFoundError",
                )
            }
        }
    }

    fn object_class(&self, obj: ObjRef) -> ManagedResult<ObjRef> {
        let mut heap = self.heap();
        let Some(id) = heap.deref(obj) else {
            drop(heap);
            return self.dead();
        };
        let class = heap.class_of(id);
        heap.define(&class);
        let class_obj = heap.classes.get(&class).map(|d| d.object).unwrap_or_default();
        Ok(heap.handle(class_obj, RefKind::Local))
    }

    fn field_id(&self, class: ObjRef, name: &str, sig: &str) -> ManagedResult<FieldId> {
        let mut heap = self.heap();
        let class = heap.class_name(class).unwrap_or_default();
        let found = heap
            .classes
            .get(&class)
            .map(|d| d.fields.iter().any(|(n, s)| n == name && s == sig))
            .unwrap_or(false);
        if !found {
            drop(heap);
            return self.fail(
                ManagedError::NotFound {
                    kind: "field",
                    name: format!("{}.{}:{}", class, name, sig),
                },
                "java.lang.NoSuchFieldError",
            );
        }
        let id = Heap::intern(&mut heap.field_ids, (class, name.into(), sig.into()));
        FieldId::from_raw(id).ok_or(ManagedError::Exception)
    }

    fn static_field_id(&self, class: ObjRef, name: &str, sig: &str) -> ManagedResult<FieldId> {
        let mut heap = self.heap();
        let class = heap.class_name(class).unwrap_or_default();
        let found = heap
            .classes
            .get(&class)
            .map(|d| d.statics.iter().any(|(n, s)| n == name && s == sig))
            .unwrap_or(false);
        if !found {
            drop(heap);
            return self.fail(
                ManagedError::NotFound {
                    kind: "static field",
                    name: format!("{}.{}", class, name),
                },
                "java.lang.NoSuchFieldError",
            );
        }
        let id = Heap::intern(&mut heap.field_ids, (class, name.into(), sig.into()));
        FieldId::from_raw(id).ok_or(ManagedError::Exception)
    }

    fn method_id(&self, class: ObjRef, name: &str, sig: &str) -> ManagedResult<MethodId> {
        let mut heap = self.heap();
        let class = heap.class_name(class).unwrap_or_default();
        if !heap.has_method(&class, name, sig) {
            drop(heap);
            return self.fail(
                ManagedError::NotFound {
                    kind: "method",
                    name: format!("{}.{}{}", class, name, sig),
                },
                "java.lang.NoSuchMethodError",
            );
        }
        let id = Heap::intern(&mut heap.method_ids, (class, name.into(), sig.into()));
        MethodId::from_raw(id).ok_or(ManagedError::Exception)
    }

    fn new_object(&self, class: ObjRef, ctor: MethodId, args: &[Value]) -> ManagedResult<ObjRef> {
        if !self.rt.take_budget() {
            return self.oom();
        }
        let mut heap = self.heap();
        let class = heap.class_name(class).unwrap_or_default();
        let sig = heap
            .method_ids
            .get(ctor.as_raw() - 1)
            .map(|(_, _, s)| s.clone())
            .unwrap_or_default();
        let obj = match (class.as_str(), sig.as_str(), args) {
            ("java/lang/String", _, [Value::Object(Some(bytes)), ..]) => {
                let text = match heap.deref(*bytes).and_then(|b| heap.objects.get(&b)) {
                    Some(Obj::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
                    _ => String::new(),
                };
                Obj::Str(text)
            }
            ("java/lang/Long", _, [Value::Long(v)]) => Obj::Long(*v),
            _ => Obj::Instance {
                class: class.clone(),
                fields: HashMap::new(),
            },
        };
        let id = heap.alloc(obj);
        Ok(heap.handle(id, RefKind::Local))
    }

    fn get_field(&self, obj: ObjRef, field: FieldId, kind: RetKind) -> ManagedResult<Ret> {
        self.on_heap(NPE, |heap| {
            let slot = match heap.objects.get(&heap.deref(obj)?)? {
                Obj::Instance { fields, .. } => fields.get(&field.as_raw()).copied(),
                _ => return None,
            };
            Some(heap.ret(slot, kind))
        })
    }

    fn set_field(&self, obj: ObjRef, field: FieldId, value: Value) -> ManagedResult<()> {
        self.on_heap(NPE, |heap| {
            let slot = heap.slot(value);
            let id = heap.deref(obj)?;
            match heap.objects.get_mut(&id)? {
                Obj::Instance { fields, .. } => {
                    fields.insert(field.as_raw(), slot);
                    Some(())
                }
                _ => None,
            }
        })
    }

    fn get_static_field(&self, _class: ObjRef, field: FieldId, kind: RetKind) -> ManagedResult<Ret> {
        let mut heap = self.heap();
        let is_utf8 = heap
            .field_ids
            .get(field.as_raw() - 1)
            .map(|(_, n, _)| n == "UTF_8")
            .unwrap_or(false);
        let slot = is_utf8.then_some(Slot::Obj(Some(heap.utf8)));
        Ok(heap.ret(slot, kind))
    }

    fn call_method(
        &self,
        obj: ObjRef,
        method: MethodId,
        _ret: RetKind,
        args: &[Value],
    ) -> ManagedResult<Ret> {
        let mut heap = self.heap();
        let Some(target) = heap.deref(obj) else {
            drop(heap);
            return self.dead();
        };
        let Some((_, name, sig)) = heap.method_ids.get(method.as_raw() - 1).cloned() else {
            drop(heap);
            return self.dead();
        };
        let class = heap.class_of(target);
        *heap.calls.entry((class.clone(), name.clone())).or_default() += 1;

        let body = heap.bodies.get(&(class.clone(), name.clone(), sig)).cloned();
        if let Some(body) = body {
            drop(heap);
            return match body(self, args) {
                Ok(r) => Ok(r),
                Err(msg) => {
                    if !self.exception_check() {
                        self.throw(&msg);
                    }
                    Err(ManagedError::Exception)
                }
            };
        }

        match (name.as_str(), heap.objects.get(&target).cloned()) {
            ("toString", Some(o)) => {
                let text = match o {
                    Obj::Throwable(m) | Obj::Str(m) => m,
                    Obj::Long(v) => v.to_string(),
                    _ => format!("{}@{:x}", class, target),
                };
                let s = heap.alloc(Obj::Str(text));
                Ok(Ret::Object(Some(heap.handle(s, RefKind::Local))))
            }
            ("getBytes", Some(Obj::Str(s))) => {
                let b = heap.alloc(Obj::Bytes(s.into_bytes()));
                Ok(Ret::Object(Some(heap.handle(b, RefKind::Local))))
            }
            _ => {
                drop(heap);
                self.fail(ManagedError::Exception, "java.lang.AbstractMethodError")
            }
        }
    }

    fn new_global_ref(&self, obj: ObjRef) -> ManagedResult<ObjRef> {
        let mut heap = self.heap();
        match heap.deref(obj) {
            Some(id) => Ok(heap.handle(id, RefKind::Global)),
            None => {
                drop(heap);
                self.dead()
            }
        }
    }

    fn delete_global_ref(&self, obj: ObjRef) {
        self.heap().refs.remove(&obj.as_raw());
    }

    fn new_local_ref(&self, obj: ObjRef) -> ManagedResult<ObjRef> {
        let mut heap = self.heap();
        match heap.deref(obj) {
            Some(id) => Ok(heap.handle(id, RefKind::Local)),
            None => {
                drop(heap);
                self.dead()
            }
        }
    }

    fn delete_local_ref(&self, obj: ObjRef) {
        self.heap().refs.remove(&obj.as_raw());
    }

    fn is_same_object(&self, a: Option<ObjRef>, b: Option<ObjRef>) -> bool {
        let heap = self.heap();
        a.and_then(|a| heap.deref(a)) == b.and_then(|b| heap.deref(b))
    }

    fn new_byte_array(&self, bytes: &[u8]) -> ManagedResult<ObjRef> {
        if !self.rt.take_budget() {
            return self.oom();
        }
        let mut heap = self.heap();
        let id = heap.alloc(Obj::Bytes(bytes.to_vec()));
        Ok(heap.handle(id, RefKind::Local))
    }

    fn byte_array_contents(&self, array: ObjRef) -> ManagedResult<Vec<u8>> {
        self.on_heap(NPE, |heap| match heap.objects.get(&heap.deref(array)?)? {
            Obj::Bytes(b) => Some(b.clone()),
            _ => None,
        })
    }

    fn new_object_array(&self, len: usize, _element_class: ObjRef) -> ManagedResult<ObjRef> {
        if !self.rt.take_budget() {
            return self.oom();
        }
        let mut heap = self.heap();
        let id = heap.alloc(Obj::Array(vec![None; len]));
        Ok(heap.handle(id, RefKind::Local))
    }

    fn array_length(&self, array: ObjRef) -> ManagedResult<usize> {
        self.on_heap(NPE, |heap| match heap.objects.get(&heap.deref(array)?)? {
            Obj::Array(v) => Some(v.len()),
            Obj::Bytes(b) => Some(b.len()),
            _ => None,
        })
    }

    fn set_array_element(
        &self,
        array: ObjRef,
        index: usize,
        value: Option<ObjRef>,
    ) -> ManagedResult<()> {
        self.on_heap(OUT_OF_BOUNDS, |heap| {
            let value = value.and_then(|v| heap.deref(v));
            let id = heap.deref(array)?;
            match heap.objects.get_mut(&id)? {
                Obj::Array(v) => {
                    *v.get_mut(index)? = value;
                    Some(())
                }
                _ => None,
            }
        })
    }

    fn get_array_element(&self, array: ObjRef, index: usize) -> ManagedResult<Option<ObjRef>> {
        self.on_heap(OUT_OF_BOUNDS, |heap| {
            let elem = match heap.objects.get(&heap.deref(array)?)? {
                Obj::Array(v) => *v.get(index)?,
                _ => return None,
            };
            Some(elem.map(|e| heap.handle(e, RefKind::Local)))
        })
    }

    fn exception_check(&self) -> bool {
        self.heap().pending.contains_key(&self.id.0)
    }

    fn take_exception(&self) -> Option<ObjRef> {
        let mut heap = self.heap();
        let ex = heap.pending.remove(&self.id.0)?;
        Some(heap.handle(ex, RefKind::Local))
    }

    fn fatal(&self, msg: &str) -> ! {
        panic!("fatal: {}", msg)
    }
}

// ============================================================================
// NATIVE ENGINE
// ============================================================================

/// Receiver of mock engine events; see [`BridgeDispatch`]
pub trait MockDispatch: Send + Sync {
    fn busy(&self, db: DbPtr, n: i32) -> i32;
    fn progress(&self, db: DbPtr) -> i32;
    fn commit(&self, db: DbPtr) -> i32;
    fn rollback(&self, db: DbPtr);
    fn update(&self, db: DbPtr, op: i32, db_name: &str, table: &str, rowid: i64);
    #[allow(clippy::too_many_arguments)]
    fn preupdate(&self, db: DbPtr, op: i32, db_name: &str, table: &str, key1: i64, key2: i64);
    fn trace(&self, db: DbPtr, event: TraceEvent<'_>) -> i32;
    fn authorizer(&self, db: DbPtr, action: i32, args: [Option<&str>; 4]) -> i32;
    fn collation_needed(&self, db: DbPtr, enc: i32, name: &str);
    fn collation(&self, binding: &HookSlot, a: &[u8], b: &[u8]) -> i32;
    fn collation_destroy(&self, binding: Box<HookSlot>);
    fn function(&self, binding: &UdfBinding, method: UdfMethod, ctx: ContextPtr, argv: &[ValuePtr]);
    fn function_destroy(&self, binding: Box<UdfBinding>);
    fn auto_extension(&self, db: DbPtr) -> Result<()>;
    fn log(&self, code: i32, msg: &str);
}

/// Result a UDF left on its context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResult {
    Error(String),
    NoMem,
}

#[derive(Default)]
struct MockDb {
    hooks: HashMap<HookKind, i32>,
    busy_timeout: i32,
    functions: HashMap<String, Arc<UdfBinding>>,
    collations: HashMap<String, Arc<HookSlot>>,
    main_name: Option<String>,
    errmsg: Option<String>,
    stmts: HashSet<StmtPtr>,
    zombie: bool,
}

struct MockStmt {
    db: DbPtr,
    sql: String,
    rows_left: usize,
    started: bool,
}

#[derive(Default)]
struct EngineState {
    next_ptr: usize,
    dbs: HashMap<DbPtr, MockDb>,
    stmts: HashMap<StmtPtr, MockStmt>,
    results: HashMap<ContextPtr, MockResult>,
    aggregates: HashMap<ContextPtr, i64>,
    runner_installs: usize,
    log_enabled: bool,
    shutdowns: usize,
    fail_open: Option<(i32, bool)>,
    fail_collation: Option<i32>,
    fail_set_hook: Option<i32>,
    events: Vec<String>,
}

impl EngineState {
    fn ptr(&mut self) -> usize {
        self.next_ptr += 0x10;
        0x1000 + self.next_ptr
    }
}

/// Scripted stand-in for the native library
///
/// `SELECT n` statements yield `n` rows; every other statement completes
/// on its first step. Hooks fire only once enabled through
/// [`NativeEngine::set_hook`], exactly like the real library.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<EngineState>,
    dispatch: RwLock<Option<Arc<dyn MockDispatch>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dispatcher(&self, dispatch: Arc<dyn MockDispatch>) {
        *self.dispatch.write() = Some(dispatch);
    }

    fn dispatcher(&self) -> Option<Arc<dyn MockDispatch>> {
        self.dispatch.read().clone()
    }

    /// Calls the bridge made, in order
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    /// Make the next open fail with `rc`, optionally still returning a handle
    pub fn fail_next_open(&self, rc: i32, with_handle: bool) {
        self.state.lock().fail_open = Some((rc, with_handle));
    }

    pub fn fail_next_collation(&self, rc: i32) {
        self.state.lock().fail_collation = Some(rc);
    }

    pub fn fail_next_set_hook(&self, rc: i32) {
        self.state.lock().fail_set_hook = Some(rc);
    }

    fn with_db<R>(&self, db: DbPtr, f: impl FnOnce(&MockDb) -> R) -> Option<R> {
        self.state.lock().dbs.get(&db).map(f)
    }

    pub fn is_open(&self, db: DbPtr) -> bool {
        self.with_db(db, |m| !m.zombie).unwrap_or(false)
    }

    /// Closed with `close_v2` while statements were still unfinalized
    pub fn is_zombie(&self, db: DbPtr) -> bool {
        self.with_db(db, |m| m.zombie).unwrap_or(false)
    }

    pub fn hook_enabled(&self, db: DbPtr, kind: HookKind) -> bool {
        self.hook_arg(db, kind).is_some()
    }

    pub fn hook_arg(&self, db: DbPtr, kind: HookKind) -> Option<i32> {
        self.with_db(db, |m| m.hooks.get(&kind).copied()).flatten()
    }

    pub fn busy_timeout_of(&self, db: DbPtr) -> i32 {
        self.with_db(db, |m| m.busy_timeout).unwrap_or(0)
    }

    pub fn main_db_name(&self, db: DbPtr) -> Option<String> {
        self.with_db(db, |m| m.main_name.clone()).flatten()
    }

    pub fn has_function(&self, db: DbPtr, name: &str) -> bool {
        self.with_db(db, |m| m.functions.contains_key(&name.to_lowercase()))
            .unwrap_or(false)
    }

    pub fn has_collation(&self, db: DbPtr, name: &str) -> bool {
        self.with_db(db, |m| m.collations.contains_key(name)).unwrap_or(false)
    }

    pub fn runner_installs(&self) -> usize {
        self.state.lock().runner_installs
    }

    pub fn log_enabled(&self) -> bool {
        self.state.lock().log_enabled
    }

    pub fn shutdowns(&self) -> usize {
        self.state.lock().shutdowns
    }

    pub fn result_of(&self, ctx: ContextPtr) -> Option<MockResult> {
        self.state.lock().results.get(&ctx).cloned()
    }

    // ------------------------------------------------------------------------
    // Event injection
    // ------------------------------------------------------------------------

    fn if_enabled<R>(&self, db: DbPtr, kind: HookKind, default: R, f: impl FnOnce(&dyn MockDispatch) -> R) -> R {
        if !self.hook_enabled(db, kind) {
            return default;
        }
        match self.dispatcher() {
            Some(d) => f(d.as_ref()),
            None => default,
        }
    }

    pub fn fire_busy(&self, db: DbPtr, n: i32) -> i32 {
        self.if_enabled(db, HookKind::Busy, 0, |d| d.busy(db, n))
    }

    pub fn fire_progress(&self, db: DbPtr) -> i32 {
        self.if_enabled(db, HookKind::Progress, 0, |d| d.progress(db))
    }

    /// Commit; a non-zero hook result rolls back instead
    pub fn fire_commit(&self, db: DbPtr) -> i32 {
        let rc = self.if_enabled(db, HookKind::Commit, 0, |d| d.commit(db));
        if rc != 0 {
            self.fire_rollback(db);
        }
        rc
    }

    pub fn fire_rollback(&self, db: DbPtr) {
        self.if_enabled(db, HookKind::Rollback, (), |d| d.rollback(db))
    }

    pub fn fire_update(&self, db: DbPtr, op: i32, table: &str, rowid: i64) {
        self.if_enabled(db, HookKind::PreUpdate, (), |d| {
            d.preupdate(db, op, "main", table, rowid, rowid)
        });
        self.if_enabled(db, HookKind::Update, (), |d| d.update(db, op, "main", table, rowid))
    }

    pub fn fire_authorizer(&self, db: DbPtr, action: i32, args: [Option<&str>; 4]) -> i32 {
        self.if_enabled(db, HookKind::Authorizer, codes::SQLITE_OK, |d| {
            d.authorizer(db, action, args)
        })
    }

    pub fn fire_collation_needed(&self, db: DbPtr, name: &str) {
        self.if_enabled(db, HookKind::CollationNeeded, (), |d| {
            d.collation_needed(db, SQLITE_UTF8, name)
        })
    }

    /// Compare with a registered collation; `None` if there is none
    pub fn compare(&self, db: DbPtr, collation: &str, a: &[u8], b: &[u8]) -> Option<i32> {
        let binding = self.with_db(db, |m| m.collations.get(collation).cloned())??;
        let d = self.dispatcher()?;
        Some(d.collation(&binding, a, b))
    }

    /// Fresh `sqlite3_context*` for [`MockEngine::call_function`]
    pub fn new_context(&self) -> ContextPtr {
        self.state.lock().ptr()
    }

    /// Invoke one entry point of a registered function with `argc` values
    pub fn call_function(
        &self,
        db: DbPtr,
        name: &str,
        method: UdfMethod,
        ctx: ContextPtr,
        argc: usize,
    ) -> Option<MockResult> {
        let (binding, argv) = {
            let mut st = self.state.lock();
            let binding = st
                .dbs
                .get(&db)
                .and_then(|d| d.functions.get(&name.to_lowercase()).cloned())?;
            let argv: Vec<ValuePtr> = (0..argc).map(|_| st.ptr()).collect();
            (binding, argv)
        };
        if let Some(d) = self.dispatcher() {
            d.function(&binding, method, ctx, &argv);
        }
        self.result_of(ctx)
    }

    pub fn fire_log(&self, code: i32, msg: &str) {
        if !self.log_enabled() {
            return;
        }
        if let Some(d) = self.dispatcher() {
            d.log(code, msg);
        }
    }

    fn trace(&self, db: DbPtr, event: TraceEvent<'_>) {
        let mask = self.hook_arg(db, HookKind::Trace).unwrap_or(0) as u32;
        if mask & event.mask() == 0 {
            return;
        }
        if let Some(d) = self.dispatcher() {
            d.trace(db, event);
        }
    }

    fn free_db(&self, m: MockDb) {
        self.destroy_bindings(
            m.functions.into_values().collect(),
            m.collations.into_values().collect(),
        );
    }

    fn destroy_bindings(&self, functions: Vec<Arc<UdfBinding>>, collations: Vec<Arc<HookSlot>>) {
        let Some(d) = self.dispatcher() else { return };
        for f in functions {
            if let Ok(f) = Arc::try_unwrap(f) {
                d.function_destroy(Box::new(f));
            }
        }
        for c in collations {
            if let Ok(c) = Arc::try_unwrap(c) {
                d.collation_destroy(Box::new(c));
            }
        }
    }
}

impl NativeEngine for MockEngine {
    fn open(&self, filename: &str, _flags: i32, _vfs: Option<&str>) -> (i32, DbPtr) {
        let (fail, db, runner) = {
            let mut st = self.state.lock();
            st.events.push(format!("open {}", filename));
            let fail = st.fail_open.take();
            if let Some((rc, false)) = fail {
                return (rc, 0);
            }
            let db = st.ptr();
            st.dbs.insert(db, MockDb::default());
            (fail, db, st.runner_installs > 0)
        };
        if let Some((rc, _)) = fail {
            if let Some(m) = self.state.lock().dbs.get_mut(&db) {
                m.errmsg = Some("unable to open database file".into());
            }
            return (rc, db);
        }
        if runner {
            if let Some(d) = self.dispatcher() {
                if let Err(err) = d.auto_extension(db) {
                    if let Some(m) = self.state.lock().dbs.get_mut(&db) {
                        m.errmsg = Some(err.to_string());
                    }
                    return (err.code(), db);
                }
            }
        }
        (codes::SQLITE_OK, db)
    }

    /// `close_v2` with live statements leaves a zombie that the last
    /// finalize frees
    fn close(&self, db: DbPtr, v2: bool) -> i32 {
        {
            let st = self.state.lock();
            match st.dbs.get(&db) {
                None => return codes::SQLITE_MISUSE,
                Some(m) if m.zombie => return codes::SQLITE_MISUSE,
                Some(m) if !v2 && !m.stmts.is_empty() => return codes::SQLITE_BUSY,
                Some(_) => {}
            }
        }
        self.trace(db, TraceEvent::Close);
        let removed = {
            let mut st = self.state.lock();
            st.events.push(format!("close {:#x}", db));
            match st.dbs.get_mut(&db) {
                Some(m) if !m.stmts.is_empty() => {
                    m.zombie = true;
                    None
                }
                _ => st.dbs.remove(&db),
            }
        };
        if let Some(m) = removed {
            self.free_db(m);
        }
        codes::SQLITE_OK
    }

    fn errmsg(&self, db: DbPtr) -> Option<String> {
        self.state.lock().dbs.get(&db).and_then(|d| d.errmsg.clone())
    }

    fn prepare(&self, db: DbPtr, sql: &[u8], _prep_flags: u32) -> Prepared {
        let mut st = self.state.lock();
        let sql = String::from_utf8_lossy(sql).into_owned();
        if !st.dbs.get(&db).map_or(false, |m| !m.zombie) {
            return Prepared {
                rc: codes::SQLITE_MISUSE,
                ..Prepared::default()
            };
        }
        let end = sql.find(';').map(|i| i + 1).unwrap_or(sql.len());
        let text = sql[..end].trim_end_matches(';').trim().to_string();
        if text.is_empty() {
            return Prepared {
                rc: codes::SQLITE_OK,
                stmt: 0,
                tail: end,
            };
        }
        if text.starts_with("FAIL") {
            if let Some(m) = st.dbs.get_mut(&db) {
                m.errmsg = Some(format!("near \"{}\": syntax error", text));
            }
            return Prepared {
                rc: codes::SQLITE_ERROR,
                stmt: 0,
                tail: 0,
            };
        }
        let rows = text
            .strip_prefix("SELECT ")
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0);
        let stmt = st.ptr();
        st.stmts.insert(
            stmt,
            MockStmt {
                db,
                sql: text,
                rows_left: rows,
                started: false,
            },
        );
        if let Some(m) = st.dbs.get_mut(&db) {
            m.stmts.insert(stmt);
        }
        st.events.push(format!("prepare {:#x}", stmt));
        Prepared {
            rc: codes::SQLITE_OK,
            stmt,
            tail: end,
        }
    }

    fn step(&self, stmt: StmtPtr) -> i32 {
        let (db, sql, first, row) = {
            let mut st = self.state.lock();
            let Some(s) = st.stmts.get_mut(&stmt) else {
                return codes::SQLITE_MISUSE;
            };
            let first = !s.started;
            s.started = true;
            let row = s.rows_left > 0;
            if row {
                s.rows_left -= 1;
            }
            (s.db, s.sql.clone(), first, row)
        };
        if first {
            self.trace(db, TraceEvent::Stmt { stmt, sql: &sql });
        }
        if row {
            self.trace(db, TraceEvent::Row { stmt });
            codes::SQLITE_ROW
        } else {
            self.trace(db, TraceEvent::Profile { stmt, nanos: 1_000 });
            codes::SQLITE_DONE
        }
    }

    fn finalize(&self, stmt: StmtPtr) -> i32 {
        let freed = {
            let mut st = self.state.lock();
            let Some(s) = st.stmts.remove(&stmt) else {
                return codes::SQLITE_MISUSE;
            };
            st.events.push(format!("finalize {:#x}", stmt));
            let last = match st.dbs.get_mut(&s.db) {
                Some(m) => {
                    m.stmts.remove(&stmt);
                    m.zombie && m.stmts.is_empty()
                }
                None => false,
            };
            if last {
                st.events.push(format!("free {:#x}", s.db));
                st.dbs.remove(&s.db)
            } else {
                None
            }
        };
        if let Some(m) = freed {
            self.free_db(m);
        }
        codes::SQLITE_OK
    }

    fn set_hook(&self, db: DbPtr, kind: HookKind, enable: bool, arg: i32) -> i32 {
        let mut st = self.state.lock();
        if let Some(rc) = st.fail_set_hook.take() {
            return rc;
        }
        let Some(m) = st.dbs.get_mut(&db) else {
            return codes::SQLITE_MISUSE;
        };
        if enable {
            m.hooks.insert(kind, arg);
        } else {
            m.hooks.remove(&kind);
        }
        codes::SQLITE_OK
    }

    fn busy_timeout(&self, db: DbPtr, ms: i32) -> i32 {
        let mut st = self.state.lock();
        let Some(m) = st.dbs.get_mut(&db) else {
            return codes::SQLITE_MISUSE;
        };
        m.busy_timeout = ms;
        m.hooks.remove(&HookKind::Busy);
        codes::SQLITE_OK
    }

    fn create_function(
        &self,
        db: DbPtr,
        name: &str,
        _n_arg: i32,
        _flags: i32,
        binding: Box<UdfBinding>,
    ) -> i32 {
        let outcome = {
            let mut st = self.state.lock();
            match st.dbs.get_mut(&db) {
                Some(m) if !name.is_empty() => {
                    let old = m.functions.insert(name.to_lowercase(), Arc::from(binding));
                    Ok(old)
                }
                _ => Err(binding),
            }
        };
        match outcome {
            Ok(old) => {
                self.destroy_bindings(old.into_iter().collect(), Vec::new());
                codes::SQLITE_OK
            }
            Err(binding) => {
                if let Some(d) = self.dispatcher() {
                    d.function_destroy(binding);
                }
                codes::SQLITE_MISUSE
            }
        }
    }

    fn create_collation(
        &self,
        db: DbPtr,
        name: &str,
        _enc: i32,
        binding: Box<HookSlot>,
    ) -> std::result::Result<(), (i32, Box<HookSlot>)> {
        let old = {
            let mut st = self.state.lock();
            if let Some(rc) = st.fail_collation.take() {
                return Err((rc, binding));
            }
            match st.dbs.get_mut(&db) {
                Some(m) => m.collations.insert(name.to_string(), Arc::from(binding)),
                None => return Err((codes::SQLITE_MISUSE, binding)),
            }
        };
        self.destroy_bindings(Vec::new(), old.into_iter().collect());
        Ok(())
    }

    fn result_error(&self, ctx: ContextPtr, msg: &str) {
        self.state
            .lock()
            .results
            .insert(ctx, MockResult::Error(msg.to_string()));
    }

    fn result_error_nomem(&self, ctx: ContextPtr) {
        self.state.lock().results.insert(ctx, MockResult::NoMem);
    }

    fn aggregate_context_key(&self, ctx: ContextPtr, allocate: bool) -> i64 {
        let mut st = self.state.lock();
        match st.aggregates.get(&ctx) {
            Some(k) => *k,
            None if allocate => {
                let key = st.ptr() as i64;
                st.aggregates.insert(ctx, key);
                key
            }
            None => 0,
        }
    }

    fn install_auto_extension_runner(&self) -> i32 {
        self.state.lock().runner_installs += 1;
        codes::SQLITE_OK
    }

    fn db_config_main_name(&self, db: DbPtr, name: &CStr) -> i32 {
        let mut st = self.state.lock();
        match st.dbs.get_mut(&db) {
            Some(m) => {
                m.main_name = Some(name.to_string_lossy().into_owned());
                codes::SQLITE_OK
            }
            None => codes::SQLITE_MISUSE,
        }
    }

    fn config_log(&self, enable: bool) -> i32 {
        self.state.lock().log_enabled = enable;
        codes::SQLITE_OK
    }

    fn shutdown(&self) -> i32 {
        let mut st = self.state.lock();
        st.events.push("shutdown".into());
        st.shutdowns += 1;
        codes::SQLITE_OK
    }
}

// ============================================================================
// WIRING
// ============================================================================

/// Routes engine events to a bridge on the calling thread's environment
pub struct BridgeDispatch {
    bridge: Weak<Bridge<MockEngine>>,
    rt: MockRuntime,
}

impl BridgeDispatch {
    fn with<R>(&self, default: R, f: impl FnOnce(&Bridge<MockEngine>, &MockEnv) -> R) -> R {
        match self.bridge.upgrade() {
            Some(bridge) => f(&bridge, &self.rt.attach()),
            None => default,
        }
    }
}

impl MockDispatch for BridgeDispatch {
    fn busy(&self, db: DbPtr, n: i32) -> i32 {
        self.with(0, |b, env| b.on_busy(env, db, n))
    }

    fn progress(&self, db: DbPtr) -> i32 {
        self.with(0, |b, env| b.on_progress(env, db))
    }

    fn commit(&self, db: DbPtr) -> i32 {
        self.with(0, |b, env| b.on_commit(env, db))
    }

    fn rollback(&self, db: DbPtr) {
        self.with((), |b, env| b.on_rollback(env, db))
    }

    fn update(&self, db: DbPtr, op: i32, db_name: &str, table: &str, rowid: i64) {
        self.with((), |b, env| b.on_update(env, db, op, db_name, table, rowid))
    }

    fn preupdate(&self, db: DbPtr, op: i32, db_name: &str, table: &str, key1: i64, key2: i64) {
        self.with((), |b, env| {
            b.on_preupdate(env, db, op, db_name, table, key1, key2)
        })
    }

    fn trace(&self, db: DbPtr, event: TraceEvent<'_>) -> i32 {
        self.with(0, |b, env| b.on_trace(env, db, event))
    }

    fn authorizer(&self, db: DbPtr, action: i32, args: [Option<&str>; 4]) -> i32 {
        self.with(codes::SQLITE_OK, |b, env| b.on_authorizer(env, db, action, args))
    }

    fn collation_needed(&self, db: DbPtr, enc: i32, name: &str) {
        self.with((), |b, env| b.on_collation_needed(env, db, enc, name))
    }

    fn collation(&self, binding: &HookSlot, a: &[u8], bytes: &[u8]) -> i32 {
        self.with(0, |b, env| b.on_collation(env, binding, a, bytes))
    }

    fn collation_destroy(&self, binding: Box<HookSlot>) {
        let env = self.rt.attach();
        match self.bridge.upgrade() {
            Some(b) => b.on_collation_destroy(&env, binding),
            None => drop(binding),
        }
    }

    fn function(&self, binding: &UdfBinding, method: UdfMethod, ctx: ContextPtr, argv: &[ValuePtr]) {
        self.with((), |b, env| b.on_function(env, binding, method, ctx, argv))
    }

    fn function_destroy(&self, binding: Box<UdfBinding>) {
        let env = self.rt.attach();
        match self.bridge.upgrade() {
            Some(b) => b.on_function_destroy(&env, binding),
            None => drop(binding),
        }
    }

    fn auto_extension(&self, db: DbPtr) -> Result<()> {
        self.with(Ok(()), |b, env| b.on_auto_extension(env, db))
    }

    fn log(&self, code: i32, msg: &str) {
        self.with((), |b, env| b.on_config_log(env, code, msg))
    }
}

/// A bridge over a mock engine and a mock runtime, wired together
pub struct Fixture {
    pub rt: MockRuntime,
    pub bridge: Arc<Bridge<MockEngine>>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        let rt = MockRuntime::new();
        let bridge = Arc::new(Bridge::new(MockEngine::new(), BridgeConfig::default()));
        bridge.engine().set_dispatcher(Arc::new(BridgeDispatch {
            bridge: Arc::downgrade(&bridge),
            rt: rt.clone(),
        }));
        Fixture { rt, bridge }
    }

    pub fn engine(&self) -> &MockEngine {
        self.bridge.engine()
    }

    fn class(&self, simple: &str) -> String {
        self.bridge.config().class_name(simple)
    }

    /// Open `name`; returns the result code and the connection wrapper
    pub fn open(&self, env: &MockEnv, name: &str) -> (i32, Option<ObjRef>) {
        let out = env.alloc_plain(&self.class("OutputPointer$sqlite3"));
        let filename = env.new_string(name);
        let rc = self.bridge.open(env, Some(filename), 0x06, None, Some(out));
        let db = self
            .bridge
            .metadata()
            .read_output(env, HandleKind::OutConnection, out)
            .and_then(Ret::as_object);
        (rc, db)
    }

    /// Prepare `sql`; returns the result code and the statement wrapper
    pub fn prepare(&self, env: &MockEnv, db: ObjRef, sql: &str) -> (i32, Option<ObjRef>) {
        let out = env.alloc_plain(&self.class("OutputPointer$sqlite3_stmt"));
        let Ok(sql) = env.new_byte_array(sql.as_bytes()) else {
            env.clear_exception();
            return (codes::SQLITE_NOMEM, None);
        };
        let rc = self
            .bridge
            .prepare(env, Some(db), Some(sql), 0, Some(out), None);
        let stmt = self
            .bridge
            .metadata()
            .read_output(env, HandleKind::OutStatement, out)
            .and_then(Ret::as_object);
        (rc, stmt)
    }

    /// Native address held by a connection wrapper
    pub fn db_ptr(&self, env: &MockEnv, db: ObjRef) -> DbPtr {
        self.bridge
            .metadata()
            .read_address(env, Some(db), HandleKind::Connection)
    }

    /// Native address held by a statement wrapper
    pub fn stmt_ptr(&self, env: &MockEnv, stmt: ObjRef) -> StmtPtr {
        self.bridge
            .metadata()
            .read_address(env, Some(stmt), HandleKind::Statement)
    }

    pub fn hook_sig(&self, kind: HookKind) -> String {
        kind.signature(self.bridge.config())
    }
}
