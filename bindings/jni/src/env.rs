//! [`ManagedEnv`] over the `jni` crate's [`JNIEnv`]
//!
//! Handles cross the trait as raw pointers. They are rewrapped as
//! [`JObject`]s for each call; wrapping never takes ownership, so the
//! reference's lifetime stays with whoever created it.

use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::sync::Arc;

use jni::errors::Error as JniError;
use jni::objects::{
    GlobalRef, JByteArray, JClass, JFieldID, JMethodID, JObject, JObjectArray, JStaticFieldID,
    JValueOwned,
};
use jni::signature::{JavaType, Primitive, ReturnType};
use jni::JNIEnv;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use sqlbridge_core::runtime::{FieldId, ManagedResult, MethodId};
use sqlbridge_core::{log_error, EnvId, ManagedEnv, ManagedError, ObjRef, RefReleaser, Ret, RetKind, Value};

lazy_static! {
    /// Global references handed to the core, keyed by raw handle
    ///
    /// Dropping a [`GlobalRef`] deletes it through its VM, from any thread.
    static ref GLOBALS: Mutex<HashMap<usize, GlobalRef>> = Mutex::new(HashMap::new());
}

/// Delete a global reference created by [`JniEnv::new_global_ref`]
pub(crate) fn release_global(obj: ObjRef) {
    let released = GLOBALS.lock().remove(&obj.as_raw());
    if released.is_none() {
        log_error!("global reference {:#x} is not live", obj.as_raw());
    }
}

fn object<'a>(obj: ObjRef) -> JObject<'a> {
    unsafe { JObject::from_raw(obj.as_raw() as _) }
}

fn object_or_null<'a>(obj: Option<ObjRef>) -> JObject<'a> {
    match obj {
        Some(obj) => object(obj),
        None => JObject::null(),
    }
}

fn class<'a>(class: ObjRef) -> JClass<'a> {
    unsafe { JClass::from_raw(class.as_raw() as _) }
}

fn object_array<'a>(array: ObjRef) -> JObjectArray<'a> {
    unsafe { JObjectArray::from_raw(array.as_raw() as _) }
}

fn handle(obj: &JObject) -> Option<ObjRef> {
    ObjRef::from_raw(obj.as_raw() as usize)
}

fn argument<'a>(value: &Value) -> JValueOwned<'a> {
    match *value {
        Value::Bool(b) => JValueOwned::Bool(u8::from(b)),
        Value::Int(i) => JValueOwned::Int(i),
        Value::Long(j) => JValueOwned::Long(j),
        Value::Object(o) => JValueOwned::Object(object_or_null(o)),
    }
}

fn return_type(kind: RetKind) -> ReturnType {
    match kind {
        RetKind::Void => ReturnType::Primitive(Primitive::Void),
        RetKind::Bool => ReturnType::Primitive(Primitive::Boolean),
        RetKind::Int => ReturnType::Primitive(Primitive::Int),
        RetKind::Long => ReturnType::Primitive(Primitive::Long),
        RetKind::Object => ReturnType::Object,
    }
}

fn unpack(value: JValueOwned, kind: RetKind) -> jni::errors::Result<Ret> {
    Ok(match kind {
        RetKind::Void => Ret::Void,
        RetKind::Bool => Ret::Bool(value.z()?),
        RetKind::Int => Ret::Int(value.i()?),
        RetKind::Long => Ret::Long(value.j()?),
        RetKind::Object => Ret::Object(handle(&value.l()?)),
    })
}

/// A failed call; the managed exception, if any, stays pending
fn thrown(err: JniError) -> ManagedError {
    if !matches!(err, JniError::JavaException) {
        log_error!("JNI call failed: {}", err);
    }
    ManagedError::Exception
}

/// A failed allocation; the runtime reports exhaustion as a null result
fn exhausted(_: JniError) -> ManagedError {
    ManagedError::OutOfMemory
}

fn not_found(kind: &'static str, name: &str, sig: &str) -> ManagedError {
    ManagedError::NotFound {
        kind,
        name: format!("{}{}", name, sig),
    }
}

/// One attached thread's environment
pub struct JniEnv<'local> {
    env: RefCell<JNIEnv<'local>>,
}

impl<'local> JniEnv<'local> {
    pub fn new(env: JNIEnv<'local>) -> JniEnv<'local> {
        JniEnv {
            env: RefCell::new(env),
        }
    }

    fn env(&self) -> RefMut<'_, JNIEnv<'local>> {
        self.env.borrow_mut()
    }
}

impl ManagedEnv for JniEnv<'_> {
    fn id(&self) -> EnvId {
        EnvId(self.env.borrow().get_raw() as usize)
    }

    fn releaser(&self) -> Arc<dyn RefReleaser> {
        crate::vm::releaser()
    }

    fn find_class(&self, name: &str) -> ManagedResult<ObjRef> {
        let found = self.env().find_class(name);
        found
            .ok()
            .and_then(|class| handle(&class))
            .ok_or_else(|| not_found("class", name, ""))
    }

    fn object_class(&self, obj: ObjRef) -> ManagedResult<ObjRef> {
        let class = self.env().get_object_class(&object(obj)).map_err(thrown)?;
        handle(&class).ok_or(ManagedError::Exception)
    }

    fn field_id(&self, class_ref: ObjRef, name: &str, sig: &str) -> ManagedResult<FieldId> {
        let id = self
            .env()
            .get_field_id(&class(class_ref), name, sig)
            .map_err(|_| not_found("field", name, sig))?;
        FieldId::from_raw(id.into_raw() as usize).ok_or_else(|| not_found("field", name, sig))
    }

    fn static_field_id(&self, class_ref: ObjRef, name: &str, sig: &str) -> ManagedResult<FieldId> {
        let id = self
            .env()
            .get_static_field_id(&class(class_ref), name, sig)
            .map_err(|_| not_found("static field", name, sig))?;
        FieldId::from_raw(id.into_raw() as usize)
            .ok_or_else(|| not_found("static field", name, sig))
    }

    fn method_id(&self, class_ref: ObjRef, name: &str, sig: &str) -> ManagedResult<MethodId> {
        let id = self
            .env()
            .get_method_id(&class(class_ref), name, sig)
            .map_err(|_| not_found("method", name, sig))?;
        MethodId::from_raw(id.into_raw() as usize).ok_or_else(|| not_found("method", name, sig))
    }

    fn new_object(&self, class_ref: ObjRef, ctor: MethodId, args: &[Value]) -> ManagedResult<ObjRef> {
        let args: Vec<JValueOwned> = args.iter().map(argument).collect();
        let raw: Vec<_> = args.iter().map(|a| a.borrow().as_jni()).collect();
        let obj = unsafe {
            let ctor = JMethodID::from_raw(ctor.as_raw() as _);
            self.env().new_object_unchecked(&class(class_ref), ctor, &raw)
        }
        .map_err(exhausted)?;
        handle(&obj).ok_or(ManagedError::OutOfMemory)
    }

    fn get_field(&self, obj: ObjRef, field: FieldId, kind: RetKind) -> ManagedResult<Ret> {
        if kind == RetKind::Void {
            return Ok(Ret::Void);
        }
        let value = unsafe {
            let field = JFieldID::from_raw(field.as_raw() as _);
            self.env().get_field_unchecked(&object(obj), field, return_type(kind))
        }
        .map_err(thrown)?;
        unpack(value, kind).map_err(thrown)
    }

    fn set_field(&self, obj: ObjRef, field: FieldId, value: Value) -> ManagedResult<()> {
        let value = argument(&value);
        unsafe {
            let field = JFieldID::from_raw(field.as_raw() as _);
            self.env().set_field_unchecked(&object(obj), field, value.borrow())
        }
        .map_err(thrown)
    }

    fn get_static_field(&self, class_ref: ObjRef, field: FieldId, kind: RetKind) -> ManagedResult<Ret> {
        let ty = match kind {
            RetKind::Void => return Ok(Ret::Void),
            RetKind::Bool => JavaType::Primitive(Primitive::Boolean),
            RetKind::Int => JavaType::Primitive(Primitive::Int),
            RetKind::Long => JavaType::Primitive(Primitive::Long),
            RetKind::Object => JavaType::Object(String::from("java/lang/Object")),
        };
        let value = unsafe {
            let field = JStaticFieldID::from_raw(field.as_raw() as _);
            self.env().get_static_field_unchecked(&class(class_ref), field, ty)
        }
        .map_err(thrown)?;
        unpack(value, kind).map_err(thrown)
    }

    fn call_method(
        &self,
        obj: ObjRef,
        method: MethodId,
        ret: RetKind,
        args: &[Value],
    ) -> ManagedResult<Ret> {
        let args: Vec<JValueOwned> = args.iter().map(argument).collect();
        let raw: Vec<_> = args.iter().map(|a| a.borrow().as_jni()).collect();
        let value = unsafe {
            let method = JMethodID::from_raw(method.as_raw() as _);
            self.env()
                .call_method_unchecked(&object(obj), method, return_type(ret), &raw)
        }
        .map_err(thrown)?;
        unpack(value, ret).map_err(thrown)
    }

    fn new_global_ref(&self, obj: ObjRef) -> ManagedResult<ObjRef> {
        let global = self.env().new_global_ref(&object(obj)).map_err(exhausted)?;
        let raw = handle(global.as_obj()).ok_or(ManagedError::OutOfMemory)?;
        GLOBALS.lock().insert(raw.as_raw(), global);
        Ok(raw)
    }

    fn delete_global_ref(&self, obj: ObjRef) {
        release_global(obj);
    }

    fn new_local_ref(&self, obj: ObjRef) -> ManagedResult<ObjRef> {
        let local = self.env().new_local_ref(&object(obj)).map_err(exhausted)?;
        handle(&local).ok_or(ManagedError::OutOfMemory)
    }

    fn delete_local_ref(&self, obj: ObjRef) {
        if let Err(err) = self.env().delete_local_ref(object(obj)) {
            log_error!("cannot delete local reference: {}", err);
        }
    }

    fn is_same_object(&self, a: Option<ObjRef>, b: Option<ObjRef>) -> bool {
        self.env()
            .is_same_object(&object_or_null(a), &object_or_null(b))
            .unwrap_or(false)
    }

    fn new_byte_array(&self, bytes: &[u8]) -> ManagedResult<ObjRef> {
        i32::try_from(bytes.len()).map_err(|_| ManagedError::OutOfMemory)?;
        let array = self.env().byte_array_from_slice(bytes).map_err(exhausted)?;
        handle(&array).ok_or(ManagedError::OutOfMemory)
    }

    fn byte_array_contents(&self, array: ObjRef) -> ManagedResult<Vec<u8>> {
        let array = unsafe { JByteArray::from_raw(array.as_raw() as _) };
        self.env().convert_byte_array(array).map_err(thrown)
    }

    fn new_object_array(&self, len: usize, element_class: ObjRef) -> ManagedResult<ObjRef> {
        let len = i32::try_from(len).map_err(|_| ManagedError::OutOfMemory)?;
        let array = self
            .env()
            .new_object_array(len, &class(element_class), JObject::null())
            .map_err(exhausted)?;
        handle(&array).ok_or(ManagedError::OutOfMemory)
    }

    fn array_length(&self, array: ObjRef) -> ManagedResult<usize> {
        let len = self
            .env()
            .get_array_length(&object_array(array))
            .map_err(thrown)?;
        Ok(len.max(0) as usize)
    }

    fn set_array_element(
        &self,
        array: ObjRef,
        index: usize,
        value: Option<ObjRef>,
    ) -> ManagedResult<()> {
        self.env()
            .set_object_array_element(&object_array(array), index as i32, &object_or_null(value))
            .map_err(thrown)
    }

    fn get_array_element(&self, array: ObjRef, index: usize) -> ManagedResult<Option<ObjRef>> {
        let element = self
            .env()
            .get_object_array_element(&object_array(array), index as i32)
            .map_err(thrown)?;
        Ok(handle(&element))
    }

    fn exception_check(&self) -> bool {
        self.env().exception_check().unwrap_or(false)
    }

    fn take_exception(&self) -> Option<ObjRef> {
        let mut env = self.env();
        let ex = env.exception_occurred().ok()?;
        let ex = handle(&ex)?;
        if let Err(err) = env.exception_clear() {
            log_error!("cannot clear pending exception: {}", err);
        }
        Some(ex)
    }

    fn fatal(&self, msg: &str) -> ! {
        log_error!("fatal: {}", msg);
        self.env.borrow().fatal_error(msg)
    }
}
