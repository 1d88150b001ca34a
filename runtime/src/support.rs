//! Runtime support: the entry points behind the intrinsic symbols, and the
//! class-initialisation state machine.
//!
//! Guest failures come back as `Err(VmError::Exception(..))`; the engine
//! materialises them into the calling thread's pending-exception slot, which
//! generated code checks after every throwing call.

use crate::error::{ExceptionKind, GuestException, VmError};
use crate::heap::GcRef;
use crate::intrinsics::RuntimeFn;
use crate::ir::MemShape;
use crate::keys::{ClassId, EnvelopeId, MethodId, ThreadId};
use crate::rt::ClassState;
use crate::ty::ValueShape;
use crate::vm::{PENDING_TOKEN_BIT, Value, VirtualMachine};
use crate::thread::VmThread;
use crate::{build_exception, debug_log, throw_exception};
use lasso::Key;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Condvar, Mutex};

fn class_from_word(word: u64) -> Result<ClassId, VmError> {
    ClassId::from_raw(word as u32)
        .ok_or(VmError::ResolutionState("null class token in generated code"))
}

fn method_from_word(word: u64) -> Result<MethodId, VmError> {
    MethodId::from_raw(word as u32)
        .ok_or(VmError::ResolutionState("null method token in generated code"))
}

/// `allocate(size, vt)`: GC allocation; zero-slot classes share a canonical
/// singleton, classes with a destructor register for finalisation.
pub fn allocate(vm: &VirtualMachine, size: i64, class_word: u64) -> Result<Value, VmError> {
    let class_id = class_from_word(class_word)?;
    let has_destructor = {
        let registry = vm.registry_read();
        registry
            .get_class(class_id)
            .vt()
            .is_some_and(|vt| vt.destructor.is_some())
    };
    let mut heap = vm.heap_write();
    let obj = if size as usize <= crate::heap::OBJECT_HEADER_SIZE {
        heap.singleton_instance(class_id)?
    } else {
        heap.alloc_instance(class_id, size as usize)?
    };
    if has_destructor {
        heap.add_finalization_candidate(obj);
    }
    Ok(Value::Ref(obj))
}

pub fn allocate_array(
    vm: &VirtualMachine,
    class_word: u64,
    length: i32,
) -> Result<Value, VmError> {
    if length < 0 {
        throw_exception!(NegativeArraySizeException, format!("{length}"));
    }
    let class_id = class_from_word(class_word)?;
    let elem = {
        let registry = vm.registry_read();
        let array = registry.get_class(class_id).as_array()?;
        match array.element_shape() {
            ValueShape::Ref => MemShape::Ref,
            _ => prim_mem_shape(array.element_primitive.expect("primitive element")),
        }
    };
    let obj = vm.heap_write().alloc_array(class_id, elem, length as usize)?;
    Ok(Value::Ref(obj))
}

fn prim_mem_shape(kind: crate::ty::PrimitiveKind) -> MemShape {
    use crate::ty::PrimitiveKind::*;
    match kind {
        Bool | Byte => MemShape::I8,
        Short => MemShape::I16,
        Char => MemShape::U16,
        Int => MemShape::I32,
        Long => MemShape::I64,
        Float => MemShape::F32,
        Double => MemShape::F64,
    }
}

/// Variadic multi-dimensional allocation, validating every dimension.
pub fn array_multi_new(
    vm: &VirtualMachine,
    class_word: u64,
    dims: &[i32],
) -> Result<Value, VmError> {
    if dims.is_empty() {
        return Err(VmError::ResolutionState("multianewarray with no dimensions"));
    }
    for &dim in dims {
        if dim < 0 {
            throw_exception!(NegativeArraySizeException, format!("{dim}"));
        }
    }
    let class_id = class_from_word(class_word)?;
    multi_new(vm, class_id, dims)
}

fn multi_new(vm: &VirtualMachine, class_id: ClassId, dims: &[i32]) -> Result<Value, VmError> {
    let outer = allocate_array(vm, u64::from(class_id.raw()), dims[0])?;
    if dims.len() > 1 {
        let element_class = {
            let registry = vm.registry_read();
            registry
                .get_class(class_id)
                .as_array()?
                .element_class
                .ok_or(VmError::ResolutionState("inner dimension of a primitive array"))?
        };
        let outer_ref = outer.as_ref()?;
        for index in 0..dims[0] as usize {
            let inner = multi_new(vm, element_class, &dims[1..])?;
            let mut heap = vm.heap_write();
            let (offset, shape) = heap.array_elem_offset(outer_ref, index)?;
            heap.write(outer_ref, offset, shape, inner)?;
        }
    }
    Ok(outer)
}

/// Unchecked length load; the surrounding null check is the translator's.
pub fn array_length(vm: &VirtualMachine, array: GcRef) -> Result<Value, VmError> {
    Ok(Value::Int(vm.heap_read().array_length(array)?))
}

pub fn monitor_enter(
    vm: &VirtualMachine,
    thread: ThreadId,
    obj: GcRef,
) -> Result<(), VmError> {
    if obj == 0 {
        throw_exception!(NullPointerException);
    }
    let word = lock_word_of(vm, obj)?;
    vm.locks.monitor_enter(word, thread)
}

pub fn monitor_exit(vm: &VirtualMachine, thread: ThreadId, obj: GcRef) -> Result<(), VmError> {
    if obj == 0 {
        throw_exception!(NullPointerException);
    }
    let word = lock_word_of(vm, obj)?;
    vm.locks.monitor_exit(word, thread)
}

fn lock_word_of(vm: &VirtualMachine, obj: GcRef) -> Result<&'static AtomicU64, VmError> {
    let heap = vm.heap_read();
    let word = heap.lock_word(obj)?;
    // The segment is mapped for the VM's whole lifetime and never moves, so
    // the atomic may outlive the guard; blocking while holding the heap lock
    // would deadlock against allocation.
    Ok(unsafe { &*(word as *const AtomicU64) })
}

/// Array-store check for reference arrays: the stored element's class must
/// be assignable to the array's element class.
pub fn array_store_check(
    vm: &VirtualMachine,
    array: GcRef,
    value: GcRef,
) -> Result<(), VmError> {
    if value == 0 {
        return Ok(());
    }
    let registry = vm.registry_read();
    let heap = vm.heap_read();
    let array_class = heap.class_of(array)?;
    let value_class = heap.class_of(value)?;
    let element = registry
        .get_class(array_class)
        .as_array()?
        .element_class
        .ok_or(VmError::ResolutionState("reference store into a primitive array"))?;
    if !registry.assignable_from(element, value_class) {
        throw_exception!(ArrayStoreException);
    }
    Ok(())
}

// ---- class initialisation ------------------------------------------------

/// Per-class initialisation ownership. One table entry per class in flight;
/// waiters park on the shared condition until the owner finishes.
#[derive(Default)]
pub struct InitTable {
    owners: Mutex<HashMap<ClassId, ThreadId>>,
    done: Condvar,
}

/// Runs the class initialiser exactly once. Re-entrance by the owning
/// thread returns immediately; failure marks the class `Erroneous` and the
/// stored error is re-raised on every later use.
pub fn initialise_class(
    vm: &VirtualMachine,
    thread: &VmThread,
    class_id: ClassId,
) -> Result<(), VmError> {
    loop {
        let state = match vm.registry_read().get_class(class_id).base() {
            Some(base) => base.state(),
            None => return Ok(()), // primitive classes have no initialiser
        };
        match state {
            ClassState::Ready => return Ok(()),
            ClassState::Erroneous => {
                let stored = vm
                    .registry_read()
                    .get_class(class_id)
                    .base()
                    .and_then(|b| b.init_error().cloned())
                    .unwrap_or_else(|| GuestException::new(ExceptionKind::NoClassDefFoundError));
                return Err(VmError::Exception(
                    GuestException::new(ExceptionKind::NoClassDefFoundError).caused_by(stored),
                ));
            }
            ClassState::Hashed | ClassState::Loaded | ClassState::Resolving => {
                vm.resolve_existing(class_id)?;
            }
            ClassState::Resolved => {
                let claimed = {
                    let mut owners = vm.init.owners.lock().unwrap();
                    let current_owner = owners.get(&class_id).copied();
                    if let Some(owner) = current_owner {
                        if owner == thread.id {
                            return Ok(());
                        }
                        let _guard = vm.init.done.wait(owners).unwrap();
                        continue;
                    }
                    let base_claimed = vm
                        .registry_read()
                        .get_class(class_id)
                        .base()
                        .map(|b| b.try_transition(ClassState::Resolved, ClassState::Initialising))
                        .unwrap_or(false);
                    if base_claimed {
                        owners.insert(class_id, thread.id);
                    }
                    base_claimed
                };
                if !claimed {
                    continue;
                }
                let result = run_initialiser(vm, thread, class_id);
                {
                    let mut owners = vm.init.owners.lock().unwrap();
                    owners.remove(&class_id);
                    let base_state = if result.is_ok() {
                        ClassState::Ready
                    } else {
                        ClassState::Erroneous
                    };
                    if let Some(base) = vm.registry_read().get_class(class_id).base() {
                        if let Err(error) = &result {
                            base.set_init_error(to_guest(error));
                        }
                        base.set_state(base_state);
                    }
                    vm.init.done.notify_all();
                }
                return result.map_err(|e| {
                    VmError::Exception(
                        GuestException::new(ExceptionKind::ExceptionInInitializerError)
                            .caused_by(to_guest(&e)),
                    )
                });
            }
            ClassState::Initialising => {
                let owners = vm.init.owners.lock().unwrap();
                if owners.get(&class_id) == Some(&thread.id) {
                    return Ok(());
                }
                let _guard = vm.init.done.wait(owners).unwrap();
            }
        }
    }
}

fn to_guest(error: &VmError) -> GuestException {
    match error {
        VmError::Exception(ge) => ge.clone(),
        VmError::Thrown(_) => GuestException::with_message(
            ExceptionKind::ExceptionInInitializerError,
            "class initialiser threw",
        ),
        other => GuestException::with_message(ExceptionKind::InternalError, format!("{other}")),
    }
}

fn run_initialiser(
    vm: &VirtualMachine,
    thread: &VmThread,
    class_id: ClassId,
) -> Result<(), VmError> {
    let (super_id, interfaces, clinit) = {
        let registry = vm.registry_read();
        let entity = registry.get_class(class_id);
        let base = entity.base().expect("resolved class");
        let interfaces = base.interfaces().map(<[ClassId]>::to_vec).unwrap_or_default();
        (base.super_id, interfaces, base.clinit())
    };
    if let Some(super_id) = super_id {
        initialise_class(vm, thread, super_id)?;
    }
    for interface_id in interfaces {
        let has_clinit = {
            let registry = vm.registry_read();
            registry
                .get_class(interface_id)
                .base()
                .is_some_and(|b| b.clinit().is_some())
        };
        if has_clinit {
            initialise_class(vm, thread, interface_id)?;
        }
    }
    if let Some(clinit) = clinit {
        debug_log!("running class initialiser of class {:?}", class_id);
        vm.engine.call_method(vm, thread, clinit, &[])?;
    }
    Ok(())
}

// ---- resolution stubs and dispatch caches --------------------------------

/// Demand-loads a stub's target and returns its code word; the stub then
/// tail-calls it. Never initialises — that is the init-check's job.
pub fn resolve_stub(
    vm: &VirtualMachine,
    thread: &VmThread,
    token: u64,
    want_static: bool,
) -> Result<Value, VmError> {
    let method_id = if token & PENDING_TOKEN_BIT != 0 {
        let pending = vm.pending_ref(token)?;
        let class_id = vm.resolve_class(pending.loader, pending.class)?;
        let method_id = vm
            .registry_read()
            .lookup_method(class_id, pending.key, want_static, true)?
            .expect("lookup with throw=true returns Some");
        // Static targets resolved through a callback never met the
        // translator's init check, so initialisation happens here.
        if want_static {
            initialise_class(vm, thread, class_id)?;
        }
        method_id
    } else {
        method_from_word(token)?
    };
    let code = vm.jit.materialise(vm, method_id)?;
    Ok(Value::Long(u64::from(code.raw()) as i64))
}

/// The inline-cache miss path: walk the envelope, MRU-move hits, resolve
/// through the class model otherwise. Returns the packed entry word.
pub fn virtual_lookup(
    vm: &VirtualMachine,
    envelope_word: u64,
    receiver: GcRef,
) -> Result<Value, VmError> {
    if receiver == 0 {
        throw_exception!(NullPointerException);
    }
    let envelope_id = EnvelopeId::from_raw(envelope_word as u32)
        .ok_or(VmError::ResolutionState("null envelope token"))?;
    let envelope = vm.envelopes.get(envelope_id);
    let receiver_class = vm.heap_read().class_of(receiver)?;
    let node = envelope.lookup_or_insert(receiver_class, |original| {
        let (key, boxed) = {
            let registry = vm.registry_read();
            let original = registry.get_method(original);
            let boxed = registry
                .get_class(receiver_class)
                .base()
                .is_some_and(|b| b.value_class);
            (original.key(), boxed)
        };
        let target = vm
            .registry_read()
            .lookup_method(receiver_class, key, false, true)?
            .expect("lookup with throw=true returns Some");
        let code = vm.jit.materialise(vm, target)?;
        Ok((code, boxed))
    })?;
    Ok(Value::Long(node.entry_word() as i64))
}

/// IMT-miss fallback: plain `lookup_method` on the receiver's class.
pub fn interface_lookup(
    vm: &VirtualMachine,
    receiver: GcRef,
    method_token: u64,
) -> Result<Value, VmError> {
    if receiver == 0 {
        throw_exception!(NullPointerException);
    }
    let interface_method = method_from_word(method_token)?;
    let receiver_class = vm.heap_read().class_of(receiver)?;
    let key = vm.registry_read().get_method(interface_method).key();
    let target = vm
        .registry_read()
        .lookup_method(receiver_class, key, false, true)?
        .expect("lookup with throw=true returns Some");
    if vm.registry_read().get_method(target).is_abstract() {
        let (key, class_sym) = {
            let registry = vm.registry_read();
            (key, registry.get_class(receiver_class).name())
        };
        throw_exception!(AbstractMethodError, method_key: key, class_sym: class_sym);
    }
    let code = vm.jit.materialise(vm, target)?;
    Ok(Value::Long(u64::from(code.raw()) as i64))
}

pub fn instance_of(vm: &VirtualMachine, obj: GcRef, class_word: u64) -> Result<Value, VmError> {
    if obj == 0 {
        return Ok(Value::Int(0));
    }
    let target = class_from_word(class_word)?;
    let source = vm.heap_read().class_of(obj)?;
    Ok(Value::Int(i32::from(vm.registry_read().instance_of(source, target))))
}

pub fn class_lookup(vm: &VirtualMachine, name_token: u64) -> Result<Value, VmError> {
    let sym = crate::keys::Symbol::try_from_usize(name_token as usize)
        .ok_or(VmError::ResolutionState("bad class-name token"))?;
    let class_id = vm.resolve_class(crate::rt::registry::BOOT_LOADER, sym)?;
    Ok(Value::Long(u64::from(class_id.raw()) as i64))
}

pub fn string_lookup(vm: &VirtualMachine, name_token: u64) -> Result<Value, VmError> {
    let sym = crate::keys::Symbol::try_from_usize(name_token as usize)
        .ok_or(VmError::ResolutionState("bad string token"))?;
    Ok(Value::Ref(vm.intern_string(sym)?))
}

pub fn get_array_class(vm: &VirtualMachine, element_word: u64) -> Result<Value, VmError> {
    let element = class_from_word(element_word)?;
    let name = {
        let registry = vm.registry_read();
        match registry.get_class(element) {
            crate::rt::ClassEntity::Primitive(p) => {
                format!("[{}", p.kind.descriptor_char())
            }
            entity => {
                let element_name = registry.interner().resolve(&entity.name());
                if element_name.starts_with('[') {
                    format!("[{element_name}")
                } else {
                    format!("[L{element_name};")
                }
            }
        }
    };
    let sym = vm.interner().get_or_intern(&name);
    let class_id = {
        let mut registry = vm.registry_write();
        registry.get_or_load(crate::rt::registry::BOOT_LOADER, sym)?
    };
    Ok(Value::Long(u64::from(class_id.raw()) as i64))
}

// ---- intrinsic dispatch ---------------------------------------------------

/// The engine's linkage to the runtime: one entry per named symbol.
pub fn dispatch(
    vm: &VirtualMachine,
    thread: &VmThread,
    f: RuntimeFn,
    args: &[Value],
) -> Result<Option<Value>, VmError> {
    match f {
        RuntimeFn::Allocate => Ok(Some(allocate(vm, args[0].as_long()?, args[1].as_word()?)?)),
        RuntimeFn::AllocateArray => Ok(Some(allocate_array(
            vm,
            args[0].as_word()?,
            args[1].as_int()?,
        )?)),
        RuntimeFn::ArrayMultiNew => {
            let dims: Vec<i32> = args[1..]
                .iter()
                .map(Value::as_int)
                .collect::<Result<_, _>>()?;
            Ok(Some(array_multi_new(vm, args[0].as_word()?, &dims)?))
        }
        RuntimeFn::ArrayLength => Ok(Some(array_length(vm, args[0].as_ref()?)?)),
        RuntimeFn::InitialisationCheck
        | RuntimeFn::ForceInitialisationCheck
        | RuntimeFn::InitialiseClass => {
            let class_id = class_from_word(args[0].as_word()?)?;
            initialise_class(vm, thread, class_id)?;
            Ok(None)
        }
        RuntimeFn::MonitorEnter => {
            monitor_enter(vm, thread.id, args[0].as_ref()?)?;
            Ok(None)
        }
        RuntimeFn::MonitorExit => {
            monitor_exit(vm, thread.id, args[0].as_ref()?)?;
            Ok(None)
        }
        RuntimeFn::ThrowException => {
            let obj = args[0].as_ref()?;
            if obj == 0 {
                throw_exception!(NullPointerException);
            }
            thread.set_pending_exception(obj);
            Ok(None)
        }
        RuntimeFn::NullPointerException => Err(build_exception!(NullPointerException)),
        RuntimeFn::IndexOutOfBounds => {
            let index = args[1].as_int()?;
            let length = vm.heap_read().array_length(args[0].as_ref()?)?;
            Err(build_exception!(
                ArrayIndexOutOfBoundsException,
                format!("Index {index} out of bounds for length {length}")
            ))
        }
        RuntimeFn::ClassCastException => Err(build_exception!(ClassCastException)),
        RuntimeFn::NegativeArraySize => Err(build_exception!(
            NegativeArraySizeException,
            format!("{}", args[0].as_int()?)
        )),
        RuntimeFn::ArithmeticException => {
            Err(build_exception!(ArithmeticException, "/ by zero"))
        }
        RuntimeFn::OutOfMemoryError => Err(build_exception!(OutOfMemoryError)),
        RuntimeFn::StackOverflowError => Err(build_exception!(StackOverflowError)),
        RuntimeFn::ArrayStoreCheck => {
            array_store_check(vm, args[0].as_ref()?, args[1].as_ref()?)?;
            Ok(None)
        }
        RuntimeFn::ResolveVirtualStub | RuntimeFn::ResolveSpecialStub => {
            Ok(Some(resolve_stub(vm, thread, args[0].as_word()?, false)?))
        }
        RuntimeFn::ResolveStaticStub => {
            Ok(Some(resolve_stub(vm, thread, args[0].as_word()?, true)?))
        }
        RuntimeFn::VirtualLookup => Ok(Some(virtual_lookup(
            vm,
            args[0].as_word()?,
            args[1].as_ref()?,
        )?)),
        RuntimeFn::InterfaceLookup => Ok(Some(interface_lookup(
            vm,
            args[0].as_ref()?,
            args[1].as_word()?,
        )?)),
        RuntimeFn::IsAssignableFrom | RuntimeFn::InstanceOf => {
            Ok(Some(instance_of(vm, args[0].as_ref()?, args[1].as_word()?)?))
        }
        RuntimeFn::ClassLookup => Ok(Some(class_lookup(vm, args[0].as_word()?)?)),
        RuntimeFn::StringLookup => Ok(Some(string_lookup(vm, args[0].as_word()?)?)),
        RuntimeFn::GetArrayClass => Ok(Some(get_array_class(vm, args[0].as_word()?)?)),
        RuntimeFn::PendingException => Ok(Some(Value::Ref(thread.pending_exception()))),
        RuntimeFn::ClearPendingException => {
            Ok(Some(Value::Ref(thread.take_pending_exception())))
        }
        RuntimeFn::SafepointPoll => {
            thread.safepoint(&vm.gate)?;
            Ok(None)
        }
        RuntimeFn::MathSqrt => Ok(Some(Value::Double(args[0].as_double()?.sqrt()))),
        RuntimeFn::MathSin => Ok(Some(Value::Double(args[0].as_double()?.sin()))),
        RuntimeFn::MathCos => Ok(Some(Value::Double(args[0].as_double()?.cos()))),
        RuntimeFn::MathTan => Ok(Some(Value::Double(args[0].as_double()?.tan()))),
        RuntimeFn::MathAbs => Ok(Some(Value::Double(args[0].as_double()?.abs()))),
        RuntimeFn::MathFloor => Ok(Some(Value::Double(args[0].as_double()?.floor()))),
        RuntimeFn::MathCeil => Ok(Some(Value::Double(args[0].as_double()?.ceil()))),
        RuntimeFn::MathExp => Ok(Some(Value::Double(args[0].as_double()?.exp()))),
        RuntimeFn::MathLog => Ok(Some(Value::Double(args[0].as_double()?.ln()))),
        RuntimeFn::MathPow => Ok(Some(Value::Double(
            args[0].as_double()?.powf(args[1].as_double()?),
        ))),
    }
}
