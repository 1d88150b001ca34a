//! The reference execution engine behind the backend capability trait.
//!
//! Evaluates the SSA IR directly, linking intrinsic calls to the runtime
//! support layer, materialising guest methods lazily on first entry, and
//! keeping the per-thread frame records that stack walking and isolate
//! termination rely on. A native backend would replace this module without
//! touching the translator or the compilers.

use crate::backend::{Backend, CodeEntry, CodeTable, PassKind};
use crate::error::VmError;
use crate::ir::{
    BinOp, Callee, CmpOp, ConvOp, FnSig, FunctionIr, InstKind, IrType, ModuleIr, Terminator,
    ValueId, verify,
};
use crate::keys::{ClassId, CodeHandle, EnvelopeId, FunctionId, IsolateId, MethodId};
use crate::support;
use crate::thread::{FrameRecord, VmThread};
use crate::ty::ValueShape;
use crate::vm::{Value, VirtualMachine};
use crate::{build_exception, throw_exception};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub struct Engine {
    module: RwLock<ModuleIr>,
    code: CodeTable,
    passes: Mutex<Vec<PassKind>>,
    function_handles: DashMap<FunctionId, CodeHandle>,
    /// The global IR lock: all compilation serialises on it, and
    /// materialisation re-checks its target after acquiring.
    compile_lock: Mutex<()>,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            module: RwLock::new(ModuleIr::default()),
            code: CodeTable::default(),
            passes: Mutex::new(vec![PassKind::Verify]),
            function_handles: DashMap::new(),
            compile_lock: Mutex::new(()),
        }
    }
}

impl Backend for Engine {
    fn declare_function(&self, name: &str, sig: FnSig) -> FunctionId {
        self.module.write().unwrap().declare(name, sig)
    }

    fn define_function(&self, body: FunctionIr) -> Result<FunctionId, VmError> {
        for pass in self.passes.lock().unwrap().iter() {
            match pass {
                PassKind::Verify => verify(&body)?,
            }
        }
        Ok(self.module.write().unwrap().define(body))
    }

    fn add_pass(&self, pass: PassKind) {
        self.passes.lock().unwrap().push(pass);
    }

    fn function_code(&self, id: FunctionId) -> CodeHandle {
        *self
            .function_handles
            .entry(id)
            .or_insert_with(|| self.code.push(CodeEntry::Function(id)))
    }

    fn code_table(&self) -> &CodeTable {
        &self.code
    }
}

impl Engine {
    pub fn lock_compilation(&self) -> std::sync::MutexGuard<'_, ()> {
        self.compile_lock.lock().unwrap()
    }

    pub fn function_body(&self, id: FunctionId) -> Result<Arc<FunctionIr>, VmError> {
        self.module.read().unwrap().body(id)
    }

    pub fn lookup_function(&self, name: &str) -> Option<FunctionId> {
        self.module.read().unwrap().lookup(name)
    }

    pub fn is_defined(&self, id: FunctionId) -> bool {
        self.module.read().unwrap().is_defined(id)
    }

    pub fn line_for(&self, function: FunctionId, bc: u32) -> Option<u16> {
        self.function_body(function).ok()?.line_for_bc(bc)
    }

    /// Call a guest method, materialising it first if needed.
    pub fn call_method(
        &self,
        vm: &VirtualMachine,
        thread: &VmThread,
        method: MethodId,
        args: &[Value],
    ) -> Result<Option<Value>, VmError> {
        let code = vm.jit.materialise(vm, method)?;
        self.call_code(vm, thread, code, args)
    }

    /// Call a defined IR function directly (stub bodies, initializers).
    pub fn call_function(
        &self,
        vm: &VirtualMachine,
        thread: &VmThread,
        function: FunctionId,
        args: &[Value],
    ) -> Result<Option<Value>, VmError> {
        let result = self.run_function(vm, thread, function, args)?;
        surface_pending(thread, result)
    }

    /// Call through a code word, following stubs and redirects. A pending
    /// exception left by the callee surfaces as `Err(Thrown)` so hosts
    /// outside generated code (which carries its own checks) see it.
    pub fn call_code(
        &self,
        vm: &VirtualMachine,
        thread: &VmThread,
        handle: CodeHandle,
        args: &[Value],
    ) -> Result<Option<Value>, VmError> {
        let result = self.call_code_raw(vm, thread, handle, args)?;
        surface_pending(thread, result)
    }

    fn call_code_raw(
        &self,
        vm: &VirtualMachine,
        thread: &VmThread,
        handle: CodeHandle,
        args: &[Value],
    ) -> Result<Option<Value>, VmError> {
        match self.code.get(handle) {
            CodeEntry::Function(id) => self.run_function(vm, thread, id, args),
            CodeEntry::Stub { method, .. } => {
                // The stub's job: resolve the target, then tail-call it.
                let real = vm.jit.materialise(vm, method)?;
                self.call_code_raw(vm, thread, real, args)
            }
            CodeEntry::AbstractTrap(method) => {
                let (key, class_sym) = {
                    let registry = vm.registry_read();
                    let m = registry.get_method(method);
                    (m.key(), registry.get_class(m.class_id()).name())
                };
                throw_exception!(AbstractMethodError, method_key: key, class_sym: class_sym)
            }
            CodeEntry::RaiseInterrupted(_) => throw_exception!(
                InterruptedException,
                "method belongs to a stopped isolate"
            ),
            CodeEntry::ReturnOnly => Ok(None),
        }
    }

    fn run_function(
        &self,
        vm: &VirtualMachine,
        thread: &VmThread,
        function: FunctionId,
        args: &[Value],
    ) -> Result<Option<Value>, VmError> {
        if thread.frame_count() >= vm.config.max_stack_depth {
            throw_exception!(StackOverflowError);
        }
        let body = self.function_body(function)?;
        let isolate = body
            .method
            .map(|m| {
                let registry = vm.registry_read();
                registry.isolate_of_class(registry.get_method(m).class_id())
            })
            .unwrap_or(IsolateId::BOOT);

        let bc = Arc::new(AtomicU32::new(0));
        let poisoned = Arc::new(AtomicBool::new(false));
        let handlers_removed = Arc::new(AtomicBool::new(false));
        thread.push_frame(FrameRecord {
            method: body.method,
            function,
            isolate,
            bc: bc.clone(),
            poisoned: poisoned.clone(),
            handlers_removed: handlers_removed.clone(),
        });
        let result = self.eval(vm, thread, &body, args, &bc, &poisoned, &handlers_removed);
        thread.pop_frame();
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn eval(
        &self,
        vm: &VirtualMachine,
        thread: &VmThread,
        body: &FunctionIr,
        args: &[Value],
        frame_bc: &AtomicU32,
        poisoned: &AtomicBool,
        handlers_removed: &AtomicBool,
    ) -> Result<Option<Value>, VmError> {
        let mut values: Vec<Option<Value>> = vec![None; body.insts.len()];
        let mut cells: HashMap<ValueId, Value> = HashMap::new();
        let mut current = body.entry;
        let mut previous = body.entry;

        loop {
            let block = body.block(current);

            // PHIs first, all read against the predecessor's values.
            let mut phi_values = Vec::with_capacity(block.phis.len());
            for &phi in &block.phis {
                let InstKind::Phi { incomings } = &body.inst(phi).kind else {
                    unreachable!("phi list holds only phis");
                };
                let incoming = incomings
                    .iter()
                    .find(|(pred, _)| *pred == previous)
                    .map(|(_, value)| *value)
                    .ok_or(VmError::ResolutionState("phi has no incoming for edge"))?;
                phi_values.push(values[incoming as usize]);
            }
            for (&phi, value) in block.phis.iter().zip(phi_values) {
                values[phi as usize] = value;
            }

            for &inst_id in &block.insts {
                let inst = body.inst(inst_id);
                let produced = self.exec(
                    vm,
                    thread,
                    body,
                    inst_id,
                    &mut values,
                    &mut cells,
                    args,
                    frame_bc,
                    poisoned,
                    handlers_removed,
                )?;
                values[inst_id as usize] = produced;
            }

            match block.term.as_ref().expect("verified function") {
                Terminator::Br(target) => {
                    previous = current;
                    current = *target;
                }
                Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                } => {
                    let taken = values[*cond as usize]
                        .ok_or(VmError::ResolutionState("branch on undefined value"))?
                        .as_int()?
                        != 0;
                    previous = current;
                    current = if taken { *then_block } else { *else_block };
                }
                Terminator::Switch {
                    value,
                    default,
                    arms,
                } => {
                    let v = values[*value as usize]
                        .ok_or(VmError::ResolutionState("switch on undefined value"))?
                        .as_int()?;
                    previous = current;
                    current = arms
                        .iter()
                        .find(|(case, _)| *case == v)
                        .map(|(_, target)| *target)
                        .unwrap_or(*default);
                }
                Terminator::Ret(value) => {
                    return Ok(match value {
                        Some(v) => values[*v as usize],
                        None => None,
                    });
                }
                Terminator::Unreachable => {
                    return Err(VmError::ResolutionState("reached unreachable IR"));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec(
        &self,
        vm: &VirtualMachine,
        thread: &VmThread,
        body: &FunctionIr,
        inst_id: ValueId,
        values: &mut [Option<Value>],
        cells: &mut HashMap<ValueId, Value>,
        args: &[Value],
        frame_bc: &AtomicU32,
        poisoned: &AtomicBool,
        handlers_removed: &AtomicBool,
    ) -> Result<Option<Value>, VmError> {
        let inst = body.inst(inst_id);
        let value_of = |values: &[Option<Value>], id: ValueId| -> Result<Value, VmError> {
            values[id as usize].ok_or(VmError::ResolutionState("use of undefined value"))
        };

        let result = match &inst.kind {
            InstKind::Arg(index) => Some(args[*index as usize]),
            InstKind::ConstI32(v) => Some(Value::Int(*v)),
            InstKind::ConstI64(v) => Some(Value::Long(*v)),
            InstKind::ConstF32(bits) => Some(Value::Float(f32::from_bits(*bits))),
            InstKind::ConstF64(bits) => Some(Value::Double(f64::from_bits(*bits))),
            InstKind::ConstNull => Some(Value::NULL),
            InstKind::ConstWord(w) => Some(Value::Long(*w as i64)),
            InstKind::Alloca(shape) => {
                cells.insert(inst_id, default_of_shape(*shape));
                Some(Value::Long(inst_id as i64))
            }
            InstKind::Load { slot, .. } => Some(
                *cells
                    .get(slot)
                    .ok_or(VmError::ResolutionState("load from a dead stack cell"))?,
            ),
            InstKind::Store { slot, value } => {
                let v = value_of(values, *value)?;
                cells.insert(*slot, v);
                None
            }
            InstKind::FieldLoad {
                object,
                offset,
                shape,
            } => {
                let obj = value_of(values, *object)?.as_ref()?;
                if obj == 0 {
                    throw_exception!(NullPointerException);
                }
                Some(vm.heap_read().read(obj, *offset as usize, *shape)?)
            }
            InstKind::FieldStore {
                object,
                offset,
                shape,
                value,
            } => {
                let obj = value_of(values, *object)?.as_ref()?;
                if obj == 0 {
                    throw_exception!(NullPointerException);
                }
                let v = value_of(values, *value)?;
                vm.heap_write().write(obj, *offset as usize, *shape, v)?;
                None
            }
            InstKind::ArrayLoad { array, index, .. } => {
                let arr = value_of(values, *array)?.as_ref()?;
                let idx = value_of(values, *index)?.as_int()?;
                let heap = vm.heap_read();
                let (offset, shape) = heap.array_elem_offset(arr, idx as usize)?;
                Some(heap.read(arr, offset, shape)?)
            }
            InstKind::ArrayStore {
                array,
                index,
                value,
                ..
            } => {
                let arr = value_of(values, *array)?.as_ref()?;
                let idx = value_of(values, *index)?.as_int()?;
                let v = value_of(values, *value)?;
                let mut heap = vm.heap_write();
                let (offset, shape) = heap.array_elem_offset(arr, idx as usize)?;
                heap.write(arr, offset, shape, v)?;
                None
            }
            InstKind::ArrayLength { array } => {
                let arr = value_of(values, *array)?.as_ref()?;
                if arr == 0 {
                    throw_exception!(NullPointerException);
                }
                Some(Value::Int(vm.heap_read().array_length(arr)?))
            }
            InstKind::StaticBase(class) => {
                let base = vm
                    .registry_read()
                    .get_class(*class)
                    .base()
                    .and_then(|b| b.static_instance())
                    .ok_or(VmError::ResolutionState("static instance not allocated"))?;
                Some(Value::Ref(base))
            }
            InstKind::LoadVt { object } => {
                let obj = value_of(values, *object)?.as_ref()?;
                if obj == 0 {
                    throw_exception!(NullPointerException);
                }
                let class = vm.heap_read().class_of(obj)?;
                Some(Value::Long(u64::from(class.raw()) as i64))
            }
            InstKind::LoadVtSlot { vt, offset } => {
                let class = class_of_vt_word(value_of(values, *vt)?)?;
                let registry = vm.registry_read();
                let vt_record = registry
                    .get_class(class)
                    .vt()
                    .ok_or(VmError::ResolutionState("VT slot load before resolution"))?;
                let word = vt_record
                    .code_at(*offset)
                    .map(|h| u64::from(h.raw()))
                    .unwrap_or(0);
                Some(Value::Long(word as i64))
            }
            InstKind::LoadImtSlot { vt, index } => {
                let class = class_of_vt_word(value_of(values, *vt)?)?;
                let registry = vm.registry_read();
                let imt = registry
                    .get_class(class)
                    .vt()
                    .and_then(|v| v.imt.as_ref())
                    .ok_or(VmError::ResolutionState("IMT load before resolution"))?;
                Some(Value::Long(imt.slot_word(*index as usize) as i64))
            }
            InstKind::ChainMethod { vt, slot, index } => {
                let pair = chain_pair(vm, values, *vt, *slot, *index, &value_of)?;
                Some(Value::Long(
                    pair.map(|(method, _)| u64::from(method.raw())).unwrap_or(0) as i64,
                ))
            }
            InstKind::ChainCode { vt, slot, index } => {
                let pair = chain_pair(vm, values, *vt, *slot, *index, &value_of)?;
                Some(Value::Long(
                    pair.map(|(_, code)| code).unwrap_or(0) as i64,
                ))
            }
            InstKind::EnvelopeHeadClass { envelope } => {
                let envelope = envelope_of(vm, value_of(values, *envelope)?)?;
                Some(Value::Long(envelope.head_class_word() as i64))
            }
            InstKind::EnvelopeHeadEntry { envelope } => {
                let envelope = envelope_of(vm, value_of(values, *envelope)?)?;
                Some(Value::Long(envelope.head_entry_word() as i64))
            }
            InstKind::Bin { op, lhs, rhs } => Some(eval_bin(
                inst.ty,
                *op,
                value_of(values, *lhs)?,
                value_of(values, *rhs)?,
            )?),
            InstKind::Cmp { op, lhs, rhs } => {
                let lhs_ty = body.inst(*lhs).ty;
                Some(eval_cmp(
                    lhs_ty,
                    *op,
                    value_of(values, *lhs)?,
                    value_of(values, *rhs)?,
                )?)
            }
            InstKind::Select {
                cond,
                then_value,
                else_value,
            } => {
                if value_of(values, *cond)?.as_int()? != 0 {
                    Some(value_of(values, *then_value)?)
                } else {
                    Some(value_of(values, *else_value)?)
                }
            }
            InstKind::Convert { op, value } => {
                Some(eval_convert(*op, value_of(values, *value)?)?)
            }
            InstKind::Phi { .. } => {
                return Err(VmError::ResolutionState("phi outside a block head"));
            }
            InstKind::Call { callee, args: call_args } => {
                frame_bc.store(inst.bc, Ordering::Release);
                let mut evaluated = Vec::with_capacity(call_args.len());
                for arg in call_args {
                    evaluated.push(value_of(values, *arg)?);
                }
                let outcome = match callee {
                    Callee::Method(method) => {
                        self.call_method(vm, thread, *method, &evaluated)
                    }
                    Callee::Function(function) => {
                        self.run_function(vm, thread, *function, &evaluated)
                    }
                    Callee::CodeWord(word) => {
                        let word = value_of(values, *word)?.as_word()?;
                        let handle = CodeHandle::from_raw(word as u32).ok_or_else(|| {
                            build_exception!(InternalError, "call through a null code word")
                        })?;
                        self.call_code(vm, thread, handle, &evaluated)
                    }
                    Callee::Intrinsic(f) => support::dispatch(vm, thread, *f, &evaluated),
                };
                let value = match outcome {
                    Ok(v) => v,
                    Err(VmError::Thrown(obj)) => {
                        if handlers_removed.load(Ordering::Acquire) {
                            return Err(VmError::Thrown(obj));
                        }
                        thread.set_pending_exception(obj);
                        None
                    }
                    Err(VmError::Exception(exception)) => {
                        let obj = vm.materialise_exception(thread, exception)?;
                        if handlers_removed.load(Ordering::Acquire) {
                            return Err(VmError::Thrown(obj));
                        }
                        thread.set_pending_exception(obj);
                        None
                    }
                    Err(other) => return Err(other),
                };
                if poisoned.swap(false, Ordering::AcqRel) {
                    // A stopped isolate patched our return path.
                    throw_exception!(
                        InterruptedException,
                        "returned to a method of a stopped isolate"
                    );
                }
                match inst.ty {
                    IrType::Void => None,
                    ty => Some(value.unwrap_or_else(|| default_of_type(ty))),
                }
            }
        };
        Ok(result)
    }
}

fn surface_pending(thread: &VmThread, value: Option<Value>) -> Result<Option<Value>, VmError> {
    let pending = thread.take_pending_exception();
    if pending != 0 {
        return Err(VmError::Thrown(pending));
    }
    Ok(value)
}

fn class_of_vt_word(value: Value) -> Result<ClassId, VmError> {
    ClassId::from_raw(value.as_word()? as u32)
        .ok_or(VmError::ResolutionState("null VT word"))
}

fn envelope_of(
    vm: &VirtualMachine,
    value: Value,
) -> Result<Arc<crate::dispatch::Enveloppe>, VmError> {
    let id = EnvelopeId::from_raw(value.as_word()? as u32)
        .ok_or(VmError::ResolutionState("null envelope token"))?;
    Ok(vm.envelopes.get(id))
}

fn chain_pair(
    vm: &VirtualMachine,
    values: &[Option<Value>],
    vt: ValueId,
    slot: ValueId,
    index: ValueId,
    value_of: &dyn Fn(&[Option<Value>], ValueId) -> Result<Value, VmError>,
) -> Result<Option<(MethodId, u64)>, VmError> {
    let class = class_of_vt_word(value_of(values, vt)?)?;
    let slot_word = value_of(values, slot)?.as_word()?;
    let idx = value_of(values, index)?.as_int()? as usize;
    let registry = vm.registry_read();
    let imt = registry
        .get_class(class)
        .vt()
        .and_then(|v| v.imt.as_ref())
        .ok_or(VmError::ResolutionState("chain walk before resolution"))?;
    let chain = imt
        .chain(slot_word)
        .ok_or(VmError::ResolutionState("chain walk on an untagged slot"))?;
    Ok(chain.get(idx).map(|pair| {
        (
            pair.interface_method,
            u64::from(pair.code.load(Ordering::Acquire)),
        )
    }))
}

pub fn default_of_shape(shape: ValueShape) -> Value {
    match shape {
        ValueShape::Int => Value::Int(0),
        ValueShape::Long => Value::Long(0),
        ValueShape::Float => Value::Float(0.0),
        ValueShape::Double => Value::Double(0.0),
        ValueShape::Ref => Value::NULL,
    }
}

pub fn default_of_type(ty: IrType) -> Value {
    match ty {
        IrType::I1 | IrType::I32 => Value::Int(0),
        IrType::I64 | IrType::Word => Value::Long(0),
        IrType::F32 => Value::Float(0.0),
        IrType::F64 => Value::Double(0.0),
        IrType::Ref => Value::NULL,
        IrType::Void => Value::Int(0),
    }
}

fn eval_bin(ty: IrType, op: BinOp, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    match ty {
        IrType::I32 => {
            let (a, b) = (lhs.as_int()?, rhs.as_int()?);
            let v = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div => {
                    if b == 0 {
                        throw_exception!(ArithmeticException, "/ by zero");
                    }
                    a.wrapping_div(b)
                }
                BinOp::Rem => {
                    if b == 0 {
                        throw_exception!(ArithmeticException, "/ by zero");
                    }
                    a.wrapping_rem(b)
                }
                BinOp::And => a & b,
                BinOp::Or => a | b,
                BinOp::Xor => a ^ b,
                BinOp::Shl => a.wrapping_shl(b as u32 & 0x1f),
                BinOp::Shr => a.wrapping_shr(b as u32 & 0x1f),
                BinOp::Ushr => ((a as u32).wrapping_shr(b as u32 & 0x1f)) as i32,
            };
            Ok(Value::Int(v))
        }
        IrType::I64 | IrType::Word => {
            let a = lhs.as_word()? as i64;
            let b = match rhs {
                Value::Int(v) => i64::from(v),
                other => other.as_word()? as i64,
            };
            let v = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div => {
                    if b == 0 {
                        throw_exception!(ArithmeticException, "/ by zero");
                    }
                    a.wrapping_div(b)
                }
                BinOp::Rem => {
                    if b == 0 {
                        throw_exception!(ArithmeticException, "/ by zero");
                    }
                    a.wrapping_rem(b)
                }
                BinOp::And => a & b,
                BinOp::Or => a | b,
                BinOp::Xor => a ^ b,
                BinOp::Shl => a.wrapping_shl(b as u32 & 0x3f),
                BinOp::Shr => a.wrapping_shr(b as u32 & 0x3f),
                BinOp::Ushr => ((a as u64).wrapping_shr(b as u32 & 0x3f)) as i64,
            };
            Ok(Value::Long(v))
        }
        IrType::F32 => {
            let (a, b) = (lhs.as_float()?, rhs.as_float()?);
            let v = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                _ => return Err(VmError::ResolutionState("bitwise op on float")),
            };
            Ok(Value::Float(v))
        }
        IrType::F64 => {
            let (a, b) = (lhs.as_double()?, rhs.as_double()?);
            let v = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                _ => return Err(VmError::ResolutionState("bitwise op on double")),
            };
            Ok(Value::Double(v))
        }
        _ => Err(VmError::ResolutionState("arithmetic on a non-numeric type")),
    }
}

fn eval_cmp(operand_ty: IrType, op: CmpOp, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    let truth = |b: bool| Value::Int(i32::from(b));
    let result = match operand_ty {
        IrType::I32 | IrType::I1 => {
            let (a, b) = (lhs.as_int()?, rhs.as_int()?);
            match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Uno => false,
            }
        }
        IrType::I64 | IrType::Word => {
            let (a, b) = (lhs.as_word()? as i64, rhs.as_word()? as i64);
            match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Uno => false,
            }
        }
        IrType::Ref => {
            let (a, b) = (lhs.as_ref()?, rhs.as_ref()?);
            match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                _ => return Err(VmError::ResolutionState("ordering compare on references")),
            }
        }
        IrType::F32 => {
            let (a, b) = (lhs.as_float()?, rhs.as_float()?);
            match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Uno => a.is_nan() || b.is_nan(),
            }
        }
        IrType::F64 => {
            let (a, b) = (lhs.as_double()?, rhs.as_double()?);
            match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Uno => a.is_nan() || b.is_nan(),
            }
        }
        IrType::Void => return Err(VmError::ResolutionState("compare on void")),
    };
    Ok(truth(result))
}

fn eval_convert(op: ConvOp, value: Value) -> Result<Value, VmError> {
    Ok(match op {
        ConvOp::I2L => Value::Long(i64::from(value.as_int()?)),
        ConvOp::I2F => Value::Float(value.as_int()? as f32),
        ConvOp::I2D => Value::Double(f64::from(value.as_int()?)),
        ConvOp::L2I => Value::Int(value.as_long()? as i32),
        ConvOp::L2F => Value::Float(value.as_long()? as f32),
        ConvOp::L2D => Value::Double(value.as_long()? as f64),
        // `as` casts saturate and map NaN to zero, matching the guest rules.
        ConvOp::F2I => Value::Int(value.as_float()? as i32),
        ConvOp::F2L => Value::Long(value.as_float()? as i64),
        ConvOp::F2D => Value::Double(f64::from(value.as_float()?)),
        ConvOp::D2I => Value::Int(value.as_double()? as i32),
        ConvOp::D2L => Value::Long(value.as_double()? as i64),
        ConvOp::D2F => Value::Float(value.as_double()? as f32),
        ConvOp::I2B => Value::Int(i32::from(value.as_int()? as i8)),
        ConvOp::I2C => Value::Int(i32::from(value.as_int()? as u16)),
        ConvOp::I2S => Value::Int(i32::from(value.as_int()? as i16)),
        ConvOp::BitsToF32 => Value::Float(f32::from_bits(value.as_int()? as u32)),
        ConvOp::BitsToF64 => Value::Double(f64::from_bits(value.as_long()? as u64)),
        ConvOp::F32ToBits => Value::Int(value.as_float()?.to_bits() as i32),
        ConvOp::F64ToBits => Value::Long(value.as_double()?.to_bits() as i64),
        ConvOp::WordToRef => Value::Ref(value.as_word()? as usize),
        ConvOp::RefToWord => Value::Long(value.as_ref()? as i64),
    })
}
