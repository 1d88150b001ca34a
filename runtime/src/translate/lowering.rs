//! Per-opcode lowering rules.

use crate::bytecode::Constant;
use crate::bytecode::decode::{ArithOp, ArrayKind, CmpKind, ConvKind, Instr, ShiftOp};
use crate::error::VmError;
use crate::intrinsics::RuntimeFn;
use crate::ir::{
    BinOp, Callee, CmpOp, ConvOp, InstKind, IrType, MemShape, Terminator, ValueId,
};
use crate::keys::{FieldKey, MethodKey};
use crate::rt::vtable::imt_hash;
use crate::translate::{CompileMode, MethodCtx, RetCtx, Translator};
use crate::ty::{PrimitiveKind, TypeDescriptor, ValueShape};
use crate::vm::PendingRef;
use lasso::Key;

fn mem_shape_of(ty: &TypeDescriptor) -> MemShape {
    match ty {
        TypeDescriptor::Primitive(kind) => match kind {
            PrimitiveKind::Bool | PrimitiveKind::Byte => MemShape::I8,
            PrimitiveKind::Short => MemShape::I16,
            PrimitiveKind::Char => MemShape::U16,
            PrimitiveKind::Int => MemShape::I32,
            PrimitiveKind::Long => MemShape::I64,
            PrimitiveKind::Float => MemShape::F32,
            PrimitiveKind::Double => MemShape::F64,
        },
        _ => MemShape::Ref,
    }
}

fn array_mem_shape(kind: ArrayKind) -> (MemShape, ValueShape) {
    match kind {
        ArrayKind::Int => (MemShape::I32, ValueShape::Int),
        ArrayKind::Long => (MemShape::I64, ValueShape::Long),
        ArrayKind::Float => (MemShape::F32, ValueShape::Float),
        ArrayKind::Double => (MemShape::F64, ValueShape::Double),
        ArrayKind::Ref => (MemShape::Ref, ValueShape::Ref),
        ArrayKind::Byte => (MemShape::I8, ValueShape::Int),
        ArrayKind::Char => (MemShape::U16, ValueShape::Int),
        ArrayKind::Short => (MemShape::I16, ValueShape::Int),
    }
}

impl Translator<'_> {
    pub(crate) fn lower(
        &mut self,
        ctx: &mut MethodCtx,
        instr: Instr,
        pc: usize,
        next_pc: usize,
    ) -> Result<(), VmError> {
        match instr {
            Instr::Nop => {}
            Instr::AconstNull => {
                let v = self.emit(InstKind::ConstNull, IrType::Ref);
                ctx.push_value(v, ValueShape::Ref);
            }
            Instr::IConst(value) => {
                let v = self.emit(InstKind::ConstI32(value), IrType::I32);
                ctx.push_value(v, ValueShape::Int);
            }
            Instr::LConst(value) => {
                let v = self.emit(InstKind::ConstI64(value), IrType::I64);
                ctx.push_value(v, ValueShape::Long);
            }
            Instr::FConst(value) => {
                let v = self.emit(InstKind::ConstF32(value.to_bits()), IrType::F32);
                ctx.push_value(v, ValueShape::Float);
            }
            Instr::DConst(value) => {
                let v = self.emit(InstKind::ConstF64(value.to_bits()), IrType::F64);
                ctx.push_value(v, ValueShape::Double);
            }
            Instr::Ldc(index) => self.lower_ldc(ctx, pc, index)?,
            Instr::Load(shape, index) => {
                let cell = self.local(ctx, index, shape);
                let v = self.emit(
                    InstKind::Load { slot: cell, shape },
                    IrType::of_shape(shape),
                );
                ctx.push_value(v, shape);
            }
            Instr::StoreLocal(shape, index) => {
                let (value, _) = ctx.pop_value()?;
                let cell = self.local(ctx, index, shape);
                self.emit(InstKind::Store { slot: cell, value }, IrType::Void);
            }
            Instr::Iinc(index, delta) => {
                let cell = self.local(ctx, index, ValueShape::Int);
                let old = self.emit(
                    InstKind::Load {
                        slot: cell,
                        shape: ValueShape::Int,
                    },
                    IrType::I32,
                );
                let d = self.emit(InstKind::ConstI32(delta), IrType::I32);
                let new = self.emit(
                    InstKind::Bin {
                        op: BinOp::Add,
                        lhs: old,
                        rhs: d,
                    },
                    IrType::I32,
                );
                self.emit(InstKind::Store { slot: cell, value: new }, IrType::Void);
            }

            Instr::Pop => {
                ctx.pop_raw()?;
            }
            Instr::Pop2 => {
                ctx.pop_raw()?;
                ctx.pop_raw()?;
            }
            Instr::Dup => {
                let top = *ctx.stack.last().ok_or_else(stack_underflow)?;
                ctx.stack.push(top);
            }
            Instr::DupX1 => {
                let len = ctx.stack.len();
                if len < 2 {
                    return Err(stack_underflow());
                }
                let top = ctx.stack[len - 1];
                ctx.stack.insert(len - 2, top);
            }
            Instr::DupX2 => {
                let len = ctx.stack.len();
                if len < 3 {
                    return Err(stack_underflow());
                }
                let top = ctx.stack[len - 1];
                ctx.stack.insert(len - 3, top);
            }
            Instr::Dup2 => {
                let len = ctx.stack.len();
                if len < 2 {
                    return Err(stack_underflow());
                }
                let pair = [ctx.stack[len - 2], ctx.stack[len - 1]];
                ctx.stack.extend_from_slice(&pair);
            }
            Instr::Dup2X1 => {
                let len = ctx.stack.len();
                if len < 3 {
                    return Err(stack_underflow());
                }
                let pair = [ctx.stack[len - 2], ctx.stack[len - 1]];
                ctx.stack.insert(len - 3, pair[1]);
                ctx.stack.insert(len - 3, pair[0]);
            }
            Instr::Dup2X2 => {
                let len = ctx.stack.len();
                if len < 4 {
                    return Err(stack_underflow());
                }
                let pair = [ctx.stack[len - 2], ctx.stack[len - 1]];
                ctx.stack.insert(len - 4, pair[1]);
                ctx.stack.insert(len - 4, pair[0]);
            }
            Instr::Swap => {
                let len = ctx.stack.len();
                if len < 2 {
                    return Err(stack_underflow());
                }
                ctx.stack.swap(len - 1, len - 2);
            }

            Instr::Arith(shape, op) => self.lower_arith(ctx, pc, shape, op)?,
            Instr::Neg(shape) => {
                let (value, _) = ctx.pop_value()?;
                let zero = match shape {
                    ValueShape::Int => self.emit(InstKind::ConstI32(0), IrType::I32),
                    ValueShape::Long => self.emit(InstKind::ConstI64(0), IrType::I64),
                    ValueShape::Float => {
                        self.emit(InstKind::ConstF32((-0.0f32).to_bits()), IrType::F32)
                    }
                    ValueShape::Double => {
                        self.emit(InstKind::ConstF64((-0.0f64).to_bits()), IrType::F64)
                    }
                    ValueShape::Ref => return Err(stack_underflow()),
                };
                let ty = IrType::of_shape(shape);
                let v = self.emit(
                    InstKind::Bin {
                        op: BinOp::Sub,
                        lhs: zero,
                        rhs: value,
                    },
                    ty,
                );
                ctx.push_value(v, shape);
            }
            Instr::Shift(shape, op) => {
                let (amount, _) = ctx.pop_value()?;
                let (value, _) = ctx.pop_value()?;
                let bin = match op {
                    ShiftOp::Shl => BinOp::Shl,
                    ShiftOp::Shr => BinOp::Shr,
                    ShiftOp::Ushr => BinOp::Ushr,
                };
                let v = self.emit(
                    InstKind::Bin {
                        op: bin,
                        lhs: value,
                        rhs: amount,
                    },
                    IrType::of_shape(shape),
                );
                ctx.push_value(v, shape);
            }
            Instr::Convert(kind) => {
                let (value, _) = ctx.pop_value()?;
                let (op, ty, shape) = match kind {
                    ConvKind::I2L => (ConvOp::I2L, IrType::I64, ValueShape::Long),
                    ConvKind::I2F => (ConvOp::I2F, IrType::F32, ValueShape::Float),
                    ConvKind::I2D => (ConvOp::I2D, IrType::F64, ValueShape::Double),
                    ConvKind::L2I => (ConvOp::L2I, IrType::I32, ValueShape::Int),
                    ConvKind::L2F => (ConvOp::L2F, IrType::F32, ValueShape::Float),
                    ConvKind::L2D => (ConvOp::L2D, IrType::F64, ValueShape::Double),
                    ConvKind::F2I => (ConvOp::F2I, IrType::I32, ValueShape::Int),
                    ConvKind::F2L => (ConvOp::F2L, IrType::I64, ValueShape::Long),
                    ConvKind::F2D => (ConvOp::F2D, IrType::F64, ValueShape::Double),
                    ConvKind::D2I => (ConvOp::D2I, IrType::I32, ValueShape::Int),
                    ConvKind::D2L => (ConvOp::D2L, IrType::I64, ValueShape::Long),
                    ConvKind::D2F => (ConvOp::D2F, IrType::F32, ValueShape::Float),
                    ConvKind::I2B => (ConvOp::I2B, IrType::I32, ValueShape::Int),
                    ConvKind::I2C => (ConvOp::I2C, IrType::I32, ValueShape::Int),
                    ConvKind::I2S => (ConvOp::I2S, IrType::I32, ValueShape::Int),
                };
                let v = self.emit(InstKind::Convert { op, value }, ty);
                ctx.push_value(v, shape);
            }

            Instr::LCmp => {
                let (rhs, _) = ctx.pop_value()?;
                let (lhs, _) = ctx.pop_value()?;
                let v = self.three_way(ctx, lhs, rhs, None)?;
                ctx.push_value(v, ValueShape::Int);
            }
            Instr::FCmp { negative_on_nan } | Instr::DCmp { negative_on_nan } => {
                let (rhs, _) = ctx.pop_value()?;
                let (lhs, _) = ctx.pop_value()?;
                let v = self.three_way(ctx, lhs, rhs, Some(negative_on_nan))?;
                ctx.push_value(v, ValueShape::Int);
            }

            Instr::If(kind, target) => {
                let (value, _) = ctx.pop_value()?;
                let zero = self.emit(InstKind::ConstI32(0), IrType::I32);
                let cond = self.emit(
                    InstKind::Cmp {
                        op: cmp_op(kind),
                        lhs: value,
                        rhs: zero,
                    },
                    IrType::I1,
                );
                self.conditional_branch(ctx, pc, next_pc, target, cond)?;
            }
            Instr::IfICmp(kind, target) => {
                let (rhs, _) = ctx.pop_value()?;
                let (lhs, _) = ctx.pop_value()?;
                let cond = self.emit(
                    InstKind::Cmp {
                        op: cmp_op(kind),
                        lhs,
                        rhs,
                    },
                    IrType::I1,
                );
                self.conditional_branch(ctx, pc, next_pc, target, cond)?;
            }
            Instr::IfACmp(equal, target) => {
                let (rhs, _) = ctx.pop_value()?;
                let (lhs, _) = ctx.pop_value()?;
                let cond = self.emit(
                    InstKind::Cmp {
                        op: if equal { CmpOp::Eq } else { CmpOp::Ne },
                        lhs,
                        rhs,
                    },
                    IrType::I1,
                );
                self.conditional_branch(ctx, pc, next_pc, target, cond)?;
            }
            Instr::IfNull(target) | Instr::IfNonNull(target) => {
                let want_null = matches!(instr, Instr::IfNull(_));
                let (value, _) = ctx.pop_value()?;
                let null = self.emit(InstKind::ConstNull, IrType::Ref);
                let cond = self.emit(
                    InstKind::Cmp {
                        op: if want_null { CmpOp::Eq } else { CmpOp::Ne },
                        lhs: value,
                        rhs: null,
                    },
                    IrType::I1,
                );
                self.conditional_branch(ctx, pc, next_pc, target, cond)?;
            }
            Instr::Goto(target) => {
                self.back_edge_poll(ctx, pc, &[target])?;
                let stack = ctx.stack.clone();
                let block = self.branch_to(ctx, target, &stack)?;
                self.b.terminate(Terminator::Br(block));
            }
            Instr::TableSwitch {
                default,
                low,
                targets,
            } => {
                let (value, _) = ctx.pop_value()?;
                let mut all = targets.clone();
                all.push(default);
                self.back_edge_poll(ctx, pc, &all)?;
                let stack = ctx.stack.clone();
                let mut arms = Vec::with_capacity(targets.len());
                for (index, target) in targets.iter().enumerate() {
                    let block = self.branch_to(ctx, *target, &stack)?;
                    arms.push((low + index as i32, block));
                }
                let default_block = self.branch_to(ctx, default, &stack)?;
                self.b.terminate(Terminator::Switch {
                    value,
                    default: default_block,
                    arms,
                });
            }
            Instr::LookupSwitch { default, pairs } => {
                let (value, _) = ctx.pop_value()?;
                let mut all: Vec<usize> = pairs.iter().map(|(_, t)| *t).collect();
                all.push(default);
                self.back_edge_poll(ctx, pc, &all)?;
                let stack = ctx.stack.clone();
                let mut arms = Vec::with_capacity(pairs.len());
                for (case, target) in &pairs {
                    let block = self.branch_to(ctx, *target, &stack)?;
                    arms.push((*case, block));
                }
                let default_block = self.branch_to(ctx, default, &stack)?;
                self.b.terminate(Terminator::Switch {
                    value,
                    default: default_block,
                    arms,
                });
            }

            Instr::Return(shape) => self.lower_return(ctx, shape)?,

            Instr::GetStatic(index) => {
                let (class_sym, name, desc) = ctx.pool.member_ref(index)?;
                let key = FieldKey { name, desc };
                let class_id = self.resolve_class_sym(class_sym)?;
                let (declaring, field) = self.vm.registry_read().lookup_field(class_id, key, true)?;
                let token = self.const_word(u64::from(declaring.raw()));
                self.emit_intrinsic(RuntimeFn::InitialisationCheck, vec![token]);
                self.pending_check(ctx, pc)?;
                let shape = {
                    let registry = self.vm.registry_read();
                    mem_shape_of(registry.get_field_descriptor(field.descriptor))
                };
                let base = self.emit(InstKind::StaticBase(declaring), IrType::Ref);
                let v = self.emit(
                    InstKind::FieldLoad {
                        object: base,
                        offset: field.offset as u32,
                        shape,
                    },
                    shape.ir_type(),
                );
                ctx.push_value(v, value_shape_of_mem(shape));
            }
            Instr::PutStatic(index) => {
                let (class_sym, name, desc) = ctx.pool.member_ref(index)?;
                let key = FieldKey { name, desc };
                let class_id = self.resolve_class_sym(class_sym)?;
                let (declaring, field) = self.vm.registry_read().lookup_field(class_id, key, true)?;
                let (value, _) = ctx.pop_value()?;
                let token = self.const_word(u64::from(declaring.raw()));
                self.emit_intrinsic(RuntimeFn::InitialisationCheck, vec![token]);
                self.pending_check(ctx, pc)?;
                let shape = {
                    let registry = self.vm.registry_read();
                    mem_shape_of(registry.get_field_descriptor(field.descriptor))
                };
                let base = self.emit(InstKind::StaticBase(declaring), IrType::Ref);
                self.emit(
                    InstKind::FieldStore {
                        object: base,
                        offset: field.offset as u32,
                        shape,
                        value,
                    },
                    IrType::Void,
                );
            }
            Instr::GetField(index) => {
                let (class_sym, name, desc) = ctx.pool.member_ref(index)?;
                let key = FieldKey { name, desc };
                let class_id = self.resolve_class_sym(class_sym)?;
                let (_, field) = self.vm.registry_read().lookup_field(class_id, key, false)?;
                let (object, _) = ctx.pop_value()?;
                self.null_check(ctx, pc, object)?;
                let shape = {
                    let registry = self.vm.registry_read();
                    mem_shape_of(registry.get_field_descriptor(field.descriptor))
                };
                let v = self.emit(
                    InstKind::FieldLoad {
                        object,
                        offset: field.offset as u32,
                        shape,
                    },
                    shape.ir_type(),
                );
                ctx.push_value(v, value_shape_of_mem(shape));
            }
            Instr::PutField(index) => {
                let (class_sym, name, desc) = ctx.pool.member_ref(index)?;
                let key = FieldKey { name, desc };
                let class_id = self.resolve_class_sym(class_sym)?;
                let (_, field) = self.vm.registry_read().lookup_field(class_id, key, false)?;
                let (value, _) = ctx.pop_value()?;
                let (object, _) = ctx.pop_value()?;
                self.null_check(ctx, pc, object)?;
                let shape = {
                    let registry = self.vm.registry_read();
                    mem_shape_of(registry.get_field_descriptor(field.descriptor))
                };
                self.emit(
                    InstKind::FieldStore {
                        object,
                        offset: field.offset as u32,
                        shape,
                        value,
                    },
                    IrType::Void,
                );
            }

            Instr::ArrayLoad(kind) => {
                let (index, _) = ctx.pop_value()?;
                let (array, _) = ctx.pop_value()?;
                self.null_check(ctx, pc, array)?;
                self.bounds_check(ctx, pc, array, index)?;
                let (shape, value_shape) = array_mem_shape(kind);
                let v = self.emit(
                    InstKind::ArrayLoad {
                        array,
                        index,
                        shape,
                    },
                    shape.ir_type(),
                );
                ctx.push_value(v, value_shape);
            }
            Instr::ArrayStore(kind) => {
                let (value, _) = ctx.pop_value()?;
                let (index, _) = ctx.pop_value()?;
                let (array, _) = ctx.pop_value()?;
                self.null_check(ctx, pc, array)?;
                self.bounds_check(ctx, pc, array, index)?;
                let (shape, _) = array_mem_shape(kind);
                if kind == ArrayKind::Ref {
                    self.emit_intrinsic(RuntimeFn::ArrayStoreCheck, vec![array, value]);
                    self.pending_check(ctx, pc)?;
                }
                self.emit(
                    InstKind::ArrayStore {
                        array,
                        index,
                        shape,
                        value,
                    },
                    IrType::Void,
                );
            }
            Instr::ArrayLength => {
                let (array, _) = ctx.pop_value()?;
                self.null_check(ctx, pc, array)?;
                let v = self.emit(InstKind::ArrayLength { array }, IrType::I32);
                ctx.push_value(v, ValueShape::Int);
            }

            Instr::New(index) => {
                let class_sym = ctx.pool.class_ref(index)?;
                let class_id = self.resolve_class_sym(class_sym)?;
                let size = {
                    let registry = self.vm.registry_read();
                    registry.get_class(class_id).as_instance()?.instance_size()?
                };
                let token = self.const_word(u64::from(class_id.raw()));
                self.emit_intrinsic(RuntimeFn::InitialisationCheck, vec![token]);
                self.pending_check(ctx, pc)?;
                let size_const = self.emit(InstKind::ConstI64(size as i64), IrType::I64);
                let token = self.const_word(u64::from(class_id.raw()));
                let obj = self.emit_intrinsic(RuntimeFn::Allocate, vec![size_const, token]);
                self.pending_check(ctx, pc)?;
                ctx.push_value(obj, ValueShape::Ref);
            }
            Instr::NewArray(kind) => {
                let name = format!("[{}", kind.primitive().descriptor_char());
                let sym = self.vm.interner().get_or_intern(&name);
                let class_id = self.resolve_class_sym(sym)?;
                let (length, _) = ctx.pop_value()?;
                let token = self.const_word(u64::from(class_id.raw()));
                let array = self.emit_intrinsic(RuntimeFn::AllocateArray, vec![token, length]);
                self.pending_check(ctx, pc)?;
                ctx.push_value(array, ValueShape::Ref);
            }
            Instr::ANewArray(index) => {
                let element_sym = ctx.pool.class_ref(index)?;
                let element_name = {
                    let registry = self.vm.registry_read();
                    registry.interner().resolve(&element_sym).to_string()
                };
                let array_name = if element_name.starts_with('[') {
                    format!("[{element_name}")
                } else {
                    format!("[L{element_name};")
                };
                let sym = self.vm.interner().get_or_intern(&array_name);
                let class_id = self.resolve_class_sym(sym)?;
                let (length, _) = ctx.pop_value()?;
                let token = self.const_word(u64::from(class_id.raw()));
                let array = self.emit_intrinsic(RuntimeFn::AllocateArray, vec![token, length]);
                self.pending_check(ctx, pc)?;
                ctx.push_value(array, ValueShape::Ref);
            }
            Instr::MultiANewArray(index, dims) => {
                let array_sym = ctx.pool.class_ref(index)?;
                let class_id = self.resolve_class_sym(array_sym)?;
                let mut dim_values = vec![0 as ValueId; dims as usize];
                for slot in (0..dims as usize).rev() {
                    let (value, _) = ctx.pop_value()?;
                    dim_values[slot] = value;
                }
                let token = self.const_word(u64::from(class_id.raw()));
                let mut args = vec![token];
                args.extend(dim_values);
                let array = self.emit_intrinsic(RuntimeFn::ArrayMultiNew, args);
                self.pending_check(ctx, pc)?;
                ctx.push_value(array, ValueShape::Ref);
            }

            Instr::CheckCast(index) => {
                let class_sym = ctx.pool.class_ref(index)?;
                let class_id = self.resolve_class_sym(class_sym)?;
                let (object, _) = ctx.peek_value()?;
                let null = self.emit(InstKind::ConstNull, IrType::Ref);
                let is_null = self.emit(
                    InstKind::Cmp {
                        op: CmpOp::Eq,
                        lhs: object,
                        rhs: null,
                    },
                    IrType::I1,
                );
                let token = self.const_word(u64::from(class_id.raw()));
                let is_instance = self.emit_intrinsic(RuntimeFn::InstanceOf, vec![object, token]);
                let ok = self.emit(
                    InstKind::Bin {
                        op: BinOp::Or,
                        lhs: is_null,
                        rhs: is_instance,
                    },
                    IrType::I32,
                );
                let fail = self.b.new_block();
                let cont = self.b.new_block();
                self.b.terminate(Terminator::CondBr {
                    cond: ok,
                    then_block: cont,
                    else_block: fail,
                });
                self.b.switch_to(fail);
                self.emit_intrinsic(RuntimeFn::ClassCastException, vec![]);
                let exc = self.exception_block(ctx, pc)?;
                self.b.terminate(Terminator::Br(exc));
                self.b.switch_to(cont);
            }
            Instr::InstanceOf(index) => {
                let class_sym = ctx.pool.class_ref(index)?;
                let class_id = self.resolve_class_sym(class_sym)?;
                let (object, _) = ctx.pop_value()?;
                let token = self.const_word(u64::from(class_id.raw()));
                let v = self.emit_intrinsic(RuntimeFn::InstanceOf, vec![object, token]);
                ctx.push_value(v, ValueShape::Int);
            }

            Instr::MonitorEnter | Instr::MonitorExit => {
                let f = if matches!(instr, Instr::MonitorEnter) {
                    RuntimeFn::MonitorEnter
                } else {
                    RuntimeFn::MonitorExit
                };
                let (object, _) = ctx.pop_value()?;
                self.null_check(ctx, pc, object)?;
                self.emit_intrinsic(f, vec![object]);
                self.pending_check(ctx, pc)?;
            }

            Instr::AThrow => {
                let (object, _) = ctx.pop_value()?;
                self.null_check(ctx, pc, object)?;
                self.emit_intrinsic(RuntimeFn::ThrowException, vec![object]);
                let exc = self.exception_block(ctx, pc)?;
                self.b.terminate(Terminator::Br(exc));
            }

            Instr::InvokeStatic(index) => self.invoke_static(ctx, pc, index)?,
            Instr::InvokeSpecial(index) => self.invoke_special(ctx, pc, index)?,
            Instr::InvokeVirtual(index) => self.invoke_virtual(ctx, pc, index)?,
            Instr::InvokeInterface(index) => self.invoke_interface(ctx, pc, index)?,
        }
        Ok(())
    }

    fn lower_ldc(&mut self, ctx: &mut MethodCtx, pc: usize, index: u16) -> Result<(), VmError> {
        let constant = ctx.pool.get(index)?.clone();
        match constant {
            Constant::Integer(v) => {
                let value = self.emit(InstKind::ConstI32(v), IrType::I32);
                ctx.push_value(value, ValueShape::Int);
            }
            Constant::Long(v) => {
                let value = self.emit(InstKind::ConstI64(v), IrType::I64);
                ctx.push_value(value, ValueShape::Long);
            }
            Constant::Float(v) => {
                let value = self.emit(InstKind::ConstF32(v.to_bits()), IrType::F32);
                ctx.push_value(value, ValueShape::Float);
            }
            Constant::Double(v) => {
                let value = self.emit(InstKind::ConstF64(v.to_bits()), IrType::F64);
                ctx.push_value(value, ValueShape::Double);
            }
            Constant::StringConst(sym) | Constant::Utf8(sym) => {
                let token = self.const_word(sym.into_usize() as u64);
                let value = self.emit_intrinsic(RuntimeFn::StringLookup, vec![token]);
                self.pending_check(ctx, pc)?;
                ctx.push_value(value, ValueShape::Ref);
            }
            other => {
                return Err(VmError::ClassFormat(format!(
                    "unsupported ldc constant {other:?}"
                )));
            }
        }
        Ok(())
    }

    fn lower_arith(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
        shape: ValueShape,
        op: ArithOp,
    ) -> Result<(), VmError> {
        let (rhs, _) = ctx.pop_value()?;
        let (lhs, _) = ctx.pop_value()?;
        let integral = matches!(shape, ValueShape::Int | ValueShape::Long);
        if integral && matches!(op, ArithOp::Div | ArithOp::Rem) && self.opts.emit_checks {
            let zero = match shape {
                ValueShape::Int => self.emit(InstKind::ConstI32(0), IrType::I32),
                _ => self.emit(InstKind::ConstI64(0), IrType::I64),
            };
            let is_zero = self.emit(
                InstKind::Cmp {
                    op: CmpOp::Eq,
                    lhs: rhs,
                    rhs: zero,
                },
                IrType::I1,
            );
            let fail = self.b.new_block();
            let cont = self.b.new_block();
            self.b.terminate(Terminator::CondBr {
                cond: is_zero,
                then_block: fail,
                else_block: cont,
            });
            self.b.switch_to(fail);
            self.emit_intrinsic(RuntimeFn::ArithmeticException, vec![]);
            let exc = self.exception_block(ctx, pc)?;
            self.b.terminate(Terminator::Br(exc));
            self.b.switch_to(cont);
        }
        let bin = match op {
            ArithOp::Add => BinOp::Add,
            ArithOp::Sub => BinOp::Sub,
            ArithOp::Mul => BinOp::Mul,
            ArithOp::Div => BinOp::Div,
            ArithOp::Rem => BinOp::Rem,
            ArithOp::And => BinOp::And,
            ArithOp::Or => BinOp::Or,
            ArithOp::Xor => BinOp::Xor,
        };
        let v = self.emit(
            InstKind::Bin { op: bin, lhs, rhs },
            IrType::of_shape(shape),
        );
        ctx.push_value(v, shape);
        Ok(())
    }

    /// Sequenced selects yielding -1 / 0 / +1 with the NaN tie-break.
    fn three_way(
        &mut self,
        _ctx: &mut MethodCtx,
        lhs: ValueId,
        rhs: ValueId,
        nan: Option<bool>,
    ) -> Result<ValueId, VmError> {
        let lt = self.emit(InstKind::Cmp { op: CmpOp::Lt, lhs, rhs }, IrType::I1);
        let gt = self.emit(InstKind::Cmp { op: CmpOp::Gt, lhs, rhs }, IrType::I1);
        let one = self.emit(InstKind::ConstI32(1), IrType::I32);
        let minus_one = self.emit(InstKind::ConstI32(-1), IrType::I32);
        let zero = self.emit(InstKind::ConstI32(0), IrType::I32);
        let on_less = self.emit(
            InstKind::Select {
                cond: lt,
                then_value: minus_one,
                else_value: zero,
            },
            IrType::I32,
        );
        let ordered = self.emit(
            InstKind::Select {
                cond: gt,
                then_value: one,
                else_value: on_less,
            },
            IrType::I32,
        );
        match nan {
            None => Ok(ordered),
            Some(negative_on_nan) => {
                let unordered = self.emit(InstKind::Cmp { op: CmpOp::Uno, lhs, rhs }, IrType::I1);
                let nan_value = if negative_on_nan { minus_one } else { one };
                Ok(self.emit(
                    InstKind::Select {
                        cond: unordered,
                        then_value: nan_value,
                        else_value: ordered,
                    },
                    IrType::I32,
                ))
            }
        }
    }

    fn conditional_branch(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
        next_pc: usize,
        target: usize,
        cond: ValueId,
    ) -> Result<(), VmError> {
        self.back_edge_poll(ctx, pc, &[target])?;
        let stack = ctx.stack.clone();
        let then_block = self.branch_to(ctx, target, &stack)?;
        let else_block = self.branch_to(ctx, next_pc, &stack)?;
        self.b.terminate(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        });
        Ok(())
    }

    fn lower_return(&mut self, ctx: &mut MethodCtx, shape: Option<ValueShape>) -> Result<(), VmError> {
        let value = match shape {
            Some(_) => Some(ctx.pop_value()?.0),
            None => None,
        };
        if let Some(sync) = ctx.sync_object {
            self.emit_intrinsic(RuntimeFn::MonitorExit, vec![sync]);
        }
        match &mut ctx.ret {
            RetCtx::Outer => self.b.terminate(Terminator::Ret(value)),
            RetCtx::Inline {
                join,
                phi,
                returns_seen,
            } => {
                *returns_seen += 1;
                let join = *join;
                if let (Some((phi, _)), Some(value)) = (*phi, value) {
                    self.b.phi_add_incoming(phi, self.b.current, value);
                }
                self.b.terminate(Terminator::Br(join));
            }
        }
        Ok(())
    }

    pub(crate) fn null_check(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
        object: ValueId,
    ) -> Result<(), VmError> {
        if !self.opts.emit_checks {
            return Ok(());
        }
        let null = self.emit(InstKind::ConstNull, IrType::Ref);
        let is_null = self.emit(
            InstKind::Cmp {
                op: CmpOp::Eq,
                lhs: object,
                rhs: null,
            },
            IrType::I1,
        );
        let fail = self.b.new_block();
        let cont = self.b.new_block();
        self.b.terminate(Terminator::CondBr {
            cond: is_null,
            then_block: fail,
            else_block: cont,
        });
        self.b.switch_to(fail);
        self.emit_intrinsic(RuntimeFn::NullPointerException, vec![]);
        let exc = self.exception_block(ctx, pc)?;
        self.b.terminate(Terminator::Br(exc));
        self.b.switch_to(cont);
        Ok(())
    }

    fn bounds_check(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
        array: ValueId,
        index: ValueId,
    ) -> Result<(), VmError> {
        if !self.opts.emit_checks {
            return Ok(());
        }
        let length = self.emit(InstKind::ArrayLength { array }, IrType::I32);
        let zero = self.emit(InstKind::ConstI32(0), IrType::I32);
        let negative = self.emit(
            InstKind::Cmp {
                op: CmpOp::Lt,
                lhs: index,
                rhs: zero,
            },
            IrType::I1,
        );
        let too_big = self.emit(
            InstKind::Cmp {
                op: CmpOp::Ge,
                lhs: index,
                rhs: length,
            },
            IrType::I1,
        );
        let out = self.emit(
            InstKind::Bin {
                op: BinOp::Or,
                lhs: negative,
                rhs: too_big,
            },
            IrType::I32,
        );
        let fail = self.b.new_block();
        let cont = self.b.new_block();
        self.b.terminate(Terminator::CondBr {
            cond: out,
            then_block: fail,
            else_block: cont,
        });
        self.b.switch_to(fail);
        self.emit_intrinsic(RuntimeFn::IndexOutOfBounds, vec![array, index]);
        let exc = self.exception_block(ctx, pc)?;
        self.b.terminate(Terminator::Br(exc));
        self.b.switch_to(cont);
        Ok(())
    }

    // ---- invokes ----------------------------------------------------------

    fn invoke_static(&mut self, ctx: &mut MethodCtx, pc: usize, index: u16) -> Result<(), VmError> {
        let (class_sym, key) = self.member_ref(ctx, index)?;
        let desc = self.descriptor_of(&key)?;

        // Well-known math entry points lower straight to IR intrinsics.
        if class_sym == self.vm.br.java_lang_math_sym
            && let Some(intrinsic) = {
                let registry = self.vm.registry_read();
                RuntimeFn::math_intrinsic(registry.interner().resolve(&key.name))
            }
            && desc
                .params
                .iter()
                .all(|p| *p == TypeDescriptor::Primitive(PrimitiveKind::Double))
            && desc.ret == Some(TypeDescriptor::Primitive(PrimitiveKind::Double))
        {
            let args = self.pop_args(ctx, &desc)?;
            let v = self.emit_intrinsic(intrinsic, args);
            ctx.push_value(v, ValueShape::Double);
            return Ok(());
        }

        match self.resolve_class_sym(class_sym) {
            Ok(class_id) => {
                let method = self
                    .vm
                    .registry_read()
                    .lookup_method(class_id, key, true, true)?
                    .expect("lookup with throw=true returns Some");
                let token = self.const_word(u64::from(class_id.raw()));
                self.emit_intrinsic(RuntimeFn::InitialisationCheck, vec![token]);
                self.pending_check(ctx, pc)?;
                let args = self.pop_args(ctx, &desc)?;
                if self.can_inline(method) {
                    self.inline_call(ctx, pc, method, args, &desc)?;
                    return Ok(());
                }
                self.direct_call(ctx, pc, method, args, &desc)
            }
            Err(_) if self.opts.mode == CompileMode::AotCallback => {
                // Slow path through the resolver: the stub loads the target
                // on first use and tail-calls it.
                let token = self.vm.add_pending_ref(PendingRef {
                    loader: self.loader,
                    class: class_sym,
                    key,
                });
                let token_const = self.const_word(token);
                let code = self.emit_intrinsic(RuntimeFn::ResolveStaticStub, vec![token_const]);
                self.pending_check(ctx, pc)?;
                let args = self.pop_args(ctx, &desc)?;
                self.indirect_call(ctx, pc, code, args, &desc)
            }
            Err(e) => Err(e),
        }
    }

    fn invoke_special(&mut self, ctx: &mut MethodCtx, pc: usize, index: u16) -> Result<(), VmError> {
        let (class_sym, key) = self.member_ref(ctx, index)?;
        let desc = self.descriptor_of(&key)?;
        match self.resolve_class_sym(class_sym) {
            Ok(class_id) => {
                let method = self
                    .vm
                    .registry_read()
                    .lookup_method(class_id, key, false, true)?
                    .expect("lookup with throw=true returns Some");
                let mut args = self.pop_args(ctx, &desc)?;
                let (receiver, _) = ctx.pop_value()?;
                self.null_check(ctx, pc, receiver)?;
                args.insert(0, receiver);
                if self.can_inline(method) {
                    self.inline_call(ctx, pc, method, args, &desc)?;
                    return Ok(());
                }
                self.direct_call(ctx, pc, method, args, &desc)
            }
            Err(_) if self.opts.mode == CompileMode::AotCallback => {
                let token = self.vm.add_pending_ref(PendingRef {
                    loader: self.loader,
                    class: class_sym,
                    key,
                });
                let token_const = self.const_word(token);
                let code = self.emit_intrinsic(RuntimeFn::ResolveSpecialStub, vec![token_const]);
                self.pending_check(ctx, pc)?;
                let mut args = self.pop_args(ctx, &desc)?;
                let (receiver, _) = ctx.pop_value()?;
                self.null_check(ctx, pc, receiver)?;
                args.insert(0, receiver);
                self.indirect_call(ctx, pc, code, args, &desc)
            }
            Err(e) => Err(e),
        }
    }

    /// Load the VT through the receiver's header, pick the slot the method
    /// resolved to, and call through the code word.
    fn invoke_virtual(&mut self, ctx: &mut MethodCtx, pc: usize, index: u16) -> Result<(), VmError> {
        let (class_sym, key) = self.member_ref(ctx, index)?;
        let desc = self.descriptor_of(&key)?;
        let class_id = self.resolve_class_sym(class_sym)?;
        let method = self
            .vm
            .registry_read()
            .lookup_method(class_id, key, false, true)?
            .expect("lookup with throw=true returns Some");
        let vt_offset = self.vm.registry_read().get_method(method).vt_offset();

        let mut args = self.pop_args(ctx, &desc)?;
        let (receiver, _) = ctx.pop_value()?;
        self.null_check(ctx, pc, receiver)?;
        args.insert(0, receiver);

        match vt_offset {
            // Private and constructor-adjacent targets dispatch directly.
            None => self.direct_call(ctx, pc, method, args, &desc),
            Some(offset) => {
                let vt = self.emit(InstKind::LoadVt { object: receiver }, IrType::Word);
                let code = self.emit(InstKind::LoadVtSlot { vt, offset }, IrType::Word);
                self.indirect_call(ctx, pc, code, args, &desc)
            }
        }
    }

    fn invoke_interface(&mut self, ctx: &mut MethodCtx, pc: usize, index: u16) -> Result<(), VmError> {
        let (class_sym, key) = self.member_ref(ctx, index)?;
        let desc = self.descriptor_of(&key)?;
        let interface_id = self.resolve_class_sym(class_sym)?;
        let interface_method = self
            .vm
            .registry_read()
            .lookup_method(interface_id, key, false, true)?
            .expect("lookup with throw=true returns Some");

        let mut args = self.pop_args(ctx, &desc)?;
        let (receiver, _) = ctx.pop_value()?;
        self.null_check(ctx, pc, receiver)?;
        args.insert(0, receiver);

        let code = if self.opts.use_inline_caches {
            self.interface_via_envelope(ctx, pc, interface_method, receiver)?
        } else {
            self.interface_via_imt(ctx, pc, interface_method, receiver, &key)?
        };
        self.indirect_call(ctx, pc, code, args, &desc)
    }

    /// Envelope protocol: compare the receiver class against the head
    /// snapshot, fall into the resolver on a miss, read the method word
    /// (and box flag) from the node.
    fn interface_via_envelope(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
        interface_method: crate::keys::MethodId,
        receiver: ValueId,
    ) -> Result<ValueId, VmError> {
        let envelope_id = self.vm.envelopes.allocate(interface_method);
        let envelope = self.const_word(u64::from(envelope_id.raw()));
        let head_class = self.emit(InstKind::EnvelopeHeadClass { envelope }, IrType::Word);
        let vt = self.emit(InstKind::LoadVt { object: receiver }, IrType::Word);
        let hit = self.emit(
            InstKind::Cmp {
                op: CmpOp::Eq,
                lhs: vt,
                rhs: head_class,
            },
            IrType::I1,
        );
        let fast = self.b.new_block();
        let miss = self.b.new_block();
        let join = self.b.new_block();
        self.b.terminate(Terminator::CondBr {
            cond: hit,
            then_block: fast,
            else_block: miss,
        });

        self.b.switch_to(fast);
        let fast_entry = self.emit(InstKind::EnvelopeHeadEntry { envelope }, IrType::Word);
        let fast_pred = self.b.current;
        self.b.terminate(Terminator::Br(join));

        self.b.switch_to(miss);
        let miss_entry = self.emit_intrinsic(RuntimeFn::VirtualLookup, vec![envelope, receiver]);
        self.pending_check(ctx, pc)?;
        let miss_pred = self.b.current;
        self.b.terminate(Terminator::Br(join));

        self.b.switch_to(join);
        let entry = self.b.add_phi(join, IrType::Word, self.cur_bc);
        self.b.phi_add_incoming(entry, fast_pred, fast_entry);
        self.b.phi_add_incoming(entry, miss_pred, miss_entry);
        let mask = self.const_word(0xFFFF_FFFF);
        let code = self.emit(
            InstKind::Bin {
                op: BinOp::And,
                lhs: entry,
                rhs: mask,
            },
            IrType::Word,
        );
        // The box flag sits at bit 32; receiver unboxing is the identity in
        // this object model, so the flag is observed but not acted on here.
        Ok(code)
    }

    /// IMT protocol: hash the interface method into its slot, follow the
    /// tag bit, walk the collision chain comparing method words.
    fn interface_via_imt(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
        interface_method: crate::keys::MethodId,
        receiver: ValueId,
        key: &MethodKey,
    ) -> Result<ValueId, VmError> {
        let slot_index = {
            let registry = self.vm.registry_read();
            imt_hash(
                registry.interner().resolve(&key.name),
                registry.interner().resolve(&key.desc),
            ) as u8
        };
        let vt = self.emit(InstKind::LoadVt { object: receiver }, IrType::Word);
        let slot = self.emit(
            InstKind::LoadImtSlot {
                vt,
                index: slot_index,
            },
            IrType::Word,
        );
        let zero = self.const_word(0);
        let one = self.const_word(1);
        let method_word = self.const_word(u64::from(interface_method.raw()));

        let direct = self.b.new_block();
        let tagged = self.b.new_block();
        let miss = self.b.new_block();
        let join = self.b.new_block();

        let empty = self.emit(
            InstKind::Cmp {
                op: CmpOp::Eq,
                lhs: slot,
                rhs: zero,
            },
            IrType::I1,
        );
        let nonempty = self.b.new_block();
        self.b.terminate(Terminator::CondBr {
            cond: empty,
            then_block: miss,
            else_block: nonempty,
        });

        self.b.switch_to(nonempty);
        let tag = self.emit(
            InstKind::Bin {
                op: BinOp::And,
                lhs: slot,
                rhs: one,
            },
            IrType::Word,
        );
        let is_tagged = self.emit(
            InstKind::Cmp {
                op: CmpOp::Ne,
                lhs: tag,
                rhs: zero,
            },
            IrType::I1,
        );
        self.b.terminate(Terminator::CondBr {
            cond: is_tagged,
            then_block: tagged,
            else_block: direct,
        });

        // Untagged slot: the code word shifted into place.
        self.b.switch_to(direct);
        let direct_code = self.emit(
            InstKind::Bin {
                op: BinOp::Shr,
                lhs: slot,
                rhs: one,
            },
            IrType::Word,
        );
        let direct_pred = self.b.current;
        self.b.terminate(Terminator::Br(join));

        // Collision chain: compare interface-method words until a match or
        // the null terminator.
        self.b.switch_to(tagged);
        let loop_head = self.b.new_block();
        let index_zero = self.emit(InstKind::ConstI32(0), IrType::I32);
        let tagged_pred = self.b.current;
        self.b.terminate(Terminator::Br(loop_head));

        self.b.switch_to(loop_head);
        let index_phi = self.b.add_phi(loop_head, IrType::I32, self.cur_bc);
        self.b.phi_add_incoming(index_phi, tagged_pred, index_zero);
        let pair_method = self.emit(
            InstKind::ChainMethod {
                vt,
                slot,
                index: index_phi,
            },
            IrType::Word,
        );
        let found = self.emit(
            InstKind::Cmp {
                op: CmpOp::Eq,
                lhs: pair_method,
                rhs: method_word,
            },
            IrType::I1,
        );
        let got = self.b.new_block();
        let not_found = self.b.new_block();
        self.b.terminate(Terminator::CondBr {
            cond: found,
            then_block: got,
            else_block: not_found,
        });

        self.b.switch_to(got);
        let chain_code = self.emit(
            InstKind::ChainCode {
                vt,
                slot,
                index: index_phi,
            },
            IrType::Word,
        );
        let got_pred = self.b.current;
        self.b.terminate(Terminator::Br(join));

        self.b.switch_to(not_found);
        let at_end = self.emit(
            InstKind::Cmp {
                op: CmpOp::Eq,
                lhs: pair_method,
                rhs: zero,
            },
            IrType::I1,
        );
        let advance = self.b.new_block();
        self.b.terminate(Terminator::CondBr {
            cond: at_end,
            then_block: miss,
            else_block: advance,
        });

        self.b.switch_to(advance);
        let one_i32 = self.emit(InstKind::ConstI32(1), IrType::I32);
        let next_index = self.emit(
            InstKind::Bin {
                op: BinOp::Add,
                lhs: index_phi,
                rhs: one_i32,
            },
            IrType::I32,
        );
        self.b.phi_add_incoming(index_phi, self.b.current, next_index);
        self.b.terminate(Terminator::Br(loop_head));

        // Miss: resolve through the class model.
        self.b.switch_to(miss);
        let miss_code =
            self.emit_intrinsic(RuntimeFn::InterfaceLookup, vec![receiver, method_word]);
        self.pending_check(ctx, pc)?;
        let miss_pred = self.b.current;
        self.b.terminate(Terminator::Br(join));

        self.b.switch_to(join);
        let code = self.b.add_phi(join, IrType::Word, self.cur_bc);
        self.b.phi_add_incoming(code, direct_pred, direct_code);
        self.b.phi_add_incoming(code, got_pred, chain_code);
        self.b.phi_add_incoming(code, miss_pred, miss_code);
        Ok(code)
    }

    fn direct_call(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
        method: crate::keys::MethodId,
        args: Vec<ValueId>,
        desc: &crate::ty::MethodDescriptor,
    ) -> Result<(), VmError> {
        let ret = desc
            .ret_shape()
            .map(IrType::of_shape)
            .unwrap_or(IrType::Void);
        let result = self.emit(
            InstKind::Call {
                callee: Callee::Method(method),
                args,
            },
            ret,
        );
        self.pending_check(ctx, pc)?;
        if let Some(shape) = desc.ret_shape() {
            ctx.push_value(result, shape);
        }
        Ok(())
    }

    fn indirect_call(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
        code: ValueId,
        args: Vec<ValueId>,
        desc: &crate::ty::MethodDescriptor,
    ) -> Result<(), VmError> {
        let ret = desc
            .ret_shape()
            .map(IrType::of_shape)
            .unwrap_or(IrType::Void);
        let result = self.emit(
            InstKind::Call {
                callee: Callee::CodeWord(code),
                args,
            },
            ret,
        );
        self.pending_check(ctx, pc)?;
        if let Some(shape) = desc.ret_shape() {
            ctx.push_value(result, shape);
        }
        Ok(())
    }
}

fn cmp_op(kind: CmpKind) -> CmpOp {
    match kind {
        CmpKind::Eq => CmpOp::Eq,
        CmpKind::Ne => CmpOp::Ne,
        CmpKind::Lt => CmpOp::Lt,
        CmpKind::Ge => CmpOp::Ge,
        CmpKind::Gt => CmpOp::Gt,
        CmpKind::Le => CmpOp::Le,
    }
}

fn value_shape_of_mem(shape: MemShape) -> ValueShape {
    match shape {
        MemShape::I8 | MemShape::I16 | MemShape::U16 | MemShape::I32 => ValueShape::Int,
        MemShape::I64 => ValueShape::Long,
        MemShape::F32 => ValueShape::Float,
        MemShape::F64 => ValueShape::Double,
        MemShape::Ref => ValueShape::Ref,
    }
}

fn stack_underflow() -> VmError {
    VmError::ClassFormat("operand stack underflow".to_string())
}
