//! Signature lowering: the one-way mapping from guest signatures to native
//! function types, plus the per-signature helper functions — three
//! resolution stubs and the call-buf/AP reflective trampolines — generated
//! on demand and cached per interned descriptor.

use crate::backend::Backend;
use crate::error::VmError;
use crate::heap::GcRef;
use crate::intrinsics::RuntimeFn;
use crate::ir::{
    Callee, CmpOp, ConvOp, FnSig, FunctionBuilder, InstKind, IrType, MemShape, Terminator,
};
use crate::keys::{FunctionId, SignatureId};
use crate::ty::{MethodDescriptor, TypeDescriptor, ValueShape};
use crate::vm::{Value, VirtualMachine};
use dashmap::DashMap;
use std::sync::Arc;

fn ir_type_of(ty: &TypeDescriptor) -> IrType {
    IrType::of_shape(ty.shape())
}

fn ret_type_of(desc: &MethodDescriptor) -> IrType {
    desc.ret.as_ref().map(ir_type_of).unwrap_or(IrType::Void)
}

/// The four function types every signature lowers to.
#[derive(Debug, Clone)]
pub struct SignatureInfo {
    /// `(this, args…) → ret`.
    pub virtual_type: FnSig,
    /// `(args…) → ret`.
    pub static_type: FnSig,
    /// `(env, class_or_receiver, handles…) → ret`; object arguments pass
    /// through handle slots.
    pub native_type: FnSig,
    /// `(ctp, fn, [this,] buf) → ret`; arguments read from a caller-packed
    /// buffer.
    pub buf_type: FnSig,
}

impl SignatureInfo {
    fn build(desc: &MethodDescriptor) -> Self {
        let ret = ret_type_of(desc);
        let params: Vec<IrType> = desc.params.iter().map(ir_type_of).collect();

        let mut virtual_params = vec![IrType::Ref];
        virtual_params.extend(params.iter().copied());

        let mut native_params = vec![IrType::Word, IrType::Ref];
        native_params.extend(params.iter().copied());

        let buf_params = vec![IrType::Word, IrType::Word, IrType::Ref, IrType::Ref];

        Self {
            virtual_type: FnSig {
                params: virtual_params,
                ret,
            },
            static_type: FnSig {
                params: params.clone(),
                ret,
            },
            native_type: FnSig {
                params: native_params,
                ret,
            },
            buf_type: FnSig {
                params: buf_params,
                ret,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Flavor {
    VirtualStub,
    SpecialStub,
    StaticStub,
    VirtualBuf,
    StaticBuf,
    VirtualAp,
    StaticAp,
}

/// Per-signature cache of lowered types and generated helpers.
#[derive(Default)]
pub struct SignatureLowerer {
    infos: DashMap<SignatureId, Arc<SignatureInfo>>,
    helpers: DashMap<(SignatureId, Flavor), FunctionId>,
}

impl SignatureLowerer {
    pub fn info(&self, vm: &VirtualMachine, sig: SignatureId) -> Arc<SignatureInfo> {
        if let Some(info) = self.infos.get(&sig) {
            return info.clone();
        }
        let built = {
            let registry = vm.registry_read();
            Arc::new(SignatureInfo::build(registry.get_signature(sig)))
        };
        self.infos.entry(sig).or_insert(built).clone()
    }

    pub fn virtual_stub(&self, vm: &VirtualMachine, sig: SignatureId) -> Result<FunctionId, VmError> {
        self.helper(vm, sig, Flavor::VirtualStub)
    }

    pub fn special_stub(&self, vm: &VirtualMachine, sig: SignatureId) -> Result<FunctionId, VmError> {
        self.helper(vm, sig, Flavor::SpecialStub)
    }

    pub fn static_stub(&self, vm: &VirtualMachine, sig: SignatureId) -> Result<FunctionId, VmError> {
        self.helper(vm, sig, Flavor::StaticStub)
    }

    pub fn virtual_buf(&self, vm: &VirtualMachine, sig: SignatureId) -> Result<FunctionId, VmError> {
        self.helper(vm, sig, Flavor::VirtualBuf)
    }

    pub fn static_buf(&self, vm: &VirtualMachine, sig: SignatureId) -> Result<FunctionId, VmError> {
        self.helper(vm, sig, Flavor::StaticBuf)
    }

    pub fn virtual_ap(&self, vm: &VirtualMachine, sig: SignatureId) -> Result<FunctionId, VmError> {
        self.helper(vm, sig, Flavor::VirtualAp)
    }

    pub fn static_ap(&self, vm: &VirtualMachine, sig: SignatureId) -> Result<FunctionId, VmError> {
        self.helper(vm, sig, Flavor::StaticAp)
    }

    fn helper(
        &self,
        vm: &VirtualMachine,
        sig: SignatureId,
        flavor: Flavor,
    ) -> Result<FunctionId, VmError> {
        if let Some(id) = self.helpers.get(&(sig, flavor)) {
            return Ok(*id);
        }
        let desc = {
            let registry = vm.registry_read();
            registry.get_signature(sig).clone()
        };
        let desc_name = {
            let registry = vm.registry_read();
            let mut out = String::from("(");
            for p in &desc.params {
                p.write_descriptor(&mut out, registry.interner());
            }
            out.push(')');
            match &desc.ret {
                Some(r) => r.write_descriptor(&mut out, registry.interner()),
                None => out.push('V'),
            }
            out
        };
        let body = match flavor {
            Flavor::VirtualStub => build_stub(&desc, &desc_name, "virtual", true, RuntimeFn::ResolveVirtualStub),
            Flavor::SpecialStub => build_stub(&desc, &desc_name, "special", true, RuntimeFn::ResolveSpecialStub),
            Flavor::StaticStub => build_stub(&desc, &desc_name, "static", false, RuntimeFn::ResolveStaticStub),
            Flavor::VirtualBuf => build_call_buf(&desc, &desc_name, "buf.virtual", true),
            Flavor::StaticBuf => build_call_buf(&desc, &desc_name, "buf.static", false),
            Flavor::VirtualAp => build_call_buf(&desc, &desc_name, "ap.virtual", true),
            Flavor::StaticAp => build_call_buf(&desc, &desc_name, "ap.static", false),
        };
        let id = vm.engine.define_function(body)?;
        self.helpers.insert((sig, flavor), id);
        Ok(id)
    }
}

/// A stub calls the runtime resolver, then tail-calls the returned target
/// with the original arguments; a null resolution falls through to the
/// null-return slot.
fn build_stub(
    desc: &MethodDescriptor,
    desc_name: &str,
    kind: &str,
    has_receiver: bool,
    resolver: RuntimeFn,
) -> crate::ir::FunctionIr {
    let ret = ret_type_of(desc);
    let mut params = vec![IrType::Word];
    if has_receiver {
        params.push(IrType::Ref);
    }
    params.extend(desc.params.iter().map(ir_type_of));
    let sig = FnSig {
        params: params.clone(),
        ret,
    };
    let mut b = FunctionBuilder::new(format!("vmkit.stub.{kind}.{desc_name}"), sig, None);

    let token = b.push(InstKind::Arg(0), IrType::Word, 0);
    let code = b.push(
        InstKind::Call {
            callee: Callee::Intrinsic(resolver),
            args: vec![token],
        },
        IrType::Word,
        0,
    );
    let zero = b.push(InstKind::ConstWord(0), IrType::Word, 0);
    let is_null = b.push(
        InstKind::Cmp {
            op: CmpOp::Eq,
            lhs: code,
            rhs: zero,
        },
        IrType::I1,
        0,
    );
    let null_slot = b.new_block();
    let tail = b.new_block();
    b.terminate(Terminator::CondBr {
        cond: is_null,
        then_block: null_slot,
        else_block: tail,
    });

    b.switch_to(null_slot);
    emit_default_return(&mut b, ret);

    b.switch_to(tail);
    let mut forwarded = Vec::new();
    for index in 1..params.len() {
        let ty = params[index];
        forwarded.push(b.push(InstKind::Arg(index as u16), ty, 0));
    }
    let result = b.push(
        InstKind::Call {
            callee: Callee::CodeWord(code),
            args: forwarded,
        },
        ret,
        0,
    );
    match ret {
        IrType::Void => b.terminate(Terminator::Ret(None)),
        _ => b.terminate(Terminator::Ret(Some(result))),
    }
    b.finish()
}

fn emit_default_return(b: &mut FunctionBuilder, ret: IrType) {
    match ret {
        IrType::Void => b.terminate(Terminator::Ret(None)),
        IrType::I32 | IrType::I1 => {
            let v = b.push(InstKind::ConstI32(0), IrType::I32, 0);
            b.terminate(Terminator::Ret(Some(v)));
        }
        IrType::I64 | IrType::Word => {
            let v = b.push(InstKind::ConstI64(0), IrType::I64, 0);
            b.terminate(Terminator::Ret(Some(v)));
        }
        IrType::F32 => {
            let v = b.push(InstKind::ConstF32(0f32.to_bits()), IrType::F32, 0);
            b.terminate(Terminator::Ret(Some(v)));
        }
        IrType::F64 => {
            let v = b.push(InstKind::ConstF64(0f64.to_bits()), IrType::F64, 0);
            b.terminate(Terminator::Ret(Some(v)));
        }
        IrType::Ref => {
            let v = b.push(InstKind::ConstNull, IrType::Ref, 0);
            b.terminate(Terminator::Ret(Some(v)));
        }
    }
}

/// Reflective trampoline: reads each argument from the caller-packed word
/// buffer, widens it to its declared type, and forwards to the typed target.
fn build_call_buf(
    desc: &MethodDescriptor,
    desc_name: &str,
    kind: &str,
    has_receiver: bool,
) -> crate::ir::FunctionIr {
    let ret = ret_type_of(desc);
    let sig = FnSig {
        params: vec![IrType::Word, IrType::Word, IrType::Ref, IrType::Ref],
        ret,
    };
    let mut b = FunctionBuilder::new(format!("vmkit.{kind}.{desc_name}"), sig, None);

    let _ctp = b.push(InstKind::Arg(0), IrType::Word, 0);
    let target = b.push(InstKind::Arg(1), IrType::Word, 0);
    let receiver = b.push(InstKind::Arg(2), IrType::Ref, 0);
    let buf = b.push(InstKind::Arg(3), IrType::Ref, 0);

    let mut args = Vec::new();
    if has_receiver {
        args.push(receiver);
    }
    for (index, param) in desc.params.iter().enumerate() {
        let slot = b.push(InstKind::ConstI32(index as i32), IrType::I32, 0);
        let raw = b.push(
            InstKind::ArrayLoad {
                array: buf,
                index: slot,
                shape: MemShape::I64,
            },
            IrType::I64,
            0,
        );
        let value = match param.shape() {
            ValueShape::Int => b.push(
                InstKind::Convert {
                    op: ConvOp::L2I,
                    value: raw,
                },
                IrType::I32,
                0,
            ),
            ValueShape::Long => raw,
            ValueShape::Float => {
                let low = b.push(
                    InstKind::Convert {
                        op: ConvOp::L2I,
                        value: raw,
                    },
                    IrType::I32,
                    0,
                );
                b.push(
                    InstKind::Convert {
                        op: ConvOp::BitsToF32,
                        value: low,
                    },
                    IrType::F32,
                    0,
                )
            }
            ValueShape::Double => b.push(
                InstKind::Convert {
                    op: ConvOp::BitsToF64,
                    value: raw,
                },
                IrType::F64,
                0,
            ),
            ValueShape::Ref => b.push(
                InstKind::Convert {
                    op: ConvOp::WordToRef,
                    value: raw,
                },
                IrType::Ref,
                0,
            ),
        };
        args.push(value);
    }

    let result = b.push(
        InstKind::Call {
            callee: Callee::CodeWord(target),
            args,
        },
        ret,
        0,
    );
    match ret {
        IrType::Void => b.terminate(Terminator::Ret(None)),
        _ => b.terminate(Terminator::Ret(Some(result))),
    }
    b.finish()
}

/// Packs argument values into the word buffer a call-buf trampoline reads;
/// the runtime half of the round-trip.
pub fn pack_args(
    vm: &VirtualMachine,
    desc: &MethodDescriptor,
    args: &[Value],
) -> Result<GcRef, VmError> {
    debug_assert_eq!(desc.params.len(), args.len());
    let long_array_sym = vm.interner().get_or_intern("[J");
    let class_id = {
        let mut registry = vm.registry_write();
        registry.get_or_load(crate::rt::registry::BOOT_LOADER, long_array_sym)?
    };
    let mut heap = vm.heap_write();
    let buf = heap.alloc_array(class_id, MemShape::I64, args.len())?;
    for (index, value) in args.iter().enumerate() {
        let raw: i64 = match value {
            Value::Int(v) => i64::from(*v),
            Value::Long(v) => *v,
            Value::Float(v) => i64::from(v.to_bits()),
            Value::Double(v) => v.to_bits() as i64,
            Value::Ref(v) => *v as i64,
        };
        let (offset, shape) = heap.array_elem_offset(buf, index)?;
        heap.write(buf, offset, shape, Value::Long(raw))?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lasso::ThreadedRodeo;

    fn desc(text: &str) -> MethodDescriptor {
        MethodDescriptor::parse(text, &ThreadedRodeo::default()).unwrap()
    }

    #[test]
    fn virtual_type_has_receiver_first() {
        let info = SignatureInfo::build(&desc("(IJ)V"));
        assert_eq!(
            info.virtual_type.params,
            vec![IrType::Ref, IrType::I32, IrType::I64]
        );
        assert_eq!(info.static_type.params, vec![IrType::I32, IrType::I64]);
        assert_eq!(info.virtual_type.ret, IrType::Void);
    }

    #[test]
    fn native_type_prepends_env_and_receiver_slot() {
        let info = SignatureInfo::build(&desc("(Ljava/lang/String;)I"));
        assert_eq!(
            info.native_type.params,
            vec![IrType::Word, IrType::Ref, IrType::Ref]
        );
        assert_eq!(info.native_type.ret, IrType::I32);
    }

    #[test]
    fn stub_bodies_verify_and_have_a_null_return_slot() {
        let d = desc("(ID)J");
        let body = build_stub(&d, "(ID)J", "static", false, RuntimeFn::ResolveStaticStub);
        crate::ir::verify(&body).unwrap();
        assert_eq!(body.blocks.len(), 3);
        assert_eq!(body.sig.params[0], IrType::Word);
    }

    #[test]
    fn call_buf_bodies_verify_for_every_shape() {
        for text in ["()V", "(I)I", "(JFD)D", "(Ljava/lang/Object;I)V"] {
            let d = desc(text);
            let body = build_call_buf(&d, text, "buf.static", false);
            crate::ir::verify(&body).unwrap();
        }
    }
}
