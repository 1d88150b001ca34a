//! The SSA intermediate representation the translator targets.
//!
//! Only what the pipeline relies on: integer/float/reference values, basic
//! blocks, PHI nodes, loads/stores, calls, and the runtime-ABI access forms
//! (object header, VT and IMT words, array elements). Backends lower the
//! ABI forms using the offsets the intrinsics module publishes.

use crate::error::VmError;
use crate::keys::{ClassId, FunctionId, MethodId};
use crate::intrinsics::RuntimeFn;
use crate::ty::ValueShape;
use std::collections::HashMap;

pub type ValueId = u32;
pub type BlockId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrType {
    I1,
    I32,
    I64,
    F32,
    F64,
    Ref,
    /// Untyped machine word: code handles, metadata slots.
    Word,
    Void,
}

impl IrType {
    pub fn of_shape(shape: ValueShape) -> Self {
        match shape {
            ValueShape::Int => IrType::I32,
            ValueShape::Long => IrType::I64,
            ValueShape::Float => IrType::F32,
            ValueShape::Double => IrType::F64,
            ValueShape::Ref => IrType::Ref,
        }
    }
}

/// In-memory access widths for fields and array elements; sub-int widths
/// widen on load the way the guest requires (bytes and shorts sign-extend,
/// chars zero-extend).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemShape {
    I8,
    I16,
    U16,
    I32,
    I64,
    F32,
    F64,
    Ref,
}

impl MemShape {
    pub fn byte_size(self) -> usize {
        match self {
            MemShape::I8 => 1,
            MemShape::I16 | MemShape::U16 => 2,
            MemShape::I32 | MemShape::F32 => 4,
            MemShape::I64 | MemShape::F64 | MemShape::Ref => 8,
        }
    }

    pub fn ir_type(self) -> IrType {
        match self {
            MemShape::I8 | MemShape::I16 | MemShape::U16 | MemShape::I32 => IrType::I32,
            MemShape::I64 => IrType::I64,
            MemShape::F32 => IrType::F32,
            MemShape::F64 => IrType::F64,
            MemShape::Ref => IrType::Ref,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// True when either float operand is NaN.
    Uno,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvOp {
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
    /// Raw-bits view changes, used by the call-buf trampolines.
    BitsToF32,
    BitsToF64,
    F32ToBits,
    F64ToBits,
    /// Word/reference view changes for serialised argument buffers.
    WordToRef,
    RefToWord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    /// Resolved guest method; the engine materialises on first entry.
    Method(MethodId),
    /// IR-level function (stubs, call-buf trampolines, initializers).
    Function(FunctionId),
    /// Indirect call through a loaded code word.
    CodeWord(ValueId),
    /// Runtime support entry point.
    Intrinsic(RuntimeFn),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Arg(u16),
    ConstI32(i32),
    ConstI64(i64),
    ConstF32(u32),
    ConstF64(u64),
    ConstNull,
    ConstWord(u64),
    /// Stack cell for a local variable; the backend's optimiser promotes
    /// these to registers.
    Alloca(ValueShape),
    Load {
        slot: ValueId,
        shape: ValueShape,
    },
    Store {
        slot: ValueId,
        value: ValueId,
    },
    FieldLoad {
        object: ValueId,
        offset: u32,
        shape: MemShape,
    },
    FieldStore {
        object: ValueId,
        offset: u32,
        shape: MemShape,
        value: ValueId,
    },
    ArrayLoad {
        array: ValueId,
        index: ValueId,
        shape: MemShape,
    },
    ArrayStore {
        array: ValueId,
        index: ValueId,
        shape: MemShape,
        value: ValueId,
    },
    ArrayLength {
        array: ValueId,
    },
    /// Base reference of a class's static instance.
    StaticBase(ClassId),
    /// VT word from an object header.
    LoadVt {
        object: ValueId,
    },
    /// Code word from a VT method slot.
    LoadVtSlot {
        vt: ValueId,
        offset: u16,
    },
    /// Tagged word from an IMT slot.
    LoadImtSlot {
        vt: ValueId,
        index: u8,
    },
    /// Interface-method word at position `index` of the collision chain the
    /// tagged slot word points into; yields 0 past the end (the null
    /// terminator).
    ChainMethod {
        vt: ValueId,
        slot: ValueId,
        index: ValueId,
    },
    /// Code word at position `index` of a collision chain.
    ChainCode {
        vt: ValueId,
        slot: ValueId,
        index: ValueId,
    },
    /// Class word of an envelope's head cache node; 0 while empty.
    EnvelopeHeadClass {
        envelope: ValueId,
    },
    /// Packed `code | boxed << 32` entry word of the head cache node.
    EnvelopeHeadEntry {
        envelope: ValueId,
    },
    Bin {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    Cmp {
        op: CmpOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    Select {
        cond: ValueId,
        then_value: ValueId,
        else_value: ValueId,
    },
    Convert {
        op: ConvOp,
        value: ValueId,
    },
    Phi {
        incomings: Vec<(BlockId, ValueId)>,
    },
    Call {
        callee: Callee,
        args: Vec<ValueId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: ValueId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Switch {
        value: ValueId,
        default: BlockId,
        arms: Vec<(i32, BlockId)>,
    },
    Ret(Option<ValueId>),
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct Inst {
    pub kind: InstKind,
    pub ty: IrType,
    /// Bytecode offset this instruction was lowered from; drives the
    /// PC-to-line attribution recorded per function.
    pub bc: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub phis: Vec<ValueId>,
    pub insts: Vec<ValueId>,
    pub term: Option<Terminator>,
}

#[derive(Debug, Clone)]
pub struct FnSig {
    pub params: Vec<IrType>,
    pub ret: IrType,
}

#[derive(Debug, Clone)]
pub struct FunctionIr {
    pub name: String,
    pub sig: FnSig,
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
    pub entry: BlockId,
    /// Ref-shaped allocas declared as GC roots; the stack map.
    pub gc_roots: Vec<ValueId>,
    /// `(bytecode offset, source line)` pairs, ascending.
    pub line_table: Vec<(u32, u16)>,
    pub method: Option<MethodId>,
}

impl FunctionIr {
    pub fn inst(&self, value: ValueId) -> &Inst {
        &self.insts[value as usize]
    }

    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block as usize]
    }

    pub fn line_for_bc(&self, bc: u32) -> Option<u16> {
        let mut line = None;
        for (offset, entry) in &self.line_table {
            if *offset <= bc {
                line = Some(*entry);
            } else {
                break;
            }
        }
        line
    }
}

pub struct FunctionBuilder {
    f: FunctionIr,
    pub current: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, sig: FnSig, method: Option<MethodId>) -> Self {
        let f = FunctionIr {
            name: name.into(),
            sig,
            blocks: vec![Block::default()],
            insts: Vec::new(),
            entry: 0,
            gc_roots: Vec::new(),
            line_table: Vec::new(),
            method,
        };
        Self { f, current: 0 }
    }

    pub fn sig(&self) -> &FnSig {
        &self.f.sig
    }

    pub fn new_block(&mut self) -> BlockId {
        self.f.blocks.push(Block::default());
        (self.f.blocks.len() - 1) as BlockId
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn is_terminated(&self, block: BlockId) -> bool {
        self.f.blocks[block as usize].term.is_some()
    }

    pub fn push(&mut self, kind: InstKind, ty: IrType, bc: u32) -> ValueId {
        let value = self.f.insts.len() as ValueId;
        self.f.insts.push(Inst { kind, ty, bc });
        self.f.blocks[self.current as usize].insts.push(value);
        value
    }

    /// Inserts into the entry block regardless of the current one; local
    /// cells live there so loops re-enter without re-initialising them.
    pub fn push_entry(&mut self, kind: InstKind, ty: IrType, bc: u32) -> ValueId {
        let value = self.f.insts.len() as ValueId;
        self.f.insts.push(Inst { kind, ty, bc });
        self.f.blocks[self.f.entry as usize].insts.push(value);
        value
    }

    /// Inserts an empty PHI at the head of `block`; incomings arrive later,
    /// one per predecessor edge.
    pub fn add_phi(&mut self, block: BlockId, ty: IrType, bc: u32) -> ValueId {
        let value = self.f.insts.len() as ValueId;
        self.f.insts.push(Inst {
            kind: InstKind::Phi {
                incomings: Vec::new(),
            },
            ty,
            bc,
        });
        self.f.blocks[block as usize].phis.push(value);
        value
    }

    pub fn phi_add_incoming(&mut self, phi: ValueId, pred: BlockId, value: ValueId) {
        match &mut self.f.insts[phi as usize].kind {
            InstKind::Phi { incomings } => incomings.push((pred, value)),
            _ => unreachable!("value is not a phi"),
        }
    }

    pub fn block_phis(&self, block: BlockId) -> &[ValueId] {
        &self.f.blocks[block as usize].phis
    }

    pub fn value_type(&self, value: ValueId) -> IrType {
        self.f.insts[value as usize].ty
    }

    pub fn terminate(&mut self, term: Terminator) {
        let block = &mut self.f.blocks[self.current as usize];
        if block.term.is_none() {
            block.term = Some(term);
        }
    }

    pub fn declare_gc_root(&mut self, slot: ValueId) {
        self.f.gc_roots.push(slot);
    }

    pub fn record_line(&mut self, bc: u32, line: u16) {
        if self.f.line_table.last().map(|(o, _)| *o) != Some(bc) {
            self.f.line_table.push((bc, line));
        }
    }

    pub fn finish(self) -> FunctionIr {
        self.f
    }
}

/// Translation unit: functions keyed by name, bodies possibly still
/// declarations (JIT materialises them on first call).
#[derive(Default)]
pub struct ModuleIr {
    slots: Vec<FunctionSlot>,
    by_name: HashMap<String, FunctionId>,
}

pub struct FunctionSlot {
    pub name: String,
    pub sig: FnSig,
    pub body: Option<std::sync::Arc<FunctionIr>>,
}

impl ModuleIr {
    pub fn declare(&mut self, name: impl Into<String>, sig: FnSig) -> FunctionId {
        let name = name.into();
        if let Some(id) = self.by_name.get(&name) {
            return *id;
        }
        self.slots.push(FunctionSlot {
            name: name.clone(),
            sig,
            body: None,
        });
        let id = FunctionId::from_usize(self.slots.len());
        self.by_name.insert(name, id);
        id
    }

    pub fn define(&mut self, body: FunctionIr) -> FunctionId {
        let id = self.declare(body.name.clone(), body.sig.clone());
        self.slots[id.to_index()].body = Some(std::sync::Arc::new(body));
        id
    }

    pub fn lookup(&self, name: &str) -> Option<FunctionId> {
        self.by_name.get(name).copied()
    }

    pub fn slot(&self, id: FunctionId) -> &FunctionSlot {
        &self.slots[id.to_index()]
    }

    pub fn body(&self, id: FunctionId) -> Result<std::sync::Arc<FunctionIr>, VmError> {
        self.slots[id.to_index()]
            .body
            .clone()
            .ok_or_else(|| VmError::UnknownFunction(self.slots[id.to_index()].name.clone()))
    }

    pub fn is_defined(&self, id: FunctionId) -> bool {
        self.slots[id.to_index()].body.is_some()
    }

    pub fn function_count(&self) -> usize {
        self.slots.len()
    }
}

/// Structural SSA check run by the pass manager after every definition:
/// every block terminated, phis referencing known blocks, operands in range.
pub fn verify(f: &FunctionIr) -> Result<(), VmError> {
    let bad = |msg: String| VmError::ClassFormat(format!("IR verify failed in {}: {msg}", f.name));
    for (block_index, block) in f.blocks.iter().enumerate() {
        if block.term.is_none() {
            return Err(bad(format!("block {block_index} has no terminator")));
        }
        for value in block.phis.iter().chain(block.insts.iter()) {
            if *value as usize >= f.insts.len() {
                return Err(bad(format!("value {value} out of range")));
            }
        }
        if let Some(term) = &block.term {
            let targets: Vec<BlockId> = match term {
                Terminator::Br(t) => vec![*t],
                Terminator::CondBr {
                    then_block,
                    else_block,
                    ..
                } => vec![*then_block, *else_block],
                Terminator::Switch { default, arms, .. } => {
                    let mut t: Vec<BlockId> = arms.iter().map(|(_, b)| *b).collect();
                    t.push(*default);
                    t
                }
                Terminator::Ret(_) | Terminator::Unreachable => Vec::new(),
            };
            for target in targets {
                if target as usize >= f.blocks.len() {
                    return Err(bad(format!("branch to unknown block {target}")));
                }
            }
        }
    }
    for (value_index, inst) in f.insts.iter().enumerate() {
        if let InstKind::Phi { incomings } = &inst.kind {
            for (pred, value) in incomings {
                if *pred as usize >= f.blocks.len() {
                    return Err(bad(format!("phi {value_index} names unknown block {pred}")));
                }
                if *value as usize >= f.insts.len() {
                    return Err(bad(format!("phi {value_index} names unknown value {value}")));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn void_sig() -> FnSig {
        FnSig {
            params: Vec::new(),
            ret: IrType::Void,
        }
    }

    #[test]
    fn builder_produces_verified_function() {
        let mut b = FunctionBuilder::new("f", void_sig(), None);
        let c = b.push(InstKind::ConstI32(1), IrType::I32, 0);
        let exit = b.new_block();
        b.terminate(Terminator::Br(exit));
        b.switch_to(exit);
        let phi = b.add_phi(exit, IrType::I32, 0);
        b.phi_add_incoming(phi, 0, c);
        b.terminate(Terminator::Ret(None));
        let f = b.finish();
        verify(&f).unwrap();
        assert_eq!(f.blocks.len(), 2);
    }

    #[test]
    fn verify_rejects_open_blocks_and_bad_targets() {
        let mut b = FunctionBuilder::new("open", void_sig(), None);
        b.push(InstKind::ConstI32(0), IrType::I32, 0);
        let f = b.finish();
        assert!(verify(&f).is_err());

        let mut b = FunctionBuilder::new("bad_target", void_sig(), None);
        b.terminate(Terminator::Br(99));
        let f = b.finish();
        assert!(verify(&f).is_err());
    }

    #[test]
    fn module_keeps_declarations_until_defined() {
        let mut module = ModuleIr::default();
        let id = module.declare("lazy", void_sig());
        assert!(!module.is_defined(id));
        assert!(module.body(id).is_err());

        let mut b = FunctionBuilder::new("lazy", void_sig(), None);
        b.terminate(Terminator::Ret(None));
        let defined = module.define(b.finish());
        assert_eq!(id, defined);
        assert!(module.is_defined(id));
    }

    #[test]
    fn line_table_attribution_picks_last_entry() {
        let mut b = FunctionBuilder::new("lines", void_sig(), None);
        b.record_line(0, 10);
        b.record_line(8, 11);
        b.terminate(Terminator::Ret(None));
        let f = b.finish();
        assert_eq!(f.line_for_bc(0), Some(10));
        assert_eq!(f.line_for_bc(7), Some(10));
        assert_eq!(f.line_for_bc(9), Some(11));
    }
}
