//! The bytecode-to-IR translator: one pass over the method's bytecode after
//! a leader-discovery pre-pass, lowering the stack machine onto SSA against
//! the runtime ABI.
//!
//! The operand stack is simulated at compile time; at join points the
//! translator synthesises PHIs from the stack observed on every incoming
//! edge. Local variables become stack cells (one per primitive shape) the
//! backend's optimiser later promotes. Every instruction offset carries an
//! exception block: the method-exit unwind path by default, redirected to
//! the handler test chain inside try ranges.

mod lowering;

use crate::bytecode::decode::{Instr, decode_at};
use crate::bytecode::{ConstantPool, MethodCode};
use crate::error::VmError;
use crate::intrinsics::RuntimeFn;
use crate::ir::{
    BlockId, Callee, CmpOp, FnSig, FunctionBuilder, FunctionIr, InstKind, IrType, Terminator,
    ValueId,
};
use crate::keys::{ClassId, LoaderId, MethodId, MethodKey, Symbol};
use crate::rt::registry::BOOT_LOADER;
use crate::ty::{MethodDescriptor, ValueShape};
use crate::vm::VirtualMachine;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    Jit,
    /// AOT with every referenced class present at compile time.
    AotAssumeCompiled,
    /// AOT leaving callback stubs for not-yet-seen targets.
    AotCallback,
}

#[derive(Debug, Clone, Copy)]
pub struct TranslateOpts {
    pub mode: CompileMode,
    pub use_inline_caches: bool,
    pub emit_checks: bool,
}

impl TranslateOpts {
    pub fn jit(config: &crate::vm::VmConfig) -> Self {
        Self {
            mode: CompileMode::Jit,
            use_inline_caches: config.use_inline_caches,
            emit_checks: config.emit_checks,
        }
    }
}

const INLINE_CODE_LIMIT: usize = 60;
const INLINE_DEPTH_LIMIT: usize = 4;

/// One operand-stack slot; category-2 values occupy a `Value` plus a `Top`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Value(ValueId, ValueShape),
    Top,
}

/// The bounded compile-time operand stack.
pub(crate) type OperandStack = SmallVec<[Slot; 16]>;

pub(crate) struct ExcEntry {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
    /// Resolved catch class; `None` matches everything (finally).
    pub catch_class: Option<ClassId>,
}

pub(crate) enum ExcCtx {
    Outer {
        entries: Vec<ExcEntry>,
        /// Entry block of each handler's clear-and-enter stub.
        enter_blocks: Vec<BlockId>,
        /// Test-chain heads keyed by the covering-entry suffix.
        chains: HashMap<Vec<usize>, BlockId>,
        unwind: BlockId,
    },
    /// Inlined bodies route every exceptional edge to the caller's block
    /// for the call-site offset.
    Inline(BlockId),
}

pub(crate) enum RetCtx {
    Outer,
    Inline {
        join: BlockId,
        phi: Option<(ValueId, ValueShape)>,
        returns_seen: usize,
    },
}

/// Per-method translation state; inlining builds a child context sharing
/// the same function builder.
pub(crate) struct MethodCtx {
    pub method: MethodId,
    pub class_id: ClassId,
    pub pool: ConstantPool,
    pub code: MethodCode,
    pub leaders: HashSet<usize>,
    pub blocks: HashMap<usize, BlockId>,
    pub block_stack: HashMap<BlockId, OperandStack>,
    pub edges: HashMap<BlockId, usize>,
    pub stack: OperandStack,
    pub locals: HashMap<(u16, ValueShape), ValueId>,
    pub exc: ExcCtx,
    pub ret: RetCtx,
    pub sync_object: Option<ValueId>,
}

impl MethodCtx {
    pub fn push_value(&mut self, value: ValueId, shape: ValueShape) {
        self.stack.push(Slot::Value(value, shape));
        if shape.is_two_slot() {
            self.stack.push(Slot::Top);
        }
    }

    pub fn pop_raw(&mut self) -> Result<Slot, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::ClassFormat("operand stack underflow".to_string()))
    }

    pub fn pop_value(&mut self) -> Result<(ValueId, ValueShape), VmError> {
        match self.pop_raw()? {
            Slot::Top => match self.pop_raw()? {
                Slot::Value(value, shape) => Ok((value, shape)),
                Slot::Top => Err(VmError::ClassFormat("malformed operand stack".to_string())),
            },
            Slot::Value(value, shape) => Ok((value, shape)),
        }
    }

    pub fn peek_value(&self) -> Result<(ValueId, ValueShape), VmError> {
        for slot in self.stack.iter().rev() {
            if let Slot::Value(value, shape) = slot {
                return Ok((*value, *shape));
            }
        }
        Err(VmError::ClassFormat("operand stack underflow".to_string()))
    }
}

pub struct Translator<'vm> {
    pub(crate) vm: &'vm VirtualMachine,
    pub(crate) opts: TranslateOpts,
    pub(crate) b: FunctionBuilder,
    pub(crate) loader: LoaderId,
    /// Methods currently being inlined, to break cycles.
    pub(crate) inline_set: HashSet<MethodId>,
    pub(crate) cur_bc: u32,
}

/// Translates one method into a verified-ready IR function.
pub fn translate_method(
    vm: &VirtualMachine,
    method: MethodId,
    opts: TranslateOpts,
) -> Result<FunctionIr, VmError> {
    let (class_id, loader, sig_id, flags, name_sym, desc_sym, code) = {
        let registry = vm.registry_read();
        let m = registry.get_method(method);
        let class_id = m.class_id();
        let loader = registry
            .get_class(class_id)
            .loader()
            .unwrap_or(BOOT_LOADER);
        (
            class_id,
            loader,
            m.signature(),
            m.flags(),
            m.name,
            m.desc,
            m.bytecode()?.clone(),
        )
    };
    let desc = {
        let registry = vm.registry_read();
        registry.get_signature(sig_id).clone()
    };
    let info = vm.lowerer.info(vm, sig_id);
    let is_static = flags.is_static();
    let fn_sig: FnSig = if is_static {
        info.static_type.clone()
    } else {
        info.virtual_type.clone()
    };
    let fn_name = {
        let registry = vm.registry_read();
        format!(
            "{}.{}{}",
            registry.interner().resolve(&registry.get_class(class_id).name()),
            registry.interner().resolve(&name_sym),
            registry.interner().resolve(&desc_sym),
        )
    };

    let b = FunctionBuilder::new(fn_name, fn_sig, Some(method));
    let mut translator = Translator {
        vm,
        opts,
        b,
        loader,
        inline_set: HashSet::new(),
        cur_bc: 0,
    };
    translator.inline_set.insert(method);

    let mut ctx = translator.build_ctx(method, class_id, code, None, RetCtx::Outer)?;

    // Prolog: arguments into their local cells.
    let mut local_index: u16 = 0;
    let mut arg_index: u16 = 0;
    if !is_static {
        let this = translator.b.push(InstKind::Arg(0), IrType::Ref, 0);
        let cell = translator.local(&mut ctx, 0, ValueShape::Ref);
        translator.b.push(
            InstKind::Store {
                slot: cell,
                value: this,
            },
            IrType::Void,
            0,
        );
        local_index = 1;
        arg_index = 1;
    }
    for param in &desc.params {
        let shape = param.shape();
        let arg = translator
            .b
            .push(InstKind::Arg(arg_index), IrType::of_shape(shape), 0);
        let cell = translator.local(&mut ctx, local_index, shape);
        translator.b.push(
            InstKind::Store {
                slot: cell,
                value: arg,
            },
            IrType::Void,
            0,
        );
        arg_index += 1;
        local_index += if shape.is_two_slot() { 2 } else { 1 };
    }

    // Synchronized methods bracket the body with the object monitor; static
    // ones lock the class's static instance.
    if flags.is_synchronized() {
        let monitor = if is_static {
            translator.b.push(InstKind::StaticBase(class_id), IrType::Ref, 0)
        } else {
            translator.b.push(InstKind::Arg(0), IrType::Ref, 0)
        };
        translator.emit_intrinsic(RuntimeFn::MonitorEnter, vec![monitor]);
        ctx.sync_object = Some(monitor);
    }

    // Safepoint poll on entry.
    translator.emit_intrinsic(RuntimeFn::SafepointPoll, vec![]);
    translator.build_exception_scaffolding(&mut ctx)?;
    translator.pending_check(&mut ctx, 0)?;

    translator.translate_body(&mut ctx)?;
    Ok(translator.b.finish())
}

impl<'vm> Translator<'vm> {
    pub(crate) fn emit(&mut self, kind: InstKind, ty: IrType) -> ValueId {
        let bc = self.cur_bc;
        self.b.push(kind, ty, bc)
    }

    pub(crate) fn emit_intrinsic(&mut self, f: RuntimeFn, args: Vec<ValueId>) -> ValueId {
        let ret = f.ir_sig().ret;
        self.emit(
            InstKind::Call {
                callee: Callee::Intrinsic(f),
                args,
            },
            ret,
        )
    }

    pub(crate) fn const_word(&mut self, word: u64) -> ValueId {
        self.emit(InstKind::ConstWord(word), IrType::Word)
    }

    fn build_ctx(
        &mut self,
        method: MethodId,
        class_id: ClassId,
        code: MethodCode,
        inline_exc: Option<BlockId>,
        ret: RetCtx,
    ) -> Result<MethodCtx, VmError> {
        let pool = {
            let registry = self.vm.registry_read();
            registry
                .get_class(class_id)
                .pool()
                .cloned()
                .unwrap_or_default()
        };
        let leaders = scan_leaders(&code)?;
        let exc = match inline_exc {
            Some(block) => ExcCtx::Inline(block),
            None => ExcCtx::Outer {
                entries: Vec::new(),
                enter_blocks: Vec::new(),
                chains: HashMap::new(),
                unwind: 0,
            },
        };
        Ok(MethodCtx {
            method,
            class_id,
            pool,
            code,
            leaders,
            blocks: HashMap::new(),
            block_stack: HashMap::new(),
            edges: HashMap::new(),
            stack: SmallVec::new(),
            locals: HashMap::new(),
            exc,
            ret,
            sync_object: None,
        })
    }

    /// Builds the unwind block and one clear-and-enter stub per exception
    /// table entry, resolving catch types. Runs before the main pass so
    /// handler leaders have edges from the start.
    fn build_exception_scaffolding(&mut self, ctx: &mut MethodCtx) -> Result<(), VmError> {
        if matches!(ctx.exc, ExcCtx::Inline(_)) {
            return Ok(());
        }
        let saved = self.b.current;

        // Method-exit unwind: release the monitor, return a default; the
        // caller's pending check re-raises.
        let unwind = self.b.new_block();
        self.b.switch_to(unwind);
        if let Some(sync) = ctx.sync_object {
            self.emit_intrinsic(RuntimeFn::MonitorExit, vec![sync]);
        }
        self.ret_default(ctx.method)?;

        let raw_entries: Vec<_> = ctx.code.exception_table.clone();
        let mut entries = Vec::new();
        let mut enter_blocks = Vec::new();
        for raw in &raw_entries {
            let catch_class = match raw.catch_type {
                Some(sym) => Some(self.resolve_class_sym(sym)?),
                None => None,
            };
            entries.push(ExcEntry {
                start: raw.start_pc as usize,
                end: raw.end_pc as usize,
                handler: raw.handler_pc as usize,
                catch_class,
            });
        }
        for entry in &entries {
            let block = self.b.new_block();
            self.b.switch_to(block);
            let exception = self.emit_intrinsic(RuntimeFn::ClearPendingException, vec![]);
            let handler_pc = entry.handler;
            let target =
                self.branch_to(ctx, handler_pc, &[Slot::Value(exception, ValueShape::Ref)])?;
            self.b.terminate(Terminator::Br(target));
            enter_blocks.push(block);
        }

        ctx.exc = ExcCtx::Outer {
            entries,
            enter_blocks,
            chains: HashMap::new(),
            unwind,
        };
        self.b.switch_to(saved);
        Ok(())
    }

    fn ret_default(&mut self, method: MethodId) -> Result<(), VmError> {
        let ret_shape = {
            let registry = self.vm.registry_read();
            registry.signature_of_method(method).ret_shape()
        };
        match ret_shape {
            None => self.b.terminate(Terminator::Ret(None)),
            Some(shape) => {
                let v = self.default_const(shape);
                self.b.terminate(Terminator::Ret(Some(v)));
            }
        }
        Ok(())
    }

    pub(crate) fn default_const(&mut self, shape: ValueShape) -> ValueId {
        match shape {
            ValueShape::Int => self.emit(InstKind::ConstI32(0), IrType::I32),
            ValueShape::Long => self.emit(InstKind::ConstI64(0), IrType::I64),
            ValueShape::Float => self.emit(InstKind::ConstF32(0f32.to_bits()), IrType::F32),
            ValueShape::Double => self.emit(InstKind::ConstF64(0f64.to_bits()), IrType::F64),
            ValueShape::Ref => self.emit(InstKind::ConstNull, IrType::Ref),
        }
    }

    /// The exception block for an instruction offset: the handler test
    /// chain when inside try ranges, the unwind block otherwise.
    pub(crate) fn exception_block(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
    ) -> Result<BlockId, VmError> {
        let (covering, unwind) = match &ctx.exc {
            ExcCtx::Inline(block) => return Ok(*block),
            ExcCtx::Outer {
                entries, unwind, ..
            } => {
                let covering: Vec<usize> = entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| pc >= e.start && pc < e.end)
                    .map(|(index, _)| index)
                    .collect();
                (covering, *unwind)
            }
        };
        if covering.is_empty() {
            return Ok(unwind);
        }
        self.chain_block(ctx, &covering)
    }

    fn chain_block(&mut self, ctx: &mut MethodCtx, covering: &[usize]) -> Result<BlockId, VmError> {
        if covering.is_empty() {
            let ExcCtx::Outer { unwind, .. } = &ctx.exc else {
                unreachable!("chains only exist on outer frames");
            };
            return Ok(*unwind);
        }
        if let ExcCtx::Outer { chains, .. } = &ctx.exc
            && let Some(block) = chains.get(covering)
        {
            return Ok(*block);
        }
        let next = self.chain_block(ctx, &covering[1..])?;
        let (catch_class, enter) = {
            let ExcCtx::Outer {
                entries,
                enter_blocks,
                ..
            } = &ctx.exc
            else {
                unreachable!("chains only exist on outer frames");
            };
            (entries[covering[0]].catch_class, enter_blocks[covering[0]])
        };

        let saved = self.b.current;
        let block = self.b.new_block();
        self.b.switch_to(block);
        match catch_class {
            // A finally entry matches everything.
            None => self.b.terminate(Terminator::Br(enter)),
            Some(class) => {
                let pending = self.emit_intrinsic(RuntimeFn::PendingException, vec![]);
                let token = self.const_word(u64::from(class.raw()));
                let matches = self.emit_intrinsic(RuntimeFn::InstanceOf, vec![pending, token]);
                let zero = self.emit(InstKind::ConstI32(0), IrType::I32);
                let hit = self.emit(
                    InstKind::Cmp {
                        op: CmpOp::Ne,
                        lhs: matches,
                        rhs: zero,
                    },
                    IrType::I1,
                );
                self.b.terminate(Terminator::CondBr {
                    cond: hit,
                    then_block: enter,
                    else_block: next,
                });
            }
        }
        self.b.switch_to(saved);
        if let ExcCtx::Outer { chains, .. } = &mut ctx.exc {
            chains.insert(covering.to_vec(), block);
        }
        Ok(block)
    }

    /// Emits the pending-exception check the exception ABI requires after
    /// every throwing call.
    pub(crate) fn pending_check(&mut self, ctx: &mut MethodCtx, pc: usize) -> Result<(), VmError> {
        let pending = self.emit_intrinsic(RuntimeFn::PendingException, vec![]);
        let null = self.emit(InstKind::ConstNull, IrType::Ref);
        let has = self.emit(
            InstKind::Cmp {
                op: CmpOp::Ne,
                lhs: pending,
                rhs: null,
            },
            IrType::I1,
        );
        let exc = self.exception_block(ctx, pc)?;
        let cont = self.b.new_block();
        self.b.terminate(Terminator::CondBr {
            cond: has,
            then_block: exc,
            else_block: cont,
        });
        self.b.switch_to(cont);
        Ok(())
    }

    pub(crate) fn local(&mut self, ctx: &mut MethodCtx, index: u16, shape: ValueShape) -> ValueId {
        if let Some(cell) = ctx.locals.get(&(index, shape)) {
            return *cell;
        }
        let cell = self.b.push_entry(InstKind::Alloca(shape), IrType::Word, 0);
        if shape == ValueShape::Ref {
            self.b.declare_gc_root(cell);
        }
        ctx.locals.insert((index, shape), cell);
        cell
    }

    fn ensure_block(&mut self, ctx: &mut MethodCtx, offset: usize) -> BlockId {
        if let Some(block) = ctx.blocks.get(&offset) {
            return *block;
        }
        let block = self.b.new_block();
        ctx.blocks.insert(offset, block);
        block
    }

    /// Adds an edge from the current block to the leader at `offset`,
    /// creating or extending the target's stack PHIs.
    pub(crate) fn branch_to(
        &mut self,
        ctx: &mut MethodCtx,
        offset: usize,
        stack: &[Slot],
    ) -> Result<BlockId, VmError> {
        let block = self.ensure_block(ctx, offset);
        if !ctx.block_stack.contains_key(&block) {
            let bc = self.cur_bc;
            let mut phis = OperandStack::with_capacity(stack.len());
            for slot in stack {
                match slot {
                    Slot::Value(_, shape) => {
                        let phi = self.b.add_phi(block, IrType::of_shape(*shape), bc);
                        phis.push(Slot::Value(phi, *shape));
                    }
                    Slot::Top => phis.push(Slot::Top),
                }
            }
            ctx.block_stack.insert(block, phis);
        }
        let phis = ctx.block_stack.get(&block).cloned().expect("just inserted");
        if phis.len() != stack.len() {
            return Err(VmError::ClassFormat(format!(
                "operand stack depth mismatch at join offset {offset}"
            )));
        }
        let pred = self.b.current;
        for (phi_slot, cur_slot) in phis.iter().zip(stack.iter()) {
            if let (Slot::Value(phi, _), Slot::Value(value, _)) = (phi_slot, cur_slot) {
                self.b.phi_add_incoming(*phi, pred, *value);
            }
        }
        *ctx.edges.entry(block).or_insert(0) += 1;
        Ok(block)
    }

    /// Safepoint poll inserted at loop back-edges.
    pub(crate) fn back_edge_poll(
        &mut self,
        ctx: &mut MethodCtx,
        pc: usize,
        targets: &[usize],
    ) -> Result<(), VmError> {
        if targets.iter().any(|t| *t <= pc) {
            self.emit_intrinsic(RuntimeFn::SafepointPoll, vec![]);
            self.pending_check(ctx, pc)?;
        }
        Ok(())
    }

    fn translate_body(&mut self, ctx: &mut MethodCtx) -> Result<(), VmError> {
        let code_len = ctx.code.code.len();
        let code = ctx.code.code.clone();
        let mut pc = 0usize;
        let mut skipping = false;

        while pc < code_len {
            if ctx.leaders.contains(&pc) {
                let block = self.ensure_block(ctx, pc);
                if !skipping && !self.b.is_terminated(self.b.current) {
                    let stack = ctx.stack.clone();
                    let target = self.branch_to(ctx, pc, &stack)?;
                    debug_assert_eq!(target, block);
                    self.b.terminate(Terminator::Br(block));
                }
                if ctx.edges.get(&block).copied().unwrap_or(0) == 0 {
                    // No edges reach this leader: dead code, skip it.
                    skipping = true;
                } else {
                    skipping = false;
                    self.b.switch_to(block);
                    ctx.stack = ctx.block_stack.get(&block).cloned().unwrap_or_default();
                }
            }
            let (instr, next) = decode_at(&code, pc)?;
            if skipping {
                pc = next;
                continue;
            }
            self.cur_bc = pc as u32;
            if let Some(line) = ctx.code.line_for_pc(pc) {
                self.b.record_line(pc as u32, line);
            }
            self.lower(ctx, instr, pc, next)?;
            pc = next;
        }
        if !self.b.is_terminated(self.b.current) {
            // Bytecode falling off the end is malformed, but keep the IR
            // well-formed for the verifier to reject.
            self.b.terminate(Terminator::Unreachable);
        }
        Ok(())
    }

    // ---- resolution helpers ----------------------------------------------

    pub(crate) fn resolve_class_sym(&mut self, sym: Symbol) -> Result<ClassId, VmError> {
        self.vm.resolve_class(self.loader, sym)
    }

    pub(crate) fn member_ref(
        &self,
        ctx: &MethodCtx,
        index: u16,
    ) -> Result<(Symbol, MethodKey), VmError> {
        let (class, name, desc) = ctx.pool.member_ref(index)?;
        Ok((class, MethodKey { name, desc }))
    }

    pub(crate) fn descriptor_of(&self, key: &MethodKey) -> Result<MethodDescriptor, VmError> {
        let registry = self.vm.registry_read();
        MethodDescriptor::parse(registry.interner().resolve(&key.desc), registry.interner())
    }

    /// Pops call arguments in declaration order, receiver excluded.
    pub(crate) fn pop_args(
        &mut self,
        ctx: &mut MethodCtx,
        desc: &MethodDescriptor,
    ) -> Result<Vec<ValueId>, VmError> {
        let mut args = std::collections::VecDeque::with_capacity(desc.params.len());
        for _ in desc.params.iter().rev() {
            let (value, _) = ctx.pop_value()?;
            args.push_front(value);
        }
        Ok(args.into())
    }

    // ---- inlining ---------------------------------------------------------

    /// A method is inlinable when its body is small and simple, needs no
    /// callbacks, carries no exception table, and lives in the caller's
    /// loader (or the bootstrap one).
    pub(crate) fn can_inline(&self, method: MethodId) -> bool {
        if self.opts.mode != CompileMode::Jit {
            return false;
        }
        if self.inline_set.len() > INLINE_DEPTH_LIMIT || self.inline_set.contains(&method) {
            return false;
        }
        let registry = self.vm.registry_read();
        let m = registry.get_method(method);
        if m.flags().is_synchronized() || m.is_native() || m.is_abstract() {
            return false;
        }
        let Ok(code) = m.bytecode() else {
            return false;
        };
        if code.code.len() > INLINE_CODE_LIMIT || !code.exception_table.is_empty() {
            return false;
        }
        let method_loader = registry.get_class(m.class_id()).loader();
        if method_loader != Some(self.loader) && method_loader != Some(BOOT_LOADER) {
            return false;
        }
        let mut pc = 0;
        while pc < code.code.len() {
            match decode_at(&code.code, pc) {
                Ok((instr, next)) => {
                    if matches!(
                        instr,
                        Instr::MonitorEnter | Instr::MonitorExit | Instr::AThrow
                    ) {
                        return false;
                    }
                    pc = next;
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// Recursive translation into the caller's block graph.
    pub(crate) fn inline_call(
        &mut self,
        caller: &mut MethodCtx,
        pc: usize,
        method: MethodId,
        args: Vec<ValueId>,
        desc: &MethodDescriptor,
    ) -> Result<(), VmError> {
        self.inline_set.insert(method);
        let call_site_exc = self.exception_block(caller, pc)?;
        let (callee_class, code, is_static) = {
            let registry = self.vm.registry_read();
            let m = registry.get_method(method);
            (m.class_id(), m.bytecode()?.clone(), m.is_static())
        };

        let join = self.b.new_block();
        let ret_phi = desc.ret_shape().map(|shape| {
            let phi = self.b.add_phi(join, IrType::of_shape(shape), self.cur_bc);
            (phi, shape)
        });

        let mut child = self.build_ctx(
            method,
            callee_class,
            code,
            Some(call_site_exc),
            RetCtx::Inline {
                join,
                phi: ret_phi,
                returns_seen: 0,
            },
        )?;

        // Arguments land in the callee's local cells.
        let mut local_index: u16 = 0;
        let mut value_index = 0;
        let shapes: Vec<ValueShape> = {
            let mut shapes = Vec::new();
            if !is_static {
                shapes.push(ValueShape::Ref);
            }
            shapes.extend(desc.params.iter().map(|p| p.shape()));
            shapes
        };
        for shape in shapes {
            let cell = self.local(&mut child, local_index, shape);
            let value = args[value_index];
            self.emit(
                InstKind::Store {
                    slot: cell,
                    value,
                },
                IrType::Void,
            );
            value_index += 1;
            local_index += if shape.is_two_slot() { 2 } else { 1 };
        }

        self.translate_body(&mut child)?;

        let returns_seen = match child.ret {
            RetCtx::Inline { returns_seen, .. } => returns_seen,
            RetCtx::Outer => unreachable!("inline frame carries an inline return context"),
        };
        self.b.switch_to(join);
        if returns_seen == 0 {
            self.b.terminate(Terminator::Unreachable);
        }
        if let Some((phi, shape)) = ret_phi {
            caller.push_value(phi, shape);
        }
        self.inline_set.remove(&method);
        Ok(())
    }
}

fn scan_leaders(code: &MethodCode) -> Result<HashSet<usize>, VmError> {
    let mut leaders = HashSet::new();
    let bytes = &code.code;
    let mut pc = 0;
    while pc < bytes.len() {
        let (instr, next) = decode_at(bytes, pc)?;
        for target in instr.branch_targets() {
            leaders.insert(target);
        }
        if instr.is_block_end() && next < bytes.len() {
            leaders.insert(next);
        }
        pc = next;
    }
    for entry in &code.exception_table {
        leaders.insert(entry.handler_pc as usize);
    }
    Ok(leaders)
}
