//! Decodes raw bytecode into normalised instruction forms: constant pushes
//! collapse to one variant per shape, short/wide local forms to one indexed
//! variant. Branch targets are absolute code offsets.

use crate::bytecode::{ByteCursor, NewArrayType, Opcode};
use crate::error::VmError;
use crate::ty::ValueShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Nop,
    AconstNull,
    IConst(i32),
    LConst(i64),
    FConst(f32),
    DConst(f64),
    Load(ValueShape, u16),
    StoreLocal(ValueShape, u16),
    ArrayLoad(ArrayKind),
    ArrayStore(ArrayKind),
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    Arith(ValueShape, ArithOp),
    Neg(ValueShape),
    Shift(ValueShape, ShiftOp),
    Iinc(u16, i32),
    Convert(ConvKind),
    LCmp,
    FCmp { negative_on_nan: bool },
    DCmp { negative_on_nan: bool },
    If(CmpKind, usize),
    IfICmp(CmpKind, usize),
    IfACmp(bool, usize),
    IfNull(usize),
    IfNonNull(usize),
    Goto(usize),
    TableSwitch {
        default: usize,
        low: i32,
        targets: Vec<usize>,
    },
    LookupSwitch {
        default: usize,
        pairs: Vec<(i32, usize)>,
    },
    Return(Option<ValueShape>),
    GetStatic(u16),
    PutStatic(u16),
    GetField(u16),
    PutField(u16),
    InvokeVirtual(u16),
    InvokeSpecial(u16),
    InvokeStatic(u16),
    InvokeInterface(u16),
    New(u16),
    NewArray(NewArrayType),
    ANewArray(u16),
    MultiANewArray(u16, u8),
    ArrayLength,
    AThrow,
    CheckCast(u16),
    InstanceOf(u16),
    MonitorEnter,
    MonitorExit,
    Ldc(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
    Byte,
    Char,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Ushr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
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
}

fn branch_target(pc: usize, offset: i32, code_len: usize) -> Result<usize, VmError> {
    let target = pc as i64 + i64::from(offset);
    if target < 0 || target as usize >= code_len {
        return Err(VmError::ClassFormat(format!(
            "branch target {target} out of code range at pc {pc}"
        )));
    }
    Ok(target as usize)
}

/// Decodes one instruction at `pc`, returning it with the next pc.
pub fn decode_at(code: &[u8], pc: usize) -> Result<(Instr, usize), VmError> {
    let mut cursor = ByteCursor::new(code);
    cursor.seek(pc)?;
    let opcode = cursor.read_opcode()?;
    use Opcode::*;
    use ValueShape::*;

    let instr = match opcode {
        Nop => Instr::Nop,
        AconstNull => Instr::AconstNull,
        IconstM1 => Instr::IConst(-1),
        Iconst0 => Instr::IConst(0),
        Iconst1 => Instr::IConst(1),
        Iconst2 => Instr::IConst(2),
        Iconst3 => Instr::IConst(3),
        Iconst4 => Instr::IConst(4),
        Iconst5 => Instr::IConst(5),
        Lconst0 => Instr::LConst(0),
        Lconst1 => Instr::LConst(1),
        Fconst0 => Instr::FConst(0.0),
        Fconst1 => Instr::FConst(1.0),
        Fconst2 => Instr::FConst(2.0),
        Dconst0 => Instr::DConst(0.0),
        Dconst1 => Instr::DConst(1.0),
        Bipush => Instr::IConst(i32::from(cursor.read_i1()?)),
        Sipush => Instr::IConst(i32::from(cursor.read_i2()?)),
        Ldc => Instr::Ldc(u16::from(cursor.read_u1()?)),
        LdcW | Ldc2W => Instr::Ldc(cursor.read_u2()?),
        Iload => Instr::Load(Int, u16::from(cursor.read_u1()?)),
        Lload => Instr::Load(Long, u16::from(cursor.read_u1()?)),
        Fload => Instr::Load(Float, u16::from(cursor.read_u1()?)),
        Dload => Instr::Load(Double, u16::from(cursor.read_u1()?)),
        Aload => Instr::Load(Ref, u16::from(cursor.read_u1()?)),
        Iload0 | Iload1 | Iload2 | Iload3 => {
            Instr::Load(Int, u16::from(opcode as u8 - Iload0 as u8))
        }
        Lload0 | Lload1 | Lload2 | Lload3 => {
            Instr::Load(Long, u16::from(opcode as u8 - Lload0 as u8))
        }
        Fload0 | Fload1 | Fload2 | Fload3 => {
            Instr::Load(Float, u16::from(opcode as u8 - Fload0 as u8))
        }
        Dload0 | Dload1 | Dload2 | Dload3 => {
            Instr::Load(Double, u16::from(opcode as u8 - Dload0 as u8))
        }
        Aload0 | Aload1 | Aload2 | Aload3 => {
            Instr::Load(Ref, u16::from(opcode as u8 - Aload0 as u8))
        }
        Iaload => Instr::ArrayLoad(ArrayKind::Int),
        Laload => Instr::ArrayLoad(ArrayKind::Long),
        Faload => Instr::ArrayLoad(ArrayKind::Float),
        Daload => Instr::ArrayLoad(ArrayKind::Double),
        Aaload => Instr::ArrayLoad(ArrayKind::Ref),
        Baload => Instr::ArrayLoad(ArrayKind::Byte),
        Caload => Instr::ArrayLoad(ArrayKind::Char),
        Saload => Instr::ArrayLoad(ArrayKind::Short),
        Istore => Instr::StoreLocal(Int, u16::from(cursor.read_u1()?)),
        Lstore => Instr::StoreLocal(Long, u16::from(cursor.read_u1()?)),
        Fstore => Instr::StoreLocal(Float, u16::from(cursor.read_u1()?)),
        Dstore => Instr::StoreLocal(Double, u16::from(cursor.read_u1()?)),
        Astore => Instr::StoreLocal(Ref, u16::from(cursor.read_u1()?)),
        Istore0 | Istore1 | Istore2 | Istore3 => {
            Instr::StoreLocal(Int, u16::from(opcode as u8 - Istore0 as u8))
        }
        Lstore0 | Lstore1 | Lstore2 | Lstore3 => {
            Instr::StoreLocal(Long, u16::from(opcode as u8 - Lstore0 as u8))
        }
        Fstore0 | Fstore1 | Fstore2 | Fstore3 => {
            Instr::StoreLocal(Float, u16::from(opcode as u8 - Fstore0 as u8))
        }
        Dstore0 | Dstore1 | Dstore2 | Dstore3 => {
            Instr::StoreLocal(Double, u16::from(opcode as u8 - Dstore0 as u8))
        }
        Astore0 | Astore1 | Astore2 | Astore3 => {
            Instr::StoreLocal(Ref, u16::from(opcode as u8 - Astore0 as u8))
        }
        Iastore => Instr::ArrayStore(ArrayKind::Int),
        Lastore => Instr::ArrayStore(ArrayKind::Long),
        Fastore => Instr::ArrayStore(ArrayKind::Float),
        Dastore => Instr::ArrayStore(ArrayKind::Double),
        Aastore => Instr::ArrayStore(ArrayKind::Ref),
        Bastore => Instr::ArrayStore(ArrayKind::Byte),
        Castore => Instr::ArrayStore(ArrayKind::Char),
        Sastore => Instr::ArrayStore(ArrayKind::Short),
        Pop => Instr::Pop,
        Pop2 => Instr::Pop2,
        Dup => Instr::Dup,
        DupX1 => Instr::DupX1,
        DupX2 => Instr::DupX2,
        Dup2 => Instr::Dup2,
        Dup2X1 => Instr::Dup2X1,
        Dup2X2 => Instr::Dup2X2,
        Swap => Instr::Swap,
        Iadd => Instr::Arith(Int, ArithOp::Add),
        Ladd => Instr::Arith(Long, ArithOp::Add),
        Fadd => Instr::Arith(Float, ArithOp::Add),
        Dadd => Instr::Arith(Double, ArithOp::Add),
        Isub => Instr::Arith(Int, ArithOp::Sub),
        Lsub => Instr::Arith(Long, ArithOp::Sub),
        Fsub => Instr::Arith(Float, ArithOp::Sub),
        Dsub => Instr::Arith(Double, ArithOp::Sub),
        Imul => Instr::Arith(Int, ArithOp::Mul),
        Lmul => Instr::Arith(Long, ArithOp::Mul),
        Fmul => Instr::Arith(Float, ArithOp::Mul),
        Dmul => Instr::Arith(Double, ArithOp::Mul),
        Idiv => Instr::Arith(Int, ArithOp::Div),
        Opcode::Ldiv => Instr::Arith(Long, ArithOp::Div),
        Fdiv => Instr::Arith(Float, ArithOp::Div),
        Ddiv => Instr::Arith(Double, ArithOp::Div),
        Irem => Instr::Arith(Int, ArithOp::Rem),
        Lrem => Instr::Arith(Long, ArithOp::Rem),
        Frem => Instr::Arith(Float, ArithOp::Rem),
        Drem => Instr::Arith(Double, ArithOp::Rem),
        Ineg => Instr::Neg(Int),
        Lneg => Instr::Neg(Long),
        Fneg => Instr::Neg(Float),
        Dneg => Instr::Neg(Double),
        Ishl => Instr::Shift(Int, ShiftOp::Shl),
        Lshl => Instr::Shift(Long, ShiftOp::Shl),
        Ishr => Instr::Shift(Int, ShiftOp::Shr),
        Lshr => Instr::Shift(Long, ShiftOp::Shr),
        Iushr => Instr::Shift(Int, ShiftOp::Ushr),
        Lushr => Instr::Shift(Long, ShiftOp::Ushr),
        Iand => Instr::Arith(Int, ArithOp::And),
        Land => Instr::Arith(Long, ArithOp::And),
        Ior => Instr::Arith(Int, ArithOp::Or),
        Lor => Instr::Arith(Long, ArithOp::Or),
        Ixor => Instr::Arith(Int, ArithOp::Xor),
        Lxor => Instr::Arith(Long, ArithOp::Xor),
        Iinc => {
            let index = u16::from(cursor.read_u1()?);
            let delta = i32::from(cursor.read_i1()?);
            Instr::Iinc(index, delta)
        }
        I2l => Instr::Convert(ConvKind::I2L),
        I2f => Instr::Convert(ConvKind::I2F),
        I2d => Instr::Convert(ConvKind::I2D),
        L2i => Instr::Convert(ConvKind::L2I),
        L2f => Instr::Convert(ConvKind::L2F),
        L2d => Instr::Convert(ConvKind::L2D),
        F2i => Instr::Convert(ConvKind::F2I),
        F2l => Instr::Convert(ConvKind::F2L),
        F2d => Instr::Convert(ConvKind::F2D),
        D2i => Instr::Convert(ConvKind::D2I),
        D2l => Instr::Convert(ConvKind::D2L),
        D2f => Instr::Convert(ConvKind::D2F),
        I2b => Instr::Convert(ConvKind::I2B),
        I2c => Instr::Convert(ConvKind::I2C),
        I2s => Instr::Convert(ConvKind::I2S),
        Lcmp => Instr::LCmp,
        Fcmpl => Instr::FCmp {
            negative_on_nan: true,
        },
        Fcmpg => Instr::FCmp {
            negative_on_nan: false,
        },
        Dcmpl => Instr::DCmp {
            negative_on_nan: true,
        },
        Dcmpg => Instr::DCmp {
            negative_on_nan: false,
        },
        Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle => {
            let kind = match opcode {
                Ifeq => CmpKind::Eq,
                Ifne => CmpKind::Ne,
                Iflt => CmpKind::Lt,
                Ifge => CmpKind::Ge,
                Ifgt => CmpKind::Gt,
                _ => CmpKind::Le,
            };
            let offset = i32::from(cursor.read_i2()?);
            Instr::If(kind, branch_target(pc, offset, code.len())?)
        }
        IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt | IfIcmple => {
            let kind = match opcode {
                IfIcmpeq => CmpKind::Eq,
                IfIcmpne => CmpKind::Ne,
                IfIcmplt => CmpKind::Lt,
                IfIcmpge => CmpKind::Ge,
                IfIcmpgt => CmpKind::Gt,
                _ => CmpKind::Le,
            };
            let offset = i32::from(cursor.read_i2()?);
            Instr::IfICmp(kind, branch_target(pc, offset, code.len())?)
        }
        IfAcmpeq => {
            let offset = i32::from(cursor.read_i2()?);
            Instr::IfACmp(true, branch_target(pc, offset, code.len())?)
        }
        IfAcmpne => {
            let offset = i32::from(cursor.read_i2()?);
            Instr::IfACmp(false, branch_target(pc, offset, code.len())?)
        }
        Goto => {
            let offset = i32::from(cursor.read_i2()?);
            Instr::Goto(branch_target(pc, offset, code.len())?)
        }
        GotoW => {
            let offset = cursor.read_i4()?;
            Instr::Goto(branch_target(pc, offset, code.len())?)
        }
        Ifnull => {
            let offset = i32::from(cursor.read_i2()?);
            Instr::IfNull(branch_target(pc, offset, code.len())?)
        }
        Ifnonnull => {
            let offset = i32::from(cursor.read_i2()?);
            Instr::IfNonNull(branch_target(pc, offset, code.len())?)
        }
        Tableswitch => {
            cursor.align4()?;
            let default = branch_target(pc, cursor.read_i4()?, code.len())?;
            let low = cursor.read_i4()?;
            let high = cursor.read_i4()?;
            if high < low {
                return Err(VmError::ClassFormat(format!(
                    "tableswitch bounds {low}..{high} at pc {pc}"
                )));
            }
            let mut targets = Vec::with_capacity((high - low + 1) as usize);
            for _ in low..=high {
                targets.push(branch_target(pc, cursor.read_i4()?, code.len())?);
            }
            Instr::TableSwitch {
                default,
                low,
                targets,
            }
        }
        Lookupswitch => {
            cursor.align4()?;
            let default = branch_target(pc, cursor.read_i4()?, code.len())?;
            let count = cursor.read_i4()?;
            let mut pairs = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                let case = cursor.read_i4()?;
                pairs.push((case, branch_target(pc, cursor.read_i4()?, code.len())?));
            }
            Instr::LookupSwitch { default, pairs }
        }
        Ireturn => Instr::Return(Some(Int)),
        Lreturn => Instr::Return(Some(Long)),
        Freturn => Instr::Return(Some(Float)),
        Dreturn => Instr::Return(Some(Double)),
        Areturn => Instr::Return(Some(Ref)),
        Opcode::Return => Instr::Return(None),
        Getstatic => Instr::GetStatic(cursor.read_u2()?),
        Putstatic => Instr::PutStatic(cursor.read_u2()?),
        Getfield => Instr::GetField(cursor.read_u2()?),
        Putfield => Instr::PutField(cursor.read_u2()?),
        Invokevirtual => Instr::InvokeVirtual(cursor.read_u2()?),
        Invokespecial => Instr::InvokeSpecial(cursor.read_u2()?),
        Invokestatic => Instr::InvokeStatic(cursor.read_u2()?),
        Invokeinterface => {
            let index = cursor.read_u2()?;
            let _count = cursor.read_u1()?;
            let _zero = cursor.read_u1()?;
            Instr::InvokeInterface(index)
        }
        New => Instr::New(cursor.read_u2()?),
        Newarray => {
            let code_byte = cursor.read_u1()?;
            let kind = NewArrayType::try_from(code_byte).map_err(|_| {
                VmError::ClassFormat(format!("bad newarray element code {code_byte}"))
            })?;
            Instr::NewArray(kind)
        }
        Anewarray => Instr::ANewArray(cursor.read_u2()?),
        Multianewarray => {
            let index = cursor.read_u2()?;
            let dims = cursor.read_u1()?;
            if dims == 0 {
                return Err(VmError::ClassFormat(format!(
                    "multianewarray with zero dimensions at pc {pc}"
                )));
            }
            Instr::MultiANewArray(index, dims)
        }
        Arraylength => Instr::ArrayLength,
        Athrow => Instr::AThrow,
        Checkcast => Instr::CheckCast(cursor.read_u2()?),
        Instanceof => Instr::InstanceOf(cursor.read_u2()?),
        Monitorenter => Instr::MonitorEnter,
        Monitorexit => Instr::MonitorExit,
        Wide => {
            let widened = cursor.read_opcode()?;
            match widened {
                Iload => Instr::Load(Int, cursor.read_u2()?),
                Lload => Instr::Load(Long, cursor.read_u2()?),
                Fload => Instr::Load(Float, cursor.read_u2()?),
                Dload => Instr::Load(Double, cursor.read_u2()?),
                Aload => Instr::Load(Ref, cursor.read_u2()?),
                Istore => Instr::StoreLocal(Int, cursor.read_u2()?),
                Lstore => Instr::StoreLocal(Long, cursor.read_u2()?),
                Fstore => Instr::StoreLocal(Float, cursor.read_u2()?),
                Dstore => Instr::StoreLocal(Double, cursor.read_u2()?),
                Astore => Instr::StoreLocal(Ref, cursor.read_u2()?),
                Iinc => {
                    let index = cursor.read_u2()?;
                    let delta = i32::from(cursor.read_i2()?);
                    Instr::Iinc(index, delta)
                }
                other => {
                    return Err(VmError::ClassFormat(format!(
                        "wide prefix on {other:?} at pc {pc}"
                    )));
                }
            }
        }
        Invokedynamic | Jsr | JsrW | Ret => {
            return Err(VmError::ClassFormat(format!(
                "unsupported opcode {opcode:?} at pc {pc}"
            )));
        }
    };
    Ok((instr, cursor.offset()))
}

impl Instr {
    /// Branch targets this instruction introduces, for the leader pre-pass.
    pub fn branch_targets(&self) -> Vec<usize> {
        match self {
            Instr::If(_, t)
            | Instr::IfICmp(_, t)
            | Instr::IfACmp(_, t)
            | Instr::IfNull(t)
            | Instr::IfNonNull(t)
            | Instr::Goto(t) => vec![*t],
            Instr::TableSwitch {
                default, targets, ..
            } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            Instr::LookupSwitch { default, pairs } => {
                let mut all: Vec<usize> = pairs.iter().map(|(_, t)| *t).collect();
                all.push(*default);
                all
            }
            _ => Vec::new(),
        }
    }

    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            Instr::If(..)
                | Instr::IfICmp(..)
                | Instr::IfACmp(..)
                | Instr::IfNull(_)
                | Instr::IfNonNull(_)
                | Instr::Goto(_)
                | Instr::TableSwitch { .. }
                | Instr::LookupSwitch { .. }
                | Instr::Return(_)
                | Instr::AThrow
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_normalise() {
        let code = [0x03, 0x10, 0x2a, 0x11, 0x01, 0x00];
        let (a, next) = decode_at(&code, 0).unwrap();
        assert_eq!(a, Instr::IConst(0));
        let (b, next) = decode_at(&code, next).unwrap();
        assert_eq!(b, Instr::IConst(42));
        let (c, _) = decode_at(&code, next).unwrap();
        assert_eq!(c, Instr::IConst(256));
    }

    #[test]
    fn short_local_forms_normalise() {
        let code = [0x1b, 0x3e, 0x19, 0x05];
        let (load, next) = decode_at(&code, 0).unwrap();
        assert_eq!(load, Instr::Load(ValueShape::Int, 1));
        let (store, next) = decode_at(&code, next).unwrap();
        assert_eq!(store, Instr::StoreLocal(ValueShape::Int, 3));
        let (aload, _) = decode_at(&code, next).unwrap();
        assert_eq!(aload, Instr::Load(ValueShape::Ref, 5));
    }

    #[test]
    fn branch_targets_are_absolute() {
        // 0: iconst_0, 1: ifeq +5 (-> 6), 4: nop, 5: nop, 6: return
        let code = [0x03, 0x99, 0x00, 0x05, 0x00, 0x00, 0xb1];
        let (branch, _) = decode_at(&code, 1).unwrap();
        assert_eq!(branch, Instr::If(CmpKind::Eq, 6));
        assert_eq!(branch.branch_targets(), vec![6]);
        assert!(branch.is_block_end());
    }

    #[test]
    fn tableswitch_alignment_and_bounds() {
        // pc 0: tableswitch, padding to 4, default=+16, low=1, high=2, two targets
        let mut code = vec![0xaa, 0, 0, 0];
        code.extend_from_slice(&16i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&2i32.to_be_bytes());
        code.extend_from_slice(&16i32.to_be_bytes());
        code.extend_from_slice(&17i32.to_be_bytes());
        code.push(0x00);
        code.push(0xb1);
        let (instr, _) = decode_at(&code, 0).unwrap();
        assert_eq!(
            instr,
            Instr::TableSwitch {
                default: 16,
                low: 1,
                targets: vec![16, 17],
            }
        );
    }

    #[test]
    fn unsupported_opcodes_are_rejected() {
        assert!(decode_at(&[0xba, 0, 0, 0, 0], 0).is_err());
        assert!(decode_at(&[0xa8, 0, 3], 0).is_err());
    }
}
