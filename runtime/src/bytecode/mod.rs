//! The seam to the external reader plus the opaque-blob cursor API.
//!
//! Class-file and PE/CLI parsing live outside this crate. The reader hands
//! over `ClassDefinition` records with a symbolic constant pool; method
//! bodies stay raw byte blobs walked with `ByteCursor`.

use crate::error::VmError;
use crate::keys::Symbol;
use byteorder::{BigEndian, ByteOrder};

pub mod decode;
mod opcodes;

pub use opcodes::{NewArrayType, Opcode};

/// Big-endian cursor over a bytecode blob.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), VmError> {
        if pos > self.buf.len() {
            return Err(VmError::ClassFormat(format!(
                "seek to {pos} past end of {}-byte code blob",
                self.buf.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VmError> {
        if self.remaining() < n {
            return Err(VmError::ClassFormat(format!(
                "truncated code blob at offset {}",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u1(&mut self) -> Result<u8, VmError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u2(&mut self) -> Result<u16, VmError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_u4(&mut self) -> Result<u32, VmError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn read_u8(&mut self) -> Result<u64, VmError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn read_i1(&mut self) -> Result<i8, VmError> {
        Ok(self.read_u1()? as i8)
    }

    pub fn read_i2(&mut self) -> Result<i16, VmError> {
        Ok(self.read_u2()? as i16)
    }

    pub fn read_i4(&mut self) -> Result<i32, VmError> {
        Ok(self.read_u4()? as i32)
    }

    /// Skips the 0-3 alignment bytes after a tableswitch/lookupswitch opcode.
    pub fn align4(&mut self) -> Result<(), VmError> {
        while self.pos % 4 != 0 {
            self.read_u1()?;
        }
        Ok(())
    }

    pub fn read_opcode(&mut self) -> Result<Opcode, VmError> {
        let byte = self.read_u1()?;
        Opcode::try_from(byte)
            .map_err(|_| VmError::ClassFormat(format!("unknown opcode 0x{byte:02x}")))
    }
}

macro_rules! flags_type {
    ($name:ident { $($const_name:ident = $bit:expr => $method:ident;)* }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub u16);

        impl $name {
            $(pub const $const_name: u16 = $bit;)*

            $(
                pub fn $method(self) -> bool {
                    self.0 & Self::$const_name != 0
                }
            )*

            pub fn raw(self) -> u16 {
                self.0
            }
        }
    };
}

flags_type!(ClassFlags {
    PUBLIC = 0x0001 => is_public;
    FINAL = 0x0010 => is_final;
    INTERFACE = 0x0200 => is_interface;
    ABSTRACT = 0x0400 => is_abstract;
});

flags_type!(MethodFlags {
    PUBLIC = 0x0001 => is_public;
    PRIVATE = 0x0002 => is_private;
    STATIC = 0x0008 => is_static;
    FINAL = 0x0010 => is_final;
    SYNCHRONIZED = 0x0020 => is_synchronized;
    NATIVE = 0x0100 => is_native;
    ABSTRACT = 0x0400 => is_abstract;
});

flags_type!(FieldFlags {
    PUBLIC = 0x0001 => is_public;
    PRIVATE = 0x0002 => is_private;
    STATIC = 0x0008 => is_static;
    FINAL = 0x0010 => is_final;
    VOLATILE = 0x0040 => is_volatile;
});

/// One `[try_start, try_end)` range with its handler entry; `catch_type`
/// `None` marks a finally handler that matches everything.
#[derive(Debug, Clone)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: Option<Symbol>,
}

impl ExceptionTableEntry {
    pub fn covers(&self, pc: usize) -> bool {
        pc >= self.start_pc as usize && pc < self.end_pc as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line: u16,
}

#[derive(Debug, Clone)]
pub struct MethodCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Box<[u8]>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub line_numbers: Vec<LineNumberEntry>,
}

impl MethodCode {
    pub fn line_for_pc(&self, pc: usize) -> Option<u16> {
        let mut result = None;
        for entry in &self.line_numbers {
            if entry.start_pc as usize <= pc {
                result = Some(entry.line);
            } else {
                break;
            }
        }
        result.or_else(|| self.line_numbers.first().map(|e| e.line))
    }
}

/// Symbolic constant-pool entry; indices in bytecode are one-based into the
/// definition's `pool` vector.
#[derive(Debug, Clone)]
pub enum Constant {
    ClassRef(Symbol),
    FieldRef {
        class: Symbol,
        name: Symbol,
        desc: Symbol,
    },
    MethodRef {
        class: Symbol,
        name: Symbol,
        desc: Symbol,
    },
    InterfaceMethodRef {
        class: Symbol,
        name: Symbol,
        desc: Symbol,
    },
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    StringConst(Symbol),
    Utf8(Symbol),
}

#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub fn new(entries: Vec<Constant>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, constant: Constant) -> u16 {
        self.entries.push(constant);
        self.entries.len() as u16
    }

    pub fn get(&self, index: u16) -> Result<&Constant, VmError> {
        index
            .checked_sub(1)
            .and_then(|i| self.entries.get(i as usize))
            .ok_or_else(|| VmError::ClassFormat(format!("constant pool index {index} out of range")))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Constant] {
        &self.entries
    }

    pub fn class_ref(&self, index: u16) -> Result<Symbol, VmError> {
        match self.get(index)? {
            Constant::ClassRef(sym) => Ok(*sym),
            other => Err(VmError::ClassFormat(format!(
                "constant {index} is {other:?}, expected a class reference"
            ))),
        }
    }

    pub fn member_ref(&self, index: u16) -> Result<(Symbol, Symbol, Symbol), VmError> {
        match self.get(index)? {
            Constant::FieldRef { class, name, desc }
            | Constant::MethodRef { class, name, desc }
            | Constant::InterfaceMethodRef { class, name, desc } => Ok((*class, *name, *desc)),
            other => Err(VmError::ClassFormat(format!(
                "constant {index} is {other:?}, expected a member reference"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub name: Symbol,
    pub desc: Symbol,
    pub flags: FieldFlags,
}

/// Attribute the reader did not interpret, kept as an opaque blob.
#[derive(Debug, Clone)]
pub struct AttributeBlob {
    pub name: Symbol,
    pub data: Box<[u8]>,
}

#[derive(Debug, Clone)]
pub struct MethodDefinition {
    pub name: Symbol,
    pub desc: Symbol,
    pub flags: MethodFlags,
    pub code: Option<MethodCode>,
    /// Generic parameter names for CLI-shaped guests; empty otherwise.
    pub generic_params: Vec<Symbol>,
}

impl MethodDefinition {
    pub fn new(name: Symbol, desc: Symbol, flags: MethodFlags, code: Option<MethodCode>) -> Self {
        Self {
            name,
            desc,
            flags,
            code,
            generic_params: Vec::new(),
        }
    }
}

/// Everything the reader knows about one class. `value_class` is set by
/// CLI-shaped readers for value types and enums; dispatch uses it to decide
/// receiver unboxing.
#[derive(Debug, Clone)]
pub struct ClassDefinition {
    pub name: Symbol,
    pub flags: ClassFlags,
    pub super_name: Option<Symbol>,
    pub interfaces: Vec<Symbol>,
    pub fields: Vec<FieldDefinition>,
    pub methods: Vec<MethodDefinition>,
    pub pool: ConstantPool,
    pub source_file: Option<Symbol>,
    pub value_class: bool,
    /// Nested class links, by name.
    pub inner_classes: Vec<Symbol>,
    pub attributes: Vec<AttributeBlob>,
    /// Generic parameter names for CLI-shaped guests; empty otherwise.
    pub generic_params: Vec<Symbol>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_reads_big_endian() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xff];
        let mut cursor = ByteCursor::new(&buf);
        assert_eq!(cursor.read_u1().unwrap(), 0x01);
        assert_eq!(cursor.read_u2().unwrap(), 0x0203);
        assert_eq!(cursor.read_u4().unwrap(), 0x0405_0607);
        assert_eq!(cursor.read_i1().unwrap(), 0x08);
        assert_eq!(cursor.read_i1().unwrap(), -1);
        assert!(cursor.read_u1().is_err());
    }

    #[test]
    fn cursor_seek_and_align() {
        let buf = [0u8; 8];
        let mut cursor = ByteCursor::new(&buf);
        cursor.seek(1).unwrap();
        cursor.align4().unwrap();
        assert_eq!(cursor.offset(), 4);
        cursor.align4().unwrap();
        assert_eq!(cursor.offset(), 4);
        assert!(cursor.seek(9).is_err());
    }

    #[test]
    fn opcode_decoding() {
        assert_eq!(Opcode::try_from(0x60).unwrap(), Opcode::Iadd);
        assert_eq!(Opcode::try_from(0xb9).unwrap(), Opcode::Invokeinterface);
        assert!(Opcode::try_from(0xfe).is_err());
    }

    #[test]
    fn pool_indices_are_one_based() {
        let mut pool = ConstantPool::default();
        let sym = lasso::ThreadedRodeo::default().get_or_intern("A");
        let idx = pool.push(Constant::ClassRef(sym));
        assert_eq!(idx, 1);
        assert_eq!(pool.class_ref(idx).unwrap(), sym);
        assert!(pool.get(0).is_err());
        assert!(pool.get(2).is_err());
    }
}
