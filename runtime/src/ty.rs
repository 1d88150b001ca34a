//! Canonical type descriptors and guest signature parsing.
//!
//! Descriptors follow the class-file grammar (`I`, `[Ljava/lang/String;`,
//! `(IJ)V`). Equality is structural; interned class names make reference
//! equality of `Symbol`s sufficient for the reference case.

use crate::error::VmError;
use crate::keys::Symbol;
use lasso::ThreadedRodeo;
use std::fmt;

pub const WORD_LOG_SIZE: u32 = 3;
pub const WORD_SIZE: usize = 1 << WORD_LOG_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Bool,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl PrimitiveKind {
    pub const fn values() -> &'static [PrimitiveKind] {
        &[
            PrimitiveKind::Bool,
            PrimitiveKind::Byte,
            PrimitiveKind::Char,
            PrimitiveKind::Short,
            PrimitiveKind::Int,
            PrimitiveKind::Long,
            PrimitiveKind::Float,
            PrimitiveKind::Double,
        ]
    }

    /// log2 of the in-memory size in bytes.
    pub const fn log2_size(self) -> u32 {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::Byte => 0,
            PrimitiveKind::Char | PrimitiveKind::Short => 1,
            PrimitiveKind::Int | PrimitiveKind::Float => 2,
            PrimitiveKind::Long | PrimitiveKind::Double => 3,
        }
    }

    pub const fn byte_size(self) -> usize {
        1 << self.log2_size()
    }

    /// Long and double occupy two operand-stack slots.
    pub const fn is_two_slot(self) -> bool {
        matches!(self, PrimitiveKind::Long | PrimitiveKind::Double)
    }

    pub const fn shape(self) -> ValueShape {
        match self {
            PrimitiveKind::Bool
            | PrimitiveKind::Byte
            | PrimitiveKind::Char
            | PrimitiveKind::Short
            | PrimitiveKind::Int => ValueShape::Int,
            PrimitiveKind::Long => ValueShape::Long,
            PrimitiveKind::Float => ValueShape::Float,
            PrimitiveKind::Double => ValueShape::Double,
        }
    }

    pub const fn descriptor_char(self) -> char {
        match self {
            PrimitiveKind::Bool => 'Z',
            PrimitiveKind::Byte => 'B',
            PrimitiveKind::Char => 'C',
            PrimitiveKind::Short => 'S',
            PrimitiveKind::Int => 'I',
            PrimitiveKind::Long => 'J',
            PrimitiveKind::Float => 'F',
            PrimitiveKind::Double => 'D',
        }
    }

    pub const fn canonical_name(self) -> &'static str {
        match self {
            PrimitiveKind::Bool => "boolean",
            PrimitiveKind::Byte => "byte",
            PrimitiveKind::Char => "char",
            PrimitiveKind::Short => "short",
            PrimitiveKind::Int => "int",
            PrimitiveKind::Long => "long",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Double => "double",
        }
    }
}

/// The five shapes values take on the operand stack and in local-variable
/// cells; everything narrower than int widens to `Int`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueShape {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl ValueShape {
    pub const fn is_two_slot(self) -> bool {
        matches!(self, ValueShape::Long | ValueShape::Double)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Primitive(PrimitiveKind),
    Reference(Symbol),
    Array { dims: u8, base: Box<TypeDescriptor> },
    /// Raw machine pointer; never appears in guest descriptors, used for the
    /// native layouts the intrinsics expose.
    Pointer(Box<TypeDescriptor>),
}

impl TypeDescriptor {
    pub fn log2_size(&self) -> u32 {
        match self {
            TypeDescriptor::Primitive(kind) => kind.log2_size(),
            _ => WORD_LOG_SIZE,
        }
    }

    pub fn byte_size(&self) -> usize {
        1 << self.log2_size()
    }

    pub fn shape(&self) -> ValueShape {
        match self {
            TypeDescriptor::Primitive(kind) => kind.shape(),
            _ => ValueShape::Ref,
        }
    }

    pub fn is_reference_like(&self) -> bool {
        matches!(
            self,
            TypeDescriptor::Reference(_) | TypeDescriptor::Array { .. }
        )
    }

    pub fn element_type(&self) -> Option<TypeDescriptor> {
        match self {
            TypeDescriptor::Array { dims: 1, base } => Some((**base).clone()),
            TypeDescriptor::Array { dims, base } => Some(TypeDescriptor::Array {
                dims: dims - 1,
                base: base.clone(),
            }),
            _ => None,
        }
    }

    /// Parses one field descriptor; the whole input must be consumed.
    pub fn parse(desc: &str, interner: &ThreadedRodeo) -> Result<Self, VmError> {
        let mut rest = desc;
        let parsed = Self::parse_prefix(&mut rest, interner)?;
        if !rest.is_empty() {
            return Err(VmError::ClassFormat(format!(
                "trailing characters in type descriptor {desc:?}"
            )));
        }
        Ok(parsed)
    }

    fn parse_prefix(rest: &mut &str, interner: &ThreadedRodeo) -> Result<Self, VmError> {
        let bad = |d: &str| VmError::ClassFormat(format!("malformed type descriptor {d:?}"));
        let mut dims = 0u8;
        while let Some(stripped) = rest.strip_prefix('[') {
            dims = dims.checked_add(1).ok_or_else(|| bad(rest))?;
            *rest = stripped;
        }
        let first = rest.chars().next().ok_or_else(|| bad(rest))?;
        let base = match first {
            'Z' => TypeDescriptor::Primitive(PrimitiveKind::Bool),
            'B' => TypeDescriptor::Primitive(PrimitiveKind::Byte),
            'C' => TypeDescriptor::Primitive(PrimitiveKind::Char),
            'S' => TypeDescriptor::Primitive(PrimitiveKind::Short),
            'I' => TypeDescriptor::Primitive(PrimitiveKind::Int),
            'J' => TypeDescriptor::Primitive(PrimitiveKind::Long),
            'F' => TypeDescriptor::Primitive(PrimitiveKind::Float),
            'D' => TypeDescriptor::Primitive(PrimitiveKind::Double),
            'L' => {
                let end = rest.find(';').ok_or_else(|| bad(rest))?;
                let name = &rest[1..end];
                let sym = interner.get_or_intern(name);
                *rest = &rest[end + 1..];
                let parsed = TypeDescriptor::Reference(sym);
                return Ok(if dims == 0 {
                    parsed
                } else {
                    TypeDescriptor::Array {
                        dims,
                        base: Box::new(parsed),
                    }
                });
            }
            _ => return Err(bad(rest)),
        };
        *rest = &rest[1..];
        Ok(if dims == 0 {
            base
        } else {
            TypeDescriptor::Array {
                dims,
                base: Box::new(base),
            }
        })
    }

    pub fn write_descriptor(&self, out: &mut String, interner: &ThreadedRodeo) {
        match self {
            TypeDescriptor::Primitive(kind) => out.push(kind.descriptor_char()),
            TypeDescriptor::Reference(sym) => {
                out.push('L');
                out.push_str(interner.resolve(sym));
                out.push(';');
            }
            TypeDescriptor::Array { dims, base } => {
                for _ in 0..*dims {
                    out.push('[');
                }
                base.write_descriptor(out, interner);
            }
            TypeDescriptor::Pointer(base) => {
                // No guest spelling; the debug form is enough for diagnostics.
                out.push('*');
                base.write_descriptor(out, interner);
            }
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Primitive(kind) => write!(f, "{}", kind.canonical_name()),
            TypeDescriptor::Reference(_) => write!(f, "reference"),
            TypeDescriptor::Array { dims, base } => {
                write!(f, "{}{}", base, "[]".repeat(*dims as usize))
            }
            TypeDescriptor::Pointer(base) => write!(f, "{}*", base),
        }
    }
}

/// Parsed method signature: parameter types plus return type (`None` = void).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub params: Vec<TypeDescriptor>,
    pub ret: Option<TypeDescriptor>,
}

impl MethodDescriptor {
    pub fn parse(desc: &str, interner: &ThreadedRodeo) -> Result<Self, VmError> {
        let bad = || VmError::ClassFormat(format!("malformed method descriptor {desc:?}"));
        let mut rest = desc.strip_prefix('(').ok_or_else(bad)?;
        let mut params = Vec::new();
        while !rest.starts_with(')') {
            if rest.is_empty() {
                return Err(bad());
            }
            params.push(TypeDescriptor::parse_prefix(&mut rest, interner)?);
        }
        rest = &rest[1..];
        let ret = if rest == "V" {
            None
        } else {
            let mut ret_rest = rest;
            let parsed = TypeDescriptor::parse_prefix(&mut ret_rest, interner)?;
            if !ret_rest.is_empty() {
                return Err(bad());
            }
            Some(parsed)
        };
        Ok(Self { params, ret })
    }

    /// Operand-stack slots consumed by the arguments, receiver excluded.
    pub fn arg_slot_count(&self) -> usize {
        self.params
            .iter()
            .map(|p| if p.shape().is_two_slot() { 2 } else { 1 })
            .sum()
    }

    pub fn ret_shape(&self) -> Option<ValueShape> {
        self.ret.as_ref().map(|t| t.shape())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn interner() -> ThreadedRodeo {
        ThreadedRodeo::default()
    }

    #[rstest]
    #[case(PrimitiveKind::Bool, 0)]
    #[case(PrimitiveKind::Byte, 0)]
    #[case(PrimitiveKind::Char, 1)]
    #[case(PrimitiveKind::Short, 1)]
    #[case(PrimitiveKind::Int, 2)]
    #[case(PrimitiveKind::Float, 2)]
    #[case(PrimitiveKind::Long, 3)]
    #[case(PrimitiveKind::Double, 3)]
    fn primitive_log_sizes(#[case] kind: PrimitiveKind, #[case] log: u32) {
        assert_eq!(kind.log2_size(), log);
        assert_eq!(kind.byte_size(), 1usize << log);
    }

    #[test]
    fn parses_scalar_and_reference() {
        let rodeo = interner();
        assert_eq!(
            TypeDescriptor::parse("I", &rodeo).unwrap(),
            TypeDescriptor::Primitive(PrimitiveKind::Int)
        );
        let string_sym = rodeo.get_or_intern("java/lang/String");
        assert_eq!(
            TypeDescriptor::parse("Ljava/lang/String;", &rodeo).unwrap(),
            TypeDescriptor::Reference(string_sym)
        );
    }

    #[test]
    fn parses_arrays_with_dimensions() {
        let rodeo = interner();
        let ty = TypeDescriptor::parse("[[J", &rodeo).unwrap();
        assert_eq!(
            ty,
            TypeDescriptor::Array {
                dims: 2,
                base: Box::new(TypeDescriptor::Primitive(PrimitiveKind::Long)),
            }
        );
        assert_eq!(ty.shape(), ValueShape::Ref);
        assert_eq!(
            ty.element_type().unwrap(),
            TypeDescriptor::Array {
                dims: 1,
                base: Box::new(TypeDescriptor::Primitive(PrimitiveKind::Long)),
            }
        );
    }

    #[test]
    fn equality_is_structural() {
        let rodeo = interner();
        let a = TypeDescriptor::parse("[Ljava/lang/Object;", &rodeo).unwrap();
        let b = TypeDescriptor::parse("[Ljava/lang/Object;", &rodeo).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_descriptors() {
        let rodeo = interner();
        assert!(TypeDescriptor::parse("", &rodeo).is_err());
        assert!(TypeDescriptor::parse("Q", &rodeo).is_err());
        assert!(TypeDescriptor::parse("Ljava/lang/String", &rodeo).is_err());
        assert!(TypeDescriptor::parse("II", &rodeo).is_err());
        assert!(MethodDescriptor::parse("(I", &rodeo).is_err());
        assert!(MethodDescriptor::parse("(I)VV", &rodeo).is_err());
    }

    #[test]
    fn parses_method_descriptors() {
        let rodeo = interner();
        let desc = MethodDescriptor::parse("(IJLjava/lang/String;[D)V", &rodeo).unwrap();
        assert_eq!(desc.params.len(), 4);
        assert_eq!(desc.ret, None);
        assert_eq!(desc.arg_slot_count(), 6);

        let desc = MethodDescriptor::parse("()[I", &rodeo).unwrap();
        assert!(desc.params.is_empty());
        assert_eq!(desc.ret_shape(), Some(ValueShape::Ref));
    }

    #[test]
    fn descriptor_round_trips_through_writer() {
        let rodeo = interner();
        for text in ["I", "[[J", "Ljava/lang/String;", "[Ljava/lang/Object;"] {
            let ty = TypeDescriptor::parse(text, &rodeo).unwrap();
            let mut out = String::new();
            ty.write_descriptor(&mut out, &rodeo);
            assert_eq!(out, text);
        }
    }
}
