//! Shared test scaffolding: a map-backed class provider and small helpers
//! for assembling class definitions by hand.
#![allow(dead_code)]

use lasso::ThreadedRodeo;
use std::collections::HashMap;
use std::sync::Arc;
use vmkit_runtime::bytecode::{
    ClassDefinition, ClassFlags, Constant, ConstantPool, ExceptionTableEntry, FieldDefinition,
    FieldFlags, MethodCode, MethodDefinition, MethodFlags,
};
use vmkit_runtime::error::VmError;
use vmkit_runtime::keys::Symbol;
use vmkit_runtime::rt::registry::ClassProvider;
use vmkit_runtime::vm::VirtualMachine;
use vmkit_runtime::{VmConfig, build_exception};

pub type ClassFn = Box<dyn Fn(&ThreadedRodeo) -> ClassDefinition + Send + Sync>;

pub struct TestProvider {
    classes: HashMap<String, ClassFn>,
}

impl TestProvider {
    pub fn new(classes: Vec<(&str, ClassFn)>) -> Self {
        Self {
            classes: classes
                .into_iter()
                .map(|(name, f)| (name.to_string(), f))
                .collect(),
        }
    }
}

impl ClassProvider for TestProvider {
    fn find_class(
        &self,
        name: Symbol,
        interner: &ThreadedRodeo,
    ) -> Result<ClassDefinition, VmError> {
        let name_str = interner.resolve(&name);
        match self.classes.get(name_str) {
            Some(build) => Ok(build(interner)),
            None => Err(build_exception!(NoClassDefFoundError, class_sym: name)),
        }
    }
}

pub fn vm_with(classes: Vec<(&str, ClassFn)>) -> Arc<VirtualMachine> {
    vm_with_config(VmConfig::default(), classes)
}

pub fn vm_with_config(config: VmConfig, classes: Vec<(&str, ClassFn)>) -> Arc<VirtualMachine> {
    VirtualMachine::new(config, Some(Box::new(TestProvider::new(classes)))).expect("vm boots")
}

pub struct ClassSpec {
    pub name: &'static str,
    pub super_name: &'static str,
    pub interfaces: Vec<&'static str>,
    pub flags: ClassFlags,
    pub fields: Vec<(&'static str, &'static str, u16)>,
    pub methods: Vec<MethodSpec>,
    pub pool: Vec<PoolSpec>,
    pub value_class: bool,
}

impl Default for ClassSpec {
    fn default() -> Self {
        Self {
            name: "",
            super_name: "java/lang/Object",
            interfaces: Vec::new(),
            flags: ClassFlags(ClassFlags::PUBLIC),
            fields: Vec::new(),
            methods: Vec::new(),
            pool: Vec::new(),
            value_class: false,
        }
    }
}

pub struct MethodSpec {
    pub name: &'static str,
    pub desc: &'static str,
    pub flags: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    /// `(start, end, handler, catch class)`; `None` catches everything.
    pub exceptions: Vec<(u16, u16, u16, Option<&'static str>)>,
}

impl MethodSpec {
    pub fn new(name: &'static str, desc: &'static str, code: Vec<u8>) -> Self {
        Self {
            name,
            desc,
            flags: MethodFlags::PUBLIC,
            max_stack: 8,
            max_locals: 8,
            code,
            exceptions: Vec::new(),
        }
    }

    pub fn public_static(mut self) -> Self {
        self.flags |= MethodFlags::STATIC;
        self
    }

    pub fn synchronized(mut self) -> Self {
        self.flags |= MethodFlags::SYNCHRONIZED;
        self
    }

    pub fn abstract_method(name: &'static str, desc: &'static str) -> Self {
        Self {
            name,
            desc,
            flags: MethodFlags::PUBLIC | MethodFlags::ABSTRACT,
            max_stack: 0,
            max_locals: 0,
            code: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    pub fn with_exceptions(
        mut self,
        exceptions: Vec<(u16, u16, u16, Option<&'static str>)>,
    ) -> Self {
        self.exceptions = exceptions;
        self
    }
}

/// Symbolic pool entries; bytecode references them by one-based index in
/// declaration order.
pub enum PoolSpec {
    Class(&'static str),
    Method(&'static str, &'static str, &'static str),
    InterfaceMethod(&'static str, &'static str, &'static str),
    Field(&'static str, &'static str, &'static str),
    Str(&'static str),
    Int(i32),
    LongConst(i64),
    DoubleConst(f64),
}

pub fn build_class(spec: &ClassSpec, interner: &ThreadedRodeo) -> ClassDefinition {
    let mut pool = ConstantPool::default();
    for entry in &spec.pool {
        let constant = match entry {
            PoolSpec::Class(name) => Constant::ClassRef(interner.get_or_intern(name)),
            PoolSpec::Method(class, name, desc) => Constant::MethodRef {
                class: interner.get_or_intern(class),
                name: interner.get_or_intern(name),
                desc: interner.get_or_intern(desc),
            },
            PoolSpec::InterfaceMethod(class, name, desc) => Constant::InterfaceMethodRef {
                class: interner.get_or_intern(class),
                name: interner.get_or_intern(name),
                desc: interner.get_or_intern(desc),
            },
            PoolSpec::Field(class, name, desc) => Constant::FieldRef {
                class: interner.get_or_intern(class),
                name: interner.get_or_intern(name),
                desc: interner.get_or_intern(desc),
            },
            PoolSpec::Str(text) => Constant::StringConst(interner.get_or_intern(text)),
            PoolSpec::Int(v) => Constant::Integer(*v),
            PoolSpec::LongConst(v) => Constant::Long(*v),
            PoolSpec::DoubleConst(v) => Constant::Double(*v),
        };
        pool.push(constant);
    }

    let methods = spec
        .methods
        .iter()
        .map(|m| {
            let code = if m.flags & MethodFlags::ABSTRACT != 0 {
                None
            } else {
                Some(MethodCode {
                    max_stack: m.max_stack,
                    max_locals: m.max_locals,
                    code: m.code.clone().into_boxed_slice(),
                    exception_table: m
                        .exceptions
                        .iter()
                        .map(|(start, end, handler, catch)| ExceptionTableEntry {
                            start_pc: *start,
                            end_pc: *end,
                            handler_pc: *handler,
                            catch_type: catch.map(|c| interner.get_or_intern(c)),
                        })
                        .collect(),
                    line_numbers: Vec::new(),
                })
            };
            MethodDefinition::new(
                interner.get_or_intern(m.name),
                interner.get_or_intern(m.desc),
                MethodFlags(m.flags),
                code,
            )
        })
        .collect();

    ClassDefinition {
        name: interner.get_or_intern(spec.name),
        flags: spec.flags,
        super_name: Some(interner.get_or_intern(spec.super_name)),
        interfaces: spec
            .interfaces
            .iter()
            .map(|i| interner.get_or_intern(i))
            .collect(),
        fields: spec
            .fields
            .iter()
            .map(|(name, desc, flags)| FieldDefinition {
                name: interner.get_or_intern(name),
                desc: interner.get_or_intern(desc),
                flags: FieldFlags(*flags),
            })
            .collect(),
        methods,
        pool,
        source_file: None,
        value_class: spec.value_class,
        inner_classes: Vec::new(),
        attributes: Vec::new(),
        generic_params: Vec::new(),
    }
}

/// Wraps a `ClassSpec` into the provider closure form.
pub fn class_fn(spec: ClassSpec) -> (&'static str, ClassFn) {
    let name = spec.name;
    (name, Box::new(move |interner| build_class(&spec, interner)))
}

/// A trivial `<init>` that just returns.
pub fn trivial_init() -> MethodSpec {
    MethodSpec::new("<init>", "()V", vec![0xb1])
}

// Opcode bytes used by the hand-assembled test methods.
pub mod op {
    pub const ICONST_0: u8 = 0x03;
    pub const ICONST_1: u8 = 0x04;
    pub const ICONST_2: u8 = 0x05;
    pub const ICONST_5: u8 = 0x08;
    pub const BIPUSH: u8 = 0x10;
    pub const LDC: u8 = 0x12;
    pub const ILOAD_0: u8 = 0x1a;
    pub const ILOAD_1: u8 = 0x1b;
    pub const LLOAD_1: u8 = 0x1f;
    pub const DLOAD_3: u8 = 0x29;
    pub const ALOAD_0: u8 = 0x2a;
    pub const ALOAD_1: u8 = 0x2b;
    pub const ALOAD_2: u8 = 0x2c;
    pub const IALOAD: u8 = 0x2e;
    pub const ISTORE_1: u8 = 0x3c;
    pub const ASTORE_0: u8 = 0x4b;
    pub const ASTORE_1: u8 = 0x4c;
    pub const IASTORE: u8 = 0x4f;
    pub const DUP: u8 = 0x59;
    pub const IADD: u8 = 0x60;
    pub const DADD: u8 = 0x63;
    pub const IMUL: u8 = 0x68;
    pub const IDIV: u8 = 0x6c;
    pub const IOR: u8 = 0x80;
    pub const IINC: u8 = 0x84;
    pub const I2D: u8 = 0x87;
    pub const L2D: u8 = 0x8a;
    pub const GOTO: u8 = 0xa7;
    pub const IRETURN: u8 = 0xac;
    pub const DRETURN: u8 = 0xaf;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTSTATIC: u8 = 0xb3;
    pub const GETFIELD: u8 = 0xb4;
    pub const PUTFIELD: u8 = 0xb5;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const NEW: u8 = 0xbb;
    pub const NEWARRAY: u8 = 0xbc;
    pub const ARRAYLENGTH: u8 = 0xbe;
    pub const ATHROW: u8 = 0xbf;
}

/// `u16` operand bytes.
pub fn u2(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}
