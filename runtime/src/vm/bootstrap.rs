//! Well-known names and the bootstrap class provider.
//!
//! The standard library proper is out of scope; the bootstrap provider
//! synthesises just enough of the core hierarchy (root class, marker
//! interfaces, `String`, `Throwable` and the runtime-raised exception
//! classes) for resolution, dispatch and exception materialisation to work.

use crate::bytecode::{
    ClassDefinition, ClassFlags, ConstantPool, FieldDefinition, FieldFlags, MethodCode,
    MethodDefinition, MethodFlags,
};
use crate::error::{ExceptionKind, VmError};
use crate::keys::{FieldKey, Symbol};
use crate::rt::registry::ClassProvider;
use crate::ty::PrimitiveKind;
use crate::{build_exception, throw_exception};
use lasso::ThreadedRodeo;

/// Interned names every subsystem keeps reaching for.
pub struct BootstrapRegistry {
    pub java_lang_object_sym: Symbol,
    pub java_lang_string_sym: Symbol,
    pub java_lang_throwable_sym: Symbol,
    pub java_lang_cloneable_sym: Symbol,
    pub java_io_serializable_sym: Symbol,
    pub java_lang_math_sym: Symbol,
    pub init_sym: Symbol,
    pub clinit_sym: Symbol,
    pub main_sym: Symbol,
    pub main_desc_sym: Symbol,
    /// The orderly-shutdown entry point recognised by isolate termination.
    pub stop_sym: Symbol,
    /// Classes declaring this become finalisation candidates on allocation.
    pub finalize_key: crate::keys::MethodKey,
    pub detail_message_fk: FieldKey,
    pub string_value_fk: FieldKey,
    primitive_syms: [(PrimitiveKind, Symbol); 8],
}

impl BootstrapRegistry {
    pub fn new(interner: &ThreadedRodeo) -> Self {
        let primitive_syms = [
            PrimitiveKind::Bool,
            PrimitiveKind::Byte,
            PrimitiveKind::Char,
            PrimitiveKind::Short,
            PrimitiveKind::Int,
            PrimitiveKind::Long,
            PrimitiveKind::Float,
            PrimitiveKind::Double,
        ]
        .map(|kind| (kind, interner.get_or_intern(kind.canonical_name())));
        Self {
            java_lang_object_sym: interner.get_or_intern("java/lang/Object"),
            java_lang_string_sym: interner.get_or_intern("java/lang/String"),
            java_lang_throwable_sym: interner.get_or_intern("java/lang/Throwable"),
            java_lang_cloneable_sym: interner.get_or_intern("java/lang/Cloneable"),
            java_io_serializable_sym: interner.get_or_intern("java/io/Serializable"),
            java_lang_math_sym: interner.get_or_intern("java/lang/Math"),
            init_sym: interner.get_or_intern("<init>"),
            clinit_sym: interner.get_or_intern("<clinit>"),
            main_sym: interner.get_or_intern("main"),
            main_desc_sym: interner.get_or_intern("([Ljava/lang/String;)V"),
            stop_sym: interner.get_or_intern("stop"),
            finalize_key: crate::keys::MethodKey {
                name: interner.get_or_intern("finalize"),
                desc: interner.get_or_intern("()V"),
            },
            detail_message_fk: FieldKey {
                name: interner.get_or_intern("detailMessage"),
                desc: interner.get_or_intern("Ljava/lang/String;"),
            },
            string_value_fk: FieldKey {
                name: interner.get_or_intern("value"),
                desc: interner.get_or_intern("[B"),
            },
            primitive_syms,
        }
    }

    pub fn primitive_sym(&self, kind: PrimitiveKind) -> Symbol {
        self.primitive_syms
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, sym)| *sym)
            .expect("all primitive kinds registered")
    }
}

fn trivial_code(bytes: &[u8], max_stack: u16, max_locals: u16) -> MethodCode {
    MethodCode {
        max_stack,
        max_locals,
        code: bytes.to_vec().into_boxed_slice(),
        exception_table: Vec::new(),
        line_numbers: Vec::new(),
    }
}

fn trivial_init(interner: &ThreadedRodeo) -> MethodDefinition {
    // <init> is a bare return; nothing up the synthesised chain has state.
    MethodDefinition::new(
        interner.get_or_intern("<init>"),
        interner.get_or_intern("()V"),
        MethodFlags(MethodFlags::PUBLIC),
        Some(trivial_code(&[0xb1], 0, 1)),
    )
}

fn object_definition(interner: &ThreadedRodeo) -> ClassDefinition {
    // equals: reference identity; hashCode: constant. Real library bodies are
    // native and out of scope.
    let equals_code = trivial_code(&[0x2a, 0x2b, 0xa5, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac], 2, 2);
    let hash_code = trivial_code(&[0x03, 0xac], 1, 1);
    ClassDefinition {
        name: interner.get_or_intern("java/lang/Object"),
        flags: ClassFlags(ClassFlags::PUBLIC),
        super_name: None,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: vec![
            trivial_init(interner),
            MethodDefinition::new(
                interner.get_or_intern("equals"),
                interner.get_or_intern("(Ljava/lang/Object;)Z"),
                MethodFlags(MethodFlags::PUBLIC),
                Some(equals_code),
            ),
            MethodDefinition::new(
                interner.get_or_intern("hashCode"),
                interner.get_or_intern("()I"),
                MethodFlags(MethodFlags::PUBLIC),
                Some(hash_code),
            ),
        ],
        pool: ConstantPool::default(),
        source_file: None,
        value_class: false,
        inner_classes: Vec::new(),
        attributes: Vec::new(),
        generic_params: Vec::new(),
    }
}

fn marker_interface(interner: &ThreadedRodeo, name: &str) -> ClassDefinition {
    ClassDefinition {
        name: interner.get_or_intern(name),
        flags: ClassFlags(ClassFlags::PUBLIC | ClassFlags::INTERFACE | ClassFlags::ABSTRACT),
        super_name: Some(interner.get_or_intern("java/lang/Object")),
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        pool: ConstantPool::default(),
        source_file: None,
        value_class: false,
        inner_classes: Vec::new(),
        attributes: Vec::new(),
        generic_params: Vec::new(),
    }
}

fn simple_class(
    interner: &ThreadedRodeo,
    name: &str,
    super_name: &str,
    fields: Vec<FieldDefinition>,
) -> ClassDefinition {
    ClassDefinition {
        name: interner.get_or_intern(name),
        flags: ClassFlags(ClassFlags::PUBLIC),
        super_name: Some(interner.get_or_intern(super_name)),
        interfaces: Vec::new(),
        fields,
        methods: vec![trivial_init(interner)],
        pool: ConstantPool::default(),
        source_file: None,
        value_class: false,
        inner_classes: Vec::new(),
        attributes: Vec::new(),
        generic_params: Vec::new(),
    }
}

/// Super class for each runtime-raised exception kind; everything that is a
/// `*Error` hangs off `java/lang/Error`, checked exceptions off
/// `java/lang/Exception`, the rest off `java/lang/RuntimeException`.
fn exception_super(kind: ExceptionKind) -> &'static str {
    match kind {
        ExceptionKind::ClassNotFoundException | ExceptionKind::InterruptedException => {
            "java/lang/Exception"
        }
        ExceptionKind::NullPointerException
        | ExceptionKind::ArrayIndexOutOfBoundsException
        | ExceptionKind::ClassCastException
        | ExceptionKind::ArithmeticException
        | ExceptionKind::ArrayStoreException
        | ExceptionKind::NegativeArraySizeException => "java/lang/RuntimeException",
        _ => "java/lang/Error",
    }
}

const EXCEPTION_KINDS: &[ExceptionKind] = &[
    ExceptionKind::NullPointerException,
    ExceptionKind::ArrayIndexOutOfBoundsException,
    ExceptionKind::ClassCastException,
    ExceptionKind::ArithmeticException,
    ExceptionKind::ArrayStoreException,
    ExceptionKind::NegativeArraySizeException,
    ExceptionKind::StackOverflowError,
    ExceptionKind::OutOfMemoryError,
    ExceptionKind::NoClassDefFoundError,
    ExceptionKind::ClassFormatError,
    ExceptionKind::ClassNotFoundException,
    ExceptionKind::LinkageError,
    ExceptionKind::IncompatibleClassChangeError,
    ExceptionKind::UnsatisfiedLinkError,
    ExceptionKind::NoSuchFieldError,
    ExceptionKind::NoSuchMethodError,
    ExceptionKind::AbstractMethodError,
    ExceptionKind::ExceptionInInitializerError,
    ExceptionKind::InterruptedException,
    ExceptionKind::InternalError,
];

/// Serves the synthesised core hierarchy to the bootstrap loader.
pub struct BootstrapProvider;

impl ClassProvider for BootstrapProvider {
    fn find_class(
        &self,
        name: Symbol,
        interner: &ThreadedRodeo,
    ) -> Result<ClassDefinition, VmError> {
        let name_str = interner.resolve(&name).to_string();
        match name_str.as_str() {
            "java/lang/Object" => Ok(object_definition(interner)),
            "java/lang/Cloneable" => Ok(marker_interface(interner, "java/lang/Cloneable")),
            "java/io/Serializable" => Ok(marker_interface(interner, "java/io/Serializable")),
            "java/lang/String" => Ok(simple_class(
                interner,
                "java/lang/String",
                "java/lang/Object",
                vec![FieldDefinition {
                    name: interner.get_or_intern("value"),
                    desc: interner.get_or_intern("[B"),
                    flags: FieldFlags(FieldFlags::PRIVATE | FieldFlags::FINAL),
                }],
            )),
            "java/lang/Throwable" => Ok(simple_class(
                interner,
                "java/lang/Throwable",
                "java/lang/Object",
                vec![FieldDefinition {
                    name: interner.get_or_intern("detailMessage"),
                    desc: interner.get_or_intern("Ljava/lang/String;"),
                    flags: FieldFlags(FieldFlags::PRIVATE),
                }],
            )),
            "java/lang/Exception" => Ok(simple_class(
                interner,
                "java/lang/Exception",
                "java/lang/Throwable",
                Vec::new(),
            )),
            "java/lang/RuntimeException" => Ok(simple_class(
                interner,
                "java/lang/RuntimeException",
                "java/lang/Exception",
                Vec::new(),
            )),
            "java/lang/Error" => Ok(simple_class(
                interner,
                "java/lang/Error",
                "java/lang/Throwable",
                Vec::new(),
            )),
            "java/lang/Math" => Ok(ClassDefinition {
                name,
                flags: ClassFlags(ClassFlags::PUBLIC | ClassFlags::FINAL),
                super_name: Some(interner.get_or_intern("java/lang/Object")),
                interfaces: Vec::new(),
                fields: Vec::new(),
                // Bodies are intrinsified by the translator; the class only
                // has to resolve.
                methods: Vec::new(),
                pool: ConstantPool::default(),
                source_file: None,
                value_class: false,
                inner_classes: Vec::new(),
                attributes: Vec::new(),
                generic_params: Vec::new(),
            }),
            _ => {
                for kind in EXCEPTION_KINDS {
                    if kind.class_name() == name_str {
                        return Ok(simple_class(
                            interner,
                            kind.class_name(),
                            exception_super(*kind),
                            Vec::new(),
                        ));
                    }
                }
                throw_exception!(NoClassDefFoundError, class_sym: name)
            }
        }
    }
}

/// Chains an application provider behind the bootstrap one.
pub struct ChainedProvider {
    pub first: Box<dyn ClassProvider>,
    pub second: Box<dyn ClassProvider>,
}

impl ClassProvider for ChainedProvider {
    fn find_class(
        &self,
        name: Symbol,
        interner: &ThreadedRodeo,
    ) -> Result<ClassDefinition, VmError> {
        match self.first.find_class(name, interner) {
            Ok(def) => Ok(def),
            Err(_) => self
                .second
                .find_class(name, interner)
                .map_err(|_| build_exception!(NoClassDefFoundError, class_sym: name)),
        }
    }
}
