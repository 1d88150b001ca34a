use crate::heap::GcRef;
use crate::keys::{FieldKey, MethodKey, Symbol};
use lasso::ThreadedRodeo;
use std::fmt::Display;

#[derive(Debug)]
pub enum VmError {
    MainClassNotFound(String),
    /// Malformed input handed over by the reader.
    ClassFormat(String),
    /// A one-shot metadata slot was read before resolution set it, or set twice.
    ResolutionState(&'static str),
    /// The class lifecycle was driven out of order.
    Lifecycle {
        class: Symbol,
        expected: &'static str,
    },
    /// The backend was asked for something it never defined.
    UnknownFunction(String),
    /// A guest exception represented as a plain value, not yet materialised
    /// on the guest heap.
    Exception(GuestException),
    /// A guest exception object already in flight on the guest heap.
    Thrown(GcRef),
}

impl From<GuestException> for VmError {
    fn from(value: GuestException) -> Self {
        VmError::Exception(value)
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl VmError {
    pub fn into_pretty_string(self, interner: &ThreadedRodeo) -> String {
        match self {
            VmError::Exception(ex) => {
                let mut result = ex.kind.class_name_dot();
                if let Some(message) = ex.message {
                    result.push_str(": ");
                    result.push_str(&message.into_resolved(interner));
                }
                if let Some(cause) = ex.cause {
                    result.push_str(&format!(
                        "\nCaused by: {}",
                        VmError::Exception(*cause).into_pretty_string(interner)
                    ));
                }
                result
            }
            _ => format!("{:?}", self),
        }
    }
}

/// Guest exception kinds the runtime itself raises. Every error kind that
/// surfaces to the guest maps to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    NullPointerException,
    ArrayIndexOutOfBoundsException,
    ClassCastException,
    ArithmeticException,
    ArrayStoreException,
    NegativeArraySizeException,
    StackOverflowError,
    OutOfMemoryError,
    NoClassDefFoundError,
    ClassFormatError,
    ClassNotFoundException,
    LinkageError,
    IncompatibleClassChangeError,
    UnsatisfiedLinkError,
    NoSuchFieldError,
    NoSuchMethodError,
    AbstractMethodError,
    ExceptionInInitializerError,
    InterruptedException,
    InternalError,
}

impl ExceptionKind {
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::NullPointerException => "java/lang/NullPointerException",
            Self::ArrayIndexOutOfBoundsException => "java/lang/ArrayIndexOutOfBoundsException",
            Self::ClassCastException => "java/lang/ClassCastException",
            Self::ArithmeticException => "java/lang/ArithmeticException",
            Self::ArrayStoreException => "java/lang/ArrayStoreException",
            Self::NegativeArraySizeException => "java/lang/NegativeArraySizeException",
            Self::StackOverflowError => "java/lang/StackOverflowError",
            Self::OutOfMemoryError => "java/lang/OutOfMemoryError",
            Self::NoClassDefFoundError => "java/lang/NoClassDefFoundError",
            Self::ClassFormatError => "java/lang/ClassFormatError",
            Self::ClassNotFoundException => "java/lang/ClassNotFoundException",
            Self::LinkageError => "java/lang/LinkageError",
            Self::IncompatibleClassChangeError => "java/lang/IncompatibleClassChangeError",
            Self::UnsatisfiedLinkError => "java/lang/UnsatisfiedLinkError",
            Self::NoSuchFieldError => "java/lang/NoSuchFieldError",
            Self::NoSuchMethodError => "java/lang/NoSuchMethodError",
            Self::AbstractMethodError => "java/lang/AbstractMethodError",
            Self::ExceptionInInitializerError => "java/lang/ExceptionInInitializerError",
            Self::InterruptedException => "java/lang/InterruptedException",
            Self::InternalError => "java/lang/InternalError",
        }
    }

    pub fn class_name_dot(self) -> String {
        self.class_name().replace('/', ".")
    }
}

#[derive(Debug, Clone)]
pub enum ExceptionMessage {
    Resolved(String),
    MethodNotFound(MethodKey, Symbol),
    FieldNotFound(FieldKey, Symbol),
    ClassNotFound(Symbol),
}

impl ExceptionMessage {
    pub fn into_resolved(self, interner: &ThreadedRodeo) -> String {
        match self {
            ExceptionMessage::Resolved(s) => s,
            ExceptionMessage::MethodNotFound(key, class_sym) => {
                format!(
                    "{}.{}{}",
                    interner.resolve(&class_sym),
                    interner.resolve(&key.name),
                    interner.resolve(&key.desc)
                )
            }
            ExceptionMessage::FieldNotFound(key, class_sym) => {
                format!(
                    "{}.{} of type {}",
                    interner.resolve(&class_sym),
                    interner.resolve(&key.name),
                    interner.resolve(&key.desc)
                )
            }
            ExceptionMessage::ClassNotFound(sym) => interner.resolve(&sym).to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuestException {
    pub kind: ExceptionKind,
    pub message: Option<ExceptionMessage>,
    pub cause: Option<Box<GuestException>>,
}

impl GuestException {
    pub fn new(kind: ExceptionKind) -> Self {
        Self {
            kind,
            message: None,
            cause: None,
        }
    }

    pub fn with_message(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(ExceptionMessage::Resolved(message.into())),
            cause: None,
        }
    }

    pub fn with_method_not_found(kind: ExceptionKind, key: MethodKey, class_sym: Symbol) -> Self {
        Self {
            kind,
            message: Some(ExceptionMessage::MethodNotFound(key, class_sym)),
            cause: None,
        }
    }

    pub fn with_field_not_found(kind: ExceptionKind, key: FieldKey, class_sym: Symbol) -> Self {
        Self {
            kind,
            message: Some(ExceptionMessage::FieldNotFound(key, class_sym)),
            cause: None,
        }
    }

    pub fn with_class_not_found(kind: ExceptionKind, class_sym: Symbol) -> Self {
        Self {
            kind,
            message: Some(ExceptionMessage::ClassNotFound(class_sym)),
            cause: None,
        }
    }

    pub fn caused_by(mut self, cause: GuestException) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// Builds a `VmError::Exception` without returning it.
#[macro_export]
macro_rules! build_exception {
    ($kind:ident) => {
        $crate::error::VmError::Exception($crate::error::GuestException::new(
            $crate::error::ExceptionKind::$kind,
        ))
    };
    ($kind:ident, $msg:expr) => {
        $crate::error::VmError::Exception($crate::error::GuestException::with_message(
            $crate::error::ExceptionKind::$kind,
            $msg,
        ))
    };
    ($kind:ident, method_key: $key:expr, class_sym: $class:expr) => {
        $crate::error::VmError::Exception($crate::error::GuestException::with_method_not_found(
            $crate::error::ExceptionKind::$kind,
            $key,
            $class,
        ))
    };
    ($kind:ident, field_key: $key:expr, class_sym: $class:expr) => {
        $crate::error::VmError::Exception($crate::error::GuestException::with_field_not_found(
            $crate::error::ExceptionKind::$kind,
            $key,
            $class,
        ))
    };
    ($kind:ident, class_sym: $class:expr) => {
        $crate::error::VmError::Exception($crate::error::GuestException::with_class_not_found(
            $crate::error::ExceptionKind::$kind,
            $class,
        ))
    };
}

/// Raises a guest exception from the current function.
#[macro_export]
macro_rules! throw_exception {
    ($($arg:tt)*) => {
        return Err($crate::build_exception!($($arg)*))
    };
}
