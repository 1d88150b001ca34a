//! The class graph: entities, lifecycle, and lazily resolved metadata.

use crate::bytecode::{ClassFlags, ConstantPool};
use crate::error::{GuestException, VmError};
use crate::heap::GcRef;
use crate::keys::{ClassId, FieldKey, LoaderId, MethodId, Symbol};
use crate::rt::class::InstanceClass;
use crate::rt::field::Field;
use crate::rt::interface::InterfaceClass;
use crate::rt::vtable::VirtualTable;
use crate::ty::{PrimitiveKind, TypeDescriptor};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

pub mod class;
pub mod field;
pub mod interface;
pub mod method;
pub mod registry;
pub mod vtable;

/// Linear class lifecycle. A thread may only observe `Ready` after the
/// static initialiser fully completed; `Resolving` and `Initialising` are
/// owned by exactly one thread and block all others.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum ClassState {
    /// Name-map entry exists, definition not consumed yet.
    Hashed = 0,
    Loaded = 1,
    Resolving = 2,
    Resolved = 3,
    Initialising = 4,
    Ready = 5,
    Erroneous = 6,
}

impl From<u8> for ClassState {
    fn from(v: u8) -> Self {
        match v {
            0 => ClassState::Hashed,
            1 => ClassState::Loaded,
            2 => ClassState::Resolving,
            3 => ClassState::Resolved,
            4 => ClassState::Initialising,
            5 => ClassState::Ready,
            6 => ClassState::Erroneous,
            _ => unreachable!(),
        }
    }
}

/// State every class entity shares, whatever its shape.
pub struct BaseClass {
    pub name: Symbol,
    pub flags: ClassFlags,
    pub loader: LoaderId,
    pub super_id: Option<ClassId>,
    pub source_file: Option<Symbol>,
    /// CLI value classes get unboxed receivers through the inline cache.
    pub value_class: bool,
    /// Nested class links, by name; resolved lazily like any other class.
    pub inner_classes: Vec<Symbol>,
    /// Attributes the reader left uninterpreted.
    pub attributes: Vec<crate::bytecode::AttributeBlob>,
    /// Generic parameter names for CLI-shaped guests.
    pub generic_params: Vec<Symbol>,
    state: AtomicU8,
    interfaces: OnceCell<Vec<ClassId>>,
    static_fields: OnceCell<Vec<Field>>,
    static_field_index: OnceCell<HashMap<FieldKey, usize>>,
    static_size: OnceCell<usize>,
    static_instance: OnceCell<GcRef>,
    clinit: OnceCell<MethodId>,
    init_error: OnceCell<GuestException>,
}

impl BaseClass {
    pub fn new(
        name: Symbol,
        flags: ClassFlags,
        loader: LoaderId,
        super_id: Option<ClassId>,
        source_file: Option<Symbol>,
        value_class: bool,
    ) -> Self {
        Self {
            name,
            flags,
            loader,
            super_id,
            source_file,
            value_class,
            inner_classes: Vec::new(),
            attributes: Vec::new(),
            generic_params: Vec::new(),
            state: AtomicU8::new(ClassState::Hashed as u8),
            interfaces: OnceCell::new(),
            static_fields: OnceCell::new(),
            static_field_index: OnceCell::new(),
            static_size: OnceCell::new(),
            static_instance: OnceCell::new(),
            clinit: OnceCell::new(),
            init_error: OnceCell::new(),
        }
    }

    pub fn state(&self) -> ClassState {
        ClassState::from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ClassState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Single-owner transition; fails when another thread got there first.
    pub fn try_transition(&self, from: ClassState, to: ClassState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_init_error(&self, error: GuestException) {
        let _ = self.init_error.set(error);
    }

    pub fn init_error(&self) -> Option<&GuestException> {
        self.init_error.get()
    }

    pub fn set_clinit(&self, method_id: MethodId) -> Result<(), VmError> {
        self.clinit
            .set(method_id)
            .map_err(|_| VmError::ResolutionState("class initialiser already recorded"))
    }

    pub fn clinit(&self) -> Option<MethodId> {
        self.clinit.get().copied()
    }

    pub fn set_interfaces(&self, interfaces: Vec<ClassId>) -> Result<(), VmError> {
        self.interfaces
            .set(interfaces)
            .map_err(|_| VmError::ResolutionState("interfaces already linked"))
    }

    pub fn interfaces(&self) -> Result<&[ClassId], VmError> {
        self.interfaces
            .get()
            .map(Vec::as_slice)
            .ok_or(VmError::ResolutionState("interfaces not linked yet"))
    }

    pub fn set_static_layout(
        &self,
        fields: Vec<Field>,
        index: HashMap<FieldKey, usize>,
        size: usize,
    ) -> Result<(), VmError> {
        self.static_fields
            .set(fields)
            .map_err(|_| VmError::ResolutionState("static fields already laid out"))?;
        self.static_field_index
            .set(index)
            .map_err(|_| VmError::ResolutionState("static field index already laid out"))?;
        self.static_size
            .set(size)
            .map_err(|_| VmError::ResolutionState("static size already laid out"))
    }

    pub fn static_fields(&self) -> Result<&[Field], VmError> {
        self.static_fields
            .get()
            .map(Vec::as_slice)
            .ok_or(VmError::ResolutionState("static fields not laid out yet"))
    }

    pub fn static_field(&self, key: &FieldKey) -> Option<&Field> {
        let index = self.static_field_index.get()?;
        Some(&self.static_fields.get()?[*index.get(key)?])
    }

    pub fn static_size(&self) -> Result<usize, VmError> {
        self.static_size
            .get()
            .copied()
            .ok_or(VmError::ResolutionState("static size not laid out yet"))
    }

    pub fn set_static_instance(&self, instance: GcRef) -> Result<(), VmError> {
        self.static_instance
            .set(instance)
            .map_err(|_| VmError::ResolutionState("static instance already allocated"))
    }

    pub fn static_instance(&self) -> Option<GcRef> {
        self.static_instance.get().copied()
    }
}

pub struct PrimitiveClass {
    pub name: Symbol,
    pub kind: PrimitiveKind,
}

/// Array classes share the root class's VT shape and add covariance data.
pub struct ArrayClass {
    pub base: BaseClass,
    pub descriptor: TypeDescriptor,
    /// Resolved element class for reference arrays.
    pub element_class: Option<ClassId>,
    pub element_primitive: Option<PrimitiveKind>,
    pub vt: OnceCell<VirtualTable>,
}

impl ArrayClass {
    pub fn element_shape(&self) -> crate::ty::ValueShape {
        match self.element_primitive {
            Some(kind) => kind.shape(),
            None => crate::ty::ValueShape::Ref,
        }
    }

    pub fn element_size(&self) -> usize {
        match self.element_primitive {
            Some(kind) => kind.byte_size(),
            None => crate::ty::WORD_SIZE,
        }
    }
}

pub enum ClassEntity {
    Instance(Box<InstanceClass>),
    Interface(Box<InterfaceClass>),
    Primitive(PrimitiveClass),
    Array(Box<ArrayClass>),
}

impl ClassEntity {
    pub fn name(&self) -> Symbol {
        match self {
            ClassEntity::Instance(c) => c.base.name,
            ClassEntity::Interface(c) => c.base.name,
            ClassEntity::Primitive(c) => c.name,
            ClassEntity::Array(c) => c.base.name,
        }
    }

    pub fn base(&self) -> Option<&BaseClass> {
        match self {
            ClassEntity::Instance(c) => Some(&c.base),
            ClassEntity::Interface(c) => Some(&c.base),
            ClassEntity::Array(c) => Some(&c.base),
            ClassEntity::Primitive(_) => None,
        }
    }

    pub fn super_id(&self) -> Option<ClassId> {
        self.base().and_then(|b| b.super_id)
    }

    pub fn loader(&self) -> Option<LoaderId> {
        self.base().map(|b| b.loader)
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, ClassEntity::Interface(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ClassEntity::Array(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, ClassEntity::Primitive(_))
    }

    pub fn as_instance(&self) -> Result<&InstanceClass, VmError> {
        match self {
            ClassEntity::Instance(c) => Ok(c),
            _ => Err(VmError::ResolutionState("not an instance class")),
        }
    }

    pub fn as_interface(&self) -> Result<&InterfaceClass, VmError> {
        match self {
            ClassEntity::Interface(c) => Ok(c),
            _ => Err(VmError::ResolutionState("not an interface class")),
        }
    }

    pub fn as_array(&self) -> Result<&ArrayClass, VmError> {
        match self {
            ClassEntity::Array(c) => Ok(c),
            _ => Err(VmError::ResolutionState("not an array class")),
        }
    }

    pub fn vt(&self) -> Option<&VirtualTable> {
        match self {
            ClassEntity::Instance(c) => c.vt.get(),
            ClassEntity::Array(c) => c.vt.get(),
            ClassEntity::Interface(_) | ClassEntity::Primitive(_) => None,
        }
    }

    pub fn pool(&self) -> Option<&ConstantPool> {
        match self {
            ClassEntity::Instance(c) => Some(&c.pool),
            ClassEntity::Interface(c) => Some(&c.pool),
            _ => None,
        }
    }
}
