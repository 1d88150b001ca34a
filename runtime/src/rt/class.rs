//! Instance classes and their resolution: field layout, VT construction,
//! IMT construction, and the depth/display subtype data.

use crate::bytecode::ConstantPool;
use crate::error::VmError;
use crate::keys::{ClassId, FieldKey, MethodId, MethodKey};
use crate::rt::BaseClass;
use crate::rt::field::Field;
use crate::rt::vtable::VirtualTable;
use once_cell::sync::OnceCell;
use std::collections::HashMap;

pub struct InstanceClass {
    pub base: BaseClass,
    pub pool: ConstantPool,

    declared: OnceCell<HashMap<MethodKey, MethodId>>,
    virtual_methods: OnceCell<Vec<MethodId>>,
    static_methods: OnceCell<Vec<MethodId>>,

    instance_fields: OnceCell<Vec<Field>>,
    instance_field_index: OnceCell<HashMap<FieldKey, usize>>,
    instance_size: OnceCell<usize>,
    instance_align: OnceCell<usize>,

    vtable_index: OnceCell<HashMap<MethodKey, u16>>,
    pub vt: OnceCell<VirtualTable>,
}

impl InstanceClass {
    pub fn new(base: BaseClass, pool: ConstantPool) -> Self {
        Self {
            base,
            pool,
            declared: OnceCell::new(),
            virtual_methods: OnceCell::new(),
            static_methods: OnceCell::new(),
            instance_fields: OnceCell::new(),
            instance_field_index: OnceCell::new(),
            instance_size: OnceCell::new(),
            instance_align: OnceCell::new(),
            vtable_index: OnceCell::new(),
            vt: OnceCell::new(),
        }
    }

    pub fn set_declared_methods(
        &self,
        declared: HashMap<MethodKey, MethodId>,
        virtuals: Vec<MethodId>,
        statics: Vec<MethodId>,
    ) -> Result<(), VmError> {
        self.declared
            .set(declared)
            .map_err(|_| VmError::ResolutionState("declared methods already recorded"))?;
        self.virtual_methods
            .set(virtuals)
            .map_err(|_| VmError::ResolutionState("virtual methods already recorded"))?;
        self.static_methods
            .set(statics)
            .map_err(|_| VmError::ResolutionState("static methods already recorded"))
    }

    pub fn declared(&self) -> Result<&HashMap<MethodKey, MethodId>, VmError> {
        self.declared
            .get()
            .ok_or(VmError::ResolutionState("declared methods not recorded"))
    }

    pub fn declared_method(&self, key: &MethodKey) -> Option<MethodId> {
        self.declared.get()?.get(key).copied()
    }

    pub fn virtual_methods(&self) -> Result<&[MethodId], VmError> {
        self.virtual_methods
            .get()
            .map(Vec::as_slice)
            .ok_or(VmError::ResolutionState("virtual methods not recorded"))
    }

    pub fn static_methods(&self) -> Result<&[MethodId], VmError> {
        self.static_methods
            .get()
            .map(Vec::as_slice)
            .ok_or(VmError::ResolutionState("static methods not recorded"))
    }

    pub fn set_instance_layout(
        &self,
        fields: Vec<Field>,
        index: HashMap<FieldKey, usize>,
        size: usize,
        align: usize,
    ) -> Result<(), VmError> {
        self.instance_fields
            .set(fields)
            .map_err(|_| VmError::ResolutionState("instance fields already laid out"))?;
        self.instance_field_index
            .set(index)
            .map_err(|_| VmError::ResolutionState("instance field index already laid out"))?;
        self.instance_size
            .set(size)
            .map_err(|_| VmError::ResolutionState("instance size already laid out"))?;
        self.instance_align
            .set(align)
            .map_err(|_| VmError::ResolutionState("instance alignment already laid out"))
    }

    pub fn instance_fields(&self) -> Result<&[Field], VmError> {
        self.instance_fields
            .get()
            .map(Vec::as_slice)
            .ok_or(VmError::ResolutionState("instance fields not laid out yet"))
    }

    pub fn instance_field(&self, key: &FieldKey) -> Option<&Field> {
        let index = self.instance_field_index.get()?;
        Some(&self.instance_fields.get()?[*index.get(key)?])
    }

    pub fn instance_size(&self) -> Result<usize, VmError> {
        self.instance_size
            .get()
            .copied()
            .ok_or(VmError::ResolutionState("instance size not laid out yet"))
    }

    pub fn instance_align(&self) -> Result<usize, VmError> {
        self.instance_align
            .get()
            .copied()
            .ok_or(VmError::ResolutionState("instance alignment not laid out yet"))
    }

    pub fn set_vtable_index(&self, index: HashMap<MethodKey, u16>) -> Result<(), VmError> {
        self.vtable_index
            .set(index)
            .map_err(|_| VmError::ResolutionState("vtable index already built"))
    }

    pub fn vtable_index(&self) -> Result<&HashMap<MethodKey, u16>, VmError> {
        self.vtable_index
            .get()
            .ok_or(VmError::ResolutionState("vtable index not built yet"))
    }

    pub fn set_vt(&self, vt: VirtualTable) -> Result<(), VmError> {
        self.vt
            .set(vt)
            .map_err(|_| VmError::ResolutionState("virtual table already built"))
    }

    pub fn vt(&self) -> Result<&VirtualTable, VmError> {
        self.vt
            .get()
            .ok_or(VmError::ResolutionState("virtual table not built yet"))
    }

    /// VT slot offset for a name+descriptor pair, if the class dispatches it.
    pub fn vt_slot(&self, key: &MethodKey) -> Option<u16> {
        self.vtable_index.get()?.get(key).copied()
    }

    pub fn vt_method(&self, key: &MethodKey) -> Option<MethodId> {
        let slot = self.vt_slot(key)?;
        Some(self.vt.get()?.method_at(slot))
    }

    pub fn class_id(&self) -> Option<ClassId> {
        self.vt.get().map(|vt| vt.class)
    }
}
