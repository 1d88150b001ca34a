use crate::bytecode::ConstantPool;
use crate::error::VmError;
use crate::keys::{MethodId, MethodKey};
use crate::rt::BaseClass;
use once_cell::sync::OnceCell;
use std::collections::HashMap;

/// Interfaces carry declared methods (abstract or default) and optionally
/// constants; they never get a VT of their own — implementations land in the
/// implementing class's VT and IMT.
pub struct InterfaceClass {
    pub base: BaseClass,
    pub pool: ConstantPool,
    methods: OnceCell<Vec<MethodId>>,
    method_index: OnceCell<HashMap<MethodKey, MethodId>>,
}

impl InterfaceClass {
    pub fn new(base: BaseClass, pool: ConstantPool) -> Self {
        Self {
            base,
            pool,
            methods: OnceCell::new(),
            method_index: OnceCell::new(),
        }
    }

    pub fn set_methods(
        &self,
        methods: Vec<MethodId>,
        index: HashMap<MethodKey, MethodId>,
    ) -> Result<(), VmError> {
        self.methods
            .set(methods)
            .map_err(|_| VmError::ResolutionState("interface methods already recorded"))?;
        self.method_index
            .set(index)
            .map_err(|_| VmError::ResolutionState("interface method index already recorded"))
    }

    pub fn methods(&self) -> Result<&[MethodId], VmError> {
        self.methods
            .get()
            .map(Vec::as_slice)
            .ok_or(VmError::ResolutionState("interface methods not recorded"))
    }

    pub fn method_index(&self) -> Result<&HashMap<MethodKey, MethodId>, VmError> {
        self.method_index
            .get()
            .ok_or(VmError::ResolutionState("interface method index not recorded"))
    }

    pub fn method(&self, key: &MethodKey) -> Option<MethodId> {
        self.method_index.get()?.get(key).copied()
    }
}
