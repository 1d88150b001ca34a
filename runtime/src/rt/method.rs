use crate::bytecode::{MethodCode, MethodFlags};
use crate::error::VmError;
use crate::keys::{ClassId, CodeHandle, SignatureId, Symbol};
use crate::throw_exception;
use once_cell::sync::OnceCell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub enum MethodBody {
    Bytecode(MethodCode),
    Native,
    Abstract,
}

pub struct Method {
    class_id: ClassId,
    pub name: Symbol,
    pub desc: Symbol,
    signature: SignatureId,
    flags: MethodFlags,
    body: MethodBody,
    /// Generic parameter names for CLI-shaped guests; empty otherwise.
    generic_params: Box<[Symbol]>,
    /// Offset into the owning class's VT; virtuals only.
    vt_offset: OnceCell<u16>,
    /// Current code word; 0 until a stub or compiled function is installed.
    code: AtomicU32,
    /// While set, the JIT may emit receiver-specialised copies. Cleared by
    /// isolate termination before patching.
    customizable: AtomicBool,
    /// Receiver-specialised code the JIT produced for this method; all of
    /// them are redirected together when the isolate dies.
    specialisations: Mutex<Vec<CodeHandle>>,
}

impl Method {
    pub fn new(
        class_id: ClassId,
        name: Symbol,
        desc: Symbol,
        signature: SignatureId,
        flags: MethodFlags,
        code: Option<MethodCode>,
        generic_params: Vec<Symbol>,
    ) -> Result<Self, VmError> {
        let body = if flags.is_abstract() {
            MethodBody::Abstract
        } else if flags.is_native() {
            MethodBody::Native
        } else {
            match code {
                Some(code) => MethodBody::Bytecode(code),
                None => {
                    return Err(VmError::ClassFormat(
                        "non-abstract, non-native method without code".to_string(),
                    ));
                }
            }
        };
        Ok(Method {
            class_id,
            name,
            desc,
            signature,
            flags,
            body,
            generic_params: generic_params.into_boxed_slice(),
            vt_offset: OnceCell::new(),
            code: AtomicU32::new(0),
            customizable: AtomicBool::new(true),
            specialisations: Mutex::new(Vec::new()),
        })
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    pub fn signature(&self) -> SignatureId {
        self.signature
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_static(&self) -> bool {
        self.flags.is_static()
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.body, MethodBody::Abstract)
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, MethodBody::Native)
    }

    pub fn body(&self) -> &MethodBody {
        &self.body
    }

    pub fn bytecode(&self) -> Result<&MethodCode, VmError> {
        match &self.body {
            MethodBody::Bytecode(code) => Ok(code),
            _ => throw_exception!(InternalError, "method has no bytecode body"),
        }
    }

    pub fn set_vt_offset(&self, offset: u16) -> Result<(), VmError> {
        self.vt_offset
            .set(offset)
            .map_err(|_| VmError::ResolutionState("method VT offset already assigned"))
    }

    pub fn vt_offset(&self) -> Option<u16> {
        self.vt_offset.get().copied()
    }

    pub fn code(&self) -> Option<CodeHandle> {
        CodeHandle::from_raw(self.code.load(Ordering::Acquire))
    }

    pub fn set_code(&self, code: CodeHandle) {
        self.code.store(code.raw(), Ordering::Release);
    }

    pub fn generic_params(&self) -> &[Symbol] {
        &self.generic_params
    }

    pub fn is_customizable(&self) -> bool {
        self.customizable.load(Ordering::Acquire)
    }

    pub fn retire_customization(&self) {
        self.customizable.store(false, Ordering::Release);
    }

    pub fn record_specialisation(&self, code: CodeHandle) {
        self.specialisations.lock().unwrap().push(code);
    }

    pub fn specialisations(&self) -> Vec<CodeHandle> {
        self.specialisations.lock().unwrap().clone()
    }

    pub fn line_for_pc(&self, pc: usize) -> Option<u16> {
        match &self.body {
            MethodBody::Bytecode(code) => code.line_for_pc(pc),
            _ => None,
        }
    }

    pub fn key(&self) -> crate::keys::MethodKey {
        crate::keys::MethodKey {
            name: self.name,
            desc: self.desc,
        }
    }
}
