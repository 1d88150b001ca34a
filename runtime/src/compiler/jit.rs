//! Just-in-time mode: method bodies stay declarations until the first call
//! reaches their stub; the materialiser translates, defines, and patches the
//! VT slot with the new code word.

use crate::backend::{Backend, CodeEntry};
use crate::error::VmError;
use crate::keys::{CodeHandle, MethodId};
use crate::translate::{TranslateOpts, translate_method};
use crate::vm::VirtualMachine;
use crate::{debug_log, throw_exception};

#[derive(Default)]
pub struct JitCompiler;

fn compiled_code(vm: &VirtualMachine, method: MethodId) -> Option<CodeHandle> {
    let code = vm.registry_read().get_method(method).code()?;
    match vm.engine.code_table().get(code) {
        CodeEntry::Function(_) => Some(code),
        // Redirects installed by isolate termination stay in force.
        CodeEntry::RaiseInterrupted(_) | CodeEntry::ReturnOnly => Some(code),
        _ => None,
    }
}

impl JitCompiler {
    /// The materialiser hook: called on the first invocation of a method
    /// (from its stub or a direct call), returns its callable code word.
    pub fn materialise(&self, vm: &VirtualMachine, method: MethodId) -> Result<CodeHandle, VmError> {
        if let Some(code) = compiled_code(vm, method) {
            return Ok(code);
        }

        let _ir_lock = vm.engine.lock_compilation();
        // Someone may have materialised the target while we waited.
        if let Some(code) = compiled_code(vm, method) {
            return Ok(code);
        }

        let (class_id, is_native, is_abstract, key, class_sym) = {
            let registry = vm.registry_read();
            let m = registry.get_method(method);
            (
                m.class_id(),
                m.is_native(),
                m.is_abstract(),
                m.key(),
                registry.get_class(m.class_id()).name(),
            )
        };
        vm.resolve_existing(class_id)?;

        if is_abstract {
            throw_exception!(AbstractMethodError, method_key: key, class_sym: class_sym);
        }
        if is_native {
            // Native bodies live outside this crate; an unbound native
            // surfaces the standard linkage error.
            throw_exception!(UnsatisfiedLinkError, method_key: key, class_sym: class_sym);
        }

        let body = translate_method(vm, method, TranslateOpts::jit(&vm.config))?;
        let function = vm.engine.define_function(body)?;
        let handle = vm.engine.function_code(function);
        debug_log!("materialised method {:?} as code {:?}", method, handle);

        let registry = vm.registry_read();
        let m = registry.get_method(method);
        let old_code = m.code();
        m.set_code(handle);
        if m.is_customizable() {
            m.record_specialisation(handle);
        }

        // Patch the VT slot (a single word store) and any IMT occurrences.
        if let Some(offset) = m.vt_offset()
            && let Some(vt) = registry.get_class(class_id).vt()
        {
            vt.patch_code(offset, handle);
            if let (Some(imt), Some(old)) = (vt.imt.as_ref(), old_code) {
                imt.patch_chains(old, handle);
            }
        }
        Ok(handle)
    }
}
