//! The capability seam to the code-generating backend.
//!
//! The translator and both compiler modes only ever talk to these traits;
//! the reference engine implements them, and a native backend would too.
//! Code addresses are `CodeHandle` words into the code table — one level of
//! indirection that also gives isolate termination its portable "prolog
//! patch": overwriting a table entry redirects every caller at once.

use crate::error::VmError;
use crate::ir::{FnSig, FunctionIr};
use crate::keys::{CodeHandle, FunctionId, MethodId};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    Virtual,
    Special,
    Static,
}

/// What a code word currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeEntry {
    /// Materialised IR function.
    Function(FunctionId),
    /// Resolution stub: resolves the target, then tail-calls it.
    Stub { method: MethodId, kind: StubKind },
    /// Unimplemented interface-method hole.
    AbstractTrap(MethodId),
    /// Isolate-termination redirect: raise "interrupted" immediately.
    RaiseInterrupted(MethodId),
    /// Isolate-termination redirect for the orderly-stop entry point:
    /// plain return.
    ReturnOnly,
}

#[derive(Default)]
pub struct CodeTable {
    entries: RwLock<Vec<CodeEntry>>,
}

impl CodeTable {
    pub fn push(&self, entry: CodeEntry) -> CodeHandle {
        let mut entries = self.entries.write().unwrap();
        entries.push(entry);
        CodeHandle::from_usize(entries.len())
    }

    pub fn get(&self, handle: CodeHandle) -> CodeEntry {
        self.entries.read().unwrap()[handle.to_index()]
    }

    /// In-place redirect; every VT slot, IMT chain and cache node holding
    /// this handle now reaches the new entry.
    pub fn redirect(&self, handle: CodeHandle, entry: CodeEntry) {
        self.entries.write().unwrap()[handle.to_index()] = entry;
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// All handles currently pointing at the given method's stubs or code.
    pub fn handles_for_method(&self, method: MethodId) -> Vec<CodeHandle> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                CodeEntry::Stub { method: m, .. }
                | CodeEntry::AbstractTrap(m)
                | CodeEntry::RaiseInterrupted(m)
                    if *m == method =>
                {
                    Some(CodeHandle::from_usize(index + 1))
                }
                _ => None,
            })
            .collect()
    }
}

/// Resolution-time code allocation: initial stubs for method slots and traps
/// for abstract holes.
pub trait CodeAllocator: Send + Sync {
    fn method_stub(&self, method: MethodId, kind: StubKind) -> CodeHandle;
    fn abstract_trap(&self, method: MethodId) -> CodeHandle;
}

impl CodeAllocator for CodeTable {
    fn method_stub(&self, method: MethodId, kind: StubKind) -> CodeHandle {
        self.push(CodeEntry::Stub { method, kind })
    }

    fn abstract_trap(&self, method: MethodId) -> CodeHandle {
        self.push(CodeEntry::AbstractTrap(method))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Structural SSA check; always registered first.
    Verify,
}

/// What AOT and JIT need from the backend: build functions, run passes, get
/// callable addresses.
pub trait Backend: Send + Sync {
    fn declare_function(&self, name: &str, sig: FnSig) -> FunctionId;
    fn define_function(&self, body: FunctionIr) -> Result<FunctionId, VmError>;
    fn add_pass(&self, pass: PassKind);
    /// Callable address for a materialised function.
    fn function_code(&self, id: FunctionId) -> CodeHandle;
    fn code_table(&self) -> &CodeTable;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_table_hands_out_distinct_handles() {
        let table = CodeTable::default();
        let m = MethodId::from_usize(1);
        let a = table.method_stub(m, StubKind::Virtual);
        let b = table.method_stub(m, StubKind::Static);
        assert_ne!(a, b);
        assert_eq!(
            table.get(a),
            CodeEntry::Stub {
                method: m,
                kind: StubKind::Virtual
            }
        );
    }

    #[test]
    fn redirect_overwrites_in_place() {
        let table = CodeTable::default();
        let m = MethodId::from_usize(1);
        let handle = table.method_stub(m, StubKind::Virtual);
        table.redirect(handle, CodeEntry::RaiseInterrupted(m));
        assert_eq!(table.get(handle), CodeEntry::RaiseInterrupted(m));
    }

    #[test]
    fn handles_for_method_finds_all_stub_forms() {
        let table = CodeTable::default();
        let m = MethodId::from_usize(1);
        let other = MethodId::from_usize(2);
        let a = table.method_stub(m, StubKind::Virtual);
        let _ = table.method_stub(other, StubKind::Virtual);
        let b = table.abstract_trap(m);
        let found = table.handles_for_method(m);
        assert_eq!(found, vec![a, b]);
    }
}
